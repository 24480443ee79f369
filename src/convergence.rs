//! Convergence bookkeeping shared by the iterative engines.
//!
//! Errors are only evaluated at checkpoints: every `inner_iterations` completed
//! iterations, plus the final iteration of the budget. Each checkpoint owns one slot of
//! a fixed-size history; unwritten slots hold the sentinel `-1`.
//!
//! Once converged (or diverged) the tracker is *frozen*: the engines mask every further
//! update against [`ConvergenceTracker::is_frozen`], so the state stays bit-identical.

/// Marker for history slots that were never written.
pub const UNSET: f64 = -1.0;

/// Checkpoint cadence, error history and the monotone freeze predicate.
#[derive(Debug, Clone, PartialEq)]
pub struct ConvergenceTracker {
    threshold: f64,
    inner_iterations: usize,
    min_iterations: usize,
    total_iterations: usize,
    errors: Vec<f64>,
    converged: bool,
    diverged: bool,
}

impl ConvergenceTracker {
    /// Tracker for a budget of `total_iterations` checked every `inner_iterations`.
    ///
    /// Callers validate that `inner_iterations >= 1`.
    pub fn new(
        threshold: f64,
        inner_iterations: usize,
        min_iterations: usize,
        total_iterations: usize,
    ) -> Self {
        let inner_iterations = inner_iterations.max(1);
        Self {
            threshold,
            inner_iterations,
            min_iterations,
            total_iterations,
            errors: vec![UNSET; num_checkpoints(total_iterations, inner_iterations)],
            converged: false,
            diverged: false,
        }
    }

    /// Whether the error is evaluated after `completed` iterations.
    pub fn is_checkpoint(&self, completed: usize) -> bool {
        completed > 0
            && completed <= self.total_iterations
            && (completed % self.inner_iterations == 0 || completed == self.total_iterations)
    }

    /// Record the error observed after `completed` iterations and update the flags.
    ///
    /// A no-op once frozen. Returns whether the tracker is now converged.
    pub fn record(&mut self, completed: usize, error: f64) -> bool {
        if self.is_frozen() || completed == 0 {
            return self.converged;
        }
        let slot = (completed - 1) / self.inner_iterations;
        if let Some(e) = self.errors.get_mut(slot) {
            *e = error;
        }
        if !error.is_finite() {
            self.diverged = true;
            log::warn!("non-finite error after {} iterations", completed);
        } else if error < self.threshold && completed >= self.min_iterations {
            self.converged = true;
        }
        log::trace!("checkpoint {:>6} error {:.3e}", completed, error);
        self.converged
    }

    /// Converged or diverged: no further update may change the state.
    #[inline]
    pub fn is_frozen(&self) -> bool {
        self.converged || self.diverged
    }

    /// Error fell below the threshold.
    pub fn converged(&self) -> bool {
        self.converged
    }

    /// A non-finite error was observed.
    pub fn diverged(&self) -> bool {
        self.diverged
    }

    /// One slot per checkpoint, [`UNSET`] where no checkpoint ran.
    pub fn errors(&self) -> &[f64] {
        &self.errors
    }

    /// Most recently written error.
    pub fn last_error(&self) -> Option<f64> {
        self.written().last().copied()
    }

    /// The error written before [`Self::last_error`].
    pub fn previous_error(&self) -> Option<f64> {
        let w = self.written();
        w.len().checked_sub(2).map(|k| w[k])
    }

    /// Checkpoint cadence.
    pub fn inner_iterations(&self) -> usize {
        self.inner_iterations
    }

    /// Iteration budget.
    pub fn total_iterations(&self) -> usize {
        self.total_iterations
    }

    fn written(&self) -> &[f64] {
        let end = self
            .errors
            .iter()
            .position(|&e| e == UNSET)
            .unwrap_or(self.errors.len());
        &self.errors[..end]
    }
}

/// `⌈total / inner⌉`: the number of checkpoints in a budget.
pub fn num_checkpoints(total: usize, inner: usize) -> usize {
    total.div_ceil(inner.max(1))
}

/// \(\lVert x - y\rVert_1\). The marginal residual used by every engine.
pub fn l1_deviation(actual: &[f64], target: &[f64]) -> f64 {
    actual.iter().zip(target).map(|(x, y)| (x - y).abs()).sum()
}

/// `|cur − prev| / |prev|`, guarded against a zero denominator.
pub fn relative_change(prev: f64, cur: f64) -> f64 {
    (cur - prev).abs() / prev.abs().max(f64::MIN_POSITIVE)
}

/// Masked assignment: overwrite `dst` with `src` unless `frozen`.
///
/// Keeps the update shape static: the candidate is always computed, only the commit is
/// masked, so a frozen state is left bit-identical.
#[inline]
pub(crate) fn commit(frozen: bool, dst: &mut [f64], src: &[f64]) {
    for (d, &s) in dst.iter_mut().zip(src) {
        *d = if frozen { *d } else { s };
    }
}
