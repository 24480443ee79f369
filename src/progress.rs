//! Read-only progress side channel.
//!
//! Engines are generic over a [`ProgressObserver`]. The observer receives
//! `(iteration, inner_iterations, total_iterations, snapshot)` at every checkpoint and
//! cannot touch the solver state: it only gets a shared borrow through [`Snapshot`], and
//! its return value is `()`.
//!
//! Passing [`NoProgress`] monomorphizes the call away entirely, so "no callback" is a
//! type-level choice rather than a null check in the loop.
//!
//! Any `FnMut(usize, usize, usize, Snapshot<'_>)` closure is an observer.

use crate::gromov::GwState;
use crate::low_rank::LRSinkhornState;
use crate::sinkhorn::SinkhornState;

/// Borrowed view of one engine's state at a checkpoint.
#[derive(Debug, Clone, Copy)]
pub enum Snapshot<'a> {
    /// Full-rank Sinkhorn.
    Sinkhorn(&'a SinkhornState),
    /// Low-rank Sinkhorn.
    LowRank(&'a LRSinkhornState),
    /// Gromov-Wasserstein outer loop.
    GromovWasserstein(&'a GwState),
}

impl Snapshot<'_> {
    /// Completed iterations of the underlying engine.
    pub fn iteration(&self) -> usize {
        match self {
            Snapshot::Sinkhorn(s) => s.iteration(),
            Snapshot::LowRank(s) => s.iteration(),
            Snapshot::GromovWasserstein(s) => s.iteration(),
        }
    }

    /// Latest convergence error, if one was computed.
    pub fn error(&self) -> Option<f64> {
        match self {
            Snapshot::Sinkhorn(s) => s.tracker().last_error(),
            Snapshot::LowRank(s) => s.tracker().last_error(),
            Snapshot::GromovWasserstein(s) => s.last_error(),
        }
    }

    /// Whether the underlying engine has converged.
    pub fn converged(&self) -> bool {
        match self {
            Snapshot::Sinkhorn(s) => s.converged(),
            Snapshot::LowRank(s) => s.converged(),
            Snapshot::GromovWasserstein(s) => s.converged(),
        }
    }

    /// Short engine name for display.
    pub fn name(&self) -> &'static str {
        match self {
            Snapshot::Sinkhorn(_) => "sinkhorn",
            Snapshot::LowRank(_) => "lr-sinkhorn",
            Snapshot::GromovWasserstein(_) => "gromov",
        }
    }
}

/// Receives checkpoint snapshots. Must not influence the computation.
pub trait ProgressObserver {
    /// Called synchronously at each checkpoint; `iteration <= total_iterations`.
    fn observe(
        &mut self,
        iteration: usize,
        inner_iterations: usize,
        total_iterations: usize,
        snapshot: Snapshot<'_>,
    );
}

/// The absent observer.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoProgress;

impl ProgressObserver for NoProgress {
    #[inline(always)]
    fn observe(&mut self, _: usize, _: usize, _: usize, _: Snapshot<'_>) {}
}

impl<F> ProgressObserver for F
where
    F: FnMut(usize, usize, usize, Snapshot<'_>),
{
    #[inline]
    fn observe(
        &mut self,
        iteration: usize,
        inner_iterations: usize,
        total_iterations: usize,
        snapshot: Snapshot<'_>,
    ) {
        self(iteration, inner_iterations, total_iterations, snapshot)
    }
}

/// Observer that reports through `log::info!`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogProgress;

impl ProgressObserver for LogProgress {
    fn observe(
        &mut self,
        iteration: usize,
        _inner_iterations: usize,
        total_iterations: usize,
        snapshot: Snapshot<'_>,
    ) {
        let error = snapshot.error().unwrap_or(f64::NAN);
        log::info!(
            "{:<12}{:>8} / {:<8}{:6.2}%   error {:10.3e}",
            snapshot.name(),
            iteration,
            total_iterations,
            iteration as f64 / total_iterations.max(1) as f64 * 100.0,
            error,
        );
    }
}
