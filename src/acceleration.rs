//! Optional Sinkhorn accelerations.
//!
//! - [`Momentum`]: over-relaxation \(x \leftarrow x + \omega (\tilde x - x)\). Disabled for
//!   a warm-up window; the adaptive factor follows Lehmann et al. (2021),
//!   \(\omega = 2 / (1 + \sqrt{1 - \rho^{1/k}})\) with \(\rho\) the observed error
//!   contraction over `k` iterations, clipped to `[1, Momentum::MAX]`.
//! - [`Anderson`]: type-II Anderson mixing over a window of past fixed-point pairs.
//!   The mixing weights solve a ridge-regularized normal system; when that system is
//!   ill-conditioned, or the mixed residual is no better than the plain one, the step
//!   falls back to the unaccelerated iterate.

use std::collections::VecDeque;

use crate::convergence::ConvergenceTracker;
use crate::{Error, Result};

/// Over-relaxation schedule.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Momentum {
    /// Iterations run with a plain update before momentum starts.
    pub warmup: usize,
    /// Fixed factor in `(0, 2)`; `None` selects the adaptive factor.
    pub value: Option<f64>,
    /// The adaptive factor is only used once the last error is below this.
    pub error_threshold: f64,
}

impl Default for Momentum {
    fn default() -> Self {
        Self {
            warmup: 20,
            value: None,
            error_threshold: f64::INFINITY,
        }
    }
}

impl Momentum {
    /// Upper clip of the adaptive factor.
    pub const MAX: f64 = 1.9;

    pub(crate) fn validate(&self) -> Result<()> {
        if let Some(w) = self.value {
            if !(w > 0.0 && w < 2.0) {
                return Err(Error::InvalidParameter {
                    name: "momentum.value",
                    value: w,
                });
            }
        }
        if self.error_threshold.is_nan() {
            return Err(Error::InvalidParameter {
                name: "momentum.error_threshold",
                value: self.error_threshold,
            });
        }
        Ok(())
    }

    /// Factor for the iteration following `completed` ones.
    pub(crate) fn factor(&self, completed: usize, tracker: &ConvergenceTracker) -> f64 {
        if completed < self.warmup {
            return 1.0;
        }
        if let Some(w) = self.value {
            return w;
        }
        let (Some(last), Some(prev)) = (tracker.last_error(), tracker.previous_error()) else {
            return 1.0;
        };
        if !(last < self.error_threshold) || !(prev > 0.0) {
            return 1.0;
        }
        let ratio = (last / prev).min(0.99);
        if !(ratio > 0.0) {
            return 1.0;
        }
        let contraction = ratio.powf(1.0 / tracker.inner_iterations() as f64);
        let w = 2.0 / (1.0 + (1.0 - contraction).sqrt());
        w.clamp(1.0, Self::MAX)
    }
}

/// `cand ← old + w (cand − old)` on finite entries.
pub(crate) fn over_relax(w: f64, old: &[f64], cand: &mut [f64]) {
    if w == 1.0 {
        return;
    }
    for (c, &o) in cand.iter_mut().zip(old) {
        if c.is_finite() && o.is_finite() {
            *c = o + w * (*c - o);
        }
    }
}

/// Anderson mixing parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Anderson {
    /// Number of past iterates mixed (at least 2).
    pub memory: usize,
    /// Clear the window every this many iterations; `0` never clears.
    pub refresh_every: usize,
    /// Ridge added to the normal equations, relative to their largest diagonal entry.
    pub ridge: f64,
}

impl Default for Anderson {
    fn default() -> Self {
        Self {
            memory: 5,
            refresh_every: 0,
            ridge: 1e-8,
        }
    }
}

impl Anderson {
    /// Pivots below this fraction of the largest diagonal entry count as singular.
    const PIVOT_TOL: f64 = 1e-12;
    /// Mixing weights larger than this signal a degenerate window.
    const MAX_WEIGHT: f64 = 1e4;

    pub(crate) fn validate(&self) -> Result<()> {
        if self.memory < 2 {
            return Err(Error::InvalidParameter {
                name: "anderson.memory",
                value: self.memory as f64,
            });
        }
        if !(self.ridge >= 0.0 && self.ridge.is_finite()) {
            return Err(Error::InvalidParameter {
                name: "anderson.ridge",
                value: self.ridge,
            });
        }
        Ok(())
    }
}

/// Sliding window of `(x_k, T(x_k))` pairs.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AndersonWindow {
    inputs: VecDeque<Vec<f64>>,
    outputs: VecDeque<Vec<f64>>,
    pushes: usize,
}

impl AndersonWindow {
    /// Number of stored pairs.
    pub fn len(&self) -> usize {
        self.inputs.len()
    }

    /// No stored pairs.
    pub fn is_empty(&self) -> bool {
        self.inputs.is_empty()
    }

    pub(crate) fn push(&mut self, cfg: &Anderson, x: &[f64], tx: &[f64]) {
        self.pushes += 1;
        if cfg.refresh_every > 0 && self.pushes % cfg.refresh_every == 0 {
            self.inputs.clear();
            self.outputs.clear();
        }
        if self.inputs.len() == cfg.memory {
            self.inputs.pop_front();
            self.outputs.pop_front();
        }
        self.inputs.push_back(x.to_vec());
        self.outputs.push_back(tx.to_vec());
    }

    /// Mixed iterate \(\sum_k c_k T(x_k)\), or `None` to fall back to the plain one.
    pub(crate) fn extrapolate(&self, cfg: &Anderson) -> Option<Vec<f64>> {
        let k = self.len();
        if k < 2 {
            return None;
        }
        let residuals: Vec<Vec<f64>> = self
            .inputs
            .iter()
            .zip(&self.outputs)
            .map(|(x, tx)| {
                x.iter()
                    .zip(tx)
                    .map(|(&a, &b)| if a.is_finite() && b.is_finite() { b - a } else { 0.0 })
                    .collect()
            })
            .collect();

        let mut gram = vec![0.0; k * k];
        for a in 0..k {
            for b in a..k {
                let d = dot(&residuals[a], &residuals[b]);
                gram[a * k + b] = d;
                gram[b * k + a] = d;
            }
        }
        let scale = (0..k).map(|a| gram[a * k + a]).fold(0.0, f64::max);
        if !(scale > 0.0 && scale.is_finite()) {
            return None;
        }
        for a in 0..k {
            gram[a * k + a] += cfg.ridge * scale;
        }

        let z = solve_dense(gram, vec![1.0; k], k, Anderson::PIVOT_TOL * scale)?;
        let total: f64 = z.iter().sum();
        if total == 0.0 || !total.is_finite() {
            return None;
        }
        let weights: Vec<f64> = z.iter().map(|v| v / total).collect();
        if weights
            .iter()
            .any(|w| !w.is_finite() || w.abs() > Anderson::MAX_WEIGHT)
        {
            return None;
        }

        let len = residuals[0].len();
        let mixed_residual: f64 = (0..len)
            .map(|i| {
                let r: f64 = weights.iter().zip(&residuals).map(|(w, r)| w * r[i]).sum();
                r * r
            })
            .sum();
        let latest = dot(&residuals[k - 1], &residuals[k - 1]);
        if !(mixed_residual <= latest) {
            return None;
        }

        let newest = &self.outputs[k - 1];
        let mixed = (0..len)
            .map(|i| {
                if !newest[i].is_finite() {
                    return newest[i];
                }
                weights.iter().zip(&self.outputs).map(|(w, o)| w * o[i]).sum()
            })
            .collect();
        Some(mixed)
    }
}

fn dot(x: &[f64], y: &[f64]) -> f64 {
    x.iter().zip(y).map(|(a, b)| a * b).sum()
}

/// Gaussian elimination with partial pivoting on a row-major `k × k` system.
///
/// Returns `None` when a pivot falls below `tol`.
fn solve_dense(mut mat: Vec<f64>, mut rhs: Vec<f64>, k: usize, tol: f64) -> Option<Vec<f64>> {
    for col in 0..k {
        let pivot = (col..k).max_by(|&r, &s| {
            mat[r * k + col]
                .abs()
                .total_cmp(&mat[s * k + col].abs())
        })?;
        if !(mat[pivot * k + col].abs() > tol) {
            return None;
        }
        if pivot != col {
            for c in 0..k {
                mat.swap(pivot * k + c, col * k + c);
            }
            rhs.swap(pivot, col);
        }
        let p = mat[col * k + col];
        for r in (col + 1)..k {
            let factor = mat[r * k + col] / p;
            if factor == 0.0 {
                continue;
            }
            for c in col..k {
                mat[r * k + c] -= factor * mat[col * k + c];
            }
            rhs[r] -= factor * rhs[col];
        }
    }
    let mut x = vec![0.0; k];
    for r in (0..k).rev() {
        let s: f64 = ((r + 1)..k).map(|c| mat[r * k + c] * x[c]).sum();
        x[r] = (rhs[r] - s) / mat[r * k + r];
    }
    Some(x)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dense_solver_matches_known_solution() {
        // [[2, 1], [1, 3]] x = [3, 5]  =>  x = [0.8, 1.4]
        let x = solve_dense(vec![2.0, 1.0, 1.0, 3.0], vec![3.0, 5.0], 2, 1e-12).unwrap();
        assert!((x[0] - 0.8).abs() < 1e-12);
        assert!((x[1] - 1.4).abs() < 1e-12);
    }

    #[test]
    fn dense_solver_rejects_singular_system() {
        assert!(solve_dense(vec![1.0, 2.0, 2.0, 4.0], vec![1.0, 1.0], 2, 1e-12).is_none());
    }

    #[test]
    fn anderson_solves_linear_fixed_point_exactly() {
        // T(x) = 0.5 x + 1 has fixed point 2; two pairs determine it.
        let cfg = Anderson::default();
        let t = |x: f64| 0.5 * x + 1.0;
        let mut w = AndersonWindow::default();
        w.push(&cfg, &[0.0], &[t(0.0)]);
        w.push(&cfg, &[1.0], &[t(1.0)]);
        let x = w.extrapolate(&cfg).unwrap();
        assert!((x[0] - 2.0).abs() < 1e-6, "x={}", x[0]);
    }

    #[test]
    fn anderson_falls_back_on_duplicate_history() {
        let cfg = Anderson {
            ridge: 0.0,
            ..Default::default()
        };
        let mut w = AndersonWindow::default();
        w.push(&cfg, &[0.0, 0.0], &[1.0, 1.0]);
        w.push(&cfg, &[0.0, 0.0], &[1.0, 1.0]);
        assert!(w.extrapolate(&cfg).is_none());
    }

    #[test]
    fn anderson_window_is_bounded_and_refreshes() {
        let cfg = Anderson {
            memory: 3,
            refresh_every: 5,
            ridge: 1e-8,
        };
        let mut w = AndersonWindow::default();
        for k in 0..4 {
            w.push(&cfg, &[k as f64], &[k as f64 + 1.0]);
        }
        assert_eq!(w.len(), 3);
        w.push(&cfg, &[9.0], &[10.0]);
        assert_eq!(w.len(), 1);
    }

    #[test]
    fn momentum_is_off_during_warmup_and_clipped_after() {
        let m = Momentum {
            warmup: 4,
            ..Default::default()
        };
        let mut t = ConvergenceTracker::new(1e-12, 1, 0, 10);
        t.record(1, 1.0);
        t.record(2, 0.999);
        assert_eq!(m.factor(2, &t), 1.0);
        let w = m.factor(4, &t);
        assert!(w > 1.0 && w <= Momentum::MAX, "w={}", w);
    }

    #[test]
    fn fixed_momentum_is_validated() {
        let bad = Momentum {
            value: Some(2.5),
            ..Default::default()
        };
        assert!(bad.validate().is_err());
        let mut cand = [3.0, f64::NEG_INFINITY];
        over_relax(1.5, &[1.0, 0.0], &mut cand);
        assert_eq!(cand, [4.0, f64::NEG_INFINITY]);
    }
}
