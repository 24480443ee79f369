//! Entropic optimal transport solvers.
//!
//! Given two weighted point sets (or abstract marginals `a`, `b`) and a cost
//! structure between them, find a coupling \(P\) minimizing
//! \[
//! \langle C, P\rangle - \varepsilon H(P), \quad P\mathbf 1 = a,\; P^\top \mathbf 1 = b.
//! \]
//!
//! Engines:
//! - [`sinkhorn`]: full-rank log-domain Sinkhorn with optional momentum or Anderson acceleration.
//! - [`low_rank`]: rank-`r` coupling \(Q\,\mathrm{diag}(1/g)\,R^\top\) via mirror descent + Dykstra.
//! - [`gromov`]: Gromov-Wasserstein outer loop that linearizes a quadratic problem into a
//!   sequence of Sinkhorn solves.
//!
//! Public invariants (must not change):
//! - APIs are backend-agnostic (slice-based, row-major `Vec<f64>` matrices).
//! - Numeric code is deterministic (the only RNG is the explicitly seeded low-rank initializer).
//! - Regularization and iteration budgets are explicit and validated before any iteration runs.
//! - Non-convergence is a result (`converged == false`), never an `Err`.
//!
//! Control flow is shaped so that every engine can run a fixed number of iterations:
//! once a state has converged, further iterations are exact no-ops on it. Setting
//! `early_exit = false` runs that fixed-trip form and yields the same output as the
//! default early break.

pub mod acceleration;
pub mod convergence;
pub mod geometry;
pub mod gromov;
pub mod low_rank;
pub mod problem;
pub mod progress;
pub mod sinkhorn;

pub use acceleration::{Anderson, Momentum};
pub use convergence::ConvergenceTracker;
pub use geometry::{DenseCost, Geometry, PointCloud};
pub use gromov::{gromov_wasserstein, CouplingUpdate, GromovWasserstein, GwConfig, GwLoss, GwOutput};
pub use low_rank::{low_rank_sinkhorn, Initializer, LowRankConfig, LowRankOutput, LowRankSinkhorn};
pub use problem::{LinearProblem, QuadraticProblem};
pub use progress::{LogProgress, NoProgress, ProgressObserver, Snapshot};
pub use sinkhorn::{sinkhorn, Sinkhorn, SinkhornConfig, SinkhornOutput};

/// Errors raised by problem and solver construction.
///
/// Every variant is a configuration error: it is returned before any iteration begins.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum Error {
    /// Regularization \(\varepsilon\) must be positive and finite.
    #[error("epsilon must be positive and finite, got {0}")]
    InvalidEpsilon(f64),
    /// Low-rank factorization needs `rank >= 1`.
    #[error("rank must be at least 1, got {0}")]
    InvalidRank(usize),
    /// Marginals / point sets must be non-empty.
    #[error("inputs must be non-empty")]
    EmptyInput,
    /// A vector does not have the length implied by the geometry.
    #[error("{what} has length {len}, expected {expected}")]
    LengthMismatch {
        /// Which input was wrong (`"a"`, `"b"`, `"f"`, ...).
        what: &'static str,
        /// The provided length.
        len: usize,
        /// The expected length.
        expected: usize,
    },
    /// Marginal entries must be finite and non-negative.
    #[error("weight {index} of {what} must be finite and non-negative, got {value}")]
    InvalidWeight {
        /// Which marginal (`"a"` or `"b"`).
        what: &'static str,
        /// Index of the offending entry.
        index: usize,
        /// The offending value.
        value: f64,
    },
    /// Marginal total mass must be finite and positive.
    #[error("total mass of {what} must be finite and positive, got {mass}")]
    InvalidMass {
        /// Which marginal (`"a"` or `"b"`).
        what: &'static str,
        /// The computed sum.
        mass: f64,
    },
    /// Both marginals must carry the same mass for this solver.
    #[error("marginal masses differ: sum(a)={a}, sum(b)={b}")]
    MassMismatch {
        /// Total mass of `a`.
        a: f64,
        /// Total mass of `b`.
        b: f64,
    },
    /// Cost matrix shape mismatch.
    #[error("cost matrix has length {len}, expected {n}*{m}={expected}")]
    InvalidCostShape {
        /// The provided `cost` slice length.
        len: usize,
        /// Expected row count.
        n: usize,
        /// Expected column count.
        m: usize,
        /// `n*m`, included explicitly for readability.
        expected: usize,
    },
    /// Costs must be finite.
    #[error("cost entry ({i}, {j}) is not finite")]
    NonFiniteCost {
        /// Row index.
        i: usize,
        /// Column index.
        j: usize,
    },
    /// Intra-domain geometries for Gromov-Wasserstein must be square.
    #[error("{what} geometry must be square, got {rows}x{cols}")]
    NotSquare {
        /// Which geometry (`"xx"` or `"yy"`).
        what: &'static str,
        /// Row count.
        rows: usize,
        /// Column count.
        cols: usize,
    },
    /// Unbalanced relaxation must lie in `(0, 1]`.
    #[error("tau must lie in (0, 1], got {0}")]
    InvalidTau(f64),
    /// Generic out-of-range solver parameter.
    #[error("invalid parameter {name}: {value}")]
    InvalidParameter {
        /// Parameter name as it appears in the config struct.
        name: &'static str,
        /// The offending value.
        value: f64,
    },
    /// Momentum and Anderson acceleration cannot be combined.
    #[error("momentum and anderson acceleration are mutually exclusive")]
    ConflictingAcceleration,
}

/// Convenience result type for this crate.
pub type Result<T> = std::result::Result<T, Error>;

pub(crate) fn check_positive(name: &'static str, value: f64) -> Result<()> {
    if value > 0.0 && value.is_finite() {
        Ok(())
    } else {
        Err(Error::InvalidParameter { name, value })
    }
}

pub(crate) fn check_nonzero(name: &'static str, value: usize) -> Result<()> {
    if value == 0 {
        Err(Error::InvalidParameter {
            name,
            value: 0.0,
        })
    } else {
        Ok(())
    }
}
