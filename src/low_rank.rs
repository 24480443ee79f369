//! Low-rank Sinkhorn (Scetbon, Cuturi & Peyré 2021).
//!
//! The coupling is constrained to \(P = Q\,\mathrm{diag}(1/g)\,R^\top\) with
//! \(Q \in \mathbb R_+^{n\times r}\), \(R \in \mathbb R_+^{m\times r}\), \(g \in \mathbb R_{>0}^r\) and
//! \[
//! Q\mathbf 1 = a,\quad R\mathbf 1 = b,\quad Q^\top\mathbf 1 = R^\top\mathbf 1 = g .
//! \]
//! Each outer iteration is one mirror-descent step on \(\langle C, P\rangle - \varepsilon H(Q,R,g)\):
//! the three factors take a multiplicative step against their gradients, giving kernels
//! \(\xi_Q, \xi_R, \xi_g\), and a bounded Dykstra loop projects \((\xi_Q, \xi_R, \xi_g)\) back
//! onto the constraint set in KL. The projection also floors \(g \ge\) `min_g`, so a
//! collapsing component never makes \(\mathrm{diag}(1/g)\) blow up.
//!
//! The convergence error is the relative change of \(\langle C, P\rangle\) between two
//! consecutive checkpoints; cadence, history and freezing follow the full-rank engine.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::convergence::{commit, l1_deviation, relative_change, ConvergenceTracker};
use crate::geometry::{logsumexp_by, Geometry};
use crate::problem::LinearProblem;
use crate::progress::{NoProgress, ProgressObserver, Snapshot};
use crate::{check_nonzero, check_positive, Error, Result};

/// Smallest value fed to `ln` for factor entries.
const LN_FLOOR: f64 = 1e-300;

/// Dykstra checks its marginal error this often.
const DYKSTRA_CHECK_EVERY: usize = 10;

#[inline]
fn ln_floor(x: f64) -> f64 {
    x.max(LN_FLOOR).ln()
}

fn entropy(x: &[f64]) -> f64 {
    -x.iter()
        .filter(|&&v| v > 0.0)
        .map(|&v| v * (v.ln() - 1.0))
        .sum::<f64>()
}

/// How the factors are initialized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Initializer {
    /// Deterministic feasible mixture of two rank-1 couplings.
    #[default]
    Rank2,
    /// Seeded random positive factors, scaled to the marginals.
    Random {
        /// ChaCha8 seed.
        seed: u64,
    },
}

/// Low-rank engine configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct LowRankConfig {
    /// Rank `r` of the coupling.
    pub rank: usize,
    /// Mirror-descent step size.
    pub gamma: f64,
    /// Divide `gamma` by the squared max-norm of the gradients at every step.
    pub gamma_rescale: bool,
    /// Convergence threshold on the relative cost change.
    pub threshold: f64,
    /// Outer iteration budget.
    pub max_iterations: usize,
    /// Convergence is not declared before this many iterations.
    pub min_iterations: usize,
    /// Error check / progress cadence.
    pub inner_iterations: usize,
    /// Iteration cap of each Dykstra projection.
    pub dykstra_iterations: usize,
    /// Marginal L1 tolerance of each Dykstra projection.
    pub dykstra_tolerance: f64,
    /// Floor on the entries of `g`.
    pub min_g: f64,
    /// Factor initialization.
    pub initializer: Initializer,
    /// Stop iterating once frozen; `false` runs the full budget with masked updates.
    pub early_exit: bool,
}

impl Default for LowRankConfig {
    fn default() -> Self {
        Self {
            rank: 10,
            gamma: 10.0,
            gamma_rescale: true,
            threshold: 1e-3,
            max_iterations: 2000,
            min_iterations: 0,
            inner_iterations: 10,
            dykstra_iterations: 1000,
            dykstra_tolerance: 1e-9,
            min_g: 1e-5,
            initializer: Initializer::Rank2,
            early_exit: true,
        }
    }
}

impl LowRankConfig {
    /// Check ranges.
    pub fn validate(&self) -> Result<()> {
        if self.rank == 0 {
            return Err(Error::InvalidRank(0));
        }
        check_positive("gamma", self.gamma)?;
        check_positive("threshold", self.threshold)?;
        check_positive("dykstra_tolerance", self.dykstra_tolerance)?;
        check_positive("min_g", self.min_g)?;
        check_nonzero("max_iterations", self.max_iterations)?;
        check_nonzero("inner_iterations", self.inner_iterations)?;
        check_nonzero("dykstra_iterations", self.dykstra_iterations)?;
        Ok(())
    }
}

/// Mutable iteration state of a low-rank solve.
#[derive(Debug, Clone, PartialEq)]
pub struct LRSinkhornState {
    q: Vec<f64>,
    r: Vec<f64>,
    g: Vec<f64>,
    rank: usize,
    iteration: usize,
    cost: f64,
    tracker: ConvergenceTracker,
}

impl LRSinkhornState {
    /// `n × r` source factor.
    pub fn q(&self) -> &[f64] {
        &self.q
    }

    /// `m × r` target factor.
    pub fn r(&self) -> &[f64] {
        &self.r
    }

    /// Inner marginal, length `r`.
    pub fn g(&self) -> &[f64] {
        &self.g
    }

    /// Rank `r`.
    pub fn rank(&self) -> usize {
        self.rank
    }

    /// Completed outer iterations.
    pub fn iteration(&self) -> usize {
        self.iteration
    }

    /// \(\langle C, P\rangle\) at the last checkpoint (or at initialization).
    pub fn transport_cost(&self) -> f64 {
        self.cost
    }

    /// Error history and flags.
    pub fn tracker(&self) -> &ConvergenceTracker {
        &self.tracker
    }

    /// Error fell below the threshold.
    pub fn converged(&self) -> bool {
        self.tracker.converged()
    }
}

/// Result of a low-rank solve, in factored form.
#[derive(Debug, Clone, PartialEq)]
pub struct LowRankOutput {
    /// `n × r` source factor.
    pub q: Vec<f64>,
    /// `m × r` target factor.
    pub r: Vec<f64>,
    /// Inner marginal, length `r`.
    pub g: Vec<f64>,
    /// Source size.
    pub n: usize,
    /// Target size.
    pub m: usize,
    /// Rank.
    pub rank: usize,
    /// Error per checkpoint, `-1` where no checkpoint ran.
    pub errors: Vec<f64>,
    /// Last computed error.
    pub error: f64,
    /// Completed outer iterations.
    pub iterations: usize,
    /// Error fell below the threshold.
    pub converged: bool,
    /// \(\langle C, P\rangle\).
    pub transport_cost: f64,
    /// \(\langle C, P\rangle - \varepsilon (H(Q) + H(R) + H(g))\).
    pub reg_ot_cost: f64,
}

impl LowRankOutput {
    /// `P v` for `v` of length `m`, without materializing `P`.
    ///
    /// # Panics
    ///
    /// If `v.len() != m`.
    pub fn apply(&self, v: &[f64]) -> Vec<f64> {
        assert_eq!(v.len(), self.m, "apply expects a vector of length m");
        let k = self.rank;
        let mut rv = vec![0.0; k];
        for (row, &vj) in self.r.chunks_exact(k).zip(v) {
            for (acc, &x) in rv.iter_mut().zip(row) {
                *acc += x * vj;
            }
        }
        for (acc, &gl) in rv.iter_mut().zip(&self.g) {
            *acc /= gl;
        }
        self.q
            .chunks_exact(k)
            .map(|row| row.iter().zip(&rv).map(|(x, y)| x * y).sum())
            .collect()
    }

    /// `Pᵀ u` for `u` of length `n`.
    ///
    /// # Panics
    ///
    /// If `u.len() != n`.
    pub fn apply_transpose(&self, u: &[f64]) -> Vec<f64> {
        assert_eq!(u.len(), self.n, "apply_transpose expects a vector of length n");
        let k = self.rank;
        let mut qu = vec![0.0; k];
        for (row, &ui) in self.q.chunks_exact(k).zip(u) {
            for (acc, &x) in qu.iter_mut().zip(row) {
                *acc += x * ui;
            }
        }
        for (acc, &gl) in qu.iter_mut().zip(&self.g) {
            *acc /= gl;
        }
        self.r
            .chunks_exact(k)
            .map(|row| row.iter().zip(&qu).map(|(x, y)| x * y).sum())
            .collect()
    }

    /// Dense row-major `n × m` coupling.
    pub fn matrix(&self) -> Vec<f64> {
        let k = self.rank;
        let mut p = vec![0.0; self.n * self.m];
        for (i, qi) in self.q.chunks_exact(k).enumerate() {
            for (j, rj) in self.r.chunks_exact(k).enumerate() {
                p[i * self.m + j] = (0..k).map(|l| qi[l] * rj[l] / self.g[l]).sum();
            }
        }
        p
    }

    /// `P 1`.
    pub fn row_marginal(&self) -> Vec<f64> {
        self.apply(&vec![1.0; self.m])
    }

    /// `Pᵀ 1`.
    pub fn col_marginal(&self) -> Vec<f64> {
        self.apply_transpose(&vec![1.0; self.n])
    }
}

/// \(\langle C, Q\,\mathrm{diag}(1/g)\,R^\top\rangle\) and \(C R\).
fn factored_cost<G: Geometry>(geom: &G, q: &[f64], r: &[f64], g: &[f64]) -> (f64, Vec<f64>) {
    let k = g.len();
    let cr = geom.apply_cost(r, k, |c| c);
    let mut diag = vec![0.0; k];
    for (qi, ci) in q.chunks_exact(k).zip(cr.chunks_exact(k)) {
        for l in 0..k {
            diag[l] += qi[l] * ci[l];
        }
    }
    let cost = diag.iter().zip(g).map(|(d, gl)| d / gl).sum();
    (cost, cr)
}

/// Alternate row / column rescaling of a positive `rows × cols` matrix.
fn scale_to_marginals(mat: &mut [f64], row_sums: &[f64], col_sums: &[f64], sweeps: usize) {
    let cols = col_sums.len();
    for _ in 0..sweeps {
        let mut col = vec![0.0; cols];
        for row in mat.chunks_exact(cols) {
            for (c, &x) in col.iter_mut().zip(row) {
                *c += x;
            }
        }
        for row in mat.chunks_exact_mut(cols) {
            for ((x, &c), &target) in row.iter_mut().zip(&col).zip(col_sums) {
                *x *= target / c;
            }
        }
        for (row, &target) in mat.chunks_exact_mut(cols).zip(row_sums) {
            let s: f64 = row.iter().sum();
            let scale = if s > 0.0 { target / s } else { 0.0 };
            row.iter_mut().for_each(|x| *x *= scale);
        }
    }
}

/// Log-domain Dykstra projection onto the low-rank coupling polytope.
struct Dykstra<'a> {
    log_a: &'a [f64],
    log_b: &'a [f64],
    a: &'a [f64],
    b: &'a [f64],
    rank: usize,
    log_min_g: f64,
    max_iterations: usize,
    tolerance: f64,
}

impl Dykstra<'_> {
    /// Row scalings `lu_i = log p_i − lse_l(lξ_il + lv_l)`; `-∞` for empty rows.
    fn row_scaling(&self, lxi: &[f64], lv: &[f64], log_p: &[f64], lu: &mut [f64]) {
        let k = self.rank;
        for ((u, row), &lp) in lu.iter_mut().zip(lxi.chunks_exact(k)).zip(log_p) {
            *u = if lp.is_finite() {
                lp - logsumexp_by(k, |l| row[l] + lv[l])
            } else {
                f64::NEG_INFINITY
            };
        }
    }

    /// Column log-sums `s_l = lse_i(lξ_il + lu_i)`.
    fn col_sums(&self, lxi: &[f64], lu: &[f64], s: &mut [f64]) {
        let k = self.rank;
        let rows = lu.len();
        for (l, sl) in s.iter_mut().enumerate() {
            *sl = logsumexp_by(rows, |i| lxi[i * k + l] + lu[i]);
        }
    }

    fn row_error(&self, lxi: &[f64], lu: &[f64], lv: &[f64], target: &[f64]) -> f64 {
        let k = self.rank;
        let sums: Vec<f64> = lxi
            .chunks_exact(k)
            .zip(lu)
            .map(|(row, &u)| (u + logsumexp_by(k, |l| row[l] + lv[l])).exp())
            .collect();
        l1_deviation(&sums, target)
    }

    fn project(&self, lxi_q: &[f64], lxi_r: &[f64], lxi_g: &[f64]) -> (Vec<f64>, Vec<f64>, Vec<f64>) {
        let k = self.rank;
        let (n, m) = (self.a.len(), self.b.len());
        let mut lu1 = vec![0.0; n];
        let mut lu2 = vec![0.0; m];
        let mut lv1 = vec![0.0; k];
        let mut lv2 = vec![0.0; k];
        let mut lq1 = vec![0.0; k];
        let mut lq2 = vec![0.0; k];
        let mut lq3_floor = vec![0.0; k];
        let mut lq3_mean = vec![0.0; k];
        let mut lg_prev = lxi_g.to_vec();
        let mut lg = lxi_g.to_vec();
        let mut s1 = vec![0.0; k];
        let mut s2 = vec![0.0; k];

        for it in 0..self.max_iterations {
            self.row_scaling(lxi_q, &lv1, self.log_a, &mut lu1);
            self.row_scaling(lxi_r, &lv2, self.log_b, &mut lu2);

            for l in 0..k {
                let x = lg_prev[l] + lq3_floor[l];
                lg[l] = x.max(self.log_min_g);
                lq3_floor[l] = x - lg[l];
                lg_prev[l] = lg[l];
            }

            self.col_sums(lxi_q, &lu1, &mut s1);
            self.col_sums(lxi_r, &lu2, &mut s2);
            for l in 0..k {
                lg[l] = ((lg_prev[l] + lq3_mean[l])
                    + (lv1[l] + lq1[l] + s1[l])
                    + (lv2[l] + lq2[l] + s2[l]))
                    / 3.0;
                let v1 = lg[l] - s1[l];
                let v2 = lg[l] - s2[l];
                lq1[l] += lv1[l] - v1;
                lq2[l] += lv2[l] - v2;
                lq3_mean[l] += lg_prev[l] - lg[l];
                lg_prev[l] = lg[l];
                lv1[l] = v1;
                lv2[l] = v2;
            }

            if (it + 1) % DYKSTRA_CHECK_EVERY == 0 {
                let err = self.row_error(lxi_q, &lu1, &lv1, self.a)
                    + self.row_error(lxi_r, &lu2, &lv2, self.b);
                if err < self.tolerance {
                    break;
                }
            }
        }

        // The last v-update made the column sums exact; refresh the row scalings so the
        // returned factors carry the latest ones too.
        self.row_scaling(lxi_q, &lv1, self.log_a, &mut lu1);
        self.row_scaling(lxi_r, &lv2, self.log_b, &mut lu2);
        let q = factor(lxi_q, &lu1, &lv1, k);
        let r = factor(lxi_r, &lu2, &lv2, k);
        let min_g = self.log_min_g.exp();
        let g = lg.iter().map(|&x| x.exp().max(min_g)).collect();
        (q, r, g)
    }
}

fn factor(lxi: &[f64], lu: &[f64], lv: &[f64], k: usize) -> Vec<f64> {
    lxi.chunks_exact(k)
        .zip(lu)
        .flat_map(|(row, &u)| row.iter().zip(lv).map(move |(x, v)| (u + x + v).exp()))
        .collect()
}

/// The low-rank Sinkhorn engine.
#[derive(Debug, Clone, PartialEq)]
pub struct LowRankSinkhorn {
    config: LowRankConfig,
}

impl LowRankSinkhorn {
    /// Validate `config` and build the engine.
    pub fn new(config: LowRankConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    /// The engine configuration.
    pub fn config(&self) -> &LowRankConfig {
        &self.config
    }

    fn check_problem<G: Geometry>(problem: &LinearProblem<G>) -> Result<f64> {
        if !problem.is_balanced() {
            let tau = if problem.tau_a() < 1.0 {
                problem.tau_a()
            } else {
                problem.tau_b()
            };
            return Err(Error::InvalidTau(tau));
        }
        // Balanced problems carry equal masses by construction.
        Ok(problem.a().iter().sum())
    }

    /// Initial factors at iteration 0.
    pub fn init_state<G: Geometry>(&self, problem: &LinearProblem<G>) -> Result<LRSinkhornState> {
        let mass = Self::check_problem(problem)?;
        let k = self.config.rank;
        let (q, r, g) = match self.config.initializer {
            Initializer::Rank2 => rank2_factors(problem.a(), problem.b(), k, mass),
            Initializer::Random { seed } => random_factors(problem.a(), problem.b(), k, mass, seed),
        };
        let (cost, _) = factored_cost(problem.geom(), &q, &r, &g);
        let c = &self.config;
        Ok(LRSinkhornState {
            q,
            r,
            g,
            rank: k,
            iteration: 0,
            cost,
            tracker: ConvergenceTracker::new(
                c.threshold,
                c.inner_iterations,
                c.min_iterations,
                c.max_iterations,
            ),
        })
    }

    /// One mirror-descent step on `(Q, R, g)` followed by the Dykstra projection.
    pub fn step<G: Geometry, O: ProgressObserver>(
        &self,
        problem: &LinearProblem<G>,
        state: &mut LRSinkhornState,
        observer: &mut O,
    ) {
        let c = &self.config;
        let frozen = state.tracker.is_frozen() || state.iteration >= c.max_iterations;
        let geom = problem.geom();
        let k = state.rank;
        let eps = problem.epsilon();

        let cr = geom.apply_cost(&state.r, k, |x| x);
        let ctq = geom.apply_cost_transpose(&state.q, k, |x| x);
        let scaled = |m: &[f64]| -> Vec<f64> {
            m.chunks_exact(k)
                .flat_map(|row| row.iter().zip(&state.g).map(|(x, gl)| x / gl))
                .collect()
        };
        let grad_q = scaled(&cr);
        let grad_r = scaled(&ctq);
        let mut grad_g = vec![0.0; k];
        for (qi, ci) in state.q.chunks_exact(k).zip(cr.chunks_exact(k)) {
            for l in 0..k {
                grad_g[l] -= qi[l] * ci[l];
            }
        }
        for (gg, gl) in grad_g.iter_mut().zip(&state.g) {
            *gg /= gl * gl;
        }

        let mut gamma = c.gamma;
        if c.gamma_rescale {
            let max_abs = |v: &[f64]| v.iter().fold(0.0f64, |acc, x| acc.max(x.abs()));
            let norm = max_abs(&grad_q)
                .max(max_abs(&grad_r))
                .max(max_abs(&grad_g))
                .powi(2);
            if norm > 0.0 && norm.is_finite() {
                gamma /= norm;
            }
        }
        let decay = 1.0 / (eps * gamma + 1.0);
        let step = gamma * decay;
        let kernel = |grad: &[f64], x: &[f64]| -> Vec<f64> {
            grad.iter()
                .zip(x)
                .map(|(d, &v)| -step * d + decay * ln_floor(v))
                .collect()
        };
        let lxi_q = kernel(&grad_q, &state.q);
        let lxi_r = kernel(&grad_r, &state.r);
        let lxi_g = kernel(&grad_g, &state.g);

        let log_a: Vec<f64> = problem.a().iter().map(|x| x.ln()).collect();
        let log_b: Vec<f64> = problem.b().iter().map(|x| x.ln()).collect();
        let dykstra = Dykstra {
            log_a: &log_a,
            log_b: &log_b,
            a: problem.a(),
            b: problem.b(),
            rank: k,
            log_min_g: c.min_g.ln(),
            max_iterations: c.dykstra_iterations,
            tolerance: c.dykstra_tolerance,
        };
        let (q, r, g) = dykstra.project(&lxi_q, &lxi_r, &lxi_g);

        commit(frozen, &mut state.q, &q);
        commit(frozen, &mut state.r, &r);
        commit(frozen, &mut state.g, &g);
        if frozen {
            return;
        }
        state.iteration += 1;

        let completed = state.iteration;
        if state.tracker.is_checkpoint(completed) {
            let (cost, _) = factored_cost(geom, &state.q, &state.r, &state.g);
            let err = relative_change(state.cost, cost);
            state.cost = cost;
            state.tracker.record(completed, err);
            observer.observe(
                completed,
                c.inner_iterations,
                c.max_iterations,
                Snapshot::LowRank(&*state),
            );
        }
    }

    /// Drive `state` through the iteration budget.
    pub fn run<G: Geometry, O: ProgressObserver>(
        &self,
        problem: &LinearProblem<G>,
        state: &mut LRSinkhornState,
        observer: &mut O,
    ) {
        for _ in 0..self.config.max_iterations {
            if self.config.early_exit && state.tracker.is_frozen() {
                break;
            }
            self.step(problem, state, observer);
        }
    }

    /// Solve without progress reporting.
    pub fn solve<G: Geometry>(&self, problem: &LinearProblem<G>) -> Result<LowRankOutput> {
        self.solve_with(problem, &mut NoProgress)
    }

    /// Solve, reporting to `observer`.
    pub fn solve_with<G: Geometry, O: ProgressObserver>(
        &self,
        problem: &LinearProblem<G>,
        observer: &mut O,
    ) -> Result<LowRankOutput> {
        let mut state = self.init_state(problem)?;
        self.run(problem, &mut state, observer);
        Ok(Self::output(problem, state))
    }

    /// Freeze a state into its output.
    pub fn output<G: Geometry>(problem: &LinearProblem<G>, state: LRSinkhornState) -> LowRankOutput {
        let (n, m) = problem.shape();
        let (transport_cost, _) = factored_cost(problem.geom(), &state.q, &state.r, &state.g);
        let reg_ot_cost = transport_cost
            - problem.epsilon() * (entropy(&state.q) + entropy(&state.r) + entropy(&state.g));
        let error = state.tracker.last_error().unwrap_or(f64::INFINITY);
        log::debug!(
            "lr-sinkhorn {}x{} rank {} finished: iterations={} error={:.3e} converged={}",
            n,
            m,
            state.rank,
            state.iteration,
            error,
            state.tracker.converged()
        );
        LowRankOutput {
            n,
            m,
            rank: state.rank,
            errors: state.tracker.errors().to_vec(),
            error,
            iterations: state.iteration,
            converged: state.tracker.converged(),
            transport_cost,
            reg_ot_cost,
            q: state.q,
            r: state.r,
            g: state.g,
        }
    }
}

/// Functional form: validate `config` and solve `problem`.
pub fn low_rank_sinkhorn<G: Geometry>(
    problem: &LinearProblem<G>,
    config: &LowRankConfig,
) -> Result<LowRankOutput> {
    LowRankSinkhorn::new(config.clone())?.solve(problem)
}

/// Normalized ramp `1, 2, 3, …` over the entries where `support` holds, zero elsewhere.
fn ramp(support: impl Iterator<Item = bool>) -> Vec<f64> {
    let mut rank = 0usize;
    let raw: Vec<f64> = support
        .map(|on| {
            if on {
                rank += 1;
                rank as f64
            } else {
                0.0
            }
        })
        .collect();
    let total: f64 = raw.iter().sum();
    raw.iter().map(|x| x / total).collect()
}

/// `λ x1 y1ᵀ + (1−λ) x2 y2ᵀ` scaled by `mass`, with row sums `w` and column sums `mass/k`.
///
/// `x1` lives on the support of `w`, so zero weights give zero rows and `x2 ≥ 0` whenever
/// `λ` is at most the smallest positive normalized weight.
fn rank2_factor(w: &[f64], k: usize, lambda: f64, mass: f64) -> Vec<f64> {
    let w_hat: Vec<f64> = w.iter().map(|x| x / mass).collect();
    let w1 = ramp(w.iter().map(|&x| x > 0.0));
    let w2: Vec<f64> = w_hat
        .iter()
        .zip(&w1)
        .map(|(x, y)| (x - lambda * y) / (1.0 - lambda))
        .collect();
    let g1 = ramp((0..k).map(|_| true));
    let g2: Vec<f64> = g1
        .iter()
        .map(|y| (1.0 / k as f64 - lambda * y) / (1.0 - lambda))
        .collect();
    let mut out = Vec::with_capacity(w.len() * k);
    for i in 0..w.len() {
        for l in 0..k {
            out.push(mass * (lambda * w1[i] * g1[l] + (1.0 - lambda) * w2[i] * g2[l]));
        }
    }
    out
}

fn rank2_factors(a: &[f64], b: &[f64], k: usize, mass: f64) -> (Vec<f64>, Vec<f64>, Vec<f64>) {
    let min_hat = a
        .iter()
        .chain(b)
        .filter(|&&x| x > 0.0)
        .map(|x| x / mass)
        .fold(1.0 / k as f64, f64::min);
    let lambda = min_hat / 2.0;
    (
        rank2_factor(a, k, lambda, mass),
        rank2_factor(b, k, lambda, mass),
        vec![mass / k as f64; k],
    )
}

fn random_factors(
    a: &[f64],
    b: &[f64],
    k: usize,
    mass: f64,
    seed: u64,
) -> (Vec<f64>, Vec<f64>, Vec<f64>) {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let g = vec![mass / k as f64; k];
    let mut draw = |rows: usize| -> Vec<f64> { (0..rows * k).map(|_| 0.1 + rng.gen::<f64>()).collect() };
    let mut q = draw(a.len());
    let mut r = draw(b.len());
    scale_to_marginals(&mut q, a, &g, 100);
    scale_to_marginals(&mut r, b, &g, 100);
    (q, r, g)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::{DenseCost, PointCloud};
    use crate::sinkhorn::{sinkhorn, SinkhornConfig};

    fn line(n: usize, offset: f64) -> Vec<f64> {
        (0..n).flat_map(|i| [offset + i as f64 / 5.0, 0.0]).collect()
    }

    fn shifted_lines(eps: f64) -> LinearProblem<PointCloud> {
        let geom = PointCloud::new(line(6, 0.0), line(6, 3.0), 2).unwrap();
        LinearProblem::new(geom, None, None, eps).unwrap()
    }

    fn sums(mat: &[f64], k: usize) -> (Vec<f64>, Vec<f64>) {
        let rows = mat.chunks_exact(k).map(|r| r.iter().sum()).collect();
        let mut cols = vec![0.0; k];
        for r in mat.chunks_exact(k) {
            for (c, x) in cols.iter_mut().zip(r) {
                *c += x;
            }
        }
        (rows, cols)
    }

    #[test]
    fn rank2_init_is_feasible() {
        let a = [0.1, 0.2, 0.3, 0.4];
        let b = [0.25; 4];
        let (q, r, g) = rank2_factors(&a, &b, 3, 1.0);
        let (qr, qc) = sums(&q, 3);
        let (rr, rc) = sums(&r, 3);
        assert!(q.iter().chain(&r).all(|&x| x > 0.0));
        assert!(l1_deviation(&qr, &a) < 1e-12);
        assert!(l1_deviation(&rr, &b) < 1e-12);
        assert!(l1_deviation(&qc, &g) < 1e-12);
        assert!(l1_deviation(&rc, &g) < 1e-12);
    }

    #[test]
    fn rank2_init_with_zero_weight_is_feasible_and_not_rank_one() {
        let a = [0.0, 0.2, 0.2, 0.2, 0.2, 0.2];
        let b = [0.25; 4];
        let (q, r, g) = rank2_factors(&a, &b, 3, 1.0);
        assert!(q.iter().chain(&r).all(|&x| x >= 0.0));
        assert!(q[..3].iter().all(|&x| x == 0.0));
        let (qr, qc) = sums(&q, 3);
        let (rr, rc) = sums(&r, 3);
        assert!(l1_deviation(&qr, &a) < 1e-12);
        assert!(l1_deviation(&rr, &b) < 1e-12);
        assert!(l1_deviation(&qc, &g) < 1e-12);
        assert!(l1_deviation(&rc, &g) < 1e-12);
        // Columns must differ in direction, or mirror descent keeps them tied forever.
        let col = |l: usize| -> Vec<f64> { (1..6).map(|i| q[i * 3 + l] / q[3 + l]).collect() };
        assert_ne!(col(0), col(1));
    }

    #[test]
    fn zero_weight_full_rank_factorization_beats_product_coupling() {
        let geom = PointCloud::new(line(6, 0.0), line(6, 0.1), 2).unwrap();
        let a = vec![0.0, 0.2, 0.2, 0.2, 0.2, 0.2];
        let p = LinearProblem::new(geom, Some(a.clone()), None, 0.01).unwrap();
        let product: f64 = (0..6)
            .flat_map(|i| (0..6).map(move |j| (i, j)))
            .map(|(i, j)| a[i] * p.b()[j] * p.geom().cost(i, j))
            .sum();
        let full = sinkhorn(
            &p,
            &SinkhornConfig {
                threshold: 1e-6,
                max_iterations: 10_000,
                ..Default::default()
            },
        )
        .unwrap();
        let lr = low_rank_sinkhorn(
            &p,
            &LowRankConfig {
                rank: 6,
                ..Default::default()
            },
        )
        .unwrap();
        assert!(full.transport_cost < product);
        assert!(
            lr.transport_cost < 0.5 * product,
            "low rank {} vs product {} (full {})",
            lr.transport_cost,
            product,
            full.transport_cost
        );
        assert!(lr.q[..6].iter().all(|&x| x == 0.0));
    }

    #[test]
    #[should_panic(expected = "length m")]
    fn apply_rejects_wrong_length() {
        let p = shifted_lines(0.1);
        let out = low_rank_sinkhorn(
            &p,
            &LowRankConfig {
                rank: 2,
                max_iterations: 5,
                ..Default::default()
            },
        )
        .unwrap();
        out.apply(&[1.0; 5]);
    }

    #[test]
    fn random_init_is_seeded_and_nearly_feasible() {
        let a = [0.5, 0.3, 0.2];
        let b = [0.2, 0.2, 0.2, 0.4];
        let (q1, r1, g) = random_factors(&a, &b, 2, 1.0, 7);
        let (q2, _, _) = random_factors(&a, &b, 2, 1.0, 7);
        assert_eq!(q1, q2);
        let (qr, qc) = sums(&q1, 2);
        let (_, rc) = sums(&r1, 2);
        assert!(l1_deviation(&qr, &a) < 1e-12);
        assert!(l1_deviation(&qc, &g) < 1e-6);
        assert!(l1_deviation(&rc, &g) < 1e-6);
    }

    #[test]
    fn full_rank_factorization_is_close_to_sinkhorn_cost() {
        let p = shifted_lines(0.05);
        let full = sinkhorn(
            &p,
            &SinkhornConfig {
                threshold: 1e-6,
                max_iterations: 10_000,
                ..Default::default()
            },
        )
        .unwrap();
        let lr = low_rank_sinkhorn(
            &p,
            &LowRankConfig {
                rank: 6,
                ..Default::default()
            },
        )
        .unwrap();
        assert!(lr.transport_cost.is_finite());
        assert!(
            lr.transport_cost <= 1.5 * full.transport_cost,
            "low rank {} vs full {}",
            lr.transport_cost,
            full.transport_cost
        );
    }

    #[test]
    fn output_marginals_match_targets() {
        let p = shifted_lines(0.01);
        for initializer in [Initializer::Rank2, Initializer::Random { seed: 3 }] {
            let out = low_rank_sinkhorn(
                &p,
                &LowRankConfig {
                    rank: 3,
                    initializer,
                    max_iterations: 200,
                    ..Default::default()
                },
            )
            .unwrap();
            for (x, y) in out.row_marginal().iter().zip(p.a()) {
                assert!((x - y).abs() < 1e-6, "{} vs {}", x, y);
            }
            for (x, y) in out.col_marginal().iter().zip(p.b()) {
                assert!((x - y).abs() < 1e-6, "{} vs {}", x, y);
            }
            let dense = out.matrix();
            let total: f64 = dense.iter().sum();
            assert!((total - 1.0).abs() < 1e-6);
            assert!(dense.iter().all(|&x| x >= 0.0));
        }
    }

    #[test]
    fn mirror_descent_improves_on_initial_cost() {
        let p = shifted_lines(0.01);
        let engine = LowRankSinkhorn::new(LowRankConfig {
            rank: 2,
            ..Default::default()
        })
        .unwrap();
        let init = engine.init_state(&p).unwrap().transport_cost();
        let out = engine.solve(&p).unwrap();
        assert!(out.transport_cost <= init + 1e-9, "{} > {}", out.transport_cost, init);
    }

    #[test]
    fn oversized_rank_keeps_g_floored_and_finite() {
        let c = DenseCost::from_fn(4, 4, |i, j| (i as f64 - j as f64).powi(2)).unwrap();
        let p = LinearProblem::new(c, None, None, 0.1).unwrap();
        let cfg = LowRankConfig {
            rank: 8,
            max_iterations: 100,
            ..Default::default()
        };
        let out = low_rank_sinkhorn(&p, &cfg).unwrap();
        assert!(out.g.iter().all(|&x| x >= cfg.min_g));
        assert!(out.q.iter().chain(&out.r).all(|x| x.is_finite()));
        assert!(out.transport_cost.is_finite());
    }

    #[test]
    fn converged_state_is_a_fixed_point_of_step() {
        let p = shifted_lines(0.05);
        let engine = LowRankSinkhorn::new(LowRankConfig {
            rank: 2,
            inner_iterations: 1,
            ..Default::default()
        })
        .unwrap();
        let mut state = engine.init_state(&p).unwrap();
        engine.run(&p, &mut state, &mut NoProgress);
        assert!(state.converged());
        let before = state.clone();
        engine.step(&p, &mut state, &mut NoProgress);
        assert_eq!(state, before);
    }

    #[test]
    fn masked_fixed_trip_matches_early_exit() {
        let p = shifted_lines(0.05);
        let base = LowRankConfig {
            rank: 2,
            max_iterations: 150,
            inner_iterations: 5,
            ..Default::default()
        };
        let eager = low_rank_sinkhorn(&p, &base).unwrap();
        let masked = low_rank_sinkhorn(
            &p,
            &LowRankConfig {
                early_exit: false,
                ..base
            },
        )
        .unwrap();
        assert_eq!(eager, masked);
    }

    #[test]
    fn callback_receives_low_rank_snapshots() {
        let p = shifted_lines(0.05);
        let engine = LowRankSinkhorn::new(LowRankConfig {
            rank: 2,
            threshold: 1e-300,
            max_iterations: 7,
            inner_iterations: 3,
            ..Default::default()
        })
        .unwrap();
        let mut calls = Vec::new();
        engine
            .solve_with(&p, &mut |it: usize, _k: usize, _t: usize, s: Snapshot<'_>| {
                assert!(matches!(s, Snapshot::LowRank(_)));
                calls.push(it);
            })
            .unwrap();
        assert_eq!(calls, vec![3, 6, 7]);
    }

    #[test]
    fn invalid_rank_and_problems_are_rejected() {
        assert_eq!(
            LowRankSinkhorn::new(LowRankConfig {
                rank: 0,
                ..Default::default()
            })
            .unwrap_err(),
            Error::InvalidRank(0)
        );
        let engine = LowRankSinkhorn::new(LowRankConfig::default()).unwrap();
        let c = DenseCost::from_fn(2, 2, |i, j| (i + j) as f64).unwrap();
        let relaxed = LinearProblem::new(c, None, None, 1.0)
            .unwrap()
            .with_tau(0.5, 1.0)
            .unwrap();
        assert_eq!(engine.solve(&relaxed).unwrap_err(), Error::InvalidTau(0.5));
    }
}
