//! Entropic Gromov-Wasserstein by successive linearization.
//!
//! Given intra-domain costs \(C_x\) (`n × n`) and \(C_y\) (`m × m`), the GW objective
//! \[
//! \sum_{ijkl} \ell(C_{x,ik}, C_{y,jl})\, T_{ij} T_{kl}
//! \]
//! is quadratic in the coupling. Writing \(\ell(x, y) = f_1(x) + f_2(y) - h_1(x) h_2(y)\),
//! the loss at \(T\) is \(\langle L(T), T\rangle\) with the linearized cost
//! \[
//! L(T) = f_1(C_x)\,p\,\mathbf 1^\top + \mathbf 1\,(f_2(C_y)\,q)^\top - h_1(C_x)\,T\,h_2(C_y)^\top,
//! \quad p = T\mathbf 1,\; q = T^\top \mathbf 1 .
//! \]
//! Each outer iteration solves the entropic linear problem with cost \(L(T_t)\) and moves
//! the coupling toward its plan, either all the way ([`CouplingUpdate::Direct`]) or by the
//! best step on a grid ([`CouplingUpdate::LineSearch`]).
//!
//! The recorded cost is the regularized objective
//! \(\langle L(T), T\rangle + \varepsilon \sum T(\log T - 1) + \varepsilon\, m(a)\, m(b)\).
//! Unlike the linear engines, the outer loop really stops once converged: there is no
//! state left behind to keep shape-stable.

use crate::convergence::{relative_change, UNSET};
use crate::geometry::{transpose, DenseCost, Geometry};
use crate::problem::{LinearProblem, QuadraticProblem};
use crate::progress::{NoProgress, ProgressObserver, Snapshot};
use crate::sinkhorn::{Potentials, Sinkhorn, SinkhornConfig, SinkhornOutput};
use crate::{check_nonzero, check_positive, Result};

/// Couplings with mass at or below this are treated as empty.
const TINY_MASS: f64 = 1e-300;

/// Floor for `ln` in the KL decomposition.
const LOG_FLOOR: f64 = 1e-12;

/// Pointwise loss between intra-domain costs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GwLoss {
    /// \((x - y)^2\).
    #[default]
    SquaredEuclidean,
    /// \(x \log(x / y) - x + y\), for non-negative costs.
    KlDivergence,
}

impl GwLoss {
    fn f1(self, x: f64) -> f64 {
        match self {
            GwLoss::SquaredEuclidean => x * x,
            GwLoss::KlDivergence if x > 0.0 => x * x.ln() - x,
            GwLoss::KlDivergence => 0.0,
        }
    }

    fn f2(self, y: f64) -> f64 {
        match self {
            GwLoss::SquaredEuclidean => y * y,
            GwLoss::KlDivergence => y,
        }
    }

    fn h1(self, x: f64) -> f64 {
        x
    }

    fn h2(self, y: f64) -> f64 {
        match self {
            GwLoss::SquaredEuclidean => 2.0 * y,
            GwLoss::KlDivergence => y.max(LOG_FLOOR).ln(),
        }
    }
}

/// How the coupling moves toward each inner plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CouplingUpdate {
    /// Adopt the inner plan.
    Direct,
    /// Conditional-gradient step \(T \leftarrow (1-\alpha) T + \alpha P\) with \(\alpha\)
    /// the best of `0, 1/steps, …, 1`. The zero step keeps the recorded cost non-increasing.
    LineSearch {
        /// Grid resolution.
        steps: usize,
    },
}

/// GW outer-loop configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct GwConfig {
    /// Regularization of every inner linear problem.
    pub epsilon: f64,
    /// Outer iteration budget.
    pub max_iterations: usize,
    /// Convergence is not declared before this many outer iterations.
    pub min_iterations: usize,
    /// Threshold on the relative change of consecutive costs.
    pub threshold: f64,
    /// Coupling update rule.
    pub update: CouplingUpdate,
    /// Start each inner solve from the previous inner potentials.
    pub warm_start: bool,
    /// Keep every inner error history.
    pub store_inner_errors: bool,
    /// Inner Sinkhorn configuration.
    pub linear: SinkhornConfig,
}

impl Default for GwConfig {
    fn default() -> Self {
        Self {
            epsilon: 1e-2,
            max_iterations: 50,
            min_iterations: 5,
            threshold: 1e-4,
            update: CouplingUpdate::Direct,
            warm_start: false,
            store_inner_errors: false,
            linear: SinkhornConfig::default(),
        }
    }
}

impl GwConfig {
    /// Check ranges, including the inner configuration.
    pub fn validate(&self) -> Result<()> {
        if !(self.epsilon > 0.0 && self.epsilon.is_finite()) {
            return Err(crate::Error::InvalidEpsilon(self.epsilon));
        }
        check_positive("threshold", self.threshold)?;
        check_nonzero("max_iterations", self.max_iterations)?;
        if let CouplingUpdate::LineSearch { steps } = self.update {
            check_nonzero("update.steps", steps)?;
        }
        self.linear.validate()
    }
}

/// Outer-loop state.
#[derive(Debug, Clone, PartialEq)]
pub struct GwState {
    coupling: Vec<f64>,
    costs: Vec<f64>,
    linear_convergence: Vec<bool>,
    inner_errors: Option<Vec<Vec<f64>>>,
    inner_iterations: usize,
    iteration: usize,
    converged: bool,
    last_error: Option<f64>,
    potentials: Option<Potentials>,
    linear_output: Option<SinkhornOutput>,
}

impl GwState {
    /// Completed outer iterations.
    pub fn iteration(&self) -> usize {
        self.iteration
    }

    /// Relative cost change of the last outer iteration, once two costs exist.
    pub fn last_error(&self) -> Option<f64> {
        self.last_error
    }

    /// Outer criterion met.
    pub fn converged(&self) -> bool {
        self.converged
    }

    /// Regularized cost per outer iteration, `-1` where none ran.
    pub fn costs(&self) -> &[f64] {
        &self.costs
    }

    /// Row-major current coupling.
    pub fn coupling(&self) -> &[f64] {
        &self.coupling
    }

    /// Inner convergence flag per outer iteration.
    pub fn linear_convergence(&self) -> &[bool] {
        &self.linear_convergence
    }
}

/// Result of a GW solve.
#[derive(Debug, Clone, PartialEq)]
pub struct GwOutput {
    /// Row-major `n × m` coupling.
    pub coupling: Vec<f64>,
    /// Rows of `coupling`.
    pub n: usize,
    /// Columns of `coupling`.
    pub m: usize,
    /// Regularized cost per outer iteration, `-1` where none ran.
    pub costs: Vec<f64>,
    /// Inner convergence flag per outer iteration.
    pub linear_convergence: Vec<bool>,
    /// Inner error histories, when requested.
    pub inner_errors: Option<Vec<Vec<f64>>>,
    /// Completed outer iterations.
    pub iterations: usize,
    /// Inner Sinkhorn iterations summed over the outer loop.
    pub inner_iterations: usize,
    /// Outer criterion met and every inner solve converged.
    pub converged: bool,
    /// Regularized objective at `coupling`.
    pub reg_gw_cost: f64,
    /// Unregularized GW loss at `coupling`.
    pub gw_loss: f64,
    /// Last inner solve.
    pub linear_output: Option<SinkhornOutput>,
}

/// \(L(T)\) as a row-major `n × m` matrix.
pub fn linearized_cost<GX: Geometry, GY: Geometry>(
    problem: &QuadraticProblem<GX, GY>,
    coupling: &[f64],
) -> Vec<f64> {
    let (n, m) = problem.shape();
    let loss = problem.loss();
    let p: Vec<f64> = coupling.chunks_exact(m).map(|r| r.iter().sum()).collect();
    let tt = transpose(coupling, n, m);
    let q: Vec<f64> = tt.chunks_exact(n).map(|c| c.iter().sum()).collect();

    let rows = problem.geom_xx().apply_cost(&p, 1, |x| loss.f1(x));
    let cols = problem.geom_yy().apply_cost(&q, 1, |y| loss.f2(y));
    // h2(Cy) Tᵀ is m × n; its transpose is T h2(Cy)ᵀ.
    let right = problem.geom_yy().apply_cost(&tt, n, |y| loss.h2(y));
    let right = transpose(&right, m, n);
    let mut cross = problem.geom_xx().apply_cost(&right, m, |x| loss.h1(x));

    for (i, row) in cross.chunks_exact_mut(m).enumerate() {
        for (j, c) in row.iter_mut().enumerate() {
            *c = rows[i] + cols[j] - *c;
        }
    }
    cross
}

/// `(regularized objective, GW loss)` at `coupling`.
fn energy<GX: Geometry, GY: Geometry>(
    problem: &QuadraticProblem<GX, GY>,
    epsilon: f64,
    coupling: &[f64],
) -> (f64, f64) {
    let lin = linearized_cost(problem, coupling);
    let loss: f64 = lin.iter().zip(coupling).map(|(l, t)| l * t).sum();
    let neg_entropy: f64 = coupling
        .iter()
        .filter(|&&t| t > 0.0)
        .map(|&t| t * (t.ln() - 1.0))
        .sum();
    let mass_a: f64 = problem.a().iter().sum();
    let mass_b: f64 = problem.b().iter().sum();
    (loss + epsilon * (neg_entropy + mass_a * mass_b), loss)
}

/// \(a b^\top / m(b)\): the product coupling with row marginal `a`.
fn product_coupling(a: &[f64], b: &[f64]) -> Vec<f64> {
    let mass_b: f64 = b.iter().sum();
    a.iter()
        .flat_map(|&ai| b.iter().map(move |&bj| ai * bj / mass_b))
        .collect()
}

/// Rescale `plan` to mass `m(a)`; an empty or non-finite plan is replaced by the product
/// coupling.
fn normalize_mass(plan: &mut Vec<f64>, a: &[f64], b: &[f64]) {
    let target: f64 = a.iter().sum();
    let mass: f64 = plan.iter().sum();
    if mass > TINY_MASS && mass.is_finite() {
        let scale = target / mass;
        plan.iter_mut().for_each(|t| *t *= scale);
    } else {
        log::warn!(
            "inner plan has degenerate mass {:e}; falling back to the product coupling",
            mass
        );
        *plan = product_coupling(a, b);
    }
}

/// The GW outer loop.
#[derive(Debug, Clone, PartialEq)]
pub struct GromovWasserstein {
    config: GwConfig,
    linear: Sinkhorn,
}

impl GromovWasserstein {
    /// Validate `config` and build the engine.
    pub fn new(config: GwConfig) -> Result<Self> {
        config.validate()?;
        let linear = Sinkhorn::new(config.linear.clone())?;
        Ok(Self { config, linear })
    }

    /// The engine configuration.
    pub fn config(&self) -> &GwConfig {
        &self.config
    }

    /// Product coupling, no costs recorded.
    pub fn init_state<GX: Geometry, GY: Geometry>(
        &self,
        problem: &QuadraticProblem<GX, GY>,
    ) -> GwState {
        let t = self.config.max_iterations;
        GwState {
            coupling: product_coupling(problem.a(), problem.b()),
            costs: vec![UNSET; t],
            linear_convergence: vec![false; t],
            inner_errors: self.config.store_inner_errors.then(Vec::new),
            inner_iterations: 0,
            iteration: 0,
            converged: false,
            last_error: None,
            potentials: None,
            linear_output: None,
        }
    }

    /// One outer iteration: linearize, solve, update the coupling, record the cost.
    ///
    /// Fails only if the linearized cost is not finite.
    pub fn step<GX: Geometry, GY: Geometry>(
        &self,
        problem: &QuadraticProblem<GX, GY>,
        state: &mut GwState,
    ) -> Result<()> {
        let c = &self.config;
        let (n, m) = problem.shape();
        let t = state.iteration;

        let geom = DenseCost::new(linearized_cost(problem, &state.coupling), n, m)?;
        let lin = LinearProblem::new(
            geom,
            Some(problem.a().to_vec()),
            Some(problem.b().to_vec()),
            c.epsilon,
        )?;
        let out = match state.potentials.take() {
            Some(init) if c.warm_start => self.linear.solve_from(&lin, init, &mut NoProgress)?,
            _ => self.linear.solve(&lin),
        };

        let mut plan = out.plan.clone();
        normalize_mass(&mut plan, problem.a(), problem.b());
        let (cost, coupling) = match c.update {
            CouplingUpdate::Direct => (energy(problem, c.epsilon, &plan).0, plan),
            CouplingUpdate::LineSearch { steps } => {
                let mut best = (energy(problem, c.epsilon, &state.coupling).0, state.coupling.clone());
                for s in 1..=steps {
                    let alpha = s as f64 / steps as f64;
                    let cand: Vec<f64> = state
                        .coupling
                        .iter()
                        .zip(&plan)
                        .map(|(x, y)| (1.0 - alpha) * x + alpha * y)
                        .collect();
                    let e = energy(problem, c.epsilon, &cand).0;
                    if e < best.0 {
                        best = (e, cand);
                    }
                }
                best
            }
        };

        state.coupling = coupling;
        state.costs[t] = cost;
        state.linear_convergence[t] = out.converged;
        state.inner_iterations += out.iterations;
        if let Some(errs) = state.inner_errors.as_mut() {
            errs.push(out.errors.clone());
        }
        if c.warm_start {
            state.potentials = Some(out.potentials());
        }
        state.iteration = t + 1;

        if t > 0 {
            let err = relative_change(state.costs[t - 1], cost);
            state.last_error = Some(err);
            state.converged = state.iteration >= c.min_iterations && err < c.threshold;
        }
        log::trace!(
            "gromov iteration {}: cost={:.6e} inner_converged={} inner_iterations={}",
            state.iteration,
            cost,
            out.converged,
            out.iterations
        );
        if !out.converged {
            log::debug!("inner sinkhorn did not converge at outer iteration {}", state.iteration);
        }
        state.linear_output = Some(out);
        Ok(())
    }

    /// Solve without progress reporting.
    pub fn solve<GX: Geometry, GY: Geometry>(
        &self,
        problem: &QuadraticProblem<GX, GY>,
    ) -> Result<GwOutput> {
        self.solve_with(problem, &mut NoProgress)
    }

    /// Solve, reporting to `observer` after every outer iteration.
    pub fn solve_with<GX: Geometry, GY: Geometry, O: ProgressObserver>(
        &self,
        problem: &QuadraticProblem<GX, GY>,
        observer: &mut O,
    ) -> Result<GwOutput> {
        let mut state = self.init_state(problem);
        let total = self.config.max_iterations;
        while state.iteration < total && !state.converged {
            self.step(problem, &mut state)?;
            observer.observe(
                state.iteration,
                1,
                total,
                Snapshot::GromovWasserstein(&state),
            );
        }
        Ok(self.output(problem, state))
    }

    /// Freeze a state into its output.
    pub fn output<GX: Geometry, GY: Geometry>(
        &self,
        problem: &QuadraticProblem<GX, GY>,
        state: GwState,
    ) -> GwOutput {
        let (n, m) = problem.shape();
        let (reg_gw_cost, gw_loss) = energy(problem, self.config.epsilon, &state.coupling);
        let ran = &state.linear_convergence[..state.iteration];
        let converged = state.converged && ran.iter().all(|&c| c);
        log::debug!(
            "gromov {}x{} finished: iterations={} inner_iterations={} cost={:.6e} converged={}",
            n,
            m,
            state.iteration,
            state.inner_iterations,
            reg_gw_cost,
            converged
        );
        GwOutput {
            coupling: state.coupling,
            n,
            m,
            costs: state.costs,
            linear_convergence: state.linear_convergence,
            inner_errors: state.inner_errors,
            iterations: state.iteration,
            inner_iterations: state.inner_iterations,
            converged,
            reg_gw_cost,
            gw_loss,
            linear_output: state.linear_output,
        }
    }
}

/// Functional form: validate `config` and solve `problem`.
pub fn gromov_wasserstein<GX: Geometry, GY: Geometry>(
    problem: &QuadraticProblem<GX, GY>,
    config: &GwConfig,
) -> Result<GwOutput> {
    GromovWasserstein::new(config.clone())?.solve(problem)
}
