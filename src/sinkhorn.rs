//! Full-rank Sinkhorn in the log domain.
//!
//! Alternating Bregman projections on the dual potentials:
//! \[
//! f_i \leftarrow \varepsilon \log a_i - \varepsilon \log \sum_j e^{(g_j - C_{ij})/\varepsilon},
//! \qquad
//! g_j \leftarrow \varepsilon \log b_j - \varepsilon \log \sum_i e^{(f_i - C_{ij})/\varepsilon},
//! \]
//! with coupling \(P_{ij} = e^{(f_i + g_j - C_{ij})/\varepsilon}\). Every reduction is a
//! max-shifted log-sum-exp, so no kernel entry is ever exponentiated unshifted.
//!
//! The error is the L1 marginal residual \(\lVert P\mathbf 1 - a\rVert_1 + \lVert P^\top\mathbf 1 - b\rVert_1\)
//! evaluated every `inner_iterations` iterations. After the `g` update the column
//! residual of a balanced problem is zero up to rounding, so this is the row residual.
//!
//! [`Sinkhorn::step`] always computes the candidate update and masks the commit once the
//! state is frozen; a converged state is a fixed point of `step`, bit for bit.

use crate::acceleration::{over_relax, Anderson, AndersonWindow, Momentum};
use crate::convergence::{commit, ConvergenceTracker};
use crate::geometry::Geometry;
use crate::problem::LinearProblem;
use crate::progress::{NoProgress, ProgressObserver, Snapshot};
use crate::{check_nonzero, check_positive, Error, Result};

/// Sinkhorn engine configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct SinkhornConfig {
    /// Convergence threshold on the marginal error.
    pub threshold: f64,
    /// Iteration budget (one iteration = one `f` and one `g` update).
    pub max_iterations: usize,
    /// Convergence is not declared before this many iterations.
    pub min_iterations: usize,
    /// Error check / progress cadence.
    pub inner_iterations: usize,
    /// Optional over-relaxation.
    pub momentum: Option<Momentum>,
    /// Optional Anderson mixing. Mutually exclusive with `momentum`.
    pub anderson: Option<Anderson>,
    /// Stop iterating once frozen. `false` runs the full budget with masked updates;
    /// the output is identical either way.
    pub early_exit: bool,
}

impl Default for SinkhornConfig {
    fn default() -> Self {
        Self {
            threshold: 1e-3,
            max_iterations: 2000,
            min_iterations: 0,
            inner_iterations: 10,
            momentum: None,
            anderson: None,
            early_exit: true,
        }
    }
}

impl SinkhornConfig {
    /// Check ranges and exclusivity.
    pub fn validate(&self) -> Result<()> {
        check_positive("threshold", self.threshold)?;
        check_nonzero("max_iterations", self.max_iterations)?;
        check_nonzero("inner_iterations", self.inner_iterations)?;
        if self.momentum.is_some() && self.anderson.is_some() {
            return Err(Error::ConflictingAcceleration);
        }
        if let Some(m) = &self.momentum {
            m.validate()?;
        }
        if let Some(a) = &self.anderson {
            a.validate()?;
        }
        Ok(())
    }
}

/// Initial dual potentials for a warm start.
#[derive(Debug, Clone, PartialEq)]
pub struct Potentials {
    /// Source potential, length `n`.
    pub f: Vec<f64>,
    /// Target potential, length `m`.
    pub g: Vec<f64>,
}

/// Mutable iteration state, exclusively owned by one solve.
#[derive(Debug, Clone, PartialEq)]
pub struct SinkhornState {
    f: Vec<f64>,
    g: Vec<f64>,
    iteration: usize,
    tracker: ConvergenceTracker,
    anderson: Option<AndersonWindow>,
}

impl SinkhornState {
    /// Source potential.
    pub fn f(&self) -> &[f64] {
        &self.f
    }

    /// Target potential.
    pub fn g(&self) -> &[f64] {
        &self.g
    }

    /// Completed iterations.
    pub fn iteration(&self) -> usize {
        self.iteration
    }

    /// Error history and flags.
    pub fn tracker(&self) -> &ConvergenceTracker {
        &self.tracker
    }

    /// Error fell below the threshold.
    pub fn converged(&self) -> bool {
        self.tracker.converged()
    }

    /// A non-finite error was observed.
    pub fn diverged(&self) -> bool {
        self.tracker.diverged()
    }
}

/// Result of a Sinkhorn solve. Always fully populated, converged or not.
#[derive(Debug, Clone, PartialEq)]
pub struct SinkhornOutput {
    /// Source potential.
    pub f: Vec<f64>,
    /// Target potential.
    pub g: Vec<f64>,
    /// Row-major `n × m` coupling.
    pub plan: Vec<f64>,
    /// Rows of `plan`.
    pub n: usize,
    /// Columns of `plan`.
    pub m: usize,
    /// Error per checkpoint, `-1` where no checkpoint ran.
    pub errors: Vec<f64>,
    /// Last computed error.
    pub error: f64,
    /// Completed iterations.
    pub iterations: usize,
    /// Error fell below the threshold.
    pub converged: bool,
    /// A non-finite error was observed.
    pub diverged: bool,
    /// \(\langle C, P\rangle\).
    pub transport_cost: f64,
    /// Regularized (dual) objective.
    pub reg_ot_cost: f64,
}

impl SinkhornOutput {
    /// Row-major coupling.
    pub fn matrix(&self) -> &[f64] {
        &self.plan
    }

    /// `P 1`.
    pub fn row_marginal(&self) -> Vec<f64> {
        self.plan.chunks_exact(self.m).map(|r| r.iter().sum()).collect()
    }

    /// `Pᵀ 1`.
    pub fn col_marginal(&self) -> Vec<f64> {
        let mut col = vec![0.0; self.m];
        for row in self.plan.chunks_exact(self.m) {
            for (c, p) in col.iter_mut().zip(row) {
                *c += p;
            }
        }
        col
    }

    /// Potentials, for warm-starting a related solve.
    pub fn potentials(&self) -> Potentials {
        Potentials {
            f: self.f.clone(),
            g: self.g.clone(),
        }
    }
}

/// The full-rank Sinkhorn engine.
#[derive(Debug, Clone, PartialEq)]
pub struct Sinkhorn {
    config: SinkhornConfig,
}

impl Sinkhorn {
    /// Validate `config` and build the engine.
    pub fn new(config: SinkhornConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    /// The engine configuration.
    pub fn config(&self) -> &SinkhornConfig {
        &self.config
    }

    /// Zero potentials at iteration 0.
    pub fn init_state<G: Geometry>(&self, problem: &LinearProblem<G>) -> SinkhornState {
        let (n, m) = problem.shape();
        self.state_from(vec![0.0; n], vec![0.0; m])
    }

    /// Warm-started potentials at iteration 0.
    pub fn init_state_from<G: Geometry>(
        &self,
        problem: &LinearProblem<G>,
        init: Potentials,
    ) -> Result<SinkhornState> {
        let (n, m) = problem.shape();
        for (what, len, expected) in [("f", init.f.len(), n), ("g", init.g.len(), m)] {
            if len != expected {
                return Err(Error::LengthMismatch {
                    what,
                    len,
                    expected,
                });
            }
        }
        Ok(self.state_from(init.f, init.g))
    }

    fn state_from(&self, f: Vec<f64>, g: Vec<f64>) -> SinkhornState {
        let c = &self.config;
        SinkhornState {
            f,
            g,
            iteration: 0,
            tracker: ConvergenceTracker::new(
                c.threshold,
                c.inner_iterations,
                c.min_iterations,
                c.max_iterations,
            ),
            anderson: c.anderson.map(|_| AndersonWindow::default()),
        }
    }

    /// One iteration: `f` update, `g` update, optional acceleration, masked commit,
    /// then the checkpoint (error + progress) if one falls on this iteration.
    pub fn step<G: Geometry, O: ProgressObserver>(
        &self,
        problem: &LinearProblem<G>,
        state: &mut SinkhornState,
        observer: &mut O,
    ) {
        let c = &self.config;
        let frozen = state.tracker.is_frozen() || state.iteration >= c.max_iterations;
        let (n, m) = problem.shape();

        let w = c
            .momentum
            .map_or(1.0, |mo| mo.factor(state.iteration, &state.tracker));
        let mut f = vec![0.0; n];
        let mut g = vec![0.0; m];
        problem.update_f(&state.g, &mut f);
        over_relax(w, &state.f, &mut f);
        problem.update_g(&f, &mut g);
        over_relax(w, &state.g, &mut g);

        if let (Some(cfg), Some(window)) = (c.anderson.as_ref(), state.anderson.as_mut()) {
            if !frozen {
                window.push(cfg, &state.g, &g);
                match window.extrapolate(cfg) {
                    Some(mixed) => g = mixed,
                    None if window.len() > 1 => {
                        log::trace!("anderson fallback at iteration {}", state.iteration)
                    }
                    None => {}
                }
            }
        }

        commit(frozen, &mut state.f, &f);
        commit(frozen, &mut state.g, &g);
        if frozen {
            return;
        }
        state.iteration += 1;

        let completed = state.iteration;
        if state.tracker.is_checkpoint(completed) {
            let err = problem.marginal_error(&state.f, &state.g);
            state.tracker.record(completed, err);
            observer.observe(
                completed,
                c.inner_iterations,
                c.max_iterations,
                Snapshot::Sinkhorn(&*state),
            );
        }
    }

    /// Drive `state` through the iteration budget.
    pub fn run<G: Geometry, O: ProgressObserver>(
        &self,
        problem: &LinearProblem<G>,
        state: &mut SinkhornState,
        observer: &mut O,
    ) {
        for _ in 0..self.config.max_iterations {
            if self.config.early_exit && state.tracker.is_frozen() {
                break;
            }
            self.step(problem, state, observer);
        }
    }

    /// Solve from zero potentials without progress reporting.
    pub fn solve<G: Geometry>(&self, problem: &LinearProblem<G>) -> SinkhornOutput {
        self.solve_with(problem, &mut NoProgress)
    }

    /// Solve from zero potentials, reporting to `observer`.
    pub fn solve_with<G: Geometry, O: ProgressObserver>(
        &self,
        problem: &LinearProblem<G>,
        observer: &mut O,
    ) -> SinkhornOutput {
        let mut state = self.init_state(problem);
        self.run(problem, &mut state, observer);
        Self::output(problem, state)
    }

    /// Solve from the given potentials, reporting to `observer`.
    pub fn solve_from<G: Geometry, O: ProgressObserver>(
        &self,
        problem: &LinearProblem<G>,
        init: Potentials,
        observer: &mut O,
    ) -> Result<SinkhornOutput> {
        let mut state = self.init_state_from(problem, init)?;
        self.run(problem, &mut state, observer);
        Ok(Self::output(problem, state))
    }

    /// Freeze a state into its output.
    pub fn output<G: Geometry>(problem: &LinearProblem<G>, state: SinkhornState) -> SinkhornOutput {
        let (n, m) = problem.shape();
        let plan = problem.transport_matrix(&state.f, &state.g);
        let plan_mass: f64 = plan.iter().sum();
        let geom = problem.geom();
        let transport_cost = plan
            .iter()
            .enumerate()
            .map(|(k, p)| p * geom.cost(k / m, k % m))
            .sum();
        let reg_ot_cost = problem.reg_ot_cost(&state.f, &state.g, plan_mass);
        let error = state.tracker.last_error().unwrap_or(f64::INFINITY);
        log::debug!(
            "sinkhorn {}x{} finished: iterations={} error={:.3e} converged={}",
            n,
            m,
            state.iteration,
            error,
            state.tracker.converged()
        );
        SinkhornOutput {
            plan,
            n,
            m,
            errors: state.tracker.errors().to_vec(),
            error,
            iterations: state.iteration,
            converged: state.tracker.converged(),
            diverged: state.tracker.diverged(),
            transport_cost,
            reg_ot_cost,
            f: state.f,
            g: state.g,
        }
    }
}

/// Functional form: validate `config` and solve `problem` from zero potentials.
pub fn sinkhorn<G: Geometry>(
    problem: &LinearProblem<G>,
    config: &SinkhornConfig,
) -> Result<SinkhornOutput> {
    Ok(Sinkhorn::new(config.clone())?.solve(problem))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::{DenseCost, PointCloud};
    use ndarray::{Array1, Array2};
    use proptest::prelude::*;

    fn cloud(n: usize, phase: f64) -> Vec<f64> {
        (0..n)
            .flat_map(|i| {
                let t = i as f64 + phase;
                [0.5 + 0.5 * (0.9 * t).sin(), 0.5 + 0.5 * (1.7 * t).cos()]
            })
            .collect()
    }

    fn scenario(eps: f64) -> LinearProblem<PointCloud> {
        let geom = PointCloud::new(cloud(7, 0.0), cloud(11, 0.35), 2).unwrap();
        LinearProblem::new(geom, None, None, eps).unwrap()
    }

    /// Plain kernel scaling `u = a / K v`, `v = b / Kᵀ u`.
    fn reference_plan<G: Geometry>(p: &LinearProblem<G>, iters: usize) -> Array2<f64> {
        let (n, m) = p.shape();
        let cost = Array2::from_shape_vec((n, m), p.geom().to_dense()).unwrap();
        let k = cost.mapv(|c| (-c / p.epsilon()).exp());
        let a = Array1::from_vec(p.a().to_vec());
        let b = Array1::from_vec(p.b().to_vec());
        let mut u = Array1::<f64>::ones(n);
        let mut v = Array1::<f64>::ones(m);
        for _ in 0..iters {
            u = &a / &k.dot(&v);
            v = &b / &k.t().dot(&u);
        }
        let mut plan = k;
        for ((i, j), x) in plan.indexed_iter_mut() {
            *x *= u[i] * v[j];
        }
        plan
    }

    fn transport_cost<G: Geometry>(p: &LinearProblem<G>, plan: &Array2<f64>) -> f64 {
        plan.indexed_iter()
            .map(|((i, j), x)| x * p.geom().cost(i, j))
            .sum()
    }

    #[test]
    fn seven_by_eleven_point_clouds_converge_within_ten_iterations() {
        let p = scenario(2.0);
        let cfg = SinkhornConfig {
            threshold: 1e-3,
            max_iterations: 10,
            inner_iterations: 1,
            ..Default::default()
        };
        let out = sinkhorn(&p, &cfg).unwrap();
        assert!(out.converged, "errors={:?}", out.errors);
        assert!(out.iterations <= 10);
        assert!(out.error < 1e-3);

        let row = out.row_marginal();
        let col = out.col_marginal();
        for (r, a) in row.iter().zip(p.a()) {
            assert!((r - a).abs() < 1e-3);
        }
        for (c, b) in col.iter().zip(p.b()) {
            assert!((c - b).abs() < 1e-9);
        }

        let reference = transport_cost(&p, &reference_plan(&p, 2000));
        assert!(
            (out.transport_cost - reference).abs() < 5e-3,
            "cost={} reference={}",
            out.transport_cost,
            reference
        );
    }

    #[test]
    fn tight_solve_matches_kernel_scaling_reference() {
        let p = scenario(0.3);
        let cfg = SinkhornConfig {
            threshold: 1e-10,
            max_iterations: 5000,
            ..Default::default()
        };
        let out = sinkhorn(&p, &cfg).unwrap();
        assert!(out.converged);
        let reference = reference_plan(&p, 5000);
        for (x, y) in out.plan.iter().zip(reference.iter()) {
            assert!((x - y).abs() < 1e-8, "{} vs {}", x, y);
        }
    }

    #[test]
    fn dual_cost_matches_primal_at_convergence() {
        let p = scenario(0.5);
        let cfg = SinkhornConfig {
            threshold: 1e-10,
            max_iterations: 5000,
            ..Default::default()
        };
        let out = sinkhorn(&p, &cfg).unwrap();
        let eps = p.epsilon();
        let entropy_term: f64 = out.plan.iter().map(|&x| x * (x.ln() - 1.0)).sum();
        let primal = out.transport_cost + eps * entropy_term + eps;
        assert!(
            (out.reg_ot_cost - primal).abs() < 1e-8,
            "dual={} primal={}",
            out.reg_ot_cost,
            primal
        );
    }

    #[test]
    fn converged_state_is_a_fixed_point_of_step() {
        let p = scenario(1.0);
        let engine = Sinkhorn::new(SinkhornConfig {
            inner_iterations: 1,
            ..Default::default()
        })
        .unwrap();
        let mut state = engine.init_state(&p);
        engine.run(&p, &mut state, &mut NoProgress);
        assert!(state.converged());

        let before = state.clone();
        engine.step(&p, &mut state, &mut NoProgress);
        assert_eq!(state.f(), before.f());
        assert_eq!(state.g(), before.g());
        assert_eq!(state.iteration(), before.iteration());
        assert_eq!(state.tracker(), before.tracker());
    }

    #[test]
    fn masked_fixed_trip_matches_early_exit() {
        let p = scenario(0.5);
        let base = SinkhornConfig {
            max_iterations: 300,
            inner_iterations: 5,
            ..Default::default()
        };
        let eager = sinkhorn(&p, &base).unwrap();
        let masked = sinkhorn(
            &p,
            &SinkhornConfig {
                early_exit: false,
                ..base
            },
        )
        .unwrap();
        assert!(eager.converged);
        assert_eq!(eager, masked);
    }

    #[test]
    fn callback_fires_once_per_checkpoint() {
        let p = scenario(0.05);
        let engine = Sinkhorn::new(SinkhornConfig {
            threshold: 1e-14,
            max_iterations: 25,
            inner_iterations: 4,
            ..Default::default()
        })
        .unwrap();
        let mut calls = Vec::new();
        let out = engine.solve_with(&p, &mut |it: usize, k: usize, total: usize, _s: Snapshot<'_>| {
            assert_eq!((k, total), (4, 25));
            calls.push(it);
        });
        assert!(!out.converged);
        assert_eq!(calls, vec![4, 8, 12, 16, 20, 24, 25]);
        assert!(out.errors.iter().all(|&e| e >= 0.0));
    }

    #[test]
    fn non_convergence_is_a_result_not_an_error() {
        let p = scenario(0.01);
        let out = sinkhorn(
            &p,
            &SinkhornConfig {
                max_iterations: 3,
                inner_iterations: 1,
                ..Default::default()
            },
        )
        .unwrap();
        assert!(!out.converged);
        assert!(!out.diverged);
        assert_eq!(out.iterations, 3);
        assert!(out.error.is_finite() && out.error >= 1e-3);
        assert_eq!(out.plan.len(), 7 * 11);
        assert!(out.reg_ot_cost.is_finite());
    }

    #[test]
    fn momentum_and_anderson_reach_the_same_coupling() {
        let p = scenario(0.3);
        let base = SinkhornConfig {
            threshold: 1e-9,
            max_iterations: 5000,
            ..Default::default()
        };
        let plain = sinkhorn(&p, &base).unwrap();
        let fixed = sinkhorn(
            &p,
            &SinkhornConfig {
                momentum: Some(Momentum {
                    warmup: 10,
                    value: Some(1.3),
                    ..Default::default()
                }),
                ..base.clone()
            },
        )
        .unwrap();
        let adaptive = sinkhorn(
            &p,
            &SinkhornConfig {
                momentum: Some(Momentum::default()),
                ..base.clone()
            },
        )
        .unwrap();
        let anderson = sinkhorn(
            &p,
            &SinkhornConfig {
                anderson: Some(Anderson::default()),
                ..base
            },
        )
        .unwrap();
        for out in [&fixed, &adaptive, &anderson] {
            assert!(out.converged, "errors={:?}", out.errors);
            for (x, y) in out.plan.iter().zip(&plain.plan) {
                assert!((x - y).abs() < 1e-6);
            }
        }
    }

    #[test]
    fn warm_start_from_solution_converges_at_first_checkpoint() {
        let p = scenario(0.5);
        let engine = Sinkhorn::new(SinkhornConfig {
            threshold: 1e-6,
            ..Default::default()
        })
        .unwrap();
        let cold = engine.solve(&p);
        let warm = engine
            .solve_from(&p, cold.potentials(), &mut NoProgress)
            .unwrap();
        assert!(warm.converged);
        assert_eq!(warm.iterations, engine.config().inner_iterations);
        assert!(engine
            .solve_from(
                &p,
                Potentials {
                    f: vec![0.0; 3],
                    g: vec![0.0; 11]
                },
                &mut NoProgress
            )
            .is_err());
    }

    #[test]
    fn unbalanced_problem_converges_to_finite_cost() {
        let p = scenario(0.5).with_tau(0.8, 0.8).unwrap();
        let out = sinkhorn(
            &p,
            &SinkhornConfig {
                threshold: 1e-8,
                ..Default::default()
            },
        )
        .unwrap();
        assert!(out.converged);
        assert!(out.reg_ot_cost.is_finite());
        let mass: f64 = out.plan.iter().sum();
        assert!(mass > 0.0 && mass.is_finite());
    }

    #[test]
    fn zero_mass_marginal_is_a_configuration_error() {
        let geom = PointCloud::new(cloud(7, 0.0), cloud(11, 0.35), 2).unwrap();
        let err = LinearProblem::new(geom, None, Some(vec![0.0; 11]), 1.0).unwrap_err();
        assert_eq!(err, Error::InvalidMass { what: "b", mass: 0.0 });
    }

    #[test]
    fn config_is_validated_before_iterating() {
        let bad = |cfg: SinkhornConfig| Sinkhorn::new(cfg).is_err();
        assert!(bad(SinkhornConfig {
            inner_iterations: 0,
            ..Default::default()
        }));
        assert!(bad(SinkhornConfig {
            threshold: -1.0,
            ..Default::default()
        }));
        assert_eq!(
            Sinkhorn::new(SinkhornConfig {
                momentum: Some(Momentum::default()),
                anderson: Some(Anderson::default()),
                ..Default::default()
            })
            .unwrap_err(),
            Error::ConflictingAcceleration
        );
    }

    #[test]
    fn zero_weight_rows_stay_empty() {
        let c = DenseCost::from_fn(3, 3, |i, j| (i as f64 - j as f64).powi(2)).unwrap();
        let p = LinearProblem::new(c, Some(vec![0.5, 0.0, 0.5]), None, 0.5).unwrap();
        let out = Sinkhorn::new(SinkhornConfig::default()).unwrap().solve(&p);
        assert!(out.converged);
        assert!(out.plan[3..6].iter().all(|&x| x == 0.0));
        assert!(out.reg_ot_cost.is_finite());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]
        #[test]
        fn marginals_match_targets_within_threshold(
            a in prop::collection::vec(0.1f64..1.0, 5),
            b in prop::collection::vec(0.1f64..1.0, 6),
            eps in 0.2f64..2.0,
        ) {
            let sa: f64 = a.iter().sum();
            let sb: f64 = b.iter().sum();
            let a: Vec<f64> = a.iter().map(|x| x / sa).collect();
            let b: Vec<f64> = b.iter().map(|x| x / sb).collect();
            let geom = PointCloud::new(cloud(5, 0.1), cloud(6, 0.6), 2).unwrap();
            let p = LinearProblem::new(geom, Some(a.clone()), Some(b.clone()), eps).unwrap();
            let out = sinkhorn(&p, &SinkhornConfig::default()).unwrap();
            prop_assert!(out.converged);
            let row = out.row_marginal();
            let col = out.col_marginal();
            let dev: f64 = row.iter().zip(&a).map(|(x, y)| (x - y).abs()).sum::<f64>()
                + col.iter().zip(&b).map(|(x, y)| (x - y).abs()).sum::<f64>();
            prop_assert!(dev < 1e-3 + 1e-12, "dev={}", dev);
        }
    }
}
