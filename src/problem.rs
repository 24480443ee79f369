//! Problem definitions: what to transport, under which cost, at which regularization.
//!
//! A [`LinearProblem`] is the input of the Sinkhorn engines; a [`QuadraticProblem`] is
//! the input of the Gromov-Wasserstein outer loop. Both validate eagerly, so an engine
//! never starts iterating on malformed marginals.

use crate::convergence::l1_deviation;
use crate::geometry::Geometry;
use crate::gromov::GwLoss;
use crate::{Error, Result};

/// Validate a marginal, or build the uniform one (total mass 1) for `None`.
fn marginal(what: &'static str, weights: Option<Vec<f64>>, len: usize) -> Result<Vec<f64>> {
    let w = match weights {
        None => return Ok(vec![1.0 / len as f64; len]),
        Some(w) => w,
    };
    if w.len() != len {
        return Err(Error::LengthMismatch {
            what,
            len: w.len(),
            expected: len,
        });
    }
    if let Some((index, &value)) = w
        .iter()
        .enumerate()
        .find(|(_, v)| !v.is_finite() || **v < 0.0)
    {
        return Err(Error::InvalidWeight { what, index, value });
    }
    let mass: f64 = w.iter().sum();
    if !(mass > 0.0 && mass.is_finite()) {
        return Err(Error::InvalidMass { what, mass });
    }
    Ok(w)
}

/// Balanced transport needs `m(a) = m(b)` up to rounding.
fn check_equal_mass(a: &[f64], b: &[f64]) -> Result<()> {
    let mass_a: f64 = a.iter().sum();
    let mass_b: f64 = b.iter().sum();
    if (mass_a - mass_b).abs() > 1e-9 * mass_a.max(mass_b) {
        return Err(Error::MassMismatch {
            a: mass_a,
            b: mass_b,
        });
    }
    Ok(())
}

/// Every entry of `geom` is finite.
fn check_finite_costs<G: Geometry>(geom: &G) -> Result<()> {
    let (n, m) = geom.shape();
    for i in 0..n {
        for j in 0..m {
            if !geom.cost(i, j).is_finite() {
                return Err(Error::NonFiniteCost { i, j });
            }
        }
    }
    Ok(())
}

fn check_tau(tau: f64) -> Result<f64> {
    if tau > 0.0 && tau <= 1.0 {
        Ok(tau)
    } else {
        Err(Error::InvalidTau(tau))
    }
}

/// Entropic linear OT problem: marginals `a` (length `n`), `b` (length `m`), a cost
/// geometry and a regularization \(\varepsilon > 0\).
///
/// `tau_a`, `tau_b` relax the marginal constraints (`1.0` means hard constraint).
#[derive(Debug, Clone)]
pub struct LinearProblem<G> {
    geom: G,
    a: Vec<f64>,
    b: Vec<f64>,
    epsilon: f64,
    tau_a: f64,
    tau_b: f64,
}

impl<G: Geometry> LinearProblem<G> {
    /// Balanced problem. `None` marginals are uniform with unit mass.
    pub fn new(geom: G, a: Option<Vec<f64>>, b: Option<Vec<f64>>, epsilon: f64) -> Result<Self> {
        let (n, m) = geom.shape();
        if n == 0 || m == 0 {
            return Err(Error::EmptyInput);
        }
        if !(epsilon > 0.0 && epsilon.is_finite()) {
            return Err(Error::InvalidEpsilon(epsilon));
        }
        let a = marginal("a", a, n)?;
        let b = marginal("b", b, m)?;
        check_equal_mass(&a, &b)?;
        Ok(Self {
            geom,
            a,
            b,
            epsilon,
            tau_a: 1.0,
            tau_b: 1.0,
        })
    }

    /// Unbalanced problem: marginals may carry different masses as long as one side is
    /// relaxed (`tau < 1`).
    pub fn unbalanced(
        geom: G,
        a: Option<Vec<f64>>,
        b: Option<Vec<f64>>,
        epsilon: f64,
        tau_a: f64,
        tau_b: f64,
    ) -> Result<Self> {
        let (n, m) = geom.shape();
        if n == 0 || m == 0 {
            return Err(Error::EmptyInput);
        }
        if !(epsilon > 0.0 && epsilon.is_finite()) {
            return Err(Error::InvalidEpsilon(epsilon));
        }
        let a = marginal("a", a, n)?;
        let b = marginal("b", b, m)?;
        let tau_a = check_tau(tau_a)?;
        let tau_b = check_tau(tau_b)?;
        if tau_a == 1.0 && tau_b == 1.0 {
            check_equal_mass(&a, &b)?;
        }
        Ok(Self {
            geom,
            a,
            b,
            epsilon,
            tau_a,
            tau_b,
        })
    }

    /// Relax the marginal constraints of a balanced problem.
    pub fn with_tau(mut self, tau_a: f64, tau_b: f64) -> Result<Self> {
        self.tau_a = check_tau(tau_a)?;
        self.tau_b = check_tau(tau_b)?;
        Ok(self)
    }

    /// The cost geometry.
    pub fn geom(&self) -> &G {
        &self.geom
    }

    /// Source marginal.
    pub fn a(&self) -> &[f64] {
        &self.a
    }

    /// Target marginal.
    pub fn b(&self) -> &[f64] {
        &self.b
    }

    /// Regularization strength.
    pub fn epsilon(&self) -> f64 {
        self.epsilon
    }

    /// Source-side relaxation.
    pub fn tau_a(&self) -> f64 {
        self.tau_a
    }

    /// Target-side relaxation.
    pub fn tau_b(&self) -> f64 {
        self.tau_b
    }

    /// `(n, m)`.
    pub fn shape(&self) -> (usize, usize) {
        self.geom.shape()
    }

    /// True when both marginal constraints are hard.
    pub fn is_balanced(&self) -> bool {
        self.tau_a == 1.0 && self.tau_b == 1.0
    }

    /// `f_i = τ_a (ε log a_i − ε lse_j((g_j − C_ij)/ε))`, `-∞` where `a_i = 0`.
    pub(crate) fn update_f(&self, g: &[f64], f: &mut [f64]) {
        self.geom.lse_rows(g, self.epsilon, f);
        potential_from_lse(f, &self.a, self.epsilon, self.tau_a);
    }

    /// `g_j = τ_b (ε log b_j − ε lse_i((f_i − C_ij)/ε))`, `-∞` where `b_j = 0`.
    pub(crate) fn update_g(&self, f: &[f64], g: &mut [f64]) {
        self.geom.lse_cols(f, self.epsilon, g);
        potential_from_lse(g, &self.b, self.epsilon, self.tau_b);
    }

    /// Row and column marginals of the coupling induced by `(f, g)`, without
    /// materializing it.
    pub(crate) fn marginals(&self, f: &[f64], g: &[f64]) -> (Vec<f64>, Vec<f64>) {
        let (n, m) = self.shape();
        let eps = self.epsilon;
        let mut row = vec![0.0; n];
        let mut col = vec![0.0; m];
        self.geom.lse_rows(g, eps, &mut row);
        self.geom.lse_cols(f, eps, &mut col);
        for (r, &fi) in row.iter_mut().zip(f) {
            *r = ((fi + *r) / eps).exp();
        }
        for (c, &gj) in col.iter_mut().zip(g) {
            *c = ((gj + *c) / eps).exp();
        }
        (row, col)
    }

    /// L1 deviation of both marginals of the coupling from their targets.
    ///
    /// For a hard constraint the target is `a`; for a relaxed one it is the first-order
    /// optimality target \(a_i e^{-f_i/\rho}\).
    pub(crate) fn marginal_error(&self, f: &[f64], g: &[f64]) -> f64 {
        let (row, col) = self.marginals(f, g);
        let target = |w: &[f64], pot: &[f64], tau: f64| -> Vec<f64> {
            if tau == 1.0 {
                return w.to_vec();
            }
            let rho = self.epsilon * tau / (1.0 - tau);
            w.iter()
                .zip(pot)
                .map(|(&wi, &p)| if wi > 0.0 { wi * (-p / rho).exp() } else { 0.0 })
                .collect()
        };
        l1_deviation(&row, &target(&self.a, f, self.tau_a))
            + l1_deviation(&col, &target(&self.b, g, self.tau_b))
    }

    /// Dense coupling `P_ij = exp((f_i + g_j − C_ij)/ε)`, row-major.
    pub(crate) fn transport_matrix(&self, f: &[f64], g: &[f64]) -> Vec<f64> {
        let (n, m) = self.shape();
        let eps = self.epsilon;
        let mut p = Vec::with_capacity(n * m);
        for (i, &fi) in f.iter().enumerate() {
            for (j, &gj) in g.iter().enumerate() {
                p.push(((fi + gj - self.geom.cost(i, j)) / eps).exp());
            }
        }
        p
    }

    /// Dual regularized cost at `(f, g)` given the total mass of the induced coupling.
    ///
    /// Balanced sides contribute \(\langle a, f\rangle\); relaxed sides contribute
    /// \(-\rho\sum_i a_i(e^{-f_i/\rho} - 1)\) with \(\rho = \varepsilon\tau/(1-\tau)\).
    pub(crate) fn reg_ot_cost(&self, f: &[f64], g: &[f64], plan_mass: f64) -> f64 {
        let eps = self.epsilon;
        let side = |w: &[f64], pot: &[f64], tau: f64| -> f64 {
            let terms = w.iter().zip(pot).filter(|(wi, _)| **wi > 0.0);
            if tau == 1.0 {
                terms.map(|(wi, p)| wi * p).sum()
            } else {
                let rho = eps * tau / (1.0 - tau);
                -terms.map(|(wi, p)| wi * rho * ((-p / rho).exp() - 1.0)).sum::<f64>()
            }
        };
        let mass_a: f64 = self.a.iter().sum();
        let mass_b: f64 = self.b.iter().sum();
        side(&self.a, f, self.tau_a) + side(&self.b, g, self.tau_b)
            - eps * (plan_mass - mass_a * mass_b)
    }
}

fn potential_from_lse(out: &mut [f64], weights: &[f64], eps: f64, tau: f64) {
    for (o, &w) in out.iter_mut().zip(weights) {
        *o = if w > 0.0 {
            tau * (eps * w.ln() - *o)
        } else {
            f64::NEG_INFINITY
        };
    }
}

/// Quadratic (Gromov-Wasserstein) problem between two domains that only share
/// their intra-domain costs `C_x` (`n × n`) and `C_y` (`m × m`).
#[derive(Debug, Clone)]
pub struct QuadraticProblem<GX, GY> {
    geom_xx: GX,
    geom_yy: GY,
    a: Vec<f64>,
    b: Vec<f64>,
    loss: GwLoss,
}

impl<GX: Geometry, GY: Geometry> QuadraticProblem<GX, GY> {
    /// Squared-Euclidean loss between intra-domain costs. `None` marginals are uniform.
    pub fn new(geom_xx: GX, geom_yy: GY, a: Option<Vec<f64>>, b: Option<Vec<f64>>) -> Result<Self> {
        let (n, nx) = geom_xx.shape();
        let (m, my) = geom_yy.shape();
        if n == 0 || m == 0 {
            return Err(Error::EmptyInput);
        }
        if n != nx {
            return Err(Error::NotSquare {
                what: "xx",
                rows: n,
                cols: nx,
            });
        }
        if m != my {
            return Err(Error::NotSquare {
                what: "yy",
                rows: m,
                cols: my,
            });
        }
        check_finite_costs(&geom_xx)?;
        check_finite_costs(&geom_yy)?;
        let a = marginal("a", a, n)?;
        let b = marginal("b", b, m)?;
        check_equal_mass(&a, &b)?;
        Ok(Self {
            geom_xx,
            geom_yy,
            a,
            b,
            loss: GwLoss::SquaredEuclidean,
        })
    }

    /// Choose the pointwise loss between intra-domain costs.
    pub fn with_loss(mut self, loss: GwLoss) -> Self {
        self.loss = loss;
        self
    }

    /// Source intra-domain cost.
    pub fn geom_xx(&self) -> &GX {
        &self.geom_xx
    }

    /// Target intra-domain cost.
    pub fn geom_yy(&self) -> &GY {
        &self.geom_yy
    }

    /// Source marginal.
    pub fn a(&self) -> &[f64] {
        &self.a
    }

    /// Target marginal.
    pub fn b(&self) -> &[f64] {
        &self.b
    }

    /// Pointwise loss.
    pub fn loss(&self) -> GwLoss {
        self.loss
    }

    /// `(n, m)`: size of the coupling.
    pub fn shape(&self) -> (usize, usize) {
        (self.a.len(), self.b.len())
    }
}
