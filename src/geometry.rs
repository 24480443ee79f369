//! Cost accessors consumed by the solvers.
//!
//! The engines never build cost matrices themselves; they only need
//! (a) entrywise access to \(C_{ij}\) and (b) a few reductions over it:
//! \[
//! \operatorname{lse}^{\text{row}}_i(g) = \varepsilon \log \sum_j \exp\left(\frac{g_j - C_{ij}}{\varepsilon}\right),
//! \qquad
//! (h \circ C)\,X .
//! \]
//! [`Geometry`] provides those as default methods on top of [`Geometry::cost`], so a
//! matrix-free geometry ([`PointCloud`]) and a materialized one ([`DenseCost`]) plug in
//! the same way. Matrices are row-major flat slices throughout.

use crate::{Error, Result};

/// Numerically stable \(\log \sum_i \exp(x_i)\) for an indexable family.
///
/// Subtracts the max before exponentiating. Returns `-∞` for an empty family or when
/// every term is `-∞` (an all-zero row of the coupling).
#[inline]
pub fn logsumexp_by(len: usize, mut f: impl FnMut(usize) -> f64) -> f64 {
    let mut max_val = f64::NEG_INFINITY;
    for i in 0..len {
        max_val = max_val.max(f(i));
    }
    if !max_val.is_finite() {
        return max_val;
    }
    let mut sum_exp = 0.0;
    for i in 0..len {
        sum_exp += (f(i) - max_val).exp();
    }
    max_val + sum_exp.ln()
}

/// A cost (or kernel) operator between `n` source and `m` target points.
pub trait Geometry {
    /// `(n, m)`.
    fn shape(&self) -> (usize, usize);

    /// Cost \(C_{ij}\). Must be finite for `i < n`, `j < m`.
    fn cost(&self, i: usize, j: usize) -> f64;

    /// `out[i] = ε · lse_j((g_j - C_ij) / ε)`.
    fn lse_rows(&self, g: &[f64], eps: f64, out: &mut [f64]) {
        let (n, m) = self.shape();
        for (i, o) in out.iter_mut().enumerate().take(n) {
            *o = eps * logsumexp_by(m, |j| (g[j] - self.cost(i, j)) / eps);
        }
    }

    /// `out[j] = ε · lse_i((f_i - C_ij) / ε)`.
    fn lse_cols(&self, f: &[f64], eps: f64, out: &mut [f64]) {
        let (n, m) = self.shape();
        for (j, o) in out.iter_mut().enumerate().take(m) {
            *o = eps * logsumexp_by(n, |i| (f[i] - self.cost(i, j)) / eps);
        }
    }

    /// `(h ∘ C) X` where `X` is `m × k`; returns `n × k`.
    fn apply_cost<H: Fn(f64) -> f64>(&self, x: &[f64], k: usize, h: H) -> Vec<f64> {
        let (n, m) = self.shape();
        let mut out = vec![0.0; n * k];
        for i in 0..n {
            let row = &mut out[i * k..(i + 1) * k];
            for j in 0..m {
                let c = h(self.cost(i, j));
                let xj = &x[j * k..(j + 1) * k];
                for (o, &v) in row.iter_mut().zip(xj) {
                    *o += c * v;
                }
            }
        }
        out
    }

    /// `(h ∘ C)ᵀ X` where `X` is `n × k`; returns `m × k`.
    fn apply_cost_transpose<H: Fn(f64) -> f64>(&self, x: &[f64], k: usize, h: H) -> Vec<f64> {
        let (n, m) = self.shape();
        let mut out = vec![0.0; m * k];
        for i in 0..n {
            let xi = &x[i * k..(i + 1) * k];
            for j in 0..m {
                let c = h(self.cost(i, j));
                let row = &mut out[j * k..(j + 1) * k];
                for (o, &v) in row.iter_mut().zip(xi) {
                    *o += c * v;
                }
            }
        }
        out
    }

    /// Materialize the cost as a row-major `n × m` matrix.
    fn to_dense(&self) -> Vec<f64> {
        let (n, m) = self.shape();
        let mut out = Vec::with_capacity(n * m);
        for i in 0..n {
            for j in 0..m {
                out.push(self.cost(i, j));
            }
        }
        out
    }
}

impl<G: Geometry + ?Sized> Geometry for &G {
    fn shape(&self) -> (usize, usize) {
        (**self).shape()
    }
    fn cost(&self, i: usize, j: usize) -> f64 {
        (**self).cost(i, j)
    }
    fn lse_rows(&self, g: &[f64], eps: f64, out: &mut [f64]) {
        (**self).lse_rows(g, eps, out)
    }
    fn lse_cols(&self, f: &[f64], eps: f64, out: &mut [f64]) {
        (**self).lse_cols(f, eps, out)
    }
}

/// A materialized row-major cost matrix.
#[derive(Debug, Clone, PartialEq)]
pub struct DenseCost {
    cost: Vec<f64>,
    n: usize,
    m: usize,
}

impl DenseCost {
    /// Wrap `cost` (length `n * m`, `cost[i*m + j] = C_ij`).
    pub fn new(cost: Vec<f64>, n: usize, m: usize) -> Result<Self> {
        if n == 0 || m == 0 {
            return Err(Error::EmptyInput);
        }
        if cost.len() != n * m {
            return Err(Error::InvalidCostShape {
                len: cost.len(),
                n,
                m,
                expected: n * m,
            });
        }
        if let Some(k) = cost.iter().position(|c| !c.is_finite()) {
            return Err(Error::NonFiniteCost { i: k / m, j: k % m });
        }
        Ok(Self { cost, n, m })
    }

    /// Evaluate `cost(i, j)` on the full `n × m` grid.
    pub fn from_fn(n: usize, m: usize, cost: impl Fn(usize, usize) -> f64) -> Result<Self> {
        let mut data = Vec::with_capacity(n * m);
        for i in 0..n {
            for j in 0..m {
                data.push(cost(i, j));
            }
        }
        Self::new(data, n, m)
    }

    /// Row-major view of the matrix.
    pub fn as_slice(&self) -> &[f64] {
        &self.cost
    }

    /// Largest entry, useful for picking a relative ε.
    pub fn max_cost(&self) -> f64 {
        self.cost.iter().copied().fold(f64::NEG_INFINITY, f64::max)
    }
}

impl Geometry for DenseCost {
    fn shape(&self) -> (usize, usize) {
        (self.n, self.m)
    }

    #[inline]
    fn cost(&self, i: usize, j: usize) -> f64 {
        self.cost[i * self.m + j]
    }

    fn lse_rows(&self, g: &[f64], eps: f64, out: &mut [f64]) {
        for (o, row) in out.iter_mut().zip(self.cost.chunks_exact(self.m)) {
            *o = eps * logsumexp_by(self.m, |j| (g[j] - row[j]) / eps);
        }
    }

    fn to_dense(&self) -> Vec<f64> {
        self.cost.clone()
    }
}

/// Matrix-free squared-Euclidean cost between two point clouds.
///
/// Points are stored row-major: `x[i*dim + d]`. Nothing of size `n × m` is allocated;
/// every cost entry is recomputed on demand.
#[derive(Debug, Clone, PartialEq)]
pub struct PointCloud {
    x: Vec<f64>,
    y: Vec<f64>,
    dim: usize,
    n: usize,
    m: usize,
}

impl PointCloud {
    /// Cost between `x` (`n × dim`) and `y` (`m × dim`).
    pub fn new(x: Vec<f64>, y: Vec<f64>, dim: usize) -> Result<Self> {
        if dim == 0 || x.is_empty() || y.is_empty() {
            return Err(Error::EmptyInput);
        }
        for (what, pts) in [("x", &x), ("y", &y)] {
            if pts.len() % dim != 0 {
                return Err(Error::LengthMismatch {
                    what,
                    len: pts.len(),
                    expected: (pts.len() / dim + 1) * dim,
                });
            }
        }
        for (name, pts) in [("x", &x), ("y", &y)] {
            if let Some(&value) = pts.iter().find(|v| !v.is_finite()) {
                return Err(Error::InvalidParameter { name, value });
            }
        }
        let n = x.len() / dim;
        let m = y.len() / dim;
        Ok(Self { x, y, dim, n, m })
    }

    /// Intra-domain cost of a single cloud (`n × n`), as used by Gromov-Wasserstein.
    pub fn intra(x: Vec<f64>, dim: usize) -> Result<Self> {
        Self::new(x.clone(), x, dim)
    }

    /// Point dimension.
    pub fn dim(&self) -> usize {
        self.dim
    }
}

impl Geometry for PointCloud {
    fn shape(&self) -> (usize, usize) {
        (self.n, self.m)
    }

    #[inline]
    fn cost(&self, i: usize, j: usize) -> f64 {
        let xi = &self.x[i * self.dim..(i + 1) * self.dim];
        let yj = &self.y[j * self.dim..(j + 1) * self.dim];
        xi.iter().zip(yj).map(|(a, b)| (a - b) * (a - b)).sum()
    }
}

/// Transpose a row-major `rows × cols` matrix.
pub(crate) fn transpose(x: &[f64], rows: usize, cols: usize) -> Vec<f64> {
    let mut out = vec![0.0; rows * cols];
    for i in 0..rows {
        for j in 0..cols {
            out[j * rows + i] = x[i * cols + j];
        }
    }
    out
}
