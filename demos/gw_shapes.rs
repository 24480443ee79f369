//! Match two shapes that live in different spaces with Gromov-Wasserstein.
//!
//! A 2D ring and a rotated, translated copy embedded in 3D only share their intra-domain
//! distances. GW recovers the correspondence; we report how often the coupling's argmax
//! lands on the true partner.

use entot::{
    gromov_wasserstein, CouplingUpdate, GromovWasserstein, GwConfig, LogProgress, PointCloud,
    QuadraticProblem, SinkhornConfig,
};

fn ring(n: usize) -> Vec<f64> {
    (0..n)
        .flat_map(|i| {
            let t = i as f64 / n as f64 * std::f64::consts::TAU;
            // Uneven radius breaks the rotational symmetry.
            let r = 1.0 + 0.3 * (2.0 * t).cos() + 0.1 * t;
            [r * t.cos(), r * t.sin()]
        })
        .collect()
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let n = 40;
    let x = ring(n);
    let (s, c) = 0.7f64.sin_cos();
    let y: Vec<f64> = x
        .chunks_exact(2)
        .flat_map(|p| [c * p[0] - s * p[1] + 3.0, s * p[0] + c * p[1], 1.5])
        .collect();

    let problem = QuadraticProblem::new(
        PointCloud::intra(x, 2)?,
        PointCloud::intra(y, 3)?,
        None,
        None,
    )?;
    let config = GwConfig {
        epsilon: 5e-3,
        update: CouplingUpdate::LineSearch { steps: 10 },
        linear: SinkhornConfig {
            max_iterations: 5000,
            ..Default::default()
        },
        ..Default::default()
    };

    let out = GromovWasserstein::new(config.clone())?.solve_with(&problem, &mut LogProgress)?;
    let hits = out
        .coupling
        .chunks_exact(out.m)
        .enumerate()
        .filter(|(i, row)| {
            let best = row
                .iter()
                .enumerate()
                .max_by(|a, b| a.1.total_cmp(b.1))
                .map(|(j, _)| j);
            best == Some(*i)
        })
        .count();
    println!(
        "outer iterations={} inner iterations={} converged={} gw loss={:.3e}",
        out.iterations, out.inner_iterations, out.converged, out.gw_loss
    );
    println!("argmax matches: {}/{}", hits, n);

    let direct = gromov_wasserstein(
        &problem,
        &GwConfig {
            update: CouplingUpdate::Direct,
            ..config
        },
    )?;
    println!("direct update gw loss={:.3e}", direct.gw_loss);
    Ok(())
}
