//! Watch a Sinkhorn solve converge, then compare against its low-rank counterpart.
//!
//! Two noisy spirals in 2D, uniform marginals, squared-Euclidean cost computed on the fly.
//! Progress goes through `log`, so run with `RUST_LOG=info`:
//!
//! ```text
//! RUST_LOG=info cargo run --example sinkhorn_progress
//! ```

use entot::{
    low_rank_sinkhorn, Anderson, LinearProblem, LogProgress, LowRankConfig, PointCloud,
    Sinkhorn, SinkhornConfig,
};

fn spiral(n: usize, turn: f64) -> Vec<f64> {
    (0..n)
        .flat_map(|i| {
            let t = i as f64 / n as f64 * 4.0;
            let r = 0.2 + 0.8 * t / 4.0;
            [r * (t + turn).cos(), r * (t + turn).sin()]
        })
        .collect()
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let geom = PointCloud::new(spiral(120, 0.0), spiral(90, 0.6), 2)?;
    let problem = LinearProblem::new(geom, None, None, 0.01)?;

    let plain = Sinkhorn::new(SinkhornConfig {
        threshold: 1e-6,
        inner_iterations: 50,
        ..Default::default()
    })?;
    let out = plain.solve_with(&problem, &mut LogProgress);
    println!(
        "sinkhorn:          iterations={:5} converged={} cost={:.6}",
        out.iterations, out.converged, out.transport_cost
    );

    let accelerated = Sinkhorn::new(SinkhornConfig {
        threshold: 1e-6,
        inner_iterations: 50,
        anderson: Some(Anderson::default()),
        ..Default::default()
    })?;
    let fast = accelerated.solve(&problem);
    println!(
        "sinkhorn+anderson: iterations={:5} converged={} cost={:.6}",
        fast.iterations, fast.converged, fast.transport_cost
    );

    for rank in [2, 5, 10] {
        let lr = low_rank_sinkhorn(
            &problem,
            &LowRankConfig {
                rank,
                ..Default::default()
            },
        )?;
        println!(
            "low rank r={:<3}     iterations={:5} converged={} cost={:.6}",
            rank, lr.iterations, lr.converged, lr.transport_cost
        );
    }
    Ok(())
}
