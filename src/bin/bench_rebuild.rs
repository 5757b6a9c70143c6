//! Rebuild throughput across particle counts and dimensions.
//! Run with: cargo run --release --bin bench_rebuild

use pic_index::pic::{ParticleIndex, ParticleIndexConfig};
use rand::{Rng, SeedableRng};
use std::time::Instant;

const WARMUP_STEPS: u64 = 3;

fn positions<const D: usize>(count: usize, extent: f32) -> Vec<[f32; D]> {
    let mut rng = rand::rngs::StdRng::seed_from_u64(0x5EED_1234_ABCD_EF01);
    (0..count)
        .map(|_| std::array::from_fn(|_| rng.random::<f32>() * extent))
        .collect()
}

fn bench<const D: usize>(count: usize, steps: u64) -> (f64, u32, u64) {
    let particles = positions::<D>(count, 0.5);
    let mut index = ParticleIndex::<D>::with_config(ParticleIndexConfig::default())
        .unwrap_or_else(|err| panic!("failed to build index: {err}"));
    index
        .step_n(&particles, WARMUP_STEPS)
        .unwrap_or_else(|err| panic!("warmup failed: {err}"));

    let start = Instant::now();
    index
        .step_n(&particles, steps)
        .unwrap_or_else(|err| panic!("rebuild failed: {err}"));
    let total_ms = start.elapsed().as_secs_f64() * 1000.0;
    let stats = index.stats();
    (total_ms, stats.active_leaves, stats.total_backed())
}

fn main() {
    env_logger::init();
    let scales: &[(usize, usize, u64)] = &[
        (2, 10_000, 500),
        (2, 100_000, 200),
        (2, 1_000_000, 50),
        (3, 100_000, 200),
        (3, 1_000_000, 50),
    ];

    println!(
        "{:<6} {:>10} {:>8} {:>10} {:>12} {:>10} {:>10}",
        "Dim", "Particles", "Steps", "Leaves", "Total(ms)", "Avg(ms)", "Chunks"
    );
    println!("{}", "-".repeat(72));

    for &(dim, count, steps) in scales {
        let (total_ms, leaves, chunks) = match dim {
            3 => bench::<3>(count, steps),
            _ => bench::<2>(count, steps),
        };
        println!(
            "{:<6} {:>10} {:>8} {:>10} {:>12.1} {:>10.4} {:>10}",
            format!("{dim}-D"),
            count,
            steps,
            leaves,
            total_ms,
            total_ms / steps as f64,
            chunks
        );
    }
}
