//! Micro-benchmark for contended appends into a single dynamic list.
//! Run with: cargo run --release --bin bench_append

use pic_index::pic::{ChunkPool, LIST_CHUNK_OVERHEAD, ListHead};
use rayon::prelude::*;
use std::time::Instant;

const VALUES: u32 = 4_000_000;
const RUNS: usize = 3;

fn bench_append(label: &str, threads: usize, chunk_size: usize) {
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(threads)
        .build()
        .unwrap_or_else(|err| panic!("failed to build rayon pool: {err}"));
    let chunks = pool_chunks(chunk_size);
    let chunk_pool = ChunkPool::new("bench", LIST_CHUNK_OVERHEAD + chunk_size, chunks);
    let head = ListHead::new();
    let list = head.bind(&chunk_pool, VALUES);

    let mut best_ms = f64::MAX;
    for _ in 0..RUNS {
        list.clear();
        let start = Instant::now();
        pool.install(|| {
            (0..VALUES).into_par_iter().with_min_len(256).for_each(|v| {
                list.append(v)
                    .unwrap_or_else(|err| panic!("append failed: {err}"));
            });
        });
        best_ms = best_ms.min(start.elapsed().as_secs_f64() * 1000.0);
    }
    let stats = chunk_pool.stats();
    println!(
        "{:<28} best={:>9.3} ms  {:>7.1} Mappends/s  chunks={}",
        label,
        best_ms,
        VALUES as f64 / best_ms / 1e3,
        stats.backed
    );
}

fn pool_chunks(chunk_size: usize) -> u32 {
    (VALUES as usize).div_ceil(chunk_size) as u32
}

fn main() {
    env_logger::init();
    let max_threads = num_cpus::get_physical().max(1);
    for &chunk_size in &[256usize, 4096] {
        let mut threads = 1;
        while threads <= max_threads {
            bench_append(&format!("chunk={chunk_size} threads={threads}"), threads, chunk_size);
            threads *= 2;
        }
    }
}
