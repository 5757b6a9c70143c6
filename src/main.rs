#[cfg(feature = "mimalloc-global")]
#[global_allocator]
static GLOBAL_ALLOCATOR: mimalloc::MiMalloc = mimalloc::MiMalloc;

use pic_index::pic::{Dispatch, GridError, ParticleIndex, ParticleIndexConfig, ParticleStore};
use rand::{Rng, SeedableRng};
use std::time::{Duration, Instant};

const DEFAULT_PARTICLES: usize = 10_000;
const DEFAULT_STEPS: u64 = 1000;
const CHECK_INTERVAL: u64 = 100;
/// Particles are seeded in `[0, SEED_EXTENT)` on every axis.
const SEED_EXTENT: f32 = 0.5;

struct MainArgs {
    config: ParticleIndexConfig,
    particles: usize,
    steps: u64,
    dim: usize,
}

fn parse_args() -> MainArgs {
    let args: Vec<String> = std::env::args().collect();
    let mut config = ParticleIndexConfig::default();
    let mut particles = DEFAULT_PARTICLES;
    let mut steps = DEFAULT_STEPS;
    let mut dim = 2;
    let next_arg = |i: usize, flag: &str| -> &str {
        args.get(i)
            .map(String::as_str)
            .unwrap_or_else(|| panic!("{flag} requires a value"))
    };
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--threads" => {
                i += 1;
                let n: usize = next_arg(i, "--threads")
                    .parse()
                    .expect("--threads requires a positive integer");
                config = config.thread_count(n);
            }
            "--max-threads" => {
                i += 1;
                let n: usize = next_arg(i, "--max-threads")
                    .parse()
                    .expect("--max-threads requires a positive integer");
                config = config.max_threads(n);
            }
            "--particles" => {
                i += 1;
                particles = next_arg(i, "--particles")
                    .parse()
                    .expect("--particles requires a non-negative integer");
            }
            "--steps" => {
                i += 1;
                steps = next_arg(i, "--steps")
                    .parse()
                    .expect("--steps requires a non-negative integer");
            }
            "--dim" => {
                i += 1;
                dim = match next_arg(i, "--dim") {
                    "2" => 2,
                    "3" => 3,
                    other => panic!("unsupported dimension: {other} (expected 2 or 3)"),
                };
            }
            "--chunk-size" => {
                i += 1;
                let n: u32 = next_arg(i, "--chunk-size")
                    .parse()
                    .expect("--chunk-size requires a positive integer");
                config = config.chunk_size(n);
            }
            other => panic!(
                "unknown argument: {other}\nusage: pic-index [--threads N] [--max-threads N] [--particles N] [--steps N] [--dim 2|3] [--chunk-size N]"
            ),
        }
        i += 1;
    }
    MainArgs {
        config,
        particles,
        steps,
        dim,
    }
}

fn seed_particles<const D: usize>(count: usize) -> Result<ParticleStore<D>, GridError> {
    let mut rng = rand::rngs::StdRng::seed_from_u64(0x5EED_1234_ABCD_EF01);
    let mut store = ParticleStore::new();
    for _ in 0..count {
        let mut position = [0.0f32; D];
        for axis in position.iter_mut() {
            *axis = rng.random::<f32>() * SEED_EXTENT;
        }
        store.push(position)?;
    }
    Ok(store)
}

/// Every id appears in exactly one leaf list.
fn check_complete<const D: usize, X: Dispatch>(index: &ParticleIndex<D, X>, count: usize) -> bool {
    let mut seen = vec![false; count];
    let mut ok = true;
    index.for_each_active_leaf(|leaf| {
        for id in leaf.particles() {
            match seen.get_mut(id as usize) {
                Some(slot) if !*slot => *slot = true,
                _ => ok = false,
            }
        }
    });
    ok && seen.iter().all(|&s| s)
}

fn run<const D: usize>(args: &MainArgs) -> Result<(), GridError> {
    let store = seed_particles::<D>(args.particles)?;
    let mut index = ParticleIndex::<D>::with_config(args.config.clone())?;
    if args.steps == 0 {
        return Ok(());
    }

    let start = Instant::now();
    index.step(&store)?;
    let first_ms = start.elapsed().as_secs_f64() * 1000.0;
    let baseline = index.stats();
    println!(
        "Step 1: {} particles, {} leaves, {} mid-blocks, {} chunks backed ({} KiB) in {first_ms:.3} ms",
        store.len(),
        baseline.active_leaves,
        baseline.active_mids,
        baseline.total_backed(),
        baseline.backed_bytes() / 1024
    );

    let mut total = Duration::ZERO;
    let mut done = 1u64;
    while done < args.steps {
        let batch = CHECK_INTERVAL.min(args.steps - done);
        let start = Instant::now();
        index.step_n(&store, batch)?;
        let phase = start.elapsed();
        total += phase;
        done += batch;

        let stats = index.stats();
        let leak_status = if stats.total_backed() == baseline.total_backed() {
            "STABLE"
        } else {
            "GROWN"
        };
        let complete_status = if check_complete(&index, store.len()) {
            "COMPLETE"
        } else {
            "INCOMPLETE"
        };
        let phase_ms = phase.as_secs_f64() * 1000.0;
        println!(
            "Step {done}: {} leaves, {} chunks backed [{leak_status}] [{complete_status}] | {phase_ms:.3} ms total, {:.6} ms/step",
            stats.active_leaves,
            stats.total_backed(),
            phase_ms / batch as f64
        );
    }

    if done > 1 {
        let total_ms = total.as_secs_f64() * 1000.0;
        let avg_ms = total_ms / (done - 1) as f64;
        println!("\n--- Summary ({done} steps, {D}-D) ---");
        println!(
            "Rebuild: {total_ms:.3} ms total, {avg_ms:.6} ms/step, {:.1} Mparticles/s",
            store.len() as f64 * (done - 1) as f64 / total.as_secs_f64().max(f64::EPSILON) / 1e6
        );
    }
    Ok(())
}

fn main() {
    env_logger::init();
    let args = parse_args();
    let result = match args.dim {
        3 => run::<3>(&args),
        _ => run::<2>(&args),
    };
    if let Err(err) = result {
        log::error!("{err}");
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}
