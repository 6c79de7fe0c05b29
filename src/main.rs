//! Simulated Cluster Runner
//!
//! Runs the full distributed dual-tree computation inside one process: every
//! rank gets its own OS-thread group, tables, task queue, and worker pool,
//! all joined to the in-memory router. A real deployment replaces the router
//! with a network transport; everything above it is identical.

use dualtree_cluster::compute::evaluator::KernelSumEvaluator;
use dualtree_cluster::queue::queue::TaskQueue;
use dualtree_cluster::table::subtable::Table;
use dualtree_cluster::table::types::EuclideanMetric;
use dualtree_cluster::worker::pool::WorkerPool;
use dualtree_cluster::world::router::{Router, World};
use dualtree_cluster::world::types::ShardCounts;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use sysinfo::System;

#[derive(Clone)]
struct RunConfig {
    ranks: usize,
    threads: usize,
    points_per_rank: usize,
    dims: usize,
    bandwidth: f64,
    max_subtree_size: usize,
    leaf_size: usize,
    load_balance: bool,
    seed: u64,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let config = parse_config()?;

    let mut system = System::new_all();
    system.refresh_all();
    tracing::info!(
        "Host: {} cpu(s), {} MiB memory",
        system.cpus().len(),
        system.total_memory() / (1024 * 1024)
    );
    tracing::info!(
        "Cluster: {} rank(s) x {} worker thread(s), {} points/rank in {}D, load balancing {}",
        config.ranks,
        config.threads,
        config.points_per_rank,
        config.dims,
        config.load_balance
    );

    let counts = vec![
        ShardCounts {
            queries: config.points_per_rank as u64,
            references: config.points_per_rank as u64,
        };
        config.ranks
    ];
    let router = Router::new();
    let worlds: Vec<Arc<World>> = (0..config.ranks)
        .map(|rank| World::join(router.clone(), rank, counts.clone()))
        .collect();

    let mut handles = Vec::new();
    for (rank, world) in worlds.into_iter().enumerate() {
        let config = config.clone();
        handles.push(std::thread::spawn(move || run_rank(rank, world, &config)));
    }

    let mut summaries = Vec::new();
    for handle in handles {
        let summary = handle
            .join()
            .map_err(|_| anyhow::anyhow!("rank thread panicked"))?;
        summaries.push(summary);
    }

    println!("{}", serde_json::to_string_pretty(&summaries)?);
    Ok(())
}

fn run_rank(rank: usize, world: Arc<World>, config: &RunConfig) -> serde_json::Value {
    // Deterministic per-rank shards so reruns are comparable.
    let mut rng = StdRng::seed_from_u64(config.seed.wrapping_add(rank as u64));
    let mut random_rows = |n: usize| -> Vec<f64> {
        (0..n * config.dims)
            .map(|_| rng.gen_range(-10.0..10.0) + rank as f64)
            .collect()
    };
    let query = Table::new(
        rank,
        config.dims,
        random_rows(config.points_per_rank),
        config.leaf_size,
    );
    let reference = Table::new(
        rank,
        config.dims,
        random_rows(config.points_per_rank),
        config.leaf_size,
    );

    let queue = TaskQueue::init(
        &world,
        config.max_subtree_size,
        config.load_balance,
        query.clone(),
        reference.clone(),
        config.threads,
    );
    let routes = queue.essential_reference_subtrees(&world);
    let pool = WorkerPool::new(config.threads);
    pool.run(
        &world,
        &queue,
        &EuclideanMetric,
        &KernelSumEvaluator::new(config.bandwidth),
        routes,
    );
    queue.print();

    let results = query.results_range(0, query.n_points());
    let total: f64 = results.iter().sum();
    let mean = if results.is_empty() {
        0.0
    } else {
        total / results.len() as f64
    };
    serde_json::json!({
        "rank": rank,
        "query_points": query.n_points(),
        "density_total": total,
        "density_mean": mean,
        "remaining_global": queue.remaining_global_computation(),
    })
}

fn parse_config() -> anyhow::Result<RunConfig> {
    let args: Vec<String> = std::env::args().collect();
    let mut config = RunConfig {
        ranks: 2,
        threads: 2,
        points_per_rank: 512,
        dims: 2,
        bandwidth: 1.0,
        max_subtree_size: 64,
        leaf_size: 8,
        load_balance: true,
        seed: 42,
    };

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--ranks" => {
                config.ranks = args[i + 1].parse()?;
                i += 2;
            }
            "--threads" => {
                config.threads = args[i + 1].parse()?;
                i += 2;
            }
            "--points" => {
                config.points_per_rank = args[i + 1].parse()?;
                i += 2;
            }
            "--dims" => {
                config.dims = args[i + 1].parse()?;
                i += 2;
            }
            "--bandwidth" => {
                config.bandwidth = args[i + 1].parse()?;
                i += 2;
            }
            "--max-subtree" => {
                config.max_subtree_size = args[i + 1].parse()?;
                i += 2;
            }
            "--leaf-size" => {
                config.leaf_size = args[i + 1].parse()?;
                i += 2;
            }
            "--no-load-balance" => {
                config.load_balance = false;
                i += 1;
            }
            "--seed" => {
                config.seed = args[i + 1].parse()?;
                i += 2;
            }
            "--help" | "-h" => {
                eprintln!(
                    "Usage: {} [--ranks N] [--threads N] [--points N] [--dims N] \
                     [--bandwidth H] [--max-subtree N] [--leaf-size N] \
                     [--no-load-balance] [--seed N]",
                    args[0]
                );
                std::process::exit(0);
            }
            other => {
                tracing::warn!("Ignoring unknown argument {}", other);
                i += 1;
            }
        }
    }

    // Environment overrides, for container deployments.
    if let Some(threads) = std::env::var("WORKER_THREADS")
        .ok()
        .and_then(|value| value.parse::<usize>().ok())
    {
        config.threads = threads;
    }
    if let Some(max_subtree) = std::env::var("MAX_SUBTREE_SIZE")
        .ok()
        .and_then(|value| value.parse::<usize>().ok())
    {
        config.max_subtree_size = max_subtree;
    }

    anyhow::ensure!(config.ranks > 0, "--ranks must be positive");
    anyhow::ensure!(config.dims > 0, "--dims must be positive");
    anyhow::ensure!(config.points_per_rank > 0, "--points must be positive");
    Ok(config)
}
