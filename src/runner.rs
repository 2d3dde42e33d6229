use crate::{
    bench::{
        custom::CustomBench,
        limit::{LimitBench, LIMIT_ITERATIONS, LIMIT_THREADS},
        overhead::OverheadBench,
        Bench, RunStatistic,
    },
    config::{Benchmark, DriverEntry},
};
use anyhow::Context;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub const LIMIT_BENCHMARK_NAME: &str = "Limit";

#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    pub trace: bool,
    pub skip_limit: bool,
    pub overhead: bool,
}

/// Everything collected for one benchmark entry across its thread-count steps.
#[derive(Debug, Clone)]
pub struct BenchResult {
    pub name: String,
    pub threads: usize,
    pub iterations: usize,
    /// Iterations per second, indexed by thread count - 1.
    pub thread_rates: Vec<f64>,
    /// Records of each thread-count step, indexed by thread count - 1.
    pub statistics: Vec<Vec<RunStatistic>>,
    pub commands: Vec<String>,
    pub is_limit: bool,
}

/// Iterations completed per second over a whole step.
pub fn rate(threads: usize, iterations: usize, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs == 0.0 {
        return 0.0;
    }
    (threads * iterations) as f64 / secs
}

/// Runs the optional limit baseline and then every driver entry of `benchmark`, one thread-count
/// step at a time.
///
/// # Arguments
///
/// * `benchmark` - A validated benchmark definition.
/// * `opts` - Command line switches affecting the sweep.
/// * `token` - Cancels in-flight engine calls when triggered.
///
/// # Returns
///
/// One result per limit run and driver entry, in execution order.
pub async fn run_sweep(
    benchmark: &Benchmark,
    opts: RunOptions,
    token: &CancellationToken,
) -> anyhow::Result<Vec<BenchResult>> {
    let mut results = vec![];

    if !opts.skip_limit {
        results.push(run_limit(LIMIT_THREADS, LIMIT_ITERATIONS, token).await?);
    }

    for entry in &benchmark.drivers {
        if token.is_cancelled() {
            return Err(anyhow::anyhow!("Benchmark run cancelled"));
        }
        results.push(run_benchmark(benchmark, entry, opts, token).await?);
    }

    Ok(results)
}

pub async fn run_limit(
    threads: usize,
    iterations: usize,
    token: &CancellationToken,
) -> anyhow::Result<BenchResult> {
    let mut thread_rates = vec![];
    for i in 1..=threads {
        let limit = LimitBench::new();
        limit.run(i, iterations, token).await?;
        let rate = rate(i, iterations, limit.elapsed());
        info!("Limit: threads {i}, iterations {iterations}, rate: {rate:6.2}");
        thread_rates.push(rate);
    }

    Ok(BenchResult {
        name: LIMIT_BENCHMARK_NAME.to_string(),
        threads,
        iterations,
        thread_rates,
        statistics: vec![],
        commands: vec![],
        is_limit: true,
    })
}

async fn run_benchmark(
    benchmark: &Benchmark,
    entry: &DriverEntry,
    opts: RunOptions,
    token: &CancellationToken,
) -> anyhow::Result<BenchResult> {
    let driver_config = entry.driver_config()?;
    let workload = benchmark.workload(entry, opts.trace)?;

    let mut name = format!("{}:{}", benchmark.name, driver_config.driver_type);
    let mut thread_rates = vec![];
    let mut statistics = vec![];

    for i in 1..=entry.threads {
        if token.is_cancelled() {
            return Err(anyhow::anyhow!("Benchmark run cancelled"));
        }
        let custom = CustomBench::init(workload.clone(), &driver_config).await?;
        let bench: Box<dyn Bench> = if opts.overhead {
            Box::new(
                OverheadBench::new(custom, entry.cgroup_path.clone())
                    .with_interval(entry.sample_interval()),
            )
        } else {
            Box::new(custom)
        };
        name = bench.info();
        info!("Starting {} benchmark {name}", bench.bench_type());

        bench
            .validate()
            .await
            .context(format!("Error during bench validate of {name}"))?;
        let res = bench
            .run(i, entry.iterations, token)
            .await
            .context(format!("Error during bench run of {name}"));
        bench.close().await?;
        res?;

        let rate = rate(i, entry.iterations, bench.elapsed());
        info!(
            "{name}: threads {i}, iterations {}, rate: {rate:6.2}",
            entry.iterations
        );
        thread_rates.push(rate);
        statistics.push(bench.stats());
    }

    Ok(BenchResult {
        name,
        threads: entry.threads,
        iterations: entry.iterations,
        thread_rates,
        statistics,
        commands: benchmark.commands.clone(),
        is_limit: false,
    })
}
