pub mod custom;
pub mod limit;
pub mod overhead;

use crate::{driver::CONTAINER_NAME_PREFIX, sampler::ProcMetrics};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::{
    collections::HashMap,
    fmt,
    future::Future,
    sync::{Mutex, MutexGuard, PoisonError},
    time::{Duration, Instant},
};
use tokio::{sync::mpsc, task::JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::error;

/// Everything a benchmark needs to know about the containers it drives. Shared read-only by all
/// workers.
#[derive(Debug, Clone, PartialEq)]
pub struct Workload {
    pub name: String,
    /// Image reference, or bundle path for bundle based drivers.
    pub image: String,
    pub command: Option<String>,
    pub detached: bool,
    pub trace: bool,
    pub commands: Vec<String>,
}

/// A single record produced by a benchmark run. Iterations and resource samples travel in the same
/// list, consumers must filter on the variant before aggregating.
#[derive(Debug, Clone, PartialEq)]
pub enum RunStatistic {
    /// One pass through the command list. Both maps are keyed by the command as written in the
    /// benchmark definition.
    Iteration {
        durations: HashMap<String, Duration>,
        errors: HashMap<String, u32>,
    },
    Sample {
        timestamp: DateTime<Utc>,
        metrics: ProcMetrics,
    },
}
impl RunStatistic {
    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            RunStatistic::Iteration { .. } => None,
            RunStatistic::Sample { timestamp, .. } => Some(*timestamp),
        }
    }

    pub fn is_sample(&self) -> bool {
        matches!(self, RunStatistic::Sample { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Created,
    Running,
    Completed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BenchType {
    Limit,
    Custom,
    Overhead,
}
impl fmt::Display for BenchType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BenchType::Limit => write!(f, "Limit"),
            BenchType::Custom => write!(f, "Custom"),
            BenchType::Overhead => write!(f, "Overhead"),
        }
    }
}

#[async_trait]
pub trait Bench: Send + Sync {
    /// Runs one full create/run/stop/remove cycle to catch configuration problems before any
    /// worker is spawned.
    async fn validate(&self) -> anyhow::Result<()>;

    /// Runs `iterations` passes on each of `threads` concurrent workers. A bench can only be run
    /// once.
    async fn run(
        &self,
        threads: usize,
        iterations: usize,
        token: &CancellationToken,
    ) -> anyhow::Result<()>;

    /// Every record of a completed run. Empty until the run has completed.
    fn stats(&self) -> Vec<RunStatistic>;

    fn elapsed(&self) -> Duration;

    fn state(&self) -> State;

    fn bench_type(&self) -> BenchType;

    fn info(&self) -> String;

    /// Releases the driver behind this bench.
    async fn close(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Name of the container for one iteration of one worker. Unique within a run.
pub fn container_name(thread: usize, iteration: usize) -> String {
    format!("{CONTAINER_NAME_PREFIX}-{thread}-{iteration}")
}

/// Mutable part of a bench, guarded so that `stats` and `state` can be read while `run` is in
/// flight.
#[derive(Debug)]
pub(crate) struct RunState {
    pub state: State,
    pub stats: Vec<RunStatistic>,
    pub elapsed: Duration,
}
impl Default for RunState {
    fn default() -> Self {
        Self {
            state: State::Created,
            stats: vec![],
            elapsed: Duration::ZERO,
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct SharedRunState(Mutex<RunState>);
impl SharedRunState {
    fn lock(&self) -> MutexGuard<'_, RunState> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Moves the bench to `Running`, failing if it has been run before.
    pub fn begin(&self, info: &str) -> anyhow::Result<()> {
        let mut run_state = self.lock();
        if run_state.state != State::Created {
            return Err(anyhow::anyhow!("Benchmark {info} has already been run"));
        }
        run_state.state = State::Running;
        Ok(())
    }

    pub fn complete(&self, stats: Vec<RunStatistic>, elapsed: Duration) {
        let mut run_state = self.lock();
        run_state.stats = stats;
        run_state.elapsed = elapsed;
        run_state.state = State::Completed;
    }

    pub fn stats(&self) -> Vec<RunStatistic> {
        let run_state = self.lock();
        match run_state.state {
            State::Completed => run_state.stats.clone(),
            _ => vec![],
        }
    }

    pub fn state(&self) -> State {
        self.lock().state
    }

    pub fn elapsed(&self) -> Duration {
        self.lock().elapsed
    }
}

/// Spawns `threads` workers, each with a private queue able to hold all of its `iterations`
/// records, waits for all of them and drains the queues in worker order.
///
/// # Returns
///
/// The collected records and the wall-clock time the workers took.
pub(crate) async fn fan_out<F, Fut>(
    threads: usize,
    iterations: usize,
    worker: F,
) -> (Vec<RunStatistic>, Duration)
where
    F: Fn(usize, mpsc::Sender<RunStatistic>) -> Fut,
    Fut: Future<Output = ()> + Send + 'static,
{
    let mut receivers = Vec::with_capacity(threads);
    let mut join_set = JoinSet::new();

    let start = Instant::now();
    for thread in 0..threads {
        let (tx, rx) = mpsc::channel(iterations.max(1));
        receivers.push(rx);
        join_set.spawn(worker(thread, tx));
    }
    while let Some(res) = join_set.join_next().await {
        if let Err(err) = res {
            error!("Benchmark worker failed: {err}");
        }
    }
    let elapsed = start.elapsed();

    let mut stats = Vec::with_capacity(threads * iterations);
    for mut rx in receivers {
        while let Ok(stat) = rx.try_recv() {
            stats.push(stat);
        }
    }
    (stats, elapsed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn container_names_are_unique_within_a_run() {
        let names = (0..12)
            .flat_map(|thread| (0..120).map(move |iteration| container_name(thread, iteration)))
            .collect::<Vec<_>>();
        let unique = names.iter().collect::<HashSet<_>>();
        assert_eq!(unique.len(), names.len());
        assert!(names.iter().all(|n| n.starts_with(CONTAINER_NAME_PREFIX)));
    }

    #[test]
    fn names_do_not_collide_across_digit_boundaries() {
        // "1-11" and "11-1" must differ
        assert_ne!(container_name(1, 11), container_name(11, 1));
    }

    #[tokio::test]
    async fn fan_out_keeps_per_thread_order() {
        let (stats, _) = fan_out(3, 4, |thread, tx| async move {
            for iteration in 0..4 {
                let mut durations = HashMap::new();
                durations.insert(
                    format!("t{thread}"),
                    Duration::from_millis(iteration as u64),
                );
                let _ = tx
                    .send(RunStatistic::Iteration {
                        durations,
                        errors: HashMap::new(),
                    })
                    .await;
            }
        })
        .await;

        assert_eq!(stats.len(), 12);
        for (thread, chunk) in stats.chunks(4).enumerate() {
            let millis = chunk
                .iter()
                .map(|stat| match stat {
                    RunStatistic::Iteration { durations, .. } => durations[&format!("t{thread}")],
                    RunStatistic::Sample { .. } => unreachable!(),
                })
                .collect::<Vec<_>>();
            assert_eq!(
                millis,
                (0..4).map(Duration::from_millis).collect::<Vec<_>>()
            );
        }
    }

    #[test]
    fn stats_are_hidden_until_completed() -> anyhow::Result<()> {
        let shared = SharedRunState::default();
        assert_eq!(shared.state(), State::Created);

        shared.begin("test")?;
        assert!(shared.begin("test").is_err());
        assert!(shared.stats().is_empty());

        shared.complete(
            vec![RunStatistic::Iteration {
                durations: HashMap::new(),
                errors: HashMap::new(),
            }],
            Duration::from_secs(1),
        );
        assert_eq!(shared.state(), State::Completed);
        assert_eq!(shared.stats().len(), 1);
        Ok(())
    }
}
