use super::{fan_out, Bench, BenchType, RunStatistic, SharedRunState, State};
use async_trait::async_trait;
use std::{collections::HashMap, process::Stdio, time::Duration};
use tokio::{process::Command, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub const LIMIT_THREADS: usize = 10;
pub const LIMIT_ITERATIONS: usize = 1000;

/// Measures how fast the host can spawn trivial processes, giving an upper bound on the rate any
/// CLI driven engine could reach.
#[derive(Debug, Default)]
pub struct LimitBench {
    run_state: SharedRunState,
}
impl LimitBench {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Bench for LimitBench {
    async fn validate(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn run(
        &self,
        threads: usize,
        iterations: usize,
        token: &CancellationToken,
    ) -> anyhow::Result<()> {
        self.run_state.begin(&self.info())?;
        info!("Running limit benchmark with {threads} threads x {iterations} iterations");

        let (stats, elapsed) = fan_out(threads, iterations, |_, tx| {
            let token = token.clone();
            async move {
                for _ in 0..iterations {
                    if token.is_cancelled() {
                        break;
                    }
                    let start = Instant::now();
                    let status = Command::new("ls")
                        .arg("/tmp")
                        .stdout(Stdio::null())
                        .stderr(Stdio::null())
                        .kill_on_drop(true)
                        .status()
                        .await;
                    let elapsed = start.elapsed();

                    let mut durations = HashMap::new();
                    let mut errors = HashMap::new();
                    match status {
                        Ok(status) if status.success() => {
                            durations.insert("run".to_string(), elapsed);
                        }
                        Ok(status) => {
                            warn!("ls /tmp exited with {status}");
                            errors.insert("run".to_string(), 1);
                        }
                        Err(err) => {
                            warn!("Unable to spawn ls: {err}");
                            errors.insert("run".to_string(), 1);
                        }
                    }

                    if tx
                        .send(RunStatistic::Iteration { durations, errors })
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
            }
        })
        .await;

        self.run_state.complete(stats, elapsed);
        Ok(())
    }

    fn stats(&self) -> Vec<RunStatistic> {
        self.run_state.stats()
    }

    fn elapsed(&self) -> Duration {
        self.run_state.elapsed()
    }

    fn state(&self) -> State {
        self.run_state.state()
    }

    fn bench_type(&self) -> BenchType {
        BenchType::Limit
    }

    fn info(&self) -> String {
        "Limit benchmark: No driver".to_string()
    }
}
