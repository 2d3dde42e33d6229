use super::{custom::CustomBench, Bench, BenchType, RunStatistic, State};
use crate::{
    metrics_logger::{self, DEFAULT_SAMPLE_INTERVAL},
    sampler::{self, Sampler},
};
use anyhow::Context;
use async_trait::async_trait;
use std::{
    sync::{Mutex, MutexGuard, PoisonError},
    time::Duration,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Wraps a `CustomBench` and samples the engine daemon's resource usage for as long as the
/// wrapped bench runs.
pub struct OverheadBench {
    inner: CustomBench,
    cgroup_path: Option<String>,
    interval: Duration,
    sampler: Mutex<Option<Box<dyn Sampler>>>,
    samples: Mutex<Option<Vec<RunStatistic>>>,
}
impl OverheadBench {
    pub fn new(inner: CustomBench, cgroup_path: Option<String>) -> Self {
        Self {
            inner,
            cgroup_path,
            interval: DEFAULT_SAMPLE_INTERVAL,
            sampler: Mutex::new(None),
            samples: Mutex::new(None),
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Uses `sampler` instead of locating the daemon when the run starts.
    pub fn with_sampler(self, sampler: Box<dyn Sampler>) -> Self {
        *lock(&self.sampler) = Some(sampler);
        self
    }

    fn sampler(&self) -> anyhow::Result<Box<dyn Sampler>> {
        if let Some(sampler) = lock(&self.sampler).take() {
            return Ok(sampler);
        }
        let driver = self.inner.driver();
        sampler::new_sampler(driver.as_ref(), self.cgroup_path.as_deref())
            .context(format!("Unable to sample the daemon behind {}", self.info()))
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[async_trait]
impl Bench for OverheadBench {
    async fn validate(&self) -> anyhow::Result<()> {
        self.inner.validate().await
    }

    async fn run(
        &self,
        threads: usize,
        iterations: usize,
        token: &CancellationToken,
    ) -> anyhow::Result<()> {
        if self.inner.state() != State::Created {
            return Err(anyhow::anyhow!(
                "Benchmark {} has already been run",
                self.info()
            ));
        }

        let handle = metrics_logger::start_logging(self.sampler()?, self.interval);
        let res = self.inner.run(threads, iterations, token).await;
        let samples = match handle.stop().await {
            Ok(samples) => samples,
            Err(err) => {
                error!("Lost the daemon samples of {}: {err:#}", self.info());
                vec![]
            }
        };
        info!("Collected {} samples for {}", samples.len(), self.info());

        // the iterations are reported even when sampling failed
        *lock(&self.samples) = Some(samples);
        res
    }

    fn stats(&self) -> Vec<RunStatistic> {
        let samples = lock(&self.samples);
        let Some(samples) = samples.as_ref() else {
            return vec![];
        };

        let mut stats = self.inner.stats();
        stats.extend(samples.iter().cloned());
        // iterations carry no timestamp so they sort ahead of the samples
        stats.sort_by_key(|stat| stat.timestamp());
        stats
    }

    fn elapsed(&self) -> Duration {
        self.inner.elapsed()
    }

    fn state(&self) -> State {
        match self.inner.state() {
            State::Completed if lock(&self.samples).is_none() => State::Running,
            state => state,
        }
    }

    fn bench_type(&self) -> BenchType {
        BenchType::Overhead
    }

    fn info(&self) -> String {
        self.inner.info()
    }

    async fn close(&self) -> anyhow::Result<()> {
        self.inner.close().await
    }
}
