use super::{
    container_name, fan_out, Bench, BenchType, RunStatistic, SharedRunState, State, Workload,
};
use crate::driver::{
    self, cancellable, Container, Driver, DriverError, ExecOutput, CONTAINER_NAME_PREFIX,
};
use anyhow::Context;
use async_trait::async_trait;
use futures_util::StreamExt;
use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Lifecycle operations a benchmark definition can ask for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Run,
    Stop,
    Remove,
    Pause,
    Unpause,
    Wait,
    Stats,
}
impl Command {
    /// Maps a command token, or one of its aliases, onto an operation. Case is ignored.
    pub fn parse(token: &str) -> Option<Command> {
        match token.to_lowercase().as_str() {
            "run" | "start" => Some(Command::Run),
            "stop" | "kill" => Some(Command::Stop),
            "remove" | "erase" | "delete" => Some(Command::Remove),
            "pause" => Some(Command::Pause),
            "unpause" | "resume" => Some(Command::Unpause),
            "wait" => Some(Command::Wait),
            "stats" => Some(Command::Stats),
            _ => None,
        }
    }

    async fn dispatch(
        &self,
        driver: &dyn Driver,
        ctr: &Container,
    ) -> Result<ExecOutput, DriverError> {
        match self {
            Command::Run => driver.run(ctr).await,
            Command::Stop => driver.stop(ctr).await,
            Command::Remove => driver.remove(ctr).await,
            Command::Pause => driver.pause(ctr).await,
            Command::Unpause => driver.unpause(ctr).await,
            Command::Wait => driver.wait(ctr).await,
            Command::Stats => {
                // time to the first statistics document
                let start = Instant::now();
                let mut stream = driver.stats(ctr).await?;
                let output = match stream.next().await {
                    Some(doc) => doc?,
                    None => String::new(),
                };
                Ok(ExecOutput::new(output, start.elapsed()))
            }
        }
    }
}

/// Runs a user defined sequence of lifecycle commands against one driver.
pub struct CustomBench {
    workload: Arc<Workload>,
    driver: Arc<dyn Driver>,
    run_state: SharedRunState,
}
impl CustomBench {
    /// Builds the driver described by `config`, checks the engine is reachable and removes any
    /// container left behind by an earlier run.
    ///
    /// # Arguments
    ///
    /// * `workload` - What to run.
    /// * `config` - Which driver to run it with.
    ///
    /// # Returns
    ///
    /// A bench in the `Created` state or an error if the engine cannot be reached.
    pub async fn init(workload: Workload, config: &driver::Config) -> anyhow::Result<Self> {
        let driver = driver::new(config)
            .await
            .context(format!("Unable to create {} driver", config.driver_type))?;
        Self::with_driver(workload, driver).await
    }

    pub async fn with_driver(workload: Workload, driver: Arc<dyn Driver>) -> anyhow::Result<Self> {
        let engine_info = driver
            .info()
            .await
            .context(format!("{} driver is not reachable", driver.driver_type()))?;
        debug!("{}", engine_info.trim_end());

        driver
            .clean()
            .await
            .context(format!("Unable to clean up before {}", workload.name))?;

        Ok(Self {
            workload: Arc::new(workload),
            driver,
            run_state: SharedRunState::default(),
        })
    }

    pub fn driver(&self) -> Arc<dyn Driver> {
        self.driver.clone()
    }

    pub fn workload(&self) -> &Workload {
        &self.workload
    }

    /// Parses the command tokens once, warning about any that will be skipped.
    fn commands(&self) -> Vec<(String, Command)> {
        self.workload
            .commands
            .iter()
            .filter_map(|token| match Command::parse(token) {
                Some(cmd) => Some((token.clone(), cmd)),
                None => {
                    warn!("Unknown command '{token}' in {}, skipping", self.workload.name);
                    None
                }
            })
            .collect()
    }
}

#[async_trait]
impl Bench for CustomBench {
    async fn validate(&self) -> anyhow::Result<()> {
        let name = format!("{CONTAINER_NAME_PREFIX}-validate");
        let workload = &self.workload;

        let ctr = self
            .driver
            .create(
                &name,
                &workload.image,
                workload.command.as_deref(),
                workload.detached,
                false,
            )
            .await
            .context(format!("Validation failed to create {name}"))?;
        self.driver
            .run(&ctr)
            .await
            .context(format!("Validation failed to run {name}"))?;
        self.driver
            .stop(&ctr)
            .await
            .context(format!("Validation failed to stop {name}"))?;

        tokio::time::sleep(driver::QUIESCE_DELAY).await;

        self.driver
            .remove(&ctr)
            .await
            .context(format!("Validation failed to remove {name}"))?;
        Ok(())
    }

    async fn run(
        &self,
        threads: usize,
        iterations: usize,
        token: &CancellationToken,
    ) -> anyhow::Result<()> {
        self.run_state.begin(&self.info())?;
        info!(
            "Running {} with {threads} threads x {iterations} iterations",
            self.info()
        );

        let commands = Arc::new(self.commands());
        let (stats, elapsed) = fan_out(threads, iterations, |thread, tx| {
            let driver = self.driver.clone();
            let workload = self.workload.clone();
            let commands = commands.clone();
            let token = token.clone();
            async move {
                for iteration in 0..iterations {
                    if token.is_cancelled() {
                        break;
                    }
                    let stat = run_iteration(
                        driver.as_ref(),
                        &workload,
                        &commands,
                        &container_name(thread, iteration),
                        &token,
                    )
                    .await;
                    if tx.send(stat).await.is_err() {
                        break;
                    }
                }
            }
        })
        .await;

        let clean_res = self
            .driver
            .clean()
            .await
            .context(format!("Final cleanup of {} failed", self.info()));
        self.run_state.complete(stats, elapsed);
        clean_res
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
        BenchType::Custom
    }

    fn info(&self) -> String {
        format!("{}:{}", self.workload.name, self.driver.driver_type())
    }

    async fn close(&self) -> anyhow::Result<()> {
        self.driver
            .close()
            .await
            .context(format!("Unable to close driver for {}", self.info()))
    }
}

/// One pass through the command list against a freshly created container. Failures are counted
/// against the command that failed and never stop the iteration.
async fn run_iteration(
    driver: &dyn Driver,
    workload: &Workload,
    commands: &[(String, Command)],
    name: &str,
    token: &CancellationToken,
) -> RunStatistic {
    let mut durations = HashMap::new();
    let mut errors = HashMap::new();

    let ctr = match cancellable(
        token,
        driver.create(
            name,
            &workload.image,
            workload.command.as_deref(),
            workload.detached,
            workload.trace,
        ),
    )
    .await
    {
        Ok(ctr) => Some(ctr),
        Err(err) => {
            warn!("Error creating container {name}: {err}");
            None
        }
    };

    for (token_name, cmd) in commands {
        let start = Instant::now();
        let res = match &ctr {
            Some(ctr) => cancellable(token, cmd.dispatch(driver, ctr)).await,
            None => Err(DriverError::NoContainer(name.to_string())),
        };
        // failed calls still report how long the engine took to fail
        let elapsed = match res {
            Ok(out) => {
                debug!("{token_name} {name} took {:?}", out.elapsed);
                out.elapsed
            }
            Err(err) => {
                warn!("Error running {token_name} on {name}: {err}");
                *errors.entry(token_name.clone()).or_insert(0) += 1;
                start.elapsed()
            }
        };
        durations.insert(token_name.clone(), elapsed);
    }

    RunStatistic::Iteration { durations, errors }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aliases_map_to_the_same_operation() {
        assert_eq!(Command::parse("start"), Some(Command::Run));
        assert_eq!(Command::parse("RUN"), Some(Command::Run));
        assert_eq!(Command::parse("kill"), Some(Command::Stop));
        assert_eq!(Command::parse("Erase"), Some(Command::Remove));
        assert_eq!(Command::parse("delete"), Some(Command::Remove));
        assert_eq!(Command::parse("resume"), Some(Command::Unpause));
        assert_eq!(Command::parse("wait"), Some(Command::Wait));
        assert_eq!(Command::parse("exec"), None);
    }
}
