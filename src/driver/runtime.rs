use super::{
    is_benchmark_container, Config, Container, Driver, DriverError, DriverType, ExecOutput,
    QUIESCE_DELAY,
};
use crate::exec::{exec_cmd, exec_timed_cmd, exec_timed_cmd_no_out, resolve_binary};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::time::sleep;
use tracing::{info, warn};

const CLEAN_PASSES: usize = 3;

/// A container as reported by a runtime's `list` command.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ListedContainer {
    pub name: String,
    pub state: String,
}

/// Parses the tabular output of `runc list` (or `ctr containers`), keeping only containers that
/// belong to a benchmark run. The state is always the third column.
pub(crate) fn parse_container_list(output: &str) -> Vec<ListedContainer> {
    output
        .lines()
        .filter(|line| !line.starts_with("ID ") && !line.trim().is_empty())
        .filter_map(|line| {
            let parts = line.split_whitespace().collect::<Vec<_>>();
            if parts.len() < 4 {
                warn!("container list parsing found invalid line: {line:?}");
                return None;
            }
            Some(ListedContainer {
                name: parts[0].to_string(),
                state: parts[2].to_lowercase(),
            })
        })
        .filter(|ctr| is_benchmark_container(&ctr.name))
        .collect()
}

/// Repeatedly lists containers and tears down whatever the benchmark left behind.
pub(crate) async fn clean_listed(
    driver: &dyn Driver,
    binary: &Path,
    list_args: &[String],
) -> Result<(), DriverError> {
    let mut containers = parse_container_list(&exec_cmd(binary, list_args).await?);
    info!(
        "{}: cleaning up {} listed containers",
        driver.driver_type(),
        containers.len()
    );

    let mut pass = 0;
    while !containers.is_empty() && pass < CLEAN_PASSES {
        pass += 1;
        info!("{} cleanup: pass #{pass}", driver.driver_type());

        for listed in containers.iter() {
            let ctr = Container::new(&listed.name, "", None, false, false);
            // failures here are expected for half torn down containers, the next pass retries
            match listed.state.as_str() {
                "running" | "created" => {
                    let _ = driver.stop(&ctr).await;
                    sleep(QUIESCE_DELAY).await;
                    let _ = driver.remove(&ctr).await;
                }
                "paused" => {
                    let _ = driver.unpause(&ctr).await;
                    let _ = driver.stop(&ctr).await;
                    sleep(QUIESCE_DELAY).await;
                    let _ = driver.remove(&ctr).await;
                }
                "stopped" => {
                    let _ = driver.remove(&ctr).await;
                }
                state => warn!("unknown state {state:?} for container {:?}", listed.name),
            }
        }

        containers = parse_container_list(&exec_cmd(binary, list_args).await?);
    }

    if !containers.is_empty() {
        warn!(
            "{}: {} containers survived cleanup",
            driver.driver_type(),
            containers.len()
        );
    }
    Ok(())
}

/// Checks that `bundle` looks like an OCI bundle.
pub(crate) fn validate_bundle(bundle: &str) -> Result<(), DriverError> {
    let config = Path::new(bundle).join("config.json");
    if config.is_file() {
        Ok(())
    } else {
        Err(DriverError::Config(format!(
            "{bundle} is not an OCI bundle (missing {})",
            config.display()
        )))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flavor {
    Runc,
    Crun,
    Youki,
}
impl Flavor {
    fn default_binary(&self) -> &'static str {
        match self {
            Flavor::Runc => "runc",
            Flavor::Crun => "crun",
            Flavor::Youki => "youki",
        }
    }
}

/// Drives an OCI runtime binary (runc, crun or youki) directly against exploded bundles.
#[derive(Debug)]
pub struct RuntimeDriver {
    flavor: Flavor,
    binary: PathBuf,
}
impl RuntimeDriver {
    pub fn new(config: &Config) -> Result<Self, DriverError> {
        let flavor = match config.driver_type {
            DriverType::Runc => Flavor::Runc,
            DriverType::Crun => Flavor::Crun,
            DriverType::Youki => Flavor::Youki,
            other => {
                return Err(DriverError::Config(format!(
                    "{other} is not an OCI runtime driver"
                )))
            }
        };
        let binary = resolve_binary(config.path.as_deref().unwrap_or(flavor.default_binary()))?;
        Ok(Self { flavor, binary })
    }

    fn run_args(&self, ctr: &Container) -> Vec<String> {
        let mut args = vec![];
        if ctr.trace && self.flavor != Flavor::Youki {
            args.push("--trace".to_string());
            args.push(format!("/tmp/{}.trace", ctr.name));
        }

        args.push("run".to_string());
        // youki has no foreground mode suitable for benchmarking
        if ctr.detached || self.flavor == Flavor::Youki {
            args.push("--detach".to_string());
        }
        args.push("--bundle".to_string());
        args.push(ctr.image.clone());
        args.push(ctr.name.clone());
        args
    }

    async fn runtime(&self, args: &[&str]) -> Result<ExecOutput, DriverError> {
        let args = args.iter().map(|arg| arg.to_string()).collect::<Vec<_>>();
        exec_timed_cmd(&self.binary, &args).await
    }
}

#[async_trait]
impl Driver for RuntimeDriver {
    fn driver_type(&self) -> DriverType {
        match self.flavor {
            Flavor::Runc => DriverType::Runc,
            Flavor::Crun => DriverType::Crun,
            Flavor::Youki => DriverType::Youki,
        }
    }

    fn path(&self) -> String {
        self.binary.display().to_string()
    }

    async fn info(&self) -> Result<String, DriverError> {
        let version = exec_cmd(&self.binary, &["--version".to_string()]).await?;
        Ok(format!(
            "{} driver (binary: {})\n{}",
            self.flavor.default_binary(),
            self.binary.display(),
            version.trim()
        ))
    }

    async fn create(
        &self,
        name: &str,
        image: &str,
        _cmd_override: Option<&str>,
        detached: bool,
        trace: bool,
    ) -> Result<Container, DriverError> {
        validate_bundle(image)?;
        Ok(Container::new(name, image, None, detached, trace))
    }

    async fn clean(&self) -> Result<(), DriverError> {
        clean_listed(self, &self.binary, &["list".to_string()]).await
    }

    /// Bundles that ask for a terminal cannot be detached without a console socket, so detached
    /// workloads must not set `process.terminal`.
    async fn run(&self, ctr: &Container) -> Result<ExecOutput, DriverError> {
        exec_timed_cmd_no_out(&self.binary, &self.run_args(ctr)).await
    }

    async fn stop(&self, ctr: &Container) -> Result<ExecOutput, DriverError> {
        self.runtime(&["kill", &ctr.name, "KILL"]).await
    }

    async fn remove(&self, ctr: &Container) -> Result<ExecOutput, DriverError> {
        self.runtime(&["delete", &ctr.name]).await
    }

    async fn pause(&self, ctr: &Container) -> Result<ExecOutput, DriverError> {
        self.runtime(&["pause", &ctr.name]).await
    }

    async fn unpause(&self, ctr: &Container) -> Result<ExecOutput, DriverError> {
        self.runtime(&["resume", &ctr.name]).await
    }
}
