pub mod containerd;
pub mod cri;
pub mod ctr;
pub mod docker;
pub mod docker_cli;
pub mod null;
pub mod runtime;

pub use crate::exec::ExecOutput;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use std::{
    collections::BTreeMap, fmt, future::Future, path::PathBuf, str::FromStr, sync::Arc,
    time::Duration,
};
use sysinfo::System;
use tokio_util::sync::CancellationToken;

/// Every container created by a benchmark carries this prefix. Cleanup sweeps anything that
/// starts with it, so the prefix must not be shared with anything else on the host.
pub const CONTAINER_NAME_PREFIX: &str = "cb-ctr";

/// Pause between stopping a container and removing it, so engines can settle task state.
pub(crate) const QUIESCE_DELAY: Duration = Duration::from_millis(50);

/// Stream of raw statistics documents (one JSON object or CLI line per item).
pub type StatsStream = BoxStream<'static, Result<String, DriverError>>;

#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error("{0} is not implemented by the {1} driver")]
    NotImplemented(&'static str, DriverType),

    #[error("operation cancelled")]
    Cancelled,

    #[error("no container handle for {0}, create failed")]
    NoContainer(String),

    #[error("failed to spawn `{command}`")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{command}` exited with {status}: {output}")]
    Exec {
        command: String,
        status: std::process::ExitStatus,
        output: String,
    },

    #[error("docker api error: {0}")]
    Docker(#[from] bollard::errors::Error),

    #[error("rpc failed with {code}: {message}")]
    Rpc { code: String, message: String },

    #[error("unable to connect to {endpoint}: {reason}")]
    Connect { endpoint: String, reason: String },

    #[error("{0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
impl From<tonic::Status> for DriverError {
    fn from(status: tonic::Status) -> Self {
        DriverError::Rpc {
            code: format!("{:?}", status.code()),
            message: status.message().to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DriverType {
    DockerCli,
    Docker,
    Runc,
    Crun,
    Youki,
    Containerd,
    Ctr,
    Cri,
    Null,
}
impl DriverType {
    /// Drivers which operate on an exploded OCI bundle rather than a registry image.
    pub fn needs_bundle(&self) -> bool {
        matches!(
            self,
            DriverType::Runc
                | DriverType::Crun
                | DriverType::Youki
                | DriverType::Ctr
                | DriverType::Containerd
        )
    }
}
impl fmt::Display for DriverType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DriverType::DockerCli => "DockerCLI",
            DriverType::Docker => "Docker",
            DriverType::Runc => "Runc",
            DriverType::Crun => "Crun",
            DriverType::Youki => "Youki",
            DriverType::Containerd => "Containerd",
            DriverType::Ctr => "Ctr",
            DriverType::Cri => "CRI",
            DriverType::Null => "Null",
        };
        write!(f, "{name}")
    }
}
impl FromStr for DriverType {
    type Err = DriverError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "dockercli" => Ok(DriverType::DockerCli),
            "docker" => Ok(DriverType::Docker),
            "runc" => Ok(DriverType::Runc),
            "crun" => Ok(DriverType::Crun),
            "youki" => Ok(DriverType::Youki),
            "containerd" => Ok(DriverType::Containerd),
            "ctr" => Ok(DriverType::Ctr),
            "cri" => Ok(DriverType::Cri),
            "null" => Ok(DriverType::Null),
            _ => Err(DriverError::Config(format!("no such driver type: {s}"))),
        }
    }
}

/// Everything needed to construct a driver.
#[derive(Debug, Clone)]
pub struct Config {
    pub driver_type: DriverType,
    /// Client binary or daemon socket. Each driver has its own default.
    pub path: Option<String>,
    pub log_driver: Option<String>,
    pub log_opts: BTreeMap<String, String>,
    pub stream_stats: bool,
    pub sandbox_config: Option<PathBuf>,
    pub container_config: Option<PathBuf>,
}
impl Config {
    pub fn new(driver_type: DriverType) -> Self {
        Self {
            driver_type,
            path: None,
            log_driver: None,
            log_opts: BTreeMap::new(),
            stream_stats: false,
            sandbox_config: None,
            container_config: None,
        }
    }
}

/// Per-iteration handle for one container. Never shared between workers.
#[derive(Debug, Clone, PartialEq)]
pub struct Container {
    pub name: String,
    /// Image reference for registry backed engines, bundle path for runtimes.
    pub image: String,
    pub command: Option<String>,
    pub detached: bool,
    pub trace: bool,
    pub pod_id: Option<String>,
}
impl Container {
    pub fn new(
        name: &str,
        image: &str,
        command: Option<&str>,
        detached: bool,
        trace: bool,
    ) -> Self {
        Self {
            name: name.to_string(),
            image: image.to_string(),
            command: command.map(str::to_string),
            detached,
            trace,
            pod_id: None,
        }
    }
}

/// Uniform lifecycle contract over every supported container engine.
///
/// Implementations are shared between all workers of a benchmark and must not mutate their own
/// state after construction. Unsupported operations return `DriverError::NotImplemented` or, where
/// the operation is meaningless for the engine, succeed as a no-op.
#[async_trait]
pub trait Driver: Send + Sync {
    fn driver_type(&self) -> DriverType;

    /// The binary or endpoint this driver talks to.
    fn path(&self) -> String;

    /// Version information for the engine. Doubles as a health check.
    async fn info(&self) -> Result<String, DriverError>;

    async fn create(
        &self,
        name: &str,
        image: &str,
        cmd_override: Option<&str>,
        detached: bool,
        trace: bool,
    ) -> Result<Container, DriverError>;

    /// Removes every container carrying `CONTAINER_NAME_PREFIX`. Nothing to clean is success.
    async fn clean(&self) -> Result<(), DriverError>;

    async fn run(&self, ctr: &Container) -> Result<ExecOutput, DriverError>;

    async fn stop(&self, ctr: &Container) -> Result<ExecOutput, DriverError>;

    async fn remove(&self, ctr: &Container) -> Result<ExecOutput, DriverError>;

    async fn pause(&self, ctr: &Container) -> Result<ExecOutput, DriverError>;

    async fn unpause(&self, ctr: &Container) -> Result<ExecOutput, DriverError>;

    async fn wait(&self, _ctr: &Container) -> Result<ExecOutput, DriverError> {
        Err(DriverError::NotImplemented("wait", self.driver_type()))
    }

    async fn stats(&self, _ctr: &Container) -> Result<StatsStream, DriverError> {
        Err(DriverError::NotImplemented("stats", self.driver_type()))
    }

    async fn close(&self) -> Result<(), DriverError> {
        Ok(())
    }

    /// Process id of the daemon backing this engine.
    fn pid(&self) -> Result<u32, DriverError> {
        Err(DriverError::NotImplemented("pid", self.driver_type()))
    }

    /// Names of the processes whose resource usage is attributed to this engine.
    fn proc_names(&self) -> Vec<String> {
        vec![]
    }
}

/// Creates a driver of the configured type.
///
/// # Arguments
///
/// * `config` - The driver configuration from the benchmark definition.
///
/// # Returns
///
/// A driver ready to be shared between workers or an error if the engine's client cannot be
/// located or connected to.
pub async fn new(config: &Config) -> Result<Arc<dyn Driver>, DriverError> {
    let driver: Arc<dyn Driver> = match config.driver_type {
        DriverType::DockerCli => Arc::new(docker_cli::DockerCliDriver::new(config)?),
        DriverType::Docker => Arc::new(docker::DockerDriver::new(config)?),
        DriverType::Runc | DriverType::Crun | DriverType::Youki => {
            Arc::new(runtime::RuntimeDriver::new(config)?)
        }
        DriverType::Ctr => Arc::new(ctr::CtrDriver::new(config)?),
        DriverType::Containerd => Arc::new(containerd::ContainerdDriver::new(config).await?),
        DriverType::Cri => Arc::new(cri::CriDriver::new(config).await?),
        DriverType::Null => Arc::new(null::NullDriver),
    };
    Ok(driver)
}

/// Races a driver call against the cancellation token. In-flight subprocesses are killed when
/// the losing future is dropped.
pub async fn cancellable<T, F>(token: &CancellationToken, fut: F) -> Result<T, DriverError>
where
    F: Future<Output = Result<T, DriverError>>,
{
    tokio::select! {
        _ = token.cancelled() => Err(DriverError::Cancelled),
        res = fut => res,
    }
}

/// Finds the first running process whose name matches one of `names`.
pub(crate) fn find_daemon_pid(names: &[&str]) -> Result<u32, DriverError> {
    let mut system = System::new();
    system.refresh_all();

    system
        .processes()
        .values()
        .find(|proc| {
            let proc_name = proc.name().to_string_lossy();
            names.iter().any(|name| proc_name == *name)
        })
        .map(|proc| proc.pid().as_u32())
        .ok_or_else(|| DriverError::Config(format!("no running process named {}", names.join("|"))))
}

pub(crate) fn is_benchmark_container(name: &str) -> bool {
    name.trim_start_matches('/').starts_with(CONTAINER_NAME_PREFIX)
}
