use super::{
    find_daemon_pid,
    runtime::{clean_listed, validate_bundle},
    Config, Container, Driver, DriverError, DriverType, ExecOutput,
};
use crate::exec::{exec_cmd, exec_timed_cmd, exec_timed_cmd_no_out, resolve_binary};
use async_trait::async_trait;
use std::path::PathBuf;

const DEFAULT_CTR_BINARY: &str = "ctr";

pub(crate) const CONTAINERD_PROC_NAMES: [&str; 3] =
    ["containerd", "containerd-shim", "containerd-shim-runc-v2"];

/// Drives containerd in legacy mode through the `ctr` client binary.
#[derive(Debug)]
pub struct CtrDriver {
    binary: PathBuf,
}
impl CtrDriver {
    pub fn new(config: &Config) -> Result<Self, DriverError> {
        let binary = resolve_binary(config.path.as_deref().unwrap_or(DEFAULT_CTR_BINARY))?;
        Ok(Self { binary })
    }

    async fn containers(&self, args: &[&str]) -> Result<ExecOutput, DriverError> {
        let args = std::iter::once("containers")
            .chain(args.iter().copied())
            .map(str::to_string)
            .collect::<Vec<_>>();
        exec_timed_cmd(&self.binary, &args).await
    }
}

#[async_trait]
impl Driver for CtrDriver {
    fn driver_type(&self) -> DriverType {
        DriverType::Ctr
    }

    fn path(&self) -> String {
        self.binary.display().to_string()
    }

    async fn info(&self) -> Result<String, DriverError> {
        let client = exec_cmd(&self.binary, &["--version".to_string()]).await?;
        let daemon = exec_cmd(&self.binary, &["version".to_string()]).await?;
        Ok(format!(
            "containerd legacy driver (ctr client binary: {})[version: {}][daemon version: {}]",
            self.binary.display(),
            client.trim(),
            daemon.trim()
        ))
    }

    async fn create(
        &self,
        name: &str,
        image: &str,
        _cmd_override: Option<&str>,
        _detached: bool,
        trace: bool,
    ) -> Result<Container, DriverError> {
        validate_bundle(image)?;
        // IO streams are always detached for ctr
        Ok(Container::new(name, image, None, true, trace))
    }

    async fn clean(&self) -> Result<(), DriverError> {
        clean_listed(self, &self.binary, &["containers".to_string()]).await
    }

    async fn run(&self, ctr: &Container) -> Result<ExecOutput, DriverError> {
        let args = vec![
            "containers".to_string(),
            "start".to_string(),
            ctr.name.clone(),
            ctr.image.clone(),
        ];
        exec_timed_cmd_no_out(&self.binary, &args).await
    }

    async fn stop(&self, ctr: &Container) -> Result<ExecOutput, DriverError> {
        self.containers(&["kill", &ctr.name]).await
    }

    /// Killing a container also drops its metadata.
    async fn remove(&self, ctr: &Container) -> Result<ExecOutput, DriverError> {
        self.containers(&["kill", &ctr.name]).await
    }

    async fn pause(&self, ctr: &Container) -> Result<ExecOutput, DriverError> {
        self.containers(&["pause", &ctr.name]).await
    }

    async fn unpause(&self, ctr: &Container) -> Result<ExecOutput, DriverError> {
        self.containers(&["resume", &ctr.name]).await
    }

    fn pid(&self) -> Result<u32, DriverError> {
        find_daemon_pid(&["containerd"])
    }

    fn proc_names(&self) -> Vec<String> {
        CONTAINERD_PROC_NAMES
            .iter()
            .map(|name| name.to_string())
            .collect()
    }
}
