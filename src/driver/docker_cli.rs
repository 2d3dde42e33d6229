use super::{
    find_daemon_pid, is_benchmark_container, Config, Container, Driver, DriverError, DriverType, ExecOutput, StatsStream,
    CONTAINER_NAME_PREFIX,
};
use crate::exec::{exec_cmd, exec_cmd_stream, exec_timed_cmd, resolve_binary};
use async_trait::async_trait;
use futures_util::StreamExt;
use std::{collections::BTreeMap, path::PathBuf};
use tracing::{debug, info, warn};

const DEFAULT_DOCKER_BINARY: &str = "docker";

pub(crate) const DOCKER_PROC_NAMES: [&str; 5] = [
    "dockerd",
    "docker-containerd",
    "docker-containerd-shim",
    "containerd-shim-runc-v2",
    "docker-proxy",
];

/// Drives Docker through its command line client.
#[derive(Debug)]
pub struct DockerCliDriver {
    binary: PathBuf,
    log_driver: Option<String>,
    log_opts: BTreeMap<String, String>,
    stream_stats: bool,
}
impl DockerCliDriver {
    pub fn new(config: &Config) -> Result<Self, DriverError> {
        let binary = resolve_binary(config.path.as_deref().unwrap_or(DEFAULT_DOCKER_BINARY))?;
        debug!(
            "docker CLI driver using {} (log driver: {:?})",
            binary.display(),
            config.log_driver
        );

        Ok(Self {
            binary,
            log_driver: config.log_driver.clone(),
            log_opts: config.log_opts.clone(),
            stream_stats: config.stream_stats,
        })
    }

    fn run_args(&self, ctr: &Container) -> Result<Vec<String>, DriverError> {
        let mut args = vec!["run".to_string()];
        if ctr.detached {
            args.push("-d".to_string());
        }

        if let Some(log_driver) = &self.log_driver {
            args.push("--log-driver".to_string());
            args.push(log_driver.clone());
            for (name, value) in self.log_opts.iter() {
                args.push("--log-opt".to_string());
                args.push(format!("{name}={value}"));
            }
        }

        args.push("--name".to_string());
        args.push(ctr.name.clone());
        args.push(ctr.image.clone());

        if let Some(command) = &ctr.command {
            let words = shlex::split(command).ok_or_else(|| {
                DriverError::Config(format!("command override is not POSIX compliant: {command}"))
            })?;
            args.extend(words);
        }

        Ok(args)
    }

    async fn docker(&self, args: &[&str]) -> Result<ExecOutput, DriverError> {
        let args = args.iter().map(|arg| arg.to_string()).collect::<Vec<_>>();
        exec_timed_cmd(&self.binary, &args).await
    }
}

#[async_trait]
impl Driver for DockerCliDriver {
    fn driver_type(&self) -> DriverType {
        DriverType::DockerCli
    }

    fn path(&self) -> String {
        self.binary.display().to_string()
    }

    async fn info(&self) -> Result<String, DriverError> {
        let version = exec_cmd(&self.binary, &["version".to_string()]).await?;
        let info = exec_cmd(&self.binary, &["info".to_string()]).await?;

        Ok(format!(
            "docker driver (binary: {})\n{}",
            self.binary.display(),
            parse_daemon_info(&version, &info)
        ))
    }

    async fn create(
        &self,
        name: &str,
        image: &str,
        cmd_override: Option<&str>,
        detached: bool,
        trace: bool,
    ) -> Result<Container, DriverError> {
        Ok(Container::new(name, image, cmd_override, detached, trace))
    }

    async fn clean(&self) -> Result<(), DriverError> {
        info!("Docker: removing any containers left over from earlier runs");
        let out = exec_cmd(
            &self.binary,
            &[
                "ps".to_string(),
                "-a".to_string(),
                "--filter".to_string(),
                format!("name={CONTAINER_NAME_PREFIX}"),
                "--format".to_string(),
                "{{.ID}} {{.Names}}".to_string(),
            ],
        )
        .await?;

        let ids = benchmark_ids(&out);
        if ids.is_empty() {
            return Ok(());
        }

        let mut args = vec!["rm".to_string(), "-f".to_string()];
        args.extend(ids);
        if let Err(err) = exec_cmd(&self.binary, &args).await {
            warn!("Docker: failed to remove {CONTAINER_NAME_PREFIX}-* containers: {err}");
            return Err(err);
        }
        Ok(())
    }

    async fn run(&self, ctr: &Container) -> Result<ExecOutput, DriverError> {
        let args = self.run_args(ctr)?;
        exec_timed_cmd(&self.binary, &args).await
    }

    async fn stop(&self, ctr: &Container) -> Result<ExecOutput, DriverError> {
        self.docker(&["stop", &ctr.name]).await
    }

    async fn remove(&self, ctr: &Container) -> Result<ExecOutput, DriverError> {
        self.docker(&["rm", &ctr.name]).await
    }

    async fn pause(&self, ctr: &Container) -> Result<ExecOutput, DriverError> {
        self.docker(&["pause", &ctr.name]).await
    }

    async fn unpause(&self, ctr: &Container) -> Result<ExecOutput, DriverError> {
        self.docker(&["unpause", &ctr.name]).await
    }

    async fn wait(&self, ctr: &Container) -> Result<ExecOutput, DriverError> {
        self.docker(&["wait", &ctr.name]).await
    }

    async fn stats(&self, ctr: &Container) -> Result<StatsStream, DriverError> {
        let mut args = vec!["stats".to_string()];
        if !self.stream_stats {
            args.push("--no-stream".to_string());
        }
        args.push(ctr.name.clone());
        Ok(exec_cmd_stream(&self.binary, &args)?.boxed())
    }

    fn pid(&self) -> Result<u32, DriverError> {
        find_daemon_pid(&["dockerd"])
    }

    fn proc_names(&self) -> Vec<String> {
        DOCKER_PROC_NAMES.iter().map(|name| name.to_string()).collect()
    }
}

/// Condenses `docker version` and `docker info` output into a single line.
pub(crate) fn parse_daemon_info(version: &str, info: &str) -> String {
    let mut client = String::new();
    let mut server = String::new();
    let mut seen_client_api = false;

    for line in version.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        match key.trim() {
            "Version" if client.is_empty() => client.push_str(value),
            "Version" => server.push_str(value),
            "API version" if !seen_client_api => {
                seen_client_api = true;
                client.push_str(&format!("|API:{value}"));
            }
            "API version" => server.push_str(&format!("|API:{value}")),
            _ => {}
        }
    }

    for line in info.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        match key.trim() {
            "Kernel Version" => server.push_str(&format!("|Kernel:{value}")),
            "Storage Driver" => server.push_str(&format!("|Storage:{value}")),
            "Backing Filesystem" => server.push_str(&format!("|BackingFS:{value}")),
            _ => {}
        }
    }

    format!("[CLIENT:{client}][SERVER:{server}]")
}

/// Ids of benchmark containers in `docker ps --format "{{.ID}} {{.Names}}"` output. The name
/// filter passed to `ps` matches substrings, so names are checked again here.
fn benchmark_ids(ps_output: &str) -> Vec<String> {
    ps_output
        .lines()
        .filter_map(|line| line.split_once(char::is_whitespace))
        .filter(|(_, name)| is_benchmark_container(name.trim()))
        .map(|(id, _)| id.to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const VERSION: &str = "Client: Docker Engine - Community
 Version:           24.0.7
 API version:       1.43
 Go version:        go1.20.10

Server: Docker Engine - Community
 Engine:
  Version:          24.0.7
  API version:      1.43 (minimum version 1.12)
";

    const INFO: &str = "Server:
 Containers: 3
 Storage Driver: overlay2
  Backing Filesystem: extfs
 Kernel Version: 6.5.0-14-generic
";

    #[test]
    fn daemon_info_is_condensed() {
        let info = parse_daemon_info(VERSION, INFO);
        assert_eq!(
            info,
            "[CLIENT:24.0.7|API:1.43][SERVER:24.0.7|API:1.43 (minimum version 1.12)|Storage:overlay2|BackingFS:extfs|Kernel:6.5.0-14-generic]"
        );
    }

    fn driver(log_driver: Option<&str>) -> DockerCliDriver {
        let mut log_opts = BTreeMap::new();
        log_opts.insert("max-size".to_string(), "1m".to_string());
        DockerCliDriver {
            binary: PathBuf::from("/usr/bin/docker"),
            log_driver: log_driver.map(str::to_string),
            log_opts,
            stream_stats: false,
        }
    }

    #[test]
    fn run_args_include_log_options_and_command() -> anyhow::Result<()> {
        let ctr = Container::new("cb-ctr-1-0", "busybox", Some("sleep 30"), true, false);
        let args = driver(Some("json-file")).run_args(&ctr)?;
        assert_eq!(
            args,
            vec![
                "run",
                "-d",
                "--log-driver",
                "json-file",
                "--log-opt",
                "max-size=1m",
                "--name",
                "cb-ctr-1-0",
                "busybox",
                "sleep",
                "30"
            ]
        );
        Ok(())
    }

    #[test]
    fn log_options_are_ignored_without_a_log_driver() -> anyhow::Result<()> {
        let ctr = Container::new("cb-ctr-1-0", "busybox", None, false, false);
        let args = driver(None).run_args(&ctr)?;
        assert_eq!(args, vec!["run", "--name", "cb-ctr-1-0", "busybox"]);
        Ok(())
    }

    #[test]
    fn clean_skips_names_that_only_contain_the_prefix() {
        let ps = "0a1b2c3d4e5f cb-ctr-1-0\n1b2c3d4e5f60 my-cb-ctr-x\n2c3d4e5f6071 cb-ctr-validate\n";
        assert_eq!(benchmark_ids(ps), vec!["0a1b2c3d4e5f", "2c3d4e5f6071"]);
        assert!(benchmark_ids("").is_empty());
    }
}
