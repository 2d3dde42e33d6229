use super::{
    docker_cli::DOCKER_PROC_NAMES, find_daemon_pid, is_benchmark_container, Config, Container,
    Driver, DriverError, DriverType, ExecOutput, StatsStream, CONTAINER_NAME_PREFIX,
};
use async_trait::async_trait;
use bollard::{
    container::{
        self, CreateContainerOptions, ListContainersOptions, RemoveContainerOptions,
        StartContainerOptions, StatsOptions, StopContainerOptions, WaitContainerOptions,
    },
    image::CreateImageOptions,
    models::{HostConfig, HostConfigLogConfig},
    Docker,
};
use futures_util::{StreamExt, TryStreamExt};
use std::{
    collections::{BTreeMap, HashMap},
    time::Instant,
};
use tracing::{debug, info};

const STOP_TIMEOUT_SECS: i64 = 10;

/// Drives Docker through the Engine API.
#[derive(Debug)]
pub struct DockerDriver {
    docker: Docker,
    endpoint: String,
    log_driver: Option<String>,
    log_opts: BTreeMap<String, String>,
    stream_stats: bool,
}
impl DockerDriver {
    pub fn new(config: &Config) -> Result<Self, DriverError> {
        let (docker, endpoint) = match &config.path {
            Some(path) => (
                Docker::connect_with_socket(path, 120, bollard::API_DEFAULT_VERSION)?,
                path.clone(),
            ),
            None => (
                Docker::connect_with_local_defaults()?,
                "local default".to_string(),
            ),
        };
        debug!("docker API driver connected to {endpoint}");

        Ok(Self {
            docker,
            endpoint,
            log_driver: config.log_driver.clone(),
            log_opts: config.log_opts.clone(),
            stream_stats: config.stream_stats,
        })
    }

    async fn ensure_image(&self, image: &str) -> Result<(), DriverError> {
        if self.docker.inspect_image(image).await.is_ok() {
            return Ok(());
        }

        info!("Docker: pulling image {image}");
        self.docker
            .create_image(
                Some(CreateImageOptions {
                    from_image: image,
                    ..Default::default()
                }),
                None,
                None,
            )
            .try_collect::<Vec<_>>()
            .await?;
        Ok(())
    }

    fn host_config(&self) -> HostConfig {
        let log_config = self.log_driver.as_ref().map(|typ| HostConfigLogConfig {
            typ: Some(typ.clone()),
            config: Some(
                self.log_opts
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect::<HashMap<_, _>>(),
            ),
        });

        HostConfig {
            log_config,
            ..Default::default()
        }
    }
}

#[async_trait]
impl Driver for DockerDriver {
    fn driver_type(&self) -> DriverType {
        DriverType::Docker
    }

    fn path(&self) -> String {
        self.endpoint.clone()
    }

    async fn info(&self) -> Result<String, DriverError> {
        let version = self.docker.version().await?;
        let info = self.docker.info().await?;

        Ok(format!(
            "docker API driver [SERVER:{}|API:{}|Kernel:{}|Storage:{}]",
            version.version.unwrap_or_default(),
            version.api_version.unwrap_or_default(),
            info.kernel_version.unwrap_or_default(),
            info.driver.unwrap_or_default(),
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
        self.ensure_image(image).await?;

        let cmd = match cmd_override {
            Some(command) => Some(shlex::split(command).ok_or_else(|| {
                DriverError::Config(format!("command override is not POSIX compliant: {command}"))
            })?),
            None => None,
        };

        self.docker
            .create_container(
                Some(CreateContainerOptions {
                    name,
                    platform: None,
                }),
                container::Config {
                    image: Some(image.to_string()),
                    cmd,
                    host_config: Some(self.host_config()),
                    ..Default::default()
                },
            )
            .await?;

        Ok(Container::new(name, image, cmd_override, detached, trace))
    }

    async fn clean(&self) -> Result<(), DriverError> {
        let mut filters = HashMap::new();
        filters.insert("name".to_string(), vec![CONTAINER_NAME_PREFIX.to_string()]);

        let containers = self
            .docker
            .list_containers(Some(ListContainersOptions::<String> {
                all: true,
                filters,
                ..Default::default()
            }))
            .await?;

        for container in containers {
            let names = container.names.unwrap_or_default();
            if !names.iter().any(|name| is_benchmark_container(name)) {
                continue;
            }
            let Some(id) = container.id else {
                continue;
            };

            info!("Docker: removing container {:?}", names);
            self.docker
                .remove_container(
                    &id,
                    Some(RemoveContainerOptions {
                        force: true,
                        ..Default::default()
                    }),
                )
                .await?;
        }

        Ok(())
    }

    async fn run(&self, ctr: &Container) -> Result<ExecOutput, DriverError> {
        let start = Instant::now();
        self.docker
            .start_container(&ctr.name, None::<StartContainerOptions<String>>)
            .await?;
        Ok(ExecOutput::new("", start.elapsed()))
    }

    async fn stop(&self, ctr: &Container) -> Result<ExecOutput, DriverError> {
        let start = Instant::now();
        self.docker
            .stop_container(
                &ctr.name,
                Some(StopContainerOptions {
                    t: STOP_TIMEOUT_SECS,
                }),
            )
            .await?;
        Ok(ExecOutput::new("", start.elapsed()))
    }

    async fn remove(&self, ctr: &Container) -> Result<ExecOutput, DriverError> {
        let start = Instant::now();
        self.docker
            .remove_container(
                &ctr.name,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await?;
        Ok(ExecOutput::new("", start.elapsed()))
    }

    async fn pause(&self, ctr: &Container) -> Result<ExecOutput, DriverError> {
        let start = Instant::now();
        self.docker.pause_container(&ctr.name).await?;
        Ok(ExecOutput::new("", start.elapsed()))
    }

    async fn unpause(&self, ctr: &Container) -> Result<ExecOutput, DriverError> {
        let start = Instant::now();
        self.docker.unpause_container(&ctr.name).await?;
        Ok(ExecOutput::new("", start.elapsed()))
    }

    async fn wait(&self, ctr: &Container) -> Result<ExecOutput, DriverError> {
        let start = Instant::now();
        let responses = self
            .docker
            .wait_container(&ctr.name, None::<WaitContainerOptions<String>>)
            .try_collect::<Vec<_>>()
            .await?;
        let output = responses
            .last()
            .map(|res| format!("exit code {}", res.status_code))
            .unwrap_or_default();
        Ok(ExecOutput::new(output, start.elapsed()))
    }

    async fn stats(&self, ctr: &Container) -> Result<StatsStream, DriverError> {
        let stream = self
            .docker
            .stats(
                &ctr.name,
                Some(StatsOptions {
                    stream: self.stream_stats,
                    one_shot: !self.stream_stats,
                }),
            )
            .map(|res| {
                let stats = res?;
                serde_json::to_string(&stats)
                    .map_err(|err| DriverError::Config(format!("unable to encode stats: {err}")))
            });
        Ok(stream.boxed())
    }

    fn pid(&self) -> Result<u32, DriverError> {
        find_daemon_pid(&["dockerd"])
    }

    fn proc_names(&self) -> Vec<String> {
        DOCKER_PROC_NAMES.iter().map(|name| name.to_string()).collect()
    }
}
