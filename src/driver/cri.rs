use super::{
    is_benchmark_container, Config, Container, Driver, DriverError, DriverType, ExecOutput,
};
use async_trait::async_trait;
use k8s_cri::v1::{
    image_service_client::ImageServiceClient, runtime_service_client::RuntimeServiceClient,
    ContainerConfig, ContainerFilter, ContainerMetadata, CreateContainerRequest, ImageSpec,
    ImageStatusRequest, KeyValue, ListContainersRequest, ListPodSandboxRequest, PodSandboxConfig,
    PodSandboxMetadata, PullImageRequest, RemoveContainerRequest, RemovePodSandboxRequest,
    RunPodSandboxRequest, StartContainerRequest, StopContainerRequest, StopPodSandboxRequest,
    VersionRequest,
};
use serde::Deserialize;
use std::{
    collections::{BTreeMap, HashMap},
    path::Path,
    time::{Duration, Instant},
};
use tonic::transport::Channel;
use tracing::{debug, error, info};

const DEFAULT_SOCKET: &str = "/run/containerd/containerd.sock";
const DEFAULT_POD_IMAGE: &str = "registry.k8s.io/pause:3.9";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Pod sandbox settings shared by every pod the driver creates.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SandboxTemplate {
    pub namespace: String,
    pub attempt: u32,
    pub hostname: String,
    pub log_directory: String,
    pub labels: HashMap<String, String>,
    pub annotations: HashMap<String, String>,
    pub pod_image: String,
}
impl Default for SandboxTemplate {
    fn default() -> Self {
        Self {
            namespace: "ctrbench".to_string(),
            attempt: 1,
            hostname: String::new(),
            log_directory: "/tmp".to_string(),
            labels: HashMap::new(),
            annotations: HashMap::new(),
            pod_image: DEFAULT_POD_IMAGE.to_string(),
        }
    }
}

/// Container settings shared by every container the driver creates.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ContainerTemplate {
    pub command: Vec<String>,
    pub args: Vec<String>,
    pub working_dir: String,
    pub envs: BTreeMap<String, String>,
    pub labels: HashMap<String, String>,
    pub annotations: HashMap<String, String>,
    pub log_path: String,
}

/// Sandbox and container templates, loaded once per driver instance.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CriTemplates {
    pub sandbox: SandboxTemplate,
    pub container: ContainerTemplate,
}
impl CriTemplates {
    /// Loads the templates from JSON files, falling back to built-in defaults for any file that
    /// isn't given.
    pub fn load(
        sandbox_path: Option<&Path>,
        container_path: Option<&Path>,
    ) -> Result<Self, DriverError> {
        let sandbox = match sandbox_path {
            Some(path) => read_template(path)?,
            None => SandboxTemplate::default(),
        };
        let container = match container_path {
            Some(path) => read_template(path)?,
            None => ContainerTemplate::default(),
        };
        Ok(Self { sandbox, container })
    }

    fn pod_name(container_name: &str) -> String {
        format!("{container_name}-pod")
    }

    pub fn sandbox_config(&self, container_name: &str) -> PodSandboxConfig {
        let pod_name = Self::pod_name(container_name);
        PodSandboxConfig {
            metadata: Some(PodSandboxMetadata {
                name: pod_name.clone(),
                uid: pod_name.clone(),
                namespace: self.sandbox.namespace.clone(),
                attempt: self.sandbox.attempt,
            }),
            hostname: if self.sandbox.hostname.is_empty() {
                pod_name
            } else {
                self.sandbox.hostname.clone()
            },
            log_directory: self.sandbox.log_directory.clone(),
            labels: self.sandbox.labels.clone(),
            annotations: self.sandbox.annotations.clone(),
            ..Default::default()
        }
    }

    pub fn container_config(&self, ctr: &Container) -> Result<ContainerConfig, DriverError> {
        let command = match &ctr.command {
            Some(command) => shlex::split(command).ok_or_else(|| {
                DriverError::Config(format!("command override is not POSIX compliant: {command}"))
            })?,
            None => self.container.command.clone(),
        };
        let log_path = if self.container.log_path.is_empty() {
            format!("{}.log", ctr.name)
        } else {
            self.container.log_path.clone()
        };

        Ok(ContainerConfig {
            metadata: Some(ContainerMetadata {
                name: ctr.name.clone(),
                attempt: self.sandbox.attempt,
            }),
            image: Some(ImageSpec {
                image: ctr.image.clone(),
                ..Default::default()
            }),
            command,
            args: self.container.args.clone(),
            working_dir: self.container.working_dir.clone(),
            envs: self
                .container
                .envs
                .iter()
                .map(|(key, value)| KeyValue {
                    key: key.clone(),
                    value: value.clone(),
                })
                .collect(),
            labels: self.container.labels.clone(),
            annotations: self.container.annotations.clone(),
            log_path,
            ..Default::default()
        })
    }
}

fn read_template<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, DriverError> {
    let raw = std::fs::read_to_string(path)?;
    serde_json::from_str(&raw).map_err(|err| {
        DriverError::Config(format!("invalid CRI template {}: {err}", path.display()))
    })
}

#[cfg(unix)]
async fn connect(socket: &str) -> Result<Channel, DriverError> {
    use hyper_util::rt::TokioIo;
    use tokio::net::UnixStream;
    use tonic::transport::{Endpoint, Uri};
    use tower::service_fn;

    let path = socket.to_string();
    Endpoint::from_static("http://[::]:50051")
        .connect_timeout(CONNECT_TIMEOUT)
        .connect_with_connector(service_fn(move |_: Uri| {
            let path = path.clone();
            async move {
                Ok::<_, std::io::Error>(TokioIo::new(UnixStream::connect(path).await?))
            }
        }))
        .await
        .map_err(|err| DriverError::Connect {
            endpoint: socket.to_string(),
            reason: err.to_string(),
        })
}

#[cfg(not(unix))]
async fn connect(socket: &str) -> Result<Channel, DriverError> {
    Err(DriverError::Connect {
        endpoint: socket.to_string(),
        reason: "CRI sockets are only supported on unix".to_string(),
    })
}

/// Drives a CRI runtime (containerd, CRI-O) over its gRPC socket. Every container runs inside
/// its own pod sandbox.
#[derive(Debug)]
pub struct CriDriver {
    channel: Channel,
    socket: String,
    templates: CriTemplates,
}
impl CriDriver {
    pub async fn new(config: &Config) -> Result<Self, DriverError> {
        let socket = config
            .path
            .clone()
            .unwrap_or_else(|| DEFAULT_SOCKET.to_string());
        let templates = CriTemplates::load(
            config.sandbox_config.as_deref(),
            config.container_config.as_deref(),
        )?;
        let channel = connect(&socket).await?;
        debug!("CRI driver connected to {socket}");

        Ok(Self {
            channel,
            socket,
            templates,
        })
    }

    fn runtime(&self) -> RuntimeServiceClient<Channel> {
        RuntimeServiceClient::new(self.channel.clone())
    }

    fn images(&self) -> ImageServiceClient<Channel> {
        ImageServiceClient::new(self.channel.clone())
    }

    async fn ensure_image(&self, image: &str) -> Result<(), DriverError> {
        let spec = ImageSpec {
            image: image.to_string(),
            ..Default::default()
        };
        let status = self
            .images()
            .image_status(ImageStatusRequest {
                image: Some(spec.clone()),
                verbose: false,
            })
            .await;

        match status {
            Ok(res) if res.get_ref().image.is_some() => Ok(()),
            _ => {
                info!("CRI: pulling image {image}");
                self.images()
                    .pull_image(PullImageRequest {
                        image: Some(spec),
                        ..Default::default()
                    })
                    .await?;
                Ok(())
            }
        }
    }

    fn pod_id<'a>(&self, ctr: &'a Container) -> Result<&'a str, DriverError> {
        ctr.pod_id
            .as_deref()
            .ok_or_else(|| DriverError::NoContainer(ctr.name.clone()))
    }

    async fn pod_container_ids(&self, pod_id: &str) -> Result<Vec<String>, DriverError> {
        let containers = self
            .runtime()
            .list_containers(ListContainersRequest {
                filter: Some(ContainerFilter {
                    pod_sandbox_id: pod_id.to_string(),
                    ..Default::default()
                }),
            })
            .await?
            .into_inner()
            .containers;
        Ok(containers.into_iter().map(|c| c.id).collect())
    }
}

#[async_trait]
impl Driver for CriDriver {
    fn driver_type(&self) -> DriverType {
        DriverType::Cri
    }

    fn path(&self) -> String {
        self.socket.clone()
    }

    async fn info(&self) -> Result<String, DriverError> {
        let version = self
            .runtime()
            .version(VersionRequest::default())
            .await?
            .into_inner();
        Ok(format!(
            "CRI client driver (Version: {}, API Version: {}, Runtime: {} {})",
            version.version,
            version.runtime_api_version,
            version.runtime_name,
            version.runtime_version
        ))
    }

    async fn create(
        &self,
        name: &str,
        image: &str,
        cmd_override: Option<&str>,
        _detached: bool,
        trace: bool,
    ) -> Result<Container, DriverError> {
        self.ensure_image(image).await?;
        self.ensure_image(&self.templates.sandbox.pod_image).await?;

        let pod = self
            .runtime()
            .run_pod_sandbox(RunPodSandboxRequest {
                config: Some(self.templates.sandbox_config(name)),
                ..Default::default()
            })
            .await?
            .into_inner();

        let mut ctr = Container::new(name, image, cmd_override, true, trace);
        ctr.pod_id = Some(pod.pod_sandbox_id);
        Ok(ctr)
    }

    async fn clean(&self) -> Result<(), DriverError> {
        let containers = self
            .runtime()
            .list_containers(ListContainersRequest::default())
            .await?
            .into_inner()
            .containers;
        for ctr in containers.iter().filter(|c| {
            c.metadata
                .as_ref()
                .is_some_and(|meta| is_benchmark_container(&meta.name))
        }) {
            if let Err(err) = self
                .runtime()
                .stop_container(StopContainerRequest {
                    container_id: ctr.id.clone(),
                    timeout: 0,
                })
                .await
            {
                error!("CRI: error stopping container {}: {err}", ctr.id);
            }
            if let Err(err) = self
                .runtime()
                .remove_container(RemoveContainerRequest {
                    container_id: ctr.id.clone(),
                })
                .await
            {
                error!("CRI: error removing container {}: {err}", ctr.id);
            }
        }

        let pods = self
            .runtime()
            .list_pod_sandbox(ListPodSandboxRequest::default())
            .await?
            .into_inner()
            .items;
        for pod in pods.iter().filter(|p| {
            p.metadata
                .as_ref()
                .is_some_and(|meta| is_benchmark_container(&meta.name))
        }) {
            let _ = self
                .runtime()
                .stop_pod_sandbox(StopPodSandboxRequest {
                    pod_sandbox_id: pod.id.clone(),
                })
                .await;
            if let Err(err) = self
                .runtime()
                .remove_pod_sandbox(RemovePodSandboxRequest {
                    pod_sandbox_id: pod.id.clone(),
                })
                .await
            {
                error!("CRI: error removing pod {}: {err}", pod.id);
            }
        }

        info!("CRI cleanup complete");
        Ok(())
    }

    /// Creates the container inside the iteration's pod and starts it.
    async fn run(&self, ctr: &Container) -> Result<ExecOutput, DriverError> {
        let pod_id = self.pod_id(ctr)?;
        let config = self.templates.container_config(ctr)?;
        let sandbox_config = self.templates.sandbox_config(&ctr.name);

        let start = Instant::now();
        let created = self
            .runtime()
            .create_container(CreateContainerRequest {
                pod_sandbox_id: pod_id.to_string(),
                config: Some(config),
                sandbox_config: Some(sandbox_config),
            })
            .await?
            .into_inner();
        self.runtime()
            .start_container(StartContainerRequest {
                container_id: created.container_id.clone(),
            })
            .await?;

        Ok(ExecOutput::new(created.container_id, start.elapsed()))
    }

    async fn stop(&self, ctr: &Container) -> Result<ExecOutput, DriverError> {
        let pod_id = self.pod_id(ctr)?;
        let start = Instant::now();
        for id in self.pod_container_ids(pod_id).await? {
            self.runtime()
                .stop_container(StopContainerRequest {
                    container_id: id,
                    timeout: 0,
                })
                .await?;
        }
        self.runtime()
            .stop_pod_sandbox(StopPodSandboxRequest {
                pod_sandbox_id: pod_id.to_string(),
            })
            .await?;
        Ok(ExecOutput::new("", start.elapsed()))
    }

    async fn remove(&self, ctr: &Container) -> Result<ExecOutput, DriverError> {
        let pod_id = self.pod_id(ctr)?;
        let start = Instant::now();
        for id in self.pod_container_ids(pod_id).await? {
            self.runtime()
                .remove_container(RemoveContainerRequest { container_id: id })
                .await?;
        }
        self.runtime()
            .remove_pod_sandbox(RemovePodSandboxRequest {
                pod_sandbox_id: pod_id.to_string(),
            })
            .await?;
        Ok(ExecOutput::new("", start.elapsed()))
    }

    /// Not part of the CRI API.
    async fn pause(&self, _ctr: &Container) -> Result<ExecOutput, DriverError> {
        Ok(ExecOutput::default())
    }

    /// Not part of the CRI API.
    async fn unpause(&self, _ctr: &Container) -> Result<ExecOutput, DriverError> {
        Ok(ExecOutput::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_templates_name_pods_after_their_container() {
        let templates = CriTemplates::default();
        let config = templates.sandbox_config("cb-ctr-1-0");
        let meta = config.metadata.expect("sandbox metadata");
        assert_eq!(meta.name, "cb-ctr-1-0-pod");
        assert_eq!(meta.namespace, "ctrbench");
        assert!(is_benchmark_container(&meta.name));
        assert_eq!(config.hostname, "cb-ctr-1-0-pod");
    }

    #[test]
    fn command_override_wins_over_template() -> anyhow::Result<()> {
        let mut templates = CriTemplates::default();
        templates.container.command = vec!["top".to_string()];

        let ctr = Container::new("cb-ctr-1-0", "busybox", Some("sleep 30"), true, false);
        let config = templates.container_config(&ctr)?;
        assert_eq!(config.command, vec!["sleep", "30"]);
        assert_eq!(config.image.map(|i| i.image), Some("busybox".to_string()));

        let ctr = Container::new("cb-ctr-1-1", "busybox", None, true, false);
        assert_eq!(templates.container_config(&ctr)?.command, vec!["top"]);
        Ok(())
    }

    #[test]
    fn templates_load_from_json_files() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let sandbox = dir.path().join("sandbox.json");
        let container = dir.path().join("container.json");
        std::fs::write(&sandbox, r#"{"namespace":"bench","logDirectory":"/var/log/pods"}"#)?;
        std::fs::write(&container, r#"{"args":["-c","sleep 5"],"envs":{"A":"1"}}"#)?;

        let templates = CriTemplates::load(Some(&sandbox), Some(&container))?;
        assert_eq!(templates.sandbox.namespace, "bench");
        assert_eq!(templates.sandbox.log_directory, "/var/log/pods");
        assert_eq!(templates.sandbox.pod_image, DEFAULT_POD_IMAGE);
        assert_eq!(templates.container.args, vec!["-c", "sleep 5"]);
        assert_eq!(templates.container.envs.get("A"), Some(&"1".to_string()));
        Ok(())
    }

    #[test]
    fn two_instances_never_share_templates() -> anyhow::Result<()> {
        let mut first = CriTemplates::load(None, None)?;
        let second = CriTemplates::load(None, None)?;
        first.sandbox.namespace = "changed".to_string();
        assert_eq!(second.sandbox.namespace, "ctrbench");
        Ok(())
    }
}
