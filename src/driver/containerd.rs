use super::{
    ctr::CONTAINERD_PROC_NAMES,
    find_daemon_pid, is_benchmark_container,
    runtime::validate_bundle,
    Config, Container, Driver, DriverError, DriverType, ExecOutput, QUIESCE_DELAY,
};
use async_trait::async_trait;
use containerd_client::{
    services::v1::{
        container::Runtime, containers_client::ContainersClient, tasks_client::TasksClient,
        version_client::VersionClient, Container as ContainerRecord, CreateContainerRequest,
        CreateTaskRequest, DeleteContainerRequest, DeleteTaskRequest, KillRequest,
        ListContainersRequest, PauseTaskRequest, ResumeTaskRequest, StartRequest, WaitRequest,
    },
    tonic::{metadata::MetadataValue, transport::Channel, Code, Request, Status},
    types::Mount,
};
use serde_json::Value;
use std::{path::Path, time::Instant};
use tokio::time::sleep;
use tracing::{debug, info, warn};

const DEFAULT_SOCKET: &str = "/run/containerd/containerd.sock";
const NAMESPACE: &str = "ctrbench";
const RUNTIME: &str = "io.containerd.runc.v2";
const SPEC_TYPE_URL: &str = "types.containerd.io/opencontainers/runtime-spec/1/Spec";
const SIGKILL: u32 = 9;

fn rpc_error(status: Status) -> DriverError {
    DriverError::Rpc {
        code: format!("{:?}", status.code()),
        message: status.message().to_string(),
    }
}

fn namespaced<T>(message: T) -> Request<T> {
    let mut request = Request::new(message);
    request
        .metadata_mut()
        .insert("containerd-namespace", MetadataValue::from_static(NAMESPACE));
    request
}

/// Reads the bundle's runtime spec, applying a command override to `process.args`.
pub(crate) fn load_bundle_spec(
    bundle: &str,
    cmd_override: Option<&str>,
) -> Result<Vec<u8>, DriverError> {
    let raw = std::fs::read(Path::new(bundle).join("config.json"))?;
    let mut spec: Value = serde_json::from_slice(&raw)
        .map_err(|err| DriverError::Config(format!("invalid runtime spec in {bundle}: {err}")))?;

    if let Some(command) = cmd_override {
        let args = shlex::split(command).ok_or_else(|| {
            DriverError::Config(format!("command override is not POSIX compliant: {command}"))
        })?;
        let process = spec
            .get_mut("process")
            .and_then(Value::as_object_mut)
            .ok_or_else(|| {
                DriverError::Config(format!("runtime spec in {bundle} has no process"))
            })?;
        process.insert("args".to_string(), Value::from(args));
    }

    serde_json::to_vec(&spec)
        .map_err(|err| DriverError::Config(format!("unable to encode runtime spec: {err}")))
}

/// Drives containerd over its gRPC API. Containers are created from exploded bundles whose
/// rootfs is bind mounted into the task.
#[derive(Debug)]
pub struct ContainerdDriver {
    channel: Channel,
    socket: String,
}
impl ContainerdDriver {
    pub async fn new(config: &Config) -> Result<Self, DriverError> {
        let socket = config
            .path
            .clone()
            .unwrap_or_else(|| DEFAULT_SOCKET.to_string());
        let channel = containerd_client::connect(&socket)
            .await
            .map_err(|err| DriverError::Connect {
                endpoint: socket.clone(),
                reason: err.to_string(),
            })?;
        debug!("containerd driver connected to {socket}");

        Ok(Self { channel, socket })
    }

    fn containers(&self) -> ContainersClient<Channel> {
        ContainersClient::new(self.channel.clone())
    }

    fn tasks(&self) -> TasksClient<Channel> {
        TasksClient::new(self.channel.clone())
    }

    async fn kill(&self, id: &str) -> Result<(), DriverError> {
        self.tasks()
            .kill(namespaced(KillRequest {
                container_id: id.to_string(),
                signal: SIGKILL,
                all: true,
                ..Default::default()
            }))
            .await
            .map_err(rpc_error)?;
        Ok(())
    }

    async fn wait_exit(&self, id: &str) -> Result<u32, DriverError> {
        let res = self
            .tasks()
            .wait(namespaced(WaitRequest {
                container_id: id.to_string(),
                ..Default::default()
            }))
            .await
            .map_err(rpc_error)?;
        Ok(res.into_inner().exit_status)
    }

    async fn delete_task(&self, id: &str) -> Result<(), DriverError> {
        match self
            .tasks()
            .delete(namespaced(DeleteTaskRequest {
                container_id: id.to_string(),
            }))
            .await
        {
            Ok(_) => Ok(()),
            Err(status) if status.code() == Code::NotFound => Ok(()),
            Err(status) => Err(rpc_error(status)),
        }
    }

    async fn delete_container(&self, id: &str) -> Result<(), DriverError> {
        self.containers()
            .delete(namespaced(DeleteContainerRequest { id: id.to_string() }))
            .await
            .map_err(rpc_error)?;
        Ok(())
    }
}

#[async_trait]
impl Driver for ContainerdDriver {
    fn driver_type(&self) -> DriverType {
        DriverType::Containerd
    }

    fn path(&self) -> String {
        self.socket.clone()
    }

    async fn info(&self) -> Result<String, DriverError> {
        let version = VersionClient::new(self.channel.clone())
            .version(())
            .await
            .map_err(rpc_error)?
            .into_inner();
        Ok(format!(
            "containerd driver (socket: {})[version: {}][revision: {}]",
            self.socket, version.version, version.revision
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
        validate_bundle(image)?;
        Ok(Container::new(name, image, cmd_override, true, trace))
    }

    async fn clean(&self) -> Result<(), DriverError> {
        let listed = self
            .containers()
            .list(namespaced(ListContainersRequest::default()))
            .await
            .map_err(rpc_error)?
            .into_inner()
            .containers;

        for record in listed.iter().filter(|c| is_benchmark_container(&c.id)) {
            info!("containerd: removing container {:?}", record.id);
            let _ = self.kill(&record.id).await;
            sleep(QUIESCE_DELAY).await;
            if let Err(err) = self.delete_task(&record.id).await {
                warn!("containerd: failed to delete task {:?}: {err}", record.id);
            }
            if let Err(err) = self.delete_container(&record.id).await {
                warn!("containerd: failed to delete container {:?}: {err}", record.id);
            }
        }
        Ok(())
    }

    async fn run(&self, ctr: &Container) -> Result<ExecOutput, DriverError> {
        let spec_bytes = load_bundle_spec(&ctr.image, ctr.command.as_deref())?;
        let rootfs = Path::new(&ctr.image).join("rootfs");

        let start = Instant::now();

        let mut record = ContainerRecord {
            id: ctr.name.clone(),
            runtime: Some(Runtime {
                name: RUNTIME.to_string(),
                options: None,
            }),
            spec: Some(Default::default()),
            ..Default::default()
        };
        if let Some(spec) = record.spec.as_mut() {
            spec.type_url = SPEC_TYPE_URL.to_string();
            spec.value = spec_bytes;
        }
        self.containers()
            .create(namespaced(CreateContainerRequest {
                container: Some(record),
            }))
            .await
            .map_err(rpc_error)?;

        self.tasks()
            .create(namespaced(CreateTaskRequest {
                container_id: ctr.name.clone(),
                rootfs: vec![Mount {
                    r#type: "bind".to_string(),
                    source: rootfs.display().to_string(),
                    options: vec!["rbind".to_string(), "rw".to_string()],
                    ..Default::default()
                }],
                ..Default::default()
            }))
            .await
            .map_err(rpc_error)?;

        let started = self
            .tasks()
            .start(namespaced(StartRequest {
                container_id: ctr.name.clone(),
                ..Default::default()
            }))
            .await
            .map_err(rpc_error)?
            .into_inner();

        Ok(ExecOutput::new(format!("pid {}", started.pid), start.elapsed()))
    }

    /// Kills the task and waits for it to exit so it can be deleted afterwards.
    async fn stop(&self, ctr: &Container) -> Result<ExecOutput, DriverError> {
        let start = Instant::now();
        self.kill(&ctr.name).await?;
        let status = self.wait_exit(&ctr.name).await?;
        Ok(ExecOutput::new(format!("exit status {status}"), start.elapsed()))
    }

    async fn remove(&self, ctr: &Container) -> Result<ExecOutput, DriverError> {
        let start = Instant::now();
        self.delete_task(&ctr.name).await?;
        self.delete_container(&ctr.name).await?;
        Ok(ExecOutput::new("", start.elapsed()))
    }

    async fn pause(&self, ctr: &Container) -> Result<ExecOutput, DriverError> {
        let start = Instant::now();
        self.tasks()
            .pause(namespaced(PauseTaskRequest {
                container_id: ctr.name.clone(),
            }))
            .await
            .map_err(rpc_error)?;
        Ok(ExecOutput::new("", start.elapsed()))
    }

    async fn unpause(&self, ctr: &Container) -> Result<ExecOutput, DriverError> {
        let start = Instant::now();
        self.tasks()
            .resume(namespaced(ResumeTaskRequest {
                container_id: ctr.name.clone(),
            }))
            .await
            .map_err(rpc_error)?;
        Ok(ExecOutput::new("", start.elapsed()))
    }

    async fn wait(&self, ctr: &Container) -> Result<ExecOutput, DriverError> {
        let start = Instant::now();
        let status = self.wait_exit(&ctr.name).await?;
        Ok(ExecOutput::new(format!("exit status {status}"), start.elapsed()))
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_override_replaces_process_args() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        std::fs::write(
            dir.path().join("config.json"),
            r#"{"ociVersion":"1.0.2","process":{"args":["sh"],"cwd":"/"},"root":{"path":"rootfs"}}"#,
        )?;
        let bundle = dir.path().to_string_lossy().to_string();

        let spec: Value = serde_json::from_slice(&load_bundle_spec(&bundle, Some("sleep 30"))?)?;
        assert_eq!(spec["process"]["args"], serde_json::json!(["sleep", "30"]));
        assert_eq!(spec["root"]["path"], "rootfs");

        let untouched: Value = serde_json::from_slice(&load_bundle_spec(&bundle, None)?)?;
        assert_eq!(untouched["process"]["args"], serde_json::json!(["sh"]));
        Ok(())
    }
}
