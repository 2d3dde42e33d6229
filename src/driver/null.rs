use super::{Container, Driver, DriverError, DriverType, ExecOutput};
use async_trait::async_trait;

/// Driver for benchmarks that need no container engine. Every operation succeeds immediately.
#[derive(Debug, Default)]
pub struct NullDriver;

#[async_trait]
impl Driver for NullDriver {
    fn driver_type(&self) -> DriverType {
        DriverType::Null
    }

    fn path(&self) -> String {
        String::new()
    }

    async fn info(&self) -> Result<String, DriverError> {
        Ok("null driver".to_string())
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
        Ok(())
    }

    async fn run(&self, _ctr: &Container) -> Result<ExecOutput, DriverError> {
        Ok(ExecOutput::default())
    }

    async fn stop(&self, _ctr: &Container) -> Result<ExecOutput, DriverError> {
        Ok(ExecOutput::default())
    }

    async fn remove(&self, _ctr: &Container) -> Result<ExecOutput, DriverError> {
        Ok(ExecOutput::default())
    }

    async fn pause(&self, _ctr: &Container) -> Result<ExecOutput, DriverError> {
        Ok(ExecOutput::default())
    }

    async fn unpause(&self, _ctr: &Container) -> Result<ExecOutput, DriverError> {
        Ok(ExecOutput::default())
    }

    async fn wait(&self, _ctr: &Container) -> Result<ExecOutput, DriverError> {
        Ok(ExecOutput::default())
    }
}
