use crate::{
    bench::Workload,
    driver::{self, DriverType},
    metrics_logger::DEFAULT_SAMPLE_INTERVAL,
};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

// ******** ******** ********
// **      BENCHMARK       **
// ******** ******** ********
#[derive(Debug, Deserialize, PartialEq, Serialize, Clone)]
pub struct Benchmark {
    pub name: String,
    #[serde(default)]
    pub image: String,
    /// Exploded OCI bundle used by bundle based drivers in place of `image`.
    pub rootfs: Option<String>,
    pub command: Option<String>,
    #[serde(default)]
    pub detached: bool,
    pub drivers: Vec<DriverEntry>,
    pub commands: Vec<String>,
}
impl Benchmark {
    /// Reads a benchmark definition. Files ending in `.toml` are parsed as TOML, anything else as
    /// YAML.
    pub fn try_from_path(path: &Path) -> anyhow::Result<Benchmark> {
        let conf_str =
            fs::read_to_string(path).context(format!("Unable to read {}", path.display()))?;
        let benchmark = match path.extension().and_then(|ext| ext.to_str()) {
            Some("toml") => Benchmark::try_from_toml_str(&conf_str),
            _ => Benchmark::try_from_str(&conf_str),
        };
        benchmark.context(format!("Error reading benchmark file {}", path.display()))
    }

    pub fn try_from_str(conf_str: &str) -> anyhow::Result<Benchmark> {
        let benchmark = serde_yaml::from_str::<Benchmark>(conf_str)
            .map_err(|e| anyhow::anyhow!("YAML parsing error: {}", e))?;
        benchmark.validate()?;
        Ok(benchmark)
    }

    pub fn try_from_toml_str(conf_str: &str) -> anyhow::Result<Benchmark> {
        let benchmark = toml::from_str::<Benchmark>(conf_str)
            .map_err(|e| anyhow::anyhow!("TOML parsing error: {}", e))?;
        benchmark.validate()?;
        Ok(benchmark)
    }

    /// Checks everything that can be checked without touching an engine.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.image.is_empty() {
            return Err(anyhow::anyhow!(
                "Please provide an 'image:' entry in your benchmark"
            ));
        }
        if self.commands.is_empty() {
            return Err(anyhow::anyhow!(
                "Benchmark {} has no commands to run",
                self.name
            ));
        }

        for entry in &self.drivers {
            let driver_type = entry.driver_type()?;
            if driver_type.needs_bundle() && self.rootfs.is_none() {
                return Err(anyhow::anyhow!(
                    "No rootfs defined in the benchmark; driver {} requires a root FS path",
                    entry.driver_type
                ));
            }
            if entry.threads == 0 || entry.iterations == 0 {
                return Err(anyhow::anyhow!(
                    "Driver {} needs at least one thread and one iteration",
                    entry.driver_type
                ));
            }
        }

        Ok(())
    }

    /// The workload for one driver entry. Bundle based drivers run the rootfs instead of the
    /// image.
    pub fn workload(&self, entry: &DriverEntry, trace: bool) -> anyhow::Result<Workload> {
        let image = if entry.driver_type()?.needs_bundle() {
            self.rootfs.clone().context(format!(
                "Driver {} requires a root FS path",
                entry.driver_type
            ))?
        } else {
            self.image.clone()
        };

        Ok(Workload {
            name: self.name.clone(),
            image,
            command: self.command.clone(),
            detached: self.detached,
            trace,
            commands: self.commands.clone(),
        })
    }
}

#[derive(Debug, Deserialize, PartialEq, Serialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct DriverEntry {
    #[serde(rename = "type")]
    pub driver_type: String,
    #[serde(rename = "clientpath")]
    pub client_path: Option<String>,
    pub threads: usize,
    pub iterations: usize,
    pub log_driver: Option<String>,
    #[serde(default)]
    pub log_opts: BTreeMap<String, String>,
    pub cgroup_path: Option<String>,
    #[serde(default)]
    pub stream_stats: bool,
    pub stats_interval_sec: Option<u64>,
    pub sandbox_config: Option<PathBuf>,
    pub container_config: Option<PathBuf>,
}
impl DriverEntry {
    pub fn driver_type(&self) -> anyhow::Result<DriverType> {
        self.driver_type
            .parse::<DriverType>()
            .context("Unknown driver in benchmark")
    }

    /// Daemon sampling period. An absent or zero `statsIntervalSec` means the default.
    pub fn sample_interval(&self) -> Duration {
        match self.stats_interval_sec {
            Some(secs) if secs > 0 => Duration::from_secs(secs),
            _ => DEFAULT_SAMPLE_INTERVAL,
        }
    }

    pub fn driver_config(&self) -> anyhow::Result<driver::Config> {
        let mut config = driver::Config::new(self.driver_type()?);
        config.path = self.client_path.clone();
        config.log_driver = self.log_driver.clone();
        config.log_opts = self.log_opts.clone();
        config.stream_stats = self.stream_stats;
        config.sandbox_config = self.sandbox_config.clone();
        config.container_config = self.container_config.clone();
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn can_load_benchmark_file() -> anyhow::Result<()> {
        let benchmark = Benchmark::try_from_path(Path::new("./fixtures/basic.yaml"))?;
        assert_eq!(benchmark.name, "basic");
        assert_eq!(benchmark.drivers.len(), 2);
        assert_eq!(
            benchmark.commands,
            vec!["run", "pause", "resume", "stop", "delete"]
        );

        let docker = &benchmark.drivers[0];
        assert_eq!(docker.driver_type()?, DriverType::DockerCli);
        assert_eq!(docker.log_opts.get("max-size"), Some(&"1m".to_string()));
        assert_eq!(docker.stats_interval_sec, Some(1));
        Ok(())
    }

    #[test]
    fn can_load_toml_benchmark_file() -> anyhow::Result<()> {
        let benchmark = Benchmark::try_from_path(Path::new("./fixtures/basic.toml"))?;
        assert_eq!(benchmark.drivers[0].driver_type()?, DriverType::Docker);
        assert!(benchmark.detached);
        Ok(())
    }

    #[test]
    fn zero_stats_interval_uses_the_default() -> anyhow::Result<()> {
        let benchmark = Benchmark::try_from_str(
            "name: x\nimage: busybox\ndrivers: [{type: Null, threads: 1, iterations: 1, statsIntervalSec: 0}, {type: Null, threads: 1, iterations: 1, statsIntervalSec: 2}]\ncommands: [run]\n",
        )?;
        assert_eq!(benchmark.drivers[0].stats_interval_sec, Some(0));
        assert_eq!(benchmark.drivers[0].sample_interval(), DEFAULT_SAMPLE_INTERVAL);
        assert_eq!(benchmark.drivers[1].sample_interval(), Duration::from_secs(2));
        Ok(())
    }

    #[test]
    fn missing_image_is_rejected() {
        let res = Benchmark::try_from_str(
            "name: x\ndrivers: [{type: Null, threads: 1, iterations: 1}]\ncommands: [run]\n",
        );
        assert!(res.is_err());
    }

    #[test]
    fn bundle_drivers_need_rootfs() {
        let res = Benchmark::try_from_str(
            "name: x\nimage: busybox\ndrivers: [{type: runc, threads: 1, iterations: 1}]\ncommands: [run]\n",
        );
        assert!(res.is_err());
    }

    #[test]
    fn unknown_driver_is_rejected() {
        let res = Benchmark::try_from_str(
            "name: x\nimage: busybox\ndrivers: [{type: podman, threads: 1, iterations: 1}]\ncommands: [run]\n",
        );
        assert!(res.is_err());
    }

    #[test]
    fn zero_threads_are_rejected() {
        let res = Benchmark::try_from_str(
            "name: x\nimage: busybox\ndrivers: [{type: Null, threads: 0, iterations: 1}]\ncommands: [run]\n",
        );
        assert!(res.is_err());
    }

    #[test]
    fn empty_commands_are_rejected() {
        let res = Benchmark::try_from_str(
            "name: x\nimage: busybox\ndrivers: [{type: Null, threads: 1, iterations: 1}]\ncommands: []\n",
        );
        assert!(res.is_err());
    }

    #[test]
    fn bundle_drivers_run_the_rootfs() -> anyhow::Result<()> {
        let benchmark = Benchmark::try_from_str(
            r#"
name: x
image: busybox
rootfs: /bundles/busybox
command: "sleep 5"
drivers:
  - type: Runc
    threads: 1
    iterations: 1
  - type: DockerCLI
    clientpath: /usr/local/bin/docker
    threads: 1
    iterations: 1
commands: [run]
"#,
        )?;

        let runc = benchmark.workload(&benchmark.drivers[0], true)?;
        assert_eq!(runc.image, "/bundles/busybox");
        assert!(runc.trace);
        assert_eq!(runc.command.as_deref(), Some("sleep 5"));

        let docker = benchmark.workload(&benchmark.drivers[1], false)?;
        assert_eq!(docker.image, "busybox");
        assert_eq!(
            benchmark.drivers[1].driver_config()?.path.as_deref(),
            Some("/usr/local/bin/docker")
        );
        Ok(())
    }
}
