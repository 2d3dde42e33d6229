pub mod cgroups;
pub mod process_tree;

use crate::driver::Driver;
use anyhow::Context;
use serde::{Deserialize, Serialize};

/// One observation of a daemon's resource usage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcMetrics {
    /// Resident memory in bytes.
    pub mem: u64,
    /// CPU usage as a percentage of a single core.
    pub cpu: f64,
}

/// A source of resource usage samples for one daemon.
pub trait Sampler: Send {
    fn query(&mut self) -> anyhow::Result<ProcMetrics>;
}

/// Builds the sampler for the given driver. Control group accounting is used when a cgroup path
/// is configured on Linux, otherwise the daemon's process tree is walked.
///
/// # Arguments
///
/// * `driver` - The driver whose daemon should be observed.
/// * `cgroup_path` - Optional control group of the daemon, e.g. `/system.slice/docker.service`.
///
/// # Returns
///
/// A boxed sampler, or an error if the daemon cannot be located.
pub fn new_sampler(
    driver: &dyn Driver,
    cgroup_path: Option<&str>,
) -> anyhow::Result<Box<dyn Sampler>> {
    if let Some(path) = cgroup_path {
        if cfg!(target_os = "linux") {
            let sampler = cgroups::CGroupsSampler::new(path)
                .context(format!("Unable to sample cgroup {path}"))?;
            return Ok(Box::new(sampler));
        }
        tracing::warn!("cgroup sampling is only available on Linux, falling back to process tree");
    }

    let pid = driver.pid().context(format!(
        "Unable to find the daemon for the {} driver",
        driver.driver_type()
    ))?;
    Ok(Box::new(process_tree::ProcessTreeSampler::new(
        pid,
        driver.proc_names(),
    )))
}
