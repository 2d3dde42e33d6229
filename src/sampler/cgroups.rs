use super::{ProcMetrics, Sampler};
use anyhow::Context;
use std::{
    fs,
    path::{Path, PathBuf},
    time::Instant,
};

const CGROUP_ROOT: &str = "/sys/fs/cgroup";

#[derive(Debug, Clone, PartialEq)]
enum Layout {
    /// Unified hierarchy, one directory holds every controller.
    V2 { dir: PathBuf },
    /// Legacy hierarchy with separate memory and cpuacct controllers.
    V1 { memory: PathBuf, cpuacct: PathBuf },
}

/// Samples a daemon through its control group's accounting files.
#[derive(Debug)]
pub struct CGroupsSampler {
    layout: Layout,
    last_cpu_ns: u64,
    last_sample: Instant,
}
impl CGroupsSampler {
    pub fn new(cgroup: &str) -> anyhow::Result<Self> {
        Self::with_root(Path::new(CGROUP_ROOT), cgroup)
    }

    /// Builds a sampler against a cgroup filesystem mounted at `root`. The baseline CPU counter is
    /// read immediately so the first query measures from construction time.
    pub fn with_root(root: &Path, cgroup: &str) -> anyhow::Result<Self> {
        let relative = cgroup.trim_start_matches('/');
        let layout = if root.join("cgroup.controllers").exists() {
            Layout::V2 {
                dir: root.join(relative),
            }
        } else {
            Layout::V1 {
                memory: root.join("memory").join(relative),
                cpuacct: root.join("cpuacct").join(relative),
            }
        };

        let mut sampler = Self {
            layout,
            last_cpu_ns: 0,
            last_sample: Instant::now(),
        };
        sampler.last_cpu_ns = sampler.cpu_ns()?;
        sampler.last_sample = Instant::now();
        Ok(sampler)
    }

    fn mem_bytes(&self) -> anyhow::Result<u64> {
        match &self.layout {
            Layout::V2 { dir } => {
                let current = read_u64(&dir.join("memory.current"))?;
                let swap = read_u64(&dir.join("memory.swap.current")).unwrap_or(0);
                Ok(current + swap)
            }
            Layout::V1 { memory, .. } => {
                let usage = read_u64(&memory.join("memory.memsw.usage_in_bytes"))
                    .or_else(|_| read_u64(&memory.join("memory.usage_in_bytes")))?;
                let kmem = read_u64(&memory.join("memory.kmem.usage_in_bytes")).unwrap_or(0);
                Ok(usage + kmem)
            }
        }
    }

    fn cpu_ns(&self) -> anyhow::Result<u64> {
        match &self.layout {
            Layout::V2 { dir } => {
                let path = dir.join("cpu.stat");
                let stat = fs::read_to_string(&path)
                    .context(format!("Unable to read {}", path.display()))?;
                parse_usage_usec(&stat)
                    .map(|usec| usec * 1_000)
                    .context(format!("No usage_usec in {}", path.display()))
            }
            Layout::V1 { cpuacct, .. } => read_u64(&cpuacct.join("cpuacct.usage")),
        }
    }
}

impl Sampler for CGroupsSampler {
    fn query(&mut self) -> anyhow::Result<ProcMetrics> {
        let mem = self.mem_bytes()?;
        let cpu_ns = self.cpu_ns()?;
        let now = Instant::now();

        let wall_ns = now.duration_since(self.last_sample).as_nanos() as f64;
        let cpu = if wall_ns > 0.0 {
            cpu_ns.saturating_sub(self.last_cpu_ns) as f64 / wall_ns * 100.0
        } else {
            0.0
        };

        self.last_cpu_ns = cpu_ns;
        self.last_sample = now;
        Ok(ProcMetrics { mem, cpu })
    }
}

fn read_u64(path: &Path) -> anyhow::Result<u64> {
    let raw = fs::read_to_string(path).context(format!("Unable to read {}", path.display()))?;
    raw.trim()
        .parse::<u64>()
        .context(format!("Unexpected contents in {}", path.display()))
}

fn parse_usage_usec(stat: &str) -> Option<u64> {
    stat.lines().find_map(|line| {
        let (key, value) = line.split_once(' ')?;
        (key == "usage_usec").then(|| value.trim().parse().ok()).flatten()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(path: &Path, contents: &str) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, contents)?;
        Ok(())
    }

    #[test]
    fn usage_usec_is_found_in_cpu_stat() {
        let stat = "usage_usec 123456\nuser_usec 100000\nsystem_usec 23456\n";
        assert_eq!(parse_usage_usec(stat), Some(123456));
        assert_eq!(parse_usage_usec("user_usec 1\n"), None);
    }

    #[test]
    fn v2_memory_includes_swap_and_cpu_is_a_percentage() -> anyhow::Result<()> {
        let root = tempfile::tempdir()?;
        let dir = root.path().join("system.slice/docker.service");
        write(&root.path().join("cgroup.controllers"), "cpu memory")?;
        write(&dir.join("memory.current"), "1048576\n")?;
        write(&dir.join("memory.swap.current"), "4096\n")?;
        write(&dir.join("cpu.stat"), "usage_usec 1000\n")?;

        let mut sampler = CGroupsSampler::with_root(root.path(), "/system.slice/docker.service")?;
        let metrics = sampler.query()?;
        assert_eq!(metrics.mem, 1_052_672);
        // counter hasn't moved since construction
        assert_eq!(metrics.cpu, 0.0);

        write(&dir.join("cpu.stat"), "usage_usec 1000000000\n")?;
        let metrics = sampler.query()?;
        assert!(metrics.cpu > 0.0);
        Ok(())
    }

    #[test]
    fn v1_memory_adds_kernel_memory() -> anyhow::Result<()> {
        let root = tempfile::tempdir()?;
        write(
            &root.path().join("memory/docker/memory.memsw.usage_in_bytes"),
            "2000\n",
        )?;
        write(
            &root.path().join("memory/docker/memory.kmem.usage_in_bytes"),
            "500\n",
        )?;
        write(&root.path().join("cpuacct/docker/cpuacct.usage"), "42\n")?;

        let mut sampler = CGroupsSampler::with_root(root.path(), "docker")?;
        assert_eq!(sampler.query()?.mem, 2500);
        Ok(())
    }

    #[test]
    fn missing_cgroup_is_an_error() -> anyhow::Result<()> {
        let root = tempfile::tempdir()?;
        assert!(CGroupsSampler::with_root(root.path(), "nope").is_err());
        Ok(())
    }
}
