use super::{ProcMetrics, Sampler};
use std::collections::{HashMap, HashSet, VecDeque};
use sysinfo::{Pid, System};
use tracing::trace;

/// The parts of a process table entry the tree walk needs.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessSnapshot {
    pub pid: u32,
    pub parent: Option<u32>,
    pub name: String,
    pub memory: u64,
    pub cpu: f32,
}

/// Sums memory and CPU over `root` and all of its descendants whose name is in `names`.
///
/// Non-matching processes are still walked through, so a matching grandchild below a
/// non-matching child is counted. A pid absent from the table contributes nothing.
pub fn sum_process_tree(root: u32, names: &[String], table: &[ProcessSnapshot]) -> ProcMetrics {
    let by_pid = table
        .iter()
        .map(|proc| (proc.pid, proc))
        .collect::<HashMap<_, _>>();

    let mut children: HashMap<u32, Vec<u32>> = HashMap::new();
    for proc in table {
        if let Some(parent) = proc.parent {
            children.entry(parent).or_default().push(proc.pid);
        }
    }

    let mut metrics = ProcMetrics::default();
    let mut visited = HashSet::new();
    let mut queue = VecDeque::from([root]);

    while let Some(pid) = queue.pop_front() {
        if !visited.insert(pid) {
            continue;
        }

        if let Some(proc) = by_pid.get(&pid) {
            if names.iter().any(|name| name == &proc.name) {
                metrics.mem += proc.memory;
                metrics.cpu += proc.cpu as f64;
            }
        }

        if let Some(kids) = children.get(&pid) {
            queue.extend(kids.iter().copied());
        }
    }

    metrics
}

/// Samples a daemon by walking its live process tree with `sysinfo`.
pub struct ProcessTreeSampler {
    system: System,
    root: u32,
    names: Vec<String>,
}
impl ProcessTreeSampler {
    pub fn new(root: u32, names: Vec<String>) -> Self {
        let mut system = System::new();
        // cpu usage is measured between refreshes so take the first one now
        system.refresh_all();
        Self {
            system,
            root,
            names,
        }
    }

    fn snapshot(&self) -> Vec<ProcessSnapshot> {
        self.system
            .processes()
            .values()
            .map(|proc| ProcessSnapshot {
                pid: proc.pid().as_u32(),
                parent: proc.parent().map(|pid| pid.as_u32()),
                name: proc.name().to_string_lossy().into_owned(),
                memory: proc.memory(),
                cpu: proc.cpu_usage(),
            })
            .collect()
    }
}

impl Sampler for ProcessTreeSampler {
    fn query(&mut self) -> anyhow::Result<ProcMetrics> {
        self.system.refresh_all();
        if self.system.process(Pid::from_u32(self.root)).is_none() {
            return Err(anyhow::anyhow!("daemon process {} not found", self.root));
        }

        let metrics = sum_process_tree(self.root, &self.names, &self.snapshot());
        trace!("[PID {}] {:?}", self.root, metrics);
        Ok(metrics)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn proc(pid: u32, parent: Option<u32>, name: &str, memory: u64, cpu: f32) -> ProcessSnapshot {
        ProcessSnapshot {
            pid,
            parent,
            name: name.to_string(),
            memory,
            cpu,
        }
    }

    fn names() -> Vec<String> {
        vec!["dockerd".to_string(), "containerd-shim".to_string()]
    }

    #[test]
    fn non_matching_children_are_excluded() {
        let table = vec![
            proc(1, None, "systemd", 1_000, 1.0),
            proc(100, Some(1), "dockerd", 500, 2.0),
            proc(101, Some(100), "containerd-shim", 200, 0.5),
            proc(102, Some(100), "bash", 10_000, 50.0),
        ];

        let metrics = sum_process_tree(100, &names(), &table);
        assert_eq!(metrics.mem, 700);
        assert_eq!(metrics.cpu, 2.5);
    }

    #[test]
    fn non_matching_root_is_excluded_but_walked() {
        let table = vec![
            proc(100, None, "init-wrapper", 5_000, 9.0),
            proc(101, Some(100), "bash", 10_000, 50.0),
            proc(102, Some(101), "containerd-shim", 200, 0.5),
        ];

        let metrics = sum_process_tree(100, &names(), &table);
        assert_eq!(metrics.mem, 200);
        assert_eq!(metrics.cpu, 0.5);
    }

    #[test]
    fn vanished_processes_contribute_zero() {
        // 101 exited between listing its parent's children and reading its stats
        let table = vec![
            proc(100, None, "dockerd", 500, 2.0),
            proc(102, Some(100), "containerd-shim", 200, 0.5),
        ];
        let metrics = sum_process_tree(100, &names(), &table);
        assert_eq!(metrics.mem, 700);

        let metrics = sum_process_tree(4242, &names(), &table);
        assert_eq!(metrics, ProcMetrics::default());
    }

    #[test]
    fn current_process_can_be_sampled() -> anyhow::Result<()> {
        let pid = std::process::id();
        let mut system = System::new();
        system.refresh_all();
        let name = system
            .process(Pid::from_u32(pid))
            .map(|proc| proc.name().to_string_lossy().into_owned())
            .ok_or_else(|| anyhow::anyhow!("test process not in process table"))?;

        let mut sampler = ProcessTreeSampler::new(pid, vec![name]);
        let metrics = sampler.query()?;
        assert!(metrics.mem > 0);
        Ok(())
    }
}
