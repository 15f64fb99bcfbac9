//! Per-Node Resource Sampling
//!
//! Samples CPU and resident memory of a running node's process tree (the
//! bash wrapper and every tool it spawns) and turns the samples into the
//! benchmark record written next to the node's log.

use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::Path;
use std::time::{Duration, Instant};

use sysinfo::{Pid, ProcessRefreshKind, System};

/// A single resource usage sample.
#[derive(Debug, Clone)]
pub struct ResourceSample {
    pub timestamp: Instant,
    /// Summed over the process tree (100 = one busy core)
    pub cpu_usage: f32,
    pub memory_mb: u64,
}

/// Samples the process tree rooted at one pid.
///
/// The first [`sample`](Self::sample) call only warms up CPU counters.
pub struct ResourceMonitor {
    system: System,
    root: Pid,
    samples: Vec<ResourceSample>,
    warmup_done: bool,
    last_sample: Option<Instant>,
    min_interval: Duration,
}

impl ResourceMonitor {
    pub fn new(pid: u32) -> Self {
        Self {
            system: System::new(),
            root: Pid::from_u32(pid),
            samples: Vec::new(),
            warmup_done: false,
            last_sample: None,
            min_interval: Duration::from_millis(250),
        }
    }

    pub fn with_min_interval(mut self, interval: Duration) -> Self {
        self.min_interval = interval;
        self
    }

    /// Takes a sample, rate-limited by the minimum interval.
    pub fn sample(&mut self) {
        let now = Instant::now();
        let refresh_kind = ProcessRefreshKind::new().with_cpu().with_memory();

        if !self.warmup_done {
            self.system.refresh_processes_specifics(refresh_kind);
            self.warmup_done = true;
            self.last_sample = Some(now);
            return;
        }

        if let Some(last) = self.last_sample {
            if now.duration_since(last) < self.min_interval {
                return;
            }
        }

        self.system.refresh_processes_specifics(refresh_kind);
        self.last_sample = Some(now);

        let tree = self.process_tree();
        if tree.is_empty() {
            return;
        }

        let mut cpu = 0.0;
        let mut memory = 0;
        for pid in &tree {
            if let Some(process) = self.system.process(*pid) {
                cpu += process.cpu_usage();
                memory += process.memory();
            }
        }

        self.samples.push(ResourceSample {
            timestamp: now,
            cpu_usage: cpu,
            memory_mb: memory / (1024 * 1024),
        });
    }

    /// The root pid and all of its live descendants.
    fn process_tree(&self) -> HashSet<Pid> {
        let mut tree = HashSet::new();
        if self.system.process(self.root).is_none() {
            return tree;
        }
        tree.insert(self.root);

        // parents always precede children after enough passes
        loop {
            let before = tree.len();
            for (pid, process) in self.system.processes() {
                if let Some(parent) = process.parent() {
                    if tree.contains(&parent) {
                        tree.insert(*pid);
                    }
                }
            }
            if tree.len() == before {
                break;
            }
        }
        tree
    }

    pub fn get_samples(&self) -> &[ResourceSample] {
        &self.samples
    }

    pub fn peak_memory_mb(&self) -> u64 {
        self.samples.iter().map(|s| s.memory_mb).max().unwrap_or(0)
    }

    pub fn average_cpu(&self) -> f32 {
        if self.samples.is_empty() {
            return 0.0;
        }
        self.samples.iter().map(|s| s.cpu_usage).sum::<f32>() / self.samples.len() as f32
    }

    /// Builds the benchmark record for a node that ran for `wall`.
    pub fn benchmark(&self, wall: Duration) -> BenchmarkRecord {
        BenchmarkRecord {
            wall_seconds: wall.as_secs_f64(),
            max_rss_mb: self.peak_memory_mb(),
            mean_load: self.average_cpu(),
            samples: self.samples.len(),
        }
    }
}

/// Wall time and resource peaks of one node execution.
#[derive(Debug, Clone, PartialEq)]
pub struct BenchmarkRecord {
    pub wall_seconds: f64,
    pub max_rss_mb: u64,
    pub mean_load: f32,
    pub samples: usize,
}

impl BenchmarkRecord {
    pub const HEADER: &'static str = "s\th:m:s\tmax_rss\tmean_load\tsamples";

    fn hms(&self) -> String {
        let total = self.wall_seconds as u64;
        format!("{}:{:02}:{:02}", total / 3600, (total % 3600) / 60, total % 60)
    }

    pub fn to_tsv(&self) -> String {
        format!(
            "{}\n{:.4}\t{}\t{}\t{:.2}\t{}\n",
            Self::HEADER,
            self.wall_seconds,
            self.hms(),
            self.max_rss_mb,
            self.mean_load,
            self.samples
        )
    }

    pub fn write(&self, path: &Path) -> io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, self.to_tsv())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;
    use std::thread;
    use tempfile::tempdir;

    #[test]
    fn test_first_sample_is_warmup() {
        let mut monitor = ResourceMonitor::new(std::process::id());
        monitor.sample();
        assert!(monitor.get_samples().is_empty());
    }

    #[test]
    fn test_samples_own_process() {
        let mut monitor =
            ResourceMonitor::new(std::process::id()).with_min_interval(Duration::from_millis(50));
        monitor.sample();
        thread::sleep(Duration::from_millis(100));
        monitor.sample();

        assert_eq!(monitor.get_samples().len(), 1);
        assert!(monitor.peak_memory_mb() > 0);
    }

    #[test]
    fn test_rate_limited() {
        let mut monitor =
            ResourceMonitor::new(std::process::id()).with_min_interval(Duration::from_secs(60));
        monitor.sample();
        monitor.sample();
        assert!(monitor.get_samples().is_empty());
    }

    #[test]
    fn test_samples_child_process() {
        let mut child = Command::new("sleep").arg("1").spawn().unwrap();
        let mut monitor = ResourceMonitor::new(child.id()).with_min_interval(Duration::from_millis(50));
        monitor.sample();
        thread::sleep(Duration::from_millis(100));
        monitor.sample();
        child.wait().unwrap();

        assert_eq!(monitor.get_samples().len(), 1);
    }

    #[test]
    fn test_exited_process_yields_no_samples() {
        let mut child = Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();

        let mut monitor = ResourceMonitor::new(pid).with_min_interval(Duration::from_millis(10));
        monitor.sample();
        thread::sleep(Duration::from_millis(20));
        monitor.sample();
        assert!(monitor.get_samples().is_empty());
        assert_eq!(monitor.average_cpu(), 0.0);
    }

    #[test]
    fn test_benchmark_record_tsv() {
        let record = BenchmarkRecord {
            wall_seconds: 3725.5,
            max_rss_mb: 512,
            mean_load: 180.0,
            samples: 40,
        };
        let tsv = record.to_tsv();
        let lines: Vec<&str> = tsv.lines().collect();
        assert_eq!(lines[0], BenchmarkRecord::HEADER);
        assert_eq!(lines[1], "3725.5000\t1:02:05\t512\t180.00\t40");
    }

    #[test]
    fn test_benchmark_write_creates_parent() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("S1/benchmarks/kraken2.tsv");
        let monitor = ResourceMonitor::new(std::process::id());
        monitor.benchmark(Duration::from_millis(1500)).write(&path).unwrap();

        let content = fs::read_to_string(&path).unwrap();
        assert!(content.starts_with("s\th:m:s"));
        assert!(content.contains("0:00:01"));
    }
}
