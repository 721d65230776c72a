//! `zonetop.toml` configuration.

use anyhow::{Context, Result};
use gpu_zones::hal::QueueKind;
use gpu_zones::sim::SimConfig;
use gpu_zones::ContextOptions;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Top-level zonetop configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ZonetopConfig {
    /// Options applied to every query context.
    #[serde(default)]
    pub context: ContextOptions,
    /// Simulated device parameters.
    #[serde(default)]
    pub device: SimConfig,
    #[serde(default)]
    pub workload: WorkloadConfig,
    /// One query context is created per queue.
    #[serde(default)]
    pub queues: Vec<QueueEntry>,
}

/// A named command queue.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct QueueEntry {
    /// Context name shown in the trace (e.g. "graphics", "async-compute")
    pub name: String,
    /// Queue type: "direct", "compute" or "copy"
    pub kind: QueueKind,
}

/// Shape of the recording workload driven by `simulate` and `bench`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WorkloadConfig {
    /// Recording threads per queue.
    #[serde(default = "WorkloadConfig::default_threads")]
    pub threads: usize,
    /// Frames recorded by `simulate` unless overridden on the command line.
    #[serde(default = "WorkloadConfig::default_frames")]
    pub frames: u64,
    /// Top-level zones each thread records into its command list per frame.
    #[serde(default = "WorkloadConfig::default_zones_per_list")]
    pub zones_per_list: u32,
    /// Depth of each zone tree; 1 records flat zones.
    #[serde(default = "WorkloadConfig::default_nesting")]
    pub nesting: u32,
    /// Fraction of command lists that are recorded but never submitted.
    #[serde(default)]
    pub discard_ratio: f64,
    /// Simulated GPU work inside every zone, in nanoseconds.
    #[serde(default = "WorkloadConfig::default_work_ns")]
    pub work_ns: u64,
    /// Collect every N frames (`simulate`).
    #[serde(default = "WorkloadConfig::default_collect_every")]
    pub collect_every: u64,
    /// Collector period in microseconds (`bench`).
    #[serde(default = "WorkloadConfig::default_collect_interval_us")]
    pub collect_interval_us: u64,
    /// Call stack frames captured per zone; 0 disables capture.
    #[serde(default)]
    pub callstack_depth: u8,
    /// Capacity of the event channel between recorders and the writer.
    #[serde(default = "WorkloadConfig::default_event_buffer")]
    pub event_buffer: usize,
}

impl WorkloadConfig {
    fn default_threads() -> usize { 4 }
    fn default_frames() -> u64 { 120 }
    fn default_zones_per_list() -> u32 { 8 }
    fn default_nesting() -> u32 { 2 }
    fn default_work_ns() -> u64 { 50_000 }
    fn default_collect_every() -> u64 { 1 }
    fn default_collect_interval_us() -> u64 { 1_000 }
    fn default_event_buffer() -> usize { 64 * 1024 }

    /// Zones recorded per command list, nested ones included.
    pub fn zones_per_list_total(&self) -> u64 {
        self.zones_per_list as u64 * self.nesting.max(1) as u64
    }
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        Self {
            threads: Self::default_threads(),
            frames: Self::default_frames(),
            zones_per_list: Self::default_zones_per_list(),
            nesting: Self::default_nesting(),
            discard_ratio: 0.0,
            work_ns: Self::default_work_ns(),
            collect_every: Self::default_collect_every(),
            collect_interval_us: Self::default_collect_interval_us(),
            callstack_depth: 0,
            event_buffer: Self::default_event_buffer(),
        }
    }
}

impl ZonetopConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let cfg: Self = toml::from_str(&text)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        Ok(cfg)
    }

    /// Reject workloads that cannot run.
    pub fn validate(&self) -> Result<()> {
        if self.queues.is_empty() {
            anyhow::bail!("no queues configured — run `zonetop init > zonetop.toml` to create a config");
        }
        let w = &self.workload;
        if w.threads == 0 {
            anyhow::bail!("workload.threads must be at least 1");
        }
        if w.nesting == 0 {
            anyhow::bail!("workload.nesting must be at least 1");
        }
        if !(0.0..=1.0).contains(&w.discard_ratio) {
            anyhow::bail!("workload.discard_ratio must be within 0.0..=1.0 (got {})", w.discard_ratio);
        }
        if w.collect_every == 0 {
            anyhow::bail!("workload.collect_every must be at least 1");
        }
        if w.event_buffer == 0 {
            anyhow::bail!("workload.event_buffer must be at least 1");
        }
        Ok(())
    }

    /// A graphics queue, an async compute queue and a copy queue on the
    /// simulated device, with a few discarded command lists.
    pub fn default_example() -> Self {
        Self {
            context: ContextOptions { stale_collect_limit: 8, ..ContextOptions::default() },
            device: SimConfig::default(),
            workload: WorkloadConfig { discard_ratio: 0.05, ..WorkloadConfig::default() },
            queues: vec![
                QueueEntry { name: "graphics".into(), kind: QueueKind::Direct },
                QueueEntry { name: "async-compute".into(), kind: QueueKind::Compute },
                QueueEntry { name: "upload".into(), kind: QueueKind::Copy },
            ],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_example_round_trips_through_toml() {
        let text = toml::to_string_pretty(&ZonetopConfig::default_example()).unwrap();
        let cfg: ZonetopConfig = toml::from_str(&text).unwrap();
        assert_eq!(cfg.queues.len(), 3);
        assert_eq!(cfg.queues[2].kind, QueueKind::Copy);
        assert_eq!(cfg.context.stale_collect_limit, 8);
        cfg.validate().unwrap();
    }

    #[test]
    fn test_sparse_config_uses_defaults() {
        let cfg: ZonetopConfig = toml::from_str(
            r#"
            [workload]
            threads = 2

            [[queues]]
            name = "gfx"
            kind = "direct"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.workload.threads, 2);
        assert_eq!(cfg.workload.nesting, 2);
        assert_eq!(cfg.context.max_queries, gpu_zones::MAX_QUERIES);
        assert_eq!(cfg.device.timestamp_frequency, 25_000_000);
        assert_eq!(cfg.workload.zones_per_list_total(), 16);
    }

    #[test]
    fn test_validate_rejects_bad_workloads() {
        let mut cfg = ZonetopConfig::default_example();
        cfg.workload.discard_ratio = 1.5;
        assert!(cfg.validate().is_err());

        let mut cfg = ZonetopConfig::default_example();
        cfg.workload.threads = 0;
        assert!(cfg.validate().is_err());

        let cfg = ZonetopConfig::default();
        assert!(cfg.validate().is_err());
    }
}
