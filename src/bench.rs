//! `zonetop bench`: timed zone-creation benchmark with structured JSON output.
//!
//! Records zones on the first configured queue from `threads` threads for a
//! fixed duration while a collector thread harvests every
//! `collect_interval_us`, then emits a JSON report with throughput and the
//! context's ring counters.

use anyhow::{Context, Result};
use chrono::Utc;
use gpu_zones::sim::{Sim, SimCommandList, SimDevice};
use gpu_zones::{ChannelTransport, ContextMetricsSnapshot, QueryContext};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::color;
use crate::config::ZonetopConfig;
use crate::workload;

#[derive(Debug, Serialize)]
pub struct BenchReport {
    pub started_at: String,
    pub duration_secs: u64,
    pub queue: String,
    pub threads: usize,
    pub ring_capacity: u32,
    pub lists_recorded: u64,
    pub lists_discarded: u64,
    pub zones_recorded: u64,
    pub zones_per_sec: f64,
    /// Mean wall time to record one zone (begin + end + resolve), in ns.
    pub ns_per_zone: Option<f64>,
    pub harvest_pct: Option<f64>,
    pub events_emitted: u64,
    pub events_dropped: u64,
    pub metrics: ContextMetricsSnapshot,
}

pub fn run(config: &ZonetopConfig, duration_secs: u64, output: Option<PathBuf>) -> Result<()> {
    let Some(entry) = config.queues.first() else {
        anyhow::bail!("no queues configured — run `zonetop init > zonetop.toml` to create a config");
    };
    let workload = &config.workload;

    eprintln!(
        "zonetop bench — running for {}s on '{}' with {} thread(s)...",
        duration_secs, entry.name, workload.threads
    );

    let started_at = Utc::now();
    let device = SimDevice::new(config.device.clone());
    let queue = device.create_queue(entry.kind);
    let (transport, rx) = ChannelTransport::bounded(workload.event_buffer);
    let ctx = QueryContext::<Sim>::create(&device, queue.clone(), transport.clone(), &config.context)
        .with_context(|| format!("failed to create GPU context for queue '{}'", entry.name))?;
    ctx.name(&entry.name);

    // Drain thread
    let drain = std::thread::spawn(move || rx.into_iter().count() as u64);

    let stop = AtomicBool::new(false);
    let lists_recorded = AtomicU64::new(0);
    let lists_discarded = AtomicU64::new(0);
    let zones_recorded = AtomicU64::new(0);
    let record_ns = AtomicU64::new(0);
    let target = Duration::from_secs(duration_secs);
    let collect_interval = Duration::from_micros(workload.collect_interval_us);

    let start = Instant::now();
    std::thread::scope(|s| {
        s.spawn(|| {
            while !stop.load(Ordering::Acquire) {
                if let Err(e) = ctx.collect() {
                    tracing::warn!("collect failed: {}", e);
                }
                std::thread::sleep(collect_interval);
            }
        });
        for t in 0..workload.threads as u64 {
            let (ctx, queue, stop) = (&ctx, &queue, &stop);
            let (lists_recorded, lists_discarded) = (&lists_recorded, &lists_discarded);
            let (zones_recorded, record_ns) = (&zones_recorded, &record_ns);
            s.spawn(move || {
                let mut index = t;
                while !stop.load(Ordering::Relaxed) {
                    let mut list = SimCommandList::new();
                    let t0 = Instant::now();
                    let zones = workload::record_list(ctx, &mut list, workload);
                    record_ns.fetch_add(t0.elapsed().as_nanos() as u64, Ordering::Relaxed);
                    zones_recorded.fetch_add(zones, Ordering::Relaxed);
                    lists_recorded.fetch_add(1, Ordering::Relaxed);
                    if workload::discarded(index, workload.discard_ratio) {
                        lists_discarded.fetch_add(1, Ordering::Relaxed);
                    } else {
                        queue.execute(list);
                    }
                    index += workload.threads as u64;
                }
            });
        }

        // Progress indicator every 10s
        let mut next_tick = 10u64;
        while start.elapsed() < target {
            std::thread::sleep(Duration::from_millis(100));
            let elapsed = start.elapsed().as_secs();
            if elapsed >= next_tick {
                eprintln!("  ...{}s / {}s", elapsed, duration_secs);
                next_tick += 10;
            }
        }
        stop.store(true, Ordering::Release);
    });
    let elapsed_secs = start.elapsed().as_secs_f64();

    // one last harvest for lists submitted after the collector stopped
    for _ in 0..2 {
        if let Err(e) = ctx.collect() {
            tracing::warn!("collect failed: {}", e);
        }
    }

    let zones = zones_recorded.load(Ordering::Relaxed);
    let report = BenchReport {
        started_at: started_at.to_rfc3339(),
        duration_secs,
        queue: entry.name.clone(),
        threads: workload.threads,
        ring_capacity: ctx.capacity(),
        lists_recorded: lists_recorded.load(Ordering::Relaxed),
        lists_discarded: lists_discarded.load(Ordering::Relaxed),
        zones_recorded: zones,
        zones_per_sec: zones as f64 / elapsed_secs,
        ns_per_zone: (zones > 0).then(|| record_ns.load(Ordering::Relaxed) as f64 / zones as f64),
        harvest_pct: ctx.metrics().harvest_pct(),
        events_emitted: transport.events_submitted.load(Ordering::Relaxed),
        events_dropped: transport.events_dropped.load(Ordering::Relaxed),
        metrics: ctx.metrics().snapshot(),
    };

    ctx.destroy();
    drop(transport);
    let drained = drain.join().map_err(|_| anyhow::anyhow!("drain thread panicked"))?;
    tracing::debug!("drained {} events", drained);

    let json = serde_json::to_string_pretty(&report)?;

    match output {
        Some(path) => {
            std::fs::write(&path, &json)?;
            eprintln!("Report written to {}", path.display());
        }
        None => {
            println!("{}", json);
        }
    }

    // Also print a human-readable summary to stderr
    eprintln!();
    eprintln!("=== BENCH SUMMARY ({:.0}s) ===", elapsed_secs);
    eprintln!(
        "  {}  zones/s={:.0}  ns/zone={}  harvest={}  dropped={}  abandoned={}",
        report.queue,
        report.zones_per_sec,
        report.ns_per_zone.map(|n| format!("{:.0}", n)).unwrap_or("—".into()),
        color::pct(report.harvest_pct, 99.0),
        report.metrics.zones_dropped,
        report.metrics.pairs_abandoned,
    );

    Ok(())
}
