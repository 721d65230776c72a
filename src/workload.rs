//! Command-list recording and event sinking shared by `simulate` and `bench`.

use anyhow::{Context, Result};
use crossbeam_channel::Receiver;
use gpu_zones::sim::{Sim, SimCommandList};
use gpu_zones::{source_location, GpuEvent, QueryContext, TransientLocation, ZoneScope};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::thread::JoinHandle;

use crate::config::WorkloadConfig;

/// Record one command list: `zones_per_list` zone trees of depth `nesting`.
/// Returns the number of zones that went active.
pub fn record_list(ctx: &QueryContext<Sim>, list: &mut SimCommandList, workload: &WorkloadConfig) -> u64 {
    let mut active = 0;
    for _ in 0..workload.zones_per_list {
        let mut frame = if workload.callstack_depth > 0 {
            ZoneScope::with_callstack(ctx, &mut *list, source_location!("pass"), workload.callstack_depth, true)
        } else {
            ZoneScope::new(ctx, &mut *list, source_location!("pass"), true)
        };
        active += frame.is_active() as u64;
        frame.simulate_work(workload.work_ns);
        active += record_nested(ctx, &mut frame, workload, 1);
    }
    active
}

/// Nested zones carry a runtime name, so they go through the transient path.
fn record_nested(ctx: &QueryContext<Sim>, cmd: &mut SimCommandList, workload: &WorkloadConfig, depth: u32) -> u64 {
    if depth >= workload.nesting {
        return 0;
    }
    let name = format!("subpass {}", depth);
    let location = TransientLocation { name: &name, function: module_path!(), file: file!(), line: line!() };
    let mut zone = ZoneScope::transient(ctx, &mut *cmd, location, true);
    zone.simulate_work(workload.work_ns);
    zone.is_active() as u64 + record_nested(ctx, &mut zone, workload, depth + 1)
}

/// Whether list number `index` is thrown away instead of submitted. Uses a
/// golden-ratio sequence so a ratio `r` discards close to `r` of the lists.
pub fn discarded(index: u64, ratio: f64) -> bool {
    ratio > 0.0 && ((index as f64 + 1.0) * 0.618_033_988_749_895).fract() < ratio
}

/// Per-kind event counts gathered by the writer thread.
#[derive(Debug, Default, Serialize)]
pub struct EventTally {
    pub total: u64,
    pub by_kind: BTreeMap<&'static str, u64>,
    /// Messages (diagnostics) seen, in arrival order.
    pub messages: Vec<String>,
}

/// Drain `rx` on a background thread, optionally writing each event as a
/// JSON line to `output`. The thread ends once every sender is dropped.
pub fn spawn_writer(rx: Receiver<GpuEvent>, output: Option<PathBuf>) -> Result<JoinHandle<Result<EventTally>>> {
    let mut sink: Option<BufWriter<File>> = match &output {
        Some(path) => Some(BufWriter::new(
            File::create(path).with_context(|| format!("failed to create {}", path.display()))?,
        )),
        None => None,
    };

    let handle = std::thread::Builder::new()
        .name("zonetop-events".into())
        .spawn(move || -> Result<EventTally> {
            let mut tally = EventTally::default();
            for event in rx {
                tally.total += 1;
                *tally.by_kind.entry(event.kind()).or_default() += 1;
                if let GpuEvent::Message { text, .. } = &event {
                    tally.messages.push(text.clone());
                }
                if let Some(out) = sink.as_mut() {
                    serde_json::to_writer(&mut *out, &event)?;
                    out.write_all(b"\n")?;
                }
            }
            if let Some(mut out) = sink {
                out.flush()?;
            }
            Ok(tally)
        })
        .context("failed to spawn event writer thread")?;
    Ok(handle)
}
