//! `zonetop simulate`: frame-based recording on every configured queue.
//!
//! Each frame, every queue gets `threads` recorder threads that build one
//! command list each and submit it (or throw it away, per `discard_ratio`).
//! Contexts are collected on the main thread every `collect_every` frames.
//! Events go to a writer thread as JSON lines.

use anyhow::{Context, Result};
use gpu_zones::sim::{Sim, SimCommandList, SimDevice, SimQueue};
use gpu_zones::{ChannelTransport, CollectOutcome, ContextMetricsSnapshot, QueryContext};
use std::path::PathBuf;
use std::time::Instant;

use crate::color;
use crate::config::{QueueEntry, ZonetopConfig};
use crate::workload::{self, EventTally};

/// Extra collections after the last frame to pick up late resolves.
const DRAIN_COLLECTS: usize = 4;

struct Lane<'c> {
    entry: &'c QueueEntry,
    queue: SimQueue,
    ctx: QueryContext<Sim>,
    lists_submitted: u64,
    lists_discarded: u64,
}

pub fn run(config: &ZonetopConfig, frames: Option<u64>, output: Option<PathBuf>) -> Result<()> {
    let workload = &config.workload;
    let frames = frames.unwrap_or(workload.frames);

    eprintln!(
        "zonetop simulate — {} frame(s) on {} queue(s), {} thread(s) per queue...",
        frames,
        config.queues.len(),
        workload.threads
    );

    let device = SimDevice::new(config.device.clone());
    let (transport, rx) = ChannelTransport::bounded(workload.event_buffer);
    let writer = workload::spawn_writer(rx, output.clone())?;

    let mut lanes = Vec::with_capacity(config.queues.len());
    for entry in &config.queues {
        let queue = device.create_queue(entry.kind);
        let ctx = QueryContext::<Sim>::create(&device, queue.clone(), transport.clone(), &config.context)
            .with_context(|| format!("failed to create GPU context for queue '{}'", entry.name))?;
        ctx.name(&entry.name);
        lanes.push(Lane { entry, queue, ctx, lists_submitted: 0, lists_discarded: 0 });
    }

    let start = Instant::now();
    let mut list_index = 0u64;
    for frame in 0..frames {
        for lane in lanes.iter_mut() {
            let (submitted, discarded) = record_frame(lane, config, list_index);
            lane.lists_submitted += submitted;
            lane.lists_discarded += discarded;
            list_index += workload.threads as u64;
        }
        if (frame + 1) % workload.collect_every == 0 {
            for lane in &lanes {
                collect_lane(lane);
            }
        }
    }
    for _ in 0..DRAIN_COLLECTS {
        for lane in &lanes {
            collect_lane(lane);
        }
    }
    let elapsed = start.elapsed();

    let summaries: Vec<LaneSummary> = lanes.iter().map(LaneSummary::from_lane).collect();
    let dropped_events = transport.events_dropped.load(std::sync::atomic::Ordering::Relaxed);

    // contexts hold transport clones; the writer finishes once all are gone
    for lane in lanes {
        lane.ctx.destroy();
    }
    drop(transport);
    let tally = writer
        .join()
        .map_err(|_| anyhow::anyhow!("event writer thread panicked"))??;

    print_summary(&summaries, &tally, dropped_events, frames, elapsed.as_secs_f64());
    if let Some(path) = output {
        eprintln!("Events written to {}", path.display());
    }
    Ok(())
}

/// Record one command list per recorder thread and submit the survivors.
/// Returns (submitted, discarded).
fn record_frame(lane: &Lane<'_>, config: &ZonetopConfig, first_index: u64) -> (u64, u64) {
    let workload = &config.workload;
    let ctx = &lane.ctx;
    let queue = &lane.queue;
    std::thread::scope(|s| {
        let handles: Vec<_> = (0..workload.threads as u64)
            .map(|t| {
                s.spawn(move || {
                    let mut list = SimCommandList::new();
                    workload::record_list(ctx, &mut list, workload);
                    if workload::discarded(first_index + t, workload.discard_ratio) {
                        false
                    } else {
                        queue.execute(list);
                        true
                    }
                })
            })
            .collect();
        handles.into_iter().fold((0, 0), |(sub, dis), h| match h.join() {
            Ok(true) => (sub + 1, dis),
            _ => (sub, dis + 1),
        })
    })
}

fn collect_lane(lane: &Lane<'_>) {
    match lane.ctx.collect() {
        Ok(CollectOutcome::Harvested { remaining, .. }) if remaining > 0 => {
            tracing::debug!("{}: {} completed slots still unresolved", lane.entry.name, remaining);
        }
        Ok(_) => {}
        Err(e) => tracing::warn!("{}: collect failed: {}", lane.entry.name, e),
    }
}

struct LaneSummary {
    name: String,
    kind: String,
    context: u8,
    capacity: u32,
    in_flight: u64,
    lists_submitted: u64,
    lists_discarded: u64,
    harvest_pct: Option<f64>,
    metrics: ContextMetricsSnapshot,
}

impl LaneSummary {
    fn from_lane(lane: &Lane<'_>) -> Self {
        Self {
            name: lane.entry.name.clone(),
            kind: format!("{:?}", lane.entry.kind).to_lowercase(),
            context: lane.ctx.id().get(),
            capacity: lane.ctx.capacity(),
            in_flight: lane.ctx.query_counter().wrapping_sub(lane.ctx.previous_checkpoint()),
            lists_submitted: lane.lists_submitted,
            lists_discarded: lane.lists_discarded,
            harvest_pct: lane.ctx.metrics().harvest_pct(),
            metrics: lane.ctx.metrics().snapshot(),
        }
    }
}

fn print_summary(lanes: &[LaneSummary], tally: &EventTally, dropped_events: u64, frames: u64, secs: f64) {
    println!();
    println!(
        "{}  {}",
        color::bold_cyan("=== ZONETOP SIMULATE ==="),
        color::dim(&format!("{} frames in {:.2}s", frames, secs))
    );
    println!(
        "  {}{}{}{}{}{}{}{}",
        color::rpad(&color::bold("QUEUE"), 16),
        color::rpad(&color::bold("CTX"), 5),
        color::rpad(&color::bold("RING"), 8),
        color::rpad(&color::bold("ZONES"), 10),
        color::rpad(&color::bold("DROPPED"), 9),
        color::rpad(&color::bold("HARVEST"), 9),
        color::rpad(&color::bold("ABANDONED"), 11),
        color::bold("CALIB"),
    );
    for l in lanes {
        let m = &l.metrics;
        let dropped = if m.zones_dropped > 0 {
            color::red(&m.zones_dropped.to_string())
        } else {
            color::green("0")
        };
        let harvest = color::pct(l.harvest_pct, 99.0);
        let abandoned = if m.pairs_abandoned > 0 {
            color::yellow(&m.pairs_abandoned.to_string())
        } else {
            m.pairs_abandoned.to_string()
        };
        println!(
            "  {}{}{}{}{}{}{}{}",
            color::rpad(&format!("{} ({})", l.name, l.kind), 16),
            color::rpad(&l.context.to_string(), 5),
            color::rpad(&l.capacity.to_string(), 8),
            color::rpad(&m.zones_begun.to_string(), 10),
            color::rpad(&dropped, 9),
            color::rpad(&harvest, 9),
            color::rpad(&abandoned, 11),
            format!("{} / {} skipped", m.calibrations, m.calibrations_skipped),
        );
        println!(
            "  {}",
            color::dim(&format!(
                "lists {} submitted, {} discarded · peak in-flight {} · still pending {} · collects {} ({} idle, {} deferred)",
                l.lists_submitted,
                l.lists_discarded,
                m.max_in_flight,
                l.in_flight,
                m.collects,
                m.collects_idle,
                m.collects_deferred
            ))
        );
    }

    let kinds: Vec<String> = tally.by_kind.iter().map(|(k, n)| format!("{}={}", k, n)).collect();
    println!();
    println!("  events {}  {}", color::bold(&tally.total.to_string()), color::dim(&kinds.join("  ")));
    if dropped_events > 0 {
        println!("  {}", color::red(&format!("{} events dropped (event_buffer full)", dropped_events)));
    }
    for msg in &tally.messages {
        println!("  {}", color::red(msg));
    }
}
