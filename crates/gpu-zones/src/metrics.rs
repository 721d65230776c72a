//! Per-context diagnostic counters.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering::Relaxed};

/// Atomic per-context counters.
/// Written with Relaxed ordering; readers sample them, nothing synchronises on them.
#[derive(Default)]
pub struct ContextMetrics {
    // Recording
    pub zones_begun: AtomicU64,
    /// Zones refused because the ring had no free pair (allocation outran collection).
    pub zones_dropped: AtomicU64,
    /// Largest unharvested slot distance seen at allocation time.
    pub max_in_flight: AtomicU64,

    // Collection
    pub collects: AtomicU64,
    /// Collections that found nothing new and may have re-signaled the fence.
    pub collects_idle: AtomicU64,
    /// Collections skipped because an odd number of slots had completed.
    pub collects_deferred: AtomicU64,
    pub fence_signals: AtomicU64,
    pub slots_harvested: AtomicU64,
    /// Collections that stopped at an unresolved pair before reaching the checkpoint.
    pub harvest_stalls: AtomicU64,
    /// Unresolved pairs skipped after stalling for too long.
    pub pairs_abandoned: AtomicU64,
    /// Abandoned pairs that had been resolved late by the time they were reissued.
    pub late_resolves_discarded: AtomicU64,
    pub ring_overflows: AtomicU64,

    // Calibration
    pub calibrations: AtomicU64,
    pub calibrations_skipped: AtomicU64,
}

/// Plain-struct snapshot of ContextMetrics for display (no atomics).
#[derive(Debug, Clone, Default, Serialize)]
pub struct ContextMetricsSnapshot {
    pub zones_begun: u64,
    pub zones_dropped: u64,
    pub max_in_flight: u64,
    pub collects: u64,
    pub collects_idle: u64,
    pub collects_deferred: u64,
    pub fence_signals: u64,
    pub slots_harvested: u64,
    pub harvest_stalls: u64,
    pub pairs_abandoned: u64,
    pub late_resolves_discarded: u64,
    pub ring_overflows: u64,
    pub calibrations: u64,
    pub calibrations_skipped: u64,
}

impl ContextMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_in_flight(&self, slots: u64) {
        self.max_in_flight.fetch_max(slots, Relaxed);
    }

    /// Fraction of begun zones whose both timestamps were harvested, in percent.
    pub fn harvest_pct(&self) -> Option<f64> {
        let begun = self.zones_begun.load(Relaxed);
        if begun == 0 {
            return None;
        }
        let pairs = self.slots_harvested.load(Relaxed) / 2;
        Some(pairs as f64 / begun as f64 * 100.0)
    }

    pub fn snapshot(&self) -> ContextMetricsSnapshot {
        ContextMetricsSnapshot {
            zones_begun: self.zones_begun.load(Relaxed),
            zones_dropped: self.zones_dropped.load(Relaxed),
            max_in_flight: self.max_in_flight.load(Relaxed),
            collects: self.collects.load(Relaxed),
            collects_idle: self.collects_idle.load(Relaxed),
            collects_deferred: self.collects_deferred.load(Relaxed),
            fence_signals: self.fence_signals.load(Relaxed),
            slots_harvested: self.slots_harvested.load(Relaxed),
            harvest_stalls: self.harvest_stalls.load(Relaxed),
            pairs_abandoned: self.pairs_abandoned.load(Relaxed),
            late_resolves_discarded: self.late_resolves_discarded.load(Relaxed),
            ring_overflows: self.ring_overflows.load(Relaxed),
            calibrations: self.calibrations.load(Relaxed),
            calibrations_skipped: self.calibrations_skipped.load(Relaxed),
        }
    }
}

impl ContextMetricsSnapshot {
    /// Sum of two snapshots; `max_in_flight` keeps the larger value.
    pub fn merge(&self, other: &Self) -> Self {
        Self {
            zones_begun: self.zones_begun + other.zones_begun,
            zones_dropped: self.zones_dropped + other.zones_dropped,
            max_in_flight: self.max_in_flight.max(other.max_in_flight),
            collects: self.collects + other.collects,
            collects_idle: self.collects_idle + other.collects_idle,
            collects_deferred: self.collects_deferred + other.collects_deferred,
            fence_signals: self.fence_signals + other.fence_signals,
            slots_harvested: self.slots_harvested + other.slots_harvested,
            harvest_stalls: self.harvest_stalls + other.harvest_stalls,
            pairs_abandoned: self.pairs_abandoned + other.pairs_abandoned,
            late_resolves_discarded: self.late_resolves_discarded + other.late_resolves_discarded,
            ring_overflows: self.ring_overflows + other.ring_overflows,
            calibrations: self.calibrations + other.calibrations,
            calibrations_skipped: self.calibrations_skipped + other.calibrations_skipped,
        }
    }
}
