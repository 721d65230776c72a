//! Per-queue timestamp query context.
//!
//! A [`QueryContext`] owns a ring of hardware timestamp queries, the
//! host-readable buffer their results are resolved into, and a checkpoint
//! fence. Zones reserve begin/end slot pairs from the ring on any thread;
//! [`QueryContext::collect`] runs on one thread at a time, harvests resolved
//! timestamps in ring order and keeps the GPU/CPU clock calibration current.
//!
//! ## Ring discipline
//! * `query_counter` only grows, two slots per zone.
//! * `previous_checkpoint` counts harvested slots and trails the counter.
//! * The fence value tells how far the queue has executed, not how far the
//!   results have been read; slots between the two are still in flight.
//! * A slot holding `0` has not been resolved yet. Harvesting stops at the
//!   first pair holding a zero and resets every harvested slot to zero.
//! * An abandoned pair may still be resolved by a list submitted late. Its
//!   slots are zeroed again when they are next handed out.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::calibration::{self, Calibrator};
use crate::error::{CollectError, ContextError, ContextResult};
use crate::event::{ContextFlags, ContextId, GpuEvent, MESSAGE_COLOR_RED};
use crate::hal::{Backend, Device, Fence, QueryHeapKind, Queue, QueueKind, ReadbackBuffer};
use crate::metrics::ContextMetrics;
use crate::ring::{pending_count, slot_index};
use crate::transport::Transport;

/// Largest ring a context will ask for. Slot ids travel as 16-bit values.
pub const MAX_QUERIES: u32 = 64 * 1024;

/// Longest context name carried by a name event, in bytes.
pub const MAX_NAME_LEN: usize = u16::MAX as usize;

/// Creation-time knobs for a [`QueryContext`].
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ContextOptions {
    /// Ring size to try first; halved until the device accepts it.
    #[serde(default = "ContextOptions::default_max_queries")]
    pub max_queries: u32,
    /// Record and collect only while the transport reports a connection.
    #[serde(default)]
    pub on_demand: bool,
    /// Consecutive collections a pair may block harvesting, while later
    /// slots are already resolved, before it is abandoned. `0` never abandons.
    #[serde(default = "ContextOptions::default_stale_collect_limit")]
    pub stale_collect_limit: u32,
}

impl ContextOptions {
    fn default_max_queries() -> u32 { MAX_QUERIES }
    fn default_stale_collect_limit() -> u32 { 120 }

    /// Even power of two no larger than [`MAX_QUERIES`].
    fn initial_capacity(&self) -> u32 {
        let requested = self.max_queries.clamp(2, MAX_QUERIES);
        1 << (31 - requested.leading_zeros())
    }
}

impl Default for ContextOptions {
    fn default() -> Self {
        Self {
            max_queries: Self::default_max_queries(),
            on_demand: false,
            stale_collect_limit: Self::default_stale_collect_limit(),
        }
    }
}

/// Result of one [`QueryContext::collect`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectOutcome {
    /// On-demand context with no profiler attached; hardware untouched.
    Disconnected,
    /// No slots completed since the last harvest. `signaled` holds the
    /// counter value the fence was asked to reach, if a signal was issued.
    Idle { signaled: Option<u64> },
    /// An odd number of slots completed; a begin/end pair is only half
    /// submitted. Nothing was harvested.
    Deferred { pending: u64 },
    /// `slots` timestamps were harvested; `remaining` completed slots are
    /// still unresolved and will be retried. Abandoned pairs count in neither.
    Harvested { slots: u64, remaining: u64 },
}

/// State only the collecting thread touches.
struct CollectState {
    calibrator: Calibrator,
    /// Ring position harvesting last stopped at, and for how many collections.
    stall: Option<(u64, u32)>,
}

pub struct QueryContext<B: Backend> {
    id: ContextId,
    queue: B::Queue,
    transport: Arc<dyn Transport>,
    capacity: u32,
    query_heap: B::QueryHeap,
    readback: B::ReadbackBuffer,
    checkpoint_fence: B::Fence,
    query_counter: AtomicU64,
    previous_checkpoint: AtomicU64,
    collect_state: Mutex<CollectState>,
    /// Begin slots of abandoned pairs not yet handed out again.
    abandoned: Mutex<Vec<u32>>,
    abandoned_len: AtomicUsize,
    on_demand: bool,
    stale_collect_limit: u32,
    metrics: Arc<ContextMetrics>,
}

impl<B: Backend> QueryContext<B> {
    /// Set up the query ring for `queue` and announce the context.
    ///
    /// Every error is a broken precondition for this queue; a red diagnostic
    /// message is submitted to the transport before it is returned.
    pub fn create(
        device: &B::Device,
        queue: B::Queue,
        transport: Arc<dyn Transport>,
        options: &ContextOptions,
    ) -> ContextResult<Self> {
        Self::create_inner(device, queue, &transport, options)
            .map_err(|err| report_fatal(transport.as_ref(), err))
    }

    fn create_inner(
        device: &B::Device,
        queue: B::Queue,
        transport: &Arc<dyn Transport>,
        options: &ContextOptions,
    ) -> ContextResult<Self> {
        let queue_kind = queue.kind();
        if queue_kind == QueueKind::Copy {
            let supported = device
                .copy_queue_timestamps_supported()
                .map_err(ContextError::FeatureQuery)?;
            if !supported {
                return Err(ContextError::CopyQueueTimestampsUnsupported);
            }
        }

        // Probe downwards until the device accepts a heap. Capacity stays
        // even since zones take slots in begin/end pairs.
        let heap_kind = QueryHeapKind::for_queue(queue_kind);
        let mut capacity = options.initial_capacity();
        let query_heap = loop {
            match device.create_query_heap(heap_kind, capacity) {
                Ok(heap) => break heap,
                Err(source) if capacity <= 2 => {
                    return Err(ContextError::QueryHeap { requested: capacity, source });
                }
                Err(err) => {
                    tracing::debug!("query heap of {} refused ({}), halving", capacity, err);
                    capacity /= 2;
                }
            }
        };

        let readback = device
            .create_readback_buffer(capacity as u64 * std::mem::size_of::<u64>() as u64)
            .map_err(ContextError::ReadbackBuffer)?;
        let checkpoint_fence = device.create_fence(0).map_err(ContextError::Fence)?;

        let frequency = queue.timestamp_frequency().map_err(ContextError::TimestampFrequency)?;
        if frequency == 0 {
            return Err(ContextError::ZeroTimestampFrequency);
        }
        let period = calibration::period_ns(frequency);

        let seed = queue.clock_calibration().map_err(ContextError::Calibration)?;
        let cpu_ticks_per_second = queue.cpu_ticks_per_second();
        if cpu_ticks_per_second == 0 {
            return Err(ContextError::ZeroCpuTickFrequency);
        }
        let calibrator = Calibrator::new(seed, cpu_ticks_per_second);

        let id = transport
            .next_context_id()
            .ok_or(ContextError::ContextIdsExhausted(ContextId::MAX_LIVE))?;

        transport.submit(GpuEvent::NewContext {
            cpu_time: transport.now(),
            gpu_time: seed.gpu_ticks,
            // queue timing is not bound to any thread
            thread: 0,
            period,
            context: id,
            flags: ContextFlags::CALIBRATION,
            context_type: B::CONTEXT_TYPE,
        });

        tracing::info!(
            "gpu context {} created: {:?} queue, {} query slots, {:.3} ns/tick",
            id.get(),
            queue_kind,
            capacity,
            period
        );

        Ok(Self {
            id,
            queue,
            transport: transport.clone(),
            capacity,
            query_heap,
            readback,
            checkpoint_fence,
            query_counter: AtomicU64::new(0),
            previous_checkpoint: AtomicU64::new(0),
            collect_state: Mutex::new(CollectState { calibrator, stall: None }),
            abandoned: Mutex::new(Vec::new()),
            abandoned_len: AtomicUsize::new(0),
            on_demand: options.on_demand,
            stale_collect_limit: options.stale_collect_limit,
            metrics: Arc::new(ContextMetrics::new()),
        })
    }

    /// Release the query heap, readback buffer and fence. Zones borrow the
    /// context, so none can be live here.
    pub fn destroy(self) {
        tracing::info!(
            "gpu context {} destroyed after {} zones",
            self.id.get(),
            self.metrics.zones_begun.load(Ordering::Relaxed)
        );
    }

    /// Attach a display name to the context.
    pub fn name(&self, name: &str) {
        let mut len = name.len().min(MAX_NAME_LEN);
        while !name.is_char_boundary(len) {
            len -= 1;
        }
        self.transport.submit(GpuEvent::ContextName {
            context: self.id,
            name: Box::from(&name[..len]),
        });
    }

    pub fn id(&self) -> ContextId {
        self.id
    }

    /// Number of query slots in the ring.
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn queue(&self) -> &B::Queue {
        &self.queue
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn metrics(&self) -> &Arc<ContextMetrics> {
        &self.metrics
    }

    /// Total slots handed out so far.
    pub fn query_counter(&self) -> u64 {
        self.query_counter.load(Ordering::Acquire)
    }

    /// Total slots harvested so far.
    pub fn previous_checkpoint(&self) -> u64 {
        self.previous_checkpoint.load(Ordering::Acquire)
    }

    /// CPU ticks of the last accepted calibration sample.
    pub fn prev_calibration_cpu_ticks(&self) -> u64 {
        self.collect_state.lock().unwrap().calibrator.prev_cpu_ticks()
    }

    pub(crate) fn query_heap(&self) -> &B::QueryHeap {
        &self.query_heap
    }

    pub(crate) fn readback(&self) -> &B::ReadbackBuffer {
        &self.readback
    }

    /// Whether zones and collection should run right now.
    pub(crate) fn recording_enabled(&self) -> bool {
        !self.on_demand || self.transport.is_connected()
    }

    /// Reserve a begin/end pair and return the ring index of the begin slot.
    ///
    /// Returns `None` when the ring holds no free pair: the unharvested
    /// distance would exceed capacity and the pair would overwrite data that
    /// was never read. The refused zone is counted in `zones_dropped`.
    pub(crate) fn allocate_slot_pair(&self) -> Option<u32> {
        let harvested = self.previous_checkpoint.load(Ordering::Acquire);
        let capacity = self.capacity as u64;
        let reserved = self.query_counter.fetch_update(Ordering::AcqRel, Ordering::Acquire, |counter| {
            if pending_count(harvested, counter) + 2 > capacity {
                None
            } else {
                Some(counter.wrapping_add(2))
            }
        });
        match reserved {
            Ok(counter) => {
                self.metrics.zones_begun.fetch_add(1, Ordering::Relaxed);
                self.metrics.record_in_flight(pending_count(harvested, counter) + 2);
                let slot = slot_index(counter, self.capacity);
                self.scrub_abandoned(slot);
                Some(slot)
            }
            Err(counter) => {
                let dropped = self.metrics.zones_dropped.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::debug!(
                    "gpu context {}: ring full at counter {} ({} zones dropped)",
                    self.id.get(),
                    counter,
                    dropped
                );
                None
            }
        }
    }

    /// Zero a reissued abandoned pair, dropping whatever a late resolve left
    /// there, so the new zone is only harvested with its own timestamps.
    fn scrub_abandoned(&self, slot: u32) {
        if self.abandoned_len.load(Ordering::Acquire) == 0 {
            return;
        }
        {
            let mut abandoned = self.abandoned.lock().unwrap();
            let Some(i) = abandoned.iter().position(|&s| s == slot) else {
                return;
            };
            abandoned.swap_remove(i);
            self.abandoned_len.store(abandoned.len(), Ordering::Release);
        }
        // the list lock is released first: collect takes it while mapped
        let end = slot_index(slot as u64 + 1, self.capacity) as usize;
        let scrubbed = self.readback.map(|timestamps| {
            let stale = timestamps[slot as usize] != 0 || timestamps[end] != 0;
            timestamps[slot as usize] = 0;
            timestamps[end] = 0;
            stale
        });
        match scrubbed {
            Ok(true) => {
                self.metrics.late_resolves_discarded.fetch_add(1, Ordering::Relaxed);
                tracing::debug!("gpu context {}: discarded late results in queries {}/{}", self.id.get(), slot, end);
            }
            Ok(false) => {}
            Err(err) => tracing::warn!("gpu context {}: failed to clear abandoned queries: {}", self.id.get(), err),
        }
    }

    /// Harvest resolved timestamps and refresh the clock calibration.
    ///
    /// Meant to be called periodically from one thread at a time; concurrent
    /// calls serialize on an internal lock.
    pub fn collect(&self) -> Result<CollectOutcome, CollectError> {
        if !self.recording_enabled() {
            return Ok(CollectOutcome::Disconnected);
        }
        let mut state = self.collect_state.lock().unwrap();
        self.metrics.collects.fetch_add(1, Ordering::Relaxed);

        let begin = self.previous_checkpoint.load(Ordering::Acquire);
        let latest_checkpoint = self.checkpoint_fence.completed_value();
        let pending = pending_count(begin, latest_checkpoint);

        if pending == 0 {
            self.metrics.collects_idle.fetch_add(1, Ordering::Relaxed);
            // A slot id may be handed out before its query is recorded and
            // submitted. Signaling past it is harmless: unresolved slots stay
            // zero and are picked up by a later collection.
            let next_checkpoint = self.query_counter.load(Ordering::Acquire);
            if next_checkpoint == latest_checkpoint {
                return Ok(CollectOutcome::Idle { signaled: None });
            }
            self.queue
                .signal(&self.checkpoint_fence, next_checkpoint)
                .map_err(CollectError::Signal)?;
            self.metrics.fence_signals.fetch_add(1, Ordering::Relaxed);
            return Ok(CollectOutcome::Idle { signaled: Some(next_checkpoint) });
        }

        if pending % 2 != 0 {
            self.metrics.collects_deferred.fetch_add(1, Ordering::Relaxed);
            return Ok(CollectOutcome::Deferred { pending });
        }

        // a full ring is still intact; only a wider gap means lost slots
        if pending > self.capacity as u64 {
            self.metrics.ring_overflows.fetch_add(1, Ordering::Relaxed);
            let err = CollectError::RingOverflow { pending, capacity: self.capacity };
            tracing::error!("gpu context {}: {}", self.id.get(), err);
            self.transport.submit(GpuEvent::Message {
                text: format!("gpu-zones: {}", err),
                color: MESSAGE_COLOR_RED,
            });
            return Err(err);
        }

        let harvested = self
            .readback
            .map(|timestamps| self.harvest(&mut state, timestamps, begin, latest_checkpoint))
            .map_err(CollectError::Map)?;

        if harvested > 0 {
            // account for drift
            self.recalibrate(&mut state.calibrator)?;
        }

        let in_flight = pending_count(begin, self.query_counter.load(Ordering::Acquire));
        if harvested == 0 && in_flight + 2 > self.capacity as u64 {
            tracing::warn!(
                "gpu context {}: ring full with nothing harvested ({} zones dropped so far)",
                self.id.get(),
                self.metrics.zones_dropped.load(Ordering::Relaxed)
            );
        }

        let remaining = pending_count(self.previous_checkpoint.load(Ordering::Acquire), latest_checkpoint);
        Ok(CollectOutcome::Harvested { slots: harvested, remaining })
    }

    /// Walk `[begin, end)` pair by pair, emitting and resetting resolved
    /// slots. Returns the number of slots harvested.
    fn harvest(&self, state: &mut CollectState, timestamps: &mut [u64], begin: u64, end: u64) -> u64 {
        let mut position = begin;
        let mut harvested = 0;
        // Whole pairs only: a checkpoint left between a begin and its end
        // would make every later collect see odd progress and defer forever.
        while position != end {
            let begin_slot = slot_index(position, self.capacity) as usize;
            let end_slot = slot_index(position.wrapping_add(1), self.capacity) as usize;

            if timestamps[begin_slot] == 0 || timestamps[end_slot] == 0 {
                // Submission order is unknown and lists may never be
                // submitted, so a gap is normal. Later slots are not trusted
                // while an earlier one is pending, unless the gap went stale.
                if !self.gap_is_stale(state, timestamps, position, end) {
                    self.metrics.harvest_stalls.fetch_add(1, Ordering::Relaxed);
                    break;
                }
                tracing::warn!(
                    "gpu context {}: abandoning unresolved queries {}/{}",
                    self.id.get(),
                    begin_slot,
                    end_slot
                );
                timestamps[begin_slot] = 0;
                timestamps[end_slot] = 0;
                {
                    // recorded before the slots become allocatable
                    let mut abandoned = self.abandoned.lock().unwrap();
                    if !abandoned.contains(&(begin_slot as u32)) {
                        abandoned.push(begin_slot as u32);
                    }
                    self.abandoned_len.store(abandoned.len(), Ordering::Release);
                }
                self.previous_checkpoint.fetch_add(2, Ordering::AcqRel);
                self.metrics.pairs_abandoned.fetch_add(1, Ordering::Relaxed);
                state.stall = None;
                position = position.wrapping_add(2);
                continue;
            }

            for slot in [begin_slot, end_slot] {
                self.previous_checkpoint.fetch_add(1, Ordering::AcqRel);
                self.transport.submit(GpuEvent::GpuTime {
                    gpu_time: timestamps[slot],
                    query_id: slot as u16,
                    context: self.id,
                });
                timestamps[slot] = 0;
            }
            harvested += 2;
            position = position.wrapping_add(2);
        }

        if position == end {
            state.stall = None;
        }
        self.metrics.slots_harvested.fetch_add(harvested, Ordering::Relaxed);
        harvested
    }

    /// Track how long harvesting has been stuck at `position`. The gap is
    /// stale once it has held for `stale_collect_limit` collections while
    /// something after it, up to `end`, has already resolved.
    fn gap_is_stale(&self, state: &mut CollectState, timestamps: &[u64], position: u64, end: u64) -> bool {
        let stalled_for = match state.stall {
            Some((at, count)) if at == position => count + 1,
            _ => 1,
        };
        state.stall = Some((position, stalled_for));

        if self.stale_collect_limit == 0 || stalled_for < self.stale_collect_limit {
            return false;
        }
        let later = pending_count(position, end);
        (2..later).any(|offset| timestamps[slot_index(position.wrapping_add(offset), self.capacity) as usize] != 0)
    }

    fn recalibrate(&self, calibrator: &mut Calibrator) -> Result<(), CollectError> {
        let sample = self.queue.clock_calibration().map_err(|err| {
            let err = CollectError::Calibration(err);
            self.transport.submit(GpuEvent::Message {
                text: format!("gpu-zones: {}", err),
                color: MESSAGE_COLOR_RED,
            });
            err
        })?;

        match calibrator.advance(sample) {
            Some(cpu_delta) => {
                self.transport.submit(GpuEvent::Calibration {
                    gpu_time: sample.gpu_ticks,
                    cpu_time: self.transport.now(),
                    cpu_delta,
                    context: self.id,
                });
                self.metrics.calibrations.fetch_add(1, Ordering::Relaxed);
            }
            None => {
                self.metrics.calibrations_skipped.fetch_add(1, Ordering::Relaxed);
            }
        }
        Ok(())
    }
}

fn report_fatal(transport: &dyn Transport, err: ContextError) -> ContextError {
    tracing::error!("gpu context creation failed: {}", err);
    transport.submit(GpuEvent::Message {
        text: format!("gpu-zones: {}", err),
        color: MESSAGE_COLOR_RED,
    });
    err
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::HalError;
    use crate::sim::{Sim, SimConfig, SimDevice, SimQueue};
    use crate::transport::ChannelTransport;
    use crossbeam_channel::Receiver;
    use std::sync::atomic::Ordering::Relaxed;

    struct Fixture {
        device: SimDevice,
        ctx: QueryContext<Sim>,
        rx: Receiver<GpuEvent>,
    }

    fn fixture(max_queries: u32, kind: QueueKind) -> Fixture {
        let device = SimDevice::new(SimConfig::deterministic());
        device.clock().set_ns(1_000_000);
        let queue: SimQueue = device.create_queue(kind);
        let (transport, rx) = ChannelTransport::unbounded();
        let options = ContextOptions { max_queries, ..ContextOptions::default() };
        let ctx = QueryContext::<Sim>::create(&device, queue, transport, &options).unwrap();
        Fixture { device, ctx, rx }
    }

    fn drain(rx: &Receiver<GpuEvent>) -> Vec<GpuEvent> {
        rx.try_iter().collect()
    }

    fn gpu_times(events: &[GpuEvent]) -> Vec<(u16, u64)> {
        events
            .iter()
            .filter_map(|ev| match ev {
                GpuEvent::GpuTime { query_id, gpu_time, .. } => Some((*query_id, *gpu_time)),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_initial_capacity_rounding() {
        let opts = |max_queries| ContextOptions { max_queries, ..ContextOptions::default() };
        assert_eq!(opts(MAX_QUERIES).initial_capacity(), MAX_QUERIES);
        assert_eq!(opts(1 << 20).initial_capacity(), MAX_QUERIES);
        assert_eq!(opts(1000).initial_capacity(), 512);
        assert_eq!(opts(4).initial_capacity(), 4);
        assert_eq!(opts(0).initial_capacity(), 2);
    }

    #[test]
    fn test_create_emits_new_context() {
        let f = fixture(64, QueueKind::Direct);
        let events = drain(&f.rx);
        assert_eq!(events.len(), 1);
        match &events[0] {
            GpuEvent::NewContext { gpu_time, thread, period, context, flags, .. } => {
                assert_eq!(*gpu_time, 1_000_000);
                assert_eq!(*thread, 0);
                assert_eq!(*period, 1.0);
                assert_eq!(*context, f.ctx.id());
                assert!(flags.contains(ContextFlags::CALIBRATION));
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(f.ctx.prev_calibration_cpu_ticks(), 10_000);
    }

    #[test]
    fn test_capacity_probes_downward() {
        let device = SimDevice::new(SimConfig { max_queries: 1000, ..SimConfig::deterministic() });
        let (transport, _rx) = ChannelTransport::unbounded();
        let ctx = QueryContext::<Sim>::create(
            &device,
            device.create_queue(QueueKind::Direct),
            transport,
            &ContextOptions::default(),
        )
        .unwrap();
        assert_eq!(ctx.capacity(), 512);
        let requests = device.heap_requests();
        assert_eq!(requests.first(), Some(&MAX_QUERIES));
        assert_eq!(requests.last(), Some(&512));
        assert_eq!(ctx.readback().slots(), 512);
    }

    #[test]
    fn test_allocation_overflow_rejects_newest_pair() {
        let f = fixture(4, QueueKind::Direct);
        assert_eq!(f.ctx.allocate_slot_pair(), Some(0));
        assert_eq!(f.ctx.allocate_slot_pair(), Some(2));
        // a third pair would land on slot 0 before it is harvested
        assert_eq!(f.ctx.allocate_slot_pair(), None);
        assert_eq!(f.ctx.query_counter(), 4);
        let snap = f.ctx.metrics().snapshot();
        assert_eq!(snap.zones_begun, 2);
        assert_eq!(snap.zones_dropped, 1);
        assert_eq!(snap.max_in_flight, 4);
    }

    #[test]
    fn test_collect_harvests_in_ring_order() {
        let f = fixture(4, QueueKind::Direct);
        drain(&f.rx);
        assert_eq!(f.ctx.allocate_slot_pair(), Some(0));
        assert_eq!(f.ctx.allocate_slot_pair(), Some(2));
        for (slot, ts) in [(0, 100), (1, 150), (2, 200), (3, 260)] {
            f.ctx.readback().write_slot(slot, ts);
        }

        // first call only advances the fence to the allocation counter
        assert_eq!(f.ctx.collect().unwrap(), CollectOutcome::Idle { signaled: Some(4) });
        assert_eq!(f.ctx.previous_checkpoint(), 0);

        f.device.clock().advance_ns(5_000);
        assert_eq!(f.ctx.collect().unwrap(), CollectOutcome::Harvested { slots: 4, remaining: 0 });
        assert_eq!(f.ctx.previous_checkpoint(), 4);
        let events = drain(&f.rx);
        assert_eq!(gpu_times(&events), vec![(0, 100), (1, 150), (2, 200), (3, 260)]);
        assert!(matches!(events.last(), Some(GpuEvent::Calibration { .. })));
        for slot in 0..4 {
            assert_eq!(f.ctx.readback().read_slot(slot), 0);
        }

        // nothing new: no harvest, no signal
        assert_eq!(f.ctx.collect().unwrap(), CollectOutcome::Idle { signaled: None });
        assert_eq!(f.ctx.previous_checkpoint(), 4);
        assert!(drain(&f.rx).is_empty());
    }

    #[test]
    fn test_collect_stops_at_first_unresolved_pair() {
        let f = fixture(8, QueueKind::Direct);
        drain(&f.rx);
        for _ in 0..3 {
            f.ctx.allocate_slot_pair().unwrap();
        }
        f.ctx.collect().unwrap();
        // pair 0 resolved, pair 1 missing its end, pair 2 resolved
        for (slot, ts) in [(0, 10), (1, 20), (2, 30), (4, 50), (5, 60)] {
            f.ctx.readback().write_slot(slot, ts);
        }
        assert_eq!(f.ctx.collect().unwrap(), CollectOutcome::Harvested { slots: 2, remaining: 4 });
        assert_eq!(f.ctx.previous_checkpoint(), 2);
        assert_eq!(gpu_times(&drain(&f.rx)), vec![(0, 10), (1, 20)]);
        // the half-resolved pair is left untouched
        assert_eq!(f.ctx.readback().read_slot(2), 30);

        f.ctx.readback().write_slot(3, 40);
        assert_eq!(f.ctx.collect().unwrap(), CollectOutcome::Harvested { slots: 4, remaining: 0 });
        assert_eq!(gpu_times(&drain(&f.rx)), vec![(2, 30), (3, 40), (4, 50), (5, 60)]);
        assert_eq!(f.ctx.metrics().snapshot().harvest_stalls, 1);
    }

    #[test]
    fn test_slot_reuse_harvests_only_new_value() {
        let f = fixture(4, QueueKind::Direct);
        drain(&f.rx);
        f.ctx.allocate_slot_pair().unwrap();
        f.ctx.collect().unwrap();
        f.ctx.readback().write_slot(0, 111);
        f.ctx.readback().write_slot(1, 222);
        f.ctx.collect().unwrap();
        assert_eq!(gpu_times(&drain(&f.rx)), vec![(0, 111), (1, 222)]);

        // two more pairs wrap back onto slots 0/1
        assert_eq!(f.ctx.allocate_slot_pair(), Some(2));
        assert_eq!(f.ctx.allocate_slot_pair(), Some(0));
        f.ctx.collect().unwrap();
        for (slot, ts) in [(2, 333), (3, 444), (0, 555), (1, 666)] {
            f.ctx.readback().write_slot(slot, ts);
        }
        f.ctx.collect().unwrap();
        assert_eq!(gpu_times(&drain(&f.rx)), vec![(2, 333), (3, 444), (0, 555), (1, 666)]);
        assert_eq!(f.ctx.previous_checkpoint(), 6);
    }

    #[test]
    fn test_odd_pending_is_deferred() {
        let f = fixture(8, QueueKind::Direct);
        f.ctx.allocate_slot_pair().unwrap();
        f.ctx.readback().write_slot(0, 1);
        // a fence value that splits a pair
        f.ctx.queue().signal(&f.ctx.checkpoint_fence, 1).unwrap();
        assert_eq!(f.ctx.collect().unwrap(), CollectOutcome::Deferred { pending: 1 });
        assert_eq!(f.ctx.previous_checkpoint(), 0);
        assert_eq!(f.ctx.readback().read_slot(0), 1);
    }

    #[test]
    fn test_fence_past_capacity_reports_overflow() {
        let f = fixture(4, QueueKind::Direct);
        drain(&f.rx);
        f.ctx.queue().signal(&f.ctx.checkpoint_fence, 6).unwrap();
        let err = f.ctx.collect().unwrap_err();
        assert!(matches!(err, CollectError::RingOverflow { pending: 6, capacity: 4 }));
        assert_eq!(f.ctx.metrics().ring_overflows.load(Relaxed), 1);
        assert!(matches!(drain(&f.rx).as_slice(), [GpuEvent::Message { .. }]));
    }

    #[test]
    fn test_stale_gap_is_abandoned() {
        let device = SimDevice::new(SimConfig::deterministic());
        device.clock().set_ns(1_000);
        let (transport, rx) = ChannelTransport::unbounded();
        let options = ContextOptions { max_queries: 8, on_demand: false, stale_collect_limit: 3 };
        let ctx = QueryContext::<Sim>::create(&device, device.create_queue(QueueKind::Direct), transport, &options)
            .unwrap();
        drain(&rx);
        ctx.allocate_slot_pair().unwrap();
        ctx.allocate_slot_pair().unwrap();
        ctx.collect().unwrap();
        // pair 0 never resolves; pair 1 does
        ctx.readback().write_slot(2, 70);
        ctx.readback().write_slot(3, 80);

        for _ in 0..2 {
            assert_eq!(ctx.collect().unwrap(), CollectOutcome::Harvested { slots: 0, remaining: 4 });
        }
        assert_eq!(ctx.collect().unwrap(), CollectOutcome::Harvested { slots: 2, remaining: 0 });
        assert_eq!(ctx.previous_checkpoint(), 4);
        assert_eq!(gpu_times(&drain(&rx)), vec![(2, 70), (3, 80)]);
        assert_eq!(ctx.metrics().snapshot().pairs_abandoned, 1);
    }

    #[test]
    fn test_late_resolve_of_abandoned_pair_is_not_harvested() {
        let device = SimDevice::new(SimConfig::deterministic());
        device.clock().set_ns(1_000);
        let (transport, rx) = ChannelTransport::unbounded();
        let options = ContextOptions { max_queries: 4, on_demand: false, stale_collect_limit: 2 };
        let ctx = QueryContext::<Sim>::create(&device, device.create_queue(QueueKind::Direct), transport, &options)
            .unwrap();
        drain(&rx);
        assert_eq!(ctx.allocate_slot_pair(), Some(0));
        assert_eq!(ctx.allocate_slot_pair(), Some(2));
        ctx.collect().unwrap();
        ctx.readback().write_slot(2, 70);
        ctx.readback().write_slot(3, 80);
        assert_eq!(ctx.collect().unwrap(), CollectOutcome::Harvested { slots: 0, remaining: 4 });
        assert_eq!(ctx.collect().unwrap(), CollectOutcome::Harvested { slots: 2, remaining: 0 });
        assert_eq!(gpu_times(&drain(&rx)), vec![(2, 70), (3, 80)]);

        // the abandoned pair resolves after all, then its slots are reissued
        ctx.readback().write_slot(0, 9_000);
        ctx.readback().write_slot(1, 9_000);
        assert_eq!(ctx.allocate_slot_pair(), Some(0));
        assert_eq!(ctx.readback().read_slot(0), 0);
        assert_eq!(ctx.readback().read_slot(1), 0);
        assert_eq!(ctx.metrics().snapshot().late_resolves_discarded, 1);

        assert_eq!(ctx.collect().unwrap(), CollectOutcome::Idle { signaled: Some(6) });
        assert_eq!(ctx.collect().unwrap(), CollectOutcome::Harvested { slots: 0, remaining: 2 });
        assert!(gpu_times(&drain(&rx)).is_empty());

        ctx.readback().write_slot(0, 11);
        ctx.readback().write_slot(1, 12);
        assert_eq!(ctx.collect().unwrap(), CollectOutcome::Harvested { slots: 2, remaining: 0 });
        assert_eq!(gpu_times(&drain(&rx)), vec![(0, 11), (1, 12)]);
    }

    #[test]
    fn test_reissued_slot_without_late_resolve() {
        let device = SimDevice::new(SimConfig::deterministic());
        let (transport, _rx) = ChannelTransport::unbounded();
        let options = ContextOptions { max_queries: 4, on_demand: false, stale_collect_limit: 1 };
        let ctx = QueryContext::<Sim>::create(&device, device.create_queue(QueueKind::Direct), transport, &options)
            .unwrap();
        ctx.allocate_slot_pair().unwrap();
        ctx.allocate_slot_pair().unwrap();
        ctx.collect().unwrap();
        ctx.readback().write_slot(2, 5);
        ctx.readback().write_slot(3, 6);
        ctx.collect().unwrap();
        assert_eq!(ctx.metrics().snapshot().pairs_abandoned, 1);

        assert_eq!(ctx.allocate_slot_pair(), Some(0));
        assert_eq!(ctx.metrics().snapshot().late_resolves_discarded, 0);
        // list of pending scrubs is emptied once the slot is reissued
        assert_eq!(ctx.abandoned_len.load(Relaxed), 0);
    }

    #[test]
    fn test_gap_without_later_results_is_kept() {
        let device = SimDevice::new(SimConfig::deterministic());
        device.clock().set_ns(1_000);
        let (transport, _rx) = ChannelTransport::unbounded();
        let options = ContextOptions { max_queries: 8, on_demand: false, stale_collect_limit: 1 };
        let ctx = QueryContext::<Sim>::create(&device, device.create_queue(QueueKind::Direct), transport, &options)
            .unwrap();
        ctx.allocate_slot_pair().unwrap();
        ctx.collect().unwrap();
        for _ in 0..5 {
            assert_eq!(ctx.collect().unwrap(), CollectOutcome::Harvested { slots: 0, remaining: 2 });
        }
        assert_eq!(ctx.metrics().snapshot().pairs_abandoned, 0);
        assert_eq!(ctx.previous_checkpoint(), 0);
    }

    #[test]
    fn test_calibration_skipped_without_progress() {
        let f = fixture(8, QueueKind::Direct);
        drain(&f.rx);
        let seeded = f.ctx.prev_calibration_cpu_ticks();
        f.ctx.allocate_slot_pair().unwrap();
        f.ctx.collect().unwrap();
        f.ctx.readback().write_slot(0, 1);
        f.ctx.readback().write_slot(1, 2);
        // clock has not moved since creation: zero delta
        f.ctx.collect().unwrap();
        let events = drain(&f.rx);
        assert!(!events.iter().any(|ev| matches!(ev, GpuEvent::Calibration { .. })));
        assert_eq!(f.ctx.prev_calibration_cpu_ticks(), seeded);
        assert_eq!(f.ctx.metrics().snapshot().calibrations_skipped, 1);
    }

    #[test]
    fn test_calibration_reports_cpu_delta() {
        let f = fixture(8, QueueKind::Direct);
        drain(&f.rx);
        f.ctx.allocate_slot_pair().unwrap();
        f.ctx.collect().unwrap();
        f.ctx.readback().write_slot(0, 1);
        f.ctx.readback().write_slot(1, 2);
        f.device.clock().advance_ns(2_500);
        f.ctx.collect().unwrap();
        let delta = drain(&f.rx).into_iter().find_map(|ev| match ev {
            GpuEvent::Calibration { cpu_delta, gpu_time, .. } => Some((cpu_delta, gpu_time)),
            _ => None,
        });
        // 10 MHz CPU counter: 25 ticks of 100 ns
        assert_eq!(delta, Some((2_500, 1_002_500)));
        assert_eq!(f.ctx.prev_calibration_cpu_ticks(), 10_025);
    }

    #[test]
    fn test_calibration_failure_surfaces() {
        let f = fixture(8, QueueKind::Direct);
        f.ctx.allocate_slot_pair().unwrap();
        f.ctx.collect().unwrap();
        f.ctx.readback().write_slot(0, 1);
        f.ctx.readback().write_slot(1, 2);
        f.device.set_calibration_failure(true);
        assert!(matches!(f.ctx.collect(), Err(CollectError::Calibration(_))));
        // the harvest itself went through
        assert_eq!(f.ctx.previous_checkpoint(), 2);
    }

    #[test]
    fn test_lost_device_fails_collect() {
        let f = fixture(8, QueueKind::Direct);
        f.ctx.allocate_slot_pair().unwrap();
        f.device.set_device_removed(true);
        assert!(matches!(f.ctx.collect(), Err(CollectError::Signal(HalError::DeviceRemoved))));
        assert_eq!(f.ctx.metrics().snapshot().fence_signals, 0);

        f.device.set_device_removed(false);
        assert_eq!(f.ctx.collect().unwrap(), CollectOutcome::Idle { signaled: Some(2) });
    }

    #[test]
    fn test_on_demand_collect_skips_hardware() {
        let device = SimDevice::new(SimConfig::deterministic());
        let (transport, _rx) = ChannelTransport::unbounded();
        let options = ContextOptions { on_demand: true, ..ContextOptions::default() };
        let ctx = QueryContext::<Sim>::create(&device, device.create_queue(QueueKind::Direct), transport.clone(), &options)
            .unwrap();
        ctx.allocate_slot_pair().unwrap();
        transport.set_connected(false);
        assert_eq!(ctx.collect().unwrap(), CollectOutcome::Disconnected);
        assert_eq!(device.signals(), 0);
        assert_eq!(ctx.metrics().snapshot().collects, 0);
    }

    #[test]
    fn test_name_event() {
        let f = fixture(8, QueueKind::Compute);
        drain(&f.rx);
        f.ctx.name("async compute");
        match drain(&f.rx).as_slice() {
            [GpuEvent::ContextName { context, name }] => {
                assert_eq!(*context, f.ctx.id());
                assert_eq!(&**name, "async compute");
            }
            other => panic!("unexpected events {:?}", other),
        }
    }

    #[test]
    fn test_name_truncated_on_char_boundary() {
        let f = fixture(8, QueueKind::Direct);
        drain(&f.rx);
        let long = "é".repeat(MAX_NAME_LEN);
        f.ctx.name(&long);
        match drain(&f.rx).as_slice() {
            [GpuEvent::ContextName { name, .. }] => {
                assert!(name.len() <= MAX_NAME_LEN);
                assert_eq!(name.len() % 2, 0);
            }
            other => panic!("unexpected events {:?}", other),
        }
    }

    #[test]
    fn test_copy_queue_requires_support() {
        let device = SimDevice::new(SimConfig { copy_queue_timestamps: false, ..SimConfig::deterministic() });
        let (transport, rx) = ChannelTransport::unbounded();
        let result = QueryContext::<Sim>::create(
            &device,
            device.create_queue(QueueKind::Copy),
            transport,
            &ContextOptions::default(),
        );
        assert!(matches!(result, Err(ContextError::CopyQueueTimestampsUnsupported)));
        assert!(device.heap_requests().is_empty());
        assert!(matches!(drain(&rx).as_slice(), [GpuEvent::Message { color: MESSAGE_COLOR_RED, .. }]));
    }

    #[test]
    fn test_fatal_preconditions() {
        let base = SimConfig::deterministic;
        let cases = [
            (SimConfig { max_queries: 0, ..base() }, "QueryHeap { requested: 2"),
            (SimConfig { fail_readback: true, ..base() }, "ReadbackBuffer("),
            (SimConfig { fail_fence: true, ..base() }, "Fence("),
            (SimConfig { timestamp_frequency: 0, ..base() }, "ZeroTimestampFrequency"),
            (SimConfig { fail_calibration: true, ..base() }, "Calibration("),
            (SimConfig { cpu_ticks_per_second: 0, ..base() }, "ZeroCpuTickFrequency"),
        ];
        for (config, expected) in cases {
            let device = SimDevice::new(config);
            let (transport, _rx) = ChannelTransport::unbounded();
            let err = QueryContext::<Sim>::create(
                &device,
                device.create_queue(QueueKind::Direct),
                transport.clone(),
                &ContextOptions::default(),
            )
            .err()
            .expect("creation should fail");
            let debug = format!("{:?}", err);
            assert!(debug.starts_with(expected), "expected {}, got {}", expected, debug);
            // no id is consumed by a failed creation
            assert_eq!(transport.next_context_id().map(ContextId::get), Some(0));
        }
    }

    #[test]
    fn test_context_ids_are_unique() {
        let device = SimDevice::new(SimConfig::deterministic());
        let (transport, _rx) = ChannelTransport::unbounded();
        let opts = ContextOptions { max_queries: 8, ..ContextOptions::default() };
        let a = QueryContext::<Sim>::create(&device, device.create_queue(QueueKind::Direct), transport.clone(), &opts)
            .unwrap();
        let b = QueryContext::<Sim>::create(&device, device.create_queue(QueueKind::Copy), transport, &opts).unwrap();
        assert_ne!(a.id(), b.id());
        a.destroy();
        b.destroy();
    }
}
