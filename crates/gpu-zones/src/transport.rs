//! Profiler transport seam.
//!
//! The engine never serializes or ships events itself: it fills a
//! [`GpuEvent`] and hands it to a [`Transport`]. [`ChannelTransport`] is the
//! stock implementation, a crossbeam channel drained by whoever owns the
//! receiving end.

use crossbeam_channel::{Receiver, Sender, TrySendError};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use crate::clock;
use crate::event::{Callstack, ContextId, GpuEvent};

/// Everything the engine consumes from the surrounding profiler.
pub trait Transport: Send + Sync {
    /// On-demand gate. Only consulted by contexts created with
    /// `ContextOptions::on_demand`.
    fn is_connected(&self) -> bool {
        true
    }

    /// Profiler-domain host time in nanoseconds.
    fn now(&self) -> i64 {
        clock::now_ns() as i64
    }

    fn thread_id(&self) -> u32 {
        clock::thread_id()
    }

    fn callstack(&self, depth: u8) -> Callstack {
        capture_callstack(depth)
    }

    fn next_context_id(&self) -> Option<ContextId>;

    /// Take ownership of a filled event.
    fn submit(&self, event: GpuEvent);
}

/// Monotonic allocator of 8-bit context ids. Ids are never recycled; after
/// [`ContextId::MAX_LIVE`] allocations every further request returns `None`.
pub struct ContextIdAllocator {
    next: AtomicU8,
}

impl ContextIdAllocator {
    pub const fn new() -> Self {
        Self { next: AtomicU8::new(0) }
    }

    pub fn next(&self) -> Option<ContextId> {
        self.next
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |id| id.checked_add(1))
            .ok()
            .map(ContextId::new)
    }

    /// Number of ids handed out so far.
    pub fn allocated(&self) -> usize {
        self.next.load(Ordering::Acquire) as usize
    }
}

impl Default for ContextIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// Capture the caller's stack, keeping at most `depth` frames.
pub fn capture_callstack(depth: u8) -> Callstack {
    let trace = std::backtrace::Backtrace::force_capture().to_string();
    let frames = trace
        .lines()
        .filter_map(|line| {
            let (index, symbol) = line.trim_start().split_once(": ")?;
            index.parse::<u32>().ok()?;
            Some(symbol)
        })
        .filter(|symbol| {
            !symbol.starts_with("std::backtrace")
                && !symbol.contains("gpu_zones::transport")
                && !symbol.contains("gpu_zones::zone")
        })
        .take(depth as usize)
        .map(str::to_owned)
        .collect();
    Callstack { depth, frames }
}

/// [`Transport`] backed by a crossbeam channel.
///
/// `submit` never blocks: when a bounded channel is full, or the receiver is
/// gone, the event is dropped and counted. Counters use `Relaxed` ordering.
pub struct ChannelTransport {
    tx: Sender<GpuEvent>,
    connected: AtomicBool,
    context_ids: ContextIdAllocator,
    pub events_submitted: AtomicU64,
    pub events_dropped: AtomicU64,
}

impl ChannelTransport {
    pub fn bounded(capacity: usize) -> (Arc<Self>, Receiver<GpuEvent>) {
        let (tx, rx) = crossbeam_channel::bounded(capacity);
        (Arc::new(Self::with_sender(tx)), rx)
    }

    pub fn unbounded() -> (Arc<Self>, Receiver<GpuEvent>) {
        let (tx, rx) = crossbeam_channel::unbounded();
        (Arc::new(Self::with_sender(tx)), rx)
    }

    fn with_sender(tx: Sender<GpuEvent>) -> Self {
        Self {
            tx,
            connected: AtomicBool::new(true),
            context_ids: ContextIdAllocator::new(),
            events_submitted: AtomicU64::new(0),
            events_dropped: AtomicU64::new(0),
        }
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::Release);
    }
}

impl Transport for ChannelTransport {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    fn next_context_id(&self) -> Option<ContextId> {
        self.context_ids.next()
    }

    fn submit(&self, event: GpuEvent) {
        match self.tx.try_send(event) {
            Ok(()) => {
                self.events_submitted.fetch_add(1, Ordering::Relaxed);
            }
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                self.events_dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}
