//! Software GPU backend.
//!
//! Command lists record timestamp writes, resolves and simulated work; a
//! [`SimQueue`] executes them in order, synchronously, when a list is
//! submitted. Dropping a list without executing it models a command list
//! that is never submitted. Time comes from a [`SimClock`] that either
//! follows the host monotonic clock or is driven by hand, and is converted
//! to GPU and CPU ticks at the configured frequencies.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::clock;
use crate::hal::{
    Backend, ClockSample, CommandList, Device, Fence, GpuContextType, HalError, QueryHeapKind,
    Queue, QueueKind, ReadbackBuffer,
};

/// Simulated device parameters and fault switches.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SimConfig {
    /// Largest query heap the device agrees to allocate.
    #[serde(default = "SimConfig::default_max_queries")]
    pub max_queries: u32,
    #[serde(default = "SimConfig::default_copy_queue_timestamps")]
    pub copy_queue_timestamps: bool,
    /// GPU timestamp ticks per second.
    #[serde(default = "SimConfig::default_timestamp_frequency")]
    pub timestamp_frequency: u64,
    /// CPU counter ticks per second (QPC-style).
    #[serde(default = "SimConfig::default_cpu_ticks_per_second")]
    pub cpu_ticks_per_second: u64,
    /// Start with a hand-driven clock at zero instead of the host clock.
    #[serde(default)]
    pub manual_clock: bool,
    #[serde(default)]
    pub fail_readback: bool,
    #[serde(default)]
    pub fail_fence: bool,
    #[serde(default)]
    pub fail_calibration: bool,
    /// Fence signals fail as if the adapter had been lost.
    #[serde(default)]
    pub device_removed: bool,
}

impl SimConfig {
    fn default_max_queries() -> u32 { 16 * 1024 }
    fn default_copy_queue_timestamps() -> bool { true }
    fn default_timestamp_frequency() -> u64 { 25_000_000 }
    fn default_cpu_ticks_per_second() -> u64 { 10_000_000 }

    /// Manual clock, 1 GHz GPU timestamps (1 tick = 1 ns), 10 MHz CPU counter.
    pub fn deterministic() -> Self {
        Self {
            manual_clock: true,
            timestamp_frequency: 1_000_000_000,
            ..Self::default()
        }
    }
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            max_queries: Self::default_max_queries(),
            copy_queue_timestamps: Self::default_copy_queue_timestamps(),
            timestamp_frequency: Self::default_timestamp_frequency(),
            cpu_ticks_per_second: Self::default_cpu_ticks_per_second(),
            manual_clock: false,
            fail_readback: false,
            fail_fence: false,
            fail_calibration: false,
            device_removed: false,
        }
    }
}

/// Time base shared by a device and its queues.
pub struct SimClock {
    manual: bool,
    manual_ns: AtomicU64,
    /// Accumulated simulated GPU work, added on top of the base clock.
    work_ns: AtomicU64,
}

impl SimClock {
    fn new(manual: bool) -> Self {
        Self { manual, manual_ns: AtomicU64::new(0), work_ns: AtomicU64::new(0) }
    }

    pub fn now_ns(&self) -> u64 {
        let base = if self.manual {
            self.manual_ns.load(Ordering::Acquire)
        } else {
            clock::now_ns()
        };
        base + self.work_ns.load(Ordering::Acquire)
    }

    /// Set the base of a manual clock. No effect on a host-driven clock.
    pub fn set_ns(&self, ns: u64) {
        self.manual_ns.store(ns, Ordering::Release);
    }

    pub fn advance_ns(&self, ns: u64) {
        self.work_ns.fetch_add(ns, Ordering::AcqRel);
    }
}

fn scale(ns: u64, ticks_per_second: u64) -> u64 {
    (ns as u128 * ticks_per_second as u128 / 1_000_000_000) as u64
}

struct SimShared {
    config: SimConfig,
    clock: SimClock,
    fail_calibration: AtomicBool,
    device_removed: AtomicBool,
    heap_requests: Mutex<Vec<u32>>,
    signals: AtomicU64,
}

/// Marker type binding the simulated objects into a [`Backend`].
pub enum Sim {}

impl Backend for Sim {
    type Device = SimDevice;
    type Queue = SimQueue;
    type CommandList = SimCommandList;
    type QueryHeap = SimQueryHeap;
    type ReadbackBuffer = SimReadback;
    type Fence = SimFence;

    const CONTEXT_TYPE: GpuContextType = GpuContextType::Direct3D12;
}

#[derive(Clone)]
pub struct SimDevice {
    shared: Arc<SimShared>,
}

impl SimDevice {
    pub fn new(config: SimConfig) -> Self {
        let fail_calibration = AtomicBool::new(config.fail_calibration);
        let device_removed = AtomicBool::new(config.device_removed);
        let clock = SimClock::new(config.manual_clock);
        Self {
            shared: Arc::new(SimShared {
                config,
                clock,
                fail_calibration,
                device_removed,
                heap_requests: Mutex::new(Vec::new()),
                signals: AtomicU64::new(0),
            }),
        }
    }

    pub fn config(&self) -> &SimConfig {
        &self.shared.config
    }

    pub fn clock(&self) -> &SimClock {
        &self.shared.clock
    }

    pub fn create_queue(&self, kind: QueueKind) -> SimQueue {
        SimQueue { shared: self.shared.clone(), kind, executed: Arc::new(AtomicU64::new(0)) }
    }

    /// Sizes of every query heap requested so far, in call order.
    pub fn heap_requests(&self) -> Vec<u32> {
        self.shared.heap_requests.lock().unwrap().clone()
    }

    /// Fence signals issued through any queue of this device.
    pub fn signals(&self) -> u64 {
        self.shared.signals.load(Ordering::Relaxed)
    }

    pub fn set_calibration_failure(&self, fail: bool) {
        self.shared.fail_calibration.store(fail, Ordering::Release);
    }

    pub fn set_device_removed(&self, removed: bool) {
        self.shared.device_removed.store(removed, Ordering::Release);
    }
}

impl Device<Sim> for SimDevice {
    fn copy_queue_timestamps_supported(&self) -> Result<bool, HalError> {
        Ok(self.shared.config.copy_queue_timestamps)
    }

    fn create_query_heap(&self, kind: QueryHeapKind, count: u32) -> Result<SimQueryHeap, HalError> {
        self.shared.heap_requests.lock().unwrap().push(count);
        if kind == QueryHeapKind::CopyQueueTimestamp && !self.shared.config.copy_queue_timestamps {
            return Err(HalError::Unsupported("copy queue timestamp queries"));
        }
        if count == 0 || count > self.shared.config.max_queries {
            return Err(HalError::OutOfMemory { what: "query heap", bytes: count as u64 * 8 });
        }
        Ok(SimQueryHeap(Arc::new(SimHeapInner { kind, slots: Mutex::new(vec![0; count as usize]) })))
    }

    fn create_readback_buffer(&self, size_bytes: u64) -> Result<SimReadback, HalError> {
        if self.shared.config.fail_readback {
            return Err(HalError::OutOfMemory { what: "readback buffer", bytes: size_bytes });
        }
        Ok(SimReadback(Arc::new(Mutex::new(vec![0; (size_bytes / 8) as usize]))))
    }

    fn create_fence(&self, initial_value: u64) -> Result<SimFence, HalError> {
        if self.shared.config.fail_fence {
            return Err(HalError::Other("fence creation disabled".into()));
        }
        Ok(SimFence(Arc::new(AtomicU64::new(initial_value))))
    }
}

#[derive(Clone)]
pub struct SimQueue {
    shared: Arc<SimShared>,
    kind: QueueKind,
    executed: Arc<AtomicU64>,
}

impl SimQueue {
    /// Run every command of `list` in recording order.
    pub fn execute(&self, list: SimCommandList) {
        let clock = &self.shared.clock;
        let frequency = self.shared.config.timestamp_frequency;
        for command in list.commands {
            match command {
                SimCommand::Timestamp { heap, index } => {
                    if heap.0.kind == QueryHeapKind::CopyQueueTimestamp && self.kind != QueueKind::Copy {
                        tracing::warn!("sim: copy queue query heap used on a {:?} queue", self.kind);
                    }
                    let ticks = scale(clock.now_ns(), frequency);
                    let mut slots = heap.0.slots.lock().unwrap();
                    match slots.get_mut(index as usize) {
                        Some(slot) => *slot = ticks,
                        None => tracing::warn!("sim: timestamp query {} outside heap", index),
                    }
                }
                SimCommand::Resolve { heap, start, count, dest, offset } => {
                    let slots = heap.0.slots.lock().unwrap();
                    let mut data = dest.0.lock().unwrap();
                    let src = start as usize..(start + count) as usize;
                    let dst = (offset / 8) as usize;
                    match (slots.get(src), data.get_mut(dst..dst + count as usize)) {
                        (Some(src), Some(dst)) => dst.copy_from_slice(src),
                        _ => tracing::warn!("sim: resolve of {} queries at {} out of range", count, start),
                    }
                }
                SimCommand::Work { ns } => clock.advance_ns(ns),
            }
        }
        self.executed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn lists_executed(&self) -> u64 {
        self.executed.load(Ordering::Relaxed)
    }

    /// Sample the queue's current GPU timestamp.
    pub fn gpu_ticks(&self) -> u64 {
        scale(self.shared.clock.now_ns(), self.shared.config.timestamp_frequency)
    }
}

impl Queue<Sim> for SimQueue {
    fn kind(&self) -> QueueKind {
        self.kind
    }

    fn timestamp_frequency(&self) -> Result<u64, HalError> {
        Ok(self.shared.config.timestamp_frequency)
    }

    fn clock_calibration(&self) -> Result<ClockSample, HalError> {
        if self.shared.fail_calibration.load(Ordering::Acquire) {
            return Err(HalError::Unsupported("clock calibration"));
        }
        let ns = self.shared.clock.now_ns();
        Ok(ClockSample {
            gpu_ticks: scale(ns, self.shared.config.timestamp_frequency),
            cpu_ticks: scale(ns, self.shared.config.cpu_ticks_per_second),
        })
    }

    fn cpu_ticks_per_second(&self) -> u64 {
        self.shared.config.cpu_ticks_per_second
    }

    fn signal(&self, fence: &SimFence, value: u64) -> Result<(), HalError> {
        if self.shared.device_removed.load(Ordering::Acquire) {
            return Err(HalError::DeviceRemoved);
        }
        // execution is synchronous, so all prior work has already completed
        fence.0.store(value, Ordering::Release);
        self.shared.signals.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

struct SimHeapInner {
    kind: QueryHeapKind,
    slots: Mutex<Vec<u64>>,
}

#[derive(Clone)]
pub struct SimQueryHeap(Arc<SimHeapInner>);

impl SimQueryHeap {
    pub fn len(&self) -> usize {
        self.0.slots.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Clone)]
pub struct SimReadback(Arc<Mutex<Vec<u64>>>);

impl SimReadback {
    pub fn read_slot(&self, index: u32) -> u64 {
        self.0.lock().unwrap()[index as usize]
    }

    /// Write a slot directly, as if a resolve had landed.
    pub fn write_slot(&self, index: u32, value: u64) {
        self.0.lock().unwrap()[index as usize] = value;
    }

    pub fn slots(&self) -> usize {
        self.0.lock().unwrap().len()
    }
}

impl ReadbackBuffer for SimReadback {
    fn map<R>(&self, f: impl FnOnce(&mut [u64]) -> R) -> Result<R, HalError> {
        let mut data = self.0.lock().unwrap();
        Ok(f(data.as_mut_slice()))
    }
}

#[derive(Clone)]
pub struct SimFence(Arc<AtomicU64>);

impl Fence for SimFence {
    fn completed_value(&self) -> u64 {
        self.0.load(Ordering::Acquire)
    }
}

enum SimCommand {
    Timestamp { heap: SimQueryHeap, index: u32 },
    Resolve { heap: SimQueryHeap, start: u32, count: u32, dest: SimReadback, offset: u64 },
    Work { ns: u64 },
}

/// Recorded but not yet executed commands.
#[derive(Default)]
pub struct SimCommandList {
    commands: Vec<SimCommand>,
}

impl SimCommandList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `ns` of GPU work between the surrounding commands.
    pub fn simulate_work(&mut self, ns: u64) {
        self.commands.push(SimCommand::Work { ns });
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Number of recorded timestamp writes.
    pub fn timestamp_writes(&self) -> usize {
        self.commands.iter().filter(|c| matches!(c, SimCommand::Timestamp { .. })).count()
    }

    /// Number of recorded resolves.
    pub fn resolves(&self) -> usize {
        self.commands.iter().filter(|c| matches!(c, SimCommand::Resolve { .. })).count()
    }
}

impl CommandList<Sim> for SimCommandList {
    fn end_query(&mut self, heap: &SimQueryHeap, index: u32) {
        self.commands.push(SimCommand::Timestamp { heap: heap.clone(), index });
    }

    fn resolve_query_data(
        &mut self,
        heap: &SimQueryHeap,
        start: u32,
        count: u32,
        dest: &SimReadback,
        dest_offset: u64,
    ) {
        self.commands.push(SimCommand::Resolve {
            heap: heap.clone(),
            start,
            count,
            dest: dest.clone(),
            offset: dest_offset,
        });
    }
}
