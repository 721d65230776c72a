//! Hardware seam between the engine and a GPU API.
//!
//! A [`Backend`] names the handful of hardware objects the engine needs: a
//! device that creates query heaps, readback buffers and fences; a queue that
//! reports its timestamp frequency, samples GPU/CPU clock pairs and signals
//! fences; and a command list that writes and resolves timestamp queries.
//! [`crate::sim`] provides a software implementation.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors reported by a hardware backend.
#[derive(Debug, Error)]
pub enum HalError {
    #[error("out of memory allocating {what} ({bytes} bytes)")]
    OutOfMemory { what: &'static str, bytes: u64 },
    #[error("feature not supported: {0}")]
    Unsupported(&'static str),
    #[error("device removed")]
    DeviceRemoved,
    #[error("{0}")]
    Other(String),
}

/// Command queue type. Copy queues need an extra capability check before
/// they can record timestamp queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueKind {
    Direct,
    Compute,
    Copy,
}

/// Query heap flavour; copy queues need their own heap type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryHeapKind {
    Timestamp,
    CopyQueueTimestamp,
}

impl QueryHeapKind {
    pub fn for_queue(kind: QueueKind) -> Self {
        match kind {
            QueueKind::Copy => QueryHeapKind::CopyQueueTimestamp,
            QueueKind::Direct | QueueKind::Compute => QueryHeapKind::Timestamp,
        }
    }
}

/// Graphics API tag written into the new-context event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum GpuContextType {
    Invalid,
    OpenGl,
    Vulkan,
    OpenCl,
    Direct3D12,
    Direct3D11,
}

/// One simultaneous sample of the queue's GPU clock and the CPU tick counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockSample {
    pub gpu_ticks: u64,
    pub cpu_ticks: u64,
}

/// A GPU API binding. Associated types are shared between recording threads
/// and the collecting thread, hence the `Send + Sync` bounds.
pub trait Backend: Sized + 'static {
    type Device: Device<Self>;
    type Queue: Queue<Self> + Send + Sync;
    type CommandList: CommandList<Self>;
    type QueryHeap: Send + Sync;
    type ReadbackBuffer: ReadbackBuffer + Send + Sync;
    type Fence: Fence + Send + Sync;

    const CONTEXT_TYPE: GpuContextType;
}

pub trait Device<B: Backend> {
    /// Whether copy queues can record timestamp queries on this device.
    fn copy_queue_timestamps_supported(&self) -> Result<bool, HalError>;

    fn create_query_heap(&self, kind: QueryHeapKind, count: u32) -> Result<B::QueryHeap, HalError>;

    /// Host-visible buffer; its contents start zeroed.
    fn create_readback_buffer(&self, size_bytes: u64) -> Result<B::ReadbackBuffer, HalError>;

    fn create_fence(&self, initial_value: u64) -> Result<B::Fence, HalError>;
}

pub trait Queue<B: Backend> {
    fn kind(&self) -> QueueKind;

    /// GPU timestamp ticks per second.
    fn timestamp_frequency(&self) -> Result<u64, HalError>;

    fn clock_calibration(&self) -> Result<ClockSample, HalError>;

    /// Frequency of the CPU tick domain returned by [`Queue::clock_calibration`].
    /// Process-wide, independent of the GPU timestamp frequency.
    fn cpu_ticks_per_second(&self) -> u64;

    /// Enqueue a signal of `fence` to `value`. Safe to call from any thread.
    fn signal(&self, fence: &B::Fence, value: u64) -> Result<(), HalError>;
}

pub trait CommandList<B: Backend> {
    /// Record a timestamp write into `heap` at `index`.
    fn end_query(&mut self, heap: &B::QueryHeap, index: u32);

    /// Record a copy of `count` query results starting at `start` into `dest`
    /// at byte offset `dest_offset`.
    fn resolve_query_data(
        &mut self,
        heap: &B::QueryHeap,
        start: u32,
        count: u32,
        dest: &B::ReadbackBuffer,
        dest_offset: u64,
    );
}

pub trait ReadbackBuffer {
    /// Map the whole buffer as `u64` slots, run `f`, unmap.
    fn map<R>(&self, f: impl FnOnce(&mut [u64]) -> R) -> Result<R, HalError>;
}

pub trait Fence {
    /// Highest value the fence has reached on the GPU timeline.
    fn completed_value(&self) -> u64;
}
