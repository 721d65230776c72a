//! Error types for context creation and collection.

use thiserror::Error;

use crate::hal::HalError;

/// Context creation result type alias.
pub type ContextResult<T> = Result<T, ContextError>;

/// A precondition that keeps a context from being created. None of these
/// are recoverable for the queue in question: the context would be unable to
/// produce a consistent timestamp stream.
#[derive(Error, Debug)]
pub enum ContextError {
    #[error("platform does not support profiling of copy queues")]
    CopyQueueTimestampsUnsupported,

    #[error("failed to query copy queue timestamp support: {0}")]
    FeatureQuery(#[source] HalError),

    #[error("failed to create a timestamp query heap (last attempt: {requested} queries): {source}")]
    QueryHeap {
        requested: u32,
        #[source]
        source: HalError,
    },

    #[error("failed to create query readback buffer: {0}")]
    ReadbackBuffer(#[source] HalError),

    #[error("failed to create checkpoint fence: {0}")]
    Fence(#[source] HalError),

    #[error("failed to get timestamp frequency: {0}")]
    TimestampFrequency(#[source] HalError),

    #[error("queue reported a zero timestamp frequency")]
    ZeroTimestampFrequency,

    #[error("failed to get queue clock calibration: {0}")]
    Calibration(#[source] HalError),

    #[error("clock calibration unavailable: zero CPU tick frequency")]
    ZeroCpuTickFrequency,

    #[error("all {0} GPU context ids are in use")]
    ContextIdsExhausted(usize),
}

/// Failure of a single `collect` call. The context stays usable.
#[derive(Error, Debug)]
pub enum CollectError {
    #[error("query ring overflow: {pending} unharvested slots with capacity {capacity}")]
    RingOverflow { pending: u64, capacity: u32 },

    #[error("failed to signal checkpoint fence: {0}")]
    Signal(#[source] HalError),

    #[error("failed to map query readback buffer: {0}")]
    Map(#[source] HalError),

    #[error("failed to obtain queue clock calibration counters: {0}")]
    Calibration(#[source] HalError),
}
