pub mod calibration;
pub mod clock;
pub mod context;
pub mod error;
pub mod event;
pub mod hal;
pub mod metrics;
pub mod ring;
pub mod sim;
pub mod transport;
pub mod zone;

pub use context::{CollectOutcome, ContextOptions, QueryContext, MAX_QUERIES};
pub use error::{CollectError, ContextError, ContextResult};
pub use event::{ContextId, GpuEvent, SourceLocation};
pub use hal::{Backend, QueueKind};
pub use metrics::{ContextMetrics, ContextMetricsSnapshot};
pub use transport::{ChannelTransport, Transport};
pub use zone::{TransientLocation, ZoneScope};
