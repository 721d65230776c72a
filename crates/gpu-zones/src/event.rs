//! Events handed to the profiler transport.
//!
//! Each variant mirrors one fixed-layout record of the transport. Variable
//! length payloads (context names, dynamically captured source locations) are
//! owned by the event, so submitting the event transfers them to the
//! transport.

use serde::Serialize;

use crate::hal::GpuContextType;

/// Id of a GPU context, unique among the contexts created through one
/// [`ContextIdAllocator`](crate::transport::ContextIdAllocator).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct ContextId(u8);

impl ContextId {
    /// 255 ids fit in the 8-bit wire field; the last value is reserved.
    pub const MAX_LIVE: usize = u8::MAX as usize;

    pub(crate) const fn new(raw: u8) -> Self {
        Self(raw)
    }

    pub fn get(self) -> u8 {
        self.0
    }
}

/// Context capability flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct ContextFlags(u8);

impl ContextFlags {
    pub const NONE: Self = Self(0);
    /// The context emits calibration events.
    pub const CALIBRATION: Self = Self(1);

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

/// Call-site description embedded in the binary; see [`crate::source_location!`].
#[derive(Debug, Serialize)]
pub struct SourceLocation {
    pub name: Option<&'static str>,
    pub function: &'static str,
    pub file: &'static str,
    pub line: u32,
    pub color: u32,
}

/// Call-site description built at runtime for transient zones.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OwnedSourceLocation {
    pub name: String,
    pub function: String,
    pub file: String,
    pub line: u32,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum SourceLocationRef {
    Static(&'static SourceLocation),
    Allocated(Box<OwnedSourceLocation>),
}

impl SourceLocationRef {
    pub fn name(&self) -> Option<&str> {
        match self {
            SourceLocationRef::Static(loc) => loc.name,
            SourceLocationRef::Allocated(loc) => Some(loc.name.as_str()),
        }
    }
}

/// Captured call stack, innermost frame first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Callstack {
    pub depth: u8,
    pub frames: Vec<String>,
}

/// Color of diagnostic messages for fatal conditions (0xRRGGBB).
pub const MESSAGE_COLOR_RED: u32 = 0x8b_00_00;

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GpuEvent {
    NewContext {
        cpu_time: i64,
        gpu_time: u64,
        thread: u32,
        /// Nanoseconds per GPU tick.
        period: f32,
        context: ContextId,
        flags: ContextFlags,
        context_type: GpuContextType,
    },
    ContextName {
        context: ContextId,
        name: Box<str>,
    },
    Calibration {
        gpu_time: u64,
        cpu_time: i64,
        /// CPU time elapsed since the previous calibration, in ns.
        cpu_delta: i64,
        context: ContextId,
    },
    ZoneBegin {
        cpu_time: i64,
        srcloc: SourceLocationRef,
        thread: u32,
        query_id: u16,
        context: ContextId,
        #[serde(skip_serializing_if = "Option::is_none")]
        callstack: Option<Callstack>,
    },
    ZoneEnd {
        cpu_time: i64,
        thread: u32,
        query_id: u16,
        context: ContextId,
    },
    GpuTime {
        gpu_time: u64,
        query_id: u16,
        context: ContextId,
    },
    Message {
        text: String,
        color: u32,
    },
}

impl GpuEvent {
    /// Context the event belongs to, if any.
    pub fn context(&self) -> Option<ContextId> {
        match self {
            GpuEvent::NewContext { context, .. }
            | GpuEvent::ContextName { context, .. }
            | GpuEvent::Calibration { context, .. }
            | GpuEvent::ZoneBegin { context, .. }
            | GpuEvent::ZoneEnd { context, .. }
            | GpuEvent::GpuTime { context, .. } => Some(*context),
            GpuEvent::Message { .. } => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            GpuEvent::NewContext { .. } => "new_context",
            GpuEvent::ContextName { .. } => "context_name",
            GpuEvent::Calibration { .. } => "calibration",
            GpuEvent::ZoneBegin { .. } => "zone_begin",
            GpuEvent::ZoneEnd { .. } => "zone_end",
            GpuEvent::GpuTime { .. } => "gpu_time",
            GpuEvent::Message { .. } => "message",
        }
    }
}

/// Build a `&'static SourceLocation` for the enclosing call site.
///
/// ```
/// let loc = gpu_zones::source_location!("shadow pass");
/// assert_eq!(loc.name, Some("shadow pass"));
/// ```
#[macro_export]
macro_rules! source_location {
    ($name:expr) => {
        $crate::source_location!($name, 0)
    };
    ($name:expr, $color:expr) => {{
        static LOC: $crate::event::SourceLocation = $crate::event::SourceLocation {
            name: Some($name),
            function: module_path!(),
            file: file!(),
            line: line!(),
            color: $color,
        };
        &LOC
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zone_begin_serializes_static_location() {
        let ev = GpuEvent::ZoneBegin {
            cpu_time: 10,
            srcloc: SourceLocationRef::Static(crate::source_location!("blit")),
            thread: 7,
            query_id: 4,
            context: ContextId::new(2),
            callstack: None,
        };
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["type"], "zone_begin");
        assert_eq!(json["srcloc"]["name"], "blit");
        assert_eq!(json["query_id"], 4);
        assert_eq!(json["context"], 2);
        assert!(json.get("callstack").is_none());
    }

    #[test]
    fn test_allocated_location_name() {
        let loc = SourceLocationRef::Allocated(Box::new(OwnedSourceLocation {
            name: "upload".into(),
            function: "f".into(),
            file: "a.rs".into(),
            line: 3,
        }));
        assert_eq!(loc.name(), Some("upload"));
    }

    #[test]
    fn test_event_context_and_kind() {
        let ev = GpuEvent::GpuTime { gpu_time: 5, query_id: 1, context: ContextId::new(9) };
        assert_eq!(ev.context(), Some(ContextId::new(9)));
        assert_eq!(ev.kind(), "gpu_time");
        let msg = GpuEvent::Message { text: "x".into(), color: MESSAGE_COLOR_RED };
        assert_eq!(msg.context(), None);
    }

    #[test]
    fn test_flags() {
        assert!(ContextFlags::CALIBRATION.contains(ContextFlags::CALIBRATION));
        assert!(!ContextFlags::NONE.contains(ContextFlags::CALIBRATION));
    }
}
