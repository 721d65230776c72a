//! Scoped GPU zones.
//!
//! A [`ZoneScope`] writes the begin timestamp when it is created and the end
//! timestamp plus a resolve of both slots when it is dropped, all into the
//! command list it borrows. The scope derefs to that command list, so work
//! and nested zones are recorded through it:
//!
//! ```
//! use gpu_zones::{source_location, ContextOptions, QueryContext, ZoneScope};
//! use gpu_zones::hal::QueueKind;
//! use gpu_zones::sim::{Sim, SimCommandList, SimConfig, SimDevice};
//! use gpu_zones::transport::ChannelTransport;
//!
//! let device = SimDevice::new(SimConfig::deterministic());
//! let (transport, _events) = ChannelTransport::unbounded();
//! let queue = device.create_queue(QueueKind::Direct);
//! let ctx = QueryContext::<Sim>::create(&device, queue.clone(), transport, &ContextOptions::default())?;
//!
//! let mut list = SimCommandList::new();
//! {
//!     let mut frame = ZoneScope::new(&ctx, &mut list, source_location!("frame"), true);
//!     let mut shadows = ZoneScope::new(&ctx, &mut *frame, source_location!("shadows"), true);
//!     shadows.simulate_work(1_000);
//! }
//! queue.execute(list);
//! ctx.collect()?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use std::ops::{Deref, DerefMut};

use crate::context::QueryContext;
use crate::event::{GpuEvent, OwnedSourceLocation, SourceLocation, SourceLocationRef};
use crate::hal::{Backend, CommandList};

/// Call-site text supplied at runtime. Copied into an owned location that is
/// handed to the transport with the begin event.
#[derive(Debug, Clone, Copy)]
pub struct TransientLocation<'s> {
    pub name: &'s str,
    pub function: &'s str,
    pub file: &'s str,
    pub line: u32,
}

impl TransientLocation<'_> {
    fn to_owned_location(self) -> Box<OwnedSourceLocation> {
        Box::new(OwnedSourceLocation {
            name: self.name.to_owned(),
            function: self.function.to_owned(),
            file: self.file.to_owned(),
            line: self.line,
        })
    }
}

pub struct ZoneScope<'a, B: Backend> {
    ctx: &'a QueryContext<B>,
    cmd: &'a mut B::CommandList,
    /// Begin slot; `None` for an inactive zone.
    query_id: Option<u32>,
}

impl<'a, B: Backend> ZoneScope<'a, B> {
    /// Zone named by a static source location.
    pub fn new(
        ctx: &'a QueryContext<B>,
        cmd: &'a mut B::CommandList,
        srcloc: &'static SourceLocation,
        active: bool,
    ) -> Self {
        Self::begin(ctx, cmd, active, || SourceLocationRef::Static(srcloc), None)
    }

    /// Like [`ZoneScope::new`], also attaching a call stack of `depth` frames.
    pub fn with_callstack(
        ctx: &'a QueryContext<B>,
        cmd: &'a mut B::CommandList,
        srcloc: &'static SourceLocation,
        depth: u8,
        active: bool,
    ) -> Self {
        Self::begin(ctx, cmd, active, || SourceLocationRef::Static(srcloc), Some(depth))
    }

    /// Zone named by text only known at runtime.
    pub fn transient(
        ctx: &'a QueryContext<B>,
        cmd: &'a mut B::CommandList,
        location: TransientLocation<'_>,
        active: bool,
    ) -> Self {
        Self::begin(ctx, cmd, active, || SourceLocationRef::Allocated(location.to_owned_location()), None)
    }

    pub fn transient_with_callstack(
        ctx: &'a QueryContext<B>,
        cmd: &'a mut B::CommandList,
        location: TransientLocation<'_>,
        depth: u8,
        active: bool,
    ) -> Self {
        Self::begin(
            ctx,
            cmd,
            active,
            || SourceLocationRef::Allocated(location.to_owned_location()),
            Some(depth),
        )
    }

    fn begin(
        ctx: &'a QueryContext<B>,
        cmd: &'a mut B::CommandList,
        active: bool,
        srcloc: impl FnOnce() -> SourceLocationRef,
        callstack_depth: Option<u8>,
    ) -> Self {
        let query_id = if active && ctx.recording_enabled() { ctx.allocate_slot_pair() } else { None };
        let Some(query_id) = query_id else {
            return Self { ctx, cmd, query_id: None };
        };

        cmd.end_query(ctx.query_heap(), query_id);

        let transport = ctx.transport();
        transport.submit(GpuEvent::ZoneBegin {
            cpu_time: transport.now(),
            srcloc: srcloc(),
            thread: transport.thread_id(),
            query_id: query_id as u16,
            context: ctx.id(),
            callstack: callstack_depth.map(|depth| transport.callstack(depth)),
        });

        Self { ctx, cmd, query_id: Some(query_id) }
    }

    pub fn is_active(&self) -> bool {
        self.query_id.is_some()
    }

    /// Begin slot of the zone; the end slot follows it.
    pub fn query_id(&self) -> Option<u32> {
        self.query_id
    }
}

impl<B: Backend> Drop for ZoneScope<'_, B> {
    fn drop(&mut self) {
        let Some(query_id) = self.query_id else {
            return;
        };
        let end_id = query_id + 1;
        self.cmd.end_query(self.ctx.query_heap(), end_id);

        let transport = self.ctx.transport();
        transport.submit(GpuEvent::ZoneEnd {
            cpu_time: transport.now(),
            thread: transport.thread_id(),
            query_id: end_id as u16,
            context: self.ctx.id(),
        });

        self.cmd.resolve_query_data(
            self.ctx.query_heap(),
            query_id,
            2,
            self.ctx.readback(),
            query_id as u64 * std::mem::size_of::<u64>() as u64,
        );
    }
}

impl<B: Backend> Deref for ZoneScope<'_, B> {
    type Target = B::CommandList;

    fn deref(&self) -> &Self::Target {
        &*self.cmd
    }
}

impl<B: Backend> DerefMut for ZoneScope<'_, B> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut *self.cmd
    }
}

/// Open a zone named after a string literal for the rest of the block.
///
/// `gpu_zone!(ctx, cmd, "name")` and `gpu_zone!(ctx, cmd, "name", active)`
/// expand to a [`ZoneScope`] built from a static source location.
#[macro_export]
macro_rules! gpu_zone {
    ($ctx:expr, $cmd:expr, $name:expr) => {
        $crate::gpu_zone!($ctx, $cmd, $name, true)
    };
    ($ctx:expr, $cmd:expr, $name:expr, $active:expr) => {
        $crate::zone::ZoneScope::new($ctx, $cmd, $crate::source_location!($name), $active)
    };
}
