//! Progress engine wrapper and the capability-context seam.

use offload_driver::{CtxState, DriverResult, NativeCtx, NativePe};

/// A capability context: anything backed by a native context that a
/// progress engine can drive.
pub trait Context: Send + Sync {
    fn as_ctx(&self) -> &NativeCtx;

    fn start(&self) -> DriverResult<()>;

    fn stop(&self) -> DriverResult<()>;

    fn state(&self) -> CtxState {
        self.as_ctx().state()
    }
}

/// Polling completion engine. Only the driver thread calls
/// [`ProgressEngine::progress`].
///
/// Dropping the engine while operations are in flight strands them: their
/// completions are never delivered.
#[derive(Debug)]
pub struct ProgressEngine {
    pe: NativePe,
}

impl ProgressEngine {
    pub fn create() -> DriverResult<Self> {
        Ok(Self {
            pe: NativePe::create()?,
        })
    }

    /// Registers `ctx`. Required, once, before the context can start.
    pub fn connect<C: Context + ?Sized>(&self, ctx: &C) -> DriverResult<()> {
        self.pe.connect_ctx(ctx.as_ctx())
    }

    pub(crate) fn connect_native(&self, ctx: &NativeCtx) -> DriverResult<()> {
        self.pe.connect_ctx(ctx)
    }

    /// One non-blocking pass. Returns whether any completion ran.
    pub fn progress(&self) -> bool {
        self.pe.progress()
    }

    pub fn native(&self) -> &NativePe {
        &self.pe
    }
}
