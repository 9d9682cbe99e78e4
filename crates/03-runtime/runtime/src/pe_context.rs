//! A run loop with its progress engine on a dedicated thread.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use offload_driver::{DriverError, DriverResult};

use crate::combinators::SenderExt;
use crate::engine::{Context, ProgressEngine};
use crate::error::{RuntimeError, RuntimeResult};
use crate::run_loop::{RunLoop, RunLoopConfig, RunLoopScheduler};
use crate::sender::Scheduler;
use crate::sync_wait::sync_wait;

static NEXT_THREAD: AtomicUsize = AtomicUsize::new(0);

/// Owns a [`RunLoop`], a [`ProgressEngine`] and the driver thread
/// (`offload-pe-N`) that pumps both. Dropping the context finishes the loop
/// and joins the thread.
pub struct PeContext {
    run_loop: Arc<RunLoop>,
    engine: Arc<ProgressEngine>,
    thread: Option<JoinHandle<()>>,
}

impl PeContext {
    pub fn new() -> RuntimeResult<Self> {
        Self::with_config(RunLoopConfig::default())
    }

    pub fn with_config(config: RunLoopConfig) -> RuntimeResult<Self> {
        let engine = Arc::new(ProgressEngine::create()?);
        let run_loop = RunLoop::new(config);
        let name = format!("offload-pe-{}", NEXT_THREAD.fetch_add(1, Ordering::Relaxed));

        let thread = {
            let run_loop = run_loop.clone();
            let engine = engine.clone();
            thread::Builder::new().name(name.clone()).spawn(move || {
                tracing::debug!(thread = %name, idle = ?run_loop.config().idle, "progress thread started");
                run_loop.run(&engine);
                tracing::debug!(thread = %name, "progress thread exiting");
            })?
        };

        Ok(Self {
            run_loop,
            engine,
            thread: Some(thread),
        })
    }

    pub fn scheduler(&self) -> RunLoopScheduler {
        self.run_loop.scheduler()
    }

    pub fn engine(&self) -> &ProgressEngine {
        &self.engine
    }

    /// Registers `ctx` with the engine. The registration itself runs on the
    /// driver thread; the caller blocks until it is done.
    pub fn connect_ctx<C: Context + ?Sized>(&self, ctx: &C) -> DriverResult<()> {
        let engine = self.engine.clone();
        let native = ctx.as_ctx();
        let registered = self
            .scheduler()
            .schedule()
            .then(move |()| engine.connect_native(native));
        match sync_wait(registered) {
            Ok(Some(result)) => result,
            Ok(None) => Err(DriverError::BadState),
            Err(never) => match never {},
        }
    }

    /// Finishes the loop and waits for the driver thread.
    pub fn join(mut self) -> RuntimeResult<()> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> RuntimeResult<()> {
        self.run_loop.finish();
        match self.thread.take() {
            Some(handle) => handle.join().map_err(|_| RuntimeError::ThreadPanicked),
            None => Ok(()),
        }
    }
}

impl Drop for PeContext {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            crate::fatal::report("joining the progress thread", &err);
        }
    }
}
