//! Native progress engine: the single completion queue of a set of contexts.
//!
//! Contexts post [`Completion`]s from whichever thread finished the work.
//! Callbacks run only inside [`NativePe::progress`], on the thread that polls
//! the engine, and never inline with a submission.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender};
use smallvec::SmallVec;

use crate::conn::{self, ConnEvent, NativeConnection};
use crate::ctx::NativeCtx;
use crate::fabric;
use crate::rdma::NativeRdma;
use crate::task::TaskHandle;
use crate::{CtxState, DriverError, DriverResult};

/// Completions handled by one `progress` pass.
pub const PROGRESS_BATCH: usize = 16;

/// Progress engines that may exist at once in a process.
pub const MAX_PROGRESS_ENGINES: usize = 64;

static LIVE_ENGINES: AtomicUsize = AtomicUsize::new(0);

pub(crate) enum Completion {
    Task(TaskHandle),
    Connection {
        conn: NativeConnection,
        event: ConnEvent,
    },
    CtxState {
        rdma: NativeRdma,
        prev: CtxState,
        next: CtxState,
    },
}

pub(crate) struct PeShared {
    id: u64,
    tx: Sender<Completion>,
    rx: Receiver<Completion>,
}

impl PeShared {
    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn post(&self, completion: Completion) {
        // The engine owns the receiving side, so the send cannot fail.
        let _ = self.tx.send(completion);
    }
}

/// Handle to a native progress engine. Exactly one thread polls it.
pub struct NativePe {
    inner: Arc<PeShared>,
}

impl NativePe {
    /// Acquires a progress engine. Fails with `NoMemory` when the process
    /// already holds [`MAX_PROGRESS_ENGINES`].
    pub fn create() -> DriverResult<Self> {
        LIVE_ENGINES
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |live| {
                (live < MAX_PROGRESS_ENGINES).then_some(live + 1)
            })
            .map_err(|_| DriverError::NoMemory)?;

        let (tx, rx) = crossbeam_channel::unbounded();
        let id = fabric::next_id();
        tracing::debug!(pe = id, "created progress engine");
        Ok(Self {
            inner: Arc::new(PeShared { id, tx, rx }),
        })
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Registers `ctx` with this engine. A context binds to one engine for
    /// its whole life and only while idle.
    pub fn connect_ctx(&self, ctx: &NativeCtx) -> DriverResult<()> {
        ctx.bind(&self.inner)?;
        tracing::debug!(pe = self.inner.id, ctx = ctx.id(), "context registered");
        Ok(())
    }

    /// Completions waiting for the next pass.
    pub fn pending(&self) -> usize {
        self.inner.rx.len()
    }

    /// One non-blocking pass over at most [`PROGRESS_BATCH`] completions.
    /// Returns whether any completion was handled.
    pub fn progress(&self) -> bool {
        let batch: SmallVec<[Completion; PROGRESS_BATCH]> =
            self.inner.rx.try_iter().take(PROGRESS_BATCH).collect();
        if batch.is_empty() {
            return false;
        }
        for completion in batch {
            match completion {
                Completion::Task(task) => task.dispatch(),
                Completion::Connection { conn, event } => conn::dispatch(conn, event),
                Completion::CtxState { rdma, prev, next } => rdma.as_ctx().notify_state(prev, next),
            }
        }
        true
    }
}

impl Drop for NativePe {
    fn drop(&mut self) {
        let stranded = self.inner.rx.len();
        if stranded > 0 {
            tracing::warn!(pe = self.inner.id, stranded, "progress engine dropped with pending completions");
        }
        LIVE_ENGINES.fetch_sub(1, Ordering::AcqRel);
    }
}

impl std::fmt::Debug for NativePe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativePe")
            .field("id", &self.inner.id)
            .field("pending", &self.pending())
            .finish()
    }
}
