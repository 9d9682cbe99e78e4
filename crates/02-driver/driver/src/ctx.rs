//! State shared by every capability context.

use std::sync::atomic::{AtomicU32, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;

use crate::fabric;
use crate::pe::PeShared;
use crate::{CtxState, DriverError, DriverResult, UserData};

/// Observes context state transitions. Runs on the progress thread.
pub type StateChangedCb = fn(ctx_user_data: UserData, ctx_id: u64, prev: CtxState, next: CtxState);

/// Common context core: lifecycle state, progress engine binding, user data
/// and the count of outstanding tasks.
pub struct NativeCtx {
    id: u64,
    state: AtomicU8,
    pe: OnceLock<Arc<PeShared>>,
    user_data: AtomicUsize,
    state_changed: Mutex<Option<StateChangedCb>>,
    inflight: AtomicU32,
}

impl NativeCtx {
    pub(crate) fn new() -> Self {
        Self {
            id: fabric::next_id(),
            state: AtomicU8::new(CtxState::Idle as u8),
            pe: OnceLock::new(),
            user_data: AtomicUsize::new(0),
            state_changed: Mutex::new(None),
            inflight: AtomicU32::new(0),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> CtxState {
        CtxState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn user_data(&self) -> UserData {
        UserData::from_raw(self.user_data.load(Ordering::Acquire))
    }

    pub fn set_user_data(&self, data: UserData) {
        self.user_data.store(data.raw(), Ordering::Release);
    }

    /// Installs the state observer. Only allowed while idle.
    pub fn set_state_changed_cb(&self, cb: StateChangedCb) -> DriverResult<()> {
        if self.state() != CtxState::Idle {
            return Err(DriverError::BadState);
        }
        *self.state_changed.lock() = Some(cb);
        Ok(())
    }

    /// Tasks submitted and not yet handed to their completion callback.
    pub fn inflight(&self) -> u32 {
        self.inflight.load(Ordering::Acquire)
    }

    pub fn is_registered(&self) -> bool {
        self.pe.get().is_some()
    }

    pub(crate) fn bind(&self, pe: &Arc<PeShared>) -> DriverResult<()> {
        if self.state() != CtxState::Idle {
            return Err(DriverError::BadState);
        }
        self.pe.set(pe.clone()).map_err(|_| {
            tracing::warn!(ctx = self.id, pe = pe.id(), "context already registered with a progress engine");
            DriverError::BadState
        })
    }

    pub(crate) fn pe(&self) -> Option<&Arc<PeShared>> {
        self.pe.get()
    }

    /// Stores `next` and returns the previous state.
    pub(crate) fn transition(&self, next: CtxState) -> CtxState {
        CtxState::from_u8(self.state.swap(next as u8, Ordering::AcqRel))
    }

    pub(crate) fn compare_transition(&self, from: CtxState, to: CtxState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn task_submitted(&self) {
        self.inflight.fetch_add(1, Ordering::AcqRel);
    }

    /// Returns the number of tasks still outstanding.
    pub(crate) fn task_retired(&self) -> u32 {
        self.inflight.fetch_sub(1, Ordering::AcqRel).saturating_sub(1)
    }

    pub(crate) fn notify_state(&self, prev: CtxState, next: CtxState) {
        let cb = *self.state_changed.lock();
        match cb {
            Some(cb) => cb(self.user_data(), self.id, prev, next),
            None => tracing::trace!(ctx = self.id, ?prev, ?next, "context state changed"),
        }
    }
}

impl std::fmt::Debug for NativeCtx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeCtx")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("inflight", &self.inflight())
            .finish()
    }
}
