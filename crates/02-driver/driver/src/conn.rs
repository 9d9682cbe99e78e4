//! Connection endpoints of an RDMA context.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::fabric::{self, fabric};
use crate::pe::Completion;
use crate::rdma::NativeRdma;
use crate::{ConnState, DriverError, DriverResult, UserData};

/// Connection state observer. Runs on the progress thread.
pub type ConnectionCb = fn(conn: &NativeConnection, conn_user_data: UserData, ctx_user_data: UserData);

/// Callbacks a context fires for connection state changes.
#[derive(Clone, Copy)]
pub struct ConnectionCallbacks {
    pub on_established: ConnectionCb,
    pub on_failure: ConnectionCb,
    pub on_disconnect: ConnectionCb,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ConnEvent {
    Established,
    Failed,
    Disconnected,
}

struct Handoff {
    user_data: UserData,
    in_callback: bool,
}

pub(crate) struct ConnShared {
    id: u64,
    owner: NativeRdma,
    state: AtomicU8,
    handoff: Mutex<Handoff>,
    callback_done: Condvar,
    peer: AtomicU64,
}

/// Handle to one connection endpoint. Clones refer to the same endpoint.
#[derive(Clone)]
pub struct NativeConnection {
    inner: Arc<ConnShared>,
}

impl NativeConnection {
    pub(crate) fn new(owner: NativeRdma) -> Self {
        let conn = Self {
            inner: Arc::new(ConnShared {
                id: fabric::next_id(),
                owner,
                state: AtomicU8::new(ConnState::Pending as u8),
                handoff: Mutex::new(Handoff {
                    user_data: UserData::NULL,
                    in_callback: false,
                }),
                callback_done: Condvar::new(),
                peer: AtomicU64::new(0),
            }),
        };
        fabric().publish_connection(conn.inner.id, &conn.inner);
        conn
    }

    pub(crate) fn from_shared(inner: Arc<ConnShared>) -> Self {
        Self { inner }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn state(&self) -> ConnState {
        ConnState::from_u8(self.inner.state.load(Ordering::Acquire))
    }

    pub fn user_data(&self) -> UserData {
        self.inner.handoff.lock().user_data
    }

    pub fn set_user_data(&self, data: UserData) {
        self.inner.handoff.lock().user_data = data;
    }

    /// Clears the user data if it is still `expected`. Blocks while a
    /// connection callback that was handed `expected` runs on another
    /// thread, so after this returns no callback holds it.
    pub fn withdraw_user_data(&self, expected: UserData) {
        let mut handoff = self.inner.handoff.lock();
        loop {
            if handoff.user_data != expected {
                return;
            }
            if !handoff.in_callback {
                break;
            }
            self.inner.callback_done.wait(&mut handoff);
        }
        handoff.user_data = UserData::NULL;
        tracing::debug!(conn = self.inner.id, "withdrew connection user data");
    }

    /// Id of the remote endpoint once a descriptor has been applied.
    pub fn peer_id(&self) -> Option<u64> {
        match self.inner.peer.load(Ordering::Acquire) {
            0 => None,
            id => Some(id),
        }
    }

    pub(crate) fn owner(&self) -> &NativeRdma {
        &self.inner.owner
    }

    pub(crate) fn begin_connect(&self, peer: u64) -> DriverResult<()> {
        self.inner
            .state
            .compare_exchange(
                ConnState::Pending as u8,
                ConnState::Connecting as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map_err(|_| DriverError::BadState)?;
        self.inner.peer.store(peer, Ordering::Release);
        Ok(())
    }

    /// Live peer endpoint, if it still exists and is not torn down.
    pub(crate) fn peer(&self) -> Option<NativeConnection> {
        let peer = fabric().connection(self.peer_id()?)?;
        let peer = NativeConnection::from_shared(peer);
        match peer.state() {
            ConnState::Failed | ConnState::Disconnected => None,
            _ => Some(peer),
        }
    }

    fn compare_state(&self, from: ConnState, to: ConnState) -> bool {
        self.inner
            .state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn post(&self, event: ConnEvent) {
        match self.inner.owner.as_ctx().pe() {
            Some(pe) => pe.post(Completion::Connection {
                conn: self.clone(),
                event,
            }),
            None => tracing::warn!(conn = self.inner.id, ?event, "connection event without a progress engine"),
        }
    }

    /// Tears the endpoint down. Idempotent.
    pub fn disconnect(&self) -> DriverResult<()> {
        let prev = ConnState::from_u8(
            self.inner
                .state
                .swap(ConnState::Disconnected as u8, Ordering::AcqRel),
        );
        if prev == ConnState::Disconnected {
            return Ok(());
        }
        fabric().withdraw_connection(self.inner.id);
        tracing::debug!(conn = self.inner.id, ?prev, "connection disconnected");
        if prev == ConnState::Established {
            self.post(ConnEvent::Disconnected);
        }
        Ok(())
    }
}

impl Drop for ConnShared {
    fn drop(&mut self) {
        fabric().withdraw_connection(self.id);
    }
}

impl std::fmt::Debug for NativeConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeConnection")
            .field("id", &self.inner.id)
            .field("state", &self.state())
            .field("peer", &self.peer_id())
            .finish()
    }
}

pub(crate) fn dispatch(conn: NativeConnection, event: ConnEvent) {
    let ctx_data = conn.owner().as_ctx().user_data();
    let applied = match event {
        ConnEvent::Established => conn.compare_state(ConnState::Connecting, ConnState::Established),
        ConnEvent::Failed => conn.compare_state(ConnState::Connecting, ConnState::Failed),
        ConnEvent::Disconnected => true,
    };
    if !applied {
        tracing::trace!(conn = conn.id(), ?event, state = ?conn.state(), "stale connection event");
        return;
    }
    if event == ConnEvent::Failed {
        fabric().withdraw_connection(conn.id());
    }

    let Some(cbs) = conn.owner().connection_callbacks() else {
        tracing::warn!(conn = conn.id(), ?event, "no connection callbacks installed");
        return;
    };
    let cb = match event {
        ConnEvent::Established => cbs.on_established,
        ConnEvent::Failed => cbs.on_failure,
        ConnEvent::Disconnected => cbs.on_disconnect,
    };
    let user_data = {
        let mut handoff = conn.inner.handoff.lock();
        handoff.in_callback = true;
        handoff.user_data
    };
    cb(&conn, user_data, ctx_data);
    conn.inner.handoff.lock().in_callback = false;
    conn.inner.callback_done.notify_all();
}
