//! RDMA capability context of the software fabric.

use std::collections::VecDeque;
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;

use crate::buf::NativeBuf;
use crate::conn::{ConnEvent, ConnectionCallbacks, NativeConnection};
use crate::ctx::NativeCtx;
use crate::descriptor::ConnectionDescriptor;
use crate::device::NativeDevice;
use crate::fabric::fabric;
use crate::pe::Completion;
use crate::task::{TaskArgs, TaskConf, TaskHandle, TaskKind, TaskPool};
use crate::{ConnState, CtxState, DriverError, DriverResult, UserData};

/// Two-sided matching state of a receiving context.
#[derive(Default)]
pub(crate) struct TwoSidedQueues {
    pub(crate) posted_recvs: VecDeque<TaskHandle>,
    pub(crate) unmatched_sends: VecDeque<TaskHandle>,
}

struct RdmaSettings {
    gid_index: u32,
    connection_cbs: Option<ConnectionCallbacks>,
}

pub(crate) struct RdmaShared {
    ctx: NativeCtx,
    device: Arc<NativeDevice>,
    settings: Mutex<RdmaSettings>,
    pools: [OnceLock<TaskPool>; TaskKind::COUNT],
    two_sided: Mutex<TwoSidedQueues>,
}

impl Drop for RdmaShared {
    fn drop(&mut self) {
        tracing::debug!(ctx = self.ctx.id(), "rdma context released");
    }
}

/// Handle to an RDMA context. Clones refer to the same context.
///
/// Posted receives and connections hold the context alive; stopping the
/// context flushes posted receives.
#[derive(Clone)]
pub struct NativeRdma {
    inner: Arc<RdmaShared>,
}

impl NativeRdma {
    pub fn create(device: &Arc<NativeDevice>) -> DriverResult<Self> {
        let rdma = Self {
            inner: Arc::new(RdmaShared {
                ctx: NativeCtx::new(),
                device: device.clone(),
                settings: Mutex::new(RdmaSettings {
                    gid_index: 0,
                    connection_cbs: None,
                }),
                pools: Default::default(),
                two_sided: Mutex::new(TwoSidedQueues::default()),
            }),
        };
        tracing::debug!(ctx = rdma.inner.ctx.id(), device = %device.info().ibdev_name, "created rdma context");
        Ok(rdma)
    }

    pub fn as_ctx(&self) -> &NativeCtx {
        &self.inner.ctx
    }

    pub fn device(&self) -> &Arc<NativeDevice> {
        &self.inner.device
    }

    fn ensure_idle(&self) -> DriverResult<()> {
        if self.inner.ctx.state() == CtxState::Idle {
            Ok(())
        } else {
            Err(DriverError::BadState)
        }
    }

    pub fn gid_index(&self) -> u32 {
        self.inner.settings.lock().gid_index
    }

    pub fn set_gid_index(&self, gid_index: u32) -> DriverResult<()> {
        self.ensure_idle()?;
        self.inner.settings.lock().gid_index = gid_index;
        Ok(())
    }

    pub fn set_connection_state_callbacks(&self, cbs: ConnectionCallbacks) -> DriverResult<()> {
        self.ensure_idle()?;
        self.inner.settings.lock().connection_cbs = Some(cbs);
        Ok(())
    }

    pub(crate) fn connection_callbacks(&self) -> Option<ConnectionCallbacks> {
        self.inner.settings.lock().connection_cbs
    }

    /// Configures the pool and callbacks of one task kind. Once per kind,
    /// before start.
    pub fn set_task_conf(&self, kind: TaskKind, conf: TaskConf) -> DriverResult<()> {
        self.ensure_idle()?;
        if conf.num_tasks == 0 {
            return Err(DriverError::InvalidValue);
        }
        self.inner.pools[kind.index()]
            .set(TaskPool::new(kind, conf))
            .map_err(|_| DriverError::BadState)
    }

    pub(crate) fn pool(&self, kind: TaskKind) -> Option<&TaskPool> {
        self.inner.pools[kind.index()].get()
    }

    /// Free slots left in the pool of `kind`.
    pub fn available_tasks(&self, kind: TaskKind) -> usize {
        self.pool(kind).map_or(0, TaskPool::available)
    }

    pub(crate) fn two_sided(&self) -> &Mutex<TwoSidedQueues> {
        &self.inner.two_sided
    }

    fn post_state(&self, prev: CtxState, next: CtxState) {
        if let Some(pe) = self.inner.ctx.pe() {
            pe.post(Completion::CtxState {
                rdma: self.clone(),
                prev,
                next,
            });
        }
    }

    /// Starts the context. It must be registered with a progress engine.
    pub fn start(&self) -> DriverResult<()> {
        let ctx = &self.inner.ctx;
        if !ctx.is_registered() {
            return Err(DriverError::BadState);
        }
        if !ctx.compare_transition(CtxState::Idle, CtxState::Starting) {
            return Err(DriverError::BadState);
        }
        self.post_state(CtxState::Idle, CtxState::Starting);
        ctx.transition(CtxState::Running);
        self.post_state(CtxState::Starting, CtxState::Running);
        tracing::debug!(ctx = ctx.id(), "rdma context started");
        Ok(())
    }

    /// Stops the context. Posted receives are flushed and sends waiting on
    /// this context fail. While tasks are outstanding this returns
    /// `InProgress` and the context reaches `Idle` once the last completion
    /// has been handled.
    pub fn stop(&self) -> DriverResult<()> {
        let ctx = &self.inner.ctx;
        if !ctx.compare_transition(CtxState::Running, CtxState::Stopping) {
            return Err(DriverError::BadState);
        }
        self.post_state(CtxState::Running, CtxState::Stopping);

        let flushed = std::mem::take(&mut *self.inner.two_sided.lock());
        for recv in flushed.posted_recvs {
            recv.complete(Err(DriverError::Flushed));
        }
        for send in flushed.unmatched_sends {
            send.complete(Err(DriverError::RemoteAccess));
        }

        if ctx.inflight() == 0 {
            self.finish_stop();
            Ok(())
        } else {
            tracing::debug!(ctx = ctx.id(), inflight = ctx.inflight(), "stop deferred until tasks drain");
            Err(DriverError::InProgress)
        }
    }

    pub(crate) fn finish_stop(&self) {
        if self
            .inner
            .ctx
            .compare_transition(CtxState::Stopping, CtxState::Idle)
        {
            self.post_state(CtxState::Stopping, CtxState::Idle);
            tracing::debug!(ctx = self.inner.ctx.id(), "rdma context stopped");
        }
    }

    fn ensure_running(&self) -> DriverResult<()> {
        if self.inner.ctx.state() == CtxState::Running {
            Ok(())
        } else {
            Err(DriverError::BadState)
        }
    }

    pub(crate) fn same_context(&self, other: &NativeRdma) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn owns(&self, conn: &NativeConnection) -> DriverResult<()> {
        if conn.owner().same_context(self) {
            Ok(())
        } else {
            Err(DriverError::InvalidValue)
        }
    }

    /// Creates a connection endpoint and the descriptor a peer needs to
    /// reach it.
    pub fn export(&self) -> DriverResult<(Vec<u8>, NativeConnection)> {
        self.ensure_running()?;
        let conn = NativeConnection::new(self.clone());
        let desc = ConnectionDescriptor {
            ctx_id: self.inner.ctx.id(),
            conn_id: conn.id(),
            gid_index: self.gid_index(),
        };
        tracing::debug!(ctx = desc.ctx_id, conn = desc.conn_id, "exported connection");
        Ok((desc.encode(), conn))
    }

    /// Applies a peer's descriptor to `conn`. The outcome is reported through
    /// the connection callbacks on the progress engine.
    pub fn connect(&self, remote_desc: &[u8], conn: &NativeConnection) -> DriverResult<()> {
        self.owns(conn)?;
        self.ensure_running()?;
        let remote = ConnectionDescriptor::decode(remote_desc)?;
        conn.begin_connect(remote.conn_id)?;

        let reachable = fabric().connection(remote.conn_id).map(NativeConnection::from_shared);
        let reachable = reachable.filter(|peer| {
            peer.owner().as_ctx().id() == remote.ctx_id
                && !matches!(peer.state(), ConnState::Failed | ConnState::Disconnected)
        });
        if reachable.is_some() {
            conn.post(ConnEvent::Established);
        } else {
            tracing::debug!(conn = conn.id(), peer = remote.conn_id, "peer endpoint unreachable");
            conn.post(ConnEvent::Failed);
        }
        Ok(())
    }

    fn allocate(&self, kind: TaskKind, args: TaskArgs, user_data: UserData) -> DriverResult<TaskHandle> {
        self.ensure_running()?;
        let pool = self.pool(kind).ok_or(DriverError::BadState)?;
        pool.allocate(self, args, user_data)
    }

    /// One-sided write of `src`'s data into the remote buffer `dst`.
    pub fn task_write_allocate(
        &self,
        conn: &NativeConnection,
        src: &NativeBuf,
        dst: &NativeBuf,
        user_data: UserData,
    ) -> DriverResult<TaskHandle> {
        self.owns(conn)?;
        if src.is_remote() || !dst.is_remote() || src.data_len() > dst.len() {
            return Err(DriverError::InvalidValue);
        }
        let args = TaskArgs::Write {
            conn: conn.clone(),
            src: src.clone(),
            dst: dst.clone(),
        };
        self.allocate(TaskKind::Write, args, user_data)
    }

    /// One-sided read of the remote buffer `src` into `dst`.
    pub fn task_read_allocate(
        &self,
        conn: &NativeConnection,
        src: &NativeBuf,
        dst: &NativeBuf,
        user_data: UserData,
    ) -> DriverResult<TaskHandle> {
        self.owns(conn)?;
        if !src.is_remote() || dst.is_remote() || src.data_len() > dst.len() {
            return Err(DriverError::InvalidValue);
        }
        let args = TaskArgs::Read {
            conn: conn.clone(),
            src: src.clone(),
            dst: dst.clone(),
        };
        self.allocate(TaskKind::Read, args, user_data)
    }

    /// Sends `buf`'s data to the peer of `conn`.
    pub fn task_send_allocate(
        &self,
        conn: &NativeConnection,
        buf: &NativeBuf,
        user_data: UserData,
    ) -> DriverResult<TaskHandle> {
        self.owns(conn)?;
        if buf.is_remote() {
            return Err(DriverError::InvalidValue);
        }
        let args = TaskArgs::Send {
            conn: conn.clone(),
            buf: buf.clone(),
        };
        self.allocate(TaskKind::Send, args, user_data)
    }

    /// Receives the next message sent to this context into `buf`.
    pub fn task_receive_allocate(&self, buf: &NativeBuf, user_data: UserData) -> DriverResult<TaskHandle> {
        if buf.is_remote() {
            return Err(DriverError::InvalidValue);
        }
        let args = TaskArgs::Receive { buf: buf.clone() };
        self.allocate(TaskKind::Receive, args, user_data)
    }
}

impl std::fmt::Debug for NativeRdma {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeRdma")
            .field("ctx", &self.inner.ctx)
            .field("device", &self.inner.device.info().ibdev_name)
            .finish()
    }
}
