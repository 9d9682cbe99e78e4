//! The RDMA capability context.

use std::io::{Read, Write};
use std::sync::Arc;

use offload_driver::{
    ConnectionCallbacks, CtxState, DriverError, DriverResult, NativeCtx, NativeRdma, TaskConf,
    TaskKind, UserData,
};
use offload_runtime::{fatal, Context};
use offload_transport::FramedStream;

use crate::connection::{self, ConnectSender, RdmaConnection};
use crate::device::Device;
use crate::error::RdmaError;
use crate::task;

/// Pool sizes and addressing of a context.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RdmaConfig {
    /// Slots in each of the write, read, send and receive pools.
    pub tasks_per_kind: u32,
    pub gid_index: u32,
}

impl Default for RdmaConfig {
    fn default() -> Self {
        Self {
            tasks_per_kind: 16,
            gid_index: 0,
        }
    }
}

struct RdmaInner {
    native: NativeRdma,
    device: Device,
}

impl Drop for RdmaInner {
    fn drop(&mut self) {
        if self.native.as_ctx().state() != CtxState::Running {
            return;
        }
        match self.native.stop() {
            Ok(()) => {}
            Err(DriverError::InProgress) => {
                tracing::warn!(ctx = self.native.as_ctx().id(), "rdma context dropped with tasks in flight")
            }
            Err(err) => fatal::report("stopping an rdma context", &err),
        }
    }
}

/// RDMA context configured for sender-based operations. Clones share the
/// context; the last clone stops it.
///
/// Register it with a progress engine and start it through [`Context`]
/// before exporting endpoints or allocating operations.
#[derive(Clone)]
pub struct Rdma {
    inner: Arc<RdmaInner>,
}

impl Rdma {
    pub fn open(device: &Device) -> DriverResult<Self> {
        Self::with_config(device, RdmaConfig::default())
    }

    pub fn with_config(device: &Device, config: RdmaConfig) -> DriverResult<Self> {
        let native = NativeRdma::create(device.native())?;
        native.set_gid_index(config.gid_index)?;
        native.as_ctx().set_state_changed_cb(log_state_change)?;
        native.set_connection_state_callbacks(ConnectionCallbacks {
            on_established: connection::on_established,
            on_failure: connection::on_failure,
            on_disconnect: connection::on_disconnect,
        })?;
        let conf = TaskConf {
            on_success: task::on_task_success,
            on_error: task::on_task_error,
            num_tasks: config.tasks_per_kind,
        };
        for kind in [TaskKind::Write, TaskKind::Read, TaskKind::Send, TaskKind::Receive] {
            native.set_task_conf(kind, conf)?;
        }

        Ok(Self {
            inner: Arc::new(RdmaInner {
                native,
                device: device.clone(),
            }),
        })
    }

    pub fn device(&self) -> &Device {
        &self.inner.device
    }

    pub fn native(&self) -> &NativeRdma {
        &self.inner.native
    }

    pub fn available_tasks(&self, kind: TaskKind) -> usize {
        self.inner.native.available_tasks(kind)
    }

    /// Creates an endpoint and the descriptor a peer needs to reach it.
    pub fn export(&self) -> DriverResult<(Vec<u8>, RdmaConnection)> {
        let (desc, native) = self.inner.native.export()?;
        Ok((desc, RdmaConnection::new(native, self.clone())))
    }

    /// Handshake with an already exchanged peer descriptor.
    pub fn connect_to(&self, connection: RdmaConnection, remote_desc: Vec<u8>) -> ConnectSender {
        ConnectSender::new(connection, remote_desc)
    }

    /// Exports an endpoint and swaps descriptors over `stream`: the local one
    /// is sent first, then the peer's is read. Both sides can call this.
    pub fn connect<S: Read + Write>(
        &self,
        stream: &mut FramedStream<S>,
    ) -> Result<ConnectSender, RdmaError> {
        let (desc, connection) = self.export()?;
        stream.send_frame(&desc)?;
        let remote_desc = stream.recv_frame()?;
        tracing::debug!(conn = connection.id(), remote_len = remote_desc.len(), "descriptors exchanged");
        Ok(self.connect_to(connection, remote_desc))
    }
}

impl Context for Rdma {
    fn as_ctx(&self) -> &NativeCtx {
        self.inner.native.as_ctx()
    }

    fn start(&self) -> DriverResult<()> {
        self.inner.native.start()
    }

    fn stop(&self) -> DriverResult<()> {
        self.inner.native.stop()
    }
}

impl std::fmt::Debug for Rdma {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Rdma").field(&self.inner.native).finish()
    }
}

fn log_state_change(_user_data: UserData, ctx_id: u64, prev: CtxState, next: CtxState) {
    tracing::info!(ctx = ctx_id, ?prev, ?next, "rdma context state changed");
}
