//! Two-sided messaging. A send is matched with the next receive the peer
//! posts.

use offload_driver::{DriverResult, NativeConnection, UserData};

use crate::connection::RdmaConnection;
use crate::mmap::Buf;
use crate::rdma::Rdma;
use crate::task::{NativeTask, RdmaSender, RdmaTask};

pub struct SendArgs {
    conn: NativeConnection,
    buf: Buf,
}

/// Sends a buffer's data to the peer.
pub struct RdmaSendTask {
    task: NativeTask,
}

impl RdmaTask for RdmaSendTask {
    type Args = SendArgs;
    type Output = ();

    fn allocate(rdma: &Rdma, args: SendArgs) -> DriverResult<Self> {
        rdma.native()
            .task_send_allocate(&args.conn, args.buf.native(), UserData::NULL)
            .map(|handle| Self {
                task: NativeTask::new(handle),
            })
    }

    fn as_native_task(&self) -> &NativeTask {
        &self.task
    }

    fn output(&self) -> DriverResult<()> {
        Ok(())
    }
}

/// Receives one message. Completes with the received length, which is also
/// stored as the buffer's data length.
pub struct RdmaRecvTask {
    task: NativeTask,
}

impl RdmaTask for RdmaRecvTask {
    type Args = Buf;
    type Output = usize;

    fn allocate(rdma: &Rdma, buf: Buf) -> DriverResult<Self> {
        rdma.native()
            .task_receive_allocate(buf.native(), UserData::NULL)
            .map(|handle| Self {
                task: NativeTask::new(handle),
            })
    }

    fn as_native_task(&self) -> &NativeTask {
        &self.task
    }

    fn output(&self) -> DriverResult<usize> {
        self.task.handle().result_len()
    }
}

impl RdmaConnection {
    /// Sends the data of `buf`.
    pub fn send(&self, buf: &Buf) -> RdmaSender<RdmaSendTask> {
        let args = SendArgs {
            conn: self.native().clone(),
            buf: buf.clone(),
        };
        RdmaSender::new(self.rdma().clone(), args)
    }
}

impl Rdma {
    /// Receives the next message from any connected peer into `buf`.
    pub fn recv(&self, buf: &Buf) -> RdmaSender<RdmaRecvTask> {
        RdmaSender::new(self.clone(), buf.clone())
    }
}
