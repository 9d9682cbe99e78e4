//! One-sided operations: the remote side is not involved.

use offload_driver::{DriverResult, NativeConnection, UserData};

use crate::connection::RdmaConnection;
use crate::mmap::Buf;
use crate::rdma::Rdma;
use crate::task::{NativeTask, RdmaSender, RdmaTask};

/// Connection and buffers of a one-sided transfer.
pub struct OneSidedArgs {
    conn: NativeConnection,
    src: Buf,
    dst: Buf,
}

/// Writes local data into a peer's exported memory.
pub struct RdmaWriteTask {
    task: NativeTask,
}

impl RdmaTask for RdmaWriteTask {
    type Args = OneSidedArgs;
    type Output = ();

    fn allocate(rdma: &Rdma, args: OneSidedArgs) -> DriverResult<Self> {
        rdma.native()
            .task_write_allocate(&args.conn, args.src.native(), args.dst.native(), UserData::NULL)
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

/// Reads a peer's exported memory into a local buffer.
pub struct RdmaReadTask {
    task: NativeTask,
}

impl RdmaTask for RdmaReadTask {
    type Args = OneSidedArgs;
    type Output = ();

    fn allocate(rdma: &Rdma, args: OneSidedArgs) -> DriverResult<Self> {
        rdma.native()
            .task_read_allocate(&args.conn, args.src.native(), args.dst.native(), UserData::NULL)
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

impl RdmaConnection {
    /// Copies the data of local `src` into remote `dst`.
    pub fn write(&self, src: &Buf, dst: &Buf) -> RdmaSender<RdmaWriteTask> {
        RdmaSender::new(self.rdma().clone(), self.one_sided(src, dst))
    }

    /// Copies the data of remote `src` into local `dst`.
    pub fn read(&self, src: &Buf, dst: &Buf) -> RdmaSender<RdmaReadTask> {
        RdmaSender::new(self.rdma().clone(), self.one_sided(src, dst))
    }

    fn one_sided(&self, src: &Buf, dst: &Buf) -> OneSidedArgs {
        OneSidedArgs {
            conn: self.native().clone(),
            src: src.clone(),
            dst: dst.clone(),
        }
    }
}
