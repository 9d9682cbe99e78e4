//! Sender-based RDMA operations.
//!
//! * [`Device`], [`MemoryMap`], [`BufInventory`] / [`Buf`] – registered memory.
//! * [`Rdma`] – a context whose tasks complete as senders.
//! * [`RdmaConnection`] – an endpoint, established with [`Rdma::connect`].
//! * [`RdmaSender`] – write, read, send and receive operations.
//!
//! ```ignore
//! let sender = rdma.connect(&mut stream)?;
//! let conn = sync_wait(starts_on(pe.scheduler(), sender))?.expect("not stopped");
//! sync_wait(starts_on(pe.scheduler(), conn.write(&src, &remote)))?;
//! ```

mod connection;
mod device;
mod error;
mod mmap;
mod oneside;
mod rdma;
mod task;
mod twoside;

pub use connection::{ConnectOperation, ConnectSender, RdmaConnection};
pub use device::Device;
pub use error::RdmaError;
pub use mmap::{Buf, BufInventory, MemoryMap};
pub use offload_driver::{AccessFlags, ConnState, CtxState, DeviceInfo, DriverError, TaskKind};
pub use oneside::{OneSidedArgs, RdmaReadTask, RdmaWriteTask};
pub use rdma::{Rdma, RdmaConfig};
pub use task::{NativeTask, RdmaOperation, RdmaSender, RdmaTask};
pub use twoside::{RdmaRecvTask, RdmaSendTask, SendArgs};
