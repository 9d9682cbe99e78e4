//! Software offload driver.
//!
//! An in-process fabric exposing the native surface the runtime is written
//! against: devices, memory maps and buffers, progress engines, RDMA contexts
//! with fixed task pools, and connection endpoints exchanged as opaque
//! descriptors. Work is executed by copying bytes inside the process, and
//! every completion is delivered through a progress engine:
//! * [`NativePe`] – completion queue polled by exactly one thread.
//! * [`NativeRdma`] – context with write/read/send/receive task pools.
//! * [`NativeConnection`] – endpoint created by [`NativeRdma::export`].
//! * [`NativeMmap`] / [`NativeBuf`] – registered memory and views into it.

mod buf;
mod conn;
mod ctx;
pub mod descriptor;
pub mod device;
mod error;
mod fabric;
mod mmap;
mod pe;
mod rdma;
pub mod region;
mod task;
mod types;

pub use buf::{NativeBuf, NativeBufInventory};
pub use conn::{ConnectionCallbacks, ConnectionCb, NativeConnection};
pub use ctx::{NativeCtx, StateChangedCb};
pub use device::{devinfo_list, DeviceInfo, NativeDevice};
pub use error::{DriverError, DriverResult};
pub use mmap::{NativeMmap, MAX_MMAP_DEVICES};
pub use pe::{NativePe, MAX_PROGRESS_ENGINES, PROGRESS_BATCH};
pub use rdma::NativeRdma;
pub use task::{TaskCompletionCb, TaskConf, TaskHandle, TaskKind};
pub use types::{AccessFlags, ConnState, CtxState, UserData};
