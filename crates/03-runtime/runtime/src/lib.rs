//! Asynchronous execution runtime for offloaded operations.
//!
//! * [`Sender`] / [`Receiver`] / [`OperationState`] – the continuation protocol.
//! * [`just`], [`SenderExt::then`], [`SenderExt::let_value`], [`starts_on`] – adaptors.
//! * [`RunLoop`] – intrusive FIFO scheduler driven by one thread.
//! * [`ProgressEngine`] / [`PeContext`] – completion polling on a dedicated thread.
//! * [`sync_wait`] – blocks the caller until a sender completes.
//! * [`fatal`] – the process-wide policy for unrecoverable errors.

pub mod combinators;
mod engine;
mod error;
pub mod fatal;
mod pe_context;
pub mod run_loop;
mod sender;
mod stop;
mod sync_wait;
mod wait;

pub use combinators::{just, starts_on, Just, SenderExt};
pub use engine::{Context, ProgressEngine};
pub use error::{RuntimeError, RuntimeResult};
pub use pe_context::PeContext;
pub use run_loop::{IdleStrategy, RunLoop, RunLoopConfig, RunLoopScheduler, ScheduleSender};
pub use sender::{OperationState, Receiver, Scheduler, Sender};
pub use stop::{StopSource, StopToken};
pub use sync_wait::{sync_wait, sync_wait_with_stop};
