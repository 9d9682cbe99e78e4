//! Runtime-level failures.

use std::io;

use offload_driver::DriverError;
use thiserror::Error;

pub type RuntimeResult<T, E = RuntimeError> = Result<T, E>;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("driver error: {0}")]
    Driver(#[from] DriverError),

    #[error("failed to spawn the progress thread: {0}")]
    Spawn(#[from] io::Error),

    #[error("the progress thread panicked")]
    ThreadPanicked,
}
