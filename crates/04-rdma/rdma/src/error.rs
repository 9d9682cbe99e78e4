use offload_driver::DriverError;
use offload_transport::TransportError;
use thiserror::Error;

/// Failures of the blocking part of the connection handshake.
#[derive(Debug, Error)]
pub enum RdmaError {
    #[error(transparent)]
    Driver(#[from] DriverError),

    #[error("descriptor exchange failed: {0}")]
    Transport(#[from] TransportError),
}
