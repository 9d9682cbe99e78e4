//! Error handling helpers for the descriptor transport.
//!
//! The transport keeps its error surface small: socket failures, frames that
//! violate the configured limit, and peers that hang up mid-frame. Callers on
//! the control path usually bubble these up with `?`.

use std::io;
use thiserror::Error;

/// Convenience result alias for fallible transport operations.
pub type TransportResult<T, E = TransportError> = Result<T, E>;

/// Errors surfaced by the length-prefixed transport.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Underlying socket or stream failure.
    #[error("transport i/o error: {0}")]
    Io(#[from] io::Error),

    /// Peer declared a frame larger than the receiver accepts.
    #[error("frame declares {declared} bytes, limit is {max}")]
    FrameTooLarge { declared: usize, max: usize },

    /// Local payload cannot be described by a 32-bit length prefix.
    #[error("payload of {len} bytes does not fit a 32-bit length prefix")]
    PayloadTooLarge { len: usize },

    /// Peer closed the stream before a full frame arrived.
    #[error("connection closed during {0}")]
    Closed(&'static str),

    /// A frame expected to carry text was not valid UTF-8.
    #[error("frame is not valid utf-8")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),
}

impl TransportError {
    /// Returns true when the peer went away rather than misbehaving.
    pub fn is_disconnect(&self) -> bool {
        match self {
            TransportError::Closed(_) => true,
            TransportError::Io(err) => matches!(
                err.kind(),
                io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }
}
