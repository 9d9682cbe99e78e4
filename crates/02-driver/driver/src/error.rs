//! Status codes reported by the offload driver.
//!
//! Every fallible driver call returns a [`DriverError`]. Task completions carry
//! the same type as their status, so the value crosses the completion path by
//! copy and never allocates.

use std::convert::Infallible;
use thiserror::Error;

/// Convenience result alias for driver calls.
pub type DriverResult<T, E = DriverError> = Result<T, E>;

/// Driver status codes. The numeric values returned by [`DriverError::code`]
/// are stable and appear in logs.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq, Hash)]
pub enum DriverError {
    #[error("invalid value")]
    InvalidValue,
    #[error("operation not permitted")]
    NotPermitted,
    #[error("no memory: pool or inventory exhausted")]
    NoMemory,
    #[error("object is in a bad state for this call")]
    BadState,
    #[error("not found")]
    NotFound,
    #[error("operation in progress")]
    InProgress,
    #[error("connection is not established")]
    NotConnected,
    #[error("connection failed")]
    ConnectionFailed,
    #[error("remote access error")]
    RemoteAccess,
    #[error("task flushed before completion")]
    Flushed,
    #[error("driver internal fault")]
    DriverFault,
}

impl DriverError {
    /// Stable numeric status code.
    pub fn code(self) -> i32 {
        match self {
            DriverError::InvalidValue => 3,
            DriverError::NotPermitted => 4,
            DriverError::NoMemory => 5,
            DriverError::BadState => 6,
            DriverError::NotFound => 7,
            DriverError::InProgress => 10,
            DriverError::NotConnected => 14,
            DriverError::ConnectionFailed => 15,
            DriverError::RemoteAccess => 16,
            DriverError::Flushed => 17,
            DriverError::DriverFault => 99,
        }
    }

    /// Inverse of [`DriverError::code`].
    pub fn from_code(code: i32) -> Option<Self> {
        Some(match code {
            3 => DriverError::InvalidValue,
            4 => DriverError::NotPermitted,
            5 => DriverError::NoMemory,
            6 => DriverError::BadState,
            7 => DriverError::NotFound,
            10 => DriverError::InProgress,
            14 => DriverError::NotConnected,
            15 => DriverError::ConnectionFailed,
            16 => DriverError::RemoteAccess,
            17 => DriverError::Flushed,
            99 => DriverError::DriverFault,
            _ => return None,
        })
    }

    /// True for conditions the process cannot recover from locally.
    pub fn is_fatal(self) -> bool {
        matches!(self, DriverError::DriverFault)
    }
}

impl From<Infallible> for DriverError {
    fn from(never: Infallible) -> Self {
        match never {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_round_trip() {
        let all = [
            DriverError::InvalidValue,
            DriverError::NotPermitted,
            DriverError::NoMemory,
            DriverError::BadState,
            DriverError::NotFound,
            DriverError::InProgress,
            DriverError::NotConnected,
            DriverError::ConnectionFailed,
            DriverError::RemoteAccess,
            DriverError::Flushed,
            DriverError::DriverFault,
        ];
        for err in all {
            assert_eq!(DriverError::from_code(err.code()), Some(err));
        }
        assert_eq!(DriverError::from_code(0), None);
    }

    #[test]
    fn only_driver_faults_are_fatal() {
        assert!(DriverError::DriverFault.is_fatal());
        assert!(!DriverError::ConnectionFailed.is_fatal());
    }
}
