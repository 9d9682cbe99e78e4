//! The continuation protocol.
//!
//! A [`Sender`] describes work. Connecting it to a [`Receiver`] yields an
//! [`OperationState`], which does nothing until started. Exactly one of the
//! receiver's completion methods is eventually called, and it consumes the
//! receiver, so a second completion does not type-check.
//!
//! Operation states are started through `Pin<&mut Self>`: once started they
//! may hand their own address to a driver or a queue. Pinning means the
//! address stays valid until `Drop` runs, and dropping a started operation
//! withdraws it from wherever it was handed.

use std::pin::Pin;

use crate::stop::StopToken;

/// Completion side of an operation.
pub trait Receiver<T, E>: Send {
    fn set_value(self, value: T);

    fn set_error(self, error: E);

    fn set_stopped(self);

    /// Token the operation polls before doing work.
    fn stop_token(&self) -> StopToken {
        StopToken::never()
    }
}

/// A connected, not yet started operation.
pub trait OperationState {
    fn start(self: Pin<&mut Self>);
}

/// Lazy description of asynchronous work.
pub trait Sender {
    type Output;
    type Error;
    type Operation<R: Receiver<Self::Output, Self::Error>>: OperationState;

    fn connect<R: Receiver<Self::Output, Self::Error>>(self, receiver: R) -> Self::Operation<R>;
}

/// Source of senders that complete on a particular execution context.
pub trait Scheduler: Clone + Send {
    type Sender: Sender<Output = (), Error = std::convert::Infallible> + Send;

    fn schedule(&self) -> Self::Sender;
}
