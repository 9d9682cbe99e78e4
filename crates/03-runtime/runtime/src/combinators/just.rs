use std::convert::Infallible;
use std::marker::PhantomData;
use std::pin::Pin;

use crate::sender::{OperationState, Receiver, Sender};

/// Sender completing immediately with `value`.
pub fn just<T>(value: T) -> Just<T> {
    Just::new(value)
}

/// Completes inline with a value. The error type is only nominal and lets
/// `Just` slot into chains with a concrete error.
pub struct Just<T, E = Infallible> {
    value: T,
    _error: PhantomData<fn() -> E>,
}

impl<T, E> Just<T, E> {
    pub fn new(value: T) -> Self {
        Self {
            value,
            _error: PhantomData,
        }
    }
}

impl<T, E> Sender for Just<T, E> {
    type Output = T;
    type Error = E;
    type Operation<R: Receiver<T, E>> = JustOperation<T, E, R>;

    fn connect<R: Receiver<T, E>>(self, receiver: R) -> JustOperation<T, E, R> {
        JustOperation {
            value: Some(self.value),
            receiver: Some(receiver),
            _error: PhantomData,
        }
    }
}

pub struct JustOperation<T, E, R> {
    value: Option<T>,
    receiver: Option<R>,
    _error: PhantomData<fn() -> E>,
}

impl<T, E, R: Receiver<T, E>> OperationState for JustOperation<T, E, R> {
    fn start(self: Pin<&mut Self>) {
        // SAFETY: no field is structurally pinned; both are moved out by value.
        let this = unsafe { self.get_unchecked_mut() };
        if let (Some(value), Some(receiver)) = (this.value.take(), this.receiver.take()) {
            receiver.set_value(value);
        }
    }
}
