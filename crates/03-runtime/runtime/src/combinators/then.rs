use crate::sender::{Receiver, Sender};
use crate::stop::StopToken;

/// Sender returned by [`SenderExt::then`](super::SenderExt::then).
pub struct Then<S, F> {
    sender: S,
    f: F,
}

impl<S, F> Then<S, F> {
    pub(crate) fn new(sender: S, f: F) -> Self {
        Self { sender, f }
    }
}

impl<S, F, U> Sender for Then<S, F>
where
    S: Sender,
    F: FnOnce(S::Output) -> U + Send,
{
    type Output = U;
    type Error = S::Error;
    type Operation<R: Receiver<U, S::Error>> = S::Operation<ThenReceiver<F, R>>;

    fn connect<R: Receiver<U, S::Error>>(self, receiver: R) -> Self::Operation<R> {
        self.sender.connect(ThenReceiver { f: self.f, receiver })
    }
}

/// Applies the mapping before forwarding a value; errors and stops pass
/// through untouched.
pub struct ThenReceiver<F, R> {
    f: F,
    receiver: R,
}

impl<T, E, U, F, R> Receiver<T, E> for ThenReceiver<F, R>
where
    F: FnOnce(T) -> U + Send,
    R: Receiver<U, E>,
{
    fn set_value(self, value: T) {
        self.receiver.set_value((self.f)(value));
    }

    fn set_error(self, error: E) {
        self.receiver.set_error(error);
    }

    fn set_stopped(self) {
        self.receiver.set_stopped();
    }

    fn stop_token(&self) -> StopToken {
        self.receiver.stop_token()
    }
}
