use std::marker::{PhantomData, PhantomPinned};
use std::pin::Pin;

use crate::sender::{OperationState, Receiver, Sender};
use crate::stop::StopToken;

/// Sender returned by [`SenderExt::let_value`](super::SenderExt::let_value).
pub struct LetValue<S, F> {
    sender: S,
    f: F,
}

impl<S, F> LetValue<S, F> {
    pub(crate) fn new(sender: S, f: F) -> Self {
        Self { sender, f }
    }
}

impl<S, F, S2> Sender for LetValue<S, F>
where
    S: Sender,
    F: FnOnce(S::Output) -> S2 + Send,
    S2: Sender,
    S2::Error: From<S::Error>,
{
    type Output = S2::Output;
    type Error = S2::Error;
    type Operation<R: Receiver<S2::Output, S2::Error>> = LetValueOperation<S, F, S2, R>;

    fn connect<R: Receiver<S2::Output, S2::Error>>(self, receiver: R) -> Self::Operation<R> {
        LetValueOperation {
            sender: Some(self.sender),
            f: Some(self.f),
            receiver: Some(receiver),
            first: None,
            second: None,
            _pin: PhantomPinned,
        }
    }
}

/// Holds both stages in place. The first stage is connected when the
/// operation starts, because its receiver points back at this record; the
/// second stage is emplaced when the first one produces its value.
pub struct LetValueOperation<S, F, S2, R>
where
    S: Sender,
    F: FnOnce(S::Output) -> S2 + Send,
    S2: Sender,
    S2::Error: From<S::Error>,
    R: Receiver<S2::Output, S2::Error>,
{
    sender: Option<S>,
    f: Option<F>,
    receiver: Option<R>,
    first: Option<S::Operation<LetValueReceiver<S, F, S2, R>>>,
    second: Option<S2::Operation<R>>,
    _pin: PhantomPinned,
}

impl<S, F, S2, R> OperationState for LetValueOperation<S, F, S2, R>
where
    S: Sender,
    F: FnOnce(S::Output) -> S2 + Send,
    S2: Sender,
    S2::Error: From<S::Error>,
    R: Receiver<S2::Output, S2::Error>,
{
    fn start(self: Pin<&mut Self>) {
        // SAFETY: the record is never moved out of. From here on it is only
        // reached through `op`, field by field, because the first stage may
        // complete inline while it is still being started.
        let op: *mut Self = unsafe { self.get_unchecked_mut() };
        let Some(sender) = (unsafe { (*op).sender.take() }) else {
            return;
        };
        let receiver = LetValueReceiver {
            op: op.cast(),
            _marker: PhantomData,
        };
        // SAFETY: `first` lives in the pinned record until it is dropped.
        unsafe {
            let first = (*op).first.insert(sender.connect(receiver));
            Pin::new_unchecked(first).start();
        }
    }
}

pub struct LetValueReceiver<S, F, S2, R> {
    op: *mut (),
    _marker: PhantomData<fn() -> (S, F, S2, R)>,
}

// SAFETY: the receiver only addresses its pinned parent record, which is
// completed from one thread at a time.
unsafe impl<S, F, S2, R> Send for LetValueReceiver<S, F, S2, R> {}

impl<S, F, S2, R> LetValueReceiver<S, F, S2, R>
where
    S: Sender,
    F: FnOnce(S::Output) -> S2 + Send,
    S2: Sender,
    S2::Error: From<S::Error>,
    R: Receiver<S2::Output, S2::Error>,
{
    fn op(&self) -> *mut LetValueOperation<S, F, S2, R> {
        self.op.cast()
    }
}

// Every method below runs while the first stage still lives in the parent
// record, so the parent is alive and only its other fields are touched.
impl<S, F, S2, R> Receiver<S::Output, S::Error> for LetValueReceiver<S, F, S2, R>
where
    S: Sender,
    F: FnOnce(S::Output) -> S2 + Send,
    S2: Sender,
    S2::Error: From<S::Error>,
    R: Receiver<S2::Output, S2::Error>,
{
    fn set_value(self, value: S::Output) {
        let op = self.op();
        // SAFETY: see above.
        unsafe {
            let (Some(f), Some(receiver)) = ((*op).f.take(), (*op).receiver.take()) else {
                return;
            };
            let second = (*op).second.insert(f(value).connect(receiver));
            Pin::new_unchecked(second).start();
        }
    }

    fn set_error(self, error: S::Error) {
        // SAFETY: see above.
        if let Some(receiver) = unsafe { (*self.op()).receiver.take() } {
            receiver.set_error(error.into());
        }
    }

    fn set_stopped(self) {
        // SAFETY: see above.
        if let Some(receiver) = unsafe { (*self.op()).receiver.take() } {
            receiver.set_stopped();
        }
    }

    fn stop_token(&self) -> StopToken {
        // SAFETY: see above.
        unsafe { (*self.op()).receiver.as_ref() }
            .map(|receiver| receiver.stop_token())
            .unwrap_or_default()
    }
}
