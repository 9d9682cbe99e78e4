//! Blocking bridge from a sender to the calling thread.
//!
//! The operation is pinned on the caller's stack, started, and the caller
//! parks on an atomic state word until a completion arrives. Never call these
//! functions on a run loop's driver thread: the completion could only be
//! delivered by the thread that is waiting for it.

use std::cell::UnsafeCell;
use std::pin::pin;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::sender::{OperationState, Receiver, Sender};
use crate::stop::StopToken;
use crate::wait::{wait_u32, wake_all};

const PENDING: u32 = 0;
const COMPLETING: u32 = 1;
const RELEASED: u32 = 2;

enum Outcome<T, E> {
    Value(T),
    Error(E),
    Stopped,
}

struct WaitState<T, E> {
    state: AtomicU32,
    outcome: UnsafeCell<Option<Outcome<T, E>>>,
}

// SAFETY: `outcome` is written once by the completing thread before `state`
// leaves PENDING, and read by the waiter only after observing RELEASED.
unsafe impl<T: Send, E: Send> Sync for WaitState<T, E> {}

struct WaitReceiver<'a, T, E> {
    shared: &'a WaitState<T, E>,
    stop: StopToken,
}

impl<T, E> WaitReceiver<'_, T, E> {
    fn complete(self, outcome: Outcome<T, E>) {
        // SAFETY: single writer; the waiter does not read until RELEASED.
        unsafe { *self.shared.outcome.get() = Some(outcome) };
        self.shared.state.store(COMPLETING, Ordering::Release);
        wake_all(&self.shared.state);
        // Last touch: after this store the waiter may free the state.
        self.shared.state.store(RELEASED, Ordering::Release);
    }
}

impl<T: Send, E: Send> Receiver<T, E> for WaitReceiver<'_, T, E> {
    fn set_value(self, value: T) {
        self.complete(Outcome::Value(value));
    }

    fn set_error(self, error: E) {
        self.complete(Outcome::Error(error));
    }

    fn set_stopped(self) {
        self.complete(Outcome::Stopped);
    }

    fn stop_token(&self) -> StopToken {
        self.stop.clone()
    }
}

/// Starts `sender` and blocks until it completes. `Ok(None)` means the
/// operation was stopped.
pub fn sync_wait<S>(sender: S) -> Result<Option<S::Output>, S::Error>
where
    S: Sender,
    S::Output: Send,
    S::Error: Send,
{
    sync_wait_with_stop(sender, StopToken::never())
}

/// Like [`sync_wait`], with `stop` as the receiver's stop token.
pub fn sync_wait_with_stop<S>(sender: S, stop: StopToken) -> Result<Option<S::Output>, S::Error>
where
    S: Sender,
    S::Output: Send,
    S::Error: Send,
{
    let shared = WaitState {
        state: AtomicU32::new(PENDING),
        outcome: UnsafeCell::new(None),
    };
    {
        let mut op = pin!(sender.connect(WaitReceiver {
            shared: &shared,
            stop,
        }));
        op.as_mut().start();

        loop {
            match shared.state.load(Ordering::Acquire) {
                RELEASED => break,
                PENDING => wait_u32(&shared.state, PENDING),
                _ => std::hint::spin_loop(),
            }
        }
    }

    match shared.outcome.into_inner() {
        Some(Outcome::Value(value)) => Ok(Some(value)),
        Some(Outcome::Error(error)) => Err(error),
        Some(Outcome::Stopped) | None => Ok(None),
    }
}
