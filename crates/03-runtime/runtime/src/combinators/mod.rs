//! Sender adaptors.

mod just;
mod let_value;
mod starts_on;
mod then;

pub use just::{just, Just, JustOperation};
pub use let_value::{LetValue, LetValueOperation};
pub use starts_on::starts_on;
pub use then::{Then, ThenReceiver};

use crate::sender::Sender;

/// Chaining methods available on every sender.
pub trait SenderExt: Sender + Sized {
    /// Maps the value with `f` on the thread that produced it.
    fn then<F, U>(self, f: F) -> Then<Self, F>
    where
        F: FnOnce(Self::Output) -> U + Send,
    {
        Then::new(self, f)
    }

    /// Continues with the sender returned by `f`. Errors of `self` convert
    /// into the continuation's error type.
    fn let_value<F, S2>(self, f: F) -> LetValue<Self, F>
    where
        F: FnOnce(Self::Output) -> S2 + Send,
        S2: Sender,
        S2::Error: From<Self::Error>,
    {
        LetValue::new(self, f)
    }
}

impl<S: Sender> SenderExt for S {}
