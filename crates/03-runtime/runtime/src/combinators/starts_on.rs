use std::convert::Infallible;

use super::SenderExt;
use crate::sender::{Scheduler, Sender};

/// Runs `sender` after hopping onto `scheduler`'s execution context.
pub fn starts_on<Sch, S>(scheduler: Sch, sender: S) -> impl Sender<Output = S::Output, Error = S::Error>
where
    Sch: Scheduler,
    S: Sender + Send,
    S::Error: From<Infallible>,
{
    scheduler.schedule().let_value(move |()| sender)
}
