//! Cooperative cancellation.
//!
//! A [`StopSource`] owns a shared flag and hands out [`StopToken`]s. Operations
//! check their receiver's token when they start; once submitted to the driver
//! an operation runs to completion.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Owner of a stop flag.
#[derive(Debug, Default)]
pub struct StopSource {
    flag: Arc<AtomicBool>,
}

impl StopSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn token(&self) -> StopToken {
        StopToken {
            flag: Some(self.flag.clone()),
        }
    }

    /// Requests stop. Returns true for the first request only.
    pub fn request_stop(&self) -> bool {
        !self.flag.swap(true, Ordering::AcqRel)
    }

    pub fn stop_requested(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

/// Read side of a stop flag. The default token can never be stopped.
#[derive(Clone, Debug, Default)]
pub struct StopToken {
    flag: Option<Arc<AtomicBool>>,
}

impl StopToken {
    pub fn never() -> Self {
        Self { flag: None }
    }

    pub fn stop_requested(&self) -> bool {
        self.flag
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::Acquire))
    }

    pub fn stop_possible(&self) -> bool {
        self.flag.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokens_observe_the_source() {
        let source = StopSource::new();
        let token = source.token();
        assert!(token.stop_possible());
        assert!(!token.stop_requested());
        assert!(source.request_stop());
        assert!(!source.request_stop());
        assert!(token.stop_requested());
        assert!(token.clone().stop_requested());
    }

    #[test]
    fn never_token_is_inert() {
        let token = StopToken::never();
        assert!(!token.stop_possible());
        assert!(!token.stop_requested());
    }
}
