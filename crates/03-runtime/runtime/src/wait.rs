//! Atomic wait/notify shims used by [`crate::sync_wait`].
//!
//! Native targets park on the `atomic-wait` crate (futex-backed where
//! available). Targets without it fall back to yielding.

use std::sync::atomic::AtomicU32;

#[cfg(not(target_arch = "wasm32"))]
mod imp {
    use super::AtomicU32;

    #[inline]
    pub(crate) fn wait_u32(atomic: &AtomicU32, expected: u32) {
        atomic_wait::wait(atomic, expected);
    }

    #[inline]
    pub(crate) fn wake_all(atomic: &AtomicU32) {
        atomic_wait::wake_all(atomic as *const AtomicU32);
    }
}

#[cfg(target_arch = "wasm32")]
mod imp {
    use super::AtomicU32;
    use std::sync::atomic::Ordering;

    #[inline]
    pub(crate) fn wait_u32(atomic: &AtomicU32, expected: u32) {
        while atomic.load(Ordering::Acquire) == expected {
            std::hint::spin_loop();
        }
    }

    #[inline]
    pub(crate) fn wake_all(_atomic: &AtomicU32) {}
}

/// Blocks while `atomic` holds `expected`. May return spuriously.
#[inline]
pub(crate) fn wait_u32(atomic: &AtomicU32, expected: u32) {
    imp::wait_u32(atomic, expected)
}

/// Wakes every thread parked on `atomic`.
#[inline]
pub(crate) fn wake_all(atomic: &AtomicU32) {
    imp::wake_all(atomic)
}
