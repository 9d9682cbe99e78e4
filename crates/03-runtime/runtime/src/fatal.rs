//! Process-wide policy for unrecoverable errors.
//!
//! Code that cannot return an error (destructors, completion callbacks)
//! reports through [`report`]. The error is logged and handed to the installed
//! hook; without a hook the process aborts. A hook that returns lets `report`
//! return, which tests rely on.

use std::error::Error;

use parking_lot::RwLock;

type FatalHook = Box<dyn Fn(&str, &(dyn Error + 'static)) + Send + Sync>;

static HOOK: RwLock<Option<FatalHook>> = parking_lot::const_rwlock(None);

/// Installs `hook`, replacing any previous one.
pub fn set_hook<H>(hook: H)
where
    H: Fn(&str, &(dyn Error + 'static)) + Send + Sync + 'static,
{
    *HOOK.write() = Some(Box::new(hook));
}

/// Restores the default abort behaviour.
pub fn clear_hook() {
    *HOOK.write() = None;
}

/// Reports an unrecoverable error raised while doing `context`.
pub fn report(context: &str, err: &(dyn Error + 'static)) {
    tracing::error!(context, error = %err, "fatal offload error");
    match HOOK.read().as_ref() {
        Some(hook) => hook(context, err),
        None => std::process::abort(),
    }
}
