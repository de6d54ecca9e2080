//! Console interception for `cmd.exe`: redirects the host's console read, write
//! and environment entry points so command lines are read through a line
//! editor instead of the host's built-in one.
//!
//! The pieces fit together as follows:
//!
//! - [`hook`] applies call redirections as one transactional set, including the
//!   one-shot bootstrap trap used to delay part of the installation.
//! - [`prompt`] tags the `prompt` variable and picks the tagged prompt out of
//!   the host's console writes.
//! - [`auto_answer`] answers the "Terminate batch job" confirmation.
//! - [`bridge`] is the state machine behind the intercepted calls.
//! - [`session`] owns the process-wide state and the `extern "system"` thunks.

pub mod auto_answer;
pub mod bounded_text;
pub mod bridge;
pub mod collaborators;
pub mod config;
pub mod console;
pub mod doctor;
pub mod hook;
pub mod host;
mod lock;
pub mod prompt;
pub mod session;
pub mod telemetry;

pub(crate) use lock::{lock_or_recover, try_lock_or_recover};

/// Serializes tests that touch process-wide state (session registry, trap).
#[cfg(test)]
pub(crate) fn test_lock() -> std::sync::MutexGuard<'static, ()> {
    use std::sync::{Mutex, OnceLock};

    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    lock_or_recover(LOCK.get_or_init(|| Mutex::new(())), "test lock")
}
