//! Mutex helpers so one poisoned lock or a re-entrant hook call never wedges the host.

use std::sync::{Mutex, MutexGuard, TryLockError};

pub(crate) fn lock_or_recover<'a, T>(lock: &'a Mutex<T>, context: &str) -> MutexGuard<'a, T> {
    match lock.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::debug!("mutex poisoned in {context}; recovering");
            poisoned.into_inner()
        }
    }
}

/// Non-blocking variant: `None` when the lock is already held (re-entrant call
/// on the console thread), recovering poisoned locks like [`lock_or_recover`].
pub(crate) fn try_lock_or_recover<'a, T>(
    lock: &'a Mutex<T>,
    context: &str,
) -> Option<MutexGuard<'a, T>> {
    match lock.try_lock() {
        Ok(guard) => Some(guard),
        Err(TryLockError::Poisoned(poisoned)) => {
            tracing::debug!("mutex poisoned in {context}; recovering");
            Some(poisoned.into_inner())
        }
        Err(TryLockError::WouldBlock) => None,
    }
}
