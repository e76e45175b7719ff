pub mod http;
pub mod http_date;

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock, ignoring poisoning. A panicking task must not wedge the whole reactor.
#[inline(always)]
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
