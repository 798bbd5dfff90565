//! Scriptable in-memory sandbox runtime for tests.
//!
//! The filesystem is a flat path map with real parent-directory rules, and
//! processes replay a [`ProcessScript`] of output chunks, delays and an exit
//! code. Every interaction is recorded so tests can assert on it.

mod runtime;
mod sandbox;
mod script;

pub use runtime::MockRuntime;
pub use self::sandbox::{KILLED_EXIT_CODE, MockSandbox};
pub use script::ProcessScript;

use std::sync::{Mutex, MutexGuard, PoisonError};

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
