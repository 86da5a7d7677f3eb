//! Session state, completion signals and progress reporting.
//!
//! - [`DndState`]: negotiated parameters, callback registry, guest-response wait
//! - [`CallbackEvent`]: one-shot signal from a dispatch callback to a worker
//! - [`Progress`]: per-operation progress handed to API callers

mod event;
mod progress;
mod state;

use std::sync::{Mutex, MutexGuard, PoisonError};

pub use event::{wait_for_event, CallbackEvent};
pub use progress::{Progress, ProgressOutcome, ProgressSnapshot};
pub use state::{CallbackRegistration, DispatchCallback, DndState, SessionState};

/// Lock a mutex, recovering the data if a holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
