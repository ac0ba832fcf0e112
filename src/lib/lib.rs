//! Bus Pirate binary-mode ADC driver and the shunt current sampling
//! pipeline built on top of it.

pub mod port;
pub mod protocol;
pub mod ring;
pub mod sampler;
pub mod shutdown;

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Locks `mutex`, ignoring poisoning: every guarded value here stays
/// consistent across a panicking holder.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
