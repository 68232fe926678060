//! Poison-aware lock helpers.
//!
//! Registries are shared between scheduler workers behind `std::sync` locks and
//! are never held across an `.await`. A poisoned lock means a handler panicked
//! mid-update; callers receive an error instead of propagating the panic.

use crate::error::{constants, ProtocolError, Result};
use std::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

#[inline]
pub fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>> {
    mutex
        .lock()
        .map_err(|_| ProtocolError::Custom(constants::ERR_LOCK_POISONED.into()))
}

#[inline]
pub fn read<T>(lock: &RwLock<T>) -> Result<RwLockReadGuard<'_, T>> {
    lock.read()
        .map_err(|_| ProtocolError::Custom(constants::ERR_LOCK_POISONED.into()))
}

#[inline]
pub fn write<T>(lock: &RwLock<T>) -> Result<RwLockWriteGuard<'_, T>> {
    lock.write()
        .map_err(|_| ProtocolError::Custom(constants::ERR_LOCK_POISONED.into()))
}
