//! Snapshot cell shared between the refresher and request paths

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

/// Holds the latest value of `T`.
///
/// Readers get an immutable snapshot; writers replace the whole value. The
/// lock is only held to clone or swap the `Arc`, never across I/O.
pub struct SharedCell<T> {
    inner: Mutex<Arc<T>>,
}

impl<T> SharedCell<T> {
    pub fn new(value: T) -> Self {
        Self {
            inner: Mutex::new(Arc::new(value)),
        }
    }

    pub fn load(&self) -> Arc<T> {
        self.lock().clone()
    }

    pub fn store(&self, value: T) {
        *self.lock() = Arc::new(value);
    }

    /// Replace the value with one derived from the current snapshot
    pub fn update(&self, f: impl FnOnce(&T) -> T) {
        let mut guard = self.lock();
        let next = f(&guard);
        *guard = Arc::new(next);
    }

    /// Store `value` and return the previous snapshot
    pub fn replace(&self, value: T) -> Arc<T> {
        std::mem::replace(&mut *self.lock(), Arc::new(value))
    }

    fn lock(&self) -> MutexGuard<'_, Arc<T>> {
        // a panicking writer can only have left a whole value behind
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl<T: Default> Default for SharedCell<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: fmt::Debug> fmt::Debug for SharedCell<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("SharedCell").field(&self.load()).finish()
    }
}
