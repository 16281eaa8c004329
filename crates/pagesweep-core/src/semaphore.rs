//! Counting semaphore bounding in-flight HTTP connections.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

/// Connection slots shared by every page worker.
pub struct Semaphore {
    state: Mutex<usize>,
    cond: Condvar,
}

/// Releases its slot on drop, on every exit path.
pub struct SlotGuard<'a>(&'a Semaphore);

impl Semaphore {
    pub fn new(permits: usize) -> Self {
        Self {
            state: Mutex::new(permits),
            cond: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, usize> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Block until a slot is free, then take it.
    pub fn acquire(&self) -> SlotGuard<'_> {
        let mut count = self.lock();
        while *count == 0 {
            count = self.cond.wait(count).unwrap_or_else(PoisonError::into_inner);
        }
        *count -= 1;
        SlotGuard(self)
    }
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        *self.0.lock() += 1;
        self.0.cond.notify_one();
    }
}
