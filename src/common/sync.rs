use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use super::error::{Result, StoreError};

struct SemaphoreState {
    permits: usize,
    /// Bumped by `interrupt_waiters`; a waiter that sees it change gives up.
    interrupt_epoch: u64,
}

/// Counting semaphore built on a mutex and a condition variable.
///
/// Used as the admission gate of resource pools and as the in-flight write
/// limit of paged files.
pub struct Semaphore {
    state: Mutex<SemaphoreState>,
    available: Condvar,
}

impl Semaphore {
    pub fn new(permits: usize) -> Self {
        Self {
            state: Mutex::new(SemaphoreState {
                permits,
                interrupt_epoch: 0,
            }),
            available: Condvar::new(),
        }
    }

    /// Acquires one permit, waiting at most `timeout` (forever when `None`).
    /// Returns `Ok(false)` when the timeout elapsed.
    pub fn acquire(&self, timeout: Option<Duration>) -> Result<bool> {
        self.acquire_many(1, timeout)
    }

    pub fn try_acquire(&self) -> bool {
        let mut state = self.state.lock();
        if state.permits > 0 {
            state.permits -= 1;
            true
        } else {
            false
        }
    }

    /// Acquires `count` permits at once.
    pub fn acquire_many(&self, count: usize, timeout: Option<Duration>) -> Result<bool> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.state.lock();
        let epoch = state.interrupt_epoch;

        loop {
            if state.permits >= count {
                state.permits -= count;
                return Ok(true);
            }
            if state.interrupt_epoch != epoch {
                return Err(StoreError::Interrupted(
                    "waiting for a semaphore permit".to_string(),
                ));
            }
            match deadline {
                None => self.available.wait(&mut state),
                Some(deadline) => {
                    if self.available.wait_until(&mut state, deadline).timed_out() {
                        if state.permits >= count {
                            state.permits -= count;
                            return Ok(true);
                        }
                        return Ok(false);
                    }
                }
            }
        }
    }

    pub fn release(&self, count: usize) {
        let mut state = self.state.lock();
        state.permits += count;
        drop(state);
        self.available.notify_all();
    }

    pub fn available_permits(&self) -> usize {
        self.state.lock().permits
    }

    /// Takes every available permit and returns how many were taken.
    pub fn drain_permits(&self) -> usize {
        let mut state = self.state.lock();
        std::mem::take(&mut state.permits)
    }

    /// Wakes every current waiter with `StoreError::Interrupted`.
    pub fn interrupt_waiters(&self) {
        let mut state = self.state.lock();
        state.interrupt_epoch += 1;
        drop(state);
        self.available.notify_all();
    }
}
