// Concurrency Limiter - semaphore with a capacity that can change at runtime

use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Notify;

#[derive(Debug, Default)]
struct LimiterState {
    capacity: usize,
    in_use: usize,
}

/// Bounds outstanding non-blocking deliveries of one listener.
///
/// Capacity follows the sum of the bound routes' concurrency. Shrinking it
/// never revokes permits already held; new acquisitions wait until usage
/// drops below the new capacity.
#[derive(Debug, Default)]
pub struct ConcurrencyLimiter {
    state: Mutex<LimiterState>,
    changed: Notify,
}

/// Permit returned by [`ConcurrencyLimiter::acquire`], released on drop
#[derive(Debug)]
pub struct LimiterPermit {
    limiter: Arc<ConcurrencyLimiter>,
}

impl ConcurrencyLimiter {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(LimiterState {
                capacity,
                in_use: 0,
            }),
            changed: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, LimiterState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn capacity(&self) -> usize {
        self.lock().capacity
    }

    pub fn in_use(&self) -> usize {
        self.lock().in_use
    }

    /// Replace the capacity and wake waiters that may now fit
    pub fn set_capacity(&self, capacity: usize) {
        self.lock().capacity = capacity;
        self.changed.notify_waiters();
    }

    pub fn try_acquire(self: &Arc<Self>) -> Option<LimiterPermit> {
        let mut state = self.lock();
        if state.in_use >= state.capacity {
            return None;
        }
        state.in_use += 1;
        Some(LimiterPermit {
            limiter: Arc::clone(self),
        })
    }

    /// Wait until a permit is available
    pub async fn acquire(self: &Arc<Self>) -> LimiterPermit {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            // Register before checking so a release in between is not missed
            notified.as_mut().enable();
            if let Some(permit) = self.try_acquire() {
                return permit;
            }
            notified.await;
        }
    }

    fn release(&self) {
        {
            let mut state = self.lock();
            state.in_use = state.in_use.saturating_sub(1);
        }
        self.changed.notify_waiters();
    }
}

impl Drop for LimiterPermit {
    fn drop(&mut self) {
        self.limiter.release();
    }
}
