// Pace Gate - minimum spacing between executions of one route

use super::constants::PACING_SKIP_THRESHOLD;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use tracing::trace;

/// Per-route pacing gate shared by all workers of the route
///
/// Each reservation pushes the next allowed instant to
/// `max(now, previous) + interval`. Waits at or under one second are skipped.
#[derive(Debug)]
pub struct PaceGate {
    interval: Duration,
    next_deadline: Mutex<Option<Instant>>,
}

impl PaceGate {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            next_deadline: Mutex::new(None),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn is_enabled(&self) -> bool {
        !self.interval.is_zero()
    }

    /// Advance the deadline and return how long the caller must sleep
    pub fn reserve(&self, now: Instant) -> Option<Duration> {
        if !self.is_enabled() {
            return None;
        }

        let mut next = self.next_deadline.lock().unwrap_or_else(|p| p.into_inner());
        let base = match *next {
            Some(previous) if previous > now => previous,
            _ => now,
        };
        let deadline = base + self.interval;
        *next = Some(deadline);

        let wait = deadline - now;
        (wait > PACING_SKIP_THRESHOLD).then_some(wait)
    }

    /// Sleep until this caller's slot, if the wait is long enough to honor
    pub async fn wait(&self) {
        if let Some(wait) = self.reserve(Instant::now()) {
            trace!(wait_ms = wait.as_millis() as u64, "Pacing route");
            tokio::time::sleep(wait).await;
        }
    }
}
