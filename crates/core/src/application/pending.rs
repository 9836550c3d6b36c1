// Pending Tracker - decides when a received message may be deleted

use super::constants::KEEP_ALIVE_EXTENSION_PERCENT;
use crate::domain::AckToken;
use crate::port::{QueueTransport, TransportError};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, error, warn};

#[derive(Debug, Default)]
struct PendingEntry {
    refcount: usize,
    failed: bool,
}

/// What a `done` call did to its entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DoneOutcome {
    /// Other routes still hold the message
    Pending(usize),
    /// Last reference released without failures; delete was scheduled
    Deleted,
    /// Last reference released after a failure; left for redelivery
    Retained,
    /// Token not tracked (already finished or never added)
    Unknown,
}

/// Reference-counted table of in-flight messages for one listener.
///
/// Every matching route holds one reference. The message is deleted from the
/// queue when the last reference is released, unless any route failed.
pub struct PendingTracker {
    endpoint: String,
    transport: Arc<dyn QueueTransport>,
    entries: Mutex<HashMap<AckToken, PendingEntry>>,
}

impl PendingTracker {
    pub fn new(endpoint: impl Into<String>, transport: Arc<dyn QueueTransport>) -> Self {
        Self {
            endpoint: endpoint.into(),
            transport,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<AckToken, PendingEntry>> {
        self.entries.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Take one reference on `token`
    pub fn add(&self, token: &AckToken) {
        self.add_many(token, 1);
    }

    /// Take `count` references at once (one per matching route)
    pub fn add_many(&self, token: &AckToken, count: usize) {
        if count == 0 {
            return;
        }
        self.lock().entry(token.clone()).or_default().refcount += count;
    }

    /// Release one reference and delete the message if it was the last one
    ///
    /// The delete call runs on its own task so the caller never waits on the
    /// network and the lock is never held across it.
    pub fn done(&self, token: &AckToken, ok: bool) -> DoneOutcome {
        let outcome = {
            let mut entries = self.lock();
            let Some(entry) = entries.get_mut(token) else {
                return DoneOutcome::Unknown;
            };
            entry.refcount = entry.refcount.saturating_sub(1);
            if !ok {
                entry.failed = true;
            }
            if entry.refcount > 0 {
                DoneOutcome::Pending(entry.refcount)
            } else {
                let failed = entry.failed;
                entries.remove(token);
                if failed {
                    DoneOutcome::Retained
                } else {
                    DoneOutcome::Deleted
                }
            }
        };

        match outcome {
            DoneOutcome::Deleted => self.spawn_delete(token.clone()),
            DoneOutcome::Retained => {
                debug!(endpoint = %self.endpoint, token = %token, "Message left for redelivery")
            }
            _ => {}
        }
        outcome
    }

    /// Number of messages with at least one outstanding reference
    pub fn pending_count(&self) -> usize {
        self.lock().len()
    }

    /// References held on `token` (0 when untracked)
    pub fn refcount(&self, token: &AckToken) -> usize {
        self.lock().get(token).map_or(0, |e| e.refcount)
    }

    /// Delete a message now, logging failures
    pub async fn delete(&self, token: &AckToken) {
        delete_logged(self.transport.as_ref(), &self.endpoint, token).await;
    }

    fn spawn_delete(&self, token: AckToken) {
        let transport = Arc::clone(&self.transport);
        let endpoint = self.endpoint.clone();
        tokio::spawn(async move {
            delete_logged(transport.as_ref(), &endpoint, &token).await;
        });
    }

    /// Extend visibility by 10% of `visibility`, rounded up to whole seconds
    pub async fn keep_alive(
        &self,
        token: &AckToken,
        visibility: Duration,
    ) -> Result<(), TransportError> {
        let seconds = extended_visibility_secs(visibility);
        self.transport
            .extend_visibility(&self.endpoint, token, seconds)
            .await
            .inspect_err(|e| warn!(endpoint = %self.endpoint, error = %e, "Keep-alive failed"))
    }
}

async fn delete_logged(transport: &dyn QueueTransport, endpoint: &str, token: &AckToken) {
    match transport.delete(endpoint, token).await {
        Ok(()) => debug!(endpoint = %endpoint, token = %token, "Message deleted"),
        Err(e) => error!(endpoint = %endpoint, error = %e, "Message delete failed"),
    }
}

/// `ceil(visibility * 1.1)` in seconds
pub fn extended_visibility_secs(visibility: Duration) -> u64 {
    let tenths_of_ms = visibility.as_millis() * (100 + KEEP_ALIVE_EXTENSION_PERCENT);
    let per_second = 1000 * 100;
    tenths_of_ms.div_ceil(per_second) as u64
}
