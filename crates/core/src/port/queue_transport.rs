// Queue Transport Port
// Receive / delete / extend-visibility against one queue endpoint

use crate::domain::{AckToken, QueueMessage, SENT_TIMESTAMP_ATTRIBUTE};
use async_trait::async_trait;
use std::collections::HashMap;
use thiserror::Error;

/// Transport errors (never fatal to a poll loop)
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Receive failed on {endpoint}: {reason}")]
    Receive { endpoint: String, reason: String },

    #[error("Delete failed on {endpoint}: {reason}")]
    Delete { endpoint: String, reason: String },

    #[error("Visibility extension failed on {endpoint}: {reason}")]
    ExtendVisibility { endpoint: String, reason: String },
}

/// Parameters of one long-poll receive
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiveRequest {
    pub endpoint: String,
    pub max_messages: usize,
    pub wait_seconds: u64,
    pub attribute_names: Vec<String>,
}

/// A message as returned by the transport, before envelope unwrapping
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    pub id: String,
    pub body: Vec<u8>,
    pub ack_token: AckToken,
    pub attributes: HashMap<String, String>,
}

impl ReceivedMessage {
    /// Convert into the shared domain message (unwraps envelopes)
    pub fn into_message(self, endpoint: &str) -> QueueMessage {
        let sent_timestamp = self
            .attributes
            .get(SENT_TIMESTAMP_ATTRIBUTE)
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(0);
        QueueMessage::new(self.id, self.ack_token, self.body, sent_timestamp, endpoint)
    }
}

/// Queue transport trait
///
/// Implementations:
/// - SpoolQueue: directory-backed queue (infra-system)
/// - MemoryTransport: in-process queue for tests (mocks)
#[async_trait]
pub trait QueueTransport: Send + Sync {
    /// Long-poll for up to `max_messages` messages
    async fn receive(&self, request: &ReceiveRequest)
        -> Result<Vec<ReceivedMessage>, TransportError>;

    /// Remove a message permanently
    async fn delete(&self, endpoint: &str, token: &AckToken) -> Result<(), TransportError>;

    /// Hide a received message from other receivers for `seconds` more
    async fn extend_visibility(
        &self,
        endpoint: &str,
        token: &AckToken,
        seconds: u64,
    ) -> Result<(), TransportError>;
}

// ============================================================================
// Mock Implementations for Testing
// ============================================================================

pub mod mocks {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::sync::Notify;

    /// Shortest wait of an empty receive, keeps poll loops from spinning
    const MIN_EMPTY_WAIT: Duration = Duration::from_millis(20);

    /// In-memory transport recording deletes and visibility extensions
    #[derive(Default)]
    pub struct MemoryTransport {
        queue: Mutex<VecDeque<ReceivedMessage>>,
        deleted: Mutex<Vec<AckToken>>,
        extended: Mutex<Vec<(AckToken, u64)>>,
        failing_receives: AtomicUsize,
        receive_calls: AtomicUsize,
        arrived: Notify,
    }

    impl MemoryTransport {
        pub fn new() -> Self {
            Self::default()
        }

        /// Enqueue a message whose ack token equals its id
        pub fn push(&self, id: &str, body: &str) {
            self.push_with_timestamp(id, body, 0);
        }

        pub fn push_with_timestamp(&self, id: &str, body: &str, sent_timestamp: i64) {
            let mut attributes = HashMap::new();
            attributes.insert(
                SENT_TIMESTAMP_ATTRIBUTE.to_string(),
                sent_timestamp.to_string(),
            );
            self.queue.lock().unwrap().push_back(ReceivedMessage {
                id: id.to_string(),
                body: body.as_bytes().to_vec(),
                ack_token: AckToken::new(id),
                attributes,
            });
            self.arrived.notify_one();
        }

        /// Make the next `n` receives fail
        pub fn fail_next_receives(&self, n: usize) {
            self.failing_receives.store(n, Ordering::SeqCst);
        }

        pub fn deleted(&self) -> Vec<AckToken> {
            self.deleted.lock().unwrap().clone()
        }

        pub fn delete_count(&self, token: &str) -> usize {
            self.deleted
                .lock()
                .unwrap()
                .iter()
                .filter(|t| t.as_str() == token)
                .count()
        }

        pub fn extended(&self) -> Vec<(AckToken, u64)> {
            self.extended.lock().unwrap().clone()
        }

        pub fn receive_calls(&self) -> usize {
            self.receive_calls.load(Ordering::SeqCst)
        }

        pub fn queued(&self) -> usize {
            self.queue.lock().unwrap().len()
        }

        fn take(&self, max: usize) -> Vec<ReceivedMessage> {
            let mut queue = self.queue.lock().unwrap();
            let n = max.min(queue.len());
            queue.drain(..n).collect()
        }
    }

    #[async_trait]
    impl QueueTransport for MemoryTransport {
        async fn receive(
            &self,
            request: &ReceiveRequest,
        ) -> Result<Vec<ReceivedMessage>, TransportError> {
            self.receive_calls.fetch_add(1, Ordering::SeqCst);
            let failing = self.failing_receives.load(Ordering::SeqCst);
            if failing > 0 {
                self.failing_receives.store(failing - 1, Ordering::SeqCst);
                return Err(TransportError::Receive {
                    endpoint: request.endpoint.clone(),
                    reason: "injected failure".into(),
                });
            }

            let batch = self.take(request.max_messages);
            if !batch.is_empty() {
                return Ok(batch);
            }

            let wait = Duration::from_secs(request.wait_seconds).max(MIN_EMPTY_WAIT);
            let _ = tokio::time::timeout(wait, self.arrived.notified()).await;
            Ok(self.take(request.max_messages))
        }

        async fn delete(&self, _endpoint: &str, token: &AckToken) -> Result<(), TransportError> {
            self.deleted.lock().unwrap().push(token.clone());
            Ok(())
        }

        async fn extend_visibility(
            &self,
            _endpoint: &str,
            token: &AckToken,
            seconds: u64,
        ) -> Result<(), TransportError> {
            self.extended.lock().unwrap().push((token.clone(), seconds));
            Ok(())
        }
    }
}
