// Spool Queue - directory-backed QueueTransport
//
// Layout of the spool directory:
//   <id>.json        message body
//   <id>.json.lease  visibility lease (expiry in ms), present while in flight
//   <id>.json.tmp    partially written message, never delivered
//
// One consumer process per directory; leases are not safe across processes.

use async_trait::async_trait;
use reactor_core::domain::{AckToken, SENT_TIMESTAMP_ATTRIBUTE};
use reactor_core::port::time_provider::SystemTimeProvider;
use reactor_core::port::{QueueTransport, ReceiveRequest, ReceivedMessage, TimeProvider, TransportError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, UNIX_EPOCH};
use tokio::fs;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

/// How often an empty receive rescans the directory
const SPOOL_POLL_INTERVAL: Duration = Duration::from_millis(250);

const PAYLOAD_EXTENSION: &str = "json";
const LEASE_EXTENSION: &str = "json.lease";
const TEMP_EXTENSION: &str = "json.tmp";

#[derive(Debug, Serialize, Deserialize)]
struct Lease {
    expires_at_ms: i64,
}

/// Queue whose messages are files in one directory
pub struct SpoolQueue {
    dir: PathBuf,
    visibility_timeout: Duration,
    time_provider: Arc<dyn TimeProvider>,
}

/// Ids become file names: no separators, no hidden files
fn is_valid_id(id: &str) -> bool {
    !id.is_empty()
        && !id.starts_with('.')
        && !id.contains('/')
        && !id.contains('\\')
        && !id.contains('\0')
}

fn mtime_millis(metadata: &std::fs::Metadata) -> i64 {
    metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map_or(0, |d| d.as_millis() as i64)
}

impl SpoolQueue {
    /// # Arguments
    /// * `dir` - spool directory, created if missing
    /// * `visibility_timeout` - how long a received message stays hidden
    pub fn new(dir: impl Into<PathBuf>, visibility_timeout: Duration) -> io::Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            visibility_timeout,
            time_provider: Arc::new(SystemTimeProvider),
        })
    }

    pub fn with_time_provider(mut self, time_provider: Arc<dyn TimeProvider>) -> Self {
        self.time_provider = time_provider;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn payload_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.{PAYLOAD_EXTENSION}"))
    }

    fn lease_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.{LEASE_EXTENSION}"))
    }

    /// Write a message atomically (temp file, then rename)
    ///
    /// # Errors
    /// - `InvalidInput` for ids that are not safe file names
    pub async fn enqueue(&self, id: &str, body: &[u8]) -> io::Result<()> {
        if !is_valid_id(id) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid spool message id '{id}'"),
            ));
        }
        let temp = self.dir.join(format!("{id}.{TEMP_EXTENSION}"));
        fs::write(&temp, body).await?;
        fs::rename(&temp, self.payload_path(id)).await
    }

    /// Enqueue under a generated id that sorts after earlier pushes
    pub async fn push(&self, body: &[u8]) -> io::Result<String> {
        let id = format!(
            "{:013}-{}",
            self.time_provider.now_millis().max(0),
            Uuid::new_v4().simple()
        );
        self.enqueue(&id, body).await?;
        Ok(id)
    }

    /// Ids of all payload files, oldest name first
    async fn message_ids(&self) -> io::Result<Vec<String>> {
        let mut ids = Vec::new();
        let mut entries = fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(id) = name.strip_suffix(&format!(".{PAYLOAD_EXTENSION}")) else {
                continue;
            };
            if is_valid_id(id) {
                ids.push(id.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }

    async fn lease_expiry(&self, id: &str) -> Option<i64> {
        let raw = fs::read(self.lease_path(id)).await.ok()?;
        match serde_json::from_slice::<Lease>(&raw) {
            Ok(lease) => Some(lease.expires_at_ms),
            Err(e) => {
                warn!(id, error = %e, "Corrupt spool lease, treating as expired");
                None
            }
        }
    }

    async fn write_lease(&self, id: &str, expires_at_ms: i64) -> io::Result<()> {
        let bytes = serde_json::to_vec(&Lease { expires_at_ms })?;
        fs::write(self.lease_path(id), bytes).await
    }

    /// Lease up to `max` visible messages
    async fn lease_batch(&self, max: usize) -> io::Result<Vec<ReceivedMessage>> {
        let now = self.time_provider.now_millis();
        let expires_at = now + self.visibility_timeout.as_millis() as i64;
        let mut batch = Vec::new();

        for id in self.message_ids().await? {
            if batch.len() >= max {
                break;
            }
            match self.lease_expiry(&id).await {
                Some(expiry) if expiry > now => continue,
                Some(_) => debug!(id = %id, "Spool lease expired, redelivering"),
                None => {}
            }

            let path = self.payload_path(&id);
            let body = match fs::read(&path).await {
                Ok(body) => body,
                // Deleted between the scan and the read
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e),
            };
            let metadata = fs::metadata(&path).await?;
            self.write_lease(&id, expires_at).await?;

            let mut attributes = HashMap::new();
            attributes.insert(
                SENT_TIMESTAMP_ATTRIBUTE.to_string(),
                mtime_millis(&metadata).to_string(),
            );
            batch.push(ReceivedMessage {
                ack_token: AckToken::new(id.clone()),
                id,
                body,
                attributes,
            });
        }
        Ok(batch)
    }
}

async fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path).await {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

#[async_trait]
impl QueueTransport for SpoolQueue {
    async fn receive(
        &self,
        request: &ReceiveRequest,
    ) -> Result<Vec<ReceivedMessage>, TransportError> {
        // An empty short poll still waits one interval so callers never spin
        let wait = Duration::from_secs(request.wait_seconds).max(SPOOL_POLL_INTERVAL);
        let deadline = Instant::now() + wait;
        loop {
            let batch = self
                .lease_batch(request.max_messages)
                .await
                .map_err(|e| TransportError::Receive {
                    endpoint: request.endpoint.clone(),
                    reason: e.to_string(),
                })?;

            let now = Instant::now();
            if !batch.is_empty() || now >= deadline {
                return Ok(batch);
            }
            tokio::time::sleep(SPOOL_POLL_INTERVAL.min(deadline - now)).await;
        }
    }

    async fn delete(&self, endpoint: &str, token: &AckToken) -> Result<(), TransportError> {
        let id = token.as_str();
        let failed = |e: io::Error| TransportError::Delete {
            endpoint: endpoint.to_string(),
            reason: format!("{id}: {e}"),
        };
        remove_if_exists(&self.payload_path(id)).await.map_err(failed)?;
        remove_if_exists(&self.lease_path(id)).await.map_err(failed)?;
        Ok(())
    }

    async fn extend_visibility(
        &self,
        endpoint: &str,
        token: &AckToken,
        seconds: u64,
    ) -> Result<(), TransportError> {
        let id = token.as_str();
        let failed = |reason: String| TransportError::ExtendVisibility {
            endpoint: endpoint.to_string(),
            reason: format!("{id}: {reason}"),
        };
        if fs::metadata(self.payload_path(id)).await.is_err() {
            return Err(failed("message not found".into()));
        }
        let expires_at = self.time_provider.now_millis() + (seconds as i64) * 1000;
        self.write_lease(id, expires_at)
            .await
            .map_err(|e| failed(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reactor_core::port::time_provider::mocks::ManualTimeProvider;

    fn request(max_messages: usize) -> ReceiveRequest {
        ReceiveRequest {
            endpoint: "spool".into(),
            max_messages,
            wait_seconds: 0,
            attribute_names: vec![SENT_TIMESTAMP_ATTRIBUTE.into()],
        }
    }

    fn queue(dir: &Path, clock: Arc<ManualTimeProvider>) -> SpoolQueue {
        SpoolQueue::new(dir, Duration::from_secs(30))
            .unwrap()
            .with_time_provider(clock)
    }

    #[tokio::test]
    async fn test_receive_leases_messages() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualTimeProvider::new(1_000_000));
        let spool = queue(dir.path(), clock);
        spool.enqueue("a", br#"{"n":1}"#).await.unwrap();
        spool.enqueue("b", br#"{"n":2}"#).await.unwrap();

        let batch = spool.receive(&request(10)).await.unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].id, "a");
        assert_eq!(batch[0].body, br#"{"n":1}"#.to_vec());
        let sent: i64 = batch[0].attributes[SENT_TIMESTAMP_ATTRIBUTE].parse().unwrap();
        assert!(sent > 0);

        // Leased messages stay hidden
        assert!(spool.receive(&request(10)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_batch_size_is_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let spool = queue(dir.path(), Arc::new(ManualTimeProvider::new(0)));
        for id in ["1", "2", "3"] {
            spool.enqueue(id, b"{}").await.unwrap();
        }
        assert_eq!(spool.receive(&request(2)).await.unwrap().len(), 2);
        assert_eq!(spool.receive(&request(2)).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_expired_lease_redelivers() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualTimeProvider::new(0));
        let spool = queue(dir.path(), clock.clone());
        spool.enqueue("a", b"{}").await.unwrap();

        assert_eq!(spool.receive(&request(1)).await.unwrap().len(), 1);
        clock.advance_millis(31_000);
        assert_eq!(spool.receive(&request(1)).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_extend_visibility_keeps_message_hidden() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualTimeProvider::new(0));
        let spool = queue(dir.path(), clock.clone());
        spool.enqueue("a", b"{}").await.unwrap();
        let batch = spool.receive(&request(1)).await.unwrap();

        clock.advance_millis(20_000);
        spool
            .extend_visibility("spool", &batch[0].ack_token, 33)
            .await
            .unwrap();
        clock.advance_millis(20_000);
        assert!(spool.receive(&request(1)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let spool = queue(dir.path(), Arc::new(ManualTimeProvider::new(0)));
        spool.enqueue("a", b"{}").await.unwrap();
        let batch = spool.receive(&request(1)).await.unwrap();

        spool.delete("spool", &batch[0].ack_token).await.unwrap();
        spool.delete("spool", &batch[0].ack_token).await.unwrap();
        assert!(!dir.path().join("a.json").exists());
        assert!(!dir.path().join("a.json.lease").exists());
        assert!(spool
            .extend_visibility("spool", &batch[0].ack_token, 5)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_ignores_foreign_files() {
        let dir = tempfile::tempdir().unwrap();
        let spool = queue(dir.path(), Arc::new(ManualTimeProvider::new(0)));
        std::fs::write(dir.path().join(".hidden.json"), b"{}").unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"x").unwrap();
        std::fs::write(dir.path().join("half.json.tmp"), b"{").unwrap();

        assert!(spool.receive(&request(10)).await.unwrap().is_empty());
        assert!(spool.enqueue("../escape", b"{}").await.is_err());
    }

    #[tokio::test]
    async fn test_empty_receive_waits() {
        let dir = tempfile::tempdir().unwrap();
        let spool = queue(dir.path(), Arc::new(ManualTimeProvider::new(0)));
        let mut req = request(1);
        req.wait_seconds = 1;

        let start = std::time::Instant::now();
        assert!(spool.receive(&req).await.unwrap().is_empty());
        assert!(start.elapsed() >= Duration::from_millis(900));
    }

    #[tokio::test]
    async fn test_push_orders_by_time() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualTimeProvider::new(5_000));
        let spool = queue(dir.path(), clock.clone());

        let first = spool.push(b"{\"n\":1}").await.unwrap();
        clock.advance_millis(1);
        let second = spool.push(b"{\"n\":2}").await.unwrap();
        assert!(first < second);

        let batch = spool.receive(&request(10)).await.unwrap();
        let ids: Vec<&str> = batch.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec![first.as_str(), second.as_str()]);
    }
}
