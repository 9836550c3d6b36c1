// Queue Message Domain Model

use serde_json::Value;

/// Name of the transport attribute carrying the send time in milliseconds
pub const SENT_TIMESTAMP_ATTRIBUTE: &str = "SentTimestamp";

/// Field holding the inner payload of a notification-service envelope
const ENVELOPE_FIELD: &str = "Message";

/// Opaque acknowledgement handle used to delete or extend a received message
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AckToken(String);

impl AckToken {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for AckToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A message received from a queue endpoint.
///
/// Built once per receive and shared read-only (behind `Arc`) with every
/// route whose conditions match it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueMessage {
    id: String,
    token: AckToken,
    body: Vec<u8>,
    sent_timestamp: i64,
    source_endpoint: String,
}

impl QueueMessage {
    /// Create a message, unwrapping a notification envelope if present
    pub fn new(
        id: impl Into<String>,
        token: AckToken,
        body: impl Into<Vec<u8>>,
        sent_timestamp: i64,
        source_endpoint: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            token,
            body: unwrap_envelope(body.into()),
            sent_timestamp,
            source_endpoint: source_endpoint.into(),
        }
    }

    /// Transport message id, used as the correlation hash in execution logs
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn token(&self) -> &AckToken {
        &self.token
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Send time in milliseconds since the epoch (0 when the transport omits it)
    pub fn sent_timestamp(&self) -> i64 {
        self.sent_timestamp
    }

    pub fn source_endpoint(&self) -> &str {
        &self.source_endpoint
    }

    /// Parse the body as JSON, `None` if it is not valid JSON
    pub fn json(&self) -> Option<Value> {
        serde_json::from_slice(&self.body).ok()
    }
}

/// Replace a notification envelope (`{"Message": ...}`) with its inner payload.
///
/// A string payload is used verbatim, anything else is re-encoded as compact
/// JSON. Bodies that are not JSON objects pass through untouched.
pub fn unwrap_envelope(body: Vec<u8>) -> Vec<u8> {
    let Ok(Value::Object(mut map)) = serde_json::from_slice::<Value>(&body) else {
        return body;
    };
    match map.remove(ENVELOPE_FIELD) {
        Some(Value::String(inner)) => inner.into_bytes(),
        Some(other) => other.to_string().into_bytes(),
        None => body,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(body: &str) -> QueueMessage {
        QueueMessage::new("id-1", AckToken::new("tok"), body, 0, "queue")
    }

    #[test]
    fn test_plain_body_is_kept() {
        let msg = message(r#"{"lang":"go"}"#);
        assert_eq!(msg.body(), br#"{"lang":"go"}"#);
    }

    #[test]
    fn test_envelope_string_is_unwrapped() {
        let msg = message(r#"{"Type":"Notification","Message":"{\"lang\":\"python3\"}"}"#);
        assert_eq!(msg.body(), br#"{"lang":"python3"}"#);
        assert_eq!(msg.json().unwrap()["lang"], "python3");
    }

    #[test]
    fn test_envelope_object_is_reencoded() {
        let msg = message(r#"{"Message":{"lang":"rust"}}"#);
        assert_eq!(msg.body(), br#"{"lang":"rust"}"#);
    }

    #[test]
    fn test_non_json_body_passes_through() {
        let msg = message("just text");
        assert_eq!(msg.body(), b"just text");
        assert!(msg.json().is_none());
    }
}
