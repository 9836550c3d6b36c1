// Log Sink Port
// Destination of execution records (one JSON document per call)

/// Execution record sink
///
/// Implementations:
/// - StdoutSink / FileSink (infra-system)
/// - RecordingSink (mocks)
///
/// `send` must not block for long: it is called from route workers while a
/// command is running. `exit` flushes and closes, and must be idempotent.
pub trait LogSink: Send + Sync {
    fn send(&self, record: &[u8]);

    fn exit(&self);
}

// ============================================================================
// Mock Implementations for Testing
// ============================================================================

pub mod mocks {
    use super::*;
    use std::sync::Mutex;

    /// Sink keeping every record in memory
    #[derive(Default)]
    pub struct RecordingSink {
        records: Mutex<Vec<Vec<u8>>>,
    }

    impl RecordingSink {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn records(&self) -> Vec<serde_json::Value> {
            self.records
                .lock()
                .unwrap()
                .iter()
                .map(|r| serde_json::from_slice(r).unwrap())
                .collect()
        }
    }

    impl LogSink for RecordingSink {
        fn send(&self, record: &[u8]) {
            self.records.lock().unwrap().push(record.to_vec());
        }

        fn exit(&self) {}
    }
}
