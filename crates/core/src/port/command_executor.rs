// Command Executor Port
// Filters a message, runs the route's command for it, supervises the process

use crate::application::execution_log::ExecutionLog;
use crate::domain::QueueMessage;
use async_trait::async_trait;
use thiserror::Error;

/// Execution errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExecutionError {
    /// Filter rejection: the route does not want this message
    #[error("This message is not valid for this output")]
    NotApplicable,

    #[error("Spawn failed: {0}")]
    SpawnFailed(String),

    #[error("Process timeout after {0}ms")]
    Timeout(u64),

    #[error("Process exited with status {0}")]
    NonZeroExit(i32),

    #[error("Process terminated by signal {0}")]
    Signalled(i32),

    #[error("User lookup failed: {0}")]
    UserLookup(String),

    #[error("IO error: {0}")]
    IoError(String),
}

impl ExecutionError {
    pub fn is_not_applicable(&self) -> bool {
        matches!(self, ExecutionError::NotApplicable)
    }
}

/// Command executor trait
///
/// Implementations:
/// - SubprocessExecutor: spawns the configured command (infra-system)
/// - ScriptedExecutor: canned outcomes for tests (mocks)
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    /// Evaluate the route's conditions against the message body
    ///
    /// # Errors
    /// - ExecutionError::NotApplicable if any condition does not match
    fn match_conditions(&self, msg: &QueueMessage) -> Result<(), ExecutionError>;

    /// Run the command for one message, streaming output into `log`
    ///
    /// # Errors
    /// - ExecutionError::SpawnFailed if the process cannot be started
    /// - ExecutionError::Timeout if it outlives the maximum lifetime
    /// - ExecutionError::NonZeroExit / Signalled on abnormal termination
    async fn run(&self, log: &ExecutionLog, msg: &QueueMessage) -> Result<(), ExecutionError>;

    /// Wait briefly for running processes, then kill the rest
    async fn exit(&self);
}

// ============================================================================
// Mock Implementations for Testing
// ============================================================================

pub mod mocks {
    use super::*;
    use crate::domain::{Filter, TemplateContext};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    /// Mock executor behavior
    #[derive(Debug, Clone)]
    pub enum MockBehavior {
        /// Always succeed
        Success,
        /// Always fail with message
        Fail(String),
        /// Sleep, then succeed
        Sleep(Duration),
    }

    /// Executor with canned behavior that records what it ran
    pub struct ScriptedExecutor {
        behavior: MockBehavior,
        filter: Filter,
        runs: Mutex<Vec<String>>,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        exited: AtomicBool,
    }

    impl ScriptedExecutor {
        pub fn new(behavior: MockBehavior) -> Self {
            Self {
                behavior,
                filter: Filter::default(),
                runs: Mutex::new(Vec::new()),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
                exited: AtomicBool::new(false),
            }
        }

        pub fn new_success() -> Self {
            Self::new(MockBehavior::Success)
        }

        pub fn new_fail(message: impl Into<String>) -> Self {
            Self::new(MockBehavior::Fail(message.into()))
        }

        /// Only accept messages matching `conditions`
        pub fn with_conditions(mut self, conditions: &[(&str, &str)]) -> Self {
            let owned: Vec<(String, String)> = conditions
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect();
            self.filter = Filter::compile(&owned).unwrap();
            self
        }

        /// Ids of the messages run so far, in completion order
        pub fn runs(&self) -> Vec<String> {
            self.runs.lock().unwrap().clone()
        }

        pub fn call_count(&self) -> usize {
            self.runs.lock().unwrap().len()
        }

        pub fn max_in_flight(&self) -> usize {
            self.max_in_flight.load(Ordering::SeqCst)
        }

        pub fn exited(&self) -> bool {
            self.exited.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl CommandExecutor for ScriptedExecutor {
        fn match_conditions(&self, msg: &QueueMessage) -> Result<(), ExecutionError> {
            match self.filter.first_mismatch(&TemplateContext::from_message(msg)) {
                Some(_) => Err(ExecutionError::NotApplicable),
                None => Ok(()),
            }
        }

        async fn run(&self, log: &ExecutionLog, msg: &QueueMessage) -> Result<(), ExecutionError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);

            let behavior = self.behavior.clone();
            log.start(4242, "scripted");
            let result = match behavior {
                MockBehavior::Success => {
                    log.write(b"ok\n");
                    Ok(())
                }
                MockBehavior::Fail(reason) => {
                    log.write(reason.as_bytes());
                    Err(ExecutionError::NonZeroExit(1))
                }
                MockBehavior::Sleep(d) => {
                    tokio::time::sleep(d).await;
                    Ok(())
                }
            };

            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            self.runs.lock().unwrap().push(msg.id().to_string());
            result
        }

        async fn exit(&self) {
            self.exited.store(true, Ordering::SeqCst);
        }
    }
}
