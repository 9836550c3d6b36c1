// Execution Log
// One structured record stream per command invocation

use crate::port::{ExecutionError, LogSink};
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;
use tracing::warn;

/// Lifecycle stage carried by each record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogStatus {
    /// Command line, emitted once the process has started
    Cmd,
    /// Output line of a running process
    Run,
    /// Final record with elapsed time and error
    End,
}

fn is_zero_u32(v: &u32) -> bool {
    *v == 0
}

fn is_zero_u64(v: &u64) -> bool {
    *v == 0
}

fn is_zero_i64(v: &i64) -> bool {
    *v == 0
}

fn is_zero_f64(v: &f64) -> bool {
    *v == 0.0
}

/// Wire shape of one execution record
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ExecutionRecord {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub host: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub label: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub hash: String,
    #[serde(skip_serializing_if = "is_zero_u32")]
    pub pid: u32,
    #[serde(rename = "RID", skip_serializing_if = "is_zero_u64")]
    pub rid: u64,
    #[serde(rename = "TID", skip_serializing_if = "is_zero_u64")]
    pub tid: u64,
    /// Always present, the first record is line 0
    pub line: u64,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub output: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<LogStatus>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub error: String,
    #[serde(skip_serializing_if = "is_zero_f64")]
    pub elapse: f64,
    #[serde(skip_serializing_if = "is_zero_i64")]
    pub timestamp: i64,
}

struct LogState {
    record: ExecutionRecord,
    /// Output received before the process started
    early: Vec<u8>,
    /// Current unterminated line
    line: Vec<u8>,
    started: bool,
    finished: bool,
}

/// Per-invocation log handed to a `CommandExecutor`
///
/// Methods take `&self` so the executor can write stdout and stderr from
/// concurrent readers. A log built with [`ExecutionLog::disabled`] drops
/// everything.
pub struct ExecutionLog {
    sink: Option<Arc<dyn LogSink>>,
    created: Instant,
    state: Mutex<LogState>,
}

impl ExecutionLog {
    /// # Arguments
    /// * `sink` - destination of the serialized records
    /// * `host` - hostname stamped on every record
    /// * `rid` - route id
    /// * `tid` - per-route invocation sequence
    pub fn new(sink: Arc<dyn LogSink>, host: &str, rid: u64, tid: u64) -> Self {
        Self::build(Some(sink), host, rid, tid)
    }

    pub fn disabled() -> Self {
        Self::build(None, "", 0, 0)
    }

    /// Log writing to `sink` when present, disabled otherwise
    pub fn with_optional_sink(
        sink: Option<Arc<dyn LogSink>>,
        host: &str,
        rid: u64,
        tid: u64,
    ) -> Self {
        Self::build(sink, host, rid, tid)
    }

    fn build(sink: Option<Arc<dyn LogSink>>, host: &str, rid: u64, tid: u64) -> Self {
        let record = ExecutionRecord {
            host: host.to_string(),
            rid,
            tid,
            timestamp: chrono::Utc::now().timestamp(),
            ..Default::default()
        };
        Self {
            sink,
            created: Instant::now(),
            state: Mutex::new(LogState {
                record,
                early: Vec::new(),
                line: Vec::new(),
                started: false,
                finished: false,
            }),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.sink.is_some()
    }

    fn lock(&self) -> MutexGuard<'_, LogState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn set_label(&self, label: &str) {
        if self.is_enabled() {
            self.lock().record.label = label.to_string();
        }
    }

    pub fn set_hash(&self, hash: &str) {
        if self.is_enabled() {
            self.lock().record.hash = hash.to_string();
        }
    }

    /// Record the pid and command line, then switch to `RUN`
    pub fn start(&self, pid: u32, command_line: &str) {
        let Some(sink) = &self.sink else { return };
        let mut state = self.lock();
        if state.started || state.finished {
            return;
        }
        state.started = true;
        state.record.pid = pid;
        state.record.status = Some(LogStatus::Cmd);
        state.line.extend_from_slice(command_line.as_bytes());
        emit(sink.as_ref(), &mut state);

        state.record.status = Some(LogStatus::Run);
        let early = std::mem::take(&mut state.early);
        split_lines(sink.as_ref(), &mut state, &early);
    }

    /// Append process output; every newline emits one record
    pub fn write(&self, bytes: &[u8]) {
        let Some(sink) = &self.sink else { return };
        let mut state = self.lock();
        if state.finished {
            return;
        }
        if !state.started {
            state.early.extend_from_slice(bytes);
            return;
        }
        split_lines(sink.as_ref(), &mut state, bytes);
    }

    /// Emit the final `END` record; later calls are ignored
    pub fn done(&self, error: Option<&ExecutionError>) {
        let Some(sink) = &self.sink else { return };
        let mut state = self.lock();
        if state.finished {
            return;
        }
        state.finished = true;

        if !state.started {
            let early = std::mem::take(&mut state.early);
            split_lines(sink.as_ref(), &mut state, &early);
        }

        state.record.status = Some(LogStatus::End);
        if let Some(e) = error {
            state.record.error = e.to_string();
        }
        state.record.elapse = self.created.elapsed().as_secs_f64();
        emit(sink.as_ref(), &mut state);
    }
}

fn split_lines(sink: &dyn LogSink, state: &mut LogState, bytes: &[u8]) {
    for &b in bytes {
        if b == b'\n' {
            emit(sink, state);
        } else {
            state.line.push(b);
        }
    }
}

/// Serialize the current record with the pending line as output
fn emit(sink: &dyn LogSink, state: &mut LogState) {
    let line = std::mem::take(&mut state.line);
    state.record.output = String::from_utf8_lossy(&line).into_owned();

    match serde_json::to_vec(&state.record) {
        Ok(bytes) => sink.send(&bytes),
        Err(e) => warn!(error = %e, "Failed to serialize execution record"),
    }

    state.record.output.clear();
    state.record.line += 1;
}
