// Log Sinks - destinations for execution records
// One JSON document per line

use reactor_core::port::LogSink;
use serde::Deserialize;
use std::io::{self, Write};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, warn};
use tracing_appender::rolling::{RollingFileAppender, Rotation};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|p| p.into_inner())
}

fn write_record(out: &mut impl Write, record: &[u8]) -> io::Result<()> {
    out.write_all(record)?;
    out.write_all(b"\n")
}

/// Writes records to standard output
#[derive(Default)]
pub struct StdoutSink {
    // Serializes records so lines from concurrent routes never interleave
    guard: Mutex<()>,
}

impl StdoutSink {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LogSink for StdoutSink {
    fn send(&self, record: &[u8]) {
        let _guard = lock(&self.guard);
        if let Err(e) = write_record(&mut io::stdout().lock(), record) {
            warn!(error = %e, "Failed to write execution record to stdout");
        }
    }

    fn exit(&self) {
        let _guard = lock(&self.guard);
        if let Err(e) = io::stdout().flush() {
            warn!(error = %e, "Failed to flush stdout");
        }
    }
}

/// Rotation period of a [`FileSink`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileRotation {
    #[default]
    Never,
    Hourly,
    Daily,
}

impl From<FileRotation> for Rotation {
    fn from(rotation: FileRotation) -> Self {
        match rotation {
            FileRotation::Never => Rotation::NEVER,
            FileRotation::Hourly => Rotation::HOURLY,
            FileRotation::Daily => Rotation::DAILY,
        }
    }
}

/// Appends records to a (possibly rotating) file
pub struct FileSink {
    writer: Mutex<Option<RollingFileAppender>>,
}

impl FileSink {
    /// Open `<dir>/<prefix>` (plus a date suffix when rotating)
    ///
    /// # Errors
    /// - `io::Error` if the directory or file cannot be created
    pub fn new(dir: &Path, prefix: &str, rotation: FileRotation) -> io::Result<Self> {
        std::fs::create_dir_all(dir)?;
        let appender = RollingFileAppender::builder()
            .rotation(rotation.into())
            .filename_prefix(prefix)
            .build(dir)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
        debug!(dir = %dir.display(), prefix, ?rotation, "File sink opened");
        Ok(Self {
            writer: Mutex::new(Some(appender)),
        })
    }
}

impl LogSink for FileSink {
    fn send(&self, record: &[u8]) {
        let mut writer = lock(&self.writer);
        match writer.as_mut() {
            Some(out) => {
                if let Err(e) = write_record(out, record) {
                    warn!(error = %e, "Failed to write execution record to file");
                }
            }
            None => debug!("Execution record dropped, file sink closed"),
        }
    }

    fn exit(&self) {
        if let Some(mut out) = lock(&self.writer).take() {
            if let Err(e) = out.flush() {
                warn!(error = %e, "Failed to flush file sink");
            }
        }
    }
}
