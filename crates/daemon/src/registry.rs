// Adapter Registry
// Maps the closed set of configured plugin kinds onto concrete adapters

use crate::config::{InputKind, LogStreamConfig, OutputKind, RouteConfig, DEFAULT_FILE_PREFIX};
use anyhow::{Context, Result};
use reactor_core::port::{CommandExecutor, LogSink, QueueTransport};
use reactor_core::AppError;
use reactor_infra_system::{FileSink, SpoolQueue, StdoutSink};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

/// Build the execution record sink; `None` disables records
pub fn build_sink(config: Option<&LogStreamConfig>) -> Result<Option<Arc<dyn LogSink>>> {
    let sink: Option<Arc<dyn LogSink>> = match config {
        None | Some(LogStreamConfig::None) => {
            info!("Execution records disabled");
            None
        }
        Some(LogStreamConfig::Stdout) => Some(Arc::new(StdoutSink::new())),
        Some(LogStreamConfig::File {
            path,
            prefix,
            rotation,
        }) => {
            let dir = PathBuf::from(shellexpand::tilde(path).into_owned());
            let prefix = prefix.as_deref().unwrap_or(DEFAULT_FILE_PREFIX);
            let sink = FileSink::new(&dir, prefix, *rotation)
                .with_context(|| format!("failed to open log stream in {}", dir.display()))?;
            info!(dir = %dir.display(), prefix, "Execution records go to file");
            Some(Arc::new(sink))
        }
    };
    Ok(sink)
}

/// Build the transport a route's listener will poll
pub fn build_transport(route: &RouteConfig) -> reactor_core::Result<Arc<dyn QueueTransport>> {
    match route.input {
        InputKind::Spool => {
            let visibility = route
                .visibility_timeout()
                .map_err(|e| AppError::Config(format!("{e:#}")))?;
            let spool = SpoolQueue::new(route.endpoint(), visibility).map_err(|e| {
                AppError::Config(format!("cannot open spool {}: {e}", route.endpoint()))
            })?;
            Ok(Arc::new(spool))
        }
    }
}

/// Build the executor of a route
pub fn build_executor(route: &RouteConfig) -> Result<Arc<dyn CommandExecutor>> {
    match route.output {
        OutputKind::Cmd => {
            let spec = route.command_spec()?;
            let executor = reactor_infra_system::SubprocessExecutor::new(&spec)?;
            Ok(Arc::new(executor))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use reactor_infra_system::FileRotation;

    fn route(url: &str, extra: &str) -> RouteConfig {
        let toml = format!(
            "[[reactor]]\ninput = \"spool\"\nurl = \"{url}\"\noutput = \"cmd\"\ncmd = \"/bin/true\"\n{extra}"
        );
        Config::parse(&toml, "test").unwrap().routes.remove(0)
    }

    #[test]
    fn test_sink_kinds() {
        assert!(build_sink(None).unwrap().is_none());
        assert!(build_sink(Some(&LogStreamConfig::None)).unwrap().is_none());
        assert!(build_sink(Some(&LogStreamConfig::Stdout)).unwrap().is_some());

        let dir = tempfile::tempdir().unwrap();
        let file = LogStreamConfig::File {
            path: dir.path().display().to_string(),
            prefix: Some("records".into()),
            rotation: FileRotation::Never,
        };
        let sink = build_sink(Some(&file)).unwrap().unwrap();
        sink.send(b"{}");
        sink.exit();
        assert!(dir.path().join("records").exists());
    }

    #[test]
    fn test_spool_transport_creates_directory() {
        let dir = tempfile::tempdir().unwrap();
        let queue = dir.path().join("jobs");
        build_transport(&route(&queue.display().to_string(), "")).unwrap();
        assert!(queue.is_dir());
    }

    #[test]
    fn test_bad_visibility_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let r = route(&dir.path().display().to_string(), "visibility_timeout = \"0s\"\n");
        let err = build_transport(&r).err().unwrap();
        assert!(err.is_config());
    }

    #[test]
    fn test_executor_validation() {
        assert!(build_executor(&route("/tmp/q", "")).is_ok());
        assert!(build_executor(&route("/tmp/q", "env = [\"BROKEN\"]\n")).is_err());
    }
}
