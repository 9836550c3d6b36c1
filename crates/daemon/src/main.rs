//! Queue Reactor - Main Entry Point
//! Polls queues, matches messages against routes and runs their commands

use anyhow::{bail, Result};
use clap::{Parser, ValueEnum};
use reactor_core::application::constants::LISTENER_SHUTDOWN_CEILING;
use reactor_daemon::{Config, Supervisor};
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const VERSION: &str = env!("CARGO_PKG_VERSION");
const DEFAULT_FILTER: &str =
    "queue_reactor=info,reactor_core=info,reactor_infra_system=info,reactor_daemon=info";
const DEBUG_FILTER: &str =
    "queue_reactor=debug,reactor_core=debug,reactor_infra_system=debug,reactor_daemon=debug";

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Pretty,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "queue-reactor", version, about = "Run shell commands for queue messages")]
struct Cli {
    /// Configuration file
    #[arg(short, long, default_value = "config.conf")]
    config: PathBuf,

    /// Configuration directory; every *.conf file in it is merged
    #[arg(short, long)]
    dir: Option<PathBuf>,

    /// Verbose diagnostics
    #[arg(long)]
    debug: bool,

    #[arg(long, value_enum, env = "REACTOR_LOG_FORMAT", default_value = "pretty")]
    log_format: LogFormat,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // 1. Diagnostics go to stderr; stdout belongs to execution records
    let default_filter = if cli.debug { DEBUG_FILTER } else { DEFAULT_FILTER };
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_filter))?;
    let (writer, _guard) = tracing_appender::non_blocking(std::io::stderr());

    match cli.log_format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().json().with_writer(writer))
            .init(),
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_ansi(false).with_writer(writer))
            .init(),
    }

    info!("Queue Reactor v{} starting...", VERSION);

    // 2. Load configuration
    let config = Config::load(&cli.config, cli.dir.as_deref())?;
    if config.rejected > 0 {
        warn!(rejected = config.rejected, "Some routes were rejected");
    }

    // 3. Build routes
    let hostname = sysinfo::System::host_name().unwrap_or_else(|| "unknown".to_string());
    let supervisor = Supervisor::build(&config, &hostname)?;
    if supervisor.route_count() == 0 {
        bail!("no usable routes configured");
    }

    // 4. Run until signalled
    supervisor.start();
    info!(host = %hostname, "System ready. Waiting for messages...");
    wait_for_signal().await?;

    // 5. Graceful shutdown
    info!("Shutdown signal received. Draining...");
    let pending = supervisor.shutdown(LISTENER_SHUTDOWN_CEILING).await;
    info!(pending, "Shutdown complete.");
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result?,
        _ = terminate.recv() => {}
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_signal() -> Result<()> {
    tokio::signal::ctrl_c().await?;
    Ok(())
}
