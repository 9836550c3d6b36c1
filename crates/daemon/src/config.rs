// Configuration
// TOML files with an optional `[log_stream]` table and `[[reactor]]` routes

use anyhow::{bail, Context, Result};
use reactor_core::application::constants::{
    DEFAULT_MAX_CMD_LIFETIME, DEFAULT_MAX_MESSAGES, DEFAULT_WAIT_SECONDS, TRANSPORT_ERROR_BACKOFF,
};
use reactor_core::application::{DeliveryMode, ListenerSettings};
use reactor_core::domain::{parse_duration, CommandSpec, RouteSettings};
use reactor_infra_system::FileRotation;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{error, info, warn};

/// Extension of the files merged from a config directory
pub const CONFIG_EXTENSION: &str = "conf";

/// Visibility lease of spool messages when `visibility_timeout` is unset
pub const DEFAULT_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(30);

/// File name prefix of a file log stream without `prefix`
pub const DEFAULT_FILE_PREFIX: &str = "reactor.log";

/// Queue transports a route can read from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputKind {
    Spool,
}

/// Actions a route can run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputKind {
    Cmd,
}

/// Destination of execution records
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum LogStreamConfig {
    Stdout,
    File {
        path: String,
        #[serde(default)]
        prefix: Option<String>,
        #[serde(default)]
        rotation: FileRotation,
    },
    None,
}

fn default_concurrent() -> usize {
    1
}

/// One `[[reactor]]` entry
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RouteConfig {
    pub input: InputKind,
    #[serde(alias = "URL")]
    pub url: String,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub profile: Option<String>,
    #[serde(default, alias = "maxNumberOfMessages")]
    pub max_messages: Option<usize>,
    #[serde(default, alias = "waitTimeSeconds")]
    pub wait_seconds: Option<u64>,
    #[serde(default, alias = "visibilityTimeout")]
    pub visibility_timeout: Option<String>,
    #[serde(default, alias = "noBlocking")]
    pub no_blocking: bool,

    pub output: OutputKind,
    #[serde(default = "default_concurrent")]
    pub concurrent: usize,
    #[serde(default)]
    pub delay: Option<String>,
    #[serde(default)]
    pub label: String,

    pub cmd: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Each entry is a table of `"$.path" = "regex"`; all must match
    #[serde(default)]
    pub cond: Vec<BTreeMap<String, String>>,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default, alias = "workingDirectory")]
    pub working_directory: Option<String>,
    #[serde(default)]
    pub env: Vec<String>,
    #[serde(default, alias = "inheritEnv")]
    pub inherit_env: Vec<String>,
    #[serde(default, alias = "maximumCmdTimeLive")]
    pub maximum_cmd_time_live: Option<String>,
}

impl RouteConfig {
    /// Queue endpoint with `~` expanded
    pub fn endpoint(&self) -> String {
        shellexpand::tilde(self.url.trim()).into_owned()
    }

    pub fn visibility_timeout(&self) -> Result<Duration> {
        let timeout = match &self.visibility_timeout {
            Some(raw) => parse_duration(raw)?,
            None => DEFAULT_VISIBILITY_TIMEOUT,
        };
        if timeout.is_zero() {
            bail!("visibility_timeout must be greater than zero");
        }
        Ok(timeout)
    }

    pub fn listener_settings(&self) -> Result<ListenerSettings> {
        let max_messages = self.max_messages.unwrap_or(DEFAULT_MAX_MESSAGES);
        if max_messages == 0 {
            bail!("max_messages must be at least 1");
        }
        Ok(ListenerSettings {
            max_messages,
            wait_seconds: self.wait_seconds.unwrap_or(DEFAULT_WAIT_SECONDS),
            delivery: if self.no_blocking {
                DeliveryMode::NonBlocking
            } else {
                DeliveryMode::Blocking
            },
            error_backoff: TRANSPORT_ERROR_BACKOFF,
        })
    }

    pub fn route_settings(&self) -> Result<RouteSettings> {
        let delay = match &self.delay {
            Some(raw) => parse_duration(raw).context("invalid delay")?,
            None => Duration::ZERO,
        };
        Ok(RouteSettings::new(self.label.clone(), self.concurrent, delay))
    }

    pub fn command_spec(&self) -> Result<CommandSpec> {
        let max_lifetime = match &self.maximum_cmd_time_live {
            Some(raw) => parse_duration(raw).context("invalid maximum_cmd_time_live")?,
            None => DEFAULT_MAX_CMD_LIFETIME,
        };
        let conditions = self
            .cond
            .iter()
            .flat_map(|table| table.iter().map(|(k, v)| (k.clone(), v.clone())))
            .collect();

        Ok(CommandSpec {
            cmd: self.cmd.clone(),
            args: self.args.clone(),
            conditions,
            label: self.label.clone(),
            user: self.user.clone(),
            working_directory: self
                .working_directory
                .as_deref()
                .map(|dir| PathBuf::from(shellexpand::tilde(dir).into_owned())),
            env: self.env.clone(),
            inherit_env: self.inherit_env.clone(),
            max_lifetime,
        })
    }

    /// Check everything that can be checked without touching the system
    pub fn validate(&self) -> Result<()> {
        if self.url.trim().is_empty() {
            bail!("url cannot be empty");
        }
        if self.input == InputKind::Spool && (self.region.is_some() || self.profile.is_some()) {
            warn!(url = %self.url, "region/profile are ignored by the spool input");
        }
        self.visibility_timeout()?;
        self.listener_settings()?;
        self.route_settings()?;
        self.command_spec()?.compile()?;
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    #[serde(default, alias = "LogStream")]
    log_stream: Option<LogStreamConfig>,
    #[serde(default, alias = "Reactor")]
    reactor: Vec<toml::Table>,
}

/// Merged configuration of one daemon run
#[derive(Debug, Default)]
pub struct Config {
    pub log_stream: Option<LogStreamConfig>,
    pub routes: Vec<RouteConfig>,
    /// Route tables that failed to deserialize and were skipped
    pub rejected: usize,
}

impl Config {
    /// Load from `dir` when given, otherwise from `file`
    pub fn load(file: &Path, dir: Option<&Path>) -> Result<Self> {
        match dir {
            Some(dir) => Self::from_dir(dir),
            None => Self::from_file(file),
        }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Self::parse(&contents, &path.display().to_string())
    }

    /// Parse one document; `origin` names it in logs
    pub fn parse(contents: &str, origin: &str) -> Result<Self> {
        let file = parse_file(contents, origin)?;
        let mut config = Self::default();
        config.merge(file, origin);
        Ok(config)
    }

    /// Merge every `*.conf` file of `dir` in name order
    ///
    /// Routes are concatenated and the first log stream found wins. A file
    /// that fails to parse is logged and skipped.
    pub fn from_dir(dir: &Path) -> Result<Self> {
        if !dir.is_dir() {
            bail!("configuration directory is not a directory: {}", dir.display());
        }

        let mut files: Vec<PathBuf> = std::fs::read_dir(dir)
            .with_context(|| format!("failed to list {}", dir.display()))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| {
                path.is_file()
                    && path.extension().and_then(|e| e.to_str()) == Some(CONFIG_EXTENSION)
            })
            .collect();
        files.sort();

        let mut config = Self::default();
        for path in files {
            let origin = path.display().to_string();
            let parsed = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read {origin}"))
                .and_then(|contents| parse_file(&contents, &origin));
            match parsed {
                Ok(file) => config.merge(file, &origin),
                Err(e) => {
                    let reason = format!("{e:#}");
                    error!(file = %origin, error = %reason, "Skipping config file");
                }
            }
        }
        info!(dir = %dir.display(), routes = config.routes.len(), "Configuration directory loaded");
        Ok(config)
    }

    fn merge(&mut self, file: ConfigFile, origin: &str) {
        if self.log_stream.is_none() {
            self.log_stream = file.log_stream;
        }
        for (index, table) in file.reactor.into_iter().enumerate() {
            match toml::Value::Table(table).try_into::<RouteConfig>() {
                Ok(route) => self.routes.push(route),
                Err(e) => {
                    error!(file = %origin, route = index, error = %e, "Skipping invalid route");
                    self.rejected += 1;
                }
            }
        }
    }
}

fn parse_file(contents: &str, origin: &str) -> Result<ConfigFile> {
    toml::from_str(contents).with_context(|| format!("invalid configuration in {origin}"))
}
