// Route Domain Model

use super::error::{DomainError, Result};
use super::json_path::{render, JsonPath};
use super::template::{ArgTemplate, TemplateContext, TextTemplate};
use regex::Regex;
use std::path::PathBuf;
use std::time::Duration;

/// Identity of a route, unique within the process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RouteId(u64);

impl RouteId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn get(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for RouteId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Dispatch settings of one route
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteSettings {
    pub label: String,
    pub concurrency: usize,
    pub pace_interval: Duration,
}

impl RouteSettings {
    /// Build settings; a concurrency of zero is raised to one worker
    pub fn new(label: impl Into<String>, concurrency: usize, pace_interval: Duration) -> Self {
        Self {
            label: label.into(),
            concurrency: concurrency.max(1),
            pace_interval,
        }
    }
}

/// Parse a human duration such as `"10m"` or `"1s"`
///
/// An empty string is a zero duration, which disables pacing.
///
/// # Errors
/// - DomainError::InvalidDuration if humantime rejects the value
pub fn parse_duration(value: &str) -> Result<Duration> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Ok(Duration::ZERO);
    }
    humantime::parse_duration(trimmed).map_err(|e| DomainError::InvalidDuration {
        value: value.to_string(),
        reason: e.to_string(),
    })
}

/// Raw command description as it comes from configuration
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandSpec {
    pub cmd: String,
    pub args: Vec<String>,
    /// Ordered `(jsonPath, pattern)` pairs, every one must match
    pub conditions: Vec<(String, String)>,
    pub label: String,
    pub user: Option<String>,
    pub working_directory: Option<PathBuf>,
    /// `KEY=VALUE` entries
    pub env: Vec<String>,
    /// Variables copied from the daemon environment when running as another user
    pub inherit_env: Vec<String>,
    pub max_lifetime: Duration,
}

/// A command spec whose templates and conditions have been compiled
#[derive(Debug, Clone)]
pub struct CompiledCommand {
    pub cmd: String,
    pub args: Vec<ArgTemplate>,
    pub label: TextTemplate,
    pub filter: Filter,
    pub user: Option<String>,
    pub working_directory: Option<PathBuf>,
    pub env: Vec<(String, String)>,
    pub inherit_env: Vec<String>,
    pub max_lifetime: Duration,
}

impl CommandSpec {
    /// Validate and compile every template, condition and env entry
    pub fn compile(&self) -> Result<CompiledCommand> {
        if self.cmd.trim().is_empty() {
            return Err(DomainError::ValidationError("cmd cannot be empty".into()));
        }
        if self.max_lifetime.is_zero() {
            return Err(DomainError::ValidationError(
                "maximum command lifetime must be greater than zero".into(),
            ));
        }

        let args = self
            .args
            .iter()
            .map(|a| ArgTemplate::parse(a))
            .collect::<Result<Vec<_>>>()?;

        let env = self
            .env
            .iter()
            .map(|entry| {
                entry
                    .split_once('=')
                    .filter(|(k, _)| !k.is_empty())
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .ok_or_else(|| {
                        DomainError::ValidationError(format!(
                            "env entry '{entry}' is not KEY=VALUE"
                        ))
                    })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(CompiledCommand {
            cmd: self.cmd.clone(),
            args,
            label: TextTemplate::parse(&self.label)?,
            filter: Filter::compile(&self.conditions)?,
            user: self.user.clone().filter(|u| !u.is_empty()),
            working_directory: self.working_directory.clone(),
            env,
            inherit_env: self.inherit_env.clone(),
            max_lifetime: self.max_lifetime,
        })
    }
}

/// One `jsonPath -> regex` condition
#[derive(Debug, Clone)]
pub struct FilterCondition {
    path: JsonPath,
    pattern: Regex,
}

impl FilterCondition {
    pub fn path(&self) -> &JsonPath {
        &self.path
    }
}

/// Ordered conjunction of conditions; empty filters match everything
#[derive(Debug, Clone, Default)]
pub struct Filter {
    conditions: Vec<FilterCondition>,
}

impl Filter {
    pub fn compile(conditions: &[(String, String)]) -> Result<Self> {
        let conditions = conditions
            .iter()
            .map(|(key, pattern)| {
                let selector = key.strip_prefix('$').filter(|s| s.starts_with('.')).ok_or_else(
                    || DomainError::InvalidPath {
                        path: key.clone(),
                        reason: "condition keys must start with '$.'".into(),
                    },
                )?;
                let pattern = Regex::new(pattern).map_err(|e| DomainError::InvalidPattern {
                    path: key.clone(),
                    reason: e.to_string(),
                })?;
                Ok(FilterCondition {
                    path: JsonPath::parse(selector)?,
                    pattern,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { conditions })
    }

    pub fn len(&self) -> usize {
        self.conditions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }

    /// Check every condition in order, returning the first one that fails
    pub fn first_mismatch(&self, ctx: &TemplateContext) -> Option<&FilterCondition> {
        self.conditions
            .iter()
            .find(|c| !c.pattern.is_match(&render(ctx.select(&c.path))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn spec() -> CommandSpec {
        CommandSpec {
            cmd: "php".into(),
            args: vec!["file.php".into(), "$.id".into()],
            max_lifetime: Duration::from_secs(60),
            ..Default::default()
        }
    }

    #[test]
    fn test_compile_valid_spec() {
        let compiled = spec().compile().unwrap();
        assert_eq!(compiled.cmd, "php");
        assert_eq!(compiled.args.len(), 2);
        assert!(compiled.filter.is_empty());
    }

    #[test]
    fn test_empty_cmd_rejected() {
        let mut s = spec();
        s.cmd = " ".into();
        assert!(s.compile().is_err());
    }

    #[test]
    fn test_bad_env_rejected() {
        let mut s = spec();
        s.env = vec!["NOEQUALS".into()];
        assert!(s.compile().is_err());
    }

    #[test]
    fn test_bad_condition_key_rejected() {
        let mut s = spec();
        s.conditions = vec![("lang".into(), "^py".into())];
        assert!(matches!(s.compile(), Err(DomainError::InvalidPath { .. })));
    }

    #[test]
    fn test_bad_condition_pattern_rejected() {
        let mut s = spec();
        s.conditions = vec![("$.lang".into(), "(".into())];
        assert!(matches!(s.compile(), Err(DomainError::InvalidPattern { .. })));
    }

    #[test]
    fn test_filter_rejects_non_matching_value() {
        let filter = Filter::compile(&[("$.lang".into(), "^python".into())]).unwrap();
        let go = TemplateContext::new(Some(json!({"lang": "go"})), 0);
        let py = TemplateContext::new(Some(json!({"lang": "python3"})), 0);
        assert_eq!(filter.first_mismatch(&go).unwrap().path().as_str(), ".lang");
        assert!(filter.first_mismatch(&py).is_none());
    }

    #[test]
    fn test_zero_concurrency_raised_to_one() {
        assert_eq!(RouteSettings::new("x", 0, Duration::ZERO).concurrency, 1);
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("10m").unwrap(), Duration::from_secs(600));
        assert_eq!(parse_duration("1s 500ms").unwrap(), Duration::from_millis(1500));
        assert_eq!(parse_duration("").unwrap(), Duration::ZERO);
        assert!(matches!(
            parse_duration("soon"),
            Err(DomainError::InvalidDuration { .. })
        ));
    }
}
