// Subprocess executor
// Runs a route's command per message: templated args, optional user switch,
// output streamed into the execution log, hard lifetime limit
use async_trait::async_trait;
use std::collections::HashMap;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

use reactor_core::application::constants::{EXECUTOR_EXIT_GRACE, EXECUTOR_EXIT_POLL_INTERVAL};
use reactor_core::application::ExecutionLog;
use reactor_core::domain::{resolve_args, CommandSpec, CompiledCommand, QueueMessage, TemplateContext};
use reactor_core::port::time_provider::SystemTimeProvider;
use reactor_core::port::{CommandExecutor, ExecutionError, TimeProvider};
use reactor_core::{AppError, Result};

/// A child process currently owned by an executor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunningProcess {
    pub pid: u32,
    pub command: String,
    pub started_at_ms: i64,
}

type ProcessTable = Arc<Mutex<HashMap<u32, RunningProcess>>>;

fn lock_table(table: &ProcessTable) -> MutexGuard<'_, HashMap<u32, RunningProcess>> {
    table.lock().unwrap_or_else(|p| p.into_inner())
}

/// Removes its pid from the table when the run ends, whatever the outcome
struct Tracked {
    table: ProcessTable,
    pid: u32,
}

impl Drop for Tracked {
    fn drop(&mut self) {
        lock_table(&self.table).remove(&self.pid);
    }
}

/// Command executor spawning one child process per message
pub struct SubprocessExecutor {
    command: CompiledCommand,
    processes: ProcessTable,
    time_provider: Arc<dyn TimeProvider>,
}

impl std::fmt::Debug for SubprocessExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubprocessExecutor")
            .field("command", &self.command)
            .finish_non_exhaustive()
    }
}

impl SubprocessExecutor {
    /// Compile and validate a command spec
    ///
    /// # Errors
    /// - AppError::Config if templates, conditions, env entries or the
    ///   configured user are invalid
    pub fn new(spec: &CommandSpec) -> Result<Self> {
        let command = spec
            .compile()
            .map_err(|e| AppError::Config(format!("command '{}': {e}", spec.cmd)))?;

        #[cfg(unix)]
        {
            if let Some(name) = &command.user {
                crate::user::lookup(name).map_err(|e| AppError::Config(e.to_string()))?;
            }
        }
        #[cfg(not(unix))]
        {
            if command.user.is_some() {
                return Err(AppError::Config(
                    "running commands as another user requires a unix host".into(),
                ));
            }
        }

        Ok(Self::from_compiled(command))
    }

    pub fn from_compiled(command: CompiledCommand) -> Self {
        Self {
            command,
            processes: Arc::new(Mutex::new(HashMap::new())),
            time_provider: Arc::new(SystemTimeProvider),
        }
    }

    /// Replace the clock used to stamp running processes
    pub fn with_time_provider(mut self, time_provider: Arc<dyn TimeProvider>) -> Self {
        self.time_provider = time_provider;
        self
    }

    /// Snapshot of the process table
    pub fn running(&self) -> Vec<RunningProcess> {
        lock_table(&self.processes).values().cloned().collect()
    }

    pub fn running_count(&self) -> usize {
        lock_table(&self.processes).len()
    }

    fn command_line(&self, args: &[String]) -> String {
        std::iter::once(self.command.cmd.as_str())
            .chain(args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Build the process: working directory, identity and environment
    fn build_command(&self, args: &[String]) -> std::result::Result<Command, ExecutionError> {
        let mut command = Command::new(&self.command.cmd);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // Own process group so a kill reaches everything the command forked
        #[cfg(unix)]
        command.process_group(0);

        if let Some(dir) = &self.command.working_directory {
            command.current_dir(dir);
        }

        if let Some(name) = &self.command.user {
            self.switch_user(&mut command, name)?;
        }

        // Explicit entries go last so they override HOME and inherited values
        command.envs(self.command.env.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        Ok(command)
    }

    #[cfg(unix)]
    fn switch_user(
        &self,
        command: &mut Command,
        name: &str,
    ) -> std::result::Result<(), ExecutionError> {
        let account = crate::user::lookup(name)?;
        crate::user::apply_identity(command, &account);
        command.env_clear();
        command.env("HOME", &account.home);
        for key in &self.command.inherit_env {
            if let Some(value) = std::env::var_os(key) {
                command.env(key, value);
            }
        }
        Ok(())
    }

    #[cfg(not(unix))]
    fn switch_user(
        &self,
        _command: &mut Command,
        name: &str,
    ) -> std::result::Result<(), ExecutionError> {
        Err(ExecutionError::UserLookup(format!(
            "cannot run as '{name}' on this platform"
        )))
    }

    fn track(&self, pid: u32, command: &str) -> Tracked {
        lock_table(&self.processes).insert(
            pid,
            RunningProcess {
                pid,
                command: command.to_string(),
                started_at_ms: self.time_provider.now_millis(),
            },
        );
        Tracked {
            table: Arc::clone(&self.processes),
            pid,
        }
    }
}

/// Copy a child pipe into the log line by line
async fn pump<R>(reader: Option<R>, log: &ExecutionLog)
where
    R: AsyncRead + Unpin,
{
    let Some(reader) = reader else { return };
    let mut reader = BufReader::new(reader);
    let mut line = Vec::new();
    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) => break,
            Ok(_) => log.write(&line),
            Err(e) => {
                warn!(error = %e, "Failed to read process output");
                break;
            }
        }
    }
}

fn exit_error(status: ExitStatus) -> Option<ExecutionError> {
    if status.success() {
        return None;
    }
    if let Some(code) = status.code() {
        return Some(ExecutionError::NonZeroExit(code));
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return Some(ExecutionError::Signalled(signal));
        }
    }
    Some(ExecutionError::NonZeroExit(-1))
}

/// SIGKILL the process group led by `pid`, or the process alone if it left it
#[cfg(unix)]
fn force_kill(pid: u32) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else { return };
    if raw <= 0 {
        return;
    }
    if kill(Pid::from_raw(-raw), Signal::SIGKILL).is_ok() {
        return;
    }
    if let Err(e) = kill(Pid::from_raw(raw), Signal::SIGKILL) {
        debug!(pid, error = %e, "SIGKILL failed, process probably gone");
    }
}

#[cfg(not(unix))]
fn force_kill(_pid: u32) {
    // Children are spawned with kill_on_drop; the owning run drops them
}

#[async_trait]
impl CommandExecutor for SubprocessExecutor {
    fn match_conditions(&self, msg: &QueueMessage) -> std::result::Result<(), ExecutionError> {
        let ctx = TemplateContext::from_message(msg);
        match self.command.filter.first_mismatch(&ctx) {
            Some(condition) => {
                debug!(
                    message_id = %msg.id(),
                    path = %condition.path(),
                    "Condition rejected message"
                );
                Err(ExecutionError::NotApplicable)
            }
            None => Ok(()),
        }
    }

    async fn run(
        &self,
        log: &ExecutionLog,
        msg: &QueueMessage,
    ) -> std::result::Result<(), ExecutionError> {
        let ctx = TemplateContext::from_message(msg);
        let args = resolve_args(&self.command.args, &ctx);
        log.set_label(&self.command.label.resolve(&ctx));
        let command_line = self.command_line(&args);

        let mut child = match self.build_command(&args).and_then(|mut c| {
            c.spawn()
                .map_err(|e| ExecutionError::SpawnFailed(e.to_string()))
        }) {
            Ok(child) => child,
            Err(e) => {
                log.write(format!("error starting process {command_line}: {e}").as_bytes());
                return Err(e);
            }
        };

        let pid = child.id();
        log.start(pid.unwrap_or_default(), &command_line);
        // No pid means the child is already reaped; there is nothing to kill
        let _tracked = pid.map(|pid| self.track(pid, &command_line));
        debug!(pid = ?pid, command = %command_line, message_id = %msg.id(), "Process started");

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let max_lifetime = self.command.max_lifetime;
        let outcome = {
            let supervised = async {
                let (_, _, status) = tokio::join!(pump(stdout, log), pump(stderr, log), child.wait());
                status
            };
            timeout(max_lifetime, supervised).await
        };

        let error = match outcome {
            Ok(Ok(status)) => exit_error(status),
            Ok(Err(e)) => Some(ExecutionError::IoError(e.to_string())),
            Err(_) => {
                if let Some(pid) = pid {
                    force_kill(pid);
                }
                if let Err(e) = child.kill().await {
                    warn!(pid = ?pid, error = %e, "Failed to kill expired process");
                }
                warn!(pid = ?pid, command = %command_line, ?max_lifetime, "Process exceeded its lifetime");
                Some(ExecutionError::Timeout(max_lifetime.as_millis() as u64))
            }
        };

        match error {
            None => Ok(()),
            Some(e) => {
                log.write(format!("error running process: {e}").as_bytes());
                Err(e)
            }
        }
    }

    async fn exit(&self) {
        let deadline = Instant::now() + EXECUTOR_EXIT_GRACE;
        while self.running_count() > 0 && Instant::now() < deadline {
            tokio::time::sleep(EXECUTOR_EXIT_POLL_INTERVAL).await;
        }

        let stragglers = self.running();
        if stragglers.is_empty() {
            return;
        }
        let now = self.time_provider.now_millis();
        for process in stragglers {
            warn!(
                pid = process.pid,
                command = %process.command,
                running_ms = now - process.started_at_ms,
                "Killing process still running at exit"
            );
            force_kill(process.pid);
        }
        info!(cmd = %self.command.cmd, "Executor exited");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reactor_core::domain::AckToken;
    use reactor_core::port::log_sink::mocks::RecordingSink;
    use std::time::Duration;

    fn spec(cmd: &str, args: &[&str]) -> CommandSpec {
        CommandSpec {
            cmd: cmd.into(),
            args: args.iter().map(|a| a.to_string()).collect(),
            max_lifetime: Duration::from_secs(10),
            ..Default::default()
        }
    }

    fn msg(body: &str) -> QueueMessage {
        QueueMessage::new("m-1", AckToken::new("m-1"), body.as_bytes().to_vec(), 1591784694000, "q")
    }

    fn log() -> (Arc<RecordingSink>, ExecutionLog) {
        let sink = Arc::new(RecordingSink::new());
        let log = ExecutionLog::new(sink.clone(), "host", 1, 1);
        (sink, log)
    }

    fn outputs(sink: &RecordingSink) -> Vec<String> {
        sink.records()
            .iter()
            .filter(|r| r["Status"] == "RUN")
            .filter_map(|r| r["Output"].as_str().map(str::to_string))
            .collect()
    }

    #[tokio::test]
    async fn test_echo_resolved_args() {
        let executor =
            SubprocessExecutor::new(&spec("echo", &["$.lang", "$.args...", "${CreationTimestampSeconds}"]))
                .unwrap();
        let (sink, log) = log();

        executor
            .run(&log, &msg(r#"{"lang":"python3","args":["third","fourth"]}"#))
            .await
            .unwrap();
        log.done(None);

        let records = sink.records();
        assert_eq!(records[0]["Status"], "CMD");
        assert_eq!(records[0]["Output"], "echo python3 third fourth 1591784694");
        assert_eq!(outputs(&sink), vec!["python3 third fourth 1591784694"]);
        assert_eq!(executor.running_count(), 0);
    }

    #[tokio::test]
    async fn test_label_is_resolved() {
        let mut s = spec("true", &[]);
        s.label = "job-$.id".into();
        let executor = SubprocessExecutor::new(&s).unwrap();
        let (sink, log) = log();

        executor.run(&log, &msg(r#"{"id":42}"#)).await.unwrap();
        assert_eq!(sink.records()[0]["Label"], "job-42");
    }

    #[tokio::test]
    async fn test_non_zero_exit_is_failure() {
        let executor = SubprocessExecutor::new(&spec("sh", &["-c", "echo out; exit 3"])).unwrap();
        let (sink, log) = log();

        let result = executor.run(&log, &msg("{}")).await;
        assert_eq!(result, Err(ExecutionError::NonZeroExit(3)));
        assert!(!result.unwrap_err().is_not_applicable());

        log.done(Some(&ExecutionError::NonZeroExit(3)));
        let records = sink.records();
        assert!(outputs(&sink).contains(&"out".to_string()));
        assert_eq!(
            records.last().unwrap()["Output"],
            "error running process: Process exited with status 3"
        );
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let executor =
            SubprocessExecutor::new(&spec("/nonexistent/reactor-binary", &[])).unwrap();
        let (sink, log) = log();

        let result = executor.run(&log, &msg("{}")).await;
        assert!(matches!(result, Err(ExecutionError::SpawnFailed(_))));

        log.done(result.as_ref().err());
        let records = sink.records();
        let first = records[0]["Output"].as_str().unwrap();
        assert!(first.starts_with("error starting process /nonexistent/reactor-binary"));
    }

    #[tokio::test]
    async fn test_lifetime_kills_process() {
        let mut s = spec("sleep", &["10"]);
        s.max_lifetime = Duration::from_millis(200);
        let executor = SubprocessExecutor::new(&s).unwrap();
        let (_sink, log) = log();

        let start = std::time::Instant::now();
        let result = executor.run(&log, &msg("{}")).await;
        assert_eq!(result, Err(ExecutionError::Timeout(200)));
        assert!(start.elapsed() < Duration::from_secs(5));
        assert_eq!(executor.running_count(), 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_lifetime_kills_forked_children() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("late");
        let script = format!("(sleep 1; echo late > {}) & wait", marker.display());
        let mut s = spec("sh", &["-c", &script]);
        s.max_lifetime = Duration::from_millis(200);
        let executor = SubprocessExecutor::new(&s).unwrap();
        let (_sink, log) = log();

        let result = executor.run(&log, &msg("{}")).await;
        assert_eq!(result, Err(ExecutionError::Timeout(200)));

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(!marker.exists());
    }

    #[tokio::test]
    async fn test_env_and_working_directory() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = spec("sh", &["-c", "echo $GREETING; pwd"]);
        s.env = vec!["GREETING=hello".into()];
        s.working_directory = Some(dir.path().to_path_buf());
        let executor = SubprocessExecutor::new(&s).unwrap();
        let (sink, log) = log();

        executor.run(&log, &msg("{}")).await.unwrap();
        let lines = outputs(&sink);
        assert_eq!(lines[0], "hello");
        let canonical = dir.path().canonicalize().unwrap();
        assert_eq!(std::path::Path::new(&lines[1]).canonicalize().unwrap(), canonical);
    }

    #[test]
    fn test_conditions() {
        let mut s = spec("true", &[]);
        s.conditions = vec![("$.lang".into(), "^python".into())];
        let executor = SubprocessExecutor::new(&s).unwrap();

        assert!(executor.match_conditions(&msg(r#"{"lang":"python3"}"#)).is_ok());
        assert_eq!(
            executor.match_conditions(&msg(r#"{"lang":"go"}"#)),
            Err(ExecutionError::NotApplicable)
        );
    }

    #[test]
    fn test_invalid_spec_is_config_error() {
        let mut s = spec("true", &[]);
        s.conditions = vec![("lang".into(), "x".into())];
        assert!(SubprocessExecutor::new(&s).unwrap_err().is_config());

        let mut s = spec("true", &[]);
        s.env = vec!["NOEQUALS".into()];
        assert!(SubprocessExecutor::new(&s).unwrap_err().is_config());
    }

    #[cfg(unix)]
    #[test]
    fn test_unknown_user_is_config_error() {
        let mut s = spec("true", &[]);
        s.user = Some("no-such-user-for-reactor-tests".into());
        assert!(SubprocessExecutor::new(&s).unwrap_err().is_config());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_exit_kills_stragglers() {
        let mut s = spec("sleep", &["30"]);
        s.max_lifetime = Duration::from_secs(60);
        let executor = Arc::new(SubprocessExecutor::new(&s).unwrap());

        let running = {
            let executor = Arc::clone(&executor);
            tokio::spawn(async move {
                let log = ExecutionLog::disabled();
                executor.run(&log, &msg("{}")).await
            })
        };
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(executor.running_count(), 1);

        let start = std::time::Instant::now();
        executor.exit().await;
        assert!(start.elapsed() >= EXECUTOR_EXIT_GRACE);

        let result = tokio::time::timeout(Duration::from_secs(5), running)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result, Err(ExecutionError::Signalled(9)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_exit_kills_shell_with_child() {
        let mut s = spec("sh", &["-c", "sleep 6; true"]);
        s.max_lifetime = Duration::from_secs(60);
        let executor = Arc::new(SubprocessExecutor::new(&s).unwrap());

        let running = {
            let executor = Arc::clone(&executor);
            tokio::spawn(async move {
                let log = ExecutionLog::disabled();
                executor.run(&log, &msg("{}")).await
            })
        };
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(executor.running_count(), 1);

        let start = std::time::Instant::now();
        executor.exit().await;
        let result = tokio::time::timeout(Duration::from_secs(1), running)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result, Err(ExecutionError::Signalled(9)));
        assert!(start.elapsed() < Duration::from_secs(4));
        assert_eq!(executor.running_count(), 0);
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_runs_with_user_groups() {
        if !nix::unistd::Uid::effective().is_root() {
            return;
        }
        let mut s = spec("id", &["-G"]);
        s.user = Some("root".into());
        let executor = SubprocessExecutor::new(&s).unwrap();
        let (sink, log) = log();

        executor.run(&log, &msg("{}")).await.unwrap();
        let mut seen: Vec<u32> = outputs(&sink)[0]
            .split_whitespace()
            .map(|g| g.parse().unwrap())
            .collect();
        let mut expected = crate::user::lookup("root").unwrap().groups;
        seen.sort_unstable();
        seen.dedup();
        expected.sort_unstable();
        expected.dedup();
        assert_eq!(seen, expected);
    }
}
