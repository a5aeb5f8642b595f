//! Bounded subprocess execution
//!
//! This is the only place that launches operating system processes. Every
//! invocation carries a mandatory timeout and arguments are passed as a vector
//! without a shell. Arguments show up in logs, so secrets never belong there.

use log::{info, warn};
#[cfg(any(test, feature = "mock"))]
use mockall::automock;
use std::{
    fmt,
    path::PathBuf,
    process::{ExitStatus, Stdio},
    sync::Arc,
    time::{Duration, Instant},
};
use thiserror::Error;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    process::Command,
    sync::mpsc::UnboundedSender,
};
use trait_variant::make;

const PREVIEW_CHARS: usize = 400;
const DRAIN_GRACE: Duration = Duration::from_millis(500);
const REAP_GRACE: Duration = Duration::from_secs(5);

#[derive(Clone, Debug, Default, PartialEq)]
enum Privilege {
    #[default]
    Caller,
    Root,
    User(String),
}

/// Description of a single process invocation
#[derive(Clone, Debug)]
pub struct CommandSpec {
    label: String,
    program: String,
    args: Vec<String>,
    timeout: Duration,
    current_dir: Option<PathBuf>,
    envs: Vec<(String, String)>,
    privilege: Privilege,
}

impl CommandSpec {
    /// Create a new command description
    ///
    /// # Arguments
    /// * `label` - Short name used in logs
    /// * `program` - Executable to launch, resolved through `PATH`
    /// * `timeout` - Upper bound for the whole invocation
    pub fn new(label: impl Into<String>, program: impl Into<String>, timeout: Duration) -> Self {
        Self {
            label: label.into(),
            program: program.into(),
            args: Vec::new(),
            timeout,
            current_dir: None,
            envs: Vec::new(),
            privilege: Privilege::Caller,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    /// Run through `sudo` when `enabled` is set
    pub fn privileged(mut self, enabled: bool) -> Self {
        if enabled {
            self.privilege = Privilege::Root;
        }
        self
    }

    /// Run as another user through `sudo -u` when `user` is set
    pub fn run_as(mut self, user: Option<&str>) -> Self {
        if let Some(user) = user {
            self.privilege = Privilege::User(user.to_string());
        }
        self
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn command_line(&self) -> String {
        let mut parts = self.privilege_prefix();
        parts.push(self.program.clone());
        parts.extend(self.args.iter().cloned());
        parts.join(" ")
    }

    /// Command line without the privilege prefix
    pub fn base_command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn privilege_prefix(&self) -> Vec<String> {
        match &self.privilege {
            Privilege::Caller => vec![],
            Privilege::Root => vec!["sudo".to_string()],
            Privilege::User(user) => vec!["sudo".to_string(), "-u".to_string(), user.clone()],
        }
    }

    fn to_command(&self) -> Command {
        let prefix = self.privilege_prefix();
        let mut command = match prefix.split_first() {
            Some((sudo, rest)) => {
                let mut command = Command::new(sudo);
                command.args(rest).arg(&self.program);
                command
            }
            None => Command::new(&self.program),
        };

        command
            .args(&self.args)
            .envs(self.envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(dir) = &self.current_dir {
            command.current_dir(dir);
        }

        command
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Outcome {
    Exited(i32),
    Signaled,
    TimedOut,
    SpawnFailed(String),
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Exited(code) => write!(f, "exit code {code}"),
            Outcome::Signaled => write!(f, "terminated by signal"),
            Outcome::TimedOut => write!(f, "timed out"),
            Outcome::SpawnFailed(reason) => write!(f, "spawn failed: {reason}"),
        }
    }
}

impl From<ExitStatus> for Outcome {
    fn from(status: ExitStatus) -> Self {
        status.code().map_or(Outcome::Signaled, Outcome::Exited)
    }
}

/// Structured result of a finished invocation
#[derive(Clone, Debug)]
pub struct CommandResult {
    pub command: String,
    pub outcome: Outcome,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
    timeout: Duration,
}

impl CommandResult {
    pub fn ok(&self) -> bool {
        self.outcome == Outcome::Exited(0)
    }

    /// Convert any non-success outcome into a `CommandError`
    pub fn checked(self) -> Result<Self, CommandError> {
        match &self.outcome {
            Outcome::Exited(0) => Ok(self),
            Outcome::TimedOut => Err(CommandError::Timeout {
                command: self.command,
                timeout: self.timeout,
            }),
            Outcome::SpawnFailed(reason) => Err(CommandError::Spawn {
                command: self.command,
                reason: reason.clone(),
            }),
            outcome => Err(CommandError::Failed {
                reason: self.failure_reason(),
                outcome: outcome.clone(),
                command: self.command,
            }),
        }
    }

    /// Most informative single line explaining a failure
    pub fn failure_reason(&self) -> String {
        let last_line = |s: &str| {
            s.lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .last()
                .map(str::to_string)
        };

        last_line(&self.stderr)
            .or_else(|| last_line(&self.stdout))
            .unwrap_or_else(|| self.outcome.to_string())
    }
}

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("{command} timed out after {timeout:?}")]
    Timeout { command: String, timeout: Duration },
    #[error("{command} failed ({outcome}): {reason}")]
    Failed {
        command: String,
        outcome: Outcome,
        reason: String,
    },
    #[error("failed to launch {command}: {reason}")]
    Spawn { command: String, reason: String },
}

#[make(Send)]
#[cfg_attr(any(test, feature = "mock"), automock)]
pub trait CommandRunner: Send + Sync + 'static {
    /// Run a command to completion and capture its output
    async fn run(&self, spec: CommandSpec) -> CommandResult;

    /// Like `run`, additionally sending stdout and stderr lines to `lines` as they arrive
    async fn run_streaming(
        &self,
        spec: CommandSpec,
        lines: UnboundedSender<String>,
    ) -> CommandResult;
}

impl<T: CommandRunner> CommandRunner for Arc<T> {
    async fn run(&self, spec: CommandSpec) -> CommandResult {
        self.as_ref().run(spec).await
    }

    async fn run_streaming(
        &self,
        spec: CommandSpec,
        lines: UnboundedSender<String>,
    ) -> CommandResult {
        self.as_ref().run_streaming(spec, lines).await
    }
}

/// `CommandRunner` backed by real processes
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemActionRunner;

impl CommandRunner for SystemActionRunner {
    async fn run(&self, spec: CommandSpec) -> CommandResult {
        execute(spec, &mut |_| {}).await
    }

    async fn run_streaming(
        &self,
        spec: CommandSpec,
        lines: UnboundedSender<String>,
    ) -> CommandResult {
        execute(spec, &mut |line| {
            // the receiver may have stopped listening
            let _ = lines.send(line.to_string());
        })
        .await
    }
}

async fn execute(spec: CommandSpec, on_line: &mut (dyn FnMut(&str) + Send)) -> CommandResult {
    let command = spec.command_line();
    log_start(&spec, &command);

    let started = Instant::now();
    let deadline = tokio::time::Instant::now() + spec.timeout;
    let mut stdout = String::new();
    let mut stderr = String::new();

    let outcome = match spec.to_command().spawn() {
        Err(e) => Outcome::SpawnFailed(e.to_string()),
        Ok(mut child) => {
            let (Some(out), Some(err)) = (child.stdout.take(), child.stderr.take()) else {
                let outcome = Outcome::SpawnFailed("missing output pipes".into());
                return finish(&spec, command, outcome, stdout, stderr, started);
            };
            let mut out_lines = BufReader::new(out).lines();
            let mut err_lines = BufReader::new(err).lines();
            let (mut out_done, mut err_done) = (false, false);
            let mut exit: Option<ExitStatus> = None;
            let mut drain_deadline = deadline;

            loop {
                if let (Some(status), true, true) = (exit, out_done, err_done) {
                    break status.into();
                }

                tokio::select! {
                    line = out_lines.next_line(), if !out_done => match line {
                        Ok(Some(line)) => {
                            on_line(&line);
                            push_line(&mut stdout, &line);
                        }
                        _ => out_done = true,
                    },
                    line = err_lines.next_line(), if !err_done => match line {
                        Ok(Some(line)) => {
                            on_line(&line);
                            push_line(&mut stderr, &line);
                        }
                        _ => err_done = true,
                    },
                    status = child.wait(), if exit.is_none() => match status {
                        Ok(status) => {
                            exit = Some(status);
                            drain_deadline = deadline.min(tokio::time::Instant::now() + DRAIN_GRACE);
                        }
                        Err(e) => break Outcome::SpawnFailed(e.to_string()),
                    },
                    _ = tokio::time::sleep_until(drain_deadline) => {
                        // pipes inherited by a daemonized grandchild may never close
                        if let Some(status) = exit {
                            break status.into();
                        }

                        if let Err(e) = child.start_kill() {
                            warn!("failed to kill {}: {e}", spec.label);
                        }
                        if tokio::time::timeout(REAP_GRACE, child.wait()).await.is_err() {
                            warn!("failed to reap {} after kill", spec.label);
                        }
                        break Outcome::TimedOut;
                    }
                }
            }
        }
    };

    finish(&spec, command, outcome, stdout, stderr, started)
}

fn push_line(buffer: &mut String, line: &str) {
    buffer.push_str(line);
    buffer.push('\n');
}

fn finish(
    spec: &CommandSpec,
    command: String,
    outcome: Outcome,
    stdout: String,
    stderr: String,
    started: Instant,
) -> CommandResult {
    let result = CommandResult {
        command,
        outcome,
        stdout,
        stderr,
        duration: started.elapsed(),
        timeout: spec.timeout,
    };
    log_done(spec, &result);
    result
}

fn log_start(spec: &CommandSpec, command: &str) {
    info!(
        "command start label={} command={:?} timeout_s={:.1} cwd={}",
        spec.label,
        command,
        spec.timeout.as_secs_f64(),
        spec.current_dir
            .as_ref()
            .map_or_else(|| "-".to_string(), |d| d.display().to_string())
    );
}

fn log_done(spec: &CommandSpec, result: &CommandResult) {
    let rc = match &result.outcome {
        Outcome::Exited(code) => code.to_string(),
        other => other.to_string(),
    };
    let message = format!(
        "command done label={} rc={} timeout={} duration_s={:.2} stdout={:?} stderr={:?}",
        spec.label,
        rc,
        result.outcome == Outcome::TimedOut,
        result.duration.as_secs_f64(),
        preview(&result.stdout),
        preview(&result.stderr),
    );

    if result.ok() {
        info!("{message}");
    } else {
        warn!("{message}");
    }
}

/// Output truncated for log records
pub fn preview(output: &str) -> String {
    let trimmed = output.trim();
    match trimmed.char_indices().nth(PREVIEW_CHARS) {
        Some((cut, _)) => format!("{}…", &trimmed[..cut]),
        None => trimmed.to_string(),
    }
}
