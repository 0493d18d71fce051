//! External command execution.
//!
//! Restarting the serving container and running the garbage collector are
//! both "run this argv and tell me how it went". The [`CommandExecutor`]
//! trait captures that capability so the reconciler never touches
//! `std::process` directly:
//! - [`ProcessExecutor`] spawns real processes with tokio
//! - [`MockExecutor`] replays scripted outcomes for tests

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::process::Stdio;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::config::redact_userinfo;

/// A command to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    /// Program followed by its arguments.
    pub argv: Vec<String>,

    /// Environment variables set on top of the inherited environment.
    pub env: BTreeMap<String, String>,

    /// Kill the process if it runs longer than this.
    pub timeout: Option<Duration>,
}

impl CommandSpec {
    /// Create a spec from an argv.
    pub fn new<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            argv: argv.into_iter().map(Into::into).collect(),
            env: BTreeMap::new(),
            timeout: None,
        }
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// The argv joined with spaces, for logging. Passwords embedded in
    /// URIs are masked; `env` values are never shown.
    pub fn display(&self) -> String {
        self.argv
            .iter()
            .map(|arg| redact_userinfo(arg))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// How a command ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandStatus {
    /// The process exited with a code.
    Exited(i32),

    /// The process was terminated by a signal.
    Signaled,

    /// The process outlived its timeout and was killed.
    TimedOut,

    /// The process could not be started.
    SpawnFailed(String),
}

impl fmt::Display for CommandStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandStatus::Exited(code) => write!(f, "exit code {}", code),
            CommandStatus::Signaled => write!(f, "terminated by signal"),
            CommandStatus::TimedOut => write!(f, "timed out"),
            CommandStatus::SpawnFailed(reason) => write!(f, "spawn failed: {}", reason),
        }
    }
}

/// Captured result of running a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutcome {
    pub status: CommandStatus,
    pub stdout: String,
    pub stderr: String,
    pub elapsed: Duration,
}

impl CommandOutcome {
    /// Returns true iff the process exited with code 0.
    pub fn succeeded(&self) -> bool {
        self.status == CommandStatus::Exited(0)
    }

    /// Exit code, if the process exited normally.
    pub fn exit_code(&self) -> Option<i32> {
        match self.status {
            CommandStatus::Exited(code) => Some(code),
            _ => None,
        }
    }

    /// A successful outcome with no output.
    pub fn success() -> Self {
        Self::exited(0, "")
    }

    /// An outcome with the given exit code and stderr.
    pub fn exited(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            status: CommandStatus::Exited(code),
            stdout: String::new(),
            stderr: stderr.into(),
            elapsed: Duration::ZERO,
        }
    }

    /// An outcome for a process killed at its timeout.
    pub fn timed_out(elapsed: Duration) -> Self {
        Self {
            status: CommandStatus::TimedOut,
            stdout: String::new(),
            stderr: String::new(),
            elapsed,
        }
    }

    /// Trimmed stderr, falling back to the status when stderr is empty.
    pub fn failure_detail(&self) -> String {
        let stderr = self.stderr.trim();
        if stderr.is_empty() {
            self.status.to_string()
        } else {
            stderr.to_string()
        }
    }
}

/// Command execution interface.
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    /// Run a command to completion (or timeout) and capture the outcome.
    async fn run(&self, spec: &CommandSpec) -> CommandOutcome;
}

/// Executor that spawns real processes.
#[derive(Debug, Default)]
pub struct ProcessExecutor;

impl ProcessExecutor {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CommandExecutor for ProcessExecutor {
    async fn run(&self, spec: &CommandSpec) -> CommandOutcome {
        let started = Instant::now();
        let failed = |status: CommandStatus| CommandOutcome {
            status,
            stdout: String::new(),
            stderr: String::new(),
            elapsed: started.elapsed(),
        };

        let Some((program, args)) = spec.argv.split_first() else {
            return failed(CommandStatus::SpawnFailed("empty argv".to_string()));
        };

        debug!(command = %spec.display(), timeout = ?spec.timeout, "Running command");

        let mut cmd = Command::new(program);
        cmd.args(args)
            .envs(&spec.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => return failed(CommandStatus::SpawnFailed(e.to_string())),
        };

        // Dropping the wait future on timeout kills the child via kill_on_drop.
        let output = match spec.timeout {
            Some(limit) => match tokio::time::timeout(limit, child.wait_with_output()).await {
                Ok(result) => result,
                Err(_) => return failed(CommandStatus::TimedOut),
            },
            None => child.wait_with_output().await,
        };

        match output {
            Ok(output) => CommandOutcome {
                status: match output.status.code() {
                    Some(code) => CommandStatus::Exited(code),
                    None => CommandStatus::Signaled,
                },
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                elapsed: started.elapsed(),
            },
            Err(e) => failed(CommandStatus::SpawnFailed(e.to_string())),
        }
    }
}

/// Mock executor for testing.
///
/// Returns scripted outcomes in order, then succeeds once the script runs
/// out. Every spec it receives is recorded.
#[derive(Debug, Default)]
pub struct MockExecutor {
    script: Mutex<VecDeque<CommandOutcome>>,
    calls: Mutex<Vec<CommandSpec>>,
}

impl MockExecutor {
    /// Create a mock executor where every command succeeds.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a mock executor that replays `outcomes` in order.
    pub fn scripted(outcomes: impl IntoIterator<Item = CommandOutcome>) -> Self {
        Self {
            script: Mutex::new(outcomes.into_iter().collect()),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Commands run so far.
    pub fn calls(&self) -> Vec<CommandSpec> {
        self.calls.lock().unwrap().clone()
    }

    /// Number of commands whose argv contains `needle`.
    pub fn count_containing(&self, needle: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|spec| spec.argv.iter().any(|arg| arg == needle))
            .count()
    }
}

#[async_trait]
impl CommandExecutor for MockExecutor {
    async fn run(&self, spec: &CommandSpec) -> CommandOutcome {
        debug!(command = %spec.display(), "[MOCK] Running command");
        self.calls.lock().unwrap().push(spec.clone());
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(CommandOutcome::success)
    }
}
