//! Runner module - Execution abstraction layer
//!
//! Batch (non-interactive) program execution used by the build driver and the
//! test runner. Interactive programs go through `session` instead.
//!
//! The runner module does NOT:
//! - Interpret compiler diagnostics or test results
//! - Retry failed invocations

pub mod process;

use anyhow::Result;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Command specification for execution
#[derive(Debug, Clone, PartialEq)]
pub struct CommandSpec {
    /// Program path or name
    pub program: String,
    /// Arguments to the program
    pub args: Vec<String>,
    /// Environment variables (key, value)
    pub env: Vec<(String, String)>,
    /// Working directory
    pub work_dir: Option<PathBuf>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            work_dir: None,
        }
    }

    pub fn with_args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args = args.into_iter().map(|a| a.into()).collect();
        self
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn with_work_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.work_dir = Some(dir.as_ref().to_path_buf());
        self
    }

    /// Convert to a vector of strings (program + args)
    pub fn to_vec(&self) -> Vec<String> {
        let mut v = vec![self.program.clone()];
        v.extend(self.args.iter().cloned());
        v
    }
}

/// Execution status (raw, no verdict interpretation)
#[derive(Debug, Clone, PartialEq)]
pub enum RunStatus {
    /// Program exited normally with given exit code
    Exited(i32),
    /// Killed by signal
    Signaled(i32),
    /// Did not finish within the allotted time and was killed
    TimedOut,
}

impl RunStatus {
    /// Check if execution was successful (exited with code 0)
    pub fn is_success(&self) -> bool {
        matches!(self, RunStatus::Exited(0))
    }
}

/// Outcome of running a program
#[derive(Debug)]
pub struct RunOutcome {
    /// Stdout content
    pub stdout: String,
    /// Stderr content
    pub stderr: String,
    /// Execution status
    pub status: RunStatus,
}

impl RunOutcome {
    /// Check if execution was successful
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// Get exit code from status (-1 if not applicable)
    pub fn exit_code(&self) -> i32 {
        match self.status {
            RunStatus::Exited(code) => code,
            _ => -1,
        }
    }

    /// Best human-readable explanation of a failed run
    pub fn diagnostics(&self) -> String {
        if !self.stderr.trim().is_empty() {
            self.stderr.clone()
        } else if !self.stdout.trim().is_empty() {
            self.stdout.clone()
        } else {
            match self.status {
                RunStatus::TimedOut => "Process timed out".to_string(),
                RunStatus::Signaled(sig) => format!("Process killed by signal {}", sig),
                RunStatus::Exited(code) => format!("Process failed with exit code {}", code),
            }
        }
    }
}

/// Runner trait for executing programs
#[async_trait]
pub trait Runner: Send + Sync {
    /// Run a command to completion, killing it once `timeout` elapses
    async fn run(&self, cmd: &CommandSpec, timeout: Duration) -> Result<RunOutcome>;
}

// Re-exports
pub use process::ProcessRunner;


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_keeps_argument_order() {
        let cmd = CommandSpec::new("java")
            .with_args(["-cp", "out"])
            .arg("app.Main")
            .with_work_dir("/p");
        assert_eq!(cmd.to_vec(), vec!["java", "-cp", "out", "app.Main"]);
        assert_eq!(cmd.work_dir, Some(PathBuf::from("/p")));
    }

    #[test]
    fn test_diagnostics_fallbacks() {
        let outcome = RunOutcome {
            stdout: "partial".into(),
            stderr: "  \n".into(),
            status: RunStatus::Exited(1),
        };
        assert_eq!(outcome.diagnostics(), "partial");

        let outcome = RunOutcome {
            stdout: String::new(),
            stderr: String::new(),
            status: RunStatus::TimedOut,
        };
        assert_eq!(outcome.diagnostics(), "Process timed out");
        assert_eq!(outcome.exit_code(), -1);
        assert!(!outcome.is_success());
    }
}
