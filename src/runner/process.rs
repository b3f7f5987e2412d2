//! Direct process runner
//!
//! Executes the toolchain (compiler, test runner) as plain child processes.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::os::unix::process::ExitStatusExt;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

use super::{CommandSpec, RunOutcome, RunStatus, Runner};

/// Runner that spawns programs directly on the host
#[derive(Debug, Default)]
pub struct ProcessRunner;

impl ProcessRunner {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Runner for ProcessRunner {
    async fn run(&self, spec: &CommandSpec, timeout: Duration) -> Result<RunOutcome> {
        debug!("Running {:?} with args: {:?}", spec.program, spec.args);

        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &spec.work_dir {
            cmd.current_dir(dir);
        }

        let child = cmd
            .spawn()
            .with_context(|| format!("Failed to spawn {}", spec.program))?;

        // Dropping the wait future on timeout kills the child (kill_on_drop)
        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(output) => output.with_context(|| format!("Failed to wait for {}", spec.program))?,
            Err(_) => {
                warn!("{} timed out after {:?}", spec.program, timeout);
                return Ok(RunOutcome {
                    stdout: String::new(),
                    stderr: String::new(),
                    status: RunStatus::TimedOut,
                });
            }
        };

        let status = match (output.status.code(), output.status.signal()) {
            (Some(code), _) => RunStatus::Exited(code),
            (None, Some(sig)) => RunStatus::Signaled(sig),
            (None, None) => RunStatus::Exited(-1),
        };

        Ok(RunOutcome {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            status,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_captures_output_and_exit_code() {
        let cmd = CommandSpec::new("sh").with_args(["-c", "echo out; echo err >&2; exit 3"]);
        let outcome = ProcessRunner::new()
            .run(&cmd, Duration::from_secs(10))
            .await
            .unwrap();

        assert_eq!(outcome.status, RunStatus::Exited(3));
        assert_eq!(outcome.stdout.trim(), "out");
        assert_eq!(outcome.stderr.trim(), "err");
    }

    #[tokio::test]
    async fn test_env_and_work_dir() {
        let dir = tempfile::tempdir().unwrap();
        let cmd = CommandSpec::new("sh")
            .with_args(["-c", "echo \"$GREETING\"; pwd"])
            .with_env("GREETING", "hello")
            .with_work_dir(dir.path());
        let outcome = ProcessRunner::new()
            .run(&cmd, Duration::from_secs(10))
            .await
            .unwrap();

        let mut lines = outcome.stdout.lines();
        assert_eq!(lines.next(), Some("hello"));
        let pwd = std::path::PathBuf::from(lines.next().unwrap());
        assert_eq!(pwd.canonicalize().unwrap(), dir.path().canonicalize().unwrap());
    }

    #[tokio::test]
    async fn test_timeout_kills_process() {
        let cmd = CommandSpec::new("sleep").arg("30");
        let started = std::time::Instant::now();
        let outcome = ProcessRunner::new()
            .run(&cmd, Duration::from_millis(200))
            .await
            .unwrap();

        assert_eq!(outcome.status, RunStatus::TimedOut);
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_missing_program_is_an_error() {
        let cmd = CommandSpec::new("/nonexistent/definitely-not-here");
        assert!(ProcessRunner::new()
            .run(&cmd, Duration::from_secs(1))
            .await
            .is_err());
    }
}
