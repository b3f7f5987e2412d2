//! Session driver
//!
//! Runs a compiled program on a pseudo-terminal and conducts a scripted,
//! line-oriented conversation with it:
//!
//! `Starting -> ReadingInitial -> (AwaitingCommand -> Sending -> ReadingResponse)* -> Terminating -> Closed`
//!
//! A response is considered complete once the program stays quiet for one
//! per-line timeout. This is a heuristic, not a protocol guarantee; every
//! phase also has its own deadline so a program that never goes quiet cannot
//! stall the session.

pub mod pty;

use async_trait::async_trait;
use serde::Serialize;
use std::io;
use std::process::ExitStatus;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::SessionTimeouts;
use crate::runner::CommandSpec;
use crate::transcript::SessionRecord;
use pty::{is_hangup, PtyProcess, ReadEvent};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to set up pseudo-terminal: {0}")]
    Pty(#[from] io::Error),
}

/// How a session ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SessionEnd {
    /// The program reached end-of-stream after the quit command
    Completed,
    /// The program exited before the script finished
    ChildExitedEarly { commands_sent: usize },
    /// The program ignored the quit command and was killed
    ForcedShutdown,
    /// Unexpected channel I/O error; the record holds what was collected
    ChannelFailed { reason: String },
}

#[derive(Debug)]
pub struct SessionOutcome {
    pub record: SessionRecord,
    pub end: SessionEnd,
}

/// Line-oriented link to a running program
#[async_trait]
pub trait Conversation: Send {
    async fn send_line(&mut self, line: &str) -> io::Result<()>;

    /// Read one line, giving up after `timeout`
    async fn read_line(&mut self, timeout: Duration) -> io::Result<ReadEvent>;

    fn has_exited(&mut self) -> bool;

    async fn wait(&mut self) -> io::Result<ExitStatus>;

    /// Kill the program and everything it started
    async fn kill(&mut self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Starting,
    ReadingInitial,
    AwaitingCommand,
    Sending,
    ReadingResponse,
    Terminating,
    Closed,
}

fn enter(state: SessionState) {
    debug!("session state -> {:?}", state);
}

pub struct SessionDriver<'a> {
    timeouts: &'a SessionTimeouts,
}

impl<'a> SessionDriver<'a> {
    pub fn new(timeouts: &'a SessionTimeouts) -> Self {
        Self { timeouts }
    }

    /// Run one session. Only a failed spawn is an error; every later failure
    /// still yields a (possibly partial) record whose first entry is the
    /// startup output.
    pub async fn run(
        &self,
        program: &CommandSpec,
        commands: &[String],
    ) -> Result<SessionOutcome, SessionError> {
        enter(SessionState::Starting);
        info!("Starting session: {:?}", program.to_vec());
        let mut process = PtyProcess::spawn(program)?;

        let outcome = self.drive(&mut process, commands).await;

        process.reap(self.timeouts.shutdown()).await;
        enter(SessionState::Closed);
        info!(
            "Session finished: {} records, end={:?}",
            outcome.record.len(),
            outcome.end
        );
        Ok(outcome)
    }

    async fn drive<C: Conversation>(&self, process: &mut C, commands: &[String]) -> SessionOutcome {
        let mut record = SessionRecord::new();
        let end = match self.converse(process, commands, &mut record).await {
            Ok(end) => end,
            Err(e) => {
                warn!("Session channel failed: {}", e);
                process.kill().await;
                SessionEnd::ChannelFailed {
                    reason: e.to_string(),
                }
            }
        };
        SessionOutcome { record, end }
    }

    async fn converse<C: Conversation>(
        &self,
        process: &mut C,
        commands: &[String],
        record: &mut SessionRecord,
    ) -> io::Result<SessionEnd> {
        let t = self.timeouts;

        enter(SessionState::ReadingInitial);
        tokio::time::sleep(t.settle()).await;
        let mut initial = Vec::new();
        let ended = collect(process, t.initial_line(), t.initial_phase(), &mut initial).await;
        // Lines read before a failure stay in the record
        record.push("", initial);
        if ended? {
            warn!("Program exited during startup");
            return Ok(SessionEnd::ChildExitedEarly { commands_sent: 0 });
        }

        for (idx, command) in commands.iter().enumerate() {
            enter(SessionState::AwaitingCommand);
            if process.has_exited() {
                warn!("Program exited before command {:?}", command);
                return Ok(SessionEnd::ChildExitedEarly { commands_sent: idx });
            }

            enter(SessionState::Sending);
            if let Err(e) = process.send_line(command).await {
                if is_hangup(&e) {
                    warn!("Program hung up before command {:?}", command);
                    return Ok(SessionEnd::ChildExitedEarly { commands_sent: idx });
                }
                return Err(e);
            }

            enter(SessionState::ReadingResponse);
            let mut response = Vec::new();
            let ended = collect(process, t.response_line(), t.response_phase(), &mut response).await;
            record.push(command.as_str(), response);
            if ended? {
                warn!("Program exited after command {:?}", command);
                return Ok(SessionEnd::ChildExitedEarly {
                    commands_sent: idx + 1,
                });
            }
        }

        enter(SessionState::Terminating);
        Ok(self.shutdown(process).await)
    }

    /// Send the quit command and wait for end-of-stream, killing the process
    /// group when the shutdown deadline passes.
    async fn shutdown<C: Conversation>(&self, process: &mut C) -> SessionEnd {
        let quit = &self.timeouts.quit_command;
        let limit = self.timeouts.shutdown();
        if let Err(e) = process.send_line(quit).await {
            debug!("Failed to send {:?}: {}", quit, e);
        }

        let exited = tokio::time::timeout(limit, async {
            loop {
                match process.read_line(limit).await {
                    Ok(ReadEvent::Line(_)) | Ok(ReadEvent::Timeout) => continue,
                    Ok(ReadEvent::Eof) | Err(_) => break,
                }
            }
            process.wait().await
        })
        .await;

        match exited {
            Ok(Ok(status)) => {
                info!("Program exited with {}", status);
                SessionEnd::Completed
            }
            Ok(Err(e)) => {
                warn!("Failed to wait for program: {}; killing it", e);
                process.kill().await;
                SessionEnd::ForcedShutdown
            }
            Err(_) => {
                warn!("Program still running {:?} after {:?}; killing it", limit, quit);
                process.kill().await;
                SessionEnd::ForcedShutdown
            }
        }
    }
}

/// Read lines into `lines` until a per-line timeout passes in silence,
/// end-of-stream, or the phase deadline. Blank lines are dropped. Returns
/// whether end-of-stream was reached.
async fn collect<C: Conversation>(
    process: &mut C,
    line_timeout: Duration,
    phase: Duration,
    lines: &mut Vec<String>,
) -> io::Result<bool> {
    let deadline = Instant::now() + phase;

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            debug!("Phase deadline reached after {} lines", lines.len());
            return Ok(false);
        }

        match process.read_line(line_timeout.min(remaining)).await? {
            ReadEvent::Line(line) => {
                if !line.is_empty() {
                    lines.push(line);
                }
            }
            ReadEvent::Timeout => return Ok(false),
            ReadEvent::Eof => return Ok(true),
        }
    }
}
