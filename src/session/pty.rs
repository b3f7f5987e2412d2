//! Pseudo-terminal plumbing for interactive children
//!
//! The child gets the slave side of a fresh pty (echo disabled) as its
//! stdin/stdout/stderr and runs in its own process group. The parent keeps the
//! non-blocking master side and reads it line by line with timeouts.

use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, OwnedFd};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::pty::{openpty, OpenptyResult, Winsize};
use nix::sys::signal::{killpg, Signal};
use nix::sys::termios::{tcgetattr, tcsetattr, LocalFlags, SetArg, Termios};
use nix::unistd::Pid;
use tokio::io::unix::AsyncFd;
use tokio::process::{Child, Command};
use tracing::debug;

use super::{Conversation, SessionError};
use crate::runner::CommandSpec;

/// Outcome of a bounded line read
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadEvent {
    /// A complete line, surrounding whitespace and the `\r\n` trimmed
    Line(String),
    /// Nothing arrived within the timeout
    Timeout,
    /// The slave side was closed: the child and all its descendants are gone
    Eof,
}

/// Read/write end of the pty held by the parent
pub struct PtyChannel {
    master: AsyncFd<File>,
    pending: Vec<u8>,
    eof: bool,
}

impl PtyChannel {
    fn new(master: OwnedFd) -> io::Result<Self> {
        fcntl(master.as_raw_fd(), FcntlArg::F_SETFL(OFlag::O_NONBLOCK)).map_err(io::Error::from)?;
        Ok(Self {
            master: AsyncFd::new(File::from(master))?,
            pending: Vec::new(),
            eof: false,
        })
    }

    /// Read one line, giving up after `timeout`. Cancel-safe: bytes read
    /// before the timeout stay buffered for the next call.
    pub async fn read_line(&mut self, timeout: Duration) -> io::Result<ReadEvent> {
        match tokio::time::timeout(timeout, self.next_line()).await {
            Err(_) => Ok(ReadEvent::Timeout),
            Ok(Ok(Some(line))) => Ok(ReadEvent::Line(line)),
            Ok(Ok(None)) => Ok(ReadEvent::Eof),
            Ok(Err(e)) => Err(e),
        }
    }

    pub async fn write_all(&self, data: &[u8]) -> io::Result<()> {
        let mut written = 0;
        while written < data.len() {
            let mut guard = self.master.writable().await?;
            match guard.try_io(|inner| inner.get_ref().write(&data[written..])) {
                Ok(Ok(n)) => written += n,
                Ok(Err(e)) => return Err(e),
                Err(_would_block) => continue,
            }
        }
        Ok(())
    }

    async fn next_line(&mut self) -> io::Result<Option<String>> {
        loop {
            if let Some(line) = self.take_line() {
                return Ok(Some(line));
            }
            if self.eof {
                return Ok(self.take_rest());
            }
            if self.fill().await? == 0 {
                self.eof = true;
            }
        }
    }

    /// Append whatever is readable to the buffer; 0 means end-of-stream
    async fn fill(&mut self) -> io::Result<usize> {
        let mut chunk = [0u8; 4096];
        loop {
            let mut guard = self.master.readable().await?;
            match guard.try_io(|inner| inner.get_ref().read(&mut chunk)) {
                Ok(Ok(n)) => {
                    self.pending.extend_from_slice(&chunk[..n]);
                    return Ok(n);
                }
                // Linux reports a closed slave as EIO on the master
                Ok(Err(e)) if is_hangup(&e) => return Ok(0),
                Ok(Err(e)) => return Err(e),
                Err(_would_block) => continue,
            }
        }
    }

    fn take_line(&mut self) -> Option<String> {
        let pos = self.pending.iter().position(|&b| b == b'\n')?;
        let raw: Vec<u8> = self.pending.drain(..=pos).collect();
        Some(decode(&raw))
    }

    fn take_rest(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            None
        } else {
            let raw = std::mem::take(&mut self.pending);
            Some(decode(&raw))
        }
    }
}

fn decode(raw: &[u8]) -> String {
    String::from_utf8_lossy(raw).trim().to_string()
}

/// EIO on a pty master: the other side hung up
pub fn is_hangup(e: &io::Error) -> bool {
    e.raw_os_error() == Some(Errno::EIO as i32)
}

/// A child process attached to a pty. Dropping it kills the whole process
/// group if the child is still running.
pub struct PtyProcess {
    child: Child,
    channel: PtyChannel,
    pgid: Option<Pid>,
}

impl PtyProcess {
    pub fn spawn(spec: &CommandSpec) -> Result<Self, SessionError> {
        let OpenptyResult { master, slave } =
            openpty(None::<&Winsize>, None::<&Termios>).map_err(io::Error::from)?;
        disable_echo(&slave).map_err(io::Error::from)?;

        let child = {
            let mut cmd = Command::new(&spec.program);
            cmd.args(&spec.args)
                .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
                .stdin(Stdio::from(slave.try_clone()?))
                .stdout(Stdio::from(slave.try_clone()?))
                .stderr(Stdio::from(slave))
                .process_group(0)
                .kill_on_drop(true);
            if let Some(dir) = &spec.work_dir {
                cmd.current_dir(dir);
            }
            cmd.spawn().map_err(|source| SessionError::Spawn {
                program: spec.program.clone(),
                source,
            })?
            // `cmd` drops here, closing the parent's copies of the slave
        };

        let pgid = child.id().map(|id| Pid::from_raw(id as i32));
        Ok(Self {
            child,
            channel: PtyChannel::new(master)?,
            pgid,
        })
    }

    /// Wait up to `grace` for the child to exit, killing it otherwise
    pub async fn reap(&mut self, grace: Duration) {
        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => debug!("Program exited with {}", status),
            Ok(Err(e)) => {
                debug!("wait failed: {}", e);
                self.kill().await;
            }
            Err(_) => self.kill().await,
        }
    }
}

#[async_trait]
impl Conversation for PtyProcess {
    async fn send_line(&mut self, line: &str) -> io::Result<()> {
        debug!(target: "grader::wire", ">> {}", line);
        self.channel.write_all(format!("{}\n", line).as_bytes()).await
    }

    async fn read_line(&mut self, timeout: Duration) -> io::Result<ReadEvent> {
        let event = self.channel.read_line(timeout).await?;
        if let ReadEvent::Line(line) = &event {
            debug!(target: "grader::wire", "<< {}", line);
        }
        Ok(event)
    }

    fn has_exited(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(Some(_)))
    }

    async fn wait(&mut self) -> io::Result<ExitStatus> {
        self.child.wait().await
    }

    /// SIGKILL the process group, then reap the child
    async fn kill(&mut self) {
        if let Some(pgid) = self.pgid {
            let _ = killpg(pgid, Signal::SIGKILL);
        }
        if let Err(e) = self.child.kill().await {
            debug!("kill after group kill: {}", e);
        }
    }
}

impl Drop for PtyProcess {
    fn drop(&mut self) {
        if matches!(self.child.try_wait(), Ok(None)) {
            if let Some(pgid) = self.pgid {
                let _ = killpg(pgid, Signal::SIGKILL);
            }
            let _ = self.child.start_kill();
        }
    }
}

fn disable_echo(slave: &OwnedFd) -> nix::Result<()> {
    let mut termios = tcgetattr(slave)?;
    termios.local_flags.remove(LocalFlags::ECHO);
    tcsetattr(slave, SetArg::TCSANOW, &termios)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> CommandSpec {
        CommandSpec::new("sh").with_args(["-c", script])
    }

    #[tokio::test]
    async fn test_reads_lines_then_eof() {
        let mut process = PtyProcess::spawn(&sh("printf 'one\\r\\n  two  \\nthree'")).unwrap();
        let timeout = Duration::from_secs(5);

        assert_eq!(
            process.read_line(timeout).await.unwrap(),
            ReadEvent::Line("one".into())
        );
        assert_eq!(
            process.read_line(timeout).await.unwrap(),
            ReadEvent::Line("two".into())
        );
        assert_eq!(
            process.read_line(timeout).await.unwrap(),
            ReadEvent::Line("three".into())
        );
        assert_eq!(process.read_line(timeout).await.unwrap(), ReadEvent::Eof);
        assert_eq!(process.read_line(timeout).await.unwrap(), ReadEvent::Eof);
    }

    #[tokio::test]
    async fn test_timeout_then_late_line() {
        let mut process = PtyProcess::spawn(&sh("sleep 0.5; echo late; sleep 5")).unwrap();

        assert_eq!(
            process.read_line(Duration::from_millis(100)).await.unwrap(),
            ReadEvent::Timeout
        );
        assert_eq!(
            process.read_line(Duration::from_secs(5)).await.unwrap(),
            ReadEvent::Line("late".into())
        );
        process.kill().await;
        assert!(process.has_exited());
    }

    #[tokio::test]
    async fn test_input_is_not_echoed() {
        let mut process =
            PtyProcess::spawn(&sh("IFS= read -r line; echo \"got:$line\"")).unwrap();
        process.send_line("hello").await.unwrap();

        assert_eq!(
            process.read_line(Duration::from_secs(5)).await.unwrap(),
            ReadEvent::Line("got:hello".into())
        );
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let result = PtyProcess::spawn(&CommandSpec::new("/nonexistent/program"));
        assert!(matches!(result, Err(SessionError::Spawn { .. })));
    }
}
