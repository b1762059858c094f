//! Channels backed by a host child process
//!
//! Used for every transport that is reached through a command-line tool:
//! `ssh`, `adb`, `docker exec`, or any local program. The child's stdin is the
//! write side; stdout and stderr are both read.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tracing::{debug, info, warn};

use crate::channel::Channel;
use crate::error::ChannelError;

#[derive(Debug)]
struct Running {
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: ChildStdout,
    stderr: Option<ChildStderr>,
    scratch: Vec<u8>,
}

/// Channel talking to a spawned child process
#[derive(Debug)]
pub struct ProcessChannel {
    name: String,
    program: String,
    args: Vec<String>,
    working_dir: Option<PathBuf>,
    running: Option<Running>,
}

impl ProcessChannel {
    /// Describe a process to spawn on open
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let program = program.into();
        let args: Vec<String> = args.into_iter().map(Into::into).collect();
        let name = if args.is_empty() {
            program.clone()
        } else {
            format!("{} {}", program, args.join(" "))
        };
        Self {
            name,
            program,
            args,
            working_dir: None,
            running: None,
        }
    }

    /// Split a whitespace-separated command line into program and arguments
    pub fn from_command_line(command_line: &str) -> Result<Self, ChannelError> {
        let mut parts = command_line.split_whitespace();
        let program = parts
            .next()
            .ok_or_else(|| ChannelError::InvalidConfig("empty command line".into()))?;
        Ok(Self::new(program, parts))
    }

    /// Run the process in `dir`
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Program to spawn
    pub fn program(&self) -> &str {
        &self.program
    }

    /// Arguments passed to the program
    pub fn args(&self) -> &[String] {
        &self.args
    }
}

#[async_trait]
impl Channel for ProcessChannel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn open(&mut self) -> Result<(), ChannelError> {
        if self.running.is_some() {
            return Ok(());
        }
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            command.current_dir(dir);
        }

        let mut child = command.spawn().map_err(|e| ChannelError::OpenFailed {
            channel: self.name.clone(),
            reason: e.to_string(),
        })?;
        let (Some(stdin), Some(stdout), stderr) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            let _ = child.start_kill();
            return Err(ChannelError::OpenFailed {
                channel: self.name.clone(),
                reason: "child pipes unavailable".into(),
            });
        };

        info!("Spawned {} (pid {:?})", self.name, child.id());
        self.running = Some(Running {
            child,
            stdin: Some(stdin),
            stdout,
            stderr,
            scratch: vec![0u8; 4096],
        });
        Ok(())
    }

    async fn close(&mut self) -> Result<(), ChannelError> {
        let Some(mut running) = self.running.take() else {
            return Ok(());
        };
        drop(running.stdin.take());
        if let Err(e) = running.child.start_kill() {
            debug!("{} already exited: {}", self.name, e);
        }
        match running.child.wait().await {
            Ok(status) => debug!("{} exited with {}", self.name, status),
            Err(e) => warn!("Failed to reap {}: {}", self.name, e),
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.running.is_some()
    }

    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, ChannelError> {
        let name = &self.name;
        let running = self
            .running
            .as_mut()
            .ok_or_else(|| ChannelError::NotOpen(name.clone()))?;

        let len = buf.len().min(running.scratch.len());
        loop {
            let result = match running.stderr.as_mut() {
                Some(stderr) => tokio::select! {
                    r = running.stdout.read(buf) => r.map(|n| (n, false)),
                    r = stderr.read(&mut running.scratch[..len]) => r.map(|n| (n, true)),
                },
                None => running.stdout.read(buf).await.map(|n| (n, false)),
            };
            match result {
                Ok((0, true)) => running.stderr = None,
                Ok((0, false)) => return Err(ChannelError::Disconnected(name.clone())),
                Ok((n, true)) => {
                    buf[..n].copy_from_slice(&running.scratch[..n]);
                    return Ok(n);
                }
                Ok((n, false)) => return Ok(n),
                Err(e) => return Err(ChannelError::io(name, e)),
            }
        }
    }

    async fn write(&mut self, data: &[u8]) -> Result<(), ChannelError> {
        let name = &self.name;
        let stdin = self
            .running
            .as_mut()
            .and_then(|r| r.stdin.as_mut())
            .ok_or_else(|| ChannelError::NotOpen(name.clone()))?;
        stdin
            .write_all(data)
            .await
            .map_err(|e| ChannelError::io(name, e))?;
        stdin.flush().await.map_err(|e| ChannelError::io(name, e))
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_cat_echoes_input() {
        let mut channel = ProcessChannel::new("cat", Vec::<String>::new());
        channel.open().await.unwrap();
        channel.write(b"hello\n").await.unwrap();
        let mut buf = [0u8; 32];
        let n = channel.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello\n");
        channel.close().await.unwrap();
        assert!(!channel.is_open());
        channel.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_exit_is_disconnect() {
        let mut channel = ProcessChannel::from_command_line("true").unwrap();
        channel.open().await.unwrap();
        let mut buf = [0u8; 32];
        assert!(matches!(
            channel.read(&mut buf).await,
            Err(ChannelError::Disconnected(_))
        ));
    }

    #[tokio::test]
    async fn test_stderr_is_read() {
        let mut channel = ProcessChannel::new("sh", ["-c", "echo oops >&2; sleep 1"]);
        channel.open().await.unwrap();
        let mut buf = [0u8; 32];
        let n = channel.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"oops\n");
        channel.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_program() {
        let mut channel = ProcessChannel::new("definitely-not-a-program-xyz", ["a"]);
        assert!(matches!(
            channel.open().await,
            Err(ChannelError::OpenFailed { .. })
        ));
        assert_eq!(channel.name(), "definitely-not-a-program-xyz a");
    }

    #[test]
    fn test_empty_command_line() {
        assert!(ProcessChannel::from_command_line("  ").is_err());
    }
}
