//! The byte-channel contract
//!
//! A [`Channel`] is a bidirectional byte stream over one physical transport.
//! The switchboard never knows what is behind it; serial ports, child
//! processes and sockets all look the same from here.
//!
//! A channel is owned by exactly one worker task for its whole lifetime, so
//! every method takes `&mut self` and no internal locking is needed.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ChannelError;

/// Lifecycle state of a channel as observed by its worker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelState {
    /// Not open; writes are refused
    Closed,
    /// Open and being read
    Open,
    /// A read or write failed; stays faulted until reopened
    Faulted(String),
}

impl ChannelState {
    /// Whether the channel accepts writes
    pub fn is_open(&self) -> bool {
        matches!(self, ChannelState::Open)
    }
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelState::Closed => write!(f, "closed"),
            ChannelState::Open => write!(f, "open"),
            ChannelState::Faulted(why) => write!(f, "faulted ({})", why),
        }
    }
}

/// Transport-specific commands a channel may or may not support
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelCommand {
    /// Discard anything buffered in either direction
    FlushBuffers,
    /// Hold the line in break condition for the given duration
    SendBreak(Duration),
    /// Send the XON flow-control character
    SendXon,
    /// Send the XOFF flow-control character
    SendXoff,
    /// Change the line speed
    SetBaudRate(u32),
    /// Flash a firmware image
    Flash(PathBuf),
    /// Reset the device through the transport
    Reset,
}

impl fmt::Display for ChannelCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelCommand::FlushBuffers => write!(f, "flush buffers"),
            ChannelCommand::SendBreak(d) => write!(f, "send break ({}ms)", d.as_millis()),
            ChannelCommand::SendXon => write!(f, "send XON"),
            ChannelCommand::SendXoff => write!(f, "send XOFF"),
            ChannelCommand::SetBaudRate(baud) => write!(f, "set baud rate {}", baud),
            ChannelCommand::Flash(path) => write!(f, "flash {}", path.display()),
            ChannelCommand::Reset => write!(f, "reset"),
        }
    }
}

/// A bidirectional byte stream to a device
///
/// `read` must be cancel-safe: the worker races it against its command
/// queue and a poll timeout, and drops it whenever either wins. Every tokio
/// `AsyncRead` satisfies this.
#[async_trait]
pub trait Channel: Send + fmt::Debug {
    /// Human-readable name used in logs and errors
    fn name(&self) -> &str;

    /// Acquire the underlying transport
    async fn open(&mut self) -> Result<(), ChannelError>;

    /// Release the underlying transport; closing a closed channel is a no-op
    async fn close(&mut self) -> Result<(), ChannelError>;

    /// Whether the transport is currently held
    fn is_open(&self) -> bool;

    /// Wait for at least one byte and return how many were read into `buf`
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, ChannelError>;

    /// Write all of `data`
    async fn write(&mut self, data: &[u8]) -> Result<(), ChannelError>;

    /// Run a transport-specific command
    async fn custom(&mut self, command: &ChannelCommand) -> Result<(), ChannelError> {
        Err(ChannelError::Unsupported {
            channel: self.name().to_string(),
            command: command.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Null;

    #[async_trait]
    impl Channel for Null {
        fn name(&self) -> &str {
            "null"
        }
        async fn open(&mut self) -> Result<(), ChannelError> {
            Ok(())
        }
        async fn close(&mut self) -> Result<(), ChannelError> {
            Ok(())
        }
        fn is_open(&self) -> bool {
            true
        }
        async fn read(&mut self, _buf: &mut [u8]) -> Result<usize, ChannelError> {
            std::future::pending().await
        }
        async fn write(&mut self, _data: &[u8]) -> Result<(), ChannelError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_custom_defaults_to_unsupported() {
        let mut channel = Null;
        let err = channel
            .custom(&ChannelCommand::Flash("fw.bin".into()))
            .await
            .unwrap_err();
        assert!(err.is_unsupported());
        assert_eq!(err.to_string(), "flash fw.bin is not supported by null");
    }

    #[test]
    fn test_state_display() {
        assert_eq!(ChannelState::Open.to_string(), "open");
        assert_eq!(
            ChannelState::Faulted("eof".into()).to_string(),
            "faulted (eof)"
        );
        assert!(!ChannelState::Closed.is_open());
    }
}
