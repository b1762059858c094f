//! Error types for the switchboard runtime

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use sb_protocol::ProtocolError;
use sb_transport::{ChannelError, ChannelState};

/// Errors raised by switchboard operations
#[derive(Debug, Error)]
pub enum SwitchboardError {
    /// Channel index out of range
    #[error("no channel {index}: device has {count} channel(s)")]
    NoSuchChannel { index: usize, count: usize },

    /// The channel cannot accept writes in its current state
    #[error("channel {index} is {state}")]
    ChannelUnavailable { index: usize, state: ChannelState },

    /// Another expect holds the channel and the overlap policy is `Reject`
    #[error("channel {0} is busy with another expect")]
    ChannelBusy(usize),

    /// The worker for a channel is no longer running
    #[error("worker for channel {0} is not running")]
    WorkerGone(usize),

    /// Transport failure reported by a worker
    #[error("channel error: {0}")]
    Channel(#[from] ChannelError),

    /// Invalid pattern, filter or expect parameters
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The log writer stopped; device output is no longer being recorded
    #[error("log writer failed: {0}")]
    LogWriterFailed(String),

    /// The event filter stopped; events are no longer being recorded
    #[error("log filter failed: {0}")]
    LogFilterFailed(String),

    /// `send_and_expect` ran out of tries and the caller asked for an error
    #[error("command {command:?} timed out after {:.1}s waiting for {remaining:?}", elapsed.as_secs_f64())]
    ExpectTimedOut {
        command: String,
        elapsed: Duration,
        remaining: Vec<String>,
    },

    /// A file could not be moved onto or verified on the device
    #[error("file transfer failed: {0}")]
    Transfer(String),

    /// The switchboard has been closed
    #[error("switchboard is closed")]
    Closed,

    /// Configuration could not be read or parsed
    #[error("invalid configuration {path}: {reason}")]
    Config { path: PathBuf, reason: String },

    /// Reading the event file failed
    #[error("I/O error on {path}: {source}")]
    Io {
        /// File being accessed
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },
}

impl SwitchboardError {
    /// Whether this error is a custom command the channel does not implement
    pub fn is_unsupported(&self) -> bool {
        matches!(self, SwitchboardError::Channel(e) if e.is_unsupported())
    }
}
