//! Error types for channels and communication types

use thiserror::Error;

use sb_protocol::ProtocolError;

/// Errors raised by channels and channel factories
#[derive(Debug, Error)]
pub enum ChannelError {
    /// The underlying transport could not be acquired
    #[error("failed to open {channel}: {reason}")]
    OpenFailed { channel: String, reason: String },

    /// An operation needed an open channel
    #[error("channel {0} is not open")]
    NotOpen(String),

    /// The remote end went away
    #[error("channel {0} disconnected")]
    Disconnected(String),

    /// Read or write failure
    #[error("I/O error on {channel}: {source}")]
    Io {
        /// Channel name
        channel: String,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// The channel does not implement a custom command
    #[error("{command} is not supported by {channel}")]
    Unsupported { channel: String, command: String },

    /// Serial port error
    #[error("serial port error: {0}")]
    SerialPort(#[from] serialport::Error),

    /// No factory is registered under this name
    #[error("unknown communication type: {0}")]
    UnknownCommunicationType(String),

    /// A channel configuration is incomplete or inconsistent
    #[error("invalid channel configuration: {0}")]
    InvalidConfig(String),

    /// A pattern in the configuration failed to compile
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

impl ChannelError {
    /// Wrap an I/O error raised on `channel`
    pub fn io(channel: &str, source: std::io::Error) -> Self {
        ChannelError::Io {
            channel: channel.to_string(),
            source,
        }
    }

    /// Whether this error is a missing custom command
    pub fn is_unsupported(&self) -> bool {
        matches!(self, ChannelError::Unsupported { .. })
    }
}
