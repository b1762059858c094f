//! Unified event stream for the switchboard
//!
//! Channel lifecycle changes, expect outcomes and log pipeline activity are
//! all broadcast through a single channel so observers see them in one
//! consistent order.

use std::path::PathBuf;
use std::time::Duration;

use sb_protocol::LogEvent;

/// Everything a switchboard reports to subscribers
#[derive(Debug, Clone)]
pub enum SwitchboardEvent {
    // -------------------------------------------------------------------------
    // Channel lifecycle events
    // -------------------------------------------------------------------------
    /// A channel was opened by its worker
    ChannelOpened {
        /// Channel index
        channel: usize,
    },

    /// A channel was closed on request
    ChannelClosed {
        /// Channel index
        channel: usize,
    },

    /// A read or write failed; the channel stays faulted until reopened
    ChannelFaulted {
        /// Channel index
        channel: usize,
        /// What went wrong
        reason: String,
    },

    // -------------------------------------------------------------------------
    // Expect events
    // -------------------------------------------------------------------------
    /// An expect finished, matched or not
    ExpectCompleted {
        /// Channels the expect listened on
        channels: Vec<usize>,
        /// Whether the expect completed before its timeout
        matched: bool,
        /// Time spent waiting
        elapsed: Duration,
    },

    // -------------------------------------------------------------------------
    // Log pipeline events
    // -------------------------------------------------------------------------
    /// The log writer moved to a new file
    LogFileChanged {
        /// Previous log file
        from: PathBuf,
        /// New log file
        to: PathBuf,
    },

    /// A log line matched an event filter
    LogEvent(LogEvent),

    /// The log writer stopped after a file error
    LogWriterFailed {
        /// What went wrong
        reason: String,
    },

    /// The event filter stopped after a file error
    LogFilterFailed {
        /// What went wrong
        reason: String,
    },
}
