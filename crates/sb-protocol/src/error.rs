//! Error types for the switchboard protocol layer

use thiserror::Error;

/// Errors raised while building patterns, expect specs or event filters
///
/// All of these are configuration-time failures. Nothing in the matching
/// path itself can fail once a value has been constructed.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// A regular expression failed to compile
    #[error("invalid pattern {pattern:?}: {reason}")]
    InvalidPattern {
        /// The offending pattern text
        pattern: String,
        /// Compiler diagnostic
        reason: String,
    },

    /// An expect was requested with no patterns
    #[error("expect requires at least one pattern")]
    EmptyPatternList,

    /// An expect was requested with no target channels
    #[error("expect requires at least one channel")]
    EmptyChannelSet,

    /// A filter file could not be parsed
    #[error("invalid filter file {path}: {reason}")]
    InvalidFilterFile {
        /// Path or name of the filter source
        path: String,
        /// Parse diagnostic
        reason: String,
    },

    /// A filter file declares a major version this crate does not understand
    #[error("unsupported filter version {major}.{minor} in {path} (expected major {expected})")]
    UnsupportedFilterVersion {
        /// Path or name of the filter source
        path: String,
        /// Declared major version
        major: u32,
        /// Declared minor version
        minor: u32,
        /// Supported major version
        expected: u32,
    },

    /// Two filters in the same set share a name
    #[error("duplicate filter name: {0}")]
    DuplicateFilter(String),

    /// A filter file could not be read
    #[error("I/O error reading {path}: {reason}")]
    Io {
        /// Path that failed
        path: String,
        /// Underlying error message
        reason: String,
    },
}
