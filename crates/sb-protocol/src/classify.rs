//! Line classification
//!
//! Every framed line is tagged as a response, a log line, or unknown by the
//! classifier attached to the device's communication type. The tag decides
//! whether an expect targeting a given [`LineFilter`] may see the line.

use std::fmt;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;

/// Classification tag for a single line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LineKind {
    /// Output produced in reply to a command
    Response,
    /// Unsolicited device log output
    Log,
    /// Could not be told apart; eligible for every filter
    Unknown,
}

/// Which lines an expect is allowed to observe
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LineFilter {
    /// Response and unknown lines
    #[default]
    Response,
    /// Log and unknown lines
    Log,
    /// Every line
    All,
}

impl LineFilter {
    /// Whether a line with the given tag passes this filter
    pub fn accepts(self, kind: LineKind) -> bool {
        match (self, kind) {
            (LineFilter::All, _) | (_, LineKind::Unknown) => true,
            (LineFilter::Response, LineKind::Response) => true,
            (LineFilter::Log, LineKind::Log) => true,
            _ => false,
        }
    }
}

impl fmt::Display for LineFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LineFilter::Response => write!(f, "response"),
            LineFilter::Log => write!(f, "log"),
            LineFilter::All => write!(f, "all"),
        }
    }
}

/// Assigns a [`LineKind`] to each line received on a channel
pub trait LineClassifier: Send + Sync + fmt::Debug {
    /// Classify `line` received on `channel`
    fn classify(&self, channel: usize, line: &str) -> LineKind;
}

/// Every line is a response
#[derive(Debug, Clone, Copy, Default)]
pub struct AllResponse;

impl LineClassifier for AllResponse {
    fn classify(&self, _channel: usize, _line: &str) -> LineKind {
        LineKind::Response
    }
}

/// Every line is a log line
#[derive(Debug, Clone, Copy, Default)]
pub struct AllLog;

impl LineClassifier for AllLog {
    fn classify(&self, _channel: usize, _line: &str) -> LineKind {
        LineKind::Log
    }
}

/// Nothing can be told apart
#[derive(Debug, Clone, Copy, Default)]
pub struct AllUnknown;

impl LineClassifier for AllUnknown {
    fn classify(&self, _channel: usize, _line: &str) -> LineKind {
        LineKind::Unknown
    }
}

/// Lines on the listed channels are logs, everything else is a response
#[derive(Debug, Clone)]
pub struct PortLog {
    log_channels: Vec<usize>,
}

impl PortLog {
    /// Treat the given channels as log streams
    pub fn new(log_channels: impl Into<Vec<usize>>) -> Self {
        Self {
            log_channels: log_channels.into(),
        }
    }
}

impl Default for PortLog {
    fn default() -> Self {
        Self::new([1])
    }
}

impl LineClassifier for PortLog {
    fn classify(&self, channel: usize, _line: &str) -> LineKind {
        if self.log_channels.contains(&channel) {
            LineKind::Log
        } else {
            LineKind::Response
        }
    }
}

fn compile(pattern: &str) -> Result<Regex, ProtocolError> {
    Regex::new(pattern).map_err(|e| ProtocolError::InvalidPattern {
        pattern: pattern.to_string(),
        reason: e.to_string(),
    })
}

/// Lines matching a pattern are logs, everything else is a response
#[derive(Debug, Clone)]
pub struct RegexLog {
    pattern: Regex,
}

impl RegexLog {
    /// Compile the log-line pattern
    pub fn new(pattern: &str) -> Result<Self, ProtocolError> {
        Ok(Self {
            pattern: compile(pattern)?,
        })
    }
}

impl LineClassifier for RegexLog {
    fn classify(&self, _channel: usize, line: &str) -> LineKind {
        if self.pattern.is_match(line) {
            LineKind::Log
        } else {
            LineKind::Response
        }
    }
}

/// Lines matching a pattern are responses, everything else is a log line
#[derive(Debug, Clone)]
pub struct RegexResponse {
    pattern: Regex,
}

impl RegexResponse {
    /// Compile the response-line pattern
    pub fn new(pattern: &str) -> Result<Self, ProtocolError> {
        Ok(Self {
            pattern: compile(pattern)?,
        })
    }
}

impl LineClassifier for RegexResponse {
    fn classify(&self, _channel: usize, line: &str) -> LineKind {
        if self.pattern.is_match(line) {
            LineKind::Response
        } else {
            LineKind::Log
        }
    }
}

/// Per-channel regexes for devices multiplexing several streams
///
/// Lines on log channels that match `log_pattern` are logs, lines on
/// response channels that match `response_pattern` are responses, and
/// anything else is unknown.
#[derive(Debug, Clone)]
pub struct Multiport {
    log_pattern: Regex,
    response_pattern: Regex,
    log_channels: Vec<usize>,
}

impl Multiport {
    /// Build a multiport classifier
    pub fn new(
        log_pattern: &str,
        response_pattern: &str,
        log_channels: impl Into<Vec<usize>>,
    ) -> Result<Self, ProtocolError> {
        Ok(Self {
            log_pattern: compile(log_pattern)?,
            response_pattern: compile(response_pattern)?,
            log_channels: log_channels.into(),
        })
    }
}

impl LineClassifier for Multiport {
    fn classify(&self, channel: usize, line: &str) -> LineKind {
        if self.log_channels.contains(&channel) {
            if self.log_pattern.is_match(line) {
                return LineKind::Log;
            }
        } else if self.response_pattern.is_match(line) {
            return LineKind::Response;
        }
        LineKind::Unknown
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_acceptance() {
        assert!(LineFilter::Response.accepts(LineKind::Response));
        assert!(LineFilter::Response.accepts(LineKind::Unknown));
        assert!(!LineFilter::Response.accepts(LineKind::Log));
        assert!(LineFilter::Log.accepts(LineKind::Log));
        assert!(!LineFilter::Log.accepts(LineKind::Response));
        assert!(LineFilter::All.accepts(LineKind::Log));
        assert!(LineFilter::All.accepts(LineKind::Response));
    }

    #[test]
    fn test_port_log_default() {
        let c = PortLog::default();
        assert_eq!(c.classify(0, "$ ls\n"), LineKind::Response);
        assert_eq!(c.classify(1, "kernel: hi\n"), LineKind::Log);
        assert_eq!(c.classify(2, "x\n"), LineKind::Response);
    }

    #[test]
    fn test_regex_log() {
        let c = RegexLog::new(r"^\[\d+\]").unwrap();
        assert_eq!(c.classify(0, "[12] boot\n"), LineKind::Log);
        assert_eq!(c.classify(0, "ok\n"), LineKind::Response);
    }

    #[test]
    fn test_regex_response() {
        let c = RegexResponse::new(r"^> ").unwrap();
        assert_eq!(c.classify(0, "> ok\n"), LineKind::Response);
        assert_eq!(c.classify(0, "noise\n"), LineKind::Log);
    }

    #[test]
    fn test_multiport() {
        let c = Multiport::new(r"^LOG", r"^RSP", [1]).unwrap();
        assert_eq!(c.classify(1, "LOG a\n"), LineKind::Log);
        assert_eq!(c.classify(1, "RSP a\n"), LineKind::Unknown);
        assert_eq!(c.classify(0, "RSP a\n"), LineKind::Response);
        assert_eq!(c.classify(0, "LOG a\n"), LineKind::Unknown);
    }

    #[test]
    fn test_invalid_regex_rejected() {
        assert!(RegexLog::new("[").is_err());
    }
}
