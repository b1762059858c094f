//! Log lines and log events
//!
//! A [`LogLine`] is produced once by a channel worker (or by a coordinator
//! note) and then travels by value through the log writer and the event
//! filter. A [`LogEvent`] is the structured record the filter appends to the
//! event file when a line matches.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

/// Timestamp layout used in log files and event records
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";

/// Marker appended to lines written without an end-of-line
pub const NO_EOL_MARKER: &str = "[NO EOL]";

/// Where a log line came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogSource {
    /// Output from the channel with this index
    Channel(usize),
    /// A note inserted by the coordinator
    Note,
}

impl fmt::Display for LogSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogSource::Channel(index) => write!(f, "{}", index),
            LogSource::Note => write!(f, "M"),
        }
    }
}

/// One line of device or coordinator output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLine {
    /// Origin of the line
    pub source: LogSource,
    /// Line text, including its terminator if it had one
    pub text: String,
    /// Whether the line was terminated
    pub eol: bool,
    /// Arrival time
    pub timestamp: DateTime<Local>,
}

impl LogLine {
    /// A line received on `channel`, stamped now
    pub fn from_channel(channel: usize, text: impl Into<String>, eol: bool) -> Self {
        Self {
            source: LogSource::Channel(channel),
            text: text.into(),
            eol,
            timestamp: Local::now(),
        }
    }

    /// A coordinator note, stamped now
    pub fn note(text: impl AsRef<str>) -> Self {
        Self {
            source: LogSource::Note,
            text: format!("Note: {}\n", text.as_ref().trim_end_matches('\n')),
            eol: true,
            timestamp: Local::now(),
        }
    }

    /// A coordinator line written verbatim, without the note prefix
    ///
    /// Used for log-file bookkeeping such as rotation markers.
    pub fn marker(text: impl Into<String>) -> Self {
        let mut text = text.into();
        if !text.ends_with('\n') {
            text.push('\n');
        }
        Self {
            source: LogSource::Note,
            text,
            eol: true,
            timestamp: Local::now(),
        }
    }

    /// Channel index, if the line came from a channel
    pub fn channel(&self) -> Option<usize> {
        match self.source {
            LogSource::Channel(index) => Some(index),
            LogSource::Note => None,
        }
    }

    /// Format for the device log file
    ///
    /// `<2024-01-31 12:00:00.000001> SB-0: text`
    pub fn to_log_entry(&self) -> String {
        let mut entry = format!(
            "<{}> SB-{}: {}",
            self.timestamp.format(TIMESTAMP_FORMAT),
            self.source,
            self.text
        );
        if !self.eol {
            entry.push_str(NO_EOL_MARKER);
        }
        if !entry.ends_with('\n') {
            entry.push('\n');
        }
        entry
    }
}

/// Structured record appended to the event file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEvent {
    /// Event label, `<filter>.<event>`
    pub event_name: String,
    /// Log file the line was written to
    pub log_filename: String,
    /// The full log entry as written to the log file
    pub raw_log_line: String,
    /// When the line arrived
    pub system_timestamp: String,
    /// When the filter matched it
    pub matched_timestamp: String,
    /// Positional capture groups (group 1 onward)
    #[serde(default)]
    pub groups: Vec<Option<String>>,
    /// Named capture groups
    #[serde(default)]
    pub named_groups: BTreeMap<String, String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at_noon(mut line: LogLine) -> LogLine {
        line.timestamp = Local.with_ymd_and_hms(2024, 1, 31, 12, 0, 0).unwrap();
        line
    }

    #[test]
    fn test_channel_entry_format() {
        let line = at_noon(LogLine::from_channel(1, "boot ok\n", true));
        assert_eq!(line.to_log_entry(), "<2024-01-31 12:00:00.000000> SB-1: boot ok\n");
        assert_eq!(line.channel(), Some(1));
    }

    #[test]
    fn test_note_entry_format() {
        let line = at_noon(LogLine::note("rebooting\n"));
        assert_eq!(
            line.to_log_entry(),
            "<2024-01-31 12:00:00.000000> SB-M: Note: rebooting\n"
        );
        assert_eq!(line.channel(), None);
    }

    #[test]
    fn test_marker_has_no_note_prefix() {
        let line = at_noon(LogLine::marker("Rotating from log file a.txt to a.00001.txt"));
        assert_eq!(
            line.to_log_entry(),
            "<2024-01-31 12:00:00.000000> SB-M: Rotating from log file a.txt to a.00001.txt\n"
        );
    }

    #[test]
    fn test_partial_line_marked() {
        let line = at_noon(LogLine::from_channel(0, "login: ", false));
        assert!(line.to_log_entry().ends_with("login: [NO EOL]\n"));
    }

    #[test]
    fn test_stripped_terminator_is_not_partial() {
        let line = at_noon(LogLine::from_channel(0, "boot ok", true));
        assert_eq!(line.to_log_entry(), "<2024-01-31 12:00:00.000000> SB-0: boot ok\n");
    }

    #[test]
    fn test_event_serde_defaults() {
        let json = r#"{"event_name":"a.b","log_filename":"x.txt","raw_log_line":"l",
            "system_timestamp":"t","matched_timestamp":"t"}"#;
        let event: LogEvent = serde_json::from_str(json).unwrap();
        assert!(event.groups.is_empty());
        assert!(event.named_groups.is_empty());
    }
}
