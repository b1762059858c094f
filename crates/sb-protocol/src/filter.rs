//! Log-event filters
//!
//! A filter is a named set of event patterns. Every log line is tested
//! against every pattern of every filter; each match yields its own
//! [`LogEvent`]. Patterns are compiled when the filter is built, so a bad
//! pattern is rejected up front instead of failing at match time.
//!
//! Filters are usually loaded from JSON files:
//!
//! ```json
//! {
//!   "description": "boot markers",
//!   "version": {"major": 1, "minor": 0},
//!   "filters": [
//!     {"name": "bootup", "regex_match": "Booting kernel (\\S+)", "description": "kernel start"}
//!   ]
//! }
//! ```
//!
//! The event label is `<file stem>.<filter name>`, e.g. `basic.bootup`.

use std::collections::HashSet;
use std::path::Path;

use chrono::Local;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;
use crate::log_line::{LogEvent, LogLine, TIMESTAMP_FORMAT};

/// Filter file major version understood by this crate
pub const FILTER_MAJOR_VERSION: u32 = 1;

/// Version block of a filter file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterVersion {
    /// Major version; must equal [`FILTER_MAJOR_VERSION`]
    pub major: u32,
    /// Minor version
    #[serde(default)]
    pub minor: u32,
}

/// One entry of a filter file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterEntry {
    /// Event name, unique within the file
    pub name: String,
    /// Pattern to search for in each log line
    pub regex_match: String,
    /// Free-form description
    #[serde(default)]
    pub description: String,
}

/// On-disk filter file layout
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterFile {
    /// Free-form description
    #[serde(default)]
    pub description: String,
    /// Format version
    pub version: FilterVersion,
    /// Event entries
    pub filters: Vec<FilterEntry>,
}

/// A compiled event pattern
#[derive(Debug, Clone)]
pub struct EventPattern {
    /// Full event label, `<filter>.<event>`
    pub label: String,
    /// Compiled pattern
    pub regex: Regex,
}

/// A named collection of event patterns
#[derive(Debug, Clone)]
pub struct LogEventFilter {
    name: String,
    events: Vec<EventPattern>,
}

impl LogEventFilter {
    /// Build a filter from `(event name, pattern)` pairs
    pub fn new<I, N, P>(name: impl Into<String>, entries: I) -> Result<Self, ProtocolError>
    where
        I: IntoIterator<Item = (N, P)>,
        N: AsRef<str>,
        P: AsRef<str>,
    {
        let name = name.into();
        let mut seen = HashSet::new();
        let mut events = Vec::new();
        for (event, pattern) in entries {
            let event = event.as_ref();
            if !seen.insert(event.to_string()) {
                return Err(ProtocolError::DuplicateFilter(format!("{}.{}", name, event)));
            }
            let regex = Regex::new(pattern.as_ref()).map_err(|e| ProtocolError::InvalidPattern {
                pattern: pattern.as_ref().to_string(),
                reason: e.to_string(),
            })?;
            events.push(EventPattern {
                label: format!("{}.{}", name, event),
                regex,
            });
        }
        Ok(Self { name, events })
    }

    /// Parse a filter from JSON text
    pub fn from_json(name: &str, json: &str) -> Result<Self, ProtocolError> {
        let file: FilterFile =
            serde_json::from_str(json).map_err(|e| ProtocolError::InvalidFilterFile {
                path: name.to_string(),
                reason: e.to_string(),
            })?;
        if file.version.major != FILTER_MAJOR_VERSION {
            return Err(ProtocolError::UnsupportedFilterVersion {
                path: name.to_string(),
                major: file.version.major,
                minor: file.version.minor,
                expected: FILTER_MAJOR_VERSION,
            });
        }
        Self::new(
            name,
            file.filters
                .iter()
                .map(|f| (f.name.as_str(), f.regex_match.as_str())),
        )
    }

    /// Load a filter file; the filter is named after the file stem
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ProtocolError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| ProtocolError::Io {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        Self::from_json(&name, &json)
    }

    /// Filter name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Event labels in declaration order
    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.events.iter().map(|e| e.label.as_str())
    }

    /// Events produced by `line`, written to the log as `entry` in `log_filename`
    pub fn events_for(&self, line: &LogLine, entry: &str, log_filename: &str) -> Vec<LogEvent> {
        self.events
            .iter()
            .filter_map(|event| {
                let caps = event.regex.captures(&line.text)?;
                let groups = caps
                    .iter()
                    .skip(1)
                    .map(|g| g.map(|g| g.as_str().to_string()))
                    .collect();
                let named_groups = event
                    .regex
                    .capture_names()
                    .flatten()
                    .filter_map(|n| Some((n.to_string(), caps.name(n)?.as_str().to_string())))
                    .collect();
                Some(LogEvent {
                    event_name: event.label.clone(),
                    log_filename: log_filename.to_string(),
                    raw_log_line: entry.trim_end_matches('\n').to_string(),
                    system_timestamp: line.timestamp.format(TIMESTAMP_FORMAT).to_string(),
                    matched_timestamp: Local::now().format(TIMESTAMP_FORMAT).to_string(),
                    groups,
                    named_groups,
                })
            })
            .collect()
    }
}

/// Ordered set of filters applied to the live log stream
#[derive(Debug, Clone, Default)]
pub struct FilterSet {
    filters: Vec<LogEventFilter>,
}

impl FilterSet {
    /// Create an empty set
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a filter; names must be unique
    pub fn add(&mut self, filter: LogEventFilter) -> Result<(), ProtocolError> {
        if self.filters.iter().any(|f| f.name == filter.name) {
            return Err(ProtocolError::DuplicateFilter(filter.name));
        }
        self.filters.push(filter);
        Ok(())
    }

    /// Number of filters
    pub fn len(&self) -> usize {
        self.filters.len()
    }

    /// Whether the set is empty
    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    /// Every filter in insertion order
    pub fn iter(&self) -> impl Iterator<Item = &LogEventFilter> {
        self.filters.iter()
    }

    /// Every event produced by `line`, filters in insertion order
    pub fn events_for(&self, line: &LogLine, entry: &str, log_filename: &str) -> Vec<LogEvent> {
        self.filters
            .iter()
            .flat_map(|f| f.events_for(line, entry, log_filename))
            .collect()
    }
}

impl TryFrom<Vec<LogEventFilter>> for FilterSet {
    type Error = ProtocolError;

    fn try_from(filters: Vec<LogEventFilter>) -> Result<Self, Self::Error> {
        let mut set = FilterSet::new();
        for filter in filters {
            set.add(filter)?;
        }
        Ok(set)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const BASIC: &str = r#"{
        "description": "basic events",
        "version": {"major": 1, "minor": 0},
        "filters": [
            {"name": "bootup", "regex_match": "Booting kernel (\\S+)", "description": "kernel"},
            {"name": "reboot", "regex_match": "reboot (?P<reason>\\w+)"}
        ]
    }"#;

    #[test]
    fn test_from_json_labels() {
        let filter = LogEventFilter::from_json("basic", BASIC).unwrap();
        let labels: Vec<_> = filter.labels().collect();
        assert_eq!(labels, vec!["basic.bootup", "basic.reboot"]);
    }

    #[test]
    fn test_from_file_uses_stem() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("boot_markers.json");
        std::fs::File::create(&path)
            .unwrap()
            .write_all(BASIC.as_bytes())
            .unwrap();
        let filter = LogEventFilter::from_file(&path).unwrap();
        assert_eq!(filter.name(), "boot_markers");
        assert!(filter.labels().any(|l| l == "boot_markers.bootup"));
    }

    #[test]
    fn test_missing_file() {
        let err = LogEventFilter::from_file("/nonexistent/none.json").unwrap_err();
        assert!(matches!(err, ProtocolError::Io { .. }));
    }

    #[test]
    fn test_bad_regex_rejected_at_load() {
        let json = r#"{"version": {"major": 1}, "filters": [{"name": "x", "regex_match": "("}]}"#;
        assert!(matches!(
            LogEventFilter::from_json("bad", json),
            Err(ProtocolError::InvalidPattern { .. })
        ));
    }

    #[test]
    fn test_wrong_major_version() {
        let json = r#"{"version": {"major": 2, "minor": 1}, "filters": []}"#;
        assert!(matches!(
            LogEventFilter::from_json("v2", json),
            Err(ProtocolError::UnsupportedFilterVersion { major: 2, .. })
        ));
    }

    #[test]
    fn test_duplicate_event_names() {
        let err = LogEventFilter::new("f", [("a", "x"), ("a", "y")]).unwrap_err();
        assert_eq!(err, ProtocolError::DuplicateFilter("f.a".into()));
    }

    #[test]
    fn test_event_groups() {
        let filter = LogEventFilter::from_json("basic", BASIC).unwrap();
        let line = LogLine::from_channel(1, "reboot requested\n", true);
        let events = filter.events_for(&line, "<ts> SB-1: reboot requested\n", "dev.txt");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_name, "basic.reboot");
        assert_eq!(events[0].named_groups["reason"], "requested");
        assert_eq!(events[0].raw_log_line, "<ts> SB-1: reboot requested");
        assert_eq!(events[0].log_filename, "dev.txt");
    }

    #[test]
    fn test_two_filters_two_events() {
        let set = FilterSet::try_from(vec![
            LogEventFilter::new("power", [("on", "power on")]).unwrap(),
            LogEventFilter::new("state", [("up", "on")]).unwrap(),
        ])
        .unwrap();
        let line = LogLine::from_channel(0, "power on\n", true);
        let events = set.events_for(&line, "entry", "dev.txt");
        let names: Vec<_> = events.iter().map(|e| e.event_name.as_str()).collect();
        assert_eq!(names, vec!["power.on", "state.up"]);
        assert!(events.iter().all(|e| e.raw_log_line == "entry"));
    }

    #[test]
    fn test_duplicate_filter_in_set() {
        let mut set = FilterSet::new();
        set.add(LogEventFilter::new("a", [("x", "x")]).unwrap()).unwrap();
        assert!(set.add(LogEventFilter::new("a", [("y", "y")]).unwrap()).is_err());
        assert_eq!(set.len(), 1);
    }
}
