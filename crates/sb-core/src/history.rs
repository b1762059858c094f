//! Queries over a recorded event file
//!
//! The event filter appends one JSON record per line. [`EventHistory`] reads
//! that file back and answers "what happened last" style questions.
//! Records that fail to parse are skipped with a warning so a line truncated
//! by a crash does not hide everything before it.

use std::path::{Path, PathBuf};

use sb_protocol::LogEvent;
use tracing::warn;

use crate::error::SwitchboardError;

/// Parsed contents of an event file, oldest first
#[derive(Debug, Clone, Default)]
pub struct EventHistory {
    path: PathBuf,
    events: Vec<LogEvent>,
}

impl EventHistory {
    /// Read every record in `path`
    ///
    /// A missing file is an empty history: nothing has been filtered yet.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, SwitchboardError> {
        let path = path.as_ref().to_path_buf();
        let text = match std::fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(source) => return Err(SwitchboardError::Io { path, source }),
        };

        let mut events = Vec::new();
        for (number, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<LogEvent>(line) {
                Ok(event) => events.push(event),
                Err(e) => warn!(
                    "Skipping malformed event record {}:{}: {}",
                    path.display(),
                    number + 1,
                    e
                ),
            }
        }
        Ok(Self { path, events })
    }

    /// File this history was read from
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Every record, oldest first
    pub fn events(&self) -> &[LogEvent] {
        &self.events
    }

    /// Most recent record with `label`
    pub fn last_event(&self, label: &str) -> Option<&LogEvent> {
        self.events.iter().rev().find(|e| e.event_name == label)
    }

    /// Up to `count` records whose label is in `labels`, newest first
    ///
    /// An empty `labels` matches every record.
    pub fn history(&self, labels: &[&str], count: usize) -> Vec<&LogEvent> {
        self.events
            .iter()
            .rev()
            .filter(|e| labels.is_empty() || labels.contains(&e.event_name.as_str()))
            .take(count)
            .collect()
    }

    /// Number of records with `label`
    pub fn count(&self, label: &str) -> usize {
        self.events.iter().filter(|e| e.event_name == label).count()
    }

    /// Capture group `group` (0 = first) of the latest `label` record
    pub fn last_group(&self, label: &str, group: usize) -> Option<&str> {
        self.last_event(label)?.groups.get(group)?.as_deref()
    }
}
