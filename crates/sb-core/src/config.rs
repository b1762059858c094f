//! Switchboard configuration
//!
//! All durations are stored in milliseconds so configs round-trip through
//! JSON without a custom serializer.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::SwitchboardError;

/// Default capacity of the shared raw-log queue
pub const DEFAULT_LOG_QUEUE_SIZE: usize = 1024;

/// Default capacity of each per-channel response queue
pub const DEFAULT_RESPONSE_QUEUE_SIZE: usize = 256;

/// Default capacity of each worker's command queue
pub const DEFAULT_COMMAND_QUEUE_SIZE: usize = 64;

/// Default capacity of the event broadcast
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// What happens when two expects target the same channel at once
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverlapPolicy {
    /// The second expect waits until the first releases the channel
    #[default]
    Wait,
    /// The second expect fails with `ChannelBusy`
    Reject,
}

/// Per-channel worker tuning
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Upper bound on a single read wait (ms)
    pub poll_interval_ms: u64,
    /// Publish an unterminated line after this much silence (ms)
    pub partial_line_timeout_ms: u64,
    /// Read buffer size
    pub max_read_bytes: usize,
    /// Split writes into chunks of at most this many bytes (0 = unchunked)
    pub max_write_bytes: usize,
    /// Open every channel when the switchboard starts
    pub open_on_start: bool,
    /// Command queue capacity
    pub command_queue_size: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 10,
            partial_line_timeout_ms: 100,
            max_read_bytes: 11520,
            max_write_bytes: 32,
            open_on_start: true,
            command_queue_size: DEFAULT_COMMAND_QUEUE_SIZE,
        }
    }
}

impl WorkerConfig {
    /// Read poll interval
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    /// Partial line timeout
    pub fn partial_line_timeout(&self) -> Duration {
        Duration::from_millis(self.partial_line_timeout_ms)
    }
}

/// Switchboard configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SwitchboardConfig {
    /// Device name used in logs and health check errors
    pub device_name: String,
    /// Device log file
    pub log_path: PathBuf,
    /// Event file; derived from `log_path` when unset
    pub event_path: Option<PathBuf>,
    /// Rotate the log once it reaches this size in bytes (0 = never)
    pub max_log_size: u64,
    /// Send every command one byte at a time
    pub force_slow: bool,
    /// Behaviour of overlapping expects
    pub overlap_policy: OverlapPolicy,
    /// Shared raw-log queue capacity
    pub log_queue_size: usize,
    /// Per-channel response queue capacity
    pub response_queue_size: usize,
    /// Event broadcast capacity
    pub event_capacity: usize,
    /// Worker tuning
    pub worker: WorkerConfig,
}

impl Default for SwitchboardConfig {
    fn default() -> Self {
        Self {
            device_name: "device".to_string(),
            log_path: PathBuf::from("device.txt"),
            event_path: None,
            max_log_size: 0,
            force_slow: false,
            overlap_policy: OverlapPolicy::Wait,
            log_queue_size: DEFAULT_LOG_QUEUE_SIZE,
            response_queue_size: DEFAULT_RESPONSE_QUEUE_SIZE,
            event_capacity: DEFAULT_EVENT_CAPACITY,
            worker: WorkerConfig::default(),
        }
    }
}

impl SwitchboardConfig {
    /// Config for `device_name` logging to `log_path`, everything else default
    pub fn new(device_name: impl Into<String>, log_path: impl Into<PathBuf>) -> Self {
        Self {
            device_name: device_name.into(),
            log_path: log_path.into(),
            ..Default::default()
        }
    }

    /// Load a config from a JSON file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, SwitchboardError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| SwitchboardError::Config {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        serde_json::from_str(&text).map_err(|e| SwitchboardError::Config {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }

    /// The event file this config writes to
    pub fn event_path(&self) -> PathBuf {
        self.event_path
            .clone()
            .unwrap_or_else(|| event_path_for(&self.log_path))
    }
}

/// Event file that accompanies `log_path`: `dir/name.txt` → `dir/name-events.txt`
pub fn event_path_for(log_path: &Path) -> PathBuf {
    let stem = log_path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    log_path.with_file_name(format!("{}-events.txt", stem))
}

/// Options for writing a command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendOptions {
    /// Append `newline` unless the command already ends a line
    pub add_newline: bool,
    /// Line terminator to append
    pub newline: String,
    /// Write one byte at a time
    pub slow: bool,
    /// `send_and_expect` only: write the command again while the expect times out
    pub command_tries: usize,
    /// `send_and_expect` only: turn a final timeout into `ExpectTimedOut`
    pub raise_for_timeout: bool,
}

impl Default for SendOptions {
    fn default() -> Self {
        Self {
            add_newline: true,
            newline: "\n".to_string(),
            slow: false,
            command_tries: 1,
            raise_for_timeout: false,
        }
    }
}

impl SendOptions {
    /// Send the command exactly as given
    pub fn raw() -> Self {
        Self {
            add_newline: false,
            ..Default::default()
        }
    }

    /// Write one byte at a time
    pub fn slow(mut self) -> Self {
        self.slow = true;
        self
    }

    /// Number of attempts for `send_and_expect`
    pub fn command_tries(mut self, tries: usize) -> Self {
        self.command_tries = tries;
        self
    }

    /// Fail `send_and_expect` when every attempt times out
    pub fn raise_for_timeout(mut self) -> Self {
        self.raise_for_timeout = true;
        self
    }

    /// The bytes to write for `command`
    pub fn encode(&self, command: &str) -> Vec<u8> {
        let terminated = command.ends_with(['\n', '\r', '\0'])
            || (!self.newline.is_empty() && command.ends_with(self.newline.as_str()));
        let mut data = command.as_bytes().to_vec();
        if self.add_newline && !terminated {
            data.extend_from_slice(self.newline.as_bytes());
        }
        data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_defaults() {
        let config = WorkerConfig::default();
        assert_eq!(config.poll_interval(), Duration::from_millis(10));
        assert_eq!(config.partial_line_timeout(), Duration::from_millis(100));
        assert_eq!(config.max_read_bytes, 11520);
        assert_eq!(config.max_write_bytes, 32);
        assert!(config.open_on_start);
    }

    #[test]
    fn test_event_path_for() {
        assert_eq!(
            event_path_for(Path::new("/tmp/logs/dut-20240131.txt")),
            PathBuf::from("/tmp/logs/dut-20240131-events.txt")
        );
        let config = SwitchboardConfig::new("dut", "/tmp/dut.txt");
        assert_eq!(config.event_path(), PathBuf::from("/tmp/dut-events.txt"));
    }

    #[test]
    fn test_config_partial_json() {
        let json = r#"{"device_name": "dut", "overlap_policy": "reject",
                       "worker": {"max_write_bytes": 0}}"#;
        let config: SwitchboardConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.device_name, "dut");
        assert_eq!(config.overlap_policy, OverlapPolicy::Reject);
        assert_eq!(config.worker.max_write_bytes, 0);
        assert_eq!(config.worker.poll_interval_ms, 10);
        assert_eq!(config.log_queue_size, DEFAULT_LOG_QUEUE_SIZE);
    }

    #[test]
    fn test_config_from_missing_file() {
        let err = SwitchboardConfig::from_file("/nonexistent/sb.json").unwrap_err();
        assert!(matches!(err, SwitchboardError::Config { .. }));
    }

    #[test]
    fn test_encode_adds_newline_once() {
        let options = SendOptions::default();
        assert_eq!(options.encode("reboot"), b"reboot\n");
        assert_eq!(options.encode("reboot\n"), b"reboot\n");
        assert_eq!(options.encode("reboot\r"), b"reboot\r");
        assert_eq!(options.encode("reboot\0"), b"reboot\0");
        assert_eq!(SendOptions::raw().encode("AT"), b"AT");
    }

    #[test]
    fn test_encode_custom_newline() {
        let options = SendOptions {
            newline: "\r\n".to_string(),
            ..Default::default()
        };
        assert_eq!(options.encode("AT"), b"AT\r\n");
        assert_eq!(options.encode("AT\r\n"), b"AT\r\n");
    }
}
