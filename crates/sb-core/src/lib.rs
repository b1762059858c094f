//! Switchboard Runtime
//!
//! This crate coordinates communication with a device over several channels
//! at once: serial consoles, sockets, child processes. It writes commands,
//! waits for patterns in the output, and records everything the device says.
//!
//! # Architecture
//!
//! Every task owns its state and talks to the others over tokio channels:
//!
//! - **ChannelWorker**: one per channel; owns the transport, frames lines,
//!   classifies them and fans them out to the log and the response queue
//! - **LogWriter**: timestamps every line into the device log and rotates it
//! - **LogFilter**: runs event filters over logged lines and appends matches
//!   to the event file
//! - **Switchboard**: the caller-facing coordinator (`send`, `expect`,
//!   `send_and_expect`, `do_and_expect`, channel lifecycle, log notes,
//!   file transfer)
//! - **HealthCheckEngine**: ordered readiness checks with per-kind recovery
//!
//! A line always reaches the log writer before any expect can see it, so a
//! matched line is guaranteed to end up in the log.
//!
//! # Example
//!
//! ```rust,no_run
//! use sb_core::{SendOptions, Switchboard, SwitchboardConfig};
//! use sb_protocol::{ExpectSpec, FilterSet};
//! use sb_transport::{ChannelConfig, CommunicationRegistry};
//!
//! # async fn run() -> Result<(), sb_core::SwitchboardError> {
//! let registry = CommunicationRegistry::with_defaults();
//! let config = SwitchboardConfig::new("dut", "/tmp/dut.txt");
//! let sb = Switchboard::from_registry(
//!     config,
//!     &registry,
//!     &ChannelConfig::new("serial", "/dev/ttyUSB0"),
//!     FilterSet::new(),
//! )
//! .await?;
//!
//! let spec = ExpectSpec::new([r"Return Code: (\d+)"])?;
//! let result = sb
//!     .send_and_expect("echo hi", 0, &spec, &SendOptions::default())
//!     .await?;
//! println!("rc = {:?}", result.group(1));
//! sb.close().await
//! # }
//! ```

pub mod checks;
pub mod config;
pub mod error;
pub mod events;
pub mod health;
pub mod history;
mod log_filter;
pub mod log_writer;
mod response;
pub mod switchboard;
pub mod transfer;
pub mod worker;

// Re-export coordinator types
pub use config::{event_path_for, OverlapPolicy, SendOptions, SwitchboardConfig, WorkerConfig};
pub use error::SwitchboardError;
pub use events::SwitchboardEvent;
pub use history::EventHistory;
pub use log_writer::{next_log_path, CHANGE_MAX_LOG_SIZE, NEW_LOG_FILE_MESSAGE, ROTATE_LOG_MESSAGE};
pub use switchboard::Switchboard;
pub use transfer::{VerifyMethod, DEFAULT_BYTES_PER_ECHO};
pub use worker::ChannelWorker;

// Re-export health check types
pub use checks::{ChannelsOpen, LogsStreaming, ReopenChannels, Responsive};
pub use health::{
    check_fn, recovery_fn, CheckDeviceReadyError, CheckErrorKind, HealthCheck, HealthCheckEngine,
    HealthCheckError, HealthOutcome, HealthReport, ReadySetting, Recovery,
};
