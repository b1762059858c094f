//! Switchboard Transport Library
//!
//! This crate defines the [`Channel`] contract every transport implements and
//! ships the transports the switchboard uses out of the box:
//!
//! - **SerialChannel**: local serial ports via tokio_serial
//! - **TcpChannel**: raw TCP sockets
//! - **ProcessChannel**: a child process (ssh, adb, docker, anything else)
//! - **StreamChannel**: any `AsyncRead + AsyncWrite`, e.g. `tokio::io::duplex()`
//!
//! Devices are described by a [`ChannelConfig`] and turned into channels by a
//! [`CommunicationType`] looked up in a [`CommunicationRegistry`].
//!
//! # Example
//!
//! ```rust,no_run
//! use sb_transport::{ChannelConfig, CommunicationRegistry};
//!
//! let registry = CommunicationRegistry::with_defaults();
//! let device = registry
//!     .build(&ChannelConfig::new("ssh", "192.168.1.20"))
//!     .unwrap();
//! assert_eq!(device.channels.len(), 2);
//! ```

pub mod channel;
pub mod comms;
pub mod discovery;
pub mod error;
pub mod process;
pub mod serial;
pub mod stream;

pub use channel::{Channel, ChannelCommand, ChannelState};
pub use comms::{
    AdbComms, ChannelConfig, ChannelSpec, CommsOptions, CommunicationRegistry, CommunicationType,
    DeviceChannels, DockerComms, ProcessComms, SerialComms, SshComms, TcpComms,
};
pub use discovery::{serial_addresses, DiscoveryFilter, SerialAddress};
pub use error::ChannelError;
pub use process::ProcessChannel;
pub use serial::{SerialChannel, DEFAULT_BAUD_RATE};
pub use stream::{StreamChannel, TcpChannel};
