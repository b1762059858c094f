//! Switchboard Simulation Library
//!
//! This crate provides scripted devices for exercising the switchboard
//! without hardware. It includes:
//!
//! - **SimDevice**: a command → response script with optional delays
//! - **SimChannel**: a reopenable [`Channel`](sb_transport::Channel) whose far end runs a `SimDevice`
//! - **SimHandle**: remote control for emitting log lines, pulling the cable
//!   and observing what the device received
//!
//! # Example
//!
//! ```rust
//! use sb_protocol::AllUnknown;
//! use sb_sim::{sim_device, SimDeviceConfig};
//! use std::sync::Arc;
//!
//! let config = SimDeviceConfig::named("dut").respond("echo '(.*)'", ["$1", "Return Code: 0"]);
//! let (device, handles) = sim_device(vec![config], Arc::new(AllUnknown));
//! assert_eq!(device.channels.len(), 1);
//! assert_eq!(handles[0].open_count(), 0);
//! ```

pub mod channel;
pub mod device;
pub mod device_task;

use std::sync::Arc;

use sb_protocol::LineClassifier;
use sb_transport::{ChannelSpec, DeviceChannels};

pub use channel::{SimChannel, SimHandle};
pub use device::{SimDevice, SimDeviceConfig, SimError, SimOutput, SimRuleConfig};
pub use device_task::{run_sim_device_task, SimCommand, SimEvent};

/// Build a device with one simulated channel per config, in index order
pub fn sim_device(
    configs: Vec<SimDeviceConfig>,
    classifier: Arc<dyn LineClassifier>,
) -> (DeviceChannels, Vec<SimHandle>) {
    let (channels, handles) = configs
        .into_iter()
        .map(|config| {
            let (channel, handle) = SimChannel::new(config);
            (ChannelSpec::new(channel), handle)
        })
        .unzip();
    (DeviceChannels::new(channels, classifier), handles)
}
