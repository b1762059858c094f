//! Communication types
//!
//! A communication type turns a device address plus options into the list
//! of channels the device needs and the classifier that tells its responses
//! from its logs. The switchboard is built from that output and never learns
//! which transport is underneath.
//!
//! Types are looked up in an explicit [`CommunicationRegistry`] that the
//! caller builds once and passes in; there is no process-wide registry.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use sb_protocol::{AllUnknown, Framer, LineClassifier, PortLog, RegexLog};

use crate::channel::Channel;
use crate::discovery::{serial_addresses, DiscoveryFilter};
use crate::error::ChannelError;
use crate::process::ProcessChannel;
use crate::serial::{SerialChannel, DEFAULT_BAUD_RATE};
use crate::stream::TcpChannel;

/// Default ssh options: no pseudo-tty, key-based login only, short connect timeout
pub const DEFAULT_SSH_OPTIONS: &[&str] = &[
    "-T",
    "-oPasswordAuthentication=no",
    "-oStrictHostKeyChecking=no",
    "-oBatchMode=yes",
    "-oConnectTimeout=3",
];

/// Default log command for ssh devices
pub const DEFAULT_SSH_LOG_CMD: &str = "tail -F -n /var/log/messages";

/// Default log command for adb devices
pub const DEFAULT_ADB_LOG_CMD: &str = "logcat -v threadtime";

/// Options shared by the built-in communication types
///
/// Each type reads only the options it understands.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommsOptions {
    /// Serial line speed
    pub baud_rate: Option<u32>,
    /// Lines matching this are logs (serial)
    pub log_line_regex: Option<String>,
    /// Extract log lines embedded in responses with this pattern (group 1)
    pub interwoven_log_regex: Option<String>,
    /// Command streaming device logs (ssh, adb)
    pub log_cmd: Option<String>,
    /// Command opening the interactive shell (adb)
    pub shell_cmd: Option<String>,
    /// Extra log stream command (adb)
    pub event_log_cmd: Option<String>,
    /// Login user (ssh)
    pub username: Option<String>,
    /// Override the transport tool's options (ssh)
    pub args: Option<Vec<String>>,
    /// Path of the transport executable (adb, docker)
    pub executable: Option<String>,
}

/// How to reach one device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Registered communication type name, e.g. `serial` or `ssh`
    pub communication_type: String,
    /// Type-specific address: port path, host, adb serial, command line
    pub address: String,
    /// Type-specific options
    #[serde(default)]
    pub options: CommsOptions,
}

impl ChannelConfig {
    /// Address a device through `communication_type`
    pub fn new(communication_type: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            communication_type: communication_type.into(),
            address: address.into(),
            options: CommsOptions::default(),
        }
    }

    /// Replace the options
    pub fn with_options(mut self, options: CommsOptions) -> Self {
        self.options = options;
        self
    }
}

/// One unopened channel and how to frame its bytes
#[derive(Debug)]
pub struct ChannelSpec {
    /// The channel; opened by its worker
    pub channel: Box<dyn Channel>,
    /// Framing policy for its output
    pub framer: Framer,
}

impl ChannelSpec {
    /// Newline-framed channel
    pub fn new(channel: impl Channel + 'static) -> Self {
        Self {
            channel: Box::new(channel),
            framer: Framer::default(),
        }
    }

    /// Replace the framing policy
    pub fn with_framer(mut self, framer: Framer) -> Self {
        self.framer = framer;
        self
    }
}

/// Everything a switchboard needs for one device
#[derive(Debug)]
pub struct DeviceChannels {
    /// Channels in index order
    pub channels: Vec<ChannelSpec>,
    /// Classifier shared by all channels
    pub classifier: Arc<dyn LineClassifier>,
}

impl DeviceChannels {
    /// Bundle channels with a classifier
    pub fn new(channels: Vec<ChannelSpec>, classifier: Arc<dyn LineClassifier>) -> Self {
        Self {
            channels,
            classifier,
        }
    }
}

/// A channel factory for one kind of transport
pub trait CommunicationType: Send + Sync + fmt::Debug {
    /// Registry name
    fn name(&self) -> &str;

    /// Build the unopened channels for `config`
    fn build(&self, config: &ChannelConfig) -> Result<DeviceChannels, ChannelError>;

    /// Addresses of attached devices this type can reach, if it can tell
    fn discover(&self) -> Result<Vec<String>, ChannelError> {
        Ok(Vec::new())
    }
}

fn split_args(line: &str) -> impl Iterator<Item = String> + '_ {
    line.split_whitespace().map(str::to_string)
}

/// Single serial port carrying both responses and logs
#[derive(Debug, Default)]
pub struct SerialComms;

impl CommunicationType for SerialComms {
    fn name(&self) -> &str {
        "serial"
    }

    fn build(&self, config: &ChannelConfig) -> Result<DeviceChannels, ChannelError> {
        let options = &config.options;
        let channel = SerialChannel::new(
            config.address.clone(),
            options.baud_rate.unwrap_or(DEFAULT_BAUD_RATE),
        );
        let framer = match &options.interwoven_log_regex {
            Some(pattern) => Framer::interwoven_log(pattern, false)?,
            None => Framer::default(),
        };
        let classifier: Arc<dyn LineClassifier> = match &options.log_line_regex {
            Some(pattern) => Arc::new(RegexLog::new(pattern)?),
            None => Arc::new(AllUnknown),
        };
        Ok(DeviceChannels::new(
            vec![ChannelSpec::new(channel).with_framer(framer)],
            classifier,
        ))
    }

    fn discover(&self) -> Result<Vec<String>, ChannelError> {
        Ok(serial_addresses(&DiscoveryFilter::default())?
            .into_iter()
            .map(|a| a.port)
            .collect())
    }
}

/// Raw TCP socket, address `host:port`
#[derive(Debug, Default)]
pub struct TcpComms;

impl CommunicationType for TcpComms {
    fn name(&self) -> &str {
        "tcp"
    }

    fn build(&self, config: &ChannelConfig) -> Result<DeviceChannels, ChannelError> {
        if !config.address.contains(':') {
            return Err(ChannelError::InvalidConfig(format!(
                "tcp address {:?} needs host:port",
                config.address
            )));
        }
        Ok(DeviceChannels::new(
            vec![ChannelSpec::new(TcpChannel::new(config.address.clone()))],
            Arc::new(AllUnknown),
        ))
    }
}

/// Shell on channel 0, log stream on channel 1, both over ssh
#[derive(Debug, Default)]
pub struct SshComms;

impl CommunicationType for SshComms {
    fn name(&self) -> &str {
        "ssh"
    }

    fn build(&self, config: &ChannelConfig) -> Result<DeviceChannels, ChannelError> {
        let options = &config.options;
        let mut args: Vec<String> = match &options.args {
            Some(args) => args.clone(),
            None => DEFAULT_SSH_OPTIONS.iter().map(|s| s.to_string()).collect(),
        };
        let user = options.username.as_deref().unwrap_or("root");
        args.push(format!("{}@{}", user, config.address));

        let shell = ProcessChannel::new("ssh", args.clone());
        let log_cmd = options.log_cmd.as_deref().unwrap_or(DEFAULT_SSH_LOG_CMD);
        let logs = ProcessChannel::new("ssh", args.into_iter().chain(split_args(log_cmd)));
        Ok(DeviceChannels::new(
            vec![ChannelSpec::new(shell), ChannelSpec::new(logs)],
            Arc::new(PortLog::new([1])),
        ))
    }
}

/// `adb shell` on channel 0, logcat on channel 1, optional event log on channel 2
#[derive(Debug, Default)]
pub struct AdbComms;

impl CommunicationType for AdbComms {
    fn name(&self) -> &str {
        "adb"
    }

    fn build(&self, config: &ChannelConfig) -> Result<DeviceChannels, ChannelError> {
        let options = &config.options;
        let adb = options.executable.as_deref().unwrap_or("adb");
        let serial = ["-s".to_string(), config.address.clone()];
        let adb_channel = |command: &str| {
            ProcessChannel::new(adb, serial.iter().cloned().chain(split_args(command)))
        };

        let mut channels = vec![
            ChannelSpec::new(adb_channel(options.shell_cmd.as_deref().unwrap_or("shell"))),
            ChannelSpec::new(adb_channel(
                options.log_cmd.as_deref().unwrap_or(DEFAULT_ADB_LOG_CMD),
            )),
        ];
        if let Some(event_log_cmd) = &options.event_log_cmd {
            channels.push(ChannelSpec::new(adb_channel(event_log_cmd)));
        }
        Ok(DeviceChannels::new(channels, Arc::new(PortLog::new([1, 2]))))
    }
}

/// `docker exec` shell on channel 0, `docker logs` on channel 1
#[derive(Debug, Default)]
pub struct DockerComms;

impl CommunicationType for DockerComms {
    fn name(&self) -> &str {
        "docker"
    }

    fn build(&self, config: &ChannelConfig) -> Result<DeviceChannels, ChannelError> {
        let docker = config.options.executable.as_deref().unwrap_or("docker");
        let container = config.address.as_str();
        Ok(DeviceChannels::new(
            vec![
                ChannelSpec::new(ProcessChannel::new(
                    docker,
                    ["exec", "-i", container, "/bin/bash"],
                )),
                ChannelSpec::new(ProcessChannel::new(docker, ["logs", "-f", container])),
            ],
            Arc::new(PortLog::new([1])),
        ))
    }
}

/// Any host program; the address is the full command line
#[derive(Debug, Default)]
pub struct ProcessComms;

impl CommunicationType for ProcessComms {
    fn name(&self) -> &str {
        "process"
    }

    fn build(&self, config: &ChannelConfig) -> Result<DeviceChannels, ChannelError> {
        Ok(DeviceChannels::new(
            vec![ChannelSpec::new(ProcessChannel::from_command_line(
                &config.address,
            )?)],
            Arc::new(AllUnknown),
        ))
    }
}

/// Name → communication type lookup, built once and passed by reference
#[derive(Debug, Default, Clone)]
pub struct CommunicationRegistry {
    types: BTreeMap<String, Arc<dyn CommunicationType>>,
}

impl CommunicationRegistry {
    /// An empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding every built-in type
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(SerialComms);
        registry.register(TcpComms);
        registry.register(SshComms);
        registry.register(AdbComms);
        registry.register(DockerComms);
        registry.register(ProcessComms);
        registry
    }

    /// Add or replace a type under its own name
    pub fn register(&mut self, comms: impl CommunicationType + 'static) {
        self.types.insert(comms.name().to_string(), Arc::new(comms));
    }

    /// Look a type up by name
    pub fn get(&self, name: &str) -> Option<&Arc<dyn CommunicationType>> {
        self.types.get(name)
    }

    /// Registered names, sorted
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.types.keys().map(String::as_str)
    }

    /// Build the channels for `config`
    pub fn build(&self, config: &ChannelConfig) -> Result<DeviceChannels, ChannelError> {
        self.get(&config.communication_type)
            .ok_or_else(|| ChannelError::UnknownCommunicationType(config.communication_type.clone()))?
            .build(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sb_protocol::LineKind;

    fn names(device: &DeviceChannels) -> Vec<String> {
        device
            .channels
            .iter()
            .map(|c| c.channel.name().to_string())
            .collect()
    }

    #[test]
    fn test_registry_defaults() {
        let registry = CommunicationRegistry::with_defaults();
        let names: Vec<_> = registry.names().collect();
        assert_eq!(names, vec!["adb", "docker", "process", "serial", "ssh", "tcp"]);
    }

    #[test]
    fn test_unknown_type() {
        let registry = CommunicationRegistry::with_defaults();
        let err = registry
            .build(&ChannelConfig::new("jtag", "x"))
            .unwrap_err();
        assert!(matches!(err, ChannelError::UnknownCommunicationType(t) if t == "jtag"));
    }

    #[test]
    fn test_ssh_two_channels() {
        let registry = CommunicationRegistry::with_defaults();
        let device = registry
            .build(&ChannelConfig::new("ssh", "10.0.0.2"))
            .unwrap();
        let names = names(&device);
        assert_eq!(names.len(), 2);
        assert!(names[0].ends_with("root@10.0.0.2"));
        assert!(names[1].ends_with("root@10.0.0.2 tail -F -n /var/log/messages"));
        assert_eq!(device.classifier.classify(1, "x"), LineKind::Log);
        assert_eq!(device.classifier.classify(0, "x"), LineKind::Response);
    }

    #[test]
    fn test_adb_event_log_channel() {
        let options = CommsOptions {
            event_log_cmd: Some("logcat -b events".into()),
            ..Default::default()
        };
        let config = ChannelConfig::new("adb", "emulator-5554").with_options(options);
        let device = CommunicationRegistry::with_defaults().build(&config).unwrap();
        assert_eq!(
            names(&device),
            vec![
                "adb -s emulator-5554 shell",
                "adb -s emulator-5554 logcat -v threadtime",
                "adb -s emulator-5554 logcat -b events",
            ]
        );
        assert_eq!(device.classifier.classify(2, "x"), LineKind::Log);
    }

    #[test]
    fn test_serial_log_regex() {
        let options = CommsOptions {
            log_line_regex: Some(r"^\[\d+\]".into()),
            ..Default::default()
        };
        let config = ChannelConfig::new("serial", "/dev/ttyUSB0").with_options(options);
        let device = SerialComms.build(&config).unwrap();
        assert_eq!(names(&device), vec!["/dev/ttyUSB0"]);
        assert_eq!(device.classifier.classify(0, "[1] x"), LineKind::Log);
    }

    #[test]
    fn test_serial_bad_regex() {
        let options = CommsOptions {
            log_line_regex: Some("(".into()),
            ..Default::default()
        };
        let config = ChannelConfig::new("serial", "/dev/ttyUSB0").with_options(options);
        assert!(matches!(
            SerialComms.build(&config),
            Err(ChannelError::Protocol(_))
        ));
    }

    #[test]
    fn test_tcp_requires_port() {
        assert!(TcpComms.build(&ChannelConfig::new("tcp", "localhost")).is_err());
        assert!(TcpComms.build(&ChannelConfig::new("tcp", "localhost:23")).is_ok());
    }

    #[test]
    fn test_process_command_line() {
        let device = ProcessComms
            .build(&ChannelConfig::new("process", "python3 -i"))
            .unwrap();
        assert_eq!(names(&device), vec!["python3 -i"]);
        assert_eq!(device.classifier.classify(0, "x"), LineKind::Unknown);
    }

    #[test]
    fn test_config_from_json() {
        let json = r#"{"communication_type": "serial", "address": "/dev/ttyACM0",
                       "options": {"baud_rate": 9600}}"#;
        let config: ChannelConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.options.baud_rate, Some(9600));
        assert_eq!(config.options.log_cmd, None);
    }
}
