//! Built-in health checks for a switchboard-backed device
//!
//! Each check works on anything that can lend a [`Switchboard`], so device
//! wrappers can carry their own state next to it and still reuse these.

use std::time::Duration;

use async_trait::async_trait;
use sb_protocol::{ExpectSpec, LineFilter};
use tracing::debug;

use crate::config::SendOptions;
use crate::health::{CheckDeviceReadyError, CheckErrorKind, HealthCheck, Recovery};
use crate::switchboard::Switchboard;

/// Default wait for [`Responsive`] and [`LogsStreaming`]
pub const DEFAULT_CHECK_TIMEOUT: Duration = Duration::from_secs(5);

/// Every channel is open
#[derive(Debug, Clone, Copy, Default)]
pub struct ChannelsOpen;

#[async_trait]
impl<C: AsRef<Switchboard> + Sync> HealthCheck<C> for ChannelsOpen {
    fn name(&self) -> &str {
        "check_channels_open"
    }

    async fn run(&self, device: &C) -> Result<(), CheckDeviceReadyError> {
        let switchboard = device.as_ref();
        switchboard.health().map_err(|e| {
            CheckDeviceReadyError::new(CheckErrorKind::DeviceNotConnected, e.to_string())
        })?;

        let closed: Vec<String> = (0..switchboard.channel_count())
            .filter_map(|index| {
                let state = switchboard.channel_state(index).ok()?;
                (!state.is_open()).then(|| format!("channel {} is {}", index, state))
            })
            .collect();
        if closed.is_empty() {
            Ok(())
        } else {
            Err(CheckDeviceReadyError::new(
                CheckErrorKind::DeviceNotConnected,
                closed.join(", "),
            ))
        }
    }
}

/// The device answers `command` with output matching `pattern`
#[derive(Debug, Clone)]
pub struct Responsive {
    command: String,
    pattern: String,
    channel: usize,
    timeout: Duration,
}

impl Responsive {
    /// Send `command` on channel 0 and wait for `pattern`
    pub fn new(command: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            pattern: pattern.into(),
            channel: 0,
            timeout: DEFAULT_CHECK_TIMEOUT,
        }
    }

    /// Use another channel
    pub fn channel(mut self, channel: usize) -> Self {
        self.channel = channel;
        self
    }

    /// How long to wait for the answer
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl<C: AsRef<Switchboard> + Sync> HealthCheck<C> for Responsive {
    fn name(&self) -> &str {
        "check_responsive"
    }

    async fn run(&self, device: &C) -> Result<(), CheckDeviceReadyError> {
        let not_responsive =
            |message: String| CheckDeviceReadyError::new(CheckErrorKind::DeviceNotResponsive, message);

        let spec = ExpectSpec::new([self.pattern.as_str()])
            .map_err(|e| CheckDeviceReadyError::new(CheckErrorKind::BadState, e.to_string()))?
            .channel(self.channel)
            .timeout(self.timeout);
        let result = device
            .as_ref()
            .send_and_expect(&self.command, self.channel, &spec, &SendOptions::default())
            .await
            .map_err(|e| not_responsive(e.to_string()))?;

        if result.matched() {
            return Ok(());
        }
        Err(not_responsive(match result.interruption {
            Some(interruption) => format!("{:?} interrupted: {}", self.command, interruption),
            None => format!(
                "no answer to {:?} within {:.3}s",
                self.command,
                result.elapsed.as_secs_f64()
            ),
        }))
    }
}

/// At least one log line arrives on `channel` within the timeout
#[derive(Debug, Clone)]
pub struct LogsStreaming {
    channel: usize,
    timeout: Duration,
}

impl LogsStreaming {
    pub fn new(channel: usize, timeout: Duration) -> Self {
        Self { channel, timeout }
    }
}

#[async_trait]
impl<C: AsRef<Switchboard> + Sync> HealthCheck<C> for LogsStreaming {
    fn name(&self) -> &str {
        "check_logs_streaming"
    }

    async fn run(&self, device: &C) -> Result<(), CheckDeviceReadyError> {
        let no_logs =
            |message: String| CheckDeviceReadyError::new(CheckErrorKind::NoLogsStreaming, message);

        let spec = ExpectSpec::new([".+"])
            .map_err(|e| no_logs(e.to_string()))?
            .channel(self.channel)
            .timeout(self.timeout)
            .search_window(0)
            .line_filter(LineFilter::Log);
        let result = device
            .as_ref()
            .expect(&spec)
            .await
            .map_err(|e| no_logs(e.to_string()))?;

        if result.matched() {
            Ok(())
        } else {
            Err(no_logs(format!(
                "no log output on channel {} for {:.3}s",
                self.channel,
                result.elapsed.as_secs_f64()
            )))
        }
    }
}

/// Close and reopen every channel
#[derive(Debug, Clone, Copy, Default)]
pub struct ReopenChannels;

#[async_trait]
impl<C: AsRef<Switchboard> + Sync> Recovery<C> for ReopenChannels {
    async fn recover(&self, device: &C, error: &CheckDeviceReadyError) -> Result<(), CheckDeviceReadyError> {
        let switchboard = device.as_ref();
        debug!(
            "Reopening channels of {} after {}",
            switchboard.device_name(),
            error.kind
        );
        let failed = |e: crate::error::SwitchboardError| {
            CheckDeviceReadyError::new(CheckErrorKind::DeviceNotConnected, e.to_string())
        };
        switchboard.close_all_channels().await.map_err(failed)?;
        switchboard.open_all_channels().await.map_err(failed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SwitchboardConfig;
    use crate::health::{HealthCheckEngine, HealthOutcome};
    use sb_protocol::{AllResponse, FilterSet};
    use sb_sim::{sim_device, SimDeviceConfig, SimHandle};
    use std::sync::Arc;

    async fn start(dir: &std::path::Path) -> (Switchboard, SimHandle) {
        let config = SimDeviceConfig::named("dut").respond("status", ["ready"]);
        let (device, mut handles) = sim_device(vec![config], Arc::new(AllResponse));
        let switchboard = Switchboard::new(
            SwitchboardConfig::new("dut", dir.join("dut.txt")),
            device,
            FilterSet::new(),
        )
        .await
        .unwrap();
        (switchboard, handles.remove(0))
    }

    #[tokio::test]
    async fn test_builtin_checks_pass() {
        let dir = tempfile::tempdir().unwrap();
        let (sb, _handle) = start(dir.path()).await;
        let engine = HealthCheckEngine::new("dut")
            .with_check(ChannelsOpen)
            .with_check(Responsive::new("status", "ready").timeout(Duration::from_secs(2)));

        let report = engine.check_device_ready(&sb, true).await.unwrap();
        assert_eq!(
            report.passed(),
            vec!["check_channels_open", "check_responsive"]
        );
        sb.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_reopen_recovers_closed_channel() {
        let dir = tempfile::tempdir().unwrap();
        let (sb, handle) = start(dir.path()).await;
        sb.close_all_channels().await.unwrap();

        let engine = HealthCheckEngine::new("dut")
            .with_check(ChannelsOpen)
            .with_recovery(CheckErrorKind::DeviceNotConnected, ReopenChannels);
        let report = engine.check_device_ready(&sb, true).await.unwrap();
        assert!(matches!(
            report.entries[0].outcome,
            HealthOutcome::Recovered(CheckErrorKind::DeviceNotConnected)
        ));
        assert_eq!(report.entries[1].outcome, HealthOutcome::Passed);
        assert_eq!(handle.open_count(), 2);
        sb.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_silent_device_has_no_logs() {
        let dir = tempfile::tempdir().unwrap();
        let (sb, _handle) = start(dir.path()).await;
        let engine = HealthCheckEngine::new("dut")
            .with_check(LogsStreaming::new(0, Duration::from_millis(200)));

        let err = engine.check_device_ready(&sb, false).await.unwrap_err();
        assert_eq!(err.check_error().kind, CheckErrorKind::NoLogsStreaming);
        assert_eq!(err.check_error().check, "check_logs_streaming");
        sb.close().await.unwrap();
    }
}
