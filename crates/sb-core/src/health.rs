//! Health checks and recovery
//!
//! A [`HealthCheckEngine`] runs an ordered list of [`HealthCheck`]s against a
//! device. When a check fails and a [`Recovery`] is registered for the
//! failure kind, the engine runs it and resumes at the failed check rather
//! than starting over. Recoveries per call are bounded by a budget
//! (default 1); running out of budget is fatal.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{info, warn};

/// Boxed future returned by closure-based checks and recoveries
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Default number of recoveries allowed per `check_device_ready` call
pub const DEFAULT_RECOVERY_BUDGET: usize = 1;

/// Why a device is not ready
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckErrorKind {
    /// A channel is not open or the device is not reachable
    DeviceNotConnected,
    /// The device did not answer a command in time
    DeviceNotResponsive,
    /// The device has not finished booting
    NotBootupComplete,
    /// No log output arrived
    NoLogsStreaming,
    /// The device is reachable but in an unusable state
    BadState,
    /// Anything else, named by the check
    Other(String),
}

impl fmt::Display for CheckErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CheckErrorKind::DeviceNotConnected => write!(f, "device not connected"),
            CheckErrorKind::DeviceNotResponsive => write!(f, "device not responsive"),
            CheckErrorKind::NotBootupComplete => write!(f, "bootup not complete"),
            CheckErrorKind::NoLogsStreaming => write!(f, "no logs streaming"),
            CheckErrorKind::BadState => write!(f, "bad state"),
            CheckErrorKind::Other(name) => write!(f, "{}", name),
        }
    }
}

/// A health check failed
///
/// Checks only need to fill in `kind` and `message`; the engine records the
/// device, the check name and the checks that passed before it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{device} failed {check} ({kind}): {message}")]
pub struct CheckDeviceReadyError {
    /// Device name
    pub device: String,
    /// Name of the failed check
    pub check: String,
    /// Failure category, used to pick a recovery
    pub kind: CheckErrorKind,
    /// Details
    pub message: String,
    /// Checks that passed before this one, in order
    pub checks_passed: Vec<String>,
}

impl CheckDeviceReadyError {
    /// A failure with no device or check recorded yet
    pub fn new(kind: CheckErrorKind, message: impl Into<String>) -> Self {
        Self {
            device: String::new(),
            check: String::new(),
            kind,
            message: message.into(),
            checks_passed: Vec::new(),
        }
    }
}

/// Errors returned by [`HealthCheckEngine`]
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HealthCheckError {
    /// A check failed and was not (or could not be) recovered
    #[error(transparent)]
    Check(CheckDeviceReadyError),

    /// Checks kept failing after the recovery budget was spent
    #[error("{} unrecoverable after {attempts} recovery attempt(s): {source}", .source.device)]
    Unrecoverable {
        /// Recoveries run during this call
        attempts: usize,
        /// The last failure
        source: CheckDeviceReadyError,
    },
}

impl HealthCheckError {
    /// The underlying check failure
    pub fn check_error(&self) -> &CheckDeviceReadyError {
        match self {
            HealthCheckError::Check(e) => e,
            HealthCheckError::Unrecoverable { source, .. } => source,
        }
    }
}

/// A named readiness check
#[async_trait]
pub trait HealthCheck<C: Sync>: Send + Sync {
    /// Name used in reports and errors
    fn name(&self) -> &str;

    /// Run the check
    async fn run(&self, device: &C) -> Result<(), CheckDeviceReadyError>;
}

/// Corrective action for a failed check
#[async_trait]
pub trait Recovery<C: Sync>: Send + Sync {
    /// Try to fix whatever `error` describes
    async fn recover(&self, device: &C, error: &CheckDeviceReadyError) -> Result<(), CheckDeviceReadyError>;
}

/// A check built from a closure, see [`check_fn`]
pub struct FnCheck<F> {
    name: String,
    f: F,
}

/// Wrap a closure returning a boxed future as a [`HealthCheck`]
pub fn check_fn<C, F>(name: impl Into<String>, f: F) -> FnCheck<F>
where
    C: Sync,
    F: for<'a> Fn(&'a C) -> BoxFuture<'a, Result<(), CheckDeviceReadyError>> + Send + Sync,
{
    FnCheck {
        name: name.into(),
        f,
    }
}

#[async_trait]
impl<C, F> HealthCheck<C> for FnCheck<F>
where
    C: Sync,
    F: for<'a> Fn(&'a C) -> BoxFuture<'a, Result<(), CheckDeviceReadyError>> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, device: &C) -> Result<(), CheckDeviceReadyError> {
        (self.f)(device).await
    }
}

/// A recovery built from a closure, see [`recovery_fn`]
pub struct FnRecovery<F> {
    f: F,
}

/// Wrap a closure returning a boxed future as a [`Recovery`]
pub fn recovery_fn<C, F>(f: F) -> FnRecovery<F>
where
    C: Sync,
    F: for<'a> Fn(&'a C, &'a CheckDeviceReadyError) -> BoxFuture<'a, Result<(), CheckDeviceReadyError>>
        + Send
        + Sync,
{
    FnRecovery { f }
}

#[async_trait]
impl<C, F> Recovery<C> for FnRecovery<F>
where
    C: Sync,
    F: for<'a> Fn(&'a C, &'a CheckDeviceReadyError) -> BoxFuture<'a, Result<(), CheckDeviceReadyError>>
        + Send
        + Sync,
{
    async fn recover(&self, device: &C, error: &CheckDeviceReadyError) -> Result<(), CheckDeviceReadyError> {
        (self.f)(device, error).await
    }
}

/// Outcome of one check run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthOutcome {
    /// The check passed
    Passed,
    /// The check failed and was not recovered
    Failed(CheckErrorKind),
    /// The check failed and a recovery ran successfully; it is run again next
    Recovered(CheckErrorKind),
}

/// One line of a [`HealthReport`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthCheckEntry {
    /// Check name
    pub check: String,
    /// What happened
    pub outcome: HealthOutcome,
    /// How long the check took, recovery excluded
    pub duration: Duration,
}

/// Every check run during one `check_device_ready` call, in order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HealthReport {
    /// Entries in run order; a recovered check appears again when re-run
    pub entries: Vec<HealthCheckEntry>,
}

impl HealthReport {
    /// Names of the checks that passed, in order
    pub fn passed(&self) -> Vec<&str> {
        self.entries
            .iter()
            .filter(|e| e.outcome == HealthOutcome::Passed)
            .map(|e| e.check.as_str())
            .collect()
    }

    /// Number of recoveries that ran successfully
    pub fn recoveries(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| matches!(e.outcome, HealthOutcome::Recovered(_)))
            .count()
    }
}

/// How much readiness work `make_device_ready` does
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadySetting {
    /// Run checks and recover failures
    #[default]
    On,
    /// Skip checks entirely
    Off,
    /// Run checks but never recover
    CheckOnly,
}

impl FromStr for ReadySetting {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "on" => Ok(ReadySetting::On),
            "off" => Ok(ReadySetting::Off),
            "check_only" => Ok(ReadySetting::CheckOnly),
            other => Err(format!(
                "invalid ready setting {:?}: expected on, off or check_only",
                other
            )),
        }
    }
}

/// Ordered health checks with per-kind recovery
pub struct HealthCheckEngine<C: Sync> {
    device_name: String,
    checks: Vec<Box<dyn HealthCheck<C>>>,
    recoveries: Vec<(CheckErrorKind, Box<dyn Recovery<C>>)>,
    default_recovery: Option<Box<dyn Recovery<C>>>,
    recovery_budget: usize,
}

impl<C: Sync> fmt::Debug for HealthCheckEngine<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HealthCheckEngine")
            .field("device_name", &self.device_name)
            .field("checks", &self.check_names())
            .field("recovery_budget", &self.recovery_budget)
            .finish()
    }
}

impl<C: Sync> HealthCheckEngine<C> {
    /// An engine with no checks
    pub fn new(device_name: impl Into<String>) -> Self {
        Self {
            device_name: device_name.into(),
            checks: Vec::new(),
            recoveries: Vec::new(),
            default_recovery: None,
            recovery_budget: DEFAULT_RECOVERY_BUDGET,
        }
    }

    /// Append a check
    pub fn with_check(mut self, check: impl HealthCheck<C> + 'static) -> Self {
        self.checks.push(Box::new(check));
        self
    }

    /// Register the recovery for failures of `kind`, replacing any earlier one
    pub fn with_recovery(mut self, kind: CheckErrorKind, recovery: impl Recovery<C> + 'static) -> Self {
        self.recoveries.retain(|(k, _)| *k != kind);
        self.recoveries.push((kind, Box::new(recovery)));
        self
    }

    /// Recovery for kinds without a specific one
    pub fn with_default_recovery(mut self, recovery: impl Recovery<C> + 'static) -> Self {
        self.default_recovery = Some(Box::new(recovery));
        self
    }

    /// Maximum recoveries per `check_device_ready` call
    pub fn recovery_budget(mut self, budget: usize) -> Self {
        self.recovery_budget = budget;
        self
    }

    /// Check names in run order
    pub fn check_names(&self) -> Vec<&str> {
        self.checks.iter().map(|c| c.name()).collect()
    }

    fn recovery_for(&self, kind: &CheckErrorKind) -> Option<&dyn Recovery<C>> {
        self.recoveries
            .iter()
            .find(|(k, _)| k == kind)
            .map(|(_, r)| r.as_ref())
            .or(self.default_recovery.as_deref())
    }

    /// Run every check in order
    ///
    /// With `allow_recovery`, a failure with a registered recovery runs it
    /// and resumes at the failed check. A failure without one is returned
    /// unchanged, as is a failure whose recovery itself fails.
    pub async fn check_device_ready(
        &self,
        device: &C,
        allow_recovery: bool,
    ) -> Result<HealthReport, HealthCheckError> {
        let mut report = HealthReport::default();
        let mut passed: Vec<String> = Vec::new();
        let mut attempts = 0;
        let mut next = 0;

        while let Some(check) = self.checks.get(next) {
            let start = Instant::now();
            let result = check.run(device).await;
            let duration = start.elapsed();

            let mut error = match result {
                Ok(()) => {
                    report.entries.push(HealthCheckEntry {
                        check: check.name().to_string(),
                        outcome: HealthOutcome::Passed,
                        duration,
                    });
                    passed.push(check.name().to_string());
                    next += 1;
                    continue;
                }
                Err(error) => error,
            };

            if error.device.is_empty() {
                error.device = self.device_name.clone();
            }
            if error.check.is_empty() {
                error.check = check.name().to_string();
            }
            error.checks_passed = passed.clone();
            warn!("{}", error);

            report.entries.push(HealthCheckEntry {
                check: check.name().to_string(),
                outcome: HealthOutcome::Failed(error.kind.clone()),
                duration,
            });

            let recovery = match self.recovery_for(&error.kind) {
                Some(recovery) if allow_recovery => recovery,
                _ => return Err(HealthCheckError::Check(error)),
            };
            if attempts >= self.recovery_budget {
                return Err(HealthCheckError::Unrecoverable {
                    attempts,
                    source: error,
                });
            }

            attempts += 1;
            info!(
                "{} recovering from {} (attempt {} of {})",
                self.device_name, error.kind, attempts, self.recovery_budget
            );
            if let Err(recovery_error) = recovery.recover(device, &error).await {
                warn!(
                    "{} recovery for {} failed: {}",
                    self.device_name, error.check, recovery_error.message
                );
                return Err(HealthCheckError::Check(error));
            }
            if let Some(entry) = report.entries.last_mut() {
                entry.outcome = HealthOutcome::Recovered(error.kind);
            }
        }

        info!(
            "{} passed {} health check(s)",
            self.device_name,
            passed.len()
        );
        Ok(report)
    }

    /// Run checks according to `setting`
    pub async fn make_device_ready(
        &self,
        device: &C,
        setting: ReadySetting,
    ) -> Result<HealthReport, HealthCheckError> {
        match setting {
            ReadySetting::Off => {
                info!("{} skipping health checks", self.device_name);
                Ok(HealthReport::default())
            }
            ReadySetting::CheckOnly => self.check_device_ready(device, false).await,
            ReadySetting::On => self.check_device_ready(device, true).await,
        }
    }
}
