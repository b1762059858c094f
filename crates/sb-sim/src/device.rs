//! Scripted device model
//!
//! A [`SimDevice`] maps command lines to canned response lines. It holds no
//! I/O; the device task feeds it lines and writes whatever it returns.

use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors building a simulated device
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SimError {
    /// A rule's command pattern failed to compile
    #[error("invalid rule pattern {pattern:?}: {reason}")]
    InvalidRule { pattern: String, reason: String },
}

/// One command → response rule, as configured
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimRuleConfig {
    /// Regex matched against the received command (without line ending)
    pub command: String,
    /// Lines written back; `$1`-style references expand to command captures
    pub responses: Vec<String>,
    /// Delay before the first response line
    #[serde(default)]
    pub delay_ms: u64,
}

/// Configuration for a simulated device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimDeviceConfig {
    /// Display name
    pub name: String,
    /// Lines written when the device boots or is reset
    pub boot_banner: Vec<String>,
    /// Echo every received command before responding
    pub echo: bool,
    /// Rules, tried in order
    pub rules: Vec<SimRuleConfig>,
    /// Lines written for commands no rule matches
    pub unknown_response: Vec<String>,
}

impl Default for SimDeviceConfig {
    fn default() -> Self {
        Self {
            name: "sim".to_string(),
            boot_banner: Vec::new(),
            echo: false,
            rules: Vec::new(),
            unknown_response: Vec::new(),
        }
    }
}

impl SimDeviceConfig {
    /// Empty config with a name
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Add a rule answering immediately
    pub fn respond<I, S>(self, command: &str, responses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.respond_after(command, Duration::ZERO, responses)
    }

    /// Add a rule answering after `delay`
    pub fn respond_after<I, S>(mut self, command: &str, delay: Duration, responses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.rules.push(SimRuleConfig {
            command: command.to_string(),
            responses: responses.into_iter().map(Into::into).collect(),
            delay_ms: delay.as_millis() as u64,
        });
        self
    }

    /// Set the boot banner
    pub fn boot_banner<I, S>(mut self, lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.boot_banner = lines.into_iter().map(Into::into).collect();
        self
    }

    /// Enable or disable echo
    pub fn echo(mut self, echo: bool) -> Self {
        self.echo = echo;
        self
    }
}

#[derive(Debug, Clone)]
struct SimRule {
    command: Regex,
    responses: Vec<String>,
    delay: Duration,
}

/// Output scheduled by the device: wait `delay`, then write `line`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimOutput {
    /// Delay relative to the previous output
    pub delay: Duration,
    /// Text to write, line ending included
    pub line: String,
}

fn with_newline(line: &str) -> String {
    if line.ends_with('\n') {
        line.to_string()
    } else {
        format!("{}\n", line)
    }
}

fn immediate(lines: &[String]) -> Vec<SimOutput> {
    lines
        .iter()
        .map(|l| SimOutput {
            delay: Duration::ZERO,
            line: with_newline(l),
        })
        .collect()
}

/// A scripted device
#[derive(Debug, Clone)]
pub struct SimDevice {
    name: String,
    boot_banner: Vec<String>,
    echo: bool,
    rules: Vec<SimRule>,
    unknown_response: Vec<String>,
    received: Vec<String>,
}

impl SimDevice {
    /// Compile a device from its configuration
    pub fn from_config(config: SimDeviceConfig) -> Result<Self, SimError> {
        let rules = config
            .rules
            .into_iter()
            .map(|rule| {
                let anchored = format!("^(?:{})$", rule.command);
                let command = Regex::new(&anchored).map_err(|e| SimError::InvalidRule {
                    pattern: rule.command.clone(),
                    reason: e.to_string(),
                })?;
                Ok(SimRule {
                    command,
                    responses: rule.responses,
                    delay: Duration::from_millis(rule.delay_ms),
                })
            })
            .collect::<Result<Vec<_>, SimError>>()?;
        Ok(Self {
            name: config.name,
            boot_banner: config.boot_banner,
            echo: config.echo,
            rules,
            unknown_response: config.unknown_response,
            received: Vec::new(),
        })
    }

    /// Device name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Commands received so far, without line endings
    pub fn received(&self) -> &[String] {
        &self.received
    }

    /// Output written on boot or reset
    pub fn boot(&self) -> Vec<SimOutput> {
        immediate(&self.boot_banner)
    }

    /// Handle one received command line
    pub fn handle_line(&mut self, line: &str) -> Vec<SimOutput> {
        let command = line.trim_end_matches(['\r', '\n', '\0']);
        self.received.push(command.to_string());

        let mut out = Vec::new();
        if self.echo {
            out.push(SimOutput {
                delay: Duration::ZERO,
                line: with_newline(command),
            });
        }

        let Some((rule, caps)) = self
            .rules
            .iter()
            .find_map(|rule| Some((rule, rule.command.captures(command)?)))
        else {
            out.extend(immediate(&self.unknown_response));
            return out;
        };

        for (i, template) in rule.responses.iter().enumerate() {
            let mut line = String::new();
            caps.expand(template, &mut line);
            out.push(SimOutput {
                delay: if i == 0 { rule.delay } else { Duration::ZERO },
                line: with_newline(&line),
            });
        }
        out
    }
}
