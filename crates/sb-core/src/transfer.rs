//! Moving files onto a device through its shell
//!
//! Works over any channel that runs a POSIX-ish shell: the file is written
//! with a series of `echo -ne` commands and checked with a digest command on
//! the device. The caller is responsible for putting the device into a shell
//! that accepts them.

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use sb_protocol::{ExpectSpec, LineFilter};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::time::Instant;

use crate::config::SendOptions;
use crate::error::SwitchboardError;
use crate::switchboard::Switchboard;

/// Bytes written by each `echo` command
pub const DEFAULT_BYTES_PER_ECHO: usize = 50;

/// How long to wait for the device to acknowledge one transfer command
pub const TRANSFER_COMMAND_TIMEOUT: Duration = Duration::from_secs(10);

/// Digest command used to verify a transferred file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VerifyMethod {
    /// `sha256sum <path>`
    #[default]
    Sha256sum,
}

impl VerifyMethod {
    fn command(&self) -> &'static str {
        match self {
            VerifyMethod::Sha256sum => "sha256sum",
        }
    }

    fn digest_len(&self) -> usize {
        match self {
            VerifyMethod::Sha256sum => 64,
        }
    }

    /// Hex digest of `data`, as the device command prints it
    pub fn digest(&self, data: &[u8]) -> String {
        match self {
            VerifyMethod::Sha256sum => hex::encode(Sha256::digest(data)),
        }
    }
}

impl fmt::Display for VerifyMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.command())
    }
}

impl FromStr for VerifyMethod {
    type Err = SwitchboardError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sha256sum" => Ok(VerifyMethod::Sha256sum),
            other => Err(SwitchboardError::Transfer(format!(
                "unknown verify method {:?}, expected sha256sum",
                other
            ))),
        }
    }
}

/// Shell `echo -ne` argument for `chunk`
fn escape_chunk(chunk: &[u8]) -> String {
    chunk.iter().map(|b| format!("\\x{:02x}", b)).collect()
}

async fn read_source(path: &Path) -> Result<Vec<u8>, SwitchboardError> {
    tokio::fs::read(path).await.map_err(|source| SwitchboardError::Io {
        path: path.to_path_buf(),
        source,
    })
}

impl Switchboard {
    fn ack_spec(&self, pattern: &str) -> Result<ExpectSpec, SwitchboardError> {
        Ok(ExpectSpec::new([pattern])?
            .timeout(TRANSFER_COMMAND_TIMEOUT)
            .line_filter(LineFilter::Response))
    }

    /// Copy `source` to `destination` on the device with `echo` commands
    ///
    /// Each command must be echoed back by the device before the next one
    /// is written.
    pub async fn echo_file_to_transport(
        &self,
        source: impl AsRef<Path>,
        destination: &str,
        channel: usize,
        bytes_per_echo: usize,
    ) -> Result<(), SwitchboardError> {
        let source = source.as_ref();
        self.channel_name(channel)?;
        if bytes_per_echo == 0 {
            return Err(SwitchboardError::Transfer(
                "bytes_per_echo must be greater than 0".to_string(),
            ));
        }
        let data = read_source(source).await?;

        let start = Instant::now();
        self.add_log_note(&format!(
            "starting echo transfer of {} for port {} to {}",
            source.display(),
            channel,
            destination
        ))
        .await?;

        let target = regex::escape(destination);
        let options = SendOptions::default();

        let command = format!("echo -ne > {}", destination);
        let spec = self.ack_spec(&format!("echo -ne > {}", target))?;
        let result = self
            .send_and_expect(&command, channel, &spec, &options)
            .await?;
        if result.timed_out {
            return Err(SwitchboardError::Transfer(format!(
                "unable to create {} on {}, output: {:?}",
                destination,
                self.device_name(),
                result.before
            )));
        }

        let spec = self.ack_spec(&format!(r#"echo -ne ".*" >> {}"#, target))?;
        for chunk in data.chunks(bytes_per_echo) {
            let command = format!(r#"echo -ne "{}" >> {}"#, escape_chunk(chunk), destination);
            let result = self
                .send_and_expect(&command, channel, &spec, &options)
                .await?;
            if result.timed_out {
                return Err(SwitchboardError::Transfer(format!(
                    "unable to append {} byte(s) to {} on {}, output: {:?}",
                    chunk.len(),
                    destination,
                    self.device_name(),
                    result.before
                )));
            }
        }

        self.add_log_note(&format!(
            "finished echo transfer of {} for port {} in {:.3}s",
            source.display(),
            channel,
            start.elapsed().as_secs_f64()
        ))
        .await
    }

    /// Check that `destination` on the device has the same contents as
    /// `source`
    ///
    /// A missing destination is a failed verification, not an error.
    pub async fn verify_file_on_transport(
        &self,
        source: impl AsRef<Path>,
        destination: &str,
        channel: usize,
        method: VerifyMethod,
    ) -> Result<bool, SwitchboardError> {
        let source = source.as_ref();
        self.channel_name(channel)?;
        let host_digest = method.digest(&read_source(source).await?);

        let target = regex::escape(destination);
        let spec = ExpectSpec::new([
            format!(r"([0-9a-fA-F]{{{}}})\s+{}", method.digest_len(), target),
            format!(
                r"(?:can't open '{}'|{}): No such file or directory",
                target, target
            ),
        ])?
        .timeout(TRANSFER_COMMAND_TIMEOUT)
        .line_filter(LineFilter::Response);

        let command = format!("{} {}", method.command(), destination);
        let result = self
            .send_and_expect(&command, channel, &spec, &SendOptions::default())
            .await?;
        if result.timed_out {
            return Err(SwitchboardError::Transfer(format!(
                "unable to verify {} on {} using {}",
                destination,
                self.device_name(),
                method
            )));
        }

        let device_digest = match result.index {
            Some(0) => result.group(1).unwrap_or_default().to_ascii_lowercase(),
            _ => "No such file or directory".to_string(),
        };
        let verified = host_digest == device_digest;
        if verified {
            self.add_log_note(&format!(
                "verification of {} for port {} was successful",
                destination, channel
            ))
            .await?;
        } else {
            self.add_log_note(&format!(
                "verification of {} for port {} failed. The host {} {:?} != device {} {:?}",
                destination, channel, method, host_digest, method, device_digest
            ))
            .await?;
        }
        Ok(verified)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape_chunk() {
        assert_eq!(escape_chunk(b"A\n\xff"), "\\x41\\x0a\\xff");
        assert_eq!(escape_chunk(b""), "");
    }

    #[test]
    fn test_sha256_digest() {
        assert_eq!(
            VerifyMethod::Sha256sum.digest(b"hello\n"),
            "5891b5b522d5df086d0ff0b110fbd9d21bb4fc7163af34d08286a2e846f6be03"
        );
    }

    #[test]
    fn test_verify_method_from_str() {
        assert_eq!(
            "SHA256SUM".parse::<VerifyMethod>().unwrap(),
            VerifyMethod::Sha256sum
        );
        assert!(matches!(
            "md5sum".parse::<VerifyMethod>(),
            Err(SwitchboardError::Transfer(_))
        ));
    }
}
