//! Serial port channel using tokio_serial

use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_serial::{ClearBuffer, SerialPort, SerialPortBuilderExt, SerialStream};
use tracing::{debug, info};

use crate::channel::{Channel, ChannelCommand};
use crate::error::ChannelError;

/// Default line speed
pub const DEFAULT_BAUD_RATE: u32 = 115_200;

const XON: u8 = 0x11;
const XOFF: u8 = 0x13;

/// Channel over a local serial port
#[derive(Debug)]
pub struct SerialChannel {
    port_name: String,
    baud_rate: u32,
    stream: Option<SerialStream>,
}

impl SerialChannel {
    /// Describe a port to open later
    pub fn new(port_name: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port_name: port_name.into(),
            baud_rate,
            stream: None,
        }
    }

    /// Current line speed
    pub fn baud_rate(&self) -> u32 {
        self.baud_rate
    }

    fn stream(&mut self) -> Result<&mut SerialStream, ChannelError> {
        self.stream
            .as_mut()
            .ok_or_else(|| ChannelError::NotOpen(self.port_name.clone()))
    }
}

#[async_trait]
impl Channel for SerialChannel {
    fn name(&self) -> &str {
        &self.port_name
    }

    async fn open(&mut self) -> Result<(), ChannelError> {
        if self.stream.is_some() {
            return Ok(());
        }
        let stream = tokio_serial::new(&self.port_name, self.baud_rate)
            .timeout(Duration::from_millis(100))
            .open_native_async()
            .map_err(|e| ChannelError::OpenFailed {
                channel: self.port_name.clone(),
                reason: e.to_string(),
            })?;
        info!("Opened {} at {} baud", self.port_name, self.baud_rate);
        self.stream = Some(stream);
        Ok(())
    }

    async fn close(&mut self) -> Result<(), ChannelError> {
        if self.stream.take().is_some() {
            debug!("Closed {}", self.port_name);
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, ChannelError> {
        let name = self.port_name.clone();
        match self.stream()?.read(buf).await {
            Ok(0) => Err(ChannelError::Disconnected(name)),
            Ok(n) => Ok(n),
            Err(e) => Err(ChannelError::io(&name, e)),
        }
    }

    async fn write(&mut self, data: &[u8]) -> Result<(), ChannelError> {
        let name = self.port_name.clone();
        let stream = self.stream()?;
        stream
            .write_all(data)
            .await
            .map_err(|e| ChannelError::io(&name, e))?;
        stream.flush().await.map_err(|e| ChannelError::io(&name, e))
    }

    async fn custom(&mut self, command: &ChannelCommand) -> Result<(), ChannelError> {
        match command {
            ChannelCommand::FlushBuffers => {
                self.stream()?.clear(ClearBuffer::All)?;
            }
            ChannelCommand::SendBreak(duration) => {
                self.stream()?.set_break()?;
                tokio::time::sleep(*duration).await;
                self.stream()?.clear_break()?;
            }
            ChannelCommand::SendXon => self.write(&[XON]).await?,
            ChannelCommand::SendXoff => self.write(&[XOFF]).await?,
            ChannelCommand::SetBaudRate(baud) => {
                self.stream()?.set_baud_rate(*baud)?;
                self.baud_rate = *baud;
            }
            ChannelCommand::Flash(_) | ChannelCommand::Reset => {
                return Err(ChannelError::Unsupported {
                    channel: self.port_name.clone(),
                    command: command.to_string(),
                })
            }
        }
        debug!("{}: {}", self.port_name, command);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_closed_port_refuses_io() {
        let mut channel = SerialChannel::new("/dev/does-not-exist", DEFAULT_BAUD_RATE);
        assert!(!channel.is_open());
        assert!(matches!(
            channel.write(b"x").await,
            Err(ChannelError::NotOpen(_))
        ));
        assert!(matches!(
            channel.custom(&ChannelCommand::FlushBuffers).await,
            Err(ChannelError::NotOpen(_))
        ));
    }

    #[tokio::test]
    async fn test_missing_port_fails_to_open() {
        let mut channel = SerialChannel::new("/dev/does-not-exist", DEFAULT_BAUD_RATE);
        assert!(matches!(
            channel.open().await,
            Err(ChannelError::OpenFailed { .. })
        ));
    }

    #[tokio::test]
    async fn test_flash_unsupported() {
        let mut channel = SerialChannel::new("/dev/does-not-exist", 9600);
        let err = channel.custom(&ChannelCommand::Reset).await.unwrap_err();
        assert!(err.is_unsupported());
        assert_eq!(channel.baud_rate(), 9600);
    }
}
