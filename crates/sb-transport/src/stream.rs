//! Channels over generic async streams and TCP sockets

use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info};

use crate::channel::Channel;
use crate::error::ChannelError;

/// Default TCP connect timeout
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

async fn read_from<T>(name: &str, io: &mut Option<T>, buf: &mut [u8]) -> Result<usize, ChannelError>
where
    T: AsyncRead + Unpin + Send,
{
    let stream = io
        .as_mut()
        .ok_or_else(|| ChannelError::NotOpen(name.to_string()))?;
    match stream.read(buf).await {
        Ok(0) => Err(ChannelError::Disconnected(name.to_string())),
        Ok(n) => Ok(n),
        Err(e) => Err(ChannelError::io(name, e)),
    }
}

async fn write_to<T>(name: &str, io: &mut Option<T>, data: &[u8]) -> Result<(), ChannelError>
where
    T: AsyncWrite + Unpin + Send,
{
    let stream = io
        .as_mut()
        .ok_or_else(|| ChannelError::NotOpen(name.to_string()))?;
    stream
        .write_all(data)
        .await
        .map_err(|e| ChannelError::io(name, e))?;
    stream.flush().await.map_err(|e| ChannelError::io(name, e))
}

/// Channel over an already connected stream
///
/// Useful for in-process rigs built on `tokio::io::duplex()`. The stream is
/// handed over at construction, so once closed the channel cannot be
/// reopened.
#[derive(Debug)]
pub struct StreamChannel<T> {
    name: String,
    io: Option<T>,
    open: bool,
}

impl<T> StreamChannel<T>
where
    T: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Wrap a connected stream
    pub fn new(name: impl Into<String>, io: T) -> Self {
        Self {
            name: name.into(),
            io: Some(io),
            open: false,
        }
    }
}

#[async_trait]
impl<T> Channel for StreamChannel<T>
where
    T: AsyncRead + AsyncWrite + Unpin + Send + std::fmt::Debug,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn open(&mut self) -> Result<(), ChannelError> {
        if self.io.is_none() {
            return Err(ChannelError::OpenFailed {
                channel: self.name.clone(),
                reason: "stream was closed and cannot be reopened".into(),
            });
        }
        self.open = true;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), ChannelError> {
        self.open = false;
        if let Some(mut io) = self.io.take() {
            let _ = io.shutdown().await;
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open
    }

    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, ChannelError> {
        if !self.open {
            return Err(ChannelError::NotOpen(self.name.clone()));
        }
        read_from(&self.name, &mut self.io, buf).await
    }

    async fn write(&mut self, data: &[u8]) -> Result<(), ChannelError> {
        if !self.open {
            return Err(ChannelError::NotOpen(self.name.clone()));
        }
        write_to(&self.name, &mut self.io, data).await
    }
}

/// Channel over a TCP connection
#[derive(Debug)]
pub struct TcpChannel {
    name: String,
    address: String,
    connect_timeout: Duration,
    stream: Option<TcpStream>,
}

impl TcpChannel {
    /// Create an unopened channel to `host:port`
    pub fn new(address: impl Into<String>) -> Self {
        let address = address.into();
        Self {
            name: format!("tcp:{}", address),
            address,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            stream: None,
        }
    }

    /// Set the connect timeout
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

#[async_trait]
impl Channel for TcpChannel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn open(&mut self) -> Result<(), ChannelError> {
        if self.stream.is_some() {
            return Ok(());
        }
        debug!("Connecting to {}", self.address);
        let connect = TcpStream::connect(&self.address);
        let stream = match tokio::time::timeout(self.connect_timeout, connect).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(ChannelError::OpenFailed {
                    channel: self.name.clone(),
                    reason: e.to_string(),
                })
            }
            Err(_) => {
                return Err(ChannelError::OpenFailed {
                    channel: self.name.clone(),
                    reason: format!("connect timed out after {:?}", self.connect_timeout),
                })
            }
        };
        let _ = stream.set_nodelay(true);
        info!("Connected to {}", self.address);
        self.stream = Some(stream);
        Ok(())
    }

    async fn close(&mut self) -> Result<(), ChannelError> {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown().await;
            debug!("Closed {}", self.name);
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, ChannelError> {
        read_from(&self.name, &mut self.stream, buf).await
    }

    async fn write(&mut self, data: &[u8]) -> Result<(), ChannelError> {
        write_to(&self.name, &mut self.stream, data).await
    }
}
