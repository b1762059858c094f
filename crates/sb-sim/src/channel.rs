//! A [`Channel`] backed by a simulated device
//!
//! Every `open()` creates a fresh in-memory stream and spawns a device task
//! on the far end, so the channel can be closed and reopened like a real
//! port. A [`SimHandle`] lets tests drive the device from outside.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use sb_transport::{Channel, ChannelCommand, ChannelError};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

use crate::device::{SimDevice, SimDeviceConfig};
use crate::device_task::{run_sim_device_task, SimCommand, SimEvent};

const STREAM_CAPACITY: usize = 4096;
const COMMAND_CAPACITY: usize = 64;
const EVENT_CAPACITY: usize = 256;

#[derive(Debug)]
struct Shared {
    cmd_tx: Mutex<Option<mpsc::Sender<SimCommand>>>,
    event_tx: broadcast::Sender<SimEvent>,
    unplugged: AtomicBool,
    opens: AtomicUsize,
}

impl Shared {
    fn sender(&self) -> Option<mpsc::Sender<SimCommand>> {
        self.cmd_tx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn set_sender(&self, tx: Option<mpsc::Sender<SimCommand>>) {
        *self
            .cmd_tx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = tx;
    }
}

/// Remote control for a simulated device
#[derive(Debug, Clone)]
pub struct SimHandle {
    shared: Arc<Shared>,
}

impl SimHandle {
    /// Write an unsolicited line from the device
    ///
    /// Returns false if the device is not running.
    pub async fn emit(&self, line: impl Into<String>) -> bool {
        match self.shared.sender() {
            Some(tx) => tx.send(SimCommand::Emit(line.into())).await.is_ok(),
            None => false,
        }
    }

    /// Drop the device's stream, as if the cable were pulled
    pub async fn disconnect(&self) {
        if let Some(tx) = self.shared.sender() {
            let _ = tx.send(SimCommand::Disconnect).await;
        }
    }

    /// Make subsequent opens fail (or succeed again)
    pub fn set_unplugged(&self, unplugged: bool) {
        self.shared.unplugged.store(unplugged, Ordering::SeqCst);
    }

    /// Number of successful opens so far
    pub fn open_count(&self) -> usize {
        self.shared.opens.load(Ordering::SeqCst)
    }

    /// Subscribe to device observations
    pub fn subscribe(&self) -> broadcast::Receiver<SimEvent> {
        self.shared.event_tx.subscribe()
    }
}

/// Channel to a simulated device
#[derive(Debug)]
pub struct SimChannel {
    name: String,
    config: SimDeviceConfig,
    shared: Arc<Shared>,
    io: Option<DuplexStream>,
}

impl SimChannel {
    /// Create an unopened channel and the handle that drives its device
    pub fn new(config: SimDeviceConfig) -> (Self, SimHandle) {
        let (event_tx, _) = broadcast::channel(EVENT_CAPACITY);
        let shared = Arc::new(Shared {
            cmd_tx: Mutex::new(None),
            event_tx,
            unplugged: AtomicBool::new(false),
            opens: AtomicUsize::new(0),
        });
        let channel = Self {
            name: format!("sim:{}", config.name),
            config,
            shared: shared.clone(),
            io: None,
        };
        (channel, SimHandle { shared })
    }

    async fn command(&self, command: SimCommand) -> Result<(), ChannelError> {
        let tx = self
            .shared
            .sender()
            .ok_or_else(|| ChannelError::NotOpen(self.name.clone()))?;
        tx.send(command)
            .await
            .map_err(|_| ChannelError::Disconnected(self.name.clone()))
    }
}

#[async_trait]
impl Channel for SimChannel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn open(&mut self) -> Result<(), ChannelError> {
        if self.io.is_some() {
            return Ok(());
        }
        if self.shared.unplugged.load(Ordering::SeqCst) {
            return Err(ChannelError::OpenFailed {
                channel: self.name.clone(),
                reason: "device unplugged".into(),
            });
        }
        let device =
            SimDevice::from_config(self.config.clone()).map_err(|e| ChannelError::OpenFailed {
                channel: self.name.clone(),
                reason: e.to_string(),
            })?;

        let (near, far) = tokio::io::duplex(STREAM_CAPACITY);
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CAPACITY);
        let event_tx = self.shared.event_tx.clone();
        let name = self.name.clone();
        tokio::spawn(async move {
            if let Err(e) = run_sim_device_task(far, device, cmd_rx, event_tx).await {
                warn!("Simulated device {} failed: {}", name, e);
            }
        });

        self.shared.set_sender(Some(cmd_tx));
        self.shared.opens.fetch_add(1, Ordering::SeqCst);
        self.io = Some(near);
        debug!("Opened {}", self.name);
        Ok(())
    }

    async fn close(&mut self) -> Result<(), ChannelError> {
        if let Some(tx) = self.shared.sender() {
            let _ = tx.try_send(SimCommand::Shutdown);
        }
        self.shared.set_sender(None);
        if let Some(mut io) = self.io.take() {
            let _ = io.shutdown().await;
            debug!("Closed {}", self.name);
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.io.is_some()
    }

    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, ChannelError> {
        let io = self
            .io
            .as_mut()
            .ok_or_else(|| ChannelError::NotOpen(self.name.clone()))?;
        match io.read(buf).await {
            Ok(0) => Err(ChannelError::Disconnected(self.name.clone())),
            Ok(n) => Ok(n),
            Err(e) => Err(ChannelError::io(&self.name, e)),
        }
    }

    async fn write(&mut self, data: &[u8]) -> Result<(), ChannelError> {
        let io = self
            .io
            .as_mut()
            .ok_or_else(|| ChannelError::NotOpen(self.name.clone()))?;
        io.write_all(data)
            .await
            .map_err(|e| ChannelError::io(&self.name, e))?;
        io.flush().await.map_err(|e| ChannelError::io(&self.name, e))
    }

    async fn custom(&mut self, command: &ChannelCommand) -> Result<(), ChannelError> {
        match command {
            ChannelCommand::Reset => self.command(SimCommand::Reset).await,
            ChannelCommand::Flash(path) => {
                if self.io.is_none() {
                    return Err(ChannelError::NotOpen(self.name.clone()));
                }
                let _ = self.shared.event_tx.send(SimEvent::Flashed(path.clone()));
                Ok(())
            }
            ChannelCommand::FlushBuffers => Ok(()),
            other => Err(ChannelError::Unsupported {
                channel: self.name.clone(),
                command: other.to_string(),
            }),
        }
    }
}
