//! Simulated device actor task
//!
//! The task owns a [`SimDevice`] and the device end of an in-memory stream.
//! It uses a select! loop to:
//! - Read command lines from the stream and schedule the scripted responses
//! - Handle emit/reset/shutdown commands from a channel
//! - Write scheduled output once it is due
//!
//! Observations (received commands, resets) are broadcast for tests.

use std::collections::VecDeque;
use std::io;
use std::path::PathBuf;

use sb_protocol::LineBuffer;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{broadcast, mpsc};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info};

use crate::device::{SimDevice, SimOutput};

/// Commands that can be sent to a simulated device task
#[derive(Debug, Clone)]
pub enum SimCommand {
    /// Write an unsolicited line, as a device log would
    Emit(String),
    /// Replay the boot banner
    Reset,
    /// Drop the stream, as if the cable were pulled
    Disconnect,
    /// Stop the task
    Shutdown,
}

/// Things a simulated device observed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimEvent {
    /// A command line arrived (line ending stripped)
    Received(String),
    /// The device (re)booted
    Booted,
    /// A firmware image was flashed
    Flashed(PathBuf),
    /// The device dropped its stream
    Disconnected,
}

#[derive(Debug, Default)]
struct Schedule {
    pending: VecDeque<(Instant, String)>,
    last_due: Option<Instant>,
}

impl Schedule {
    fn push(&mut self, outputs: Vec<SimOutput>) {
        for output in outputs {
            let now = Instant::now();
            let base = self.last_due.map_or(now, |due| due.max(now));
            let due = base + output.delay;
            self.last_due = Some(due);
            self.pending.push_back((due, output.line));
        }
    }

    fn next_due(&self) -> Option<Instant> {
        self.pending.front().map(|(due, _)| *due)
    }
}

/// Run the simulated device task until the stream closes or it is told to stop
pub async fn run_sim_device_task<S>(
    mut stream: S,
    mut device: SimDevice,
    mut cmd_rx: mpsc::Receiver<SimCommand>,
    event_tx: broadcast::Sender<SimEvent>,
) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = [0u8; 1024];
    let mut lines = LineBuffer::default();
    let mut schedule = Schedule::default();

    info!("Starting simulated device {}", device.name());
    schedule.push(device.boot());
    let _ = event_tx.send(SimEvent::Booted);

    loop {
        let next_due = schedule.next_due();
        tokio::select! {
            result = stream.read(&mut buf) => {
                match result {
                    Ok(0) => {
                        debug!("Stream closed for simulated device {}", device.name());
                        break;
                    }
                    Ok(n) => {
                        lines.push_bytes(&buf[..n]);
                        while let Some(line) = lines.next_line() {
                            let command = line.text.trim_end_matches(['\r', '\n']).to_string();
                            debug!("Simulated device {} received {:?}", device.name(), command);
                            schedule.push(device.handle_line(&line.text));
                            let _ = event_tx.send(SimEvent::Received(command));
                        }
                    }
                    Err(e) => return Err(e),
                }
            }

            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(SimCommand::Emit(line)) => {
                        schedule.push(vec![SimOutput {
                            delay: Default::default(),
                            line: if line.ends_with('\n') { line } else { format!("{}\n", line) },
                        }]);
                    }
                    Some(SimCommand::Reset) => {
                        info!("Simulated device {} reset", device.name());
                        schedule.pending.clear();
                        schedule.push(device.boot());
                        let _ = event_tx.send(SimEvent::Booted);
                    }
                    Some(SimCommand::Disconnect) => {
                        info!("Simulated device {} disconnected", device.name());
                        let _ = event_tx.send(SimEvent::Disconnected);
                        break;
                    }
                    Some(SimCommand::Shutdown) | None => break,
                }
            }

            _ = sleep_until(next_due.unwrap_or_else(Instant::now)), if next_due.is_some() => {
                if let Some((_, line)) = schedule.pending.pop_front() {
                    stream.write_all(line.as_bytes()).await?;
                    stream.flush().await?;
                }
            }
        }
    }

    info!("Simulated device task ended for {}", device.name());
    Ok(())
}
