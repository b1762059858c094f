//! Channel worker tasks
//!
//! Each channel is owned by exactly one worker task. The worker reads the
//! channel with a short poll timeout so commands stay responsive, frames the
//! bytes into lines and publishes every line twice: to the shared log queue
//! and to the channel's response queue.
//!
//! A read or write error faults the channel. The worker keeps running in the
//! faulted state and only reopens the channel when told to. `Close` closes
//! the channel and ends the task, handing the channel back so it can be
//! reopened by a fresh worker later.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use sb_protocol::{FramedLine, InterruptReason, LineBuffer, LineClassifier, LogLine};
use sb_transport::{Channel, ChannelCommand, ChannelError, ChannelSpec, ChannelState};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tracing::{debug, info, trace, warn};

use crate::config::WorkerConfig;
use crate::error::SwitchboardError;
use crate::events::SwitchboardEvent;
use crate::log_writer::LogMessage;
use crate::response::{Published, ResponseItem, ResponseSink};

type Reply = oneshot::Sender<Result<(), ChannelError>>;

/// Commands accepted by a channel worker
#[derive(Debug)]
pub(crate) enum WorkerCommand {
    /// Queue bytes for writing
    Write {
        /// Encoded command
        data: Vec<u8>,
        /// Write one byte at a time
        slow: bool,
    },
    /// Open the channel; a no-op if it is already open
    Reopen { reply: Reply },
    /// Close the channel and stop the worker
    Close { reply: Reply },
    /// Forward a transport-specific command
    Custom {
        command: ChannelCommand,
        reply: Reply,
    },
}

/// Everything a worker shares with the rest of the switchboard
#[derive(Clone)]
pub(crate) struct WorkerContext {
    pub(crate) classifier: Arc<dyn LineClassifier>,
    pub(crate) log_tx: mpsc::Sender<LogMessage>,
    pub(crate) sink: ResponseSink,
    pub(crate) event_tx: broadcast::Sender<SwitchboardEvent>,
    pub(crate) state_tx: Arc<watch::Sender<ChannelState>>,
    pub(crate) config: WorkerConfig,
}

impl WorkerContext {
    async fn note(&self, text: String) {
        let _ = self
            .log_tx
            .send(LogMessage::Line(LogLine::note(text)))
            .await;
    }
}

/// Cloneable command sender for a running worker
#[derive(Debug, Clone)]
pub(crate) struct WorkerHandle {
    index: usize,
    cmd_tx: mpsc::Sender<WorkerCommand>,
}

impl WorkerHandle {
    /// Queue a write
    pub(crate) async fn write(&self, data: Vec<u8>, slow: bool) -> Result<(), SwitchboardError> {
        self.cmd_tx
            .send(WorkerCommand::Write { data, slow })
            .await
            .map_err(|_| SwitchboardError::WorkerGone(self.index))
    }

    /// Send a command that replies, and wait for the reply
    pub(crate) async fn request(
        &self,
        command: impl FnOnce(Reply) -> WorkerCommand,
    ) -> Result<(), SwitchboardError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(command(reply))
            .await
            .map_err(|_| SwitchboardError::WorkerGone(self.index))?;
        rx.await
            .map_err(|_| SwitchboardError::WorkerGone(self.index))?
            .map_err(SwitchboardError::from)
    }
}

/// A running channel worker
///
/// Owns the task; dropping it without [`stop`](Self::stop) lets the task
/// close the channel on its own once every handle is gone.
#[derive(Debug)]
pub struct ChannelWorker {
    handle: WorkerHandle,
    name: String,
    task: JoinHandle<ChannelSpec>,
}

impl ChannelWorker {
    /// Start a worker for channel `index`; the channel is not opened yet
    pub(crate) fn spawn(index: usize, spec: ChannelSpec, ctx: WorkerContext) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(ctx.config.command_queue_size.max(1));
        let name = spec.channel.name().to_string();
        let worker = Worker::new(index, spec, ctx);
        let task = tokio::spawn(worker.run(cmd_rx));
        Self {
            handle: WorkerHandle { index, cmd_tx },
            name,
            task,
        }
    }

    /// Channel index
    pub fn index(&self) -> usize {
        self.handle.index
    }

    /// Channel name
    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn handle(&self) -> WorkerHandle {
        self.handle.clone()
    }

    /// Close the channel, wait for the task and take the channel back
    pub(crate) async fn stop(self) -> Result<ChannelSpec, SwitchboardError> {
        let index = self.handle.index;
        match self
            .handle
            .request(|reply| WorkerCommand::Close { reply })
            .await
        {
            Ok(()) => {}
            Err(SwitchboardError::Channel(e)) => warn!("Closing channel {} reported: {}", index, e),
            Err(e) => debug!("Worker {} already stopping: {}", index, e),
        }
        drop(self.handle);
        self.task.await.map_err(|e| {
            warn!("Worker {} ended abnormally: {}", index, e);
            SwitchboardError::WorkerGone(index)
        })
    }
}

struct Worker {
    index: usize,
    channel: Box<dyn Channel>,
    lines: LineBuffer,
    ctx: WorkerContext,
    pending: VecDeque<Vec<u8>>,
    buf: Vec<u8>,
    last_read: Instant,
    overflowing: bool,
}

impl Worker {
    fn new(index: usize, spec: ChannelSpec, ctx: WorkerContext) -> Self {
        let buf = vec![0u8; ctx.config.max_read_bytes.max(1)];
        Self {
            index,
            channel: spec.channel,
            lines: LineBuffer::new(spec.framer),
            ctx,
            pending: VecDeque::new(),
            buf,
            last_read: Instant::now(),
            overflowing: false,
        }
    }

    async fn run(mut self, mut cmd_rx: mpsc::Receiver<WorkerCommand>) -> ChannelSpec {
        info!("Worker {} started for {}", self.index, self.channel.name());
        let poll = self.ctx.config.poll_interval();

        loop {
            if let Some(chunk) = self.pending.pop_front() {
                if let Err(e) = self.channel.write(&chunk).await {
                    self.fault(e.to_string()).await;
                }
            }

            // Keep draining reads between queued chunks, without waiting
            let read_wait = if self.pending.is_empty() { poll } else { Duration::ZERO };
            let open = self.channel.is_open();

            tokio::select! {
                biased;

                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(WorkerCommand::Write { data, slow }) => self.queue_write(data, slow).await,
                        Some(WorkerCommand::Reopen { reply }) => {
                            let _ = reply.send(self.open().await);
                        }
                        Some(WorkerCommand::Custom { command, reply }) => {
                            debug!("Channel {}: {}", self.index, command);
                            let _ = reply.send(self.channel.custom(&command).await);
                        }
                        Some(WorkerCommand::Close { reply }) => {
                            let _ = reply.send(self.close().await);
                            break;
                        }
                        None => {
                            let _ = self.close().await;
                            break;
                        }
                    }
                }

                result = timeout(read_wait, self.channel.read(&mut self.buf)), if open => {
                    match result {
                        Ok(Ok(0)) => {}
                        Ok(Ok(n)) => {
                            trace!("Read {} bytes from channel {}", n, self.index);
                            self.last_read = Instant::now();
                            self.lines.push_bytes(&self.buf[..n]);
                            while let Some(line) = self.lines.next_line() {
                                self.publish(line).await;
                            }
                        }
                        Ok(Err(e)) => self.fault(e.to_string()).await,
                        Err(_) => {
                            if self.lines.has_partial()
                                && self.last_read.elapsed() >= self.ctx.config.partial_line_timeout()
                            {
                                self.flush_partial().await;
                            }
                        }
                    }
                }

                _ = tokio::time::sleep(poll), if !open => {}
            }
        }

        info!("Worker {} stopped", self.index);
        ChannelSpec {
            framer: self.lines.framer().clone(),
            channel: self.channel,
        }
    }

    async fn queue_write(&mut self, data: Vec<u8>, slow: bool) {
        if !self.channel.is_open() {
            warn!(
                "Dropping {} byte write to channel {}: not open",
                data.len(),
                self.index
            );
            self.ctx
                .note(format!(
                    "dropped {} byte write to port {}: not open",
                    data.len(),
                    self.index
                ))
                .await;
            return;
        }
        let chunk = match (slow, self.ctx.config.max_write_bytes) {
            (true, _) => 1,
            (false, 0) => data.len().max(1),
            (false, max) => max,
        };
        self.pending
            .extend(data.chunks(chunk).map(<[u8]>::to_vec));
    }

    async fn publish(&mut self, line: FramedLine) {
        let kind = self.ctx.classifier.classify(self.index, &line.text);
        let _ = self
            .ctx
            .log_tx
            .send(LogMessage::Line(LogLine::from_channel(
                self.index,
                line.text.clone(),
                line.eol,
            )))
            .await;
        let published = self.ctx.sink.publish(ResponseItem::Line {
            text: line.text,
            kind,
        });
        match published {
            Published::Overflow if !self.overflowing => {
                self.overflowing = true;
                warn!(
                    "Response queue of channel {} is full, lines are only logged until the expect catches up",
                    self.index
                );
            }
            Published::Overflow => {}
            Published::Idle | Published::Queued => self.overflowing = false,
        }
    }

    async fn flush_partial(&mut self) {
        if let Some(line) = self.lines.take_partial() {
            self.publish(line).await;
        }
    }

    async fn open(&mut self) -> Result<(), ChannelError> {
        if self.channel.is_open() && self.ctx.state_tx.borrow().is_open() {
            return Ok(());
        }
        if let Err(e) = self.channel.open().await {
            warn!("Channel {} failed to open: {}", self.index, e);
            return Err(e);
        }
        self.lines.clear();
        self.last_read = Instant::now();
        self.ctx.state_tx.send_replace(ChannelState::Open);
        info!("Channel {} opened ({})", self.index, self.channel.name());
        let _ = self
            .ctx
            .event_tx
            .send(SwitchboardEvent::ChannelOpened {
                channel: self.index,
            });
        Ok(())
    }

    async fn close(&mut self) -> Result<(), ChannelError> {
        self.flush_partial().await;
        self.pending.clear();
        let result = self.channel.close().await;
        self.lines.clear();

        let previous = self.ctx.state_tx.send_replace(ChannelState::Closed);
        if previous != ChannelState::Closed {
            info!("Channel {} closed", self.index);
            self.ctx
                .sink
                .publish(ResponseItem::Interrupted(InterruptReason::Closed));
            let _ = self
                .ctx
                .event_tx
                .send(SwitchboardEvent::ChannelClosed {
                    channel: self.index,
                });
        }
        result
    }

    async fn fault(&mut self, reason: String) {
        warn!("Channel {} faulted: {}", self.index, reason);
        self.flush_partial().await;
        self.pending.clear();
        if let Err(e) = self.channel.close().await {
            debug!("Closing faulted channel {}: {}", self.index, e);
        }
        self.lines.clear();

        self.ctx
            .state_tx
            .send_replace(ChannelState::Faulted(reason.clone()));
        self.ctx
            .note(format!("channel {} faulted: {}", self.index, reason))
            .await;
        self.ctx
            .sink
            .publish(ResponseItem::Interrupted(InterruptReason::Faulted(
                reason.clone(),
            )));
        let _ = self.ctx.event_tx.send(SwitchboardEvent::ChannelFaulted {
            channel: self.index,
            reason,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OverlapPolicy;
    use crate::response::{ResponseLease, ResponseQueue};
    use sb_protocol::{AllResponse, LineKind};
    use sb_sim::{SimChannel, SimDeviceConfig, SimHandle};
    use sb_transport::StreamChannel;
    use tokio::io::AsyncWriteExt;

    struct Rig {
        worker: ChannelWorker,
        queues: Vec<ResponseQueue>,
        log_rx: mpsc::Receiver<LogMessage>,
        state_rx: watch::Receiver<ChannelState>,
        events: broadcast::Receiver<SwitchboardEvent>,
    }

    fn sim_rig(config: SimDeviceConfig) -> (Rig, SimHandle) {
        let (channel, handle) = SimChannel::new(config);
        (rig(ChannelSpec::new(channel)), handle)
    }

    fn rig(spec: ChannelSpec) -> Rig {
        rig_with_queue(spec, 64)
    }

    fn rig_with_queue(spec: ChannelSpec, response_queue_size: usize) -> Rig {
        let queues = vec![ResponseQueue::new(0, response_queue_size)];
        let (log_tx, log_rx) = mpsc::channel(64);
        let (event_tx, events) = broadcast::channel(64);
        let (state_tx, state_rx) = watch::channel(ChannelState::Closed);
        let ctx = WorkerContext {
            classifier: Arc::new(AllResponse),
            log_tx,
            sink: queues[0].sink(),
            event_tx,
            state_tx: Arc::new(state_tx),
            config: WorkerConfig::default(),
        };
        let worker = ChannelWorker::spawn(0, spec, ctx);
        Rig {
            worker,
            queues,
            log_rx,
            state_rx,
            events,
        }
    }

    async fn next_line(lease: &mut ResponseLease) -> String {
        match lease.next().await {
            Some((_, ResponseItem::Line { text, kind })) => {
                assert_eq!(kind, LineKind::Response);
                text
            }
            other => panic!("expected a line, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_write_and_read_lines() {
        let (mut rig, _handle) = sim_rig(SimDeviceConfig::named("dut").respond("ping", ["pong"]));
        rig.worker
            .handle()
            .request(|reply| WorkerCommand::Reopen { reply })
            .await
            .unwrap();
        assert!(rig.state_rx.borrow().is_open());

        let mut lease = ResponseLease::acquire(&rig.queues, &[0], OverlapPolicy::Wait)
            .await
            .unwrap();
        rig.worker.handle().write(b"ping\n".to_vec(), true).await.unwrap();
        assert_eq!(next_line(&mut lease).await, "pong\n");

        match rig.log_rx.recv().await.unwrap() {
            LogMessage::Line(line) => {
                assert_eq!(line.channel(), Some(0));
                assert_eq!(line.text, "pong\n");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_partial_line_flushed_after_silence() {
        let (near, mut far) = tokio::io::duplex(256);
        let mut rig = rig(ChannelSpec::new(StreamChannel::new("pipe", near)));
        rig.worker
            .handle()
            .request(|reply| WorkerCommand::Reopen { reply })
            .await
            .unwrap();
        let mut lease = ResponseLease::acquire(&rig.queues, &[0], OverlapPolicy::Wait)
            .await
            .unwrap();

        far.write_all(b"login: ").await.unwrap();
        assert_eq!(next_line(&mut lease).await, "login: ");
        match rig.log_rx.recv().await.unwrap() {
            LogMessage::Line(line) => assert!(!line.eol),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_disconnect_faults_and_interrupts() {
        let (mut rig, handle) = sim_rig(SimDeviceConfig::named("dut"));
        rig.worker
            .handle()
            .request(|reply| WorkerCommand::Reopen { reply })
            .await
            .unwrap();
        let mut lease = ResponseLease::acquire(&rig.queues, &[0], OverlapPolicy::Wait)
            .await
            .unwrap();
        handle.disconnect().await;

        match lease.next().await {
            Some((0, ResponseItem::Interrupted(InterruptReason::Faulted(_)))) => {}
            other => panic!("expected a fault, got {:?}", other),
        }
        assert!(matches!(*rig.state_rx.borrow(), ChannelState::Faulted(_)));

        let mut noted = false;
        while let Ok(message) = rig.log_rx.try_recv() {
            if let LogMessage::Line(line) = message {
                noted |= line.text.starts_with("Note: channel 0 faulted");
            }
        }
        assert!(noted);

        // A faulted channel reopens on request only
        rig.worker
            .handle()
            .request(|reply| WorkerCommand::Reopen { reply })
            .await
            .unwrap();
        assert!(rig.state_rx.borrow().is_open());
        assert_eq!(handle.open_count(), 2);

        let mut saw_fault = false;
        while let Ok(event) = rig.events.try_recv() {
            saw_fault |= matches!(event, SwitchboardEvent::ChannelFaulted { channel: 0, .. });
        }
        assert!(saw_fault);
    }

    #[tokio::test]
    async fn test_close_returns_channel() {
        let (rig, _handle) = sim_rig(SimDeviceConfig::named("dut"));
        rig.worker
            .handle()
            .request(|reply| WorkerCommand::Reopen { reply })
            .await
            .unwrap();
        let spec = rig.worker.stop().await.unwrap();
        assert!(!spec.channel.is_open());
        assert_eq!(*rig.state_rx.borrow(), ChannelState::Closed);
    }

    #[tokio::test]
    async fn test_unsupported_custom_command() {
        let (rig, _handle) = sim_rig(SimDeviceConfig::named("dut"));
        let err = rig
            .worker
            .handle()
            .request(|reply| WorkerCommand::Custom {
                command: ChannelCommand::SendXon,
                reply,
            })
            .await
            .unwrap_err();
        assert!(err.is_unsupported());
    }

    #[tokio::test]
    async fn test_write_to_unopened_channel_is_noted() {
        let (mut rig, _handle) = sim_rig(SimDeviceConfig::named("dut"));
        rig.worker.handle().write(b"ls\n".to_vec(), false).await.unwrap();

        match rig.log_rx.recv().await.unwrap() {
            LogMessage::Line(line) => {
                assert_eq!(line.text, "Note: dropped 3 byte write to port 0: not open\n")
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_close_served_while_listener_is_behind() {
        let (channel, handle) = SimChannel::new(SimDeviceConfig::named("dut"));
        let mut rig = rig_with_queue(ChannelSpec::new(channel), 1);
        rig.worker
            .handle()
            .request(|reply| WorkerCommand::Reopen { reply })
            .await
            .unwrap();
        let mut lease = ResponseLease::acquire(&rig.queues, &[0], OverlapPolicy::Wait)
            .await
            .unwrap();

        for i in 0..4 {
            assert!(handle.emit(format!("line {}", i)).await);
        }
        let mut logged = 0;
        while logged < 4 {
            if let Some(LogMessage::Line(line)) = rig.log_rx.recv().await {
                logged += usize::from(line.channel() == Some(0));
            }
        }

        let spec = tokio::time::timeout(Duration::from_secs(5), rig.worker.stop())
            .await
            .expect("worker blocked on a full response queue")
            .unwrap();
        assert!(!spec.channel.is_open());

        // Lines past the queue capacity were only logged
        assert_eq!(next_line(&mut lease).await, "line 0\n");
        assert_eq!(
            lease.next().await,
            Some((0, ResponseItem::Interrupted(InterruptReason::Closed)))
        );
    }
}
