//! The switchboard coordinator
//!
//! A [`Switchboard`] owns one worker per channel plus the log writer and the
//! event filter. Callers write commands with [`Switchboard::send`] and wait
//! for device output with [`Switchboard::expect`]; the log pipeline keeps
//! recording everything in the background.
//!
//! Every method takes `&self`, so a switchboard can be shared behind an
//! `Arc` and used from several tasks at once. Overlapping expects are
//! governed by [`OverlapPolicy`].
//!
//! The slot table is only locked to look up or swap a worker, never while
//! waiting on one. Opening and closing are serialized by a separate lock.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use sb_protocol::{
    ExpectMatcher, ExpectResult, ExpectSpec, FilterSet, InterruptReason, Interruption,
    LineClassifier, LogEventFilter, LogLine,
};
use sb_transport::{
    ChannelCommand, ChannelConfig, ChannelSpec, ChannelState, CommunicationRegistry,
    DeviceChannels,
};
use tokio::sync::{broadcast, mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::{OverlapPolicy, SendOptions, SwitchboardConfig};
use crate::error::SwitchboardError;
use crate::events::SwitchboardEvent;
use crate::log_filter::LogFilter;
use crate::log_writer::{LogMessage, LogWriter, PipelineFailure};
use crate::response::{ResponseItem, ResponseLease, ResponseQueue};
use crate::worker::{ChannelWorker, WorkerCommand, WorkerContext, WorkerHandle};

/// What currently holds a channel
#[derive(Debug)]
enum ChannelSlot {
    /// A worker owns the channel
    Running(ChannelWorker),
    /// The worker stopped and handed the channel back
    Stopped(ChannelSpec),
    /// The worker is being stopped
    Stopping,
    /// The worker died and took the channel with it
    Lost,
}

struct Pipeline {
    writer: JoinHandle<Result<(), SwitchboardError>>,
    filter: JoinHandle<Result<(), SwitchboardError>>,
}

type PipelineReply = oneshot::Sender<Result<(), SwitchboardError>>;

/// Multi-channel device coordinator
pub struct Switchboard {
    config: SwitchboardConfig,
    classifier: Arc<dyn LineClassifier>,
    names: Vec<String>,
    slots: Mutex<Vec<ChannelSlot>>,
    lifecycle: Mutex<()>,
    queues: Vec<ResponseQueue>,
    states: Vec<Arc<watch::Sender<ChannelState>>>,
    log_tx: mpsc::Sender<LogMessage>,
    log_path: watch::Receiver<PathBuf>,
    event_path: watch::Receiver<PathBuf>,
    event_tx: broadcast::Sender<SwitchboardEvent>,
    failure_rx: watch::Receiver<Option<PipelineFailure>>,
    pipeline: Mutex<Option<Pipeline>>,
    closed: AtomicBool,
}

impl std::fmt::Debug for Switchboard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Switchboard")
            .field("device", &self.config.device_name)
            .field("channels", &self.names)
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish()
    }
}

impl Switchboard {
    /// Start the log pipeline and one worker per channel
    ///
    /// With `open_on_start` set (the default) every channel is opened before
    /// this returns. A channel that fails to open is logged and left closed;
    /// it does not fail construction.
    pub async fn new(
        config: SwitchboardConfig,
        device: DeviceChannels,
        filters: FilterSet,
    ) -> Result<Self, SwitchboardError> {
        let (event_tx, _) = broadcast::channel(config.event_capacity.max(1));
        let (failure_tx, failure_rx) = watch::channel(None);
        let failure_tx = Arc::new(failure_tx);

        let (filter, event_path) = LogFilter::open(
            config.event_path(),
            filters,
            event_tx.clone(),
            failure_tx.clone(),
        )
        .await?;
        let (filter_tx, filter_rx) = mpsc::channel(config.log_queue_size.max(1));
        let (writer, log_path) = LogWriter::open(
            config.log_path.clone(),
            config.max_log_size,
            filter_tx,
            event_tx.clone(),
            failure_tx,
        )
        .await?;
        let (log_tx, log_rx) = mpsc::channel(config.log_queue_size.max(1));
        let pipeline = Pipeline {
            filter: tokio::spawn(filter.run(filter_rx)),
            writer: tokio::spawn(writer.run(log_rx)),
        };

        let count = device.channels.len();
        let names = device
            .channels
            .iter()
            .map(|spec| spec.channel.name().to_string())
            .collect();
        let queues = (0..count)
            .map(|index| ResponseQueue::new(index, config.response_queue_size))
            .collect();
        let states = (0..count)
            .map(|_| Arc::new(watch::channel(ChannelState::Closed).0))
            .collect();

        let mut switchboard = Self {
            config,
            classifier: device.classifier,
            names,
            slots: Mutex::new(Vec::with_capacity(count)),
            lifecycle: Mutex::new(()),
            queues,
            states,
            log_tx,
            log_path,
            event_path,
            event_tx,
            failure_rx,
            pipeline: Mutex::new(Some(pipeline)),
            closed: AtomicBool::new(false),
        };

        let workers: Vec<ChannelSlot> = device
            .channels
            .into_iter()
            .enumerate()
            .map(|(index, spec)| {
                ChannelSlot::Running(ChannelWorker::spawn(
                    index,
                    spec,
                    switchboard.worker_context(index),
                ))
            })
            .collect();
        *switchboard.slots.get_mut() = workers;

        info!(
            "Switchboard for {} started with {} channel(s), logging to {}",
            switchboard.config.device_name,
            count,
            switchboard.config.log_path.display()
        );

        if switchboard.config.worker.open_on_start {
            for index in 0..count {
                if let Err(e) = switchboard.open_slot(index).await {
                    warn!("Channel {} did not open at start: {}", index, e);
                }
            }
        }

        Ok(switchboard)
    }

    /// Build the channels for `channels` from `registry`, then start
    pub async fn from_registry(
        config: SwitchboardConfig,
        registry: &CommunicationRegistry,
        channels: &ChannelConfig,
        filters: FilterSet,
    ) -> Result<Self, SwitchboardError> {
        let device = registry.build(channels)?;
        Self::new(config, device, filters).await
    }

    fn worker_context(&self, index: usize) -> WorkerContext {
        WorkerContext {
            classifier: self.classifier.clone(),
            log_tx: self.log_tx.clone(),
            sink: self.queues[index].sink(),
            event_tx: self.event_tx.clone(),
            state_tx: self.states[index].clone(),
            config: self.config.worker.clone(),
        }
    }

    // -------------------------------------------------------------------------
    // Introspection
    // -------------------------------------------------------------------------

    /// Device name from the config
    pub fn device_name(&self) -> &str {
        &self.config.device_name
    }

    /// Configuration this switchboard was started with
    pub fn config(&self) -> &SwitchboardConfig {
        &self.config
    }

    /// Number of channels
    pub fn channel_count(&self) -> usize {
        self.names.len()
    }

    /// Name of channel `index`
    pub fn channel_name(&self, index: usize) -> Result<&str, SwitchboardError> {
        self.check_index(index)?;
        Ok(&self.names[index])
    }

    /// Current state of channel `index`
    pub fn channel_state(&self, index: usize) -> Result<ChannelState, SwitchboardError> {
        self.check_index(index)?;
        Ok(self.states[index].borrow().clone())
    }

    /// Watch the state of channel `index`
    pub fn watch_channel(
        &self,
        index: usize,
    ) -> Result<watch::Receiver<ChannelState>, SwitchboardError> {
        self.check_index(index)?;
        Ok(self.states[index].subscribe())
    }

    /// Log file currently being written
    pub fn log_path(&self) -> PathBuf {
        self.log_path.borrow().clone()
    }

    /// Event file currently being written
    pub fn event_path(&self) -> PathBuf {
        self.event_path.borrow().clone()
    }

    /// Subscribe to switchboard events
    pub fn subscribe(&self) -> broadcast::Receiver<SwitchboardEvent> {
        self.event_tx.subscribe()
    }

    /// Whether [`close`](Self::close) has been called
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Error if the switchboard is closed or the log pipeline has stopped
    pub fn health(&self) -> Result<(), SwitchboardError> {
        self.ensure_running()?;
        self.pipeline_ok()
    }

    fn check_index(&self, index: usize) -> Result<(), SwitchboardError> {
        if index < self.names.len() {
            Ok(())
        } else {
            Err(SwitchboardError::NoSuchChannel {
                index,
                count: self.names.len(),
            })
        }
    }

    fn ensure_running(&self) -> Result<(), SwitchboardError> {
        if self.is_closed() {
            Err(SwitchboardError::Closed)
        } else {
            Ok(())
        }
    }

    fn pipeline_ok(&self) -> Result<(), SwitchboardError> {
        match &*self.failure_rx.borrow() {
            Some(failure) => Err(failure.to_error()),
            None => Ok(()),
        }
    }

    fn pipeline_error(&self) -> SwitchboardError {
        self.failure_rx
            .borrow()
            .as_ref()
            .map(PipelineFailure::to_error)
            .unwrap_or(SwitchboardError::Closed)
    }

    // -------------------------------------------------------------------------
    // Log pipeline
    // -------------------------------------------------------------------------

    /// Insert a note into the device log
    ///
    /// Notes go through the event filters like device output, so filters can
    /// match coordinator markers too.
    pub async fn add_log_note(&self, note: &str) -> Result<(), SwitchboardError> {
        self.ensure_running()?;
        self.pipeline_ok()?;
        self.log_tx
            .send(LogMessage::Line(LogLine::note(note)))
            .await
            .map_err(|_| self.pipeline_error())
    }

    /// Best-effort note used by the switchboard itself
    async fn note(&self, text: String) {
        if self
            .log_tx
            .send(LogMessage::Line(LogLine::note(&text)))
            .await
            .is_err()
        {
            debug!("Log writer gone, dropped note: {}", text);
        }
    }

    async fn pipeline_request(
        &self,
        message: impl FnOnce(PipelineReply) -> LogMessage,
    ) -> Result<(), SwitchboardError> {
        self.ensure_running()?;
        self.pipeline_ok()?;
        let (reply, rx) = oneshot::channel();
        self.log_tx
            .send(message(reply))
            .await
            .map_err(|_| self.pipeline_error())?;
        rx.await.map_err(|_| self.pipeline_error())?
    }

    /// Continue logging in `path`, with a matching event file
    pub async fn start_new_log(&self, path: impl Into<PathBuf>) -> Result<(), SwitchboardError> {
        let path = path.into();
        self.pipeline_request(|reply| LogMessage::StartNewLog { path, reply })
            .await
    }

    /// Change the rotation threshold; 0 disables rotation
    pub async fn set_max_log_size(&self, size: u64) -> Result<(), SwitchboardError> {
        self.pipeline_request(|reply| LogMessage::SetMaxLogSize { size, reply })
            .await
    }

    /// Add an event filter; it applies to lines logged from now on
    pub async fn add_filter(&self, filter: LogEventFilter) -> Result<(), SwitchboardError> {
        self.pipeline_request(|reply| LogMessage::AddFilter { filter, reply })
            .await
    }

    /// Load an event filter file and add it
    pub async fn add_filter_file(&self, path: impl AsRef<Path>) -> Result<(), SwitchboardError> {
        let filter = LogEventFilter::from_file(path)?;
        self.add_filter(filter).await
    }

    /// Wait until everything logged so far is on disk, events included
    pub async fn flush_logs(&self) -> Result<(), SwitchboardError> {
        self.pipeline_request(|reply| LogMessage::Flush { reply })
            .await
    }

    // -------------------------------------------------------------------------
    // Commands
    // -------------------------------------------------------------------------

    /// Queue `command` for writing to `channel`
    ///
    /// Returns once the write is queued. The channel must be open.
    pub async fn send(
        &self,
        command: &str,
        channel: usize,
        options: &SendOptions,
    ) -> Result<(), SwitchboardError> {
        let worker = self.writable_worker(channel).await?;
        self.write_to(&worker, command, channel, options).await
    }

    /// Worker of `channel`, if the channel is open
    async fn writable_worker(&self, channel: usize) -> Result<WorkerHandle, SwitchboardError> {
        self.ensure_running()?;
        let state = self.channel_state(channel)?;
        if !state.is_open() {
            return Err(SwitchboardError::ChannelUnavailable {
                index: channel,
                state,
            });
        }
        self.worker_handle(channel).await
    }

    async fn write_to(
        &self,
        worker: &WorkerHandle,
        command: &str,
        channel: usize,
        options: &SendOptions,
    ) -> Result<(), SwitchboardError> {
        self.note(format!("wrote command {:?} to port {}", command, channel))
            .await;
        let data = options.encode(command);
        let slow = options.slow || self.config.force_slow;
        worker.write(data, slow).await
    }

    /// Run a transport-specific command on `channel`
    pub async fn custom_command(
        &self,
        channel: usize,
        command: ChannelCommand,
    ) -> Result<(), SwitchboardError> {
        self.ensure_running()?;
        self.check_index(channel)?;
        self.note(format!(
            "Device {} sending {} to port {}",
            self.config.device_name, command, channel
        ))
        .await;

        self.worker_handle(channel)
            .await?
            .request(|reply| WorkerCommand::Custom { command, reply })
            .await
    }

    async fn worker_handle(&self, channel: usize) -> Result<WorkerHandle, SwitchboardError> {
        let slots = self.slots.lock().await;
        match &slots[channel] {
            ChannelSlot::Running(worker) => Ok(worker.handle()),
            ChannelSlot::Stopped(_) | ChannelSlot::Stopping | ChannelSlot::Lost => {
                Err(SwitchboardError::ChannelUnavailable {
                    index: channel,
                    state: self.states[channel].borrow().clone(),
                })
            }
        }
    }

    // -------------------------------------------------------------------------
    // Expect
    // -------------------------------------------------------------------------

    fn check_spec(&self, spec: &ExpectSpec) -> Result<(), SwitchboardError> {
        spec.validate()?;
        spec.channels
            .iter()
            .try_for_each(|&channel| self.check_index(channel))
    }

    /// Wait for device output matching `spec`
    ///
    /// A timeout is not an error: the result has `timed_out` set and reports
    /// whatever matched. A target channel closing or faulting ends the wait
    /// early in the same way, with the cause in `interruption`.
    ///
    /// The timeout covers the whole call, including time spent waiting for
    /// another expect to release the channels.
    pub async fn expect(&self, spec: &ExpectSpec) -> Result<ExpectResult, SwitchboardError> {
        self.do_and_expect(|| async { Ok(()) }, spec).await
    }

    /// Run `action` while listening on the target channels, then wait for
    /// output matching `spec`
    ///
    /// Output produced from the moment `action` starts is seen by the
    /// expect. An error from `action` is returned as is. `action` must not
    /// expect on the same channels itself. If the channels stay held by
    /// another expect for the whole timeout, `action` is not run and a
    /// timed-out result is returned.
    pub async fn do_and_expect<F, Fut>(
        &self,
        action: F,
        spec: &ExpectSpec,
    ) -> Result<ExpectResult, SwitchboardError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(), SwitchboardError>>,
    {
        self.ensure_running()?;
        self.check_spec(spec)?;
        let start = Instant::now();
        let deadline = start + spec.timeout;

        let acquire =
            ResponseLease::acquire(&self.queues, &spec.channels, self.config.overlap_policy);
        let mut lease = match tokio::time::timeout_at(deadline, acquire).await {
            Ok(lease) => lease?,
            Err(_) => {
                debug!(
                    "Channels {:?} stayed busy for {:.3}s",
                    spec.channels,
                    spec.timeout.as_secs_f64()
                );
                let result = ExpectMatcher::new(spec).finish(start.elapsed(), None);
                return Ok(self.report_expect(spec, result).await);
            }
        };

        action().await?;
        Ok(self.run_expect(spec, &mut lease, start, deadline).await)
    }

    /// Write `command` to `channel`, then wait for output matching `spec`
    ///
    /// The target channels are listened on before the command is written,
    /// so no response can slip past. While the expect times out the command
    /// is written again, up to `options.command_tries` times.
    pub async fn send_and_expect(
        &self,
        command: &str,
        channel: usize,
        spec: &ExpectSpec,
        options: &SendOptions,
    ) -> Result<ExpectResult, SwitchboardError> {
        self.ensure_running()?;
        self.check_index(channel)?;
        self.check_spec(spec)?;

        let tries = options.command_tries.max(1);
        let mut attempt = 1;
        let result = loop {
            // Resolved before listening, so a listener never waits on the slot table
            let worker = self.writable_worker(channel).await?;
            let result = self
                .do_and_expect(
                    || self.write_to(&worker, command, channel, options),
                    spec,
                )
                .await?;

            if !result.timed_out || result.interruption.is_some() || attempt >= tries {
                break result;
            }
            debug!(
                "Command {:?} timed out on attempt {} of {}",
                command, attempt, tries
            );
            attempt += 1;
        };

        if result.timed_out && options.raise_for_timeout {
            return Err(SwitchboardError::ExpectTimedOut {
                command: command.to_string(),
                elapsed: result.elapsed,
                remaining: result.remaining,
            });
        }
        Ok(result)
    }

    async fn run_expect(
        &self,
        spec: &ExpectSpec,
        lease: &mut ResponseLease,
        start: Instant,
        deadline: Instant,
    ) -> ExpectResult {
        let mut matcher = ExpectMatcher::new(spec);

        // The lease is already listening, so a channel that goes away after
        // this check still reports through the queue
        let mut interruption = spec.channels.iter().find_map(|&channel| {
            match self.states[channel].borrow().clone() {
                ChannelState::Open => None,
                ChannelState::Closed => Some(Interruption {
                    channel,
                    reason: InterruptReason::Closed,
                }),
                ChannelState::Faulted(why) => Some(Interruption {
                    channel,
                    reason: InterruptReason::Faulted(why),
                }),
            }
        });

        while interruption.is_none() && !matcher.is_complete() {
            let (channel, item) = match tokio::time::timeout_at(deadline, lease.next()).await {
                Ok(Some(next)) => next,
                Ok(None) | Err(_) => break,
            };
            match item {
                ResponseItem::Line { text, kind } => {
                    if !spec.line_filter.accepts(kind) {
                        continue;
                    }
                    let step = matcher.feed(channel, &text);
                    for index in step.newly_matched {
                        self.note(format!(
                            "found pattern {:?} at index {}",
                            spec.patterns[index].as_str(),
                            index
                        ))
                        .await;
                    }
                }
                ResponseItem::Interrupted(reason) => {
                    interruption = Some(Interruption { channel, reason });
                }
            }
        }

        let result = matcher.finish(start.elapsed(), interruption);
        self.report_expect(spec, result).await
    }

    async fn report_expect(&self, spec: &ExpectSpec, result: ExpectResult) -> ExpectResult {
        let remaining = result.remaining.join(", ");
        let seconds = result.elapsed.as_secs_f64();
        if !result.timed_out {
            self.note(format!(
                "mode {} expect completed with {:?} remaining patterns in {:.3}s",
                spec.mode, remaining, seconds
            ))
            .await;
        } else if let Some(interruption) = &result.interruption {
            self.note(format!(
                "expect interrupted after waiting {:.3}s for {:?} remaining patterns: {}",
                seconds, remaining, interruption
            ))
            .await;
        } else {
            self.note(format!(
                "expect timed out after waiting {:.3}s for {:?} remaining patterns",
                seconds, remaining
            ))
            .await;
        }

        let _ = self.event_tx.send(SwitchboardEvent::ExpectCompleted {
            channels: spec.channels.clone(),
            matched: !result.timed_out,
            elapsed: result.elapsed,
        });
        result
    }

    // -------------------------------------------------------------------------
    // Channel lifecycle
    // -------------------------------------------------------------------------

    /// Stop the worker of channel `index`; the caller holds `lifecycle`
    async fn close_slot(&self, index: usize) {
        let worker = {
            let mut slots = self.slots.lock().await;
            match std::mem::replace(&mut slots[index], ChannelSlot::Stopping) {
                ChannelSlot::Running(worker) => worker,
                other => {
                    slots[index] = other;
                    return;
                }
            }
        };

        self.note(format!("closing transport for port {}", index))
            .await;
        let start = Instant::now();
        let slot = match worker.stop().await {
            Ok(spec) => {
                self.note(format!(
                    "closed transport for port {} in {:.3}s",
                    index,
                    start.elapsed().as_secs_f64()
                ))
                .await;
                ChannelSlot::Stopped(spec)
            }
            Err(e) => {
                warn!("Lost channel {}: {}", index, e);
                self.states[index].send_replace(ChannelState::Faulted(e.to_string()));
                ChannelSlot::Lost
            }
        };
        self.slots.lock().await[index] = slot;
    }

    /// Start a worker for channel `index` if needed and open the channel;
    /// the caller holds `lifecycle`
    async fn open_slot(&self, index: usize) -> Result<(), SwitchboardError> {
        let worker = {
            let mut slots = self.slots.lock().await;
            let slot = &mut slots[index];
            if matches!(slot, ChannelSlot::Stopped(_)) {
                if let ChannelSlot::Stopped(spec) = std::mem::replace(slot, ChannelSlot::Lost) {
                    *slot = ChannelSlot::Running(ChannelWorker::spawn(
                        index,
                        spec,
                        self.worker_context(index),
                    ));
                }
            }
            match slot {
                ChannelSlot::Running(worker) => worker.handle(),
                ChannelSlot::Stopped(_) | ChannelSlot::Stopping | ChannelSlot::Lost => {
                    return Err(SwitchboardError::WorkerGone(index))
                }
            }
        };
        if self.states[index].borrow().is_open() {
            return Ok(());
        }

        self.note(format!("opening transport for port {}", index))
            .await;
        let start = Instant::now();
        worker
            .request(|reply| WorkerCommand::Reopen { reply })
            .await?;
        self.note(format!(
            "opened transport for port {} in {:.3}s",
            index,
            start.elapsed().as_secs_f64()
        ))
        .await;
        Ok(())
    }

    /// Close channel `index` and stop its worker; a no-op if already closed
    pub async fn close_channel(&self, index: usize) -> Result<(), SwitchboardError> {
        self.ensure_running()?;
        self.check_index(index)?;
        let _lifecycle = self.lifecycle.lock().await;
        self.close_slot(index).await;
        Ok(())
    }

    /// Open channel `index`, starting a worker if needed
    ///
    /// Also reopens a faulted channel.
    pub async fn open_channel(&self, index: usize) -> Result<(), SwitchboardError> {
        self.ensure_running()?;
        self.check_index(index)?;
        let _lifecycle = self.lifecycle.lock().await;
        self.open_slot(index).await
    }

    /// Close every channel in index order
    ///
    /// Pending expects on these channels end early. Safe to call repeatedly.
    pub async fn close_all_channels(&self) -> Result<(), SwitchboardError> {
        self.ensure_running()?;
        let _lifecycle = self.lifecycle.lock().await;
        for index in 0..self.channel_count() {
            self.close_slot(index).await;
        }
        Ok(())
    }

    /// Open every channel in index order
    ///
    /// Every channel is attempted; the first failure is returned.
    pub async fn open_all_channels(&self) -> Result<(), SwitchboardError> {
        self.ensure_running()?;
        let _lifecycle = self.lifecycle.lock().await;
        let mut first_error = None;
        for index in 0..self.channel_count() {
            if let Err(e) = self.open_slot(index).await {
                warn!("Failed to open channel {}: {}", index, e);
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Close every channel, then stop the log pipeline
    ///
    /// Calling this again is a no-op. Reports a log pipeline failure if one
    /// happened at any point.
    pub async fn close(&self) -> Result<(), SwitchboardError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return self.pipeline_ok();
        }
        info!("Closing switchboard for {}", self.config.device_name);

        {
            let _lifecycle = self.lifecycle.lock().await;
            for index in 0..self.channel_count() {
                self.close_slot(index).await;
            }
        }

        let _ = self.log_tx.send(LogMessage::Shutdown).await;
        let pipeline = self.pipeline.lock().await.take();
        if let Some(pipeline) = pipeline {
            let writer = pipeline.writer.await;
            let filter = pipeline.filter.await;
            writer.map_err(|e| SwitchboardError::LogWriterFailed(e.to_string()))??;
            filter.map_err(|e| SwitchboardError::LogFilterFailed(e.to_string()))??;
        }
        self.pipeline_ok()
    }

    /// How overlapping expects are handled
    pub fn overlap_policy(&self) -> OverlapPolicy {
        self.config.overlap_policy
    }
}

impl AsRef<Switchboard> for Switchboard {
    fn as_ref(&self) -> &Switchboard {
        self
    }
}
