//! Event filter task
//!
//! Receives every line after the log writer has recorded it, runs all
//! configured [`LogEventFilter`]s over it and appends one JSON record per
//! match to the event file. Filters only see the live stream; nothing is
//! replayed when a filter is added.

use std::path::PathBuf;

use sb_protocol::{FilterSet, LogEvent, LogEventFilter, LogLine};
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use crate::error::SwitchboardError;
use crate::events::SwitchboardEvent;
use crate::log_writer::{open_append, FailureTx, PipelineFailure};

/// Messages accepted by the event filter
#[derive(Debug)]
pub(crate) enum FilterMessage {
    /// A line as written to the log file
    Line {
        line: LogLine,
        entry: String,
        log_filename: String,
    },
    /// Add a filter; duplicate names are refused
    AddFilter {
        filter: LogEventFilter,
        reply: oneshot::Sender<Result<(), SwitchboardError>>,
    },
    /// Continue in a new event file
    NewEventFile(PathBuf),
    /// Reply once every event so far is on disk
    Flush {
        reply: oneshot::Sender<Result<(), SwitchboardError>>,
    },
    /// Stop after flushing
    Shutdown,
}

pub(crate) struct LogFilter {
    filters: FilterSet,
    path: PathBuf,
    file: File,
    path_tx: watch::Sender<PathBuf>,
    event_tx: broadcast::Sender<SwitchboardEvent>,
    failure_tx: FailureTx,
}

impl LogFilter {
    /// Open the event file
    pub(crate) async fn open(
        path: PathBuf,
        filters: FilterSet,
        event_tx: broadcast::Sender<SwitchboardEvent>,
        failure_tx: FailureTx,
    ) -> Result<(Self, watch::Receiver<PathBuf>), SwitchboardError> {
        let (file, _) = open_append(&path)
            .await
            .map_err(SwitchboardError::LogFilterFailed)?;
        let (path_tx, path_rx) = watch::channel(path.clone());
        let filter = Self {
            filters,
            path,
            file,
            path_tx,
            event_tx,
            failure_tx,
        };
        Ok((filter, path_rx))
    }

    /// Process messages until shutdown or a file error
    pub(crate) async fn run(mut self, mut rx: mpsc::Receiver<FilterMessage>) -> Result<(), SwitchboardError> {
        info!(
            "Event filter started with {} filter(s) at {}",
            self.filters.len(),
            self.path.display()
        );

        while let Some(message) = rx.recv().await {
            let result = match message {
                FilterMessage::Line {
                    line,
                    entry,
                    log_filename,
                } => self.filter_line(&line, &entry, &log_filename).await,
                FilterMessage::AddFilter { filter, reply } => {
                    let name = filter.name().to_string();
                    let result = self.filters.add(filter).map_err(SwitchboardError::from);
                    match &result {
                        Ok(()) => info!("Added event filter {}", name),
                        Err(e) => warn!("Refused event filter {}: {}", name, e),
                    }
                    let _ = reply.send(result);
                    Ok(())
                }
                FilterMessage::NewEventFile(path) => self.switch_to(path).await,
                FilterMessage::Flush { reply } => {
                    let result = self.flush().await;
                    let _ = reply.send(
                        result
                            .clone()
                            .map_err(SwitchboardError::LogFilterFailed),
                    );
                    result
                }
                FilterMessage::Shutdown => break,
            };

            if let Err(reason) = result {
                warn!("Event filter failed: {}", reason);
                self.failure_tx
                    .send_replace(Some(PipelineFailure::Filter(reason.clone())));
                let _ = self
                    .event_tx
                    .send(SwitchboardEvent::LogFilterFailed {
                        reason: reason.clone(),
                    });
                return Err(SwitchboardError::LogFilterFailed(reason));
            }
        }

        let _ = self.flush().await;
        info!("Event filter stopped");
        Ok(())
    }

    async fn filter_line(&mut self, line: &LogLine, entry: &str, log_filename: &str) -> Result<(), String> {
        let events = self.filters.events_for(line, entry, log_filename);
        if events.is_empty() {
            return Ok(());
        }
        for event in events {
            self.append(&event).await?;
            debug!("Event {} from {}", event.event_name, log_filename);
            let _ = self.event_tx.send(SwitchboardEvent::LogEvent(event));
        }
        self.flush().await
    }

    async fn append(&mut self, event: &LogEvent) -> Result<(), String> {
        let mut record = serde_json::to_string(event).map_err(|e| e.to_string())?;
        record.push('\n');
        self.file
            .write_all(record.as_bytes())
            .await
            .map_err(|e| format!("{}: {}", self.path.display(), e))
    }

    async fn flush(&mut self) -> Result<(), String> {
        self.file
            .flush()
            .await
            .map_err(|e| format!("{}: {}", self.path.display(), e))
    }

    async fn switch_to(&mut self, path: PathBuf) -> Result<(), String> {
        self.flush().await?;
        let (file, _) = open_append(&path).await?;
        info!("Event file now {}", path.display());
        self.file = file;
        self.path = path;
        self.path_tx.send_replace(self.path.clone());
        Ok(())
    }
}
