//! Log writer task
//!
//! A single task drains the merged log queue in arrival order. Every line is
//! timestamped, tagged with its source and appended to the device log file,
//! then forwarded to the event filter.
//!
//! A file error is fatal: the writer records the failure, reports it on the
//! event stream and stops. Channel workers keep running; their log sends are
//! simply dropped from then on.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use sb_protocol::{LogEventFilter, LogLine};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use crate::config::event_path_for;
use crate::error::SwitchboardError;
use crate::events::SwitchboardEvent;
use crate::log_filter::FilterMessage;

/// Marker written before switching to the next rotated file
pub const ROTATE_LOG_MESSAGE: &str = "Rotating from log file";

/// Marker written before switching to a caller-chosen file
pub const NEW_LOG_FILE_MESSAGE: &str = "Starting new log file at";

/// Marker written when the rotation threshold changes
pub const CHANGE_MAX_LOG_SIZE: &str = "Changing max_log_size";

/// Messages accepted by the log writer, in arrival order
#[derive(Debug)]
pub(crate) enum LogMessage {
    /// A device line or coordinator note
    Line(LogLine),
    /// Continue in a new log file (and a matching event file)
    StartNewLog {
        path: PathBuf,
        reply: oneshot::Sender<Result<(), SwitchboardError>>,
    },
    /// Change the rotation threshold
    SetMaxLogSize {
        size: u64,
        reply: oneshot::Sender<Result<(), SwitchboardError>>,
    },
    /// Add an event filter at this point of the stream
    AddFilter {
        filter: LogEventFilter,
        reply: oneshot::Sender<Result<(), SwitchboardError>>,
    },
    /// Reply once everything queued so far is on disk, events included
    Flush {
        reply: oneshot::Sender<Result<(), SwitchboardError>>,
    },
    /// Stop after flushing
    Shutdown,
}

/// Which half of the log pipeline stopped, and why
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum PipelineFailure {
    Writer(String),
    Filter(String),
}

impl PipelineFailure {
    pub(crate) fn to_error(&self) -> SwitchboardError {
        match self {
            PipelineFailure::Writer(reason) => SwitchboardError::LogWriterFailed(reason.clone()),
            PipelineFailure::Filter(reason) => SwitchboardError::LogFilterFailed(reason.clone()),
        }
    }
}

pub(crate) type FailureTx = Arc<watch::Sender<Option<PipelineFailure>>>;

/// Next rotated name: `dut.txt` → `dut.00001.txt` → `dut.00002.txt`
pub fn next_log_path(path: &Path) -> PathBuf {
    let ext = path
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let (base, counter) = match stem.rsplit_once('.') {
        Some((base, n)) if n.len() == 5 && n.bytes().all(|b| b.is_ascii_digit()) => {
            (base.to_string(), n.parse::<u32>().unwrap_or(0))
        }
        _ => (stem, 0),
    };
    path.with_file_name(format!("{}.{:05}{}", base, counter + 1, ext))
}

pub(crate) fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn describe(path: &Path, e: io::Error) -> String {
    format!("{}: {}", path.display(), e)
}

/// Open `path` for appending, creating parent directories
pub(crate) async fn open_append(path: &Path) -> Result<(File, u64), String> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| describe(path, e))?;
    }
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .map_err(|e| describe(path, e))?;
    let size = file
        .metadata()
        .await
        .map(|m| m.len())
        .map_err(|e| describe(path, e))?;
    Ok((file, size))
}

pub(crate) struct LogWriter {
    path: PathBuf,
    file: File,
    size: u64,
    max_log_size: u64,
    filter_tx: mpsc::Sender<FilterMessage>,
    path_tx: watch::Sender<PathBuf>,
    event_tx: broadcast::Sender<SwitchboardEvent>,
    failure_tx: FailureTx,
    failed: bool,
}

impl LogWriter {
    /// Open the first log file
    pub(crate) async fn open(
        path: PathBuf,
        max_log_size: u64,
        filter_tx: mpsc::Sender<FilterMessage>,
        event_tx: broadcast::Sender<SwitchboardEvent>,
        failure_tx: FailureTx,
    ) -> Result<(Self, watch::Receiver<PathBuf>), SwitchboardError> {
        let (file, size) = open_append(&path)
            .await
            .map_err(SwitchboardError::LogWriterFailed)?;
        let (path_tx, path_rx) = watch::channel(path.clone());
        let writer = Self {
            path,
            file,
            size,
            max_log_size,
            filter_tx,
            path_tx,
            event_tx,
            failure_tx,
            failed: false,
        };
        Ok((writer, path_rx))
    }

    /// Drain `rx` until shutdown, all senders are gone, or a file error
    pub(crate) async fn run(mut self, mut rx: mpsc::Receiver<LogMessage>) -> Result<(), SwitchboardError> {
        info!("Log writer started at {}", self.path.display());

        while let Some(message) = rx.recv().await {
            match self.handle(message).await {
                Ok(true) => {}
                Ok(false) => break,
                Err(reason) => {
                    self.fail(&reason);
                    let _ = self.filter_tx.send(FilterMessage::Shutdown).await;
                    return Err(SwitchboardError::LogWriterFailed(reason));
                }
            }
        }

        let _ = self.file.flush().await;
        let _ = self.filter_tx.send(FilterMessage::Shutdown).await;
        info!("Log writer stopped");
        Ok(())
    }

    async fn handle(&mut self, message: LogMessage) -> Result<bool, String> {
        match message {
            LogMessage::Line(line) => self.write_line(line).await?,
            LogMessage::StartNewLog { path, reply } => {
                let result = self.start_new_log(path).await;
                self.reply(reply, &result);
                result?;
            }
            LogMessage::SetMaxLogSize { size, reply } => {
                let result = self.set_max_log_size(size).await;
                self.reply(reply, &result);
                result?;
            }
            LogMessage::AddFilter { filter, reply } => {
                let _ = self
                    .filter_tx
                    .send(FilterMessage::AddFilter { filter, reply })
                    .await;
            }
            LogMessage::Flush { reply } => {
                let result = self
                    .file
                    .flush()
                    .await
                    .map_err(|e| describe(&self.path, e));
                match result {
                    Ok(()) => {
                        let _ = self.filter_tx.send(FilterMessage::Flush { reply }).await;
                    }
                    Err(reason) => {
                        self.reply(reply, &Err(reason.clone()));
                        return Err(reason);
                    }
                }
            }
            LogMessage::Shutdown => return Ok(false),
        }
        Ok(true)
    }

    /// Record the failure before answering, so callers observe it at once
    fn reply(
        &mut self,
        reply: oneshot::Sender<Result<(), SwitchboardError>>,
        result: &Result<(), String>,
    ) {
        if let Err(reason) = result {
            self.fail(reason);
        }
        let _ = reply.send(
            result
                .clone()
                .map_err(SwitchboardError::LogWriterFailed),
        );
    }

    fn fail(&mut self, reason: &str) {
        if self.failed {
            return;
        }
        self.failed = true;
        warn!("Log writer failed: {}", reason);
        self.failure_tx
            .send_replace(Some(PipelineFailure::Writer(reason.to_string())));
        let _ = self.event_tx.send(SwitchboardEvent::LogWriterFailed {
            reason: reason.to_string(),
        });
    }

    async fn append(&mut self, entry: &str) -> Result<(), String> {
        self.file
            .write_all(entry.as_bytes())
            .await
            .map_err(|e| describe(&self.path, e))?;
        self.file
            .flush()
            .await
            .map_err(|e| describe(&self.path, e))?;
        self.size += entry.len() as u64;
        Ok(())
    }

    async fn forward(&self, line: LogLine, entry: String) {
        let _ = self
            .filter_tx
            .send(FilterMessage::Line {
                line,
                entry,
                log_filename: file_name(&self.path),
            })
            .await;
    }

    async fn write_line(&mut self, line: LogLine) -> Result<(), String> {
        let entry = line.to_log_entry();
        self.append(&entry).await?;
        self.forward(line, entry).await;
        if self.max_log_size > 0 && self.size >= self.max_log_size {
            self.rotate().await?;
        }
        Ok(())
    }

    async fn write_marker(&mut self, text: String) -> Result<(), String> {
        let line = LogLine::marker(text);
        let entry = line.to_log_entry();
        self.append(&entry).await?;
        self.forward(line, entry).await;
        Ok(())
    }

    async fn rotate(&mut self) -> Result<(), String> {
        let next = next_log_path(&self.path);
        self.write_marker(format!(
            "{} {} to {}",
            ROTATE_LOG_MESSAGE,
            file_name(&self.path),
            file_name(&next)
        ))
        .await?;
        info!("Rotating log {} to {}", self.path.display(), next.display());
        self.switch_to(next, false).await
    }

    async fn start_new_log(&mut self, path: PathBuf) -> Result<(), String> {
        self.write_marker(format!("{} {}", NEW_LOG_FILE_MESSAGE, path.display()))
            .await?;
        info!("Starting new log file at {}", path.display());
        self.switch_to(path, true).await
    }

    async fn set_max_log_size(&mut self, size: u64) -> Result<(), String> {
        self.write_marker(format!(
            "{} from {} to {}",
            CHANGE_MAX_LOG_SIZE, self.max_log_size, size
        ))
        .await?;
        debug!("max_log_size {} -> {}", self.max_log_size, size);
        self.max_log_size = size;
        Ok(())
    }

    async fn switch_to(&mut self, path: PathBuf, new_event_file: bool) -> Result<(), String> {
        let _ = self.file.flush().await;
        let (file, size) = open_append(&path).await?;
        self.file = file;
        self.size = size;
        let from = std::mem::replace(&mut self.path, path);
        self.path_tx.send_replace(self.path.clone());
        if new_event_file {
            let _ = self
                .filter_tx
                .send(FilterMessage::NewEventFile(event_path_for(&self.path)))
                .await;
        }
        let _ = self.event_tx.send(SwitchboardEvent::LogFileChanged {
            from,
            to: self.path.clone(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sb_protocol::LogSource;

    struct Rig {
        tx: mpsc::Sender<LogMessage>,
        filter_rx: mpsc::Receiver<FilterMessage>,
        path_rx: watch::Receiver<PathBuf>,
        failure_rx: watch::Receiver<Option<PipelineFailure>>,
        events: broadcast::Receiver<SwitchboardEvent>,
        task: tokio::task::JoinHandle<Result<(), SwitchboardError>>,
    }

    async fn rig(path: PathBuf, max_log_size: u64) -> Rig {
        let (filter_tx, filter_rx) = mpsc::channel(64);
        let (event_tx, events) = broadcast::channel(64);
        let (failure_tx, failure_rx) = watch::channel(None);
        let (writer, path_rx) =
            LogWriter::open(path, max_log_size, filter_tx, event_tx, Arc::new(failure_tx))
                .await
                .unwrap();
        let (tx, rx) = mpsc::channel(64);
        let task = tokio::spawn(writer.run(rx));
        Rig {
            tx,
            filter_rx,
            path_rx,
            failure_rx,
            events,
            task,
        }
    }

    async fn flush(tx: &mpsc::Sender<LogMessage>) {
        let (reply, rx) = oneshot::channel();
        tx.send(LogMessage::Flush { reply }).await.unwrap();
        drop(rx);
    }

    #[test]
    fn test_next_log_path() {
        assert_eq!(
            next_log_path(Path::new("/logs/dut-1700000000.txt")),
            PathBuf::from("/logs/dut-1700000000.00001.txt")
        );
        assert_eq!(
            next_log_path(Path::new("/logs/dut.00009.txt")),
            PathBuf::from("/logs/dut.00010.txt")
        );
        assert_eq!(
            next_log_path(Path::new("dut.1234.txt")),
            PathBuf::from("dut.1234.00001.txt")
        );
    }

    #[tokio::test]
    async fn test_lines_written_in_order_and_forwarded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dut.txt");
        let mut rig = rig(path.clone(), 0).await;

        rig.tx
            .send(LogMessage::Line(LogLine::from_channel(0, "one\n", true)))
            .await
            .unwrap();
        rig.tx
            .send(LogMessage::Line(LogLine::note("hello")))
            .await
            .unwrap();
        rig.tx
            .send(LogMessage::Line(LogLine::from_channel(1, "partial", false)))
            .await
            .unwrap();
        rig.tx.send(LogMessage::Shutdown).await.unwrap();
        rig.task.await.unwrap().unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].ends_with("SB-0: one"));
        assert!(lines[1].ends_with("SB-M: Note: hello"));
        assert!(lines[2].ends_with("SB-1: partial[NO EOL]"));

        let mut forwarded = Vec::new();
        while let Some(message) = rig.filter_rx.recv().await {
            if let FilterMessage::Line { line, log_filename, .. } = message {
                assert_eq!(log_filename, "dut.txt");
                forwarded.push(line.source);
            }
        }
        assert_eq!(
            forwarded,
            vec![LogSource::Channel(0), LogSource::Note, LogSource::Channel(1)]
        );
    }

    #[tokio::test]
    async fn test_rotation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dut.txt");
        let mut rig = rig(path.clone(), 64).await;

        for i in 0..4 {
            let text = format!("line {} with some padding to fill the file\n", i);
            rig.tx
                .send(LogMessage::Line(LogLine::from_channel(0, text, true)))
                .await
                .unwrap();
        }
        flush(&rig.tx).await;
        rig.tx.send(LogMessage::Shutdown).await.unwrap();
        rig.task.await.unwrap().unwrap();

        let first = std::fs::read_to_string(&path).unwrap();
        assert!(first.contains("Rotating from log file dut.txt to dut.00001.txt"));
        let second = std::fs::read_to_string(dir.path().join("dut.00001.txt")).unwrap();
        assert!(second.contains("Rotating from log file dut.00001.txt to dut.00002.txt"));
        assert!(dir.path().join("dut.00002.txt").exists());
        assert_eq!(*rig.path_rx.borrow(), dir.path().join("dut.00004.txt"));

        let mut changes = 0;
        while let Ok(event) = rig.events.try_recv() {
            if matches!(event, SwitchboardEvent::LogFileChanged { .. }) {
                changes += 1;
            }
        }
        assert_eq!(changes, 4);
    }

    #[tokio::test]
    async fn test_start_new_log_and_max_size_markers() {
        let dir = tempfile::tempdir().unwrap();
        let first = dir.path().join("a.txt");
        let second = dir.path().join("nested").join("b.txt");
        let mut rig = rig(first.clone(), 0).await;

        let (reply, rx) = oneshot::channel();
        rig.tx
            .send(LogMessage::SetMaxLogSize { size: 4096, reply })
            .await
            .unwrap();
        rx.await.unwrap().unwrap();

        let (reply, rx) = oneshot::channel();
        rig.tx
            .send(LogMessage::StartNewLog {
                path: second.clone(),
                reply,
            })
            .await
            .unwrap();
        rx.await.unwrap().unwrap();
        assert_eq!(*rig.path_rx.borrow(), second);

        let text = std::fs::read_to_string(&first).unwrap();
        assert!(text.contains("Changing max_log_size from 0 to 4096"));
        assert!(text.contains(&format!("Starting new log file at {}", second.display())));

        let mut new_event_file = None;
        rig.tx.send(LogMessage::Shutdown).await.unwrap();
        while let Some(message) = rig.filter_rx.recv().await {
            if let FilterMessage::NewEventFile(path) = message {
                new_event_file = Some(path);
            }
        }
        assert_eq!(new_event_file, Some(dir.path().join("nested").join("b-events.txt")));
    }

    #[tokio::test]
    async fn test_unwritable_log_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, b"not a directory").unwrap();
        let mut rig = rig(dir.path().join("dut.txt"), 0).await;

        let (reply, rx) = oneshot::channel();
        rig.tx
            .send(LogMessage::StartNewLog {
                path: blocker.join("dut.txt"),
                reply,
            })
            .await
            .unwrap();
        assert!(matches!(
            rx.await.unwrap(),
            Err(SwitchboardError::LogWriterFailed(_))
        ));
        assert!(matches!(
            *rig.failure_rx.borrow(),
            Some(PipelineFailure::Writer(_))
        ));
        assert!(matches!(
            rig.task.await.unwrap(),
            Err(SwitchboardError::LogWriterFailed(_))
        ));

        let mut reported = false;
        while let Ok(event) = rig.events.try_recv() {
            reported |= matches!(event, SwitchboardEvent::LogWriterFailed { .. });
        }
        assert!(reported);
    }
}
