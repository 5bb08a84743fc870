use crate::config::LoggerConfig;
use crate::diagnostics::{DiagnosticSink, TracingSink};
use crate::error::{Result, ScribeError};
use crate::logs::format::{self, LogEntry};
use chrono::NaiveDate;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::thread;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

/// Destination of formatted records
///
/// Implemented for [`File`]; anything else that can take bytes (an in-memory
/// buffer, a fault-injecting wrapper) can stand in for it.
pub trait LogSink: Write + Send + 'static {
    /// Push written data to durable storage
    fn sync(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl LogSink for File {
    fn sync(&mut self) -> io::Result<()> {
        self.sync_all()
    }
}

/// Lifecycle of the background loop, as seen by stoppers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Running,
    /// Queue emptied, sink flushed and closed
    Drained,
    /// Gave up after a drain timeout; remaining entries were discarded
    Abandoned,
}

/// Knobs for constructing a [`LogWriter`]
#[derive(Clone)]
pub struct WriterOptions {
    /// Worker threads are named `<prefix>-<logical name>`
    pub thread_name_prefix: String,
    /// Where write failures are reported
    pub diagnostics: Arc<dyn DiagnosticSink>,
}

impl Default for WriterOptions {
    fn default() -> Self {
        Self {
            thread_name_prefix: "scribe-writer".to_string(),
            diagnostics: Arc::new(TracingSink),
        }
    }
}

/// LogWriter owns one log file and the single background thread that writes it
///
/// Producers push entries into an unbounded queue and never wait on disk I/O.
/// The worker thread formats, appends and flushes one entry at a time, in
/// queue order, until the queue is closed by [`LogWriter::stop_and_drain`].
pub struct LogWriter {
    config: LoggerConfig,
    path: PathBuf,
    sender: RwLock<Option<mpsc::UnboundedSender<LogEntry>>>,
    state: watch::Receiver<WorkerState>,
    abandon: Arc<AtomicBool>,
    failures: Arc<AtomicU64>,
    /// Entries queued or being written
    pending: Arc<AtomicU64>,
    diagnostics: Arc<dyn DiagnosticSink>,
}

impl LogWriter {
    /// Open the config's log file for append and start its writer thread
    ///
    /// # Arguments
    /// * `config` - Logger whose dated file is opened (created if missing)
    ///
    /// # Returns
    /// * `Ok(LogWriter)` - File open, header present, worker running
    /// * `Err(ScribeError)` - File could not be opened or the thread not started
    pub fn open(config: LoggerConfig) -> Result<Self> {
        Self::open_with(config, WriterOptions::default())
    }

    /// Open with custom options
    pub fn open_with(config: LoggerConfig, options: WriterOptions) -> Result<Self> {
        let path = config.file_path();
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| {
                ScribeError::LogFileError(format!("Failed to open {}: {}", path.display(), e))
            })?;

        let is_empty = file
            .metadata()
            .map_err(|e| {
                ScribeError::LogFileError(format!("Failed to stat {}: {}", path.display(), e))
            })?
            .len()
            == 0;

        if is_empty {
            write_header(&mut file).map_err(|e| {
                ScribeError::LogFileError(format!(
                    "Failed to write header to {}: {}",
                    path.display(),
                    e
                ))
            })?;
        }

        Self::spawn(config, path, file, options)
    }

    /// Start a writer over an arbitrary sink
    ///
    /// The sink is treated as fresh, so the header is written first.
    pub fn with_sink<S: LogSink>(
        config: LoggerConfig,
        mut sink: S,
        options: WriterOptions,
    ) -> Result<Self> {
        let path = config.file_path();
        write_header(&mut sink).map_err(|e| {
            ScribeError::LogFileError(format!("Failed to write header: {}", e))
        })?;
        Self::spawn(config, path, sink, options)
    }

    fn spawn<S: LogSink>(
        config: LoggerConfig,
        path: PathBuf,
        sink: S,
        options: WriterOptions,
    ) -> Result<Self> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(WorkerState::Running);
        let abandon = Arc::new(AtomicBool::new(false));
        let failures = Arc::new(AtomicU64::new(0));
        let pending = Arc::new(AtomicU64::new(0));

        let worker = Worker {
            name: config.logical_name().to_string(),
            receiver,
            sink,
            abandon: Arc::clone(&abandon),
            failures: Arc::clone(&failures),
            pending: Arc::clone(&pending),
            diagnostics: Arc::clone(&options.diagnostics),
            state: state_tx,
        };

        thread::Builder::new()
            .name(format!(
                "{}-{}",
                options.thread_name_prefix,
                config.logical_name()
            ))
            .spawn(move || worker.run())
            .map_err(|e| ScribeError::WorkerSpawnError(e.to_string()))?;

        tracing::debug!("Opened log writer for {}", path.display());

        Ok(Self {
            config,
            path,
            sender: RwLock::new(Some(sender)),
            state: state_rx,
            abandon,
            failures,
            pending,
            diagnostics: options.diagnostics,
        })
    }

    /// Queue an entry for the background thread
    ///
    /// Never blocks on file I/O. Fails with `WriterClosed` once the writer
    /// has been stopped.
    pub fn enqueue(&self, entry: LogEntry) -> Result<()> {
        let sender = self.sender.read().unwrap_or_else(|e| e.into_inner());
        let Some(tx) = sender.as_ref() else {
            return Err(ScribeError::WriterClosed(
                self.config.logical_name().to_string(),
            ));
        };

        // Counted before sending so the worker never sees the count below zero
        self.pending.fetch_add(1, Ordering::AcqRel);
        tx.send(entry).map_err(|_| {
            self.pending.fetch_sub(1, Ordering::AcqRel);
            ScribeError::WriterClosed(self.config.logical_name().to_string())
        })
    }

    /// Close the queue and wait for everything already queued to reach the file
    ///
    /// Returns `true` if the worker confirmed the drain within `timeout`. On
    /// timeout the worker is told to drop whatever is still queued and close
    /// the file after its current entry. Calling this again after the writer
    /// has stopped only reports the recorded outcome.
    pub async fn stop_and_drain(&self, timeout: Duration) -> bool {
        let sender = self
            .sender
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if sender.is_some() {
            tracing::debug!("Stopping log writer for {}", self.path.display());
        }
        drop(sender);

        let mut state = self.state.clone();
        let waited = tokio::time::timeout(
            timeout,
            state.wait_for(|s| *s != WorkerState::Running),
        )
        .await;

        match waited {
            Ok(Ok(final_state)) => *final_state == WorkerState::Drained,
            Ok(Err(_)) => {
                tracing::warn!(
                    "Log writer for {} exited without confirming drain",
                    self.path.display()
                );
                false
            }
            Err(_) => {
                self.abandon.store(true, Ordering::Release);
                tracing::warn!(
                    "Log writer for {} did not drain within {:?}",
                    self.path.display(),
                    timeout
                );
                false
            }
        }
    }

    /// True once `creation_date + retention_days` is strictly before `today`
    pub fn is_due_for_rotation(&self, today: NaiveDate) -> bool {
        self.config.is_due_for_rotation(today)
    }

    /// Whether the queue no longer accepts entries
    pub fn is_closed(&self) -> bool {
        self.sender
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .is_none()
            || *self.state.borrow() != WorkerState::Running
    }

    pub fn state(&self) -> WorkerState {
        *self.state.borrow()
    }

    /// Number of entries the worker failed to write
    pub fn write_failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Entries accepted but not yet written (including one in flight)
    pub fn pending(&self) -> u64 {
        self.pending.load(Ordering::Acquire)
    }

    /// Queue empty and no write in progress
    pub fn is_idle(&self) -> bool {
        self.pending() == 0
    }

    pub fn config(&self) -> &LoggerConfig {
        &self.config
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn diagnostics(&self) -> &Arc<dyn DiagnosticSink> {
        &self.diagnostics
    }
}

fn write_header<W: Write>(out: &mut W) -> io::Result<()> {
    out.write_all(format::header().as_bytes())?;
    out.write_all(b"\n")?;
    out.flush()
}

/// Append one newline-terminated record and flush it
///
/// If the sink fails after taking part of the line, the torn line is closed
/// with a newline so the next record starts on a line of its own.
fn append_line<W: Write>(out: &mut W, line: &[u8]) -> io::Result<()> {
    let mut written = 0;
    while written < line.len() {
        let failure = match out.write(&line[written..]) {
            Ok(0) => io::Error::new(io::ErrorKind::WriteZero, "log sink accepted no bytes"),
            Ok(n) => {
                written += n;
                continue;
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => e,
        };

        if written > 0 {
            // Best effort; the original failure is what gets reported
            let _ = out.write_all(b"\n").and_then(|_| out.flush());
        }
        return Err(failure);
    }
    out.flush()
}

/// State moved onto the writer thread
struct Worker<S: LogSink> {
    name: String,
    receiver: mpsc::UnboundedReceiver<LogEntry>,
    sink: S,
    abandon: Arc<AtomicBool>,
    failures: Arc<AtomicU64>,
    pending: Arc<AtomicU64>,
    diagnostics: Arc<dyn DiagnosticSink>,
    state: watch::Sender<WorkerState>,
}

impl<S: LogSink> Worker<S> {
    fn run(mut self) {
        let mut abandoned = false;

        while let Some(entry) = self.receiver.blocking_recv() {
            if self.abandon.load(Ordering::Acquire) {
                abandoned = true;
                let mut discarded = 1usize;
                self.receiver.close();
                while self.receiver.try_recv().is_ok() {
                    discarded += 1;
                }
                self.pending.fetch_sub(discarded as u64, Ordering::AcqRel);
                self.diagnostics.report(
                    &self.name,
                    &format!("Drain timed out, discarded {} queued entries", discarded),
                );
                break;
            }

            let mut line = format::format(&entry);
            line.push('\n');

            // Flush per entry so a reader tailing the file sees it right away
            let written = append_line(&mut self.sink, line.as_bytes());
            self.pending.fetch_sub(1, Ordering::AcqRel);

            if let Err(e) = written {
                self.failures.fetch_add(1, Ordering::Relaxed);
                self.diagnostics
                    .report(&self.name, &format!("Failed to write log entry: {}", e));
            }
        }

        if let Err(e) = self.sink.flush().and_then(|_| self.sink.sync()) {
            self.diagnostics
                .report(&self.name, &format!("Failed to flush log on close: {}", e));
        }

        let Worker { sink, state, .. } = self;
        drop(sink);

        let final_state = if abandoned {
            WorkerState::Abandoned
        } else {
            WorkerState::Drained
        };
        state.send_replace(final_state);
    }
}


#[cfg(test)]
mod tests {
    use super::testing::{FailingSink, SharedBuffer, SlowSink, TornSink};
    use super::*;
    use crate::diagnostics::testing::RecordingSink;
    use crate::logs::format::{Level, COLUMN_DELIMITER};
    use chrono::Local;
    use tempfile::TempDir;

    fn config_in(dir: &Path, name: &str) -> LoggerConfig {
        LoggerConfig::new(dir, name, 10, Local::now().date_naive()).unwrap()
    }

    fn entry(message: &str) -> LogEntry {
        LogEntry::new(Local::now(), Level::Log, message)
    }

    #[tokio::test]
    async fn test_open_writes_header_to_empty_file() {
        let temp_dir = TempDir::new().unwrap();
        let writer = LogWriter::open(config_in(temp_dir.path(), "svc")).unwrap();

        // Header is written synchronously, before any entry
        let content = std::fs::read_to_string(writer.path()).unwrap();
        assert_eq!(content, format!("{}\n", format::header()));

        assert!(writer.stop_and_drain(Duration::from_secs(5)).await);
        let content = std::fs::read_to_string(writer.path()).unwrap();
        assert_eq!(content.lines().count(), 1);
    }

    #[tokio::test]
    async fn test_open_existing_file_keeps_single_header() {
        let temp_dir = TempDir::new().unwrap();
        let config = config_in(temp_dir.path(), "svc");

        let first = LogWriter::open(config.clone()).unwrap();
        first.enqueue(entry("one")).unwrap();
        assert!(first.stop_and_drain(Duration::from_secs(5)).await);

        let second = LogWriter::open(config).unwrap();
        second.enqueue(entry("two")).unwrap();
        assert!(second.stop_and_drain(Duration::from_secs(5)).await);

        let content = std::fs::read_to_string(second.path()).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], format::header());
        assert!(lines[1].contains("one"));
        assert!(lines[2].contains("two"));
    }

    #[tokio::test]
    async fn test_entries_written_in_enqueue_order() {
        let temp_dir = TempDir::new().unwrap();
        let writer = LogWriter::open(config_in(temp_dir.path(), "svc")).unwrap();

        for i in 0..200 {
            writer.enqueue(entry(&format!("message-{}", i))).unwrap();
        }
        assert!(writer.stop_and_drain(Duration::from_secs(5)).await);

        let content = std::fs::read_to_string(writer.path()).unwrap();
        let messages: Vec<String> = content
            .lines()
            .skip(1)
            .map(|line| line.split(COLUMN_DELIMITER).nth(3).unwrap().to_string())
            .collect();
        let expected: Vec<String> = (0..200).map(|i| format!("message-{}", i)).collect();
        assert_eq!(messages, expected);
    }

    #[tokio::test]
    async fn test_enqueue_after_stop_is_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let writer = LogWriter::open(config_in(temp_dir.path(), "svc")).unwrap();

        assert!(writer.stop_and_drain(Duration::from_secs(5)).await);
        assert!(writer.is_closed());

        let result = writer.enqueue(entry("late"));
        assert!(matches!(result, Err(ScribeError::WriterClosed(_))));
    }

    #[tokio::test]
    async fn test_stop_twice_is_harmless() {
        let temp_dir = TempDir::new().unwrap();
        let writer = LogWriter::open(config_in(temp_dir.path(), "svc")).unwrap();
        writer.enqueue(entry("only")).unwrap();

        assert!(writer.stop_and_drain(Duration::from_secs(5)).await);
        let before = std::fs::read_to_string(writer.path()).unwrap();

        assert!(writer.stop_and_drain(Duration::from_secs(5)).await);
        let after = std::fs::read_to_string(writer.path()).unwrap();

        assert_eq!(before, after);
        assert_eq!(writer.state(), WorkerState::Drained);
    }

    #[tokio::test]
    async fn test_open_fails_when_directory_missing() {
        let temp_dir = TempDir::new().unwrap();
        let config = config_in(&temp_dir.path().join("missing"), "svc");

        let result = LogWriter::open(config);
        assert!(matches!(result, Err(ScribeError::LogFileError(_))));
    }

    #[tokio::test]
    async fn test_failed_writes_are_reported_and_skipped() {
        let temp_dir = TempDir::new().unwrap();
        let recorder = Arc::new(RecordingSink::default());
        let buffer = SharedBuffer::default();
        // Header (2 writes) and the first entry succeed
        let sink = FailingSink {
            inner: buffer.clone(),
            ok_writes: 3,
        };
        let options = WriterOptions {
            diagnostics: recorder.clone(),
            ..WriterOptions::default()
        };

        let writer = LogWriter::with_sink(config_in(temp_dir.path(), "svc"), sink, options).unwrap();
        writer.enqueue(entry("kept")).unwrap();
        writer.enqueue(entry("lost-1")).unwrap();
        writer.enqueue(entry("lost-2")).unwrap();

        assert!(writer.stop_and_drain(Duration::from_secs(5)).await);
        assert_eq!(writer.write_failures(), 2);

        let reports = recorder.reports();
        assert_eq!(reports.len(), 2);
        assert!(reports.iter().all(|(origin, _)| origin == "svc"));

        let content = buffer.contents();
        assert!(content.contains("kept"));
        assert!(!content.contains("lost"));
    }

    #[tokio::test]
    async fn test_drain_timeout_abandons_queue() {
        let temp_dir = TempDir::new().unwrap();
        let recorder = Arc::new(RecordingSink::default());
        let sink = SlowSink {
            inner: SharedBuffer::default(),
            delay: Duration::from_millis(20),
        };
        let options = WriterOptions {
            diagnostics: recorder.clone(),
            ..WriterOptions::default()
        };
        let writer = LogWriter::with_sink(config_in(temp_dir.path(), "slow"), sink, options).unwrap();

        for i in 0..100 {
            writer.enqueue(entry(&format!("m{}", i))).unwrap();
        }

        assert!(!writer.stop_and_drain(Duration::from_millis(50)).await);

        // The worker gives up after its current entry and closes the sink
        assert!(!writer.stop_and_drain(Duration::from_secs(5)).await);
        assert_eq!(writer.state(), WorkerState::Abandoned);
        assert_eq!(writer.pending(), 0);
        assert!(recorder
            .reports()
            .iter()
            .any(|(_, message)| message.contains("discarded")));
    }

    #[tokio::test]
    async fn test_pending_counts_queued_and_in_flight_entries() {
        let temp_dir = TempDir::new().unwrap();
        let sink = SlowSink {
            inner: SharedBuffer::default(),
            delay: Duration::from_millis(100),
        };
        let writer =
            LogWriter::with_sink(config_in(temp_dir.path(), "svc"), sink, WriterOptions::default())
                .unwrap();
        assert!(writer.is_idle());

        for i in 0..3 {
            writer.enqueue(entry(&format!("m{}", i))).unwrap();
        }
        // The first entry may already be on the worker, but it is not written yet
        assert_eq!(writer.pending(), 3);
        assert!(!writer.is_idle());

        assert!(writer.stop_and_drain(Duration::from_secs(5)).await);
        assert_eq!(writer.pending(), 0);
        assert!(writer.is_idle());

        // A rejected entry is not counted
        assert!(writer.enqueue(entry("late")).is_err());
        assert_eq!(writer.pending(), 0);
    }

    #[tokio::test]
    async fn test_torn_write_does_not_merge_next_record() {
        let temp_dir = TempDir::new().unwrap();
        let buffer = SharedBuffer::default();
        // Header takes two writes, the first entry is torn
        let sink = TornSink::new(buffer.clone(), 2);
        let writer =
            LogWriter::with_sink(config_in(temp_dir.path(), "svc"), sink, WriterOptions::default())
                .unwrap();

        writer.enqueue(entry("first-entry")).unwrap();
        writer.enqueue(entry("second-entry")).unwrap();
        assert!(writer.stop_and_drain(Duration::from_secs(5)).await);
        assert_eq!(writer.write_failures(), 1);

        let content = buffer.contents();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], format::header());
        assert!(!lines[1].contains("second-entry"));

        let columns: Vec<&str> = lines[2].split(COLUMN_DELIMITER).collect();
        assert_eq!(columns.len(), 6);
        assert_eq!(columns[3], "second-entry");
    }

    #[test]
    fn test_rotation_check_delegates_to_config() {
        let temp_dir = TempDir::new().unwrap();
        let created = chrono::NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let config = LoggerConfig::new(temp_dir.path(), "svc", 2, created).unwrap();
        let writer = LogWriter::with_sink(config, SharedBuffer::default(), WriterOptions::default())
            .unwrap();

        assert!(!writer.is_due_for_rotation(chrono::NaiveDate::from_ymd_opt(2024, 1, 3).unwrap()));
        assert!(writer.is_due_for_rotation(chrono::NaiveDate::from_ymd_opt(2024, 1, 4).unwrap()));
    }
}
