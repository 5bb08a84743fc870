use crate::clock::{Clock, SystemClock};
use crate::config::LoggerConfig;
use crate::error::{Result, ScribeError};
use crate::logs::format::{self, Level, LogEntry};
use crate::logs::registry::RegistryInner;
use crate::logs::writer::LogWriter;
use std::backtrace::{Backtrace, BacktraceStatus};
use std::error::Error;
use std::fmt;
use std::path::Path;
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

/// Default time a standalone handle waits for its writer to drain
const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Caller-facing logger bound to one [`LogWriter`]
///
/// Cloning is cheap and clones are the same logger: [`LoggerHandle::ptr_eq`]
/// tells whether two handles share a writer.
#[derive(Clone)]
pub struct LoggerHandle {
    inner: Arc<HandleInner>,
}

struct HandleInner {
    writer: LogWriter,
    clock: Arc<dyn Clock>,
    drain_timeout: Duration,
    /// Set once, when a registry adopts the handle
    registry: OnceLock<Weak<RegistryInner>>,
}

impl LoggerHandle {
    /// Wrap a running writer, using the system clock
    pub fn new(writer: LogWriter) -> Self {
        Self::with_clock(writer, Arc::new(SystemClock), DEFAULT_DRAIN_TIMEOUT)
    }

    pub fn with_clock(writer: LogWriter, clock: Arc<dyn Clock>, drain_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                writer,
                clock,
                drain_timeout,
                registry: OnceLock::new(),
            }),
        }
    }

    /// Open a standalone logger (not tracked by any registry)
    pub fn open(config: LoggerConfig) -> Result<Self> {
        config.prepare()?;
        Ok(Self::new(LogWriter::open(config)?))
    }

    pub fn error(&self, message: &str) {
        self.record(Level::Error, message, None);
    }

    pub fn error_with(&self, message: &str, error: &(dyn Error + 'static)) {
        self.record(Level::Error, message, Some(error));
    }

    pub fn warn(&self, message: &str) {
        self.record(Level::Warning, message, None);
    }

    pub fn warn_with(&self, message: &str, error: &(dyn Error + 'static)) {
        self.record(Level::Warning, message, Some(error));
    }

    pub fn info(&self, message: &str) {
        self.record(Level::Info, message, None);
    }

    pub fn info_with(&self, message: &str, error: &(dyn Error + 'static)) {
        self.record(Level::Info, message, Some(error));
    }

    pub fn log(&self, message: &str) {
        self.record(Level::Log, message, None);
    }

    pub fn log_with(&self, message: &str, error: &(dyn Error + 'static)) {
        self.record(Level::Log, message, Some(error));
    }

    pub fn exception(&self, message: &str) {
        self.record(Level::Exception, message, None);
    }

    pub fn exception_with(&self, message: &str, error: &(dyn Error + 'static)) {
        self.record(Level::Exception, message, Some(error));
    }

    /// Timestamp, build and queue one entry
    ///
    /// Entries logged after the handle stopped are reported to the diagnostic
    /// sink instead of the file.
    pub fn record(&self, level: Level, message: &str, error: Option<&(dyn Error + 'static)>) {
        let mut entry = LogEntry::new(self.inner.clock.now(), level, message);
        if let Some(error) = error {
            let (error_message, frames) = render_error(error);
            entry = entry.with_error(error_message, frames);
        }

        if let Err(e) = self.inner.writer.enqueue(entry) {
            self.inner.writer.diagnostics().report(
                self.short_name(),
                &format!("Dropped {} entry {:?}: {}", level, message, e),
            );
        }
    }

    /// Whether the backing file's retention window has passed
    pub fn needs_rotation(&self) -> bool {
        self.inner
            .writer
            .is_due_for_rotation(self.inner.clock.today())
    }

    pub fn short_name(&self) -> &str {
        self.inner.writer.config().logical_name()
    }

    pub fn retention_days(&self) -> u32 {
        self.inner.writer.config().retention_days()
    }

    pub fn file_path(&self) -> &Path {
        self.inner.writer.path()
    }

    pub fn config(&self) -> &LoggerConfig {
        self.inner.writer.config()
    }

    pub fn column_delimiter(&self) -> &'static str {
        format::COLUMN_DELIMITER
    }

    pub fn line_delimiter(&self) -> &'static str {
        format::LINE_DELIMITER
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.writer.is_closed()
    }

    /// Entries logged but not yet written
    pub fn pending(&self) -> u64 {
        self.inner.writer.pending()
    }

    /// Whether nothing is queued and no write is in progress
    pub fn safe_to_close(&self) -> bool {
        self.inner.writer.is_idle()
    }

    /// Entries the writer failed to append so far
    pub fn write_failures(&self) -> u64 {
        self.inner.writer.write_failures()
    }

    /// Whether both handles are the same logger instance
    pub fn ptr_eq(a: &LoggerHandle, b: &LoggerHandle) -> bool {
        Arc::ptr_eq(&a.inner, &b.inner)
    }

    /// Detach from the owning registry, then drain and close the file
    ///
    /// A registered handle drains while the registry is locked, so no new
    /// logger for the same file can open until this one has closed. Uses the
    /// registry's drain timeout (5s for standalone handles). Safe to call
    /// repeatedly.
    pub async fn stop(&self) -> bool {
        self.stop_with_timeout(self.inner.drain_timeout).await
    }

    pub async fn stop_with_timeout(&self, timeout: Duration) -> bool {
        match self.inner.registry.get().and_then(Weak::upgrade) {
            Some(registry) => registry.detach_and_retire(self, timeout).await,
            None => self.retire(timeout).await,
        }
    }

    /// Drain and close without touching the registry
    pub(crate) async fn retire(&self, timeout: Duration) -> bool {
        self.inner.writer.stop_and_drain(timeout).await
    }

    /// Record the owning registry; fails if another registry already owns it
    pub(crate) fn attach(&self, registry: &Arc<RegistryInner>) -> Result<()> {
        let owner = self
            .inner
            .registry
            .get_or_init(|| Arc::downgrade(registry));
        if owner.ptr_eq(&Arc::downgrade(registry)) {
            Ok(())
        } else {
            Err(ScribeError::LoggerAlreadyExists(format!(
                "{} is owned by another registry",
                self.short_name()
            )))
        }
    }

    pub(crate) fn downgrade(&self) -> WeakLoggerHandle {
        WeakLoggerHandle(Arc::downgrade(&self.inner))
    }
}

impl fmt::Debug for LoggerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoggerHandle")
            .field("name", &self.short_name())
            .field("path", &self.file_path())
            .field("retention_days", &self.retention_days())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

/// Non-owning reference, used where a strong one would form a cycle
#[derive(Clone)]
pub(crate) struct WeakLoggerHandle(Weak<HandleInner>);

impl WeakLoggerHandle {
    pub(crate) fn upgrade(&self) -> Option<LoggerHandle> {
        self.0.upgrade().map(|inner| LoggerHandle { inner })
    }
}

/// Split an error into its message and its frames: the error itself, each
/// `source()`, then the call-site backtrace when `RUST_BACKTRACE` enables one
fn render_error(error: &(dyn Error + 'static)) -> (String, Vec<String>) {
    let error_message = error.to_string().lines().collect::<Vec<_>>().join(" ");

    let mut frames: Vec<String> = error.to_string().lines().map(str::to_string).collect();
    let mut source = error.source();
    while let Some(cause) = source {
        frames.extend(
            cause
                .to_string()
                .lines()
                .map(|line| format!("caused by: {}", line)),
        );
        source = cause.source();
    }

    let backtrace = Backtrace::capture();
    if backtrace.status() == BacktraceStatus::Captured {
        frames.extend(
            backtrace
                .to_string()
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .map(str::to_string),
        );
    }

    if frames.is_empty() {
        frames.push(std::any::type_name_of_val(error).to_string());
    }

    (error_message, frames)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::logs::format::{COLUMN_DELIMITER, LINE_DELIMITER};
    use chrono::{Local, TimeZone};
    use std::io;
    use tempfile::TempDir;

    #[derive(Debug)]
    struct Wrapped(io::Error);

    impl fmt::Display for Wrapped {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "request failed")
        }
    }

    impl Error for Wrapped {
        fn source(&self) -> Option<&(dyn Error + 'static)> {
            Some(&self.0)
        }
    }

    fn open_handle(dir: &Path, clock: Arc<ManualClock>, retention_days: u32) -> LoggerHandle {
        let config =
            LoggerConfig::new(dir, "svc", retention_days, clock.today()).unwrap();
        config.prepare().unwrap();
        let writer = LogWriter::open(config).unwrap();
        LoggerHandle::with_clock(writer, clock, Duration::from_secs(5))
    }

    #[tokio::test]
    async fn test_every_level_reaches_the_file() {
        let temp_dir = TempDir::new().unwrap();
        let clock = Arc::new(ManualClock::starting_now());
        let handle = open_handle(temp_dir.path(), clock, 10);

        handle.error("e");
        handle.warn("w");
        handle.info("i");
        handle.log("l");
        handle.exception("x");
        assert!(handle.stop().await);

        let content = std::fs::read_to_string(handle.file_path()).unwrap();
        let types: Vec<&str> = content
            .lines()
            .skip(1)
            .map(|line| line.split(COLUMN_DELIMITER).nth(2).unwrap())
            .collect();
        assert_eq!(types, vec!["Error", "Warn", "Info", "Log", "Exception"]);
    }

    #[tokio::test]
    async fn test_timestamp_comes_from_clock_at_call_time() {
        let temp_dir = TempDir::new().unwrap();
        let at = Local.with_ymd_and_hms(2024, 2, 29, 23, 59, 58).unwrap();
        let clock = Arc::new(ManualClock::new(at));
        let handle = open_handle(temp_dir.path(), clock, 10);

        handle.info("leap");
        assert!(handle.stop().await);

        let content = std::fs::read_to_string(handle.file_path()).unwrap();
        let line = content.lines().nth(1).unwrap();
        assert!(line.starts_with(&format!("23:59:58.000{}2024-02-29", COLUMN_DELIMITER)));
    }

    #[tokio::test]
    async fn test_attached_error_renders_source_chain() {
        let temp_dir = TempDir::new().unwrap();
        let clock = Arc::new(ManualClock::starting_now());
        let handle = open_handle(temp_dir.path(), clock, 10);

        let error = Wrapped(io::Error::new(io::ErrorKind::BrokenPipe, "pipe closed"));
        handle.warn_with("upstream", &error);
        assert!(handle.stop().await);

        let content = std::fs::read_to_string(handle.file_path()).unwrap();
        let line = content.lines().nth(1).unwrap();
        let columns: Vec<&str> = line.split(COLUMN_DELIMITER).collect();
        assert_eq!(columns.len(), 6);
        assert_eq!(columns[3], "upstream");
        assert_eq!(columns[4], "request failed");

        let frames: Vec<&str> = columns[5].split(LINE_DELIMITER).collect();
        assert_eq!(frames[0], "request failed");
        assert_eq!(frames[1], "caused by: pipe closed");
    }

    #[tokio::test]
    async fn test_needs_rotation_follows_clock() {
        let temp_dir = TempDir::new().unwrap();
        let clock = Arc::new(ManualClock::starting_now());
        let handle = open_handle(temp_dir.path(), clock.clone(), 1);

        assert!(!handle.needs_rotation());
        clock.advance_days(1);
        assert!(!handle.needs_rotation());
        clock.advance_days(1);
        assert!(handle.needs_rotation());

        handle.stop().await;
    }

    #[tokio::test]
    async fn test_logging_after_stop_does_not_touch_file() {
        let temp_dir = TempDir::new().unwrap();
        let clock = Arc::new(ManualClock::starting_now());
        let handle = open_handle(temp_dir.path(), clock, 10);

        handle.log("before");
        assert!(handle.stop().await);
        assert!(handle.is_stopped());

        handle.log("after");
        assert!(handle.stop().await);

        let content = std::fs::read_to_string(handle.file_path()).unwrap();
        assert!(content.contains("before"));
        assert!(!content.contains("after"));
    }

    #[tokio::test]
    async fn test_safe_to_close_after_drain() {
        let temp_dir = TempDir::new().unwrap();
        let clock = Arc::new(ManualClock::starting_now());
        let handle = open_handle(temp_dir.path(), clock, 10);
        assert!(handle.safe_to_close());

        for i in 0..50 {
            handle.info(&format!("entry {}", i));
        }
        assert!(handle.pending() <= 50);

        assert!(handle.stop().await);
        assert!(handle.safe_to_close());
        assert_eq!(handle.pending(), 0);
    }

    #[test]
    fn test_accessors() {
        let temp_dir = TempDir::new().unwrap();
        let clock = Arc::new(ManualClock::starting_now());
        let handle = open_handle(temp_dir.path(), clock.clone(), 4);

        assert_eq!(handle.short_name(), "svc");
        assert_eq!(handle.retention_days(), 4);
        assert_eq!(
            handle.file_path(),
            temp_dir
                .path()
                .join(format!("svc{}.log", clock.today().format("%Y-%m-%d")))
        );
        assert_eq!(handle.column_delimiter(), COLUMN_DELIMITER);
        assert_eq!(handle.line_delimiter(), LINE_DELIMITER);

        let clone = handle.clone();
        assert!(LoggerHandle::ptr_eq(&handle, &clone));
    }
}
