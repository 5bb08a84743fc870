use crate::clock::{Clock, SystemClock};
use crate::config::{canonical_dir, strip_log_extension, LoggerConfig, RegistrySettings};
use crate::diagnostics::{DiagnosticSink, TracingSink};
use crate::error::{Result, ScribeError};
use crate::logs::handle::{LoggerHandle, WeakLoggerHandle};
use crate::logs::writer::{LogWriter, WriterOptions};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::Mutex;

/// LoggerRegistry tracks every live logger of the host by logical name and by
/// canonical path
///
/// The registry is the only place loggers are created, rotated and retired.
/// Lookups check the retention window and swap in a freshly dated logger
/// when it has passed, so callers never get an expired handle. Clones share
/// the same set of loggers.
#[derive(Clone)]
pub struct LoggerRegistry {
    inner: Arc<RegistryInner>,
}

pub(crate) struct RegistryInner {
    loggers: Mutex<LoggerMap>,
    settings: RegistrySettings,
    clock: Arc<dyn Clock>,
    diagnostics: Arc<RegistryDiagnostics>,
}

/// Two keys, one handle
#[derive(Default)]
struct LoggerMap {
    by_name: HashMap<String, LoggerHandle>,
    by_path: HashMap<PathBuf, LoggerHandle>,
}

impl LoggerMap {
    fn insert(&mut self, handle: &LoggerHandle) {
        self.by_name
            .insert(handle.short_name().to_string(), handle.clone());
        self.by_path
            .insert(handle.config().canonical_key(), handle.clone());
    }

    /// Drop both keys, but only where they still point at this handle
    fn remove(&mut self, handle: &LoggerHandle) -> bool {
        let before = self.by_name.len() + self.by_path.len();
        self.by_name.retain(|_, h| !LoggerHandle::ptr_eq(h, handle));
        self.by_path.retain(|_, h| !LoggerHandle::ptr_eq(h, handle));
        before != self.by_name.len() + self.by_path.len()
    }

    /// Every registered handle exactly once
    fn distinct(&self) -> Vec<LoggerHandle> {
        let mut handles: Vec<LoggerHandle> = Vec::with_capacity(self.by_name.len());
        for handle in self.by_name.values().chain(self.by_path.values()) {
            if !handles.iter().any(|h| LoggerHandle::ptr_eq(h, handle)) {
                handles.push(handle.clone());
            }
        }
        handles
    }

    fn clear(&mut self) {
        self.by_name.clear();
        self.by_path.clear();
    }
}

/// Outcome of [`LoggerRegistry::shutdown_all`]
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Loggers whose queue reached the file before the timeout
    pub drained: Vec<String>,
    /// Loggers that did not confirm their drain in time (or whose stop was interrupted)
    pub timed_out: Vec<String>,
    /// Loggers that failed to write some entries, with the failure count
    pub write_failures: Vec<(String, u64)>,
}

impl ShutdownReport {
    /// Every logger drained and nothing failed to write
    pub fn is_clean(&self) -> bool {
        self.timed_out.is_empty() && self.write_failures.is_empty()
    }

    /// Number of loggers that were stopped
    pub fn total(&self) -> usize {
        self.drained.len() + self.timed_out.len()
    }

    fn record(&mut self, name: String, drained: bool, failures: u64) {
        if failures > 0 {
            self.write_failures.push((name.clone(), failures));
        }
        if drained {
            self.drained.push(name);
        } else {
            self.timed_out.push(name);
        }
    }
}

impl LoggerRegistry {
    /// Create an empty registry using the system clock
    pub fn new(settings: RegistrySettings) -> Self {
        Self::with_clock(settings, Arc::new(SystemClock))
    }

    pub fn with_clock(settings: RegistrySettings, clock: Arc<dyn Clock>) -> Self {
        Self::with_parts(settings, clock, Arc::new(TracingSink))
    }

    /// Create a registry with an explicit clock and fallback diagnostic sink
    ///
    /// `fallback` receives failures when no diagnostic logger is designated,
    /// or when the designated logger is the one failing.
    pub fn with_parts(
        settings: RegistrySettings,
        clock: Arc<dyn Clock>,
        fallback: Arc<dyn DiagnosticSink>,
    ) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                loggers: Mutex::new(LoggerMap::default()),
                settings,
                clock,
                diagnostics: Arc::new(RegistryDiagnostics {
                    designated: RwLock::new(None),
                    fallback,
                }),
            }),
        }
    }

    /// Load settings from a TOML or JSON file and build a registry from them
    pub fn from_settings_file(path: &Path) -> Result<Self> {
        Ok(Self::new(RegistrySettings::from_file(path)?))
    }

    pub fn settings(&self) -> &RegistrySettings {
        &self.inner.settings
    }

    /// Return the logger registered under `logical_name`, creating it in
    /// `directory` with the default retention if there is none
    pub async fn get_or_create<P: AsRef<Path>>(
        &self,
        logical_name: &str,
        directory: P,
    ) -> Result<LoggerHandle> {
        self.get_or_create_with_retention(
            logical_name,
            directory,
            self.inner.settings.retention_days,
        )
        .await
    }

    /// Like [`LoggerRegistry::get_or_create`], in the configured default directory
    pub async fn get_or_create_default(&self, logical_name: &str) -> Result<LoggerHandle> {
        let directory = self.inner.settings.directory.clone().ok_or_else(|| {
            ScribeError::ConfigError("No default log directory configured".to_string())
        })?;
        self.get_or_create(logical_name, directory).await
    }

    /// Return the existing logger or create one
    ///
    /// # Arguments
    /// * `logical_name` - Short name, `.log` suffix optional
    /// * `directory` - Directory of the log file (created if missing)
    /// * `retention_days` - Days before the file is rotated
    ///
    /// # Returns
    /// * `Ok(LoggerHandle)` - Existing handle, its rotated replacement, or a new one
    /// * `Err(ScribeError)` - The log file could not be prepared or opened
    pub async fn get_or_create_with_retention<P: AsRef<Path>>(
        &self,
        logical_name: &str,
        directory: P,
        retention_days: u32,
    ) -> Result<LoggerHandle> {
        let name = strip_log_extension(logical_name);
        let mut loggers = self.inner.loggers.lock().await;

        if let Some(existing) = loggers.by_name.get(name).cloned() {
            if existing.retention_days() != retention_days {
                tracing::warn!(
                    "Logger {} already exists with retention {} days, ignoring requested {}",
                    name,
                    existing.retention_days(),
                    retention_days
                );
            }
            if !existing.needs_rotation() {
                return Ok(existing);
            }
            return self.inner.rotate(&mut loggers, existing).await;
        }

        let config = LoggerConfig::new(
            directory,
            name,
            retention_days,
            self.inner.clock.today(),
        )?;
        let handle = self.inner.build(config)?;
        loggers.insert(&handle);
        self.inner.diagnostics.offer(&self.inner.settings, &handle);

        tracing::info!(
            "Created logger {} at {}",
            handle.short_name(),
            handle.file_path().display()
        );

        Ok(handle)
    }

    /// Look up a logger by logical name, rotating it if its window has passed
    pub async fn get_by_name(&self, logical_name: &str) -> Option<LoggerHandle> {
        let mut loggers = self.inner.loggers.lock().await;
        let existing = loggers
            .by_name
            .get(strip_log_extension(logical_name))
            .cloned()?;
        self.inner.refresh(&mut loggers, existing).await
    }

    /// Look up a logger by path
    ///
    /// Accepts `dir/name`, `dir/name.log` or the dated file path.
    pub async fn get_by_path<P: AsRef<Path>>(&self, path: P) -> Option<LoggerHandle> {
        let path = path.as_ref();
        let mut loggers = self.inner.loggers.lock().await;
        let existing = find_by_path(&loggers, path)?;
        self.inner.refresh(&mut loggers, existing).await
    }

    pub async fn contains_name(&self, logical_name: &str) -> bool {
        self.inner
            .loggers
            .lock()
            .await
            .by_name
            .contains_key(strip_log_extension(logical_name))
    }

    pub async fn contains_path<P: AsRef<Path>>(&self, path: P) -> bool {
        let loggers = self.inner.loggers.lock().await;
        find_by_path(&loggers, path.as_ref()).is_some()
    }

    /// Number of distinct live loggers
    pub async fn len(&self) -> usize {
        self.inner.loggers.lock().await.distinct().len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Logical names of all live loggers, sorted
    pub async fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .inner
            .loggers
            .lock()
            .await
            .by_name
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Adopt a handle built outside the registry
    pub async fn register(&self, handle: LoggerHandle) -> Result<LoggerHandle> {
        let mut loggers = self.inner.loggers.lock().await;
        if loggers.by_name.contains_key(handle.short_name())
            || loggers
                .by_path
                .contains_key(&handle.config().canonical_key())
        {
            return Err(ScribeError::LoggerAlreadyExists(
                handle.short_name().to_string(),
            ));
        }
        handle.attach(&self.inner)?;
        loggers.insert(&handle);
        self.inner.diagnostics.offer(&self.inner.settings, &handle);
        Ok(handle)
    }

    /// Unregister a logger and drain it
    ///
    /// The registry stays locked until the drain finishes, so a concurrent
    /// `get_or_create` for the same name waits and then opens a fresh writer.
    /// Returns whether the drain completed within the configured timeout.
    pub async fn remove(&self, handle: &LoggerHandle) -> bool {
        self.inner
            .detach_and_retire(handle, self.inner.settings.drain_timeout())
            .await
    }

    /// Remove by logical name; `None` if no such logger is registered
    pub async fn remove_by_name(&self, logical_name: &str) -> Option<bool> {
        let mut loggers = self.inner.loggers.lock().await;
        let handle = loggers
            .by_name
            .get(strip_log_extension(logical_name))
            .cloned()?;
        Some(
            self.inner
                .retire_registered(&mut loggers, &handle, self.inner.settings.drain_timeout())
                .await,
        )
    }

    /// Remove by path; `None` if no such logger is registered
    pub async fn remove_by_path<P: AsRef<Path>>(&self, path: P) -> Option<bool> {
        let mut loggers = self.inner.loggers.lock().await;
        let handle = find_by_path(&loggers, path.as_ref())?;
        Some(
            self.inner
                .retire_registered(&mut loggers, &handle, self.inner.settings.drain_timeout())
                .await,
        )
    }

    /// Route other loggers' failures to the logger named `logical_name`
    ///
    /// Returns false if no such logger is registered.
    pub async fn set_diagnostic_logger(&self, logical_name: &str) -> bool {
        let loggers = self.inner.loggers.lock().await;
        match loggers.by_name.get(strip_log_extension(logical_name)) {
            Some(handle) => {
                self.inner.diagnostics.designate(Some(handle));
                true
            }
            None => false,
        }
    }

    /// Go back to the fallback diagnostic channel
    pub fn clear_diagnostic_logger(&self) {
        self.inner.diagnostics.designate(None);
    }

    /// Stop every live logger, waiting up to `timeout` for each to drain
    ///
    /// Loggers are stopped concurrently; the designated diagnostic logger is
    /// stopped last so it can still record the others' failures. A logger that
    /// fails or times out never keeps the rest from stopping. Creations that
    /// arrive meanwhile wait until every writer has closed.
    pub async fn shutdown_all(&self, timeout: Duration) -> ShutdownReport {
        let mut loggers = self.inner.loggers.lock().await;
        let handles = loggers.distinct();
        loggers.clear();

        let designated = self.inner.diagnostics.current();
        let (diagnostic, rest): (Vec<LoggerHandle>, Vec<LoggerHandle>) =
            handles.into_iter().partition(|h| {
                designated
                    .as_ref()
                    .map(|d| LoggerHandle::ptr_eq(d, h))
                    .unwrap_or(false)
            });

        tracing::info!(
            "Shutting down {} loggers",
            rest.len() + diagnostic.len()
        );

        let mut report = ShutdownReport::default();

        let tasks: Vec<(String, tokio::task::JoinHandle<(bool, u64)>)> = rest
            .into_iter()
            .map(|handle| {
                let name = handle.short_name().to_string();
                let task = tokio::spawn(async move {
                    let drained = handle.retire(timeout).await;
                    (drained, handle.write_failures())
                });
                (name, task)
            })
            .collect();

        for (name, task) in tasks {
            match task.await {
                Ok((drained, failures)) => report.record(name, drained, failures),
                Err(e) => {
                    tracing::error!("Stopping logger {} was interrupted: {}", name, e);
                    report.record(name, false, 0);
                }
            }
        }

        for handle in diagnostic {
            let drained = handle.retire(timeout).await;
            report.record(
                handle.short_name().to_string(),
                drained,
                handle.write_failures(),
            );
        }
        self.inner.diagnostics.designate(None);
        drop(loggers);

        if report.is_clean() {
            tracing::info!("All {} loggers drained", report.total());
        } else {
            tracing::warn!(
                "Logger shutdown degraded: timed out {:?}, write failures {:?}",
                report.timed_out,
                report.write_failures
            );
        }

        report
    }
}

impl RegistryInner {
    /// Prepare the file, open its writer and wrap it in an attached handle
    fn build(self: &Arc<Self>, config: LoggerConfig) -> Result<LoggerHandle> {
        config.prepare()?;
        let diagnostics: Arc<dyn DiagnosticSink> = self.diagnostics.clone();
        let writer = LogWriter::open_with(
            config,
            WriterOptions {
                thread_name_prefix: self.settings.thread_name_prefix.clone(),
                diagnostics,
            },
        )?;
        let handle =
            LoggerHandle::with_clock(writer, Arc::clone(&self.clock), self.settings.drain_timeout());
        handle.attach(self)?;
        Ok(handle)
    }

    /// Replace an expired logger with one dated today
    ///
    /// The old logger is retired either way; if the new file cannot be
    /// opened the error is returned and nothing is registered under the name.
    async fn rotate(
        self: &Arc<Self>,
        loggers: &mut LoggerMap,
        old: LoggerHandle,
    ) -> Result<LoggerHandle> {
        let next = old.config().rotated(self.clock.today());
        let replacement = self.build(next);

        if !self
            .retire_registered(loggers, &old, self.settings.drain_timeout())
            .await
        {
            tracing::warn!(
                "Expired logger {} did not drain before rotation",
                old.short_name()
            );
        }

        let replacement = replacement?;
        loggers.insert(&replacement);
        self.diagnostics.replace(&old, &replacement);

        tracing::info!(
            "Rotated logger {} from {} to {}",
            replacement.short_name(),
            old.file_path().display(),
            replacement.file_path().display()
        );

        Ok(replacement)
    }

    /// Hand back `existing`, or its replacement if it is due for rotation
    async fn refresh(
        self: &Arc<Self>,
        loggers: &mut LoggerMap,
        existing: LoggerHandle,
    ) -> Option<LoggerHandle> {
        if !existing.needs_rotation() {
            return Some(existing);
        }

        let name = existing.short_name().to_string();
        match self.rotate(loggers, existing).await {
            Ok(handle) => Some(handle),
            Err(e) => {
                self.diagnostics
                    .report(&name, &format!("Failed to rotate logger: {}", e));
                None
            }
        }
    }

    /// Unregister a handle and drain it while the map stays locked
    pub(crate) async fn detach_and_retire(&self, handle: &LoggerHandle, timeout: Duration) -> bool {
        let mut loggers = self.loggers.lock().await;
        self.retire_registered(&mut loggers, handle, timeout).await
    }

    /// Drop both keys of `handle`, then drain and close it
    ///
    /// Callers hold the map lock for the whole call.
    async fn retire_registered(
        &self,
        loggers: &mut LoggerMap,
        handle: &LoggerHandle,
        timeout: Duration,
    ) -> bool {
        if loggers.remove(handle) {
            tracing::debug!("Removed logger {}", handle.short_name());
        }
        handle.retire(timeout).await
    }
}

fn find_by_path(loggers: &LoggerMap, path: &Path) -> Option<LoggerHandle> {
    let name = path.file_name().and_then(|n| n.to_str())?;
    let directory = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => canonical_dir(parent),
        _ => canonical_dir(Path::new(".")),
    };

    if let Some(handle) = loggers
        .by_path
        .get(&directory.join(strip_log_extension(name)))
    {
        return Some(handle.clone());
    }

    // Dated file name
    let resolved = directory.join(name);
    loggers
        .distinct()
        .into_iter()
        .find(|h| canonical_dir(h.config().directory()).join(h.config().file_name()) == resolved)
}

/// Diagnostic sink shared by every writer of a registry
///
/// Reports go to the designated diagnostic logger, unless that logger is the
/// one reporting (or is gone), in which case they go to the fallback.
pub(crate) struct RegistryDiagnostics {
    designated: RwLock<Option<WeakLoggerHandle>>,
    fallback: Arc<dyn DiagnosticSink>,
}

impl RegistryDiagnostics {
    fn current(&self) -> Option<LoggerHandle> {
        self.designated
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .and_then(WeakLoggerHandle::upgrade)
    }

    fn designate(&self, handle: Option<&LoggerHandle>) {
        let mut designated = self.designated.write().unwrap_or_else(|e| e.into_inner());
        *designated = handle.map(LoggerHandle::downgrade);
    }

    /// Designate a new logger if its name is the configured diagnostic logger
    fn offer(&self, settings: &RegistrySettings, handle: &LoggerHandle) {
        let wanted = settings
            .diagnostic_logger
            .as_deref()
            .map(strip_log_extension);
        if wanted == Some(handle.short_name()) {
            self.designate(Some(handle));
        }
    }

    /// Follow the designated logger across a rotation
    fn replace(&self, old: &LoggerHandle, new: &LoggerHandle) {
        let is_old = self
            .current()
            .map(|d| LoggerHandle::ptr_eq(&d, old))
            .unwrap_or(false);
        if is_old {
            self.designate(Some(new));
        }
    }
}

impl DiagnosticSink for RegistryDiagnostics {
    fn report(&self, origin: &str, message: &str) {
        match self.current() {
            Some(logger) if logger.short_name() != origin && !logger.is_stopped() => {
                logger.error(&format!("[{}] {}", origin, message));
            }
            _ => self.fallback.report(origin, message),
        }
    }
}
