use crate::error::{Result, ScribeError};
use chrono::{Days, NaiveDate};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Extension appended to every log file
pub const LOG_EXTENSION: &str = ".log";

/// Identity and lifetime of a single log file
///
/// The file name is derived from the logical name and the creation date, so
/// two configs with the same `(logical_name, creation_date)` always point at
/// the same file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggerConfig {
    directory: PathBuf,
    logical_name: String,
    creation_date: NaiveDate,
    retention_days: u32,
}

impl LoggerConfig {
    /// Create a config for `logical_name` inside `directory`
    ///
    /// A trailing `.log` on the name is stripped. Names must be non-empty and
    /// may not contain path separators.
    pub fn new<P: AsRef<Path>>(
        directory: P,
        logical_name: &str,
        retention_days: u32,
        creation_date: NaiveDate,
    ) -> Result<Self> {
        let logical_name = strip_log_extension(logical_name);
        validate_logical_name(logical_name)?;

        Ok(Self {
            directory: directory.as_ref().to_path_buf(),
            logical_name: logical_name.to_string(),
            creation_date,
            retention_days,
        })
    }

    /// Create a config from a `dir/name` path (with or without `.log`)
    pub fn from_path<P: AsRef<Path>>(
        path: P,
        retention_days: u32,
        creation_date: NaiveDate,
    ) -> Result<Self> {
        let path = path.as_ref();
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| ScribeError::InvalidLoggerName(path.display().to_string()))?;
        let directory = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };

        Self::new(directory, name, retention_days, creation_date)
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn logical_name(&self) -> &str {
        &self.logical_name
    }

    pub fn creation_date(&self) -> NaiveDate {
        self.creation_date
    }

    pub fn retention_days(&self) -> u32 {
        self.retention_days
    }

    /// `<logical_name><YYYY-MM-DD>.log`
    pub fn file_name(&self) -> String {
        format!(
            "{}{}{}",
            self.logical_name,
            self.creation_date.format("%Y-%m-%d"),
            LOG_EXTENSION
        )
    }

    pub fn file_path(&self) -> PathBuf {
        self.directory.join(self.file_name())
    }

    /// Date-free key used for path lookups: resolved directory joined with the
    /// logical name
    pub fn canonical_key(&self) -> PathBuf {
        canonical_dir(&self.directory).join(&self.logical_name)
    }

    /// True once `creation_date + retention_days` is strictly before `today`
    pub fn is_due_for_rotation(&self, today: NaiveDate) -> bool {
        match self
            .creation_date
            .checked_add_days(Days::new(u64::from(self.retention_days)))
        {
            Some(expiry) => expiry < today,
            None => false,
        }
    }

    /// Same logger, fresh file dated `today`
    pub fn rotated(&self, today: NaiveDate) -> Self {
        Self {
            creation_date: today,
            ..self.clone()
        }
    }

    /// Make sure the dated log file exists and is a plain file
    ///
    /// Creates the directory tree and an empty file as needed.
    ///
    /// # Returns
    /// * `Ok(PathBuf)` - Path of the usable log file
    /// * `Err(ScribeError)` - The path cannot hold a log file
    pub fn prepare(&self) -> Result<PathBuf> {
        let log_path = self.file_path();

        if log_path.exists() {
            if log_path.is_file() {
                return Ok(log_path);
            }
            return Err(ScribeError::LogPathNotFile(log_path));
        }

        if self.directory.exists() {
            if !self.directory.is_dir() {
                return Err(ScribeError::NotADirectory(self.directory.clone()));
            }
        } else {
            fs::create_dir_all(&self.directory).map_err(|source| {
                ScribeError::DirectoryCreationFailed {
                    path: self.directory.clone(),
                    source,
                }
            })?;
        }

        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .map_err(|e| {
                ScribeError::LogFileError(format!(
                    "Could not create {} in {}: {}",
                    self.file_name(),
                    self.directory.display(),
                    e
                ))
            })?;

        Ok(log_path)
    }
}

/// Strip one trailing `.log` from a name
pub fn strip_log_extension(name: &str) -> &str {
    name.strip_suffix(LOG_EXTENSION).unwrap_or(name)
}

fn validate_logical_name(name: &str) -> Result<()> {
    if name.is_empty() || name.contains('/') || name.contains('\\') {
        return Err(ScribeError::InvalidLoggerName(name.to_string()));
    }
    Ok(())
}

/// Substitute `$NAME` and `${NAME}` with environment values
///
/// `$NAME` takes the longest run of ASCII alphanumerics and underscores.
/// Unset variables and an unterminated `${` are left as written.
fn expand_env_tokens(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(pos) = rest.find('$') {
        out.push_str(&rest[..pos]);
        let after = &rest[pos + 1..];

        let (name, consumed) = match after.strip_prefix('{') {
            Some(inner) => match inner.find('}') {
                Some(end) => (&inner[..end], end + 2),
                None => ("", 0),
            },
            None => {
                let end = after
                    .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
                    .unwrap_or(after.len());
                (&after[..end], end)
            }
        };

        match std::env::var(name).ok().filter(|_| !name.is_empty()) {
            Some(value) => out.push_str(&value),
            None => {
                out.push('$');
                out.push_str(&after[..consumed]);
            }
        }
        rest = &after[consumed..];
    }

    out.push_str(rest);
    out
}

/// Resolve a directory if it exists, otherwise keep it as given
pub(crate) fn canonical_dir(dir: &Path) -> PathBuf {
    fs::canonicalize(dir).unwrap_or_else(|_| dir.to_path_buf())
}

/// Registry-wide settings, loadable from TOML or JSON
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistrySettings {
    /// Default directory for loggers created without an explicit one
    #[serde(default)]
    pub directory: Option<PathBuf>,

    /// Days a file is kept before the logger rotates to a new one
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,

    /// How long a stop waits for a writer to drain (in milliseconds)
    #[serde(default = "default_drain_timeout_ms")]
    pub drain_timeout_ms: u64,

    /// Logical name of the logger that receives other loggers' failures
    #[serde(default)]
    pub diagnostic_logger: Option<String>,

    /// Prefix for writer thread names
    #[serde(default = "default_thread_name_prefix")]
    pub thread_name_prefix: String,
}

// Default value functions for serde
fn default_retention_days() -> u32 {
    10
}

fn default_drain_timeout_ms() -> u64 {
    5000
}

fn default_thread_name_prefix() -> String {
    "scribe-writer".to_string()
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            directory: None,
            retention_days: default_retention_days(),
            drain_timeout_ms: default_drain_timeout_ms(),
            diagnostic_logger: None,
            thread_name_prefix: default_thread_name_prefix(),
        }
    }
}

impl RegistrySettings {
    /// Load settings from a file (supports TOML and JSON)
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .map_err(|e| ScribeError::ConfigError(format!("Failed to read config file: {}", e)))?;

        let extension = path.extension().and_then(|s| s.to_str()).unwrap_or("");

        let mut settings = match extension {
            "toml" => Self::parse_toml(&contents)?,
            "json" => Self::parse_json(&contents)?,
            _ => {
                return Err(ScribeError::InvalidConfig(format!(
                    "Unsupported file format: {}. Use .toml or .json",
                    extension
                )))
            }
        };

        settings.expand_env_vars();
        settings.validate()?;

        Ok(settings)
    }

    /// Parse a TOML document; settings may sit at the top level or under `[logging]`
    fn parse_toml(contents: &str) -> Result<Self> {
        #[derive(Deserialize)]
        struct SettingsFile {
            logging: Option<RegistrySettings>,
            #[serde(flatten)]
            top_level: RegistrySettings,
        }

        let file: SettingsFile = toml::from_str(contents)
            .map_err(|e| ScribeError::InvalidConfig(format!("Failed to parse TOML: {}", e)))?;

        Ok(file.logging.unwrap_or(file.top_level))
    }

    fn parse_json(contents: &str) -> Result<Self> {
        serde_json::from_str(contents)
            .map_err(|e| ScribeError::InvalidConfig(format!("Failed to parse JSON: {}", e)))
    }

    /// Validate the settings
    pub fn validate(&self) -> Result<()> {
        if self.drain_timeout_ms == 0 {
            return Err(ScribeError::ConfigValidationError(
                "drain_timeout_ms must be at least 1".to_string(),
            ));
        }

        if self.thread_name_prefix.is_empty() {
            return Err(ScribeError::ConfigValidationError(
                "thread_name_prefix cannot be empty".to_string(),
            ));
        }

        if let Some(ref name) = self.diagnostic_logger {
            validate_logical_name(strip_log_extension(name)).map_err(|_| {
                ScribeError::ConfigValidationError(format!(
                    "Invalid diagnostic_logger name: {:?}",
                    name
                ))
            })?;
        }

        if let Some(ref dir) = self.directory {
            if dir.exists() && !dir.is_dir() {
                return Err(ScribeError::ConfigValidationError(format!(
                    "Log directory is not a directory: {}",
                    dir.display()
                )));
            }
        }

        Ok(())
    }

    /// Expand `$VAR` and `${VAR}` in the directory path
    fn expand_env_vars(&mut self) {
        if let Some(ref dir) = self.directory {
            self.directory = Some(PathBuf::from(expand_env_tokens(&dir.to_string_lossy())));
        }
    }

    /// Get drain timeout as Duration
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}
