use std::path::PathBuf;
use thiserror::Error;

/// Main error type for the scribe logging core
#[derive(Debug, Error)]
pub enum ScribeError {
    // Configuration errors (raised while constructing a logger)
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Invalid configuration file: {0}")]
    InvalidConfig(String),

    #[error("Configuration validation failed: {0}")]
    ConfigValidationError(String),

    #[error("Invalid logger name: {0:?}")]
    InvalidLoggerName(String),

    #[error("Log path exists but is not a file: {}", .0.display())]
    LogPathNotFile(PathBuf),

    #[error("Log directory path exists but is not a directory: {}", .0.display())]
    NotADirectory(PathBuf),

    #[error("Failed to create log directory {}: {source}", .path.display())]
    DirectoryCreationFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // Log file errors
    #[error("Failed to open log file: {0}")]
    LogFileError(String),

    // Writer errors
    #[error("Log writer for {0} is closed")]
    WriterClosed(String),

    #[error("Failed to start log writer: {0}")]
    WorkerSpawnError(String),

    // Registry errors
    #[error("Logger already exists: {0}")]
    LoggerAlreadyExists(String),
}

impl ScribeError {
    /// Whether this error was raised while building a logger, as opposed to
    /// while running one
    pub fn is_configuration_failure(&self) -> bool {
        matches!(
            self,
            ScribeError::ConfigError(_)
                | ScribeError::InvalidConfig(_)
                | ScribeError::ConfigValidationError(_)
                | ScribeError::InvalidLoggerName(_)
                | ScribeError::LogPathNotFile(_)
                | ScribeError::NotADirectory(_)
                | ScribeError::DirectoryCreationFailed { .. }
                | ScribeError::LogFileError(_)
        )
    }
}

/// Result type alias for scribe operations
pub type Result<T> = std::result::Result<T, ScribeError>;
