use chrono::{DateTime, Local};
use std::fmt;

/// Separates the six columns of a record
pub const COLUMN_DELIMITER: &str = "\t;;\t";

/// Separates stack frames inside the StackTrace column
pub const LINE_DELIMITER: &str = "\t;;;\t";

/// Column names, in record order
pub const COLUMNS: [&str; 6] = [
    "Time",
    "Date",
    "Type",
    "Message",
    "ExceptionMessage",
    "StackTrace",
];

const TIME_FORMAT: &str = "%H:%M:%S%.3f";
const DATE_FORMAT: &str = "%Y-%m-%d";

/// Severity label of a record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Level {
    Error,
    Warning,
    Info,
    Log,
    Exception,
}

impl Level {
    pub const ALL: [Level; 5] = [
        Level::Error,
        Level::Warning,
        Level::Info,
        Level::Log,
        Level::Exception,
    ];

    /// Label written to the Type column
    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Error => "Error",
            Level::Warning => "Warn",
            Level::Info => "Info",
            Level::Log => "Log",
            Level::Exception => "Exception",
        }
    }

    /// Inverse of [`Level::as_str`]
    pub fn from_label(label: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|level| level.as_str() == label)
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One queued log record
///
/// The timestamp is taken when the caller logs, not when the writer gets to it.
#[derive(Debug, Clone, PartialEq)]
pub struct LogEntry {
    pub timestamp: DateTime<Local>,
    pub level: Level,
    pub message: String,
    pub error_message: Option<String>,
    /// Frames already joined with [`LINE_DELIMITER`]
    pub stack_trace: Option<String>,
}

impl LogEntry {
    pub fn new(timestamp: DateTime<Local>, level: Level, message: impl Into<String>) -> Self {
        Self {
            timestamp,
            level,
            message: message.into(),
            error_message: None,
            stack_trace: None,
        }
    }

    /// Attach an error message and its frames
    pub fn with_error<I, S>(mut self, error_message: impl Into<String>, frames: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.error_message = Some(error_message.into());
        self.stack_trace = Some(join_frames(frames));
        self
    }

    pub fn has_error(&self) -> bool {
        self.error_message.is_some() || self.stack_trace.is_some()
    }
}

/// The header line every log file starts with
pub fn header() -> String {
    COLUMNS.join(COLUMN_DELIMITER)
}

/// Render an entry as one record line (no trailing newline)
pub fn format(entry: &LogEntry) -> String {
    let time = entry.timestamp.format(TIME_FORMAT).to_string();
    let date = entry.timestamp.format(DATE_FORMAT).to_string();

    let columns = [
        time.as_str(),
        date.as_str(),
        entry.level.as_str(),
        entry.message.as_str(),
        entry.error_message.as_deref().unwrap_or(""),
        entry.stack_trace.as_deref().unwrap_or(""),
    ];

    columns.join(COLUMN_DELIMITER)
}

/// Join stack frames so a multi-frame trace stays on one record line
pub fn join_frames<I, S>(frames: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut rendered = String::new();
    for (i, frame) in frames.into_iter().enumerate() {
        if i > 0 {
            rendered.push_str(LINE_DELIMITER);
        }
        rendered.push_str(frame.as_ref());
    }
    rendered
}
