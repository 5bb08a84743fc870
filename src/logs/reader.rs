use crate::error::{Result, ScribeError};
use crate::logs::format::{self, Level, COLUMNS, COLUMN_DELIMITER, LINE_DELIMITER};
use chrono::NaiveDateTime;
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncSeekExt, BufReader};
use tokio::sync::mpsc;
use tokio::time::{sleep, Duration};

/// Options for reading records back from a log file
#[derive(Debug, Clone)]
pub struct LogReadOptions {
    /// Number of records to return, counted from the end of the file
    pub lines: usize,
    /// Only return records of this level
    pub level: Option<Level>,
    /// Optional filter pattern (simple substring match on the message)
    pub filter: Option<String>,
}

impl Default for LogReadOptions {
    fn default() -> Self {
        Self {
            lines: 100,
            level: None,
            filter: None,
        }
    }
}

impl LogReadOptions {
    fn accepts(&self, record: &LogRecord) -> bool {
        if let Some(level) = self.level {
            if record.level != Some(level) {
                return false;
            }
        }
        match self.filter {
            Some(ref pattern) => record.message.contains(pattern.as_str()),
            None => true,
        }
    }
}

/// One record line split back into its columns
#[derive(Debug, Clone, PartialEq)]
pub struct LogRecord {
    pub time: String,
    pub date: String,
    /// `None` if the Type column holds an unknown label
    pub level: Option<Level>,
    pub message: String,
    pub error_message: Option<String>,
    pub stack_trace: Vec<String>,
}

impl LogRecord {
    /// Split a record line; `None` for the header and for malformed lines
    ///
    /// A message that itself contains the column delimiter yields a line with
    /// too many columns and is rejected.
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim_end_matches(|c: char| c == '\r' || c == '\n');
        if line == format::header() {
            return None;
        }

        let columns: Vec<&str> = line.split(COLUMN_DELIMITER).collect();
        if columns.len() != COLUMNS.len() {
            return None;
        }

        let non_empty = |s: &str| (!s.is_empty()).then(|| s.to_string());

        Some(Self {
            time: columns[0].to_string(),
            date: columns[1].to_string(),
            level: Level::from_label(columns[2]),
            message: columns[3].to_string(),
            error_message: non_empty(columns[4]),
            stack_trace: if columns[5].is_empty() {
                Vec::new()
            } else {
                columns[5].split(LINE_DELIMITER).map(str::to_string).collect()
            },
        })
    }

    /// Local date-time of the record, if the Date and Time columns parse
    pub fn timestamp(&self) -> Option<NaiveDateTime> {
        NaiveDateTime::parse_from_str(
            &format!("{} {}", self.date, self.time),
            "%Y-%m-%d %H:%M:%S%.f",
        )
        .ok()
    }

    pub fn has_error(&self) -> bool {
        self.error_message.is_some() || !self.stack_trace.is_empty()
    }
}

/// Read the last matching records of a log file
///
/// # Arguments
/// * `file_path` - Path to the log file
/// * `options` - How many records to keep and which to match
///
/// # Returns
/// * `Ok(Vec<LogRecord>)` - Records in file order (empty if the file does not exist)
/// * `Err(ScribeError)` - Failed to read the log file
pub async fn read_records(file_path: &Path, options: &LogReadOptions) -> Result<Vec<LogRecord>> {
    if !file_path.exists() {
        return Ok(Vec::new());
    }

    let file = File::open(file_path)
        .await
        .map_err(|e| ScribeError::LogFileError(format!("Failed to open log file: {}", e)))?;

    let mut lines = BufReader::new(file).lines();
    let mut records = Vec::new();

    while let Some(line) = lines
        .next_line()
        .await
        .map_err(|e| ScribeError::LogFileError(format!("Failed to read log line: {}", e)))?
    {
        if let Some(record) = LogRecord::parse(&line) {
            if options.accepts(&record) {
                records.push(record);
            }
        }
    }

    if records.len() > options.lines {
        let start = records.len() - options.lines;
        records.drain(..start);
    }

    Ok(records)
}

/// A stream of records appended to a log file after it was opened
pub struct LogStream {
    receiver: mpsc::Receiver<LogRecord>,
    _task_handle: tokio::task::JoinHandle<()>,
}

impl LogStream {
    /// Start tailing `path`, including records already in the file
    ///
    /// The file does not need to exist yet.
    pub fn follow(path: PathBuf, options: LogReadOptions) -> Self {
        let (tx, rx) = mpsc::channel(100);

        let task_handle = tokio::spawn(async move {
            let mut tailer = LogTailer::new(path);

            loop {
                match tailer.read_next().await {
                    Ok(Some(record)) => {
                        if options.accepts(&record) && tx.send(record).await.is_err() {
                            // Receiver dropped
                            break;
                        }
                    }
                    Ok(None) => sleep(Duration::from_millis(50)).await,
                    Err(e) => {
                        tracing::debug!("Log tail read failed: {}", e);
                        sleep(Duration::from_millis(50)).await;
                    }
                }
            }
        });

        Self {
            receiver: rx,
            _task_handle: task_handle,
        }
    }

    /// Receive the next record
    ///
    /// # Returns
    /// * `Some(LogRecord)` - Next record
    /// * `None` - Stream has ended
    pub async fn next(&mut self) -> Option<LogRecord> {
        self.receiver.recv().await
    }
}

impl Drop for LogStream {
    fn drop(&mut self) {
        self._task_handle.abort();
    }
}

/// Internal helper for tailing a single log file
struct LogTailer {
    path: PathBuf,
    reader: Option<BufReader<File>>,
    position: u64,
}

impl LogTailer {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            reader: None,
            position: 0,
        }
    }

    /// Read the next complete record, skipping the header and malformed lines
    async fn read_next(&mut self) -> Result<Option<LogRecord>> {
        loop {
            if self.reader.is_none() {
                if !self.path.exists() {
                    return Ok(None);
                }

                let file = File::open(&self.path).await.map_err(|e| {
                    ScribeError::LogFileError(format!("Failed to open log file: {}", e))
                })?;
                let mut reader = BufReader::new(file);
                reader
                    .seek(std::io::SeekFrom::Start(self.position))
                    .await
                    .map_err(|e| {
                        ScribeError::LogFileError(format!("Failed to seek in log file: {}", e))
                    })?;
                self.reader = Some(reader);
            }

            let Some(reader) = self.reader.as_mut() else {
                return Ok(None);
            };

            let mut line = String::new();
            match reader.read_line(&mut line).await {
                Ok(0) => return Ok(None),
                Ok(_) if !line.ends_with('\n') => {
                    // Writer is mid-line; reread from the line start next time
                    self.reader = None;
                    return Ok(None);
                }
                Ok(n) => {
                    self.position += n as u64;
                    if let Some(record) = LogRecord::parse(&line) {
                        return Ok(Some(record));
                    }
                }
                Err(e) => {
                    self.reader = None;
                    return Err(ScribeError::LogFileError(format!(
                        "Failed to read log line: {}",
                        e
                    )));
                }
            }
        }
    }
}
