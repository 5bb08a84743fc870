// Logs module - Queue, background writer, handles and registry

pub mod format;
mod handle;
mod reader;
mod registry;
mod writer;

pub use format::{Level, LogEntry, COLUMN_DELIMITER, LINE_DELIMITER};
pub use handle::LoggerHandle;
pub use reader::{read_records, LogReadOptions, LogRecord, LogStream};
pub use registry::{LoggerRegistry, ShutdownReport};
pub use writer::{LogSink, LogWriter, WorkerState, WriterOptions};
