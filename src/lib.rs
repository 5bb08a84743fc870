// Library exports for the scribe logging core

pub mod clock;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod logs;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{LoggerConfig, RegistrySettings};
pub use diagnostics::{DiagnosticSink, TracingSink};
pub use error::{Result, ScribeError};
pub use logs::{Level, LoggerHandle, LoggerRegistry, ShutdownReport};
