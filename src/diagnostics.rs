// Fallback channel for failures a logger cannot record in its own file

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const DEFAULT_LEVEL: &str = "info";

/// Receiver of internal failures raised by loggers (write errors, enqueue
/// after stop, failed rotations)
///
/// `origin` is the logical name of the logger that hit the failure.
pub trait DiagnosticSink: Send + Sync {
    fn report(&self, origin: &str, message: &str);
}

/// Non-logging fallback: emits a `tracing` event, or writes to stderr when the
/// host never installed a subscriber
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl DiagnosticSink for TracingSink {
    fn report(&self, origin: &str, message: &str) {
        if tracing::dispatcher::has_been_set() {
            tracing::error!(logger = origin, "{}", message);
        } else {
            eprintln!("[scribe] {}: {}", origin, message);
        }
    }
}

/// Install a stderr `fmt` subscriber filtered by `RUST_LOG` (default `info`)
///
/// Does nothing if the host already installed a global subscriber.
pub fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LEVEL));
    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .try_init();
}
