//! Tracing subscriber setup for training runs.
//!
//! Human-readable events go to stderr; optionally a JSON copy of every event
//! is written to a daily-rolling file so long runs can be inspected afterwards.

use std::path::PathBuf;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Where and how verbosely to log.
#[derive(Debug, Clone)]
pub struct LogOptions {
    /// Filter for the stderr layer when `RUST_LOG` is unset.
    pub default_filter: String,
    /// Directory for the JSON log file; `None` disables the file layer.
    pub json_dir: Option<PathBuf>,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            default_filter: "info".to_string(),
            json_dir: None,
        }
    }
}

impl LogOptions {
    /// Also log JSON into `dir/nextok.log.<date>`.
    pub fn with_json_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.json_dir = Some(dir.into());
        self
    }
}

/// Install the global subscriber.
///
/// Returns the file writer guard when a JSON layer is active; keep it alive
/// for the duration of the run or buffered events are lost. Returns `None`
/// also when a subscriber was already installed (e.g. by an embedding
/// application or a previous test), in which case nothing changes.
pub fn init_logging(options: &LogOptions) -> Option<WorkerGuard> {
    let stderr_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&options.default_filter));
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_filter(stderr_filter);

    let (json_layer, guard) = match &options.json_dir {
        Some(dir) => {
            if let Err(e) = std::fs::create_dir_all(dir) {
                eprintln!("cannot create log directory {}: {e}", dir.display());
            }
            let appender = tracing_appender::rolling::daily(dir, "nextok.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .json()
                .with_writer(writer)
                .with_filter(EnvFilter::new("debug"));
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let installed = tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .try_init();

    match installed {
        Ok(()) => guard,
        Err(_) => None,
    }
}
