//! Logging initialisation for simplevm.
//!
//! When the `SIMPLEVM_LOG` environment variable is set to `1`, structured
//! logs are also written to `simplevm.log` in the logs directory.
//! Otherwise only stderr output (filtered by `RUST_LOG`) is enabled.
//!
//! Returns a guard that must be kept alive for the duration of the process
//! so that buffered log lines are flushed on exit.

use std::path::Path;

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

pub struct LogGuard {
    _file_guard: Option<tracing_appender::non_blocking::WorkerGuard>,
}

/// Initialise the global tracing subscriber.
///
/// `default_level` applies when `RUST_LOG` is unset. Call once from `main`
/// and keep the returned `LogGuard` alive.
pub fn init(log_dir: &Path, default_level: &str) -> LogGuard {
    let filter =
        || EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let file_guard = if std::env::var("SIMPLEVM_LOG").as_deref() == Ok("1") {
        let _ = std::fs::create_dir_all(log_dir);
        let file_appender = tracing_appender::rolling::never(log_dir, "simplevm.log");
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        let file_layer = fmt::layer()
            .with_writer(non_blocking)
            .with_ansi(false);

        tracing_subscriber::registry()
            .with(filter())
            .with(fmt::layer().with_writer(std::io::stderr))
            .with(file_layer)
            .init();

        Some(guard)
    } else {
        tracing_subscriber::registry()
            .with(filter())
            .with(fmt::layer().with_writer(std::io::stderr))
            .init();

        None
    };

    LogGuard { _file_guard: file_guard }
}
