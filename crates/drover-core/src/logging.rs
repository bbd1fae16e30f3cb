//! Logging infrastructure for drover.
//!
//! Structured logging using the `tracing` ecosystem:
//!
//! - JSON lines written to `~/.drover/logs/drover.log` (daily rotation),
//!   or under `$DROVER_LOG_DIR` when set
//! - Human-readable console output on stderr
//! - `-v` support for debug-level output
//!
//! ## Example
//!
//! ```no_run
//! use drover_core::logging;
//!
//! let _guard = logging::init_logging(None, false).expect("logging init");
//!
//! tracing::info!("drover started");
//! tracing::debug!(pid = 4242, "spawning worker");
//! ```

use std::path::PathBuf;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    EnvFilter,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

use crate::error::{DroverError, Result};

/// Crates whose events pass the default filter.
const LOG_TARGETS: [&str; 3] = ["drover", "drover_core", "drover_pool"];

/// Overrides the default log directory.
pub const LOG_DIR_ENV: &str = "DROVER_LOG_DIR";

/// Flushes the file writer when dropped. Hold it until exit.
pub struct LogGuard {
    _file_guard: WorkerGuard,
}

/// Initialize the drover logging system.
///
/// JSON lines go to `drover.log` under `log_dir` (see [`default_log_dir`]),
/// compact lines go to stderr. `RUST_LOG` replaces [`default_filter`].
pub fn init_logging(log_dir: Option<PathBuf>, verbose: bool) -> Result<LogGuard> {
    let log_dir = log_dir.map_or_else(default_log_dir, Ok)?;
    std::fs::create_dir_all(&log_dir).map_err(|e| DroverError::DirectoryCreation {
        path: log_dir.clone(),
        source: e,
    })?;

    let (file_writer, file_guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::daily(&log_dir, "drover.log"));
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter(verbose)));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_writer(file_writer)
                .with_ansi(false)
                .json()
                .with_span_events(FmtSpan::CLOSE)
                .with_current_span(true)
                .with_span_list(true),
        )
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(verbose)
                .with_file(verbose)
                .with_line_number(verbose)
                .compact(),
        )
        .init();

    tracing::debug!(log_dir = %log_dir.display(), verbose, "logging initialized");
    Ok(LogGuard {
        _file_guard: file_guard,
    })
}

/// Filter directives used when `RUST_LOG` is unset.
pub fn default_filter(verbose: bool) -> String {
    let level = if verbose { "debug" } else { "info" };
    LOG_TARGETS
        .iter()
        .map(|target| format!("{target}={level}"))
        .collect::<Vec<_>>()
        .join(",")
}

/// Console-only logging for tests; repeated calls are no-ops.
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(default_filter(true)))
        .with_test_writer()
        .try_init();
}

/// `$DROVER_LOG_DIR`, or `~/.drover/logs/` when unset.
pub fn default_log_dir() -> Result<PathBuf> {
    if let Some(dir) = std::env::var_os(LOG_DIR_ENV).filter(|d| !d.is_empty()) {
        return Ok(PathBuf::from(dir));
    }
    let home = std::env::var_os("HOME")
        .filter(|h| !h.is_empty())
        .ok_or_else(|| DroverError::internal("neither DROVER_LOG_DIR nor HOME is set"))?;
    Ok(PathBuf::from(home).join(".drover").join("logs"))
}

/// Convenience macro for logging worker lifecycle events.
///
/// # Example
///
/// ```ignore
/// log_worker_event!(pid, "allocated");
/// log_worker_event!(pid, "evicted", state = %state);
/// ```
#[macro_export]
macro_rules! log_worker_event {
    ($pid:expr, $event:expr) => {
        tracing::info!(
            target: "drover::worker",
            pid = $pid,
            event = $event,
            "worker event"
        )
    };
    ($pid:expr, $event:expr, $($field:tt)*) => {
        tracing::info!(
            target: "drover::worker",
            pid = $pid,
            event = $event,
            $($field)*,
            "worker event"
        )
    };
}
