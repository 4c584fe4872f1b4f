//! Tracing configuration and log routing.
//!
//! Stage transitions are logged to stdout with a compact formatter and mirrored to a file.
//! `RUSTY_INGEST_LOG_FILE` picks the file; otherwise logs go to `logs/rusty-ingest.log`.
//! The file layer also records when each `pipeline_attempt` span closes, so attempt
//! durations end up in the log without extra timing code.
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::{EnvFilter, fmt, fmt::format::FmtSpan, prelude::*};

const LOG_FILE_VAR: &str = "RUSTY_INGEST_LOG_FILE";
const DEFAULT_LOG_DIR: &str = "logs";
const DEFAULT_LOG_FILE: &str = "rusty-ingest.log";

static LOG_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Configure tracing subscribers for stdout and file logging.
///
/// - Respects `RUST_LOG` for filtering (defaults to `info`).
/// - Installs a compact stdout layer and, when the log file can be opened, a file layer.
/// - Keeps the non-blocking writer guard alive for the process lifetime.
///
/// Calling this more than once is harmless; later calls leave the first subscriber in place.
pub fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stdout_layer = fmt::layer().with_target(false).compact();
    let file_layer = open_log_writer(&log_file_path()).map(|writer| {
        fmt::layer()
            .with_writer(writer)
            .with_ansi(false)
            .with_span_events(FmtSpan::CLOSE)
            .compact()
    });

    let result = tracing_subscriber::registry()
        .with(env_filter)
        .with(stdout_layer)
        .with(file_layer)
        .try_init();
    if let Err(err) = result {
        eprintln!("Tracing already initialized: {err}");
    }
}

fn log_file_path() -> PathBuf {
    std::env::var_os(LOG_FILE_VAR)
        .filter(|value| !value.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| Path::new(DEFAULT_LOG_DIR).join(DEFAULT_LOG_FILE))
}

/// Open `path` for appending behind a non-blocking writer, creating parent directories.
fn open_log_writer(path: &Path) -> Option<NonBlocking> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty())
        && let Err(err) = std::fs::create_dir_all(parent)
    {
        eprintln!("Failed to create log directory {}: {err}", parent.display());
        return None;
    }

    match std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
    {
        Ok(file) => {
            let (non_blocking, guard) = tracing_appender::non_blocking(file);
            let _ = LOG_GUARD.set(guard);
            Some(non_blocking)
        }
        Err(err) => {
            eprintln!("Failed to open log file {}: {err}", path.display());
            None
        }
    }
}
