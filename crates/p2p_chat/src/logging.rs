use std::path::Path;

use anyhow::Result;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Default filter when `RUST_LOG` is unset.
pub const DEFAULT_FILTER: &str = "info,p2p_chat=debug";

/// Prefix of the daily log files.
const LOG_FILE_PREFIX: &str = "p2p-chat";

fn env_filter(fallback: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback))
}

/// Log to a daily-rotated file in `logs_dir` and to the console.
/// Returns a guard that must be kept alive for the duration of the app.
pub fn init_logging_to_dir(logs_dir: &Path, filter: &str) -> Result<WorkerGuard> {
    std::fs::create_dir_all(logs_dir)?;

    let file_appender = tracing_appender::rolling::daily(logs_dir, LOG_FILE_PREFIX);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(env_filter(filter))
        .with(
            fmt::layer()
                .with_target(true)
                .with_thread_ids(false)
                .with_ansi(false)
                .with_writer(non_blocking),
        )
        .with(
            fmt::layer()
                .with_target(false)
                .with_thread_ids(false)
                .compact(),
        )
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {e}"))?;

    Ok(guard)
}

/// Console-only logging, for tools and embedders without a log directory.
pub fn init_console(filter: &str) -> Result<()> {
    tracing_subscriber::registry()
        .with(env_filter(filter))
        .with(fmt::layer().with_target(false).compact())
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_logging_to_dir_creates_directory() {
        let tmp = tempfile::tempdir().expect("Failed to create tempdir");
        let logs_dir = tmp.path().join("nested").join("logs");
        assert!(!logs_dir.exists());

        // Only one global subscriber per process; a later call may fail but
        // the directory is created first either way.
        let result = init_logging_to_dir(&logs_dir, "warn");
        assert!(logs_dir.exists());
        drop(result);
    }

    #[test]
    fn test_second_init_reports_error() {
        let tmp = tempfile::tempdir().expect("Failed to create tempdir");
        let _first = init_logging_to_dir(&tmp.path().join("a"), "info");

        match init_console("info") {
            Ok(()) => {}
            Err(e) => assert!(e.to_string().contains("logging"), "unexpected error: {e}"),
        }
        let second = init_logging_to_dir(&tmp.path().join("b"), "info");
        assert!(second.is_err());
    }

    #[test]
    fn test_env_filter_fallback() {
        for f in [DEFAULT_FILTER, "debug", "warn", "p2p_chat=trace,warn"] {
            drop(env_filter(f));
        }
    }
}
