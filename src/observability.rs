//! Logging and observability helpers.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing_appender::rolling::RollingFileAppender;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;

const LOG_FILE_PREFIX: &str = "dbterm.log";
const DEFAULT_FILTER: &str = "dbterm=info";

/// Installs the file logger under [`log_directory`].
///
/// The terminal UI owns stdout, so nothing is written there.
pub fn init_tracing() -> io::Result<()> {
    init_tracing_in(&log_directory())
}

/// Installs the file logger writing daily files into `dir`.
///
/// A subscriber that is already installed is left in place.
pub fn init_tracing_in(dir: &Path) -> io::Result<()> {
    fs::create_dir_all(dir)?;

    let file_appender: RollingFileAppender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(file_appender)
        .with_ansi(false)
        .with_span_events(FmtSpan::CLOSE)
        .try_init();

    Ok(())
}

/// Per-user log directory
pub fn log_directory() -> PathBuf {
    if cfg!(windows) {
        let base = dirs::data_dir().unwrap_or_default();
        base.join("dbterm").join("logs")
    } else {
        let home = dirs::home_dir().unwrap_or_default();
        home.join(".dbterm").join("logs")
    }
}
