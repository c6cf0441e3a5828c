// SPDX-License-Identifier: Apache-2.0

//! Logging setup.
//!
//! JSON logs go to a daily rolling file; files older than the retention
//! window are removed at startup. Panics are logged before the previous hook
//! runs.

pub use waveql_core::Sensitive;

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tracing_appender::rolling::RollingFileAppender;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;

const LOG_FILE_PREFIX: &str = "waveql.log";
const LOG_RETENTION_DAYS: u64 = 14;
const DEFAULT_FILTER: &str = "waveql=info,waveql_drivers=info";

/// Installs the global subscriber, logging under the platform data directory.
pub fn init_tracing() {
    init_tracing_in(&log_directory());
}

/// Installs the global subscriber, logging under `log_dir`. Later calls are
/// no-ops once a subscriber is set.
pub fn init_tracing_in(log_dir: &Path) {
    let _ = fs::create_dir_all(log_dir);

    if let Err(e) = cleanup_old_logs(log_dir, LOG_RETENTION_DAYS) {
        eprintln!("Failed to clean up old logs: {e}");
    }

    let file_appender: RollingFileAppender = tracing_appender::rolling::daily(log_dir, LOG_FILE_PREFIX);
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let installed = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(file_appender)
        .json()
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_file(true)
        .with_line_number(true)
        .with_current_span(true)
        .with_span_list(true)
        .with_ansi(false)
        .with_span_events(FmtSpan::CLOSE)
        .try_init()
        .is_ok();
    if !installed {
        return;
    }

    let previous_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        let payload = panic_info.payload();
        let location = panic_info
            .location()
            .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
            .unwrap_or_else(|| "unknown".to_string());

        let msg = if let Some(s) = payload.downcast_ref::<&str>() {
            format!("PANIC: {s}")
        } else if let Some(s) = payload.downcast_ref::<String>() {
            format!("PANIC: {s}")
        } else {
            "PANIC: unknown cause".to_string()
        };

        tracing::error!(target: "panic", location = %location, message = %msg, "WaveQL panicked");
        previous_hook(panic_info);
    }));

    tracing::info!(log_dir = %log_dir.display(), "Tracing initialized");
}

/// `<data dir>/waveql/logs`, or `./waveql-logs` when the platform has none.
pub fn log_directory() -> PathBuf {
    dirs::data_local_dir()
        .map(|dir| dir.join("waveql").join("logs"))
        .unwrap_or_else(|| PathBuf::from("waveql-logs"))
}

/// Removes rolled log files older than `retention_days`. Returns how many
/// were removed.
fn cleanup_old_logs(log_dir: &Path, retention_days: u64) -> std::io::Result<usize> {
    let now = SystemTime::now();
    let retention = Duration::from_secs(retention_days * 24 * 60 * 60);
    let mut removed = 0;

    for entry in fs::read_dir(log_dir)? {
        let path = entry?.path();
        let is_log = path
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| name.starts_with(LOG_FILE_PREFIX));
        if !is_log {
            continue;
        }

        let age = fs::metadata(&path)
            .and_then(|m| m.modified())
            .ok()
            .and_then(|modified| now.duration_since(modified).ok());
        if age.is_some_and(|age| age > retention) {
            match fs::remove_file(&path) {
                Ok(()) => removed += 1,
                Err(e) => eprintln!("Failed to remove old log file {}: {e}", path.display()),
            }
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn old_logs_are_removed() {
        let dir = tempfile::tempdir().unwrap();
        let old = dir.path().join("waveql.log.2020-01-01");
        let fresh = dir.path().join("waveql.log.2099-01-01");
        let other = dir.path().join("notes.txt");
        for path in [&old, &fresh, &other] {
            fs::write(path, "{}").unwrap();
        }
        let month_ago = SystemTime::now() - Duration::from_secs(30 * 24 * 60 * 60);
        for path in [&old, &other] {
            fs::File::options()
                .write(true)
                .open(path)
                .unwrap()
                .set_modified(month_ago)
                .unwrap();
        }

        assert_eq!(cleanup_old_logs(dir.path(), LOG_RETENTION_DAYS).unwrap(), 1);
        assert!(!old.exists());
        assert!(fresh.exists());
        assert!(other.exists());
    }

    #[test]
    fn log_directory_is_namespaced() {
        assert!(log_directory().ends_with("waveql/logs") || log_directory().ends_with("waveql-logs"));
    }
}
