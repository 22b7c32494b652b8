//! Daemon logging: console and/or a rotated `run.log` under the data directory.

use std::fs::{self, File};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use tracing::level_filters::LevelFilter;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::error::{LoggingError, LoggingResult};

/// Prefix of archived log files.
const ARCHIVE_PREFIX: &str = "hc-walletd.";
/// Name of the log file written by the running daemon.
const ACTIVE_LOG_NAME: &str = "run.log";
/// Subdirectory of the data directory holding log files.
const LOG_SUBDIR: &str = "logs";

/// Keeps the non-blocking file writer alive; buffered lines are flushed on drop.
#[derive(Debug)]
pub struct LoggingGuard {
    _worker_guard: Option<WorkerGuard>,
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Level filter. `None` reads `RUST_LOG`, falling back to INFO.
    pub level: Option<LevelFilter>,
    /// Write to stderr.
    pub console: bool,
    pub file: Option<LogFileConfig>,
}

#[derive(Debug, Clone)]
pub struct LogFileConfig {
    pub log_dir: PathBuf,
    /// Archived logs kept besides `run.log`.
    pub max_files: usize,
}

impl LogFileConfig {
    /// File logging into `<data_dir>/logs`.
    pub fn in_data_dir(data_dir: &Path, max_files: usize) -> Self {
        LogFileConfig {
            log_dir: data_dir.join(LOG_SUBDIR),
            max_files,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: None,
            console: true,
            file: None,
        }
    }
}

/// Console-only logging at `level`.
pub fn init_console_logging(level: LevelFilter) -> LoggingResult<LoggingGuard> {
    init_logging(LoggingConfig {
        level: Some(level),
        console: true,
        file: None,
    })
}

/// Installs the global subscriber described by `config`.
///
/// With neither console nor file output configured nothing is installed and
/// the tracing macros stay no-ops.
///
/// # Errors
///
/// Fails when the log directory cannot be prepared or a global subscriber is
/// already set.
pub fn init_logging(config: LoggingConfig) -> LoggingResult<LoggingGuard> {
    if !config.console && config.file.is_none() {
        return Ok(LoggingGuard {
            _worker_guard: None,
        });
    }

    let env_filter = match config.level {
        Some(level) => EnvFilter::new(level.to_string()),
        None => EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(LevelFilter::INFO.to_string())),
    };

    let (file_layer, guard) = match config.file {
        Some(ref file_config) => {
            let (writer, guard) = open_log_writer(file_config)?;
            let layer = fmt::layer().with_target(true).with_ansi(false).with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let console_layer = config.console.then(|| fmt::layer().with_target(true));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(console_layer)
        .try_init()
        .map_err(|e| LoggingError::SubscriberInit(e.to_string()))?;

    Ok(LoggingGuard {
        _worker_guard: guard,
    })
}

fn open_log_writer(config: &LogFileConfig) -> LoggingResult<(NonBlocking, WorkerGuard)> {
    fs::create_dir_all(&config.log_dir)?;
    archive_active_log(&config.log_dir)?;
    prune_archives(&config.log_dir, config.max_files)?;

    let file = File::create(config.log_dir.join(ACTIVE_LOG_NAME))?;
    Ok(tracing_appender::non_blocking(file))
}

/// Renames an existing `run.log` to `hc-walletd.YYYY-MM-DD.HHMMSS.log`, stamped
/// with its modification time.
fn archive_active_log(log_dir: &Path) -> LoggingResult<()> {
    let active = log_dir.join(ACTIVE_LOG_NAME);
    if !active.exists() {
        return Ok(());
    }

    let stamp = modified_at(&active).unwrap_or_else(Local::now).format("%Y-%m-%d.%H%M%S");
    let first_choice = log_dir.join(format!("{ARCHIVE_PREFIX}{stamp}.log"));
    let target = if first_choice.exists() {
        (1..=999)
            .map(|n| log_dir.join(format!("{ARCHIVE_PREFIX}{stamp}-{n}.log")))
            .find(|p| !p.exists())
            .ok_or_else(|| {
                LoggingError::RotationFailed(format!("no free archive name for stamp {stamp}"))
            })?
    } else {
        first_choice
    };

    fs::rename(&active, &target).map_err(|e| LoggingError::RotationFailed(e.to_string()))
}

fn modified_at(path: &Path) -> Option<DateTime<Local>> {
    let modified = fs::metadata(path).ok()?.modified().ok()?;
    Some(DateTime::from(modified))
}

fn is_archive_name(name: &str) -> bool {
    name.starts_with(ARCHIVE_PREFIX) && name.ends_with(".log")
}

/// Removes the oldest archives until at most `max_files` remain.
fn prune_archives(log_dir: &Path, max_files: usize) -> LoggingResult<()> {
    let mut archives: Vec<_> = fs::read_dir(log_dir)
        .map_err(|e| LoggingError::RotationFailed(format!("cannot list {}: {e}", log_dir.display())))?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_name().to_str().is_some_and(is_archive_name))
        .collect();

    if archives.len() <= max_files {
        return Ok(());
    }

    archives.sort_by_key(|entry| entry.metadata().and_then(|m| m.modified()).ok());

    let excess = archives.len() - max_files;
    for entry in archives.into_iter().take(excess) {
        if let Err(e) = fs::remove_file(entry.path()) {
            tracing::warn!("Failed to remove old log file {:?}: {}", entry.path(), e);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::time::Duration;
    use tempfile::TempDir;

    fn archives_in(dir: &Path) -> Vec<PathBuf> {
        fs::read_dir(dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_str().is_some_and(is_archive_name))
            .map(|e| e.path())
            .collect()
    }

    fn write_archives(dir: &Path, count: usize) {
        for day in 1..=count {
            let mut f = File::create(dir.join(format!("hc-walletd.2026-03-{day:02}.080000.log"))).unwrap();
            writeln!(f, "session {day}").unwrap();
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn archiving_without_active_log_is_noop() {
        let dir = TempDir::new().unwrap();
        archive_active_log(dir.path()).unwrap();
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn active_log_is_archived_with_content() {
        let dir = TempDir::new().unwrap();
        let mut f = File::create(dir.path().join(ACTIVE_LOG_NAME)).unwrap();
        writeln!(f, "INFO connected to node").unwrap();
        drop(f);

        archive_active_log(dir.path()).unwrap();

        assert!(!dir.path().join(ACTIVE_LOG_NAME).exists());
        let archives = archives_in(dir.path());
        assert_eq!(archives.len(), 1);
        assert!(fs::read_to_string(&archives[0]).unwrap().contains("connected to node"));
    }

    #[test]
    fn same_stamp_gets_collision_suffix() {
        let dir = TempDir::new().unwrap();
        for _ in 0..2 {
            File::create(dir.path().join(ACTIVE_LOG_NAME)).unwrap();
            archive_active_log(dir.path()).unwrap();
        }
        assert_eq!(archives_in(dir.path()).len(), 2);
    }

    #[test]
    fn pruning_keeps_newest_and_ignores_foreign_files() {
        let dir = TempDir::new().unwrap();
        write_archives(dir.path(), 6);
        File::create(dir.path().join(ACTIVE_LOG_NAME)).unwrap();
        File::create(dir.path().join("hc-walletd.conf")).unwrap();
        File::create(dir.path().join("node.log")).unwrap();

        prune_archives(dir.path(), 2).unwrap();

        let mut left = archives_in(dir.path());
        left.sort();
        assert_eq!(left.len(), 2);
        assert!(left[1].to_string_lossy().ends_with("2026-03-06.080000.log"));
        assert!(dir.path().join(ACTIVE_LOG_NAME).exists());
        assert!(dir.path().join("hc-walletd.conf").exists());
        assert!(dir.path().join("node.log").exists());
    }

    #[test]
    fn pruning_to_zero_removes_all_archives() {
        let dir = TempDir::new().unwrap();
        write_archives(dir.path(), 3);
        prune_archives(dir.path(), 0).unwrap();
        assert!(archives_in(dir.path()).is_empty());
    }

    #[test]
    fn writer_setup_creates_nested_dir_and_rotates() {
        let dir = TempDir::new().unwrap();
        let config = LogFileConfig::in_data_dir(&dir.path().join("wallet"), 1);
        fs::create_dir_all(&config.log_dir).unwrap();
        write_archives(&config.log_dir, 2);
        File::create(config.log_dir.join(ACTIVE_LOG_NAME)).unwrap();

        let _writer = open_log_writer(&config).unwrap();

        assert!(config.log_dir.ends_with("wallet/logs"));
        assert!(config.log_dir.join(ACTIVE_LOG_NAME).exists());
        assert_eq!(archives_in(&config.log_dir).len(), 1);
    }

    #[test]
    fn no_output_configured_succeeds() {
        let guard = init_logging(LoggingConfig {
            level: Some(LevelFilter::DEBUG),
            console: false,
            file: None,
        });
        assert!(guard.is_ok());
    }
}
