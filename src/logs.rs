//! Logging facilities built on tracing and tracing-subscriber.
//!
//! Output goes to the terminal and, unless disabled, to a timestamped log
//! file. Only the log files of the most recent runs are kept.

use chrono::Local;
use color_eyre::eyre::OptionExt;
use color_eyre::{Result, eyre::WrapErr};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{Level, debug};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_error::ErrorLayer;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

/// Default maximum number of log files to retain.
pub(crate) const DEFAULT_MAX_LOGS: usize = 15;

/// Environment variable consulted for extra filter directives.
const FILTER_ENV: &str = "FLEETFORM_LOG";

// -------------------------------------------------------------------------------------------------
// Logger
// -------------------------------------------------------------------------------------------------

/// Terminal + file logging with rotation.
#[derive(Debug, Clone)]
pub(crate) struct Logger {
    /// Logging level for the terminal layer.
    pub(crate) verbosity: Level,
    /// Maximum number of log files to retain.
    pub(crate) max_logs: usize,
    /// Directory where log files are stored; `None` disables file logging.
    pub(crate) log_dir: Option<PathBuf>,
}

impl Logger {
    /// Installs the global subscriber and returns the guard keeping the
    /// non-blocking file writer alive.
    pub(crate) fn start(&self) -> Result<Option<WorkerGuard>> {
        let level = self.verbosity;

        let terminal_layer = fmt::layer()
            .compact()
            .with_target(level >= Level::TRACE)
            .with_file(level >= Level::TRACE)
            .with_line_number(level >= Level::TRACE)
            .with_timer(fmt::time::ChronoLocal::new("%FT%X%.3f".to_string()))
            .with_filter(EnvFilter::from_env(FILTER_ENV).add_directive(level.into()));

        let (file_layer, guard) = match &self.log_dir {
            Some(log_dir) => {
                fs::create_dir_all(log_dir).wrap_err_with(|| {
                    format!("Failed to create log directory {:?}", log_dir)
                })?;
                let timestamp = Local::now().format("%Y%m%d_%H%M%S");
                let appender = tracing_appender::rolling::never(
                    log_dir,
                    format!("fleetform_{}.log", timestamp),
                );
                let (non_blocking, guard) = tracing_appender::non_blocking(appender);
                let layer = fmt::layer()
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_thread_names(true)
                    .with_ansi(false)
                    .with_writer(non_blocking)
                    .with_filter(EnvFilter::from_env(FILTER_ENV).add_directive(level.into()));
                (Some(layer), Some(guard))
            }
            None => (None, None),
        };

        tracing_subscriber::registry()
            .with(file_layer)
            .with(terminal_layer)
            .with(ErrorLayer::default())
            .init();

        if let Some(log_dir) = &self.log_dir {
            rotate_logs(log_dir, self.max_logs)?;
        }
        Ok(guard)
    }
}

/// Removes all but the newest `max_logs` log files from `log_dir`.
fn rotate_logs(log_dir: &Path, max_logs: usize) -> Result<()> {
    debug!("Starting log rotation");
    let mut log_files: Vec<_> = fs::read_dir(log_dir)
        .wrap_err_with(|| format!("Failed to read log directory {:?}", log_dir))?
        .filter_map(|entry| entry.ok())
        .filter(|entry| {
            entry
                .path()
                .extension()
                .is_some_and(|ext| ext == "log")
        })
        .collect();

    // Timestamped names sort chronologically; newest first after reverse.
    log_files.sort_by_key(|entry| entry.file_name());
    log_files.reverse();

    debug!(total_logs = log_files.len(), "Found log files");

    for old_log in log_files.iter().skip(max_logs) {
        let path = old_log.path();
        debug!(?path, "Removing old log file");
        fs::remove_file(&path)
            .wrap_err_with(|| format!("Failed to remove old log file {:?}", &path))?;
    }
    Ok(())
}

// -------------------------------------------------------------------------------------------------
// LoggerBuilder
// -------------------------------------------------------------------------------------------------

/// Fluent configuration for [`Logger`].
#[derive(Debug, Default)]
pub(crate) struct LoggerBuilder {
    verbosity: Option<Level>,
    max_logs: Option<usize>,
    log_dir: Option<PathBuf>,
    no_log_file: bool,
}

impl LoggerBuilder {
    pub(crate) fn new() -> Self {
        LoggerBuilder::default()
    }

    /// Verbosity from the CLI count: 0 = info, 1 = debug, 2+ = trace.
    pub(crate) fn with_verbosity(&mut self, verbosity: u8) -> &mut Self {
        self.verbosity = Some(match verbosity {
            0 => Level::INFO,
            1 => Level::DEBUG,
            _ => Level::TRACE,
        });
        self
    }

    pub(crate) fn with_max_logs(&mut self, count: usize) -> &mut Self {
        self.max_logs = Some(count);
        self
    }

    pub(crate) fn with_log_dir(&mut self, dir: &Path) -> &mut Self {
        self.log_dir = Some(dir.into());
        self
    }

    /// Terminal-only logging.
    pub(crate) fn without_log_file(&mut self) -> &mut Self {
        self.no_log_file = true;
        self
    }

    pub(crate) fn build(&self) -> Result<Logger> {
        Ok(Logger {
            verbosity: self.verbosity.ok_or_eyre("Verbosity level undefined")?,
            max_logs: self.max_logs.unwrap_or(DEFAULT_MAX_LOGS),
            log_dir: if self.no_log_file {
                None
            } else {
                match &self.log_dir {
                    Some(dir) => Some(dir.clone()),
                    None => Some(default_log_dir()?),
                }
            },
        })
    }
}

/// `XDG_DATA_HOME/fleetform/logs`, falling back to the platform data dir.
pub(crate) fn default_log_dir() -> Result<PathBuf> {
    let log_dir = dirs::data_dir()
        .ok_or_eyre("Failed to determine user's local data dir")?
        .join("fleetform")
        .join("logs");
    Ok(log_dir)
}

// -------------------------------------------------------------------------------------------------
// Tests
// -------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use tempfile::tempdir;

    #[test]
    fn test_log_rotation() -> Result<()> {
        let temp_dir = tempdir()?;

        for i in 0..10 {
            File::create(temp_dir.path().join(format!("fleetform_20250114_10412{i}.log")))?;
        }
        for i in 0..10 {
            File::create(temp_dir.path().join(format!("fleetform_20250114_10413{i}.log")))?;
        }
        // Non-log files are ignored by rotation.
        File::create(temp_dir.path().join("notes.txt"))?;

        rotate_logs(temp_dir.path(), 15)?;

        let mut remaining: Vec<_> = fs::read_dir(&temp_dir)?
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.path().extension().is_some_and(|ext| ext == "log"))
            .collect();
        remaining.sort_by_key(|entry| entry.file_name());

        assert_eq!(remaining.len(), 15, "keeps exactly 15 log files");
        assert_eq!(
            remaining[0].path(),
            temp_dir.path().join("fleetform_20250114_104125.log"),
            "oldest retained file follows the rotation cutoff"
        );
        assert!(temp_dir.path().join("notes.txt").exists());
        Ok(())
    }

    #[test]
    fn test_builder_defaults() -> Result<()> {
        let logger = LoggerBuilder::new()
            .with_verbosity(1)
            .without_log_file()
            .build()?;
        assert_eq!(logger.verbosity, Level::DEBUG);
        assert_eq!(logger.max_logs, DEFAULT_MAX_LOGS);
        assert!(logger.log_dir.is_none());
        Ok(())
    }

    #[test]
    fn test_builder_requires_verbosity() {
        assert!(LoggerBuilder::new().build().is_err());
    }

    #[test]
    fn test_default_log_dir_honors_xdg() -> Result<()> {
        let temp_dir = tempdir()?;
        temp_env::with_var("XDG_DATA_HOME", Some(temp_dir.path()), || -> Result<()> {
            let log_dir = default_log_dir()?;
            assert_eq!(
                log_dir,
                temp_dir.path().join("fleetform").join("logs"),
                "uses XDG_DATA_HOME when set"
            );
            Ok(())
        })
    }
}
