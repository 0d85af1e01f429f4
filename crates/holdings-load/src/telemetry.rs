//! Diagnostics sink lifecycle
//!
//! All crate code logs through `tracing` macros against the process-wide
//! dispatcher. [`init_logging`] installs that dispatcher once per process:
//! a console layer (human or JSON) plus an optional run log file in a
//! directory that keeps only the newest `max_files` logs. The returned
//! [`LoggingGuard`] flushes the file when dropped.
//!
//! Tests that want to capture output scope their own subscriber with
//! `tracing::subscriber::with_default` instead.

use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer, Registry};
use validator::Validate;

use crate::error::{Error, Result};

const LOG_FILE_PREFIX: &str = "holdings-";
const LOG_FILE_SUFFIX: &str = ".log";

/// Console output format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable lines
    #[default]
    Pretty,
    /// One JSON object per event
    Json,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset (e.g. `info`, `holdings_load=debug`)
    #[serde(default = "default_level")]
    #[validate(length(min = 1))]
    pub level: String,

    /// Console format
    #[serde(default)]
    pub format: LogFormat,

    /// Directory for per-run log files; no file is written when unset
    #[serde(default)]
    pub directory: Option<PathBuf>,

    /// Number of run logs kept in `directory`, including the current one
    #[serde(default = "default_max_files")]
    #[validate(range(min = 1, max = 1000))]
    pub max_files: usize,
}

fn default_level() -> String {
    "info".to_string()
}

fn default_max_files() -> usize {
    2
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            format: LogFormat::default(),
            directory: None,
            max_files: default_max_files(),
        }
    }
}

/// Keeps the run log open; flushes it on drop
#[derive(Debug, Default)]
pub struct LoggingGuard {
    file: Option<Arc<File>>,
    path: Option<PathBuf>,
}

impl LoggingGuard {
    /// Path of the run log, if one was opened
    pub fn log_file(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

impl Drop for LoggingGuard {
    fn drop(&mut self) {
        if let Some(file) = &self.file {
            let _ = file.sync_all();
        }
    }
}

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Install the global subscriber.
///
/// `RUST_LOG` takes precedence over `config.level`. Fails if a global
/// subscriber is already installed.
pub fn init_logging(config: &LoggingConfig) -> Result<LoggingGuard> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.level)
            .map_err(|e| Error::config(format!("invalid log level '{}': {}", config.level, e)))?,
    };

    let mut layers: Vec<BoxedLayer> = Vec::new();
    layers.push(match config.format {
        LogFormat::Pretty => fmt::layer()
            .with_target(true)
            .with_writer(std::io::stderr)
            .boxed(),
        LogFormat::Json => fmt::layer()
            .json()
            .with_target(true)
            .with_writer(std::io::stderr)
            .boxed(),
    });

    let mut guard = LoggingGuard::default();
    if let Some(dir) = &config.directory {
        let (path, file) = open_run_log(dir, config.max_files)?;
        let file = Arc::new(file);
        layers.push(
            fmt::layer()
                .with_ansi(false)
                .with_target(true)
                .with_writer(Arc::clone(&file))
                .boxed(),
        );
        guard.file = Some(file);
        guard.path = Some(path);
    }

    tracing_subscriber::registry()
        .with(layers)
        .with(filter)
        .try_init()
        .map_err(|e| Error::config(format!("failed to install logger: {}", e)))?;

    if let Some(path) = guard.log_file() {
        debug!(path = %path.display(), "writing run log");
    }
    Ok(guard)
}

/// Create a fresh run log in `dir`, deleting the oldest ones so that at most
/// `max_files` remain afterwards
fn open_run_log(dir: &Path, max_files: usize) -> Result<(PathBuf, File)> {
    fs::create_dir_all(dir)?;
    prune_logs(dir, max_files.saturating_sub(1))?;

    let stamp = chrono::Local::now().format("%Y%m%d-%H%M%S%.3f");
    let path = dir.join(format!("{LOG_FILE_PREFIX}{stamp}{LOG_FILE_SUFFIX}"));
    let file = File::create(&path)?;
    Ok((path, file))
}

/// Delete the oldest run logs until at most `keep` remain
pub fn prune_logs(dir: &Path, keep: usize) -> Result<Vec<PathBuf>> {
    let mut logs: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| is_run_log(path))
        .collect();
    // Timestamped names sort chronologically
    logs.sort();

    let excess = logs.len().saturating_sub(keep);
    let removed: Vec<PathBuf> = logs.into_iter().take(excess).collect();
    for path in &removed {
        fs::remove_file(path)?;
    }
    Ok(removed)
}

fn is_run_log(path: &Path) -> bool {
    path.is_file()
        && path
            .file_name()
            .and_then(|n| n.to_str())
            .map(|n| n.starts_with(LOG_FILE_PREFIX) && n.ends_with(LOG_FILE_SUFFIX))
            .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_logging_config_defaults() {
        let config: LoggingConfig = serde_yaml::from_str("{}").unwrap();
        assert_eq!(config, LoggingConfig::default());
        assert_eq!(config.max_files, 2);
        assert_eq!(config.format, LogFormat::Pretty);

        let config: LoggingConfig =
            serde_yaml::from_str("format: json\nlevel: debug\nmax_files: 0").unwrap();
        assert_eq!(config.format, LogFormat::Json);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_prune_keeps_newest() {
        let dir = tempfile::tempdir().unwrap();
        for name in [
            "holdings-20240101-000000.000.log",
            "holdings-20240102-000000.000.log",
            "holdings-20240103-000000.000.log",
            "other.log",
        ] {
            fs::write(dir.path().join(name), "x").unwrap();
        }

        let removed = prune_logs(dir.path(), 1).unwrap();
        assert_eq!(removed.len(), 2);

        let mut left: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        left.sort();
        assert_eq!(left, ["holdings-20240103-000000.000.log", "other.log"]);
    }

    #[test]
    fn test_open_run_log_respects_max_files() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("holdings-20200101-000000.000.log"), "").unwrap();
        fs::write(dir.path().join("holdings-20200102-000000.000.log"), "").unwrap();

        let (path, _file) = open_run_log(dir.path(), 2).unwrap();
        assert!(path.exists());

        let count = fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(count, 2);
        assert!(!dir.path().join("holdings-20200101-000000.000.log").exists());
    }
}
