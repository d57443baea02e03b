//! Log output setup.
//!
//! Everything in the crate logs through the `log` facade. [`init`] installs a
//! `fern` dispatcher that writes timestamped lines to a log file and,
//! optionally, to stderr.

use anyhow::{Context, Result};
use once_cell::sync::OnceCell;
use std::path::PathBuf;

use crate::config::LoggingConfig;

static INSTALLED: OnceCell<PathBuf> = OnceCell::new();

/// Install the global logger described by `config`.
///
/// Returns the log file path, or `None` when logging is disabled. Only the
/// first successful call installs anything; later calls return the path
/// chosen then.
pub fn init(config: &LoggingConfig) -> Result<Option<PathBuf>> {
    if !config.enabled {
        return Ok(None);
    }
    if let Some(path) = INSTALLED.get() {
        return Ok(Some(path.clone()));
    }

    let level = config
        .level_filter()
        .ok_or_else(|| anyhow::anyhow!("Invalid logging level '{}'", config.level))?;
    let path = match &config.file {
        Some(path) => path.clone(),
        None => get_log_file_path()?,
    };
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create log directory: {}", parent.display()))?;
    }

    let mut dispatch = fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "[{} {:<5} {}] {}",
                chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ"),
                record.level(),
                record.target(),
                message
            ))
        })
        .level(level)
        .level_for("sqlx", log::LevelFilter::Warn)
        .level_for("sea_orm", log::LevelFilter::Warn)
        .chain(fern::log_file(&path).with_context(|| format!("Failed to open log file: {}", path.display()))?);
    if config.stderr {
        dispatch = dispatch.chain(std::io::stderr());
    }

    let installed = INSTALLED.get_or_try_init(|| -> Result<PathBuf> {
        dispatch.apply().context("A global logger is already installed")?;
        Ok(path)
    })?;
    Ok(Some(installed.clone()))
}

/// Default log file location: `<local data dir>/todoly/todoly.log`
pub fn get_log_file_path() -> Result<PathBuf> {
    dirs::data_local_dir()
        .ok_or_else(|| anyhow::anyhow!("Could not determine data directory"))
        .map(|dir| dir.join("todoly").join("todoly.log"))
}
