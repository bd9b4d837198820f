//! Common utility functions for the simulation binary.
//!
//! This module contains shared utilities for CLI applications including:
//! - Logger initialization
//! - Output path validation and naming

use anyhow::{Result, bail};
use std::path::{Path, PathBuf};

/// Initialize the logger with the specified configuration.
///
/// # Arguments
/// * `log_level` - Log level string (off, error, warn, info, debug, trace)
/// * `log_file` - Optional path to log file (logs to stderr if None)
///
/// # Errors
/// Returns an error if the log file cannot be opened or logger initialization fails.
pub fn init_logger(log_level: &str, log_file: Option<&PathBuf>) -> Result<()> {
    use std::io::Write;

    let level = log_level.parse::<log::LevelFilter>().unwrap_or_else(|_| {
        eprintln!("Invalid log level '{}', defaulting to 'info'", log_level);
        log::LevelFilter::Info
    });

    let mut builder = env_logger::Builder::new();
    builder.filter_level(level);
    builder.format(|buf, record| {
        writeln!(
            buf,
            "{} [{}] {} - {}",
            chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
            record.level(),
            std::thread::current().name().unwrap_or("main"),
            record.args()
        )
    });

    if let Some(log_path) = log_file {
        if let Some(parent) = log_path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let target = Box::new(
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(log_path)?,
        );
        builder.target(env_logger::Target::Pipe(target));
    }

    builder.try_init()?;
    Ok(())
}

/// Validate that an output path can be written, creating its parent directory if needed.
///
/// # Errors
/// Returns an error if the path is an existing directory or the parent cannot be created.
pub fn validate_output_path(output: &Path) -> Result<()> {
    if output.is_dir() {
        bail!("Output path '{}' is a directory.", output.display());
    }
    if let Some(parent) = output.parent()
        && !parent.as_os_str().is_empty()
        && !parent.exists()
    {
        std::fs::create_dir_all(parent)?;
    }
    Ok(())
}

/// Output path of one trial: `{stem}_{trial}.{extension}` next to `output`.
pub fn trial_output_path(output: &Path, trial: u64) -> PathBuf {
    let stem = output
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("tracking");
    let extension = output.extension().and_then(|s| s.to_str()).unwrap_or("csv");
    output.with_file_name(format!("{}_{}.{}", stem, trial, extension))
}
