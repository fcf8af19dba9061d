//! Optional `tracing` setup for embedders that want the engine to own its
//! log output.

use anyhow::{Context, Result};
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Mutex;
use tracing_subscriber::EnvFilter;

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,skiff_core=debug"))
}

/// Location of the engine log file under the XDG state directory
/// (`~/.local/state/skiff/engine.log`).
pub fn log_path() -> Result<PathBuf> {
    let dirs = xdg::BaseDirectories::with_prefix("skiff")?;
    Ok(dirs.place_state_file("engine.log")?)
}

/// Route `tracing` output to the engine log file. A `Mutex<File>` writer
/// keeps concurrent log lines whole without any custom writer type.
///
/// Returns Err when the state directory is unusable so the caller can fall
/// back to [`init_logging_stderr`] instead of crashing.
pub fn init_logging() -> Result<()> {
    let path = log_path()?;
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("open log file {}", path.display()))?;

    tracing_subscriber::fmt()
        .with_env_filter(env_filter())
        .with_writer(Mutex::new(file))
        .with_ansi(false)
        .init();

    tracing::debug!(path = %path.display(), "file logging active");
    Ok(())
}

/// Stderr-only logging, for tooling and for hosts where `init_logging`
/// failed.
pub fn init_logging_stderr() {
    tracing_subscriber::fmt()
        .with_env_filter(env_filter())
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();
}
