use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Global engine configuration loaded from `~/.config/skiff/config.toml`.
///
/// Embedders that ship their own configuration layer can construct this
/// directly; `load_or_init` is a convenience for standalone deployments.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Connections per download when the request asks for 0 ("use default").
    pub default_connections: u32,
    /// Upper bound on segments per download.
    pub max_segments: u32,
    /// Maximum downloads running at once.
    pub max_concurrent_downloads: usize,
    /// Maximum concurrent downloads per host.
    pub max_downloads_per_host: usize,
    /// Whether the scheduler starts admitted tasks immediately.
    pub autostart: bool,
    /// Retries after the first attempt before a task fails.
    pub retry_count: u32,
    /// Base backoff delay; doubled per attempt.
    pub retry_delay_ms: u64,
    /// Floor between observable progress emissions.
    pub progress_interval_ms: u64,
    /// Cadence for flushing segment progress into the task store.
    pub save_interval_ms: u64,
    /// Connect/HEAD timeout. Body reads are unbounded: segment downloads
    /// can be lengthy at low bandwidth.
    pub request_timeout_secs: u64,
    /// Directory used for null and bare-name destinations.
    pub default_directory: PathBuf,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_connections: 8,
            max_segments: 16,
            max_concurrent_downloads: 3,
            max_downloads_per_host: 2,
            autostart: true,
            retry_count: 3,
            retry_delay_ms: 500,
            progress_interval_ms: 500,
            save_interval_ms: 2000,
            request_timeout_secs: 30,
            default_directory: default_download_dir(),
        }
    }
}

fn default_download_dir() -> PathBuf {
    if let Some(home) = std::env::var_os("HOME") {
        let downloads = PathBuf::from(home).join("Downloads");
        if downloads.is_dir() {
            return downloads;
        }
    }
    PathBuf::from(".")
}

/// Location of the config file under the XDG config directory. The leading
/// directories are created by `place_config_file`.
pub fn config_path() -> Result<PathBuf> {
    let dirs = xdg::BaseDirectories::with_prefix("skiff")?;
    Ok(dirs.place_config_file("config.toml")?)
}

/// Load the engine configuration, seeding the config file with defaults on
/// first run. A missing file is the only error that gets repaired; anything
/// else (unreadable file, bad TOML) surfaces to the caller.
pub fn load_or_init() -> Result<EngineConfig> {
    let path = config_path()?;
    match fs::read_to_string(&path) {
        Ok(text) => {
            toml::from_str(&text).with_context(|| format!("parse {}", path.display()))
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            let defaults = EngineConfig::default();
            seed_config_file(&path, &defaults)?;
            Ok(defaults)
        }
        Err(e) => Err(e).with_context(|| format!("read {}", path.display())),
    }
}

fn seed_config_file(path: &Path, config: &EngineConfig) -> Result<()> {
    fs::write(path, toml::to_string_pretty(config)?)
        .with_context(|| format!("write default config to {}", path.display()))?;
    tracing::debug!(path = %path.display(), "seeded default engine config");
    Ok(())
}
