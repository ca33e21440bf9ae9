//! Daemon configuration.
//!
//! Stored as TOML at `$RANGELOAD_CONFIG`, or `~/.config/rangeload/daemon.toml`
//! when the variable is unset. A missing file is created with defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use rangeload_transfer::EngineConfig;
use serde::{Deserialize, Serialize};

/// Environment variable overriding the configuration file location.
pub const CONFIG_ENV: &str = "RANGELOAD_CONFIG";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Root of the fragment and artifact stores.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Seconds without activity after which a transfer is reclaimable.
    #[serde(default = "default_staleness_window")]
    pub staleness_window_secs: u64,

    /// Seconds between reclamation sweeps (0 disables the ticker).
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    /// Size of the blocks yielded by range reads.
    #[serde(default = "default_read_block_size")]
    pub read_block_size: usize,
}

fn home() -> PathBuf {
    PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| "/tmp".into()))
}

fn default_data_dir() -> PathBuf {
    home().join(".local").join("share").join("rangeload")
}

fn default_staleness_window() -> u64 {
    3600
}

fn default_sweep_interval() -> u64 {
    3600
}

fn default_read_block_size() -> usize {
    rangeload_transfer::DEFAULT_READ_BLOCK_SIZE
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            staleness_window_secs: default_staleness_window(),
            sweep_interval_secs: default_sweep_interval(),
            read_block_size: default_read_block_size(),
        }
    }
}

impl Config {
    /// Loads configuration from the default location, creating it if absent.
    pub fn load() -> anyhow::Result<Self> {
        Self::load_from(&config_path())
    }

    /// Loads configuration from `path`, writing defaults there if the file
    /// does not exist.
    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            Ok(toml::from_str(&content)?)
        } else {
            let config = Config::default();
            config.save_to(path)?;
            Ok(config)
        }
    }

    pub fn save_to(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, toml::to_string_pretty(self)?)?;
        tracing::debug!(path = %path.display(), "configuration saved");
        Ok(())
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig::new(&self.data_dir)
            .with_staleness_window(Duration::from_secs(self.staleness_window_secs))
            .with_read_block_size(self.read_block_size)
    }

    pub fn sweep_interval(&self) -> Option<Duration> {
        (self.sweep_interval_secs > 0).then(|| Duration::from_secs(self.sweep_interval_secs))
    }
}

fn config_path() -> PathBuf {
    match std::env::var_os(CONFIG_ENV) {
        Some(path) => PathBuf::from(path),
        None => home().join(".config").join("rangeload").join("daemon.toml"),
    }
}
