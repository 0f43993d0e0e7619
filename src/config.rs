// Monitor configuration: defaults, on-disk overrides and validation

use crate::aggregator::DEFAULT_UPDATE_INTERVAL;
use crate::queue::DEFAULT_QUEUE_CAPACITY;
use crate::sockets::DEFAULT_REFRESH_INTERVAL;
use crate::stats::{DEFAULT_RATE_WINDOW, DEFAULT_SAMPLE_CAPACITY};
use crate::worker::DEFAULT_STOP_TIMEOUT;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const CONFIG_DIR: &str = "xnettop";
const CONFIG_FILE: &str = "config.json";

/// Tunables for the capture, socket table and attribution loops
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Capture interface. None = every interface that is up and has an address
    pub interface: Option<String>,
    pub socket_refresh_secs: f64,
    pub aggregate_interval_secs: f64,
    pub rate_window_secs: f64,
    pub queue_capacity: usize,
    pub sample_capacity: usize,
    /// Display refresh interval for the TUI
    pub ui_refresh_secs: f64,
    /// How long stop waits for each background loop
    pub stop_timeout_secs: f64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interface: None,
            socket_refresh_secs: DEFAULT_REFRESH_INTERVAL.as_secs_f64(),
            aggregate_interval_secs: DEFAULT_UPDATE_INTERVAL.as_secs_f64(),
            rate_window_secs: DEFAULT_RATE_WINDOW.as_secs_f64(),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            sample_capacity: DEFAULT_SAMPLE_CAPACITY,
            ui_refresh_secs: 1.0,
            stop_timeout_secs: DEFAULT_STOP_TIMEOUT.as_secs_f64(),
        }
    }
}

fn check_secs(name: &str, value: f64) -> Result<()> {
    if !value.is_finite() || value <= 0.0 {
        anyhow::bail!("{} must be a positive number of seconds, got {}", name, value);
    }
    Ok(())
}

impl MonitorConfig {
    /// Default config file location (`~/.config/xnettop/config.json` on Linux)
    pub fn config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join(CONFIG_DIR).join(CONFIG_FILE))
    }

    /// Load from the default location, falling back to defaults if there is no file
    pub fn load() -> Result<Self> {
        match Self::config_path() {
            Some(path) => Self::load_from(&path),
            None => {
                log::debug!("No config directory on this platform, using defaults");
                Ok(Self::default())
            }
        }
    }

    /// Load from `path`. A missing file yields defaults; a malformed one is an error.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            log::debug!("Config file {:?} not found, using defaults", path);
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        let config: MonitorConfig = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;
        config
            .validate()
            .with_context(|| format!("Invalid config file: {:?}", path))?;

        log::info!("Loaded configuration from {:?}", path);
        Ok(config)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create config directory: {:?}", dir))?;
        }
        let contents = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {:?}", path))?;

        log::info!("Saved configuration to {:?}", path);
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        check_secs("socket_refresh_secs", self.socket_refresh_secs)?;
        check_secs("aggregate_interval_secs", self.aggregate_interval_secs)?;
        check_secs("rate_window_secs", self.rate_window_secs)?;
        check_secs("ui_refresh_secs", self.ui_refresh_secs)?;
        check_secs("stop_timeout_secs", self.stop_timeout_secs)?;
        if self.queue_capacity == 0 {
            anyhow::bail!("queue_capacity must be at least 1");
        }
        if self.sample_capacity == 0 {
            anyhow::bail!("sample_capacity must be at least 1");
        }
        if matches!(self.interface.as_deref(), Some(name) if name.trim().is_empty()) {
            anyhow::bail!("interface must not be empty");
        }
        Ok(())
    }

    pub fn socket_refresh(&self) -> Duration {
        Duration::from_secs_f64(self.socket_refresh_secs)
    }

    pub fn aggregate_interval(&self) -> Duration {
        Duration::from_secs_f64(self.aggregate_interval_secs)
    }

    pub fn rate_window(&self) -> Duration {
        Duration::from_secs_f64(self.rate_window_secs)
    }

    pub fn ui_refresh(&self) -> Duration {
        Duration::from_secs_f64(self.ui_refresh_secs)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.stop_timeout_secs)
    }
}
