//! Configuration loading.
//!
//! Defaults, then an optional JSON config file, then `RUNBRIDGE_*`
//! environment variable overrides, in that order.

// Rust guideline compliant 2026-02

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{fs, path::PathBuf};

use crate::constants::{DEFAULT_PORT, SOCKETS_PER_RUN};

/// Server and client configuration.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(default)]
pub struct Config {
    /// Port the server listens on; also the port in proxied
    /// `<runId>.localhost` URLs.
    pub port: u16,
    /// Observer service URL. When unset, runs are not authorized.
    pub observer_url: Option<String>,
    /// Tunnel sockets approved per run.
    pub sockets_per_run: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            observer_url: None,
            sockets_per_run: SOCKETS_PER_RUN,
        }
    }
}

impl Config {
    /// Returns the configuration directory path, creating it if necessary.
    ///
    /// `RUNBRIDGE_CONFIG_DIR` overrides the platform config directory.
    pub fn config_dir() -> Result<PathBuf> {
        let dir = if let Ok(dir) = std::env::var("RUNBRIDGE_CONFIG_DIR") {
            PathBuf::from(dir)
        } else {
            dirs::config_dir()
                .context("Could not determine config directory")?
                .join("runbridge")
        };
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    /// Loads configuration from file, with environment variable overrides.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from_file().unwrap_or_default();
        config.apply_env_overrides();
        Ok(config)
    }

    fn load_from_file() -> Result<Self> {
        let config_path = Self::config_dir()?.join("config.json");
        if config_path.exists() {
            let content = fs::read_to_string(&config_path)?;
            Ok(serde_json::from_str(&content)?)
        } else {
            anyhow::bail!("Config file not found")
        }
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(port) = std::env::var("RUNBRIDGE_PORT") {
            if let Ok(port) = port.parse() {
                self.port = port;
            }
        }
        if let Ok(url) = std::env::var("RUNBRIDGE_OBSERVER_URL") {
            self.observer_url = Some(url);
        }
        if let Ok(sockets) = std::env::var("RUNBRIDGE_SOCKETS_PER_RUN") {
            if let Ok(sockets) = sockets.parse() {
                self.sockets_per_run = sockets;
            }
        }
    }

    /// Persist the configuration to the config file.
    pub fn save(&self) -> Result<()> {
        let config_path = Self::config_dir()?.join("config.json");
        let content = serde_json::to_string_pretty(self)?;
        fs::write(&config_path, content)
            .with_context(|| format!("Failed to write {}", config_path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.sockets_per_run, SOCKETS_PER_RUN);
        assert!(config.observer_url.is_none());
    }

    #[test]
    fn test_partial_file_fills_in_defaults() {
        let config: Config = serde_json::from_str(r#"{"port": 5555}"#).unwrap();
        assert_eq!(config.port, 5555);
        assert_eq!(config.sockets_per_run, SOCKETS_PER_RUN);
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        // Env var is process-global; fine for a single serial test.
        std::env::set_var("RUNBRIDGE_CONFIG_DIR", dir.path());

        let config = Config {
            port: 5678,
            observer_url: Some("https://observer.example".to_string()),
            sockets_per_run: 3,
        };
        config.save().unwrap();

        let loaded = Config::load().unwrap();
        std::env::remove_var("RUNBRIDGE_CONFIG_DIR");

        assert_eq!(loaded.port, 5678);
        assert_eq!(
            loaded.observer_url.as_deref(),
            Some("https://observer.example")
        );
        assert_eq!(loaded.sockets_per_run, 3);
    }
}
