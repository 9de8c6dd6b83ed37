//! Configuration management
//!
//! Handles loading, validation, and merging of configuration from:
//! - TOML files
//! - CLI arguments

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

pub mod types;

pub use types::{BridgeConfig, ChannelConfig, LoggingConfig};

/// Main configuration structure
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Clipboard bridge configuration
    #[serde(default)]
    pub bridge: BridgeConfig,
    /// Channel framing configuration
    #[serde(default)]
    pub channel: ChannelConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content).context("Failed to parse config file")?;

        config.validate()?;
        Ok(config)
    }

    /// Create default configuration
    pub fn default_config() -> Self {
        Self::default()
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.bridge.selection.is_empty() {
            anyhow::bail!("Selection name must not be empty");
        }

        if self.bridge.max_data_size == 0 {
            anyhow::bail!("max_data_size must be greater than zero");
        }

        if self.bridge.shutdown_poll_interval_ms == 0 {
            anyhow::bail!("shutdown_poll_interval_ms must be greater than zero");
        }

        if self.bridge.local_fetch_timeout_ms == 0 {
            anyhow::bail!("local_fetch_timeout_ms must be greater than zero");
        }

        if self.channel.max_pdu_size < self.bridge.max_data_size {
            anyhow::bail!(
                "max_pdu_size ({}) cannot be smaller than max_data_size ({})",
                self.channel.max_pdu_size,
                self.bridge.max_data_size
            );
        }

        match self.logging.format.as_str() {
            "pretty" | "compact" | "json" => {}
            _ => anyhow::bail!("Invalid log format: {}", self.logging.format),
        }

        match self.logging.level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => anyhow::bail!("Invalid log level: {}", self.logging.level),
        }

        Ok(())
    }

    /// Override config with CLI arguments
    pub fn with_overrides(mut self, display: Option<String>, selection: Option<String>) -> Self {
        if display.is_some() {
            self.bridge.display = display;
        }
        if let Some(selection) = selection {
            self.bridge.selection = selection;
        }
        self
    }
}
