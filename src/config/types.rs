//! Configuration type definitions

use crate::clipboard::formats::DEFAULT_MAX_DATA_SIZE;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Clipboard bridge configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// X display to connect to (None = `$DISPLAY`)
    pub display: Option<String>,

    /// Selection bridged to the remote clipboard
    pub selection: String,

    /// Largest payload converted in either direction (bytes)
    pub max_data_size: usize,

    /// Liveness polls made while waiting for the event thread to exit
    pub shutdown_poll_attempts: u32,

    /// Sleep between liveness polls (milliseconds)
    pub shutdown_poll_interval_ms: u64,

    /// Age after which an unanswered local conversion is abandoned (milliseconds)
    pub local_fetch_timeout_ms: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            display: None,
            selection: "CLIPBOARD".to_string(),
            max_data_size: DEFAULT_MAX_DATA_SIZE,
            shutdown_poll_attempts: 100,
            shutdown_poll_interval_ms: 250,
            local_fetch_timeout_ms: 5000,
        }
    }
}

/// Clipboard channel framing configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Largest PDU body accepted from the remote side (bytes)
    pub max_pdu_size: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            // Room for a maximum payload encoded as UTF-16 plus its terminator
            max_pdu_size: DEFAULT_MAX_DATA_SIZE * 2 + 2,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level ("trace", "debug", "info", "warn", "error")
    pub level: String,

    /// Output format ("pretty", "compact", "json")
    pub format: String,

    /// Also write logs to this file
    pub log_file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            log_file: None,
        }
    }
}
