// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Host configuration.
//!
//! Every option has a default, so an empty document yields a usable
//! configuration:
//!
//! ```toml
//! [serial_console]
//! enabled = true
//! proxyclient_address = "127.0.0.1"
//! port_range = "10000:20000"
//! console_log_max_size = 524288
//!
//! [hyperv]
//! power_state_check_timeframe = 60
//! power_state_event_polling_interval = 2
//! ```

use crate::PortRange;
use serde::Deserialize;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Errors loading a [`HostConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read config file {}", path.display())]
    Read {
        /// The file path.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },
    /// The document is not valid.
    #[error("invalid host config")]
    Parse(#[from] toml::de::Error),
}

/// Top-level host configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HostConfig {
    /// Serial console proxy options.
    pub serial_console: SerialConsoleConfig,
    /// Hypervisor event options.
    pub hyperv: HyperVConfig,
}

impl HostConfig {
    /// Parses a TOML document.
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(s)?)
    }

    /// Reads and parses a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_owned(),
            source,
        })?;
        Self::from_toml_str(&contents)
    }
}

/// Serial console proxy options.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SerialConsoleConfig {
    /// Whether consoles are exposed over TCP.
    pub enabled: bool,
    /// The address TCP relays bind to, which is also the address handed to
    /// clients.
    pub proxyclient_address: String,
    /// Ports TCP relays are allocated from.
    pub port_range: PortRange,
    /// Size in bytes at which the console log is rotated.
    pub console_log_max_size: u64,
}

impl Default for SerialConsoleConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            proxyclient_address: "127.0.0.1".into(),
            port_range: PortRange::default(),
            console_log_max_size: 512 * 1024,
        }
    }
}

/// Hypervisor event options.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HyperVConfig {
    /// Lookback window, in seconds, for power-state change events.
    pub power_state_check_timeframe: u64,
    /// Delay, in seconds, between event polls when no event is pending.
    pub power_state_event_polling_interval: u64,
}

impl HyperVConfig {
    /// [`Self::power_state_check_timeframe`] as a duration.
    pub fn check_timeframe(&self) -> Duration {
        Duration::from_secs(self.power_state_check_timeframe)
    }

    /// [`Self::power_state_event_polling_interval`] as a duration.
    pub fn polling_interval(&self) -> Duration {
        Duration::from_secs(self.power_state_event_polling_interval)
    }
}

impl Default for HyperVConfig {
    fn default() -> Self {
        Self {
            power_state_check_timeframe: 60,
            power_state_event_polling_interval: 2,
        }
    }
}
