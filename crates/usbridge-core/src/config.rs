//! Session and bridge configuration.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::constants::*;
use crate::discovery::VendorFilter;
use crate::error::{BridgeError, Result};

/// Per-session transfer configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Bulk transfer timeout in milliseconds.
    pub timeout_ms: u32,
    /// Capacity of the receive buffer kept by the policy layer.
    pub buffer_size: u32,
    /// Bulk IN endpoint address.
    pub endpoint_in: u8,
    /// Bulk OUT endpoint address.
    pub endpoint_out: u8,
    /// Reopen the device after a transfer timeout.
    pub auto_reconnect: bool,
    /// Emit a packet event for every transfer.
    pub debug_logging: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            timeout_ms: DEFAULT_TIMEOUT_MS,
            buffer_size: DEFAULT_BUFFER_SIZE,
            endpoint_in: DEFAULT_ENDPOINT_IN,
            endpoint_out: DEFAULT_ENDPOINT_OUT,
            auto_reconnect: true,
            debug_logging: false,
        }
    }
}

impl SessionConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(u64::from(self.timeout_ms))
    }

    pub fn validate(&self) -> Result<()> {
        if self.timeout_ms == 0 {
            return Err(BridgeError::InvalidConfig("timeout_ms must be non-zero".into()));
        }
        if self.buffer_size == 0 {
            return Err(BridgeError::InvalidConfig("buffer_size must be non-zero".into()));
        }
        if self.endpoint_in & ENDPOINT_DIR_IN == 0 {
            return Err(BridgeError::InvalidConfig(format!(
                "endpoint_in 0x{:02X} is not an IN endpoint",
                self.endpoint_in
            )));
        }
        if self.endpoint_out & ENDPOINT_DIR_IN != 0 {
            return Err(BridgeError::InvalidConfig(format!(
                "endpoint_out 0x{:02X} is not an OUT endpoint",
                self.endpoint_out
            )));
        }
        Ok(())
    }

    /// Copy of this config with one field replaced.
    pub fn with_field(&self, field: ConfigField, value: u32) -> Result<Self> {
        let mut next = self.clone();
        match field {
            ConfigField::TimeoutMs => next.timeout_ms = value,
            ConfigField::BufferSize => next.buffer_size = value,
            ConfigField::EndpointIn => next.endpoint_in = endpoint_value(field, value)?,
            ConfigField::EndpointOut => next.endpoint_out = endpoint_value(field, value)?,
            ConfigField::AutoReconnect => next.auto_reconnect = flag_value(field, value)?,
            ConfigField::DebugLogging => next.debug_logging = flag_value(field, value)?,
        }
        Ok(next)
    }
}

fn endpoint_value(field: ConfigField, value: u32) -> Result<u8> {
    u8::try_from(value)
        .map_err(|_| BridgeError::InvalidConfig(format!("{field} out of range: {value}")))
}

fn flag_value(field: ConfigField, value: u32) -> Result<bool> {
    match value {
        0 => Ok(false),
        1 => Ok(true),
        _ => Err(BridgeError::InvalidConfig(format!(
            "{field} expects 0 or 1, got {value}"
        ))),
    }
}

/// Field names accepted by `setConfig`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigField {
    TimeoutMs,
    BufferSize,
    EndpointIn,
    EndpointOut,
    AutoReconnect,
    DebugLogging,
}

impl ConfigField {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConfigField::TimeoutMs => "timeout_ms",
            ConfigField::BufferSize => "buffer_size",
            ConfigField::EndpointIn => "endpoint_in",
            ConfigField::EndpointOut => "endpoint_out",
            ConfigField::AutoReconnect => "auto_reconnect",
            ConfigField::DebugLogging => "debug_logging",
        }
    }
}

impl fmt::Display for ConfigField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConfigField {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "timeout_ms" => Ok(ConfigField::TimeoutMs),
            "buffer_size" => Ok(ConfigField::BufferSize),
            "endpoint_in" => Ok(ConfigField::EndpointIn),
            "endpoint_out" => Ok(ConfigField::EndpointOut),
            "auto_reconnect" => Ok(ConfigField::AutoReconnect),
            "debug_logging" => Ok(ConfigField::DebugLogging),
            other => Err(BridgeError::UnknownField(other.to_string())),
        }
    }
}

/// Bridge-wide configuration, loadable from TOML.
///
/// ```toml
/// vendor_ids = [0x0403, 0x0483]
/// max_retries = 3
///
/// [session]
/// timeout_ms = 500
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Discovery allow-list.
    pub vendor_ids: VendorFilter,
    /// Reconnect budget of the policy layer.
    pub max_retries: u32,
    /// Timeout for string reads during discovery.
    pub discovery_timeout_ms: u32,
    /// Config applied to newly created sessions.
    pub session: SessionConfig,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            vendor_ids: VendorFilter::default(),
            max_retries: DEFAULT_MAX_RETRIES,
            discovery_timeout_ms: DISCOVERY_TIMEOUT_MS,
            session: SessionConfig::default(),
        }
    }
}

impl BridgeConfig {
    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let config: BridgeConfig = toml::from_str(content).context("Invalid bridge config")?;
        config
            .session
            .validate()
            .context("Invalid [session] table")?;
        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<std::path::Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Self::from_toml_str(&content)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<std::path::Path>>(&self, path: P) -> anyhow::Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn discovery_timeout(&self) -> Duration {
        Duration::from_millis(u64::from(self.discovery_timeout_ms))
    }
}
