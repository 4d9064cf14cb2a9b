//! Configuration structures.
//!
//! Configuration is read from a JSON document; every section falls back to
//! its defaults when omitted.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use super::errors::{Error, Result};

/// Global runtime configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Event bus configuration.
    #[serde(default)]
    pub bus: BusConfig,

    /// State store configuration.
    #[serde(default)]
    pub store: StoreConfig,

    /// Service lifecycle configuration.
    #[serde(default)]
    pub lifecycle: LifecycleConfig,

    /// Observability configuration.
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl Config {
    /// Parse a configuration from a JSON string.
    pub fn from_json_str(raw: &str) -> Result<Self> {
        let config: Config = serde_json::from_str(raw)?;
        config.check()?;
        Ok(config)
    }

    /// Read and parse a JSON configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&raw)
    }

    fn check(&self) -> Result<()> {
        if self.bus.max_emit_depth == 0 {
            return Err(Error::config("bus.max_emit_depth must be positive"));
        }
        if self.lifecycle.init_timeout.is_zero() {
            return Err(Error::config("lifecycle.init_timeout must be positive"));
        }
        Ok(())
    }
}

/// Event bus configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    /// Maximum nesting of `emit` calls on one thread (listener emitting from
    /// inside a listener). Deeper emissions are rejected.
    pub max_emit_depth: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self { max_emit_depth: 16 }
    }
}

/// State store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Number of change records kept for undo.
    pub max_history: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self { max_history: 50 }
    }
}

/// Service lifecycle configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleConfig {
    /// Upper bound on a single service's `initialize()`.
    #[serde(with = "humantime_serde")]
    pub init_timeout: Duration,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            init_timeout: Duration::from_secs(10),
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Tracing log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Enable JSON log formatting.
    pub json_logs: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}
