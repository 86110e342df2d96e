//! Configuration
//!
//! Controller and reactor settings, loadable from TOML:
//!
//! ```toml
//! [controller]
//! quiescent_delay_ms = 25
//! request_timeout_ms = 3000
//!
//! [reactor]
//! thread_name = "bacnet-io"
//! ```
//!
//! Every field is optional. Environment variables override the file:
//! `IOCB_QUIESCENT_DELAY_MS`, `IOCB_REQUEST_TIMEOUT_MS` and
//! `IOCB_REACTOR_THREAD`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Error type for configuration loading
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IoConfig {
    #[serde(default)]
    pub controller: ControllerConfig,

    #[serde(default)]
    pub reactor: ReactorConfig,
}

/// Per-controller settings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Pause after each completion before the next dispatch, 0 for none
    pub quiescent_delay_ms: u64,

    /// Abort requests created through `submit` after this long
    pub request_timeout_ms: Option<u64>,
}

impl ControllerConfig {
    pub fn quiescent_delay(&self) -> Duration {
        Duration::from_millis(self.quiescent_delay_ms)
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_ms.map(Duration::from_millis)
    }

    pub fn with_quiescent_delay(mut self, delay: Duration) -> Self {
        self.quiescent_delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout_ms = Some(u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX));
        self
    }
}

/// Settings for the dedicated reactor thread
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReactorConfig {
    pub thread_name: String,
}

impl Default for ReactorConfig {
    fn default() -> Self {
        Self {
            thread_name: "iocb-reactor".to_string(),
        }
    }
}

impl IoConfig {
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Load from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let config = Self::from_toml_str(&content)?;
        info!("Loaded I/O configuration from {}", path.display());
        Ok(config)
    }

    /// Apply `IOCB_*` environment overrides
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides(|name| std::env::var(name).ok())
    }

    fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(value) = lookup("IOCB_QUIESCENT_DELAY_MS") {
            match value.parse::<u64>() {
                Ok(ms) => self.controller.quiescent_delay_ms = ms,
                Err(_) => warn!("Invalid IOCB_QUIESCENT_DELAY_MS value '{}', ignoring", value),
            }
        }

        if let Some(value) = lookup("IOCB_REQUEST_TIMEOUT_MS") {
            match value.parse::<u64>() {
                Ok(0) => self.controller.request_timeout_ms = None,
                Ok(ms) => self.controller.request_timeout_ms = Some(ms),
                Err(_) => warn!("Invalid IOCB_REQUEST_TIMEOUT_MS value '{}', ignoring", value),
            }
        }

        if let Some(name) = lookup("IOCB_REACTOR_THREAD") {
            self.reactor.thread_name = name;
        }

        self
    }
}
