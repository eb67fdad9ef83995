//! # Runtime Configuration
//!
//! Configuration for the adapter layer. Values can be set programmatically
//! through the builder or loaded from environment variables.
//!
//! # Environment Variables
//!
//! All environment variables use the `TETHER_` prefix:
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `TETHER_SPIN_LIMIT` | Busy-spin attempts before a lock parks | 100 |
//! | `TETHER_TIMER_THREAD` | Name of the host timer dispatcher thread | `tether-timer` |

use std::env;

use thiserror::Error;
use tracing::warn;

use crate::sync::DEFAULT_SPIN_LIMIT;

/// Default dispatcher thread name.
pub const DEFAULT_TIMER_THREAD: &str = "tether-timer";

/// Error type for configuration validation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A configuration value failed validation.
    #[error("invalid value for {key}: {value}")]
    InvalidValue {
        /// The configuration key.
        key: &'static str,
        /// The rejected value.
        value: String,
    },
}

/// Configuration for the runtime adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Busy-spin attempts before hybrid locks park on their wait object.
    pub spin_limit: u32,
    /// Thread name for the host timer dispatcher.
    pub timer_thread_name: String,
}

impl RuntimeConfig {
    /// Start building a configuration.
    pub fn builder() -> RuntimeConfigBuilder {
        RuntimeConfigBuilder::default()
    }

    /// Load configuration from `TETHER_*` environment variables.
    ///
    /// Unset variables fall back to defaults; unparsable values are ignored
    /// with a warning.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(value) = env::var("TETHER_SPIN_LIMIT") {
            match value.parse() {
                Ok(limit) => config.spin_limit = limit,
                Err(_) => warn!(%value, "ignoring unparsable TETHER_SPIN_LIMIT"),
            }
        }
        if let Ok(value) = env::var("TETHER_TIMER_THREAD") {
            if value.is_empty() {
                warn!("ignoring empty TETHER_TIMER_THREAD");
            } else {
                config.timer_thread_name = value;
            }
        }

        config
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            spin_limit: DEFAULT_SPIN_LIMIT,
            timer_thread_name: DEFAULT_TIMER_THREAD.to_string(),
        }
    }
}

/// Builder for [`RuntimeConfig`].
#[derive(Debug, Clone, Default)]
pub struct RuntimeConfigBuilder {
    spin_limit: Option<u32>,
    timer_thread_name: Option<String>,
}

impl RuntimeConfigBuilder {
    /// Set the busy-spin limit for hybrid locks.
    pub fn spin_limit(mut self, limit: u32) -> Self {
        self.spin_limit = Some(limit);
        self
    }

    /// Set the host timer dispatcher thread name.
    pub fn timer_thread_name(mut self, name: impl Into<String>) -> Self {
        self.timer_thread_name = Some(name.into());
        self
    }

    /// Validate and build the configuration.
    pub fn build(self) -> Result<RuntimeConfig, ConfigError> {
        let defaults = RuntimeConfig::default();
        let timer_thread_name = self
            .timer_thread_name
            .unwrap_or(defaults.timer_thread_name);
        if timer_thread_name.is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "timer_thread_name",
                value: timer_thread_name,
            });
        }

        Ok(RuntimeConfig {
            spin_limit: self.spin_limit.unwrap_or(defaults.spin_limit),
            timer_thread_name,
        })
    }
}

// ============================================================================
// Tests
// ============================================================================
