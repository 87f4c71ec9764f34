//! Configuration for the watch loop
//!
//! Values can be built in code through [`WatcherConfig::builder`] or loaded
//! from a TOML file. Missing keys fall back to the defaults.

use crate::decoder::{MAX_NAME_LEN, RECORD_HEADER_SIZE};
use crate::error::{Result, WatchError};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Configuration for a [`Watcher`](crate::Watcher)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatcherConfig {
    /// Bounded wait for records in milliseconds (default: 3000ms)
    pub poll_timeout_ms: u64,
    /// Number of minimal records the read buffer holds (default: 1024)
    pub buffer_records: usize,
    /// Name bytes budgeted per minimal record (default: 16)
    pub name_margin: usize,
    /// Name of the background thread (default: "fswatch-loop")
    pub thread_name: String,
}

impl WatcherConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create configuration from builder
    pub fn builder() -> WatcherConfigBuilder {
        WatcherConfigBuilder::default()
    }

    /// Parse configuration from TOML text
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Get the poll timeout
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    /// Capacity of the reusable read buffer in bytes
    pub fn buffer_size(&self) -> usize {
        self.buffer_records
            .saturating_mul(RECORD_HEADER_SIZE.saturating_add(self.name_margin))
    }

    /// Check that the values can drive a watch loop
    ///
    /// The read buffer must fit at least one record carrying a maximal name,
    /// otherwise the kernel rejects every read.
    pub fn validate(&self) -> Result<()> {
        if self.poll_timeout_ms == 0 {
            return Err(WatchError::InvalidConfig(
                "poll_timeout_ms must be greater than zero".to_string(),
            ));
        }

        let min_buffer = RECORD_HEADER_SIZE + MAX_NAME_LEN + 1;
        if self.buffer_size() < min_buffer {
            return Err(WatchError::InvalidConfig(format!(
                "read buffer of {} bytes is smaller than one record ({} bytes)",
                self.buffer_size(),
                min_buffer
            )));
        }

        if self.thread_name.is_empty() {
            return Err(WatchError::InvalidConfig(
                "thread_name must not be empty".to_string(),
            ));
        }

        Ok(())
    }
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            poll_timeout_ms: 3000,
            buffer_records: 1024,
            name_margin: 16,
            thread_name: "fswatch-loop".to_string(),
        }
    }
}

/// Builder for WatcherConfig
#[derive(Debug, Default)]
pub struct WatcherConfigBuilder {
    config: WatcherConfig,
}

impl WatcherConfigBuilder {
    /// Set the poll timeout in milliseconds
    pub fn poll_timeout_ms(mut self, ms: u64) -> Self {
        self.config.poll_timeout_ms = ms;
        self
    }

    /// Set the number of minimal records the buffer holds
    pub fn buffer_records(mut self, records: usize) -> Self {
        self.config.buffer_records = records;
        self
    }

    pub fn name_margin(mut self, margin: usize) -> Self {
        self.config.name_margin = margin;
        self
    }

    pub fn thread_name(mut self, name: impl Into<String>) -> Self {
        self.config.thread_name = name.into();
        self
    }

    /// Build the configuration
    pub fn build(self) -> WatcherConfig {
        self.config
    }
}
