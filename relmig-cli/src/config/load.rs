//! Bulk-load configuration with builder pattern
//!
//! Batch sizing, worker concurrency, conflict handling and retry policy,
//! with sane defaults and a few presets.

use serde::{Deserialize, Serialize};

use crate::loader::retry::RetryConfig;
use crate::target::ConflictMode;

/// Settings for streaming rows into the target
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadConfig {
    /// Rows per insert statement, further capped by the store's bind limit
    pub batch_size: usize,
    /// Concurrent batch writers per table
    pub workers: usize,
    pub conflict: ConflictMode,
    pub retry: RetryConfig,
}

impl Default for LoadConfig {
    fn default() -> Self {
        Self {
            batch_size: 500,
            workers: 4,
            conflict: ConflictMode::Abort,
            retry: RetryConfig::default(),
        }
    }
}

impl LoadConfig {
    /// Create a new builder for LoadConfig
    pub fn builder() -> LoadConfigBuilder {
        LoadConfigBuilder::new()
    }

    /// Single writer, small batches, patient retries
    pub fn conservative() -> Self {
        Self {
            batch_size: 100,
            workers: 1,
            conflict: ConflictMode::Abort,
            retry: RetryConfig::conservative(),
        }
    }

    /// Large batches, many writers, quick retries
    pub fn fast() -> Self {
        Self {
            batch_size: 2000,
            workers: 8,
            conflict: ConflictMode::Abort,
            retry: RetryConfig::fast(),
        }
    }

    /// Defaults with retries switched off (for testing)
    pub fn disabled() -> Self {
        Self {
            retry: RetryConfig::disabled(),
            ..Self::default()
        }
    }
}

/// Builder for LoadConfig
#[derive(Debug)]
pub struct LoadConfigBuilder {
    config: LoadConfig,
}

impl LoadConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: LoadConfig::default(),
        }
    }

    /// Set rows per batch
    pub fn batch_size(mut self, rows: usize) -> Self {
        self.config.batch_size = rows.max(1);
        self
    }

    /// Set concurrent batch writers
    pub fn workers(mut self, workers: usize) -> Self {
        self.config.workers = workers.max(1);
        self
    }

    /// Set conflict handling
    pub fn conflict(mut self, conflict: ConflictMode) -> Self {
        self.config.conflict = conflict;
        self
    }

    /// Configure retry behavior
    pub fn retry_config(mut self, retry: RetryConfig) -> Self {
        self.config.retry = retry;
        self
    }

    /// Set max attempts per table
    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.config.retry.max_attempts = attempts;
        self
    }

    /// Build the final configuration
    pub fn build(self) -> LoadConfig {
        self.config
    }
}

impl Default for LoadConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
