//! Retry policy for whole-table load attempts

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::MigrationError;

/// Retry configuration with exponential backoff
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts including the first; 1 disables retries
    pub max_attempts: u32,
    #[serde(rename = "base_delay_ms", with = "millis")]
    pub base_delay: Duration,
    #[serde(rename = "max_delay_ms", with = "millis")]
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    /// Randomise each delay between half and the full computed value
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Fewer attempts, longer waits
    pub fn conservative() -> Self {
        Self {
            max_attempts: 2,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }

    /// More attempts, short waits
    pub fn fast() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(1),
            backoff_multiplier: 1.5,
            jitter: true,
        }
    }

    /// Single attempt, no waiting
    pub fn disabled() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::from_millis(0),
            max_delay: Duration::from_millis(0),
            backoff_multiplier: 1.0,
            jitter: false,
        }
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

/// Decides whether and when a failed table load is re-attempted
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn max_attempts(&self) -> u32 {
        self.config.max_attempts.max(1)
    }

    /// Delay before attempt `attempt + 1`, where `attempt` is 1-based
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let base = self.config.base_delay.as_millis() as f64
            * self.config.backoff_multiplier.max(1.0).powi(exponent);
        let capped = base.min(self.config.max_delay.as_millis() as f64);

        let millis = if self.config.jitter && capped > 0.0 {
            rand::rng().random_range(capped / 2.0..=capped)
        } else {
            capped
        };

        Duration::from_millis(millis.max(0.0).round() as u64)
    }

    /// Whether a failure after `attempt` attempts should be retried.
    ///
    /// Cancellation and gate failures are never retried.
    pub fn should_retry(&self, attempt: u32, error: &anyhow::Error) -> bool {
        if attempt >= self.max_attempts() {
            return false;
        }
        !matches!(
            MigrationError::find(error),
            Some(MigrationError::Cancelled) | Some(MigrationError::IntegrityGate(_))
        )
    }
}
