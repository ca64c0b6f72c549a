use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::descriptor::Platform;
use crate::error::{PullError, Result};

/// Pull configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PullOptions {
    /// Unpack layers into snapshots after the content is fetched
    pub unpack: bool,

    /// Maximum number of blob fetches in flight during one dispatch
    pub max_concurrent_fetches: usize,

    /// Retry policy for transient fetch/store failures
    pub retry: RetryPolicy,

    /// Platform used to pick a manifest out of an index (host linux if unset)
    pub platform: Option<Platform>,
}

impl Default for PullOptions {
    fn default() -> Self {
        Self {
            unpack: false,
            max_concurrent_fetches: 3,
            retry: RetryPolicy::default(),
            platform: None,
        }
    }
}

impl PullOptions {
    /// Default options with unpacking enabled.
    pub fn with_unpack() -> Self {
        Self {
            unpack: true,
            ..Self::default()
        }
    }

    /// Parse options from YAML (JSON is accepted too).
    pub fn from_yaml(s: &str) -> Result<Self> {
        let options: Self = serde_yaml::from_str(s)?;
        options.validate()?;
        Ok(options)
    }

    /// Validate every field independently.
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_fetches == 0 {
            return Err(PullError::Config(
                "max_concurrent_fetches must be at least 1".to_string(),
            ));
        }
        self.retry.validate()?;
        if let Some(platform) = &self.platform {
            if platform.os.is_empty() || platform.architecture.is_empty() {
                return Err(PullError::Config(format!(
                    "platform '{}' must name both os and architecture",
                    platform
                )));
            }
        }
        Ok(())
    }

    /// The platform to select from indexes.
    pub fn platform(&self) -> Platform {
        self.platform.clone().unwrap_or_else(Platform::host)
    }
}

/// Bounded exponential-backoff retry for transient failures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,

    /// Delay before the second attempt, in milliseconds
    pub initial_backoff_ms: u64,

    /// Upper bound for any single delay, in milliseconds
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 100,
            max_backoff_ms: 5_000,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(PullError::Config(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.max_backoff_ms < self.initial_backoff_ms {
            return Err(PullError::Config(format!(
                "retry.max_backoff_ms ({}) must not be below retry.initial_backoff_ms ({})",
                self.max_backoff_ms, self.initial_backoff_ms
            )));
        }
        Ok(())
    }

    /// Delay after failed attempt number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(20);
        let ms = self
            .initial_backoff_ms
            .saturating_mul(factor)
            .min(self.max_backoff_ms);
        Duration::from_millis(ms)
    }
}
