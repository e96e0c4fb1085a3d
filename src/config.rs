//! Processor configuration
//!
//! [`ProcessorConfig`] carries everything the runtime needs that is not a
//! collaborator: identity (consumer group, instance id), lease timing,
//! batching and polling knobs, fetch retry policy, and the shutdown grace
//! period. All fields have sensible defaults; `with_*` builders cover the
//! common overrides.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

use crate::error::{CapstanError, Result};

/// Default maximum number of events per delivered batch
pub const DEFAULT_MAX_BATCH_SIZE: usize = 100;

/// Default partition lease duration in milliseconds
pub const DEFAULT_LEASE_DURATION_MS: u64 = 30_000;

/// Default interval between lease refresh cycles in milliseconds
pub const DEFAULT_LEASE_REFRESH_MS: u64 = 10_000;

/// Default time a fetch waits for events before returning an empty batch,
/// in milliseconds
pub const DEFAULT_FETCH_IDLE_TIMEOUT_MS: u64 = 5_000;

/// Default time `stop()` waits for in-flight batches before abandoning
/// them, in milliseconds
pub const DEFAULT_SHUTDOWN_GRACE_MS: u64 = 10_000;

/// Where a pump starts reading when the store has no checkpoint for its
/// partition. A stored checkpoint always wins over this setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StartPosition {
    /// Resume from the stored checkpoint, falling back to the oldest
    /// available event when there is none.
    #[default]
    FromCheckpoint,
    /// Start at the oldest available event.
    Earliest,
    /// Start at the tail of the partition, ignoring older events.
    Latest,
}

/// Retry policy for transient fetch failures.
///
/// Delays grow exponentially from `initial_delay` by `multiplier` per
/// attempt, capped at `max_delay`. When `max_attempts` consecutive fetches
/// have failed the pump gives up and closes with a fault.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Consecutive failures tolerated before the pump faults
    pub max_attempts: u32,
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Upper bound on any single delay
    pub max_delay: Duration,
    /// Exponential growth factor applied per attempt
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            max_attempts: 5,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Delay to wait after the given zero-based failed attempt.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let millis = self.initial_delay.as_millis() as f64 * self.multiplier.powi(attempt as i32);
        let capped = (millis as u64).min(self.max_delay.as_millis() as u64);
        Duration::from_millis(capped)
    }
}

/// Configuration for an [`EventProcessor`](crate::processor::EventProcessor).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessorConfig {
    /// Consumer group this processor reads on behalf of. Checkpoints are
    /// scoped per group, so two groups process the stream independently.
    pub consumer_group: String,
    /// Unique identity of this processor instance in ownership records.
    /// Generated when not set explicitly.
    pub instance_id: String,
    /// Most events a single delivered batch may carry
    pub max_batch_size: usize,
    /// How long a claimed lease lasts without renewal
    pub lease_duration: Duration,
    /// How often the coordinator renews leases and rebalances
    pub lease_refresh_interval: Duration,
    /// How long a fetch waits for events before returning an empty batch
    pub fetch_idle_timeout: Duration,
    /// Where pumps start when no checkpoint exists
    pub start_position: StartPosition,
    /// Retry policy for transient fetch failures
    pub fetch_retry: RetryConfig,
    /// How long `stop()` waits for in-flight batches before abandoning them
    pub shutdown_grace: Duration,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        ProcessorConfig {
            consumer_group: "default".to_string(),
            instance_id: format!("capstan-{}", Uuid::new_v4()),
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            lease_duration: Duration::from_millis(DEFAULT_LEASE_DURATION_MS),
            lease_refresh_interval: Duration::from_millis(DEFAULT_LEASE_REFRESH_MS),
            fetch_idle_timeout: Duration::from_millis(DEFAULT_FETCH_IDLE_TIMEOUT_MS),
            start_position: StartPosition::default(),
            fetch_retry: RetryConfig::default(),
            shutdown_grace: Duration::from_millis(DEFAULT_SHUTDOWN_GRACE_MS),
        }
    }
}

impl ProcessorConfig {
    /// Create a configuration for the given consumer group with defaults
    /// for everything else and a generated instance id.
    pub fn new(consumer_group: impl Into<String>) -> Self {
        ProcessorConfig {
            consumer_group: consumer_group.into(),
            ..Default::default()
        }
    }

    /// Set the instance id used in ownership records.
    pub fn with_instance_id(mut self, instance_id: impl Into<String>) -> Self {
        self.instance_id = instance_id.into();
        self
    }

    /// Set the maximum batch size.
    pub fn with_max_batch_size(mut self, max_batch_size: usize) -> Self {
        self.max_batch_size = max_batch_size;
        self
    }

    /// Set the lease duration.
    pub fn with_lease_duration(mut self, lease_duration: Duration) -> Self {
        self.lease_duration = lease_duration;
        self
    }

    /// Set the lease refresh interval.
    pub fn with_lease_refresh_interval(mut self, interval: Duration) -> Self {
        self.lease_refresh_interval = interval;
        self
    }

    /// Set the fetch idle timeout.
    pub fn with_fetch_idle_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_idle_timeout = timeout;
        self
    }

    /// Set the start position used when no checkpoint exists.
    pub fn with_start_position(mut self, start_position: StartPosition) -> Self {
        self.start_position = start_position;
        self
    }

    /// Set the fetch retry policy.
    pub fn with_fetch_retry(mut self, fetch_retry: RetryConfig) -> Self {
        self.fetch_retry = fetch_retry;
        self
    }

    /// Set the shutdown grace period.
    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    /// Check the configuration for values the runtime cannot work with.
    ///
    /// # Errors
    ///
    /// Returns [`CapstanError::Config`] describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        if self.consumer_group.is_empty() {
            return Err(CapstanError::config("consumer_group must not be empty"));
        }
        if self.instance_id.is_empty() {
            return Err(CapstanError::config("instance_id must not be empty"));
        }
        if self.max_batch_size == 0 {
            return Err(CapstanError::config("max_batch_size must be at least 1"));
        }
        if self.lease_duration.is_zero() {
            return Err(CapstanError::config("lease_duration must be non-zero"));
        }
        if self.lease_refresh_interval >= self.lease_duration {
            return Err(CapstanError::config(
                "lease_refresh_interval must be shorter than lease_duration",
            ));
        }
        if self.fetch_retry.max_attempts == 0 {
            return Err(CapstanError::config(
                "fetch_retry.max_attempts must be at least 1",
            ));
        }
        if self.fetch_retry.multiplier < 1.0 {
            return Err(CapstanError::config(
                "fetch_retry.multiplier must be at least 1.0",
            ));
        }
        Ok(())
    }
}
