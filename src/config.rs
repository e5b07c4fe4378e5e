//! Sync configuration.

use crate::error::{Result, SyncError};
use crate::types::AuthorId;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Bounded exponential backoff.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Attempts before giving up (including the first one).
    pub max_attempts: u32,

    /// Delay after the first failure; doubled on each further failure.
    #[serde(with = "millis")]
    pub base_delay: Duration,

    /// Upper bound for a single delay.
    #[serde(with = "millis")]
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Delay to wait after `failures` consecutive failures (1-based).
    pub fn backoff(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }

    /// Whether another attempt is allowed after `failures` failures.
    pub fn allows_retry(&self, failures: u32) -> bool {
        failures < self.max_attempts
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(8),
        }
    }
}

/// Configuration for a [`FeedSession`](crate::FeedSession).
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// The signed-in user; own comments and reactions are matched against it.
    pub viewer_id: AuthorId,

    /// Posts per page.
    /// Default: 20
    pub page_size: usize,

    /// How long a mutation may wait for confirmation before it is reverted.
    /// Default: 10s
    #[serde(with = "millis")]
    pub mutation_timeout: Duration,

    /// Entries kept at the top of the feed on refresh-from-top.
    /// Default: 20
    pub retained_window: usize,

    /// Recently seen comment/reaction ids remembered for dedup.
    /// Default: 4096
    pub child_dedup_capacity: usize,

    /// Buffered events per change feed before the transport drops the consumer,
    /// as used by `LocalTransport::from_config`.
    /// Default: 1000
    pub channel_buffer: usize,

    /// Retry policy for opening change feeds.
    pub subscribe_retry: RetryPolicy,

    /// Retry policy for transport failures on mutation submission.
    pub submit_retry: RetryPolicy,

    /// Retry policy for page fetches.
    pub fetch_retry: RetryPolicy,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            viewer_id: AuthorId::new("anonymous"),
            page_size: 20,
            mutation_timeout: Duration::from_secs(10),
            retained_window: 20,
            child_dedup_capacity: 4096,
            channel_buffer: 1000,
            subscribe_retry: RetryPolicy::default(),
            submit_retry: RetryPolicy {
                max_attempts: 3,
                ..RetryPolicy::default()
            },
            fetch_retry: RetryPolicy {
                max_attempts: 3,
                base_delay: Duration::ZERO,
                max_delay: Duration::ZERO,
            },
        }
    }
}

impl SyncConfig {
    /// Config for a given viewer with default settings.
    pub fn for_viewer(viewer_id: impl Into<String>) -> Self {
        Self {
            viewer_id: AuthorId::new(viewer_id),
            ..Default::default()
        }
    }

    /// Parse a JSON config; missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: SyncConfig = serde_json::from_str(json)
            .map_err(|e| SyncError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the components cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.page_size == 0 {
            return Err(SyncError::Config("page_size must be positive".into()));
        }
        if self.channel_buffer == 0 {
            return Err(SyncError::Config("channel_buffer must be positive".into()));
        }
        if self.mutation_timeout.is_zero() {
            return Err(SyncError::Config("mutation_timeout must be positive".into()));
        }
        for (name, policy) in [
            ("subscribe_retry", &self.subscribe_retry),
            ("submit_retry", &self.submit_retry),
            ("fetch_retry", &self.fetch_retry),
        ] {
            if policy.max_attempts == 0 {
                return Err(SyncError::Config(format!(
                    "{}.max_attempts must be positive",
                    name
                )));
            }
        }
        Ok(())
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}
