//! Tunable timing and delivery parameters shared by all components.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::{Error, Result};

/// What to do when a rule update's checksum cannot be computed at all
/// (unsupported algorithm, placeholder checksum, unserializable payload).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChecksumPolicy {
    /// Log a warning and accept the update.
    FailOpen,
    /// Reject the update as an integrity failure.
    FailClosed,
}

/// Configuration for the sync engine.
///
/// Durations are stored as integer milliseconds in config files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SyncConfig {
    /// Base URL of the cloud control plane.
    pub cloud_base_url: String,
    /// Client-side timeout for a rule long poll.
    #[serde(rename = "longPollTimeoutMs", with = "duration_ms")]
    pub long_poll_timeout: Duration,
    /// Delay between rule polls.
    #[serde(rename = "pollIntervalMs", with = "duration_ms")]
    pub poll_interval: Duration,
    /// Maximum items handed to the transport in one batch.
    pub batch_size: usize,
    /// Delay between queue drains.
    #[serde(rename = "batchFlushIntervalMs", with = "duration_ms")]
    pub batch_flush_interval: Duration,
    /// Attempts after which a failing item is dropped.
    pub max_retry_attempts: u32,
    /// Base delay for exponential backoff.
    #[serde(rename = "retryBackoffBaseMs", with = "duration_ms")]
    pub retry_backoff_base: Duration,
    /// Cap for exponential backoff.
    #[serde(rename = "retryBackoffMaxMs", with = "duration_ms")]
    pub retry_backoff_max: Duration,
    pub stale_warning_hours: u64,
    pub stale_critical_hours: u64,
    /// Delay between health probes.
    #[serde(rename = "heartbeatIntervalMs", with = "duration_ms")]
    pub heartbeat_interval: Duration,
    /// Timeout for a single health probe.
    #[serde(rename = "healthCheckTimeoutMs", with = "duration_ms")]
    pub health_check_timeout: Duration,
    /// Consecutive network failures before the link is reported offline.
    pub offline_failure_threshold: u32,
    pub checksum_policy: ChecksumPolicy,
    /// Reject rule updates that do not move the version forward.
    pub enforce_monotonic_versions: bool,
}

impl SyncConfig {
    /// Create a configuration for the given cloud with default timings.
    pub fn new(cloud_base_url: impl Into<String>) -> Self {
        Self {
            cloud_base_url: cloud_base_url.into(),
            ..Self::default()
        }
    }

    /// Load a JSON config file. Missing keys take their defaults.
    ///
    /// # Errors
    /// - File cannot be read
    /// - Content is not valid JSON
    /// - Values fail [`SyncConfig::validate`]
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content).map_err(|e| {
            Error::Config(format!("Invalid config file {}: {}", path.display(), e))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Check the configuration for values no component can work with.
    pub fn validate(&self) -> Result<()> {
        let url = url::Url::parse(&self.cloud_base_url)
            .map_err(|e| Error::Config(format!("Invalid cloud base URL: {}", e)))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(Error::Config(format!(
                "Cloud base URL must be http(s), got {}",
                url.scheme()
            )));
        }
        if self.batch_size == 0 {
            return Err(Error::Config("Batch size must be positive".to_string()));
        }
        if self.max_retry_attempts == 0 {
            return Err(Error::Config(
                "Max retry attempts must be positive".to_string(),
            ));
        }
        if self.offline_failure_threshold == 0 {
            return Err(Error::Config(
                "Offline failure threshold must be positive".to_string(),
            ));
        }
        for (name, value) in [
            ("poll interval", self.poll_interval),
            ("long poll timeout", self.long_poll_timeout),
            ("batch flush interval", self.batch_flush_interval),
            ("heartbeat interval", self.heartbeat_interval),
            ("health check timeout", self.health_check_timeout),
        ] {
            if value.is_zero() {
                return Err(Error::Config(format!("{} must be positive", name)));
            }
        }
        if self.stale_critical_hours < self.stale_warning_hours {
            return Err(Error::Config(
                "Critical staleness threshold must not be below the warning threshold"
                    .to_string(),
            ));
        }
        Ok(())
    }

    /// Join a path onto the cloud base URL.
    pub fn endpoint(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.cloud_base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    /// Set the long-poll timeout.
    pub fn with_long_poll_timeout(mut self, timeout: Duration) -> Self {
        self.long_poll_timeout = timeout;
        self
    }

    /// Set the rule poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set the batch size.
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    /// Set the queue drain interval.
    pub fn with_batch_flush_interval(mut self, interval: Duration) -> Self {
        self.batch_flush_interval = interval;
        self
    }

    /// Set the retry cap.
    pub fn with_max_retry_attempts(mut self, attempts: u32) -> Self {
        self.max_retry_attempts = attempts;
        self
    }

    /// Set the backoff base delay.
    pub fn with_retry_backoff_base(mut self, base: Duration) -> Self {
        self.retry_backoff_base = base;
        self
    }

    /// Set the staleness thresholds, in hours.
    pub fn with_staleness_hours(mut self, warning: u64, critical: u64) -> Self {
        self.stale_warning_hours = warning;
        self.stale_critical_hours = critical;
        self
    }

    /// Set the health probe interval.
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Set the health probe timeout.
    pub fn with_health_check_timeout(mut self, timeout: Duration) -> Self {
        self.health_check_timeout = timeout;
        self
    }

    /// Set the checksum policy.
    pub fn with_checksum_policy(mut self, policy: ChecksumPolicy) -> Self {
        self.checksum_policy = policy;
        self
    }

    /// Enable or disable the version monotonicity check.
    pub fn with_monotonic_versions(mut self, enforce: bool) -> Self {
        self.enforce_monotonic_versions = enforce;
        self
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            cloud_base_url: "https://localhost".to_string(),
            long_poll_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_secs(60),
            batch_size: 100,
            batch_flush_interval: Duration::from_secs(5),
            max_retry_attempts: 5,
            retry_backoff_base: Duration::from_secs(1),
            retry_backoff_max: Duration::from_secs(300),
            stale_warning_hours: 48,
            stale_critical_hours: 168,
            heartbeat_interval: Duration::from_secs(300),
            health_check_timeout: Duration::from_secs(10),
            offline_failure_threshold: 3,
            checksum_policy: ChecksumPolicy::FailOpen,
            enforce_monotonic_versions: true,
        }
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
