//! Shared model types used throughout EdgeSync.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Checksum value marking the placeholder version seeded at first boot.
pub const DEFAULT_CHECKSUM: &str = "default";

/// Tri-state health of the link to the cloud.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    /// Health probe answered 2xx.
    Online,
    /// Server reachable but erroring, or a probe failed recently.
    Degraded,
    /// Repeated network-level failures.
    Offline,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionStatus::Online => "online",
            ConnectionStatus::Degraded => "degraded",
            ConnectionStatus::Offline => "offline",
        };
        f.write_str(s)
    }
}

/// Connection state tracked by the connectivity monitor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionState {
    /// Current status.
    pub status: ConnectionStatus,
    /// Last probe that answered 2xx.
    pub last_successful_sync: Option<DateTime<Utc>>,
    /// Last probe of any outcome.
    pub last_check: Option<DateTime<Utc>>,
    /// Round trip of the last probe that got a response.
    pub latency_ms: Option<u64>,
    /// Network-level failures since the last response.
    pub consecutive_failures: u32,
}

impl ConnectionState {
    /// Nothing is known before the first probe, so start offline.
    pub fn new() -> Self {
        Self {
            status: ConnectionStatus::Offline,
            last_successful_sync: None,
            last_check: None,
            latency_ms: None,
            consecutive_failures: 0,
        }
    }

    /// Check if the cloud is currently reachable and healthy.
    pub fn is_online(&self) -> bool {
        self.status == ConnectionStatus::Online
    }
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self::new()
    }
}

/// Identifies an immutable rule-set snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleVersion {
    /// Opaque version string assigned by the cloud.
    pub version: String,
    /// When the cloud produced this snapshot.
    pub timestamp: DateTime<Utc>,
    /// Content hash over the canonical rule payload.
    pub checksum: String,
}

impl RuleVersion {
    /// Create a new rule version.
    pub fn new(
        version: impl Into<String>,
        timestamp: DateTime<Utc>,
        checksum: impl Into<String>,
    ) -> Self {
        Self {
            version: version.into(),
            timestamp,
            checksum: checksum.into(),
        }
    }

    /// Placeholder version used when there is neither a cache nor connectivity.
    pub fn placeholder(version: impl Into<String>) -> Self {
        Self::new(version, Utc::now(), DEFAULT_CHECKSUM)
    }

    /// True for the placeholder seeded at first boot; its content was never verified.
    pub fn is_unverified(&self) -> bool {
        self.checksum == DEFAULT_CHECKSUM
    }
}

impl fmt::Display for RuleVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.version, self.timestamp.to_rfc3339())
    }
}

/// The three rule categories governed by a rule update.
///
/// Rule documents are opaque to this engine; evaluation lives elsewhere.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleSet {
    #[serde(default)]
    pub clinical: Vec<serde_json::Value>,
    #[serde(default)]
    pub administrative: Vec<serde_json::Value>,
    #[serde(default)]
    pub billing: Vec<serde_json::Value>,
}

impl RuleSet {
    /// Total number of rules across categories.
    pub fn len(&self) -> usize {
        self.clinical.len() + self.administrative.len() + self.billing.len()
    }

    /// Check if no rules are present.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A rule version together with the rules it governs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleUpdate {
    pub version: RuleVersion,
    pub rules: RuleSet,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub changelog: Option<String>,
}

/// Persisted form of the last applied rule update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedRules {
    pub update: RuleUpdate,
    /// When the update became current on this agent.
    pub applied_at: DateTime<Utc>,
}

/// Severity of rule staleness, ordered from fresh to critical.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StalenessSeverity {
    None,
    Warning,
    Critical,
}

/// Projection of rule freshness against the configured thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StalenessWarning {
    /// Whether a banner should be shown.
    pub show: bool,
    pub severity: StalenessSeverity,
    /// Hours since the last rule sync; infinite when never synced.
    pub hours_since_sync: f64,
    /// Operator-facing copy for the banner.
    pub message: String,
    /// The current version is the unverified placeholder.
    pub unverified: bool,
}

impl StalenessWarning {
    /// Compute the warning for a rule sync time observed at `now`.
    ///
    /// A missing sync time is infinitely stale.
    pub fn compute(
        last_sync: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
        warning_hours: u64,
        critical_hours: u64,
        unverified: bool,
    ) -> Self {
        let hours_since_sync = match last_sync {
            Some(at) => (now - at).num_milliseconds().max(0) as f64 / 3_600_000.0,
            None => f64::INFINITY,
        };

        let severity = if hours_since_sync >= critical_hours as f64 {
            StalenessSeverity::Critical
        } else if hours_since_sync >= warning_hours as f64 {
            StalenessSeverity::Warning
        } else {
            StalenessSeverity::None
        };

        let message = match (severity, last_sync) {
            (_, None) => "Clinical rules have never been synced with the cloud.".to_string(),
            (StalenessSeverity::Critical, Some(_)) => format!(
                "Clinical rules are critically out of date: last synced {:.0} hours ago. \
                 Decisions may be based on outdated policy.",
                hours_since_sync
            ),
            (StalenessSeverity::Warning, Some(_)) => format!(
                "Clinical rules were last synced {:.0} hours ago.",
                hours_since_sync
            ),
            (StalenessSeverity::None, Some(_)) => String::new(),
        };

        Self {
            show: severity != StalenessSeverity::None,
            severity,
            hours_since_sync,
            message,
            unverified,
        }
    }
}

/// Kind of outbound event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueItemType {
    /// Output of a clinical decision check.
    AssuranceEvent,
    /// A clinician's override or disagreement.
    HumanFeedback,
    /// A downstream result.
    Outcome,
}

impl QueueItemType {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueItemType::AssuranceEvent => "assurance_event",
            QueueItemType::HumanFeedback => "human_feedback",
            QueueItemType::Outcome => "outcome",
        }
    }
}

impl fmt::Display for QueueItemType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueueItemType {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s {
            "assurance_event" => Ok(QueueItemType::AssuranceEvent),
            "human_feedback" => Ok(QueueItemType::HumanFeedback),
            "outcome" => Ok(QueueItemType::Outcome),
            other => Err(crate::Error::InvalidInput(format!(
                "Unknown queue item type: {}",
                other
            ))),
        }
    }
}

/// Delivery status of a queue item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueItemStatus {
    Pending,
    InFlight,
    Failed,
    Synced,
}

/// An outbound unit of work awaiting delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueItem {
    pub id: String,
    #[serde(rename = "type")]
    pub item_type: QueueItemType,
    pub payload: serde_json::Value,
    pub status: QueueItemStatus,
    pub created_at: DateTime<Utc>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub attempt_count: u32,
    pub last_error: Option<String>,
    pub priority: u32,
    /// Enqueue order within the owning queue.
    #[serde(default)]
    pub sequence: u64,
}

impl QueueItem {
    /// Create a new pending item.
    pub fn new(
        id: impl Into<String>,
        item_type: QueueItemType,
        payload: serde_json::Value,
        priority: u32,
        sequence: u64,
    ) -> Self {
        Self {
            id: id.into(),
            item_type,
            payload,
            status: QueueItemStatus::Pending,
            created_at: Utc::now(),
            last_attempt_at: None,
            attempt_count: 0,
            last_error: None,
            priority,
            sequence,
        }
    }

    /// Mark as selected into a batch.
    pub fn mark_in_flight(&mut self, now: DateTime<Utc>) {
        self.status = QueueItemStatus::InFlight;
        self.attempt_count += 1;
        self.last_attempt_at = Some(now);
    }

    /// Mark as failed, keeping it for retry.
    pub fn mark_failed(&mut self, error: impl Into<String>) {
        self.status = QueueItemStatus::Failed;
        self.last_error = Some(error.into());
    }

    /// Check if the item is eligible for the next batch.
    pub fn is_deliverable(&self) -> bool {
        matches!(self.status, QueueItemStatus::Pending | QueueItemStatus::Failed)
    }

    /// Check if another attempt is allowed under the cap.
    pub fn should_retry(&self, max_attempts: u32) -> bool {
        self.attempt_count < max_attempts
    }
}

/// How a conflict between local and remote versions was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStrategy {
    LocalWins,
    RemoteWins,
    /// An externally computed merged value was chosen.
    Merge,
    Skip,
}

/// Local and remote versions of the same logical item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncConflict {
    pub item_id: String,
    pub local_value: serde_json::Value,
    pub remote_value: serde_json::Value,
    pub local_timestamp: DateTime<Utc>,
    pub remote_timestamp: DateTime<Utc>,
    pub detected_at: DateTime<Utc>,
}

impl SyncConflict {
    pub fn new(
        item_id: impl Into<String>,
        local_value: serde_json::Value,
        local_timestamp: DateTime<Utc>,
        remote_value: serde_json::Value,
        remote_timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            item_id: item_id.into(),
            local_value,
            remote_value,
            local_timestamp,
            remote_timestamp,
            detected_at: Utc::now(),
        }
    }
}

/// Record of which side won a conflict.
///
/// This engine only carries the record; the policy deciding it lives outside.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictResolution {
    pub item_id: String,
    pub strategy: ConflictStrategy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merged_value: Option<serde_json::Value>,
    pub resolved_at: DateTime<Utc>,
}

impl ConflictResolution {
    /// Resolve by picking a side (or skipping).
    ///
    /// # Errors
    /// - `Merge` must go through [`ConflictResolution::merged`]
    pub fn new(conflict: &SyncConflict, strategy: ConflictStrategy) -> crate::Result<Self> {
        if strategy == ConflictStrategy::Merge {
            return Err(crate::Error::InvalidInput(
                "Merge resolution requires a merged value".to_string(),
            ));
        }
        Ok(Self {
            item_id: conflict.item_id.clone(),
            strategy,
            merged_value: None,
            resolved_at: Utc::now(),
        })
    }

    /// Resolve with an externally computed merged value.
    pub fn merged(conflict: &SyncConflict, merged_value: serde_json::Value) -> Self {
        Self {
            item_id: conflict.item_id.clone(),
            strategy: ConflictStrategy::Merge,
            merged_value: Some(merged_value),
            resolved_at: Utc::now(),
        }
    }

    /// The value this resolution selects, or `None` when skipped.
    pub fn resolved_value<'a>(&'a self, conflict: &'a SyncConflict) -> Option<&'a serde_json::Value> {
        match self.strategy {
            ConflictStrategy::LocalWins => Some(&conflict.local_value),
            ConflictStrategy::RemoteWins => Some(&conflict.remote_value),
            ConflictStrategy::Merge => self.merged_value.as_ref(),
            ConflictStrategy::Skip => None,
        }
    }
}
