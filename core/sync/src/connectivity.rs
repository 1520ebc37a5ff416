//! Connectivity monitor: periodic health probes and rule staleness tracking.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use edgesync_common::{
    ConnectionState, ConnectionStatus, EventBus, RuleVersion, StalenessSeverity,
    StalenessWarning, Subscription, SyncConfig, SyncEvent, SyncEventKind,
};

use crate::client::{CloudClient, ProbeOutcome};
use crate::rules::RuleVersionObserver;
use crate::task::{PeriodicTask, TaskSlot};

/// Rule version as last published by the updater.
#[derive(Debug, Default)]
struct RuleTracking {
    version: Option<RuleVersion>,
    synced_at: Option<DateTime<Utc>>,
    /// Highest severity already announced for this version.
    notified: Option<StalenessSeverity>,
}

/// Tracks the health of the cloud link and the freshness of the rules.
pub struct ConnectivityMonitor {
    config: Arc<SyncConfig>,
    client: Arc<dyn CloudClient>,
    events: EventBus,
    state: RwLock<ConnectionState>,
    rules: RwLock<RuleTracking>,
    task: TaskSlot,
}

impl ConnectivityMonitor {
    /// Create a monitor. Probing starts with [`ConnectivityMonitor::start`].
    pub fn new(config: Arc<SyncConfig>, client: Arc<dyn CloudClient>, events: EventBus) -> Self {
        Self {
            config,
            client,
            events,
            state: RwLock::new(ConnectionState::new()),
            rules: RwLock::new(RuleTracking::default()),
            task: TaskSlot::new(),
        }
    }

    /// Probe now and then every heartbeat interval.
    pub fn start(self: &Arc<Self>) {
        let monitor = Arc::downgrade(self);
        let period = self.config.heartbeat_interval;
        let started = self.task.start_with(|| {
            PeriodicTask::spawn("connectivity probe", period, move || {
                let monitor = monitor.clone();
                async move {
                    if let Some(monitor) = monitor.upgrade() {
                        monitor.check_connectivity().await;
                    }
                }
            })
        });
        if started {
            info!("Connectivity monitor started");
        }
    }

    /// Stop probing. Safe to call repeatedly or before `start`.
    pub async fn stop(&self) {
        self.task.stop().await;
    }

    /// Check if the probe loop is running.
    pub fn is_running(&self) -> bool {
        self.task.is_running()
    }

    /// Perform one probe and fold the outcome into the connection state.
    ///
    /// Failures are absorbed into the returned state; this never errors.
    pub async fn check_connectivity(&self) -> ConnectionState {
        let outcome = self
            .client
            .check_health(self.config.health_check_timeout)
            .await;
        let now = Utc::now();

        let (previous, current) = {
            let mut state = self.state.write().await;
            let previous = state.status;
            state.last_check = Some(now);

            match outcome {
                ProbeOutcome::Healthy { latency } => {
                    state.latency_ms = Some(latency.as_millis() as u64);
                    state.consecutive_failures = 0;
                    state.last_successful_sync = Some(now);
                    state.status = ConnectionStatus::Online;
                    debug!("Health probe ok in {:?}", latency);
                }
                ProbeOutcome::ServerError { status, latency } => {
                    state.latency_ms = Some(latency.as_millis() as u64);
                    state.status = ConnectionStatus::Degraded;
                    warn!("Health probe answered HTTP {}", status);
                }
                ProbeOutcome::Unreachable { reason } => {
                    state.consecutive_failures += 1;
                    state.status =
                        if state.consecutive_failures >= self.config.offline_failure_threshold {
                            ConnectionStatus::Offline
                        } else {
                            ConnectionStatus::Degraded
                        };
                    warn!(
                        "Health probe failed ({} consecutive): {}",
                        state.consecutive_failures, reason
                    );
                }
            }

            (previous, state.clone())
        };

        if current.status != previous {
            info!("Connection status changed: {} -> {}", previous, current.status);
            self.events.emit(SyncEventKind::ConnectionChanged {
                previous,
                current: current.status,
                state: current.clone(),
            });
        }

        current
    }

    /// Snapshot of the connection state.
    pub async fn get_state(&self) -> ConnectionState {
        self.state.read().await.clone()
    }

    /// Current connection status.
    pub async fn status(&self) -> ConnectionStatus {
        self.state.read().await.status
    }

    /// Record the currently applied rule version, synced now.
    pub async fn set_rule_version(&self, version: RuleVersion) {
        self.set_rule_version_at(version, Utc::now()).await;
    }

    /// Record the currently applied rule version with the time it was synced.
    pub async fn set_rule_version_at(&self, version: RuleVersion, synced_at: DateTime<Utc>) {
        let mut rules = self.rules.write().await;
        debug!("Rule version set to {}", version);
        rules.version = Some(version);
        rules.synced_at = Some(synced_at);
        rules.notified = None;
    }

    /// The rule version last published by the updater.
    pub async fn get_rule_version(&self) -> Option<RuleVersion> {
        self.rules.read().await.version.clone()
    }

    /// True when no version was ever set or the warning threshold has passed.
    pub async fn is_rules_stale(&self) -> bool {
        let rules = self.rules.read().await;
        match rules.synced_at {
            None => true,
            Some(at) => {
                let hours = (Utc::now() - at).num_milliseconds() as f64 / 3_600_000.0;
                hours >= self.config.stale_warning_hours as f64
            }
        }
    }

    /// Staleness projection for now.
    ///
    /// Emits `rules_stale` the first time a severity level is reached for the
    /// current version (warning, then again on escalation to critical).
    pub async fn get_staleness_warning(&self) -> StalenessWarning {
        let (warning, newly_crossed) = {
            let mut rules = self.rules.write().await;
            let unverified = rules
                .version
                .as_ref()
                .map(RuleVersion::is_unverified)
                .unwrap_or(false);
            let warning = StalenessWarning::compute(
                rules.synced_at,
                Utc::now(),
                self.config.stale_warning_hours,
                self.config.stale_critical_hours,
                unverified,
            );

            let already = rules.notified.unwrap_or(StalenessSeverity::None);
            let newly_crossed = warning.severity > already;
            if newly_crossed {
                rules.notified = Some(warning.severity);
            }
            (warning, newly_crossed)
        };

        if newly_crossed {
            warn!(
                "Rules are stale ({:?}): {:.1} hours since last sync",
                warning.severity, warning.hours_since_sync
            );
            self.events.emit(SyncEventKind::RulesStale {
                warning: warning.clone(),
            });
        }

        warning
    }

    /// Register a listener on this monitor's event bus.
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&SyncEvent) + Send + Sync + 'static,
    {
        self.events.subscribe(listener)
    }
}

#[async_trait]
impl RuleVersionObserver for ConnectivityMonitor {
    async fn rule_version_changed(&self, version: RuleVersion, synced_at: DateTime<Utc>) {
        self.set_rule_version_at(version, synced_at).await;
    }
}
