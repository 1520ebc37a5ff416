//! Rule updater: long-polls the cloud for rule-set updates and applies them
//! atomically after integrity checks.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use edgesync_common::{
    CachedRules, ChecksumPolicy, Error, EventBus, Result, RuleSet, RuleUpdate, RuleVersion,
    Subscription, SyncConfig, SyncEvent, SyncEventKind,
};

use crate::checksum::{self, ChecksumCheck};
use crate::client::{CloudClient, PollResponse};
use crate::store::RuleCache;
use crate::task::{PeriodicTask, TaskSlot};

/// Receives the rule version each time a new one becomes current.
#[async_trait]
pub trait RuleVersionObserver: Send + Sync {
    async fn rule_version_changed(&self, version: RuleVersion, synced_at: DateTime<Utc>);
}

/// Result of one poll cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    /// A verified update was applied.
    Updated(RuleVersion),
    /// The cloud has nothing newer.
    NoChange,
    /// The update failed integrity checks and was discarded.
    Rejected(String),
    /// Transport, server or persistence failure; retried next cycle.
    Failed(String),
}

type InFlightPoll = Shared<BoxFuture<'static, PollOutcome>>;

#[derive(Debug, Default)]
struct RulesState {
    /// The current version; may be the placeholder, which has no cache.
    version: Option<RuleVersion>,
    cached: Option<CachedRules>,
}

/// Fetches, verifies and applies rule updates.
pub struct RuleUpdater {
    config: Arc<SyncConfig>,
    client: Arc<dyn CloudClient>,
    cache: Arc<dyn RuleCache>,
    events: EventBus,
    observers: parking_lot::RwLock<Vec<Arc<dyn RuleVersionObserver>>>,
    state: RwLock<RulesState>,
    in_flight: Mutex<Option<InFlightPoll>>,
    task: TaskSlot,
}

impl RuleUpdater {
    /// Create an updater. Polling starts with [`RuleUpdater::start`].
    pub fn new(
        config: Arc<SyncConfig>,
        client: Arc<dyn CloudClient>,
        cache: Arc<dyn RuleCache>,
        events: EventBus,
    ) -> Self {
        Self {
            config,
            client,
            cache,
            events,
            observers: parking_lot::RwLock::new(Vec::new()),
            state: RwLock::new(RulesState::default()),
            in_flight: Mutex::new(None),
            task: TaskSlot::new(),
        }
    }

    /// Notify `observer` whenever the current version changes.
    pub fn add_observer(&self, observer: Arc<dyn RuleVersionObserver>) {
        self.observers.write().push(observer);
    }

    /// Poll now and then every poll interval.
    pub fn start(self: &Arc<Self>) {
        let updater = Arc::downgrade(self);
        let period = self.config.poll_interval;
        let started = self.task.start_with(|| {
            PeriodicTask::spawn("rule poll", period, move || {
                let updater = updater.clone();
                async move {
                    if let Some(updater) = updater.upgrade() {
                        updater.poll_for_updates().await;
                    }
                }
            })
        });
        if started {
            info!("Rule updater started");
        }
    }

    /// Stop polling. An in-flight poll completes first.
    pub async fn stop(&self) {
        self.task.stop().await;
    }

    /// Check if the poll loop is running.
    pub fn is_running(&self) -> bool {
        self.task.is_running()
    }

    /// Run one poll cycle, joining the in-flight one if a poll is already running.
    pub async fn poll_for_updates(self: &Arc<Self>) -> PollOutcome {
        let poll = {
            let mut in_flight = self.in_flight.lock();
            match in_flight.as_ref() {
                Some(poll) => {
                    debug!("Joining in-flight rule poll");
                    poll.clone()
                }
                None => {
                    let updater = Arc::clone(self);
                    let poll = async move {
                        let outcome = updater.poll_once().await;
                        *updater.in_flight.lock() = None;
                        outcome
                    }
                    .boxed()
                    .shared();
                    *in_flight = Some(poll.clone());
                    poll
                }
            }
        };
        poll.await
    }

    /// Poll immediately, outside the regular cadence.
    pub async fn force_update(self: &Arc<Self>) -> PollOutcome {
        info!("Forced rule update requested");
        self.poll_for_updates().await
    }

    async fn poll_once(&self) -> PollOutcome {
        let current = self.current_version().await;
        // The placeholder was never delivered by the cloud, so ask for everything.
        let known = current
            .as_ref()
            .filter(|v| !v.is_unverified())
            .map(|v| v.version.clone());

        let response = self
            .client
            .poll_rules(known.as_deref(), self.config.long_poll_timeout)
            .await;

        match response {
            Ok(PollResponse::NoChange) => {
                debug!("No rule changes");
                PollOutcome::NoChange
            }
            Ok(PollResponse::Update(update)) => {
                if current.as_ref() == Some(&update.version) {
                    debug!("Cloud returned the current rule version");
                    return PollOutcome::NoChange;
                }
                match self.apply_update(update).await {
                    Ok(version) => PollOutcome::Updated(version),
                    Err(Error::Integrity(reason)) => {
                        error!("Rejected rule update: {}", reason);
                        PollOutcome::Rejected(reason)
                    }
                    Err(e) => {
                        error!("Failed to apply rule update: {}", e);
                        PollOutcome::Failed(e.to_string())
                    }
                }
            }
            Err(e) if e.is_transient() => {
                warn!("Rule poll failed: {}", e);
                PollOutcome::Failed(e.to_string())
            }
            Err(e) => {
                error!("Rule poll failed: {}", e);
                PollOutcome::Failed(e.to_string())
            }
        }
    }

    /// Verify and install `update` as the current rule set.
    ///
    /// Either the whole update becomes current and is persisted, or nothing
    /// changes.
    ///
    /// # Errors
    /// - `Error::Integrity` when the checksum or version ordering check fails
    /// - The cache's error when persisting fails (after rolling back)
    pub async fn apply_update(&self, update: RuleUpdate) -> Result<RuleVersion> {
        let applied_at = Utc::now();
        let version = update.version.clone();
        let changelog = update.changelog.clone();

        let previous = {
            let mut state = self.state.write().await;
            self.verify(&update, state.version.as_ref())?;

            let previous_version = state.version.take();
            let previous_cached = state.cached.take();

            let cached = CachedRules { update, applied_at };
            state.version = Some(version.clone());
            state.cached = Some(cached.clone());

            if let Err(e) = self.cache.save(&cached).await {
                state.version = previous_version;
                state.cached = previous_cached;
                error!("Failed to persist rule update {}, rolled back: {}", version, e);
                return Err(e);
            }

            previous_version
        };

        info!(
            "Applied rule update {} (previous: {})",
            version,
            previous
                .as_ref()
                .map(|v| v.version.as_str())
                .unwrap_or("none")
        );

        self.notify_observers(&version, applied_at).await;
        self.events.emit(SyncEventKind::RulesUpdated {
            version: version.clone(),
            previous,
            changelog,
        });

        Ok(version)
    }

    /// Integrity checks run before an update may become current.
    fn verify(&self, update: &RuleUpdate, current: Option<&RuleVersion>) -> Result<()> {
        self.check_checksum(&update.version, &update.rules)?;

        if self.config.enforce_monotonic_versions {
            if let Some(current) = current.filter(|v| !v.is_unverified()) {
                if update.version.version == current.version {
                    return Err(Error::Integrity(format!(
                        "rule version {} is already current",
                        current.version
                    )));
                }
                if update.version.timestamp < current.timestamp {
                    return Err(Error::Integrity(format!(
                        "rule version {} is older than current {}",
                        update.version, current
                    )));
                }
            }
        }

        Ok(())
    }

    /// Checksum check shared by cloud updates and the cache, applying the
    /// configured policy to checksums that cannot be verified.
    fn check_checksum(&self, version: &RuleVersion, rules: &RuleSet) -> Result<()> {
        match checksum::verify(version, rules) {
            ChecksumCheck::Verified => Ok(()),
            ChecksumCheck::Mismatch { declared, computed } => Err(Error::Integrity(format!(
                "checksum mismatch for {}: declared {}, computed {}",
                version.version, declared, computed
            ))),
            ChecksumCheck::Unavailable(reason) => match self.config.checksum_policy {
                ChecksumPolicy::FailOpen => {
                    warn!(
                        "Cannot verify checksum of rules {} ({}), accepting them",
                        version.version, reason
                    );
                    Ok(())
                }
                ChecksumPolicy::FailClosed => Err(Error::Integrity(format!(
                    "cannot verify checksum of {}: {}",
                    version.version, reason
                ))),
            },
        }
    }

    /// Restore the last known-good update from the cache without the network.
    ///
    /// Cached rules that fail the checksum check are ignored.
    pub async fn load_from_cache(&self) -> Result<Option<RuleVersion>> {
        let Some(cached) = self.cache.load().await? else {
            debug!("No cached rules");
            return Ok(None);
        };

        if let Err(e) = self.check_checksum(&cached.update.version, &cached.update.rules) {
            error!("Ignoring rule cache: {}", e);
            return Ok(None);
        }

        Ok(Some(self.restore(cached).await))
    }

    /// Install a previously exported snapshot as current.
    pub async fn restore(&self, cached: CachedRules) -> RuleVersion {
        let version = cached.update.version.clone();
        let applied_at = cached.applied_at;
        {
            let mut state = self.state.write().await;
            state.version = Some(version.clone());
            state.cached = Some(cached);
        }
        info!("Restored rules {} applied at {}", version, applied_at);
        self.notify_observers(&version, applied_at).await;
        version
    }

    /// Seed a placeholder version when nothing is current yet.
    ///
    /// Returns the current version, which is the existing one if any.
    pub async fn initialize_with_defaults(&self, version: &str) -> RuleVersion {
        let placeholder = {
            let mut state = self.state.write().await;
            if let Some(existing) = &state.version {
                return existing.clone();
            }
            let placeholder = RuleVersion::placeholder(version);
            state.version = Some(placeholder.clone());
            placeholder
        };

        warn!(
            "No cached rules and no cloud update; using unverified placeholder version {}",
            placeholder.version
        );
        self.notify_observers(&placeholder, placeholder.timestamp).await;
        placeholder
    }

    /// The current rule version.
    pub async fn current_version(&self) -> Option<RuleVersion> {
        self.state.read().await.version.clone()
    }

    /// The current rule update, absent while running on the placeholder.
    pub async fn current_rules(&self) -> Option<RuleUpdate> {
        self.state
            .read()
            .await
            .cached
            .as_ref()
            .map(|c| c.update.clone())
    }

    /// Export the current rules for persistence.
    pub async fn snapshot(&self) -> Option<CachedRules> {
        self.state.read().await.cached.clone()
    }

    /// Register a listener on this updater's event bus.
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&SyncEvent) + Send + Sync + 'static,
    {
        self.events.subscribe(listener)
    }

    async fn notify_observers(&self, version: &RuleVersion, synced_at: DateTime<Utc>) {
        let observers: Vec<_> = self.observers.read().clone();
        for observer in observers {
            observer
                .rule_version_changed(version.clone(), synced_at)
                .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connectivity::ConnectivityMonitor;
    use crate::store::MemoryRuleCache;
    use crate::testing::{sealed_update, ScriptedCloudClient};
    use chrono::Duration as ChronoDuration;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct FailingCache;

    #[async_trait]
    impl RuleCache for FailingCache {
        async fn load(&self) -> Result<Option<CachedRules>> {
            Ok(None)
        }

        async fn save(&self, _rules: &CachedRules) -> Result<()> {
            Err(Error::Persistence("disk full".to_string()))
        }
    }

    fn rules(marker: &str) -> RuleSet {
        RuleSet {
            clinical: vec![json!({"id": marker})],
            ..RuleSet::default()
        }
    }

    fn updater_with(
        config: SyncConfig,
        client: Arc<ScriptedCloudClient>,
        cache: Arc<dyn RuleCache>,
    ) -> (Arc<RuleUpdater>, Arc<AtomicUsize>) {
        let events = EventBus::new();
        let updates = Arc::new(AtomicUsize::new(0));
        let counter = updates.clone();
        events.subscribe(move |e| {
            if matches!(e.kind, SyncEventKind::RulesUpdated { .. }) {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });
        let updater = Arc::new(RuleUpdater::new(Arc::new(config), client, cache, events));
        (updater, updates)
    }

    #[tokio::test]
    async fn test_poll_applies_verified_update() {
        let client = Arc::new(ScriptedCloudClient::new());
        let cache = Arc::new(MemoryRuleCache::new());
        let (updater, updates) = updater_with(SyncConfig::default(), client.clone(), cache.clone());

        let update = sealed_update("v1", Utc::now(), rules("a"));
        client.push_poll(Ok(PollResponse::Update(update.clone())));

        let outcome = updater.poll_for_updates().await;
        assert_eq!(outcome, PollOutcome::Updated(update.version.clone()));
        assert_eq!(updater.current_version().await, Some(update.version.clone()));
        assert_eq!(updater.current_rules().await, Some(update));
        assert!(cache.load().await.unwrap().is_some());
        assert_eq!(updates.load(Ordering::SeqCst), 1);
        assert_eq!(client.polled_versions(), vec![None]);
    }

    #[tokio::test]
    async fn test_checksum_mismatch_rejected() {
        let client = Arc::new(ScriptedCloudClient::new());
        let (updater, updates) =
            updater_with(SyncConfig::default(), client.clone(), Arc::new(MemoryRuleCache::new()));

        let good = sealed_update("v1", Utc::now(), rules("a"));
        updater.apply_update(good.clone()).await.unwrap();

        let mut corrupt = sealed_update("v2", Utc::now(), rules("b"));
        corrupt.rules.clinical.push(json!({"id": "injected"}));
        client.push_poll(Ok(PollResponse::Update(corrupt)));

        let outcome = updater.poll_for_updates().await;
        assert!(matches!(outcome, PollOutcome::Rejected(_)));
        assert_eq!(updater.current_version().await, Some(good.version));
        assert_eq!(updates.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unverifiable_checksum_follows_policy() {
        let mut update = sealed_update("v1", Utc::now(), rules("a"));
        update.version.checksum = "md5:0123".to_string();

        let client = Arc::new(ScriptedCloudClient::new());
        let (open, _) =
            updater_with(SyncConfig::default(), client.clone(), Arc::new(MemoryRuleCache::new()));
        assert!(open.apply_update(update.clone()).await.is_ok());

        let closed_config = SyncConfig::default().with_checksum_policy(ChecksumPolicy::FailClosed);
        let (closed, _) = updater_with(closed_config, client, Arc::new(MemoryRuleCache::new()));
        assert!(matches!(
            closed.apply_update(update).await,
            Err(Error::Integrity(_))
        ));
        assert!(closed.current_version().await.is_none());
    }

    #[tokio::test]
    async fn test_version_regression_rejected() {
        let client = Arc::new(ScriptedCloudClient::new());
        let (updater, _) =
            updater_with(SyncConfig::default(), client, Arc::new(MemoryRuleCache::new()));

        let now = Utc::now();
        let newer = sealed_update("v2", now, rules("b"));
        updater.apply_update(newer.clone()).await.unwrap();

        let older = sealed_update("v1", now - ChronoDuration::hours(1), rules("a"));
        assert!(matches!(
            updater.apply_update(older).await,
            Err(Error::Integrity(_))
        ));
        assert!(matches!(
            updater.apply_update(newer.clone()).await,
            Err(Error::Integrity(_))
        ));
        assert_eq!(updater.current_version().await, Some(newer.version));
    }

    #[tokio::test]
    async fn test_applied_versions_never_move_backwards() {
        let client = Arc::new(ScriptedCloudClient::new());
        let (updater, _) =
            updater_with(SyncConfig::default(), client, Arc::new(MemoryRuleCache::new()));

        let base = Utc::now();
        let offsets = [3i64, 1, 4, 1, 5, 9, 2, 6];
        let mut last_applied: Option<DateTime<Utc>> = None;
        for (i, offset) in offsets.iter().enumerate() {
            let update = sealed_update(
                &format!("v{}", i),
                base + ChronoDuration::minutes(*offset),
                rules(&i.to_string()),
            );
            let _ = updater.apply_update(update).await;
            let current = updater.current_version().await.unwrap().timestamp;
            if let Some(previous) = last_applied {
                assert!(current >= previous);
            }
            last_applied = Some(current);
        }
    }

    #[tokio::test]
    async fn test_persist_failure_rolls_back() {
        let client = Arc::new(ScriptedCloudClient::new());
        let (updater, updates) = updater_with(SyncConfig::default(), client, Arc::new(FailingCache));

        let placeholder = updater.initialize_with_defaults("0.0.0").await;
        let update = sealed_update("v1", Utc::now(), rules("a"));

        let result = updater.apply_update(update).await;
        assert!(matches!(result, Err(Error::Persistence(_))));
        assert_eq!(updater.current_version().await, Some(placeholder));
        assert!(updater.current_rules().await.is_none());
        assert_eq!(updates.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_no_change_and_transport_errors_are_not_fatal() {
        let client = Arc::new(ScriptedCloudClient::new());
        let (updater, _) =
            updater_with(SyncConfig::default(), client.clone(), Arc::new(MemoryRuleCache::new()));

        client.push_poll(Ok(PollResponse::NoChange));
        client.push_poll(Err(Error::Network("connection reset".to_string())));
        client.push_poll(Err(Error::Serialization("bad json".to_string())));

        assert_eq!(updater.poll_for_updates().await, PollOutcome::NoChange);
        assert!(matches!(updater.poll_for_updates().await, PollOutcome::Failed(_)));
        assert!(matches!(updater.poll_for_updates().await, PollOutcome::Failed(_)));
        assert!(updater.current_version().await.is_none());
    }

    #[tokio::test]
    async fn test_force_update_coalesces_with_in_flight_poll() {
        let client = Arc::new(ScriptedCloudClient::new().with_poll_delay(Duration::from_millis(100)));
        let (updater, _) =
            updater_with(SyncConfig::default(), client.clone(), Arc::new(MemoryRuleCache::new()));

        let update = sealed_update("v1", Utc::now(), rules("a"));
        client.push_poll(Ok(PollResponse::Update(update.clone())));

        let background = {
            let updater = updater.clone();
            tokio::spawn(async move { updater.poll_for_updates().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        let forced = updater.force_update().await;

        assert_eq!(forced, PollOutcome::Updated(update.version.clone()));
        assert_eq!(background.await.unwrap(), forced);
        assert_eq!(client.poll_calls(), 1);
    }

    #[tokio::test]
    async fn test_load_from_cache_notifies_monitor() {
        let client = Arc::new(ScriptedCloudClient::new());
        let cache = Arc::new(MemoryRuleCache::new());
        let applied_at = Utc::now() - ChronoDuration::hours(60);
        let update = sealed_update("v1", applied_at, rules("a"));
        cache
            .save(&CachedRules {
                update: update.clone(),
                applied_at,
            })
            .await
            .unwrap();

        let config = Arc::new(SyncConfig::default());
        let events = EventBus::new();
        let monitor = Arc::new(ConnectivityMonitor::new(
            config.clone(),
            client.clone(),
            events.clone(),
        ));
        let updater = RuleUpdater::new(config, client, cache, events);
        updater.add_observer(monitor.clone());

        let restored = updater.load_from_cache().await.unwrap();
        assert_eq!(restored, Some(update.version.clone()));
        assert_eq!(monitor.get_rule_version().await, Some(update.version));
        // Staleness counts from the original sync, not from the restart.
        assert!(monitor.is_rules_stale().await);
    }

    #[tokio::test]
    async fn test_corrupt_cache_ignored() {
        let client = Arc::new(ScriptedCloudClient::new());
        let cache = Arc::new(MemoryRuleCache::new());
        let mut update = sealed_update("v1", Utc::now(), rules("a"));
        update.rules.billing.push(json!({"code": "tampered"}));
        cache
            .save(&CachedRules {
                update,
                applied_at: Utc::now(),
            })
            .await
            .unwrap();

        let (updater, _) = updater_with(SyncConfig::default(), client, cache);
        assert_eq!(updater.load_from_cache().await.unwrap(), None);
        assert!(updater.current_version().await.is_none());
    }

    #[tokio::test]
    async fn test_unverifiable_cache_follows_policy() {
        let mut update = sealed_update("v1", Utc::now(), rules("a"));
        update.version.checksum = "md5:0123".to_string();
        let cached = CachedRules {
            update,
            applied_at: Utc::now(),
        };

        let open_cache = Arc::new(MemoryRuleCache::new());
        open_cache.save(&cached).await.unwrap();
        let (open, _) = updater_with(
            SyncConfig::default(),
            Arc::new(ScriptedCloudClient::new()),
            open_cache,
        );
        assert_eq!(
            open.load_from_cache().await.unwrap(),
            Some(cached.update.version.clone())
        );

        let closed_cache = Arc::new(MemoryRuleCache::new());
        closed_cache.save(&cached).await.unwrap();
        let (closed, _) = updater_with(
            SyncConfig::default().with_checksum_policy(ChecksumPolicy::FailClosed),
            Arc::new(ScriptedCloudClient::new()),
            closed_cache,
        );
        assert_eq!(closed.load_from_cache().await.unwrap(), None);
        assert!(closed.current_version().await.is_none());
    }

    #[tokio::test]
    async fn test_placeholder_is_replaced_and_not_sent_to_cloud() {
        let client = Arc::new(ScriptedCloudClient::new());
        let (updater, _) =
            updater_with(SyncConfig::default(), client.clone(), Arc::new(MemoryRuleCache::new()));

        let placeholder = updater.initialize_with_defaults("0.0.0").await;
        assert!(placeholder.is_unverified());
        // A second call keeps the existing version.
        assert_eq!(updater.initialize_with_defaults("9.9.9").await, placeholder);

        // Cloud timestamps may predate the placeholder; it is still replaced.
        let update = sealed_update("v1", Utc::now() - ChronoDuration::days(3), rules("a"));
        client.push_poll(Ok(PollResponse::Update(update.clone())));
        assert_eq!(
            updater.poll_for_updates().await,
            PollOutcome::Updated(update.version)
        );
        assert_eq!(client.polled_versions(), vec![None]);
    }

    #[tokio::test]
    async fn test_start_polls_immediately_and_stops() {
        let client = Arc::new(ScriptedCloudClient::new());
        let (updater, _) =
            updater_with(SyncConfig::default(), client.clone(), Arc::new(MemoryRuleCache::new()));

        updater.stop().await;
        updater.start();
        tokio::time::sleep(Duration::from_millis(50)).await;
        updater.stop().await;
        updater.stop().await;

        assert_eq!(client.poll_calls(), 1);
        assert!(!updater.is_running());
    }
}
