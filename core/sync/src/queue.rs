//! Outbound delivery queue.
//!
//! Holds assurance events, clinician feedback and outcomes until the cloud
//! acknowledges them. Items are delivered in batches, highest priority first,
//! with a bounded number of attempts per item.

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use edgesync_common::{
    EventBus, QueueItem, QueueItemStatus, QueueItemType, Result, Subscription, SyncConfig,
    SyncEvent, SyncEventKind,
};

/// Options for [`DeliveryQueue::enqueue`].
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    /// Overrides the payload-derived priority.
    pub priority: Option<u32>,
    /// Caller-supplied id; a UUID is generated otherwise.
    pub id: Option<String>,
}

impl EnqueueOptions {
    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }
}

/// Priority assigned when the caller does not give one.
///
/// Alerts and critical assurance events go first, then clinician feedback,
/// high-severity assurance events and outcomes.
pub fn default_priority(item_type: QueueItemType, payload: &Value) -> u32 {
    match item_type {
        QueueItemType::AssuranceEvent => {
            let category = payload_str(payload, &["category", "eventType"]);
            let severity = payload_str(payload, &["severity", "riskLevel"]);
            if category == Some("alert") || severity == Some("critical") {
                100
            } else if severity == Some("high") {
                75
            } else {
                50
            }
        }
        QueueItemType::HumanFeedback => 80,
        QueueItemType::Outcome => 60,
    }
}

fn payload_str<'a>(payload: &'a Value, keys: &[&str]) -> Option<&'a str> {
    keys.iter().find_map(|key| payload.get(*key).and_then(Value::as_str))
}

/// Per-item delivery outcome reported by the transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ItemOutcome {
    Delivered,
    Failed { error: String, retryable: bool },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemResult {
    pub id: String,
    #[serde(flatten)]
    pub outcome: ItemOutcome,
}

impl ItemResult {
    pub fn delivered(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            outcome: ItemOutcome::Delivered,
        }
    }

    pub fn failed(id: impl Into<String>, error: impl Into<String>, retryable: bool) -> Self {
        Self {
            id: id.into(),
            outcome: ItemOutcome::Failed {
                error: error.into(),
                retryable,
            },
        }
    }
}

/// What the transport reports for one batch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchResult {
    pub results: Vec<ItemResult>,
}

impl BatchResult {
    /// Every item in `items` was delivered.
    pub fn all_delivered(items: &[QueueItem]) -> Self {
        Self {
            results: items.iter().map(|i| ItemResult::delivered(&i.id)).collect(),
        }
    }
}

/// Counts for one `process_batch` call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    pub attempted: usize,
    pub synced: usize,
    pub failed: usize,
    pub dropped: usize,
}

impl BatchReport {
    /// A batch ran and nothing in it was delivered.
    pub fn made_no_progress(&self) -> bool {
        self.attempted > 0 && self.synced == 0
    }
}

/// What `mark_failed` did with the item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDisposition {
    /// Kept for another attempt.
    Retained,
    /// Removed: attempts exhausted or the failure is permanent.
    Dropped,
    /// No item with that id.
    Unknown,
}

/// Queue depth summary.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    pub total: usize,
    pub pending: usize,
    pub in_flight: usize,
    pub failed: usize,
    pub by_type: BTreeMap<QueueItemType, usize>,
    pub oldest_item_age: Option<Duration>,
}

/// Delivers a batch of items to the cloud.
#[async_trait]
pub trait BatchTransport: Send + Sync {
    async fn deliver(&self, items: Vec<QueueItem>) -> Result<BatchResult>;
}

#[async_trait]
impl<F, Fut> BatchTransport for F
where
    F: Fn(Vec<QueueItem>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<BatchResult>> + Send + 'static,
{
    async fn deliver(&self, items: Vec<QueueItem>) -> Result<BatchResult> {
        (self)(items).await
    }
}

/// Resets the processing flag when a batch ends, even on panic.
struct ProcessingGuard<'a>(&'a AtomicBool);

impl Drop for ProcessingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Priority queue of outbound items.
pub struct DeliveryQueue {
    config: Arc<SyncConfig>,
    events: EventBus,
    items: RwLock<HashMap<String, QueueItem>>,
    next_sequence: AtomicU64,
    processing: AtomicBool,
}

impl DeliveryQueue {
    pub fn new(config: Arc<SyncConfig>, events: EventBus) -> Self {
        Self {
            config,
            events,
            items: RwLock::new(HashMap::new()),
            next_sequence: AtomicU64::new(0),
            processing: AtomicBool::new(false),
        }
    }

    /// Add an item and return its id.
    ///
    /// Re-enqueueing an id that is already queued keeps the queued item.
    pub async fn enqueue(
        &self,
        item_type: QueueItemType,
        payload: Value,
        options: EnqueueOptions,
    ) -> String {
        let id = options
            .id
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let priority = options
            .priority
            .unwrap_or_else(|| default_priority(item_type, &payload));

        {
            let mut items = self.items.write().await;
            if items.contains_key(&id) {
                debug!("Item {} already queued", id);
                return id;
            }
            let sequence = self.next_sequence.fetch_add(1, Ordering::SeqCst);
            items.insert(
                id.clone(),
                QueueItem::new(id.clone(), item_type, payload, priority, sequence),
            );
        }

        debug!("Queued {} {} (priority {})", item_type, id, priority);
        self.events.emit(SyncEventKind::QueueItemAdded {
            id: id.clone(),
            item_type,
            priority,
        });
        id
    }

    /// Deliverable items in delivery order, up to `limit`.
    pub async fn get_pending_items(&self, limit: Option<usize>) -> Vec<QueueItem> {
        let items = self.items.read().await;
        let mut pending: Vec<QueueItem> = items
            .values()
            .filter(|i| i.is_deliverable())
            .cloned()
            .collect();
        sort_for_delivery(&mut pending);
        if let Some(limit) = limit {
            pending.truncate(limit);
        }
        pending
    }

    /// Check if a batch is being processed.
    pub fn is_processing(&self) -> bool {
        self.processing.load(Ordering::Acquire)
    }

    /// Deliver one batch through `transport` and reconcile the results.
    ///
    /// Only one batch runs at a time; a concurrent call returns an empty
    /// report without touching the queue.
    pub async fn process_batch(&self, transport: &dyn BatchTransport) -> BatchReport {
        if self
            .processing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Batch already in progress, skipping");
            return BatchReport::default();
        }
        let _guard = ProcessingGuard(&self.processing);

        let batch = self.select_batch().await;
        if batch.is_empty() {
            return BatchReport::default();
        }
        let ids: Vec<String> = batch.iter().map(|i| i.id.clone()).collect();
        debug!("Delivering batch of {} items", ids.len());

        let mut outcomes: HashMap<String, ItemOutcome> = match transport.deliver(batch).await {
            Ok(result) => result
                .results
                .into_iter()
                .map(|r| (r.id, r.outcome))
                .collect(),
            Err(e) => {
                warn!("Batch delivery failed: {}", e);
                let error = e.to_string();
                ids.iter()
                    .map(|id| {
                        (
                            id.clone(),
                            ItemOutcome::Failed {
                                error: error.clone(),
                                retryable: true,
                            },
                        )
                    })
                    .collect()
            }
        };

        let mut report = BatchReport {
            attempted: ids.len(),
            ..BatchReport::default()
        };
        for id in &ids {
            match outcomes.remove(id) {
                Some(ItemOutcome::Delivered) => {
                    if self.mark_synced(id).await {
                        report.synced += 1;
                    }
                }
                Some(ItemOutcome::Failed { error, retryable }) => {
                    self.record_failure(&mut report, id, &error, retryable).await;
                }
                None => {
                    self.record_failure(&mut report, id, "no result reported for item", true)
                        .await;
                }
            }
        }

        info!(
            "Batch complete: {} attempted, {} synced, {} failed, {} dropped",
            report.attempted, report.synced, report.failed, report.dropped
        );
        report
    }

    async fn select_batch(&self) -> Vec<QueueItem> {
        let mut items = self.items.write().await;
        let mut candidates: Vec<&QueueItem> =
            items.values().filter(|i| i.is_deliverable()).collect();
        candidates.sort_by(|a, b| delivery_order(a, b));
        let ids: Vec<String> = candidates
            .into_iter()
            .take(self.config.batch_size)
            .map(|i| i.id.clone())
            .collect();

        let now = Utc::now();
        let mut batch = Vec::with_capacity(ids.len());
        for id in &ids {
            if let Some(item) = items.get_mut(id) {
                item.mark_in_flight(now);
                batch.push(item.clone());
            }
        }
        batch
    }

    async fn record_failure(
        &self,
        report: &mut BatchReport,
        id: &str,
        error: &str,
        retryable: bool,
    ) {
        match self.mark_failed(id, error, retryable).await {
            FailureDisposition::Retained => report.failed += 1,
            FailureDisposition::Dropped => report.dropped += 1,
            FailureDisposition::Unknown => {}
        }
    }

    /// Remove a delivered item. Returns false if it was not queued.
    pub async fn mark_synced(&self, id: &str) -> bool {
        let removed = self.items.write().await.remove(id);
        match removed {
            Some(item) => {
                debug!("Item {} synced after {} attempts", id, item.attempt_count);
                self.events.emit(SyncEventKind::QueueItemSynced {
                    id: item.id,
                    item_type: item.item_type,
                    attempts: item.attempt_count,
                });
                true
            }
            None => false,
        }
    }

    /// Record a failed delivery.
    ///
    /// The item is dropped when the failure is permanent or its attempts have
    /// reached the configured maximum.
    pub async fn mark_failed(&self, id: &str, error: &str, retryable: bool) -> FailureDisposition {
        let dropped = {
            let mut items = self.items.write().await;
            let Some(item) = items.get_mut(id) else {
                return FailureDisposition::Unknown;
            };
            item.mark_failed(error);
            if retryable && item.should_retry(self.config.max_retry_attempts) {
                debug!(
                    "Item {} failed (attempt {}), will retry: {}",
                    id, item.attempt_count, error
                );
                return FailureDisposition::Retained;
            }
            items.remove(id)
        };

        if let Some(item) = dropped {
            error!(
                "Dropping {} {} after {} attempts: {}",
                item.item_type, item.id, item.attempt_count, error
            );
            self.events.emit(SyncEventKind::QueueItemDropped {
                id: item.id,
                item_type: item.item_type,
                attempts: item.attempt_count,
                error: error.to_string(),
            });
        }
        FailureDisposition::Dropped
    }

    /// All queued items in enqueue order, for persistence.
    pub async fn export(&self) -> Vec<QueueItem> {
        let mut items: Vec<QueueItem> = self.items.read().await.values().cloned().collect();
        items.sort_by_key(|i| i.sequence);
        items
    }

    /// Merge previously exported items. Returns how many were added.
    ///
    /// Ids already queued are kept as they are. Items caught mid-delivery are
    /// made deliverable again; their attempt counts are preserved.
    pub async fn import(&self, imported: Vec<QueueItem>) -> usize {
        let mut items = self.items.write().await;
        let mut added = 0;
        for mut item in imported {
            if item.status == QueueItemStatus::Synced || items.contains_key(&item.id) {
                continue;
            }
            if item.status == QueueItemStatus::InFlight {
                item.status = QueueItemStatus::Pending;
            }
            self.next_sequence
                .fetch_max(item.sequence.saturating_add(1), Ordering::SeqCst);
            items.insert(item.id.clone(), item);
            added += 1;
        }
        if added > 0 {
            info!("Imported {} queued items", added);
        }
        added
    }

    pub async fn get_stats(&self) -> QueueStats {
        let items = self.items.read().await;
        let now = Utc::now();
        let mut stats = QueueStats {
            total: items.len(),
            ..QueueStats::default()
        };
        for item in items.values() {
            match item.status {
                QueueItemStatus::Pending => stats.pending += 1,
                QueueItemStatus::InFlight => stats.in_flight += 1,
                QueueItemStatus::Failed => stats.failed += 1,
                QueueItemStatus::Synced => {}
            }
            *stats.by_type.entry(item.item_type).or_default() += 1;
        }
        stats.oldest_item_age = items
            .values()
            .map(|i| i.created_at)
            .min()
            .map(|oldest| (now - oldest).to_std().unwrap_or_default());
        stats
    }

    pub async fn len(&self) -> usize {
        self.items.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.items.read().await.is_empty()
    }

    pub async fn get(&self, id: &str) -> Option<QueueItem> {
        self.items.read().await.get(id).cloned()
    }

    /// Remove every item. Returns how many were removed.
    pub async fn clear(&self) -> usize {
        let mut items = self.items.write().await;
        let count = items.len();
        items.clear();
        if count > 0 {
            warn!("Cleared {} queued items", count);
        }
        count
    }

    /// Register a listener on this queue's event bus.
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&SyncEvent) + Send + Sync + 'static,
    {
        self.events.subscribe(listener)
    }
}

/// Priority descending, then oldest first, then enqueue order.
fn delivery_order(a: &QueueItem, b: &QueueItem) -> std::cmp::Ordering {
    b.priority
        .cmp(&a.priority)
        .then_with(|| a.created_at.cmp(&b.created_at))
        .then_with(|| a.sequence.cmp(&b.sequence))
}

fn sort_for_delivery(items: &mut [QueueItem]) {
    items.sort_by(delivery_order);
}

#[cfg(test)]
mod tests {
    use super::*;
    use edgesync_common::Error;
    use parking_lot::Mutex;
    use proptest::prelude::*;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn queue_with(config: SyncConfig) -> (Arc<DeliveryQueue>, Arc<Mutex<Vec<SyncEvent>>>) {
        let events = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        events.subscribe(move |e| sink.lock().push(e.clone()));
        (Arc::new(DeliveryQueue::new(Arc::new(config), events)), seen)
    }

    fn queue() -> Arc<DeliveryQueue> {
        queue_with(SyncConfig::default()).0
    }

    fn count(events: &[SyncEvent], name: &str) -> usize {
        events.iter().filter(|e| e.kind.name() == name).count()
    }

    async fn failing(items: Vec<QueueItem>) -> Result<BatchResult> {
        Ok(BatchResult {
            results: items
                .iter()
                .map(|i| ItemResult::failed(&i.id, "503 from ingest", true))
                .collect(),
        })
    }

    async fn delivering(items: Vec<QueueItem>) -> Result<BatchResult> {
        Ok(BatchResult::all_delivered(&items))
    }

    #[test]
    fn test_default_priority() {
        let event = QueueItemType::AssuranceEvent;
        assert_eq!(default_priority(event, &json!({"category": "alert"})), 100);
        assert_eq!(default_priority(event, &json!({"eventType": "alert"})), 100);
        assert_eq!(default_priority(event, &json!({"severity": "critical"})), 100);
        assert_eq!(default_priority(event, &json!({"riskLevel": "high"})), 75);
        assert_eq!(default_priority(event, &json!({"severity": "low"})), 50);
        assert_eq!(default_priority(event, &json!("not an object")), 50);
        assert_eq!(default_priority(QueueItemType::HumanFeedback, &json!({})), 80);
        assert_eq!(default_priority(QueueItemType::Outcome, &json!({})), 60);
    }

    #[tokio::test]
    async fn test_enqueue_assigns_priority_and_emits() {
        let (queue, seen) = queue_with(SyncConfig::default());

        let id = queue
            .enqueue(
                QueueItemType::AssuranceEvent,
                json!({"severity": "critical"}),
                EnqueueOptions::default(),
            )
            .await;
        let overridden = queue
            .enqueue(
                QueueItemType::Outcome,
                json!({}),
                EnqueueOptions::default().with_priority(5),
            )
            .await;

        let item = queue.get(&id).await.unwrap();
        assert_eq!(item.priority, 100);
        assert_eq!(item.status, QueueItemStatus::Pending);
        assert_eq!(item.attempt_count, 0);
        assert_eq!(queue.get(&overridden).await.unwrap().priority, 5);
        assert_eq!(count(&seen.lock(), "queue_item_added"), 2);
    }

    #[tokio::test]
    async fn test_duplicate_id_keeps_existing_item() {
        let (queue, seen) = queue_with(SyncConfig::default());
        let options = EnqueueOptions::default().with_id("evt-1");

        queue
            .enqueue(QueueItemType::Outcome, json!({"n": 1}), options.clone())
            .await;
        let id = queue
            .enqueue(QueueItemType::Outcome, json!({"n": 2}), options)
            .await;

        assert_eq!(id, "evt-1");
        assert_eq!(queue.len().await, 1);
        assert_eq!(queue.get("evt-1").await.unwrap().payload, json!({"n": 1}));
        assert_eq!(count(&seen.lock(), "queue_item_added"), 1);
    }

    #[tokio::test]
    async fn test_pending_items_in_priority_order() {
        let queue = queue();
        let low = queue
            .enqueue(QueueItemType::Outcome, json!({}), EnqueueOptions::default())
            .await;
        let high = queue
            .enqueue(
                QueueItemType::AssuranceEvent,
                json!({"category": "alert"}),
                EnqueueOptions::default(),
            )
            .await;
        let mid = queue
            .enqueue(QueueItemType::HumanFeedback, json!({}), EnqueueOptions::default())
            .await;
        let low_later = queue
            .enqueue(QueueItemType::Outcome, json!({}), EnqueueOptions::default())
            .await;

        let ids: Vec<String> = queue
            .get_pending_items(None)
            .await
            .into_iter()
            .map(|i| i.id)
            .collect();
        assert_eq!(ids, vec![high, mid, low.clone(), low_later]);

        let limited = queue.get_pending_items(Some(1)).await;
        assert_eq!(limited.len(), 1);
    }

    #[tokio::test]
    async fn test_successful_batch_removes_items() {
        let (queue, seen) = queue_with(SyncConfig::default().with_batch_size(2));
        for n in 0..3 {
            queue
                .enqueue(QueueItemType::Outcome, json!({"n": n}), EnqueueOptions::default())
                .await;
        }

        let report = queue.process_batch(&delivering).await;
        assert_eq!(
            report,
            BatchReport {
                attempted: 2,
                synced: 2,
                failed: 0,
                dropped: 0
            }
        );
        assert_eq!(queue.len().await, 1);
        assert_eq!(count(&seen.lock(), "queue_item_synced"), 2);

        let report = queue.process_batch(&delivering).await;
        assert_eq!(report.synced, 1);
        assert!(queue.is_empty().await);

        assert_eq!(queue.process_batch(&delivering).await, BatchReport::default());
    }

    #[tokio::test]
    async fn test_retry_cap() {
        let config = SyncConfig::default().with_max_retry_attempts(3);

        let (kept, _) = queue_with(config.clone());
        let id = kept
            .enqueue(QueueItemType::Outcome, json!({}), EnqueueOptions::default())
            .await;
        for _ in 0..2 {
            kept.process_batch(&failing).await;
        }
        let item = kept.get(&id).await.unwrap();
        assert_eq!(item.status, QueueItemStatus::Failed);
        assert_eq!(item.attempt_count, 2);
        assert_eq!(item.last_error.as_deref(), Some("503 from ingest"));

        let (dropped, seen) = queue_with(config);
        let id = dropped
            .enqueue(QueueItemType::Outcome, json!({}), EnqueueOptions::default())
            .await;
        let reports: Vec<BatchReport> = {
            let mut reports = Vec::new();
            for _ in 0..3 {
                reports.push(dropped.process_batch(&failing).await);
            }
            reports
        };
        assert_eq!(reports[2].dropped, 1);
        assert!(dropped.get(&id).await.is_none());
        assert_eq!(count(&seen.lock(), "queue_item_dropped"), 1);

        // Nothing left to attempt.
        assert_eq!(dropped.process_batch(&failing).await.attempted, 0);
    }

    #[tokio::test]
    async fn test_non_retryable_failure_drops_immediately() {
        let queue = queue();
        let id = queue
            .enqueue(QueueItemType::Outcome, json!({}), EnqueueOptions::default())
            .await;

        let rejecting = |items: Vec<QueueItem>| async move {
            Ok::<_, Error>(BatchResult {
                results: items
                    .iter()
                    .map(|i| ItemResult::failed(&i.id, "schema violation", false))
                    .collect(),
            })
        };
        let report = queue.process_batch(&rejecting).await;
        assert_eq!(report.dropped, 1);
        assert!(queue.get(&id).await.is_none());
    }

    #[tokio::test]
    async fn test_transport_error_and_missing_results_are_retryable() {
        let queue = queue();
        let a = queue
            .enqueue(QueueItemType::Outcome, json!({}), EnqueueOptions::default())
            .await;
        let b = queue
            .enqueue(QueueItemType::Outcome, json!({}), EnqueueOptions::default())
            .await;

        let unreachable =
            |_items: Vec<QueueItem>| async move {
            Err::<BatchResult, _>(Error::Network("connection reset".into()))
        };
        let report = queue.process_batch(&unreachable).await;
        assert_eq!(report.failed, 2);
        assert_eq!(
            queue.get(&a).await.unwrap().last_error.as_deref(),
            Some("Network error: connection reset")
        );

        let partial = {
            let a = a.clone();
            move |_items: Vec<QueueItem>| {
                let a = a.clone();
                async move {
                    Ok::<_, Error>(BatchResult {
                        results: vec![ItemResult::delivered(a)],
                    })
                }
            }
        };
        let report = queue.process_batch(&partial).await;
        assert_eq!(report.synced, 1);
        assert_eq!(report.failed, 1);
        assert!(queue.get(&a).await.is_none());
        assert_eq!(queue.get(&b).await.unwrap().attempt_count, 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_at_most_one_batch_in_flight() {
        let queue = queue();
        for _ in 0..4 {
            queue
                .enqueue(QueueItemType::Outcome, json!({}), EnqueueOptions::default())
                .await;
        }

        let calls = Arc::new(AtomicUsize::new(0));
        let transport = {
            let calls = calls.clone();
            move |items: Vec<QueueItem>| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    Ok::<_, Error>(BatchResult::all_delivered(&items))
                }
            }
        };
        let transport = Arc::new(transport);

        let first = {
            let queue = queue.clone();
            let transport = transport.clone();
            tokio::spawn(async move { queue.process_batch(transport.as_ref()).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(queue.is_processing());

        let second = queue.process_batch(transport.as_ref()).await;
        assert_eq!(second, BatchReport::default());

        let first = first.await.unwrap();
        assert_eq!(first.synced, 4);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!queue.is_processing());
    }

    #[tokio::test]
    async fn test_explicit_mark_operations() {
        let queue = queue();
        let id = queue
            .enqueue(QueueItemType::HumanFeedback, json!({}), EnqueueOptions::default())
            .await;

        assert_eq!(
            queue.mark_failed(&id, "timeout", true).await,
            FailureDisposition::Retained
        );
        assert_eq!(
            queue.mark_failed("missing", "timeout", true).await,
            FailureDisposition::Unknown
        );
        assert!(queue.mark_synced(&id).await);
        assert!(!queue.mark_synced(&id).await);
    }

    #[tokio::test]
    async fn test_export_import_survives_restart() {
        let queue = queue();
        for n in 0..3 {
            queue
                .enqueue(QueueItemType::Outcome, json!({"n": n}), EnqueueOptions::default())
                .await;
        }
        queue.process_batch(&failing).await;
        let mut exported = queue.export().await;
        assert_eq!(exported.len(), 3);

        // Simulate a crash mid-delivery for one item.
        exported[0].status = QueueItemStatus::InFlight;
        let crashed_id = exported[0].id.clone();

        let restored = self::queue();
        restored
            .enqueue(
                QueueItemType::Outcome,
                json!({"fresh": true}),
                EnqueueOptions::default().with_id(crashed_id.clone()),
            )
            .await;
        let added = restored.import(exported.clone()).await;
        assert_eq!(added, 2);
        // Existing id wins.
        assert_eq!(
            restored.get(&crashed_id).await.unwrap().payload,
            json!({"fresh": true})
        );

        let fresh = self::queue();
        assert_eq!(fresh.import(exported).await, 3);
        let item = fresh.get(&crashed_id).await.unwrap();
        assert_eq!(item.status, QueueItemStatus::Pending);
        assert_eq!(item.attempt_count, 1);

        // New items sort after imported ones.
        let newest = fresh
            .enqueue(QueueItemType::Outcome, json!({}), EnqueueOptions::default())
            .await;
        let max_imported = fresh
            .export()
            .await
            .into_iter()
            .filter(|i| i.id != newest)
            .map(|i| i.sequence)
            .max()
            .unwrap();
        assert!(fresh.get(&newest).await.unwrap().sequence > max_imported);
    }

    #[tokio::test]
    async fn test_stats() {
        let queue = queue();
        queue
            .enqueue(QueueItemType::Outcome, json!({}), EnqueueOptions::default())
            .await;
        queue
            .enqueue(QueueItemType::Outcome, json!({}), EnqueueOptions::default())
            .await;
        let failed = queue
            .enqueue(QueueItemType::HumanFeedback, json!({}), EnqueueOptions::default())
            .await;
        queue.mark_failed(&failed, "timeout", true).await;

        let stats = queue.get_stats().await;
        assert_eq!(stats.total, 3);
        assert_eq!(stats.pending, 2);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.in_flight, 0);
        assert_eq!(stats.by_type.get(&QueueItemType::Outcome), Some(&2));
        assert_eq!(stats.by_type.get(&QueueItemType::HumanFeedback), Some(&1));
        assert!(stats.oldest_item_age.is_some());

        assert_eq!(queue.clear().await, 3);
        assert_eq!(queue.get_stats().await, QueueStats::default());
    }

    #[tokio::test]
    async fn test_panicking_listener_does_not_abort_reconciliation() {
        let (queue, seen) = queue_with(SyncConfig::default());
        queue.subscribe(|e| {
            if matches!(e.kind, SyncEventKind::QueueItemSynced { .. }) {
                panic!("listener bug");
            }
        });
        for _ in 0..3 {
            queue
                .enqueue(QueueItemType::Outcome, json!({}), EnqueueOptions::default())
                .await;
        }

        let report = queue.process_batch(&delivering).await;
        assert_eq!(report.synced, 3);
        assert!(queue.is_empty().await);
        assert_eq!(count(&seen.lock(), "queue_item_synced"), 3);
    }

    fn arb_item_type() -> impl Strategy<Value = QueueItemType> {
        prop_oneof![
            Just(QueueItemType::AssuranceEvent),
            Just(QueueItemType::HumanFeedback),
            Just(QueueItemType::Outcome),
        ]
    }

    fn arb_severity() -> impl Strategy<Value = Option<&'static str>> {
        prop_oneof![
            Just(None),
            Just(Some("low")),
            Just(Some("high")),
            Just(Some("critical")),
        ]
    }

    proptest! {
        #[test]
        fn prop_pending_items_follow_delivery_order(
            entries in proptest::collection::vec(
                (arb_item_type(), arb_severity(), proptest::option::of(0u32..120)),
                0..40,
            ),
        ) {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            let pending = rt.block_on(async {
                let queue = queue();
                for (item_type, severity, priority) in entries {
                    let payload = match severity {
                        Some(s) => json!({"severity": s}),
                        None => json!({}),
                    };
                    let options = EnqueueOptions { priority, id: None };
                    queue.enqueue(item_type, payload, options).await;
                }
                queue.get_pending_items(None).await
            });

            for pair in pending.windows(2) {
                let (a, b) = (&pair[0], &pair[1]);
                prop_assert!(a.priority >= b.priority);
                if a.priority == b.priority {
                    prop_assert!(a.created_at <= b.created_at);
                    if a.created_at == b.created_at {
                        prop_assert!(a.sequence < b.sequence);
                    }
                }
            }
        }
    }
}
