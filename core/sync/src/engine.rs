//! Sync engine that wires the monitor, rule updater and delivery queue together.

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use edgesync_common::{
    ConnectionState, Error, EventBus, QueueItemType, Result, RuleVersion, StalenessWarning,
    Subscription, SyncConfig, SyncEvent,
};

use crate::client::{CloudClient, HttpCloudClient};
use crate::connectivity::ConnectivityMonitor;
use crate::queue::{BatchReport, BatchTransport, DeliveryQueue, EnqueueOptions, QueueStats};
use crate::rules::RuleUpdater;
use crate::scheduler::DrainScheduler;
use crate::store::{FileRuleCache, QueueStore, RuleCache, StateDirLock};

/// Rule cache file name inside a state directory.
pub const RULES_FILE: &str = "rules.json";
/// Queue snapshot file name inside a state directory.
pub const QUEUE_FILE: &str = "queue.json";
/// Version seeded when neither the cache nor the cloud has provided rules.
pub const DEFAULT_RULE_VERSION: &str = "0.0.0";

/// Point-in-time view of the whole engine.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineStatus {
    pub connection: ConnectionState,
    pub staleness: StalenessWarning,
    pub rule_version: Option<RuleVersion>,
    pub queue: QueueStats,
}

struct DrainTask {
    scheduler: DrainScheduler,
    handle: JoinHandle<()>,
}

/// Offline-first sync engine for one edge agent.
pub struct EdgeSyncEngine {
    /// Shared configuration.
    config: Arc<SyncConfig>,
    /// Event bus shared by all components.
    events: EventBus,
    monitor: Arc<ConnectivityMonitor>,
    updater: Arc<RuleUpdater>,
    queue: Arc<DeliveryQueue>,
    /// Where the queue is persisted, if anywhere.
    queue_store: Option<QueueStore>,
    /// Held for the engine's lifetime when opened over a state directory.
    _state_lock: Option<StateDirLock>,
    initial_rule_version: String,
    /// Set once the snapshot and rule cache have been loaded.
    state_loaded: tokio::sync::Mutex<bool>,
    started: AtomicBool,
    drain: Mutex<Option<DrainTask>>,
}

impl EdgeSyncEngine {
    /// Create an engine over the given cloud client and rule cache.
    ///
    /// # Errors
    /// Returns `Error::Config` if the configuration is invalid.
    pub fn new(
        config: SyncConfig,
        client: Arc<dyn CloudClient>,
        cache: Arc<dyn RuleCache>,
    ) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);
        let events = EventBus::new();

        let monitor = Arc::new(ConnectivityMonitor::new(
            config.clone(),
            client.clone(),
            events.clone(),
        ));
        let updater = Arc::new(RuleUpdater::new(
            config.clone(),
            client,
            cache,
            events.clone(),
        ));
        updater.add_observer(monitor.clone());
        let queue = Arc::new(DeliveryQueue::new(config.clone(), events.clone()));

        Ok(Self {
            config,
            events,
            monitor,
            updater,
            queue,
            queue_store: None,
            _state_lock: None,
            initial_rule_version: DEFAULT_RULE_VERSION.to_string(),
            state_loaded: tokio::sync::Mutex::new(false),
            started: AtomicBool::new(false),
            drain: Mutex::new(None),
        })
    }

    /// Create an engine talking HTTPS to the configured cloud, keeping its
    /// rule cache and queue snapshot in `state_dir`.
    ///
    /// The directory stays locked until the engine is dropped.
    ///
    /// # Errors
    /// Returns `Error::StateLocked` if another engine has `state_dir` open.
    pub fn open(config: SyncConfig, state_dir: impl AsRef<Path>) -> Result<Self> {
        let state_dir = state_dir.as_ref();
        let lock = StateDirLock::acquire(state_dir)?;
        let client = Arc::new(HttpCloudClient::new(&config)?);
        let cache = Arc::new(FileRuleCache::new(state_dir.join(RULES_FILE)));
        let store = QueueStore::new(state_dir.join(QUEUE_FILE));
        let mut engine = Self::new(config, client, cache)?.with_queue_store(store);
        engine._state_lock = Some(lock);
        Ok(engine)
    }

    /// Persist the queue in `store`.
    pub fn with_queue_store(mut self, store: QueueStore) -> Self {
        self.queue_store = Some(store);
        self
    }

    /// Placeholder version used when no rules are available at startup.
    pub fn with_initial_rule_version(mut self, version: impl Into<String>) -> Self {
        self.initial_rule_version = version.into();
        self
    }

    /// Restore persisted state and start the background loops.
    ///
    /// The queue snapshot and rule cache are loaded before any timer starts.
    /// Without a `transport` queued items are kept but never delivered.
    ///
    /// # Errors
    /// Returns an error if the queue snapshot cannot be read.
    pub async fn start(&self, transport: Option<Arc<dyn BatchTransport>>) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            warn!("Sync engine already started");
            return Ok(());
        }

        if let Err(e) = self.load_state().await {
            self.started.store(false, Ordering::SeqCst);
            return Err(e);
        }

        self.monitor.start();
        self.updater.start();

        if let Some(transport) = transport {
            let (scheduler, handle) = DrainScheduler::new(&self.config, self.queue_store.clone());
            let handle = tokio::spawn(handle.run(self.queue.clone(), transport));
            *self.drain.lock() = Some(DrainTask { scheduler, handle });
        }

        info!("Sync engine started");
        Ok(())
    }

    /// Import the queue snapshot and load the rule cache, seeding the
    /// placeholder version when there are no usable cached rules.
    ///
    /// Runs once; later calls return immediately.
    pub async fn load_state(&self) -> Result<()> {
        let mut loaded = self.state_loaded.lock().await;
        if *loaded {
            return Ok(());
        }

        if let Some(store) = &self.queue_store {
            let items = store.load().await?;
            self.queue.import(items).await;
        }

        match self.updater.load_from_cache().await {
            Ok(Some(version)) => info!("Loaded cached rules {}", version),
            Ok(None) => {
                self.updater
                    .initialize_with_defaults(&self.initial_rule_version)
                    .await;
            }
            Err(e) => {
                error!("Failed to read rule cache: {}", e);
                self.updater
                    .initialize_with_defaults(&self.initial_rule_version)
                    .await;
            }
        }

        *loaded = true;
        Ok(())
    }

    /// Stop every loop and persist the queue.
    ///
    /// A batch or poll already in progress completes first. Does nothing if
    /// the engine is not running.
    pub async fn shutdown(&self) -> Result<()> {
        if !self.started.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        let drain = self.drain.lock().take();
        if let Some(drain) = drain {
            drain.scheduler.shutdown().await;
            if let Err(e) = drain.handle.await {
                error!("Drain task failed: {}", e);
            }
        }

        self.updater.stop().await;
        self.monitor.stop().await;
        self.persist_queue().await?;

        info!("Sync engine stopped");
        Ok(())
    }

    /// Queue an item and persist the queue.
    ///
    /// Persisted state is loaded first if that has not happened yet, so the
    /// write never replaces a snapshot that was not imported.
    pub async fn enqueue(
        &self,
        item_type: QueueItemType,
        payload: Value,
        options: EnqueueOptions,
    ) -> Result<String> {
        self.load_state().await?;
        let id = self.queue.enqueue(item_type, payload, options).await;
        self.persist_queue().await?;
        Ok(id)
    }

    /// Deliver one batch now.
    ///
    /// # Errors
    /// Returns `Error::NotRunning` unless the engine was started with a transport.
    pub async fn flush(&self) -> Result<BatchReport> {
        let scheduler = self
            .drain
            .lock()
            .as_ref()
            .map(|d| d.scheduler.clone())
            .ok_or(Error::NotRunning("drain scheduler"))?;
        scheduler.flush().await
    }

    pub async fn status(&self) -> EngineStatus {
        EngineStatus {
            connection: self.monitor.get_state().await,
            staleness: self.monitor.get_staleness_warning().await,
            rule_version: self.updater.current_version().await,
            queue: self.queue.get_stats().await,
        }
    }

    async fn persist_queue(&self) -> Result<()> {
        if let Some(store) = &self.queue_store {
            store.save_with(|| self.queue.export()).await?;
        }
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn monitor(&self) -> &Arc<ConnectivityMonitor> {
        &self.monitor
    }

    pub fn updater(&self) -> &Arc<RuleUpdater> {
        &self.updater
    }

    pub fn queue(&self) -> &Arc<DeliveryQueue> {
        &self.queue
    }

    /// Register a listener for events from every component.
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&SyncEvent) + Send + Sync + 'static,
    {
        self.events.subscribe(listener)
    }
}
