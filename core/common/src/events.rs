//! Typed events and the fan-out bus every component publishes through.
//!
//! Listeners are plain callbacks. Each one runs isolated: a panicking listener
//! is logged and skipped, and neither other listeners nor the emitting
//! component notice. Async consumers can take a broadcast receiver instead.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::broadcast;
use tracing::error;

use crate::types::{
    ConnectionState, ConnectionStatus, QueueItemType, RuleVersion, StalenessWarning,
};

/// Capacity of the broadcast channel handed to async consumers.
const BROADCAST_CAPACITY: usize = 256;

/// Component-specific event payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncEventKind {
    ConnectionChanged {
        previous: ConnectionStatus,
        current: ConnectionStatus,
        state: ConnectionState,
    },
    RulesUpdated {
        version: RuleVersion,
        previous: Option<RuleVersion>,
        changelog: Option<String>,
    },
    RulesStale {
        warning: StalenessWarning,
    },
    QueueItemAdded {
        id: String,
        item_type: QueueItemType,
        priority: u32,
    },
    QueueItemSynced {
        id: String,
        item_type: QueueItemType,
        attempts: u32,
    },
    /// An item was permanently removed without delivery.
    QueueItemDropped {
        id: String,
        item_type: QueueItemType,
        attempts: u32,
        error: String,
    },
}

impl SyncEventKind {
    /// Wire name of the event.
    pub fn name(&self) -> &'static str {
        match self {
            SyncEventKind::ConnectionChanged { .. } => "connection_changed",
            SyncEventKind::RulesUpdated { .. } => "rules_updated",
            SyncEventKind::RulesStale { .. } => "rules_stale",
            SyncEventKind::QueueItemAdded { .. } => "queue_item_added",
            SyncEventKind::QueueItemSynced { .. } => "queue_item_synced",
            SyncEventKind::QueueItemDropped { .. } => "queue_item_dropped",
        }
    }
}

/// A timestamped event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncEvent {
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: SyncEventKind,
}

impl SyncEvent {
    pub fn new(kind: SyncEventKind) -> Self {
        Self {
            timestamp: Utc::now(),
            kind,
        }
    }
}

/// Callback invoked for every emitted event.
pub type EventListener = Arc<dyn Fn(&SyncEvent) + Send + Sync>;

struct BusInner {
    listeners: RwLock<Vec<(u64, EventListener)>>,
    next_id: AtomicU64,
    sender: broadcast::Sender<SyncEvent>,
}

/// Event fan-out shared by the monitor, updater and queue.
///
/// Cloning yields another handle to the same bus.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    /// Create a bus with no listeners.
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            inner: Arc::new(BusInner {
                listeners: RwLock::new(Vec::new()),
                next_id: AtomicU64::new(0),
                sender,
            }),
        }
    }

    /// Register a listener. Keep the returned handle to unsubscribe later.
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&SyncEvent) + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.listeners.write().push((id, Arc::new(listener)));
        Subscription {
            bus: Arc::downgrade(&self.inner),
            id,
        }
    }

    /// Receive events on an async channel.
    ///
    /// Slow receivers lag and lose the oldest events rather than block emitters.
    pub fn receiver(&self) -> broadcast::Receiver<SyncEvent> {
        self.inner.sender.subscribe()
    }

    /// Number of registered callback listeners.
    pub fn listener_count(&self) -> usize {
        self.inner.listeners.read().len()
    }

    /// Emit an event to every listener and receiver.
    pub fn emit(&self, kind: SyncEventKind) {
        let event = SyncEvent::new(kind);

        // Snapshot so listeners may (un)subscribe from inside a callback.
        let listeners: Vec<EventListener> = self
            .inner
            .listeners
            .read()
            .iter()
            .map(|(_, l)| l.clone())
            .collect();

        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(&event))).is_err() {
                error!("Event listener panicked while handling {}", event.kind.name());
            }
        }

        // No receivers is fine.
        let _ = self.inner.sender.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("listeners", &self.listener_count())
            .finish()
    }
}

/// Handle returned by [`EventBus::subscribe`].
pub struct Subscription {
    bus: Weak<BusInner>,
    id: u64,
}

impl Subscription {
    /// Remove the listener. Safe to call after the bus is gone.
    pub fn unsubscribe(self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.listeners.write().retain(|(id, _)| *id != self.id);
        }
    }
}
