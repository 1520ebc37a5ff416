//! Shared model, configuration and event types for the EdgeSync engine.
//!
//! Everything in the sync crate depends on these definitions: connection
//! states, queue item shapes, rule versions, conflict records, the event bus
//! and the tunable timing parameters in [`SyncConfig`].

pub mod config;
pub mod error;
pub mod events;
pub mod types;

pub use config::{ChecksumPolicy, SyncConfig};
pub use error::{Error, Result};
pub use events::{EventBus, EventListener, SyncEvent, SyncEventKind, Subscription};
pub use types::{
    CachedRules, ConflictResolution, ConflictStrategy, ConnectionState, ConnectionStatus,
    QueueItem, QueueItemStatus, QueueItemType, RuleSet, RuleUpdate, RuleVersion,
    StalenessSeverity, StalenessWarning, SyncConflict,
};
