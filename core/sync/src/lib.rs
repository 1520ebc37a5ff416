//! EdgeSync Sync Engine
//!
//! This module keeps an edge agent working through unreliable connectivity:
//! - Connectivity monitoring and rule staleness warnings
//! - Rule updates over HTTPS long polling with checksum verification
//! - A prioritized outbound delivery queue with bounded retries
//! - Durable snapshots of rules and queued items
//! - Background task coordination

pub mod checksum;
pub mod client;
pub mod connectivity;
pub mod engine;
pub mod queue;
pub mod retry;
pub mod rules;
pub mod scheduler;
pub mod store;
pub mod task;

#[cfg(test)]
pub(crate) mod testing;

// Re-export main types
pub use client::{CloudClient, HttpCloudClient, PollResponse, ProbeOutcome};
pub use connectivity::ConnectivityMonitor;
pub use engine::{EdgeSyncEngine, EngineStatus};
pub use queue::{
    default_priority, BatchReport, BatchResult, BatchTransport, DeliveryQueue, EnqueueOptions,
    FailureDisposition, ItemOutcome, ItemResult, QueueStats,
};
pub use retry::{Backoff, RetryConfig};
pub use rules::{PollOutcome, RuleUpdater, RuleVersionObserver};
pub use scheduler::{DrainRequest, DrainScheduler, DrainSchedulerHandle};
pub use store::{
    FileRuleCache, MemoryRuleCache, QueueSnapshot, QueueStore, RuleCache, StateDirLock,
};
