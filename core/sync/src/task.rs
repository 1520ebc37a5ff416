//! Periodic background tasks with cooperative cancellation.

use parking_lot::Mutex;
use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

/// A spawned loop that runs `tick` immediately and then every `period`.
///
/// Ticks never overlap. Cancellation is only observed between ticks, so a
/// tick that has started always runs to completion.
pub struct PeriodicTask {
    name: &'static str,
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl PeriodicTask {
    /// Spawn the loop on the current runtime.
    pub fn spawn<F, Fut>(name: &'static str, period: Duration, mut tick: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let token = CancellationToken::new();
        let cancelled = token.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            debug!("{} loop started (every {:?})", name, period);

            loop {
                tokio::select! {
                    biased;
                    _ = cancelled.cancelled() => break,
                    _ = ticker.tick() => tick().await,
                }
            }

            debug!("{} loop stopped", name);
        });

        Self {
            name,
            token,
            handle,
        }
    }

    /// Cancel the loop and wait for the current tick to finish.
    pub async fn stop(self) {
        self.token.cancel();
        if let Err(e) = self.handle.await {
            if e.is_panic() {
                error!("{} loop panicked: {}", self.name, e);
            }
        }
    }
}

/// Holder for at most one running [`PeriodicTask`].
#[derive(Default)]
pub struct TaskSlot {
    task: Mutex<Option<PeriodicTask>>,
}

impl TaskSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check if a task is running.
    pub fn is_running(&self) -> bool {
        self.task.lock().is_some()
    }

    /// Spawn a task unless one is already running. Returns whether it spawned.
    pub fn start_with(&self, spawn: impl FnOnce() -> PeriodicTask) -> bool {
        let mut slot = self.task.lock();
        if slot.is_some() {
            return false;
        }
        *slot = Some(spawn());
        true
    }

    /// Stop the running task, if any. Idempotent.
    pub async fn stop(&self) {
        let task = self.task.lock().take();
        if let Some(task) = task {
            task.stop().await;
        }
    }
}
