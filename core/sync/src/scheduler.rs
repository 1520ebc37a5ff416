//! Drain scheduling: periodic and on-demand delivery of queued items.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, warn};

use edgesync_common::{Error, Result, SyncConfig};

use crate::queue::{BatchReport, BatchTransport, DeliveryQueue};
use crate::retry::{Backoff, RetryConfig};
use crate::store::QueueStore;

/// Drain request types.
#[derive(Debug)]
pub enum DrainRequest {
    /// Deliver one batch now.
    Flush,
    /// Stop the drain loop.
    Shutdown,
}

type Request = (DrainRequest, oneshot::Sender<BatchReport>);

/// Client side of the drain loop.
#[derive(Clone)]
pub struct DrainScheduler {
    request_tx: mpsc::Sender<Request>,
}

impl DrainScheduler {
    /// Create a scheduler. The returned handle runs the loop.
    ///
    /// When `store` is given, the queue is saved there after every batch.
    pub fn new(config: &SyncConfig, store: Option<QueueStore>) -> (Self, DrainSchedulerHandle) {
        let (request_tx, request_rx) = mpsc::channel(16);

        let handle = DrainSchedulerHandle {
            request_rx,
            flush_interval: config.batch_flush_interval,
            backoff: Backoff::new(RetryConfig::from_sync_config(config)),
            store,
        };

        (Self { request_tx }, handle)
    }

    /// Deliver one batch immediately, bypassing the interval and any backoff.
    pub async fn flush(&self) -> Result<BatchReport> {
        self.request(DrainRequest::Flush).await
    }

    /// Stop the loop once the batch in progress, if any, has finished.
    pub async fn shutdown(&self) {
        if self.request(DrainRequest::Shutdown).await.is_err() {
            debug!("Drain scheduler already stopped");
        }
    }

    async fn request(&self, request: DrainRequest) -> Result<BatchReport> {
        let (response_tx, response_rx) = oneshot::channel();

        self.request_tx
            .send((request, response_tx))
            .await
            .map_err(|_| Error::NotRunning("drain scheduler"))?;

        response_rx
            .await
            .map_err(|_| Error::NotRunning("drain scheduler"))
    }
}

/// Handle for the drain background task.
pub struct DrainSchedulerHandle {
    request_rx: mpsc::Receiver<Request>,
    flush_interval: Duration,
    backoff: Backoff,
    store: Option<QueueStore>,
}

impl DrainSchedulerHandle {
    /// Run the drain loop until shutdown.
    ///
    /// This should be spawned in a tokio task. A batch in which nothing was
    /// delivered pushes the next periodic drain out with exponential backoff;
    /// any delivery resets it.
    pub async fn run(mut self, queue: Arc<DeliveryQueue>, transport: Arc<dyn BatchTransport>) {
        let mut next_drain = Instant::now() + self.flush_interval;

        info!("Drain scheduler started (every {:?})", self.flush_interval);

        loop {
            tokio::select! {
                request = self.request_rx.recv() => {
                    match request {
                        Some((DrainRequest::Flush, response_tx)) => {
                            debug!("Processing flush request");
                            let report = self.drain(&queue, transport.as_ref()).await;
                            let _ = response_tx.send(report);
                        }
                        Some((DrainRequest::Shutdown, response_tx)) => {
                            info!("Received shutdown request");
                            let _ = response_tx.send(BatchReport::default());
                            break;
                        }
                        None => {
                            debug!("All drain scheduler clients dropped");
                            break;
                        }
                    }
                }

                _ = sleep_until(next_drain) => {
                    self.drain(&queue, transport.as_ref()).await;
                }
            }

            let delay = self.backoff.current_delay().unwrap_or(self.flush_interval);
            next_drain = Instant::now() + delay;
        }

        info!("Drain scheduler stopped");
    }

    async fn drain(&mut self, queue: &DeliveryQueue, transport: &dyn BatchTransport) -> BatchReport {
        let report = queue.process_batch(transport).await;
        if report.attempted == 0 {
            return report;
        }

        if report.made_no_progress() {
            let delay = self.backoff.record_failure();
            warn!(
                "No items delivered ({} consecutive), backing off {:?}",
                self.backoff.failures(),
                delay
            );
        } else {
            self.backoff.reset();
        }

        if let Some(store) = &self.store {
            if let Err(e) = store.save_with(|| queue.export()).await {
                error!("Failed to persist queue to {}: {}", store.path().display(), e);
            }
        }

        report
    }
}
