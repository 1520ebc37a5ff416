//! Scripted cloud client for exercising the engine without a network.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use edgesync_common::{Result, RuleSet, RuleUpdate, RuleVersion};

use crate::checksum;
use crate::client::{CloudClient, PollResponse, ProbeOutcome};

/// A [`CloudClient`] that replays queued responses.
///
/// When a script runs dry, health probes report healthy and polls report no
/// change.
#[derive(Default)]
pub struct ScriptedCloudClient {
    health: Mutex<VecDeque<ProbeOutcome>>,
    polls: Mutex<VecDeque<Result<PollResponse>>>,
    poll_delay: Option<Duration>,
    health_calls: AtomicUsize,
    polled_versions: Mutex<Vec<Option<String>>>,
}

impl ScriptedCloudClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every poll response, to simulate a long poll.
    pub fn with_poll_delay(mut self, delay: Duration) -> Self {
        self.poll_delay = Some(delay);
        self
    }

    /// Queue the outcome of the next unscripted health probe.
    pub fn push_health(&self, outcome: ProbeOutcome) {
        self.health.lock().push_back(outcome);
    }

    /// Queue the response to the next unscripted poll.
    pub fn push_poll(&self, response: Result<PollResponse>) {
        self.polls.lock().push_back(response);
    }

    pub fn health_calls(&self) -> usize {
        self.health_calls.load(Ordering::SeqCst)
    }

    pub fn poll_calls(&self) -> usize {
        self.polled_versions.lock().len()
    }

    /// The `current_version` sent with each poll, in order.
    pub fn polled_versions(&self) -> Vec<Option<String>> {
        self.polled_versions.lock().clone()
    }
}

#[async_trait]
impl CloudClient for ScriptedCloudClient {
    async fn check_health(&self, _timeout: Duration) -> ProbeOutcome {
        self.health_calls.fetch_add(1, Ordering::SeqCst);
        self.health
            .lock()
            .pop_front()
            .unwrap_or(ProbeOutcome::Healthy {
                latency: Duration::from_millis(1),
            })
    }

    async fn poll_rules(
        &self,
        current_version: Option<&str>,
        _timeout: Duration,
    ) -> Result<PollResponse> {
        self.polled_versions
            .lock()
            .push(current_version.map(str::to_string));
        if let Some(delay) = self.poll_delay {
            tokio::time::sleep(delay).await;
        }
        self.polls
            .lock()
            .pop_front()
            .unwrap_or(Ok(PollResponse::NoChange))
    }
}

/// Build an update whose declared checksum matches its rules.
pub fn sealed_update(version: &str, timestamp: DateTime<Utc>, rules: RuleSet) -> RuleUpdate {
    let checksum = checksum::compute(&rules).unwrap();
    RuleUpdate {
        version: RuleVersion::new(version, timestamp, checksum),
        rules,
        changelog: Some(format!("rules {}", version)),
    }
}
