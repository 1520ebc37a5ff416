//! Cloud control-plane client.
//!
//! [`CloudClient`] is the seam the monitor and updater talk through;
//! [`HttpCloudClient`] implements it over plain HTTPS so it passes hospital
//! firewalls that block WebSockets.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use std::time::{Duration, Instant};
use tracing::debug;

use edgesync_common::{Error, Result, RuleUpdate, SyncConfig};

const HEALTH_PATH: &str = "/health";
const RULES_POLL_PATH: &str = "/api/rules/poll";

/// Outcome of a single health probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// 2xx response.
    Healthy { latency: Duration },
    /// The server answered, but not with success.
    ServerError { status: u16, latency: Duration },
    /// No response: timeout, DNS failure, refused connection.
    Unreachable { reason: String },
}

/// Response to a rule long poll.
#[derive(Debug, Clone, PartialEq)]
pub enum PollResponse {
    /// The cloud has a newer rule set.
    Update(RuleUpdate),
    /// Nothing new before the server or client timeout.
    NoChange,
}

/// Operations the engine needs from the cloud.
#[async_trait]
pub trait CloudClient: Send + Sync {
    /// Probe the health endpoint. Never fails; failures are outcomes.
    async fn check_health(&self, timeout: Duration) -> ProbeOutcome;

    /// Long-poll for a rule update newer than `current_version`.
    ///
    /// # Errors
    /// - Network failures other than timeouts
    /// - Non-success responses other than "no change"
    /// - Malformed response bodies
    async fn poll_rules(
        &self,
        current_version: Option<&str>,
        timeout: Duration,
    ) -> Result<PollResponse>;
}

/// [`CloudClient`] over HTTPS.
pub struct HttpCloudClient {
    http: Client,
    health_url: String,
    poll_url: String,
}

impl HttpCloudClient {
    /// Create a client for the configured cloud.
    pub fn new(config: &SyncConfig) -> Result<Self> {
        let http = Client::builder()
            .user_agent(concat!("EdgeSync/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::Config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http,
            health_url: config.endpoint(HEALTH_PATH),
            poll_url: config.endpoint(RULES_POLL_PATH),
        })
    }
}

#[async_trait]
impl CloudClient for HttpCloudClient {
    async fn check_health(&self, timeout: Duration) -> ProbeOutcome {
        let start = Instant::now();
        let result = self
            .http
            .get(&self.health_url)
            .timeout(timeout)
            .send()
            .await;

        match result {
            Ok(response) => {
                let latency = start.elapsed();
                let status = response.status();
                if status.is_success() {
                    ProbeOutcome::Healthy { latency }
                } else {
                    ProbeOutcome::ServerError {
                        status: status.as_u16(),
                        latency,
                    }
                }
            }
            Err(e) => ProbeOutcome::Unreachable {
                reason: describe_error(&e),
            },
        }
    }

    async fn poll_rules(
        &self,
        current_version: Option<&str>,
        timeout: Duration,
    ) -> Result<PollResponse> {
        let response = match self
            .http
            .get(&self.poll_url)
            .query(&[("currentVersion", current_version.unwrap_or("none"))])
            .timeout(timeout)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) if e.is_timeout() => {
                debug!("Rule long poll timed out without changes");
                return Ok(PollResponse::NoChange);
            }
            Err(e) => return Err(Error::Network(describe_error(&e))),
        };

        let status = response.status();
        if status == StatusCode::NOT_MODIFIED || status == StatusCode::NO_CONTENT {
            return Ok(PollResponse::NoChange);
        }
        if !status.is_success() {
            return Err(Error::Server {
                status: status.as_u16(),
            });
        }

        match response.json::<RuleUpdate>().await {
            Ok(update) => Ok(PollResponse::Update(update)),
            Err(e) if e.is_timeout() => Ok(PollResponse::NoChange),
            Err(e) if e.is_decode() => Err(Error::Serialization(format!(
                "Malformed rule update: {}",
                e
            ))),
            Err(e) => Err(Error::Network(describe_error(&e))),
        }
    }
}

fn describe_error(err: &reqwest::Error) -> String {
    if err.is_timeout() {
        "request timed out".to_string()
    } else if err.is_connect() {
        format!("connection failed: {}", err)
    } else {
        err.to_string()
    }
}
