//! Health verifier
//!
//! Polls the service's liveness endpoint on the target until it answers with
//! a success status or the timeout elapses. Every individual probe is capped
//! so the verifier never runs past `timeout + poll_interval`.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use url::Url;

use crate::errors::DeployError;
use crate::models::target::DeploymentTarget;

/// Single health probe against an endpoint
#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// `Ok` when the endpoint reports ready, otherwise a description of
    /// what went wrong
    async fn probe(&self, endpoint: &Url, timeout: Duration) -> Result<(), String>;
}

/// Probe over HTTP(S); any 2xx is healthy
#[derive(Debug, Clone, Default)]
pub struct HttpProbe {
    client: reqwest::Client,
}

impl HttpProbe {
    pub fn new() -> Result<Self, DeployError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("shipwright/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HealthProbe for HttpProbe {
    async fn probe(&self, endpoint: &Url, timeout: Duration) -> Result<(), String> {
        let response = self
            .client
            .get(endpoint.clone())
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| e.to_string())?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(format!("{} returned {}", endpoint, status))
        }
    }
}

/// Where and how long to probe
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheck {
    pub scheme: String,
    pub port: u16,
    pub path: String,
    pub timeout: Duration,
    pub poll_interval: Duration,
    /// Bound for the re-verification of a restored instance
    pub rollback_timeout: Duration,
}

impl Default for HealthCheck {
    fn default() -> Self {
        Self {
            scheme: "http".to_string(),
            port: 8080,
            path: "/health".to_string(),
            timeout: Duration::from_secs(30),
            poll_interval: Duration::from_secs(5),
            rollback_timeout: Duration::from_secs(15),
        }
    }
}

impl HealthCheck {
    /// Endpoint URL on `target`
    pub fn endpoint(&self, target: &DeploymentTarget) -> Result<Url, DeployError> {
        let host = if target.is_local() {
            "127.0.0.1"
        } else {
            target.host.as_str()
        };
        let mut url = Url::parse(&format!("{}://{}", self.scheme, host))
            .map_err(|e| DeployError::Config(format!("invalid health endpoint host '{}': {}", host, e)))?;
        url.set_port(Some(self.port))
            .map_err(|_| DeployError::Config(format!("cannot set port {} on {}", self.port, url)))?;
        url.set_path(&self.path);
        Ok(url)
    }
}

/// Outcome of a verification run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy { polls: u32 },
    Unhealthy { last_error: String, polls: u32 },
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthStatus::Healthy { .. })
    }

    pub fn polls(&self) -> u32 {
        match self {
            HealthStatus::Healthy { polls } | HealthStatus::Unhealthy { polls, .. } => *polls,
        }
    }

    /// The matching error for an unhealthy outcome
    pub fn into_error(self, endpoint: &Url) -> Option<DeployError> {
        match self {
            HealthStatus::Healthy { .. } => None,
            HealthStatus::Unhealthy { last_error, .. } => Some(DeployError::HealthCheckTimeout {
                endpoint: endpoint.to_string(),
                last_error,
            }),
        }
    }
}

/// Poll `endpoint` every `poll_interval` until it is healthy or `timeout`
/// has elapsed.
///
/// A poll is only started when it can begin before the deadline, and each
/// probe is bounded by the smaller of the interval and the remaining time.
pub async fn verify(
    probe: &dyn HealthProbe,
    endpoint: &Url,
    timeout: Duration,
    poll_interval: Duration,
) -> HealthStatus {
    let deadline = Instant::now() + timeout;
    let poll_interval = poll_interval.max(Duration::from_millis(1));
    let mut polls = 0;
    let mut last_error = String::from("endpoint was never probed");

    loop {
        let poll_started = Instant::now();
        let remaining = deadline.saturating_duration_since(poll_started);
        if remaining.is_zero() {
            break;
        }
        let bound = poll_interval.min(remaining);

        polls += 1;
        match tokio::time::timeout(bound, probe.probe(endpoint, bound)).await {
            Ok(Ok(())) => {
                info!("{} healthy after {} poll(s)", endpoint, polls);
                return HealthStatus::Healthy { polls };
            }
            Ok(Err(e)) => {
                debug!("Poll {} of {} failed: {}", polls, endpoint, e);
                last_error = e;
            }
            Err(_) => {
                debug!("Poll {} of {} timed out after {:?}", polls, endpoint, bound);
                last_error = format!("no response within {:?}", bound);
            }
        }

        let next = poll_started + poll_interval;
        if next >= deadline {
            break;
        }
        tokio::time::sleep_until(next).await;
    }

    warn!(
        "{} not healthy after {} poll(s) in {:?}: {}",
        endpoint, polls, timeout, last_error
    );
    HealthStatus::Unhealthy { last_error, polls }
}
