//! Error types for shipwright

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::deploy::fsm::Phase;

/// Remote sub-step a [`DeployError::RemoteExec`] failed in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RemoteStep {
    Connect,
    Pull,
    Stop,
    Remove,
    Run,
    Inspect,
    Logs,
}

impl fmt::Display for RemoteStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RemoteStep::Connect => "connect",
            RemoteStep::Pull => "pull",
            RemoteStep::Stop => "stop",
            RemoteStep::Remove => "remove",
            RemoteStep::Run => "run",
            RemoteStep::Inspect => "inspect",
            RemoteStep::Logs => "logs",
        };
        f.write_str(s)
    }
}

/// Main error type for shipwright
#[derive(Error, Debug)]
pub enum DeployError {
    #[error("Build failed: {0}")]
    Build(String),

    #[error("Push failed: {0}")]
    Push(String),

    #[error(
        "Registry rejected credentials for {reference}: {message}. \
         Check that the logged-in identity may push to namespace '{namespace}' \
         and that the image name matches that namespace"
    )]
    Auth {
        reference: String,
        namespace: String,
        message: String,
    },

    #[error("Network error: {0}")]
    Network(String),

    #[error(
        "Image {reference} not found in registry namespace '{namespace}'. \
         Was it pushed under a different namespace or tag?"
    )]
    NotFound { reference: String, namespace: String },

    #[error("Remote {step} failed: {message}")]
    RemoteExec { step: RemoteStep, message: String },

    #[error("Health check on {endpoint} timed out: {last_error}")]
    HealthCheckTimeout { endpoint: String, last_error: String },

    #[error("A deployment of '{service}' to {host} is already in flight")]
    AttemptInFlight { service: String, host: String },

    #[error("Deployment cancelled during {0}")]
    Cancelled(Phase),

    #[error("Cannot cancel a deployment in {0}; it must run to completion")]
    CancelRefused(Phase),

    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl DeployError {
    /// Whether the failure is transient and worth retrying with backoff.
    ///
    /// Only network-class errors qualify; everything else is either
    /// deterministic (build, auth, not found) or a policy decision the
    /// orchestrator owns.
    pub fn is_retriable(&self) -> bool {
        matches!(self, DeployError::Network(_))
    }

    /// The remote sub-step this error is tagged with, if any
    pub fn remote_step(&self) -> Option<RemoteStep> {
        match self {
            DeployError::RemoteExec { step, .. } => Some(*step),
            _ => None,
        }
    }

    /// Short stable name used in reports and records
    pub fn kind(&self) -> &'static str {
        match self {
            DeployError::Build(_) => "build",
            DeployError::Push(_) => "push",
            DeployError::Auth { .. } => "auth",
            DeployError::Network(_) => "network",
            DeployError::NotFound { .. } => "not_found",
            DeployError::RemoteExec { .. } => "remote_exec",
            DeployError::HealthCheckTimeout { .. } => "health_check_timeout",
            DeployError::AttemptInFlight { .. } => "attempt_in_flight",
            DeployError::Cancelled(_) => "cancelled",
            DeployError::CancelRefused(_) => "cancel_refused",
            DeployError::InvalidTransition(_) => "invalid_transition",
            DeployError::Config(_) => "config",
            DeployError::Storage(_) => "storage",
            DeployError::Io(_) => "io",
            DeployError::Json(_) => "json",
            DeployError::Http(_) => "http",
        }
    }
}
