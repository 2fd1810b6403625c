//! Finite State Machine for a deployment attempt

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::DeployError;

/// Deployment phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Request accepted, nothing started
    Idle,

    /// Building (or resolving a cached) artifact
    Building,

    /// Publishing the artifact tag to the registry
    Pushing,

    /// Pull, stop, remove, run on the target
    Swapping,

    /// Probing the new instance
    Verifying,

    /// New instance verified healthy
    Committed,

    /// Restoring the previous instance
    RollingBack,

    /// Previous instance restored and verified
    RolledBack,

    /// Terminal failure
    Failed,
}

impl Phase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Committed | Phase::RolledBack | Phase::Failed)
    }

    /// Cancellation is only allowed before anything touched the target
    pub fn allows_cancel(&self) -> bool {
        matches!(self, Phase::Idle | Phase::Building | Phase::Pushing)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::Idle => "Idle",
            Phase::Building => "Building",
            Phase::Pushing => "Pushing",
            Phase::Swapping => "Swapping",
            Phase::Verifying => "Verifying",
            Phase::Committed => "Committed",
            Phase::RollingBack => "RollingBack",
            Phase::RolledBack => "RolledBack",
            Phase::Failed => "Failed",
        };
        f.write_str(s)
    }
}

/// Deployment event
#[derive(Debug, Clone)]
pub enum DeploymentEvent {
    /// Deployment requested
    Request,

    /// Artifact available (built, or reused via the fast path)
    Built,

    /// Build failed
    BuildFailed(String),

    /// Operator cancelled before the swap
    Cancelled,

    /// Tag pushed
    Pushed,

    /// Push failed after retries
    PushFailed(String),

    /// Pull, stop, remove and run all succeeded
    Swapped,

    /// A swap sub-step failed
    SwapFailed {
        error: String,
        /// Whether the previous instance had already been stopped or removed
        old_instance_touched: bool,
    },

    /// Health verifier reported healthy
    Healthy,

    /// Health verifier reported unhealthy
    Unhealthy(String),

    /// Previous instance re-run and verified
    Restored,

    /// Rollback re-run or re-verification failed
    RollbackFailed(String),
}

/// A recorded phase change
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseChange {
    pub phase: Phase,
    pub at: DateTime<Utc>,
}

/// Deployment FSM
#[derive(Debug, Clone)]
pub struct DeploymentFsm {
    state: Phase,
    error: Option<String>,
    history: Vec<PhaseChange>,
}

impl DeploymentFsm {
    /// Create a new FSM in idle state
    pub fn new() -> Self {
        Self {
            state: Phase::Idle,
            error: None,
            history: vec![PhaseChange {
                phase: Phase::Idle,
                at: Utc::now(),
            }],
        }
    }

    /// Get current state
    pub fn state(&self) -> Phase {
        self.state
    }

    /// Get the last error message if any
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Every phase visited, in order
    pub fn history(&self) -> &[PhaseChange] {
        &self.history
    }

    /// Whether the attempt ever passed through `phase`
    pub fn visited(&self, phase: Phase) -> bool {
        self.history.iter().any(|c| c.phase == phase)
    }

    /// Process an event and transition state
    pub fn process(&mut self, event: DeploymentEvent) -> Result<Phase, DeployError> {
        let new_state = match (self.state, &event) {
            (Phase::Idle, DeploymentEvent::Request) => Phase::Building,

            // From Building
            (Phase::Building, DeploymentEvent::Built) => Phase::Pushing,
            (Phase::Building, DeploymentEvent::BuildFailed(err)) => {
                self.error = Some(err.clone());
                Phase::Failed
            }

            // From Pushing
            (Phase::Pushing, DeploymentEvent::Pushed) => Phase::Swapping,
            (Phase::Pushing, DeploymentEvent::PushFailed(err)) => {
                self.error = Some(err.clone());
                Phase::Failed
            }

            (Phase::Idle | Phase::Building | Phase::Pushing, DeploymentEvent::Cancelled) => {
                self.error = Some(format!("cancelled during {}", self.state));
                Phase::Failed
            }

            // From Swapping
            (Phase::Swapping, DeploymentEvent::Swapped) => Phase::Verifying,
            (
                Phase::Swapping,
                DeploymentEvent::SwapFailed {
                    error,
                    old_instance_touched,
                },
            ) => {
                self.error = Some(error.clone());
                if *old_instance_touched {
                    Phase::RollingBack
                } else {
                    Phase::Failed
                }
            }

            // From Verifying
            (Phase::Verifying, DeploymentEvent::Healthy) => Phase::Committed,
            (Phase::Verifying, DeploymentEvent::Unhealthy(err)) => {
                self.error = Some(err.clone());
                Phase::RollingBack
            }

            // From RollingBack
            (Phase::RollingBack, DeploymentEvent::Restored) => Phase::RolledBack,
            (Phase::RollingBack, DeploymentEvent::RollbackFailed(err)) => {
                self.error = Some(err.clone());
                Phase::Failed
            }

            // Invalid transitions
            (state, event) => {
                return Err(DeployError::InvalidTransition(format!(
                    "{} -> {:?}",
                    state, event
                )));
            }
        };

        self.state = new_state;
        self.history.push(PhaseChange {
            phase: new_state,
            at: Utc::now(),
        });
        Ok(new_state)
    }
}

impl Default for DeploymentFsm {
    fn default() -> Self {
        Self::new()
    }
}
