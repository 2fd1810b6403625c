//! Terminal report of a deployment attempt

use std::fmt;

use chrono::{DateTime, Utc};
use colored::Colorize;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::deploy::fsm::{Phase, PhaseChange};
use crate::models::artifact::Artifact;
use crate::models::instance::Instance;

pub const EXIT_COMMITTED: i32 = 0;
pub const EXIT_FAILED: i32 = 1;
pub const EXIT_ROLLED_BACK: i32 = 2;
pub const EXIT_IN_FLIGHT: i32 = 3;
pub const EXIT_CONFIG: i32 = 4;

/// Everything the operator needs to know about a finished attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentReport {
    pub attempt_id: Uuid,
    pub service: String,
    pub target: String,
    pub phase: Phase,
    pub last_error: Option<String>,
    /// Stable error class name, see `DeployError::kind`
    pub error_kind: Option<String>,
    /// Artifact the attempt deployed (or tried to)
    pub artifact: Option<Artifact>,
    /// Instance that was active before the swap
    pub previous: Option<Instance>,
    /// Instance actually active now
    pub active: Option<Instance>,
    pub history: Vec<PhaseChange>,
    /// Log lines of the failed instance
    #[serde(default)]
    pub diagnostics: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl DeploymentReport {
    pub fn exit_code(&self) -> i32 {
        match self.phase {
            Phase::Committed => EXIT_COMMITTED,
            Phase::RolledBack => EXIT_ROLLED_BACK,
            _ => EXIT_FAILED,
        }
    }
}

impl fmt::Display for DeploymentReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let phase = match self.phase {
            Phase::Committed => self.phase.to_string().green().bold(),
            Phase::RolledBack => self.phase.to_string().yellow().bold(),
            _ => self.phase.to_string().red().bold(),
        };
        writeln!(f, "{} {} on {}: {}", "deploy".bold(), self.service, self.target, phase)?;
        writeln!(f, "  attempt:  {}", self.attempt_id)?;
        if let Some(artifact) = &self.artifact {
            writeln!(
                f,
                "  artifact: {} ({})",
                artifact.reference(),
                artifact.short_digest()
            )?;
        }
        if let Some(previous) = &self.previous {
            writeln!(f, "  previous: {}", previous)?;
        }
        match &self.active {
            Some(active) => writeln!(f, "  active:   {}", active)?,
            None => writeln!(f, "  active:   {}", "none".dimmed())?,
        }
        if let Some(error) = &self.last_error {
            writeln!(f, "  error:    {}", error.red())?;
        }

        writeln!(f, "  history:")?;
        for change in &self.history {
            writeln!(
                f,
                "    {}  {}",
                change.at.format("%H:%M:%S%.3f"),
                change.phase
            )?;
        }

        if !self.diagnostics.is_empty() {
            writeln!(f, "  last log lines of the failed instance:")?;
            for line in &self.diagnostics {
                writeln!(f, "    | {}", line)?;
            }
        }
        Ok(())
    }
}
