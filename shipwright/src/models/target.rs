//! Deployment target models

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Host name that selects the local container runtime instead of SSH
pub const LOCAL_HOST: &str = "local";

/// A remote host able to run one instance per service
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeploymentTarget {
    /// Host address
    pub host: String,

    /// SSH port
    pub port: u16,

    /// SSH user; `None` uses the SSH client's default
    pub user: Option<String>,

    /// Credential reference (SSH identity file). The key material itself is
    /// never read by shipwright.
    pub credential_ref: Option<PathBuf>,
}

impl DeploymentTarget {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: 22,
            user: None,
            credential_ref: None,
        }
    }

    /// Whether commands run against the local runtime
    pub fn is_local(&self) -> bool {
        self.host == LOCAL_HOST
    }

    /// `user@host` or `host`
    pub fn destination(&self) -> String {
        match &self.user {
            Some(user) if !user.is_empty() => format!("{}@{}", user, self.host),
            _ => self.host.clone(),
        }
    }
}

impl fmt::Display for DeploymentTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_local() || self.port == 22 {
            write!(f, "{}", self.destination())
        } else {
            write!(f, "{}:{}", self.destination(), self.port)
        }
    }
}

/// The single instance slot: one service on one target
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SlotKey {
    pub service: String,
    pub host: String,
}

impl SlotKey {
    pub fn new(service: impl Into<String>, target: &DeploymentTarget) -> Self {
        Self {
            service: service.into(),
            host: target.host.clone(),
        }
    }

    /// File-system safe stem, e.g. `api@10.0.0.5`
    pub fn file_stem(&self) -> String {
        format!("{}@{}", sanitize(&self.service), sanitize(&self.host))
    }
}

impl fmt::Display for SlotKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.service, self.host)
    }
}

fn sanitize(s: &str) -> String {
    s.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect()
}
