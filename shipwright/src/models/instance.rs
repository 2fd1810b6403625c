//! Running instance models

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::artifact::{short_digest, Artifact};

/// A running container of one artifact on one target
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    pub service_name: String,

    /// Runtime container id
    pub container_id: String,

    /// Image reference the instance was started from (`name:tag`)
    pub artifact_version: String,

    /// Image content digest
    pub artifact_digest: String,

    pub started_at: DateTime<Utc>,
}

impl Instance {
    /// The artifact this instance runs, for re-running it during rollback
    pub fn artifact(&self) -> Artifact {
        let (name, tag) = split_reference(&self.artifact_version);
        Artifact {
            name: name.to_string(),
            version_tag: tag.to_string(),
            content_digest: self.artifact_digest.clone(),
            fingerprint: None,
            built_at: self.started_at,
        }
    }
}

impl fmt::Display for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({} @ {}, started {})",
            self.service_name,
            self.artifact_version,
            short_digest(&self.artifact_digest),
            self.started_at.format("%Y-%m-%d %H:%M:%S UTC")
        )
    }
}

/// Split `name:tag` or `name@digest`, ignoring a `:` that belongs to a
/// registry port. A reference carrying both keeps the tag.
fn split_reference(reference: &str) -> (&str, &str) {
    let (named, digest) = match reference.split_once('@') {
        Some((named, digest)) => (named, Some(digest)),
        None => (reference, None),
    };
    match (named.rsplit_once(':'), digest) {
        (Some((name, tag)), _) if !tag.contains('/') => (name, tag),
        (_, Some(digest)) => (named, digest),
        _ => (named, "latest"),
    }
}

/// Container restart policy
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum RestartPolicy {
    No,
    Always,
    #[default]
    UnlessStopped,
    OnFailure(Option<u32>),
}

impl RestartPolicy {
    /// Value for the runtime's `--restart` flag
    pub fn as_arg(&self) -> String {
        match self {
            RestartPolicy::No => "no".to_string(),
            RestartPolicy::Always => "always".to_string(),
            RestartPolicy::UnlessStopped => "unless-stopped".to_string(),
            RestartPolicy::OnFailure(None) => "on-failure".to_string(),
            RestartPolicy::OnFailure(Some(max)) => format!("on-failure:{}", max),
        }
    }
}

impl std::str::FromStr for RestartPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "no" => Ok(RestartPolicy::No),
            "always" => Ok(RestartPolicy::Always),
            "unless-stopped" => Ok(RestartPolicy::UnlessStopped),
            "on-failure" => Ok(RestartPolicy::OnFailure(None)),
            other => match other.strip_prefix("on-failure:") {
                Some(max) => max
                    .parse()
                    .map(|m| RestartPolicy::OnFailure(Some(m)))
                    .map_err(|_| format!("Invalid restart policy: {}", s)),
                None => Err(format!("Invalid restart policy: {}", s)),
            },
        }
    }
}

impl serde::Serialize for RestartPolicy {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.as_arg())
    }
}

impl<'de> serde::Deserialize<'de> for RestartPolicy {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// How an instance is started: port bindings, environment, restart policy
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSpec {
    /// Port mappings in `host:container` form
    #[serde(default)]
    pub ports: Vec<String>,

    /// Env file path on the target host
    #[serde(default)]
    pub env_file: Option<String>,

    #[serde(default)]
    pub env: BTreeMap<String, String>,

    #[serde(default)]
    pub restart_policy: RestartPolicy,
}
