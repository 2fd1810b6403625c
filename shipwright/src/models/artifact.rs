//! Artifact models

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Fully qualified image repository, e.g. `registry.example.com/team/api`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageName {
    /// Registry host, empty for the runtime's default registry
    pub registry: String,

    /// Namespace (account, organisation or project) inside the registry
    pub namespace: String,

    /// Repository name
    pub repository: String,
}

impl ImageName {
    pub fn new(
        registry: impl Into<String>,
        namespace: impl Into<String>,
        repository: impl Into<String>,
    ) -> Self {
        Self {
            registry: registry.into(),
            namespace: namespace.into(),
            repository: repository.into(),
        }
    }

    /// `registry/namespace/repository` with empty segments dropped
    pub fn repository_path(&self) -> String {
        [&self.registry, &self.namespace, &self.repository]
            .iter()
            .filter(|s| !s.is_empty())
            .map(|s| s.as_str())
            .collect::<Vec<_>>()
            .join("/")
    }

    /// Resolved `name:tag` reference
    pub fn reference(&self, tag: &str) -> String {
        format!("{}:{}", self.repository_path(), tag)
    }

    /// Namespace as shown to the operator (`<default>` when unset)
    pub fn namespace_display(&self) -> String {
        let parts: Vec<&str> = [self.registry.as_str(), self.namespace.as_str()]
            .into_iter()
            .filter(|s| !s.is_empty())
            .collect();
        if parts.is_empty() {
            "<default>".to_string()
        } else {
            parts.join("/")
        }
    }
}

/// Source tree to build from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRef {
    /// Build context directory
    pub context: PathBuf,

    /// Source revision (commit hash or similar). Without one, builds are
    /// never considered reproducible.
    pub revision: Option<String>,
}

/// Build descriptor (Dockerfile plus build parameters)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildDescriptor {
    pub dockerfile: PathBuf,

    #[serde(default)]
    pub platform: Option<String>,

    #[serde(default)]
    pub build_args: BTreeMap<String, String>,
}

/// An immutable built image
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    /// Repository path the artifact is published under
    pub name: String,

    /// Operator or CI supplied label
    pub version_tag: String,

    /// Image content digest (`sha256:...`), the artifact's true identity
    pub content_digest: String,

    /// Fingerprint of the build inputs, if they were reproducible
    #[serde(default)]
    pub fingerprint: Option<String>,

    pub built_at: DateTime<Utc>,
}

impl Artifact {
    /// `name:version_tag`, or `name@digest` when the version is a digest
    pub fn reference(&self) -> String {
        if self.version_tag.starts_with("sha256:") {
            format!("{}@{}", self.name, self.version_tag)
        } else {
            format!("{}:{}", self.name, self.version_tag)
        }
    }

    /// Digest shortened for display
    pub fn short_digest(&self) -> &str {
        short_digest(&self.content_digest)
    }
}

/// Result of a successful push
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushReceipt {
    /// Reference the tag was pushed as
    pub reference: String,

    /// Manifest digest reported by the registry
    pub repo_digest: Option<String>,
}

/// First 12 hex characters of a digest, skipping the algorithm prefix
pub fn short_digest(digest: &str) -> &str {
    let hex = digest.split_once(':').map(|(_, h)| h).unwrap_or(digest);
    &hex[..hex.len().min(12)]
}
