//! Artifact builder

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info};

use crate::deploy::channel::run_process;
use crate::errors::DeployError;
use crate::models::artifact::{Artifact, BuildDescriptor, ImageName, SourceRef};
use crate::utils::sha256_parts;

/// Image label carrying the build-input fingerprint
pub const FINGERPRINT_LABEL: &str = "io.shipwright.fingerprint";

/// Image label carrying the source revision
pub const REVISION_LABEL: &str = "io.shipwright.revision";

/// Produces immutable artifacts from source
#[async_trait]
pub trait ArtifactBuilder: Send + Sync {
    /// Build `source` with `descriptor` and tag the result `version_tag`.
    /// Any failure is a [`DeployError::Build`].
    async fn build(
        &self,
        source: &SourceRef,
        descriptor: &BuildDescriptor,
        version_tag: &str,
    ) -> Result<Artifact, DeployError>;

    /// A previously built artifact with identical inputs, if one exists
    async fn cached(
        &self,
        source: &SourceRef,
        descriptor: &BuildDescriptor,
        version_tag: &str,
    ) -> Result<Option<Artifact>, DeployError>;
}

/// Fingerprint of the build inputs, `None` when the source has no revision
pub async fn fingerprint(
    source: &SourceRef,
    descriptor: &BuildDescriptor,
) -> Result<Option<String>, DeployError> {
    let Some(revision) = &source.revision else {
        return Ok(None);
    };
    let dockerfile = tokio::fs::read(&descriptor.dockerfile).await.map_err(|e| {
        DeployError::Build(format!(
            "cannot read build descriptor {}: {}",
            descriptor.dockerfile.display(),
            e
        ))
    })?;
    let platform = descriptor.platform.clone().unwrap_or_default();
    let args = serde_json::to_vec(&descriptor.build_args)?;
    Ok(Some(sha256_parts([
        revision.as_bytes(),
        dockerfile.as_slice(),
        platform.as_bytes(),
        args.as_slice(),
    ])))
}

/// Commit hash of the git checkout at `context`, or `None` when it is not
/// a git checkout or has uncommitted changes (such a tree is not a
/// reproducible build input)
pub async fn detect_revision(context: &Path, timeout: Duration) -> Option<String> {
    let git = |args: &[&str]| {
        let mut argv = vec!["-C".to_string(), context.display().to_string()];
        argv.extend(args.iter().map(|a| a.to_string()));
        argv
    };

    let head = run_process("git", &git(&["rev-parse", "HEAD"]), None, timeout)
        .await
        .ok()
        .filter(|out| out.success())?;
    let status = run_process("git", &git(&["status", "--porcelain"]), None, timeout)
        .await
        .ok()
        .filter(|out| out.success())?;
    if !status.stdout.trim().is_empty() {
        debug!("{} has uncommitted changes, not pinning a revision", context.display());
        return None;
    }
    Some(head.stdout.trim().to_string()).filter(|rev| !rev.is_empty())
}

/// Builds images with the local docker CLI
#[derive(Debug, Clone)]
pub struct DockerBuilder {
    image: ImageName,
    build_timeout: Duration,
    command_timeout: Duration,
}

impl DockerBuilder {
    pub fn new(image: ImageName, build_timeout: Duration, command_timeout: Duration) -> Self {
        Self {
            image,
            build_timeout,
            command_timeout,
        }
    }

    /// `docker build` arguments
    pub fn build_args(
        &self,
        source: &SourceRef,
        descriptor: &BuildDescriptor,
        version_tag: &str,
        fingerprint: Option<&str>,
    ) -> Vec<String> {
        let mut args = vec![
            "build".to_string(),
            "--quiet".to_string(),
            "-f".to_string(),
            descriptor.dockerfile.display().to_string(),
            "-t".to_string(),
            self.image.reference(version_tag),
        ];
        if let Some(fp) = fingerprint {
            args.push("--label".to_string());
            args.push(format!("{}={}", FINGERPRINT_LABEL, fp));
        }
        if let Some(revision) = &source.revision {
            args.push("--label".to_string());
            args.push(format!("{}={}", REVISION_LABEL, revision));
        }
        if let Some(platform) = &descriptor.platform {
            args.push("--platform".to_string());
            args.push(platform.clone());
        }
        for (key, value) in &descriptor.build_args {
            args.push("--build-arg".to_string());
            args.push(format!("{}={}", key, value));
        }
        args.push(source.context.display().to_string());
        args
    }

    fn artifact(&self, version_tag: &str, digest: String, fingerprint: Option<String>) -> Artifact {
        Artifact {
            name: self.image.repository_path(),
            version_tag: version_tag.to_string(),
            content_digest: digest,
            fingerprint,
            built_at: Utc::now(),
        }
    }
}

#[async_trait]
impl ArtifactBuilder for DockerBuilder {
    async fn build(
        &self,
        source: &SourceRef,
        descriptor: &BuildDescriptor,
        version_tag: &str,
    ) -> Result<Artifact, DeployError> {
        let fp = fingerprint(source, descriptor).await?;
        let args = self.build_args(source, descriptor, version_tag, fp.as_deref());
        info!("Building {}", self.image.reference(version_tag));

        let output = run_process("docker", &args, None, self.build_timeout)
            .await
            .map_err(|e| DeployError::Build(e.to_string()))?;
        if !output.success() {
            return Err(DeployError::Build(output.stderr));
        }

        let digest = output
            .stdout
            .lines()
            .rev()
            .map(str::trim)
            .find(|l| l.starts_with("sha256:"))
            .ok_or_else(|| {
                DeployError::Build(format!(
                    "docker build did not report an image id: {}",
                    output.stdout
                ))
            })?
            .to_string();

        debug!("Built image {}", digest);
        Ok(self.artifact(version_tag, digest, fp))
    }

    async fn cached(
        &self,
        source: &SourceRef,
        descriptor: &BuildDescriptor,
        version_tag: &str,
    ) -> Result<Option<Artifact>, DeployError> {
        let Some(fp) = fingerprint(source, descriptor).await? else {
            return Ok(None);
        };

        let args = vec![
            "image".to_string(),
            "ls".to_string(),
            "--quiet".to_string(),
            "--no-trunc".to_string(),
            "--filter".to_string(),
            format!("label={}={}", FINGERPRINT_LABEL, fp),
        ];
        let output = run_process("docker", &args, None, self.command_timeout).await?;
        if !output.success() {
            return Err(DeployError::Build(output.stderr));
        }
        let Some(digest) = output.stdout.lines().map(str::trim).find(|l| !l.is_empty()) else {
            return Ok(None);
        };

        // Point the version tag at the cached image so the push publishes it
        let tag_args = vec![
            "tag".to_string(),
            digest.to_string(),
            self.image.reference(version_tag),
        ];
        let tagged = run_process("docker", &tag_args, None, self.command_timeout).await?;
        if !tagged.success() {
            return Err(DeployError::Build(tagged.stderr));
        }

        Ok(Some(self.artifact(version_tag, digest.to_string(), Some(fp))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filesys::dir::Dir;
    use std::collections::BTreeMap;

    fn descriptor(path: std::path::PathBuf) -> BuildDescriptor {
        BuildDescriptor {
            dockerfile: path,
            platform: Some("linux/amd64".into()),
            build_args: BTreeMap::from([("PORT".to_string(), "8501".to_string())]),
        }
    }

    #[tokio::test]
    async fn test_fingerprint_tracks_inputs() {
        let dir = Dir::create_temp_dir("shipwright-fp").await.unwrap();
        let dockerfile = dir.file("Dockerfile");
        dockerfile.write_atomic(b"FROM scratch\n").await.unwrap();
        let desc = descriptor(dockerfile.path().to_path_buf());

        let unpinned = SourceRef {
            context: dir.path().to_path_buf(),
            revision: None,
        };
        assert_eq!(fingerprint(&unpinned, &desc).await.unwrap(), None);

        let pinned = SourceRef {
            context: dir.path().to_path_buf(),
            revision: Some("abc123".into()),
        };
        let first = fingerprint(&pinned, &desc).await.unwrap().unwrap();
        assert_eq!(fingerprint(&pinned, &desc).await.unwrap().unwrap(), first);

        dockerfile.write_atomic(b"FROM alpine\n").await.unwrap();
        let changed = fingerprint(&pinned, &desc).await.unwrap().unwrap();
        assert_ne!(first, changed);

        dir.delete().await.unwrap();
    }

    #[tokio::test]
    async fn test_detect_revision_outside_git_is_none() {
        let dir = Dir::create_temp_dir("shipwright-rev").await.unwrap();
        assert_eq!(detect_revision(dir.path(), Duration::from_secs(5)).await, None);
        dir.delete().await.unwrap();
    }

    #[test]
    fn test_build_args() {
        let builder = DockerBuilder::new(
            ImageName::new("ghcr.io", "acme", "api"),
            Duration::from_secs(600),
            Duration::from_secs(30),
        );
        let source = SourceRef {
            context: ".".into(),
            revision: Some("abc123".into()),
        };
        let args = builder.build_args(&source, &descriptor("Dockerfile".into()), "1.0.0", Some("ff"));
        assert_eq!(
            args,
            vec![
                "build",
                "--quiet",
                "-f",
                "Dockerfile",
                "-t",
                "ghcr.io/acme/api:1.0.0",
                "--label",
                "io.shipwright.fingerprint=ff",
                "--label",
                "io.shipwright.revision=abc123",
                "--platform",
                "linux/amd64",
                "--build-arg",
                "PORT=8501",
                ".",
            ]
        );
    }
}
