//! Registry client: push locally, pull on the target

use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use tracing::{debug, info};

use crate::deploy::channel::{run_process, CommandOutput};
use crate::deploy::remote::RemoteExecutor;
use crate::deploy::retry::{with_backoff, RetryPolicy};
use crate::errors::{DeployError, RemoteStep};
use crate::models::artifact::{Artifact, ImageName, PushReceipt};

const AUTH_MARKERS: &[&str] = &[
    "denied",
    "unauthorized",
    "authentication required",
    "no basic auth credentials",
    "forbidden",
];

const NOT_FOUND_MARKERS: &[&str] = &[
    "manifest unknown",
    "not found",
    "repository does not exist",
    "pull access denied",
];

/// Publishes artifacts to an image registry
#[async_trait]
pub trait RegistryClient: Send + Sync {
    /// Point `tag` at the artifact's digest in the registry
    async fn push(&self, artifact: &Artifact, tag: &str) -> Result<PushReceipt, DeployError>;

    /// The image repository this client publishes to
    fn image(&self) -> &ImageName;
}

/// Classify a failed push: credential problems are fatal, the rest transient
pub fn classify_push_failure(image: &ImageName, tag: &str, out: &CommandOutput) -> DeployError {
    let text = out.diagnostic().to_lowercase();
    if AUTH_MARKERS.iter().any(|m| text.contains(m)) {
        DeployError::Auth {
            reference: image.reference(tag),
            namespace: image.namespace_display(),
            message: out.diagnostic().to_string(),
        }
    } else {
        DeployError::Network(format!(
            "push of {} failed: {}",
            image.reference(tag),
            out.diagnostic()
        ))
    }
}

/// A failed `docker tag` ahead of a push
pub fn tag_failure(artifact: &Artifact, reference: &str, out: &CommandOutput) -> DeployError {
    DeployError::Push(format!(
        "cannot tag {} as {}: {}",
        artifact.short_digest(),
        reference,
        out.diagnostic()
    ))
}

/// Classify a failed pull on the target
pub fn classify_pull_failure(reference: &str, namespace: &str, out: &CommandOutput) -> DeployError {
    let text = out.diagnostic().to_lowercase();
    if NOT_FOUND_MARKERS.iter().any(|m| text.contains(m)) {
        DeployError::NotFound {
            reference: reference.to_string(),
            namespace: namespace.to_string(),
        }
    } else if AUTH_MARKERS.iter().any(|m| text.contains(m)) {
        DeployError::Auth {
            reference: reference.to_string(),
            namespace: namespace.to_string(),
            message: out.diagnostic().to_string(),
        }
    } else {
        DeployError::Network(format!("pull of {} failed: {}", reference, out.diagnostic()))
    }
}

/// Registry client driving the local docker CLI
pub struct DockerRegistry {
    image: ImageName,
    username: Option<String>,
    credential: Option<SecretString>,
    push_timeout: Duration,
    command_timeout: Duration,
}

impl DockerRegistry {
    pub fn new(image: ImageName, push_timeout: Duration, command_timeout: Duration) -> Self {
        Self {
            image,
            username: None,
            credential: None,
            push_timeout,
            command_timeout,
        }
    }

    /// Log in with `username` and an externally supplied credential before pushing
    pub fn with_credential(mut self, username: impl Into<String>, credential: SecretString) -> Self {
        self.username = Some(username.into());
        self.credential = Some(credential);
        self
    }

    async fn login(&self, tag: &str) -> Result<(), DeployError> {
        let (Some(username), Some(credential)) = (&self.username, &self.credential) else {
            debug!("No registry credential configured, relying on existing login");
            return Ok(());
        };

        debug!("Authenticating with registry {}", self.image.registry);
        let mut args = vec!["login".to_string()];
        if !self.image.registry.is_empty() {
            args.push(self.image.registry.clone());
        }
        args.extend([
            "--username".to_string(),
            username.clone(),
            "--password-stdin".to_string(),
        ]);
        let out = run_process(
            "docker",
            &args,
            Some(credential.expose_secret().as_bytes()),
            self.command_timeout,
        )
        .await?;
        if out.success() {
            Ok(())
        } else {
            Err(classify_push_failure(&self.image, tag, &out))
        }
    }
}

#[async_trait]
impl RegistryClient for DockerRegistry {
    async fn push(&self, artifact: &Artifact, tag: &str) -> Result<PushReceipt, DeployError> {
        let reference = self.image.reference(tag);
        self.login(tag).await?;

        // Re-point the tag at this exact digest before publishing it
        let tag_args = vec![
            "tag".to_string(),
            artifact.content_digest.clone(),
            reference.clone(),
        ];
        let out = run_process("docker", &tag_args, None, self.command_timeout).await?;
        if !out.success() {
            return Err(tag_failure(artifact, &reference, &out));
        }

        info!("Pushing {}", reference);
        let out = run_process(
            "docker",
            &["push".to_string(), reference.clone()],
            None,
            self.push_timeout,
        )
        .await?;
        if !out.success() {
            return Err(classify_push_failure(&self.image, tag, &out));
        }

        Ok(PushReceipt {
            reference,
            repo_digest: parse_push_digest(&out.stdout),
        })
    }

    fn image(&self) -> &ImageName {
        &self.image
    }
}

/// Pull `digest` from `docker push` output (`<tag>: digest: sha256:... size: N`)
pub fn parse_push_digest(stdout: &str) -> Option<String> {
    stdout.lines().rev().find_map(|line| {
        let (_, rest) = line.split_once("digest: ")?;
        rest.split_whitespace().next().map(str::to_string)
    })
}

/// Wraps a registry client with bounded retries for network failures
pub struct RetryingRegistry<R> {
    inner: R,
    policy: RetryPolicy,
}

impl<R: RegistryClient> RetryingRegistry<R> {
    pub fn new(inner: R, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }
}

#[async_trait]
impl<R: RegistryClient> RegistryClient for RetryingRegistry<R> {
    async fn push(&self, artifact: &Artifact, tag: &str) -> Result<PushReceipt, DeployError> {
        with_backoff(&self.policy, "push", || self.inner.push(artifact, tag)).await
    }

    fn image(&self) -> &ImageName {
        self.inner.image()
    }
}

/// Pull `tag` on the target through its executor, retrying transient
/// failures. The pulled digest must be the one that was pushed.
pub async fn pull_on_target(
    image: &ImageName,
    remote: &dyn RemoteExecutor,
    artifact: &Artifact,
    tag: &str,
    policy: &RetryPolicy,
) -> Result<Artifact, DeployError> {
    let reference = image.reference(tag);
    let namespace = image.namespace_display();
    let digest = with_backoff(policy, "pull", || remote.pull_image(&reference, &namespace)).await?;

    if digest != artifact.content_digest {
        return Err(DeployError::RemoteExec {
            step: RemoteStep::Pull,
            message: format!(
                "{} resolved to {} on the target, expected {}; was the tag re-pushed concurrently?",
                reference, digest, artifact.content_digest
            ),
        });
    }

    Ok(Artifact {
        name: image.repository_path(),
        version_tag: tag.to_string(),
        content_digest: digest,
        fingerprint: artifact.fingerprint.clone(),
        built_at: artifact.built_at,
    })
}
