//! Remote executor: container lifecycle commands against one target

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::deploy::channel::{CommandChannel, CommandOutput};
use crate::deploy::registry::classify_pull_failure;
use crate::errors::{DeployError, RemoteStep};
use crate::models::artifact::Artifact;
use crate::models::instance::{Instance, RunSpec};
use crate::models::target::DeploymentTarget;

/// Container label naming the service an instance belongs to
pub const SERVICE_LABEL: &str = "io.shipwright.service";

/// Container label carrying the `name:tag` an instance was started from
pub const VERSION_LABEL: &str = "io.shipwright.version";

const INSPECT_FORMAT: &str = concat!(
    "{{.Id}}|{{index .Config.Labels \"io.shipwright.version\"}}|",
    "{{.Image}}|{{.State.StartedAt}}|{{.Config.Image}}"
);

/// The fixed command vocabulary run against one deployment target
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    /// Pull `reference` on the target and return its content digest
    async fn pull_image(&self, reference: &str, namespace: &str) -> Result<String, DeployError>;

    /// Stop the service's instance. No-op if nothing is running.
    async fn stop_instance(&self, service: &str) -> Result<(), DeployError>;

    /// Remove the service's instance. No-op if none exists.
    async fn remove_instance(&self, service: &str) -> Result<(), DeployError>;

    /// Start `artifact` as the service's instance
    async fn run_instance(
        &self,
        service: &str,
        artifact: &Artifact,
        spec: &RunSpec,
    ) -> Result<Instance, DeployError>;

    /// Running instances of the service, newest first
    async fn list_running(&self, service: &str) -> Result<Vec<Instance>, DeployError>;

    /// Last `lines` lines of the service's output
    async fn tail_logs(&self, service: &str, lines: usize) -> Result<Vec<String>, DeployError>;

    /// The target this executor is bound to
    fn target(&self) -> &DeploymentTarget;
}

/// Remote executor driving the docker CLI through a [`CommandChannel`]
pub struct DockerRemote {
    channel: Arc<dyn CommandChannel>,
    target: DeploymentTarget,
    command_timeout: Duration,
    pull_timeout: Duration,
}

impl DockerRemote {
    pub fn new(
        channel: Arc<dyn CommandChannel>,
        target: DeploymentTarget,
        command_timeout: Duration,
        pull_timeout: Duration,
    ) -> Self {
        Self {
            channel,
            target,
            command_timeout,
            pull_timeout,
        }
    }

    async fn docker(
        &self,
        step: RemoteStep,
        args: &[&str],
        timeout: Duration,
    ) -> Result<CommandOutput, DeployError> {
        let mut argv = Vec::with_capacity(args.len() + 1);
        argv.push("docker".to_string());
        argv.extend(args.iter().map(|a| a.to_string()));
        debug!("[{}] {}", self.channel.describe(), argv.join(" "));

        self.channel
            .exec(&argv, timeout)
            .await
            .map_err(|e| match e {
                // Transport failures become step-tagged so the orchestrator
                // knows how far the swap progressed
                DeployError::Network(message) if step != RemoteStep::Pull => {
                    DeployError::RemoteExec { step, message }
                }
                other => other,
            })
    }

    async fn ids(&self, filter: &str) -> Result<Vec<String>, DeployError> {
        let out = self
            .docker(
                RemoteStep::Inspect,
                &["ps", "--quiet", "--no-trunc", "--filter", filter],
                self.command_timeout,
            )
            .await?;
        if !out.success() {
            return Err(remote_error(RemoteStep::Inspect, &out));
        }
        Ok(out
            .stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }
}

#[async_trait]
impl RemoteExecutor for DockerRemote {
    async fn pull_image(&self, reference: &str, namespace: &str) -> Result<String, DeployError> {
        info!("Pulling {} on {}", reference, self.target);
        let out = self
            .docker(RemoteStep::Pull, &["pull", reference], self.pull_timeout)
            .await?;
        if !out.success() {
            return Err(classify_pull_failure(reference, namespace, &out));
        }

        let out = self
            .docker(
                RemoteStep::Pull,
                &["image", "inspect", "--format", "{{.Id}}", reference],
                self.command_timeout,
            )
            .await?;
        if !out.success() {
            return Err(remote_error(RemoteStep::Pull, &out));
        }
        Ok(out.stdout.trim().to_string())
    }

    async fn stop_instance(&self, service: &str) -> Result<(), DeployError> {
        let out = self
            .docker(RemoteStep::Stop, &["stop", service], self.command_timeout)
            .await?;
        if out.success() || is_missing_container(&out) {
            return Ok(());
        }
        Err(remote_error(RemoteStep::Stop, &out))
    }

    async fn remove_instance(&self, service: &str) -> Result<(), DeployError> {
        let out = self
            .docker(RemoteStep::Remove, &["rm", service], self.command_timeout)
            .await?;
        if out.success() || is_missing_container(&out) {
            return Ok(());
        }
        Err(remote_error(RemoteStep::Remove, &out))
    }

    async fn run_instance(
        &self,
        service: &str,
        artifact: &Artifact,
        spec: &RunSpec,
    ) -> Result<Instance, DeployError> {
        let args = run_args(service, artifact, spec);
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        let out = self
            .docker(RemoteStep::Run, &args, self.command_timeout)
            .await?;
        if !out.success() {
            return Err(remote_error(RemoteStep::Run, &out));
        }

        let container_id = out.stdout.lines().last().unwrap_or_default().trim().to_string();
        info!(
            "Started {} as {} on {}",
            artifact.reference(),
            service,
            self.target
        );
        Ok(Instance {
            service_name: service.to_string(),
            container_id,
            artifact_version: artifact.reference(),
            artifact_digest: artifact.content_digest.clone(),
            started_at: Utc::now(),
        })
    }

    async fn list_running(&self, service: &str) -> Result<Vec<Instance>, DeployError> {
        let mut ids: BTreeSet<String> = BTreeSet::new();
        ids.extend(self.ids(&format!("label={}={}", SERVICE_LABEL, service)).await?);
        ids.extend(self.ids(&format!("name=^{}$", service)).await?);
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut args = vec!["inspect", "--format", INSPECT_FORMAT];
        args.extend(ids.iter().map(String::as_str));
        let out = self
            .docker(RemoteStep::Inspect, &args, self.command_timeout)
            .await?;
        if !out.success() {
            return Err(remote_error(RemoteStep::Inspect, &out));
        }

        let mut instances: Vec<Instance> = out
            .stdout
            .lines()
            .filter_map(|line| parse_inspect_line(service, line))
            .collect();
        instances.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(instances)
    }

    async fn tail_logs(&self, service: &str, lines: usize) -> Result<Vec<String>, DeployError> {
        let count = lines.to_string();
        let out = self
            .docker(
                RemoteStep::Logs,
                &["logs", "--tail", count.as_str(), service],
                self.command_timeout,
            )
            .await?;
        if !out.success() {
            return Err(remote_error(RemoteStep::Logs, &out));
        }
        // docker logs replays the container's stderr on our stderr
        Ok(out
            .stdout
            .lines()
            .chain(out.stderr.lines())
            .map(str::to_string)
            .collect())
    }

    fn target(&self) -> &DeploymentTarget {
        &self.target
    }
}

/// `docker run` arguments for one instance
pub fn run_args(service: &str, artifact: &Artifact, spec: &RunSpec) -> Vec<String> {
    let mut args = vec![
        "run".to_string(),
        "--detach".to_string(),
        "--name".to_string(),
        service.to_string(),
        "--restart".to_string(),
        spec.restart_policy.as_arg(),
        "--label".to_string(),
        format!("{}={}", SERVICE_LABEL, service),
        "--label".to_string(),
        format!("{}={}", VERSION_LABEL, artifact.reference()),
    ];
    for port in &spec.ports {
        args.push("--publish".to_string());
        args.push(port.clone());
    }
    if let Some(env_file) = &spec.env_file {
        args.push("--env-file".to_string());
        args.push(env_file.clone());
    }
    for (key, value) in &spec.env {
        args.push("--env".to_string());
        args.push(format!("{}={}", key, value));
    }
    // The digest pins the exact artifact even after the tag moved on
    if artifact.content_digest.is_empty() {
        args.push(artifact.reference());
    } else {
        args.push(artifact.content_digest.clone());
    }
    args
}

fn parse_inspect_line(service: &str, line: &str) -> Option<Instance> {
    let mut fields = line.trim().splitn(5, '|');
    let id = fields.next()?.trim();
    if id.is_empty() {
        return None;
    }
    let label = fields.next()?.trim();
    let digest = fields.next()?.trim();
    let started = fields.next()?.trim();
    let config_image = fields.next().unwrap_or_default().trim();

    let artifact_version = if label.is_empty() || label == "<no value>" {
        config_image
    } else {
        label
    };
    let started_at = DateTime::parse_from_rfc3339(started)
        .map(|d| d.with_timezone(&Utc))
        .unwrap_or_default();

    Some(Instance {
        service_name: service.to_string(),
        container_id: id.to_string(),
        artifact_version: artifact_version.to_string(),
        artifact_digest: digest.to_string(),
        started_at,
    })
}

fn is_missing_container(out: &CommandOutput) -> bool {
    out.diagnostic().contains("No such container")
}

fn remote_error(step: RemoteStep, out: &CommandOutput) -> DeployError {
    DeployError::RemoteExec {
        step,
        message: format!(
            "exit {}: {}",
            out.status
                .map(|s| s.to_string())
                .unwrap_or_else(|| "signal".to_string()),
            out.diagnostic()
        ),
    }
}
