//! In-memory deployment doubles
//!
//! A [`MockWorld`] models one workstation, one registry and one target host.
//! The builder, registry, remote executor and probe all share it, so a test
//! can script failures per operation and then inspect the calls made and the
//! containers left running.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Semaphore;
use url::Url;

use crate::deploy::builder::ArtifactBuilder;
use crate::deploy::health::HealthProbe;
use crate::deploy::registry::RegistryClient;
use crate::deploy::remote::RemoteExecutor;
use crate::errors::{DeployError, RemoteStep};
use crate::models::artifact::{Artifact, BuildDescriptor, ImageName, PushReceipt, SourceRef};
use crate::models::instance::{Instance, RunSpec};
use crate::models::target::DeploymentTarget;
use crate::utils::sha256_parts;

/// Operations a test can fail or hold
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockOp {
    Build,
    Cached,
    Push,
    Pull,
    Stop,
    Remove,
    Run,
    ListRunning,
    TailLogs,
    Probe,
}

impl MockOp {
    /// Whether the operation is executed on the target
    pub fn is_remote(&self) -> bool {
        matches!(
            self,
            MockOp::Pull
                | MockOp::Stop
                | MockOp::Remove
                | MockOp::Run
                | MockOp::ListRunning
                | MockOp::TailLogs
        )
    }
}

#[derive(Debug, Clone)]
struct Container {
    instance: Instance,
    running: bool,
}

#[derive(Debug, Default)]
struct WorldState {
    /// `name:tag` to digest
    registry: HashMap<String, String>,
    containers: Vec<Container>,
    calls: Vec<(MockOp, String)>,
    failures: HashMap<MockOp, VecDeque<DeployError>>,
    holds: HashMap<MockOp, Arc<Semaphore>>,
    build_digests: VecDeque<String>,
    cached_digest: Option<String>,
    unhealthy: HashSet<String>,
    logs: Vec<String>,
    next_container: u32,
}

/// Shared state behind the mock components
#[derive(Debug, Default)]
pub struct MockWorld {
    state: Mutex<WorldState>,
}

impl MockWorld {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, WorldState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Queue an error for the next call of `op`
    pub fn fail_next(&self, op: MockOp, error: DeployError) {
        self.lock().failures.entry(op).or_default().push_back(error);
    }

    /// Make every call of `op` wait until [`MockWorld::release`]
    pub fn hold(&self, op: MockOp) {
        self.lock().holds.insert(op, Arc::new(Semaphore::new(0)));
    }

    /// Let held and future calls of `op` proceed
    pub fn release(&self, op: MockOp) {
        if let Some(gate) = self.lock().holds.remove(&op) {
            gate.close();
        }
    }

    /// Digest produced by the next build
    pub fn set_build_digest(&self, digest: &str) {
        self.lock().build_digests.push_back(digest.to_string());
    }

    /// Digest reported by the fingerprint lookup
    pub fn set_cached_digest(&self, digest: Option<&str>) {
        self.lock().cached_digest = digest.map(str::to_string);
    }

    /// Instances running `digest` never pass a probe
    pub fn mark_unhealthy(&self, digest: &str) {
        self.lock().unhealthy.insert(digest.to_string());
    }

    /// Lines returned by `tail_logs`
    pub fn set_logs(&self, lines: &[&str]) {
        self.lock().logs = lines.iter().map(|l| l.to_string()).collect();
    }

    /// Put an artifact in the registry as if pushed earlier
    pub fn publish(&self, reference: &str, digest: &str) {
        self.lock()
            .registry
            .insert(reference.to_string(), digest.to_string());
    }

    /// Start a container outside of any deployment
    pub fn start(&self, service: &str, artifact: &Artifact) -> Instance {
        let mut state = self.lock();
        let instance = new_instance(&mut state, service, artifact);
        state.containers.push(Container {
            instance: instance.clone(),
            running: true,
        });
        instance
    }

    /// Running instances of `service`, newest first
    pub fn running(&self, service: &str) -> Vec<Instance> {
        running(&self.lock(), service)
    }

    /// Every call so far, in order, as `(op, detail)`
    pub fn calls(&self) -> Vec<(MockOp, String)> {
        self.lock().calls.clone()
    }

    pub fn count(&self, op: MockOp) -> usize {
        self.lock().calls.iter().filter(|(o, _)| *o == op).count()
    }

    /// Number of calls made against the target
    pub fn remote_calls(&self) -> usize {
        self.lock().calls.iter().filter(|(o, _)| o.is_remote()).count()
    }

    pub fn registry_digest(&self, reference: &str) -> Option<String> {
        self.lock().registry.get(reference).cloned()
    }

    /// Record the call, wait on a hold, then pop a scripted failure
    async fn enter(&self, op: MockOp, detail: String) -> Result<(), DeployError> {
        let hold = {
            let mut state = self.lock();
            state.calls.push((op, detail));
            state.holds.get(&op).cloned()
        };
        if let Some(gate) = hold {
            // Closing the semaphore is the release signal
            let _ = gate.acquire().await;
        }
        match self.lock().failures.get_mut(&op).and_then(VecDeque::pop_front) {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

fn running(state: &WorldState, service: &str) -> Vec<Instance> {
    let mut instances: Vec<Instance> = state
        .containers
        .iter()
        .filter(|c| c.running && c.instance.service_name == service)
        .map(|c| c.instance.clone())
        .collect();
    instances.sort_by(|a, b| b.started_at.cmp(&a.started_at));
    instances
}

fn new_instance(state: &mut WorldState, service: &str, artifact: &Artifact) -> Instance {
    state.next_container += 1;
    Instance {
        service_name: service.to_string(),
        container_id: format!("container-{}", state.next_container),
        artifact_version: artifact.reference(),
        artifact_digest: artifact.content_digest.clone(),
        // Distinct, increasing start times even when the clock is paused
        started_at: Utc::now() + chrono::Duration::milliseconds(i64::from(state.next_container)),
    }
}

/// Builder double; digests come from [`MockWorld::set_build_digest`] or are
/// derived from the tag
pub struct MockBuilder {
    world: Arc<MockWorld>,
    image: ImageName,
}

impl MockBuilder {
    pub fn new(world: Arc<MockWorld>, image: ImageName) -> Self {
        Self { world, image }
    }

    fn artifact(&self, version_tag: &str, digest: String, source: &SourceRef) -> Artifact {
        Artifact {
            name: self.image.repository_path(),
            version_tag: version_tag.to_string(),
            content_digest: digest,
            fingerprint: source.revision.clone(),
            built_at: Utc::now(),
        }
    }
}

#[async_trait]
impl ArtifactBuilder for MockBuilder {
    async fn build(
        &self,
        source: &SourceRef,
        _descriptor: &BuildDescriptor,
        version_tag: &str,
    ) -> Result<Artifact, DeployError> {
        self.world
            .enter(MockOp::Build, self.image.reference(version_tag))
            .await?;
        let digest = self.world.lock().build_digests.pop_front().unwrap_or_else(|| {
            format!("sha256:{}", sha256_parts([version_tag.as_bytes()]))
        });
        Ok(self.artifact(version_tag, digest, source))
    }

    async fn cached(
        &self,
        source: &SourceRef,
        _descriptor: &BuildDescriptor,
        version_tag: &str,
    ) -> Result<Option<Artifact>, DeployError> {
        if source.revision.is_none() {
            return Ok(None);
        }
        self.world
            .enter(MockOp::Cached, self.image.reference(version_tag))
            .await?;
        let cached = self.world.lock().cached_digest.clone();
        Ok(cached.map(|digest| self.artifact(version_tag, digest, source)))
    }
}

/// Registry double
pub struct MockRegistry {
    world: Arc<MockWorld>,
    image: ImageName,
}

impl MockRegistry {
    pub fn new(world: Arc<MockWorld>, image: ImageName) -> Self {
        Self { world, image }
    }
}

#[async_trait]
impl RegistryClient for MockRegistry {
    async fn push(&self, artifact: &Artifact, tag: &str) -> Result<PushReceipt, DeployError> {
        let reference = self.image.reference(tag);
        self.world.enter(MockOp::Push, reference.clone()).await?;
        self.world.publish(&reference, &artifact.content_digest);
        Ok(PushReceipt {
            reference,
            repo_digest: Some(artifact.content_digest.clone()),
        })
    }

    fn image(&self) -> &ImageName {
        &self.image
    }
}

/// Remote executor double following docker's container naming rules: one
/// container per name, stopped containers keep their name until removed
pub struct MockRemote {
    world: Arc<MockWorld>,
    target: DeploymentTarget,
}

impl MockRemote {
    pub fn new(world: Arc<MockWorld>, target: DeploymentTarget) -> Self {
        Self { world, target }
    }

    async fn enter(&self, op: MockOp, detail: String) -> Result<(), DeployError> {
        self.world.enter(op, detail).await
    }
}

#[async_trait]
impl RemoteExecutor for MockRemote {
    async fn pull_image(&self, reference: &str, namespace: &str) -> Result<String, DeployError> {
        self.enter(MockOp::Pull, reference.to_string()).await?;
        self.world
            .registry_digest(reference)
            .ok_or_else(|| DeployError::NotFound {
                reference: reference.to_string(),
                namespace: namespace.to_string(),
            })
    }

    async fn stop_instance(&self, service: &str) -> Result<(), DeployError> {
        self.enter(MockOp::Stop, service.to_string()).await?;
        let mut state = self.world.lock();
        for container in state
            .containers
            .iter_mut()
            .filter(|c| c.instance.service_name == service)
        {
            container.running = false;
        }
        Ok(())
    }

    async fn remove_instance(&self, service: &str) -> Result<(), DeployError> {
        self.enter(MockOp::Remove, service.to_string()).await?;
        let mut state = self.world.lock();
        if state
            .containers
            .iter()
            .any(|c| c.instance.service_name == service && c.running)
        {
            return Err(DeployError::RemoteExec {
                step: RemoteStep::Remove,
                message: format!("cannot remove running container {}", service),
            });
        }
        state.containers.retain(|c| c.instance.service_name != service);
        Ok(())
    }

    async fn run_instance(
        &self,
        service: &str,
        artifact: &Artifact,
        _spec: &RunSpec,
    ) -> Result<Instance, DeployError> {
        self.enter(
            MockOp::Run,
            format!("{} {}", service, artifact.content_digest),
        )
        .await?;
        let mut state = self.world.lock();
        if state
            .containers
            .iter()
            .any(|c| c.instance.service_name == service)
        {
            return Err(DeployError::RemoteExec {
                step: RemoteStep::Run,
                message: format!("Conflict. The container name \"/{}\" is already in use", service),
            });
        }
        let instance = new_instance(&mut state, service, artifact);
        state.containers.push(Container {
            instance: instance.clone(),
            running: true,
        });
        Ok(instance)
    }

    async fn list_running(&self, service: &str) -> Result<Vec<Instance>, DeployError> {
        self.enter(MockOp::ListRunning, service.to_string()).await?;
        Ok(running(&self.world.lock(), service))
    }

    async fn tail_logs(&self, service: &str, lines: usize) -> Result<Vec<String>, DeployError> {
        self.enter(MockOp::TailLogs, format!("{} {}", service, lines))
            .await?;
        let state = self.world.lock();
        let skip = state.logs.len().saturating_sub(lines);
        Ok(state.logs[skip..].to_vec())
    }

    fn target(&self) -> &DeploymentTarget {
        &self.target
    }
}

/// Probe double: healthy while the newest running instance of `service`
/// serves a digest not marked unhealthy
pub struct MockProbe {
    world: Arc<MockWorld>,
    service: String,
}

impl MockProbe {
    pub fn new(world: Arc<MockWorld>, service: impl Into<String>) -> Self {
        Self {
            world,
            service: service.into(),
        }
    }
}

#[async_trait]
impl HealthProbe for MockProbe {
    async fn probe(&self, endpoint: &Url, _timeout: Duration) -> Result<(), String> {
        self.world
            .enter(MockOp::Probe, endpoint.to_string())
            .await
            .map_err(|e| e.to_string())?;
        let state = self.world.lock();
        match running(&state, &self.service).first() {
            None => Err("connection refused".to_string()),
            Some(instance) if state.unhealthy.contains(&instance.artifact_digest) => {
                Err("503 Service Unavailable".to_string())
            }
            Some(_) => Ok(()),
        }
    }
}
