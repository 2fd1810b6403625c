//! Deployment orchestrator
//!
//! Sequences build, push, swap and verification for one service on one
//! target, and is the only place failure policy is decided. Components
//! retry their own transient errors; everything that reaches the
//! orchestrator is final for the step that produced it.
//!
//! The swap is not atomic. Whether a failed swap rolls back or simply fails
//! depends on whether the previous instance had already been stopped.

use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};
use url::Url;
use uuid::Uuid;

use crate::deploy::builder::ArtifactBuilder;
use crate::deploy::fsm::{DeploymentEvent, DeploymentFsm, Phase};
use crate::deploy::health::{verify, HealthCheck, HealthProbe};
use crate::deploy::registry::{pull_on_target, RegistryClient};
use crate::deploy::remote::RemoteExecutor;
use crate::deploy::report::DeploymentReport;
use crate::deploy::retry::RetryPolicy;
use crate::errors::{DeployError, RemoteStep};
use crate::models::artifact::{Artifact, BuildDescriptor, SourceRef};
use crate::models::instance::{Instance, RunSpec};
use crate::models::target::SlotKey;
use crate::storage::layout::StorageLayout;
use crate::storage::lock::TargetLock;
use crate::storage::record::{DeploymentRecord, RecordStore};

/// The collaborators one orchestrator drives
#[derive(Clone)]
pub struct Components {
    pub builder: Arc<dyn ArtifactBuilder>,
    pub registry: Arc<dyn RegistryClient>,
    pub remote: Arc<dyn RemoteExecutor>,
    pub probe: Arc<dyn HealthProbe>,
}

/// Orchestrator options
#[derive(Debug, Clone)]
pub struct OrchestratorOptions {
    /// Service (container) name on the target
    pub service: String,
    pub run_spec: RunSpec,
    pub health: HealthCheck,
    /// Retry policy for the target-side pull
    pub pull_retry: RetryPolicy,
    /// Log lines captured from a failed instance
    pub diagnostic_log_lines: usize,
}

impl Default for OrchestratorOptions {
    fn default() -> Self {
        Self {
            service: String::new(),
            run_spec: RunSpec::default(),
            health: HealthCheck::default(),
            pull_retry: RetryPolicy::default(),
            diagnostic_log_lines: 50,
        }
    }
}

/// A request to deploy `tag` built from `source`
#[derive(Debug, Clone)]
pub struct DeployRequest {
    pub tag: String,
    pub source: SourceRef,
    pub descriptor: BuildDescriptor,
}

static PROCESS_SLOTS: OnceLock<SlotRegistry> = OnceLock::new();

/// Slots with an attempt in flight
#[derive(Debug, Clone, Default)]
pub struct SlotRegistry {
    busy: Arc<Mutex<HashSet<SlotKey>>>,
}

impl SlotRegistry {
    /// A registry of its own, shared only with its clones
    pub fn new() -> Self {
        Self::default()
    }

    /// The registry every orchestrator in this process uses by default
    pub fn process() -> Self {
        PROCESS_SLOTS.get_or_init(SlotRegistry::new).clone()
    }

    /// Claim `slot`, or `None` if an attempt already holds it
    pub fn try_claim(&self, slot: &SlotKey) -> Option<SlotGuard> {
        if self.lock().insert(slot.clone()) {
            Some(SlotGuard {
                registry: self.clone(),
                slot: slot.clone(),
            })
        } else {
            None
        }
    }

    pub fn is_busy(&self, slot: &SlotKey) -> bool {
        self.lock().contains(slot)
    }

    fn lock(&self) -> MutexGuard<'_, HashSet<SlotKey>> {
        self.busy.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Releases its slot on drop
#[derive(Debug)]
pub struct SlotGuard {
    registry: SlotRegistry,
    slot: SlotKey,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.registry.lock().remove(&self.slot);
    }
}

#[derive(Debug)]
struct ControlState {
    phase: Phase,
    cancel_requested: bool,
}

/// Shared between a running attempt and its handles
#[derive(Debug)]
struct AttemptControl {
    state: Mutex<ControlState>,
    cancel: Notify,
}

impl AttemptControl {
    fn new() -> Self {
        Self {
            state: Mutex::new(ControlState {
                phase: Phase::Idle,
                cancel_requested: false,
            }),
            cancel: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ControlState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Observes and cancels a running attempt
#[derive(Debug, Clone)]
pub struct DeploymentHandle {
    attempt_id: Uuid,
    control: Arc<AttemptControl>,
}

impl DeploymentHandle {
    pub fn attempt_id(&self) -> Uuid {
        self.attempt_id
    }

    /// Current phase of the attempt
    pub fn phase(&self) -> Phase {
        self.control.lock().phase
    }

    /// Request cancellation. Only honoured before the swap starts; from
    /// `Swapping` on the attempt runs to a terminal phase.
    pub fn cancel(&self) -> Result<(), DeployError> {
        let mut state = self.control.lock();
        if !state.phase.allows_cancel() {
            return Err(DeployError::CancelRefused(state.phase));
        }
        state.cancel_requested = true;
        let phase = state.phase;
        drop(state);

        info!("Cancellation of attempt {} requested during {}", self.attempt_id, phase);
        self.control.cancel.notify_one();
        Ok(())
    }
}

/// Deploys one service to one target
#[derive(Clone)]
pub struct Orchestrator {
    components: Components,
    options: Arc<OrchestratorOptions>,
    slots: SlotRegistry,
    records: RecordStore,
    layout: Option<StorageLayout>,
}

impl Orchestrator {
    /// An orchestrator on the process-wide slot registry with in-memory
    /// records
    pub fn new(components: Components, options: OrchestratorOptions) -> Self {
        Self {
            components,
            options: Arc::new(options),
            slots: SlotRegistry::process(),
            records: RecordStore::in_memory(),
            layout: None,
        }
    }

    /// Claim slots in `slots` instead of the process-wide registry. Attempts
    /// on different registries do not exclude each other.
    pub fn with_slots(mut self, slots: SlotRegistry) -> Self {
        self.slots = slots;
        self
    }

    /// Persist records and take cross-process locks under `layout`
    pub fn with_storage(mut self, layout: StorageLayout) -> Self {
        self.records = RecordStore::new(layout.clone());
        self.layout = Some(layout);
        self
    }

    /// The (service, target) slot this orchestrator deploys to
    pub fn slot(&self) -> SlotKey {
        SlotKey::new(self.options.service.clone(), self.components.remote.target())
    }

    pub fn options(&self) -> &OrchestratorOptions {
        &self.options
    }

    /// Authoritative record of what is deployed on the slot
    pub async fn status(&self) -> Result<Option<DeploymentRecord>, DeployError> {
        self.records.load(&self.slot()).await
    }

    /// Last `lines` log lines of the service on the target
    pub async fn tail_logs(&self, lines: usize) -> Result<Vec<String>, DeployError> {
        self.components
            .remote
            .tail_logs(&self.options.service, lines)
            .await
    }

    /// Start an attempt. Fails immediately with
    /// [`DeployError::AttemptInFlight`] if the slot is busy; requests are
    /// never queued.
    pub fn begin(&self, request: DeployRequest) -> Result<Deployment, DeployError> {
        if request.tag.trim().is_empty() {
            return Err(DeployError::Config("version tag must not be empty".into()));
        }
        let slot = self.slot();
        let endpoint = self.options.health.endpoint(self.components.remote.target())?;

        let guard = self.slots.try_claim(&slot).ok_or_else(|| {
            warn!("Rejecting deployment of {}: an attempt is already in flight", slot);
            DeployError::AttemptInFlight {
                service: slot.service.clone(),
                host: slot.host.clone(),
            }
        })?;
        let lock = match &self.layout {
            Some(layout) => Some(TargetLock::try_acquire(layout.lock_file(&slot), &slot)?),
            None => None,
        };

        let attempt_id = Uuid::new_v4();
        info!(
            "Attempt {}: deploying {} to {}",
            attempt_id,
            self.components.registry.image().reference(&request.tag),
            slot
        );
        Ok(Deployment {
            orchestrator: self.clone(),
            request,
            endpoint,
            slot,
            attempt_id,
            control: Arc::new(AttemptControl::new()),
            _slot_guard: guard,
            _lock: lock,
        })
    }

    /// Run a full attempt for `request`
    pub async fn deploy(&self, request: DeployRequest) -> Result<DeploymentReport, DeployError> {
        Ok(self.begin(request)?.run().await)
    }
}

/// A swap sub-step failure and how far the swap got
struct SwapFailure {
    error: DeployError,
    old_instance_touched: bool,
}

/// Mutable state of one attempt
struct Attempt {
    fsm: DeploymentFsm,
    started_at: DateTime<Utc>,
    last_error: Option<DeployError>,
    artifact: Option<Artifact>,
    previous: Option<Instance>,
    started: Option<Instance>,
    active: Option<Instance>,
    diagnostics: Vec<String>,
}

/// One accepted deployment attempt, holding its slot until it finishes
pub struct Deployment {
    orchestrator: Orchestrator,
    request: DeployRequest,
    endpoint: Url,
    slot: SlotKey,
    attempt_id: Uuid,
    control: Arc<AttemptControl>,
    _slot_guard: SlotGuard,
    _lock: Option<TargetLock>,
}

impl Deployment {
    pub fn handle(&self) -> DeploymentHandle {
        DeploymentHandle {
            attempt_id: self.attempt_id,
            control: self.control.clone(),
        }
    }

    /// Drive the attempt to a terminal phase and report it
    pub async fn run(self) -> DeploymentReport {
        let mut attempt = Attempt {
            fsm: DeploymentFsm::new(),
            started_at: Utc::now(),
            last_error: None,
            artifact: None,
            previous: None,
            started: None,
            active: None,
            diagnostics: Vec::new(),
        };

        if let Err(e) = self.drive(&mut attempt).await {
            error!("Attempt {} stopped in {}: {}", self.attempt_id, attempt.fsm.state(), e);
            attempt.last_error = Some(e);
        }
        self.finish(attempt).await
    }

    fn components(&self) -> &Components {
        &self.orchestrator.components
    }

    fn options(&self) -> &OrchestratorOptions {
        &self.orchestrator.options
    }

    fn service(&self) -> &str {
        &self.orchestrator.options.service
    }

    async fn drive(&self, attempt: &mut Attempt) -> Result<(), DeployError> {
        self.advance(attempt, DeploymentEvent::Request)?;

        // Building
        let artifact = match self.cancellable(self.resolve_artifact()).await {
            Ok(artifact) => artifact,
            Err(e) => {
                let event = match &e {
                    DeployError::Cancelled(_) => DeploymentEvent::Cancelled,
                    other => DeploymentEvent::BuildFailed(other.to_string()),
                };
                return self.fail(attempt, e, event);
            }
        };
        info!("Artifact {} ({})", artifact.reference(), artifact.short_digest());
        attempt.artifact = Some(artifact.clone());
        self.advance(attempt, DeploymentEvent::Built)?;

        // Pushing
        let push = self
            .components()
            .registry
            .push(&artifact, &self.request.tag);
        match self.cancellable(push).await {
            Ok(receipt) => debug!("Pushed {} ({:?})", receipt.reference, receipt.repo_digest),
            Err(e) => {
                let event = match &e {
                    DeployError::Cancelled(_) => DeploymentEvent::Cancelled,
                    other => DeploymentEvent::PushFailed(other.to_string()),
                };
                return self.fail(attempt, e, event);
            }
        }
        if !self.enter_swap(attempt)? {
            return Ok(());
        }

        // Swapping
        match self.swap(attempt, &artifact).await {
            Ok(instance) => {
                attempt.started = Some(instance);
                self.advance(attempt, DeploymentEvent::Swapped)?;
            }
            Err(failure) => {
                let event = DeploymentEvent::SwapFailed {
                    error: failure.error.to_string(),
                    old_instance_touched: failure.old_instance_touched,
                };
                self.fail(attempt, failure.error, event)?;
                if attempt.fsm.state() == Phase::RollingBack {
                    self.roll_back(attempt).await?;
                }
                return Ok(());
            }
        }

        // Verifying
        let health = &self.options().health;
        let status = verify(
            self.components().probe.as_ref(),
            &self.endpoint,
            health.timeout,
            health.poll_interval,
        )
        .await;
        match status.into_error(&self.endpoint) {
            None => {
                attempt.active = attempt.started.clone();
                self.advance(attempt, DeploymentEvent::Healthy)?;
            }
            Some(e) => {
                attempt.diagnostics = self.diagnostics().await;
                let event = DeploymentEvent::Unhealthy(e.to_string());
                self.fail(attempt, e, event)?;
                self.roll_back(attempt).await?;
            }
        }
        Ok(())
    }

    /// Apply `event` and publish the new phase to handles
    fn advance(&self, attempt: &mut Attempt, event: DeploymentEvent) -> Result<Phase, DeployError> {
        let from = attempt.fsm.state();
        let to = attempt.fsm.process(event)?;
        self.control.lock().phase = to;
        info!("Attempt {}: {} -> {}", self.attempt_id, from, to);
        Ok(to)
    }

    /// Record `error` as the attempt's last error and apply `event`
    fn fail(&self, attempt: &mut Attempt, error: DeployError, event: DeploymentEvent) -> Result<(), DeployError> {
        warn!("Attempt {} failed in {}: {}", self.attempt_id, attempt.fsm.state(), error);
        attempt.last_error = Some(error);
        self.advance(attempt, event).map(|_| ())
    }

    /// Leave `Pushing` for `Swapping`, unless a cancellation got in first.
    /// The transition happens under the control lock so a concurrent
    /// `cancel` either lands before it or is refused.
    fn enter_swap(&self, attempt: &mut Attempt) -> Result<bool, DeployError> {
        let mut control = self.control.lock();
        if control.cancel_requested {
            drop(control);
            self.fail(
                attempt,
                DeployError::Cancelled(Phase::Pushing),
                DeploymentEvent::Cancelled,
            )?;
            return Ok(false);
        }
        let to = attempt.fsm.process(DeploymentEvent::Pushed)?;
        control.phase = to;
        drop(control);
        info!("Attempt {}: {} -> {}", self.attempt_id, Phase::Pushing, to);
        Ok(true)
    }

    /// Run `step` unless the attempt is cancelled first
    async fn cancellable<T>(
        &self,
        step: impl Future<Output = Result<T, DeployError>>,
    ) -> Result<T, DeployError> {
        let (phase, cancelled) = {
            let state = self.control.lock();
            (state.phase, state.cancel_requested)
        };
        if cancelled {
            return Err(DeployError::Cancelled(phase));
        }
        tokio::select! {
            biased;
            _ = self.control.cancel.notified() => Err(DeployError::Cancelled(phase)),
            result = step => result,
        }
    }

    /// Build the artifact, or reuse a cached build whose digest is already
    /// the active one
    async fn resolve_artifact(&self) -> Result<Artifact, DeployError> {
        let request = &self.request;
        let builder = &self.components().builder;

        let active_digest = match self.orchestrator.records.load(&self.slot).await {
            Ok(record) => record.and_then(|r| r.active).map(|i| i.artifact_digest),
            Err(e) => {
                warn!("Cannot read deployment record, building from scratch: {}", e);
                None
            }
        };

        if let Some(active_digest) = active_digest {
            match builder
                .cached(&request.source, &request.descriptor, &request.tag)
                .await
            {
                Ok(Some(cached)) if cached.content_digest == active_digest => {
                    info!(
                        "Build inputs unchanged and {} is already active; skipping build",
                        cached.short_digest()
                    );
                    return Ok(cached);
                }
                Ok(_) => {}
                Err(e) => warn!("Build cache lookup failed, building: {}", e),
            }
        }

        builder
            .build(&request.source, &request.descriptor, &request.tag)
            .await
    }

    /// Pull, stop, remove, run
    async fn swap(&self, attempt: &mut Attempt, artifact: &Artifact) -> Result<Instance, SwapFailure> {
        let remote = self.components().remote.as_ref();
        let service = self.service();
        let untouched = |error| SwapFailure {
            error,
            old_instance_touched: false,
        };

        let pulled = pull_on_target(
            self.components().registry.image(),
            remote,
            artifact,
            &self.request.tag,
            &self.options().pull_retry,
        )
        .await
        .map_err(untouched)?;

        let running = remote.list_running(service).await.map_err(untouched)?;
        if running.len() > 1 {
            warn!(
                "{} instances of {} running on {}; treating the newest as active",
                running.len(),
                service,
                remote.target()
            );
        }
        attempt.previous = running.into_iter().next();
        match &attempt.previous {
            Some(previous) => info!("Previous instance: {}", previous),
            None => info!("No instance of {} running on {}", service, remote.target()),
        }
        // Without a previous instance there is nothing a rollback could restore
        let had_previous = attempt.previous.is_some();
        let touched = move |error| SwapFailure {
            error,
            old_instance_touched: had_previous,
        };

        if let Err(error) = remote.stop_instance(service).await {
            let old_instance_touched = match &attempt.previous {
                None => false,
                Some(previous) => match remote.list_running(service).await {
                    Ok(now) => !now.iter().any(|i| i.container_id == previous.container_id),
                    Err(_) => true,
                },
            };
            return Err(SwapFailure {
                error,
                old_instance_touched,
            });
        }
        remote.remove_instance(service).await.map_err(touched)?;
        self.ensure_vacant().await.map_err(touched)?;

        match remote
            .run_instance(service, &pulled, &self.options().run_spec)
            .await
        {
            Ok(instance) => Ok(instance),
            Err(error) => {
                attempt.diagnostics = self.diagnostics().await;
                Err(touched(error))
            }
        }
    }

    /// Make sure nothing runs under the service name before starting one
    async fn ensure_vacant(&self) -> Result<(), DeployError> {
        let remote = self.components().remote.as_ref();
        let service = self.service();

        let running = remote.list_running(service).await?;
        if running.is_empty() {
            return Ok(());
        }
        warn!(
            "{} instance(s) of {} still running on {}; stopping them first",
            running.len(),
            service,
            remote.target()
        );
        remote.stop_instance(service).await?;
        remote.remove_instance(service).await?;

        let running = remote.list_running(service).await?;
        if running.is_empty() {
            Ok(())
        } else {
            Err(DeployError::RemoteExec {
                step: RemoteStep::Run,
                message: format!(
                    "refusing to start a duplicate: {} instance(s) of {} still running",
                    running.len(),
                    service
                ),
            })
        }
    }

    async fn diagnostics(&self) -> Vec<String> {
        match self
            .components()
            .remote
            .tail_logs(self.service(), self.options().diagnostic_log_lines)
            .await
        {
            Ok(lines) => lines,
            Err(e) => {
                warn!("Cannot collect logs of the failed instance: {}", e);
                Vec::new()
            }
        }
    }

    async fn roll_back(&self, attempt: &mut Attempt) -> Result<(), DeployError> {
        let outcome = match attempt.previous.clone() {
            Some(previous) => self.restore(&previous).await.map(Some),
            None => self.clear_slot().await.map(|_| None),
        };
        match outcome {
            Ok(Some(restored)) => {
                attempt.active = Some(restored);
                self.advance(attempt, DeploymentEvent::Restored)?;
            }
            Ok(None) => {
                // The bad instance is gone but nothing was put back
                warn!(
                    "No previous instance of {} to restore on {}; the slot is left empty",
                    self.service(),
                    self.components().remote.target()
                );
                self.advance(
                    attempt,
                    DeploymentEvent::RollbackFailed("no previous instance to restore".to_string()),
                )?;
            }
            Err(e) => {
                error!(
                    "ROLLBACK FAILED for {} on {} (attempt {}): {}. Previous instance: {}. \
                     Cause of the rollback: {}. Manual intervention required",
                    self.service(),
                    self.components().remote.target(),
                    self.attempt_id,
                    e,
                    attempt
                        .previous
                        .as_ref()
                        .map(|p| p.to_string())
                        .unwrap_or_else(|| "none".to_string()),
                    attempt
                        .last_error
                        .as_ref()
                        .map(|e| e.to_string())
                        .unwrap_or_default(),
                );
                let event = DeploymentEvent::RollbackFailed(e.to_string());
                attempt.last_error = Some(e);
                self.advance(attempt, event)?;
            }
        }
        Ok(())
    }

    /// Stop and remove whatever runs under the service name
    async fn clear_slot(&self) -> Result<(), DeployError> {
        let remote = self.components().remote.as_ref();
        let service = self.service();

        remote.stop_instance(service).await?;
        remote.remove_instance(service).await?;
        self.ensure_vacant().await
    }

    /// Clear the slot and re-run the previous artifact, verified against the
    /// shorter rollback timeout
    async fn restore(&self, previous: &Instance) -> Result<Instance, DeployError> {
        self.clear_slot().await?;

        info!("Restoring {}", previous);
        let restored = self
            .components()
            .remote
            .run_instance(self.service(), &previous.artifact(), &self.options().run_spec)
            .await?;
        let health = &self.options().health;
        let status = verify(
            self.components().probe.as_ref(),
            &self.endpoint,
            health.rollback_timeout,
            health.poll_interval,
        )
        .await;
        match status.into_error(&self.endpoint) {
            None => Ok(restored),
            Some(e) => Err(e),
        }
    }

    /// Settle the active instance, persist the record and build the report
    async fn finish(self, attempt: Attempt) -> DeploymentReport {
        let phase = attempt.fsm.state();
        let active = match phase {
            Phase::Committed | Phase::RolledBack => attempt.active.clone(),
            _ if attempt.fsm.visited(Phase::Swapping) => {
                match self.components().remote.list_running(self.service()).await {
                    Ok(running) => running.into_iter().next(),
                    Err(e) => {
                        warn!("Cannot determine the active instance: {}", e);
                        None
                    }
                }
            }
            // The target was never touched; whatever was active still is
            _ => match self.orchestrator.records.load(&self.slot).await {
                Ok(record) => record.and_then(|r| r.active),
                Err(_) => None,
            },
        };

        let last_error = attempt.last_error.as_ref().map(|e| e.to_string());
        let record = DeploymentRecord {
            service: self.slot.service.clone(),
            host: self.slot.host.clone(),
            active: active.clone(),
            last_attempt_id: self.attempt_id,
            last_phase: phase,
            last_error: last_error.clone(),
            updated_at: Utc::now(),
        };
        if let Err(e) = self.orchestrator.records.save(&record).await {
            error!("Failed to persist the deployment record for {}: {}", self.slot, e);
        }

        match phase {
            Phase::Committed => info!("Attempt {} committed", self.attempt_id),
            Phase::RolledBack => warn!(
                "Attempt {} rolled back: {}",
                self.attempt_id,
                last_error.as_deref().unwrap_or_default()
            ),
            _ => error!(
                "Attempt {} ended in {}: {}",
                self.attempt_id,
                phase,
                last_error.as_deref().unwrap_or_default()
            ),
        }

        DeploymentReport {
            attempt_id: self.attempt_id,
            service: self.slot.service.clone(),
            target: self.components().remote.target().to_string(),
            phase,
            error_kind: attempt.last_error.as_ref().map(|e| e.kind().to_string()),
            last_error,
            artifact: attempt.artifact,
            previous: attempt.previous,
            active,
            history: attempt.fsm.history().to_vec(),
            diagnostics: attempt.diagnostics,
            started_at: attempt.started_at,
            finished_at: Utc::now(),
        }
    }
}
