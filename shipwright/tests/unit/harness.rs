//! Shared setup for orchestrator tests

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use shipwright::deploy::health::HealthCheck;
use shipwright::deploy::mock::{MockBuilder, MockProbe, MockRegistry, MockRemote, MockWorld};
use shipwright::deploy::orchestrator::{
    Components, DeployRequest, Orchestrator, OrchestratorOptions, SlotRegistry,
};
use shipwright::deploy::registry::RetryingRegistry;
use shipwright::deploy::retry::RetryPolicy;
use shipwright::models::artifact::{Artifact, BuildDescriptor, ImageName, SourceRef};
use shipwright::models::target::DeploymentTarget;

pub const SERVICE: &str = "api";
pub const HOST: &str = "10.0.0.5";

pub struct Harness {
    pub world: Arc<MockWorld>,
    pub image: ImageName,
    pub orchestrator: Orchestrator,
}

pub fn image() -> ImageName {
    ImageName::new("registry.example.com", "team-a", "api")
}

/// 30s verification polled every 5s, 15s for rollback re-verification
pub fn health() -> HealthCheck {
    HealthCheck {
        port: 8080,
        path: "/health".into(),
        timeout: Duration::from_secs(30),
        poll_interval: Duration::from_secs(5),
        rollback_timeout: Duration::from_secs(15),
        ..Default::default()
    }
}

pub fn harness() -> Harness {
    harness_on(HOST)
}

/// A harness on its own slot registry, so tests running in parallel never
/// see each other's attempts
pub fn harness_on(host: &str) -> Harness {
    let mut h = shared_harness_on(host);
    h.orchestrator = h.orchestrator.with_slots(SlotRegistry::new());
    h
}

/// A harness on the process-wide slot registry
pub fn shared_harness_on(host: &str) -> Harness {
    let world = MockWorld::new();
    let image = image();
    let components = Components {
        builder: Arc::new(MockBuilder::new(world.clone(), image.clone())),
        registry: Arc::new(RetryingRegistry::new(
            MockRegistry::new(world.clone(), image.clone()),
            RetryPolicy::default(),
        )),
        remote: Arc::new(MockRemote::new(world.clone(), DeploymentTarget::new(host))),
        probe: Arc::new(MockProbe::new(world.clone(), SERVICE)),
    };
    let options = OrchestratorOptions {
        service: SERVICE.into(),
        health: health(),
        ..Default::default()
    };
    Harness {
        world,
        image,
        orchestrator: Orchestrator::new(components, options),
    }
}

pub fn request(tag: &str) -> DeployRequest {
    DeployRequest {
        tag: tag.into(),
        source: SourceRef {
            context: ".".into(),
            revision: None,
        },
        descriptor: BuildDescriptor {
            dockerfile: "Dockerfile".into(),
            platform: None,
            build_args: Default::default(),
        },
    }
}

/// The artifact running before each scenario
pub fn old_artifact() -> Artifact {
    Artifact {
        name: image().repository_path(),
        version_tag: "0.9.0".into(),
        content_digest: "sha256:d0".into(),
        fingerprint: None,
        built_at: Utc::now(),
    }
}

/// Wait until `condition` holds, yielding to the spawned attempt
pub async fn until(mut condition: impl FnMut() -> bool) {
    while !condition() {
        tokio::task::yield_now().await;
    }
}
