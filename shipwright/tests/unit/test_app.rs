//! Single-run wiring and shutdown handling

use shipwright::app::options::AppOptions;
use shipwright::app::run::{build_orchestrator, run};
use shipwright::deploy::fsm::Phase;
use shipwright::deploy::mock::MockOp;
use shipwright::filesys::dir::Dir;
use shipwright::models::target::LOCAL_HOST;
use shipwright::storage::layout::StorageLayout;
use shipwright::storage::settings::Settings;

use crate::harness::{harness, old_artifact, request, until, SERVICE};

#[tokio::test(start_paused = true)]
async fn test_signal_before_push_cancels() {
    let h = harness();
    h.world.start(SERVICE, &old_artifact());
    h.world.hold(MockOp::Build);

    let report = run(&h.orchestrator, request("1.0.0"), async {}).await.unwrap();

    assert_eq!(report.phase, Phase::Failed);
    assert_eq!(report.error_kind.as_deref(), Some("cancelled"));
    assert_eq!(h.world.count(MockOp::Push), 0);
    assert_eq!(h.world.remote_calls(), 0);
    assert_eq!(h.world.running(SERVICE).len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_signal_during_swap_is_ignored() {
    let h = harness();
    h.world.start(SERVICE, &old_artifact());
    h.world.set_build_digest("sha256:d1");
    h.world.hold(MockOp::Pull);

    let world = h.world.clone();
    let signal = async move {
        until(|| world.count(MockOp::Pull) == 1).await;
        // The attempt only resumes after the signal has been handled
        world.release(MockOp::Pull);
    };
    let report = run(&h.orchestrator, request("1.0.0"), signal).await.unwrap();

    assert_eq!(report.phase, Phase::Committed);
    assert_eq!(report.active.unwrap().artifact_digest, "sha256:d1");
    assert_eq!(h.world.running(SERVICE).len(), 1);
}

#[tokio::test]
async fn test_run_rejects_busy_slot() {
    let h = harness();
    let held = h.orchestrator.begin(request("1.0.0")).unwrap();

    let result = run(&h.orchestrator, request("1.0.0"), std::future::pending::<()>()).await;
    assert!(result.is_err());
    drop(held);
}

#[tokio::test]
async fn test_build_orchestrator_for_local_target() {
    let dir = Dir::create_temp_dir("shipwright-app").await.unwrap();
    let mut settings = Settings::default();
    settings.target.host = LOCAL_HOST.to_string();
    settings.service.name = "api".to_string();
    settings.image.name = "api".to_string();
    settings.registry.namespace = "team-a".to_string();

    let options = AppOptions::from_settings(&settings, StorageLayout::new(dir.path()), None);
    let orchestrator = build_orchestrator(&options).unwrap();

    assert_eq!(orchestrator.slot().to_string(), "api@local");
    assert_eq!(orchestrator.options().health.port, 8080);
    // Nothing deployed yet
    assert!(orchestrator.status().await.unwrap().is_none());

    dir.delete().await.unwrap();
}
