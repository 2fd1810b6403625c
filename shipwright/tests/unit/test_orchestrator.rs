//! Orchestrator tests against the in-memory doubles

use shipwright::deploy::fsm::Phase;
use shipwright::deploy::mock::MockOp;
use shipwright::deploy::orchestrator::SlotRegistry;
use shipwright::errors::{DeployError, RemoteStep};
use shipwright::filesys::dir::Dir;
use shipwright::storage::layout::StorageLayout;

use crate::harness::{
    harness, harness_on, old_artifact, request, shared_harness_on, until, SERVICE,
};

fn phases(report: &shipwright::deploy::report::DeploymentReport) -> Vec<Phase> {
    report.history.iter().map(|c| c.phase).collect()
}

fn auth_error() -> DeployError {
    DeployError::Auth {
        reference: "registry.example.com/team-a/api:1.0.0".into(),
        namespace: "registry.example.com/team-a".into(),
        message: "denied: requested access to the resource is denied".into(),
    }
}

// ============================== SCENARIOS ================================== //

#[tokio::test(start_paused = true)]
async fn test_scenario_a_commit() {
    let h = harness();
    h.world.start(SERVICE, &old_artifact());
    h.world.set_build_digest("sha256:d1");

    let report = h.orchestrator.deploy(request("1.0.0")).await.unwrap();

    assert_eq!(report.phase, Phase::Committed);
    assert_eq!(report.exit_code(), 0);
    assert!(report.last_error.is_none());
    assert_eq!(
        phases(&report),
        vec![
            Phase::Idle,
            Phase::Building,
            Phase::Pushing,
            Phase::Swapping,
            Phase::Verifying,
            Phase::Committed
        ]
    );

    // Exactly one active instance, running the pushed digest
    let running = h.world.running(SERVICE);
    assert_eq!(running.len(), 1);
    assert_eq!(running[0].artifact_digest, "sha256:d1");
    assert_eq!(report.active.as_ref().unwrap().artifact_digest, "sha256:d1");
    assert_eq!(
        h.world.registry_digest(&h.image.reference("1.0.0")).as_deref(),
        Some("sha256:d1")
    );
    assert_eq!(report.previous.as_ref().unwrap().artifact_digest, "sha256:d0");
    assert_eq!(h.world.count(MockOp::Probe), 1);
}

#[tokio::test(start_paused = true)]
async fn test_scenario_b_push_auth_failure_never_touches_target() {
    let h = harness();
    let previous = h.world.start(SERVICE, &old_artifact());
    h.world.fail_next(MockOp::Push, auth_error());

    let report = h.orchestrator.deploy(request("1.0.0")).await.unwrap();

    assert_eq!(report.phase, Phase::Failed);
    assert_eq!(report.error_kind.as_deref(), Some("auth"));
    assert!(report
        .last_error
        .as_deref()
        .unwrap()
        .contains("namespace 'registry.example.com/team-a'"));
    // Auth failures are not retried
    assert_eq!(h.world.count(MockOp::Push), 1);
    assert_eq!(h.world.remote_calls(), 0);
    assert_eq!(h.world.running(SERVICE), vec![previous]);
    assert!(!phases(&report).contains(&Phase::Swapping));
}

#[tokio::test(start_paused = true)]
async fn test_scenario_c_run_failure_rolls_back() {
    let h = harness();
    let previous = h.world.start(SERVICE, &old_artifact());
    h.world.set_build_digest("sha256:d1");
    h.world.set_logs(&["Error: bind: address already in use"]);
    h.world.fail_next(
        MockOp::Run,
        DeployError::RemoteExec {
            step: RemoteStep::Run,
            message: "exit 125".into(),
        },
    );

    let report = h.orchestrator.deploy(request("1.0.0")).await.unwrap();

    assert_eq!(report.phase, Phase::RolledBack);
    assert_eq!(report.exit_code(), 2);
    assert_eq!(report.error_kind.as_deref(), Some("remote_exec"));
    assert_eq!(
        phases(&report),
        vec![
            Phase::Idle,
            Phase::Building,
            Phase::Pushing,
            Phase::Swapping,
            Phase::RollingBack,
            Phase::RolledBack
        ]
    );

    // The previous artifact, and only it, is active again
    let running = h.world.running(SERVICE);
    assert_eq!(running.len(), 1);
    assert_eq!(running[0].artifact_digest, previous.artifact_digest);
    assert_eq!(running[0].artifact_version, previous.artifact_version);
    assert_eq!(report.active.unwrap().artifact_digest, "sha256:d0");
    assert_eq!(report.diagnostics, vec!["Error: bind: address already in use"]);
    assert_eq!(h.world.count(MockOp::Run), 2);
}

#[tokio::test(start_paused = true)]
async fn test_scenario_d_unhealthy_rolls_back_after_six_polls() {
    let h = harness();
    h.world.start(SERVICE, &old_artifact());
    h.world.set_build_digest("sha256:d1");
    h.world.mark_unhealthy("sha256:d1");

    let started = tokio::time::Instant::now();
    let report = h.orchestrator.deploy(request("1.0.0")).await.unwrap();

    assert_eq!(report.phase, Phase::RolledBack);
    assert_eq!(report.error_kind.as_deref(), Some("health_check_timeout"));
    assert!(phases(&report).contains(&Phase::Verifying));
    assert!(phases(&report).contains(&Phase::RollingBack));
    // Six polls of the new instance, one of the restored one
    assert_eq!(h.world.count(MockOp::Probe), 7);
    assert_eq!(h.world.count(MockOp::TailLogs), 1);
    assert_eq!(report.active.unwrap().artifact_digest, "sha256:d0");
    assert!(started.elapsed() <= std::time::Duration::from_secs(35));
}

#[tokio::test(start_paused = true)]
async fn test_scenario_e_second_request_is_rejected_while_swapping() {
    let h = harness();
    h.world.start(SERVICE, &old_artifact());
    h.world.set_build_digest("sha256:d1");
    h.world.hold(MockOp::Pull);

    let deployment = h.orchestrator.begin(request("1.0.0")).unwrap();
    let handle = deployment.handle();
    let first = tokio::spawn(deployment.run());
    until(|| handle.phase() == Phase::Swapping).await;

    let second = h.orchestrator.begin(request("2.0.0"));
    assert!(matches!(second, Err(DeployError::AttemptInFlight { .. })));
    assert!(matches!(handle.cancel(), Err(DeployError::CancelRefused(Phase::Swapping))));

    h.world.release(MockOp::Pull);
    let report = first.await.unwrap();
    assert_eq!(report.attempt_id, handle.attempt_id());
    assert_eq!(report.phase, Phase::Committed);
    assert_eq!(report.active.unwrap().artifact_digest, "sha256:d1");
    assert_eq!(h.world.count(MockOp::Build), 1);

    // The slot is free again once the attempt is terminal
    let next = h.orchestrator.deploy(request("2.0.0")).await.unwrap();
    assert_eq!(next.phase, Phase::Committed);
}

// ============================== SWAP POLICY ================================== //

#[tokio::test(start_paused = true)]
async fn test_swap_call_order_guards_against_duplicates() {
    let h = harness();
    h.world.start(SERVICE, &old_artifact());

    h.orchestrator.deploy(request("1.0.0")).await.unwrap();

    let ops: Vec<MockOp> = h.world.calls().into_iter().map(|(op, _)| op).collect();
    assert_eq!(
        ops,
        vec![
            MockOp::Build,
            MockOp::Push,
            MockOp::Pull,
            MockOp::ListRunning,
            MockOp::Stop,
            MockOp::Remove,
            MockOp::ListRunning,
            MockOp::Run,
            MockOp::Probe,
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_pull_not_found_fails_without_touching_old_instance() {
    let h = harness();
    let previous = h.world.start(SERVICE, &old_artifact());
    h.world.fail_next(
        MockOp::Pull,
        DeployError::NotFound {
            reference: "registry.example.com/team-a/api:1.0.0".into(),
            namespace: "registry.example.com/team-a".into(),
        },
    );

    let report = h.orchestrator.deploy(request("1.0.0")).await.unwrap();

    assert_eq!(report.phase, Phase::Failed);
    assert_eq!(report.error_kind.as_deref(), Some("not_found"));
    assert!(!phases(&report).contains(&Phase::RollingBack));
    assert_eq!(h.world.count(MockOp::Stop), 0);
    assert_eq!(h.world.running(SERVICE), vec![previous.clone()]);
    assert_eq!(report.active, Some(previous));
}

#[tokio::test(start_paused = true)]
async fn test_stop_failure_with_old_still_running_fails() {
    let h = harness();
    let previous = h.world.start(SERVICE, &old_artifact());
    h.world.fail_next(
        MockOp::Stop,
        DeployError::RemoteExec {
            step: RemoteStep::Stop,
            message: "connection reset".into(),
        },
    );

    let report = h.orchestrator.deploy(request("1.0.0")).await.unwrap();

    assert_eq!(report.phase, Phase::Failed);
    assert!(!phases(&report).contains(&Phase::RollingBack));
    assert_eq!(h.world.running(SERVICE), vec![previous]);
}

#[tokio::test(start_paused = true)]
async fn test_push_network_errors_are_retried() {
    let h = harness();
    h.world.fail_next(MockOp::Push, DeployError::Network("connection reset by peer".into()));
    h.world.fail_next(MockOp::Push, DeployError::Network("i/o timeout".into()));

    let report = h.orchestrator.deploy(request("1.0.0")).await.unwrap();
    assert_eq!(report.phase, Phase::Committed);
    assert_eq!(h.world.count(MockOp::Push), 3);
}

#[tokio::test(start_paused = true)]
async fn test_push_network_budget_exhausted_fails() {
    let h = harness();
    for _ in 0..3 {
        h.world.fail_next(MockOp::Push, DeployError::Network("i/o timeout".into()));
    }

    let report = h.orchestrator.deploy(request("1.0.0")).await.unwrap();
    assert_eq!(report.phase, Phase::Failed);
    assert_eq!(report.error_kind.as_deref(), Some("network"));
    assert_eq!(h.world.count(MockOp::Push), 3);
    assert_eq!(h.world.remote_calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_build_failure_is_not_retried() {
    let h = harness();
    h.world.fail_next(MockOp::Build, DeployError::Build("COPY failed".into()));

    let report = h.orchestrator.deploy(request("1.0.0")).await.unwrap();
    assert_eq!(report.phase, Phase::Failed);
    assert_eq!(report.last_error.as_deref(), Some("Build failed: COPY failed"));
    assert_eq!(h.world.count(MockOp::Build), 1);
    assert_eq!(h.world.count(MockOp::Push), 0);
}

// ============================== ROLLBACK ================================== //

#[tokio::test(start_paused = true)]
async fn test_rollback_failure_is_terminal_alarm() {
    let h = harness();
    h.world.start(SERVICE, &old_artifact());
    h.world.set_build_digest("sha256:d1");
    h.world.mark_unhealthy("sha256:d1");
    h.world.mark_unhealthy("sha256:d0");

    let report = h.orchestrator.deploy(request("1.0.0")).await.unwrap();

    assert_eq!(report.phase, Phase::Failed);
    assert!(phases(&report).contains(&Phase::RollingBack));
    // 30s / 5s for the new instance, 15s / 5s for the restored one
    assert_eq!(h.world.count(MockOp::Probe), 9);
    // Whatever is actually running is reported
    assert_eq!(report.active.unwrap().artifact_digest, "sha256:d0");
}

#[tokio::test(start_paused = true)]
async fn test_unhealthy_first_deploy_leaves_slot_empty() {
    let h = harness();
    h.world.set_build_digest("sha256:d1");
    h.world.mark_unhealthy("sha256:d1");

    let report = h.orchestrator.deploy(request("1.0.0")).await.unwrap();

    // The bad instance is removed, but nothing was restored
    assert_eq!(report.phase, Phase::Failed);
    assert_eq!(report.exit_code(), 1);
    assert!(phases(&report).contains(&Phase::RollingBack));
    assert!(!phases(&report).contains(&Phase::RolledBack));
    assert_eq!(report.error_kind.as_deref(), Some("health_check_timeout"));
    assert!(report.previous.is_none());
    assert!(report.active.is_none());
    assert!(h.world.running(SERVICE).is_empty());
    assert_eq!(h.world.count(MockOp::Run), 1);

    let record = h.orchestrator.status().await.unwrap().unwrap();
    assert_eq!(record.last_phase, Phase::Failed);
    assert!(record.active.is_none());
}

// ============================== CANCELLATION ================================== //

#[tokio::test(start_paused = true)]
async fn test_cancel_during_build() {
    let h = harness();
    let previous = h.world.start(SERVICE, &old_artifact());
    h.world.hold(MockOp::Build);

    let deployment = h.orchestrator.begin(request("1.0.0")).unwrap();
    let handle = deployment.handle();
    let attempt = tokio::spawn(deployment.run());
    until(|| h.world.count(MockOp::Build) == 1).await;

    handle.cancel().unwrap();
    let report = attempt.await.unwrap();

    assert_eq!(report.phase, Phase::Failed);
    assert_eq!(report.error_kind.as_deref(), Some("cancelled"));
    assert_eq!(h.world.count(MockOp::Push), 0);
    assert_eq!(h.world.remote_calls(), 0);
    assert_eq!(report.active, None);
    assert_eq!(h.world.running(SERVICE), vec![previous]);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_during_push() {
    let h = harness();
    h.world.hold(MockOp::Push);

    let deployment = h.orchestrator.begin(request("1.0.0")).unwrap();
    let handle = deployment.handle();
    let attempt = tokio::spawn(deployment.run());
    until(|| h.world.count(MockOp::Push) == 1).await;
    assert_eq!(handle.phase(), Phase::Pushing);

    handle.cancel().unwrap();
    let report = attempt.await.unwrap();

    assert_eq!(report.phase, Phase::Failed);
    assert!(!phases(&report).contains(&Phase::Swapping));
    assert_eq!(h.world.remote_calls(), 0);
}

// ============================== FAST PATH ================================== //

#[tokio::test(start_paused = true)]
async fn test_unchanged_inputs_skip_the_build() {
    let h = harness();
    h.world.set_build_digest("sha256:d1");
    let mut pinned = request("1.0.0");
    pinned.source.revision = Some("3f2a9c1".into());

    let first = h.orchestrator.deploy(pinned.clone()).await.unwrap();
    assert_eq!(first.phase, Phase::Committed);

    h.world.set_cached_digest(Some("sha256:d1"));
    let second = h.orchestrator.deploy(pinned).await.unwrap();

    assert_eq!(second.phase, Phase::Committed);
    assert_eq!(h.world.count(MockOp::Build), 1);
    // The tag is still pushed
    assert_eq!(h.world.count(MockOp::Push), 2);
    assert_eq!(second.artifact.unwrap().content_digest, "sha256:d1");
}

#[tokio::test(start_paused = true)]
async fn test_fast_path_requires_a_revision() {
    let h = harness();
    h.world.set_build_digest("sha256:d1");
    h.orchestrator.deploy(request("1.0.0")).await.unwrap();

    h.world.set_cached_digest(Some("sha256:d1"));
    h.world.set_build_digest("sha256:d1");
    h.orchestrator.deploy(request("1.0.0")).await.unwrap();

    assert_eq!(h.world.count(MockOp::Cached), 0);
    assert_eq!(h.world.count(MockOp::Build), 2);
}

// ============================== CONCURRENCY ================================== //

#[tokio::test(start_paused = true)]
async fn test_different_targets_deploy_in_parallel() {
    let slots = SlotRegistry::new();
    let a = harness_on("10.0.0.5");
    let b = harness_on("10.0.0.6");
    let orch_a = a.orchestrator.clone().with_slots(slots.clone());
    let orch_b = b.orchestrator.clone().with_slots(slots.clone());

    let (ra, rb) = tokio::join!(orch_a.deploy(request("1.0.0")), orch_b.deploy(request("1.0.0")));
    assert_eq!(ra.unwrap().phase, Phase::Committed);
    assert_eq!(rb.unwrap().phase, Phase::Committed);
    assert!(!slots.is_busy(&orch_a.slot()));
    assert_eq!(a.world.running(SERVICE).len(), 1);
    assert_eq!(b.world.running(SERVICE).len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_orchestrators_in_one_process_share_slots() {
    // Separate orchestrators, each built with the default registry
    let a = shared_harness_on("10.9.9.9");
    let b = shared_harness_on("10.9.9.9");
    a.world.set_build_digest("sha256:d1");
    a.world.hold(MockOp::Pull);

    let deployment = a.orchestrator.begin(request("1.0.0")).unwrap();
    let handle = deployment.handle();
    let first = tokio::spawn(deployment.run());
    until(|| handle.phase() == Phase::Swapping).await;

    assert!(matches!(
        b.orchestrator.begin(request("2.0.0")),
        Err(DeployError::AttemptInFlight { .. })
    ));

    a.world.release(MockOp::Pull);
    assert_eq!(first.await.unwrap().phase, Phase::Committed);
    assert!(b.orchestrator.begin(request("2.0.0")).is_ok());
}

#[tokio::test]
async fn test_target_lock_spans_orchestrators() {
    let dir = Dir::create_temp_dir("shipwright-orch").await.unwrap();
    let layout = StorageLayout::new(dir.path());

    // Two orchestrators with separate in-process registries, like two CLI runs
    let first = harness().orchestrator.with_storage(layout.clone());
    let second = harness().orchestrator.with_storage(layout.clone());

    let held = first.begin(request("1.0.0")).unwrap();
    assert!(matches!(
        second.begin(request("1.0.0")),
        Err(DeployError::AttemptInFlight { .. })
    ));
    drop(held);
    assert!(second.begin(request("1.0.0")).is_ok());

    dir.delete().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_record_tracks_last_attempt() {
    let h = harness();
    h.world.set_build_digest("sha256:d1");
    let report = h.orchestrator.deploy(request("1.0.0")).await.unwrap();

    let record = h.orchestrator.status().await.unwrap().unwrap();
    assert_eq!(record.last_attempt_id, report.attempt_id);
    assert_eq!(record.last_phase, Phase::Committed);
    assert_eq!(record.active.unwrap().artifact_digest, "sha256:d1");

    h.world.fail_next(MockOp::Push, DeployError::Network("reset".into()));
    h.world.fail_next(MockOp::Push, DeployError::Network("reset".into()));
    h.world.fail_next(MockOp::Push, DeployError::Network("reset".into()));
    let failed = h.orchestrator.deploy(request("2.0.0")).await.unwrap();
    let record = h.orchestrator.status().await.unwrap().unwrap();
    assert_eq!(record.last_phase, Phase::Failed);
    // The failed attempt never touched the target; d1 is still active
    assert_eq!(record.active.unwrap().artifact_digest, "sha256:d1");
    assert_eq!(failed.active.unwrap().artifact_digest, "sha256:d1");
}

#[tokio::test]
async fn test_empty_tag_is_rejected() {
    let h = harness();
    let result = h.orchestrator.begin(request(" "));
    assert!(matches!(result, Err(DeployError::Config(_))));
    assert!(h.world.calls().is_empty());
}
