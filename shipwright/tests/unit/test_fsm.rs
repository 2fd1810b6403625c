//! FSM unit tests

use shipwright::deploy::fsm::{DeploymentEvent, DeploymentFsm, Phase};
use tokio_test::{assert_err, assert_ok};

fn pushed() -> DeploymentFsm {
    let mut fsm = DeploymentFsm::new();
    fsm.process(DeploymentEvent::Request).unwrap();
    fsm.process(DeploymentEvent::Built).unwrap();
    fsm.process(DeploymentEvent::Pushed).unwrap();
    fsm
}

#[test]
fn test_fsm_initial_state() {
    let fsm = DeploymentFsm::new();
    assert_eq!(fsm.state(), Phase::Idle);
    assert!(fsm.error().is_none());
    assert_eq!(fsm.history().len(), 1);
}

#[test]
fn test_fsm_build_failure_flow() {
    let mut fsm = DeploymentFsm::new();

    fsm.process(DeploymentEvent::Request).unwrap();
    fsm.process(DeploymentEvent::BuildFailed("COPY failed: no such file".to_string()))
        .unwrap();

    assert_eq!(fsm.state(), Phase::Failed);
    assert_eq!(fsm.error(), Some("COPY failed: no such file"));
}

#[test]
fn test_fsm_push_failure_flow() {
    let mut fsm = DeploymentFsm::new();

    fsm.process(DeploymentEvent::Request).unwrap();
    fsm.process(DeploymentEvent::Built).unwrap();
    fsm.process(DeploymentEvent::PushFailed("denied".to_string()))
        .unwrap();

    assert_eq!(fsm.state(), Phase::Failed);
    assert!(!fsm.visited(Phase::Swapping));
}

#[test]
fn test_fsm_unhealthy_rolls_back() {
    let mut fsm = pushed();

    // Swapping -> Verifying
    fsm.process(DeploymentEvent::Swapped).unwrap();
    assert_eq!(fsm.state(), Phase::Verifying);

    // Verifying -> RollingBack
    fsm.process(DeploymentEvent::Unhealthy("503".to_string()))
        .unwrap();
    assert_eq!(fsm.state(), Phase::RollingBack);

    // RollingBack -> RolledBack
    fsm.process(DeploymentEvent::Restored).unwrap();
    assert_eq!(fsm.state(), Phase::RolledBack);
    assert_eq!(fsm.error(), Some("503"));
}

#[test]
fn test_fsm_rollback_failure_is_terminal() {
    let mut fsm = pushed();

    fsm.process(DeploymentEvent::SwapFailed {
        error: "run failed".to_string(),
        old_instance_touched: true,
    })
    .unwrap();
    fsm.process(DeploymentEvent::RollbackFailed("old image gone".to_string()))
        .unwrap();

    assert_eq!(fsm.state(), Phase::Failed);
    assert_eq!(fsm.error(), Some("old image gone"));
    assert_err!(fsm.process(DeploymentEvent::Restored));
}

#[test]
fn test_fsm_cancel_only_before_swap() {
    for prefix in 0..3 {
        let mut fsm = DeploymentFsm::new();
        let events = [DeploymentEvent::Request, DeploymentEvent::Built];
        for event in events.into_iter().take(prefix) {
            fsm.process(event).unwrap();
        }
        assert!(fsm.state().allows_cancel());
        assert_eq!(assert_ok!(fsm.process(DeploymentEvent::Cancelled)), Phase::Failed);
    }

    let mut swapping = pushed();
    assert!(!swapping.state().allows_cancel());
    assert_err!(swapping.process(DeploymentEvent::Cancelled));
    assert_eq!(swapping.state(), Phase::Swapping);
}

#[test]
fn test_fsm_never_rolls_back_before_swap() {
    let pre_swap_failures = || {
        vec![
            DeploymentEvent::BuildFailed("x".into()),
            DeploymentEvent::PushFailed("x".into()),
            DeploymentEvent::Unhealthy("x".into()),
            DeploymentEvent::SwapFailed {
                error: "x".into(),
                old_instance_touched: true,
            },
            DeploymentEvent::Cancelled,
        ]
    };

    for (setup, label) in [(1, Phase::Building), (2, Phase::Pushing)] {
        for event in pre_swap_failures() {
            let mut fsm = DeploymentFsm::new();
            fsm.process(DeploymentEvent::Request).unwrap();
            if setup == 2 {
                fsm.process(DeploymentEvent::Built).unwrap();
            }
            assert_eq!(fsm.state(), label);
            let _ = fsm.process(event);
            assert_ne!(fsm.state(), Phase::RollingBack);
        }
    }
}

#[test]
fn test_fsm_invalid_transition() {
    let mut fsm = DeploymentFsm::new();

    // Cannot verify before anything was built
    let result = fsm.process(DeploymentEvent::Healthy);
    assert!(result.is_err());
    assert_eq!(fsm.state(), Phase::Idle);
    assert_eq!(fsm.history().len(), 1);
}

#[test]
fn test_phase_serde() {
    assert_eq!(
        serde_json::to_string(&Phase::RollingBack).unwrap(),
        "\"rolling_back\""
    );
    let phase: Phase = serde_json::from_str("\"rolled_back\"").unwrap();
    assert_eq!(phase, Phase::RolledBack);
}
