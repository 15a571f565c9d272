/*!
 * Lifecycle Tests
 * Start/stop/restart/delete against a recording template
 */

use crate::common::{fixture, spec};
use fleet_orchestrator::instance::DeploymentStage;
use fleet_orchestrator::{Budget, FleetEvent, InstanceStatus, OrchestratorError};
use pretty_assertions::assert_eq;
use std::sync::atomic::Ordering;

#[tokio::test]
async fn test_full_lifecycle() {
    let f = fixture();
    let id = f
        .orchestrator
        .create_instance(spec(20.0, 256.0).with_name("web"))
        .await
        .unwrap();

    f.orchestrator.start(&id).await.unwrap();
    let report = f.orchestrator.get_status(&id).unwrap();
    assert_eq!(report.status, InstanceStatus::Running);
    assert_eq!(report.deployment_stage, DeploymentStage::Completed);
    assert_eq!(report.budget.granted, Budget::new(20.0, 256.0, 0.0));
    assert_eq!(f.template.count("deploy"), 1);
    assert_eq!(f.template.count("start"), 1);

    f.orchestrator.stop(&id).await.unwrap();
    assert_eq!(f.status(&id), InstanceStatus::Stopped);
    let snapshot = f.orchestrator.system_snapshot().await;
    assert_eq!(snapshot.ledger.allocated, Budget::ZERO);

    // Deploy is first-time provisioning only
    f.orchestrator.start(&id).await.unwrap();
    assert_eq!(f.template.count("deploy"), 1);
    assert_eq!(f.template.count("start"), 2);

    f.orchestrator.restart(&id).await.unwrap();
    assert_eq!(f.status(&id), InstanceStatus::Running);
    assert_eq!(f.template.count("stop"), 2);
    assert_eq!(f.template.count("start"), 3);

    f.orchestrator.delete(&id).await.unwrap();
    assert_eq!(f.template.count("delete"), 1);
    assert!(matches!(
        f.orchestrator.get_status(&id),
        Err(OrchestratorError::NotFound(_))
    ));
    let snapshot = f.orchestrator.system_snapshot().await;
    assert_eq!(snapshot.ledger.allocated, Budget::ZERO);
    assert!(f.orchestrator.list_instances().is_empty());
}

#[tokio::test]
async fn test_stop_is_idempotent() {
    let f = fixture();
    let id = f.running(10.0, 128.0).await;

    f.orchestrator.stop(&id).await.unwrap();
    assert_eq!(f.template.count("stop"), 1);

    f.orchestrator.stop(&id).await.unwrap();
    f.orchestrator.stop(&id).await.unwrap();
    assert_eq!(f.template.count("stop"), 1);
    assert_eq!(f.status(&id), InstanceStatus::Stopped);
}

#[tokio::test]
async fn test_start_while_running_is_noop() {
    let f = fixture();
    let id = f.running(10.0, 128.0).await;
    f.orchestrator.start(&id).await.unwrap();
    assert_eq!(f.template.count("start"), 1);
}

#[tokio::test]
async fn test_unknown_instance_is_not_found() {
    let f = fixture();
    let ghost = "svc-missing".into();
    assert!(matches!(
        f.orchestrator.start(&ghost).await,
        Err(OrchestratorError::NotFound(_))
    ));
    assert!(matches!(
        f.orchestrator.delete(&ghost).await,
        Err(OrchestratorError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_start_failure_lands_in_failed_with_log_location() {
    let f = fixture();
    let id = f.orchestrator.create_instance(spec(10.0, 128.0)).await.unwrap();
    f.template.fail_start.store(true, Ordering::SeqCst);

    let err = f.orchestrator.start(&id).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::StartError { .. }));
    let log = err.log_location().unwrap().to_string();
    assert!(log.ends_with(&format!("{}.log", id)));

    let report = f.orchestrator.get_status(&id).unwrap();
    assert_eq!(report.status, InstanceStatus::Failed);
    assert_eq!(report.deployment_stage, DeploymentStage::Failed);
    assert_eq!(report.budget.granted, Budget::ZERO);
    assert_eq!(report.last_error.unwrap().log_location, Some(log));
    assert_eq!(
        f.orchestrator.system_snapshot().await.ledger.allocated,
        Budget::ZERO
    );

    // A manual start re-admits and succeeds once the template behaves
    f.template.fail_start.store(false, Ordering::SeqCst);
    f.orchestrator.start(&id).await.unwrap();
    assert_eq!(f.status(&id), InstanceStatus::Running);
}

#[tokio::test]
async fn test_deploy_failure_is_deploy_error() {
    let f = fixture();
    let id = f.orchestrator.create_instance(spec(10.0, 128.0)).await.unwrap();
    f.template.fail_deploy.store(true, Ordering::SeqCst);

    let err = f.orchestrator.start(&id).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::DeployError { .. }));
    assert_eq!(f.status(&id), InstanceStatus::Failed);
    assert_eq!(f.template.count("start"), 0);
}

#[tokio::test(start_paused = true)]
async fn test_unhealthy_start_fails_verification() {
    let f = fixture();
    let id = f.orchestrator.create_instance(spec(10.0, 128.0)).await.unwrap();
    f.prober.set_healthy(false);

    let err = f.orchestrator.start(&id).await.unwrap_err();
    match err {
        OrchestratorError::StartError { reason, .. } => {
            assert!(reason.contains("health verification failed"))
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(f.status(&id), InstanceStatus::Failed);
    assert_eq!(f.prober.probes(), 3);
    assert_eq!(f.template.count("stop"), 1);
}

#[tokio::test]
async fn test_stop_error_lands_in_stopped() {
    let f = fixture();
    let id = f.running(10.0, 128.0).await;
    f.template.fail_stop.store(true, Ordering::SeqCst);

    let err = f.orchestrator.stop(&id).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::StopError { .. }));
    let report = f.orchestrator.get_status(&id).unwrap();
    assert_eq!(report.status, InstanceStatus::Stopped);
    assert!(report.last_error.is_some());
    assert_eq!(report.budget.granted, Budget::ZERO);
}

#[tokio::test]
async fn test_stop_on_created_is_invalid() {
    let f = fixture();
    let id = f.orchestrator.create_instance(spec(10.0, 128.0)).await.unwrap();
    assert!(matches!(
        f.orchestrator.stop(&id).await,
        Err(OrchestratorError::InvalidTransition { .. })
    ));
    assert_eq!(f.status(&id), InstanceStatus::Created);
}

#[tokio::test]
async fn test_status_changes_are_broadcast() {
    let f = fixture();
    let mut events = f.orchestrator.subscribe();
    let id = f.running(10.0, 128.0).await;

    let mut transitions = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let FleetEvent::StatusChanged { id: changed, to, .. } = event {
            assert_eq!(changed, id);
            transitions.push(to);
        }
    }
    assert_eq!(
        transitions,
        vec![
            InstanceStatus::Allocating,
            InstanceStatus::Deploying,
            InstanceStatus::Running
        ]
    );
}

#[tokio::test]
async fn test_snapshot_reports_counts_and_thermal() {
    let f = fixture();
    f.running(20.0, 256.0).await;
    f.orchestrator.create_instance(spec(5.0, 64.0)).await.unwrap();

    let snapshot = f.orchestrator.system_snapshot().await;
    assert_eq!(snapshot.instances.get(&InstanceStatus::Running), Some(&1));
    assert_eq!(snapshot.instances.get(&InstanceStatus::Created), Some(&1));
    assert_eq!(snapshot.ledger.allocated, Budget::new(25.0, 320.0, 0.0));
    assert_eq!(snapshot.thermal.celsius, Some(40.0));
    assert!(snapshot.thermal.safe_to_start);
    assert_eq!(snapshot.ledger.capacity.cpu_percent, 100.0);
}
