/*!
 * Persistence Tests
 * Atomic state writes and restore across orchestrator restarts
 */

use crate::common::{assert_near, fixture, spec, wait_for_status};
use fleet_orchestrator::core::limits::STATE_FILE_VERSION;
use fleet_orchestrator::instance::DeploymentStage;
use fleet_orchestrator::storage::{read_json, write_json_atomic, StateFile};
use fleet_orchestrator::{
    Budget, Clock, InstanceId, InstanceStatus, OrchestratorError, ServiceInstance,
};
use pretty_assertions::assert_eq;
use std::path::Path;
use std::time::Duration;

async fn write_state(path: &Path, instances: Vec<ServiceInstance>, saved_at: u64) {
    let state = StateFile {
        version: STATE_FILE_VERSION,
        saved_at,
        revision: 1,
        instances,
    };
    write_json_atomic(path, &state).await.unwrap();
}

fn persisted(status: InstanceStatus, port: u16, now: u64) -> ServiceInstance {
    let spec = spec(20.0, 256.0);
    let granted = if status.holds_budget() {
        spec.budget
    } else {
        Budget::ZERO
    };
    let mut instance = ServiceInstance::new(InstanceId::generate(), &spec, port, granted, 100, now);
    instance.status = status;
    instance.deployed = true;
    instance
}

#[tokio::test]
async fn test_state_file_tracks_every_change() {
    let f = fixture();
    let id = f.running(10.0, 128.0).await;
    let path = f.orchestrator.config().storage.state_path.clone();

    let state: StateFile = read_json(&path).await.unwrap().unwrap();
    assert_eq!(state.version, STATE_FILE_VERSION);
    assert_eq!(state.instances.len(), 1);
    assert_eq!(state.instances[0].id, id);
    assert_eq!(state.instances[0].status, InstanceStatus::Running);

    f.orchestrator.stop(&id).await.unwrap();
    let state: StateFile = read_json(&path).await.unwrap().unwrap();
    assert_eq!(state.instances[0].status, InstanceStatus::Stopped);
    assert_eq!(state.instances[0].granted, Budget::ZERO);

    // No temp file is left next to the state file
    let leftovers: Vec<_> = std::fs::read_dir(f.dir.path())
        .unwrap()
        .filter_map(Result::ok)
        .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
        .collect();
    assert!(leftovers.is_empty());
}

#[tokio::test]
async fn test_missing_state_file_is_empty_fleet() {
    let f = fixture();
    let report = f.orchestrator.restore().await.unwrap();
    assert_eq!(report.restored, 0);
    assert!(f.orchestrator.list_instances().is_empty());
}

#[tokio::test]
async fn test_restore_resumes_running_and_stopped() {
    let f = fixture();
    let running = f
        .running_spec(spec(20.0, 256.0).with_port(8100))
        .await;
    let stopped = f.running(10.0, 128.0).await;
    f.orchestrator.stop(&stopped).await.unwrap();
    f.orchestrator.shutdown().await.unwrap();

    let reopened = f.reopen();
    let report = reopened.restore().await.unwrap();
    assert_eq!(report.restored, 2);
    assert_eq!(report.monitored, vec![running.clone()]);
    assert!(report.recovering.is_empty());

    assert_eq!(
        reopened.get_status(&running).unwrap().status,
        InstanceStatus::Running
    );
    assert_eq!(
        reopened.get_status(&stopped).unwrap().status,
        InstanceStatus::Stopped
    );
    let snapshot = reopened.system_snapshot().await;
    assert_eq!(snapshot.ledger.allocated, Budget::new(20.0, 256.0, 0.0));

    // The restored port is still taken
    assert_eq!(
        reopened
            .create_instance(spec(5.0, 64.0).with_port(8100))
            .await,
        Err(OrchestratorError::PortConflict(8100))
    );

    // Restored instances are fully operable
    reopened.stop(&running).await.unwrap();
    reopened.start(&stopped).await.unwrap();
    assert_eq!(
        reopened.get_status(&stopped).unwrap().status,
        InstanceStatus::Running
    );
}

#[tokio::test]
async fn test_interrupted_deploy_settles_to_failed() {
    let f = fixture();
    let now = f.clock.now_ms();
    let instance = persisted(InstanceStatus::Deploying, 8200, now);
    let id = instance.id.clone();
    write_state(&f.orchestrator.config().storage.state_path, vec![instance], now).await;

    let reopened = f.reopen();
    let report = reopened.restore().await.unwrap();
    assert_eq!(report.restored, 1);

    let status = reopened.get_status(&id).unwrap();
    assert_eq!(status.status, InstanceStatus::Failed);
    assert_eq!(status.deployment_stage, DeploymentStage::Failed);
    assert_eq!(status.budget.granted, Budget::ZERO);
    assert_eq!(
        reopened.system_snapshot().await.ledger.allocated,
        Budget::ZERO
    );
    assert_eq!(
        reopened
            .create_instance(spec(5.0, 64.0).with_port(8200))
            .await,
        Err(OrchestratorError::PortConflict(8200))
    );

    // The settled state is written back
    let state: StateFile = read_json(&reopened.config().storage.state_path)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(state.instances[0].status, InstanceStatus::Failed);
}

#[tokio::test]
async fn test_interrupted_stop_settles_to_stopped() {
    let f = fixture();
    let now = f.clock.now_ms();
    let instance = persisted(InstanceStatus::Stopping, 8201, now);
    let id = instance.id.clone();
    write_state(&f.orchestrator.config().storage.state_path, vec![instance], now).await;

    let reopened = f.reopen();
    reopened.restore().await.unwrap();
    assert_eq!(
        reopened.get_status(&id).unwrap().status,
        InstanceStatus::Stopped
    );
}

#[tokio::test(start_paused = true)]
async fn test_interrupted_recovery_resumes() {
    let f = fixture();
    let now = f.clock.now_ms();
    let mut instance = persisted(InstanceStatus::Recovering, 8300, now);
    instance.recovery_state.attempt_count = 1;
    instance.recovery_state.last_attempt_at = Some(now);
    let id = instance.id.clone();
    write_state(&f.orchestrator.config().storage.state_path, vec![instance], now).await;

    let reopened = f.reopen();
    let report = reopened.restore().await.unwrap();
    assert_eq!(report.recovering, vec![id.clone()]);
    assert_eq!(
        reopened.system_snapshot().await.ledger.allocated,
        Budget::new(20.0, 256.0, 0.0)
    );

    // Attempt two is due 60s after attempt one, not 60s after the restart
    assert!(wait_for_status(&reopened, &id, InstanceStatus::Running, Duration::from_secs(90)).await);
    let starts = f.template.times("start");
    assert_eq!(starts.len(), 1);
    assert_near(starts[0], now + 60_000);
    assert_eq!(
        reopened.get_status(&id).unwrap().recovery_state.attempt_count,
        0
    );
}

#[tokio::test]
async fn test_corrupt_state_file_is_reported() {
    let f = fixture();
    let path = f.orchestrator.config().storage.state_path.clone();
    std::fs::write(&path, b"{ not json").unwrap();

    let result = f.reopen().restore().await;
    assert!(matches!(result, Err(OrchestratorError::Storage(_))));
}

#[tokio::test]
async fn test_unknown_state_version_is_rejected() {
    let f = fixture();
    let path = f.orchestrator.config().storage.state_path.clone();
    let state = StateFile {
        version: STATE_FILE_VERSION + 1,
        saved_at: 0,
        revision: 0,
        instances: Vec::new(),
    };
    write_json_atomic(&path, &state).await.unwrap();

    let result = f.reopen().restore().await;
    assert!(matches!(result, Err(OrchestratorError::Storage(_))));
}
