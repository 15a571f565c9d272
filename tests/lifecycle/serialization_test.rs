/*!
 * Serialization Tests
 * One operation per instance at a time
 */

use crate::common::fixture;
use fleet_orchestrator::{InstanceStatus, OrchestratorError};
use pretty_assertions::assert_eq;
use std::time::Duration;

#[tokio::test(start_paused = true)]
async fn test_concurrent_stop_and_start_one_is_rejected() {
    let f = fixture();
    let id = f.running(10.0, 128.0).await;
    f.template.set_stop_delay(Duration::from_secs(5));

    let (stopped, started) = tokio::join!(f.orchestrator.stop(&id), f.orchestrator.start(&id));

    assert!(stopped.is_ok());
    assert_eq!(
        started,
        Err(OrchestratorError::OperationInProgress(id.clone()))
    );
    assert_eq!(f.status(&id), InstanceStatus::Stopped);
    assert_eq!(f.template.count("start"), 1);

    // Free again once the stop has finished
    f.template.set_stop_delay(Duration::ZERO);
    f.orchestrator.start(&id).await.unwrap();
    assert_eq!(f.status(&id), InstanceStatus::Running);
}

#[tokio::test(start_paused = true)]
async fn test_delete_during_stop_is_rejected() {
    let f = fixture();
    let id = f.running(10.0, 128.0).await;
    f.template.set_stop_delay(Duration::from_secs(5));

    let (stopped, deleted) = tokio::join!(f.orchestrator.stop(&id), f.orchestrator.delete(&id));

    assert!(stopped.is_ok());
    assert!(matches!(
        deleted,
        Err(OrchestratorError::OperationInProgress(_))
    ));
    assert_eq!(f.status(&id), InstanceStatus::Stopped);
    assert_eq!(f.template.count("delete"), 0);
}

#[tokio::test(start_paused = true)]
async fn test_other_instances_are_not_blocked() {
    let f = fixture();
    let a = f.running(10.0, 128.0).await;
    let b = f.running(10.0, 128.0).await;
    f.template.set_stop_delay(Duration::from_secs(5));

    let (first, second) = tokio::join!(f.orchestrator.stop(&a), f.orchestrator.stop(&b));

    assert!(first.is_ok());
    assert!(second.is_ok());
    assert_eq!(f.status(&a), InstanceStatus::Stopped);
    assert_eq!(f.status(&b), InstanceStatus::Stopped);
    assert_eq!(f.template.count("stop"), 2);
}

#[tokio::test(start_paused = true)]
async fn test_slow_stop_times_out_into_failed() {
    let f = fixture_with_short_stop();
    let id = f.running(10.0, 128.0).await;
    f.template.set_stop_delay(Duration::from_secs(10));

    let result = f.orchestrator.stop(&id).await;
    assert!(matches!(result, Err(OrchestratorError::Timeout { .. })));
    let report = f.orchestrator.get_status(&id).unwrap();
    assert_eq!(report.status, InstanceStatus::Failed);
    assert!(report.last_error.is_some());
}

fn fixture_with_short_stop() -> crate::common::Fixture {
    crate::common::fixture_with(|config| config.timeouts.stop = Duration::from_secs(2))
}
