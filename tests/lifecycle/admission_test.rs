/*!
 * Admission Tests
 * Budget, port and thermal checks at creation time
 */

use crate::common::{fixture, spec};
use fleet_orchestrator::{Budget, InstanceStatus, OrchestratorError, Priority};
use pretty_assertions::assert_eq;

#[tokio::test]
async fn test_second_half_host_request_is_rejected() {
    let f = fixture();
    let first = f
        .orchestrator
        .create_instance(spec(50.0, 1024.0))
        .await
        .unwrap();
    assert_eq!(f.status(&first), InstanceStatus::Created);

    let second = f.orchestrator.create_instance(spec(50.0, 1024.0)).await;
    assert!(matches!(
        second,
        Err(OrchestratorError::ResourceExhausted { .. })
    ));

    let snapshot = f.orchestrator.system_snapshot().await;
    assert_eq!(snapshot.ledger.allocated, Budget::new(50.0, 1024.0, 0.0));
    assert_eq!(f.orchestrator.list_instances().len(), 1);
}

#[tokio::test]
async fn test_explicit_port_conflict_debits_nothing() {
    let f = fixture();
    f.orchestrator
        .create_instance(spec(10.0, 128.0).with_port(8080))
        .await
        .unwrap();
    let before = f.orchestrator.system_snapshot().await.ledger.allocated;

    let result = f
        .orchestrator
        .create_instance(spec(10.0, 128.0).with_port(8080))
        .await;
    assert_eq!(result, Err(OrchestratorError::PortConflict(8080)));

    let after = f.orchestrator.system_snapshot().await.ledger.allocated;
    assert_eq!(before, after);
    assert_eq!(f.orchestrator.list_instances().len(), 1);
}

#[tokio::test]
async fn test_auto_assigned_ports_are_distinct() {
    let f = fixture();
    let a = f.orchestrator.create_instance(spec(5.0, 64.0)).await.unwrap();
    let b = f.orchestrator.create_instance(spec(5.0, 64.0)).await.unwrap();
    let port_a = f.orchestrator.get_status(&a).unwrap().port;
    let port_b = f.orchestrator.get_status(&b).unwrap().port;
    assert_ne!(port_a, port_b);
}

#[tokio::test]
async fn test_hot_host_rejects_creation() {
    let f = fixture();
    f.thermal.set(Some(75.0));
    let result = f.orchestrator.create_instance(spec(10.0, 128.0)).await;
    assert!(matches!(result, Err(OrchestratorError::ThermalUnsafe { .. })));

    // Nothing was reserved, so the same port is still free once it cools down
    f.thermal.set(Some(40.0));
    f.orchestrator
        .create_instance(spec(10.0, 128.0).with_port(8000))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_invalid_budget_is_config_error() {
    let f = fixture();
    let result = f.orchestrator.create_instance(spec(-5.0, 128.0)).await;
    assert!(matches!(result, Err(OrchestratorError::ConfigInvalid(_))));

    let unknown = f
        .orchestrator
        .create_instance(fleet_orchestrator::InstanceSpec::new(
            "no-such-kind",
            Budget::new(5.0, 64.0, 0.0),
        ))
        .await;
    assert!(unknown.is_err());
    assert!(f.orchestrator.list_instances().is_empty());
}

#[tokio::test]
async fn test_high_priority_reclaims_from_low() {
    let f = fixture();
    let low = f
        .orchestrator
        .create_instance(spec(60.0, 256.0).with_priority(Priority::Low))
        .await
        .unwrap();

    // 60 + 40 > 90: the low instance is shrunk toward half its request
    let high = f
        .orchestrator
        .create_instance(spec(40.0, 256.0).with_priority(Priority::High))
        .await
        .unwrap();

    let high_report = f.orchestrator.get_status(&high).unwrap();
    assert_eq!(high_report.budget.granted, high_report.budget.requested);

    let low_report = f.orchestrator.get_status(&low).unwrap();
    assert!(low_report.budget.granted.cpu_percent < 60.0);
    assert!(low_report.budget.granted.cpu_percent >= 30.0);

    let snapshot = f.orchestrator.system_snapshot().await;
    assert!(snapshot.ledger.allocated.fits_within(&snapshot.ledger.limit));
}
