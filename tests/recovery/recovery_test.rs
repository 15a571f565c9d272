/*!
 * Recovery Tests
 * Degradation, backoff timing, bounded retries and cancellation
 */

use crate::common::{assert_near, fixture, fixture_with, wait_for_status, Fixture};
use fleet_orchestrator::{Clock, InstanceId, InstanceStatus, OrchestratorError, ProbeOutcome};
use pretty_assertions::assert_eq;
use std::sync::atomic::Ordering;
use std::time::Duration;

/// Fail probes until the health monitor degrades `id`; returns the time it happened
async fn degrade(f: &Fixture, id: &InstanceId) -> u64 {
    f.prober.set_healthy(false);
    let threshold = f.orchestrator.config().health.failure_threshold;
    for round in 1..=threshold {
        let reports = f.orchestrator.health().check_all().await;
        let report = reports.iter().find(|r| &r.id == id).unwrap();
        assert_eq!(report.consecutive_failures, round);
        assert_eq!(report.degraded, round == threshold);
    }
    f.clock.now_ms()
}

#[tokio::test(start_paused = true)]
async fn test_backoff_schedule_then_failed() {
    let f = fixture_with(|c| c.recovery.retry_after_cooldown = false);
    let id = f.running(10.0, 128.0).await;

    let t0 = degrade(&f, &id).await;
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(f.status(&id), InstanceStatus::Recovering);

    tokio::time::sleep(Duration::from_secs(400)).await;

    // Initial start plus three attempts at +30s, +90s, +210s
    let starts = f.template.times("start");
    assert_eq!(starts.len(), 4);
    assert_near(starts[1], t0 + 30_000);
    assert_near(starts[2], starts[1] + 60_000);
    assert_near(starts[3], starts[2] + 120_000);

    let report = f.orchestrator.get_status(&id).unwrap();
    assert_eq!(report.status, InstanceStatus::Failed);
    assert_eq!(report.recovery_state.attempt_count, 3);
    let last_attempt = report.recovery_state.last_attempt_at.unwrap();
    assert_eq!(
        report.recovery_state.cooldown_until,
        Some(last_attempt + 300_000)
    );
    assert!(report
        .last_error
        .unwrap()
        .message
        .contains("recovery exhausted"));
    assert_eq!(
        f.orchestrator.system_snapshot().await.ledger.allocated,
        fleet_orchestrator::Budget::ZERO
    );
}

#[tokio::test(start_paused = true)]
async fn test_attempts_are_bounded() {
    let f = fixture_with(|c| c.recovery.retry_after_cooldown = false);
    let id = f.running(10.0, 128.0).await;
    degrade(&f, &id).await;

    // Long after the cooldown would have elapsed
    tokio::time::sleep(Duration::from_secs(3_600)).await;
    assert_eq!(f.status(&id), InstanceStatus::Failed);
    assert_eq!(f.template.count("start"), 4);
    assert!(!f.orchestrator.supervisor().timers().is_pending(&id));
}

#[tokio::test(start_paused = true)]
async fn test_stop_errors_do_not_stall_exhaustion() {
    let f = fixture_with(|c| c.recovery.retry_after_cooldown = false);
    let id = f.running(10.0, 128.0).await;
    f.template.fail_stop.store(true, Ordering::SeqCst);
    degrade(&f, &id).await;

    tokio::time::sleep(Duration::from_secs(400)).await;
    let report = f.orchestrator.get_status(&id).unwrap();
    assert_eq!(report.status, InstanceStatus::Failed);
    assert_eq!(report.recovery_state.attempt_count, 3);
    assert!(report.recovery_state.cooldown_until.is_some());
    assert_eq!(f.template.count("start"), 4);
    assert_eq!(
        f.orchestrator.system_snapshot().await.ledger.allocated,
        fleet_orchestrator::Budget::ZERO
    );
}

#[tokio::test(start_paused = true)]
async fn test_fresh_cycle_after_cooldown() {
    let f = fixture_with(|c| {
        c.recovery.max_attempts = 1;
        c.recovery.backoff_base = Duration::from_secs(10);
        c.recovery.cooldown = Duration::from_secs(60);
    });
    let id = f.running(10.0, 128.0).await;
    let t0 = degrade(&f, &id).await;

    tokio::time::sleep(Duration::from_secs(15)).await;
    let report = f.orchestrator.get_status(&id).unwrap();
    assert_eq!(report.status, InstanceStatus::Failed);
    let cooldown_until = report.recovery_state.cooldown_until.unwrap();
    assert_near(cooldown_until, t0 + 70_000);

    f.prober.set_healthy(true);
    assert!(wait_for_status(&f.orchestrator, &id, InstanceStatus::Running, Duration::from_secs(120)).await);

    let starts = f.template.times("start");
    assert_eq!(starts.len(), 3);
    assert_near(starts[1], t0 + 10_000);
    assert_near(starts[2], cooldown_until + 10_000);

    let report = f.orchestrator.get_status(&id).unwrap();
    assert_eq!(report.recovery_state.attempt_count, 0);
    assert_eq!(report.recovery_state.cooldown_until, None);
    assert_eq!(report.budget.granted, report.budget.requested);
}

#[tokio::test(start_paused = true)]
async fn test_stop_cancels_pending_recovery() {
    let f = fixture();
    let id = f.running(10.0, 128.0).await;
    degrade(&f, &id).await;

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(f.status(&id), InstanceStatus::Recovering);
    assert!(f.orchestrator.supervisor().timers().is_pending(&id));

    f.orchestrator.stop(&id).await.unwrap();
    assert_eq!(f.status(&id), InstanceStatus::Stopped);
    assert!(!f.orchestrator.supervisor().timers().is_pending(&id));

    // The attempt that was due at +30s never runs
    tokio::time::sleep(Duration::from_secs(600)).await;
    assert_eq!(f.status(&id), InstanceStatus::Stopped);
    assert_eq!(f.template.count("start"), 1);
    assert_eq!(f.template.count("stop"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_successful_attempt_returns_to_running() {
    let f = fixture();
    let id = f.running(10.0, 128.0).await;
    let t0 = degrade(&f, &id).await;
    f.prober.set_healthy(true);

    assert!(wait_for_status(&f.orchestrator, &id, InstanceStatus::Running, Duration::from_secs(60)).await);
    let starts = f.template.times("start");
    assert_eq!(starts.len(), 2);
    assert_near(starts[1], t0 + 30_000);

    let report = f.orchestrator.get_status(&id).unwrap();
    assert_eq!(report.recovery_state.attempt_count, 0);
    assert_eq!(report.recovery_state.last_attempt_at, None);
    assert_eq!(report.health_summary.consecutive_failures, 0);
    assert!(report.last_error.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_probe_failures_below_threshold_keep_running() {
    let f = fixture();
    let id = f.running(10.0, 128.0).await;
    f.prober.set_healthy(false);
    f.orchestrator.health().check_all().await;
    f.orchestrator.health().check_all().await;
    f.prober.set_healthy(true);
    let reports = f.orchestrator.health().check_all().await;

    assert_eq!(reports[0].consecutive_failures, 0);
    assert_eq!(f.status(&id), InstanceStatus::Running);
    assert!(!f.orchestrator.supervisor().timers().is_pending(&id));
}

#[tokio::test(start_paused = true)]
async fn test_health_check_timeout_counts_as_failure() {
    let f = fixture();
    let id = f.running(10.0, 128.0).await;
    f.prober.set_hanging(true);

    let reports = f.orchestrator.health().check_all().await;
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].outcome, ProbeOutcome::TimedOut);
    assert_eq!(
        reports[0].error,
        Some(OrchestratorError::HealthCheckTimeout(id.clone()))
    );
    assert_eq!(reports[0].consecutive_failures, 1);
    assert_eq!(f.status(&id), InstanceStatus::Running);

    // A healthy answer clears the count and the error
    f.prober.set_hanging(false);
    let reports = f.orchestrator.health().check_all().await;
    assert_eq!(reports[0].consecutive_failures, 0);
    assert!(reports[0].error.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_unhealthy_instance_does_not_affect_others() {
    let f = fixture();
    let sick = f.running(10.0, 128.0).await;
    let well = f.running(10.0, 128.0).await;
    f.prober.set_instance(&well, true);

    degrade(&f, &sick).await;
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(f.status(&sick), InstanceStatus::Recovering);
    assert_eq!(f.status(&well), InstanceStatus::Running);
}

#[tokio::test(start_paused = true)]
async fn test_start_while_recovering_keeps_pending_attempt() {
    let f = fixture();
    let id = f.running(10.0, 128.0).await;
    let t0 = degrade(&f, &id).await;
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(f.status(&id), InstanceStatus::Recovering);

    let result = f.orchestrator.start(&id).await;
    assert!(matches!(result, Err(OrchestratorError::InvalidTransition { .. })));
    assert!(f.orchestrator.supervisor().timers().is_pending(&id));

    // The scheduled attempt still runs and brings the instance back
    f.prober.set_healthy(true);
    assert!(wait_for_status(&f.orchestrator, &id, InstanceStatus::Running, Duration::from_secs(60)).await);
    let starts = f.template.times("start");
    assert_eq!(starts.len(), 2);
    assert_near(starts[1], t0 + 30_000);
}

#[tokio::test(start_paused = true)]
async fn test_rejected_restart_keeps_cooldown_cycle() {
    let f = fixture_with(|c| {
        c.recovery.max_attempts = 1;
        c.recovery.backoff_base = Duration::from_secs(10);
        c.recovery.cooldown = Duration::from_secs(60);
    });
    let id = f.running(10.0, 128.0).await;
    degrade(&f, &id).await;
    tokio::time::sleep(Duration::from_secs(15)).await;
    let cooldown_until = f
        .orchestrator
        .get_status(&id)
        .unwrap()
        .recovery_state
        .cooldown_until
        .unwrap();

    f.thermal.set(Some(90.0));
    let result = f.orchestrator.restart(&id).await;
    assert!(matches!(result, Err(OrchestratorError::ThermalUnsafe { .. })));
    assert_eq!(f.status(&id), InstanceStatus::Failed);
    assert!(f.orchestrator.supervisor().timers().is_pending(&id));
    assert_eq!(
        f.orchestrator.get_status(&id).unwrap().recovery_state.cooldown_until,
        Some(cooldown_until)
    );

    f.thermal.set(Some(40.0));
    f.prober.set_healthy(true);
    assert!(wait_for_status(&f.orchestrator, &id, InstanceStatus::Running, Duration::from_secs(120)).await);
    let starts = f.template.times("start");
    assert_eq!(starts.len(), 3);
    assert_near(starts[2], cooldown_until + 10_000);
}

#[tokio::test(start_paused = true)]
async fn test_failed_manual_restart_goes_back_to_recovery() {
    let f = fixture();
    let id = f.running(10.0, 128.0).await;
    degrade(&f, &id).await;
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(f.status(&id), InstanceStatus::Recovering);

    // Still unhealthy, so startup verification fails
    let result = f.orchestrator.restart(&id).await;
    assert!(matches!(result, Err(OrchestratorError::StartError { .. })));
    let report = f.orchestrator.get_status(&id).unwrap();
    assert_eq!(report.status, InstanceStatus::Failed);
    let cooldown_until = report.recovery_state.cooldown_until.unwrap();
    assert_near(cooldown_until, f.clock.now_ms() + 300_000);
    assert!(f.orchestrator.supervisor().timers().is_pending(&id));

    f.prober.set_healthy(true);
    assert!(wait_for_status(&f.orchestrator, &id, InstanceStatus::Running, Duration::from_secs(400)).await);
    let starts = f.template.times("start");
    assert_eq!(starts.len(), 3);
    assert_near(starts[2], cooldown_until + 30_000);
}
