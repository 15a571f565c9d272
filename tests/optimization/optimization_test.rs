/*!
 * Optimization Tests
 * Hysteresis, re-arm spacing, target selection and thermal throttling
 */

use crate::common::{fixture, spec};
use fleet_orchestrator::{ActionClass, Clock, Directive, Priority};
use pretty_assertions::assert_eq;
use std::time::Duration;

const SAMPLE_INTERVAL: Duration = Duration::from_secs(15);

#[tokio::test(start_paused = true)]
async fn test_oscillating_load_does_not_oscillate_actions() {
    let f = fixture();
    f.running_spec(spec(30.0, 256.0).with_priority(Priority::Low)).await;

    // Alternating samples settle into an EMA swinging around the 80% threshold
    let mut fired_at = Vec::new();
    let mut releases = 0;
    for pass in 0..40 {
        f.load.set_cpu(if pass % 2 == 0 { 70.0 } else { 92.0 });
        let report = f.orchestrator.optimization().run_pass().await;
        if report.fired.contains(&ActionClass::ReduceCpu) {
            fired_at.push(f.clock.now_ms());
        }
        if report.released.contains(&ActionClass::ReduceCpu) {
            releases += 1;
        }
        tokio::time::advance(SAMPLE_INTERVAL).await;
    }

    // The average swings between roughly 79% and 83% and never drops below
    // the 65% release threshold, so the action never re-arms
    assert_eq!(fired_at.len(), 1, "fired at {:?}", fired_at);
    assert_eq!(releases, 0);
}

#[tokio::test(start_paused = true)]
async fn test_falling_below_release_threshold_rearms() {
    let f = fixture();
    f.running_spec(spec(30.0, 256.0).with_priority(Priority::Low)).await;

    let mut fired_at = Vec::new();
    let mut released_at = Vec::new();
    for pass in 0..34 {
        // Hot for five minutes, cool for two, hot again
        let cpu = if (20..28).contains(&pass) { 20.0 } else { 95.0 };
        f.load.set_cpu(cpu);
        let report = f.orchestrator.optimization().run_pass().await;
        if report.fired.contains(&ActionClass::ReduceCpu) {
            fired_at.push(f.clock.now_ms());
        }
        if report.released.contains(&ActionClass::ReduceCpu) {
            released_at.push(f.clock.now_ms());
        }
        tokio::time::advance(SAMPLE_INTERVAL).await;
    }

    assert_eq!(fired_at.len(), 2, "fired at {:?}", fired_at);
    assert_eq!(released_at.len(), 1);
    assert!(fired_at[0] < released_at[0] && released_at[0] < fired_at[1]);
}

#[tokio::test(start_paused = true)]
async fn test_no_action_before_window_is_full() {
    let f = fixture();
    f.running_spec(spec(30.0, 256.0).with_priority(Priority::Low)).await;
    f.load.set_cpu(99.0);

    for _ in 0..4 {
        let report = f.orchestrator.optimization().run_pass().await;
        assert!(report.fired.iter().all(|c| *c == ActionClass::Rebalance));
        tokio::time::advance(SAMPLE_INTERVAL).await;
    }
    let report = f.orchestrator.optimization().run_pass().await;
    assert!(report.fired.contains(&ActionClass::ReduceCpu));
}

#[tokio::test(start_paused = true)]
async fn test_reduce_workers_spares_high_priority() {
    let f = fixture();
    let low = f
        .running_spec(spec(30.0, 256.0).with_priority(Priority::Low))
        .await;
    let high = f
        .running_spec(spec(30.0, 256.0).with_priority(Priority::High))
        .await;
    f.load.set_cpu(95.0);

    for _ in 0..5 {
        f.orchestrator.optimization().run_pass().await;
        tokio::time::advance(SAMPLE_INTERVAL).await;
    }

    let is_reduce = |d: &Directive| matches!(d, Directive::ReduceWorkers { .. });
    assert_eq!(f.template.directives_for(&low).iter().filter(|d| is_reduce(d)).count(), 1);
    assert!(!f.template.directives_for(&high).iter().any(is_reduce));
}

#[tokio::test(start_paused = true)]
async fn test_memory_pressure_evicts_caches() {
    let f = fixture();
    let id = f
        .running_spec(spec(10.0, 256.0).with_priority(Priority::Medium))
        .await;
    f.load.set(fleet_orchestrator::LoadSample {
        cpu_percent: 10.0,
        memory_percent: 95.0,
        ..Default::default()
    });

    for _ in 0..5 {
        f.orchestrator.optimization().run_pass().await;
        tokio::time::advance(SAMPLE_INTERVAL).await;
    }
    assert!(f
        .template
        .directives_for(&id)
        .contains(&Directive::EvictCache));
}

#[tokio::test(start_paused = true)]
async fn test_thermal_throttle_and_release() {
    let f = fixture();
    let id = f
        .running_spec(spec(20.0, 256.0).with_priority(Priority::Low))
        .await;
    f.thermal.set(Some(68.0));

    for _ in 0..5 {
        f.orchestrator.optimization().run_pass().await;
        tokio::time::advance(SAMPLE_INTERVAL).await;
    }
    assert!(f
        .template
        .directives_for(&id)
        .contains(&Directive::EnableThrottling));
    assert_eq!(f.orchestrator.optimization().status().throttled, vec![id.clone()]);

    // Cooling below the low threshold undoes the throttle
    f.thermal.set(Some(40.0));
    for _ in 0..5 {
        f.orchestrator.optimization().run_pass().await;
        tokio::time::advance(SAMPLE_INTERVAL).await;
    }
    assert!(f
        .template
        .directives_for(&id)
        .contains(&Directive::DisableThrottling));
    assert!(f.orchestrator.optimization().status().throttled.is_empty());

    let snapshot = f.orchestrator.system_snapshot().await;
    assert!(snapshot.throttled.is_empty());
    assert!(!snapshot.triggers[&ActionClass::Thermal].engaged);
}

#[tokio::test(start_paused = true)]
async fn test_busy_instance_skips_directive() {
    let f = fixture();
    let id = f
        .running_spec(spec(30.0, 256.0).with_priority(Priority::Low))
        .await;
    f.load.set_cpu(95.0);

    for _ in 0..4 {
        f.orchestrator.optimization().run_pass().await;
        tokio::time::advance(SAMPLE_INTERVAL).await;
    }
    let guard = f.orchestrator.supervisor().guards().try_acquire(&id).unwrap();
    let report = f.orchestrator.optimization().run_pass().await;
    drop(guard);

    assert!(report.fired.contains(&ActionClass::ReduceCpu));
    assert!(report.directives.is_empty());
    assert!(f.template.directives_for(&id).is_empty());
}
