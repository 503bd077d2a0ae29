//! Tests for ResourceLeaseManager.

use super::{gpu0, gpu1, request, test_manager, test_manager_with, wait_for_queue_len};
use crate::error::Error;
use crate::lease::{
    AcquireOutcome, AdmissionState, BusyPolicy, DenyReason, LeaseId, LeaseManagerConfig,
    LeaseRequest, LeaseTrace, OutcomeKind, ResourceKey, TaskType,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test(start_paused = true)]
async fn test_acquire_free_resource() {
    let (manager, _) = test_manager();

    let outcome = manager
        .acquire(request(TaskType::Asr, 90).with_trace(LeaseTrace::job("job-1")))
        .await
        .unwrap();
    let lease = outcome.into_lease().expect("lease granted");
    assert_eq!(lease.resource_key, gpu0());
    assert_eq!(lease.queue_wait, Duration::ZERO);
    assert_eq!(lease.trace.job_id.as_deref(), Some("job-1"));

    let active = manager.active_lease(&gpu0()).unwrap().unwrap();
    assert_eq!(active.id, lease.id);
    assert!(manager.active_lease(&gpu1()).unwrap().is_none());

    assert!(manager.release(&lease.id));
    assert!(manager.active_lease(&gpu0()).unwrap().is_none());

    let metrics = manager.snapshot(&gpu0()).unwrap().metrics;
    assert_eq!(metrics.acquired, 1);
    assert_eq!(metrics.hold.count, 1);
}

#[tokio::test(start_paused = true)]
async fn test_unknown_key_is_rejected() {
    let (manager, _) = test_manager();

    let result = manager
        .acquire(LeaseRequest::new("gpu:7", TaskType::Nmt))
        .await;
    assert!(matches!(result, Err(Error::InvalidKey(key)) if key == ResourceKey::from("gpu:7")));
    assert!(manager.snapshot(&ResourceKey::from("gpu:7")).is_err());
}

#[tokio::test(start_paused = true)]
async fn test_release_unknown_lease_is_noop() {
    let (manager, _) = test_manager();
    let held = manager
        .acquire(request(TaskType::Nmt, 80))
        .await
        .unwrap()
        .into_lease()
        .unwrap();

    assert!(!manager.release(&LeaseId::from("no-such-lease")));
    assert!(manager.active_lease(&gpu0()).unwrap().is_some());

    assert!(manager.release(&held.id));
    assert!(!manager.release(&held.id));
}

#[tokio::test(start_paused = true)]
async fn test_queue_serves_priority_then_fifo() {
    let (manager, _) = test_manager();
    let first = manager
        .acquire(request(TaskType::Nmt, 50))
        .await
        .unwrap()
        .into_lease()
        .unwrap();

    let order = Arc::new(Mutex::new(Vec::new()));
    let mut handles = Vec::new();
    for (i, (name, priority)) in [("low", 40), ("high-1", 80), ("high-2", 80), ("mid", 60)]
        .into_iter()
        .enumerate()
    {
        let task_manager = manager.clone();
        let order = order.clone();
        handles.push(tokio::spawn(async move {
            let lease = task_manager
                .acquire(request(TaskType::Nmt, priority))
                .await
                .unwrap()
                .into_lease()
                .expect("queued request granted");
            order.lock().push(name);
            tokio::time::sleep(Duration::from_millis(5)).await;
            task_manager.release(&lease.id);
        }));
        wait_for_queue_len(&manager, &gpu0(), i + 1).await;
    }

    let snapshot = manager.snapshot(&gpu0()).unwrap();
    let queued: Vec<u8> = snapshot.queue.iter().map(|entry| entry.priority).collect();
    assert_eq!(queued, vec![80, 80, 60, 40]);

    manager.release(&first.id);
    for handle in handles {
        handle.await.unwrap();
    }

    assert_eq!(*order.lock(), vec!["high-1", "high-2", "mid", "low"]);
    let metrics = manager.snapshot(&gpu0()).unwrap().metrics;
    assert_eq!(metrics.acquired, 5);
    assert!(manager.active_lease(&gpu0()).unwrap().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_queued_request_records_wait_time() {
    let (manager, _) = test_manager();
    let first = manager
        .acquire(request(TaskType::Asr, 90))
        .await
        .unwrap()
        .into_lease()
        .unwrap();

    let waiter = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.acquire(request(TaskType::Nmt, 80)).await })
    };
    wait_for_queue_len(&manager, &gpu0(), 1).await;

    tokio::time::sleep(Duration::from_millis(250)).await;
    manager.release(&first.id);

    let lease = waiter.await.unwrap().unwrap().into_lease().unwrap();
    assert!(lease.queue_wait >= Duration::from_millis(250));
    let summary = manager.snapshot(&gpu0()).unwrap().metrics.queue_wait;
    assert_eq!(summary.count, 2);
    assert!(summary.max_ms >= 250);
}

#[tokio::test(start_paused = true)]
async fn test_wait_timeout_removes_entry() {
    let (manager, _) = test_manager();
    let held = manager
        .acquire(request(TaskType::Asr, 90))
        .await
        .unwrap()
        .into_lease()
        .unwrap();

    let outcome = manager
        .acquire(request(TaskType::Nmt, 80).with_max_wait(Duration::from_millis(100)))
        .await
        .unwrap();
    assert!(matches!(
        outcome,
        AcquireOutcome::Timeout {
            reason: DenyReason::Timeout
        }
    ));
    assert_eq!(manager.queue_len(&gpu0()).unwrap(), 0);

    // the timed-out request must not receive the resource afterwards
    manager.release(&held.id);
    assert!(manager.active_lease(&gpu0()).unwrap().is_none());

    let metrics = manager.snapshot(&gpu0()).unwrap().metrics;
    assert_eq!(metrics.timeouts, 1);
    assert_eq!(metrics.acquired, 1);
}

#[tokio::test(start_paused = true)]
async fn test_no_wait_policies_when_busy() {
    let (manager, _) = test_manager();
    let _held = manager
        .acquire(request(TaskType::Asr, 90))
        .await
        .unwrap()
        .into_lease()
        .unwrap();

    let skipped = manager
        .acquire(request(TaskType::SemanticRepair, 40).with_busy_policy(BusyPolicy::Skip))
        .await
        .unwrap();
    assert!(matches!(
        skipped,
        AcquireOutcome::Skipped {
            reason: DenyReason::GpuBusy
        }
    ));

    let fallback = manager
        .acquire(request(TaskType::Tts, 70).with_busy_policy(BusyPolicy::FallbackCpu))
        .await
        .unwrap();
    assert!(matches!(
        fallback,
        AcquireOutcome::FallbackCpu {
            reason: DenyReason::GpuBusy
        }
    ));

    assert_eq!(manager.queue_len(&gpu0()).unwrap(), 0);
    let metrics = manager.snapshot(&gpu0()).unwrap().metrics;
    assert_eq!(metrics.skipped, 1);
    assert_eq!(metrics.fallback_cpu, 1);
}

#[tokio::test(start_paused = true)]
async fn test_queue_full_rejects_no_wait_but_not_wait() {
    let (manager, _) = test_manager();
    let held = manager
        .acquire(request(TaskType::Asr, 90))
        .await
        .unwrap()
        .into_lease()
        .unwrap();

    let waiter = {
        let manager = manager.clone();
        tokio::spawn(async move {
            manager
                .acquire(request(TaskType::Nmt, 80).with_queue_limit(1))
                .await
        })
    };
    wait_for_queue_len(&manager, &gpu0(), 1).await;

    let rejected = manager
        .acquire(
            request(TaskType::SemanticRepair, 40)
                .with_queue_limit(1)
                .with_busy_policy(BusyPolicy::Skip),
        )
        .await
        .unwrap();
    assert_eq!(
        rejected.denial(),
        Some((OutcomeKind::Skipped, DenyReason::QueueFull))
    );

    // WAIT requests are still enqueued past the nominal limit
    let over_limit = {
        let manager = manager.clone();
        tokio::spawn(async move {
            manager
                .acquire(request(TaskType::Nmt, 60).with_queue_limit(1))
                .await
        })
    };
    wait_for_queue_len(&manager, &gpu0(), 2).await;

    manager.release(&held.id);
    let first = waiter.await.unwrap().unwrap().into_lease().unwrap();
    manager.release(&first.id);
    let second = over_limit.await.unwrap().unwrap().into_lease().unwrap();
    manager.release(&second.id);

    let metrics = manager.snapshot(&gpu0()).unwrap().metrics;
    assert_eq!(metrics.queue_full, 1);
    assert_eq!(metrics.acquired, 3);
}

#[tokio::test(start_paused = true)]
async fn test_keys_are_independent() {
    let (manager, _) = test_manager();
    let on_gpu0 = manager
        .acquire(request(TaskType::Asr, 90))
        .await
        .unwrap()
        .into_lease()
        .unwrap();

    let on_gpu1 = manager
        .acquire(
            LeaseRequest::new(gpu1(), TaskType::Tts).with_busy_policy(BusyPolicy::Skip),
        )
        .await
        .unwrap();
    assert!(on_gpu1.is_acquired());

    manager.release(&on_gpu0.id);
    assert!(manager.active_lease(&gpu1()).unwrap().is_some());
}

#[tokio::test(start_paused = true)]
async fn test_high_pressure_fast_path() {
    let (manager, probe) = test_manager();
    probe.set_usage(gpu0(), 95.0);
    manager.monitor().sample_once().await;
    assert_eq!(
        manager.monitor().admission_state(&gpu0()),
        AdmissionState::HighPressure
    );

    // critical ASR on an idle resource with an empty queue
    let asr = manager.acquire(request(TaskType::Asr, 95)).await.unwrap();
    let asr = asr.into_lease().expect("fast path grants ASR");
    manager.release(&asr.id);

    // ordinary priority must not start under pressure
    let nmt = manager
        .acquire(request(TaskType::Nmt, 60).with_busy_policy(BusyPolicy::Skip))
        .await
        .unwrap();
    assert!(matches!(
        nmt,
        AcquireOutcome::Skipped {
            reason: DenyReason::HighPressure
        }
    ));

    // elevated priority is admitted on a free resource
    let tts = manager.acquire(request(TaskType::Tts, 75)).await.unwrap();
    let tts = tts.into_lease().expect("elevated priority admitted");
    manager.release(&tts.id);
}

#[tokio::test(start_paused = true)]
async fn test_ordinary_priority_deferred_under_pressure() {
    let (manager, probe) = test_manager();
    probe.set_usage(gpu0(), 95.0);
    manager.monitor().sample_once().await;

    let queued = {
        let manager = manager.clone();
        tokio::spawn(async move {
            manager
                .acquire(request(TaskType::Nmt, 60).with_max_wait(Duration::from_millis(500)))
                .await
        })
    };
    wait_for_queue_len(&manager, &gpu0(), 1).await;

    let asr = manager
        .acquire(request(TaskType::Asr, 60).with_busy_policy(BusyPolicy::Skip))
        .await
        .unwrap();
    assert_eq!(
        asr.denial(),
        Some((OutcomeKind::Skipped, DenyReason::HighPressure))
    );

    let outcome = queued.await.unwrap().unwrap();
    assert!(matches!(outcome, AcquireOutcome::Timeout { .. }));
}

#[tokio::test(start_paused = true)]
async fn test_pressure_relief_grants_queued_request() {
    let (manager, probe) = test_manager();
    let watcher = manager.clone().watch_admission();
    probe.set_usage(gpu0(), 95.0);
    manager.monitor().sample_once().await;

    let queued = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.acquire(request(TaskType::Nmt, 60)).await })
    };
    wait_for_queue_len(&manager, &gpu0(), 1).await;
    assert!(manager.active_lease(&gpu0()).unwrap().is_none());

    probe.set_usage(gpu0(), 50.0);
    let transitions = manager.monitor().sample_once().await;
    assert_eq!(transitions.len(), 1);
    assert_eq!(transitions[0].to, AdmissionState::Normal);

    let lease = queued.await.unwrap().unwrap().into_lease().unwrap();
    assert_eq!(lease.task_type, TaskType::Nmt);
    manager.release(&lease.id);
    watcher.abort();
}

#[tokio::test(start_paused = true)]
async fn test_reevaluate_on_idle_resource() {
    let (manager, probe) = test_manager();
    probe.set_usage(gpu0(), 95.0);
    manager.monitor().sample_once().await;

    let queued = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.acquire(request(TaskType::Nmt, 60)).await })
    };
    wait_for_queue_len(&manager, &gpu0(), 1).await;

    // nothing to do with an empty queue
    assert!(manager.reevaluate(&gpu1()).unwrap().is_none());

    let granted = manager.reevaluate(&gpu0()).unwrap().expect("head granted");
    let lease = queued.await.unwrap().unwrap().into_lease().unwrap();
    assert_eq!(lease.id, granted);
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_waiter_leaves_queue() {
    let (manager, _) = test_manager();
    let held = manager
        .acquire(request(TaskType::Asr, 90))
        .await
        .unwrap()
        .into_lease()
        .unwrap();

    let waiter = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.acquire(request(TaskType::Nmt, 80)).await })
    };
    wait_for_queue_len(&manager, &gpu0(), 1).await;

    waiter.abort();
    assert!(waiter.await.unwrap_err().is_cancelled());
    assert_eq!(manager.queue_len(&gpu0()).unwrap(), 0);

    manager.release(&held.id);
    assert!(manager.active_lease(&gpu0()).unwrap().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_watchdog_fires_without_revoking() {
    let (manager, _) = test_manager();
    let lease = manager
        .acquire(request(TaskType::Tts, 70).with_hold_max(Duration::from_millis(100)))
        .await
        .unwrap()
        .into_lease()
        .unwrap();
    assert!(manager.is_watched(&gpu0()));

    tokio::time::sleep(Duration::from_millis(150)).await;

    let snapshot = manager.snapshot(&gpu0()).unwrap();
    assert_eq!(snapshot.metrics.watchdog_exceeded, 1);
    let current = snapshot.current_lease.expect("lease still held");
    assert_eq!(current.lease_id, lease.id);
    assert!(current.over_budget);

    assert!(manager.release(&lease.id));
}

#[tokio::test(start_paused = true)]
async fn test_watchdog_cancelled_on_release() {
    let (manager, _) = test_manager();
    let lease = manager
        .acquire(request(TaskType::Tts, 70).with_hold_max(Duration::from_millis(100)))
        .await
        .unwrap()
        .into_lease()
        .unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    manager.release(&lease.id);
    tokio::time::sleep(Duration::from_millis(200)).await;

    let metrics = manager.snapshot(&gpu0()).unwrap().metrics;
    assert_eq!(metrics.watchdog_exceeded, 0);
}

#[tokio::test(start_paused = true)]
async fn test_default_hold_max_applies() {
    let (manager, _) = test_manager_with(LeaseManagerConfig {
        default_queue_limit: 4,
        default_hold_max: Duration::from_millis(200),
        metrics_history: 10,
    });
    let lease = manager
        .acquire(request(TaskType::Nmt, 80))
        .await
        .unwrap()
        .into_lease()
        .unwrap();
    assert_eq!(lease.hold_max, Duration::from_millis(200));
    manager.release(&lease.id);
}

#[tokio::test(start_paused = true)]
async fn test_snapshot_has_no_side_effects() {
    let (manager, probe) = test_manager();
    probe.set_usage(gpu0(), 40.0);
    manager.monitor().sample_once().await;
    let held = manager
        .acquire(request(TaskType::Asr, 90).with_trace(LeaseTrace::job("j").with_step("asr")))
        .await
        .unwrap()
        .into_lease()
        .unwrap();

    let before = manager.snapshot(&gpu0()).unwrap();
    let after = manager.snapshot(&gpu0()).unwrap();
    assert_eq!(before.metrics, after.metrics);
    assert!(after.is_locked());
    assert_eq!(after.queue_len(), 0);
    assert_eq!(after.admission_state, AdmissionState::Normal);
    let usage = after.usage.as_ref().expect("fresh sample");
    assert!((usage.usage_percent - 40.0).abs() < f64::EPSILON);

    let json = serde_json::to_value(&after).unwrap();
    assert_eq!(json["resource_key"], "gpu:0");
    assert_eq!(json["admission_state"], "NORMAL");
    assert_eq!(json["current_lease"]["task_type"], "asr");
    assert_eq!(json["current_lease"]["trace"]["step"], "asr");

    assert_eq!(manager.snapshot_all().len(), 2);
    manager.release(&held.id);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_mutual_exclusion_under_contention() {
    let (manager, _) = test_manager_with(LeaseManagerConfig {
        default_queue_limit: 64,
        default_hold_max: Duration::from_secs(30),
        metrics_history: 100,
    });
    let in_flight = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for i in 0..24u8 {
        let manager = manager.clone();
        let in_flight = in_flight.clone();
        let peak = peak.clone();
        handles.push(tokio::spawn(async move {
            let lease = manager
                .acquire(request(TaskType::Nmt, i % 100).with_max_wait(Duration::from_secs(30)))
                .await
                .unwrap()
                .into_lease()
                .expect("every waiter is eventually served");
            let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(1)).await;
            in_flight.fetch_sub(1, Ordering::SeqCst);
            manager.release(&lease.id);
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    assert_eq!(peak.load(Ordering::SeqCst), 1);
    let metrics = manager.snapshot(&gpu0()).unwrap().metrics;
    assert_eq!(metrics.acquired, 24);
    assert!(manager.active_lease(&gpu0()).unwrap().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_sampler_drives_admission_through_probe_failures() {
    use super::manager_over;
    use super::mocks::ScriptedProbe;
    use crate::config::UsageMonitorConfig;

    let probe = Arc::new(ScriptedProbe::new(
        gpu0(),
        vec![None, Some(95.0), None, Some(50.0)],
    ));
    let usage_config = UsageMonitorConfig {
        sample_interval_ms: 100,
        ..UsageMonitorConfig::default()
    };
    let manager = manager_over(LeaseManagerConfig::default(), usage_config, probe.clone());
    let sampler = manager.monitor().clone().start_sampling();

    // ticks at 0ms (failure) and 100ms (95%)
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(
        manager.monitor().admission_state(&gpu0()),
        AdmissionState::HighPressure
    );
    let deferred = manager
        .acquire(request(TaskType::Nmt, 60).with_busy_policy(BusyPolicy::Skip))
        .await
        .unwrap();
    assert_eq!(
        deferred.denial(),
        Some((OutcomeKind::Skipped, DenyReason::HighPressure))
    );

    // a failed tick keeps the previous state
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(
        manager.monitor().admission_state(&gpu0()),
        AdmissionState::HighPressure
    );

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(
        manager.monitor().admission_state(&gpu0()),
        AdmissionState::Normal
    );
    assert!(probe.calls() >= 4);
    sampler.abort();
}

#[tokio::test(start_paused = true)]
async fn test_lagged_watcher_still_reevaluates() {
    use crate::usage::UsageReading;

    let (manager, _) = test_manager();
    let watcher = manager.clone().watch_admission();
    let monitor = manager.monitor().clone();
    monitor.record_sample(&gpu0(), UsageReading::new(95.0, 0.0));

    let queued = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.acquire(request(TaskType::Nmt, 60)).await })
    };
    wait_for_queue_len(&manager, &gpu0(), 1).await;

    // overflow the transition channel before the watcher gets to run
    for _ in 0..100 {
        monitor.record_sample(&gpu0(), UsageReading::new(50.0, 0.0));
        monitor.record_sample(&gpu0(), UsageReading::new(95.0, 0.0));
    }
    monitor.record_sample(&gpu0(), UsageReading::new(50.0, 0.0));
    assert_eq!(monitor.admission_state(&gpu0()), AdmissionState::Normal);

    let lease = queued.await.unwrap().unwrap().into_lease().expect("granted");
    assert_eq!(lease.task_type, TaskType::Nmt);
    manager.release(&lease.id);
    watcher.abort();
}
