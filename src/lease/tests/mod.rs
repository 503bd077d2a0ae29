//! Tests for the lease manager and the scoped lease helper.

mod manager_tests;

use crate::config::{ArbiterConfig, UsageMonitorConfig};
use crate::lease::{
    AdmissionConfig, AdmissionPolicy, LeaseManagerConfig, LeaseRequest, ResourceKey,
    ResourceLeaseManager, TaskType,
};
use crate::usage::{ManualProbe, UsageMonitor, UsageProbe};
use std::sync::Arc;
use std::time::Duration;

fn gpu0() -> ResourceKey {
    ResourceKey::from("gpu:0")
}

fn gpu1() -> ResourceKey {
    ResourceKey::from("gpu:1")
}

/// Manager over `gpu:0` and `gpu:1` fed by a manual probe.
fn test_manager() -> (Arc<ResourceLeaseManager>, Arc<ManualProbe>) {
    test_manager_with(LeaseManagerConfig {
        default_queue_limit: 4,
        default_hold_max: Duration::from_secs(30),
        metrics_history: 100,
    })
}

fn test_manager_with(
    config: LeaseManagerConfig,
) -> (Arc<ResourceLeaseManager>, Arc<ManualProbe>) {
    let probe = Arc::new(ManualProbe::new());
    let manager = manager_over(config, UsageMonitorConfig::default(), probe.clone());
    (manager, probe)
}

fn manager_over(
    config: LeaseManagerConfig,
    usage_config: UsageMonitorConfig,
    probe: Arc<dyn UsageProbe>,
) -> Arc<ResourceLeaseManager> {
    let monitor = Arc::new(UsageMonitor::new(usage_config, vec![gpu0(), gpu1()], probe));
    Arc::new(ResourceLeaseManager::new(
        config,
        AdmissionPolicy::new(AdmissionConfig::default()),
        monitor,
    ))
}

fn test_config() -> ArbiterConfig {
    ArbiterConfig {
        resource_keys: vec![gpu0(), gpu1()],
        ..ArbiterConfig::default()
    }
}

fn request(task_type: TaskType, priority: u8) -> LeaseRequest {
    LeaseRequest::new(gpu0(), task_type)
        .with_priority(priority)
        .with_max_wait(Duration::from_secs(10))
}

/// Yield until `key` has `len` queued requests.
async fn wait_for_queue_len(manager: &ResourceLeaseManager, key: &ResourceKey, len: usize) {
    for _ in 0..1000 {
        if manager.queue_len(key).unwrap() >= len {
            return;
        }
        tokio::task::yield_now().await;
    }
    panic!("queue on {} never reached {}", key, len);
}
