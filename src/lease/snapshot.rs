//! Read-only views of a resource for operational monitoring.

use super::admission::AdmissionState;
use super::metrics::MetricsSnapshot;
use super::types::{BusyPolicy, LeaseId, LeaseTrace, ResourceKey, TaskType};
use crate::usage::{UsageSample, Watermarks};
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct ResourceSnapshot {
    pub resource_key: ResourceKey,
    pub admission_state: AdmissionState,
    /// `None` when no sample is fresher than the cache TTL
    pub usage: Option<UsageView>,
    pub watermarks: Watermarks,
    pub current_lease: Option<LeaseView>,
    /// Pending requests in service order
    pub queue: Vec<QueueEntryView>,
    pub metrics: MetricsSnapshot,
}

impl ResourceSnapshot {
    pub fn is_locked(&self) -> bool {
        self.current_lease.is_some()
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct UsageView {
    pub usage_percent: f64,
    pub memory_percent: f64,
    pub age_ms: u64,
}

impl From<UsageSample> for UsageView {
    fn from(sample: UsageSample) -> Self {
        Self {
            usage_percent: sample.usage_percent,
            memory_percent: sample.memory_percent,
            age_ms: sample.age().as_millis() as u64,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LeaseView {
    pub lease_id: LeaseId,
    pub task_type: TaskType,
    pub priority: u8,
    pub acquired_at: chrono::DateTime<chrono::Utc>,
    /// Live elapsed hold time
    pub hold_ms: u64,
    pub hold_max_ms: u64,
    pub queue_wait_ms: u64,
    pub over_budget: bool,
    pub trace: LeaseTrace,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueEntryView {
    pub lease_id: LeaseId,
    pub task_type: TaskType,
    pub priority: u8,
    pub busy_policy: BusyPolicy,
    pub wait_time_ms: u64,
    pub max_wait_ms: u64,
    pub trace: LeaseTrace,
}
