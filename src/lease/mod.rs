//! Exclusive, priority-ordered leasing of accelerator resources.

pub mod admission;
pub mod helper;
pub mod manager;
pub mod metrics;
pub mod queue;
pub mod snapshot;
pub mod types;
mod watchdog;

#[cfg(test)]
mod tests;

pub use admission::{AdmissionConfig, AdmissionDecision, AdmissionPolicy, AdmissionState};
pub use helper::{LeaseContext, LeaseHelper};
pub use manager::{LeaseManagerConfig, ResourceLeaseManager};
pub use metrics::{HistorySummary, MetricsSnapshot};
pub use snapshot::{LeaseView, QueueEntryView, ResourceSnapshot, UsageView};
pub use types::{
    AcquireOutcome, BusyPolicy, DenyReason, Lease, LeaseId, LeaseRequest, LeaseTrace,
    OutcomeKind, ResourceKey, TaskType, MAX_PRIORITY,
};
