//! Per-resource GPU lease arbitration for multi-stage inference pipelines.
//!
//! Tasks competing for an accelerator ask a [`LeaseHelper`] for a lease.
//! Each resource key is held by at most one lease at a time; waiters are
//! served by priority, then arrival. A [`UsageMonitor`] samples device
//! utilization and switches a key into high-pressure admission, during
//! which only critical work may start on a free resource.

pub mod arbiter;
pub mod config;
pub mod error;
pub mod lease;
pub mod usage;

pub use arbiter::{Arbiter, ArbiterHandle};
pub use config::{ArbiterConfig, DynamicAdjustmentConfig, TaskPolicy, UsageMonitorConfig};
pub use error::{Error, Result};
pub use lease::{
    AcquireOutcome, AdmissionConfig, AdmissionPolicy, AdmissionState, BusyPolicy, DenyReason,
    Lease, LeaseContext, LeaseHelper, LeaseId, LeaseRequest, LeaseTrace, OutcomeKind,
    ResourceKey, ResourceLeaseManager, ResourceSnapshot, TaskType,
};
pub use usage::{ManualProbe, NvidiaSmiProbe, UsageMonitor, UsageProbe, UsageReading};
