use crate::lease::types::{DenyReason, OutcomeKind, ResourceKey, TaskType};

/// Errors that can occur when arbitrating accelerator leases.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("unknown resource key: {0}")]
    InvalidKey(ResourceKey),
    #[error("lease unavailable for {task_type}: {outcome} ({reason})")]
    LeaseUnavailable {
        task_type: TaskType,
        outcome: OutcomeKind,
        reason: DenyReason,
    },
    #[error("config error: {0}")]
    Config(String),
    #[error("probe error: {0}")]
    Probe(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// The denial reason, if this error came from a refused lease.
    pub fn deny_reason(&self) -> Option<DenyReason> {
        match self {
            Error::LeaseUnavailable { reason, .. } => Some(*reason),
            _ => None,
        }
    }

    /// True when the caller should run a non-accelerated fallback instead of
    /// dropping the task.
    pub fn wants_cpu_fallback(&self) -> bool {
        matches!(
            self,
            Error::LeaseUnavailable {
                outcome: OutcomeKind::FallbackCpu,
                ..
            }
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
