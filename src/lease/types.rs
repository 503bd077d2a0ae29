//! Core types shared by the lease manager, the admission policy and the
//! lease helper.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;

/// Highest priority a request may carry.
pub const MAX_PRIORITY: u8 = 100;

/// Identifier of one schedulable device, e.g. `gpu:0`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceKey(pub String);

impl ResourceKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Device index for keys of the form `gpu:<index>`.
    pub fn gpu_index(&self) -> Option<u32> {
        self.0.strip_prefix("gpu:")?.parse().ok()
    }
}

impl From<String> for ResourceKey {
    fn from(key: String) -> Self {
        Self(key)
    }
}

impl From<&str> for ResourceKey {
    fn from(key: &str) -> Self {
        Self(key.to_string())
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Unique identifier of a lease (also used for the pending request that
/// becomes the lease).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LeaseId(pub String);

impl LeaseId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl From<&str> for LeaseId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl fmt::Display for LeaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Kinds of inference work competing for the accelerator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    /// Speech recognition
    Asr,
    /// Machine translation
    Nmt,
    /// Speech synthesis
    Tts,
    /// Semantic repair of recognized text
    SemanticRepair,
}

impl TaskType {
    pub const ALL: [TaskType; 4] = [
        TaskType::Asr,
        TaskType::Nmt,
        TaskType::Tts,
        TaskType::SemanticRepair,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::Asr => "asr",
            TaskType::Nmt => "nmt",
            TaskType::Tts => "tts",
            TaskType::SemanticRepair => "semantic_repair",
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "asr" => Ok(TaskType::Asr),
            "nmt" => Ok(TaskType::Nmt),
            "tts" => Ok(TaskType::Tts),
            "semantic_repair" => Ok(TaskType::SemanticRepair),
            _ => Err(format!("Unknown task type: {}", s)),
        }
    }
}

/// What a request does when the resource is occupied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BusyPolicy {
    Wait,
    Skip,
    FallbackCpu,
}

impl BusyPolicy {
    /// Outcome used when this policy refuses a request.
    pub fn denial_kind(&self) -> OutcomeKind {
        match self {
            BusyPolicy::Wait => OutcomeKind::Timeout,
            BusyPolicy::Skip => OutcomeKind::Skipped,
            BusyPolicy::FallbackCpu => OutcomeKind::FallbackCpu,
        }
    }
}

/// Why a request did not get a lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DenyReason {
    /// Resource locked and the busy policy forbids waiting
    GpuBusy,
    /// Queue at capacity and the busy policy forbids waiting
    QueueFull,
    /// Waited longer than `max_wait`
    Timeout,
    /// Resource free but admission deferred under high pressure
    HighPressure,
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DenyReason::GpuBusy => "GPU_BUSY",
            DenyReason::QueueFull => "QUEUE_FULL",
            DenyReason::Timeout => "TIMEOUT",
            DenyReason::HighPressure => "HIGH_PRESSURE",
        };
        f.write_str(s)
    }
}

/// Terminal outcome kind of a refused request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutcomeKind {
    Skipped,
    FallbackCpu,
    Timeout,
}

impl fmt::Display for OutcomeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OutcomeKind::Skipped => "SKIPPED",
            OutcomeKind::FallbackCpu => "FALLBACK_CPU",
            OutcomeKind::Timeout => "TIMEOUT",
        };
        f.write_str(s)
    }
}

/// Correlation metadata carried through for logging only.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseTrace {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step: Option<String>,
}

impl LeaseTrace {
    pub fn job(job_id: impl Into<String>) -> Self {
        Self {
            job_id: Some(job_id.into()),
            ..Default::default()
        }
    }

    #[must_use]
    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    #[must_use]
    pub fn with_step(mut self, step: impl Into<String>) -> Self {
        self.step = Some(step.into());
        self
    }
}

impl fmt::Display for LeaseTrace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "job={} session={} step={}",
            self.job_id.as_deref().unwrap_or("-"),
            self.session_id.as_deref().unwrap_or("-"),
            self.step.as_deref().unwrap_or("-")
        )
    }
}

/// A request for exclusive use of one resource key.
///
/// `hold_max` and `queue_limit` fall back to the manager defaults when unset.
#[derive(Debug, Clone)]
pub struct LeaseRequest {
    pub resource_key: ResourceKey,
    pub task_type: TaskType,
    pub priority: u8,
    pub max_wait: Duration,
    pub hold_max: Option<Duration>,
    pub queue_limit: Option<usize>,
    pub busy_policy: BusyPolicy,
    pub trace: LeaseTrace,
}

impl LeaseRequest {
    pub fn new(resource_key: impl Into<ResourceKey>, task_type: TaskType) -> Self {
        Self {
            resource_key: resource_key.into(),
            task_type,
            priority: 50,
            max_wait: Duration::from_millis(3000),
            hold_max: None,
            queue_limit: None,
            busy_policy: BusyPolicy::Wait,
            trace: LeaseTrace::default(),
        }
    }

    /// Set the priority, clamped to `0..=100`.
    #[must_use]
    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority.min(MAX_PRIORITY);
        self
    }

    #[must_use]
    pub fn with_max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = max_wait;
        self
    }

    #[must_use]
    pub fn with_hold_max(mut self, hold_max: Duration) -> Self {
        self.hold_max = Some(hold_max);
        self
    }

    #[must_use]
    pub fn with_queue_limit(mut self, queue_limit: usize) -> Self {
        self.queue_limit = Some(queue_limit);
        self
    }

    #[must_use]
    pub fn with_busy_policy(mut self, busy_policy: BusyPolicy) -> Self {
        self.busy_policy = busy_policy;
        self
    }

    #[must_use]
    pub fn with_trace(mut self, trace: LeaseTrace) -> Self {
        self.trace = trace;
        self
    }
}

/// A granted lease as seen by its holder.
#[derive(Debug, Clone)]
pub struct Lease {
    pub id: LeaseId,
    pub resource_key: ResourceKey,
    pub task_type: TaskType,
    pub priority: u8,
    pub acquired_at: Instant,
    pub acquired_at_utc: chrono::DateTime<chrono::Utc>,
    pub queue_wait: Duration,
    pub hold_max: Duration,
    pub trace: LeaseTrace,
}

impl Lease {
    pub fn held_for(&self) -> Duration {
        self.acquired_at.elapsed()
    }

    pub fn queue_wait_ms(&self) -> u64 {
        self.queue_wait.as_millis() as u64
    }
}

/// Result of [`ResourceLeaseManager::acquire`](super::ResourceLeaseManager::acquire).
#[derive(Debug, Clone)]
pub enum AcquireOutcome {
    Acquired(Lease),
    Skipped { reason: DenyReason },
    FallbackCpu { reason: DenyReason },
    Timeout { reason: DenyReason },
}

impl AcquireOutcome {
    pub(crate) fn denied(kind: OutcomeKind, reason: DenyReason) -> Self {
        match kind {
            OutcomeKind::Skipped => AcquireOutcome::Skipped { reason },
            OutcomeKind::FallbackCpu => AcquireOutcome::FallbackCpu { reason },
            OutcomeKind::Timeout => AcquireOutcome::Timeout { reason },
        }
    }

    pub fn is_acquired(&self) -> bool {
        matches!(self, AcquireOutcome::Acquired(_))
    }

    pub fn lease(&self) -> Option<&Lease> {
        match self {
            AcquireOutcome::Acquired(lease) => Some(lease),
            _ => None,
        }
    }

    pub fn into_lease(self) -> Option<Lease> {
        match self {
            AcquireOutcome::Acquired(lease) => Some(lease),
            _ => None,
        }
    }

    /// Outcome kind and reason for a refused request.
    pub fn denial(&self) -> Option<(OutcomeKind, DenyReason)> {
        match self {
            AcquireOutcome::Acquired(_) => None,
            AcquireOutcome::Skipped { reason } => Some((OutcomeKind::Skipped, *reason)),
            AcquireOutcome::FallbackCpu { reason } => Some((OutcomeKind::FallbackCpu, *reason)),
            AcquireOutcome::Timeout { reason } => Some((OutcomeKind::Timeout, *reason)),
        }
    }
}
