//! Scoped lease acquisition for pipeline stages.

use super::manager::ResourceLeaseManager;
use super::types::{
    AcquireOutcome, Lease, LeaseId, LeaseRequest, LeaseTrace, OutcomeKind, TaskType,
};
use crate::config::{ArbiterConfig, TaskPolicy};
use crate::error::{Error, Result};
use parking_lot::RwLock;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// What the caller's work receives while it runs.
#[derive(Debug, Clone)]
pub struct LeaseContext {
    /// `None` when arbitration is disabled and the call was bypassed
    pub lease: Option<Lease>,
    pub task_type: TaskType,
}

impl LeaseContext {
    pub fn is_bypassed(&self) -> bool {
        self.lease.is_none()
    }

    pub fn lease_id(&self) -> Option<&LeaseId> {
        self.lease.as_ref().map(|lease| &lease.id)
    }
}

/// Releases the lease when dropped, so the resource is returned on normal
/// completion, on error and when the work future is cancelled.
struct LeaseGuard<'a> {
    manager: &'a ResourceLeaseManager,
    lease_id: LeaseId,
}

impl Drop for LeaseGuard<'_> {
    fn drop(&mut self) {
        self.manager.release(&self.lease_id);
    }
}

/// Caller-facing entry point: resolves per-task policy, acquires, runs the
/// work and always releases.
#[derive(Clone)]
pub struct LeaseHelper {
    manager: Arc<ResourceLeaseManager>,
    config: Arc<RwLock<ArbiterConfig>>,
}

impl LeaseHelper {
    pub fn new(manager: Arc<ResourceLeaseManager>, config: ArbiterConfig) -> Self {
        Self {
            manager,
            config: Arc::new(RwLock::new(config)),
        }
    }

    pub fn manager(&self) -> &Arc<ResourceLeaseManager> {
        &self.manager
    }

    pub fn config(&self) -> ArbiterConfig {
        self.config.read().clone()
    }

    pub fn is_enabled(&self) -> bool {
        self.config.read().enabled
    }

    pub fn policy_for(&self, task_type: TaskType) -> TaskPolicy {
        self.config.read().policy_for(task_type)
    }

    /// Build the lease request a task type would issue under the current
    /// configuration.
    pub fn request_for(&self, task_type: TaskType, trace: LeaseTrace) -> Result<LeaseRequest> {
        let config = self.config.read();
        let key = config
            .resource_for(task_type)
            .ok_or_else(|| Error::Config("no resource keys configured".to_string()))?;
        let policy = config.policy_for(task_type);
        let mut request = LeaseRequest::new(key, task_type)
            .with_priority(policy.priority)
            .with_max_wait(policy.max_wait())
            .with_busy_policy(policy.busy_policy)
            .with_trace(trace);
        if let Some(hold_max_ms) = policy.hold_max_ms {
            request = request.with_hold_max(Duration::from_millis(hold_max_ms));
        }
        if let Some(queue_limit) = policy.queue_limit {
            request = request.with_queue_limit(queue_limit);
        }
        Ok(request)
    }

    /// Run `work` while holding a lease for `task_type`.
    ///
    /// A refused lease surfaces as [`Error::LeaseUnavailable`] converted into
    /// the caller's error type; the work is not invoked. Errors returned by
    /// the work are passed through unchanged after the lease is released.
    pub async fn with_lease<F, Fut, T, E>(
        &self,
        task_type: TaskType,
        trace: LeaseTrace,
        work: F,
    ) -> std::result::Result<T, E>
    where
        F: FnOnce(LeaseContext) -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: From<Error>,
    {
        if !self.is_enabled() {
            debug!(
                "LEASE: Arbitration disabled, bypassing - task={}, {}",
                task_type, trace
            );
            return work(LeaseContext {
                lease: None,
                task_type,
            })
            .await;
        }

        let request = self.request_for(task_type, trace)?;
        let (outcome, reason) = match self.manager.acquire(request).await? {
            AcquireOutcome::Acquired(lease) => {
                let _guard = LeaseGuard {
                    manager: &self.manager,
                    lease_id: lease.id.clone(),
                };
                return work(LeaseContext {
                    lease: Some(lease),
                    task_type,
                })
                .await;
            }
            AcquireOutcome::Skipped { reason } => (OutcomeKind::Skipped, reason),
            AcquireOutcome::FallbackCpu { reason } => (OutcomeKind::FallbackCpu, reason),
            AcquireOutcome::Timeout { reason } => (OutcomeKind::Timeout, reason),
        };
        info!(
            "LEASE: Task not admitted - task={}, outcome={}, reason={}",
            task_type, outcome, reason
        );
        Err(Error::LeaseUnavailable {
            task_type,
            outcome,
            reason,
        }
        .into())
    }

    /// Tell the monitor a task of `estimated` duration is about to run on the
    /// resource `task_type` maps to. Returns true if thresholds were boosted.
    pub fn hint_long_task(&self, task_type: TaskType, estimated: Duration) -> bool {
        let Some(key) = self.config.read().resource_for(task_type) else {
            return false;
        };
        self.manager.monitor().notify_task_hint(&key, estimated)
    }

    /// Swap in a new configuration. Task policies and the enabled flag take
    /// effect on the next call. Settings the manager and monitor captured at
    /// construction cannot change without a restart; a reload touching them
    /// is rejected as a whole.
    pub fn reload(&self, config: ArbiterConfig) -> Result<()> {
        config.validate()?;
        let mut current = self.config.write();
        let fixed = current.restart_required_changes(&config);
        if !fixed.is_empty() {
            warn!(
                "LEASE: Rejected config reload that changes restart-only settings - fields={:?}",
                fixed
            );
            return Err(Error::Config(format!(
                "{} cannot change without a restart",
                fixed.join(", ")
            )));
        }
        info!(
            "🔄 LEASE: Configuration reloaded - enabled={}, policies={}",
            config.enabled,
            config.task_policies.len()
        );
        *current = config;
        Ok(())
    }
}
