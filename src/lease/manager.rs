//! Resource lease manager.
//!
//! Every resource key owns one [`ResourceSlot`] behind a mutex: the active
//! lease, the pending queue and the metrics. All acquire / release / dequeue
//! steps for a key happen under that mutex, so they never interleave. The
//! usage monitor's lock is never held together with a slot lock.

use super::admission::{AdmissionDecision, AdmissionPolicy, AdmissionState};
use super::metrics::ResourceMetrics;
use super::queue::{PendingQueue, PendingRequest};
use super::snapshot::{LeaseView, QueueEntryView, ResourceSnapshot, UsageView};
use super::types::{
    AcquireOutcome, BusyPolicy, DenyReason, Lease, LeaseId, LeaseRequest, ResourceKey, TaskType,
};
use super::watchdog;
use crate::config::ArbiterConfig;
use crate::error::{Error, Result};
use crate::usage::UsageMonitor;
use ahash::AHashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, oneshot};
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

pub(crate) type SharedSlot = Arc<Mutex<ResourceSlot>>;

/// Manager-wide defaults applied to requests that don't override them.
#[derive(Debug, Clone)]
pub struct LeaseManagerConfig {
    pub default_queue_limit: usize,
    pub default_hold_max: Duration,
    pub metrics_history: usize,
}

impl Default for LeaseManagerConfig {
    fn default() -> Self {
        Self::from(&ArbiterConfig::default())
    }
}

impl From<&ArbiterConfig> for LeaseManagerConfig {
    fn from(config: &ArbiterConfig) -> Self {
        Self {
            default_queue_limit: config.default_queue_limit,
            default_hold_max: config.default_hold_max(),
            metrics_history: config.metrics_history,
        }
    }
}

struct ActiveLease {
    lease: Lease,
    watchdog: Option<AbortHandle>,
}

/// Mutable state of one resource key.
pub(crate) struct ResourceSlot {
    active: Option<ActiveLease>,
    queue: PendingQueue,
    metrics: ResourceMetrics,
}

impl ResourceSlot {
    fn new(metrics_history: usize) -> Self {
        Self {
            active: None,
            queue: PendingQueue::new(),
            metrics: ResourceMetrics::new(metrics_history),
        }
    }

    pub(crate) fn active_lease(&self) -> Option<&Lease> {
        self.active.as_ref().map(|active| &active.lease)
    }

    pub(crate) fn metrics_mut(&mut self) -> &mut ResourceMetrics {
        &mut self.metrics
    }

    fn is_active(&self, lease_id: &LeaseId) -> bool {
        self.active_lease().is_some_and(|lease| &lease.id == lease_id)
    }
}

/// Arbitrates exclusive, time-bounded access to a fixed set of resources.
pub struct ResourceLeaseManager {
    config: LeaseManagerConfig,
    policy: AdmissionPolicy,
    monitor: Arc<UsageMonitor>,
    keys: Vec<ResourceKey>,
    slots: AHashMap<ResourceKey, SharedSlot>,
}

impl ResourceLeaseManager {
    /// Create a manager for the keys tracked by `monitor`.
    pub fn new(
        config: LeaseManagerConfig,
        policy: AdmissionPolicy,
        monitor: Arc<UsageMonitor>,
    ) -> Self {
        let keys = monitor.keys().to_vec();
        let slots = keys
            .iter()
            .map(|key| {
                (
                    key.clone(),
                    Arc::new(Mutex::new(ResourceSlot::new(config.metrics_history))),
                )
            })
            .collect();
        info!(
            "🏗️ LEASE: Creating lease manager - keys={:?}, queue_limit={}, hold_max={}ms",
            keys.iter().map(ResourceKey::as_str).collect::<Vec<_>>(),
            config.default_queue_limit,
            config.default_hold_max.as_millis()
        );
        Self {
            config,
            policy,
            monitor,
            keys,
            slots,
        }
    }

    pub fn keys(&self) -> &[ResourceKey] {
        &self.keys
    }

    pub fn monitor(&self) -> &Arc<UsageMonitor> {
        &self.monitor
    }

    fn slot(&self, key: &ResourceKey) -> Result<&SharedSlot> {
        self.slots
            .get(key)
            .ok_or_else(|| Error::InvalidKey(key.clone()))
    }

    /// Request exclusive use of `request.resource_key`.
    ///
    /// Resolves immediately when the resource can be taken or the busy policy
    /// forbids waiting, otherwise parks the request in the priority queue
    /// until it is granted or `max_wait` elapses.
    ///
    /// A `Wait` request is never refused for exceeding the nominal queue
    /// limit; it is enqueued anyway and can only fail by timing out.
    ///
    /// Dropping the returned future while queued withdraws the request; if
    /// the grant already happened the lease is released.
    pub async fn acquire(&self, request: LeaseRequest) -> Result<AcquireOutcome> {
        let key = request.resource_key.clone();
        let slot = self.slot(&key)?;
        let state = self.monitor.admission_state(&key);
        let hold_max = request.hold_max.unwrap_or(self.config.default_hold_max);
        let queue_limit = request.queue_limit.unwrap_or(self.config.default_queue_limit);
        let lease_id = LeaseId::generate();

        let rx = {
            let mut guard = slot.lock();
            let is_locked = guard.active.is_some();
            let queue_len = guard.queue.len();
            let decision = self.policy.decide(
                state,
                is_locked,
                queue_len,
                request.task_type,
                request.priority,
            );

            if decision == AdmissionDecision::AcquireNow {
                let now = Instant::now();
                let lease = Lease {
                    id: lease_id,
                    resource_key: key.clone(),
                    task_type: request.task_type,
                    priority: request.priority,
                    acquired_at: now,
                    acquired_at_utc: chrono::Utc::now(),
                    queue_wait: Duration::ZERO,
                    hold_max,
                    trace: request.trace,
                };
                activate(slot, &mut guard, lease.clone());
                guard.metrics.record_acquired(0);
                info!(
                    "🔒 LEASE: Acquired - key={}, lease={}, task={}, priority={}, state={}, {}",
                    key, lease.id, lease.task_type, lease.priority, state, lease.trace
                );
                return Ok(AcquireOutcome::Acquired(lease));
            }

            if request.busy_policy != BusyPolicy::Wait {
                let reason = if queue_len >= queue_limit {
                    DenyReason::QueueFull
                } else if is_locked {
                    DenyReason::GpuBusy
                } else {
                    DenyReason::HighPressure
                };
                let kind = request.busy_policy.denial_kind();
                guard.metrics.record_denied(kind, reason);
                info!(
                    "🚫 LEASE: Rejected without waiting - key={}, task={}, priority={}, outcome={}, reason={}, queue={}, {}",
                    key, request.task_type, request.priority, kind, reason, queue_len, request.trace
                );
                return Ok(AcquireOutcome::denied(kind, reason));
            }

            if queue_len >= queue_limit {
                warn!(
                    "LEASE: Queue over nominal limit, WAIT request enqueued anyway - key={}, task={}, queue={}, limit={}",
                    key, request.task_type, queue_len, queue_limit
                );
            }

            let (tx, rx) = oneshot::channel();
            let position = guard.queue.push(PendingRequest {
                lease_id: lease_id.clone(),
                task_type: request.task_type,
                priority: request.priority,
                max_wait: request.max_wait,
                hold_max,
                busy_policy: request.busy_policy,
                queued_at: Instant::now(),
                trace: request.trace.clone(),
                responder: tx,
            });
            info!(
                "📥 LEASE: Queued - key={}, lease={}, task={}, priority={}, position={}, max_wait={}ms, state={}, {}",
                key,
                lease_id,
                request.task_type,
                request.priority,
                position,
                request.max_wait.as_millis(),
                state,
                request.trace
            );
            rx
        };

        let waiter = Waiter {
            manager: self,
            slot,
            key,
            lease_id,
            task_type: request.task_type,
            busy_policy: request.busy_policy,
            rx,
            settled: false,
        };
        Ok(waiter.wait(request.max_wait).await)
    }

    /// Release a lease and hand the resource to the next queued request.
    ///
    /// Unknown or already released ids are ignored with a warning. Returns
    /// true if a lease was released.
    pub fn release(&self, lease_id: &LeaseId) -> bool {
        for key in &self.keys {
            let Some(slot) = self.slots.get(key) else {
                continue;
            };
            let mut guard = slot.lock();
            if !guard.is_active(lease_id) {
                continue;
            }
            let Some(active) = guard.active.take() else {
                continue;
            };
            if let Some(watchdog) = active.watchdog {
                watchdog.abort();
            }
            let held = active.lease.held_for();
            guard.metrics.record_release(held.as_millis() as u64);
            info!(
                "🔓 LEASE: Released - key={}, lease={}, task={}, held={}ms, queue={}",
                key,
                lease_id,
                active.lease.task_type,
                held.as_millis(),
                guard.queue.len()
            );
            grant_next(key, slot, &mut guard);
            return true;
        }
        warn!("⚠️ LEASE: Release of unknown lease ignored - lease={}", lease_id);
        false
    }

    /// Grant the head of the queue if the resource is free. Used when a key
    /// leaves high pressure, since no release may be coming to drain a queue
    /// that built up while the resource sat idle.
    pub fn reevaluate(&self, key: &ResourceKey) -> Result<Option<LeaseId>> {
        let slot = self.slot(key)?;
        let mut guard = slot.lock();
        if guard.active.is_some() || guard.queue.is_empty() {
            return Ok(None);
        }
        debug!(
            "LEASE: Re-evaluating idle resource with waiters - key={}, queue={}",
            key,
            guard.queue.len()
        );
        Ok(grant_next(key, slot, &mut guard))
    }

    /// Follow the monitor's admission transitions and re-evaluate every key
    /// that returns to `Normal`. Abort the handle to stop.
    pub fn watch_admission(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let mut transitions = self.monitor.subscribe();
        tokio::spawn(async move {
            loop {
                match transitions.recv().await {
                    Ok(transition) if transition.to == AdmissionState::Normal => {
                        if let Err(e) = self.reevaluate(&transition.resource_key) {
                            warn!(
                                "LEASE: Re-evaluation failed - key={}, error={}",
                                transition.resource_key, e
                            );
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(
                            "LEASE: Missed {} admission transitions, re-evaluating all keys",
                            missed
                        );
                        for key in &self.keys {
                            if self.monitor.admission_state(key) != AdmissionState::Normal {
                                continue;
                            }
                            if let Err(e) = self.reevaluate(key) {
                                warn!("LEASE: Re-evaluation failed - key={}, error={}", key, e);
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    /// Current lease on `key`, if any.
    pub fn active_lease(&self, key: &ResourceKey) -> Result<Option<Lease>> {
        Ok(self.slot(key)?.lock().active_lease().cloned())
    }

    pub fn queue_len(&self, key: &ResourceKey) -> Result<usize> {
        Ok(self.slot(key)?.lock().queue.len())
    }

    /// Introspection view of one resource. No side effects on the lease
    /// state.
    pub fn snapshot(&self, key: &ResourceKey) -> Result<ResourceSnapshot> {
        let slot = self.slot(key)?;
        let admission_state = self.monitor.admission_state(key);
        let usage = self.monitor.latest_sample(key).map(UsageView::from);
        let watermarks = self.monitor.effective_watermarks(key);

        let guard = slot.lock();
        let now = Instant::now();
        let current_lease = guard.active_lease().map(|lease| {
            let held = now.saturating_duration_since(lease.acquired_at);
            LeaseView {
                lease_id: lease.id.clone(),
                task_type: lease.task_type,
                priority: lease.priority,
                acquired_at: lease.acquired_at_utc,
                hold_ms: held.as_millis() as u64,
                hold_max_ms: lease.hold_max.as_millis() as u64,
                queue_wait_ms: lease.queue_wait_ms(),
                over_budget: held > lease.hold_max,
                trace: lease.trace.clone(),
            }
        });
        let queue = guard
            .queue
            .iter()
            .map(|pending| QueueEntryView {
                lease_id: pending.lease_id.clone(),
                task_type: pending.task_type,
                priority: pending.priority,
                busy_policy: pending.busy_policy,
                wait_time_ms: now.saturating_duration_since(pending.queued_at).as_millis() as u64,
                max_wait_ms: pending.max_wait.as_millis() as u64,
                trace: pending.trace.clone(),
            })
            .collect();

        Ok(ResourceSnapshot {
            resource_key: key.clone(),
            admission_state,
            usage,
            watermarks,
            current_lease,
            queue,
            metrics: guard.metrics.snapshot(),
        })
    }

    pub fn snapshot_all(&self) -> Vec<ResourceSnapshot> {
        self.keys
            .iter()
            .filter_map(|key| self.snapshot(key).ok())
            .collect()
    }
}

fn activate(slot: &SharedSlot, guard: &mut ResourceSlot, lease: Lease) {
    let watchdog = watchdog::arm(slot, &lease);
    guard.active = Some(ActiveLease { lease, watchdog });
}

/// Pop queued requests until one is granted. Entries whose waiter is gone
/// are discarded. Caller holds the slot lock and the resource is free.
fn grant_next(key: &ResourceKey, slot: &SharedSlot, guard: &mut ResourceSlot) -> Option<LeaseId> {
    while guard.active.is_none() {
        let pending = guard.queue.pop()?;
        if pending.is_abandoned() {
            debug!(
                "LEASE: Dropping abandoned request - key={}, lease={}",
                key, pending.lease_id
            );
            continue;
        }
        let now = Instant::now();
        let queue_wait = now.saturating_duration_since(pending.queued_at);
        let lease = Lease {
            id: pending.lease_id,
            resource_key: key.clone(),
            task_type: pending.task_type,
            priority: pending.priority,
            acquired_at: now,
            acquired_at_utc: chrono::Utc::now(),
            queue_wait,
            hold_max: pending.hold_max,
            trace: pending.trace,
        };
        activate(slot, guard, lease.clone());
        match pending.responder.send(lease) {
            Ok(()) => {
                let lease_id = guard.active_lease().map(|lease| lease.id.clone());
                guard.metrics.record_acquired(queue_wait.as_millis() as u64);
                info!(
                    "🎫 LEASE: Granted from queue - key={}, lease={}, task={}, wait={}ms, remaining={}",
                    key,
                    lease_id.as_ref().map(LeaseId::to_string).unwrap_or_default(),
                    pending.task_type,
                    queue_wait.as_millis(),
                    guard.queue.len()
                );
                return lease_id;
            }
            Err(lease) => {
                debug!(
                    "LEASE: Waiter vanished during grant - key={}, lease={}",
                    key, lease.id
                );
                if let Some(watchdog) = guard.active.take().and_then(|active| active.watchdog) {
                    watchdog.abort();
                }
            }
        }
    }
    None
}

/// A queued `acquire` call. Dropping it before it settles withdraws the
/// request, or releases the lease if the grant already landed.
struct Waiter<'a> {
    manager: &'a ResourceLeaseManager,
    slot: &'a SharedSlot,
    key: ResourceKey,
    lease_id: LeaseId,
    task_type: TaskType,
    busy_policy: BusyPolicy,
    rx: oneshot::Receiver<Lease>,
    settled: bool,
}

impl Waiter<'_> {
    async fn wait(mut self, max_wait: Duration) -> AcquireOutcome {
        match tokio::time::timeout(max_wait, &mut self.rx).await {
            Ok(Ok(lease)) => {
                self.settled = true;
                AcquireOutcome::Acquired(lease)
            }
            Ok(Err(_)) => {
                // responder dropped without a grant
                self.settled = true;
                let kind = self.busy_policy.denial_kind();
                self.slot.lock().metrics.record_denied(kind, DenyReason::Timeout);
                AcquireOutcome::denied(kind, DenyReason::Timeout)
            }
            Err(_) => self.expire(max_wait),
        }
    }

    /// Timeout path. Removal from the queue and the grant both happen under
    /// the slot lock, so exactly one of them wins.
    fn expire(&mut self, max_wait: Duration) -> AcquireOutcome {
        self.settled = true;
        {
            let mut guard = self.slot.lock();
            if guard.queue.remove(&self.lease_id).is_some() {
                let kind = self.busy_policy.denial_kind();
                guard.metrics.record_denied(kind, DenyReason::Timeout);
                warn!(
                    "⌛ LEASE: Timed out in queue - key={}, lease={}, task={}, max_wait={}ms, outcome={}, remaining={}",
                    self.key,
                    self.lease_id,
                    self.task_type,
                    max_wait.as_millis(),
                    kind,
                    guard.queue.len()
                );
                return AcquireOutcome::denied(kind, DenyReason::Timeout);
            }
        }
        match self.rx.try_recv() {
            Ok(lease) => AcquireOutcome::Acquired(lease),
            Err(_) => AcquireOutcome::denied(self.busy_policy.denial_kind(), DenyReason::Timeout),
        }
    }
}

impl Drop for Waiter<'_> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        {
            let mut guard = self.slot.lock();
            if guard.queue.remove(&self.lease_id).is_some() {
                debug!(
                    "LEASE: Queued request cancelled - key={}, lease={}",
                    self.key, self.lease_id
                );
                return;
            }
        }
        if let Ok(lease) = self.rx.try_recv() {
            debug!(
                "LEASE: Releasing lease granted to a cancelled request - key={}, lease={}",
                self.key, lease.id
            );
            self.manager.release(&lease.id);
        }
    }
}

#[cfg(test)]
impl ResourceLeaseManager {
    pub(crate) fn is_watched(&self, key: &ResourceKey) -> bool {
        self.slots
            .get(key)
            .is_some_and(|slot| slot.lock().active.as_ref().is_some_and(|a| a.watchdog.is_some()))
    }
}
