//! Hold-time watchdog. Purely diagnostic: an overrun is logged and counted,
//! the lease is never revoked.

use super::manager::SharedSlot;
use super::types::Lease;
use std::sync::Arc;
use tokio::task::AbortHandle;
use tracing::{debug, warn};

/// Arm a watchdog for `lease`. Returns `None` outside a tokio runtime, in
/// which case the lease runs unwatched.
///
/// The timer is aborted by release under the slot lock; after waking it
/// re-checks that the same lease is still active, so it cannot fire for a
/// lease that was released while it waited for the lock.
pub(crate) fn arm(slot: &SharedSlot, lease: &Lease) -> Option<AbortHandle> {
    let Ok(runtime) = tokio::runtime::Handle::try_current() else {
        debug!(
            "WATCHDOG: No runtime, lease unwatched - key={}, lease={}",
            lease.resource_key, lease.id
        );
        return None;
    };

    let slot = Arc::downgrade(slot);
    let lease_id = lease.id.clone();
    let hold_max = lease.hold_max;
    let handle = runtime.spawn(async move {
        tokio::time::sleep(hold_max).await;
        let Some(slot) = slot.upgrade() else {
            return;
        };
        let mut guard = slot.lock();
        let Some(active) = guard.active_lease() else {
            return;
        };
        if active.id != lease_id {
            return;
        }
        let held = active.held_for();
        warn!(
            "⏰ WATCHDOG: Lease held past its budget - key={}, lease={}, task={}, held={}ms, hold_max={}ms, {}",
            active.resource_key,
            active.id,
            active.task_type,
            held.as_millis(),
            hold_max.as_millis(),
            active.trace
        );
        guard.metrics_mut().record_watchdog_exceeded();
    });
    Some(handle.abort_handle())
}
