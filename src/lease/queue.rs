//! Per-resource pending request queue.
//!
//! Entries are kept sorted by descending priority; equal priorities keep
//! arrival order, so popping the front always yields the next request to
//! serve.

use super::types::{BusyPolicy, Lease, LeaseId, LeaseTrace, TaskType};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;

/// A request parked until the resource frees up or its wait expires.
#[derive(Debug)]
pub(crate) struct PendingRequest {
    pub lease_id: LeaseId,
    pub task_type: TaskType,
    pub priority: u8,
    pub max_wait: Duration,
    pub hold_max: Duration,
    pub busy_policy: BusyPolicy,
    pub queued_at: Instant,
    pub trace: LeaseTrace,
    pub responder: oneshot::Sender<Lease>,
}

impl PendingRequest {
    /// The waiter dropped its receiver (caller cancelled).
    pub fn is_abandoned(&self) -> bool {
        self.responder.is_closed()
    }
}

#[derive(Debug, Default)]
pub(crate) struct PendingQueue {
    entries: VecDeque<PendingRequest>,
}

impl PendingQueue {
    pub fn new() -> Self {
        Self {
            entries: VecDeque::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Insert behind every entry of equal or higher priority.
    pub fn push(&mut self, request: PendingRequest) -> usize {
        let position = self
            .entries
            .partition_point(|entry| entry.priority >= request.priority);
        self.entries.insert(position, request);
        position
    }

    pub fn pop(&mut self) -> Option<PendingRequest> {
        self.entries.pop_front()
    }

    /// Remove a specific entry. Returns `None` if it was already dequeued.
    pub fn remove(&mut self, lease_id: &LeaseId) -> Option<PendingRequest> {
        let index = self
            .entries
            .iter()
            .position(|entry| &entry.lease_id == lease_id)?;
        self.entries.remove(index)
    }

    #[cfg(test)]
    pub fn contains(&self, lease_id: &LeaseId) -> bool {
        self.entries.iter().any(|entry| &entry.lease_id == lease_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &PendingRequest> {
        self.entries.iter()
    }
}
