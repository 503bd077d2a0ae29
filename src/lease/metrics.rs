//! Per-resource lease metrics.

use super::types::{DenyReason, OutcomeKind};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Default number of queue-wait / hold-time samples kept per resource.
pub const DEFAULT_HISTORY_LEN: usize = 1000;

/// Fixed-capacity sample window; the oldest sample falls out first.
#[derive(Debug, Clone)]
pub struct BoundedHistory {
    samples: VecDeque<u64>,
    capacity: usize,
}

impl BoundedHistory {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, value: u64) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(value);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn summary(&self) -> HistorySummary {
        if self.samples.is_empty() {
            return HistorySummary::default();
        }
        let mut sorted: Vec<u64> = self.samples.iter().copied().collect();
        sorted.sort_unstable();
        let total: u64 = sorted.iter().sum();
        let percentile = |p: f64| -> u64 {
            let rank = ((sorted.len() as f64 - 1.0) * p).round() as usize;
            sorted[rank.min(sorted.len() - 1)]
        };
        HistorySummary {
            count: sorted.len(),
            avg_ms: total as f64 / sorted.len() as f64,
            p50_ms: percentile(0.50),
            p95_ms: percentile(0.95),
            max_ms: sorted[sorted.len() - 1],
        }
    }
}

/// Aggregate view of a sample window, in milliseconds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HistorySummary {
    pub count: usize,
    pub avg_ms: f64,
    pub p50_ms: u64,
    pub p95_ms: u64,
    pub max_ms: u64,
}

#[derive(Debug, Clone)]
pub struct ResourceMetrics {
    pub acquired: u64,
    pub skipped: u64,
    pub fallback_cpu: u64,
    pub timeouts: u64,
    pub queue_full: u64,
    pub watchdog_exceeded: u64,
    pub queue_wait_ms: BoundedHistory,
    pub hold_ms: BoundedHistory,
}

impl ResourceMetrics {
    pub fn new(history_len: usize) -> Self {
        Self {
            acquired: 0,
            skipped: 0,
            fallback_cpu: 0,
            timeouts: 0,
            queue_full: 0,
            watchdog_exceeded: 0,
            queue_wait_ms: BoundedHistory::new(history_len),
            hold_ms: BoundedHistory::new(history_len),
        }
    }

    pub fn record_acquired(&mut self, queue_wait_ms: u64) {
        self.acquired += 1;
        self.queue_wait_ms.push(queue_wait_ms);
    }

    pub fn record_release(&mut self, hold_ms: u64) {
        self.hold_ms.push(hold_ms);
    }

    /// Count a refused request by outcome kind and by reason.
    pub fn record_denied(&mut self, kind: OutcomeKind, reason: DenyReason) {
        match kind {
            OutcomeKind::Skipped => self.skipped += 1,
            OutcomeKind::FallbackCpu => self.fallback_cpu += 1,
            OutcomeKind::Timeout => {}
        }
        match reason {
            DenyReason::Timeout => self.timeouts += 1,
            DenyReason::QueueFull => self.queue_full += 1,
            DenyReason::GpuBusy | DenyReason::HighPressure => {}
        }
    }

    pub fn record_watchdog_exceeded(&mut self) {
        self.watchdog_exceeded += 1;
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            acquired: self.acquired,
            skipped: self.skipped,
            fallback_cpu: self.fallback_cpu,
            timeouts: self.timeouts,
            queue_full: self.queue_full,
            watchdog_exceeded: self.watchdog_exceeded,
            queue_wait: self.queue_wait_ms.summary(),
            hold: self.hold_ms.summary(),
        }
    }
}

impl Default for ResourceMetrics {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_LEN)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub acquired: u64,
    pub skipped: u64,
    pub fallback_cpu: u64,
    pub timeouts: u64,
    pub queue_full: u64,
    pub watchdog_exceeded: u64,
    pub queue_wait: HistorySummary,
    pub hold: HistorySummary,
}
