//! Admission policy: decides whether a request may take the resource now or
//! must go through the queue, given the load state of the device.

use super::types::TaskType;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Load classification of one resource, maintained by the usage monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AdmissionState {
    #[default]
    Normal,
    HighPressure,
}

impl fmt::Display for AdmissionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdmissionState::Normal => f.write_str("NORMAL"),
            AdmissionState::HighPressure => f.write_str("HIGH_PRESSURE"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionDecision {
    AcquireNow,
    Enqueue,
}

/// Fast-path thresholds applied while a resource is under high pressure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdmissionConfig {
    /// The single most latency-critical task type
    #[serde(default = "default_fast_path_task_type")]
    pub fast_path_task_type: TaskType,

    /// Fast-path task type at or above this priority may take a free
    /// resource when nothing is queued
    #[serde(default = "default_critical_priority")]
    pub critical_priority: u8,

    /// Any request at or above this priority may take a free resource even
    /// when others are queued
    #[serde(default = "default_elevated_priority")]
    pub elevated_priority: u8,
}

fn default_fast_path_task_type() -> TaskType {
    TaskType::Asr
}

fn default_critical_priority() -> u8 {
    90
}

fn default_elevated_priority() -> u8 {
    70
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            fast_path_task_type: default_fast_path_task_type(),
            critical_priority: default_critical_priority(),
            elevated_priority: default_elevated_priority(),
        }
    }
}

/// Pure admission decision function.
#[derive(Debug, Clone, Default)]
pub struct AdmissionPolicy {
    config: AdmissionConfig,
}

impl AdmissionPolicy {
    pub fn new(config: AdmissionConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &AdmissionConfig {
        &self.config
    }

    /// Decide between taking the resource immediately and queueing.
    ///
    /// Under `Normal` a free resource is always taken. Under `HighPressure`
    /// only two narrow cases may take a free resource:
    /// the fast-path task type at `critical_priority` with an empty queue, or
    /// any request at `elevated_priority` regardless of queue depth.
    pub fn decide(
        &self,
        state: AdmissionState,
        is_locked: bool,
        queue_len: usize,
        task_type: TaskType,
        priority: u8,
    ) -> AdmissionDecision {
        if is_locked {
            return AdmissionDecision::Enqueue;
        }
        match state {
            AdmissionState::Normal => AdmissionDecision::AcquireNow,
            AdmissionState::HighPressure => {
                let critical = queue_len == 0
                    && task_type == self.config.fast_path_task_type
                    && priority >= self.config.critical_priority;
                if critical || priority >= self.config.elevated_priority {
                    AdmissionDecision::AcquireNow
                } else {
                    AdmissionDecision::Enqueue
                }
            }
        }
    }
}
