//! Deployment configuration for the arbiter.

use crate::error::{Error, Result};
use crate::lease::admission::AdmissionConfig;
use crate::lease::metrics::DEFAULT_HISTORY_LEN;
use crate::lease::types::{BusyPolicy, ResourceKey, TaskType, MAX_PRIORITY};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::time::Duration;

/// Top-level arbiter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArbiterConfig {
    /// When false every lease request is bypassed with a no-op lease
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Schedulable devices, fixed at startup
    #[serde(default = "default_resource_keys")]
    pub resource_keys: Vec<ResourceKey>,

    /// Queue length limit for requests that don't set their own
    #[serde(default = "default_queue_limit")]
    pub default_queue_limit: usize,

    /// Hold-time cap used by the watchdog when a request doesn't set one
    #[serde(default = "default_hold_max_ms")]
    pub default_hold_max_ms: u64,

    /// Number of queue-wait / hold-time samples kept per resource
    #[serde(default = "default_metrics_history")]
    pub metrics_history: usize,

    /// Per task type lease policy
    #[serde(default = "default_task_policies")]
    pub task_policies: BTreeMap<TaskType, TaskPolicy>,

    #[serde(default)]
    pub admission: AdmissionConfig,

    #[serde(default)]
    pub usage_monitor: UsageMonitorConfig,
}

fn default_enabled() -> bool {
    true
}

fn default_resource_keys() -> Vec<ResourceKey> {
    vec![ResourceKey::from("gpu:0")]
}

fn default_queue_limit() -> usize {
    8
}

fn default_hold_max_ms() -> u64 {
    30_000
}

fn default_metrics_history() -> usize {
    DEFAULT_HISTORY_LEN
}

fn default_task_policies() -> BTreeMap<TaskType, TaskPolicy> {
    BTreeMap::from([
        (TaskType::Asr, TaskPolicy::new(90, 3000, BusyPolicy::Wait)),
        (TaskType::Nmt, TaskPolicy::new(80, 3000, BusyPolicy::Wait)),
        (TaskType::Tts, TaskPolicy::new(70, 2000, BusyPolicy::FallbackCpu)),
        (
            TaskType::SemanticRepair,
            TaskPolicy::new(40, 1500, BusyPolicy::Skip),
        ),
    ])
}

impl Default for ArbiterConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            resource_keys: default_resource_keys(),
            default_queue_limit: default_queue_limit(),
            default_hold_max_ms: default_hold_max_ms(),
            metrics_history: default_metrics_history(),
            task_policies: default_task_policies(),
            admission: AdmissionConfig::default(),
            usage_monitor: UsageMonitorConfig::default(),
        }
    }
}

impl ArbiterConfig {
    /// Load and validate a JSON configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&raw)
    }

    pub fn from_json_str(raw: &str) -> Result<Self> {
        let config: ArbiterConfig = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.resource_keys.is_empty() {
            return Err(Error::Config("resource_keys must not be empty".to_string()));
        }
        let mut seen = HashSet::new();
        for key in &self.resource_keys {
            if !seen.insert(key) {
                return Err(Error::Config(format!("duplicate resource key {}", key)));
            }
        }
        if self.default_queue_limit == 0 {
            return Err(Error::Config("default_queue_limit must be at least 1".to_string()));
        }
        for (task_type, policy) in &self.task_policies {
            if policy.priority > MAX_PRIORITY {
                return Err(Error::Config(format!(
                    "priority {} for {} exceeds {}",
                    policy.priority, task_type, MAX_PRIORITY
                )));
            }
            if policy.queue_limit == Some(0) {
                return Err(Error::Config(format!("queue_limit for {} must be at least 1", task_type)));
            }
            if let Some(key) = &policy.resource_key {
                if !self.resource_keys.contains(key) {
                    return Err(Error::Config(format!(
                        "{} policy references unknown resource key {}",
                        task_type, key
                    )));
                }
            }
        }
        if self.admission.critical_priority > MAX_PRIORITY
            || self.admission.elevated_priority > MAX_PRIORITY
        {
            return Err(Error::Config("admission priorities must be within 0..=100".to_string()));
        }
        self.usage_monitor.validate()
    }

    /// Resolve the policy for a task type, falling back to conservative
    /// defaults for unconfigured types.
    pub fn policy_for(&self, task_type: TaskType) -> TaskPolicy {
        self.task_policies
            .get(&task_type)
            .cloned()
            .unwrap_or_else(TaskPolicy::conservative)
    }

    /// Resource a task type leases: its configured key, else the first key.
    pub fn resource_for(&self, task_type: TaskType) -> Option<ResourceKey> {
        self.task_policies
            .get(&task_type)
            .and_then(|policy| policy.resource_key.clone())
            .or_else(|| self.resource_keys.first().cloned())
    }

    pub fn default_hold_max(&self) -> Duration {
        Duration::from_millis(self.default_hold_max_ms)
    }

    /// Settings captured by the manager and monitor at construction. Returns
    /// the names of those that differ in `other`.
    pub fn restart_required_changes(&self, other: &ArbiterConfig) -> Vec<&'static str> {
        let mut changed = Vec::new();
        if self.resource_keys != other.resource_keys {
            changed.push("resource_keys");
        }
        if self.default_queue_limit != other.default_queue_limit {
            changed.push("default_queue_limit");
        }
        if self.default_hold_max_ms != other.default_hold_max_ms {
            changed.push("default_hold_max_ms");
        }
        if self.metrics_history != other.metrics_history {
            changed.push("metrics_history");
        }
        if self.admission != other.admission {
            changed.push("admission");
        }
        if self.usage_monitor != other.usage_monitor {
            changed.push("usage_monitor");
        }
        changed
    }
}

/// Lease policy for one task type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskPolicy {
    pub priority: u8,
    pub max_wait_ms: u64,
    pub busy_policy: BusyPolicy,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_key: Option<ResourceKey>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hold_max_ms: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_limit: Option<usize>,
}

impl TaskPolicy {
    pub fn new(priority: u8, max_wait_ms: u64, busy_policy: BusyPolicy) -> Self {
        Self {
            priority,
            max_wait_ms,
            busy_policy,
            resource_key: None,
            hold_max_ms: None,
            queue_limit: None,
        }
    }

    /// Used for task types missing from the policy table: low priority,
    /// short wait, never queue.
    pub fn conservative() -> Self {
        Self::new(50, 1000, BusyPolicy::Skip)
    }

    pub fn max_wait(&self) -> Duration {
        Duration::from_millis(self.max_wait_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageMonitorConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    #[serde(default = "default_sample_interval_ms")]
    pub sample_interval_ms: u64,

    /// Samples older than this are treated as missing
    #[serde(default = "default_cache_ttl_ms")]
    pub cache_ttl_ms: u64,

    #[serde(default = "default_high_water")]
    pub base_high_water: f64,

    #[serde(default = "default_low_water")]
    pub base_low_water: f64,

    #[serde(default)]
    pub dynamic_adjustment: DynamicAdjustmentConfig,
}

fn default_sample_interval_ms() -> u64 {
    800
}

fn default_cache_ttl_ms() -> u64 {
    2000
}

fn default_high_water() -> f64 {
    85.0
}

fn default_low_water() -> f64 {
    78.0
}

impl Default for UsageMonitorConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            sample_interval_ms: default_sample_interval_ms(),
            cache_ttl_ms: default_cache_ttl_ms(),
            base_high_water: default_high_water(),
            base_low_water: default_low_water(),
            dynamic_adjustment: DynamicAdjustmentConfig::default(),
        }
    }
}

impl UsageMonitorConfig {
    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_millis(self.cache_ttl_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.sample_interval_ms == 0 {
            return Err(Error::Config("sample_interval_ms must be positive".to_string()));
        }
        check_watermarks("base", self.base_high_water, self.base_low_water)?;
        let dynamic = &self.dynamic_adjustment;
        if dynamic.high_water_boost < 0.0 || dynamic.low_water_boost < 0.0 {
            return Err(Error::Config("watermark boosts must not be negative".to_string()));
        }
        let (high, low) = dynamic.boosted(self.base_high_water, self.base_low_water);
        check_watermarks("boosted", high, low)
    }
}

fn check_watermarks(label: &str, high: f64, low: f64) -> Result<()> {
    let in_range = |v: f64| (0.0..=100.0).contains(&v);
    if !in_range(high) || !in_range(low) {
        return Err(Error::Config(format!(
            "{} watermarks must be within 0..=100 (high={}, low={})",
            label, high, low
        )));
    }
    if low >= high {
        return Err(Error::Config(format!(
            "{} low water {} must be below high water {}",
            label, low, high
        )));
    }
    Ok(())
}

/// Temporary watermark boost ahead of a known long-running task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DynamicAdjustmentConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Hints with an estimate above this install a boost
    #[serde(default = "default_long_task_threshold_ms")]
    pub long_task_threshold_ms: u64,

    #[serde(default = "default_high_water_boost")]
    pub high_water_boost: f64,

    #[serde(default = "default_low_water_boost")]
    pub low_water_boost: f64,

    #[serde(default = "default_adjustment_ttl_ms")]
    pub adjustment_ttl_ms: u64,
}

fn default_long_task_threshold_ms() -> u64 {
    8000
}

fn default_high_water_boost() -> f64 {
    7.0
}

fn default_low_water_boost() -> f64 {
    7.0
}

fn default_adjustment_ttl_ms() -> u64 {
    15_000
}

impl Default for DynamicAdjustmentConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            long_task_threshold_ms: default_long_task_threshold_ms(),
            high_water_boost: default_high_water_boost(),
            low_water_boost: default_low_water_boost(),
            adjustment_ttl_ms: default_adjustment_ttl_ms(),
        }
    }
}

impl DynamicAdjustmentConfig {
    /// Boosted (high, low) watermarks, capped at 100.
    pub fn boosted(&self, high: f64, low: f64) -> (f64, f64) {
        (
            (high + self.high_water_boost).min(100.0),
            (low + self.low_water_boost).min(100.0),
        )
    }

    pub fn long_task_threshold(&self) -> Duration {
        Duration::from_millis(self.long_task_threshold_ms)
    }

    pub fn adjustment_ttl(&self) -> Duration {
        Duration::from_millis(self.adjustment_ttl_ms)
    }
}
