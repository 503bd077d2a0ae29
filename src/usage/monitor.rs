//! Utilization sampling and hysteresis-based admission state.

use super::probe::{UsageProbe, UsageReading};
use crate::config::UsageMonitorConfig;
use crate::lease::admission::AdmissionState;
use crate::lease::types::ResourceKey;
use ahash::AHashMap;
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

const TRANSITION_CHANNEL_CAPACITY: usize = 64;

/// Cached utilization measurement.
#[derive(Debug, Clone, Copy)]
pub struct UsageSample {
    pub usage_percent: f64,
    pub memory_percent: f64,
    pub sampled_at: Instant,
}

impl UsageSample {
    pub fn age(&self) -> Duration {
        self.sampled_at.elapsed()
    }
}

/// Boosted watermarks installed by a long-task hint.
#[derive(Debug, Clone, Copy)]
pub struct DynamicAdjustment {
    pub boosted_high_water: f64,
    pub boosted_low_water: f64,
    pub expires_at: Instant,
}

/// Thresholds in effect for one resource right now.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Watermarks {
    pub high_water: f64,
    pub low_water: f64,
    pub boosted: bool,
}

/// Emitted whenever a resource changes admission state.
#[derive(Debug, Clone, PartialEq)]
pub struct AdmissionTransition {
    pub resource_key: ResourceKey,
    pub from: AdmissionState,
    pub to: AdmissionState,
    pub usage_percent: f64,
}

#[derive(Debug, Default)]
struct KeyUsage {
    sample: Option<UsageSample>,
    state: AdmissionState,
    adjustment: Option<DynamicAdjustment>,
}

/// Samples device utilization and maintains the NORMAL / HIGH_PRESSURE state
/// of every tracked resource key.
pub struct UsageMonitor {
    config: UsageMonitorConfig,
    probe: Arc<dyn UsageProbe>,
    keys: Vec<ResourceKey>,
    usage: RwLock<AHashMap<ResourceKey, KeyUsage>>,
    transitions: broadcast::Sender<AdmissionTransition>,
}

impl UsageMonitor {
    pub fn new(
        config: UsageMonitorConfig,
        keys: Vec<ResourceKey>,
        probe: Arc<dyn UsageProbe>,
    ) -> Self {
        let usage = keys
            .iter()
            .map(|key| (key.clone(), KeyUsage::default()))
            .collect();
        let (transitions, _) = broadcast::channel(TRANSITION_CHANNEL_CAPACITY);
        Self {
            config,
            probe,
            keys,
            usage: RwLock::new(usage),
            transitions,
        }
    }

    pub fn config(&self) -> &UsageMonitorConfig {
        &self.config
    }

    pub fn keys(&self) -> &[ResourceKey] {
        &self.keys
    }

    /// Subscribe to admission state transitions.
    pub fn subscribe(&self) -> broadcast::Receiver<AdmissionTransition> {
        self.transitions.subscribe()
    }

    /// Current admission state; untracked keys are always `Normal`.
    pub fn admission_state(&self, key: &ResourceKey) -> AdmissionState {
        self.usage
            .read()
            .get(key)
            .map(|usage| usage.state)
            .unwrap_or_default()
    }

    /// Latest sample, or `None` when it is older than the cache TTL.
    pub fn latest_sample(&self, key: &ResourceKey) -> Option<UsageSample> {
        let ttl = self.config.cache_ttl();
        self.usage
            .read()
            .get(key)
            .and_then(|usage| usage.sample)
            .filter(|sample| sample.age() <= ttl)
    }

    /// Watermarks in effect for `key`. An expired adjustment is dropped here.
    pub fn effective_watermarks(&self, key: &ResourceKey) -> Watermarks {
        let mut usage = self.usage.write();
        match usage.get_mut(key) {
            Some(entry) => self.watermarks_for(key, entry, Instant::now()),
            None => self.base_watermarks(),
        }
    }

    fn base_watermarks(&self) -> Watermarks {
        Watermarks {
            high_water: self.config.base_high_water,
            low_water: self.config.base_low_water,
            boosted: false,
        }
    }

    fn watermarks_for(&self, key: &ResourceKey, entry: &mut KeyUsage, now: Instant) -> Watermarks {
        match entry.adjustment {
            Some(adjustment) if now < adjustment.expires_at => Watermarks {
                high_water: adjustment.boosted_high_water,
                low_water: adjustment.boosted_low_water,
                boosted: true,
            },
            Some(_) => {
                entry.adjustment = None;
                debug!("USAGE: Dynamic adjustment expired - key={}", key);
                self.base_watermarks()
            }
            None => self.base_watermarks(),
        }
    }

    /// Apply one reading: refresh the cache and run the hysteresis.
    ///
    /// Returns the transition if the admission state changed.
    pub fn record_sample(
        &self,
        key: &ResourceKey,
        reading: UsageReading,
    ) -> Option<AdmissionTransition> {
        let now = Instant::now();
        let transition = {
            let mut usage = self.usage.write();
            let entry = usage.get_mut(key)?;
            entry.sample = Some(UsageSample {
                usage_percent: reading.usage_percent,
                memory_percent: reading.memory_percent,
                sampled_at: now,
            });

            let marks = self.watermarks_for(key, entry, now);
            let usage_percent = reading.usage_percent;
            let next = match entry.state {
                AdmissionState::Normal if usage_percent >= marks.high_water => {
                    AdmissionState::HighPressure
                }
                AdmissionState::HighPressure if usage_percent <= marks.low_water => {
                    AdmissionState::Normal
                }
                current => current,
            };
            if next == entry.state {
                return None;
            }
            let transition = AdmissionTransition {
                resource_key: key.clone(),
                from: entry.state,
                to: next,
                usage_percent,
            };
            entry.state = next;
            info!(
                "USAGE: Admission state changed - key={}, {} -> {}, usage={:.1}%, high={:.1}, low={:.1}, boosted={}",
                key, transition.from, transition.to, usage_percent, marks.high_water, marks.low_water, marks.boosted
            );
            transition
        };
        // no subscribers is fine
        let _ = self.transitions.send(transition.clone());
        Some(transition)
    }

    /// Forewarn the monitor that a task of `estimated` duration is about to
    /// run on `key`. Long tasks temporarily raise the watermarks so the load
    /// they legitimately cause isn't mistaken for pressure.
    ///
    /// Returns true if an adjustment was installed.
    pub fn notify_task_hint(&self, key: &ResourceKey, estimated: Duration) -> bool {
        let dynamic = &self.config.dynamic_adjustment;
        if !dynamic.enabled || estimated <= dynamic.long_task_threshold() {
            return false;
        }
        let mut usage = self.usage.write();
        let Some(entry) = usage.get_mut(key) else {
            warn!("USAGE: Task hint for untracked key - key={}", key);
            return false;
        };
        let (high, low) = dynamic.boosted(self.config.base_high_water, self.config.base_low_water);
        entry.adjustment = Some(DynamicAdjustment {
            boosted_high_water: high,
            boosted_low_water: low,
            expires_at: Instant::now() + dynamic.adjustment_ttl(),
        });
        info!(
            "USAGE: Dynamic adjustment installed - key={}, estimate={}ms, high={:.1}, low={:.1}, ttl={}ms",
            key,
            estimated.as_millis(),
            high,
            low,
            dynamic.adjustment_ttl_ms
        );
        true
    }

    /// Sample every tracked key once. A failing key is logged and skipped.
    pub async fn sample_once(&self) -> Vec<AdmissionTransition> {
        let mut transitions = Vec::new();
        let budget = self.config.sample_interval();
        for key in &self.keys {
            match tokio::time::timeout(budget, self.probe.sample(key)).await {
                Ok(Ok(reading)) => {
                    if let Some(transition) = self.record_sample(key, reading) {
                        transitions.push(transition);
                    }
                }
                Ok(Err(e)) => {
                    warn!(
                        "USAGE: Probe {} failed, skipping tick - key={}, error={}",
                        self.probe.name(),
                        key,
                        e
                    );
                }
                Err(_) => {
                    warn!(
                        "USAGE: Probe {} exceeded {}ms, skipping tick - key={}",
                        self.probe.name(),
                        budget.as_millis(),
                        key
                    );
                }
            }
        }
        transitions
    }

    /// Start the periodic sampling loop. Abort the handle to stop it.
    pub fn start_sampling(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let period = self.config.sample_interval();
        info!(
            "USAGE: Starting sampler - probe={}, interval={}ms, keys={}",
            self.probe.name(),
            period.as_millis(),
            self.keys.len()
        );
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                self.sample_once().await;
            }
        })
    }
}
