//! Device utilization probes.
//!
//! The monitor only depends on the [`UsageProbe`] trait. A probe failure
//! means "no sample this tick", never zero usage.

use crate::error::{Error, Result};
use crate::lease::types::ResourceKey;
use ahash::AHashMap;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// One raw measurement returned by a probe.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct UsageReading {
    pub usage_percent: f64,
    pub memory_percent: f64,
}

impl UsageReading {
    pub fn new(usage_percent: f64, memory_percent: f64) -> Self {
        Self {
            usage_percent: usage_percent.clamp(0.0, 100.0),
            memory_percent: memory_percent.clamp(0.0, 100.0),
        }
    }
}

#[async_trait]
pub trait UsageProbe: Send + Sync {
    /// Measure the current utilization of one resource.
    async fn sample(&self, key: &ResourceKey) -> Result<UsageReading>;

    fn name(&self) -> &str;
}

/// Queries NVIDIA devices through `nvidia-smi`. Handles keys of the form
/// `gpu:<index>`.
#[derive(Debug, Clone)]
pub struct NvidiaSmiProbe {
    binary: String,
    timeout: Duration,
}

impl NvidiaSmiProbe {
    pub fn new() -> Self {
        Self {
            binary: "nvidia-smi".to_string(),
            timeout: Duration::from_secs(2),
        }
    }

    #[must_use]
    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl Default for NvidiaSmiProbe {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl UsageProbe for NvidiaSmiProbe {
    async fn sample(&self, key: &ResourceKey) -> Result<UsageReading> {
        let index = key
            .gpu_index()
            .ok_or_else(|| Error::Probe(format!("{} is not a gpu:<index> key", key)))?;

        let output = tokio::process::Command::new(&self.binary)
            .arg("--query-gpu=utilization.gpu,memory.used,memory.total")
            .arg("--format=csv,noheader,nounits")
            .arg("-i")
            .arg(index.to_string())
            .kill_on_drop(true)
            .output();
        let output = tokio::time::timeout(self.timeout, output)
            .await
            .map_err(|_| Error::Probe(format!("{} timed out for {}", self.binary, key)))??;

        if !output.status.success() {
            return Err(Error::Probe(format!(
                "{} exited with {} for {}: {}",
                self.binary,
                output.status,
                key,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        let reading = parse_nvidia_smi_output(&stdout)?;
        debug!(
            "PROBE: nvidia-smi sample - key={}, usage={:.1}%, memory={:.1}%",
            key, reading.usage_percent, reading.memory_percent
        );
        Ok(reading)
    }

    fn name(&self) -> &str {
        "nvidia-smi"
    }
}

/// Parse `utilization.gpu, memory.used, memory.total` CSV output (no header,
/// no units). Only the first non-empty line is used.
pub fn parse_nvidia_smi_output(output: &str) -> Result<UsageReading> {
    let line = output
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .ok_or_else(|| Error::Probe("empty nvidia-smi output".to_string()))?;

    let fields: Vec<&str> = line.split(',').map(str::trim).collect();
    if fields.len() != 3 {
        return Err(Error::Probe(format!("unexpected nvidia-smi line: {:?}", line)));
    }
    let parse = |field: &str| -> Result<f64> {
        field
            .parse::<f64>()
            .map_err(|_| Error::Probe(format!("non-numeric nvidia-smi field: {:?}", field)))
    };
    let usage = parse(fields[0])?;
    let used = parse(fields[1])?;
    let total = parse(fields[2])?;
    let memory_percent = if total > 0.0 { used / total * 100.0 } else { 0.0 };
    Ok(UsageReading::new(usage, memory_percent))
}

/// Probe whose readings are set programmatically. Keys without a reading
/// fail to sample.
#[derive(Debug, Default)]
pub struct ManualProbe {
    readings: RwLock<AHashMap<ResourceKey, UsageReading>>,
}

impl ManualProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, key: impl Into<ResourceKey>, reading: UsageReading) {
        self.readings.write().insert(key.into(), reading);
    }

    pub fn set_usage(&self, key: impl Into<ResourceKey>, usage_percent: f64) {
        self.set(key, UsageReading::new(usage_percent, 0.0));
    }

    pub fn clear(&self, key: &ResourceKey) {
        self.readings.write().remove(key);
    }
}

#[async_trait]
impl UsageProbe for ManualProbe {
    async fn sample(&self, key: &ResourceKey) -> Result<UsageReading> {
        self.readings
            .read()
            .get(key)
            .copied()
            .ok_or_else(|| Error::Probe(format!("no reading set for {}", key)))
    }

    fn name(&self) -> &str {
        "manual"
    }
}
