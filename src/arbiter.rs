//! Wiring of the monitor, manager and helper into one process-wide service.

use crate::config::ArbiterConfig;
use crate::error::Result;
use crate::lease::{
    AdmissionPolicy, LeaseHelper, LeaseManagerConfig, ResourceLeaseManager, ResourceSnapshot,
};
use crate::usage::{UsageMonitor, UsageProbe};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::info;

/// Owns every arbitration component. Construct once per process and share
/// the [`LeaseHelper`] with pipeline stages.
pub struct Arbiter {
    monitor: Arc<UsageMonitor>,
    manager: Arc<ResourceLeaseManager>,
    helper: LeaseHelper,
}

impl Arbiter {
    pub fn new(config: ArbiterConfig, probe: Arc<dyn UsageProbe>) -> Result<Self> {
        config.validate()?;
        info!(
            "🚀 ARBITER: Initializing - enabled={}, keys={}, probe={}, sampling={}",
            config.enabled,
            config.resource_keys.len(),
            probe.name(),
            config.usage_monitor.enabled
        );
        let monitor = Arc::new(UsageMonitor::new(
            config.usage_monitor.clone(),
            config.resource_keys.clone(),
            probe,
        ));
        let manager = Arc::new(ResourceLeaseManager::new(
            LeaseManagerConfig::from(&config),
            AdmissionPolicy::new(config.admission.clone()),
            monitor.clone(),
        ));
        let helper = LeaseHelper::new(manager.clone(), config);
        Ok(Self {
            monitor,
            manager,
            helper,
        })
    }

    /// Start background work: the usage sampler (when enabled) and the
    /// listener that re-evaluates queues when pressure clears. Must be called
    /// inside a tokio runtime. Dropping the handle stops both.
    pub fn start(&self) -> ArbiterHandle {
        let sampler = self
            .monitor
            .config()
            .enabled
            .then(|| self.monitor.clone().start_sampling());
        let listener = self.manager.clone().watch_admission();
        ArbiterHandle {
            sampler,
            listener: Some(listener),
        }
    }

    pub fn helper(&self) -> &LeaseHelper {
        &self.helper
    }

    pub fn manager(&self) -> &Arc<ResourceLeaseManager> {
        &self.manager
    }

    pub fn monitor(&self) -> &Arc<UsageMonitor> {
        &self.monitor
    }

    pub fn snapshot_all(&self) -> Vec<ResourceSnapshot> {
        self.manager.snapshot_all()
    }
}

/// Background tasks spawned by [`Arbiter::start`].
pub struct ArbiterHandle {
    sampler: Option<JoinHandle<()>>,
    listener: Option<JoinHandle<()>>,
}

impl ArbiterHandle {
    pub fn is_sampling(&self) -> bool {
        self.sampler.is_some()
    }

    pub fn shutdown(mut self) {
        self.abort_all();
    }

    fn abort_all(&mut self) {
        let mut stopped = false;
        for task in [self.sampler.take(), self.listener.take()].into_iter().flatten() {
            task.abort();
            stopped = true;
        }
        if stopped {
            info!("🛑 ARBITER: Background tasks stopped");
        }
    }
}

impl Drop for ArbiterHandle {
    fn drop(&mut self) {
        self.abort_all();
    }
}
