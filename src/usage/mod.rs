//! Device utilization sampling and admission pressure tracking.

pub mod monitor;
pub mod probe;

pub use monitor::{AdmissionTransition, DynamicAdjustment, UsageMonitor, UsageSample, Watermarks};
pub use probe::{parse_nvidia_smi_output, ManualProbe, NvidiaSmiProbe, UsageProbe, UsageReading};
