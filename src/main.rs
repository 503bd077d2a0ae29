use anyhow::Context;
use clap::{Parser, Subcommand};
use futures::future::join_all;
use gpu_lease_arbiter::{
    Arbiter, ArbiterConfig, Error, LeaseTrace, ManualProbe, NvidiaSmiProbe, ResourceKey,
    TaskType, UsageProbe,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// JSON configuration file. Built-in defaults are used when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(long, global = true)]
    verbose: bool,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Validate the configuration and print the resolved task policies.
    Check,

    /// Sample every configured resource once through nvidia-smi.
    Probe {
        /// nvidia-smi executable
        #[arg(long, default_value = "nvidia-smi")]
        binary: String,

        #[arg(long, default_value_t = 2000)]
        timeout_ms: u64,
    },

    /// Run a synthetic mixed workload against a manual probe and print the
    /// final snapshots as JSON.
    Simulate {
        /// Jobs per task type
        #[arg(long, default_value_t = 4)]
        jobs: usize,

        /// Simulated work per lease (ms)
        #[arg(long, default_value_t = 200)]
        work_ms: u64,

        /// Utilization reported for every resource
        #[arg(long, default_value_t = 40.0)]
        usage: f64,

        /// Switch utilization to this value halfway through the run
        #[arg(long)]
        spike: Option<f64>,
    },
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<ArbiterConfig> {
    match path {
        Some(path) => ArbiterConfig::from_file(path)
            .with_context(|| format!("loading config from {}", path.display())),
        None => Ok(ArbiterConfig::default()),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let default_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    let config = load_config(args.config.as_ref())?;
    match args.command {
        Command::Check => check(&config),
        Command::Probe { binary, timeout_ms } => probe(&config, binary, timeout_ms).await,
        Command::Simulate {
            jobs,
            work_ms,
            usage,
            spike,
        } => simulate(config, jobs, work_ms, usage, spike).await,
    }
}

fn check(config: &ArbiterConfig) -> anyhow::Result<()> {
    config.validate()?;
    println!(
        "enabled={} keys={:?} queue_limit={} hold_max={}ms",
        config.enabled,
        config
            .resource_keys
            .iter()
            .map(ResourceKey::as_str)
            .collect::<Vec<_>>(),
        config.default_queue_limit,
        config.default_hold_max_ms
    );
    for task_type in TaskType::ALL {
        let policy = config.policy_for(task_type);
        let key = config
            .resource_for(task_type)
            .map(|key| key.to_string())
            .unwrap_or_default();
        let configured = if config.task_policies.contains_key(&task_type) {
            ""
        } else {
            " (default)"
        };
        println!(
            "{:<16} key={} priority={} max_wait={}ms busy_policy={:?}{}",
            task_type.as_str(),
            key,
            policy.priority,
            policy.max_wait_ms,
            policy.busy_policy,
            configured
        );
    }
    println!(
        "watermarks high={:.1} low={:.1} sample_interval={}ms",
        config.usage_monitor.base_high_water,
        config.usage_monitor.base_low_water,
        config.usage_monitor.sample_interval_ms
    );
    Ok(())
}

async fn probe(config: &ArbiterConfig, binary: String, timeout_ms: u64) -> anyhow::Result<()> {
    let probe = NvidiaSmiProbe::new()
        .with_binary(binary)
        .with_timeout(Duration::from_millis(timeout_ms));
    let mut failures = 0;
    for key in &config.resource_keys {
        match probe.sample(key).await {
            Ok(reading) => println!(
                "{} usage={:.1}% memory={:.1}%",
                key, reading.usage_percent, reading.memory_percent
            ),
            Err(e) => {
                failures += 1;
                warn!("PROBE: Sample failed - key={}, error={}", key, e);
            }
        }
    }
    if failures == config.resource_keys.len() {
        anyhow::bail!("no resource could be sampled");
    }
    Ok(())
}

async fn simulate(
    config: ArbiterConfig,
    jobs: usize,
    work_ms: u64,
    usage: f64,
    spike: Option<f64>,
) -> anyhow::Result<()> {
    let probe = Arc::new(ManualProbe::new());
    for key in &config.resource_keys {
        probe.set_usage(key.clone(), usage);
    }
    let keys = config.resource_keys.clone();
    let arbiter = Arbiter::new(config, probe.clone() as Arc<dyn UsageProbe>)?;
    let handle = arbiter.start();
    let helper = arbiter.helper().clone();
    let work = Duration::from_millis(work_ms);

    info!(
        "SIMULATE: Starting workload - jobs_per_type={}, work={}ms, usage={:.1}",
        jobs, work_ms, usage
    );

    let mut tasks = Vec::new();
    for job in 0..jobs {
        for task_type in TaskType::ALL {
            let helper = helper.clone();
            let trace = LeaseTrace::job(format!("job-{}", job)).with_step(task_type.as_str());
            tasks.push(async move {
                let result = helper
                    .with_lease(task_type, trace, |_ctx| async move {
                        tokio::time::sleep(work).await;
                        Ok::<_, Error>(())
                    })
                    .await;
                (task_type, result)
            });
        }
    }

    let spike_task = spike.map(|spike| {
        let probe = probe.clone();
        let delay = work * (jobs as u32).max(1) / 2;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            for key in &keys {
                probe.set_usage(key.clone(), spike);
            }
            info!("SIMULATE: Usage spiked - usage={:.1}", spike);
        })
    });

    let results = join_all(tasks).await;
    if let Some(spike_task) = spike_task {
        spike_task.abort();
    }

    let mut completed = 0;
    for (task_type, result) in &results {
        match result {
            Ok(()) => completed += 1,
            Err(e) if e.wants_cpu_fallback() => {
                info!("SIMULATE: {} ran on CPU fallback - {}", task_type, e)
            }
            Err(e) => info!("SIMULATE: {} not run - {}", task_type, e),
        }
    }
    info!(
        "SIMULATE: Finished - completed={}, total={}",
        completed,
        results.len()
    );

    let snapshots = arbiter.snapshot_all();
    println!("{}", serde_json::to_string_pretty(&snapshots)?);
    handle.shutdown();
    Ok(())
}
