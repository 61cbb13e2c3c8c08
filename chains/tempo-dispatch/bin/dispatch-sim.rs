use alloy_primitives::Address;
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use core_logic::{
    LoggerOptions, MetricsCollector, setup_logger, setup_quiet_logger, shutdown_token,
};
use dotenv::dotenv;
use std::sync::Arc;
use std::time::Duration;
use tempo_dispatch::tasks::default_tasks;
use tempo_dispatch::{
    DispatchConfig, EndpointHealthTracker, JsonRpcFactory, LocalSigner, PROTOCOL_LANE,
    ParallelDispatcher, RemoteRpc, ResourcePool, SchedulerSettings, SequenceAllocator, Signer,
    SimSigner, SimTransportFactory, SimulatedChain, TaskRegistry, TaskScheduler, TransportFactory,
};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about = "Tempo dispatch engine driver")]
struct Args {
    /// Path to config.toml
    #[arg(short, long, default_value = "config/config.toml")]
    config: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the scheduler against an in-memory chain
    Sim {
        #[arg(short, long)]
        workers: Option<u64>,
        /// Stop after this many seconds instead of waiting for Ctrl+C
        #[arg(short, long)]
        duration: Option<u64>,
        #[arg(short, long)]
        quiet: bool,
        /// Simulated latency of every RPC call
        #[arg(long, default_value = "50")]
        latency_ms: u64,
        /// Share of submissions the chain rejects as reverted
        #[arg(long, default_value = "0.0")]
        failure_rate: f64,
        /// Write the metrics snapshot here on exit
        #[arg(long)]
        metrics_out: Option<String>,
    },
    /// Run the scheduler against the configured endpoints
    ///
    /// Signing keys come from DISPATCH_PRIVATE_KEYS (comma-separated).
    Live {
        #[arg(short, long)]
        workers: Option<u64>,
        #[arg(short, long)]
        duration: Option<u64>,
        #[arg(short, long)]
        quiet: bool,
        #[arg(long)]
        metrics_out: Option<String>,
    },
    /// Read an address's sequences through every configured endpoint
    Probe {
        address: String,
        /// Also read lanes 1..=N
        #[arg(long, default_value = "0")]
        lanes: u64,
    },
    /// List enabled tasks with their effective weights
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    let args = Args::parse();

    let quiet = matches!(
        args.command,
        Some(Commands::Sim { quiet: true, .. } | Commands::Live { quiet: true, .. })
    );
    let _log_guard = if quiet {
        setup_quiet_logger()?;
        None
    } else {
        setup_logger(&LoggerOptions::default())?
    };

    // Auto-detect config path if default is not found
    let config_path = if std::path::Path::new(&args.config).exists() {
        args.config.clone()
    } else if args.config == "config/config.toml"
        && std::path::Path::new("chains/tempo-dispatch/config/config.toml").exists()
    {
        "chains/tempo-dispatch/config/config.toml".to_string()
    } else {
        args.config.clone()
    };
    let config = DispatchConfig::from_path(&config_path).context("Failed to load config")?;

    match args.command.unwrap_or(Commands::Sim {
        workers: None,
        duration: None,
        quiet: false,
        latency_ms: 50,
        failure_rate: 0.0,
        metrics_out: None,
    }) {
        Commands::Sim {
            workers,
            duration,
            latency_ms,
            failure_rate,
            metrics_out,
            ..
        } => {
            run_sim(
                &config,
                workers,
                duration,
                Duration::from_millis(latency_ms),
                failure_rate,
                metrics_out,
            )
            .await
        }
        Commands::Live {
            workers,
            duration,
            metrics_out,
            ..
        } => run_live(&config, workers, duration, metrics_out).await,
        Commands::Probe { address, lanes } => probe(&config, &address, lanes).await,
        Commands::List => {
            let registry = TaskRegistry::new(default_tasks(), &config.weights)?;
            println!("{:?}", registry);
            Ok(())
        }
    }
}

async fn run_sim(
    config: &DispatchConfig,
    workers: Option<u64>,
    duration: Option<u64>,
    latency: Duration,
    failure_rate: f64,
    metrics_out: Option<String>,
) -> Result<()> {
    let chain = Arc::new(
        SimulatedChain::new()
            .with_latency(latency)
            .with_failures(move |_| {
                (fastrand::f64() < failure_rate)
                    .then(|| "execution reverted: simulated failure".to_string())
            }),
    );

    let factory: Arc<dyn TransportFactory> = Arc::new(SimTransportFactory::new(chain.clone()));
    let signers: Vec<Arc<dyn Signer>> = (0..config.owner_count)
        .map(|i| Arc::new(SimSigner::from_index(i)) as Arc<dyn Signer>)
        .collect();

    run_engine(config, signers, factory, workers, duration, metrics_out).await?;
    println!("Submissions on chain: {}", chain.submissions().len());
    Ok(())
}

async fn run_live(
    config: &DispatchConfig,
    workers: Option<u64>,
    duration: Option<u64>,
    metrics_out: Option<String>,
) -> Result<()> {
    let keys = std::env::var("DISPATCH_PRIVATE_KEYS")
        .context("DISPATCH_PRIVATE_KEYS is not set (comma-separated private keys)")?;
    let signers: Vec<Arc<dyn Signer>> =
        LocalSigner::from_list(&keys, config.chain_id, &config.signing)?
            .into_iter()
            .map(|s| Arc::new(s) as Arc<dyn Signer>)
            .collect();
    info!(
        target: "task_result",
        "Chain {}: {} owners from DISPATCH_PRIVATE_KEYS",
        config.chain_id,
        signers.len()
    );

    let factory: Arc<dyn TransportFactory> = Arc::new(JsonRpcFactory {
        request_timeout: config.request_timeout(),
    });
    run_engine(config, signers, factory, workers, duration, metrics_out).await
}

/// Builds the engine over `signers` and `factory`, runs it until Ctrl+C or
/// `duration`, then prints the report.
async fn run_engine(
    config: &DispatchConfig,
    signers: Vec<Arc<dyn Signer>>,
    factory: Arc<dyn TransportFactory>,
    workers: Option<u64>,
    duration: Option<u64>,
    metrics_out: Option<String>,
) -> Result<()> {
    let endpoints = config.resolve_endpoints()?;
    info!(target: "task_result", "Endpoints: {}", endpoints.len());
    let health = Arc::new(EndpointHealthTracker::new(endpoints, config.health.clone())?);

    let pool = ResourcePool::new(signers, health.clone(), factory.clone(), config.pool.clone())?;
    let sequences = Arc::new(SequenceAllocator::new(config.sequence.clone()));
    let dispatcher = Arc::new(ParallelDispatcher::new(
        sequences.clone(),
        config.dispatch.clone(),
    ));
    let metrics = Arc::new(MetricsCollector::default());

    let mut settings = SchedulerSettings::from_config(config);
    if let Some(workers) = workers {
        settings.worker_count = workers.max(1) as usize;
    }
    info!(target: "task_result", "Workers: {}", settings.worker_count);
    info!(
        target: "task_result",
        "Interval: {}ms - {}ms",
        config.task_interval_min, config.task_interval_max
    );

    let scheduler = Arc::new(TaskScheduler::new(
        settings,
        default_tasks(),
        &config.weights,
        pool,
        dispatcher,
        metrics.clone(),
    )?);

    let token = shutdown_token();
    let recheck = health.spawn_recheck(factory, token.clone());
    if let Some(secs) = duration {
        let token = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(secs)).await;
            token.cancel();
        });
    }

    let started = chrono::Local::now();
    let report = scheduler.run(token.clone()).await;
    token.cancel();
    if let Some(handle) = recheck {
        let _ = handle.await;
    }

    println!(
        "Run {} -> {}: {} ok, {} failed, {} retries, {} backoffs",
        started.format("%H:%M:%S"),
        chrono::Local::now().format("%H:%M:%S"),
        report.success,
        report.failed,
        report.retries,
        report.backoffs
    );
    println!("Sequence cache: {:?}", sequences.stats());
    for endpoint in health.snapshot() {
        println!(
            "  {} {:<12} {:?} failures={}",
            endpoint.id, endpoint.name, endpoint.status, endpoint.consecutive_failures
        );
    }
    println!("{}", metrics.to_json());

    if let Some(path) = metrics_out {
        if let Err(e) = metrics.export_to_file(&path).await {
            warn!("Failed to export metrics to {}: {}", path, e);
        }
    }
    Ok(())
}

async fn probe(config: &DispatchConfig, address: &str, lanes: u64) -> Result<()> {
    let owner: Address = address.parse().context("Invalid address")?;
    let factory = JsonRpcFactory {
        request_timeout: config.request_timeout(),
    };

    for endpoint in config.resolve_endpoints()? {
        let rpc = factory.connect(&endpoint)?;
        match rpc.sequence(owner, PROTOCOL_LANE).await {
            Ok(sequence) => println!("{} {}: lane 0 -> {}", endpoint.id, endpoint.name, sequence),
            Err(e) => {
                println!("{} {}: unreachable ({})", endpoint.id, endpoint.name, e);
                continue;
            }
        }

        match rpc.authorized_lanes(owner).await {
            Ok(count) => println!("  authorized lanes: {}", count),
            Err(e) => println!("  authorized lanes: error ({})", e),
        }
        for lane in 1..=lanes {
            match rpc.sequence(owner, lane).await {
                Ok(sequence) => println!("  lane {} -> {}", lane, sequence),
                Err(e) => println!("  lane {} -> error ({})", lane, e),
            }
        }
    }
    Ok(())
}
