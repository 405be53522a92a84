/*!
 * Strand CLI - Command Line Interface
 *
 * Version: 0.1.0
 *
 * `strand run` drives the full fabric against a simulated backend and writes
 * every persisted outcome as one JSON line. `strand config` creates and
 * checks configuration files.
 */

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use strand::{
    cli_style::{self, print_error, print_info, print_success, print_warning},
    config::RuntimeConfig,
    core::TaskOutcome,
    error::{StrandError, EXIT_PARTIAL, EXIT_SUCCESS},
    logging,
    observability::{ChannelSink, FanoutSink, StrandEvent, TracingSink},
    output::JsonLinesSink,
    runtime::Runtime,
    sim::{SimulatedConnection, SimulatedFactory, SimulatedOperation, SimulationSettings},
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

const EVENT_CHANNEL_CAPACITY: usize = 4096;

#[derive(Parser)]
#[command(name = "strand")]
#[command(
    version,
    about = "Resilient concurrent task execution with rate limiting, circuit breaking and batching",
    long_about = None
)]
struct Cli {
    /// Verbose logging (debug level)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the configured schedules against a simulated backend
    Run(RunArgs),

    /// Configuration file helpers
    #[command(subcommand)]
    Config(ConfigCommands),
}

#[derive(Args)]
struct RunArgs {
    /// Configuration file (TOML)
    #[arg(short, long, value_name = "FILE")]
    config: PathBuf,

    /// Stop after this many seconds (default: run until Ctrl-C)
    #[arg(short, long, value_name = "SECS")]
    duration_secs: Option<u64>,

    /// JSON-lines file receiving persisted outcomes
    #[arg(short, long, value_name = "FILE", default_value = "strand-results.jsonl")]
    output: PathBuf,

    /// Probability that a simulated call fails
    #[arg(long, default_value = "0.05")]
    failure_rate: f64,

    /// Probability that opening a simulated connection fails
    #[arg(long, default_value = "0.0")]
    connect_failure_rate: f64,

    /// Minimum simulated call latency in milliseconds
    #[arg(long, default_value = "10")]
    min_latency_ms: u64,

    /// Maximum simulated call latency in milliseconds
    #[arg(long, default_value = "80")]
    max_latency_ms: u64,

    /// How often debounced schedules are poked
    #[arg(long, default_value = "100", value_name = "MS")]
    trigger_every_ms: u64,
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Print an example configuration, or write it to a file
    Init {
        /// Write to this file instead of stdout
        #[arg(short, long, value_name = "FILE")]
        output: Option<PathBuf>,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Validate a configuration file
    Check {
        /// Configuration file (TOML)
        file: PathBuf,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let code = match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            print_error(&format!("{:#}", e), None);
            e.downcast_ref::<StrandError>()
                .map(StrandError::exit_code)
                .unwrap_or(EXIT_PARTIAL)
        }
    };
    std::process::exit(code);
}

async fn run(cli: Cli) -> anyhow::Result<i32> {
    match cli.command {
        Commands::Run(args) => run_fabric(args, cli.verbose).await,
        Commands::Config(ConfigCommands::Init { output, force }) => {
            config_init(output.as_deref(), force)?;
            Ok(EXIT_SUCCESS)
        }
        Commands::Config(ConfigCommands::Check { file }) => {
            config_check(&file)?;
            Ok(EXIT_SUCCESS)
        }
    }
}

fn config_init(output: Option<&Path>, force: bool) -> anyhow::Result<()> {
    let config = RuntimeConfig::example();

    match output {
        None => {
            print!("{}", config.to_toml_string()?);
        }
        Some(path) => {
            if path.exists() && !force {
                return Err(StrandError::Config(format!(
                    "{} already exists (use --force to overwrite)",
                    path.display()
                ))
                .into());
            }
            config.to_file(path)?;
            print_success(&format!("Configuration written to {}", path.display()));
        }
    }
    Ok(())
}

fn config_check(path: &Path) -> anyhow::Result<()> {
    let config = RuntimeConfig::from_file(path)
        .with_context(|| format!("failed to load {}", path.display()))?;
    config
        .validate()
        .with_context(|| format!("invalid configuration in {}", path.display()))?;

    print_success(&format!("{} is valid", path.display()));
    for schedule in &config.schedules {
        let kind = schedule.kind()?;
        print_info(&format!("{} → {} ({:?})", schedule.name, schedule.operation, kind));
    }
    Ok(())
}

async fn run_fabric(args: RunArgs, verbose: bool) -> anyhow::Result<i32> {
    let mut config = RuntimeConfig::from_file(&args.config)
        .with_context(|| format!("failed to load {}", args.config.display()))?;
    config.logging.verbose |= verbose;

    if let Err(e) = logging::init_logging(&config.logging) {
        print_warning(&format!("Failed to initialize logging: {}", e));
    }

    let settings = SimulationSettings {
        latency_ms: args.min_latency_ms..=args.max_latency_ms,
        failure_rate: args.failure_rate,
        connect_failure_rate: args.connect_failure_rate,
        ..SimulationSettings::default()
    };
    settings.validate()?;

    let persistence = JsonLinesSink::<TaskOutcome>::open(&args.output).await?;

    let (channel, events_rx) = ChannelSink::new(EVENT_CHANNEL_CAPACITY);
    let channel = Arc::new(channel);
    let events = FanoutSink::new()
        .with(Arc::new(TracingSink))
        .with(channel.clone());

    let operations: BTreeSet<String> = config
        .schedules
        .iter()
        .map(|schedule| schedule.operation.clone())
        .collect();

    let mut builder = Runtime::<SimulatedConnection>::builder(config)
        .factory(Arc::new(SimulatedFactory::new(settings.clone())))
        .persistence(Arc::new(persistence))
        .events(Arc::new(events));
    for operation in operations {
        let handler = Arc::new(SimulatedOperation::new(operation.clone(), settings.clone()));
        builder = builder.handler(operation, handler);
    }
    let runtime = builder.start()?;

    print_info(&format!(
        "Running {} schedule(s), results → {}",
        runtime.config().schedules.len(),
        args.output.display()
    ));

    let tally_stop = CancellationToken::new();
    let trigger_stop = CancellationToken::new();
    let tally = spawn_event_tally(events_rx, tally_stop.clone());
    let triggers = spawn_trigger_drivers(
        &runtime,
        Duration::from_millis(args.trigger_every_ms.max(1)),
        trigger_stop.clone(),
    );

    let started = tokio::time::Instant::now();
    wait_for_stop(args.duration_secs).await;

    trigger_stop.cancel();
    for driver in triggers {
        let _ = driver.await;
    }
    let report = runtime.shutdown().await;
    tally_stop.cancel();
    let event_counts = tally.await.unwrap_or_default();
    let report = report?;

    cli_style::print_run_summary(&report, &event_counts, started.elapsed());
    if channel.dropped() > 0 {
        print_warning(&format!("{} events dropped by a slow consumer", channel.dropped()));
    }

    if report.stats.batch.failed_flushes > 0 {
        print_warning(&format!(
            "{} results could not be persisted",
            report.stats.batch.items_failed
        ));
        return Ok(EXIT_PARTIAL);
    }

    print_success(&format!("Results written to {}", args.output.display()));
    Ok(EXIT_SUCCESS)
}

/// Block until Ctrl-C or the optional run duration elapses
async fn wait_for_stop(duration_secs: Option<u64>) {
    let deadline = async {
        match duration_secs {
            Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
            None => std::future::pending::<()>().await,
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("interrupt received"),
        _ = deadline => info!("run duration elapsed"),
    }
}

/// Count events by kind until stopped, then drain whatever is left
fn spawn_event_tally(
    mut rx: mpsc::Receiver<StrandEvent>,
    stop: CancellationToken,
) -> JoinHandle<BTreeMap<&'static str, u64>> {
    tokio::spawn(async move {
        let mut counts = BTreeMap::new();
        loop {
            tokio::select! {
                event = rx.recv() => match event {
                    Some(event) => *counts.entry(event.kind()).or_insert(0) += 1,
                    None => break,
                },
                _ = stop.cancelled() => {
                    while let Ok(event) = rx.try_recv() {
                        *counts.entry(event.kind()).or_insert(0) += 1;
                    }
                    break;
                }
            }
        }
        counts
    })
}

/// Poke every debounced schedule at a fixed pace so coalescing is visible
fn spawn_trigger_drivers(
    runtime: &Runtime<SimulatedConnection>,
    every: Duration,
    stop: CancellationToken,
) -> Vec<JoinHandle<()>> {
    runtime
        .debouncers()
        .cloned()
        .map(|handle| {
            let stop = stop.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(every);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            let outcome = handle.trigger(None);
                            debug!(schedule = handle.name(), ?outcome, "debounce trigger");
                        }
                        _ = stop.cancelled() => break,
                    }
                }
            })
        })
        .collect()
}
