use std::path::Path;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use prime_ladder_core::{
    ConfigLoader, ConfigWatcher, LadderConfig, ManualClock, SequentialIdSource, SimulatedOracle,
    SystemClock, UuidIdSource,
};
use prime_ladder_scheduler::LadderEngine;
use tokio::sync::broadcast::error::RecvError;

mod paper;

use paper::{configured_symbols, PaperFeed, SimulationPlan};

#[derive(Parser)]
#[command(name = "prime-ladder")]
#[command(about = "Prime-band ladder engine: theta budgeting, laddering and roll scheduling", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the engine against a live paper feed until interrupted
    Run {
        /// Config file path
        #[arg(short, long, default_value = "config/Config.toml")]
        config: String,
        /// Log to this file instead of stderr
        #[arg(long)]
        log_file: Option<String>,
        /// Seed for the paper feed and simulated oracle
        #[arg(long, env = "LADDER_SEED", default_value_t = 42)]
        seed: u64,
        /// Seconds between paper price marks
        #[arg(long, default_value_t = 5)]
        tick_secs: u64,
    },
    /// Replay a seeded offline simulation on a manual clock and print the final snapshot
    Simulate {
        /// Config file path
        #[arg(short, long, default_value = "config/Config.toml")]
        config: String,
        #[arg(long, default_value_t = 42)]
        seed: u64,
        /// Number of simulated steps
        #[arg(long, default_value_t = 500)]
        steps: u32,
        /// Simulated minutes per step
        #[arg(long, default_value_t = 60)]
        step_minutes: i64,
        /// Chance of opening a position on each step
        #[arg(long, default_value_t = 0.3)]
        open_probability: f64,
        /// Rebalance every N steps
        #[arg(long, default_value_t = 4)]
        rebalance_every: u32,
        /// Per-step price shock bound (fraction)
        #[arg(long, default_value_t = 0.02)]
        volatility: f64,
    },
    /// Validate a config file and print the effective configuration
    CheckConfig {
        /// Config file path
        #[arg(short, long, default_value = "config/Config.toml")]
        config: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match &cli.command {
        Commands::Run {
            log_file: Some(path),
            ..
        } => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {path}"))?;
            tracing_subscriber::fmt()
                .with_env_filter(
                    tracing_subscriber::EnvFilter::try_from_default_env()
                        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
                )
                .with_writer(std::sync::Mutex::new(file))
                .init();
        }
        _ => {
            tracing_subscriber::fmt()
                .with_env_filter(
                    tracing_subscriber::EnvFilter::try_from_default_env()
                        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
                )
                .init();
        }
    }

    match cli.command {
        Commands::Run {
            config,
            log_file: _,
            seed,
            tick_secs,
        } => {
            run_engine(&config, seed, tick_secs).await?;
        }
        Commands::Simulate {
            config,
            seed,
            steps,
            step_minutes,
            open_probability,
            rebalance_every,
            volatility,
        } => {
            let plan = SimulationPlan {
                steps,
                step: chrono::Duration::minutes(step_minutes.max(1)),
                open_probability,
                rebalance_every,
            };
            run_simulation(&config, seed, &plan, volatility).await?;
        }
        Commands::CheckConfig { config } => {
            check_config(&config)?;
        }
    }

    Ok(())
}

async fn run_engine(config_path: &str, seed: u64, tick_secs: u64) -> anyhow::Result<()> {
    tracing::info!(config = config_path, seed, "Starting prime ladder engine");

    let config = ConfigLoader::load_from(config_path)?;
    let symbols = configured_symbols(&config);
    let (watcher, config_rx) = ConfigWatcher::new(config, config_path);
    let watcher_handle = tokio::spawn(async move {
        if let Err(e) = watcher.watch().await {
            tracing::error!(error = %e, "Config watcher stopped");
        }
    });

    let engine = Arc::new(LadderEngine::with_sources(
        config_rx,
        Arc::new(SimulatedOracle::seeded(seed)),
        Arc::new(UuidIdSource),
        Arc::new(SystemClock),
    )?);

    let mut events = engine.subscribe();
    let event_log = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    let position = event.position();
                    tracing::debug!(
                        event = event.name(),
                        position_id = %position.id,
                        symbol = %position.symbol,
                        band = position.assigned_band,
                        "Position event"
                    );
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Event log fell behind");
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    engine.start().await;

    let feed_engine = Arc::clone(&engine);
    let feed_handle = tokio::spawn(async move {
        let mut feed = PaperFeed::new(seed, &symbols, 0.005);
        let mut marks = tokio::time::interval(StdDuration::from_secs(tick_secs.max(1)));
        let mut daily = tokio::time::interval(StdDuration::from_secs(24 * 60 * 60));
        // both fire immediately
        marks.tick().await;
        daily.tick().await;
        loop {
            tokio::select! {
                _ = marks.tick() => {
                    for (symbol, price) in feed.step() {
                        if let Err(e) = feed_engine.mark_price(&symbol, price).await {
                            tracing::warn!(symbol = %symbol, error = %e, "Mark rejected");
                        }
                    }
                    if feed.should_open(0.2) {
                        if let Some(request) = feed.next_request() {
                            if let Err(e) = feed_engine.open_position(request).await {
                                tracing::info!(error_code = %e.code(), error = %e, "Paper open rejected");
                            }
                        }
                    }
                }
                _ = daily.tick() => {
                    let reset = feed_engine.reset_theta_budget("daily_reset").await;
                    tracing::info!(previous_used = reset.previous_used, "Daily theta budget reset");
                }
            }
        }
    });

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    tracing::info!("Received Ctrl+C, initiating graceful shutdown");

    feed_handle.abort();
    engine.shutdown().await;
    watcher_handle.abort();
    event_log.abort();

    let snapshot = engine.snapshot().await;
    tracing::info!(
        active_positions = snapshot.active_positions,
        ladders = snapshot.ladders.total_ladders,
        rolls_completed = snapshot.metrics.rolls_completed,
        used_budget = snapshot.budget.used_budget,
        "Prime ladder engine stopped"
    );
    Ok(())
}

async fn run_simulation(
    config_path: &str,
    seed: u64,
    plan: &SimulationPlan,
    volatility: f64,
) -> anyhow::Result<()> {
    let config = load_or_default(config_path)?;
    let symbols = configured_symbols(&config);
    tracing::info!(seed, steps = plan.steps, symbols = symbols.len(), "Running offline simulation");

    let clock = Arc::new(ManualClock::new(chrono::Utc::now()));
    let (_config_tx, config_rx) = tokio::sync::watch::channel(config);
    let engine = LadderEngine::with_sources(
        config_rx,
        Arc::new(SimulatedOracle::seeded(seed)),
        Arc::new(SequentialIdSource::new()),
        clock.clone(),
    )?;
    let mut feed = PaperFeed::new(seed, &symbols, volatility);

    let snapshot = paper::simulate(&engine, &clock, &mut feed, plan).await;
    println!("{}", serde_json::to_string_pretty(&snapshot)?);

    let metrics = &snapshot.metrics;
    tracing::info!(
        rolls_completed = metrics.rolls_completed,
        reopen_failures = metrics.reopen_failures,
        dropped = metrics.dropped,
        average_roll_pnl = metrics.average_roll_pnl(),
        "Simulation complete"
    );
    Ok(())
}

fn check_config(config_path: &str) -> anyhow::Result<()> {
    let config = load_or_default(config_path)?;
    for tier in config.tier_distribution.keys() {
        let bands = config.tier_bands(tier);
        let limits = config.limits_for(tier);
        tracing::info!(
            tier = %tier,
            primary = ?bands.primary,
            secondary = ?bands.secondary,
            max_ladders = limits.max_ladders,
            max_positions_per_ladder = limits.max_positions_per_ladder,
            "Tier"
        );
    }
    println!("{}", serde_json::to_string_pretty(&config)?);
    tracing::info!(config = config_path, "Configuration is valid");
    Ok(())
}

fn load_or_default(config_path: &str) -> anyhow::Result<LadderConfig> {
    if !Path::new(config_path).exists() {
        tracing::warn!(config = config_path, "Config file not found, using defaults");
    }
    ConfigLoader::load_from(config_path)
}
