//! Salvage - crash-consistent volume backups for container engines
//!
//! ## Usage
//!
//! ```bash
//! # Run the scheduling daemon (inside the container labelled salvage.root)
//! MACHINE=node-1 salvage
//!
//! # Run one tide right now
//! salvage run nightly
//!
//! # Validate the label configuration and exit
//! salvage check
//! ```

use anyhow::Context;
use clap::{Parser, Subcommand};
use salvage_core::RunState;
use salvage_orchestrator::{
    cleanup_leftovers, config::capacity_label, own_container, shutdown, verify_crane_image,
    Configuration, ContainerEngine, DockerCli, ShutdownTrigger, TideScheduler,
    TideService, WebhookHooks,
};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Salvage: crash-consistent volume backups
#[derive(Parser)]
#[command(name = "salvage")]
#[command(about = "Crash-consistent volume backups for container engines", long_about = None)]
struct Cli {
    /// Docker CLI binary
    #[arg(long, global = true, default_value = "docker")]
    docker_bin: String,

    /// Machine name reported to cranes and webhooks
    #[arg(long, global = true, env = "MACHINE")]
    machine: Option<String>,

    /// Id of the container holding the configuration labels
    /// (default: the single container labelled salvage.root)
    #[arg(long, global = true)]
    own_container: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a single tide immediately and exit
    Run {
        /// Tide name
        tide: String,
    },

    /// Load and validate the configuration, then exit
    Check,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "salvage=info,info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    let engine: Arc<dyn ContainerEngine> =
        Arc::new(DockerCli::new().with_binary(cli.docker_bin.clone()));
    engine
        .ping()
        .await
        .context("container engine is not reachable")?;

    let config = load_configuration(engine.as_ref(), &cli).await?;
    log_configuration(&config);

    match cli.command {
        Some(Commands::Check) => {
            info!("✅ Configuration is valid");
            Ok(())
        }
        Some(Commands::Run { tide }) => run_once(engine, config, &tide).await,
        None => run_daemon(engine, config).await,
    }
}

async fn load_configuration(
    engine: &dyn ContainerEngine,
    cli: &Cli,
) -> anyhow::Result<Configuration> {
    let machine = cli
        .machine
        .clone()
        .ok_or_else(|| anyhow::anyhow!("machine name required, set MACHINE or --machine"))?;

    let own = match &cli.own_container {
        Some(id) => engine
            .inspect_container(id)
            .await
            .with_context(|| format!("failed to inspect container '{}'", id))?,
        None => own_container(engine).await?,
    };
    info!("📦 Loading configuration from container {}", own.name);

    Ok(Configuration::from_labels(machine, own.id, &own.labels)?)
}

fn log_configuration(config: &Configuration) {
    info!(machine = %config.machine, "Machine");
    for crane in config.cranes.values() {
        info!(
            crane = %crane.name,
            image = %crane.image,
            max_concurrent = %capacity_label(crane.max_concurrent),
            pull_on_run = crane.pull_on_run,
            "Crane"
        );
    }
    for tide in &config.tides {
        info!(
            tide = %tide.name,
            schedule = %tide.schedule,
            crane = %tide.crane.name,
            grouping = %tide.grouping,
            max_concurrent = %capacity_label(tide.max_concurrent),
            "Tide"
        );
    }
}

fn tide_service(
    engine: Arc<dyn ContainerEngine>,
    config: &Configuration,
) -> anyhow::Result<TideService> {
    let hooks = WebhookHooks::new(config.machine.clone())?;
    Ok(TideService::new(
        engine,
        config.machine.clone(),
        config.own_container_id.clone(),
        Arc::new(hooks),
    ))
}

/// Remove leftovers of a previous run and make sure every crane image exists
async fn prepare_engine(
    engine: &dyn ContainerEngine,
    config: &Configuration,
) -> anyhow::Result<()> {
    let removed = cleanup_leftovers(engine).await?;
    if removed > 0 {
        warn!("🧹 Removed {} leftover crane containers", removed);
    }

    for crane in config.cranes.values() {
        verify_crane_image(engine, crane)
            .await
            .with_context(|| format!("crane '{}' has no usable image", crane.name))?;
    }
    Ok(())
}

async fn run_once(
    engine: Arc<dyn ContainerEngine>,
    config: Configuration,
    name: &str,
) -> anyhow::Result<()> {
    let tide = config
        .tide(name)
        .cloned()
        .ok_or_else(|| anyhow::anyhow!("unknown tide '{}'", name))?;

    prepare_engine(engine.as_ref(), &config).await?;
    let service = tide_service(Arc::clone(&engine), &config)?;

    let (trigger, mut signal) = shutdown::channel();
    spawn_signal_handler(trigger);

    let result = service.execute(&tide, &mut signal).await?;
    match result.state {
        RunState::Success => {
            info!("✅ Tide '{}' finished", tide.name);
            Ok(())
        }
        _ => anyhow::bail!("tide '{}' failed: {}", tide.name, result.message),
    }
}

async fn run_daemon(
    engine: Arc<dyn ContainerEngine>,
    config: Configuration,
) -> anyhow::Result<()> {
    prepare_engine(engine.as_ref(), &config).await?;
    let service = tide_service(Arc::clone(&engine), &config)?;
    let scheduler = TideScheduler::new(service, config.tides.clone(), chrono::Utc::now())?;

    let (trigger, signal) = shutdown::channel();
    spawn_signal_handler(trigger);

    info!("🌊 Salvage started with {} tides", config.tides.len());
    scheduler.run(signal).await?;
    info!("👋 Salvage stopped");
    Ok(())
}

/// Fire `trigger` on SIGINT or SIGTERM, exit hard on the second signal
fn spawn_signal_handler(trigger: ShutdownTrigger) {
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("🛑 Shutdown requested, waiting for running backups to stop");
        trigger.trigger();

        wait_for_signal().await;
        error!("💥 Second signal received, exiting without cleanup");
        std::process::exit(130);
    });
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                warn!("⚠️  Cannot listen for SIGTERM: {}", e);
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
