//! fleetd CLI
//!
//! Usage:
//!   fleetd run ecosystem.yaml
//!   fleetd run ecosystem.yaml -c settings.yaml -s gateway
//!   fleetd validate ecosystem.yaml
//!   fleetd snapshots
//!   fleetd restore latest -o ecosystem.yaml

use fleetd::cli::{self, Command, FleetArgs, RestoreArgs, RunArgs, SnapshotsArgs, ValidateArgs};
use fleetd::{Archiver, DependencyGraph, EcosystemFile, Orchestrator, Settings};
use std::path::Path;
use tokio::sync::watch;

#[tokio::main]
async fn main() {
    let args: FleetArgs = argh::from_env();

    let env = env_logger::Env::default().default_filter_or(cli::log_filter(&args.log_level));
    env_logger::init_from_env(env);

    let result = match args.command {
        Command::Run(run) => run_fleet(run).await,
        Command::Validate(validate) => validate_ecosystem(validate),
        Command::Snapshots(snapshots) => list_snapshots(snapshots).await,
        Command::Restore(restore) => restore_snapshot(restore).await,
    };

    if let Err(e) = result {
        log::error!("{}", e);
        std::process::exit(1);
    }
}

type CliResult = Result<(), Box<dyn std::error::Error>>;

fn load_settings(path: Option<&Path>) -> Result<Settings, fleetd::ConfigError> {
    if let Some(path) = path {
        log::info!("Loading settings: {}", path.display());
    }
    Settings::load(path)
}

async fn run_fleet(args: RunArgs) -> CliResult {
    let settings = load_settings(args.config.as_deref())?;

    log::info!("Loading ecosystem file: {}", args.ecosystem.display());
    let ecosystem = EcosystemFile::from_file(&args.ecosystem)?;

    let orchestrator = Orchestrator::new(settings);
    orchestrator.load(ecosystem).await?;

    // Create shutdown channel
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    ctrlc::set_handler(move || {
        log::info!("Received Ctrl+C, initiating shutdown...");
        let _ = shutdown_tx.send(true);
    })?;

    let started = match &args.services {
        Some(services) => orchestrator.start_with_dependencies(services).await,
        None => orchestrator.start_all().await,
    };
    match started {
        Ok(fleet) => log::info!(
            "{} of {} services running",
            fleet.running,
            fleet.total
        ),
        Err(e) => {
            orchestrator.shutdown().await;
            return Err(e.into());
        }
    }

    let _ = shutdown_rx.wait_for(|stop| *stop).await;

    orchestrator.shutdown().await;
    log::info!("fleetd exiting");
    Ok(())
}

fn validate_ecosystem(args: ValidateArgs) -> CliResult {
    let ecosystem = EcosystemFile::from_file(&args.ecosystem)?;
    ecosystem.validate()?;
    let graph = DependencyGraph::build(&ecosystem.services)?;

    println!("Ecosystem file '{}' is valid", args.ecosystem.display());
    println!("  Version: {}", ecosystem.version);
    println!("  Services: {}", ecosystem.services.len());
    println!("  Startup order:");
    for (level, names) in graph.levels().iter().enumerate() {
        println!("    {}: {}", level, names.join(", "));
    }
    Ok(())
}

async fn list_snapshots(args: SnapshotsArgs) -> CliResult {
    let settings = load_settings(args.config.as_deref())?;
    let archiver = Archiver::new(settings.archive_dir);

    let snapshots = archiver.list_snapshots().await?;
    if snapshots.is_empty() {
        println!("No snapshots in {}", archiver.root().display());
    }
    for id in snapshots {
        println!("{}", id);
    }
    Ok(())
}

async fn restore_snapshot(args: RestoreArgs) -> CliResult {
    let settings = load_settings(args.config.as_deref())?;
    let archiver = Archiver::new(settings.archive_dir);

    let id = if args.snapshot == "latest" {
        archiver
            .latest_snapshot()
            .await?
            .ok_or("the archive has no snapshots")?
    } else {
        args.snapshot
    };

    let snapshot = archiver.restore(&id).await?;
    DependencyGraph::build(&snapshot.descriptors)?;
    let count = snapshot.descriptors.len();
    EcosystemFile::new(snapshot.descriptors).write_to(&args.output)?;

    println!(
        "Restored snapshot {} ({} services) to {}",
        snapshot.id,
        count,
        args.output.display()
    );
    Ok(())
}
