//! Command-line interface for fleetd

use argh::FromArgs;
use std::path::PathBuf;

/// Service orchestrator: supervises a fleet of processes, probes their
/// health, restarts them on failure and archives every configuration change
#[derive(FromArgs, Debug)]
pub struct FleetArgs {
    /// log level (error, warn, info, debug, trace)
    #[argh(option, short = 'l', default = "String::from(\"info\")")]
    pub log_level: String,

    #[argh(subcommand)]
    pub command: Command,
}

#[derive(FromArgs, Debug)]
#[argh(subcommand)]
pub enum Command {
    Run(RunArgs),
    Validate(ValidateArgs),
    Snapshots(SnapshotsArgs),
    Restore(RestoreArgs),
}

/// Load an ecosystem file and supervise its services until Ctrl+C
#[derive(FromArgs, Debug)]
#[argh(subcommand, name = "run")]
pub struct RunArgs {
    /// path to the ecosystem file (default: ecosystem.yaml)
    #[argh(positional, default = "PathBuf::from(\"ecosystem.yaml\")")]
    pub ecosystem: PathBuf,

    /// path to an orchestrator settings file
    #[argh(option, short = 'c')]
    pub config: Option<PathBuf>,

    /// only start these services and their dependencies (comma-separated)
    #[argh(option, short = 's', from_str_fn(parse_services))]
    pub services: Option<Vec<String>>,
}

/// Validate an ecosystem file and print its startup order
#[derive(FromArgs, Debug)]
#[argh(subcommand, name = "validate")]
pub struct ValidateArgs {
    /// path to the ecosystem file (default: ecosystem.yaml)
    #[argh(positional, default = "PathBuf::from(\"ecosystem.yaml\")")]
    pub ecosystem: PathBuf,
}

/// List archived configuration snapshots
#[derive(FromArgs, Debug)]
#[argh(subcommand, name = "snapshots")]
pub struct SnapshotsArgs {
    /// path to an orchestrator settings file
    #[argh(option, short = 'c')]
    pub config: Option<PathBuf>,
}

/// Verify a snapshot and write it out as an ecosystem file
#[derive(FromArgs, Debug)]
#[argh(subcommand, name = "restore")]
pub struct RestoreArgs {
    /// snapshot id, or "latest"
    #[argh(positional)]
    pub snapshot: String,

    /// where to write the ecosystem file
    #[argh(option, short = 'o')]
    pub output: PathBuf,

    /// path to an orchestrator settings file
    #[argh(option, short = 'c')]
    pub config: Option<PathBuf>,
}

/// Normalize a log level name, falling back to `info`
pub fn log_filter(level: &str) -> &'static str {
    match level.to_lowercase().as_str() {
        "error" => "error",
        "warn" => "warn",
        "info" => "info",
        "debug" => "debug",
        "trace" => "trace",
        _ => "info",
    }
}

/// Parse comma-separated service list
fn parse_services(s: &str) -> Result<Vec<String>, String> {
    let services: Vec<String> = s
        .split(',')
        .map(|n| n.trim().to_string())
        .filter(|n| !n.is_empty())
        .collect();
    if services.is_empty() {
        return Err("expected at least one service name".to_string());
    }
    Ok(services)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_services() {
        assert_eq!(
            parse_services("gateway, auth,media"),
            Ok(vec![
                "gateway".to_string(),
                "auth".to_string(),
                "media".to_string()
            ])
        );
        assert!(parse_services(" , ").is_err());
    }

    #[test]
    fn test_log_filter() {
        assert_eq!(log_filter("DEBUG"), "debug");
        assert_eq!(log_filter("verbose"), "info");
    }

    #[test]
    fn test_run_subcommand() {
        let args = FleetArgs::from_args(
            &["fleetd"],
            &["-l", "debug", "run", "fleet.yaml", "-c", "settings.yaml", "-s", "auth,gateway"],
        )
        .unwrap();
        assert_eq!(args.log_level, "debug");
        match args.command {
            Command::Run(run) => {
                assert_eq!(run.ecosystem, PathBuf::from("fleet.yaml"));
                assert_eq!(run.config, Some(PathBuf::from("settings.yaml")));
                assert_eq!(
                    run.services,
                    Some(vec!["auth".to_string(), "gateway".to_string()])
                );
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_restore_requires_output() {
        assert!(FleetArgs::from_args(&["fleetd"], &["restore", "latest"]).is_err());
        let args =
            FleetArgs::from_args(&["fleetd"], &["restore", "latest", "-o", "out.yaml"]).unwrap();
        assert!(matches!(
            args.command,
            Command::Restore(RestoreArgs { ref snapshot, .. }) if snapshot == "latest"
        ));
    }
}
