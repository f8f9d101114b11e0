//! CLI binary entry point for the HRM hierarchy simulator.
//!
//! Usage:
//!   hrm-sim [OPTIONS]
//!
//! Options:
//!   -c, --config <FILE>        Path to configuration TOML file
//!   -H, --height <LEVELS>      Hierarchy height (overrides config)
//!   -r, --run-for-secs <SECS>  How long to let the hierarchy form
//!   -v, --verbose              Increase logging verbosity

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use hrm_hierarchy::HierarchyEvent;
use hrm_node::{Simulation, SimulationConfig};

/// HRM simulator - forms a routing hierarchy over a configured topology.
#[derive(Parser, Debug)]
#[command(name = "hrm-sim")]
#[command(about = "Simulates hierarchy formation by per-cluster coordinator elections")]
#[command(version)]
struct Cli {
    /// Path to configuration TOML file.
    #[arg(short, long, value_name = "FILE", default_value = "config/hrm-sim.toml")]
    config: PathBuf,

    /// Number of hierarchy levels.
    #[arg(short = 'H', long, value_name = "LEVELS")]
    height: Option<u8>,

    /// Seconds to run before printing the hierarchy.
    #[arg(short, long, value_name = "SECS", default_value_t = 15)]
    run_for_secs: u64,

    /// Increase logging verbosity (can be repeated: -v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = SimulationConfig::load(Some(&cli.config))?;
    if let Some(height) = cli.height {
        config.hierarchy.height = height;
    }

    let log_level = match cli.verbose {
        0 => config.logging.level.as_str(),
        1 => "debug",
        _ => "trace",
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();

    tracing::info!(
        nodes = config.topology.nodes.len(),
        height = config.hierarchy.height,
        run_for_secs = cli.run_for_secs,
        "Starting HRM simulation"
    );

    let mut simulation = Simulation::build(&config)?;
    let mut events = simulation
        .take_events()
        .ok_or_else(|| anyhow::anyhow!("event stream already taken"))?;
    simulation.start()?;

    let deadline = tokio::time::sleep(Duration::from_secs(cli.run_for_secs));
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            _ = &mut deadline => break,
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted");
                break;
            }
            Some(record) = events.recv() => {
                if let HierarchyEvent::AddressesDistributed { node, cluster, members, .. } = &record.event {
                    tracing::info!(node = %node, cluster = %cluster, members = members.len(), "Hierarchy complete");
                }
                println!("{}", serde_json::to_string(&record)?);
            }
        }
    }

    let snapshot = simulation.snapshot().await;
    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    simulation.shutdown().await;
    Ok(())
}
