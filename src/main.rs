use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use fieldnode::config::{NodeConfig, SimConfig};
use fieldnode::{logging, sim};

#[derive(Parser)]
#[command(name = "fieldnode")]
#[command(about = "Decentralized task auctions on a simulated grid field")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Simulation config file (JSON); missing fields keep their defaults
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    /// Node config file (JSON) replacing the settings derived from the step budget
    #[arg(long, global = true)]
    node_config: Option<PathBuf>,

    /// Enable debug logging (RUST_LOG overrides)
    #[arg(long, short, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the demo and print a summary (default).
    Demo,

    /// Run one simulation and print a CSV line.
    Bench {
        /// Number of agents
        #[arg(short, long)]
        agents: Option<usize>,
        /// Steps to simulate
        #[arg(short, long)]
        steps: Option<u64>,
        /// World seed
        #[arg(long)]
        seed: Option<u64>,
        /// Step budget in milliseconds
        #[arg(long)]
        step_ms: Option<u64>,
        /// Drop auction messages from these agents (comma-separated)
        #[arg(long, value_delimiter = ',')]
        drop_bids_from: Vec<String>,
    },

    /// Sweep agent counts and seeds, one CSV line per run.
    Stress {
        /// Agent counts (comma-separated)
        #[arg(short, long, value_delimiter = ',', default_value = "1,2,4,8")]
        agents: Vec<usize>,
        /// Seeds (comma-separated)
        #[arg(long, value_delimiter = ',', default_value = "1,2,3")]
        seeds: Vec<u64>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    let mut config = match &cli.config {
        Some(path) => SimConfig::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => SimConfig::default(),
    };
    if let Some(path) = &cli.node_config {
        let node = NodeConfig::load(path)
            .with_context(|| format!("loading node config {}", path.display()))?;
        config.node = Some(node);
    }

    match cli.command.unwrap_or(Commands::Demo) {
        Commands::Demo => sim::run_demo(&config)?,
        Commands::Bench {
            agents,
            steps,
            seed,
            step_ms,
            drop_bids_from,
        } => {
            if let Some(agents) = agents {
                config.agents = agents;
            }
            if let Some(steps) = steps {
                config.steps = steps;
            }
            if let Some(seed) = seed {
                config.seed = seed;
            }
            if let Some(step_ms) = step_ms {
                config.step_ms = step_ms;
            }
            if !drop_bids_from.is_empty() {
                config.drop_bids_from = drop_bids_from;
            }
            sim::run_benchmark(&config)?;
        }
        Commands::Stress { agents, seeds } => sim::run_stress(&config, &agents, &seeds)?,
    }
    Ok(())
}
