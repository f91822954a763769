mod commands;
mod runlog;
mod summary;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "dvc", about = "Digital volume correlation on synthetic volumes")]
#[command(version)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Correlate a synthetic reference volume against a deformed copy
    Run(commands::run::RunArgs),
    /// Print or save the default run config as TOML
    Config(commands::config::ConfigArgs),
    /// Show which backend and worker count a config resolves to
    Probe(commands::probe::ProbeArgs),
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("warn")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match &cli.command {
        Commands::Run(args) => commands::run::run(args),
        Commands::Config(args) => commands::config::run(args),
        Commands::Probe(args) => commands::probe::run(args),
    }
}
