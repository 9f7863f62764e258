mod commands;
mod summary;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "slotphot", about = "Slot-mode background modelling and object tracking")]
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
    /// Show image cube metadata
    Info(commands::info::InfoArgs),
    /// Run the background modelling and tracking pipeline
    Run(commands::pipeline::RunArgs),
    /// Print or save the default pipeline config
    Config(commands::config::ConfigArgs),
    /// List the buffers of a results folder
    Workspace(commands::workspace::WorkspaceArgs),
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
        Commands::Info(args) => commands::info::run(args),
        Commands::Run(args) => commands::pipeline::run(args),
        Commands::Config(args) => commands::config::run(args),
        Commands::Workspace(args) => commands::workspace::run(args),
    }
}
