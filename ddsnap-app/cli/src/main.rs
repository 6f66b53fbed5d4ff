//! ddsnap command line interface
//!
//! Formats snapshot stores, runs the snapshot server and sends it control
//! requests.

use anyhow::Result;
use clap::{Parser, Subcommand};
use log::{debug, LevelFilter};

mod commands;

/// ddsnap - copy-on-write snapshots for block devices
#[derive(Parser)]
#[command(
    name = "ddsnap",
    about = "ddsnap snapshot server and control tool",
    version = env!("CARGO_PKG_VERSION"),
    author = "ddsnap contributors"
)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Enable debug output
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write an empty snapshot store
    Initialize(commands::initialize::InitializeArgs),

    /// Run the snapshot server
    Server(commands::server::ServerArgs),

    /// Stop a running server
    Shutdown(commands::SocketArg),

    #[command(flatten)]
    Snapshot(commands::snapshot::SnapshotCommand),

    /// Show store usage and snapshot sharing
    Status(commands::status::StatusArgs),

    /// Create or inspect changelists between snapshots
    Changelist(commands::changelist::ChangelistArgs),

    /// Tell the server the devices changed size
    Resize(commands::resize::ResizeArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.debug {
        LevelFilter::Debug
    } else if cli.verbose {
        LevelFilter::Info
    } else {
        LevelFilter::Warn
    };

    env_logger::Builder::new()
        .filter_level(log_level)
        .init();

    debug!("ddsnap v{} starting", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Commands::Initialize(args) => commands::initialize::run(args).await,
        Commands::Server(args) => commands::server::run(args).await,
        Commands::Shutdown(args) => commands::server::shutdown(args).await,
        Commands::Snapshot(command) => commands::snapshot::run(command).await,
        Commands::Status(args) => commands::status::run(args).await,
        Commands::Changelist(args) => commands::changelist::run(args).await,
        Commands::Resize(args) => commands::resize::run(args).await,
    }
}
