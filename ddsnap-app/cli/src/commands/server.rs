//! Server command: open the store and serve the control socket

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use log::{info, warn};
use tokio_util::sync::CancellationToken;

use ddsnap::server::{Server, ServerConfig};
use ddsnap::Engine;

use super::{format_bytes, DeviceArgs, SocketArg, DEFAULT_SOCKET};

/// Run the snapshot server
#[derive(Parser, Debug)]
#[command(about = "Run the snapshot server")]
pub struct ServerArgs {
    #[command(flatten)]
    pub devices: DeviceArgs,

    /// Server control socket (overrides the config file)
    #[arg(short, long)]
    pub socket: Option<PathBuf>,

    /// JSON server configuration
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Defer allocation bitmap updates until the next barrier
    #[arg(long)]
    pub defer: bool,

    /// Recount free space after every commit
    #[arg(long)]
    pub selfcheck: bool,
}

pub async fn run(args: ServerArgs) -> Result<()> {
    let mut config = match &args.config {
        Some(path) => ServerConfig::load(path)
            .with_context(|| format!("Failed to load {}", path.display()))?,
        None => ServerConfig::new(DEFAULT_SOCKET),
    };
    if let Some(socket) = args.socket {
        config.socket = socket;
    }
    config.engine.defer_allocs |= args.defer;
    config.engine.selfcheck |= args.selfcheck;

    let devices = args.devices.open().await?;
    let engine = Engine::open(devices, config.engine.clone())
        .await
        .context("Failed to open snapshot store")?;
    let meta = engine.store().metadata_usage();
    let data = engine.store().snapdata_usage();
    info!(
        "Metadata {} free of {}, snapshot data {} free of {}",
        format_bytes(meta.free << meta.chunksize_bits),
        format_bytes(meta.total << meta.chunksize_bits),
        format_bytes(data.free << data.chunksize_bits),
        format_bytes(data.total << data.chunksize_bits)
    );

    let server = Server::bind(engine, &config.socket)
        .with_context(|| format!("Failed to bind {}", config.socket.display()))?;
    println!("Serving on {}", server.socket().display());

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    ctrlc::set_handler(move || {
        warn!("Interrupted, shutting down");
        on_signal.cancel();
    })
    .context("Failed to install signal handler")?;

    server.run(cancel).await.context("Server failed")?;
    println!("Server stopped");
    Ok(())
}

pub async fn shutdown(args: SocketArg) -> Result<()> {
    let mut client = args.connect().await?;
    client
        .shutdown_server()
        .await
        .context("Failed to send shutdown request")?;
    println!("Shutdown requested");
    Ok(())
}
