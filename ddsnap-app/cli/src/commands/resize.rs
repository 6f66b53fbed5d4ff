//! Resize command

use anyhow::{Context, Result};
use clap::Parser;

use super::{format_bytes, parse_size, SocketArg};

/// New device sizes; an omitted size is left alone
#[derive(Parser, Debug)]
#[command(about = "Resize the devices of a running server")]
pub struct ResizeArgs {
    #[command(flatten)]
    pub socket: SocketArg,

    #[arg(long, value_parser = parse_size)]
    pub origin: Option<u64>,

    #[arg(long, value_parser = parse_size)]
    pub snapstore: Option<u64>,

    #[arg(long, value_parser = parse_size)]
    pub metadata: Option<u64>,
}

pub async fn run(args: ResizeArgs) -> Result<()> {
    let mut client = args.socket.connect().await?;
    let sizes = client
        .resize(
            args.origin.unwrap_or(0),
            args.snapstore.unwrap_or(0),
            args.metadata.unwrap_or(0),
        )
        .await
        .context("Failed to resize")?;
    println!("Origin:    {}", format_bytes(sizes.orgsize));
    println!("Snapstore: {}", format_bytes(sizes.snapsize));
    println!("Metadata:  {}", format_bytes(sizes.metasize));
    Ok(())
}
