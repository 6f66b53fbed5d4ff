//! Initialize command for creating snapshot stores

use anyhow::{bail, Context, Result};
use clap::Parser;
use log::info;
use std::io::Write;

use ddsnap::{initialize, FormatOptions, SnapStore};

use super::{format_bytes, parse_size, size_bits, DeviceArgs};

/// Write an empty snapshot store
#[derive(Parser, Debug)]
#[command(about = "Initialize a snapshot store")]
pub struct InitializeArgs {
    #[command(flatten)]
    pub devices: DeviceArgs,

    /// Journal size (k, m and g suffixes accepted)
    #[arg(short, long, default_value = "400k", value_parser = parse_size)]
    pub journal_size: u64,

    /// Metadata block size
    #[arg(short, long, default_value = "4k", value_parser = parse_size)]
    pub block_size: u64,

    /// Snapshot chunk size; must equal the block size without --metadata
    #[arg(short, long, default_value = "4k", value_parser = parse_size)]
    pub chunk_size: u64,

    /// Overwrite an existing store without asking
    #[arg(short, long)]
    pub yes: bool,
}

pub async fn run(args: InitializeArgs) -> Result<()> {
    let options = FormatOptions {
        metadata_bits: size_bits(args.block_size, "block size")?,
        chunk_bits: size_bits(args.chunk_size, "chunk size")?,
        journal_bytes: args.journal_size,
    };
    let devices = args.devices.open().await?;

    if SnapStore::sniff(&devices.metadata).await && !args.yes {
        print!(
            "{} already holds a snapshot store. Overwrite it? (yes/no) ",
            args.devices.metadata.as_ref().unwrap_or(&args.devices.snapstore).display()
        );
        std::io::stdout().flush()?;
        let mut input = String::new();
        std::io::stdin().read_line(&mut input)?;
        if !input.trim().eq_ignore_ascii_case("yes") {
            bail!("Initialization cancelled");
        }
    }

    info!(
        "Block size {}, chunk size {}, journal {}",
        args.block_size,
        args.chunk_size,
        format_bytes(args.journal_size)
    );
    initialize(devices, &options)
        .await
        .context("Failed to initialize snapshot store")?;
    println!("Snapshot store initialized");
    Ok(())
}
