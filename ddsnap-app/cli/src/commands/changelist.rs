//! Changelist commands

use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use log::info;

use ddsnap::ChangeList;

use super::{format_bytes, SocketArg};

#[derive(Args, Debug)]
pub struct ChangelistArgs {
    #[command(subcommand)]
    pub command: ChangelistCommand,
}

#[derive(Subcommand, Debug)]
pub enum ChangelistCommand {
    /// Ask the server for the chunks that differ between two snapshots
    Create {
        #[command(flatten)]
        socket: SocketArg,
        /// Older snapshot
        src: u32,
        /// Newer snapshot
        tgt: u32,
        /// Output file
        file: PathBuf,
    },
    /// Print the extents recorded in a changelist file
    Show {
        file: PathBuf,
    },
}

pub async fn run(args: ChangelistArgs) -> Result<()> {
    match args.command {
        ChangelistCommand::Create {
            socket,
            src,
            tgt,
            file,
        } => {
            let mut client = socket.connect().await?;
            let changelist = client
                .changelist(src, tgt)
                .await
                .with_context(|| format!("Failed to generate changelist {} -> {}", src, tgt))?;
            let out = File::create(&file)
                .with_context(|| format!("Failed to create {}", file.display()))?;
            let mut out = BufWriter::new(out);
            changelist.write_to(&mut out)?;
            out.flush()?;
            info!("Wrote {} chunks to {}", changelist.len(), file.display());
            println!(
                "{} changed chunks ({})",
                changelist.len(),
                format_bytes((changelist.len() as u64) << changelist.chunksize_bits)
            );
        }
        ChangelistCommand::Show { file } => {
            let input =
                File::open(&file).with_context(|| format!("Failed to open {}", file.display()))?;
            let changelist = ChangeList::read_from(&mut BufReader::new(input))
                .with_context(|| format!("Failed to read {}", file.display()))?;
            println!(
                "Snapshot {} -> {}, chunk size {}, {} chunks",
                changelist.src_snap,
                changelist.tgt_snap,
                format_bytes(1 << changelist.chunksize_bits),
                changelist.len()
            );
            for (start, count) in changelist.extents() {
                println!("{:>12} {:>8}", start, count);
            }
        }
    }
    Ok(())
}
