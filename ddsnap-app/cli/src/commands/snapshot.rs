//! Snapshot management commands

use anyhow::{Context, Result};
use clap::Subcommand;

use ddsnap::SnapshotState;

use super::{format_time, parse_tag, SocketArg};

#[derive(Subcommand, Debug)]
pub enum SnapshotCommand {
    /// Create a snapshot of the origin
    Create {
        #[command(flatten)]
        socket: SocketArg,
        /// Tag of the new snapshot
        tag: u32,
    },
    /// Delete a snapshot and free its exceptions
    Delete {
        #[command(flatten)]
        socket: SocketArg,
        tag: u32,
    },
    /// List all snapshots
    List {
        #[command(flatten)]
        socket: SocketArg,
    },
    /// Set the priority used when choosing a snapshot to release
    Priority {
        #[command(flatten)]
        socket: SocketArg,
        tag: u32,
        #[arg(allow_hyphen_values = true)]
        priority: i8,
    },
    /// Change the use count by a signed amount and print the result
    Usecount {
        #[command(flatten)]
        socket: SocketArg,
        tag: u32,
        #[arg(allow_hyphen_values = true)]
        delta: i32,
    },
    /// Show whether a tag is live, squashed or missing
    State {
        #[command(flatten)]
        socket: SocketArg,
        #[arg(value_parser = parse_tag)]
        tag: u32,
    },
    /// Show how many sectors a snapshot holds exclusively
    Sectors {
        #[command(flatten)]
        socket: SocketArg,
        #[arg(value_parser = parse_tag)]
        tag: u32,
    },
}

pub async fn run(command: SnapshotCommand) -> Result<()> {
    match command {
        SnapshotCommand::Create { socket, tag } => {
            let mut client = socket.connect().await?;
            client
                .create_snapshot(tag)
                .await
                .with_context(|| format!("Failed to create snapshot {}", tag))?;
            println!("Snapshot {} created", tag);
        }
        SnapshotCommand::Delete { socket, tag } => {
            let mut client = socket.connect().await?;
            client
                .delete_snapshot(tag)
                .await
                .with_context(|| format!("Failed to delete snapshot {}", tag))?;
            println!("Snapshot {} deleted", tag);
        }
        SnapshotCommand::List { socket } => {
            let mut client = socket.connect().await?;
            let snapshots = client.list_snapshots().await.context("Failed to list snapshots")?;
            if snapshots.is_empty() {
                println!("No snapshots");
                return Ok(());
            }
            println!("{:<8} {:<9} {:<9} Created", "Tag", "Priority", "Usecount");
            println!("{}", "-".repeat(48));
            for info in snapshots {
                println!(
                    "{:<8} {:<9} {:<9} {}",
                    info.snap,
                    info.prio,
                    info.usecnt,
                    format_time(info.ctime)
                );
            }
        }
        SnapshotCommand::Priority { socket, tag, priority } => {
            let mut client = socket.connect().await?;
            let prio = client
                .set_priority(tag, priority)
                .await
                .with_context(|| format!("Failed to set priority of snapshot {}", tag))?;
            println!("Snapshot {} priority {}", tag, prio);
        }
        SnapshotCommand::Usecount { socket, tag, delta } => {
            let mut client = socket.connect().await?;
            let count = client
                .adjust_usecount(tag, delta)
                .await
                .with_context(|| format!("Failed to change use count of snapshot {}", tag))?;
            println!("Snapshot {} usecount {}", tag, count);
        }
        SnapshotCommand::State { socket, tag } => {
            let mut client = socket.connect().await?;
            let state = client.snapshot_state(tag).await.context("Failed to query state")?;
            let text = match state {
                SnapshotState::Live => "live",
                SnapshotState::Missing => "missing",
                SnapshotState::Squashed => "squashed",
            };
            println!("{}", text);
        }
        SnapshotCommand::Sectors { socket, tag } => {
            let mut client = socket.connect().await?;
            let sectors = client
                .snapshot_sectors(tag)
                .await
                .context("Failed to query sectors")?;
            println!("{}", sectors);
        }
    }

    Ok(())
}
