//! Status command: space usage and how snapshots share exceptions

use anyhow::{Context, Result};
use clap::Parser;

use ddsnap::protocol::SpaceStatus;
use ddsnap::ORIGIN_TAG;

use super::{format_bytes, format_time, parse_tag, SocketArg};

#[derive(Parser, Debug)]
#[command(about = "Show snapshot store status")]
pub struct StatusArgs {
    #[command(flatten)]
    pub socket: SocketArg,

    /// Only report this snapshot
    #[arg(value_parser = parse_tag)]
    pub tag: Option<u32>,
}

fn print_space(name: &str, space: &SpaceStatus) {
    let bits = space.chunksize_bits;
    let used = space.total.saturating_sub(space.free);
    println!(
        "{:<10} chunk {:>8}  total {:>12}  used {:>12}  free {:>12}",
        name,
        format_bytes(1 << bits),
        format_bytes(space.total << bits),
        format_bytes(used << bits),
        format_bytes(space.free << bits)
    );
}

pub async fn run(args: StatusArgs) -> Result<()> {
    let mut client = args.socket.connect().await?;
    let status = client
        .status(args.tag.unwrap_or(ORIGIN_TAG))
        .await
        .context("Failed to get status")?;

    println!("Store created: {}", format_time(status.ctime));
    println!(
        "Write density: {:.4}",
        status.write_density as f64 / u32::MAX as f64
    );
    print_space("Metadata", &status.meta);
    print_space("Snapshots", &status.store);

    if status.details.is_empty() {
        return Ok(());
    }
    println!();
    print!("{:<8} {:<9} {:<9}", "Tag", "Priority", "Usecount");
    let columns = status.details[0].sharing.len();
    for shared in 0..columns {
        print!(" {:>8}", shared);
    }
    println!(" {:>10}", "Total");
    for row in &status.details {
        print!("{:<8} {:<9} {:<9}", row.info.snap, row.info.prio, row.info.usecnt);
        for count in &row.sharing {
            print!(" {:>8}", count);
        }
        println!(" {:>10}", row.sharing.iter().sum::<u64>());
    }
    Ok(())
}
