//! Subcommands and the helpers they share

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use clap::Args;

use ddsnap::blockdev::{BlockDevice, FileBackedBlockDevice};
use ddsnap::client::Client;
use ddsnap::{Devices, ORIGIN_TAG};

pub mod changelist;
pub mod initialize;
pub mod resize;
pub mod server;
pub mod snapshot;
pub mod status;

pub const DEFAULT_SOCKET: &str = "/var/run/ddsnap.sock";

/// Where to reach the server
#[derive(Args, Debug, Clone)]
pub struct SocketArg {
    /// Server control socket
    #[arg(short, long, default_value = DEFAULT_SOCKET)]
    pub socket: PathBuf,
}

impl SocketArg {
    pub async fn connect(&self) -> Result<Client> {
        Client::connect(&self.socket)
            .await
            .with_context(|| format!("Failed to connect to server at {}", self.socket.display()))
    }
}

/// The devices of a store as given on the command line
#[derive(Args, Debug, Clone)]
pub struct DeviceArgs {
    /// Snapshot store device (also holds the metadata unless --metadata is given)
    pub snapstore: PathBuf,

    /// Origin device
    pub origin: PathBuf,

    /// Separate metadata device
    #[arg(short, long)]
    pub metadata: Option<PathBuf>,
}

impl DeviceArgs {
    pub async fn open(&self) -> Result<Devices> {
        let origin = open_device(&self.origin, true).await?;
        let snapstore = open_device(&self.snapstore, false).await?;
        Ok(match &self.metadata {
            Some(path) => Devices::separate(origin, snapstore, open_device(path, false).await?),
            None => Devices::combined(origin, snapstore),
        })
    }
}

async fn open_device(path: &Path, read_only: bool) -> Result<Arc<dyn BlockDevice>> {
    let device = FileBackedBlockDevice::open(path, read_only)
        .await
        .with_context(|| format!("Failed to open device {}", path.display()))?;
    Ok(Arc::new(device))
}

/// Snapshot tag, or "origin" for the origin volume
pub fn parse_tag(text: &str) -> Result<u32> {
    if text.eq_ignore_ascii_case("origin") || text == "-1" {
        return Ok(ORIGIN_TAG);
    }
    text.parse::<u32>()
        .map_err(|_| anyhow!("'{}' is not a snapshot tag", text))
}

/// Byte count with an optional k, m or g suffix
pub fn parse_size(text: &str) -> Result<u64> {
    let text = text.trim();
    let (digits, shift) = match text.chars().last() {
        Some('k' | 'K') => (&text[..text.len() - 1], 10),
        Some('m' | 'M') => (&text[..text.len() - 1], 20),
        Some('g' | 'G') => (&text[..text.len() - 1], 30),
        _ => (text, 0),
    };
    let value: u64 = digits
        .parse()
        .map_err(|_| anyhow!("'{}' is not a size", text))?;
    value
        .checked_mul(1 << shift)
        .ok_or_else(|| anyhow!("size '{}' is too large", text))
}

/// log2 of a power-of-two size
pub fn size_bits(size: u64, what: &str) -> Result<u32> {
    if !size.is_power_of_two() {
        bail!("{} {} is not a power of two", what, size);
    }
    Ok(size.trailing_zeros())
}

pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    format!("{:.2} {}", size, UNITS[unit_index])
}

pub fn format_time(secs: u64) -> String {
    chrono::DateTime::<chrono::Utc>::from_timestamp(secs as i64, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "Unknown".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sizes() {
        assert_eq!(parse_size("4096").unwrap(), 4096);
        assert_eq!(parse_size("400k").unwrap(), 400 << 10);
        assert_eq!(parse_size("2M").unwrap(), 2 << 20);
        assert!(parse_size("lots").is_err());
        assert_eq!(size_bits(16384, "chunk size").unwrap(), 14);
        assert!(size_bits(3000, "chunk size").is_err());
    }

    #[test]
    fn test_tags() {
        assert_eq!(parse_tag("origin").unwrap(), ORIGIN_TAG);
        assert_eq!(parse_tag("12").unwrap(), 12);
        assert!(parse_tag("twelve").is_err());
        assert_eq!(format_bytes(3 << 20), "3.00 MB");
    }
}
