//! Block device trait definitions for the snapshot store

use std::io;
use thiserror::Error;

/// Sector size in bytes; every device offset is sector aligned
pub const SECTOR_SIZE: u64 = 512;
pub const SECTOR_BITS: u32 = 9;

/// Error type for block device operations
#[derive(Error, Debug)]
pub enum BlockDeviceError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("Access out of range: offset {offset} length {len} (device size {size})")]
    OutOfRange { offset: u64, len: usize, size: u64 },
    #[error("Misaligned access at offset {0}")]
    Misaligned(u64),
    #[error("Device is read-only")]
    ReadOnly,
    #[error("Device is already closed")]
    DeviceClosed,
}

/// Result type for block device operations
pub type Result<T> = std::result::Result<T, BlockDeviceError>;

/// Byte-addressed access to a raw device (metadata, snapshot data or origin)
#[async_trait::async_trait]
pub trait BlockDevice: Send + Sync + 'static {
    /// Read `buf.len()` bytes starting at a sector-aligned byte offset
    async fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Write `data` starting at a sector-aligned byte offset
    async fn write_at(&self, offset: u64, data: &[u8]) -> Result<()>;

    /// Current size of the device in bytes
    fn size(&self) -> u64;

    /// Re-probe the device size, e.g. after the underlying volume was grown
    async fn refresh_size(&self) -> Result<u64> {
        Ok(self.size())
    }

    /// Sync any pending writes to the device
    async fn sync(&self) -> Result<()>;

    /// Close the device
    async fn close(&mut self) -> Result<()>;

    /// Check if the device is read-only
    fn is_read_only(&self) -> bool {
        false
    }
}

/// Shared bounds and alignment checks for implementors
pub(crate) fn check_access(offset: u64, len: usize, size: u64) -> Result<()> {
    if offset % SECTOR_SIZE != 0 {
        return Err(BlockDeviceError::Misaligned(offset));
    }
    match offset.checked_add(len as u64) {
        Some(end) if end <= size => Ok(()),
        _ => Err(BlockDeviceError::OutOfRange { offset, len, size }),
    }
}
