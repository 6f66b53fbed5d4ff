//! Raw device access for the metadata, snapshot-data and origin volumes

mod blockdev_trait;

use async_trait::async_trait;
use parking_lot::RwLock;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, SeekFrom};
use tokio::sync::Mutex;

pub(crate) use self::blockdev_trait::check_access;
pub use self::blockdev_trait::{
    BlockDevice, BlockDeviceError, Result, SECTOR_BITS, SECTOR_SIZE,
};

/// A block device backed by a regular file or a device node
#[derive(Debug)]
pub struct FileBackedBlockDevice {
    file: Mutex<Option<File>>,
    path: PathBuf,
    size: AtomicU64,
    read_only: bool,
}

impl FileBackedBlockDevice {
    /// Create (or truncate) a backing file of the given size
    pub async fn create(path: impl AsRef<Path>, size: u64) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .await?;

        file.set_len(size).await?;

        Ok(Self {
            file: Mutex::new(Some(file)),
            path,
            size: AtomicU64::new(size),
            read_only: false,
        })
    }

    /// Open an existing file or block device
    pub async fn open(path: impl AsRef<Path>, read_only: bool) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .open(&path)
            .await?;

        let size = Self::probe_size(&path)?;

        Ok(Self {
            file: Mutex::new(Some(file)),
            path,
            size: AtomicU64::new(size),
            read_only,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Size of a regular file, or of a block device via BLKGETSIZE64
    #[cfg(unix)]
    fn probe_size(path: &Path) -> Result<u64> {
        use std::fs::File as StdFile;
        use std::os::unix::fs::FileTypeExt;
        use std::os::unix::io::AsRawFd;

        let metadata = std::fs::metadata(path)?;
        if !metadata.file_type().is_block_device() {
            return Ok(metadata.len());
        }

        let file = StdFile::open(path)?;
        let fd = file.as_raw_fd();

        // BLKGETSIZE64 = 0x80081272 on Linux
        const BLKGETSIZE64: libc::c_ulong = 0x80081272;

        let mut size: u64 = 0;
        let result = unsafe { libc::ioctl(fd, BLKGETSIZE64, &mut size as *mut u64) };

        if result == -1 {
            return Err(BlockDeviceError::Io(std::io::Error::last_os_error()));
        }

        Ok(size)
    }

    #[cfg(not(unix))]
    fn probe_size(path: &Path) -> Result<u64> {
        Ok(std::fs::metadata(path)?.len())
    }
}

#[async_trait]
impl BlockDevice for FileBackedBlockDevice {
    async fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        check_access(offset, buf.len(), self.size())?;

        let mut file_guard = self.file.lock().await;
        if let Some(file) = &mut *file_guard {
            file.seek(SeekFrom::Start(offset)).await?;
            file.read_exact(buf).await?;
            Ok(())
        } else {
            Err(BlockDeviceError::DeviceClosed)
        }
    }

    async fn write_at(&self, offset: u64, data: &[u8]) -> Result<()> {
        if self.read_only {
            return Err(BlockDeviceError::ReadOnly);
        }
        check_access(offset, data.len(), self.size())?;

        let mut file_guard = self.file.lock().await;
        if let Some(file) = &mut *file_guard {
            file.seek(SeekFrom::Start(offset)).await?;
            file.write_all(data).await?;
            file.flush().await?;
            Ok(())
        } else {
            Err(BlockDeviceError::DeviceClosed)
        }
    }

    fn size(&self) -> u64 {
        self.size.load(Ordering::Acquire)
    }

    async fn refresh_size(&self) -> Result<u64> {
        let size = Self::probe_size(&self.path)?;
        self.size.store(size, Ordering::Release);
        Ok(size)
    }

    async fn sync(&self) -> Result<()> {
        let mut file_guard = self.file.lock().await;
        if let Some(file) = &mut *file_guard {
            file.sync_all().await?;
            Ok(())
        } else {
            Err(BlockDeviceError::DeviceClosed)
        }
    }

    async fn close(&mut self) -> Result<()> {
        let mut file_guard = self.file.lock().await;
        if file_guard.take().is_some() {
            Ok(())
        } else {
            Err(BlockDeviceError::DeviceClosed)
        }
    }

    fn is_read_only(&self) -> bool {
        self.read_only
    }
}

/// A RAM-backed device, used by tests and benchmarks
#[derive(Debug, Default)]
pub struct MemoryBlockDevice {
    data: RwLock<Vec<u8>>,
}

impl MemoryBlockDevice {
    pub fn new(size: u64) -> Self {
        Self {
            data: RwLock::new(vec![0; size as usize]),
        }
    }

    /// Grow or shrink the device, zero-filling new space
    pub fn resize(&self, size: u64) {
        self.data.write().resize(size as usize, 0);
    }
}

#[async_trait]
impl BlockDevice for MemoryBlockDevice {
    async fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let data = self.data.read();
        check_access(offset, buf.len(), data.len() as u64)?;
        let start = offset as usize;
        buf.copy_from_slice(&data[start..start + buf.len()]);
        Ok(())
    }

    async fn write_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        let mut data = self.data.write();
        check_access(offset, buf.len(), data.len() as u64)?;
        let start = offset as usize;
        data[start..start + buf.len()].copy_from_slice(buf);
        Ok(())
    }

    fn size(&self) -> u64 {
        self.data.read().len() as u64
    }

    async fn sync(&self) -> Result<()> {
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}
