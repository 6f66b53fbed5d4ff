//! The snapshot store: superblock, geometry and the devices behind them
//!
//! [`SnapStore`] owns every piece of mutable engine state: the superblock
//! image, the metadata buffer cache, the allocation state and the transient
//! use counts. Nothing in it is shared; callers serialise access by owning it.

mod copyout;

use std::sync::Arc;

use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};

use crate::block_bitmap::DeferredAllocs;
use crate::blockdev::{BlockDevice, SECTOR_BITS};
use crate::cache::BufferCache;
use crate::error::{Error, Result};
use crate::layout::{DiskSuper, Layout, MAX_SNAPSHOTS, SB_BUSY, SB_SECTOR, SB_SIZE};
use crate::snapmask::SnapshotMask;

pub(crate) use copyout::Copyout;

/// Runtime options of the engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Keep fresh allocations out of the bitmap and journaled metadata out of
    /// its home location until the next barrier
    pub defer_allocs: bool,
    /// Recount free chunks after every commit
    pub selfcheck: bool,
    /// Chunks one deferred range may grow to before allocations go straight
    /// to the bitmap
    pub max_deferred_allocs: usize,
    /// Clean metadata blocks kept in memory
    pub cache_blocks: usize,
    pub lock_hash_bits: u32,
    /// Chunks gathered into one copy-out transfer
    pub copyout_chunks: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            defer_allocs: false,
            selfcheck: false,
            max_deferred_allocs: 500,
            cache_blocks: 32768,
            lock_hash_bits: 8,
            copyout_chunks: 32,
        }
    }
}

/// The devices a store spans. Without a separate snapshot data device the
/// snapshot copies share the metadata device and its allocation bitmap.
#[derive(Clone)]
pub struct Devices {
    pub origin: Arc<dyn BlockDevice>,
    pub metadata: Arc<dyn BlockDevice>,
    pub snapdata: Option<Arc<dyn BlockDevice>>,
}

impl Devices {
    pub fn combined(origin: Arc<dyn BlockDevice>, store: Arc<dyn BlockDevice>) -> Self {
        Self {
            origin,
            metadata: store,
            snapdata: None,
        }
    }

    pub fn separate(
        origin: Arc<dyn BlockDevice>,
        snapdata: Arc<dyn BlockDevice>,
        metadata: Arc<dyn BlockDevice>,
    ) -> Self {
        Self {
            origin,
            metadata,
            snapdata: Some(snapdata),
        }
    }

    pub fn is_combined(&self) -> bool {
        self.snapdata.is_none()
    }

    /// Device holding snapshot copies
    pub fn snapdev(&self) -> &Arc<dyn BlockDevice> {
        self.snapdata.as_ref().unwrap_or(&self.metadata)
    }

    /// Current sizes in bytes of origin, snapshot data and metadata
    pub async fn sizes(&self) -> Result<(u64, u64, u64)> {
        let metasize = self.metadata.refresh_size().await?;
        let snapsize = match &self.snapdata {
            Some(dev) => dev.refresh_size().await?,
            None => metasize,
        };
        let orgsize = self.origin.refresh_size().await?;
        Ok((orgsize, snapsize, metasize))
    }

    async fn sync(&self) -> Result<()> {
        self.metadata.sync().await?;
        if let Some(dev) = &self.snapdata {
            dev.sync().await?;
        }
        Ok(())
    }
}

/// Free and total chunks of one allocation space, as shown by STATUS
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpaceUsage {
    pub chunksize_bits: u32,
    pub total: u64,
    pub free: u64,
}

impl SpaceUsage {
    /// Share of the space in use, scaled so that `u32::MAX` means full
    pub fn density(&self) -> u32 {
        if self.total == 0 {
            return 0;
        }
        let used = self.total.saturating_sub(self.free) as u128;
        (used * u32::MAX as u128 / self.total as u128) as u32
    }
}

pub struct SnapStore {
    pub(crate) image: DiskSuper,
    pub(crate) layout: Layout,
    pub(crate) meta: BufferCache,
    pub(crate) devices: Devices,
    /// Bits of every live, unsquashed snapshot
    pub(crate) snapmask: SnapshotMask,
    pub(crate) sb_dirty: bool,
    pub(crate) config: EngineConfig,
    pub(crate) defer: DeferredAllocs,
    /// Clients attached to each snapshot bit
    pub(crate) usecounts: [u16; MAX_SNAPSHOTS],
    pub(crate) copy: Copyout,
}

impl SnapStore {
    /// Build the in-memory state around a superblock image
    pub(crate) fn assemble(devices: Devices, config: EngineConfig, image: DiskSuper) -> Result<Self> {
        if image.is_combined() != devices.is_combined() {
            return Err(Error::InvalidArgument(format!(
                "store was formatted {} but opened with {} devices",
                if image.is_combined() { "combined" } else { "separate" },
                if devices.is_combined() { "combined" } else { "separate" },
            )));
        }
        let layout = Layout::from_super(&image)?;
        let meta = BufferCache::new(devices.metadata.clone(), layout.block_size, config.cache_blocks)?;
        let copy = Copyout::new(config.copyout_chunks, layout.snapdata_bits);
        let mut store = Self {
            image,
            layout,
            meta,
            devices,
            snapmask: SnapshotMask::EMPTY,
            sb_dirty: false,
            config,
            defer: DeferredAllocs::default(),
            usecounts: [0; MAX_SNAPSHOTS],
            copy,
        };
        store.snapmask = store.calc_snapmask();
        Ok(store)
    }

    pub async fn read_superblock(device: &Arc<dyn BlockDevice>) -> Result<DiskSuper> {
        let mut buf = vec![0u8; SB_SIZE];
        device.read_at(SB_SECTOR << SECTOR_BITS, &mut buf).await?;
        DiskSuper::from_bytes(&buf)
    }

    /// Whether the metadata device carries a snapshot store
    pub async fn sniff(device: &Arc<dyn BlockDevice>) -> bool {
        Self::read_superblock(device).await.is_ok()
    }

    /// Take over an existing store, replaying the journal if the previous
    /// owner did not shut down cleanly
    pub async fn open(devices: Devices, config: EngineConfig) -> Result<Self> {
        info!("STORE: activating server");
        let image = Self::read_superblock(&devices.metadata).await?;
        let mut store = Self::assemble(devices, config, image)?;
        debug!("STORE: active snapshot mask {:?}", store.snapmask);

        if store.image.is_busy() {
            warn!("STORE: server was not shut down properly");
            store.replay_journal().await?;
        } else {
            store.image.flags |= SB_BUSY;
            store.sb_dirty = true;
        }

        let (orgsize, snapsize, metasize) = store.devices.sizes().await?;
        store.change_device_sizes(orgsize, snapsize, metasize).await?;
        store.save_sb_check().await?;
        Ok(store)
    }

    /// Write the superblock if it changed. Failures are logged, not returned.
    pub(crate) async fn save_sb(&mut self) {
        if !self.sb_dirty {
            return;
        }
        match self.image.to_bytes() {
            Ok(bytes) => {
                if let Err(err) = self
                    .devices
                    .metadata
                    .write_at(SB_SECTOR << SECTOR_BITS, &bytes)
                    .await
                {
                    error!("STORE: unable to write superblock to disk: {}", err);
                }
            }
            Err(err) => error!("STORE: unable to encode superblock: {}", err),
        }
        self.sb_dirty = false;
    }

    /// Make everything durable, then write the superblock
    pub(crate) async fn save_sb_check(&mut self) -> Result<()> {
        self.commit_deferred_allocs().await?;
        let dirty = self.meta.dirty_count();
        if dirty > 0 {
            warn!("STORE: {} dirty buffers when all should be clean", dirty);
        }
        self.save_sb().await;
        Ok(())
    }

    /// Shut down cleanly: flush everything and drop the busy flag
    pub async fn cleanup(&mut self) -> Result<()> {
        info!("STORE: shutting down");
        self.finish_copyout().await?;
        self.commit_deferred_allocs().await?;
        self.image.flags &= !SB_BUSY;
        self.sb_dirty = true;
        self.save_sb().await;
        self.devices.sync().await
    }

    pub fn superblock(&self) -> &DiskSuper {
        &self.image
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn snapmask(&self) -> SnapshotMask {
        self.snapmask
    }

    /// Snapshot chunk size in bits, as reported to clients
    pub fn chunksize_bits(&self) -> u32 {
        self.layout.snapdata_bits
    }

    pub fn metadata_usage(&self) -> SpaceUsage {
        SpaceUsage {
            chunksize_bits: self.image.metadata.allocsize_bits,
            total: self.image.metadata.chunks,
            free: self.image.metadata.freechunks,
        }
    }

    pub fn snapdata_usage(&self) -> SpaceUsage {
        SpaceUsage {
            chunksize_bits: self.image.snapdata.allocsize_bits,
            total: self.image.snapdata.chunks,
            free: self.image.snapdata.freechunks,
        }
    }
}

#[cfg(test)]
pub(crate) async fn test_store() -> SnapStore {
    test_store_with(EngineConfig::default(), 8 << 20).await
}

#[cfg(test)]
pub(crate) async fn test_store_with(config: EngineConfig, store_bytes: u64) -> SnapStore {
    use crate::blockdev::MemoryBlockDevice;
    use crate::format::{initialize, FormatOptions};

    let _ = env_logger::builder().is_test(true).try_init();
    let origin: Arc<dyn BlockDevice> = Arc::new(MemoryBlockDevice::new(16 << 20));
    let store: Arc<dyn BlockDevice> = Arc::new(MemoryBlockDevice::new(store_bytes));
    let devices = Devices::combined(origin, store);
    let options = FormatOptions {
        journal_bytes: 64 << 12,
        ..FormatOptions::default()
    };
    initialize(devices.clone(), &options).await.unwrap();
    SnapStore::open(devices, config).await.unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockdev::MemoryBlockDevice;

    #[tokio::test]
    async fn test_open_marks_busy_and_cleanup_clears() {
        let store = test_store().await;
        assert!(store.image.is_busy());
        let devices = store.devices.clone();
        let mut store = store;
        store.cleanup().await.unwrap();

        let image = SnapStore::read_superblock(&devices.metadata).await.unwrap();
        assert!(!image.is_busy());
        assert_eq!(image.etree_levels, 1);
    }

    #[tokio::test]
    async fn test_open_rejects_blank_device() {
        let origin: Arc<dyn BlockDevice> = Arc::new(MemoryBlockDevice::new(1 << 20));
        let blank: Arc<dyn BlockDevice> = Arc::new(MemoryBlockDevice::new(1 << 20));
        assert!(!SnapStore::sniff(&blank).await);
        let result = SnapStore::open(Devices::combined(origin, blank), EngineConfig::default()).await;
        assert!(matches!(result, Err(Error::InvalidSuperblock(_))));
    }

    #[test]
    fn test_config_defaults_from_partial_json() {
        let config: EngineConfig = serde_json::from_str(r#"{"defer_allocs": true}"#).unwrap();
        assert!(config.defer_allocs);
        assert_eq!(config.max_deferred_allocs, 500);
        assert_eq!(config.copyout_chunks, 32);
    }

    #[test]
    fn test_space_density() {
        let usage = |total, free| SpaceUsage {
            chunksize_bits: 12,
            total,
            free,
        };
        assert_eq!(usage(0, 0).density(), 0);
        assert_eq!(usage(100, 100).density(), 0);
        assert_eq!(usage(100, 0).density(), u32::MAX);
        assert_eq!(usage(4, 2).density(), u32::MAX / 2);
    }
}
