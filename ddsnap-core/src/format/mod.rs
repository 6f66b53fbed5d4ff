//! Creating a new snapshot store on blank devices

use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::btree::Node;
use crate::error::{Error, Result};
use crate::layout::{DiskSuper, MAX_BLOCK_BITS, MAX_CHUNK_BITS, MIN_BLOCK_BITS};
use crate::store::{Devices, EngineConfig, SnapStore};

/// Geometry of a new store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FormatOptions {
    /// Metadata block size in bits
    pub metadata_bits: u32,
    /// Snapshot chunk size in bits; must match `metadata_bits` when metadata
    /// and snapshot data share a device
    pub chunk_bits: u32,
    /// Journal size in bytes, rounded up to whole metadata blocks
    pub journal_bytes: u64,
}

impl Default for FormatOptions {
    fn default() -> Self {
        Self {
            metadata_bits: 12,
            chunk_bits: 12,
            journal_bytes: 100 << 12,
        }
    }
}

impl FormatOptions {
    fn validate(&self, combined: bool) -> Result<()> {
        if !(MIN_BLOCK_BITS..=MAX_BLOCK_BITS).contains(&self.metadata_bits) {
            return Err(Error::InvalidArgument(format!(
                "metadata block size of 2^{} bytes is not supported",
                self.metadata_bits
            )));
        }
        if !(MIN_BLOCK_BITS..=MAX_CHUNK_BITS).contains(&self.chunk_bits) {
            return Err(Error::InvalidArgument(format!(
                "chunk size of 2^{} bytes is not supported",
                self.chunk_bits
            )));
        }
        if combined && self.chunk_bits != self.metadata_bits {
            return Err(Error::InvalidArgument(
                "metadata block size and chunk size must match on a combined store".into(),
            ));
        }
        if self.journal_bytes == 0 {
            return Err(Error::InvalidArgument("journal size must not be zero".into()));
        }
        Ok(())
    }
}

/// Write an empty store: superblock, allocation bitmaps, an empty exception
/// tree and a journal of empty commit blocks. Existing contents of the
/// metadata and snapshot devices are overwritten.
pub async fn initialize(devices: Devices, options: &FormatOptions) -> Result<()> {
    let combined = devices.is_combined();
    options.validate(combined)?;

    let (orgsize, snapsize, metasize) = devices.sizes().await?;
    let mut image = DiskSuper::default();
    image.metadata.allocsize_bits = options.metadata_bits;
    image.metadata.chunks = metasize >> options.metadata_bits;
    if !combined {
        image.snapdata.allocsize_bits = options.chunk_bits;
        image.snapdata.chunks = snapsize >> options.chunk_bits;
        if image.snapdata.chunks == 0 {
            return Err(Error::InvalidArgument(format!(
                "snapshot device of {} bytes holds no chunk",
                snapsize
            )));
        }
    }
    image.orgsectors = orgsize >> crate::blockdev::SECTOR_BITS;
    image.orgoffset = 0;
    image.etree_levels = 1;
    image.create_time = chrono::Utc::now().timestamp() as u64;

    let block_size = 1u64 << options.metadata_bits;
    let journal_size = (options.journal_bytes + block_size - 1) / block_size;
    image.journal_size = u32::try_from(journal_size)
        .map_err(|_| Error::InvalidArgument(format!("journal of {} blocks is too large", journal_size)))?;
    image.journal_next = 0;
    image.sequence = image.journal_size;

    info!(
        "FORMAT: origin {} sectors, metadata {} chunks, journal {} blocks, {} store",
        image.orgsectors,
        image.metadata.chunks,
        image.journal_size,
        if combined { "combined" } else { "separate" }
    );

    let mut store = SnapStore::assemble(devices, EngineConfig::default(), image)?;
    store.init_allocation().await?;
    store.sb_dirty = true;

    let leaf = store.new_leaf().await?;
    let root = store.new_node().await?;
    let mut block = store.meta.read(root).await?;
    let mut node = Node::new(&mut block[..]);
    node.set_count(1);
    node.set_entry(0, 0, leaf);
    store.meta.mark_dirty(root, block);
    store.image.etree_root = root;

    store.init_journal().await?;
    store.save_sb_check().await?;
    if let Err(err) = store.devices.metadata.sync().await {
        warn!("FORMAT: sync failed: {}", err);
        return Err(err.into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block_bitmap::Space;
    use crate::blockdev::{BlockDevice, MemoryBlockDevice};
    use std::sync::Arc;

    fn memory(bytes: u64) -> Arc<dyn BlockDevice> {
        Arc::new(MemoryBlockDevice::new(bytes))
    }

    #[tokio::test]
    async fn test_combined_store() {
        let devices = Devices::combined(memory(4 << 20), memory(2 << 20));
        initialize(devices.clone(), &FormatOptions::default()).await.unwrap();

        let image = SnapStore::read_superblock(&devices.metadata).await.unwrap();
        assert!(image.is_combined());
        assert!(!image.is_busy());
        assert_eq!(image.metadata.chunks, 512);
        assert_eq!(image.journal_size, 100);
        // one commit per journal slot, then the commit that saves the superblock
        assert_eq!(image.sequence, 101);
        assert_eq!(image.orgsectors, 8192);
        assert!(image.snapshots.is_empty());

        let mut store = SnapStore::open(devices, EngineConfig::default()).await.unwrap();
        let counted = store.count_free(Space::Metadata).await.unwrap();
        assert_eq!(counted, store.superblock().metadata.freechunks);
        // superblock area, one bitmap block, the journal
        let reserved = 2 + 1 + 100;
        // minus the first leaf and the root
        assert_eq!(counted, 512 - reserved - 2);
    }

    #[tokio::test]
    async fn test_separate_store() {
        let devices = Devices::separate(memory(4 << 20), memory(8 << 20), memory(1 << 20));
        let options = FormatOptions {
            chunk_bits: 14,
            journal_bytes: 20 << 12,
            ..FormatOptions::default()
        };
        initialize(devices.clone(), &options).await.unwrap();

        let store = SnapStore::open(devices, EngineConfig::default()).await.unwrap();
        assert!(!store.superblock().is_combined());
        assert_eq!(store.chunksize_bits(), 14);
        let usage = store.snapdata_usage();
        assert_eq!(usage.total, 512);
        assert_eq!(usage.free, 512);
    }

    #[tokio::test]
    async fn test_combined_store_needs_one_size() {
        let devices = Devices::combined(memory(1 << 20), memory(1 << 20));
        let options = FormatOptions {
            chunk_bits: 14,
            ..FormatOptions::default()
        };
        assert!(matches!(
            initialize(devices, &options).await,
            Err(Error::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn test_store_too_small_for_journal() {
        let devices = Devices::combined(memory(1 << 20), memory(64 << 12));
        let result = initialize(devices, &FormatOptions::default()).await;
        assert!(matches!(result, Err(Error::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn test_open_with_wrong_device_set() {
        let origin = memory(1 << 20);
        let store = memory(2 << 20);
        initialize(Devices::combined(origin.clone(), store.clone()), &FormatOptions::default())
            .await
            .unwrap();
        let result = SnapStore::open(
            Devices::separate(origin, memory(1 << 20), store),
            EngineConfig::default(),
        )
        .await;
        assert!(matches!(result, Err(Error::InvalidArgument(_))));
    }
}
