//! Sector-addressed metadata buffer cache
//!
//! Clean blocks live in an LRU and may be dropped at any time. Dirty and
//! journaled blocks are pinned until they reach their home location, and
//! both sets remember the order in which blocks entered them so the journal
//! writes them out first-in first-out.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;

use log::{debug, warn};
use lru::LruCache;
use thiserror::Error;

use crate::blockdev::{BlockDevice, BlockDeviceError, SECTOR_BITS};

/// An owned copy of one metadata block
pub type Block = Box<[u8]>;

/// Error type for cache operations
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Block device error: {0}")]
    BlockDevice(#[from] BlockDeviceError),
    #[error("Invalid block size: {0}")]
    InvalidBlockSize(usize),
}

pub type Result<T> = std::result::Result<T, CacheError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BufferState {
    Dirty,
    Journaled,
}

struct PinnedBlock {
    state: BufferState,
    data: Block,
}

pub struct BufferCache {
    device: Arc<dyn BlockDevice>,
    block_size: usize,
    clean: LruCache<u64, Block>,
    pinned: HashMap<u64, PinnedBlock>,
    dirty: Vec<u64>,
    journaled: Vec<u64>,
}

impl BufferCache {
    /// Create a cache of `capacity` clean blocks of `block_size` bytes
    pub fn new(device: Arc<dyn BlockDevice>, block_size: usize, capacity: usize) -> Result<Self> {
        if !block_size.is_power_of_two() || block_size < 512 {
            return Err(CacheError::InvalidBlockSize(block_size));
        }
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Ok(Self {
            device,
            block_size,
            clean: LruCache::new(capacity),
            pinned: HashMap::new(),
            dirty: Vec::new(),
            journaled: Vec::new(),
        })
    }

    pub fn device(&self) -> &Arc<dyn BlockDevice> {
        &self.device
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// A zero-filled block, the equivalent of getting a fresh buffer
    pub fn zeroed(&self) -> Block {
        vec![0u8; self.block_size].into_boxed_slice()
    }

    /// Return a copy of the block at `sector`, reading it from disk if needed
    pub async fn read(&mut self, sector: u64) -> Result<Block> {
        if let Some(pinned) = self.pinned.get(&sector) {
            return Ok(pinned.data.clone());
        }
        if let Some(block) = self.clean.get(&sector) {
            return Ok(block.clone());
        }

        let mut block = self.zeroed();
        self.device.read_at(sector << SECTOR_BITS, &mut block).await?;
        self.clean.put(sector, block.clone());
        Ok(block)
    }

    /// Replace the contents of `sector` and queue it for the next commit
    pub fn mark_dirty(&mut self, sector: u64, data: Block) {
        debug_assert_eq!(data.len(), self.block_size);
        self.clean.pop(&sector);
        match self.pinned.get_mut(&sector) {
            Some(pinned) => {
                if pinned.state == BufferState::Journaled {
                    self.journaled.retain(|&s| s != sector);
                    self.dirty.push(sector);
                    pinned.state = BufferState::Dirty;
                }
                pinned.data = data;
            }
            None => {
                self.dirty.push(sector);
                self.pinned.insert(
                    sector,
                    PinnedBlock {
                        state: BufferState::Dirty,
                        data,
                    },
                );
            }
        }
    }

    pub fn is_dirty(&self, sector: u64) -> bool {
        matches!(self.pinned.get(&sector), Some(p) if p.state == BufferState::Dirty)
    }

    pub fn dirty_count(&self) -> usize {
        self.dirty.len()
    }

    pub fn journaled_count(&self) -> usize {
        self.journaled.len()
    }

    /// Dirty blocks in the order they were first dirtied
    pub fn dirty_blocks(&self) -> impl Iterator<Item = (u64, &[u8])> + '_ {
        self.dirty.iter().filter_map(move |sector| {
            self.pinned
                .get(sector)
                .map(|pinned| (*sector, &pinned.data[..]))
        })
    }

    /// Keep the current dirty set pinned but treat it as journaled
    pub fn move_dirty_to_journaled(&mut self) {
        for sector in self.dirty.drain(..) {
            if let Some(pinned) = self.pinned.get_mut(&sector) {
                pinned.state = BufferState::Journaled;
                self.journaled.push(sector);
            }
        }
    }

    /// Write every dirty block to its home location and mark it clean
    pub async fn write_dirty_home(&mut self) -> Result<()> {
        let sectors = std::mem::take(&mut self.dirty);
        self.write_home(sectors).await
    }

    /// Write every journaled block to its home location and mark it clean
    pub async fn flush_journaled(&mut self) -> Result<()> {
        if !self.journaled.is_empty() {
            debug!("CACHE: flushing {} journaled blocks", self.journaled.len());
        }
        let sectors = std::mem::take(&mut self.journaled);
        self.write_home(sectors).await
    }

    async fn write_home(&mut self, sectors: Vec<u64>) -> Result<()> {
        for sector in sectors {
            let Some(pinned) = self.pinned.remove(&sector) else {
                continue;
            };
            self.device
                .write_at(sector << SECTOR_BITS, &pinned.data)
                .await?;
            self.clean.put(sector, pinned.data);
        }
        Ok(())
    }

    /// Write a block straight to disk, bypassing the dirty lists
    pub async fn write_through(&mut self, sector: u64, data: Block) -> Result<()> {
        if self.pinned.contains_key(&sector) {
            warn!("CACHE: write-through over pinned block at sector {}", sector);
            self.forget(sector);
        }
        self.device.write_at(sector << SECTOR_BITS, &data).await?;
        self.clean.put(sector, data);
        Ok(())
    }

    /// Drop every cached copy of `sector`, e.g. after the block was freed
    pub fn forget(&mut self, sector: u64) {
        self.clean.pop(&sector);
        if let Some(pinned) = self.pinned.remove(&sector) {
            match pinned.state {
                BufferState::Dirty => self.dirty.retain(|&s| s != sector),
                BufferState::Journaled => self.journaled.retain(|&s| s != sector),
            }
        }
    }

    /// Drop all clean blocks; pinned blocks are kept
    pub fn invalidate_clean(&mut self) {
        self.clean.clear();
    }
}
