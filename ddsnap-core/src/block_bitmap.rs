//! Chunk allocation bitmaps with deferred allocation
//!
//! Each allocation space (metadata, and snapshot data when it lives on its
//! own device) keeps one bit per chunk in bitmap blocks stored on the
//! metadata device. With deferral enabled, freshly allocated chunks that
//! extend the currently open range are only remembered in memory and in the
//! next commit block; they reach the bitmap at the next barrier.

use log::{debug, info, warn};
use thiserror::Error;

use crate::error::Result;
use crate::layout::{AllocSpaceImage, Layout};
use crate::store::SnapStore;

/// Error type for allocation bitmap operations
#[derive(Error, Debug)]
pub enum BlockBitmapError {
    #[error("{count} chunks from {start} are still in use")]
    ChunksInUse { start: u64, count: u64 },
    #[error("bitmap relocation needs {needed} chunks but only {available} were added")]
    NoRoomForBitmap { needed: u64, available: u64 },
    #[error("snapshot store cannot grow unless the metadata store grows with it")]
    SnapshotGrowthNeedsMetadata,
}

/// Largest count the 31-bit commit block field can carry
const MAX_RANGE_COUNT: u32 = (1 << 31) - 1;

/// Which allocation space a chunk belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Space {
    Metadata,
    Snapdata,
}

/// A run of chunks allocated without touching the bitmap
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AllocRange {
    pub chunk: u64,
    pub count: u32,
}

impl AllocRange {
    pub fn contains(&self, chunk: u64) -> bool {
        chunk >= self.chunk && chunk - self.chunk < self.count as u64
    }
}

/// Deferred allocations not yet reflected in the bitmap
#[derive(Debug, Default)]
pub struct DeferredAllocs {
    /// The range still being extended; goes into the next commit block
    pub open: AllocRange,
    /// Ranges already recorded in commit blocks since the last barrier
    pub committed: Vec<AllocRange>,
}

impl DeferredAllocs {
    pub fn contains(&self, chunk: u64) -> bool {
        self.open.contains(chunk) || self.committed.iter().any(|r| r.contains(chunk))
    }

    pub fn total(&self) -> u64 {
        self.open.count as u64 + self.committed.iter().map(|r| r.count as u64).sum::<u64>()
    }

    /// Claim `chunk` by opening or extending the open range.
    ///
    /// Fails once `limit` ranges await a barrier, or when the chunk does not
    /// directly follow the open range.
    pub fn try_extend(&mut self, chunk: u64, limit: usize) -> bool {
        if self.committed.len() >= limit {
            return false;
        }
        if self.open.count == 0 {
            self.open = AllocRange { chunk, count: 1 };
            return true;
        }
        if chunk == self.open.chunk + self.open.count as u64 && self.open.count < MAX_RANGE_COUNT {
            self.open.count += 1;
            return true;
        }
        false
    }

    /// Give back the most recently deferred chunk
    fn release_tail(&mut self, chunk: u64) -> bool {
        if self.open.count > 0 && chunk == self.open.chunk + self.open.count as u64 - 1 {
            self.open.count -= 1;
            return true;
        }
        false
    }

    /// Close the open range, returning it if it held anything
    pub fn close(&mut self) -> Option<AllocRange> {
        if self.open.count == 0 {
            return None;
        }
        let range = std::mem::take(&mut self.open);
        self.committed.push(range);
        Some(range)
    }

    pub fn clear(&mut self) {
        *self = DeferredAllocs::default();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BitOp {
    /// Succeed only if every bit is clear
    Test,
    Set,
    Clear,
}

impl SnapStore {
    pub(crate) fn space(&self, space: Space) -> &AllocSpaceImage {
        match space {
            Space::Snapdata if !self.layout.combined => &self.image.snapdata,
            _ => &self.image.metadata,
        }
    }

    pub(crate) fn space_mut(&mut self, space: Space) -> &mut AllocSpaceImage {
        match space {
            Space::Snapdata if !self.layout.combined => &mut self.image.snapdata,
            _ => &mut self.image.metadata,
        }
    }

    fn bitmap_shift(&self) -> u32 {
        self.layout.metadata_bits + 3
    }

    fn bitmap_mask(&self) -> u64 {
        (1u64 << self.bitmap_shift()) - 1
    }

    fn bitmap_sector(&self, base: u64, block: u64) -> u64 {
        base + (block << self.layout.meta_chunk_sectors_bits)
    }

    /// Bitmap blocks needed to track `chunks` chunks
    pub fn calc_bitmap_blocks(&self, chunks: u64) -> u64 {
        let per_block = 1u64 << self.bitmap_shift();
        (chunks + per_block - 1) / per_block
    }

    pub fn is_deferred_alloc(&self, chunk: u64) -> bool {
        self.defer.contains(chunk)
    }

    pub(crate) fn defer_enabled(&self) -> bool {
        self.config.defer_allocs && self.layout.combined
    }

    /// Find and claim a free chunk among `count` chunks from `start`
    async fn alloc_chunk_from_range(
        &mut self,
        space: Space,
        start: u64,
        count: u64,
    ) -> Result<Option<u64>> {
        let shift = self.bitmap_shift();
        let block_size = self.layout.block_size;
        let image = *self.space(space);

        let mut blocknum = start >> shift;
        let mut offset = ((start & self.bitmap_mask()) >> 3) as usize;
        let mut length = (count + (start & 7) + 7) >> 3;

        loop {
            let sector = self.bitmap_sector(image.bitmap_base, blocknum);
            let mut block = self.meta.read(sector).await?;
            let n = ((block_size - offset) as u64).min(length) as usize;
            length -= n as u64;

            for p in offset..offset + n {
                let byte = block[p];
                if byte == 0xff {
                    continue;
                }
                for bit in 0..8u64 {
                    if byte & (1 << bit) != 0 {
                        continue;
                    }
                    let chunk = bit + ((p as u64) << 3) + (blocknum << shift);
                    if chunk >= image.chunks || self.defer.contains(chunk) {
                        continue;
                    }
                    let deferred = self.defer_enabled()
                        && self
                            .defer
                            .try_extend(chunk, self.config.max_deferred_allocs);
                    if !deferred {
                        block[p] |= 1 << bit;
                        self.meta.mark_dirty(sector, block);
                    }
                    self.space_mut(space).freechunks -= 1;
                    self.sb_dirty = true;
                    return Ok(Some(chunk));
                }
            }

            if length == 0 {
                return Ok(None);
            }
            blocknum += 1;
            if blocknum >= image.bitmap_blocks {
                blocknum = 0;
            }
            offset = 0;
        }
    }

    /// Allocate one chunk, scanning from the allocation cursor and wrapping
    pub async fn alloc_chunk(&mut self, space: Space) -> Result<Option<u64>> {
        let image = *self.space(space);
        let last = image.last_alloc.min(image.chunks);

        let mut found = self
            .alloc_chunk_from_range(space, last, image.chunks - last)
            .await?;
        if found.is_none() {
            found = self.alloc_chunk_from_range(space, 0, last).await?;
        }
        match found {
            Some(chunk) => {
                self.space_mut(space).last_alloc = chunk;
                Ok(Some(chunk))
            }
            None => {
                warn!("ALLOC: {:?} space is full", space);
                Ok(None)
            }
        }
    }

    /// Return a chunk to its space. Returns false if it was already free.
    pub async fn free_chunk(&mut self, space: Space, chunk: u64) -> Result<bool> {
        let image = *self.space(space);
        if chunk >= image.chunks {
            warn!("ALLOC: free of chunk {} beyond end of {:?} space", chunk, space);
            return Ok(false);
        }

        if self.defer_enabled() && self.defer.release_tail(chunk) {
            self.space_mut(space).freechunks += 1;
            self.sb_dirty = true;
            return Ok(true);
        }

        let sector = self.bitmap_sector(image.bitmap_base, chunk >> self.bitmap_shift());
        let bit = chunk & self.bitmap_mask();
        let mut block = self.meta.read(sector).await?;
        let byte = (bit >> 3) as usize;
        let mask = 1u8 << (bit & 7);
        if block[byte] & mask == 0 {
            warn!("ALLOC: chunk {:#x} already free", chunk);
            return Ok(false);
        }
        block[byte] &= !mask;
        self.meta.mark_dirty(sector, block);
        self.space_mut(space).freechunks += 1;
        self.sb_dirty = true;
        Ok(true)
    }

    /// Test, set or clear the bits of `count` chunks from `start` in the
    /// bitmap starting at sector `base`. A test returns false on the first set bit.
    pub(crate) async fn change_bits(
        &mut self,
        start: u64,
        count: u64,
        base: u64,
        op: BitOp,
    ) -> Result<bool> {
        let shift = self.bitmap_shift();
        let mask = self.bitmap_mask();
        let limit = start + count;
        let mut chunk = start;
        let mut sector = self.bitmap_sector(base, start >> shift);

        while chunk < limit {
            let mut block = self.meta.read(sector).await?;
            loop {
                let bit = chunk & mask;
                let byte = (bit >> 3) as usize;
                let bitmask = 1u8 << (bit & 7);
                match op {
                    BitOp::Test => {
                        if block[byte] & bitmask != 0 {
                            warn!("ALLOC: chunk {} is in use", chunk);
                            return Ok(false);
                        }
                    }
                    BitOp::Set => block[byte] |= bitmask,
                    BitOp::Clear => block[byte] &= !bitmask,
                }
                chunk += 1;
                if chunk & mask == 0 || chunk >= limit {
                    break;
                }
            }
            if op != BitOp::Test {
                self.meta.mark_dirty(sector, block);
            }
            sector += 1 << self.layout.meta_chunk_sectors_bits;
        }
        Ok(true)
    }

    /// Mark a run of metadata chunks allocated in the bitmap
    pub(crate) async fn set_allocated(&mut self, chunk: u64, count: u64) -> Result<()> {
        let base = self.image.metadata.bitmap_base;
        self.change_bits(chunk, count, base, BitOp::Set).await?;
        Ok(())
    }

    /// Zero bits in the bitmap of `space`, counting only real chunks
    pub async fn count_zeros(&mut self, space: Space) -> Result<u64> {
        let image = *self.space(space);
        let block_size = self.layout.block_size as u64;
        let mut bytes = (image.chunks + 7) >> 3;
        let mut block = 0;
        let mut count = 0u64;

        while bytes > 0 {
            let sector = self.bitmap_sector(image.bitmap_base, block);
            let data = self.meta.read(sector).await?;
            let n = block_size.min(bytes);
            count += data[..n as usize]
                .iter()
                .map(|b| b.count_zeros() as u64)
                .sum::<u64>();
            bytes -= n;
            block += 1;
        }
        Ok(count)
    }

    pub fn count_deferred(&self) -> u64 {
        self.defer.total()
    }

    /// Free chunks according to the bitmap and the deferred ranges
    pub async fn count_free(&mut self, space: Space) -> Result<u64> {
        let zeros = self.count_zeros(space).await?;
        let deferred = if space == Space::Metadata || self.layout.combined {
            self.count_deferred()
        } else {
            0
        };
        Ok(zeros.saturating_sub(deferred))
    }

    /// Recount free chunks and repair the tracked counters. Returns whether
    /// they already agreed.
    pub async fn check_freespace(&mut self) -> Result<bool> {
        let mut consistent = true;
        let mut spaces = vec![Space::Metadata];
        if !self.layout.combined {
            spaces.push(Space::Snapdata);
        }
        for space in spaces {
            let counted = self.count_free(space).await?;
            let tracked = self.space(space).freechunks;
            if counted != tracked {
                warn!(
                    "ALLOC: {:?} free chunks count wrong: counted {}, free = {}",
                    space, counted, tracked
                );
                self.space_mut(space).freechunks = counted;
                self.sb_dirty = true;
                consistent = false;
            }
        }
        Ok(consistent)
    }

    pub(crate) async fn selfcheck_freespace(&mut self) -> Result<()> {
        if self.config.selfcheck {
            self.check_freespace().await?;
        }
        Ok(())
    }

    /// Write fresh bitmap blocks, reserving the first `reserved` chunks and
    /// the bits past `chunks` in the final partial byte
    async fn init_bitmap_blocks(
        &mut self,
        base: u64,
        bitmaps: u64,
        chunks: u64,
        mut reserved: u64,
    ) -> Result<()> {
        let block_size = self.layout.block_size;
        let per_block = (block_size as u64) << 3;
        info!("ALLOC: initializing {} bitmap block(s)", bitmaps);

        for i in 0..bitmaps {
            let sector = self.bitmap_sector(base, i);
            let mut block = self.meta.zeroed();
            if reserved > per_block {
                block.fill(0xff);
                reserved -= per_block;
            } else {
                for j in 0..reserved as usize {
                    block[j >> 3] |= 1 << (j & 7);
                }
                reserved = 0;
            }
            if i == bitmaps - 1 && chunks & 7 != 0 {
                block[((chunks >> 3) as usize) & (block_size - 1)] |= 0xffu8 << (chunks & 7);
            }
            self.meta.write_through(sector, block).await?;
        }
        Ok(())
    }

    /// Lay out the bitmaps and the journal for a new store and reserve the
    /// chunks they occupy
    pub(crate) async fn init_allocation(&mut self) -> Result<()> {
        let csb = self.layout.meta_chunk_sectors_bits;
        let base_chunk = Layout::reserved_head_chunks(csb);
        let meta_chunks = self.image.metadata.chunks;

        let meta_bitmaps = self.calc_bitmap_blocks(meta_chunks);
        self.image.metadata.bitmap_blocks = meta_bitmaps;
        self.image.metadata.bitmap_base = base_chunk << csb;
        self.image.metadata.last_alloc = 0;

        let mut reserved = base_chunk + meta_bitmaps + self.image.journal_size as u64;
        let mut snap_bitmaps = 0;
        if !self.layout.combined {
            snap_bitmaps = self.calc_bitmap_blocks(self.image.snapdata.chunks);
            self.image.snapdata.bitmap_blocks = snap_bitmaps;
            self.image.snapdata.bitmap_base = (base_chunk + meta_bitmaps) << csb;
            self.image.snapdata.freechunks = self.image.snapdata.chunks;
            self.image.snapdata.last_alloc = 0;
            reserved += snap_bitmaps;
        }
        if reserved >= meta_chunks {
            return Err(crate::Error::InvalidArgument(format!(
                "metadata store of {} chunks is too small, {} chunks are reserved",
                meta_chunks, reserved
            )));
        }

        self.image.metadata.freechunks = meta_chunks - reserved;
        self.image.journal_base = self.image.metadata.bitmap_base + ((meta_bitmaps + snap_bitmaps) << csb);

        if !self.layout.combined {
            info!(
                "ALLOC: metadata store size: {} chunks ({} sectors)",
                meta_chunks,
                meta_chunks << csb
            );
        }
        let snap_chunks = self.space(Space::Snapdata).chunks;
        info!(
            "ALLOC: snapshot store size: {} chunks ({} sectors)",
            snap_chunks,
            snap_chunks << self.layout.snap_chunk_sectors_bits
        );

        let meta_base = self.image.metadata.bitmap_base;
        self.init_bitmap_blocks(meta_base, meta_bitmaps, meta_chunks, reserved)
            .await?;
        if !self.layout.combined {
            let snap_base = self.image.snapdata.bitmap_base;
            let chunks = self.image.snapdata.chunks;
            self.init_bitmap_blocks(snap_base, snap_bitmaps, chunks, 0)
                .await?;
        }
        self.sb_dirty = true;
        self.selfcheck_freespace().await
    }

    /// Resize the bitmap of `space` to track `newchunks` chunks.
    ///
    /// Shrinking requires the trimmed chunks to be free. Growing past the
    /// capacity of the current bitmap moves it to `new_basechunk`, the start of
    /// `new_metachunks` freshly added metadata chunks.
    pub(crate) async fn adjust_bitmap(
        &mut self,
        space: Space,
        newchunks: u64,
        new_basechunk: u64,
        new_metachunks: u64,
    ) -> Result<()> {
        let image = *self.space(space);
        let block_size = self.layout.block_size;
        let csb = self.layout.meta_chunk_sectors_bits;
        let oldchunks = image.chunks;
        let oldbitmaps = image.bitmap_blocks;
        let newbitmaps = self.calc_bitmap_blocks(newchunks);
        let oldbase = image.bitmap_base;
        let old_meta_chunk = oldbase >> csb;
        let meta_base = self.image.metadata.bitmap_base;
        let partial = |chunks: u64| ((chunks >> 3) as usize) & (block_size - 1);

        info!(
            "ALLOC: oldchunks {} newchunks {}, oldbitmaps {}, newbitmaps {}",
            oldchunks, newchunks, oldbitmaps, newbitmaps
        );

        if newchunks <= oldchunks {
            if !self
                .change_bits(newchunks, oldchunks - newchunks, oldbase, BitOp::Test)
                .await?
            {
                return Err(BlockBitmapError::ChunksInUse {
                    start: newchunks,
                    count: oldchunks - newchunks,
                }
                .into());
            }
            if newchunks & 7 != 0 {
                let sector = self.bitmap_sector(oldbase, (newchunks - 1) >> self.bitmap_shift());
                let mut block = self.meta.read(sector).await?;
                block[partial(newchunks)] |= 0xffu8 << (newchunks & 7);
                self.meta.mark_dirty(sector, block);
            }
            if newbitmaps < oldbitmaps {
                self.change_bits(
                    old_meta_chunk + newbitmaps,
                    oldbitmaps - newbitmaps,
                    meta_base,
                    BitOp::Clear,
                )
                .await?;
                for i in newbitmaps..oldbitmaps {
                    let sector = self.bitmap_sector(oldbase, i);
                    self.meta.forget(sector);
                }
                self.space_mut(space).bitmap_blocks = newbitmaps;
            }
            return Ok(());
        }

        if oldbitmaps == newbitmaps {
            if oldchunks & 7 != 0 || newchunks & 7 != 0 {
                let sector = self.bitmap_sector(oldbase, oldbitmaps - 1);
                let mut block = self.meta.read(sector).await?;
                if oldchunks & 7 != 0 {
                    block[partial(oldchunks)] &= !(0xffu8 << (oldchunks & 7));
                }
                if newchunks & 7 != 0 {
                    block[partial(newchunks)] |= 0xffu8 << (newchunks & 7);
                }
                self.meta.mark_dirty(sector, block);
            }
            return Ok(());
        }

        let newbase = new_basechunk << csb;
        info!(
            "ALLOC: expand bitmap: old base sector {}, new base sector {}, new metadata chunks {}",
            oldbase, newbase, new_metachunks
        );
        if new_metachunks < newbitmaps {
            return Err(BlockBitmapError::NoRoomForBitmap {
                needed: newbitmaps,
                available: new_metachunks,
            }
            .into());
        }

        for i in 0..oldbitmaps {
            let old_sector = self.bitmap_sector(oldbase, i);
            let mut block = self.meta.read(old_sector).await?;
            if i == oldbitmaps - 1 && oldchunks & 7 != 0 {
                block[partial(oldchunks)] &= !(0xffu8 << (oldchunks & 7));
            }
            self.meta.forget(old_sector);
            let new_sector = self.bitmap_sector(newbase, i);
            self.meta.mark_dirty(new_sector, block);
        }
        for i in oldbitmaps..newbitmaps {
            let mut block = self.meta.zeroed();
            if i == newbitmaps - 1 && newchunks & 7 != 0 {
                block[partial(newchunks)] |= 0xffu8 << (newchunks & 7);
            }
            let new_sector = self.bitmap_sector(newbase, i);
            self.meta.mark_dirty(new_sector, block);
        }

        {
            let image = self.space_mut(space);
            image.bitmap_base = newbase;
            image.bitmap_blocks = newbitmaps;
        }

        let meta_base = self.image.metadata.bitmap_base;
        self.change_bits(old_meta_chunk, oldbitmaps, meta_base, BitOp::Clear)
            .await?;
        self.change_bits(new_basechunk, newbitmaps, meta_base, BitOp::Set)
            .await?;
        Ok(())
    }

    /// Apply new device sizes in bytes; zero leaves a size unchanged
    pub(crate) async fn change_device_sizes(
        &mut self,
        orgsize: u64,
        snapsize: u64,
        metasize: u64,
    ) -> Result<()> {
        let mut new_basechunk = 0;
        let mut new_metachunks = 0;

        let metachunks = metasize >> self.image.metadata.allocsize_bits;
        if metachunks != 0 && self.image.metadata.chunks != metachunks {
            let oldchunks = self.image.metadata.chunks;
            let oldbitmaps = self.image.metadata.bitmap_blocks;
            info!(
                "ALLOC: metadata device size changes from {} to {} chunks",
                oldchunks, metachunks
            );
            if oldchunks != 0 {
                let oldbase = self.image.metadata.bitmap_base;
                new_basechunk = oldchunks;
                new_metachunks = metachunks.saturating_sub(oldchunks);
                self.adjust_bitmap(Space::Metadata, metachunks, new_basechunk, new_metachunks)
                    .await?;
                if self.image.metadata.bitmap_base != oldbase {
                    let moved = self.image.metadata.bitmap_blocks;
                    new_basechunk += moved;
                    new_metachunks = new_metachunks.saturating_sub(moved);
                }
            }
            let image = &mut self.image.metadata;
            image.freechunks = (image.freechunks + metachunks + oldbitmaps)
                .wrapping_sub(oldchunks)
                .wrapping_sub(image.bitmap_blocks);
            image.chunks = metachunks;
            image.last_alloc = image.last_alloc.min(metachunks.saturating_sub(1));
            self.sb_dirty = true;
        }

        if !self.layout.combined {
            let snapchunks = snapsize >> self.image.snapdata.allocsize_bits;
            if snapchunks != 0 && self.image.snapdata.chunks != snapchunks {
                let oldchunks = self.image.snapdata.chunks;
                info!(
                    "ALLOC: snapshot device size changes from {} to {} chunks",
                    oldchunks, snapchunks
                );
                if oldchunks != 0 {
                    let oldbitmaps = self.image.snapdata.bitmap_blocks;
                    if snapchunks > oldchunks
                        && self.calc_bitmap_blocks(snapchunks) != oldbitmaps
                        && new_metachunks == 0
                    {
                        return Err(BlockBitmapError::SnapshotGrowthNeedsMetadata.into());
                    }
                    self.adjust_bitmap(Space::Snapdata, snapchunks, new_basechunk, new_metachunks)
                        .await?;
                    let meta = &mut self.image.metadata;
                    meta.freechunks = (meta.freechunks + oldbitmaps)
                        .wrapping_sub(self.image.snapdata.bitmap_blocks);
                }
                let image = &mut self.image.snapdata;
                image.freechunks = (image.freechunks + snapchunks).wrapping_sub(oldchunks);
                image.chunks = snapchunks;
                image.last_alloc = image.last_alloc.min(snapchunks.saturating_sub(1));
                self.sb_dirty = true;
            }
        }

        let orgsectors = orgsize >> crate::blockdev::SECTOR_BITS;
        if orgsectors != 0 && self.image.orgsectors != orgsectors {
            info!(
                "ALLOC: origin device size changes from {} to {} sectors",
                self.image.orgsectors, orgsectors
            );
            self.image.orgsectors = orgsectors;
            self.sb_dirty = true;
        }
        debug!("ALLOC: sizes now {:?} / {:?}", self.image.metadata, self.image.snapdata);
        Ok(())
    }
}
