//! Write-ahead journal for metadata blocks
//!
//! The journal is a ring of metadata-sized slots. A transaction writes each
//! dirty block into the next slot, followed by a commit block naming the home
//! sector of every block just written. After an unclean shutdown the newest
//! run of transactions is copied back home by [`SnapStore::replay_journal`].

use std::io::Cursor;

use byteorder::{ByteOrder, LittleEndian, ReadBytesExt, WriteBytesExt};
use log::{debug, error, info, trace, warn};
use thiserror::Error;

use crate::block_bitmap::{AllocRange, Space};
use crate::blockdev::SECTOR_BITS;
use crate::cache::Block;
use crate::error::Result;
use crate::store::SnapStore;

/// Marks a journal slot as a commit block
pub const JOURNAL_MAGIC: [u8; 8] = *b"MAGICNUM";

/// Bytes in front of the sector list of a commit block
const COMMIT_HEADER: usize = 52;

/// Dirty blocks a single B-tree edit may add on top of a transaction
const MAX_BTREE_DIRTY: u32 = 10;

/// Home sectors that fit in one commit block
pub fn max_commit_blocks(block_size: usize) -> usize {
    (block_size - COMMIT_HEADER) / 8
}

/// Error type for journal operations
#[derive(Error, Debug)]
pub enum JournalError {
    #[error("corrupt commit block in journal slot {0}")]
    BadChecksum(u32),
    #[error("journal holds no commit blocks")]
    NoCommits,
    #[error("unexpected gap in journal sequence after slot {0}")]
    SequenceGap(u32),
    #[error("journal sequence has no newest commit")]
    NoNewest,
    #[error("journal slot {0} should hold data but holds a commit block")]
    DataIsCommit(u32),
    #[error("transaction of {blocks} blocks does not fit (limit {limit})")]
    TransactionTooLarge { blocks: usize, limit: usize },
}

/// Wrapping sum of the little-endian words of a block
pub fn checksum(block: &[u8]) -> u32 {
    block
        .chunks_exact(4)
        .fold(0u32, |sum, word| sum.wrapping_add(LittleEndian::read_u32(word)))
}

/// Decoded commit block
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommitBlock {
    pub sequence: i32,
    pub snapfree: u64,
    pub metafree: u64,
    /// Deferred allocation range closed by this transaction
    pub alloc: AllocRange,
    pub barrier: bool,
    /// Home sectors of the data blocks preceding this commit, oldest first
    pub sectors: Vec<u64>,
}

impl CommitBlock {
    pub fn is_commit(block: &[u8]) -> bool {
        block.len() >= JOURNAL_MAGIC.len() && block[..JOURNAL_MAGIC.len()] == JOURNAL_MAGIC
    }

    /// Encode into a block of `block_size` bytes whose checksum is zero
    pub fn encode(&self, block_size: usize) -> std::io::Result<Vec<u8>> {
        let mut block = vec![0u8; block_size];
        {
            let mut cursor = Cursor::new(&mut block[..]);
            std::io::Write::write_all(&mut cursor, &JOURNAL_MAGIC)?;
            cursor.write_u32::<LittleEndian>(0)?;
            cursor.write_i32::<LittleEndian>(self.sequence)?;
            cursor.write_u32::<LittleEndian>(self.sectors.len() as u32)?;
            cursor.write_u64::<LittleEndian>(self.snapfree)?;
            cursor.write_u64::<LittleEndian>(self.metafree)?;
            cursor.write_u64::<LittleEndian>(self.alloc.chunk)?;
            cursor.write_u32::<LittleEndian>(self.barrier as u32 | (self.alloc.count << 1))?;
            cursor.write_u32::<LittleEndian>(0)?;
            for &sector in &self.sectors {
                cursor.write_u64::<LittleEndian>(sector)?;
            }
        }
        let sum = checksum(&block);
        LittleEndian::write_u32(&mut block[8..12], sum.wrapping_neg());
        Ok(block)
    }

    pub fn decode(block: &[u8]) -> std::io::Result<Self> {
        let mut cursor = Cursor::new(&block[JOURNAL_MAGIC.len()..]);
        let _checksum = cursor.read_u32::<LittleEndian>()?;
        let sequence = cursor.read_i32::<LittleEndian>()?;
        let entries = cursor.read_u32::<LittleEndian>()? as usize;
        let snapfree = cursor.read_u64::<LittleEndian>()?;
        let metafree = cursor.read_u64::<LittleEndian>()?;
        let chunk = cursor.read_u64::<LittleEndian>()?;
        let packed = cursor.read_u32::<LittleEndian>()?;
        let _pad = cursor.read_u32::<LittleEndian>()?;
        let limit = max_commit_blocks(block.len());
        let mut sectors = Vec::with_capacity(entries.min(limit));
        for _ in 0..entries.min(limit) {
            sectors.push(cursor.read_u64::<LittleEndian>()?);
        }
        Ok(Self {
            sequence,
            snapfree,
            metafree,
            alloc: AllocRange {
                chunk,
                count: packed >> 1,
            },
            barrier: packed & 1 != 0,
            sectors,
        })
    }
}

impl SnapStore {
    fn journal_sector(&self, slot: u32) -> u64 {
        self.image.journal_base + ((slot as u64) << self.layout.meta_chunk_sectors_bits)
    }

    fn next_journal_block(&mut self) -> u32 {
        let next = self.image.journal_next;
        self.image.journal_next += 1;
        if self.image.journal_next == self.image.journal_size {
            self.image.journal_next = 0;
        }
        next
    }

    /// Dirty metadata is written home lazily through the journaled list
    pub(crate) fn deferring(&self) -> bool {
        self.config.defer_allocs
    }

    async fn read_journal(&mut self, slot: u32) -> Result<Block> {
        let mut block = self.meta.zeroed();
        let offset = self.journal_sector(slot) << SECTOR_BITS;
        self.meta.device().read_at(offset, &mut block).await?;
        Ok(block)
    }

    async fn write_journal(&mut self, slot: u32, data: &[u8]) -> Result<()> {
        let sector = self.journal_sector(slot);
        self.meta.forget(sector);
        self.meta
            .device()
            .write_at(sector << SECTOR_BITS, data)
            .await?;
        Ok(())
    }

    /// Write every committed deferred range into the allocation bitmap
    pub(crate) async fn flush_deferred_allocs(&mut self) -> Result<()> {
        let ranges = std::mem::take(&mut self.defer.committed);
        for range in ranges {
            trace!("JOURNAL: flush deferred {}@{}", range.count, range.chunk);
            self.set_allocated(range.chunk, range.count as u64).await?;
        }
        Ok(())
    }

    /// Journal all dirty blocks as one transaction.
    ///
    /// A barrier commit (forced once deferred work reaches half the journal)
    /// also writes the dirty blocks home, so replay never has to look past it.
    pub async fn commit_transaction(&mut self, mut barrier: bool) -> Result<()> {
        if self.meta.dirty_count() == 0 && self.defer.open.count == 0 {
            return Ok(());
        }

        let half = (self.image.journal_size / 2) as usize;
        if self.defer.committed.len() >= half || self.meta.journaled_count() >= half {
            debug!(
                "JOURNAL: forcing barrier, {} deferred ranges, {} journaled blocks",
                self.defer.committed.len(),
                self.meta.journaled_count()
            );
            self.meta.flush_journaled().await?;
            self.flush_deferred_allocs().await?;
            barrier = true;
        }

        let blocks: Vec<(u64, Vec<u8>)> = self
            .meta
            .dirty_blocks()
            .map(|(sector, data)| (sector, data.to_vec()))
            .collect();
        let limit = self
            .layout
            .max_commit_blocks
            .min(self.image.journal_size.saturating_sub(1) as usize);
        if blocks.len() > limit {
            error!("JOURNAL: {} dirty blocks overflow the journal", blocks.len());
            return Err(JournalError::TransactionTooLarge {
                blocks: blocks.len(),
                limit,
            }
            .into());
        }

        for (sector, data) in &blocks {
            let slot = self.next_journal_block();
            trace!("JOURNAL: data block {:#x} to slot [{}]", sector, slot);
            self.write_journal(slot, data).await?;
        }

        let slot = self.next_journal_block();
        let sequence = self.image.sequence as i32;
        self.image.sequence = self.image.sequence.wrapping_add(1);
        let alloc = self.defer.close().unwrap_or_default();
        let commit = CommitBlock {
            sequence,
            snapfree: self.space(Space::Snapdata).freechunks,
            metafree: self.image.metadata.freechunks,
            alloc,
            barrier,
            sectors: blocks.iter().map(|(sector, _)| *sector).collect(),
        };
        trace!(
            "JOURNAL: commit [{}] seq {} with {} blocks{}",
            slot,
            sequence,
            commit.sectors.len(),
            if barrier { " <barrier>" } else { "" }
        );
        let encoded = commit.encode(self.layout.block_size)?;
        self.write_journal(slot, &encoded).await?;

        if self.deferring() && !barrier {
            self.meta.move_dirty_to_journaled();
        } else {
            self.meta.write_dirty_home().await?;
        }
        self.selfcheck_freespace().await
    }

    /// Fold every deferred allocation into the bitmap and make it all durable
    pub async fn commit_deferred_allocs(&mut self) -> Result<()> {
        self.commit_transaction(false).await?;
        self.flush_deferred_allocs().await?;
        self.meta.flush_journaled().await?;
        self.commit_transaction(true).await
    }

    /// Commit early once the dirty blocks approach the journal capacity
    pub(crate) async fn dirty_buffer_count_check(&mut self) -> Result<()> {
        let dirty = self.meta.dirty_count();
        let journal = self.image.journal_size;
        if dirty as u64 >= journal.saturating_sub(MAX_BTREE_DIRTY) as u64 {
            if dirty > journal as usize {
                error!("JOURNAL: {} dirty buffers too many for journal of {}", dirty, journal);
                return Err(JournalError::TransactionTooLarge {
                    blocks: dirty,
                    limit: journal as usize,
                }
                .into());
            }
            self.commit_transaction(false).await?;
        }
        Ok(())
    }

    /// Fill every journal slot with an empty commit block
    pub(crate) async fn init_journal(&mut self) -> Result<()> {
        let metafree = self.image.metadata.freechunks;
        let snapfree = self.space(Space::Snapdata).freechunks;
        for _ in 0..self.image.journal_size {
            let slot = self.next_journal_block();
            let commit = CommitBlock {
                sequence: slot as i32,
                snapfree,
                metafree,
                ..CommitBlock::default()
            };
            let encoded = commit.encode(self.layout.block_size)?;
            self.write_journal(slot, &encoded).await?;
        }
        Ok(())
    }

    /// Recover after an unclean shutdown.
    ///
    /// Finds the newest commit (the one not followed by its successor
    /// sequence), reloads the deferred allocations recorded since the last
    /// barrier and rewrites every journaled block after that barrier to its
    /// home sector. Any inconsistency is fatal.
    pub async fn replay_journal(&mut self) -> Result<()> {
        warn!("JOURNAL: replaying journal");
        let jblocks = self.image.journal_size;
        let mut commits: Vec<(u32, i32)> = Vec::new();

        for slot in 0..jblocks {
            let block = self.read_journal(slot).await?;
            if !CommitBlock::is_commit(&block) {
                continue;
            }
            if checksum(&block) != 0 {
                error!("JOURNAL: corrupt journal block [{}]", slot);
                return Err(JournalError::BadChecksum(slot).into());
            }
            commits.push((slot, CommitBlock::decode(&block)?.sequence));
        }
        if commits.is_empty() {
            return Err(JournalError::NoCommits.into());
        }

        let n = commits.len();
        let mut newest = None;
        for i in 0..n {
            let expected = commits[i].1.wrapping_add(1);
            if commits[(i + 1) % n].1 != expected {
                if newest.is_some() {
                    error!("JOURNAL: unexpected gap in journal sequence");
                    return Err(JournalError::SequenceGap(commits[i].0).into());
                }
                newest = Some(i);
            }
        }
        let newest = newest.ok_or(JournalError::NoNewest)?;
        debug!("JOURNAL: newest commit in slot [{}]", commits[newest].0);

        self.defer.clear();
        let mut barrier = None;
        let mut i = newest + 1;
        loop {
            if i == n {
                i = 0;
            }
            let block = self.read_journal(commits[i].0).await?;
            let commit = CommitBlock::decode(&block)?;
            if commit.barrier {
                self.defer.committed.clear();
                barrier = Some(i);
            }
            if commit.alloc.count > 0 {
                debug!(
                    "JOURNAL: deferred {}@{}",
                    commit.alloc.count, commit.alloc.chunk
                );
                self.defer.committed.push(commit.alloc);
            }
            if i == newest {
                break;
            }
            i += 1;
        }

        let mut i = match barrier {
            Some(b) if b != newest => b + 1,
            _ => newest,
        };
        let newest_commit = loop {
            if i == n {
                i = 0;
            }
            let pos = commits[i].0;
            let block = self.read_journal(pos).await?;
            let commit = CommitBlock::decode(&block)?;
            let entries = commit.sectors.len() as u32;
            for (j, &sector) in commit.sectors.iter().enumerate() {
                let slot = (pos + jblocks - entries + j as u32) % jblocks;
                let data = self.read_journal(slot).await?;
                if CommitBlock::is_commit(&data) {
                    return Err(JournalError::DataIsCommit(slot).into());
                }
                info!("JOURNAL: write journal [{}] data to {:#x}", slot, sector);
                self.meta.write_through(sector, data).await?;
            }
            if i == newest {
                break commit;
            }
            i += 1;
        };

        self.image.journal_next = (commits[newest].0 + 1) % jblocks;
        self.image.sequence = newest_commit.sequence.wrapping_add(1) as u32;
        self.image.metadata.freechunks = newest_commit.metafree;
        if !self.layout.combined {
            self.image.snapdata.freechunks = newest_commit.snapfree;
        }
        self.sb_dirty = true;
        self.check_freespace().await?;
        info!(
            "JOURNAL: replay done, next slot {}, sequence {}",
            self.image.journal_next, self.image.sequence
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_commit_block_layout() {
        let commit = CommitBlock {
            sequence: 7,
            snapfree: 11,
            metafree: 13,
            alloc: AllocRange { chunk: 99, count: 3 },
            barrier: true,
            sectors: vec![0x40, 0x48],
        };
        let block = commit.encode(4096).unwrap();
        assert!(CommitBlock::is_commit(&block));
        assert_eq!(checksum(&block), 0);
        assert_eq!(LittleEndian::read_i32(&block[12..16]), 7);
        assert_eq!(LittleEndian::read_u32(&block[16..20]), 2);
        assert_eq!(LittleEndian::read_u64(&block[36..44]), 99);
        assert_eq!(LittleEndian::read_u32(&block[44..48]), 1 | (3 << 1));
        assert_eq!(LittleEndian::read_u64(&block[52..60]), 0x40);
        assert_eq!(CommitBlock::decode(&block).unwrap(), commit);
    }

    #[test]
    fn test_checksum_detects_damage() {
        let mut block = CommitBlock::default().encode(4096).unwrap();
        block[100] ^= 1;
        assert_ne!(checksum(&block), 0);
    }

    #[test]
    fn test_capacity() {
        assert_eq!(max_commit_blocks(4096), 505);
        assert_eq!(max_commit_blocks(512), 57);
    }
}
