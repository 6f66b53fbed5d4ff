//! Exception leaf blocks
//!
//! A leaf covers a run of logical chunks starting at `base_chunk`. The map
//! grows upward from the header and holds one `{offset, rchunk}` entry per
//! chunk plus a sentinel; exceptions `{share, chunk}` are packed downward from
//! the end of the block. Map entry `i` owns the exceptions between its offset
//! and the offset of entry `i + 1`.

use byteorder::{ByteOrder, LittleEndian};

use super::{Target, TreeError};
use crate::snapmask::SnapshotMask;

pub const LEAF_MAGIC: u16 = 0x1eaf;

const HEADER: usize = 24;
const MAP_ENTRY: usize = 8;
const EXCEPTION: usize = 16;

/// One copy-on-write exception
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Exception {
    pub share: SnapshotMask,
    pub chunk: u64,
}

/// Typed view over a leaf block
pub struct Leaf<B> {
    buf: B,
}

impl<B: AsRef<[u8]>> Leaf<B> {
    pub fn new(buf: B) -> Self {
        Self { buf }
    }

    fn data(&self) -> &[u8] {
        self.buf.as_ref()
    }

    fn block_size(&self) -> usize {
        self.data().len()
    }

    pub fn magic(&self) -> u16 {
        LittleEndian::read_u16(&self.data()[0..2])
    }

    pub fn is_valid(&self) -> bool {
        self.magic() == LEAF_MAGIC
    }

    pub fn count(&self) -> usize {
        LittleEndian::read_u32(&self.data()[4..8]) as usize
    }

    pub fn base_chunk(&self) -> u64 {
        LittleEndian::read_u64(&self.data()[8..16])
    }

    fn map_at(index: usize) -> usize {
        HEADER + index * MAP_ENTRY
    }

    pub(crate) fn offset(&self, index: usize) -> usize {
        LittleEndian::read_u32(&self.data()[Self::map_at(index)..]) as usize
    }

    pub(crate) fn rchunk(&self, index: usize) -> u32 {
        LittleEndian::read_u32(&self.data()[Self::map_at(index) + 4..])
    }

    /// Logical chunk of map entry `index`
    pub fn chunk(&self, index: usize) -> u64 {
        self.base_chunk() + self.rchunk(index) as u64
    }

    fn exception_at(&self, at: usize) -> Exception {
        Exception {
            share: SnapshotMask::from_bits(LittleEndian::read_u64(&self.data()[at..])),
            chunk: LittleEndian::read_u64(&self.data()[at + 8..]),
        }
    }

    /// Exceptions recorded for map entry `index`
    pub fn exceptions(&self, index: usize) -> impl Iterator<Item = Exception> + '_ {
        let start = self.offset(index);
        let end = self.offset(index + 1);
        (start..end)
            .step_by(EXCEPTION)
            .map(move |at| self.exception_at(at))
    }

    /// Every `(logical chunk, exception)` pair in map order
    pub fn entries(&self) -> impl Iterator<Item = (u64, Exception)> + '_ {
        (0..self.count()).flat_map(move |i| {
            let chunk = self.chunk(i);
            self.exceptions(i).map(move |e| (chunk, e))
        })
    }

    fn find(&self, chunk: u64) -> Option<usize> {
        let base = self.base_chunk();
        if chunk < base {
            return None;
        }
        let target = chunk - base;
        (0..self.count()).find(|&i| self.rchunk(i) as u64 == target)
    }

    /// Bytes between the end of the map and the start of the exceptions
    pub fn freespace(&self) -> usize {
        self.offset(0)
            .saturating_sub(HEADER + (self.count() + 1) * MAP_ENTRY)
    }

    /// Bytes that a merge would have to move into another leaf
    pub fn payload(&self) -> usize {
        let count = self.count();
        count * MAP_ENTRY + (self.offset(count) - self.offset(0))
    }

    /// True when every live snapshot already has its own copy of `chunk`
    pub fn origin_chunk_unique(&self, chunk: u64, snapmask: SnapshotMask) -> bool {
        let Some(i) = self.find(chunk) else {
            return snapmask.is_empty();
        };
        let mut using = SnapshotMask::EMPTY;
        for exception in self.exceptions(i) {
            using |= exception.share;
        }
        (!using & snapmask).is_empty()
    }

    /// The exception holding `bit`'s copy of `chunk`, and whether nobody else shares it
    pub fn snapshot_exception(&self, chunk: u64, bit: u8) -> Option<(u64, bool)> {
        let i = self.find(chunk)?;
        let mask = SnapshotMask::bit(bit);
        self.exceptions(i)
            .find(|e| e.share.intersects(mask))
            .map(|e| (e.chunk, e.share == mask))
    }
}

impl<B: AsRef<[u8]> + AsMut<[u8]>> Leaf<B> {
    fn data_mut(&mut self) -> &mut [u8] {
        self.buf.as_mut()
    }

    /// Format an empty leaf covering chunks from `base_chunk`
    pub fn init(&mut self, base_chunk: u64) {
        let block_size = self.block_size();
        let data = self.data_mut();
        data.fill(0);
        LittleEndian::write_u16(&mut data[0..2], LEAF_MAGIC);
        LittleEndian::write_u64(&mut data[8..16], base_chunk);
        LittleEndian::write_u32(&mut data[HEADER..HEADER + 4], block_size as u32);
    }

    fn set_count(&mut self, count: usize) {
        LittleEndian::write_u32(&mut self.data_mut()[4..8], count as u32);
    }

    fn set_offset(&mut self, index: usize, offset: usize) {
        let at = Self::map_at(index);
        LittleEndian::write_u32(&mut self.data_mut()[at..at + 4], offset as u32);
    }

    fn set_rchunk(&mut self, index: usize, rchunk: u32) {
        let at = Self::map_at(index) + 4;
        LittleEndian::write_u32(&mut self.data_mut()[at..at + 4], rchunk);
    }

    fn set_exception(&mut self, at: usize, exception: Exception) {
        let data = self.data_mut();
        LittleEndian::write_u64(&mut data[at..at + 8], exception.share.bits());
        LittleEndian::write_u64(&mut data[at + 8..at + 16], exception.chunk);
    }

    /// Record `exception` as a new copy of `chunk` for the origin or one snapshot.
    ///
    /// For the origin the new exception is shared by every live snapshot that
    /// has no copy yet; for a snapshot it belongs to that snapshot alone and the
    /// snapshot's bit is taken off whichever exception it shared before.
    pub fn add_exception(
        &mut self,
        chunk: u64,
        exception: u64,
        target: Target,
        active: SnapshotMask,
    ) -> Result<(), TreeError> {
        let base = self.base_chunk();
        let rchunk = chunk
            .checked_sub(base)
            .and_then(|r| u32::try_from(r).ok())
            .ok_or(TreeError::OutOfLeafRange { chunk, base })?;

        let count = self.count();
        let exceptions = self.offset(0);
        let maptop = HEADER + (count + 1) * MAP_ENTRY;
        let free = exceptions.saturating_sub(maptop);

        let mut i = 0;
        while i < count && self.rchunk(i) < rchunk {
            i += 1;
        }

        let share;
        let ins;
        if i == count || self.rchunk(i) > rchunk {
            if free < EXCEPTION + MAP_ENTRY {
                return Err(TreeError::LeafFull);
            }
            ins = self.offset(i);
            let start = Self::map_at(i);
            self.data_mut().copy_within(start..maptop, start + MAP_ENTRY);
            self.set_offset(i, ins);
            self.set_rchunk(i, rchunk);
            self.set_count(count + 1);
            share = match target {
                Target::Origin => active,
                Target::Snapshot(bit) => SnapshotMask::bit(bit),
            };
        } else {
            if free < EXCEPTION {
                return Err(TreeError::LeafFull);
            }
            ins = self.offset(i);
            let end = self.offset(i + 1);
            share = match target {
                Target::Origin => {
                    let mut using = SnapshotMask::EMPTY;
                    for at in (ins..end).step_by(EXCEPTION) {
                        using |= self.exception_at(at).share;
                    }
                    !using & active
                }
                Target::Snapshot(bit) => {
                    let mask = SnapshotMask::bit(bit);
                    for at in (ins..end).step_by(EXCEPTION) {
                        let mut old = self.exception_at(at);
                        if old.share.intersects(mask) {
                            old.share.remove(bit);
                            self.set_exception(at, old);
                            break;
                        }
                    }
                    mask
                }
            };
        }

        if share.is_empty() {
            log::warn!("BTREE: chunk {} exception {} has no sharers", chunk, exception);
        }

        self.data_mut()
            .copy_within(exceptions..ins, exceptions - EXCEPTION);
        self.set_exception(
            ins - EXCEPTION,
            Exception {
                share,
                chunk: exception,
            },
        );
        for j in 0..=i {
            let offset = self.offset(j);
            self.set_offset(j, offset - EXCEPTION);
        }
        Ok(())
    }

    /// Move the upper half of this leaf into the empty block `other`.
    ///
    /// Returns the first logical chunk now covered by `other`.
    pub fn split(&mut self, other: &mut [u8]) -> u64 {
        let count = self.count();
        let nhead = (count + 1) / 2;
        let ntail = count - nhead;
        let splitpoint = self.chunk(nhead);

        let phead = self.offset(0);
        let ptail = self.offset(nhead);
        let tailsize = self.offset(count) - ptail;

        other[..HEADER].copy_from_slice(&self.data()[..HEADER]);
        let map_from = Self::map_at(nhead);
        let map_to = Self::map_at(count + 1);
        other[HEADER..HEADER + (map_to - map_from)]
            .copy_from_slice(&self.data()[map_from..map_to]);
        other[ptail..ptail + tailsize].copy_from_slice(&self.data()[ptail..ptail + tailsize]);
        Leaf::new(&mut *other).set_count(ntail);

        self.data_mut().copy_within(phead..ptail, phead + tailsize);
        self.set_count(nhead);
        for i in 0..=nhead {
            let offset = self.offset(i);
            self.set_offset(i, offset + tailsize);
        }
        self.set_rchunk(nhead, 0);
        splitpoint
    }

    /// Append every entry of `other`, which must cover higher chunks and fit
    /// in this leaf's free space.
    ///
    /// Both leaves must share a base chunk, as leaves produced by `split` do.
    pub fn merge(&mut self, other: &[u8]) {
        let other = Leaf::new(other);
        let nhead = self.count();
        let ntail = other.count();
        let tailsize = other.offset(ntail) - other.offset(0);

        let phead = self.offset(0);
        let ptail = self.offset(nhead);
        self.data_mut().copy_within(phead..ptail, phead - tailsize);
        for i in 0..=nhead {
            let offset = self.offset(i);
            self.set_offset(i, offset - tailsize);
        }

        let tail_start = other.offset(0);
        self.data_mut()[ptail - tailsize..ptail]
            .copy_from_slice(&other.data()[tail_start..tail_start + tailsize]);

        let dst = Self::map_at(nhead);
        let len = (ntail + 1) * MAP_ENTRY;
        self.data_mut()[dst..dst + len].copy_from_slice(&other.data()[HEADER..HEADER + len]);
        self.set_count(nhead + ntail);
    }

    /// Remove `mask` from every exception, dropping exceptions nobody shares
    /// any more and map entries left without exceptions.
    ///
    /// Returns whether any exception carried a bit of `mask`, and the
    /// snapshot-store chunks of the dropped exceptions.
    pub fn delete_snapshots(&mut self, mask: SnapshotMask) -> (bool, Vec<u64>) {
        let count = self.count();
        let mut any = false;
        let mut freed = Vec::new();
        let mut p = self.offset(count);
        let mut dest = p;

        for i in (0..count).rev() {
            let start = self.offset(i);
            while p > start {
                p -= EXCEPTION;
                let mut exception = self.exception_at(p);
                any |= exception.share.intersects(mask);
                exception.share &= !mask;
                if exception.share.is_empty() {
                    freed.push(exception.chunk);
                } else {
                    dest -= EXCEPTION;
                    self.set_exception(dest, exception);
                }
            }
            self.set_offset(i, dest);
        }

        let mut kept = 0;
        for i in 0..count {
            if self.offset(i) != self.offset(i + 1) {
                let (offset, rchunk) = (self.offset(i), self.rchunk(i));
                self.set_offset(kept, offset);
                self.set_rchunk(kept, rchunk);
                kept += 1;
            }
        }
        let sentinel = self.offset(count);
        self.set_offset(kept, sentinel);
        self.set_rchunk(kept, 0);
        self.set_count(kept);
        (any, freed)
    }
}
