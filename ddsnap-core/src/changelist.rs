//! Lists of chunks that differ between two snapshots
//!
//! A changelist file is a 20-byte header (`"rln"` magic padded to 8 bytes,
//! chunk size bits, source and target tags) followed by little-endian `u64`
//! chunk addresses and a `u64::MAX` terminator.

use std::io::{self, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use log::{debug, warn};
use thiserror::Error;

use crate::error::Result;
use crate::modules::snapshot::{SnapshotError, ORIGIN_TAG};
use crate::snapmask::SnapshotMask;
use crate::store::SnapStore;

pub const CHANGELIST_MAGIC: [u8; 8] = *b"rln\0\0\0\0\0";

const END_MARKER: u64 = u64::MAX;

/// Error type for changelist files
#[derive(Error, Debug)]
pub enum ChangelistError {
    #[error("not a changelist file (too short for header)")]
    ShortHeader,
    #[error("not a changelist file (wrong magic {0:?})")]
    BadMagic([u8; 8]),
    #[error("incomplete chunk address after {0} chunks")]
    Truncated(usize),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeList {
    pub chunksize_bits: u32,
    pub src_snap: u32,
    pub tgt_snap: u32,
    pub chunks: Vec<u64>,
}

impl ChangeList {
    pub fn new(chunksize_bits: u32, src_snap: u32, tgt_snap: u32) -> Self {
        Self {
            chunksize_bits,
            src_snap,
            tgt_snap,
            chunks: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Runs of consecutive chunks as `(first, count)`
    pub fn extents(&self) -> Vec<(u64, u64)> {
        let mut extents: Vec<(u64, u64)> = Vec::new();
        for &chunk in &self.chunks {
            match extents.last_mut() {
                Some((first, count)) if *first + *count == chunk => *count += 1,
                _ => extents.push((chunk, 1)),
            }
        }
        extents
    }

    pub fn write_to<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        writer.write_all(&CHANGELIST_MAGIC)?;
        writer.write_u32::<LittleEndian>(self.chunksize_bits)?;
        writer.write_u32::<LittleEndian>(self.src_snap)?;
        writer.write_u32::<LittleEndian>(self.tgt_snap)?;
        for &chunk in &self.chunks {
            writer.write_u64::<LittleEndian>(chunk)?;
        }
        writer.write_u64::<LittleEndian>(END_MARKER)?;
        writer.flush()
    }

    /// Read a changelist file. A file that ends without the terminator is
    /// accepted with a warning, since the chunks before it are still valid.
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let mut header = [0u8; 20];
        reader
            .read_exact(&mut header)
            .map_err(|_| ChangelistError::ShortHeader)?;
        let magic = *arrayref::array_ref![header, 0, 8];
        if magic[..3] != CHANGELIST_MAGIC[..3] {
            return Err(ChangelistError::BadMagic(magic).into());
        }
        let mut fields = &header[8..];
        let mut list = Self::new(
            fields.read_u32::<LittleEndian>()?,
            fields.read_u32::<LittleEndian>()?,
            fields.read_u32::<LittleEndian>()?,
        );

        let mut word = [0u8; 8];
        loop {
            let mut filled = 0;
            while filled < word.len() {
                match reader.read(&mut word[filled..])? {
                    0 => break,
                    n => filled += n,
                }
            }
            match filled {
                0 => {
                    warn!("CHANGELIST: file may be incomplete");
                    break;
                }
                8 => {}
                _ => return Err(ChangelistError::Truncated(list.len()).into()),
            }
            let chunk = u64::from_le_bytes(word);
            if chunk == END_MARKER {
                break;
            }
            list.chunks.push(chunk);
        }
        debug!(
            "CHANGELIST: read {} chunks for snapshots {} and {}",
            list.len(),
            list.src_snap,
            list.tgt_snap
        );
        Ok(list)
    }
}

impl SnapStore {
    /// Chunks whose contents in snapshot `tgt` differ from snapshot `src`
    /// (or from the origin when `src` is the origin tag), in chunk order.
    /// Chunks past the end of the target snapshot are left out.
    pub async fn gen_changelist(&mut self, src: u32, tgt: u32) -> Result<ChangeList> {
        let mask1 = if src == ORIGIN_TAG {
            SnapshotMask::ALL
        } else {
            let snap = self.snapshot(src).ok_or(SnapshotError::NotFound(src))?;
            if snap.is_squashed() {
                return Err(SnapshotError::Squashed(src).into());
            }
            SnapshotMask::bit(snap.bit)
        };
        let target = *self.snapshot(tgt).ok_or(SnapshotError::NotFound(tgt))?;
        if target.is_squashed() {
            return Err(SnapshotError::Squashed(tgt).into());
        }
        let mask2 = SnapshotMask::bit(target.bit);

        let shift = self.layout.snap_chunk_sectors_bits;
        let mut list = ChangeList::new(self.chunksize_bits(), src, tgt);
        let chunks = &mut list.chunks;
        self.traverse_tree_range(0, u64::MAX, |leaf| {
            for (chunk, exception) in leaf.entries() {
                if chunks.last() == Some(&chunk) {
                    continue;
                }
                let in_tgt = exception.share & mask2 == mask2;
                let in_src = exception.share & mask1 == mask1;
                if in_tgt != in_src && chunk << shift < target.sectors {
                    chunks.push(chunk);
                }
            }
        })
        .await?;
        debug!(
            "CHANGELIST: {} chunks changed between {} and {}",
            list.len(),
            src,
            tgt
        );
        Ok(list)
    }
}
