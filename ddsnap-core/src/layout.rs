//! On-disk superblock and store geometry

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Cursor, Read, Write};

use crate::blockdev::SECTOR_BITS;
use crate::error::{Error, Result};

/// Magic number identifying a snapshot store
pub const SB_MAGIC: [u8; 8] = [b't', b'e', b's', b't', 0xdd, 0x07, 0x06, 0x04];
/// Sector holding the superblock
pub const SB_SECTOR: u64 = 8;
/// Sectors reserved for the superblock
pub const SB_SECTORS: u64 = 8;
/// Bytes occupied by the superblock on disk
pub const SB_SIZE: usize = 4096;

/// Superblock flag set while a server owns the store
pub const SB_BUSY: u64 = 2;

pub const MAX_SNAPSHOTS: usize = 64;
/// Bit value marking a snapshot whose exceptions were already released
pub const SNAPSHOT_SQUASHED: u8 = 64;

/// Smallest and largest supported metadata block sizes
pub const MIN_BLOCK_BITS: u32 = SECTOR_BITS;
pub const MAX_BLOCK_BITS: u32 = 16;
/// Largest supported snapshot chunk size
pub const MAX_CHUNK_BITS: u32 = 20;

/// Size of an on-disk snapshot record
const SNAPSHOT_RECORD: usize = 24;
/// Size of an on-disk allocation space image
const ALLOCSPACE_RECORD: usize = 48;

/// One entry of the superblock snapshot list
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SnapshotEntry {
    pub ctime: u32,
    pub tag: u32,
    /// Persistent use count, adjusted by USECOUNT requests
    pub usecount: u16,
    /// Bit position in sharing masks, or `SNAPSHOT_SQUASHED`
    pub bit: u8,
    pub prio: i8,
    /// Origin size in sectors when the snapshot was taken
    pub sectors: u64,
}

impl SnapshotEntry {
    pub fn is_squashed(&self) -> bool {
        self.bit == SNAPSHOT_SQUASHED
    }

    fn write_to<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        writer.write_u32::<LittleEndian>(self.ctime)?;
        writer.write_u32::<LittleEndian>(self.tag)?;
        writer.write_u16::<LittleEndian>(self.usecount)?;
        writer.write_u8(self.bit)?;
        writer.write_i8(self.prio)?;
        writer.write_u32::<LittleEndian>(0)?;
        writer.write_u64::<LittleEndian>(self.sectors)
    }

    fn read_from<R: Read>(reader: &mut R) -> io::Result<Self> {
        let ctime = reader.read_u32::<LittleEndian>()?;
        let tag = reader.read_u32::<LittleEndian>()?;
        let usecount = reader.read_u16::<LittleEndian>()?;
        let bit = reader.read_u8()?;
        let prio = reader.read_i8()?;
        reader.read_u32::<LittleEndian>()?;
        let sectors = reader.read_u64::<LittleEndian>()?;
        Ok(Self {
            ctime,
            tag,
            usecount,
            bit,
            prio,
            sectors,
        })
    }
}

/// Persistent state of one allocation space
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AllocSpaceImage {
    /// First sector of the allocation bitmap (on the metadata device)
    pub bitmap_base: u64,
    /// Chunks in the space; zero for a snapshot space combined with metadata
    pub chunks: u64,
    pub freechunks: u64,
    /// Allocation cursor, scans start here
    pub last_alloc: u64,
    pub bitmap_blocks: u64,
    pub allocsize_bits: u32,
}

impl AllocSpaceImage {
    fn write_to<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        writer.write_u64::<LittleEndian>(self.bitmap_base)?;
        writer.write_u64::<LittleEndian>(self.chunks)?;
        writer.write_u64::<LittleEndian>(self.freechunks)?;
        writer.write_u64::<LittleEndian>(self.last_alloc)?;
        writer.write_u64::<LittleEndian>(self.bitmap_blocks)?;
        writer.write_u32::<LittleEndian>(self.allocsize_bits)?;
        writer.write_u32::<LittleEndian>(0)
    }

    fn read_from<R: Read>(reader: &mut R) -> io::Result<Self> {
        let image = Self {
            bitmap_base: reader.read_u64::<LittleEndian>()?,
            chunks: reader.read_u64::<LittleEndian>()?,
            freechunks: reader.read_u64::<LittleEndian>()?,
            last_alloc: reader.read_u64::<LittleEndian>()?,
            bitmap_blocks: reader.read_u64::<LittleEndian>()?,
            allocsize_bits: reader.read_u32::<LittleEndian>()?,
        };
        reader.read_u32::<LittleEndian>()?;
        Ok(image)
    }
}

/// The persistent superblock
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskSuper {
    pub magic: [u8; 8],
    pub create_time: u64,
    /// Sector of the B-tree root node
    pub etree_root: u64,
    pub orgoffset: u64,
    pub orgsectors: u64,
    pub flags: u64,
    pub deleting: u64,
    /// Live snapshots in creation order
    pub snapshots: Vec<SnapshotEntry>,
    pub etree_levels: u32,
    /// First journal sector
    pub journal_base: u64,
    /// Next journal slot to write
    pub journal_next: u32,
    /// Journal slots, one metadata block each
    pub journal_size: u32,
    pub sequence: u32,
    pub metadata: AllocSpaceImage,
    pub snapdata: AllocSpaceImage,
}

impl Default for DiskSuper {
    fn default() -> Self {
        Self {
            magic: SB_MAGIC,
            create_time: 0,
            etree_root: 0,
            orgoffset: 0,
            orgsectors: 0,
            flags: 0,
            deleting: 0,
            snapshots: Vec::new(),
            etree_levels: 0,
            journal_base: 0,
            journal_next: 0,
            journal_size: 0,
            sequence: 0,
            metadata: AllocSpaceImage::default(),
            snapdata: AllocSpaceImage::default(),
        }
    }
}

impl DiskSuper {
    /// Encode into a full superblock-sized buffer
    pub fn to_bytes(&self) -> io::Result<Vec<u8>> {
        let mut writer = Cursor::new(Vec::with_capacity(SB_SIZE));
        writer.write_all(&self.magic)?;
        writer.write_u64::<LittleEndian>(self.create_time)?;
        writer.write_u64::<LittleEndian>(self.etree_root)?;
        writer.write_u64::<LittleEndian>(self.orgoffset)?;
        writer.write_u64::<LittleEndian>(self.orgsectors)?;
        writer.write_u64::<LittleEndian>(self.flags)?;
        writer.write_u64::<LittleEndian>(self.deleting)?;

        for i in 0..MAX_SNAPSHOTS {
            self.snapshots
                .get(i)
                .copied()
                .unwrap_or_default()
                .write_to(&mut writer)?;
        }

        writer.write_u32::<LittleEndian>(self.snapshots.len() as u32)?;
        writer.write_u32::<LittleEndian>(self.etree_levels)?;
        writer.write_i32::<LittleEndian>(self.journal_base as i32)?;
        writer.write_i32::<LittleEndian>(self.journal_next as i32)?;
        writer.write_i32::<LittleEndian>(self.journal_size as i32)?;
        writer.write_u32::<LittleEndian>(self.sequence)?;
        self.metadata.write_to(&mut writer)?;
        self.snapdata.write_to(&mut writer)?;

        let mut bytes = writer.into_inner();
        bytes.resize(SB_SIZE, 0);
        Ok(bytes)
    }

    /// Decode and validate the magic number
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut reader = Cursor::new(bytes);
        let mut magic = [0u8; 8];
        reader.read_exact(&mut magic)?;
        if magic != SB_MAGIC {
            return Err(Error::InvalidSuperblock(format!(
                "bad magic {:02x?}",
                magic
            )));
        }

        let create_time = reader.read_u64::<LittleEndian>()?;
        let etree_root = reader.read_u64::<LittleEndian>()?;
        let orgoffset = reader.read_u64::<LittleEndian>()?;
        let orgsectors = reader.read_u64::<LittleEndian>()?;
        let flags = reader.read_u64::<LittleEndian>()?;
        let deleting = reader.read_u64::<LittleEndian>()?;

        let mut slots = Vec::with_capacity(MAX_SNAPSHOTS);
        for _ in 0..MAX_SNAPSHOTS {
            slots.push(SnapshotEntry::read_from(&mut reader)?);
        }

        let count = reader.read_u32::<LittleEndian>()? as usize;
        if count > MAX_SNAPSHOTS {
            return Err(Error::InvalidSuperblock(format!(
                "{} snapshots listed",
                count
            )));
        }
        slots.truncate(count);

        let etree_levels = reader.read_u32::<LittleEndian>()?;
        let journal_base = reader.read_i32::<LittleEndian>()? as u32 as u64;
        let journal_next = reader.read_i32::<LittleEndian>()? as u32;
        let journal_size = reader.read_i32::<LittleEndian>()? as u32;
        let sequence = reader.read_u32::<LittleEndian>()?;
        let metadata = AllocSpaceImage::read_from(&mut reader)?;
        let snapdata = AllocSpaceImage::read_from(&mut reader)?;

        Ok(Self {
            magic,
            create_time,
            etree_root,
            orgoffset,
            orgsectors,
            flags,
            deleting,
            snapshots: slots,
            etree_levels,
            journal_base,
            journal_next,
            journal_size,
            sequence,
            metadata,
            snapdata,
        })
    }

    pub fn is_busy(&self) -> bool {
        self.flags & SB_BUSY != 0
    }

    /// Snapshot data shares the metadata allocation space
    pub fn is_combined(&self) -> bool {
        self.snapdata.chunks == 0
    }
}

/// Geometry derived from the superblock at startup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Layout {
    /// Metadata block size in bytes
    pub block_size: usize,
    pub metadata_bits: u32,
    pub snapdata_bits: u32,
    pub meta_chunk_sectors_bits: u32,
    pub snap_chunk_sectors_bits: u32,
    /// Index entries per B-tree node
    pub alloc_per_node: usize,
    /// Sector addresses that fit in one commit block
    pub max_commit_blocks: usize,
    pub combined: bool,
}

impl Layout {
    pub fn from_super(image: &DiskSuper) -> Result<Self> {
        let metadata_bits = image.metadata.allocsize_bits;
        if !(MIN_BLOCK_BITS..=MAX_BLOCK_BITS).contains(&metadata_bits) {
            return Err(Error::InvalidSuperblock(format!(
                "metadata block size bits {} out of range",
                metadata_bits
            )));
        }

        let combined = image.is_combined();
        let snapdata_bits = if combined {
            metadata_bits
        } else {
            image.snapdata.allocsize_bits
        };
        if !(MIN_BLOCK_BITS..=MAX_CHUNK_BITS).contains(&snapdata_bits) {
            return Err(Error::InvalidSuperblock(format!(
                "snapshot chunk size bits {} out of range",
                snapdata_bits
            )));
        }

        let block_size = 1usize << metadata_bits;
        Ok(Self {
            block_size,
            metadata_bits,
            snapdata_bits,
            meta_chunk_sectors_bits: metadata_bits - SECTOR_BITS,
            snap_chunk_sectors_bits: snapdata_bits - SECTOR_BITS,
            alloc_per_node: crate::btree::node::capacity(block_size),
            max_commit_blocks: crate::modules::journaling::max_commit_blocks(block_size),
            combined,
        })
    }

    /// Sector of a metadata chunk
    pub fn meta_sector(&self, chunk: u64) -> u64 {
        chunk << self.meta_chunk_sectors_bits
    }

    /// Metadata chunk holding a sector
    pub fn meta_chunk(&self, sector: u64) -> u64 {
        sector >> self.meta_chunk_sectors_bits
    }

    /// Chunks of the given size covering the superblock area
    pub fn reserved_head_chunks(chunk_sectors_bits: u32) -> u64 {
        let chunk_sectors = 1u64 << chunk_sectors_bits;
        (SB_SECTOR + SB_SECTORS + chunk_sectors - 1) >> chunk_sectors_bits
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> DiskSuper {
        DiskSuper {
            create_time: 1_200_000_000,
            etree_root: 0x98,
            orgsectors: 2048,
            flags: SB_BUSY,
            snapshots: vec![
                SnapshotEntry {
                    ctime: 5,
                    tag: 7,
                    usecount: 2,
                    bit: 0,
                    prio: -3,
                    sectors: 2048,
                },
                SnapshotEntry {
                    ctime: 6,
                    tag: 9,
                    bit: SNAPSHOT_SQUASHED,
                    ..Default::default()
                },
            ],
            etree_levels: 1,
            journal_base: 40,
            journal_next: 3,
            journal_size: 100,
            sequence: 103,
            metadata: AllocSpaceImage {
                bitmap_base: 16,
                chunks: 1024,
                freechunks: 900,
                last_alloc: 130,
                bitmap_blocks: 1,
                allocsize_bits: 12,
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_superblock_field_offsets() {
        let bytes = sample().to_bytes().unwrap();
        assert_eq!(bytes.len(), SB_SIZE);
        assert_eq!(&bytes[0..8], &SB_MAGIC);
        // Snapshot list starts after seven u64 fields, 24 bytes per slot
        assert_eq!(&bytes[56 + 4..56 + 8], &7u32.to_le_bytes());
        assert_eq!(bytes[56 + 24 + 10], SNAPSHOT_SQUASHED);
        let tail = 56 + MAX_SNAPSHOTS * SNAPSHOT_RECORD;
        assert_eq!(&bytes[tail..tail + 4], &2u32.to_le_bytes());
        assert_eq!(&bytes[tail + 8..tail + 12], &40i32.to_le_bytes());
        let meta = tail + 24;
        assert_eq!(&bytes[meta + 8..meta + 16], &1024u64.to_le_bytes());
        assert_eq!(meta + 2 * ALLOCSPACE_RECORD, 1712);
    }

    #[test]
    fn test_superblock_decodes_what_it_encodes() {
        let image = sample();
        let decoded = DiskSuper::from_bytes(&image.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded, image);
        assert!(decoded.is_busy());
        assert!(decoded.is_combined());
    }

    #[test]
    fn test_bad_magic_is_refused() {
        let mut bytes = sample().to_bytes().unwrap();
        bytes[0] = b'x';
        assert!(matches!(
            DiskSuper::from_bytes(&bytes),
            Err(Error::InvalidSuperblock(_))
        ));
    }

    #[test]
    fn test_layout_geometry() {
        let layout = Layout::from_super(&sample()).unwrap();
        assert_eq!(layout.block_size, 4096);
        assert_eq!(layout.meta_chunk_sectors_bits, 3);
        assert_eq!(layout.alloc_per_node, 255);
        assert_eq!(layout.max_commit_blocks, 505);
        assert!(layout.combined);
        assert_eq!(Layout::reserved_head_chunks(3), 2);
        assert_eq!(Layout::reserved_head_chunks(0), 16);
    }
}
