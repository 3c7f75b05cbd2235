#![forbid(unsafe_code)]
//! On-disk structures of the xv6 filesystem.
//!
//! The layout is fixed and compiled in: 512-byte blocks, a boot block at
//! block 0, the superblock at block 1, then the log, the inode table, the
//! free-block bitmap, and finally the data region. All multi-byte fields
//! are little-endian.

use serde::{Deserialize, Serialize};
use xfsck_types::{
    ensure_slice, read_fixed, read_le_u16, read_le_u32, BlockNumber, InodeNumber, ParseError,
};

/// Filesystem block size in bytes.
pub const BLOCK_SIZE: usize = 512;
/// Block number of the superblock (block 0 is the boot block).
pub const SUPERBLOCK_BLOCK: u64 = 1;
/// Number of direct block addresses in an inode.
pub const NDIRECT: usize = 12;
/// Number of block addresses held by one indirect block.
pub const NINDIRECT: usize = BLOCK_SIZE / 4;
/// Size of one on-disk inode record.
pub const INODE_SIZE: usize = 64;
/// Inode records per block.
pub const INODES_PER_BLOCK: usize = BLOCK_SIZE / INODE_SIZE;
/// Size of one directory entry record.
pub const DIRENT_SIZE: usize = 16;
/// Directory entries per block.
pub const DIRENTS_PER_BLOCK: usize = BLOCK_SIZE / DIRENT_SIZE;
/// Maximum file name length within a directory entry.
pub const NAME_SIZE: usize = 14;
/// Bits held by one bitmap block.
pub const BITS_PER_BITMAP_BLOCK: u64 = (BLOCK_SIZE as u64) * 8;

/// The superblock record stored in block 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Superblock {
    /// Total image size in blocks.
    pub size: u32,
    /// Number of data blocks.
    pub nblocks: u32,
    /// Number of inodes.
    pub ninodes: u32,
    /// Number of log blocks.
    pub nlog: u32,
    /// First block of the log.
    pub logstart: u32,
    /// First block of the inode table.
    pub inodestart: u32,
    /// First block of the free-block bitmap.
    pub bmapstart: u32,
}

impl Superblock {
    /// Parse the superblock from the contents of block 1.
    pub fn parse_from_block(block: &[u8]) -> Result<Self, ParseError> {
        Ok(Self {
            size: read_le_u32(block, 0x00)?,
            nblocks: read_le_u32(block, 0x04)?,
            ninodes: read_le_u32(block, 0x08)?,
            nlog: read_le_u32(block, 0x0C)?,
            logstart: read_le_u32(block, 0x10)?,
            inodestart: read_le_u32(block, 0x14)?,
            bmapstart: read_le_u32(block, 0x18)?,
        })
    }
}

/// File type stored in an inode's type field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InodeType {
    Free,
    Directory,
    RegularFile,
    Device,
}

impl InodeType {
    /// Decode the raw type field. `None` means the field is corrupt.
    #[must_use]
    pub fn from_raw(raw: u16) -> Option<Self> {
        match raw {
            0 => Some(Self::Free),
            1 => Some(Self::Directory),
            2 => Some(Self::RegularFile),
            3 => Some(Self::Device),
            _ => None,
        }
    }
}

/// One on-disk inode record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskInode {
    /// Raw type field (0 = free, 1 = directory, 2 = file, 3 = device).
    pub type_raw: u16,
    /// Major device number (devices only).
    pub major: u16,
    /// Minor device number (devices only).
    pub minor: u16,
    /// Stored link count.
    pub nlink: u16,
    /// File size in bytes.
    pub size: u32,
    /// Direct addresses plus one trailing indirect address.
    pub addrs: [u32; NDIRECT + 1],
}

impl DiskInode {
    /// Parse one inode record from a 64-byte slice.
    pub fn parse_from_bytes(bytes: &[u8]) -> Result<Self, ParseError> {
        if bytes.len() < INODE_SIZE {
            return Err(ParseError::InsufficientData {
                needed: INODE_SIZE,
                offset: 0,
                actual: bytes.len(),
            });
        }

        let mut addrs = [0_u32; NDIRECT + 1];
        for (i, slot) in addrs.iter_mut().enumerate() {
            *slot = read_le_u32(bytes, 12 + i * 4)?;
        }

        Ok(Self {
            type_raw: read_le_u16(bytes, 0)?,
            major: read_le_u16(bytes, 2)?,
            minor: read_le_u16(bytes, 4)?,
            nlink: read_le_u16(bytes, 6)?,
            size: read_le_u32(bytes, 8)?,
            addrs,
        })
    }

    /// Decoded type, or `None` for an out-of-range type field.
    #[must_use]
    pub fn file_type(&self) -> Option<InodeType> {
        InodeType::from_raw(self.type_raw)
    }

    /// The direct address slots.
    #[must_use]
    pub fn direct(&self) -> &[u32] {
        &self.addrs[..NDIRECT]
    }

    /// The single indirect address slot.
    #[must_use]
    pub fn indirect(&self) -> u32 {
        self.addrs[NDIRECT]
    }
}

/// One directory entry record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntry {
    /// Inode number; 0 marks an unused slot.
    pub inum: u16,
    /// NUL-padded name bytes.
    pub name: [u8; NAME_SIZE],
}

impl DirEntry {
    /// Parse the entry at `index` within a directory data block.
    pub fn parse_at(block: &[u8], index: usize) -> Result<Self, ParseError> {
        let offset = index
            .checked_mul(DIRENT_SIZE)
            .ok_or(ParseError::InvalidField {
                field: "dirent_index",
                reason: "overflow",
            })?;
        let bytes = ensure_slice(block, offset, DIRENT_SIZE)?;
        Ok(Self {
            inum: read_le_u16(bytes, 0)?,
            name: read_fixed::<NAME_SIZE>(bytes, 2)?,
        })
    }

    /// Whether this slot is unused (terminates the in-block scan).
    #[must_use]
    pub fn is_unused(&self) -> bool {
        self.inum == 0
    }

    /// Name bytes up to the first NUL.
    #[must_use]
    pub fn name_bytes(&self) -> &[u8] {
        let end = self
            .name
            .iter()
            .position(|b| *b == 0)
            .unwrap_or(NAME_SIZE);
        &self.name[..end]
    }

    /// The name as a UTF-8 string (lossy).
    #[must_use]
    pub fn name_str(&self) -> String {
        String::from_utf8_lossy(self.name_bytes()).into_owned()
    }

    /// Whether this is the `.` entry.
    #[must_use]
    pub fn is_dot(&self) -> bool {
        self.name_bytes() == b"."
    }

    /// Whether this is the `..` entry.
    #[must_use]
    pub fn is_dotdot(&self) -> bool {
        self.name_bytes() == b".."
    }
}

/// Derived image geometry, computed once from the superblock.
///
/// Table sizing follows the xv6 `mkfs` convention (`count / per_block + 1`
/// rather than a true ceiling division): on exact multiples `mkfs` leaves
/// one spare block, and the checker must agree with it about where the
/// data region starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Layout {
    /// Total image size in blocks (superblock `size`).
    pub total_blocks: u64,
    /// Number of inodes.
    pub inode_count: u64,
    /// First block of the inode table.
    pub inode_table_start: u64,
    /// Number of inode-table blocks.
    pub inode_table_blocks: u64,
    /// First block of the free-block bitmap.
    pub bitmap_start: u64,
    /// Number of bitmap blocks.
    pub bitmap_blocks: u64,
    /// Size of the metadata region; data blocks start here.
    pub metadata_blocks: u64,
}

impl Layout {
    /// Derive the image geometry from a decoded superblock.
    ///
    /// Rejects geometry the checker cannot work with: an empty inode
    /// table, a metadata region that does not fit the image, stored table
    /// starts that disagree with the image size, or an inode count large
    /// enough that a directory could overflow its direct blocks (the
    /// traversal never scans a directory's indirect block, so such an
    /// image would be silently mis-checked).
    pub fn from_superblock(sb: &Superblock) -> Result<Self, ParseError> {
        let total_blocks = u64::from(sb.size);
        let inode_count = u64::from(sb.ninodes);

        if inode_count == 0 {
            return Err(ParseError::InvalidField {
                field: "ninodes",
                reason: "must be non-zero",
            });
        }
        let direct_dir_capacity = (NDIRECT * DIRENTS_PER_BLOCK) as u64;
        if inode_count > direct_dir_capacity {
            return Err(ParseError::InvalidField {
                field: "ninodes",
                reason: "exceeds direct directory capacity",
            });
        }

        let inode_table_blocks = inode_count / (INODES_PER_BLOCK as u64) + 1;
        let bitmap_blocks = total_blocks / BITS_PER_BITMAP_BLOCK + 1;

        // Boot block + superblock + log + inode table + bitmap.
        let metadata_blocks = 2 + u64::from(sb.nlog) + inode_table_blocks + bitmap_blocks;
        if metadata_blocks >= total_blocks {
            return Err(ParseError::InvalidField {
                field: "size",
                reason: "metadata region does not fit the image",
            });
        }

        let inode_table_start = u64::from(sb.inodestart);
        let bitmap_start = u64::from(sb.bmapstart);
        if inode_table_start < 2
            || inode_table_start.saturating_add(inode_table_blocks) > total_blocks
        {
            return Err(ParseError::InvalidField {
                field: "inodestart",
                reason: "inode table outside the image",
            });
        }
        if bitmap_start < 2 || bitmap_start.saturating_add(bitmap_blocks) > total_blocks {
            return Err(ParseError::InvalidField {
                field: "bmapstart",
                reason: "bitmap outside the image",
            });
        }

        Ok(Self {
            total_blocks,
            inode_count,
            inode_table_start,
            inode_table_blocks,
            bitmap_start,
            bitmap_blocks,
            metadata_blocks,
        })
    }

    /// Whether `block` falls strictly within the data region.
    #[must_use]
    pub fn is_data_block(&self, block: BlockNumber) -> bool {
        block.0 >= self.metadata_blocks && block.0 < self.total_blocks
    }

    /// Number of blocks in the data region.
    #[must_use]
    pub fn data_block_count(&self) -> u64 {
        self.total_blocks - self.metadata_blocks
    }

    /// The inode-table block holding inode `inum`.
    #[must_use]
    pub fn inode_table_block(&self, inum: InodeNumber) -> BlockNumber {
        BlockNumber(self.inode_table_start + inum.0 / (INODES_PER_BLOCK as u64))
    }

    /// Byte offset of inode `inum` within its inode-table block.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)] // modulo INODES_PER_BLOCK always fits
    pub fn inode_offset_in_block(&self, inum: InodeNumber) -> usize {
        (inum.0 % (INODES_PER_BLOCK as u64)) as usize * INODE_SIZE
    }

    /// The bitmap block holding the allocation bit for `block`, plus the
    /// byte index and mask of that bit within the bitmap block.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)] // byte index < BLOCK_SIZE
    pub fn bitmap_position(&self, block: BlockNumber) -> (BlockNumber, usize, u8) {
        let bitmap_block = BlockNumber(self.bitmap_start + block.0 / BITS_PER_BITMAP_BLOCK);
        let bit = block.0 % BITS_PER_BITMAP_BLOCK;
        let byte = (bit / 8) as usize;
        let mask = 1_u8 << (bit % 8);
        (bitmap_block, byte, mask)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_superblock() -> Superblock {
        // The stock xv6 geometry: 1000 blocks, 200 inodes, 30 log blocks.
        // inode table = 200/8 + 1 = 26 blocks at block 32,
        // bitmap = 1000/4096 + 1 = 1 block at block 58, nmeta = 59.
        Superblock {
            size: 1000,
            nblocks: 941,
            ninodes: 200,
            nlog: 30,
            logstart: 2,
            inodestart: 32,
            bmapstart: 58,
        }
    }

    fn superblock_bytes(sb: &Superblock) -> Vec<u8> {
        let mut block = vec![0_u8; BLOCK_SIZE];
        for (i, field) in [
            sb.size,
            sb.nblocks,
            sb.ninodes,
            sb.nlog,
            sb.logstart,
            sb.inodestart,
            sb.bmapstart,
        ]
        .into_iter()
        .enumerate()
        {
            block[i * 4..i * 4 + 4].copy_from_slice(&field.to_le_bytes());
        }
        block
    }

    #[test]
    fn superblock_round_trip() {
        let sb = sample_superblock();
        let parsed = Superblock::parse_from_block(&superblock_bytes(&sb)).expect("parse");
        assert_eq!(parsed, sb);
    }

    #[test]
    fn superblock_short_block() {
        assert!(matches!(
            Superblock::parse_from_block(&[0_u8; 16]),
            Err(ParseError::InsufficientData { .. })
        ));
    }

    #[test]
    fn layout_matches_mkfs_geometry() {
        let layout = Layout::from_superblock(&sample_superblock()).expect("layout");
        assert_eq!(layout.inode_table_blocks, 26);
        assert_eq!(layout.bitmap_blocks, 1);
        assert_eq!(layout.metadata_blocks, 59);
        assert_eq!(layout.data_block_count(), 941);

        assert!(!layout.is_data_block(BlockNumber(58)));
        assert!(layout.is_data_block(BlockNumber(59)));
        assert!(layout.is_data_block(BlockNumber(999)));
        assert!(!layout.is_data_block(BlockNumber(1000)));
    }

    #[test]
    fn layout_rejects_bad_geometry() {
        let mut sb = sample_superblock();
        sb.ninodes = 0;
        assert!(Layout::from_superblock(&sb).is_err());

        let mut sb = sample_superblock();
        sb.size = 40; // metadata alone needs 59 blocks
        assert!(Layout::from_superblock(&sb).is_err());

        let mut sb = sample_superblock();
        sb.inodestart = 990; // table of 26 blocks runs past the image
        assert!(Layout::from_superblock(&sb).is_err());

        let mut sb = sample_superblock();
        sb.bmapstart = 1000;
        assert!(Layout::from_superblock(&sb).is_err());
    }

    #[test]
    fn layout_rejects_directory_overflow_risk() {
        // 12 direct blocks * 32 entries = 384; more inodes than that could
        // push a directory into its (unscanned) indirect block.
        let mut sb = sample_superblock();
        sb.ninodes = 385;
        sb.size = 4000;
        assert_eq!(
            Layout::from_superblock(&sb),
            Err(ParseError::InvalidField {
                field: "ninodes",
                reason: "exceeds direct directory capacity",
            })
        );
    }

    #[test]
    fn inode_addressing() {
        let layout = Layout::from_superblock(&sample_superblock()).expect("layout");
        assert_eq!(layout.inode_table_block(InodeNumber(0)), BlockNumber(32));
        assert_eq!(layout.inode_table_block(InodeNumber(7)), BlockNumber(32));
        assert_eq!(layout.inode_table_block(InodeNumber(8)), BlockNumber(33));
        assert_eq!(layout.inode_offset_in_block(InodeNumber(0)), 0);
        assert_eq!(layout.inode_offset_in_block(InodeNumber(1)), 64);
        assert_eq!(layout.inode_offset_in_block(InodeNumber(9)), 64);
    }

    #[test]
    fn bitmap_addressing() {
        let layout = Layout::from_superblock(&sample_superblock()).expect("layout");
        let (blk, byte, mask) = layout.bitmap_position(BlockNumber(0));
        assert_eq!((blk, byte, mask), (BlockNumber(58), 0, 0x01));

        let (blk, byte, mask) = layout.bitmap_position(BlockNumber(59));
        assert_eq!((blk, byte, mask), (BlockNumber(58), 7, 0x08));

        // Bit 4096 rolls over into the next bitmap block.
        let mut sb = sample_superblock();
        sb.size = 5000;
        sb.nblocks = 4939;
        let layout = Layout::from_superblock(&sb).expect("layout");
        let (blk, byte, mask) = layout.bitmap_position(BlockNumber(4096));
        assert_eq!((blk, byte, mask), (BlockNumber(59), 0, 0x01));
    }

    fn inode_bytes(inode: &DiskInode) -> Vec<u8> {
        let mut bytes = vec![0_u8; INODE_SIZE];
        bytes[0..2].copy_from_slice(&inode.type_raw.to_le_bytes());
        bytes[2..4].copy_from_slice(&inode.major.to_le_bytes());
        bytes[4..6].copy_from_slice(&inode.minor.to_le_bytes());
        bytes[6..8].copy_from_slice(&inode.nlink.to_le_bytes());
        bytes[8..12].copy_from_slice(&inode.size.to_le_bytes());
        for (i, addr) in inode.addrs.iter().enumerate() {
            bytes[12 + i * 4..16 + i * 4].copy_from_slice(&addr.to_le_bytes());
        }
        bytes
    }

    #[test]
    fn inode_round_trip() {
        let mut addrs = [0_u32; NDIRECT + 1];
        addrs[0] = 59;
        addrs[NDIRECT] = 61;
        let inode = DiskInode {
            type_raw: 2,
            major: 0,
            minor: 0,
            nlink: 1,
            size: 700,
            addrs,
        };
        let parsed = DiskInode::parse_from_bytes(&inode_bytes(&inode)).expect("parse");
        assert_eq!(parsed, inode);
        assert_eq!(parsed.file_type(), Some(InodeType::RegularFile));
        assert_eq!(parsed.direct()[0], 59);
        assert_eq!(parsed.indirect(), 61);
    }

    #[test]
    fn inode_rejects_short_record() {
        assert!(matches!(
            DiskInode::parse_from_bytes(&[0_u8; 63]),
            Err(ParseError::InsufficientData { .. })
        ));
    }

    #[test]
    fn inode_type_decoding() {
        assert_eq!(InodeType::from_raw(0), Some(InodeType::Free));
        assert_eq!(InodeType::from_raw(1), Some(InodeType::Directory));
        assert_eq!(InodeType::from_raw(2), Some(InodeType::RegularFile));
        assert_eq!(InodeType::from_raw(3), Some(InodeType::Device));
        assert_eq!(InodeType::from_raw(4), None);
        assert_eq!(InodeType::from_raw(u16::MAX), None);
    }

    #[test]
    fn dirent_parsing() {
        let mut block = vec![0_u8; BLOCK_SIZE];
        block[0..2].copy_from_slice(&1_u16.to_le_bytes());
        block[2] = b'.';
        block[16..18].copy_from_slice(&1_u16.to_le_bytes());
        block[18] = b'.';
        block[19] = b'.';
        block[32..34].copy_from_slice(&5_u16.to_le_bytes());
        block[34..43].copy_from_slice(b"hello.txt");

        let dot = DirEntry::parse_at(&block, 0).expect("entry 0");
        assert!(dot.is_dot() && !dot.is_dotdot());
        assert_eq!(dot.inum, 1);

        let dotdot = DirEntry::parse_at(&block, 1).expect("entry 1");
        assert!(dotdot.is_dotdot());

        let file = DirEntry::parse_at(&block, 2).expect("entry 2");
        assert_eq!(file.inum, 5);
        assert_eq!(file.name_str(), "hello.txt");
        assert!(!file.is_unused());

        let unused = DirEntry::parse_at(&block, 3).expect("entry 3");
        assert!(unused.is_unused());

        // Index past the block's entry capacity.
        assert!(DirEntry::parse_at(&block, DIRENTS_PER_BLOCK).is_err());
    }
}
