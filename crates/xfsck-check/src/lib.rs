#![forbid(unsafe_code)]
//! The checking engine.
//!
//! A single depth-first traversal from the root directory builds two
//! reference tables (observed directory references per inode, observed
//! address-slot references per data block); two global sweeps then compare
//! the stored metadata — inode link counts and the free-block bitmap —
//! against those tables. Checking is fail-fast: the first violation is
//! reported and the run stops.

use std::collections::HashSet;
use std::path::Path;
use tracing::{debug, trace};
use xfsck_block::{BlockBuf, BlockDevice, ByteBlockDevice, FileByteDevice};
use xfsck_error::{Defect, FsckError, Result};
use xfsck_ondisk::{
    DirEntry, DiskInode, InodeType, Layout, Superblock, BLOCK_SIZE, DIRENTS_PER_BLOCK, NINDIRECT,
    SUPERBLOCK_BLOCK,
};
use xfsck_types::{read_le_u32, u64_to_usize, BlockNumber, InodeNumber, ParseError};

fn parse_error(err: ParseError) -> FsckError {
    FsckError::Parse(err.to_string())
}

// ── Reference tables ────────────────────────────────────────────────────────

/// Ground-truth reference counters built by the traversal.
///
/// `inode_refs[i]` counts directory entries naming inode `i`; the block
/// table counts address slots naming each data block, indexed by
/// `block − metadata_blocks`. Sized once from the decoded layout and owned
/// by the single checking run.
#[derive(Debug)]
pub struct RefCounts {
    inode_refs: Vec<u32>,
    block_refs: Vec<u32>,
    first_data_block: u64,
}

impl RefCounts {
    /// Allocate zeroed tables sized from the layout.
    pub fn new(layout: &Layout) -> Result<Self> {
        let inode_slots = u64_to_usize(layout.inode_count, "inode_count").map_err(parse_error)?;
        let block_slots =
            u64_to_usize(layout.data_block_count(), "data_block_count").map_err(parse_error)?;
        Ok(Self {
            inode_refs: vec![0; inode_slots],
            block_refs: vec![0; block_slots],
            first_data_block: layout.metadata_blocks,
        })
    }

    /// Record one directory reference to `inum`; returns the new count.
    pub fn bump_inode(&mut self, inum: InodeNumber) -> Option<u32> {
        let slot = self
            .inode_refs
            .get_mut(usize::try_from(inum.0).ok()?)?;
        *slot += 1;
        Some(*slot)
    }

    /// Observed directory references to `inum`.
    #[must_use]
    pub fn inode_refs(&self, inum: InodeNumber) -> Option<u32> {
        self.inode_refs.get(usize::try_from(inum.0).ok()?).copied()
    }

    /// Record one address-slot reference to data block `block`; returns
    /// the new count.
    pub fn bump_block(&mut self, block: BlockNumber) -> Option<u32> {
        let idx = usize::try_from(block.0.checked_sub(self.first_data_block)?).ok()?;
        let slot = self.block_refs.get_mut(idx)?;
        *slot += 1;
        Some(*slot)
    }

    /// Observed address-slot references to data block `block`.
    #[must_use]
    pub fn block_refs(&self, block: BlockNumber) -> Option<u32> {
        let idx = usize::try_from(block.0.checked_sub(self.first_data_block)?).ok()?;
        self.block_refs.get(idx).copied()
    }
}

// ── Check context ───────────────────────────────────────────────────────────

/// The decoded layout plus the device all reads flow through.
struct CheckContext<'d> {
    dev: &'d dyn BlockDevice,
    layout: Layout,
}

impl CheckContext<'_> {
    fn read_block(&self, block: BlockNumber) -> Result<BlockBuf> {
        self.dev.read_block(block)
    }

    /// Fetch one inode record by number.
    ///
    /// No bounds validation on `inum` happens here; callers stay within
    /// `[0, inode_count)`.
    fn read_inode(&self, inum: InodeNumber) -> Result<DiskInode> {
        let buf = self.read_block(self.layout.inode_table_block(inum))?;
        let offset = self.layout.inode_offset_in_block(inum);
        let record = buf.as_slice().get(offset..).unwrap_or_default();
        DiskInode::parse_from_bytes(record).map_err(parse_error)
    }

    /// Whether `block` is marked allocated in the free-block bitmap.
    ///
    /// Re-reads the bitmap block on every call; at this tool's scale a
    /// cache buys nothing.
    fn is_allocated(&self, block: BlockNumber) -> Result<bool> {
        let (bitmap_block, byte, mask) = self.layout.bitmap_position(block);
        let buf = self.read_block(bitmap_block)?;
        let byte = buf
            .as_slice()
            .get(byte)
            .copied()
            .ok_or(FsckError::Internal("bitmap byte index out of block"))?;
        Ok(byte & mask != 0)
    }
}

// ── Directory traversal ─────────────────────────────────────────────────────

struct Traversal<'a, 'd> {
    cx: &'a CheckContext<'d>,
    refs: &'a mut RefCounts,
    /// Directory inodes already entered; re-entry means a cycle.
    visited: HashSet<u64>,
}

impl Traversal<'_, '_> {
    /// Recursive walk of one directory: counts the directory's own data
    /// blocks, validates `.`/`..` in the first block, and follows every
    /// live entry. `.` and `..` themselves are never counted or followed.
    fn walk_directory(&mut self, dir: &DiskInode, inum: InodeNumber) -> Result<()> {
        if dir.file_type() != Some(InodeType::Directory) {
            return Err(FsckError::Internal(
                "directory traversal entered with a non-directory inode",
            ));
        }
        if !self.visited.insert(inum.0) {
            return Err(Defect::DirectoryCycle { inode: inum.0 }.into());
        }
        debug!(inode = inum.0, "walking directory");

        for (i, &addr) in dir.direct().iter().enumerate() {
            if addr == 0 {
                break;
            }
            let block = BlockNumber(u64::from(addr));
            if !self.cx.layout.is_data_block(block) {
                return Err(Defect::BadDirectAddress {
                    inode: inum.0,
                    block: block.0,
                }
                .into());
            }
            self.refs
                .bump_block(block)
                .ok_or(FsckError::Internal("block reference index out of table"))?;

            let buf = self.cx.read_block(block)?;
            let mut index = 0;
            if i == 0 {
                self.check_dot_entries(buf.as_slice(), inum)?;
                index = 2;
            }
            while index < DIRENTS_PER_BLOCK {
                let entry = DirEntry::parse_at(buf.as_slice(), index).map_err(parse_error)?;
                index += 1;
                if entry.is_unused() {
                    break;
                }
                self.follow_entry(inum, &entry)?;
            }
        }

        // The directory's indirect block is deliberately not scanned: the
        // layout decoder rejects images whose inode count exceeds the
        // direct-block entry capacity, so no directory can overflow.
        Ok(())
    }

    /// First two entries of a directory's first block must be `.`
    /// pointing back at the directory itself and an entry named `..`.
    fn check_dot_entries(&self, block: &[u8], inum: InodeNumber) -> Result<()> {
        let dot = DirEntry::parse_at(block, 0).map_err(parse_error)?;
        if !dot.is_dot() || u64::from(dot.inum) != inum.0 {
            return Err(Defect::DirectoryNotProperlyFormatted {
                inode: inum.0,
                reason: "first entry is not '.' pointing at itself",
            }
            .into());
        }
        let dotdot = DirEntry::parse_at(block, 1).map_err(parse_error)?;
        if !dotdot.is_dotdot() {
            return Err(Defect::DirectoryNotProperlyFormatted {
                inode: inum.0,
                reason: "second entry is not '..'",
            }
            .into());
        }
        Ok(())
    }

    fn follow_entry(&mut self, dir_inum: InodeNumber, entry: &DirEntry) -> Result<()> {
        trace!(dir = dir_inum.0, inode = entry.inum, name = %entry.name_str(), "entry");

        let child = InodeNumber(u64::from(entry.inum));
        if child.0 >= self.cx.layout.inode_count {
            return Err(Defect::BadDirectoryEntry {
                dir_inode: dir_inum.0,
                entry_inode: child.0,
            }
            .into());
        }

        let inode = self.cx.read_inode(child)?;
        let child_type = match inode.file_type() {
            Some(ty @ (InodeType::Directory | InodeType::RegularFile | InodeType::Device)) => ty,
            Some(InodeType::Free) | None => {
                return Err(Defect::BadInodeType {
                    inode: child.0,
                    raw_type: inode.type_raw,
                }
                .into());
            }
        };

        let count = self
            .refs
            .bump_inode(child)
            .ok_or(FsckError::Internal("inode reference index out of table"))?;
        if child_type == InodeType::Directory {
            if count > 1 {
                return Err(Defect::DirectoryMultiplyReferenced { inode: child.0 }.into());
            }
            self.walk_directory(&inode, child)
        } else {
            self.validate_file_blocks(&inode, child)
        }
    }

    /// Walk a file or device inode's direct and indirect addresses,
    /// counting every address slot; a block claimed twice is fatal.
    fn validate_file_blocks(&mut self, inode: &DiskInode, inum: InodeNumber) -> Result<()> {
        if !matches!(
            inode.file_type(),
            Some(InodeType::RegularFile | InodeType::Device)
        ) {
            return Err(FsckError::Internal(
                "file validator entered with a non-file inode",
            ));
        }

        for &addr in inode.direct() {
            if addr == 0 {
                return Ok(());
            }
            let block = BlockNumber(u64::from(addr));
            if !self.cx.layout.is_data_block(block) {
                return Err(Defect::BadDirectAddress {
                    inode: inum.0,
                    block: block.0,
                }
                .into());
            }
            self.count_data_block(block)?;
        }

        let indirect = inode.indirect();
        if indirect == 0 {
            return Ok(());
        }
        let indirect_block = BlockNumber(u64::from(indirect));
        if !self.cx.layout.is_data_block(indirect_block) {
            return Err(Defect::BadIndirectAddress {
                inode: inum.0,
                block: indirect_block.0,
            }
            .into());
        }
        self.count_data_block(indirect_block)?;

        let buf = self.cx.read_block(indirect_block)?;
        for slot in 0..NINDIRECT {
            let addr = read_le_u32(buf.as_slice(), slot * 4).map_err(parse_error)?;
            if addr == 0 {
                break;
            }
            let block = BlockNumber(u64::from(addr));
            if !self.cx.layout.is_data_block(block) {
                return Err(Defect::BadIndirectAddress {
                    inode: inum.0,
                    block: block.0,
                }
                .into());
            }
            self.count_data_block(block)?;
        }
        Ok(())
    }

    fn count_data_block(&mut self, block: BlockNumber) -> Result<()> {
        let count = self
            .refs
            .bump_block(block)
            .ok_or(FsckError::Internal("block reference index out of table"))?;
        if count > 1 {
            return Err(Defect::BlockUsedMoreThanOnce { block: block.0 }.into());
        }
        Ok(())
    }
}

// ── Root validation ─────────────────────────────────────────────────────────

/// Inode 1 must be a directory that is its own parent: entry index 1 of
/// its first data block must be named `..` and resolve back to inode 1.
fn check_root(cx: &CheckContext<'_>) -> Result<DiskInode> {
    let root = cx.read_inode(InodeNumber::ROOT)?;
    if root.file_type() != Some(InodeType::Directory) {
        return Err(Defect::BadRootDirectory {
            reason: "inode 1 is not a directory",
        }
        .into());
    }

    let first = BlockNumber(u64::from(root.direct()[0]));
    if !cx.layout.is_data_block(first) {
        return Err(Defect::BadRootDirectory {
            reason: "first data block outside the data region",
        }
        .into());
    }
    let buf = cx.read_block(first)?;
    let parent = DirEntry::parse_at(buf.as_slice(), 1).map_err(parse_error)?;
    if !parent.is_dotdot() || parent.inum != 1 {
        return Err(Defect::BadRootDirectory {
            reason: "root is not its own parent",
        }
        .into());
    }
    Ok(root)
}

// ── Global sweeps ───────────────────────────────────────────────────────────

/// Sweep 1: inodes 2 through `inode_count − 1` (inode 0 is reserved,
/// inode 1 was validated as the root before traversal).
fn sweep_inodes(cx: &CheckContext<'_>, refs: &RefCounts) -> Result<()> {
    debug!(inodes = cx.layout.inode_count, "inode sweep");
    for i in 2..cx.layout.inode_count {
        let inum = InodeNumber(i);
        let inode = cx.read_inode(inum)?;
        let observed = refs
            .inode_refs(inum)
            .ok_or(FsckError::Internal("inode reference index out of table"))?;

        let ty = match inode.file_type() {
            Some(InodeType::Free) => {
                if observed > 0 {
                    return Err(Defect::FreeInodeReferenced { inode: i }.into());
                }
                continue;
            }
            Some(ty) => ty,
            None => {
                return Err(Defect::BadInodeType {
                    inode: i,
                    raw_type: inode.type_raw,
                }
                .into());
            }
        };

        if observed == 0 {
            return Err(Defect::UnreferencedInode { inode: i }.into());
        }
        if ty == InodeType::Directory && observed > 1 {
            return Err(Defect::DirectoryMultiplyReferenced { inode: i }.into());
        }
        if u32::from(inode.nlink) != observed {
            return Err(Defect::LinkCountMismatch {
                inode: i,
                stored: inode.nlink,
                observed,
            }
            .into());
        }

        for &addr in inode.direct() {
            if addr == 0 {
                break;
            }
            let block = BlockNumber(u64::from(addr));
            if !cx.is_allocated(block)? {
                return Err(Defect::AddressMarkedFree {
                    inode: i,
                    block: block.0,
                }
                .into());
            }
        }
        let indirect = inode.indirect();
        if indirect != 0 && !cx.is_allocated(BlockNumber(u64::from(indirect)))? {
            return Err(Defect::AddressMarkedFree {
                inode: i,
                block: u64::from(indirect),
            }
            .into());
        }
    }
    Ok(())
}

/// Sweep 2: every bitmap-allocated block in the data region must have
/// been referenced by some address slot.
fn sweep_bitmap(cx: &CheckContext<'_>, refs: &RefCounts) -> Result<()> {
    debug!(
        first = cx.layout.metadata_blocks,
        last = cx.layout.total_blocks - 1,
        "bitmap sweep"
    );
    for b in cx.layout.metadata_blocks..cx.layout.total_blocks {
        let block = BlockNumber(b);
        if cx.is_allocated(block)? {
            let observed = refs
                .block_refs(block)
                .ok_or(FsckError::Internal("block reference index out of table"))?;
            if observed == 0 {
                return Err(Defect::AllocatedBlockUnreferenced { block: b }.into());
            }
        }
    }
    Ok(())
}

// ── Entry points ────────────────────────────────────────────────────────────

/// Check a filesystem image exposed as a block device.
///
/// Returns `Ok(())` on a fully consistent image; otherwise the first
/// violation found, classified per [`FsckError`].
pub fn check_device(dev: &dyn BlockDevice) -> Result<()> {
    let block_size = dev.block_size();
    if block_size as usize != BLOCK_SIZE {
        return Err(FsckError::Format(format!(
            "unsupported block size {block_size} (expected {BLOCK_SIZE})"
        )));
    }

    let sb_buf = dev.read_block(BlockNumber(SUPERBLOCK_BLOCK))?;
    let sb = Superblock::parse_from_block(sb_buf.as_slice()).map_err(parse_error)?;
    let layout = Layout::from_superblock(&sb).map_err(parse_error)?;
    if layout.total_blocks > dev.block_count() {
        return Err(FsckError::Format(format!(
            "superblock claims {} blocks but the image holds {}",
            layout.total_blocks,
            dev.block_count()
        )));
    }
    debug!(
        total_blocks = layout.total_blocks,
        inodes = layout.inode_count,
        metadata_blocks = layout.metadata_blocks,
        "decoded layout"
    );

    let cx = CheckContext { dev, layout };
    let mut refs = RefCounts::new(&layout)?;

    let root = check_root(&cx)?;
    Traversal {
        cx: &cx,
        refs: &mut refs,
        visited: HashSet::new(),
    }
    .walk_directory(&root, InodeNumber::ROOT)?;

    sweep_inodes(&cx, &refs)?;
    sweep_bitmap(&cx, &refs)?;
    Ok(())
}

/// Open an image file read-only and check it.
pub fn check_image_at_path(path: impl AsRef<Path>) -> Result<()> {
    let file = FileByteDevice::open(path)?;
    let dev = ByteBlockDevice::new(file, BLOCK_SIZE as u32)?;
    check_device(&dev)
}
