#![forbid(unsafe_code)]
//! Error types for xfsck.
//!
//! # Error Taxonomy
//!
//! xfsck uses a two-layer error model:
//!
//! | Layer | Type | Crate | Purpose |
//! |-------|------|-------|---------|
//! | Parsing | `ParseError` | `xfsck-types` | On-disk format violations detected during byte decoding |
//! | Run | `FsckError` | `xfsck-error` (this crate) | User-facing errors for the CLI and API consumers |
//!
//! `xfsck-error` is intentionally independent of `xfsck-types` to avoid
//! cyclic dependencies; defect variants carry raw `u64` inode and block
//! numbers. The conversion from `ParseError` to `FsckError::Parse` happens
//! in the crates that depend on both (`xfsck-block`, `xfsck-check`).
//!
//! Every error kind terminates the run with exit code 1; the distinction
//! between a [`Defect`] (the image is inconsistent) and the other variants
//! (the image could not be examined) exists only in the message text.

use thiserror::Error;

/// A consistency violation found in the image.
///
/// Exactly one defect is reported per run: checking stops at the first
/// violation. Variants carry raw inode/block numbers so this crate stays
/// free of dependencies on the parsing layer.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Defect {
    /// Inode 1 is missing, is not a directory, or is not its own parent.
    #[error("root directory does not exist ({reason})")]
    BadRootDirectory { reason: &'static str },

    /// A directory's first block lacks proper `.` / `..` entries.
    #[error("directory {inode} not properly formatted ({reason})")]
    DirectoryNotProperlyFormatted {
        inode: u64,
        reason: &'static str,
    },

    /// A directory entry names an inode number outside `[1, inode_count)`.
    #[error("directory {dir_inode} entry names out-of-range inode {entry_inode}")]
    BadDirectoryEntry { dir_inode: u64, entry_inode: u64 },

    /// An inode's type field is outside the valid range.
    #[error("bad inode {inode} (type {raw_type})")]
    BadInodeType { inode: u64, raw_type: u16 },

    /// A direct address slot names a block outside the data region.
    #[error("bad direct address in inode {inode} (block {block})")]
    BadDirectAddress { inode: u64, block: u64 },

    /// The indirect address, or an entry within the indirect block, names
    /// a block outside the data region.
    #[error("bad indirect address in inode {inode} (block {block})")]
    BadIndirectAddress { inode: u64, block: u64 },

    /// A data block is claimed by more than one address slot.
    #[error("address used more than once (block {block})")]
    BlockUsedMoreThanOnce { block: u64 },

    /// A directory inode is reachable through more than one entry.
    #[error("directory {inode} appears more than once in file system")]
    DirectoryMultiplyReferenced { inode: u64 },

    /// The traversal re-entered a directory it had already visited.
    #[error("directory {inode} forms a cycle")]
    DirectoryCycle { inode: u64 },

    /// A free inode is named by a directory entry.
    #[error("inode {inode} referred to in directory but marked free")]
    FreeInodeReferenced { inode: u64 },

    /// A live inode is not reachable from the root.
    #[error("inode {inode} marked in use but not found in a directory")]
    UnreferencedInode { inode: u64 },

    /// An inode's stored link count disagrees with the observed count.
    #[error("bad reference count for inode {inode} (stored {stored}, found {observed})")]
    LinkCountMismatch {
        inode: u64,
        stored: u16,
        observed: u32,
    },

    /// An address used by an inode is marked free in the bitmap.
    #[error("address used by inode {inode} but marked free in bitmap (block {block})")]
    AddressMarkedFree { inode: u64, block: u64 },

    /// The bitmap marks a block in use that no inode references.
    #[error("bitmap marks block {block} in use but it is not in use")]
    AllocatedBlockUnreferenced { block: u64 },
}

/// Unified error type for a checking run.
#[derive(Debug, Error)]
pub enum FsckError {
    /// Operating system I/O error (wraps `std::io::Error`).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The image geometry or a read range is structurally invalid
    /// (unaligned image, out-of-range block, implausible superblock).
    #[error("invalid image: {0}")]
    Format(String),

    /// Decode-layer failure surfaced to the user.
    ///
    /// Carries the string representation of a `ParseError` from
    /// `xfsck-types`; the boundary conversion keeps the diagnostic detail.
    #[error("parse error: {0}")]
    Parse(String),

    /// The image is inconsistent.
    #[error("{0}")]
    Defect(#[from] Defect),

    /// A violated internal invariant — a bug in the checker, not a
    /// property of the image.
    #[error("application error: {0}")]
    Internal(&'static str),
}

impl FsckError {
    /// Whether this error reports an inconsistent image (as opposed to an
    /// image that could not be examined).
    #[must_use]
    pub fn is_defect(&self) -> bool {
        matches!(self, Self::Defect(_))
    }
}

/// Result alias using `FsckError`.
pub type Result<T> = std::result::Result<T, FsckError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defect_display_is_single_line() {
        let cases: Vec<Defect> = vec![
            Defect::BadRootDirectory { reason: "not a directory" },
            Defect::DirectoryNotProperlyFormatted {
                inode: 7,
                reason: "missing '.'",
            },
            Defect::BadDirectoryEntry {
                dir_inode: 1,
                entry_inode: 9999,
            },
            Defect::BadInodeType { inode: 3, raw_type: 9 },
            Defect::BadDirectAddress { inode: 4, block: 2 },
            Defect::BadIndirectAddress { inode: 4, block: 1200 },
            Defect::BlockUsedMoreThanOnce { block: 60 },
            Defect::DirectoryMultiplyReferenced { inode: 5 },
            Defect::DirectoryCycle { inode: 5 },
            Defect::FreeInodeReferenced { inode: 6 },
            Defect::UnreferencedInode { inode: 8 },
            Defect::LinkCountMismatch {
                inode: 9,
                stored: 2,
                observed: 1,
            },
            Defect::AddressMarkedFree { inode: 10, block: 61 },
            Defect::AllocatedBlockUnreferenced { block: 62 },
        ];

        for defect in &cases {
            let text = defect.to_string();
            assert!(!text.contains('\n'), "multi-line message: {text:?}");
            assert!(!text.is_empty());
        }
    }

    #[test]
    fn classification() {
        let defect = FsckError::from(Defect::BlockUsedMoreThanOnce { block: 60 });
        assert!(defect.is_defect());

        let io = FsckError::Io(std::io::Error::other("test"));
        assert!(!io.is_defect());
        assert!(!FsckError::Format("bad".into()).is_defect());
        assert!(!FsckError::Internal("bug").is_defect());
    }

    #[test]
    fn display_formatting() {
        let err = FsckError::from(Defect::LinkCountMismatch {
            inode: 9,
            stored: 2,
            observed: 1,
        });
        assert_eq!(
            err.to_string(),
            "bad reference count for inode 9 (stored 2, found 1)"
        );

        let parse = FsckError::Parse("insufficient data: need 4 bytes at offset 0, got 2".into());
        assert!(parse.to_string().starts_with("parse error:"));
    }
}
