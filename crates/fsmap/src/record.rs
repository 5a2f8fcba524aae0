// SPDX-FileCopyrightText: Copyright © 2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! The normalized record model shared by every mapper
//!
//! Inode and extent kinds carry the stable numeric codes seeded into the
//! database type tables; downstream viewers join against those codes, so
//! they must never change.

use bitflags::bitflags;

/// Coalesced extents never exceed this many bytes, so that
/// `length * block_size` style products stay inside 64 bits downstream.
pub const MAX_EXTENT_LENGTH: u64 = 1 << 60;

/// What an inode is, as recorded in `inode_t.type`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InodeKind {
    File,
    Dir,
    Metadata,
    Symlink,
    Freespace,
}

impl InodeKind {
    /// Stable code in `inode_type_t`
    pub fn code(self) -> i64 {
        match self {
            InodeKind::File => 0,
            InodeKind::Dir => 1,
            InodeKind::Metadata => 2,
            InodeKind::Symlink => 3,
            InodeKind::Freespace => 4,
        }
    }
}

/// What an extent maps, as recorded in `extent_t.type`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtentKind {
    File,
    Dir,
    /// An interior node of a file's own mapping tree
    ExtentMap,
    Metadata,
    Xattr,
    Symlink,
    Freespace,
}

impl ExtentKind {
    /// Stable code in `extent_type_t`
    pub fn code(self) -> i64 {
        match self {
            ExtentKind::File => 0,
            ExtentKind::Dir => 1,
            ExtentKind::ExtentMap => 2,
            ExtentKind::Metadata => 3,
            ExtentKind::Xattr => 4,
            ExtentKind::Symlink => 5,
            ExtentKind::Freespace => 6,
        }
    }

    /// The extent kind that counts toward an inode's fragmentation stats
    pub fn primary_for(kind: InodeKind) -> ExtentKind {
        match kind {
            InodeKind::File => ExtentKind::File,
            InodeKind::Dir => ExtentKind::Dir,
            InodeKind::Metadata => ExtentKind::Metadata,
            InodeKind::Symlink => ExtentKind::Symlink,
            InodeKind::Freespace => ExtentKind::Freespace,
        }
    }
}

bitflags! {
    /// Extent attribute flags. These are the FIEMAP flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ExtentFlags: u32 {
        /// Last extent in the file
        const LAST = 0x0000_0001;
        /// Data location unknown
        const UNKNOWN = 0x0000_0002;
        /// Location still pending allocation; implies UNKNOWN
        const DELALLOC = 0x0000_0004;
        /// Data cannot be read while the filesystem is unmounted
        const ENCODED = 0x0000_0008;
        /// Data is encrypted by the filesystem
        const DATA_ENCRYPTED = 0x0000_0080;
        /// Extent offsets may not be block aligned
        const NOT_ALIGNED = 0x0000_0100;
        /// Data mixed with metadata; implies NOT_ALIGNED
        const DATA_INLINE = 0x0000_0200;
        /// Multiple files in one block; implies NOT_ALIGNED
        const DATA_TAIL = 0x0000_0400;
        /// Space allocated but unwritten (reads as zeroes)
        const UNWRITTEN = 0x0000_0800;
        /// Result merged from per-block mappings for efficiency
        const MERGED = 0x0000_1000;
        /// Space shared with other files
        const SHARED = 0x0000_2000;
    }
}

/// One physical extent owned by an inode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extent {
    pub ino: i64,
    /// Physical byte offset on the volume
    pub physical: u64,
    /// Logical byte offset within the owner, absent for metadata extents
    /// with no meaningful file position
    pub logical: Option<u64>,
    /// Length in bytes, `1..=MAX_EXTENT_LENGTH`
    pub length: u64,
    pub flags: ExtentFlags,
    pub kind: ExtentKind,
}

impl Extent {
    /// Inclusive physical end of the extent
    pub fn physical_end(&self) -> u64 {
        self.physical + self.length - 1
    }
}

/// Optional per-inode timestamps, in Unix seconds
#[derive(Debug, Clone, Copy, Default)]
pub struct InodeTimes {
    pub atime: Option<i64>,
    pub crtime: Option<i64>,
    pub ctime: Option<i64>,
    pub mtime: Option<i64>,
}
