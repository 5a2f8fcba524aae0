// SPDX-FileCopyrightText: Copyright © 2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! On-disk inode records

use zerocopy::little_endian::{U16, U32};
use zerocopy::{FromBytes, Immutable, KnownLayout, Unaligned};

use fsmap::{Error, InodeKind, InodeTimes, Result};

// Inode flags
pub const EXTENTS_FL: u32 = 0x0008_0000;
pub const INLINE_DATA_FL: u32 = 0x1000_0000;

const S_IFMT: u16 = 0xF000;
const S_IFREG: u16 = 0x8000;
const S_IFDIR: u16 = 0x4000;
const S_IFLNK: u16 = 0xA000;

/// The largest inode prefix the walk reads; everything past the creation
/// time is checksum seed material.
pub const INODE_PARSE_SIZE: usize = 160;

#[derive(Debug, FromBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
pub struct Ext4Inode {
    pub mode: U16,
    pub uid: U16,
    pub size_lo: U32,
    pub atime: U32,
    pub ctime: U32,
    pub mtime: U32,
    pub dtime: U32,
    pub gid: U16,
    pub links_count: U16,
    pub blocks_lo: U32,
    pub flags: U32,
    pub version: U32,
    /// Block map, extent tree root, or inline data
    pub block: [u8; 60],
    pub generation: U32,
    pub file_acl_lo: U32,
    pub size_high: U32,
    pub obso_faddr: U32,
    pub osd2: [u8; 12],
    pub extra_isize: U16,
    pub checksum_hi: U16,
    pub ctime_extra: U32,
    pub mtime_extra: U32,
    pub atime_extra: U32,
    pub crtime: U32,
    pub crtime_extra: U32,
    pub version_hi: U32,
    pub projid: U32,
}

impl Ext4Inode {
    /// Parse an inode record of `record_size` bytes. Short records (128
    /// bytes on old filesystems) leave the extra fields zeroed.
    pub fn parse(raw: &[u8], record_size: u64) -> Result<Self> {
        if (raw.len() as u64) < record_size {
            return Err(Error::corrupt("short inode record"));
        }
        let mut padded = [0u8; INODE_PARSE_SIZE];
        let take = raw.len().min(record_size as usize).min(INODE_PARSE_SIZE);
        padded[..take].copy_from_slice(&raw[..take]);
        let (inode, _) = Ext4Inode::read_from_prefix(padded.as_slice()).expect("fixed-size buffer");
        Ok(inode)
    }

    pub fn kind(&self) -> Option<InodeKind> {
        match self.mode.get() & S_IFMT {
            S_IFREG => Some(InodeKind::File),
            S_IFDIR => Some(InodeKind::Dir),
            S_IFLNK => Some(InodeKind::Symlink),
            _ => None,
        }
    }

    pub fn is_dir(&self) -> bool {
        self.mode.get() & S_IFMT == S_IFDIR
    }

    pub fn is_symlink(&self) -> bool {
        self.mode.get() & S_IFMT == S_IFLNK
    }

    pub fn size(&self) -> u64 {
        u64::from(self.size_high.get()) << 32 | u64::from(self.size_lo.get())
    }

    pub fn has_flag(&self, flag: u32) -> bool {
        self.flags.get() & flag != 0
    }

    /// Creation time is only stored when the record is large enough and
    /// the inode actually extends that far.
    pub fn times(&self, record_size: u64) -> InodeTimes {
        let crtime = if record_size > 128 && u64::from(self.extra_isize.get()) >= 24 {
            Some(i64::from(self.crtime.get()))
        } else {
            None
        };
        InodeTimes {
            atime: Some(i64::from(self.atime.get())),
            crtime,
            ctime: Some(i64::from(self.ctime.get())),
            mtime: Some(i64::from(self.mtime.get())),
        }
    }

    /// A fast symlink keeps its target inside the inode body.
    pub fn is_fast_symlink(&self) -> bool {
        self.is_symlink() && self.blocks_lo.get() == 0 && self.size() < 60
    }

    pub fn file_acl(&self) -> u64 {
        u64::from(self.file_acl_lo.get())
    }
}

/// One block group descriptor; the trailing 32 bytes only exist on
/// filesystems with the 64bit feature.
#[derive(Debug, FromBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
pub struct GroupDesc {
    pub block_bitmap_lo: U32,
    pub inode_bitmap_lo: U32,
    pub inode_table_lo: U32,
    pub free_blocks_count_lo: U16,
    pub free_inodes_count_lo: U16,
    pub used_dirs_count_lo: U16,
    pub flags: U16,
    pub exclude_bitmap_lo: U32,
    pub block_bitmap_csum_lo: U16,
    pub inode_bitmap_csum_lo: U16,
    pub itable_unused_lo: U16,
    pub checksum: U16,
    // Wide half
    pub block_bitmap_hi: U32,
    pub inode_bitmap_hi: U32,
    pub inode_table_hi: U32,
    pub free_blocks_count_hi: U16,
    pub free_inodes_count_hi: U16,
    pub used_dirs_count_hi: U16,
    pub itable_unused_hi: U16,
    pub exclude_bitmap_hi: U32,
    pub block_bitmap_csum_hi: U16,
    pub inode_bitmap_csum_hi: U16,
    pub reserved: U32,
}

/// A descriptor normalized to 64-bit block numbers
#[derive(Debug, Clone, Copy)]
pub struct Group {
    pub block_bitmap: u64,
    pub inode_bitmap: u64,
    pub inode_table: u64,
}

impl GroupDesc {
    /// Parse one descriptor of `desc_size` bytes (32 or 64).
    pub fn parse(raw: &[u8], desc_size: u64) -> Result<Group> {
        if (raw.len() as u64) < desc_size {
            return Err(Error::corrupt("short group descriptor"));
        }
        let mut padded = [0u8; 64];
        let take = raw.len().min(desc_size as usize).min(64);
        padded[..take].copy_from_slice(&raw[..take]);
        let (gd, _) = GroupDesc::read_from_prefix(padded.as_slice()).expect("fixed-size buffer");
        let wide = desc_size >= 64;
        let hi = |hi: U32| if wide { u64::from(hi.get()) << 32 } else { 0 };
        Ok(Group {
            block_bitmap: hi(gd.block_bitmap_hi) | u64::from(gd.block_bitmap_lo.get()),
            inode_bitmap: hi(gd.inode_bitmap_hi) | u64::from(gd.inode_bitmap_lo.get()),
            inode_table: hi(gd.inode_table_hi) | u64::from(gd.inode_table_lo.get()),
        })
    }
}
