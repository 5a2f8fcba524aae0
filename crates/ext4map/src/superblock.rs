// SPDX-FileCopyrightText: Copyright © 2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! EXT4 superblock handling

use uuid::Uuid;
use zerocopy::little_endian::{U16, U32, U64};
use zerocopy::{FromBytes, Immutable, KnownLayout, Unaligned};

use fsmap::{Error, Result};

/// Superblock location and magic
pub const SUPERBLOCK_OFFSET: u64 = 1024;
pub const MAGIC: u16 = 0xEF53;

/// Reserved inode numbers
pub const BAD_INO: u64 = 1;
pub const ROOT_INO: u64 = 2;
pub const USR_QUOTA_INO: u64 = 3;
pub const GRP_QUOTA_INO: u64 = 4;
pub const BOOT_LOADER_INO: u64 = 5;
pub const RESIZE_INO: u64 = 7;
pub const JOURNAL_INO: u64 = 8;
pub const FIRST_NON_RESERVED_INO: u64 = 11;

pub const NAME_LEN: u32 = 255;

// Feature flags consulted by the walk
pub const FEATURE_COMPAT_HAS_JOURNAL: u32 = 0x0004;
pub const FEATURE_COMPAT_RESIZE_INODE: u32 = 0x0010;
pub const FEATURE_INCOMPAT_FILETYPE: u32 = 0x0002;
pub const FEATURE_INCOMPAT_META_BG: u32 = 0x0010;
pub const FEATURE_INCOMPAT_64BIT: u32 = 0x0080;
pub const FEATURE_RO_COMPAT_SPARSE_SUPER: u32 = 0x0001;

/// EXT4 superblock definition (as seen in the kernel), through the
/// overhead-clusters field; the tail of the 1024-byte block holds nothing
/// the walk needs.
#[derive(Debug, FromBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
pub struct Ext4Super {
    pub inodes_count: U32,
    pub blocks_count_lo: U32,
    pub r_blocks_count_lo: U32,
    pub free_blocks_count_lo: U32,
    pub free_inodes_count: U32,
    pub first_data_block: U32,
    pub log_block_size: U32,
    pub log_cluster_size: U32,
    pub blocks_per_group: U32,
    pub clusters_per_group: U32,
    pub inodes_per_group: U32,
    pub m_time: U32,
    pub w_time: U32,
    pub mnt_count: U16,
    pub max_mnt_count: U16,
    pub magic: U16,
    pub state: U16,
    pub errors: U16,
    pub minor_rev_level: U16,
    pub lastcheck: U32,
    pub checkinterval: U32,
    pub creator_os: U32,
    pub rev_level: U32,
    pub def_resuid: U16,
    pub def_resgid: U16,
    pub first_ino: U32,
    pub inode_size: U16,
    pub block_group_nr: U16,
    pub feature_compat: U32,
    pub feature_incompat: U32,
    pub feature_ro_compat: U32,
    pub uuid: [u8; 16],
    pub volume_name: [u8; 16],
    pub last_mounted: [u8; 64],
    pub algorithm_usage_bitmap: U32,
    pub prealloc_blocks: u8,
    pub prealloc_dir_blocks: u8,
    pub reserved_gdt_blocks: U16,
    pub journal_uuid: [u8; 16],
    pub journal_inum: U32,
    pub journal_dev: U32,
    pub last_orphan: U32,
    pub hash_seed: [U32; 4],
    pub def_hash_version: u8,
    pub jnl_backup_type: u8,
    pub desc_size: U16,
    pub default_mount_opts: U32,
    pub first_meta_bg: U32,
    pub mkfs_time: U32,
    pub jnl_blocks: [U32; 17],
    pub blocks_count_hi: U32,
    pub r_blocks_count_hi: U32,
    pub free_blocks_count_hi: U32,
    pub min_extra_isize: U16,
    pub want_extra_isize: U16,
    pub flags: U32,
    pub raid_stride: U16,
    pub mmp_update_interval: U16,
    pub mmp_block: U64,
    pub raid_stripe_width: U32,
    pub log_groups_per_flex: u8,
    pub checksum_type: u8,
    pub reserved_pad: U16,
    pub kbytes_written: U64,
    pub snapshot_inum: U32,
    pub snapshot_id: U32,
    pub snapshot_r_blocks_count: U64,
    pub snapshot_list: U32,
    pub error_count: U32,
    pub first_error_time: U32,
    pub first_error_ino: U32,
    pub first_error_block: U64,
    pub first_error_func: [u8; 32],
    pub first_error_line: U32,
    pub last_error_time: U32,
    pub last_error_ino: U32,
    pub last_error_line: U32,
    pub last_error_block: U64,
    pub last_error_func: [u8; 32],
    pub mount_opts: [u8; 64],
    pub usr_quota_inum: U32,
    pub grp_quota_inum: U32,
    pub overhead_clusters: U32,
}

impl Ext4Super {
    /// Parse and sanity-check a superblock from the 1024 bytes at offset
    /// 1024 of the volume.
    pub fn parse(buf: &[u8]) -> Result<Self> {
        let (sb, _) = Ext4Super::read_from_prefix(buf)
            .map_err(|_| Error::NotAFileSystem("short ext4 superblock".into()))?;
        if sb.magic.get() != MAGIC {
            return Err(Error::NotAFileSystem(format!(
                "bad ext4 magic {:#06x}",
                sb.magic.get()
            )));
        }
        if sb.log_block_size.get() > 6 {
            return Err(Error::NotAFileSystem(format!(
                "implausible block size log {}",
                sb.log_block_size.get()
            )));
        }
        if sb.blocks_per_group.get() == 0 || sb.inodes_per_group.get() == 0 {
            return Err(Error::NotAFileSystem("zero-sized block groups".into()));
        }
        log::debug!(
            "ext4 volume: uuid={} label=\"{}\" blocks={} groups={}",
            sb.uuid(),
            sb.label(),
            sb.blocks_count(),
            sb.group_count()
        );
        Ok(sb)
    }

    pub fn uuid(&self) -> String {
        Uuid::from_bytes(self.uuid).hyphenated().to_string()
    }

    pub fn label(&self) -> String {
        String::from_utf8_lossy(&self.volume_name)
            .trim_end_matches('\0')
            .to_string()
    }

    pub fn block_size(&self) -> u64 {
        1024 << self.log_block_size.get()
    }

    pub fn cluster_size(&self) -> u64 {
        1024 << self.log_cluster_size.get()
    }

    pub fn has_incompat(&self, flag: u32) -> bool {
        self.feature_incompat.get() & flag != 0
    }

    pub fn has_ro_compat(&self, flag: u32) -> bool {
        self.feature_ro_compat.get() & flag != 0
    }

    pub fn has_compat(&self, flag: u32) -> bool {
        self.feature_compat.get() & flag != 0
    }

    pub fn blocks_count(&self) -> u64 {
        let hi = if self.has_incompat(FEATURE_INCOMPAT_64BIT) {
            u64::from(self.blocks_count_hi.get())
        } else {
            0
        };
        hi << 32 | u64::from(self.blocks_count_lo.get())
    }

    pub fn free_blocks_count(&self) -> u64 {
        let hi = if self.has_incompat(FEATURE_INCOMPAT_64BIT) {
            u64::from(self.free_blocks_count_hi.get())
        } else {
            0
        };
        hi << 32 | u64::from(self.free_blocks_count_lo.get())
    }

    /// Number of block groups
    pub fn group_count(&self) -> u64 {
        let data_blocks = self.blocks_count() - u64::from(self.first_data_block.get());
        data_blocks.div_ceil(u64::from(self.blocks_per_group.get()))
    }

    /// First block of a group
    pub fn group_first_block(&self, group: u64) -> u64 {
        u64::from(self.first_data_block.get()) + group * u64::from(self.blocks_per_group.get())
    }

    /// Block count of a group; the last group may be partial.
    pub fn group_block_count(&self, group: u64) -> u64 {
        let bpg = u64::from(self.blocks_per_group.get());
        (self.blocks_count() - self.group_first_block(group)).min(bpg)
    }

    /// On-disk inode record size; revision 0 filesystems fixed it at 128.
    pub fn inode_record_size(&self) -> u64 {
        if self.rev_level.get() == 0 {
            128
        } else {
            u64::from(self.inode_size.get())
        }
    }

    /// Group descriptor size: 32 bytes unless the 64bit feature widened it.
    pub fn descriptor_size(&self) -> u64 {
        let sz = u64::from(self.desc_size.get());
        if self.has_incompat(FEATURE_INCOMPAT_64BIT) && sz >= 64 {
            sz
        } else {
            32
        }
    }

    /// Blocks occupied by the group descriptor table
    pub fn gdt_blocks(&self) -> u64 {
        (self.group_count() * self.descriptor_size()).div_ceil(self.block_size())
    }

    /// Blocks occupied by one group's slice of the inode table
    pub fn itable_blocks(&self) -> u64 {
        (u64::from(self.inodes_per_group.get()) * self.inode_record_size())
            .div_ceil(self.block_size())
    }

    /// Whether `group` carries a superblock + descriptor backup. Without
    /// sparse_super every group does; with it only groups 0, 1 and powers
    /// of 3, 5 and 7.
    pub fn group_has_super(&self, group: u64) -> bool {
        if !self.has_ro_compat(FEATURE_RO_COMPAT_SPARSE_SUPER) {
            return true;
        }
        if group <= 1 {
            return true;
        }
        [3u64, 5, 7].iter().any(|&base| {
            let mut n = base;
            while n < group {
                n *= base;
            }
            n == group
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sparse_super_placement() {
        let mut raw = vec![0u8; 1024];
        raw[56] = 0x53;
        raw[57] = 0xEF;
        // 4 KiB blocks, 32768 blocks per group
        raw[24] = 2;
        raw[32..36].copy_from_slice(&32768u32.to_le_bytes());
        raw[40..44].copy_from_slice(&8192u32.to_le_bytes());
        raw[4..8].copy_from_slice(&(32768u32 * 50).to_le_bytes());
        // sparse_super
        raw[100..104].copy_from_slice(&1u32.to_le_bytes());
        let sb = Ext4Super::parse(&raw).unwrap();

        let with_super: Vec<u64> = (0..50).filter(|&g| sb.group_has_super(g)).collect();
        assert_eq!(with_super, vec![0, 1, 3, 5, 7, 9, 25, 27, 49]);
    }

    #[test]
    fn bad_magic_is_not_a_filesystem() {
        let raw = vec![0u8; 1024];
        assert!(matches!(
            Ext4Super::parse(&raw),
            Err(Error::NotAFileSystem(_))
        ));
    }

    #[test]
    fn geometry_accessors() {
        let mut raw = vec![0u8; 1024];
        raw[56] = 0x53;
        raw[57] = 0xEF;
        raw[24] = 0; // 1 KiB blocks
        raw[20..24].copy_from_slice(&1u32.to_le_bytes()); // first_data_block
        raw[32..36].copy_from_slice(&8192u32.to_le_bytes());
        raw[40..44].copy_from_slice(&2048u32.to_le_bytes());
        raw[4..8].copy_from_slice(&20000u32.to_le_bytes());
        raw[88..90].copy_from_slice(&256u16.to_le_bytes()); // inode_size
        raw[76..80].copy_from_slice(&1u32.to_le_bytes()); // rev_level
        let sb = Ext4Super::parse(&raw).unwrap();

        assert_eq!(sb.block_size(), 1024);
        assert_eq!(sb.group_count(), 3);
        assert_eq!(sb.group_first_block(1), 8193);
        assert_eq!(sb.group_block_count(2), 20000 - 1 - 2 * 8192);
        assert_eq!(sb.inode_record_size(), 256);
        assert_eq!(sb.itable_blocks(), 512);
    }
}
