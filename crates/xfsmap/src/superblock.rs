// SPDX-FileCopyrightText: Copyright © 2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! XFS superblock parsing and volume geometry
//!
//! All multi-byte fields are big-endian. Block numbers come in two
//! encodings: segmented filesystem block numbers (allocation group in the
//! high bits, group-relative block in the low `agblklog` bits) and plain
//! per-group offsets; inode numbers embed the same split plus the inode's
//! slot within its block.

use uuid::Uuid;
use zerocopy::big_endian::{I64, U16, U32, U64};
use zerocopy::{FromBytes, Immutable, KnownLayout, Unaligned};

use fsmap::{Error, Result};

/// 'XFSB'
pub const MAGIC: u32 = 0x5846_5342;
pub const MAX_LABEL_LEN: usize = 12;
pub const NAME_LEN: u32 = 255;

/// A null filesystem block / inode sentinel
pub const NULL_FSBLOCK: u64 = u64::MAX;
pub const NULL_INO: u64 = u64::MAX;
/// A null per-group block number
pub const NULL_AGBLOCK: u32 = u32::MAX;

// Version-5 feature bits
const FEAT_RO_COMPAT_FINOBT: u32 = 1 << 0;
const FEAT_RO_COMPAT_RMAPBT: u32 = 1 << 1;
const FEAT_RO_COMPAT_REFLINK: u32 = 1 << 2;
const FEAT_INCOMPAT_FTYPE: u32 = 1 << 0;
// Version-4 ftype lives in features2
const VERSION_MOREBITS: u16 = 0x8000;
const VERSION2_FTYPE: u32 = 0x0200;

/// Free blocks withheld per allocation group for the free list
pub const AGFL_RESERVE: u64 = 6;
/// Largest valid inode number
pub const MAX_INUMBER: u64 = (1 << 56) - 1;

/// XFS superblock structure, mapping the on-disk format directly.
#[derive(Debug, FromBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
pub struct XfsSuper {
    /// Magic number, must contain 'XFSB'
    pub magicnum: U32,
    /// Filesystem block size in bytes
    pub blocksize: U32,
    /// Number of blocks in the data subvolume
    pub dblocks: U64,
    /// Number of blocks in the realtime subvolume
    pub rblocks: U64,
    /// Number of realtime extents
    pub rextents: U64,
    /// Filesystem UUID
    pub uuid: [u8; 16],
    /// Starting block of the log, if internal
    pub logstart: U64,
    /// Root directory inode number
    pub rootino: I64,
    /// Realtime bitmap inode
    pub rbmino: I64,
    /// Realtime summary inode
    pub rsumino: I64,
    /// Realtime extent size in blocks
    pub rextsize: U32,
    /// Blocks per allocation group
    pub agblocks: U32,
    /// Number of allocation groups
    pub agcount: U32,
    /// Number of realtime bitmap blocks
    pub rbmblocks: U32,
    /// Number of log blocks
    pub logblocks: U32,
    /// Filesystem version number
    pub versionnum: U16,
    /// Sector size in bytes
    pub sectsize: U16,
    /// Inode size in bytes
    pub inodesize: U16,
    /// Inodes per block
    pub inopblock: U16,
    /// Volume label
    pub fname: [u8; MAX_LABEL_LEN],
    /// Log2 of blocksize
    pub blocklog: u8,
    /// Log2 of sector size
    pub sectlog: u8,
    /// Log2 of inode size
    pub inodelog: u8,
    /// Log2 of inodes per block
    pub inopblog: u8,
    /// Log2 of blocks per allocation group
    pub agblklog: u8,
    /// Log2 of realtime extents
    pub rextslog: u8,
    /// Filesystem being created flag
    pub inprogress: u8,
    /// Max % of the filesystem usable for inodes
    pub imax_pct: u8,
    /// Number of allocated inodes
    pub icount: U64,
    /// Number of free inodes
    pub ifree: U64,
    /// Number of free data blocks
    pub fdblocks: U64,
    /// Number of free realtime extents
    pub frextents: U64,
    /// User quota inode
    pub uquotino: I64,
    /// Group quota inode
    pub gquotino: I64,
    /// Quota flags
    pub qflags: U16,
    /// Misc flags
    pub flags: u8,
    /// Shared version number
    pub shared_vn: u8,
    /// Inode chunk alignment
    pub inoalignmt: U32,
    /// Stripe or RAID unit
    pub unit: U32,
    /// Stripe or RAID width
    pub width: U32,
    /// Log2 of directory block size, in filesystem blocks
    pub dirblklog: u8,
    /// Log2 of the log sector size
    pub logsectlog: u8,
    /// Log sector size
    pub logsectsize: U16,
    /// Log stripe unit size
    pub logsunit: U32,
    /// Version 2 feature flags
    pub features2: U32,
    /// Mis-aligned copy of features2 left by old kernels
    pub bad_features2: U32,
    /// Compatible feature flags
    pub features_compat: U32,
    /// Read-only compatible feature flags
    pub features_ro_compat: U32,
    /// Incompatible feature flags
    pub features_incompat: U32,
    /// Log incompatible feature flags
    pub features_log_incompat: U32,
    /// Superblock checksum
    pub crc: U32,
    /// Sparse inode chunk alignment
    pub spino_align: U32,
    /// Project quota inode
    pub pquotino: I64,
    /// Last write sequence number
    pub lsn: I64,
    /// Metadata UUID
    pub meta_uuid: [u8; 16],
}

impl XfsSuper {
    pub fn parse(buf: &[u8]) -> Result<Self> {
        let (sb, _) = XfsSuper::read_from_prefix(buf)
            .map_err(|_| Error::NotAFileSystem("short XFS superblock".into()))?;
        if sb.magicnum.get() != MAGIC {
            return Err(Error::NotAFileSystem(format!(
                "bad XFS magic {:#010x}",
                sb.magicnum.get()
            )));
        }
        let version = sb.version();
        if !(1..=5).contains(&version) {
            return Err(Error::NotAFileSystem(format!("unknown version {version}")));
        }
        if !sb.blocksize.get().is_power_of_two() || sb.agcount.get() == 0 || sb.agblocks.get() == 0 {
            return Err(Error::NotAFileSystem("implausible geometry".into()));
        }
        if sb.inprogress != 0 {
            return Err(Error::NotAFileSystem("filesystem creation in progress".into()));
        }
        log::debug!(
            "xfs volume: uuid={} label=\"{}\" v{} agcount={} agblocks={}",
            sb.uuid(),
            sb.label(),
            version,
            sb.agcount.get(),
            sb.agblocks.get()
        );
        Ok(sb)
    }

    pub fn uuid(&self) -> String {
        Uuid::from_bytes(self.uuid).hyphenated().to_string()
    }

    pub fn label(&self) -> String {
        String::from_utf8_lossy(&self.fname)
            .trim_end_matches('\0')
            .to_string()
    }

    pub fn version(&self) -> u16 {
        self.versionnum.get() & 0x0F
    }

    pub fn is_v5(&self) -> bool {
        self.version() == 5
    }

    pub fn block_size(&self) -> u64 {
        u64::from(self.blocksize.get())
    }

    pub fn dir_block_size(&self) -> u64 {
        self.block_size() << self.dirblklog
    }

    pub fn inode_size(&self) -> u64 {
        u64::from(self.inodesize.get())
    }

    pub fn has_ftype(&self) -> bool {
        if self.is_v5() {
            self.features_incompat.get() & FEAT_INCOMPAT_FTYPE != 0
        } else {
            self.versionnum.get() & VERSION_MOREBITS != 0
                && self.features2.get() & VERSION2_FTYPE != 0
        }
    }

    pub fn has_finobt(&self) -> bool {
        self.is_v5() && self.features_ro_compat.get() & FEAT_RO_COMPAT_FINOBT != 0
    }

    pub fn has_rmapbt(&self) -> bool {
        self.is_v5() && self.features_ro_compat.get() & FEAT_RO_COMPAT_RMAPBT != 0
    }

    pub fn has_reflink(&self) -> bool {
        self.is_v5() && self.features_ro_compat.get() & FEAT_RO_COMPAT_REFLINK != 0
    }

    /// Block count of one allocation group; the last one may be short.
    pub fn ag_size(&self, agno: u32) -> u64 {
        if agno == self.agcount.get() - 1 {
            self.dblocks.get() - u64::from(self.agblocks.get()) * u64::from(agno)
        } else {
            u64::from(self.agblocks.get())
        }
    }

    /// Split a segmented filesystem block number
    pub fn fsb_split(&self, fsbno: u64) -> (u32, u64) {
        let agno = (fsbno >> self.agblklog) as u32;
        let agbno = fsbno & ((1u64 << self.agblklog) - 1);
        (agno, agbno)
    }

    pub fn agb_to_fsb(&self, agno: u32, agbno: u64) -> u64 {
        (u64::from(agno) << self.agblklog) | agbno
    }

    /// Byte position of a group-relative block
    pub fn agb_to_bytes(&self, agno: u32, agbno: u64) -> u64 {
        (u64::from(agno) * u64::from(self.agblocks.get()) + agbno) * self.block_size()
    }

    /// Byte position of a segmented filesystem block
    pub fn fsb_to_bytes(&self, fsbno: u64) -> u64 {
        let (agno, agbno) = self.fsb_split(fsbno);
        self.agb_to_bytes(agno, agbno)
    }

    /// Reject block numbers outside the volume.
    pub fn check_fsb(&self, fsbno: u64) -> Result<u64> {
        let (agno, agbno) = self.fsb_split(fsbno);
        if agno >= self.agcount.get() || agbno >= self.ag_size(agno) {
            return Err(Error::corrupt(format!("fsblock {fsbno:#x} outside the volume")));
        }
        Ok(fsbno)
    }

    pub fn check_agbno(&self, agno: u32, agbno: u64) -> Result<u64> {
        if agno >= self.agcount.get() || agbno >= self.ag_size(agno) {
            return Err(Error::corrupt(format!(
                "block {agbno} outside allocation group {agno}"
            )));
        }
        Ok(agbno)
    }

    /// Split an inode number into its group, group-relative block and
    /// slot within that block.
    pub fn ino_split(&self, ino: u64) -> (u32, u64, u64) {
        let agino_bits = u32::from(self.agblklog) + u32::from(self.inopblog);
        let agno = (ino >> agino_bits) as u32;
        let agino = ino & ((1u64 << agino_bits) - 1);
        let agbno = agino >> self.inopblog;
        let slot = agino & ((1u64 << self.inopblog) - 1);
        (agno, agbno, slot)
    }

    /// The group-relative inode number (block and slot merged)
    pub fn agino(&self, ino: u64) -> u64 {
        ino & ((1u64 << (u32::from(self.agblklog) + u32::from(self.inopblog))) - 1)
    }

    /// Byte position of an inode record
    pub fn ino_to_bytes(&self, ino: u64) -> Result<u64> {
        let (agno, agbno, slot) = self.ino_split(ino);
        self.check_agbno(agno, agbno)?;
        Ok(self.agb_to_bytes(agno, agbno) + slot * self.inode_size())
    }

    /// Blocks held back from user data, as statfs counts them
    pub fn alloc_set_aside(&self) -> u64 {
        u64::from(self.agcount.get()) * (AGFL_RESERVE + 4)
    }

    /// Header size of a long-format (bmap) btree block
    pub fn bmbt_block_header_size(&self) -> usize {
        if self.is_v5() {
            72
        } else {
            24
        }
    }

    /// Header size of a short-format (per-AG) btree block
    pub fn sbt_block_header_size(&self) -> usize {
        if self.is_v5() {
            56
        } else {
            16
        }
    }
}
