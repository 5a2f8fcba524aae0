// SPDX-FileCopyrightText: Copyright © 2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! FAT boot sector parsing and volume geometry

use zerocopy::little_endian::{U16, U32};
use zerocopy::{FromBytes, Immutable, KnownLayout, Unaligned};

use fsmap::{Error, Result};

const MAGIC: [u8; 2] = [0x55, 0xAA];
const MAGIC_OFFSET: usize = 0x1FE;

/// Cluster count thresholds, as the Linux kernel draws them
const MAX_FAT12_CLUSTERS: u64 = 4085;

#[derive(Debug, FromBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
pub struct BootSector {
    /// Boot strap short or near jump
    pub ignored: [u8; 3],
    /// Name, may identify the formatter
    pub system_id: [u8; 8],
    /// Bytes per logical sector
    pub sector_size: U16,
    /// Sectors per cluster
    pub sec_per_clus: u8,
    /// Reserved sectors
    pub reserved: U16,
    /// Number of FATs
    pub fats: u8,
    /// Root directory entries
    pub dir_entries: U16,
    /// Number of sectors
    pub sectors: U16,
    /// Media code
    pub media: u8,
    /// Sectors per FAT
    pub fat_length: U16,
    /// Sectors per track
    pub secs_track: U16,
    /// Number of heads
    pub heads: U16,
    /// Hidden sectors
    pub hidden: U32,
    /// Number of sectors when `sectors` is zero
    pub total_sect: U32,
    /// FAT16 and FAT32 diverge from here
    pub shared: [u8; 54],
}

#[derive(Debug, FromBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
pub struct Fat32Fields {
    /// Sectors per FAT
    pub fat32_length: U32,
    /// FAT mirroring flags
    pub fat32_flags: U16,
    /// Filesystem version
    pub fat32_version: [u8; 2],
    /// First cluster of the root directory
    pub root_cluster: U32,
    /// Filesystem info sector
    pub info_sector: U16,
    /// Backup boot sector
    pub backup_boot: U16,
    pub reserved2: [U16; 6],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatKind {
    Fat12,
    Fat16,
    Fat32,
}

/// Geometry derived once from the boot sector, in bytes
#[derive(Debug, Clone, Copy)]
pub struct Geometry {
    pub kind: FatKind,
    pub sector_size: u64,
    pub cluster_size: u64,
    pub fats: u32,
    pub fat_start: u64,
    pub fat_size: u64,
    /// Fixed root directory region (FAT12/16)
    pub root_start: u64,
    pub root_entries: u32,
    /// Root directory cluster (FAT32)
    pub root_cluster: u32,
    pub data_start: u64,
    pub total_bytes: u64,
    /// Number of data clusters; cluster numbers run `2 .. 2 + clusters`
    pub clusters: u64,
}

impl BootSector {
    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < 512 || buf[MAGIC_OFFSET..MAGIC_OFFSET + 2] != MAGIC {
            return Err(Error::NotAFileSystem("missing boot sector signature".into()));
        }
        let (bs, _) = BootSector::read_from_prefix(buf)
            .map_err(|_| Error::NotAFileSystem("short boot sector".into()))?;
        let ss = bs.sector_size.get();
        if !(ss >= 512 && ss <= 4096 && ss.is_power_of_two()) {
            return Err(Error::NotAFileSystem(format!("implausible sector size {ss}")));
        }
        if bs.sec_per_clus == 0 || !bs.sec_per_clus.is_power_of_two() || bs.fats == 0 {
            return Err(Error::NotAFileSystem("implausible cluster geometry".into()));
        }
        Ok(bs)
    }

    fn fat32(&self) -> Fat32Fields {
        let (f, _) = Fat32Fields::read_from_prefix(self.shared.as_slice()).expect("shared covers fat32 fields");
        f
    }

    /// Derive the volume geometry. The FAT16/32 split follows the kernel:
    /// a zero 16-bit FAT length with a nonzero 32-bit one means FAT32;
    /// FAT12 versus FAT16 is decided by the cluster count.
    pub fn geometry(&self) -> Result<Geometry> {
        let ss = u64::from(self.sector_size.get());
        let cluster_size = ss * u64::from(self.sec_per_clus);
        let f32 = self.fat32();
        let is_fat32 = self.fat_length.get() == 0 && f32.fat32_length.get() != 0;

        let fat_sectors = if is_fat32 {
            u64::from(f32.fat32_length.get())
        } else {
            u64::from(self.fat_length.get())
        };
        if fat_sectors == 0 {
            return Err(Error::NotAFileSystem("zero-length FAT".into()));
        }
        let total_sectors = match self.sectors.get() {
            0 => u64::from(self.total_sect.get()),
            n => u64::from(n),
        };
        let fat_start = u64::from(self.reserved.get()) * ss;
        let fat_size = fat_sectors * ss;
        let root_entries = if is_fat32 { 0 } else { u32::from(self.dir_entries.get()) };
        let root_start = fat_start + u64::from(self.fats) * fat_size;
        let root_bytes = (u64::from(root_entries) * 32).div_ceil(ss) * ss;
        let data_start = root_start + root_bytes;
        let total_bytes = total_sectors * ss;
        if total_bytes <= data_start {
            return Err(Error::NotAFileSystem("no data area".into()));
        }
        let clusters = (total_bytes - data_start) / cluster_size;

        let kind = if is_fat32 {
            FatKind::Fat32
        } else if clusters < MAX_FAT12_CLUSTERS {
            FatKind::Fat12
        } else {
            FatKind::Fat16
        };
        log::debug!("fat volume: kind={kind:?} cluster_size={cluster_size} clusters={clusters}");

        Ok(Geometry {
            kind,
            sector_size: ss,
            cluster_size,
            fats: u32::from(self.fats),
            fat_start,
            fat_size,
            root_start,
            root_entries,
            root_cluster: f32.root_cluster.get(),
            data_start,
            total_bytes,
            clusters,
        })
    }
}

impl Geometry {
    /// Byte position of a data cluster; cluster numbering starts at 2.
    pub fn cluster_start(&self, cluster: u32) -> u64 {
        self.data_start + u64::from(cluster - 2) * self.cluster_size
    }
}
