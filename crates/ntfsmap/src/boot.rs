// SPDX-FileCopyrightText: Copyright © 2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! NTFS boot sector and volume geometry

use zerocopy::little_endian::{U16, U32, U64};
use zerocopy::{FromBytes, Immutable, KnownLayout, Unaligned};

use fsmap::{Error, Result};

const OEM_ID: &[u8; 8] = b"NTFS    ";
const MAGIC: [u8; 2] = [0x55, 0xAA];

#[derive(Debug, FromBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
pub struct BootSector {
    pub jump: [u8; 3],
    pub oem_id: [u8; 8],
    pub bytes_per_sector: U16,
    pub sectors_per_cluster: u8,
    pub reserved_sectors: U16,
    pub zero1: [u8; 3],
    pub unused1: U16,
    pub media: u8,
    pub zero2: U16,
    pub sectors_per_track: U16,
    pub heads: U16,
    pub hidden_sectors: U32,
    pub unused2: U32,
    pub unused3: U32,
    pub total_sectors: U64,
    pub mft_lcn: U64,
    pub mftmirr_lcn: U64,
    /// Clusters per MFT record, or the negated log2 of the byte size
    pub clusters_per_mft_record: i8,
    pub pad1: [u8; 3],
    /// Clusters per index block, encoded the same way
    pub clusters_per_index_block: i8,
    pub pad2: [u8; 3],
    pub serial: U64,
    pub checksum: U32,
}

/// Geometry derived once from the boot sector, in bytes
#[derive(Debug, Clone, Copy)]
pub struct Geometry {
    pub sector_size: u64,
    pub cluster_size: u64,
    pub mft_record_size: u64,
    pub index_block_size: u64,
    pub mft_lcn: u64,
    pub mftmirr_lcn: u64,
    pub total_bytes: u64,
    pub serial: u64,
}

fn decode_record_size(encoded: i8, cluster_size: u64) -> u64 {
    if encoded > 0 {
        encoded as u64 * cluster_size
    } else {
        1u64 << (-encoded as u32)
    }
}

impl BootSector {
    pub fn parse(buf: &[u8]) -> Result<Geometry> {
        if buf.len() < 512 || buf[510..512] != MAGIC {
            return Err(Error::NotAFileSystem("missing boot sector signature".into()));
        }
        let (bs, _) = BootSector::read_from_prefix(buf)
            .map_err(|_| Error::NotAFileSystem("short boot sector".into()))?;
        if &bs.oem_id != OEM_ID {
            return Err(Error::NotAFileSystem("not an NTFS volume".into()));
        }
        let sector_size = u64::from(bs.bytes_per_sector.get());
        if !(512..=4096).contains(&sector_size) || !sector_size.is_power_of_two() {
            return Err(Error::NotAFileSystem(format!("implausible sector size {sector_size}")));
        }
        if bs.sectors_per_cluster == 0 {
            return Err(Error::NotAFileSystem("zero cluster size".into()));
        }
        let cluster_size = sector_size * u64::from(bs.sectors_per_cluster);
        let geo = Geometry {
            sector_size,
            cluster_size,
            mft_record_size: decode_record_size(bs.clusters_per_mft_record, cluster_size),
            index_block_size: decode_record_size(bs.clusters_per_index_block, cluster_size),
            mft_lcn: bs.mft_lcn.get(),
            mftmirr_lcn: bs.mftmirr_lcn.get(),
            total_bytes: bs.total_sectors.get() * sector_size,
            serial: bs.serial.get(),
        };
        log::debug!(
            "ntfs volume: serial={:016x} cluster_size={} mft_record_size={}",
            geo.serial,
            geo.cluster_size,
            geo.mft_record_size
        );
        Ok(geo)
    }
}

#[cfg(test)]
pub(crate) fn boot_bytes(total_sectors: u64, mft_lcn: u64) -> Vec<u8> {
    let mut raw = vec![0u8; 512];
    raw[3..11].copy_from_slice(OEM_ID);
    raw[11..13].copy_from_slice(&512u16.to_le_bytes());
    raw[13] = 2; // 1 KiB clusters
    raw[40..48].copy_from_slice(&total_sectors.to_le_bytes());
    raw[48..56].copy_from_slice(&mft_lcn.to_le_bytes());
    raw[56..64].copy_from_slice(&1u64.to_le_bytes());
    raw[64] = (-10i8) as u8; // 1 KiB MFT records
    raw[68] = 4; // 4 KiB index blocks
    raw[72..80].copy_from_slice(&0xDEAD_BEEF_u64.to_le_bytes());
    raw[510] = 0x55;
    raw[511] = 0xAA;
    raw
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn geometry_decoding() {
        let geo = BootSector::parse(&boot_bytes(8192, 4)).unwrap();
        assert_eq!(geo.cluster_size, 1024);
        assert_eq!(geo.mft_record_size, 1024);
        assert_eq!(geo.index_block_size, 4096);
        assert_eq!(geo.mft_lcn, 4);
        assert_eq!(geo.total_bytes, 8192 * 512);
    }

    #[test]
    fn wrong_oem_is_rejected() {
        let mut raw = boot_bytes(8192, 4);
        raw[3..11].copy_from_slice(b"MSDOS5.0");
        assert!(matches!(
            BootSector::parse(&raw),
            Err(Error::NotAFileSystem(_))
        ));
    }
}
