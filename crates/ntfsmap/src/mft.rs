// SPDX-FileCopyrightText: Copyright © 2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! MFT records and their attributes

use zerocopy::little_endian::{U16, U32, U64};
use zerocopy::{FromBytes, Immutable, KnownLayout, Unaligned};

use fsmap::{BlockFile, Error, InodeTimes, Result};

use crate::boot::Geometry;
use crate::runlist::{self, Run};

/// 'FILE'
const RECORD_MAGIC: [u8; 4] = *b"FILE";
/// Difference between the NTFS epoch (1601) and the Unix epoch, seconds
const EPOCH_DELTA: i64 = 11_644_473_600;

// Well-known system records
pub const MFT_RECORD: u64 = 0;
pub const ROOT_RECORD: u64 = 5;
pub const BITMAP_RECORD: u64 = 6;

// Attribute type codes
pub const ATTR_STANDARD_INFORMATION: u32 = 0x10;
pub const ATTR_ATTRIBUTE_LIST: u32 = 0x20;
pub const ATTR_FILE_NAME: u32 = 0x30;
pub const ATTR_DATA: u32 = 0x80;
pub const ATTR_INDEX_ROOT: u32 = 0x90;
pub const ATTR_INDEX_ALLOCATION: u32 = 0xA0;
const ATTR_END: u32 = 0xFFFF_FFFF;

// Attribute flags
pub const ATTRF_COMPRESSED: u16 = 0x0001;
pub const ATTRF_ENCRYPTED: u16 = 0x4000;
pub const ATTRF_SPARSE: u16 = 0x8000;

// Record flags
const RECF_IN_USE: u16 = 0x0001;
const RECF_DIRECTORY: u16 = 0x0002;

#[derive(Debug, FromBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
struct RecordHeader {
    magic: [u8; 4],
    usa_ofs: U16,
    usa_count: U16,
    lsn: U64,
    sequence: U16,
    link_count: U16,
    attrs_ofs: U16,
    flags: U16,
    bytes_in_use: U32,
    bytes_allocated: U32,
    base_ref: U64,
    next_attr_id: U16,
}

/// Apply the update sequence fixups of a record or index block in place.
pub fn apply_fixups(buf: &mut [u8], usa_ofs: usize, usa_count: usize, sector_size: usize) -> Result<()> {
    if usa_count < 1 || usa_ofs + usa_count * 2 > buf.len() {
        return Err(Error::corrupt("bad update sequence array"));
    }
    let usn = [buf[usa_ofs], buf[usa_ofs + 1]];
    for i in 1..usa_count {
        let sector_end = i * sector_size;
        if sector_end > buf.len() {
            break;
        }
        if buf[sector_end - 2..sector_end] != usn {
            return Err(Error::corrupt("update sequence mismatch; torn write"));
        }
        let fix = [buf[usa_ofs + i * 2], buf[usa_ofs + i * 2 + 1]];
        buf[sector_end - 2..sector_end].copy_from_slice(&fix);
    }
    Ok(())
}

/// One attribute within a record
#[derive(Debug, Clone)]
pub struct Attribute {
    pub type_code: u32,
    pub name: String,
    pub flags: u16,
    /// Offset of the attribute within the record
    pub record_offset: usize,
    pub body: AttrBody,
}

#[derive(Debug, Clone)]
pub enum AttrBody {
    Resident {
        /// Value offset within the attribute
        value_offset: usize,
        value: Vec<u8>,
    },
    NonResident {
        runs: Vec<Run>,
        data_size: u64,
    },
}

impl Attribute {
    pub fn resident_value(&self) -> Option<&[u8]> {
        match &self.body {
            AttrBody::Resident { value, .. } => Some(value),
            AttrBody::NonResident { .. } => None,
        }
    }

    pub fn size(&self) -> u64 {
        match &self.body {
            AttrBody::Resident { value, .. } => value.len() as u64,
            AttrBody::NonResident { data_size, .. } => *data_size,
        }
    }
}

/// A parsed MFT record
#[derive(Debug)]
pub struct MftRecord {
    pub record_no: u64,
    pub in_use: bool,
    pub is_dir: bool,
    /// Extension records defer to their base record
    pub base_record: u64,
    pub attributes: Vec<Attribute>,
}

impl MftRecord {
    pub fn parse(geo: &Geometry, record_no: u64, mut raw: Vec<u8>) -> Result<Self> {
        let (hdr, _) = RecordHeader::read_from_prefix(raw.as_slice())
            .map_err(|_| Error::corrupt("short MFT record"))?;
        if hdr.magic != RECORD_MAGIC {
            return Err(Error::corrupt(format!("bad record magic for MFT record {record_no}")));
        }
        let usa_ofs = hdr.usa_ofs.get() as usize;
        let usa_count = hdr.usa_count.get() as usize;
        let attrs_ofs = hdr.attrs_ofs.get() as usize;
        let flags = hdr.flags.get();
        let base_record = hdr.base_ref.get() & 0xFFFF_FFFF_FFFF;
        apply_fixups(&mut raw, usa_ofs, usa_count, geo.sector_size as usize)?;

        let mut attributes = Vec::new();
        let mut pos = attrs_ofs;
        loop {
            if pos + 8 > raw.len() {
                return Err(Error::corrupt("attribute walk ran off the record"));
            }
            let type_code = u32::from_le_bytes(raw[pos..pos + 4].try_into().expect("type"));
            if type_code == ATTR_END {
                break;
            }
            let length = u32::from_le_bytes(raw[pos + 4..pos + 8].try_into().expect("length")) as usize;
            if length < 16 || pos + length > raw.len() {
                return Err(Error::corrupt(format!("bad attribute length {length}")));
            }
            let attr = &raw[pos..pos + length];
            let non_resident = attr[8] != 0;
            let name_len = attr[9] as usize;
            let name_ofs = u16::from_le_bytes([attr[10], attr[11]]) as usize;
            let flags = u16::from_le_bytes([attr[12], attr[13]]);
            let name = if name_len > 0 {
                let units: Vec<u16> = attr[name_ofs..name_ofs + name_len * 2]
                    .chunks_exact(2)
                    .map(|c| u16::from_le_bytes([c[0], c[1]]))
                    .collect();
                String::from_utf16_lossy(&units)
            } else {
                String::new()
            };

            let body = if non_resident {
                let lowest_vcn = u64::from_le_bytes(attr[16..24].try_into().expect("vcn"));
                let pairs_ofs = u16::from_le_bytes([attr[32], attr[33]]) as usize;
                let data_size = u64::from_le_bytes(attr[48..56].try_into().expect("size"));
                if pairs_ofs >= length {
                    return Err(Error::corrupt("mapping pairs outside the attribute"));
                }
                AttrBody::NonResident {
                    runs: runlist::decode(&attr[pairs_ofs..], lowest_vcn)?,
                    data_size,
                }
            } else {
                let value_len = u32::from_le_bytes(attr[16..20].try_into().expect("len")) as usize;
                let value_ofs = u16::from_le_bytes([attr[20], attr[21]]) as usize;
                if value_ofs + value_len > length {
                    return Err(Error::corrupt("resident value outside the attribute"));
                }
                AttrBody::Resident {
                    value_offset: value_ofs,
                    value: attr[value_ofs..value_ofs + value_len].to_vec(),
                }
            };

            attributes.push(Attribute {
                type_code,
                name,
                flags,
                record_offset: pos,
                body,
            });
            pos += length;
        }

        Ok(Self {
            record_no,
            in_use: flags & RECF_IN_USE != 0,
            is_dir: flags & RECF_DIRECTORY != 0,
            base_record,
            attributes,
        })
    }

    pub fn is_extension(&self) -> bool {
        self.base_record != 0 && self.base_record != self.record_no
    }

    pub fn find(&self, type_code: u32, name: &str) -> Option<&Attribute> {
        self.attributes
            .iter()
            .find(|a| a.type_code == type_code && a.name == name)
    }

    /// Timestamps from the standard information attribute
    pub fn times(&self) -> InodeTimes {
        let Some(value) = self
            .find(ATTR_STANDARD_INFORMATION, "")
            .and_then(|a| a.resident_value())
        else {
            return InodeTimes::default();
        };
        if value.len() < 32 {
            return InodeTimes::default();
        }
        let at = |o: usize| {
            let t = u64::from_le_bytes(value[o..o + 8].try_into().expect("time"));
            Some((t / 10_000_000) as i64 - EPOCH_DELTA)
        };
        InodeTimes {
            crtime: at(0),
            mtime: at(8),
            ctime: at(16),
            atime: at(24),
        }
    }

    /// The unnamed data stream's size, when there is one
    pub fn data_size(&self) -> Option<u64> {
        self.find(ATTR_DATA, "").map(|a| a.size())
    }
}

/// Reader for the MFT itself, bootstrapped from the boot sector's
/// pointer to record zero.
pub struct Mft {
    geo: Geometry,
    /// Data runs of $MFT
    runs: Vec<Run>,
    pub record_count: u64,
}

impl Mft {
    pub fn open(dev: &BlockFile, geo: Geometry) -> Result<Self> {
        // Record zero describes the MFT; read it directly first.
        let raw = dev.read_vec(geo.mft_lcn * geo.cluster_size, geo.mft_record_size as usize)?;
        let rec0 = MftRecord::parse(&geo, MFT_RECORD, raw)?;
        let data = rec0
            .find(ATTR_DATA, "")
            .ok_or_else(|| Error::corrupt("record zero has no data attribute"))?;
        let (runs, data_size) = match &data.body {
            AttrBody::NonResident { runs, data_size } => (runs.clone(), *data_size),
            AttrBody::Resident { .. } => {
                return Err(Error::corrupt("the MFT cannot be resident"))
            }
        };
        Ok(Self {
            geo,
            runs,
            record_count: data_size / geo.mft_record_size,
        })
    }

    pub fn runs(&self) -> &[Run] {
        &self.runs
    }

    /// Byte position of a record on the volume
    pub fn record_position(&self, record_no: u64) -> Result<u64> {
        let byte_off = record_no * self.geo.mft_record_size;
        let vcn = byte_off / self.geo.cluster_size;
        let within = byte_off % self.geo.cluster_size;
        for run in &self.runs {
            if vcn >= run.vcn && vcn < run.vcn + run.clusters {
                let lcn = run
                    .lcn
                    .ok_or_else(|| Error::corrupt("MFT record inside a sparse run"))?;
                return Ok((lcn + (vcn - run.vcn)) * self.geo.cluster_size + within);
            }
        }
        Err(Error::corrupt(format!("record {record_no} beyond the MFT")))
    }

    pub fn read_record(&self, dev: &BlockFile, record_no: u64) -> Result<MftRecord> {
        if record_no >= self.record_count {
            return Err(Error::corrupt(format!("record number {record_no} out of range")));
        }
        let pos = self.record_position(record_no)?;
        let raw = dev.read_vec(pos, self.geo.mft_record_size as usize)?;
        MftRecord::parse(&self.geo, record_no, raw)
    }
}

/// Assemble the full content of a non-resident attribute (for small
/// metadata streams like the cluster bitmap).
pub fn read_attr_data(dev: &BlockFile, geo: &Geometry, attr: &Attribute) -> Result<Vec<u8>> {
    match &attr.body {
        AttrBody::Resident { value, .. } => Ok(value.clone()),
        AttrBody::NonResident { runs, data_size } => {
            let mut out = vec![0u8; *data_size as usize];
            for run in runs {
                let Some(lcn) = run.lcn else { continue };
                let start = (run.vcn * geo.cluster_size) as usize;
                if start >= out.len() {
                    continue;
                }
                let want = ((run.clusters * geo.cluster_size) as usize).min(out.len() - start);
                let data = dev.read_vec(lcn * geo.cluster_size, want)?;
                out[start..start + want].copy_from_slice(&data);
            }
            Ok(out)
        }
    }
}

#[cfg(test)]
pub(crate) mod build {
    //! Raw MFT record assembly for tests

    pub struct RecordBuilder {
        buf: Vec<u8>,
        pos: usize,
    }

    impl RecordBuilder {
        pub fn new(size: usize, is_dir: bool) -> Self {
            let mut buf = vec![0u8; size];
            buf[..4].copy_from_slice(b"FILE");
            buf[4..6].copy_from_slice(&48u16.to_le_bytes()); // usa_ofs
            let usa_count = (size / 512 + 1) as u16;
            buf[6..8].copy_from_slice(&usa_count.to_le_bytes());
            buf[20..22].copy_from_slice(&56u16.to_le_bytes()); // attrs_ofs
            let flags: u16 = 1 | if is_dir { 2 } else { 0 };
            buf[22..24].copy_from_slice(&flags.to_le_bytes());
            Self { buf, pos: 56 }
        }

        pub fn resident_attr(&mut self, type_code: u32, name: &str, value: &[u8]) -> &mut Self {
            let name_units: Vec<u16> = name.encode_utf16().collect();
            let name_bytes = name_units.len() * 2;
            let value_ofs = (24 + name_bytes + 7) / 8 * 8;
            let length = (value_ofs + value.len() + 7) / 8 * 8;
            let a = &mut self.buf[self.pos..];
            a[..4].copy_from_slice(&type_code.to_le_bytes());
            a[4..8].copy_from_slice(&(length as u32).to_le_bytes());
            a[9] = name_units.len() as u8;
            a[10..12].copy_from_slice(&24u16.to_le_bytes());
            a[16..20].copy_from_slice(&(value.len() as u32).to_le_bytes());
            a[20..22].copy_from_slice(&(value_ofs as u16).to_le_bytes());
            for (i, u) in name_units.iter().enumerate() {
                a[24 + i * 2..26 + i * 2].copy_from_slice(&u.to_le_bytes());
            }
            a[value_ofs..value_ofs + value.len()].copy_from_slice(value);
            self.pos += length;
            self
        }

        pub fn non_resident_attr(
            &mut self,
            type_code: u32,
            name: &str,
            pairs: &[u8],
            data_size: u64,
        ) -> &mut Self {
            let name_units: Vec<u16> = name.encode_utf16().collect();
            let name_bytes = name_units.len() * 2;
            let pairs_ofs = (64 + name_bytes + 7) / 8 * 8;
            let length = (pairs_ofs + pairs.len() + 8) / 8 * 8;
            let a = &mut self.buf[self.pos..];
            a[..4].copy_from_slice(&type_code.to_le_bytes());
            a[4..8].copy_from_slice(&(length as u32).to_le_bytes());
            a[8] = 1;
            a[9] = name_units.len() as u8;
            a[10..12].copy_from_slice(&64u16.to_le_bytes());
            a[32..34].copy_from_slice(&(pairs_ofs as u16).to_le_bytes());
            a[40..48].copy_from_slice(&data_size.to_le_bytes()); // allocated
            a[48..56].copy_from_slice(&data_size.to_le_bytes());
            for (i, u) in name_units.iter().enumerate() {
                a[64 + i * 2..66 + i * 2].copy_from_slice(&u.to_le_bytes());
            }
            a[pairs_ofs..pairs_ofs + pairs.len()].copy_from_slice(pairs);
            self.pos += length;
            self
        }

        pub fn finish(mut self) -> Vec<u8> {
            let end = self.pos;
            self.buf[end..end + 4].copy_from_slice(&0xFFFF_FFFFu32.to_le_bytes());
            self.buf[24..28].copy_from_slice(&((end + 8) as u32).to_le_bytes());
            // Stamp a harmless update sequence
            let usa_count = u16::from_le_bytes([self.buf[6], self.buf[7]]) as usize;
            self.buf[48..50].copy_from_slice(&0x0101u16.to_le_bytes());
            for i in 1..usa_count {
                let sector_end = i * 512;
                let save = [self.buf[sector_end - 2], self.buf[sector_end - 1]];
                self.buf[48 + i * 2..50 + i * 2].copy_from_slice(&save);
                self.buf[sector_end - 2..sector_end].copy_from_slice(&[0x01, 0x01]);
            }
            self.buf
        }
    }

    /// A standard information value with all four stamps set to `t`
    pub fn standard_info(t: u64) -> Vec<u8> {
        let mut v = vec![0u8; 48];
        for o in [0usize, 8, 16, 24] {
            v[o..o + 8].copy_from_slice(&t.to_le_bytes());
        }
        v
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::boot::{boot_bytes, BootSector};

    fn geo() -> Geometry {
        BootSector::parse(&boot_bytes(8192, 4)).unwrap()
    }

    #[test]
    fn parse_record_with_attributes() {
        let mut b = build::RecordBuilder::new(1024, false);
        // 2099-ish NTFS timestamp: seconds since 1601 in 100ns units
        let t = 13_100_000_000u64 * 10_000_000;
        b.resident_attr(ATTR_STANDARD_INFORMATION, "", &build::standard_info(t));
        b.resident_attr(ATTR_DATA, "", b"hello world");
        b.non_resident_attr(ATTR_DATA, "stream", &[0x11, 0x04, 0x60, 0x00], 4096);
        let rec = MftRecord::parse(&geo(), 30, b.finish()).unwrap();

        assert!(rec.in_use);
        assert!(!rec.is_dir);
        assert_eq!(rec.data_size(), Some(11));
        assert_eq!(rec.times().mtime, Some(13_100_000_000 - EPOCH_DELTA));

        let ads = rec.find(ATTR_DATA, "stream").unwrap();
        match &ads.body {
            AttrBody::NonResident { runs, data_size } => {
                assert_eq!(*data_size, 4096);
                assert_eq!(runs[0].lcn, Some(0x60));
                assert_eq!(runs[0].clusters, 4);
            }
            AttrBody::Resident { .. } => panic!("expected non-resident"),
        }
    }

    #[test]
    fn torn_records_are_detected() {
        let mut raw = build::RecordBuilder::new(1024, false).finish();
        raw[510] ^= 0xFF;
        assert!(MftRecord::parse(&geo(), 1, raw).is_err());
    }

    #[test]
    fn fixups_restore_sector_tails() {
        let mut b = build::RecordBuilder::new(1024, false);
        b.resident_attr(ATTR_DATA, "", &[0xAA; 700]);
        let rec = MftRecord::parse(&geo(), 1, b.finish()).unwrap();
        let data = rec.find(ATTR_DATA, "").unwrap().resident_value().unwrap();
        assert!(data.iter().all(|&b| b == 0xAA));
    }
}
