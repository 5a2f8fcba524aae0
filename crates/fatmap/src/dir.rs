// SPDX-FileCopyrightText: Copyright © 2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! FAT directory entries: 8.3 records and VFAT long-name runs

use zerocopy::little_endian::{U16, U32};
use zerocopy::{FromBytes, Immutable, KnownLayout, Unaligned};

pub const ATTR_READ_ONLY: u8 = 0x01;
pub const ATTR_HIDDEN: u8 = 0x02;
pub const ATTR_SYSTEM: u8 = 0x04;
pub const ATTR_VOLUME: u8 = 0x08;
pub const ATTR_DIR: u8 = 0x10;
pub const ATTR_ARCHIVE: u8 = 0x20;
/// All four low attribute bits at once mark a long-name fragment
pub const ATTR_LFN: u8 = 0x0F;

pub const ENTRY_SIZE: usize = 32;
const DELETED: u8 = 0xE5;
/// A 0x05 first byte escapes a real 0xE5
const KANJI_ESCAPE: u8 = 0x05;

#[derive(Debug, Clone, FromBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
pub struct DirEntry {
    pub name: [u8; 11],
    pub attr: u8,
    pub ntres: u8,
    pub ctime_tenth: u8,
    pub ctime: U16,
    pub cdate: U16,
    pub adate: U16,
    pub starthi: U16,
    pub time: U16,
    pub date: U16,
    pub start: U16,
    pub size: U32,
}

// ntres bits for all-lowercase 8.3 names
const NTRES_LOWER_BASE: u8 = 0x08;
const NTRES_LOWER_EXT: u8 = 0x10;

impl DirEntry {
    pub fn is_dir(&self) -> bool {
        self.attr & ATTR_DIR != 0
    }

    pub fn is_volume_label(&self) -> bool {
        self.attr & ATTR_VOLUME != 0 && self.attr != ATTR_LFN
    }

    /// First data cluster; the high half only counts on FAT32.
    pub fn first_cluster(&self, fat32: bool) -> u32 {
        let hi = if fat32 { u32::from(self.starthi.get()) << 16 } else { 0 };
        hi | u32::from(self.start.get())
    }

    /// The 8.3 name, case bits applied.
    pub fn short_name(&self) -> String {
        let mut base: Vec<u8> = self.name[..8].to_vec();
        if base[0] == KANJI_ESCAPE {
            base[0] = DELETED;
        }
        let base = trim_padding(&base);
        let ext = trim_padding(&self.name[8..]);

        let mut name = String::from_utf8_lossy(base).into_owned();
        if self.ntres & NTRES_LOWER_BASE != 0 {
            name = name.to_lowercase();
        }
        if !ext.is_empty() {
            let mut e = String::from_utf8_lossy(ext).into_owned();
            if self.ntres & NTRES_LOWER_EXT != 0 {
                e = e.to_lowercase();
            }
            name.push('.');
            name.push_str(&e);
        }
        name
    }
}

fn trim_padding(field: &[u8]) -> &[u8] {
    let end = field.iter().rposition(|&b| b != b' ').map_or(0, |p| p + 1);
    &field[..end]
}

/// A decoded live directory entry with its long name resolved
#[derive(Debug, Clone)]
pub struct FatDirent {
    pub name: String,
    pub entry: DirEntry,
}

/// Decode a raw directory region: reassemble long-name runs, skip
/// deleted entries and volume labels, stop at the end marker.
pub fn parse_region(raw: &[u8]) -> Vec<FatDirent> {
    let mut out = Vec::new();
    // Long-name fragments accumulate in reverse sequence order
    let mut lfn_parts: Vec<(u8, Vec<u16>)> = Vec::new();

    for chunk in raw.chunks_exact(ENTRY_SIZE) {
        if chunk[0] == 0 {
            break;
        }
        if chunk[0] == DELETED {
            lfn_parts.clear();
            continue;
        }
        if chunk[11] == ATTR_LFN {
            let seq = chunk[0] & 0x1F;
            let mut units = Vec::with_capacity(13);
            for at in [1usize, 3, 5, 7, 9, 14, 16, 18, 20, 22, 24, 28, 30] {
                units.push(u16::from_le_bytes([chunk[at], chunk[at + 1]]));
            }
            lfn_parts.push((seq, units));
            continue;
        }

        let (entry, _) = DirEntry::read_from_prefix(chunk).expect("chunk is one entry");
        if entry.is_volume_label() {
            lfn_parts.clear();
            continue;
        }

        let name = take_long_name(&mut lfn_parts).unwrap_or_else(|| entry.short_name());
        out.push(FatDirent { name, entry });
    }
    out
}

fn take_long_name(parts: &mut Vec<(u8, Vec<u16>)>) -> Option<String> {
    if parts.is_empty() {
        return None;
    }
    parts.sort_by_key(|(seq, _)| *seq);
    let mut units: Vec<u16> = parts.drain(..).flat_map(|(_, u)| u).collect();
    if let Some(end) = units.iter().position(|&u| u == 0) {
        units.truncate(end);
    }
    while units.last() == Some(&0xFFFF) {
        units.pop();
    }
    Some(String::from_utf16_lossy(&units))
}

/// DOS date/time to Unix seconds. The two seconds of resolution and the
/// 1980 epoch are the format's own limits.
pub fn decode_time(date: u16, time: u16) -> Option<i64> {
    if date == 0 {
        return None;
    }
    let year = ((date >> 9) & 0x7F) as i32 + 1980;
    let month = ((date >> 5) & 0xF) as u32;
    let day = (date & 0x1F) as u32;
    let hour = ((time >> 11) & 0x1F) as u32;
    let min = ((time >> 5) & 0x3F) as u32;
    let sec = ((time & 0x1F) as u32) * 2;

    let date = chrono::NaiveDate::from_ymd_opt(year, month, day)?;
    let dt = date.and_hms_opt(hour, min, sec)?;
    Some(dt.and_utc().timestamp())
}
