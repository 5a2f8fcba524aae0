// SPDX-FileCopyrightText: Copyright © 2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! SQLite superblock parsing and sniffing
//!
//! The first 100 bytes of a database file describe everything the shim
//! needs: whether this is a database at all, whether it is pristine or
//! carries one of our codec headers, the page size, and where the b-tree
//! region begins.

use zerocopy::big_endian::{U16, U32};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::{Error, Result};

/// Canonical header of an uncompressed database
pub const SQLITE_FILE_HEADER: [u8; 16] = *b"SQLite format 3\0";

/// On-disk SQLite superblock. All multi-byte fields are big-endian.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
pub struct SqliteSuper {
    pub magic: [u8; 16],
    /// Page size in bytes; the value 1 encodes 65536
    pub pagesize: U16,
    pub write_format: u8,
    pub read_format: u8,
    pub page_reserve: u8,
    pub max_fraction: u8,
    pub min_fraction: u8,
    pub leaf_payload: u8,
    pub change_counter: U32,
    pub nr_pages: U32,
    pub freelist_start: U32,
    pub freelist_pages: U32,
    pub schema_cookie: U32,
    pub schema_format: U32,
    pub page_cache_size: U32,
    pub highest_btree_root: U32,
    pub text_encoding: U32,
    pub user_version: U32,
    pub vacuum_mode: U32,
    pub app_id: U32,
    pub reserved: [u8; 20],
    pub version_valid_for: U32,
    pub sqlite_version: U32,
}

pub const SUPER_SIZE: usize = std::mem::size_of::<SqliteSuper>();

/// What a successful sniff learned about the file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sniff {
    /// True when the file carries the canonical uncompressed header
    pub pristine: bool,
    pub page_size: u32,
    /// Byte offset of the b-tree region: everything below this (the
    /// superblock and the freelist reservation) stays uncompressed
    pub data_start: u64,
}

impl SqliteSuper {
    pub fn decoded_page_size(&self) -> u32 {
        match self.pagesize.get() {
            1 => 65536,
            n => u32::from(n),
        }
    }
}

/// Classify a superblock. `codec_header` is the stacked codec's 16-byte
/// file header; a magic matching neither it nor the canonical header, or
/// any superblock invariant failing, rejects the file.
pub fn sniff(sb: &SqliteSuper, codec_header: &[u8; 16]) -> Result<Sniff> {
    let is_sqlite = sb.magic == SQLITE_FILE_HEADER;
    let is_compr = &sb.magic == codec_header;
    if (!is_sqlite && !is_compr)
        || sb.max_fraction != 64
        || sb.min_fraction != 32
        || sb.leaf_payload != 32
        || sb.schema_format.get() > 4
    {
        return Err(Error::NotADatabase);
    }

    let page_size = sb.decoded_page_size();
    let data_start =
        u64::from(sb.freelist_start.get() + 1 + sb.freelist_pages.get()) * u64::from(page_size);
    log::debug!("sniff: pristine={is_sqlite} pagesize={page_size} datastart={data_start}");
    Ok(Sniff {
        pristine: is_sqlite,
        page_size,
        data_start,
    })
}

#[cfg(test)]
pub(crate) fn test_super(magic: [u8; 16], pagesize_raw: u16, freelist_start: u32, freelist_pages: u32) -> SqliteSuper {
    let zeroes = [0u8; SUPER_SIZE];
    let mut sb = SqliteSuper::read_from_bytes(zeroes.as_slice()).unwrap();
    sb.magic = magic;
    sb.pagesize = U16::new(pagesize_raw);
    sb.max_fraction = 64;
    sb.min_fraction = 32;
    sb.leaf_payload = 32;
    sb.schema_format = U32::new(4);
    sb.freelist_start = U32::new(freelist_start);
    sb.freelist_pages = U32::new(freelist_pages);
    sb
}
