// SPDX-FileCopyrightText: Copyright © 2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Linear directory entry parsing
//!
//! Hash-tree directories still keep classic dirent blocks underneath; the
//! dx nodes hide inside apparently-unused entries, so a linear parse that
//! skips zero-inode records covers both layouts.

use fsmap::{Error, Result};

/// File type codes stored in a dirent
pub const FT_REG_FILE: u8 = 1;
pub const FT_DIR: u8 = 2;
pub const FT_SYMLINK: u8 = 7;
/// The filesystem predates the filetype feature; the inode must be read.
pub const FT_UNKNOWN: u8 = 0;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawDirent {
    pub ino: u64,
    pub file_type: u8,
    pub name: Vec<u8>,
}

/// Parse the dirents of one directory block, appending live entries.
pub fn parse_block(block: &[u8], has_filetype: bool, out: &mut Vec<RawDirent>) -> Result<()> {
    let mut pos = 0usize;
    while pos + 8 <= block.len() {
        let ino = u32::from_le_bytes([block[pos], block[pos + 1], block[pos + 2], block[pos + 3]]);
        let rec_len =
            u16::from_le_bytes([block[pos + 4], block[pos + 5]]) as usize;
        let name_len = block[pos + 6] as usize;
        let file_type = if has_filetype { block[pos + 7] } else { FT_UNKNOWN };

        if rec_len < 8 || rec_len % 4 != 0 || pos + rec_len > block.len() {
            return Err(Error::corrupt(format!("bad dirent record length {rec_len}")));
        }
        if ino != 0 {
            if name_len > rec_len - 8 {
                return Err(Error::corrupt("dirent name overflows its record"));
            }
            out.push(RawDirent {
                ino: u64::from(ino),
                file_type,
                name: block[pos + 8..pos + 8 + name_len].to_vec(),
            });
        }
        pos += rec_len;
    }
    Ok(())
}

/// Parse an inline directory carried in the inode body. The first four
/// bytes hold the parent inode; `.` and `..` have no explicit entries.
pub fn parse_inline(body: &[u8], has_filetype: bool, out: &mut Vec<RawDirent>) -> Result<()> {
    if body.len() < 4 {
        return Ok(());
    }
    parse_block(&body[4..], has_filetype, out)
}

/// Append one encoded dirent; test and fixture support.
pub fn encode_dirent(block: &mut Vec<u8>, ino: u32, name: &[u8], file_type: u8, rec_len: u16) {
    block.extend_from_slice(&ino.to_le_bytes());
    block.extend_from_slice(&rec_len.to_le_bytes());
    block.push(name.len() as u8);
    block.push(file_type);
    block.extend_from_slice(name);
    let used = 8 + name.len();
    block.resize(block.len() + rec_len as usize - used, 0);
}
