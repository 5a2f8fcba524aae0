// SPDX-FileCopyrightText: Copyright © 2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Offline database conversion
//!
//! Rewrites a whole database file page by page: pristine to compressed,
//! compressed to a different codec, or compressed back to pristine. The
//! source codec is recovered from the input's file header, so any
//! combination converts in one pass.

use zerocopy::{FromBytes, IntoBytes};

use crate::page::{PageHead, PAGE_HEAD_SIZE};
use crate::superblock::{sniff, SqliteSuper, SQLITE_FILE_HEADER, SUPER_SIZE};
use crate::vfs::{FileVfs, Vfs};
use crate::{Codec, Error, Result};

/// What the output should be
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Pristine,
    Codec(Codec),
}

impl Target {
    fn header(self) -> [u8; 16] {
        match self {
            Target::Pristine => SQLITE_FILE_HEADER,
            Target::Codec(c) => c.file_header(),
        }
    }
}

/// Convert `input` into `output`, page by page.
pub fn shrink<I: Vfs, O: Vfs>(input: &mut I, output: &mut O, target: Target) -> Result<()> {
    let mut sb_buf = [0u8; SUPER_SIZE];
    if input.read_at(&mut sb_buf, 0)? < SUPER_SIZE {
        return Err(Error::NotADatabase);
    }
    let sb = SqliteSuper::read_from_bytes(sb_buf.as_slice()).expect("buffer is exactly one superblock");

    // Identify the source: pristine, or one of the registry's headers.
    let source_codec = Codec::from_file_header(&sb.magic);
    let check_header = match source_codec {
        Some(c) => c.file_header(),
        None => SQLITE_FILE_HEADER,
    };
    let sniffed = sniff(&sb, &check_header)?;
    let page_size = sniffed.page_size as usize;
    log::debug!(
        "shrink: source={:?} target={target:?} pagesize={page_size} datastart={}",
        source_codec,
        sniffed.data_start
    );

    output.truncate(0)?;

    let file_size = input.len()?;
    let nr_pages = file_size.div_ceil(page_size as u64);
    let mut buf = vec![0u8; page_size];

    for page in 0..nr_pages {
        let offset = page * page_size as u64;
        let got = input.read_at(&mut buf, offset)?;
        if got < page_size && page != nr_pages - 1 {
            return Err(Error::Corrupt);
        }

        let mut raw = buf[..got].to_vec();

        // A verified frame from the source codec either passes straight
        // through (same target codec) or is unpacked for re-encoding.
        if let Some(src) = source_codec {
            if let Ok(Some(head)) = PageHead::verify(&raw, offset, sniffed.page_size) {
                let clen = head.len.get() as usize;
                if target == Target::Codec(src) {
                    raw.truncate(PAGE_HEAD_SIZE + clen);
                    output.truncate(offset + raw.len() as u64)?;
                    output.write_at(&raw, offset)?;
                    output.truncate(offset + page_size as u64)?;
                    continue;
                }
                let data = src.decompress(&raw[PAGE_HEAD_SIZE..PAGE_HEAD_SIZE + clen], page_size)?;
                raw = data;
                raw.resize(page_size, 0);
            }
        }
        if page == 0 {
            raw[..16].copy_from_slice(&target.header());
        }

        // Re-encode the logical content for the target.
        let out = match target {
            Target::Codec(codec) if offset + page_size as u64 > sniffed.data_start => {
                match codec.compress(&raw, page_size - PAGE_HEAD_SIZE) {
                    Some(payload) => {
                        let mut framed = Vec::with_capacity(PAGE_HEAD_SIZE + payload.len());
                        framed.extend_from_slice(
                            PageHead::new(payload.len() as u16, page as u32).as_bytes(),
                        );
                        framed.extend_from_slice(&payload);
                        framed
                    }
                    None => raw,
                }
            }
            _ => raw,
        };

        // Shrink to the compressed end before the write so the host
        // filesystem will not preallocate, then grow to a page boundary
        // so later reads are never short.
        output.truncate(offset + out.len() as u64)?;
        output.write_at(&out, offset)?;
        log::trace!("shrink page {page}: {} -> {} bytes", got, out.len());
        if out.len() != page_size {
            output.truncate(offset + page_size as u64)?;
        }
    }

    Ok(())
}

/// Path-based convenience wrapper used by the CLI.
pub fn shrink_file(
    input: &std::path::Path,
    output: &std::path::Path,
    target: Target,
) -> Result<()> {
    if input.canonicalize().ok() == output.canonicalize().ok() && output.exists() {
        return Err(Error::Exists(output.display().to_string()));
    }
    let mut infile = FileVfs::open_readonly(input)?;
    let mut outfile = FileVfs::open(output)?;
    shrink(&mut infile, &mut outfile, target)
}
