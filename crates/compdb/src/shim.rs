// SPDX-FileCopyrightText: Copyright © 2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! The page shim
//!
//! Interposes on every read and write the host engine performs on a main
//! database file. Journals, WALs and temp files do not come through here;
//! they belong to the plain VFS.
//!
//! Per-file state machine: `Unknown -> Pristine` or `Unknown -> Compressed`,
//! decided by the first sniff and never revisited. An empty file stays
//! `Unknown` until the first superblock write.
//!
//! The codec is bound to the open handle, not to the file: the shim
//! forges a pristine header on every offset-0 read, so a later open with
//! a different codec's shim cannot learn which codec wrote the pages.
//! Reopening with the wrong codec classifies the file as not-a-database.

use zerocopy::{FromBytes, IntoBytes};

use crate::page::{PageHead, PAGE_HEAD_SIZE};
use crate::superblock::{sniff, SqliteSuper, SQLITE_FILE_HEADER, SUPER_SIZE};
use crate::vfs::Vfs;
use crate::{Codec, Error, Result};

/// Classification of an open database file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbKind {
    Unknown,
    Pristine,
    Compressed,
}

/// A database file with transparent page compression.
#[derive(Debug)]
pub struct ShimFile<V: Vfs> {
    inner: V,
    codec: Codec,
    header: [u8; 16],
    kind: DbKind,
    page_size: u32,
    /// Byte offset where the b-tree region begins
    data_start: u64,
}

impl<V: Vfs> ShimFile<V> {
    /// Wrap an open file. A non-empty file is sniffed immediately; an
    /// empty one defers classification to the first write.
    pub fn open(inner: V, codec: Codec) -> Result<Self> {
        let mut shim = Self {
            inner,
            codec,
            header: codec.file_header(),
            kind: DbKind::Unknown,
            page_size: 0,
            data_start: 0,
        };

        let mut buf = [0u8; SUPER_SIZE];
        let n = shim.inner.read_at(&mut buf, 0)?;
        if n < SUPER_SIZE {
            // Empty (or embryonic) database: wait for the first write.
            return Ok(shim);
        }
        let sb = SqliteSuper::read_from_bytes(buf.as_slice()).expect("buffer is exactly one superblock");
        let sniffed = sniff(&sb, &shim.header)?;
        shim.kind = if sniffed.pristine { DbKind::Pristine } else { DbKind::Compressed };
        shim.page_size = sniffed.page_size;
        shim.data_start = sniffed.data_start;
        Ok(shim)
    }

    pub fn kind(&self) -> DbKind {
        self.kind
    }

    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    pub fn codec(&self) -> Codec {
        self.codec
    }

    pub fn into_inner(self) -> V {
        self.inner
    }

    pub fn inner_mut(&mut self) -> &mut V {
        &mut self.inner
    }

    /// Read `buf.len()` bytes at `offset`, decompressing b-tree pages.
    /// Returns the number of bytes placed in `buf`.
    pub fn read_at(&mut self, buf: &mut [u8], offset: u64) -> Result<usize> {
        let n = self.inner.read_at(buf, offset)?;

        if self.kind == DbKind::Compressed && offset == 0 && buf.len() >= 16 {
            // The engine must always see a normal database header.
            buf[..16].copy_from_slice(&SQLITE_FILE_HEADER);
        }

        // Non-btree regions and raw pages pass through verbatim.
        if self.kind != DbKind::Compressed || offset + buf.len() as u64 <= self.data_start {
            log::trace!("read passthrough: len={} off={offset}", buf.len());
            return Ok(n);
        }
        let head = match PageHead::verify(buf, offset, self.page_size) {
            Ok(Some(head)) => head,
            Ok(None) => {
                log::trace!("read raw page: len={} off={offset}", buf.len());
                return Ok(n);
            }
            Err(()) => return Err(Error::Corrupt),
        };

        let clen = head.len.get() as usize;
        let data = self
            .codec
            .decompress(&buf[PAGE_HEAD_SIZE..PAGE_HEAD_SIZE + clen], self.page_size as usize)?;

        // The decompressed payload may be shorter than a page when the
        // page had trailing zeroes; the caller asked for a full page.
        let fill = buf.len().min(self.page_size as usize);
        let copy = data.len().min(fill);
        buf[..copy].copy_from_slice(&data[..copy]);
        buf[copy..fill].fill(0);
        log::trace!("read unpacked: len={} off={offset} clen={clen}", data.len());
        Ok(fill)
    }

    /// Write `buf` at `offset`, compressing b-tree pages.
    pub fn write_at(&mut self, buf: &[u8], offset: u64) -> Result<()> {
        if self.kind == DbKind::Unknown {
            // First write must be a full superblock at offset zero.
            if offset != 0 || buf.len() < SUPER_SIZE {
                return Err(Error::NotADatabase);
            }
            let (sb, _) = SqliteSuper::read_from_prefix(buf).expect("length checked above");
            let sniffed = sniff(&sb, &self.header)?;
            // A file we get to write becomes compressed regardless of the
            // header it arrived with.
            self.kind = DbKind::Compressed;
            self.page_size = sniffed.page_size;
            self.data_start = sniffed.data_start;
        }

        if self.kind == DbKind::Pristine || offset + buf.len() as u64 <= self.data_start {
            return self.write_plain(buf, offset);
        }

        let cap = self.page_size as usize - PAGE_HEAD_SIZE;
        let Some(payload) = self.codec.compress(buf, cap) else {
            log::trace!("write incompressible: len={} off={offset}", buf.len());
            return self.write_plain(buf, offset);
        };

        let mut framed = Vec::with_capacity(PAGE_HEAD_SIZE + payload.len());
        framed.extend_from_slice(
            PageHead::new(payload.len() as u16, (offset / u64::from(self.page_size)) as u32).as_bytes(),
        );
        framed.extend_from_slice(&payload);
        log::trace!("write packed: len={} off={offset} clen={}", buf.len(), framed.len());

        // Shrink to the compressed end before writing so the host
        // filesystem cannot speculatively preallocate the gap, then grow
        // back to a page boundary so later reads are never short.
        let page_end = offset + buf.len() as u64;
        if page_end >= self.inner.len()? {
            self.inner.truncate(offset + framed.len() as u64)?;
        }
        self.inner.write_at(&framed, offset)?;
        if self.inner.len()? < page_end {
            self.inner.truncate(page_end)?;
        }
        Ok(())
    }

    fn write_plain(&mut self, buf: &[u8], offset: u64) -> Result<()> {
        self.inner.write_at(buf, offset)?;
        if offset != 0 || self.kind != DbKind::Compressed {
            return Ok(());
        }
        // Keep the on-disk header claiming our codec.
        let header = self.header;
        self.inner.write_at(&header, 0)?;
        Ok(())
    }
}
