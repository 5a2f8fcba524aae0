// SPDX-FileCopyrightText: Copyright © 2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! The closed codec registry
//!
//! Every codec presents a one-shot byte-buffer facade over a streaming
//! engine. Compression that cannot fit inside the output cap reports
//! "incompressible" rather than erroring; decompression failures mean the
//! payload is corrupt. Neither direction ever writes past the cap.

use crate::{Error, Result};

/// A compression engine selected at open time.
///
/// The registry order matters: the first entry is the default when no
/// codec is named.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    Gzip,
    Lz4,
    Lz4hc,
    Lzma,
    Bzip2,
}

/// Registry order, default first
const REGISTRY: [Codec; 5] = [Codec::Gzip, Codec::Lz4, Codec::Lz4hc, Codec::Lzma, Codec::Bzip2];

/// zlib level used for GZIP pages
const GZIP_LEVEL: u32 = 5;
/// LZ4 high-compression effort
const LZ4HC_LEVEL: i32 = 8;
/// xz preset for LZMA pages
const LZMA_PRESET: u32 = 6;
/// bzip2 block size (100 kB units) and work factor
const BZIP_LEVEL: u32 = 1;
const BZIP_WORK_FACTOR: u32 = 30;

impl Codec {
    /// Registry name, always 4 characters.
    pub fn name(self) -> &'static str {
        match self {
            Codec::Gzip => "GZIP",
            Codec::Lz4 => "LZ4D",
            Codec::Lz4hc => "LZ4H",
            Codec::Lzma => "LZMA",
            Codec::Bzip2 => "BZ2A",
        }
    }

    /// Look up a codec by registry name; `None` selects the default.
    pub fn find(name: Option<&str>) -> Result<Codec> {
        match name {
            None => Ok(REGISTRY[0]),
            Some(n) => REGISTRY
                .iter()
                .copied()
                .find(|c| c.name() == n)
                .ok_or_else(|| Error::NotFound(n.to_string())),
        }
    }

    /// Comma-separated list of registry names.
    pub fn list() -> String {
        REGISTRY.map(|c| c.name()).join(",")
    }

    /// The 16-byte file header written to a database compressed with this
    /// codec: `"SQLite <CODEC> v.3"` padded with zeroes.
    pub fn file_header(self) -> [u8; 16] {
        let mut hdr = [0u8; 16];
        let s = format!("SQLite {} v.3", self.name());
        hdr[..s.len()].copy_from_slice(s.as_bytes());
        hdr
    }

    /// Recover the codec from a database file header, if it is one of ours.
    pub fn from_file_header(hdr: &[u8; 16]) -> Option<Codec> {
        REGISTRY.iter().copied().find(|c| c.file_header() == *hdr)
    }

    /// Compress `src` into at most `cap` bytes. `None` means the data is
    /// incompressible within the cap and the caller should store it raw.
    pub fn compress(self, src: &[u8], cap: usize) -> Option<Vec<u8>> {
        match self {
            Codec::Gzip => gzip_compress(src, cap),
            Codec::Lz4 => lz4_compress(src, cap, None),
            Codec::Lz4hc => lz4_compress(src, cap, Some(LZ4HC_LEVEL)),
            Codec::Lzma => lzma_compress(src, cap),
            Codec::Bzip2 => bzip_compress(src, cap),
        }
    }

    /// Decompress `src` into at most `cap` bytes. Any engine failure means
    /// the payload does not round back to a page and is reported as
    /// [`Error::Corrupt`].
    pub fn decompress(self, src: &[u8], cap: usize) -> Result<Vec<u8>> {
        match self {
            Codec::Gzip => gzip_decompress(src, cap),
            Codec::Lz4 | Codec::Lz4hc => lz4_decompress(src, cap),
            Codec::Lzma => lzma_decompress(src, cap),
            Codec::Bzip2 => bzip_decompress(src, cap),
        }
    }
}

fn gzip_compress(src: &[u8], cap: usize) -> Option<Vec<u8>> {
    use flate2::{Compress, Compression, FlushCompress, Status};

    let mut strm = Compress::new(Compression::new(GZIP_LEVEL), true);
    let mut out = Vec::with_capacity(cap);
    match strm.compress_vec(src, &mut out, FlushCompress::Finish) {
        Ok(Status::StreamEnd) => Some(out),
        _ => None,
    }
}

fn gzip_decompress(src: &[u8], cap: usize) -> Result<Vec<u8>> {
    use flate2::{Decompress, FlushDecompress, Status};

    let mut strm = Decompress::new(true);
    let mut out = Vec::with_capacity(cap);
    match strm.decompress_vec(src, &mut out, FlushDecompress::Finish) {
        Ok(Status::StreamEnd) => Ok(out),
        _ => Err(Error::Corrupt),
    }
}

fn lz4_compress(src: &[u8], cap: usize, level: Option<i32>) -> Option<Vec<u8>> {
    use lz4::block::{compress_to_buffer, CompressionMode};

    let mode = match level {
        Some(l) => CompressionMode::HIGHCOMPRESSION(l),
        None => CompressionMode::DEFAULT,
    };
    let mut out = vec![0u8; cap];
    match compress_to_buffer(src, Some(mode), false, &mut out) {
        Ok(n) if n > 0 => {
            out.truncate(n);
            Some(out)
        }
        _ => None,
    }
}

fn lz4_decompress(src: &[u8], cap: usize) -> Result<Vec<u8>> {
    use lz4::block::decompress_to_buffer;

    let mut out = vec![0u8; cap];
    match decompress_to_buffer(src, Some(cap as i32), &mut out) {
        Ok(n) => {
            out.truncate(n);
            Ok(out)
        }
        Err(_) => Err(Error::Corrupt),
    }
}

fn lzma_compress(src: &[u8], cap: usize) -> Option<Vec<u8>> {
    use xz2::stream::{Action, Check, Status, Stream};

    let mut strm = Stream::new_easy_encoder(LZMA_PRESET, Check::Crc64).ok()?;
    let mut out = vec![0u8; cap];
    match strm.process(src, &mut out, Action::Finish) {
        Ok(Status::StreamEnd) => {
            out.truncate(strm.total_out() as usize);
            Some(out)
        }
        _ => None,
    }
}

fn lzma_decompress(src: &[u8], cap: usize) -> Result<Vec<u8>> {
    use xz2::stream::{Action, Status, Stream};

    let flags = xz2::stream::TELL_UNSUPPORTED_CHECK | xz2::stream::CONCATENATED;
    let mut strm = Stream::new_stream_decoder(u64::MAX, flags).map_err(|_| Error::Corrupt)?;
    let mut out = vec![0u8; cap];
    match strm.process(src, &mut out, Action::Finish) {
        Ok(Status::StreamEnd) => {
            out.truncate(strm.total_out() as usize);
            Ok(out)
        }
        _ => Err(Error::Corrupt),
    }
}

fn bzip_compress(src: &[u8], cap: usize) -> Option<Vec<u8>> {
    use bzip2::{Action, Compress, Compression, Status};

    let mut strm = Compress::new(Compression::new(BZIP_LEVEL), BZIP_WORK_FACTOR);
    let mut out = vec![0u8; cap];
    match strm.compress(src, &mut out, Action::Finish) {
        Ok(Status::StreamEnd) => {
            out.truncate(strm.total_out() as usize);
            Some(out)
        }
        _ => None,
    }
}

fn bzip_decompress(src: &[u8], cap: usize) -> Result<Vec<u8>> {
    use bzip2::{Decompress, Status};

    let mut strm = Decompress::new(false);
    let mut out = vec![0u8; cap];
    match strm.decompress(src, &mut out) {
        Ok(Status::StreamEnd) => {
            out.truncate(strm.total_out() as usize);
            Ok(out)
        }
        _ => Err(Error::Corrupt),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compressible_page(len: usize) -> Vec<u8> {
        // A plausible b-tree page: sparse, repetitive content
        let mut page = vec![0u8; len];
        for (i, b) in page.iter_mut().enumerate().take(len / 4) {
            *b = (i % 251) as u8;
        }
        page
    }

    fn incompressible_page(len: usize) -> Vec<u8> {
        // Keyed xorshift noise; no codec gets a grip on this
        let mut state = 0x9e3779b97f4a7c15u64;
        (0..len)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 7;
                state ^= state << 17;
                (state >> 32) as u8
            })
            .collect()
    }

    #[test]
    fn registry_names_and_default() {
        assert_eq!(Codec::list(), "GZIP,LZ4D,LZ4H,LZMA,BZ2A");
        assert_eq!(Codec::find(None).unwrap(), Codec::Gzip);
        assert_eq!(Codec::find(Some("LZ4H")).unwrap(), Codec::Lz4hc);
        assert!(matches!(Codec::find(Some("ZSTD")), Err(Error::NotFound(_))));
    }

    #[test]
    fn file_headers_are_sixteen_bytes_and_distinct() {
        for codec in [Codec::Gzip, Codec::Lz4, Codec::Lz4hc, Codec::Lzma, Codec::Bzip2] {
            let hdr = codec.file_header();
            assert!(hdr.starts_with(b"SQLite "));
            assert_eq!(Codec::from_file_header(&hdr), Some(codec));
        }
        assert_eq!(
            &Codec::Lz4.file_header()[..],
            b"SQLite LZ4D v.3\0"
        );
        assert_eq!(Codec::from_file_header(b"SQLite format 3\0"), None);
    }

    #[test]
    fn every_codec_round_trips() {
        let page = compressible_page(4096);
        for codec in [Codec::Gzip, Codec::Lz4, Codec::Lz4hc, Codec::Lzma, Codec::Bzip2] {
            let packed = codec
                .compress(&page, 4096 - 8)
                .unwrap_or_else(|| panic!("{} did not compress", codec.name()));
            assert!(packed.len() <= 4096 - 8);
            let unpacked = codec.decompress(&packed, 4096).unwrap();
            assert_eq!(unpacked, page, "{} round trip", codec.name());
        }
    }

    #[test]
    fn incompressible_input_reports_none() {
        let page = incompressible_page(4096);
        for codec in [Codec::Gzip, Codec::Lz4, Codec::Lz4hc, Codec::Lzma, Codec::Bzip2] {
            assert!(
                codec.compress(&page, 4096 - 8).is_none(),
                "{} should not fit noise under the cap",
                codec.name()
            );
        }
    }

    #[test]
    fn garbage_fails_decompression() {
        let junk = incompressible_page(512);
        for codec in [Codec::Gzip, Codec::Lzma, Codec::Bzip2] {
            assert!(matches!(codec.decompress(&junk, 4096), Err(Error::Corrupt)));
        }
    }

    #[test]
    fn lz4_variants_share_a_decoder() {
        let page = compressible_page(4096);
        let packed = Codec::Lz4hc.compress(&page, 4096 - 8).unwrap();
        assert_eq!(Codec::Lz4.decompress(&packed, 4096).unwrap(), page);
    }

    #[test]
    fn zero_page_shrinks_dramatically() {
        let page = vec![0u8; 65536];
        let packed = Codec::Gzip.compress(&page, 65536 - 8).unwrap();
        assert!(packed.len() < 1024);
    }
}
