// SPDX-FileCopyrightText: Copyright © 2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Compressed page framing
//!
//! Every compressed page starts with an 8-byte head: a 2-byte magic, the
//! big-endian compressed payload length, and the big-endian page number.
//! The magic byte 0xDA can never begin a b-tree page, which is what makes
//! in-place detection sound.

use zerocopy::big_endian::{U16, U32};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

/// Leading bytes of every compressed page
pub const PAGE_MAGIC: [u8; 2] = [0xDA, 0xAD];

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
pub struct PageHead {
    pub magic: [u8; 2],
    /// Compressed payload length
    pub len: U16,
    /// Page number; must equal `offset / page_size`
    pub page: U32,
}

pub const PAGE_HEAD_SIZE: usize = std::mem::size_of::<PageHead>();

impl PageHead {
    pub fn new(len: u16, page: u32) -> Self {
        Self {
            magic: PAGE_MAGIC,
            len: U16::new(len),
            page: U32::new(page),
        }
    }

    /// Parse and verify the framing of a page read at `offset`. `Ok(None)`
    /// means the page is not framed at all (stored raw); `Err(())` means
    /// the framing is present but inconsistent.
    pub fn verify(buf: &[u8], offset: u64, page_size: u32) -> Result<Option<PageHead>, ()> {
        let Ok((head, _)) = PageHead::read_from_prefix(buf) else {
            return Ok(None);
        };
        if head.magic != PAGE_MAGIC {
            return Ok(None);
        }
        let clen = head.len.get() as usize;
        if clen > page_size as usize - PAGE_HEAD_SIZE {
            return Err(());
        }
        if u64::from(head.page.get()) * u64::from(page_size) != offset {
            return Err(());
        }
        Ok(Some(head))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn head_is_eight_bytes() {
        assert_eq!(PAGE_HEAD_SIZE, 8);
        let head = PageHead::new(300, 7);
        assert_eq!(head.as_bytes(), &[0xDA, 0xAD, 0x01, 0x2C, 0x00, 0x00, 0x00, 0x07]);
    }

    #[test]
    fn verify_accepts_matching_framing() {
        let mut page = vec![0u8; 1024];
        page[..8].copy_from_slice(PageHead::new(100, 3).as_bytes());
        let head = PageHead::verify(&page, 3 * 1024, 1024).unwrap().unwrap();
        assert_eq!(head.len.get(), 100);
    }

    #[test]
    fn verify_passes_unframed_pages_through() {
        let page = vec![0u8; 1024];
        assert!(PageHead::verify(&page, 0, 1024).unwrap().is_none());
    }

    #[test]
    fn verify_rejects_wrong_page_number() {
        let mut page = vec![0u8; 1024];
        page[..8].copy_from_slice(PageHead::new(100, 4).as_bytes());
        assert!(PageHead::verify(&page, 3 * 1024, 1024).is_err());
    }

    #[test]
    fn verify_rejects_oversized_length() {
        let mut page = vec![0u8; 1024];
        page[..8].copy_from_slice(PageHead::new(1020, 0).as_bytes());
        assert!(PageHead::verify(&page, 0, 1024).is_err());
    }
}
