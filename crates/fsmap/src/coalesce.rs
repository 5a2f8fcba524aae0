// SPDX-FileCopyrightText: Copyright © 2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Extent coalescing
//!
//! Drivers emit raw extents one block run at a time; this merges adjacent
//! runs into maximal extents before they reach the database. Coalescing is
//! per (inode, fork): the driver drains the coalescer whenever it moves to
//! a different inode or fork.

use crate::record::{Extent, ExtentFlags, MAX_EXTENT_LENGTH};

/// Merges physically and logically adjacent extents with identical state.
#[derive(Debug, Default)]
pub struct Coalescer {
    tail: Option<Extent>,
}

impl Coalescer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one raw extent. Returns the previous tail when the new extent
    /// could not be merged into it; the caller inserts that into the sink.
    pub fn feed(&mut self, ext: Extent) -> Option<Extent> {
        match self.tail {
            Some(ref mut last) if Self::mergeable(last, &ext) => {
                last.length += ext.length;
                log::debug!("merged: ino={} len={}", last.ino, last.length);
                None
            }
            _ => self.tail.replace(ext),
        }
    }

    /// Emit the pending tail, if any.
    pub fn flush(&mut self) -> Option<Extent> {
        self.tail.take()
    }

    fn mergeable(last: &Extent, next: &Extent) -> bool {
        // Inline extents are sub-block and never merge.
        if last.flags.contains(ExtentFlags::DATA_INLINE) || next.flags.contains(ExtentFlags::DATA_INLINE) {
            return false;
        }
        let logical_adjacent = match (last.logical, next.logical) {
            (Some(a), Some(b)) => a + last.length == b,
            (None, None) => true,
            _ => false,
        };
        last.ino == next.ino
            && last.kind == next.kind
            && last.flags == next.flags
            && last.physical + last.length == next.physical
            && logical_adjacent
            && last.length + next.length <= MAX_EXTENT_LENGTH
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{ExtentKind, MAX_EXTENT_LENGTH};

    fn ext(physical: u64, logical: u64, length: u64) -> Extent {
        Extent {
            ino: 12,
            physical,
            logical: Some(logical),
            length,
            flags: ExtentFlags::empty(),
            kind: ExtentKind::File,
        }
    }

    #[test]
    fn adjacent_runs_merge() {
        let mut c = Coalescer::new();
        assert_eq!(c.feed(ext(4096, 0, 4096)), None);
        assert_eq!(c.feed(ext(8192, 4096, 4096)), None);
        let out = c.flush().unwrap();
        assert_eq!(out.physical, 4096);
        assert_eq!(out.length, 8192);
        assert_eq!(c.flush(), None);
    }

    #[test]
    fn physical_hole_flushes_tail() {
        let mut c = Coalescer::new();
        assert_eq!(c.feed(ext(4096, 0, 4096)), None);
        let flushed = c.feed(ext(16384, 4096, 4096)).unwrap();
        assert_eq!(flushed.length, 4096);
        assert_eq!(c.flush().unwrap().physical, 16384);
    }

    #[test]
    fn logical_hole_never_merges() {
        // Physically adjacent but a 1 MiB gap in the file
        let mut c = Coalescer::new();
        assert_eq!(c.feed(ext(4096, 0, 4096)), None);
        assert!(c.feed(ext(8192, 1 << 20, 4096)).is_some());
    }

    #[test]
    fn differing_flags_never_merge() {
        let mut c = Coalescer::new();
        let mut unwritten = ext(8192, 4096, 4096);
        unwritten.flags = ExtentFlags::UNWRITTEN;
        assert_eq!(c.feed(ext(4096, 0, 4096)), None);
        assert!(c.feed(unwritten).is_some());
    }

    #[test]
    fn merge_respects_length_cap() {
        let mut c = Coalescer::new();
        assert_eq!(c.feed(ext(0, 0, MAX_EXTENT_LENGTH - 512)), None);
        let flushed = c.feed(ext(MAX_EXTENT_LENGTH - 512, MAX_EXTENT_LENGTH - 512, 4096));
        assert!(flushed.is_some());
    }

    #[test]
    fn inline_extents_never_merge() {
        let mut c = Coalescer::new();
        let mut a = ext(100, 0, 60);
        a.flags = ExtentFlags::DATA_INLINE | ExtentFlags::NOT_ALIGNED;
        let mut b = ext(160, 60, 60);
        b.flags = ExtentFlags::DATA_INLINE | ExtentFlags::NOT_ALIGNED;
        assert_eq!(c.feed(a), None);
        assert!(c.feed(b).is_some());
    }

    #[test]
    fn metadata_extents_without_logical_merge() {
        let mut c = Coalescer::new();
        let mut a = ext(4096, 0, 4096);
        a.logical = None;
        a.kind = ExtentKind::Metadata;
        let mut b = ext(8192, 0, 4096);
        b.logical = None;
        b.kind = ExtentKind::Metadata;
        assert_eq!(c.feed(a), None);
        assert_eq!(c.feed(b), None);
        assert_eq!(c.flush().unwrap().length, 8192);
    }
}
