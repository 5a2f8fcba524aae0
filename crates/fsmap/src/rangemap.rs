// SPDX-FileCopyrightText: Copyright © 2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Per-allocation-group interval map
//!
//! Tracks which blocks of each allocation group a synthetic metadata file
//! owns. A bit per block would dominate memory on large volumes, so this
//! is an ordered map from start offset to tag, one per group, bounded by
//! two sentinels: `0 -> Unused` and `size * multiplier -> OutOfRange`.
//! Invariants: the terminator is the unique key at or past the group size,
//! and two consecutive keys never carry the same tag.

use std::collections::BTreeMap;
use std::ops::Bound::{Excluded, Unbounded};

/// State of a block interval
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tag {
    Unused,
    InUse,
    OutOfRange,
}

/// One contiguous `(start, length, tag)` run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Run {
    pub start: u64,
    pub length: u64,
    pub tag: Tag,
}

/// Interval map over block offsets, one ordered map per allocation group.
#[derive(Debug)]
pub struct RangeMap {
    groups: Vec<BTreeMap<u64, Tag>>,
    limits: Vec<u64>,
}

impl RangeMap {
    /// Create one map per group. `sizes` holds each group's block count;
    /// `multiplier` scales it (e.g. inodes per block for inode maps).
    pub fn new(sizes: &[u64], multiplier: u64) -> Self {
        let mut groups = Vec::with_capacity(sizes.len());
        let mut limits = Vec::with_capacity(sizes.len());
        for &size in sizes {
            let limit = size * multiplier;
            let mut m = BTreeMap::new();
            m.insert(0, Tag::Unused);
            m.insert(limit, Tag::OutOfRange);
            groups.push(m);
            limits.push(limit);
        }
        Self { groups, limits }
    }

    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    pub fn group_limit(&self, group: usize) -> u64 {
        self.limits[group]
    }

    /// Set `[start, start + length)` of one group to `tag`, merging with
    /// equal neighbors and splitting runs as needed. Callers never span
    /// more than one differing run per call.
    pub fn set(&mut self, group: usize, start: u64, length: u64, tag: Tag) {
        assert!(length > 0);
        log::debug!("rangemap set: group={group} start={start} len={length} tag={tag:?}");
        let end = start + length;
        let m = &mut self.groups[group];

        // Run boundary at or after start; the terminator guarantees one.
        let (&cur_key, &cur_tag) = match m.range(start..).next() {
            Some(entry) => entry,
            None => return,
        };

        if start == cur_key {
            if cur_tag == tag {
                return;
            }
            // May be absent when updating the run at offset 0.
            let prev_tag = m.range(..start).next_back().map(|(_, &t)| t);
            let (&next_key, &next_tag) = m
                .range((Excluded(start), Unbounded))
                .next()
                .expect("terminator present");

            if next_key > end {
                if prev_tag == Some(tag) {
                    // Same tag as the previous run: move this boundary up.
                    m.remove(&start);
                    m.insert(end, cur_tag);
                } else {
                    // Retag the head, reopen the old tag at end.
                    m.insert(start, tag);
                    m.insert(end, cur_tag);
                }
                return;
            }

            // Same start and same end as the current run.
            if next_tag == tag {
                if prev_tag == Some(tag) {
                    // Bridges previous and next: both boundaries vanish.
                    m.remove(&start);
                    m.remove(&end);
                } else {
                    m.insert(start, tag);
                    m.remove(&end);
                }
                return;
            }
            if prev_tag == Some(tag) {
                m.remove(&start);
                return;
            }
            m.insert(start, tag);
            return;
        }

        // start falls inside the run beginning before it
        let prev_tag = *m
            .range(..start)
            .next_back()
            .expect("interval map covers offset 0")
            .1;
        if prev_tag == tag {
            return;
        }
        if end == cur_key {
            if cur_tag == tag {
                // Pull the following run's start down to start.
                let t = m.remove(&cur_key).expect("current boundary present");
                m.insert(start, t);
            } else {
                m.insert(start, tag);
            }
            return;
        }
        // Split the surrounding run around [start, end).
        m.insert(start, tag);
        m.insert(end, prev_tag);
    }

    /// Tag covering `offset`
    pub fn test(&self, group: usize, offset: u64) -> Tag {
        *self.groups[group]
            .range(..=offset)
            .next_back()
            .expect("interval map covers offset 0")
            .1
    }

    /// Contiguous runs of one group in ascending order, terminator excluded
    pub fn runs(&self, group: usize) -> impl Iterator<Item = Run> + '_ {
        let m = &self.groups[group];
        m.iter()
            .zip(m.iter().skip(1))
            .map(|((&start, &tag), (&next, _))| Run {
                start,
                length: next - start,
                tag,
            })
    }
}
