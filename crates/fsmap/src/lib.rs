// SPDX-FileCopyrightText: Copyright © 2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Shared core for the filesystem mappers
//!
//! Each mapper walks one filesystem image and streams a normalized set of
//! records (inodes, directory entries and physical extents) into a SQLite
//! database whose schema is stable for downstream viewers. This crate holds
//! everything the per-filesystem drivers have in common:
//! - the record model and extent flag set
//! - the extent coalescer that merges adjacent runs
//! - the per-allocation-group range map used to aggregate metadata blocks
//! - the record sink that owns the database connection
//! - the driver trait the binaries are written against

use std::io;

use thiserror::Error;

pub mod bitmap;
pub mod coalesce;
pub mod device;
pub mod driver;
pub mod rangemap;
pub mod record;
pub mod sink;

pub use bitmap::Bitmap;
pub use coalesce::Coalescer;
pub use device::BlockFile;
pub use driver::{FsDriver, VolumeStats};
pub use rangemap::{RangeMap, Tag};
pub use record::{Extent, ExtentFlags, ExtentKind, InodeKind, InodeTimes, MAX_EXTENT_LENGTH};
pub use sink::Sink;

/// Errors that can occur while mapping a filesystem
#[derive(Debug, Error)]
pub enum Error {
    /// An I/O error from the underlying device or image
    #[error("io: {0}")]
    Io(#[from] io::Error),

    /// The volume failed a magic or structural sanity check at open time
    #[error("not a recognized filesystem: {0}")]
    NotAFileSystem(String),

    /// A traversal step hit a value outside its declared domain
    #[error("corrupt filesystem structure: {0}")]
    CorruptStructure(String),

    /// The relational store rejected a statement
    #[error("database: {0}")]
    Store(#[from] rusqlite::Error),

    /// An error annotated with the phase it occurred in
    #[error("{source} while {activity}")]
    During {
        activity: &'static str,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// Shorthand for a corrupt-structure error from a formatted message
    pub fn corrupt(msg: impl Into<String>) -> Self {
        Error::CorruptStructure(msg.into())
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Labels errors with the enclosing activity, for the CLI failure format
/// `"<message> while <activity>"`.
pub trait Context<T> {
    fn during(self, activity: &'static str) -> Result<T>;
}

impl<T, E: Into<Error>> Context<T> for std::result::Result<T, E> {
    fn during(self, activity: &'static str) -> Result<T> {
        self.map_err(|e| Error::During {
            activity,
            source: Box::new(e.into()),
        })
    }
}

/// Recode raw filename bytes to UTF-8, substituting the replacement
/// character for invalid sequences. A single undecodable name must never
/// abort a whole filesystem walk.
pub fn name_to_utf8(raw: &[u8]) -> String {
    String::from_utf8_lossy(raw).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn activity_label_formats() {
        let err: Result<()> = Err(Error::corrupt("bad extent header")).during("analyzing filesystem");
        let msg = err.unwrap_err().to_string();
        assert_eq!(
            msg,
            "corrupt filesystem structure: bad extent header while analyzing filesystem"
        );
    }

    #[test]
    fn bad_names_are_replaced() {
        assert_eq!(name_to_utf8(b"ok.txt"), "ok.txt");
        assert_eq!(name_to_utf8(&[0x66, 0xff, 0x6f]), "f\u{fffd}o");
    }
}
