// SPDX-FileCopyrightText: Copyright © 2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Transparent per-page compression for SQLite database files
//!
//! A database file is a superblock page followed by fixed-size pages, the
//! bulk of which hold b-tree content. This crate interposes on page-aligned
//! reads and writes of such a file, compressing b-tree pages on write and
//! decompressing them on read, while leaving the superblock and freelist
//! region untouched. The engine above the shim always observes a pristine
//! database.
//!
//! The pieces, in dependency order: the [`codec`] registry, the
//! [`superblock`] sniffer that classifies a file, the [`shim`] that
//! re-maps live page I/O, and the offline [`shrink`] converter.

use std::io;

use thiserror::Error;

pub mod codec;
pub mod page;
pub mod shim;
pub mod shrink;
pub mod superblock;
pub mod vfs;

pub use codec::Codec;
pub use page::{PageHead, PAGE_MAGIC};
pub use shim::ShimFile;
pub use shrink::{shrink, shrink_file, Target};
pub use superblock::{sniff, Sniff, SqliteSuper, SQLITE_FILE_HEADER};
pub use vfs::{FileVfs, MemVfs, Vfs};

/// Errors surfaced by the compression layer
#[derive(Debug, Error)]
pub enum Error {
    /// An underlying read/write/truncate failed
    #[error("io: {0}")]
    Io(#[from] io::Error),

    /// The file is not a database we recognize
    #[error("not a database")]
    NotADatabase,

    /// Bad page framing or a codec failure on data we wrote
    #[error("corrupt compressed page")]
    Corrupt,

    /// Scratch allocation failed
    #[error("out of memory")]
    NoMemory,

    /// Named codec is not in the registry
    #[error("no such codec: {0}")]
    NotFound(String),

    /// The target already exists
    #[error("already exists: {0}")]
    Exists(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
