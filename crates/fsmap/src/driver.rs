// SPDX-FileCopyrightText: Copyright © 2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! The seam between the per-filesystem drivers and the mapper binaries

use crate::sink::Sink;
use crate::Result;

/// Volume-wide statistics recorded in `fs_t`
#[derive(Debug, Clone)]
pub struct VolumeStats {
    /// Device path as given on the command line
    pub path: String,
    pub block_size: u32,
    pub frag_size: u32,
    pub total_bytes: u64,
    pub free_bytes: u64,
    pub avail_bytes: u64,
    pub total_inodes: u64,
    pub free_inodes: u64,
    pub avail_inodes: u64,
    pub max_name_len: u32,
}

/// One filesystem kind's walker. Opening the volume is the driver's own
/// constructor; it must be read-only and fail with `NotAFileSystem` when
/// the magic or structural sanity checks reject the device.
pub trait FsDriver {
    /// Run the whole mapping pipeline against a database file. This is
    /// the phase order every mapper binary follows; failures carry the
    /// phase they happened in.
    fn run(&mut self, dbfile: &std::path::Path) -> Result<()>
    where
        Self: Sized,
    {
        use crate::Context;

        // The schema pragmas only take effect on a fresh database file.
        match std::fs::remove_file(dbfile) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(crate::Error::Io(e)).during("truncating database"),
        }

        let mut sink = Sink::open(dbfile).during("opening database")?;
        sink.prepare().during("preparing database")?;

        sink.begin().during("starting fs analysis database transaction")?;
        let stats = self.volume_stats().during("collecting fs statistics")?;
        sink.collect_fs_stats(&stats).during("storing fs stats")?;
        self.walk_tree(&mut sink).during("analyzing filesystem")?;
        self.walk_metadata(&mut sink).during("analyzing metadata")?;
        sink.index_db().during("indexing database")?;
        sink.finalize_fs_stats(&stats.path).during("finalizing database")?;
        sink.calc_inode_stats().during("calculating inode statistics")?;
        sink.commit().during("flushing fs analysis database transaction")?;

        sink.begin().during("starting overview cache database transaction")?;
        sink.cache_overview(2048).during("caching CLI overview")?;
        sink.cache_overview(65536).during("caching GUI overview")?;
        sink.commit().during("flushing overview cache database transaction")?;
        Ok(())
    }

    /// Statistics for the `fs_t` row
    fn volume_stats(&mut self) -> Result<VolumeStats>;

    /// Walk the directory tree from the root, emitting one inode and one
    /// dentry per regular file, directory or symlink encountered, followed
    /// by that inode's extents. Every inode is visited at most once.
    fn walk_tree(&mut self, sink: &mut Sink) -> Result<()>;

    /// Synthesize the `/$metadata` tree describing the filesystem's own
    /// metadata objects.
    fn walk_metadata(&mut self, sink: &mut Sink) -> Result<()>;
}
