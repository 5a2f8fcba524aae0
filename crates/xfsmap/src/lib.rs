// SPDX-FileCopyrightText: Copyright © 2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! XFS filesystem walker
//!
//! Native on-disk parsing of V4 and V5 volumes: superblock, allocation
//! group headers, inode records with local/extent/btree forks, packed
//! block-map records and the dir2 directory formats. The metadata
//! synthesizer descends the per-group btrees and aggregates their blocks
//! through range maps.

use std::path::Path;

use fsmap::{
    BlockFile, Coalescer, Error, Extent, ExtentFlags, ExtentKind, FsDriver, InodeKind, RangeMap,
    Result, Sink, Tag, VolumeStats,
};

pub mod ag;
pub mod bmbt;
pub mod btree;
pub mod dir2;
pub mod inode;
mod metadata;
pub mod superblock;

use bmbt::{BmbtRec, ForkVisitor};
use inode::{Fork, XfsInode, FMT_BTREE, FMT_EXTENTS, FMT_LOCAL};
use superblock::{XfsSuper, MAX_INUMBER, NAME_LEN, NULL_INO};

pub struct XfsFs {
    dev: BlockFile,
    sb: XfsSuper,
    /// Inode-seen map, one interval map per allocation group scaled by
    /// inodes per block
    seen: RangeMap,
}

/// Streams one fork's mappings into the sink, coalescing data runs and
/// recording mapping-tree blocks as their own extents.
struct ExtentCollector<'a, 'b> {
    sb: &'a XfsSuper,
    sink: &'a mut Sink,
    coalescer: &'b mut Coalescer,
    ino: i64,
    kind: ExtentKind,
}

impl ForkVisitor for ExtentCollector<'_, '_> {
    fn tree_block(&mut self, fsbno: u64, startoff: u64) -> Result<()> {
        self.sink.insert_extent(&Extent {
            ino: self.ino,
            physical: self.sb.fsb_to_bytes(fsbno),
            logical: Some(startoff * self.sb.block_size()),
            length: self.sb.block_size(),
            flags: ExtentFlags::empty(),
            kind: ExtentKind::ExtentMap,
        })
    }

    fn record(&mut self, rec: &BmbtRec) -> Result<()> {
        self.sb.check_fsb(rec.startblock)?;
        let bs = self.sb.block_size();
        let mut flags = ExtentFlags::empty();
        if rec.unwritten {
            flags |= ExtentFlags::UNWRITTEN;
        }
        let ext = Extent {
            ino: self.ino,
            physical: self.sb.fsb_to_bytes(rec.startblock),
            logical: Some(rec.startoff * bs),
            length: rec.blockcount * bs,
            flags,
            kind: self.kind,
        };
        if let Some(done) = self.coalescer.feed(ext) {
            self.sink.insert_extent(&done)?;
        }
        Ok(())
    }
}

/// Gathers a fork's data runs without touching the sink; used to read
/// directories.
#[derive(Default)]
struct RunCollector {
    runs: Vec<BmbtRec>,
}

impl ForkVisitor for RunCollector {
    fn tree_block(&mut self, _fsbno: u64, _startoff: u64) -> Result<()> {
        Ok(())
    }

    fn record(&mut self, rec: &BmbtRec) -> Result<()> {
        self.runs.push(*rec);
        Ok(())
    }
}

impl XfsFs {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let dev = BlockFile::open(path)?;
        let raw = dev.read_vec(0, 512)?;
        let sb = XfsSuper::parse(&raw)?;
        let sizes: Vec<u64> = (0..sb.agcount.get()).map(|a| sb.ag_size(a)).collect();
        let seen = RangeMap::new(&sizes, u64::from(sb.inopblock.get()));
        Ok(Self { dev, sb, seen })
    }

    pub fn superblock(&self) -> &XfsSuper {
        &self.sb
    }

    fn read_inode(&self, ino: u64) -> Result<XfsInode> {
        if ino == 0 || ino == NULL_INO || ino > MAX_INUMBER {
            return Err(Error::corrupt(format!("inode number {ino:#x} out of range")));
        }
        let pos = self.sb.ino_to_bytes(ino)?;
        let raw = self.dev.read_vec(pos, self.sb.inode_size() as usize)?;
        XfsInode::parse(&self.sb, ino, raw)
    }

    /// Mark an inode visited; true when it already was.
    fn inode_seen(&mut self, ino: u64) -> bool {
        let (agno, _, _) = self.sb.ino_split(ino);
        let agino = self.sb.agino(ino);
        let was = self.seen.test(agno as usize, agino) == Tag::InUse;
        if !was {
            self.seen.set(agno as usize, agino, 1, Tag::InUse);
        }
        was
    }

    fn walk_fork(
        &self,
        sink: &mut Sink,
        inode: &XfsInode,
        fork: Fork,
        kind: ExtentKind,
    ) -> Result<()> {
        let ino = inode.ino as i64;
        match inode.fork_format(fork) {
            FMT_LOCAL => {
                let (start, end) = inode.fork_span(fork);
                let length = match fork {
                    Fork::Data => inode.size().clamp(1, (end - start) as u64),
                    Fork::Attr => (end - start) as u64,
                };
                sink.insert_extent(&Extent {
                    ino,
                    physical: self.sb.ino_to_bytes(inode.ino)? + start as u64,
                    logical: Some(0),
                    length,
                    flags: ExtentFlags::DATA_INLINE | ExtentFlags::NOT_ALIGNED,
                    kind,
                })
            }
            FMT_EXTENTS => {
                let mut coalescer = Coalescer::new();
                let mut collector = ExtentCollector {
                    sb: &self.sb,
                    sink,
                    coalescer: &mut coalescer,
                    ino,
                    kind,
                };
                bmbt::walk_extent_list(inode, fork, &mut collector)?;
                if let Some(done) = coalescer.flush() {
                    sink.insert_extent(&done)?;
                }
                Ok(())
            }
            FMT_BTREE => {
                let mut coalescer = Coalescer::new();
                let mut collector = ExtentCollector {
                    sb: &self.sb,
                    sink,
                    coalescer: &mut coalescer,
                    ino,
                    kind,
                };
                bmbt::walk_btree_fork(&self.dev, &self.sb, inode, fork, &mut collector)?;
                if let Some(done) = coalescer.flush() {
                    sink.insert_extent(&done)?;
                }
                Ok(())
            }
            // Device nodes and the like carry no mappings
            _ => Ok(()),
        }
    }

    /// Record the inode-table slot, the data fork and the attribute fork
    /// of one inode, exactly once per inode.
    fn walk_file_mappings(&mut self, sink: &mut Sink, inode: &XfsInode, kind: InodeKind) -> Result<()> {
        if self.inode_seen(inode.ino) {
            return Ok(());
        }
        // The inode record itself is filesystem metadata
        sink.insert_extent(&Extent {
            ino: inode.ino as i64,
            physical: self.sb.ino_to_bytes(inode.ino)?,
            logical: None,
            length: self.sb.inode_size(),
            flags: ExtentFlags::empty(),
            kind: ExtentKind::Metadata,
        })?;

        self.walk_fork(sink, inode, Fork::Data, ExtentKind::primary_for(kind))?;
        if inode.has_attr_fork() {
            self.walk_fork(sink, inode, Fork::Attr, ExtentKind::Xattr)?;
        }
        Ok(())
    }

    /// All entries of one directory inode.
    fn read_dir(&self, inode: &XfsInode) -> Result<Vec<dir2::Dir2Entry>> {
        let has_ftype = self.sb.has_ftype();
        let mut out = Vec::new();
        match inode.fork_format(Fork::Data) {
            FMT_LOCAL => {
                dir2::parse_sf(inode.fork_bytes(Fork::Data), has_ftype, &mut out)?;
                return Ok(out);
            }
            FMT_EXTENTS | FMT_BTREE => {}
            other => {
                return Err(Error::corrupt(format!(
                    "unknown directory fork format {other}"
                )))
            }
        }

        let mut runs = RunCollector::default();
        if inode.fork_format(Fork::Data) == FMT_EXTENTS {
            bmbt::walk_extent_list(inode, Fork::Data, &mut runs)?;
        } else {
            bmbt::walk_btree_fork(&self.dev, &self.sb, inode, Fork::Data, &mut runs)?;
        }
        runs.runs.sort_by_key(|r| r.startoff);

        let bs = self.sb.block_size();
        let dirblk_blocks = 1u64 << self.sb.dirblklog;
        let dirblk_bytes = (self.sb.dir_block_size()) as usize;
        for run in &runs.runs {
            let mut off = 0;
            while off < run.blockcount {
                let logical = (run.startoff + off) * bs;
                if logical >= dir2::LEAF_OFFSET {
                    // Leaf and freeindex blocks hold no entries
                    return Ok(out);
                }
                let fsbno = self.sb.check_fsb(run.startblock + off)?;
                let block = self.dev.read_vec(self.sb.fsb_to_bytes(fsbno), dirblk_bytes)?;
                dir2::parse_data_block(&block, has_ftype, &mut out)?;
                off += dirblk_blocks;
            }
        }
        Ok(out)
    }

    /// Record one dirent's inode, entry, and mappings; returns the child
    /// path when it is a directory that still needs walking.
    fn record_dirent(
        &mut self,
        sink: &mut Sink,
        dir_ino: i64,
        dir_path: &str,
        name: &str,
        ino: u64,
        ftype_kind: Option<InodeKind>,
    ) -> Result<Option<(u64, String)>> {
        let inode = self.read_inode(ino)?;
        let Some(kind) = ftype_kind.or_else(|| inode.kind()) else {
            return Ok(None);
        };
        let path = format!("{dir_path}/{name}");
        log::debug!("dir={dir_ino} name={path} ino={ino} type={kind:?}");

        sink.insert_inode(ino as i64, kind, &path, &inode.times(), Some(inode.size()))?;
        sink.insert_dentry(dir_ino, name, ino as i64)?;

        let was_seen = {
            let (agno, _, _) = self.sb.ino_split(ino);
            self.seen.test(agno as usize, self.sb.agino(ino)) == Tag::InUse
        };
        self.walk_file_mappings(sink, &inode, kind)?;

        if kind == InodeKind::Dir && !was_seen {
            return Ok(Some((ino, path)));
        }
        Ok(None)
    }
}

impl FsDriver for XfsFs {
    /// Nearly the kernel's statfs arithmetic; unlike it, the log counts
    /// toward the total.
    fn volume_stats(&mut self) -> Result<VolumeStats> {
        let sb = &self.sb;
        let bs = sb.block_size();
        let total_bytes = sb.dblocks.get() * bs;
        let free_blocks = sb.fdblocks.get().saturating_sub(sb.alloc_set_aside());
        let free_bytes = free_blocks * bs;

        let fakeinos = free_blocks << sb.inopblog;
        let mut total_inodes = sb.icount.get().saturating_add(fakeinos).min(MAX_INUMBER);
        if sb.imax_pct > 0 {
            let maxicount = (sb.dblocks.get() * u64::from(sb.imax_pct) / 100) << sb.inopblog;
            total_inodes = total_inodes.min(maxicount);
        }
        total_inodes = total_inodes.max(sb.icount.get());
        let free_inodes = total_inodes - (sb.icount.get() - sb.ifree.get());

        Ok(VolumeStats {
            path: self.dev.path().display().to_string(),
            block_size: bs as u32,
            frag_size: u32::from(sb.sectsize.get()),
            total_bytes,
            free_bytes,
            avail_bytes: free_bytes,
            total_inodes,
            free_inodes,
            avail_inodes: free_inodes,
            max_name_len: NAME_LEN,
        })
    }

    fn walk_tree(&mut self, sink: &mut Sink) -> Result<()> {
        let root_ino = self.sb.rootino.get() as u64;
        let root = self.read_inode(root_ino)?;
        if !root.is_dir() {
            return Err(Error::corrupt("root inode is not a directory"));
        }
        sink.insert_inode(root_ino as i64, InodeKind::Dir, "", &root.times(), Some(root.size()))?;
        self.walk_file_mappings(sink, &root, InodeKind::Dir)?;

        let mut stack: Vec<(u64, String)> = vec![(root_ino, String::new())];
        while let Some((dir_ino, dir_path)) = stack.pop() {
            let dir_inode = self.read_inode(dir_ino)?;
            for entry in self.read_dir(&dir_inode)? {
                if entry.name == b"." || entry.name == b".." {
                    continue;
                }
                let name = fsmap::name_to_utf8(&entry.name);
                let ftype_kind = match entry.ftype {
                    dir2::FT_UNKNOWN => None,
                    dir2::FT_REG_FILE => Some(InodeKind::File),
                    dir2::FT_DIR => Some(InodeKind::Dir),
                    dir2::FT_SYMLINK => Some(InodeKind::Symlink),
                    _ => continue,
                };
                if let Some(subdir) =
                    self.record_dirent(sink, dir_ino as i64, &dir_path, &name, entry.ino, ftype_kind)?
                {
                    stack.push(subdir);
                }
            }
        }
        Ok(())
    }

    fn walk_metadata(&mut self, sink: &mut Sink) -> Result<()> {
        metadata::walk(self, sink)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inode::raw_inode;

    fn pack_rec(startoff: u64, startblock: u64, blockcount: u64, unwritten: bool) -> [u8; 16] {
        let l0 = (u64::from(unwritten) << 63) | (startoff << 9) | (startblock >> 43);
        let l1 = (startblock << 21) | blockcount;
        let mut raw = [0u8; 16];
        raw[..8].copy_from_slice(&l0.to_be_bytes());
        raw[8..].copy_from_slice(&l1.to_be_bytes());
        raw
    }

    fn test_fs() -> XfsFs {
        let mut img = crate::superblock::tests::raw_super();
        img.resize(64 * 1024, 0);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("xfs.img");
        std::fs::write(&path, &img).unwrap();
        // The open descriptor keeps the image readable after the
        // directory is cleaned up.
        XfsFs::open(&path).unwrap()
    }

    #[test_log::test]
    fn adjacent_fork_extents_coalesce_into_the_sink() {
        let mut fs = test_fs();
        let mut sink = Sink::open_in_memory().unwrap();
        sink.prepare().unwrap();

        // Two physically and logically adjacent mappings plus one far away
        let mut raw = raw_inode(2, 0x8180, FMT_EXTENTS, 256);
        raw[76..80].copy_from_slice(&3u32.to_be_bytes()); // nextents
        raw[100..116].copy_from_slice(&pack_rec(0, 100, 4, false));
        raw[116..132].copy_from_slice(&pack_rec(4, 104, 2, false));
        raw[132..148].copy_from_slice(&pack_rec(100, 500, 1, true));
        let inode = XfsInode::parse(&fs.sb, 131, raw).unwrap();

        fs.walk_file_mappings(&mut sink, &inode, InodeKind::File).unwrap();

        let rows: Vec<(i64, i64, i64, i64, i64)> = {
            let conn = sink.connection();
            let mut stmt = conn
                .prepare("SELECT p_off, l_off, length, flags, type FROM extent_t WHERE type = 0 ORDER BY l_off")
                .unwrap();
            let rows = stmt
                .query_map([], |r| {
                    Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?))
                })
                .unwrap()
                .collect::<Result<_, _>>()
                .unwrap();
            rows
        };
        let bs = 4096i64;
        assert_eq!(
            rows,
            vec![
                (100 * bs, 0, 6 * bs, 0, 0),
                (500 * bs, 100 * bs, bs, 0x800, 0),
            ]
        );

        // The inode record slot itself is recorded as metadata
        let (p_off, length): (i64, i64) = sink
            .connection()
            .query_row("SELECT p_off, length FROM extent_t WHERE type = 3", [], |r| {
                Ok((r.get(0)?, r.get(1)?))
            })
            .unwrap();
        assert_eq!(p_off, fs.sb.ino_to_bytes(131).unwrap() as i64);
        assert_eq!(length, 256);

        // A second walk of the same inode is a no-op
        fs.walk_file_mappings(&mut sink, &inode, InodeKind::File).unwrap();
        let n: i64 = sink
            .connection()
            .query_row("SELECT COUNT(*) FROM extent_t", [], |r| r.get(0))
            .unwrap();
        assert_eq!(n, 3);
    }

    #[test_log::test]
    fn local_directory_fork_parses_entries() {
        let fs = test_fs();
        let mut raw = raw_inode(2, 0x4180, inode::FMT_LOCAL, 256);
        let sf = dir2::build::sf_dir(128, &[(b"kernel", 133, dir2::FT_REG_FILE)], false);
        raw[100..100 + sf.len()].copy_from_slice(&sf);
        let inode = XfsInode::parse(&fs.sb, 128, raw).unwrap();

        let entries = fs.read_dir(&inode).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, b"kernel");
        assert_eq!(entries[0].ino, 133);
    }
}
