// SPDX-FileCopyrightText: Copyright © 2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! ext2/3/4 filesystem walker
//!
//! Reads the on-disk structures of an ext\* volume directly: superblock,
//! group descriptors, inode table, extent trees or indirect block maps,
//! and linear directory blocks, streaming normalized records into the
//! mapper sink. Hash-tree directories and both mapping formats are
//! handled; meta_bg and bigalloc layouts are not.

use std::path::Path;

use fsmap::{
    Bitmap, BlockFile, Coalescer, Error, Extent, ExtentFlags, ExtentKind, FsDriver, InodeKind,
    Result, Sink, VolumeStats,
};

pub mod dir;
pub mod extents;
pub mod inode;
mod metadata;
pub mod superblock;

use dir::RawDirent;
use inode::{Ext4Inode, Group, GroupDesc};
use superblock::{Ext4Super, FEATURE_INCOMPAT_FILETYPE, NAME_LEN, ROOT_INO};

/// Byte offset of the block/extent area inside an inode record
const INODE_BLOCK_OFFSET: u64 = 40;

pub struct Ext4Fs {
    dev: BlockFile,
    sb: Ext4Super,
    groups: Vec<Group>,
    seen: Bitmap,
}

impl Ext4Fs {
    /// Open a volume read-only and load its superblock and descriptors.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let dev = BlockFile::open(path)?;
        let raw = dev.read_vec(superblock::SUPERBLOCK_OFFSET, 1024)?;
        let sb = Ext4Super::parse(&raw)?;

        // Group descriptor table sits in the block(s) after the superblock
        let gdt_start = (u64::from(sb.first_data_block.get()) + 1) * sb.block_size();
        let desc_size = sb.descriptor_size();
        let group_count = sb.group_count();
        let raw_gdt = dev.read_vec(gdt_start, (group_count * desc_size) as usize)?;
        let groups = (0..group_count)
            .map(|g| {
                let at = (g * desc_size) as usize;
                GroupDesc::parse(&raw_gdt[at..at + desc_size as usize], desc_size)
            })
            .collect::<Result<Vec<_>>>()?;

        let seen = Bitmap::new(u64::from(sb.inodes_count.get()) + 1);
        Ok(Self { dev, sb, groups, seen })
    }

    pub fn superblock(&self) -> &Ext4Super {
        &self.sb
    }

    pub(crate) fn group(&self, g: u64) -> &Group {
        &self.groups[g as usize]
    }

    /// Byte position of an inode record on the volume
    fn inode_position(&self, ino: u64) -> Result<u64> {
        let ipg = u64::from(self.sb.inodes_per_group.get());
        let group = (ino - 1) / ipg;
        let index = (ino - 1) % ipg;
        let table = self
            .groups
            .get(group as usize)
            .ok_or_else(|| Error::corrupt(format!("inode {ino} beyond the last group")))?
            .inode_table;
        Ok(table * self.sb.block_size() + index * self.sb.inode_record_size())
    }

    fn read_inode(&self, ino: u64) -> Result<Ext4Inode> {
        if ino == 0 || ino > u64::from(self.sb.inodes_count.get()) {
            return Err(Error::corrupt(format!("inode number {ino} out of range")));
        }
        let record_size = self.sb.inode_record_size();
        let raw = self.dev.read_vec(self.inode_position(ino)?, record_size as usize)?;
        Ext4Inode::parse(&raw, record_size)
    }

    /// All live dirents of a directory inode, in logical order.
    fn read_dir(&self, inode: &Ext4Inode) -> Result<Vec<RawDirent>> {
        let has_filetype = self.sb.has_incompat(FEATURE_INCOMPAT_FILETYPE);
        let mut out = Vec::new();
        if inode.has_flag(inode::INLINE_DATA_FL) {
            dir::parse_inline(&inode.block, has_filetype, &mut out)?;
            return Ok(out);
        }

        let mut mappings = extents::collect(&self.dev, &self.sb, inode)?;
        mappings.data.sort_by_key(|run| run.logical);
        let bs = self.sb.block_size();
        for run in &mappings.data {
            for b in 0..run.count {
                let block = self.dev.read_vec((run.physical + b) * bs, bs as usize)?;
                dir::parse_block(&block, has_filetype, &mut out)?;
            }
        }
        Ok(out)
    }

    /// Emit every extent an inode owns: data runs through the coalescer,
    /// mapping-structure blocks as their own records, and the external
    /// xattr block when present.
    fn walk_file_mappings(
        &mut self,
        sink: &mut Sink,
        ino: i64,
        inode: &Ext4Inode,
        kind: InodeKind,
    ) -> Result<()> {
        let bs = self.sb.block_size();
        let primary = ExtentKind::primary_for(kind);

        if inode.has_flag(inode::INLINE_DATA_FL) || inode.is_fast_symlink() {
            // The data lives inside the inode record itself.
            let pos = self.inode_position(ino as u64)? + INODE_BLOCK_OFFSET;
            sink.insert_extent(&Extent {
                ino,
                physical: pos,
                logical: Some(0),
                length: inode.size().clamp(1, 60),
                flags: ExtentFlags::DATA_INLINE | ExtentFlags::NOT_ALIGNED,
                kind: primary,
            })?;
            self.walk_xattr_block(sink, ino, inode)?;
            return Ok(());
        }

        let mappings = extents::collect(&self.dev, &self.sb, inode)?;
        for meta in &mappings.meta {
            sink.insert_extent(&Extent {
                ino,
                physical: meta.physical * bs,
                logical: meta.logical.map(|l| l * bs),
                length: bs,
                flags: ExtentFlags::empty(),
                kind: ExtentKind::ExtentMap,
            })?;
        }

        // Classic block-mapped files arrive one block at a time; the rows
        // that survive coalescing are flagged as merged.
        let merged = !inode.has_flag(inode::EXTENTS_FL);
        let mut coalescer = Coalescer::new();
        for run in &mappings.data {
            let mut flags = ExtentFlags::empty();
            if run.unwritten {
                flags |= ExtentFlags::UNWRITTEN;
            }
            if merged {
                flags |= ExtentFlags::MERGED;
            }
            let next = Extent {
                ino,
                physical: run.physical * bs,
                logical: Some(run.logical * bs),
                length: run.count * bs,
                flags,
                kind: primary,
            };
            if let Some(done) = coalescer.feed(next) {
                sink.insert_extent(&done)?;
            }
        }
        if let Some(done) = coalescer.flush() {
            sink.insert_extent(&done)?;
        }

        self.walk_xattr_block(sink, ino, inode)
    }

    fn walk_xattr_block(&self, sink: &mut Sink, ino: i64, inode: &Ext4Inode) -> Result<()> {
        let acl = inode.file_acl();
        if acl == 0 {
            return Ok(());
        }
        let bs = self.sb.block_size();
        sink.insert_extent(&Extent {
            ino,
            physical: acl * bs,
            logical: None,
            length: bs,
            flags: ExtentFlags::empty(),
            kind: ExtentKind::Xattr,
        })
    }

    fn dirent_kind(&self, dirent: &RawDirent, inode: &Ext4Inode) -> Option<InodeKind> {
        match dirent.file_type {
            dir::FT_REG_FILE => Some(InodeKind::File),
            dir::FT_DIR => Some(InodeKind::Dir),
            dir::FT_SYMLINK => Some(InodeKind::Symlink),
            dir::FT_UNKNOWN => inode.kind(),
            _ => None,
        }
    }
}

impl FsDriver for Ext4Fs {
    fn volume_stats(&mut self) -> Result<VolumeStats> {
        let sb = &self.sb;
        let bs = sb.block_size();
        let free_bytes = sb.free_blocks_count() * bs;
        Ok(VolumeStats {
            path: self.dev.path().display().to_string(),
            block_size: bs as u32,
            frag_size: sb.cluster_size() as u32,
            total_bytes: sb.blocks_count() * bs,
            free_bytes,
            avail_bytes: free_bytes,
            total_inodes: u64::from(sb.inodes_count.get()),
            free_inodes: u64::from(sb.free_inodes_count.get()),
            avail_inodes: u64::from(sb.free_inodes_count.get()),
            max_name_len: NAME_LEN,
        })
    }

    fn walk_tree(&mut self, sink: &mut Sink) -> Result<()> {
        let root = self.read_inode(ROOT_INO)?;
        if !root.is_dir() {
            return Err(Error::corrupt("root inode is not a directory"));
        }
        sink.insert_inode(
            ROOT_INO as i64,
            InodeKind::Dir,
            "",
            &root.times(self.sb.inode_record_size()),
            Some(root.size()),
        )?;
        if !self.seen.test_and_set(ROOT_INO) {
            self.walk_file_mappings(sink, ROOT_INO as i64, &root, InodeKind::Dir)?;
        }

        // Iterative descent; directory trees can outgrow the call stack.
        let mut stack: Vec<(u64, String)> = vec![(ROOT_INO, String::new())];
        while let Some((dir_ino, dir_path)) = stack.pop() {
            let dir_inode = self.read_inode(dir_ino)?;
            for dirent in self.read_dir(&dir_inode)? {
                if dirent.name == b"." || dirent.name == b".." {
                    continue;
                }
                let name = fsmap::name_to_utf8(&dirent.name);
                let child_inode = self.read_inode(dirent.ino)?;
                let Some(kind) = self.dirent_kind(&dirent, &child_inode) else {
                    continue;
                };
                let path = format!("{dir_path}/{name}");
                log::debug!("dir={dir_ino} name={path} ino={} type={kind:?}", dirent.ino);

                sink.insert_inode(
                    dirent.ino as i64,
                    kind,
                    &path,
                    &child_inode.times(self.sb.inode_record_size()),
                    Some(child_inode.size()),
                )?;
                sink.insert_dentry(dir_ino as i64, &name, dirent.ino as i64)?;

                if !self.seen.test_and_set(dirent.ino) {
                    self.walk_file_mappings(sink, dirent.ino as i64, &child_inode, kind)?;
                    if kind == InodeKind::Dir {
                        stack.push((dirent.ino, path));
                    }
                }
            }
        }
        Ok(())
    }

    fn walk_metadata(&mut self, sink: &mut Sink) -> Result<()> {
        metadata::walk(self, sink)
    }
}
