// SPDX-FileCopyrightText: Copyright © 2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! FAT12/16/32 filesystem walker
//!
//! FAT has no inode numbers, so every file gets a synthetic ascending
//! identifier, with the root directory fixed at 1. Extents come from
//! cluster-chain runs; the invented metadata tree documents the boot
//! region, both FAT copies and the free-cluster runs.

use std::path::Path;

use fsmap::{
    BlockFile, Coalescer, Extent, ExtentFlags, ExtentKind, FsDriver, InodeKind, InodeTimes, Result,
    Sink, VolumeStats,
};

pub mod boot;
pub mod dir;
pub mod table;

use boot::{BootSector, FatKind, Geometry};
use dir::{DirEntry, FatDirent};
use table::FatTable;

pub const ROOT_DIR_INO: i64 = 1;

const INO_METADATA_DIR: i64 = -1;
const INO_SB_FILE: i64 = -2;
const INO_PRIMARY_FAT_FILE: i64 = -3;
const INO_BACKUP_FAT_FILE: i64 = -4;
const INO_FREESP_FILE: i64 = -5;

const STR_METADATA_DIR: &str = "$metadata";
const STR_SB_FILE: &str = "superblock";
const STR_PRIMARY_FAT_FILE: &str = "primary_fat";
const STR_BACKUP_FAT_FILE: &str = "backup_fat";
const STR_FREESP_FILE: &str = "freespace";

const MAX_NAME_LEN: u32 = 255;

pub struct FatFs {
    dev: BlockFile,
    geo: Geometry,
    fat: FatTable,
    /// Next synthetic inode number
    next_ino: i64,
}

/// Where a directory's entries live
enum DirLocation {
    /// The fixed root region of FAT12/16
    FixedRoot,
    Chain(u32),
}

impl FatFs {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let dev = BlockFile::open(path)?;
        let raw = dev.read_vec(0, 512)?;
        let geo = BootSector::parse(&raw)?.geometry()?;
        let fat = table::load(&dev, &geo)?;
        Ok(Self {
            dev,
            geo,
            fat,
            next_ino: ROOT_DIR_INO,
        })
    }

    fn is_fat32(&self) -> bool {
        self.geo.kind == FatKind::Fat32
    }

    fn alloc_ino(&mut self) -> i64 {
        let ino = self.next_ino;
        self.next_ino += 1;
        ino
    }

    /// Read a whole directory region into memory.
    fn read_dir_region(&self, loc: &DirLocation) -> Result<Vec<u8>> {
        match loc {
            DirLocation::FixedRoot => self
                .dev
                .read_vec(self.geo.root_start, self.geo.root_entries as usize * dir::ENTRY_SIZE)
                .map_err(Into::into),
            DirLocation::Chain(start) => {
                let mut out = Vec::new();
                for cluster in self.fat.chain(*start)? {
                    let buf = self
                        .dev
                        .read_vec(self.geo.cluster_start(cluster), self.geo.cluster_size as usize)?;
                    out.extend_from_slice(&buf);
                }
                Ok(out)
            }
        }
    }

    /// Emit the extents of one cluster chain, coalesced.
    fn walk_chain_mappings(
        &self,
        sink: &mut Sink,
        ino: i64,
        first_cluster: u32,
        kind: ExtentKind,
    ) -> Result<()> {
        if first_cluster == 0 {
            return Ok(());
        }
        let cs = self.geo.cluster_size;
        let mut coalescer = Coalescer::new();
        for (lcluster, cluster) in self.fat.chain(first_cluster)?.into_iter().enumerate() {
            let ext = Extent {
                ino,
                physical: self.geo.cluster_start(cluster),
                logical: Some(lcluster as u64 * cs),
                length: cs,
                flags: ExtentFlags::empty(),
                kind,
            };
            if let Some(done) = coalescer.feed(ext) {
                sink.insert_extent(&done)?;
            }
        }
        if let Some(done) = coalescer.flush() {
            sink.insert_extent(&done)?;
        }
        Ok(())
    }

    fn entry_times(entry: &DirEntry) -> InodeTimes {
        InodeTimes {
            atime: dir::decode_time(entry.adate.get(), 0),
            crtime: dir::decode_time(entry.cdate.get(), entry.ctime.get()),
            ctime: None,
            mtime: dir::decode_time(entry.date.get(), entry.time.get()),
        }
    }

    fn record_dirent(
        &mut self,
        sink: &mut Sink,
        dir_ino: i64,
        dir_path: &str,
        dirent: &FatDirent,
    ) -> Result<Option<(DirLocation, i64, String)>> {
        let name = dirent.name.as_str();
        if name == "." || name == ".." {
            return Ok(None);
        }
        let kind = if dirent.entry.is_dir() {
            InodeKind::Dir
        } else {
            InodeKind::File
        };
        let ino = self.alloc_ino();
        let path = format!("{dir_path}/{name}");
        log::debug!(
            "dir={dir_ino} name={path} attr={:#04x} ino={ino} type={kind:?}",
            dirent.entry.attr
        );

        sink.insert_inode(
            ino,
            kind,
            &path,
            &Self::entry_times(&dirent.entry),
            Some(u64::from(dirent.entry.size.get())),
        )?;
        sink.insert_dentry(dir_ino, name, ino)?;

        let first = dirent.entry.first_cluster(self.is_fat32());
        self.walk_chain_mappings(sink, ino, first, ExtentKind::primary_for(kind))?;

        if kind == InodeKind::Dir && first != 0 {
            return Ok(Some((DirLocation::Chain(first), ino, path)));
        }
        Ok(None)
    }

    fn walk_freespace(&self, sink: &mut Sink) -> Result<()> {
        let cs = self.geo.cluster_size;
        let mut run_start: Option<u32> = None;
        for cluster in 2..(2 + self.fat.clusters() as u32) {
            let free = matches!(self.fat.entry(cluster)?, table::FatEntry::Free);
            match (free, run_start) {
                (true, None) => run_start = Some(cluster),
                (false, Some(start)) => {
                    sink.insert_extent(&Extent {
                        ino: INO_FREESP_FILE,
                        physical: self.geo.cluster_start(start),
                        logical: None,
                        length: u64::from(cluster - start) * cs,
                        flags: ExtentFlags::empty(),
                        kind: ExtentKind::Freespace,
                    })?;
                    run_start = None;
                }
                _ => {}
            }
        }
        if let Some(start) = run_start {
            let end = 2 + self.fat.clusters() as u32;
            sink.insert_extent(&Extent {
                ino: INO_FREESP_FILE,
                physical: self.geo.cluster_start(start),
                logical: None,
                length: u64::from(end - start) * cs,
                flags: ExtentFlags::empty(),
                kind: ExtentKind::Freespace,
            })?;
        }
        Ok(())
    }
}

impl FsDriver for FatFs {
    fn volume_stats(&mut self) -> Result<VolumeStats> {
        let cs = self.geo.cluster_size;
        let free_bytes = self.fat.free_clusters() * cs;
        Ok(VolumeStats {
            path: self.dev.path().display().to_string(),
            block_size: cs as u32,
            frag_size: cs as u32,
            total_bytes: self.geo.clusters * cs,
            free_bytes,
            avail_bytes: free_bytes,
            total_inodes: 0,
            free_inodes: 0,
            avail_inodes: 0,
            max_name_len: MAX_NAME_LEN,
        })
    }

    fn walk_tree(&mut self, sink: &mut Sink) -> Result<()> {
        let root_ino = self.alloc_ino();
        debug_assert_eq!(root_ino, ROOT_DIR_INO);
        sink.insert_inode(root_ino, InodeKind::Dir, "", &InodeTimes::default(), None)?;

        let root_loc = if self.is_fat32() {
            self.walk_chain_mappings(sink, root_ino, self.geo.root_cluster, ExtentKind::Dir)?;
            DirLocation::Chain(self.geo.root_cluster)
        } else {
            // The fixed root region is an extent of its own
            sink.insert_extent(&Extent {
                ino: root_ino,
                physical: self.geo.root_start,
                logical: Some(0),
                length: u64::from(self.geo.root_entries) * dir::ENTRY_SIZE as u64,
                flags: ExtentFlags::empty(),
                kind: ExtentKind::Dir,
            })?;
            DirLocation::FixedRoot
        };

        let mut stack: Vec<(DirLocation, i64, String)> = vec![(root_loc, root_ino, String::new())];
        while let Some((loc, dir_ino, dir_path)) = stack.pop() {
            let region = self.read_dir_region(&loc)?;
            for dirent in dir::parse_region(&region) {
                if let Some(subdir) = self.record_dirent(sink, dir_ino, &dir_path, &dirent)? {
                    stack.push(subdir);
                }
            }
        }
        Ok(())
    }

    fn walk_metadata(&mut self, sink: &mut Sink) -> Result<()> {
        let md_path = format!("/{STR_METADATA_DIR}");
        sink.inject_metadata(ROOT_DIR_INO, "", INO_METADATA_DIR, STR_METADATA_DIR, InodeKind::Dir)?;

        sink.inject_metadata(INO_METADATA_DIR, &md_path, INO_SB_FILE, STR_SB_FILE, InodeKind::Metadata)?;
        sink.insert_extent(&Extent {
            ino: INO_SB_FILE,
            physical: 0,
            logical: None,
            length: self.geo.cluster_size,
            flags: ExtentFlags::empty(),
            kind: ExtentKind::Metadata,
        })?;

        sink.inject_metadata(
            INO_METADATA_DIR,
            &md_path,
            INO_PRIMARY_FAT_FILE,
            STR_PRIMARY_FAT_FILE,
            InodeKind::Metadata,
        )?;
        sink.insert_extent(&Extent {
            ino: INO_PRIMARY_FAT_FILE,
            physical: self.geo.fat_start,
            logical: None,
            length: self.geo.fat_size,
            flags: ExtentFlags::empty(),
            kind: ExtentKind::Metadata,
        })?;

        if self.geo.fats > 1 {
            sink.inject_metadata(
                INO_METADATA_DIR,
                &md_path,
                INO_BACKUP_FAT_FILE,
                STR_BACKUP_FAT_FILE,
                InodeKind::Metadata,
            )?;
            sink.insert_extent(&Extent {
                ino: INO_BACKUP_FAT_FILE,
                physical: self.geo.fat_start + self.geo.fat_size,
                logical: None,
                length: self.geo.fat_size,
                flags: ExtentFlags::empty(),
                kind: ExtentKind::Metadata,
            })?;
        }

        sink.inject_metadata(
            INO_METADATA_DIR,
            &md_path,
            INO_FREESP_FILE,
            STR_FREESP_FILE,
            InodeKind::Freespace,
        )?;
        self.walk_freespace(sink)
    }
}
