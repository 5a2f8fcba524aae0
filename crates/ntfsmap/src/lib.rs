// SPDX-FileCopyrightText: Copyright © 2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! NTFS filesystem walker
//!
//! Reads the master file table directly: boot sector, MFT records with
//! update-sequence fixups, standard/file-name/data attributes, runlists
//! and `$I30` directory indexes. System files surface under the invented
//! `/$metadata/hidden_files` tree; free space comes from `$Bitmap`.

use std::path::Path;

use fsmap::{
    Bitmap, BlockFile, Coalescer, Extent, ExtentFlags, ExtentKind, FsDriver, InodeKind, Result,
    Sink, VolumeStats,
};

pub mod boot;
pub mod index;
pub mod mft;
pub mod runlist;

use boot::{BootSector, Geometry};
use mft::{Attribute, Mft, MftRecord, ATTRF_COMPRESSED, ATTRF_ENCRYPTED, ATTR_DATA, ATTR_INDEX_ALLOCATION, ATTR_INDEX_ROOT};

const MAX_NAME_LEN: u32 = 255;
const I30: &str = "$I30";

const INO_METADATA_DIR: i64 = -1;
const INO_SB_FILE: i64 = -2;
const INO_HIDDEN_DIR: i64 = -3;
const INO_FREESP_FILE: i64 = -4;

const STR_METADATA_DIR: &str = "$metadata";
const STR_SB_FILE: &str = "superblock";
const STR_HIDDEN_DIR: &str = "hidden_files";
const STR_FREESP_FILE: &str = "freespace";

/// The fixed system records surfaced as hidden files
const SYSTEM_FILES: [(u64, &str); 11] = [
    (0, "mft"),
    (1, "mftmirr"),
    (2, "logfile"),
    (3, "volume"),
    (4, "attrdef"),
    (6, "bitmap"),
    (7, "boot"),
    (8, "badclus"),
    (9, "secure"),
    (10, "upcase"),
    (11, "extend"),
];

pub struct NtfsFs {
    dev: BlockFile,
    geo: Geometry,
    mft: Mft,
    seen: Bitmap,
}

impl NtfsFs {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let dev = BlockFile::open(path)?;
        let raw = dev.read_vec(0, 512)?;
        let geo = BootSector::parse(&raw)?;
        let mft = Mft::open(&dev, geo)?;
        let seen = Bitmap::new(mft.record_count);
        Ok(Self { dev, geo, mft, seen })
    }

    /// Emit the extents of one data-bearing attribute.
    fn walk_attribute(
        &self,
        sink: &mut Sink,
        ino: i64,
        record_no: u64,
        attr: &Attribute,
        kind: ExtentKind,
    ) -> Result<()> {
        let cs = self.geo.cluster_size;
        match &attr.body {
            mft::AttrBody::Resident { value_offset, value } => {
                if value.is_empty() {
                    return Ok(());
                }
                // The value lives inside the MFT record itself
                let pos =
                    self.mft.record_position(record_no)? + attr.record_offset as u64 + *value_offset as u64;
                sink.insert_extent(&Extent {
                    ino,
                    physical: pos,
                    logical: Some(0),
                    length: value.len() as u64,
                    flags: ExtentFlags::DATA_INLINE | ExtentFlags::NOT_ALIGNED,
                    kind,
                })
            }
            mft::AttrBody::NonResident { runs, .. } => {
                let mut flags = ExtentFlags::empty();
                if attr.flags & ATTRF_COMPRESSED != 0 {
                    flags |= ExtentFlags::ENCODED;
                }
                if attr.flags & ATTRF_ENCRYPTED != 0 {
                    flags |= ExtentFlags::DATA_ENCRYPTED;
                }
                let mut coalescer = Coalescer::new();
                for run in runs {
                    let Some(lcn) = run.lcn else { continue };
                    let ext = Extent {
                        ino,
                        physical: lcn * cs,
                        logical: Some(run.vcn * cs),
                        length: run.clusters * cs,
                        flags,
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
        }
    }

    /// Emit every extent a record owns: the unnamed data stream as the
    /// primary kind, alternate streams as xattrs, directory indexes as
    /// directory extents.
    fn walk_file_mappings(&mut self, sink: &mut Sink, rec: &MftRecord, kind: InodeKind) -> Result<()> {
        if self.seen.test_and_set(rec.record_no) {
            return Ok(());
        }
        let ino = rec.record_no as i64;
        let primary = ExtentKind::primary_for(kind);
        for attr in &rec.attributes {
            match attr.type_code {
                ATTR_DATA if attr.name.is_empty() => {
                    self.walk_attribute(sink, ino, rec.record_no, attr, primary)?
                }
                ATTR_DATA => self.walk_attribute(sink, ino, rec.record_no, attr, ExtentKind::Xattr)?,
                ATTR_INDEX_ALLOCATION => {
                    self.walk_attribute(sink, ino, rec.record_no, attr, ExtentKind::Dir)?
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// The complete listing of one directory record.
    fn read_dir(&self, rec: &MftRecord) -> Result<Vec<index::IndexEntry>> {
        let mut out = Vec::new();
        if let Some(root) = rec.find(ATTR_INDEX_ROOT, I30) {
            let value = root
                .resident_value()
                .ok_or_else(|| fsmap::Error::corrupt("index root cannot be non-resident"))?;
            index::parse_root(value, &mut out)?;
        }
        if let Some(alloc) = rec.find(ATTR_INDEX_ALLOCATION, I30) {
            if let mft::AttrBody::NonResident { runs, .. } = &alloc.body {
                let cs = self.geo.cluster_size;
                let ibs = self.geo.index_block_size;
                for run in runs {
                    let Some(lcn) = run.lcn else { continue };
                    let run_bytes = run.clusters * cs;
                    let mut off = 0;
                    while off + ibs <= run_bytes {
                        let raw = self.dev.read_vec(lcn * cs + off, ibs as usize)?;
                        index::parse_block(&self.geo, raw, &mut out)?;
                        off += ibs;
                    }
                }
            }
        }
        Ok(out)
    }

    fn read_record(&self, record_no: u64) -> Result<MftRecord> {
        self.mft.read_record(&self.dev, record_no)
    }

    /// The volume's cluster bitmap, one bit per cluster.
    fn cluster_bitmap(&self) -> Result<Vec<u8>> {
        let rec = self.read_record(mft::BITMAP_RECORD)?;
        let attr = rec
            .find(ATTR_DATA, "")
            .ok_or_else(|| fsmap::Error::corrupt("the cluster bitmap has no data"))?;
        mft::read_attr_data(&self.dev, &self.geo, attr)
    }
}

impl FsDriver for NtfsFs {
    fn volume_stats(&mut self) -> Result<VolumeStats> {
        let bitmap = self.cluster_bitmap()?;
        let clusters = self.geo.total_bytes / self.geo.cluster_size;
        let free_clusters: u64 = bitmap
            .iter()
            .enumerate()
            .map(|(byte, &b)| {
                (0..8)
                    .filter(|bit| {
                        let c = byte as u64 * 8 + bit;
                        c < clusters && b >> bit & 1 == 0
                    })
                    .count() as u64
            })
            .sum();
        Ok(VolumeStats {
            path: self.dev.path().display().to_string(),
            block_size: self.geo.cluster_size as u32,
            frag_size: self.geo.sector_size as u32,
            total_bytes: self.geo.total_bytes,
            free_bytes: free_clusters * self.geo.cluster_size,
            avail_bytes: free_clusters * self.geo.cluster_size,
            total_inodes: self.mft.record_count,
            free_inodes: 0,
            avail_inodes: 0,
            max_name_len: MAX_NAME_LEN,
        })
    }

    fn walk_tree(&mut self, sink: &mut Sink) -> Result<()> {
        let root = self.read_record(mft::ROOT_RECORD)?;
        sink.insert_inode(
            mft::ROOT_RECORD as i64,
            InodeKind::Dir,
            "",
            &root.times(),
            root.data_size(),
        )?;
        self.walk_file_mappings(sink, &root, InodeKind::Dir)?;

        let mut stack: Vec<(u64, String)> = vec![(mft::ROOT_RECORD, String::new())];
        while let Some((dir_no, dir_path)) = stack.pop() {
            let dir_rec = self.read_record(dir_no)?;
            for entry in self.read_dir(&dir_rec)? {
                // DOS names duplicate their Win32 twin
                if entry.namespace == index::NS_DOS || entry.name == "." {
                    continue;
                }
                // System files live under the metadata tree instead
                if dir_no == mft::ROOT_RECORD && entry.name.starts_with('$') {
                    continue;
                }
                let child = self.read_record(entry.mft_no)?;
                if !child.in_use || child.is_extension() {
                    continue;
                }
                let kind = if entry.is_dir { InodeKind::Dir } else { InodeKind::File };
                let path = format!("{dir_path}/{}", entry.name);
                log::debug!("dir={dir_no} name={path} record={} type={kind:?}", entry.mft_no);

                sink.insert_inode(
                    entry.mft_no as i64,
                    kind,
                    &path,
                    &child.times(),
                    child.data_size(),
                )?;
                sink.insert_dentry(dir_no as i64, &entry.name, entry.mft_no as i64)?;

                let was_seen = self.seen.test(entry.mft_no);
                self.walk_file_mappings(sink, &child, kind)?;
                if kind == InodeKind::Dir && !was_seen {
                    stack.push((entry.mft_no, path));
                }
            }
        }
        Ok(())
    }

    fn walk_metadata(&mut self, sink: &mut Sink) -> Result<()> {
        let md = format!("/{STR_METADATA_DIR}");
        sink.inject_metadata(
            mft::ROOT_RECORD as i64,
            "",
            INO_METADATA_DIR,
            STR_METADATA_DIR,
            InodeKind::Dir,
        )?;

        // The boot region
        sink.inject_metadata(INO_METADATA_DIR, &md, INO_SB_FILE, STR_SB_FILE, InodeKind::Metadata)?;
        sink.insert_extent(&Extent {
            ino: INO_SB_FILE,
            physical: 0,
            logical: None,
            length: self.geo.cluster_size,
            flags: ExtentFlags::empty(),
            kind: ExtentKind::Metadata,
        })?;

        // System files
        sink.inject_metadata(INO_METADATA_DIR, &md, INO_HIDDEN_DIR, STR_HIDDEN_DIR, InodeKind::Dir)?;
        let hidden_path = format!("{md}/{STR_HIDDEN_DIR}");
        for (record_no, name) in SYSTEM_FILES {
            if record_no >= self.mft.record_count {
                continue;
            }
            let rec = self.read_record(record_no)?;
            if !rec.in_use {
                continue;
            }
            let path = format!("{hidden_path}/{name}");
            sink.insert_inode(
                record_no as i64,
                InodeKind::Metadata,
                &path,
                &rec.times(),
                rec.data_size(),
            )?;
            sink.insert_dentry(INO_HIDDEN_DIR, name, record_no as i64)?;
            self.walk_file_mappings(sink, &rec, InodeKind::Metadata)?;
        }

        // Free clusters, straight from the volume bitmap
        sink.inject_metadata(INO_METADATA_DIR, &md, INO_FREESP_FILE, STR_FREESP_FILE, InodeKind::Freespace)?;
        let bitmap = self.cluster_bitmap()?;
        let clusters = self.geo.total_bytes / self.geo.cluster_size;
        let cs = self.geo.cluster_size;
        let mut run_start: Option<u64> = None;
        for c in 0..clusters {
            let byte = (c / 8) as usize;
            let free = byte < bitmap.len() && bitmap[byte] >> (c % 8) & 1 == 0;
            match (free, run_start) {
                (true, None) => run_start = Some(c),
                (false, Some(start)) => {
                    sink.insert_extent(&Extent {
                        ino: INO_FREESP_FILE,
                        physical: start * cs,
                        logical: None,
                        length: (c - start) * cs,
                        flags: ExtentFlags::empty(),
                        kind: ExtentKind::Freespace,
                    })?;
                    run_start = None;
                }
                _ => {}
            }
        }
        if let Some(start) = run_start {
            sink.insert_extent(&Extent {
                ino: INO_FREESP_FILE,
                physical: start * cs,
                logical: None,
                length: (clusters - start) * cs,
                flags: ExtentFlags::empty(),
                kind: ExtentKind::Freespace,
            })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mft::build::{standard_info, RecordBuilder};

    const CLUSTER: u64 = 1024;
    /// MFT lives at cluster 16, sixteen 1 KiB records
    const MFT_LCN: u64 = 16;
    const RECORDS: u64 = 16;

    fn put_record(img: &mut [u8], record_no: u64, raw: &[u8]) {
        let at = ((MFT_LCN + record_no) * CLUSTER) as usize;
        img[at..at + raw.len()].copy_from_slice(raw);
    }

    fn build_image() -> Vec<u8> {
        let total_sectors = 512u64; // 256 KiB volume, 256 clusters
        let mut img = vec![0u8; (total_sectors * 512) as usize];
        img[..512].copy_from_slice(&crate::boot::boot_bytes(total_sectors, MFT_LCN));

        let t = 13_000_000_000u64 * 10_000_000;

        // Record 0: $MFT, 16 records at cluster 16
        let mut b = RecordBuilder::new(1024, false);
        b.resident_attr(mft::ATTR_STANDARD_INFORMATION, "", &standard_info(t));
        b.non_resident_attr(mft::ATTR_DATA, "", &[0x11, 0x10, 0x10, 0x00], RECORDS * 1024);
        put_record(&mut img, 0, &b.finish());

        // Minimal system records 1..12
        for no in 1..12u64 {
            let mut b = RecordBuilder::new(1024, false);
            b.resident_attr(mft::ATTR_STANDARD_INFORMATION, "", &standard_info(t));
            if no == 6 {
                // $Bitmap: clusters 0..64 in use, the rest free
                let mut bits = vec![0u8; 32];
                for byte in bits.iter_mut().take(8) {
                    *byte = 0xFF;
                }
                b.resident_attr(mft::ATTR_DATA, "", &bits);
            } else {
                b.resident_attr(mft::ATTR_DATA, "", &[]);
            }
            put_record(&mut img, no, &b.finish());
        }

        // Record 5: the root directory
        let mut b = RecordBuilder::new(1024, true);
        b.resident_attr(mft::ATTR_STANDARD_INFORMATION, "", &standard_info(t));
        b.resident_attr(
            mft::ATTR_INDEX_ROOT,
            I30,
            &crate::index::build::index_root(&[
                (0, "$MFT", false),
                (12, "readme.txt", false),
                (13, "docs", true),
            ]),
        );
        put_record(&mut img, 5, &b.finish());

        // Record 12: a 2500-byte file over three clusters at 40
        let mut b = RecordBuilder::new(1024, false);
        b.resident_attr(mft::ATTR_STANDARD_INFORMATION, "", &standard_info(t));
        b.non_resident_attr(mft::ATTR_DATA, "", &[0x11, 0x03, 0x28, 0x00], 2500);
        put_record(&mut img, 12, &b.finish());

        // Record 13: an empty subdirectory
        let mut b = RecordBuilder::new(1024, true);
        b.resident_attr(mft::ATTR_STANDARD_INFORMATION, "", &standard_info(t));
        b.resident_attr(mft::ATTR_INDEX_ROOT, I30, &crate::index::build::index_root(&[]));
        put_record(&mut img, 13, &b.finish());

        img
    }

    fn mapped_db() -> Sink {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ntfs.img");
        std::fs::write(&path, build_image()).unwrap();
        let mut fs = NtfsFs::open(&path).unwrap();

        let mut sink = Sink::open_in_memory().unwrap();
        sink.prepare().unwrap();
        sink.begin().unwrap();
        let stats = fs.volume_stats().unwrap();
        sink.collect_fs_stats(&stats).unwrap();
        fs.walk_tree(&mut sink).unwrap();
        fs.walk_metadata(&mut sink).unwrap();
        sink.index_db().unwrap();
        sink.finalize_fs_stats(&stats.path).unwrap();
        sink.calc_inode_stats().unwrap();
        sink.commit().unwrap();
        sink
    }

    #[test_log::test]
    fn files_and_directories_are_walked() {
        let sink = mapped_db();
        let (ino, size): (i64, i64) = sink
            .connection()
            .query_row("SELECT p.ino, i.size FROM path_t p, inode_t i WHERE p.path = '/readme.txt' AND i.ino = p.ino", [], |r| {
                Ok((r.get(0)?, r.get(1)?))
            })
            .unwrap();
        assert_eq!(ino, 12);
        assert_eq!(size, 2500);

        let (p_off, length): (i64, i64) = sink
            .connection()
            .query_row("SELECT p_off, length FROM extent_t WHERE ino = 12 AND type = 0", [], |r| {
                Ok((r.get(0)?, r.get(1)?))
            })
            .unwrap();
        assert_eq!(p_off, 40 * CLUSTER as i64);
        assert_eq!(length, 3 * CLUSTER as i64);

        let n: i64 = sink
            .connection()
            .query_row("SELECT COUNT(*) FROM path_t WHERE path = '/docs'", [], |r| r.get(0))
            .unwrap();
        assert_eq!(n, 1);
    }

    #[test_log::test]
    fn system_files_stay_out_of_the_tree() {
        let sink = mapped_db();
        let n: i64 = sink
            .connection()
            .query_row("SELECT COUNT(*) FROM path_t WHERE path = '/$MFT'", [], |r| r.get(0))
            .unwrap();
        assert_eq!(n, 0);

        // The MFT surfaces as a hidden metadata file instead
        let ino: i64 = sink
            .connection()
            .query_row(
                "SELECT ino FROM path_t WHERE path = '/$metadata/hidden_files/mft'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(ino, 0);
        let (p_off, length): (i64, i64) = sink
            .connection()
            .query_row("SELECT p_off, length FROM extent_t WHERE ino = 0 AND type = 3", [], |r| {
                Ok((r.get(0)?, r.get(1)?))
            })
            .unwrap();
        assert_eq!(p_off, (MFT_LCN * CLUSTER) as i64);
        assert_eq!(length, (RECORDS * CLUSTER) as i64);
    }

    #[test_log::test]
    fn freespace_follows_the_bitmap() {
        let sink = mapped_db();
        let (p_off, length): (i64, i64) = sink
            .connection()
            .query_row(
                "SELECT p_off, length FROM extent_t WHERE ino = -4 AND type = 6",
                [],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .unwrap();
        assert_eq!(p_off, 64 * CLUSTER as i64);
        assert_eq!(length, (256 - 64) * CLUSTER as i64);

        let (total, free): (i64, i64) = sink
            .connection()
            .query_row("SELECT total_bytes, free_bytes FROM fs_t", [], |r| {
                Ok((r.get(0)?, r.get(1)?))
            })
            .unwrap();
        assert_eq!(total, 256 * 1024);
        assert_eq!(free, (192 * CLUSTER) as i64);
    }
}
