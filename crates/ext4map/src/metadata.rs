// SPDX-FileCopyrightText: Copyright © 2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! The invented `/$metadata` tree for ext\* volumes
//!
//! Per-group subdirectories document where each group keeps its
//! superblock backup, descriptor table, bitmaps and inode table slice;
//! volume-wide files concatenate the same regions across all groups via
//! per-group range maps; reserved inodes surface under `hidden_files/`.

use fsmap::{
    Extent, ExtentFlags, ExtentKind, InodeKind, RangeMap, Result, Sink, Tag,
};

use crate::superblock::{
    Ext4Super, BAD_INO, BOOT_LOADER_INO, FEATURE_COMPAT_HAS_JOURNAL, FEATURE_COMPAT_RESIZE_INODE,
    GRP_QUOTA_INO, RESIZE_INO, ROOT_INO, USR_QUOTA_INO,
};
use crate::Ext4Fs;

const INO_METADATA_DIR: i64 = -1;
const INO_SB_FILE: i64 = -2;
const INO_DESC_FILE: i64 = -3;
const INO_BBITMAP_FILE: i64 = -4;
const INO_IBITMAP_FILE: i64 = -5;
const INO_ITABLE_FILE: i64 = -6;
const INO_HIDDEN_DIR: i64 = -7;
/// Must stay last: per-group inode numbers count down from here
const INO_GROUPS_DIR: i64 = -8;

const STR_METADATA_DIR: &str = "$metadata";
const STR_SB_FILE: &str = "superblocks";
const STR_DESC_FILE: &str = "descriptors";
const STR_BBITMAP_FILE: &str = "block_bitmaps";
const STR_IBITMAP_FILE: &str = "inode_bitmaps";
const STR_ITABLE_FILE: &str = "inodes";
const STR_HIDDEN_DIR: &str = "hidden_files";
const STR_GROUPS_DIR: &str = "groups";

/// The aggregate maps accumulated across the per-group loop
struct Aggregates {
    sb: RangeMap,
    desc: RangeMap,
    bbitmap: RangeMap,
    ibitmap: RangeMap,
    itable: RangeMap,
}

/// Spread a block run over the per-group map(s) it touches.
fn mark(map: &mut RangeMap, sb: &Ext4Super, start: u64, count: u64) {
    let bpg = u64::from(sb.blocks_per_group.get());
    let first = u64::from(sb.first_data_block.get());
    let mut blk = start;
    let mut left = count;
    while left > 0 {
        let group = (blk - first) / bpg;
        let offset = (blk - first) % bpg;
        let n = left.min(bpg - offset);
        map.set(group as usize, offset, n, Tag::InUse);
        blk += n;
        left -= n;
    }
}

pub fn walk(fs: &mut Ext4Fs, sink: &mut Sink) -> Result<()> {
    let group_count = fs.superblock().group_count();

    sink.inject_metadata(ROOT_INO as i64, "", INO_METADATA_DIR, STR_METADATA_DIR, InodeKind::Dir)?;
    let md_path = format!("/{STR_METADATA_DIR}");
    sink.inject_metadata(INO_METADATA_DIR, &md_path, INO_GROUPS_DIR, STR_GROUPS_DIR, InodeKind::Dir)?;
    sink.inject_metadata(INO_METADATA_DIR, &md_path, INO_HIDDEN_DIR, STR_HIDDEN_DIR, InodeKind::Dir)?;
    sink.inject_metadata(INO_METADATA_DIR, &md_path, INO_SB_FILE, STR_SB_FILE, InodeKind::Metadata)?;
    sink.inject_metadata(INO_METADATA_DIR, &md_path, INO_DESC_FILE, STR_DESC_FILE, InodeKind::Metadata)?;
    sink.inject_metadata(INO_METADATA_DIR, &md_path, INO_BBITMAP_FILE, STR_BBITMAP_FILE, InodeKind::Metadata)?;
    sink.inject_metadata(INO_METADATA_DIR, &md_path, INO_IBITMAP_FILE, STR_IBITMAP_FILE, InodeKind::Metadata)?;
    sink.inject_metadata(INO_METADATA_DIR, &md_path, INO_ITABLE_FILE, STR_ITABLE_FILE, InodeKind::Metadata)?;

    let sizes: Vec<u64> = (0..group_count)
        .map(|g| fs.superblock().group_block_count(g))
        .collect();
    let mut agg = Aggregates {
        sb: RangeMap::new(&sizes, 1),
        desc: RangeMap::new(&sizes, 1),
        bbitmap: RangeMap::new(&sizes, 1),
        ibitmap: RangeMap::new(&sizes, 1),
        itable: RangeMap::new(&sizes, 1),
    };

    walk_groups(fs, sink, &mut agg)?;

    // Volume-wide aggregate files, one extent per contiguous run
    for (ino, map) in [
        (INO_SB_FILE, &agg.sb),
        (INO_DESC_FILE, &agg.desc),
        (INO_BBITMAP_FILE, &agg.bbitmap),
        (INO_IBITMAP_FILE, &agg.ibitmap),
        (INO_ITABLE_FILE, &agg.itable),
    ] {
        emit_map(fs, sink, ino, map)?;
    }

    walk_hidden_files(fs, sink)
}

fn walk_groups(fs: &mut Ext4Fs, sink: &mut Sink, agg: &mut Aggregates) -> Result<()> {
    let bs = fs.superblock().block_size();
    let group_count = fs.superblock().group_count();
    let width = group_count.to_string().len();
    let groups_path = format!("/{STR_METADATA_DIR}/{STR_GROUPS_DIR}");
    let gdt_blocks = fs.superblock().gdt_blocks();
    let itable_blocks = fs.superblock().itable_blocks();
    let mut ino = INO_GROUPS_DIR - 1;

    for g in 0..group_count {
        let name = format!("{g:0width$}");
        let group_ino = ino;
        ino -= 1;
        sink.inject_metadata(INO_GROUPS_DIR, &groups_path, group_ino, &name, InodeKind::Dir)?;
        let group_path = format!("{groups_path}/{name}");
        let first_blk = fs.superblock().group_first_block(g);

        let mut synth_file = |sink: &mut Sink,
                              fs: &Ext4Fs,
                              name: &str,
                              start_blk: u64,
                              blocks: u64,
                              map: &mut RangeMap|
         -> Result<()> {
            let file_ino = ino;
            ino -= 1;
            sink.inject_metadata(group_ino, &group_path, file_ino, name, InodeKind::Metadata)?;
            sink.insert_extent(&Extent {
                ino: file_ino,
                physical: start_blk * bs,
                logical: None,
                length: blocks * bs,
                flags: ExtentFlags::SHARED,
                kind: ExtentKind::Metadata,
            })?;
            mark(map, fs.superblock(), start_blk, blocks);
            Ok(())
        };

        if fs.superblock().group_has_super(g) {
            synth_file(sink, fs, "superblock", first_blk, 1, &mut agg.sb)?;
            synth_file(sink, fs, "descriptor", first_blk + 1, gdt_blocks, &mut agg.desc)?;
        }
        let gd = *fs.group(g);
        synth_file(sink, fs, "block_bitmap", gd.block_bitmap, 1, &mut agg.bbitmap)?;
        synth_file(sink, fs, "inode_bitmap", gd.inode_bitmap, 1, &mut agg.ibitmap)?;
        synth_file(sink, fs, "inodes", gd.inode_table, itable_blocks, &mut agg.itable)?;
    }
    Ok(())
}

/// Emit the in-use runs of an aggregate map as extents of one file.
fn emit_map(fs: &Ext4Fs, sink: &mut Sink, ino: i64, map: &RangeMap) -> Result<()> {
    let bs = fs.superblock().block_size();
    for g in 0..map.group_count() {
        let first_blk = fs.superblock().group_first_block(g as u64);
        for run in map.runs(g) {
            if run.tag != Tag::InUse {
                continue;
            }
            sink.insert_extent(&Extent {
                ino,
                physical: (first_blk + run.start) * bs,
                logical: None,
                length: run.length * bs,
                flags: ExtentFlags::SHARED,
                kind: ExtentKind::Metadata,
            })?;
        }
    }
    Ok(())
}

fn walk_hidden_files(fs: &mut Ext4Fs, sink: &mut Sink) -> Result<()> {
    let sb = fs.superblock();
    let usr_quota = match sb.usr_quota_inum.get() {
        0 => USR_QUOTA_INO,
        n => u64::from(n),
    };
    let grp_quota = match sb.grp_quota_inum.get() {
        0 => GRP_QUOTA_INO,
        n => u64::from(n),
    };
    let journal = if sb.has_compat(FEATURE_COMPAT_HAS_JOURNAL) {
        u64::from(sb.journal_inum.get())
    } else {
        0
    };
    let resize = if sb.has_compat(FEATURE_COMPAT_RESIZE_INODE) {
        RESIZE_INO
    } else {
        0
    };
    let hidden: [(u64, &str); 6] = [
        (BAD_INO, "badblocks"),
        (usr_quota, "usr_quota"),
        (grp_quota, "grp_quota"),
        (BOOT_LOADER_INO, "boot_loader"),
        (resize, "resize"),
        (journal, "journal"),
    ];

    let hidden_path = format!("/{STR_METADATA_DIR}/{STR_HIDDEN_DIR}");
    let record_size = fs.superblock().inode_record_size();
    for (ino, name) in hidden {
        if ino == 0 || ino > u64::from(fs.superblock().inodes_count.get()) {
            continue;
        }
        let inode = fs.read_inode(ino)?;
        // Unallocated reserved inodes stay invisible
        if inode.size() == 0 && inode.blocks_lo.get() == 0 {
            continue;
        }
        log::debug!("hidden file {name}: ino={ino} size={}", inode.size());
        let path = format!("{hidden_path}/{name}");
        sink.insert_inode(
            ino as i64,
            InodeKind::Metadata,
            &path,
            &inode.times(record_size),
            Some(inode.size()),
        )?;
        sink.insert_dentry(INO_HIDDEN_DIR, name, ino as i64)?;
        if !fs.seen.test_and_set(ino) {
            fs.walk_file_mappings(sink, ino as i64, &inode, InodeKind::Metadata)?;
        }
    }
    Ok(())
}
