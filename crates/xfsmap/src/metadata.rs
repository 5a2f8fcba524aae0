// SPDX-FileCopyrightText: Copyright © 2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! The invented `/$metadata` tree for XFS volumes
//!
//! Every allocation group gets a subdirectory documenting its header
//! sectors, free list, btrees, free space and inode chunks; the blocks
//! collected per group accumulate in range maps that then back the
//! volume-wide aggregate files. The log and the reserved quota and
//! realtime inodes surface as files of their own.

use fsmap::{
    Extent, ExtentFlags, ExtentKind, InodeKind, RangeMap, Result, Sink, Tag,
};

use crate::ag::{self, AGF_ROOT_BNO, AGF_ROOT_CNT};
use crate::btree;
use crate::superblock::NULL_INO;
use crate::XfsFs;

const INO_METADATA_DIR: i64 = -1;
const INO_SB_FILE: i64 = -2;
const INO_BNOBT_FILE: i64 = -3;
const INO_CNTBT_FILE: i64 = -4;
const INO_INOBT_FILE: i64 = -5;
const INO_FINOBT_FILE: i64 = -6;
const INO_RMAPBT_FILE: i64 = -7;
const INO_REFCOUNTBT_FILE: i64 = -8;
const INO_FL_FILE: i64 = -9;
const INO_JOURNAL_FILE: i64 = -10;
const INO_ITABLE_FILE: i64 = -11;
const INO_HIDDEN_DIR: i64 = -12;
const INO_FREESP_FILE: i64 = -13;
/// Must stay last: per-group inode numbers count down from here
const INO_GROUPS_DIR: i64 = -14;

const STR_METADATA_DIR: &str = "$metadata";
const STR_SB_FILE: &str = "superblocks";
const STR_BNOBT_FILE: &str = "bnobt";
const STR_CNTBT_FILE: &str = "cntbt";
const STR_INOBT_FILE: &str = "inobt";
const STR_FINOBT_FILE: &str = "finobt";
const STR_RMAPBT_FILE: &str = "rmapbt";
const STR_REFCOUNTBT_FILE: &str = "refcountbt";
const STR_FL_FILE: &str = "freelist";
const STR_JOURNAL_FILE: &str = "journal";
const STR_ITABLE_FILE: &str = "inodes";
const STR_HIDDEN_DIR: &str = "hidden_files";
const STR_FREESP_FILE: &str = "freespace";
const STR_GROUPS_DIR: &str = "groups";

/// Inodes per allocated inode chunk
const INODES_PER_CHUNK: u64 = 64;

struct Maps {
    ag: RangeMap,
    agfl: RangeMap,
    bnobt: RangeMap,
    freesp: RangeMap,
    cntbt: RangeMap,
    inobt: RangeMap,
    finobt: RangeMap,
    itable: RangeMap,
    rmapbt: RangeMap,
    refcountbt: RangeMap,
}

pub fn walk(fs: &mut XfsFs, sink: &mut Sink) -> Result<()> {
    let ags = ag::read_ags(&fs.dev, &fs.sb)?;
    let sizes: Vec<u64> = (0..fs.sb.agcount.get()).map(|a| fs.sb.ag_size(a)).collect();
    let mut maps = Maps {
        ag: RangeMap::new(&sizes, 1),
        agfl: RangeMap::new(&sizes, 1),
        bnobt: RangeMap::new(&sizes, 1),
        freesp: RangeMap::new(&sizes, 1),
        cntbt: RangeMap::new(&sizes, 1),
        inobt: RangeMap::new(&sizes, 1),
        finobt: RangeMap::new(&sizes, 1),
        itable: RangeMap::new(&sizes, 1),
        rmapbt: RangeMap::new(&sizes, 1),
        refcountbt: RangeMap::new(&sizes, 1),
    };

    inject_roots(fs, sink)?;
    walk_log(fs, sink)?;
    walk_groups(fs, sink, &ags, &mut maps)?;

    // Aggregate files spanning the whole volume
    emit_map(fs, sink, INO_SB_FILE, &maps.ag, ExtentKind::Metadata)?;
    emit_map(fs, sink, INO_FL_FILE, &maps.agfl, ExtentKind::Metadata)?;
    emit_map(fs, sink, INO_BNOBT_FILE, &maps.bnobt, ExtentKind::Metadata)?;
    emit_map(fs, sink, INO_FREESP_FILE, &maps.freesp, ExtentKind::Freespace)?;
    emit_map(fs, sink, INO_CNTBT_FILE, &maps.cntbt, ExtentKind::Metadata)?;
    emit_map(fs, sink, INO_INOBT_FILE, &maps.inobt, ExtentKind::Metadata)?;
    if fs.sb.has_finobt() {
        emit_map(fs, sink, INO_FINOBT_FILE, &maps.finobt, ExtentKind::Metadata)?;
    }
    emit_map(fs, sink, INO_ITABLE_FILE, &maps.itable, ExtentKind::Metadata)?;
    if fs.sb.has_rmapbt() {
        emit_map(fs, sink, INO_RMAPBT_FILE, &maps.rmapbt, ExtentKind::Metadata)?;
    }
    if fs.sb.has_reflink() {
        emit_map(fs, sink, INO_REFCOUNTBT_FILE, &maps.refcountbt, ExtentKind::Metadata)?;
    }

    walk_hidden_files(fs, sink)
}

fn inject_roots(fs: &XfsFs, sink: &mut Sink) -> Result<()> {
    let root_ino = fs.sb.rootino.get();
    let md = format!("/{STR_METADATA_DIR}");
    sink.inject_metadata(root_ino, "", INO_METADATA_DIR, STR_METADATA_DIR, InodeKind::Dir)?;
    sink.inject_metadata(INO_METADATA_DIR, &md, INO_GROUPS_DIR, STR_GROUPS_DIR, InodeKind::Dir)?;
    sink.inject_metadata(INO_METADATA_DIR, &md, INO_HIDDEN_DIR, STR_HIDDEN_DIR, InodeKind::Dir)?;
    sink.inject_metadata(INO_METADATA_DIR, &md, INO_SB_FILE, STR_SB_FILE, InodeKind::Metadata)?;
    sink.inject_metadata(INO_METADATA_DIR, &md, INO_FL_FILE, STR_FL_FILE, InodeKind::Metadata)?;
    sink.inject_metadata(INO_METADATA_DIR, &md, INO_BNOBT_FILE, STR_BNOBT_FILE, InodeKind::Metadata)?;
    sink.inject_metadata(INO_METADATA_DIR, &md, INO_FREESP_FILE, STR_FREESP_FILE, InodeKind::Freespace)?;
    sink.inject_metadata(INO_METADATA_DIR, &md, INO_CNTBT_FILE, STR_CNTBT_FILE, InodeKind::Metadata)?;
    sink.inject_metadata(INO_METADATA_DIR, &md, INO_INOBT_FILE, STR_INOBT_FILE, InodeKind::Metadata)?;
    if fs.sb.has_finobt() {
        sink.inject_metadata(INO_METADATA_DIR, &md, INO_FINOBT_FILE, STR_FINOBT_FILE, InodeKind::Metadata)?;
    }
    if fs.sb.has_rmapbt() {
        sink.inject_metadata(INO_METADATA_DIR, &md, INO_RMAPBT_FILE, STR_RMAPBT_FILE, InodeKind::Metadata)?;
    }
    if fs.sb.has_reflink() {
        sink.inject_metadata(
            INO_METADATA_DIR,
            &md,
            INO_REFCOUNTBT_FILE,
            STR_REFCOUNTBT_FILE,
            InodeKind::Metadata,
        )?;
    }
    sink.inject_metadata(INO_METADATA_DIR, &md, INO_ITABLE_FILE, STR_ITABLE_FILE, InodeKind::Metadata)
}

/// The internal log is one contiguous extent.
fn walk_log(fs: &XfsFs, sink: &mut Sink) -> Result<()> {
    if fs.sb.logstart.get() == 0 {
        // External log device; nothing of it lives on this volume
        return Ok(());
    }
    let md = format!("/{STR_METADATA_DIR}");
    sink.inject_metadata(INO_METADATA_DIR, &md, INO_JOURNAL_FILE, STR_JOURNAL_FILE, InodeKind::File)?;
    sink.insert_extent(&Extent {
        ino: INO_JOURNAL_FILE,
        physical: fs.sb.fsb_to_bytes(fs.sb.check_fsb(fs.sb.logstart.get())?),
        logical: Some(0),
        length: u64::from(fs.sb.logblocks.get()) * fs.sb.block_size(),
        flags: ExtentFlags::empty(),
        kind: ExtentKind::File,
    })
}

fn walk_groups(fs: &mut XfsFs, sink: &mut Sink, ags: &[ag::AgHeaders], maps: &mut Maps) -> Result<()> {
    let sb_handle = &fs.sb;
    let bs = sb_handle.block_size();
    let sectsize = u64::from(sb_handle.sectsize.get());
    let agcount = sb_handle.agcount.get();
    let width = agcount.to_string().len();
    let groups_path = format!("/{STR_METADATA_DIR}/{STR_GROUPS_DIR}");
    let mut ino = INO_GROUPS_DIR - 1;

    for (agno, hdrs) in ags.iter().enumerate() {
        let agno = agno as u32;
        let name = format!("{agno:0width$}");
        let group_ino = ino;
        ino -= 1;
        sink.inject_metadata(INO_GROUPS_DIR, &groups_path, group_ino, &name, InodeKind::Dir)?;
        let group_path = format!("{groups_path}/{name}");

        // Superblock, AGF, AGI and AGFL sectors
        let header_blocks = (4 * sectsize).div_ceil(bs).max(1);
        maps.ag.set(agno as usize, 0, header_blocks, Tag::InUse);
        sink.inject_metadata(group_ino, &group_path, ino, "superblock", InodeKind::Metadata)?;
        sink.insert_extent(&Extent {
            ino,
            physical: fs.sb.agb_to_bytes(agno, 0),
            logical: None,
            length: 4 * sectsize,
            flags: ExtentFlags::SHARED,
            kind: ExtentKind::Metadata,
        })?;
        ino -= 1;

        // Free list blocks
        for &bno in &hdrs.freelist {
            fs.sb.check_agbno(agno, u64::from(bno))?;
            maps.agfl.set(agno as usize, u64::from(bno), 1, Tag::InUse);
        }
        sink.inject_metadata(group_ino, &group_path, ino, STR_FL_FILE, InodeKind::Metadata)?;
        emit_group_runs(fs, sink, ino, &maps.agfl, agno, ExtentKind::Metadata)?;
        ino -= 1;

        // Free-space btrees
        let bnobt_root = hdrs.agf.roots[AGF_ROOT_BNO].get();
        sink.inject_metadata(group_ino, &group_path, ino, STR_BNOBT_FILE, InodeKind::Metadata)?;
        let left_bnobt_leaf = walk_tree_into(fs, agno, bnobt_root, &btree::BNOBT_OPS, &mut maps.bnobt)?;
        emit_group_runs(fs, sink, ino, &maps.bnobt, agno, ExtentKind::Metadata)?;
        ino -= 1;

        // Free space itself, from the by-block btree records
        sink.inject_metadata(group_ino, &group_path, ino, STR_FREESP_FILE, InodeKind::Freespace)?;
        btree::walk_alloc_records(&fs.dev, &fs.sb, agno, left_bnobt_leaf, &mut |start, count| {
            fs.sb.check_agbno(agno, u64::from(start))?;
            maps.freesp.set(agno as usize, u64::from(start), u64::from(count), Tag::InUse);
            Ok(())
        })?;
        emit_group_runs(fs, sink, ino, &maps.freesp, agno, ExtentKind::Freespace)?;
        ino -= 1;

        sink.inject_metadata(group_ino, &group_path, ino, STR_CNTBT_FILE, InodeKind::Metadata)?;
        walk_tree_into(fs, agno, hdrs.agf.roots[AGF_ROOT_CNT].get(), &btree::CNTBT_OPS, &mut maps.cntbt)?;
        emit_group_runs(fs, sink, ino, &maps.cntbt, agno, ExtentKind::Metadata)?;
        ino -= 1;

        // Inode btrees
        sink.inject_metadata(group_ino, &group_path, ino, STR_INOBT_FILE, InodeKind::Metadata)?;
        let left_inobt_leaf = walk_tree_into(fs, agno, hdrs.agi.root.get(), &btree::INOBT_OPS, &mut maps.inobt)?;
        emit_group_runs(fs, sink, ino, &maps.inobt, agno, ExtentKind::Metadata)?;
        ino -= 1;

        if fs.sb.has_finobt() {
            sink.inject_metadata(group_ino, &group_path, ino, STR_FINOBT_FILE, InodeKind::Metadata)?;
            walk_tree_into(fs, agno, hdrs.agi.free_root.get(), &btree::FINOBT_OPS, &mut maps.finobt)?;
            emit_group_runs(fs, sink, ino, &maps.finobt, agno, ExtentKind::Metadata)?;
            ino -= 1;
        }

        // Inode chunks
        let chunk_blocks = (INODES_PER_CHUNK * fs.sb.inode_size()).div_ceil(bs);
        sink.inject_metadata(group_ino, &group_path, ino, STR_ITABLE_FILE, InodeKind::Metadata)?;
        btree::walk_inobt_records(&fs.dev, &fs.sb, agno, left_inobt_leaf, &mut |startino| {
            let agbno = u64::from(startino) >> fs.sb.inopblog;
            fs.sb.check_agbno(agno, agbno)?;
            maps.itable.set(agno as usize, agbno, chunk_blocks, Tag::InUse);
            Ok(())
        })?;
        emit_group_runs(fs, sink, ino, &maps.itable, agno, ExtentKind::Metadata)?;
        ino -= 1;

        if fs.sb.has_rmapbt() {
            sink.inject_metadata(group_ino, &group_path, ino, STR_RMAPBT_FILE, InodeKind::Metadata)?;
            walk_tree_into(fs, agno, hdrs.agf.roots[2].get(), &btree::RMAPBT_OPS, &mut maps.rmapbt)?;
            emit_group_runs(fs, sink, ino, &maps.rmapbt, agno, ExtentKind::Metadata)?;
            ino -= 1;
        }

        if fs.sb.has_reflink() {
            sink.inject_metadata(group_ino, &group_path, ino, STR_REFCOUNTBT_FILE, InodeKind::Metadata)?;
            walk_tree_into(fs, agno, hdrs.agf.refcount_root.get(), &btree::REFCOUNTBT_OPS, &mut maps.refcountbt)?;
            emit_group_runs(fs, sink, ino, &maps.refcountbt, agno, ExtentKind::Metadata)?;
            ino -= 1;
        }
    }
    Ok(())
}

/// Descend one AG btree, collecting every block into a range map.
fn walk_tree_into(
    fs: &XfsFs,
    agno: u32,
    root: u32,
    ops: &btree::BtreeOps,
    map: &mut RangeMap,
) -> Result<u32> {
    btree::walk_nodes(&fs.dev, &fs.sb, agno, root, ops, &mut |agbno| {
        map.set(agno as usize, agbno, 1, Tag::InUse);
        Ok(())
    })
}

/// Emit the in-use runs of one group as extents of a synthetic file.
fn emit_group_runs(
    fs: &XfsFs,
    sink: &mut Sink,
    ino: i64,
    map: &RangeMap,
    agno: u32,
    kind: ExtentKind,
) -> Result<()> {
    let bs = fs.sb.block_size();
    for run in map.runs(agno as usize) {
        if run.tag != Tag::InUse {
            continue;
        }
        sink.insert_extent(&Extent {
            ino,
            physical: fs.sb.agb_to_bytes(agno, run.start),
            logical: None,
            length: run.length * bs,
            flags: ExtentFlags::SHARED,
            kind,
        })?;
    }
    Ok(())
}

/// Emit every group's in-use runs for a volume-wide aggregate file.
fn emit_map(fs: &XfsFs, sink: &mut Sink, ino: i64, map: &RangeMap, kind: ExtentKind) -> Result<()> {
    for agno in 0..fs.sb.agcount.get() {
        emit_group_runs(fs, sink, ino, map, agno, kind)?;
    }
    Ok(())
}

/// Quota and realtime inodes exist outside any directory; give them one.
fn walk_hidden_files(fs: &mut XfsFs, sink: &mut Sink) -> Result<()> {
    let hidden: [(i64, &str); 5] = [
        (fs.sb.uquotino.get(), "user_quota"),
        (fs.sb.gquotino.get(), "group_quota"),
        (fs.sb.pquotino.get(), "project_quota"),
        (fs.sb.rbmino.get(), "realtime_bitmap"),
        (fs.sb.rsumino.get(), "realtime_summary"),
    ];
    let hidden_path = format!("/{STR_METADATA_DIR}/{STR_HIDDEN_DIR}");

    for (ino, name) in hidden {
        if ino <= 0 || ino as u64 == NULL_INO {
            continue;
        }
        let path = format!("{hidden_path}/{name}");
        if fs.record_dirent(sink, INO_HIDDEN_DIR, &hidden_path, name, ino as u64, None)?.is_some() {
            log::warn!("hidden file {path} is unexpectedly a directory");
        }
    }
    Ok(())
}
