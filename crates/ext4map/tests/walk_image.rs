// SPDX-FileCopyrightText: Copyright © 2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Walks a hand-assembled ext2-style image end to end and checks the
//! database a mapper run would produce.

use std::io::Write;

use ext4map::dir::{encode_dirent, FT_DIR, FT_REG_FILE, FT_SYMLINK};
use ext4map::Ext4Fs;
use fsmap::{FsDriver, Sink};

const BS: usize = 1024;
const BLOCKS: u32 = 512;
const INODES: u32 = 32;
const INODE_SIZE: usize = 128;

const INO_A_BIN: u32 = 12;
const INO_SUB: u32 = 13;
const INO_HOLE: u32 = 14;
const INO_LINK: u32 = 15;

fn put_inode(img: &mut [u8], ino: u32, raw: &[u8; INODE_SIZE]) {
    // Inode table starts at block 5
    let pos = 5 * BS + (ino as usize - 1) * INODE_SIZE;
    img[pos..pos + INODE_SIZE].copy_from_slice(raw);
}

fn make_inode(mode: u16, size: u32, blocks: &[u32]) -> [u8; INODE_SIZE] {
    let mut raw = [0u8; INODE_SIZE];
    raw[0..2].copy_from_slice(&mode.to_le_bytes());
    raw[4..8].copy_from_slice(&size.to_le_bytes());
    raw[8..12].copy_from_slice(&111u32.to_le_bytes()); // atime
    raw[12..16].copy_from_slice(&222u32.to_le_bytes()); // ctime
    raw[16..20].copy_from_slice(&333u32.to_le_bytes()); // mtime
    raw[28..32].copy_from_slice(&(blocks.len() as u32 * 2).to_le_bytes()); // 512-byte sectors
    for (i, blk) in blocks.iter().enumerate() {
        raw[40 + i * 4..44 + i * 4].copy_from_slice(&blk.to_le_bytes());
    }
    raw
}

fn build_image() -> Vec<u8> {
    let mut img = vec![0u8; BLOCKS as usize * BS];

    // Superblock at offset 1024
    {
        let sb = &mut img[1024..2048];
        sb[0..4].copy_from_slice(&INODES.to_le_bytes());
        sb[4..8].copy_from_slice(&BLOCKS.to_le_bytes());
        sb[12..16].copy_from_slice(&480u32.to_le_bytes()); // free blocks
        sb[16..20].copy_from_slice(&17u32.to_le_bytes()); // free inodes
        sb[20..24].copy_from_slice(&1u32.to_le_bytes()); // first data block
        sb[24..28].copy_from_slice(&0u32.to_le_bytes()); // 1 KiB blocks
        sb[32..36].copy_from_slice(&8192u32.to_le_bytes()); // blocks per group
        sb[40..44].copy_from_slice(&INODES.to_le_bytes()); // inodes per group
        sb[56..58].copy_from_slice(&0xEF53u16.to_le_bytes());
        sb[76..80].copy_from_slice(&1u32.to_le_bytes()); // rev level
        sb[84..88].copy_from_slice(&11u32.to_le_bytes()); // first ino
        sb[88..90].copy_from_slice(&(INODE_SIZE as u16).to_le_bytes());
        sb[96..100].copy_from_slice(&0x0002u32.to_le_bytes()); // filetype
        sb[100..104].copy_from_slice(&0x0001u32.to_le_bytes()); // sparse_super
    }

    // Group descriptor in block 2: bitmaps at 3/4, inode table at 5
    {
        let gd = &mut img[2 * BS..2 * BS + 32];
        gd[0..4].copy_from_slice(&3u32.to_le_bytes());
        gd[4..8].copy_from_slice(&4u32.to_le_bytes());
        gd[8..12].copy_from_slice(&5u32.to_le_bytes());
    }

    // Root directory: block 9
    {
        let mut block = Vec::new();
        encode_dirent(&mut block, 2, b".", FT_DIR, 12);
        encode_dirent(&mut block, 2, b"..", FT_DIR, 12);
        encode_dirent(&mut block, INO_A_BIN, b"a.bin", FT_REG_FILE, 16);
        encode_dirent(&mut block, INO_HOLE, b"hole.bin", FT_REG_FILE, 20);
        let tail = (BS - block.len()) as u16;
        encode_dirent(&mut block, INO_SUB, b"sub", FT_DIR, tail);
        img[9 * BS..10 * BS].copy_from_slice(&block);
    }

    // Subdirectory: block 20
    {
        let mut block = Vec::new();
        encode_dirent(&mut block, INO_SUB, b".", FT_DIR, 12);
        encode_dirent(&mut block, 2, b"..", FT_DIR, 12);
        let tail = (BS - block.len()) as u16;
        encode_dirent(&mut block, INO_LINK, b"link", FT_SYMLINK, tail);
        img[20 * BS..21 * BS].copy_from_slice(&block);
    }

    put_inode(&mut img, 2, &make_inode(0x41ED, BS as u32, &[9]));
    // 10 KiB contiguous file at blocks 10..20
    put_inode(
        &mut img,
        INO_A_BIN,
        &make_inode(0x81A4, 10240, &[10, 11, 12, 13, 14, 15, 16, 17, 18, 19]),
    );
    put_inode(&mut img, INO_SUB, &make_inode(0x41ED, BS as u32, &[20]));
    // Block at logical 0 and logical 2, hole between
    put_inode(&mut img, INO_HOLE, &make_inode(0x81A4, 3072, &[21, 0, 22]));
    // Fast symlink, target "a.bin" in the inode body
    let mut link = make_inode(0xA1FF, 5, &[]);
    link[40..45].copy_from_slice(b"a.bin");
    put_inode(&mut img, INO_LINK, &link);

    img
}

fn mapped_db() -> Sink {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(&build_image()).unwrap();

    let mut fs = Ext4Fs::open(file.path()).unwrap();
    let mut sink = Sink::open_in_memory().unwrap();

    // Same phase order as the mapper binaries
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
    sink.begin().unwrap();
    sink.cache_overview(2048).unwrap();
    sink.cache_overview(65536).unwrap();
    sink.commit().unwrap();
    sink
}

#[test_log::test]
fn volume_stats_row() {
    let sink = mapped_db();
    let (block_size, total, finished): (i64, i64, i64) = sink
        .connection()
        .query_row("SELECT block_size, total_bytes, finished FROM fs_t", [], |r| {
            Ok((r.get(0)?, r.get(1)?, r.get(2)?))
        })
        .unwrap();
    assert_eq!(block_size, BS as i64);
    assert_eq!(total, (BLOCKS as i64) * BS as i64);
    assert_eq!(finished, 1);
}

#[test_log::test]
fn contiguous_file_collapses_to_one_extent() {
    let sink = mapped_db();
    let ino: i64 = sink
        .connection()
        .query_row("SELECT ino FROM path_t WHERE path = '/a.bin'", [], |r| r.get(0))
        .unwrap();
    assert_eq!(ino, INO_A_BIN as i64);

    let (ty, size): (i64, i64) = sink
        .connection()
        .query_row("SELECT type, size FROM inode_t WHERE ino = ?", [ino], |r| {
            Ok((r.get(0)?, r.get(1)?))
        })
        .unwrap();
    assert_eq!(ty, 0); // file
    assert_eq!(size, 10240);

    let rows: Vec<(i64, i64, i64)> = {
        let conn = sink.connection();
        let mut stmt = conn
            .prepare("SELECT p_off, l_off, length FROM extent_t WHERE ino = ? AND type = 0")
            .unwrap();
        let rows = stmt
            .query_map([ino], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)))
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        rows
    };
    assert_eq!(rows, vec![(10 * BS as i64, 0, 10240)]);

    let score: f64 = sink
        .connection()
        .query_row("SELECT travel_score FROM inode_t WHERE ino = ?", [ino], |r| r.get(0))
        .unwrap();
    assert!((score - 1.0).abs() < f64::EPSILON);
}

#[test_log::test]
fn holes_are_never_merged_across() {
    let sink = mapped_db();
    let n: i64 = sink
        .connection()
        .query_row(
            "SELECT COUNT(*) FROM extent_t WHERE ino = ? AND type = 0",
            [INO_HOLE as i64],
            |r| r.get(0),
        )
        .unwrap();
    assert_eq!(n, 2);
}

#[test_log::test]
fn symlink_target_is_an_inline_extent() {
    let sink = mapped_db();
    let ino: i64 = sink
        .connection()
        .query_row("SELECT ino FROM path_t WHERE path = '/sub/link'", [], |r| r.get(0))
        .unwrap();
    assert_eq!(ino, INO_LINK as i64);

    let (ty, flags, length): (i64, i64, i64) = sink
        .connection()
        .query_row(
            "SELECT type, flags, length FROM extent_t WHERE ino = ?",
            [ino],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .unwrap();
    assert_eq!(ty, 5); // symlink extent
    assert_eq!(length, 5);
    // Inline data implies the not-aligned bit too
    assert_eq!(flags & 0x300, 0x300);
}

#[test_log::test]
fn dentries_join_types() {
    let sink = mapped_db();
    let ty: i64 = sink
        .connection()
        .query_row(
            "SELECT type FROM dentry_t WHERE dir_ino = 2 AND name = 'sub'",
            [],
            |r| r.get(0),
        )
        .unwrap();
    assert_eq!(ty, 1); // directory
}

#[test_log::test]
fn metadata_tree_covers_group_zero() {
    let sink = mapped_db();
    for path in [
        "/$metadata",
        "/$metadata/groups",
        "/$metadata/groups/0",
        "/$metadata/groups/0/superblock",
        "/$metadata/groups/0/descriptor",
        "/$metadata/groups/0/block_bitmap",
        "/$metadata/groups/0/inode_bitmap",
        "/$metadata/groups/0/inodes",
        "/$metadata/superblocks",
        "/$metadata/inodes",
    ] {
        let n: i64 = sink
            .connection()
            .query_row("SELECT COUNT(*) FROM path_t WHERE path = ?", [path], |r| r.get(0))
            .unwrap();
        assert_eq!(n, 1, "missing {path}");
    }

    // The volume-wide inode table file covers blocks 5..9
    let ino: i64 = sink
        .connection()
        .query_row("SELECT ino FROM path_t WHERE path = '/$metadata/inodes'", [], |r| r.get(0))
        .unwrap();
    let (p_off, length): (i64, i64) = sink
        .connection()
        .query_row("SELECT p_off, length FROM extent_t WHERE ino = ?", [ino], |r| {
            Ok((r.get(0)?, r.get(1)?))
        })
        .unwrap();
    assert_eq!(p_off, 5 * BS as i64);
    assert_eq!(length, 4 * BS as i64);
}

#[test_log::test]
fn overview_rows_are_complete() {
    let sink = mapped_db();
    for length in [2048i64, 65536] {
        let rows: i64 = sink
            .connection()
            .query_row("SELECT COUNT(*) FROM overview_t WHERE length = ?", [length], |r| r.get(0))
            .unwrap();
        assert_eq!(rows, length);
    }
    let covered: i64 = sink
        .connection()
        .query_row(
            "SELECT COUNT(*) FROM overview_t WHERE length = 2048 AND files + dirs + metadata > 0",
            [],
            |r| r.get(0),
        )
        .unwrap();
    assert!(covered > 0);
}
