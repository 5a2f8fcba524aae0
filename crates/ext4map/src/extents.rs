// SPDX-FileCopyrightText: Copyright © 2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! File mapping walks: the ext4 extent tree and the classic ext2/ext3
//! indirect block map. Both produce the same normalized run list, plus
//! the mapping-structure blocks themselves, which get their own records
//! in the database.

use zerocopy::little_endian::{U16, U32};
use zerocopy::{FromBytes, Immutable, KnownLayout, Unaligned};

use fsmap::{BlockFile, Error, Result};

use crate::inode::Ext4Inode;
use crate::superblock::Ext4Super;

pub const EXTENT_MAGIC: u16 = 0xF30A;
/// An extent length at or above this encodes an unwritten extent
const UNWRITTEN_BIAS: u16 = 32768;
const MAX_DEPTH: u16 = 5;

#[derive(Debug, FromBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
struct ExtentHeader {
    magic: U16,
    entries: U16,
    max: U16,
    depth: U16,
    generation: U32,
}

#[derive(Debug, FromBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
struct ExtentIdx {
    block: U32,
    leaf_lo: U32,
    leaf_hi: U16,
    unused: U16,
}

#[derive(Debug, FromBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
struct ExtentLeaf {
    block: U32,
    len: U16,
    start_hi: U16,
    start_lo: U32,
}

const ENTRY_SIZE: usize = 12;

/// One mapped run of file data, in block units
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapRun {
    pub logical: u64,
    pub physical: u64,
    pub count: u64,
    pub unwritten: bool,
}

/// A block used by the mapping structure itself
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetaBlock {
    pub physical: u64,
    /// First logical block the subtree under this block covers, when the
    /// structure records one
    pub logical: Option<u64>,
}

/// Everything learned from one inode's data mapping
#[derive(Debug, Default)]
pub struct Mappings {
    pub data: Vec<MapRun>,
    pub meta: Vec<MetaBlock>,
}

/// Walk an inode's mapping, whichever format it uses.
pub fn collect(dev: &BlockFile, sb: &Ext4Super, inode: &Ext4Inode) -> Result<Mappings> {
    let mut out = Mappings::default();
    if inode.has_flag(crate::inode::EXTENTS_FL) {
        walk_extent_node(dev, sb, &inode.block, 0, &mut out)?;
    } else {
        walk_block_map(dev, sb, inode, &mut out)?;
    }
    Ok(out)
}

fn check_block(sb: &Ext4Super, block: u64) -> Result<u64> {
    if block == 0 || block >= sb.blocks_count() {
        return Err(Error::corrupt(format!("block {block} outside the volume")));
    }
    Ok(block)
}

fn walk_extent_node(
    dev: &BlockFile,
    sb: &Ext4Super,
    node: &[u8],
    level: u16,
    out: &mut Mappings,
) -> Result<()> {
    let (hdr, _) = ExtentHeader::read_from_prefix(node)
        .map_err(|_| Error::corrupt("short extent node"))?;
    if hdr.magic.get() != EXTENT_MAGIC {
        return Err(Error::corrupt(format!(
            "bad extent node magic {:#06x}",
            hdr.magic.get()
        )));
    }
    let depth = hdr.depth.get();
    if depth > MAX_DEPTH || level > MAX_DEPTH {
        return Err(Error::corrupt(format!("impossible extent tree depth {depth}")));
    }
    let entries = hdr.entries.get() as usize;
    let body = &node[ENTRY_SIZE..];
    if body.len() / ENTRY_SIZE < entries {
        return Err(Error::corrupt("extent node overflows its block"));
    }

    for i in 0..entries {
        let raw = &body[i * ENTRY_SIZE..(i + 1) * ENTRY_SIZE];
        if depth > 0 {
            let (idx, _) = ExtentIdx::read_from_prefix(raw).expect("slice is one entry");
            let child =
                check_block(sb, u64::from(idx.leaf_hi.get()) << 32 | u64::from(idx.leaf_lo.get()))?;
            out.meta.push(MetaBlock {
                physical: child,
                logical: Some(u64::from(idx.block.get())),
            });
            let buf = dev.read_vec(child * sb.block_size(), sb.block_size() as usize)?;
            walk_extent_node(dev, sb, &buf, level + 1, out)?;
        } else {
            let (leaf, _) = ExtentLeaf::read_from_prefix(raw).expect("slice is one entry");
            let raw_len = leaf.len.get();
            let (count, unwritten) = if raw_len >= UNWRITTEN_BIAS {
                ((raw_len - UNWRITTEN_BIAS) as u64, true)
            } else {
                (raw_len as u64, false)
            };
            if count == 0 {
                return Err(Error::corrupt("zero-length extent"));
            }
            let physical =
                check_block(sb, u64::from(leaf.start_hi.get()) << 32 | u64::from(leaf.start_lo.get()))?;
            out.data.push(MapRun {
                logical: u64::from(leaf.block.get()),
                physical,
                count,
                unwritten,
            });
        }
    }
    Ok(())
}

/// Entries a mapping block holds
fn addrs_per_block(sb: &Ext4Super) -> u64 {
    sb.block_size() / 4
}

fn walk_block_map(dev: &BlockFile, sb: &Ext4Super, inode: &Ext4Inode, out: &mut Mappings) -> Result<()> {
    let apb = addrs_per_block(sb);
    let slots: Vec<u32> = inode
        .block
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();

    // Direct blocks
    for (i, &blk) in slots[..12].iter().enumerate() {
        if blk != 0 {
            out.data.push(MapRun {
                logical: i as u64,
                physical: check_block(sb, u64::from(blk))?,
                count: 1,
                unwritten: false,
            });
        }
    }
    // Then the three indirection pyramids
    let mut logical = 12u64;
    for (level, &root) in slots[12..15].iter().enumerate() {
        let span = apb.pow(level as u32 + 1);
        if root != 0 {
            walk_indirect(dev, sb, u64::from(root), level as u32, logical, out)?;
        }
        logical += span;
    }
    Ok(())
}

fn walk_indirect(
    dev: &BlockFile,
    sb: &Ext4Super,
    map_block: u64,
    level: u32,
    logical_start: u64,
    out: &mut Mappings,
) -> Result<()> {
    check_block(sb, map_block)?;
    out.meta.push(MetaBlock {
        physical: map_block,
        logical: None,
    });
    let apb = addrs_per_block(sb);
    let child_span = apb.pow(level);
    let buf = dev.read_vec(map_block * sb.block_size(), sb.block_size() as usize)?;

    for (i, chunk) in buf.chunks_exact(4).enumerate() {
        let blk = u64::from(u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]));
        if blk == 0 {
            continue;
        }
        let logical = logical_start + i as u64 * child_span;
        if level == 0 {
            out.data.push(MapRun {
                logical,
                physical: check_block(sb, blk)?,
                count: 1,
                unwritten: false,
            });
        } else {
            walk_indirect(dev, sb, blk, level - 1, logical, out)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn test_sb(blocks: u32) -> Ext4Super {
        let mut raw = vec![0u8; 1024];
        raw[56] = 0x53;
        raw[57] = 0xEF;
        raw[24] = 0; // 1 KiB blocks
        raw[32..36].copy_from_slice(&8192u32.to_le_bytes());
        raw[40..44].copy_from_slice(&64u32.to_le_bytes());
        raw[4..8].copy_from_slice(&blocks.to_le_bytes());
        Ext4Super::parse(&raw).unwrap()
    }

    fn inode_with_block(block: [u8; 60], flags: u32) -> Ext4Inode {
        let mut raw = vec![0u8; 160];
        raw[0..2].copy_from_slice(&0x81a4u16.to_le_bytes());
        raw[32..36].copy_from_slice(&flags.to_le_bytes());
        raw[40..100].copy_from_slice(&block);
        Ext4Inode::parse(&raw, 160).unwrap()
    }

    fn leaf(block: u32, len: u16, start: u32) -> [u8; 12] {
        let mut e = [0u8; 12];
        e[0..4].copy_from_slice(&block.to_le_bytes());
        e[4..6].copy_from_slice(&len.to_le_bytes());
        e[8..12].copy_from_slice(&start.to_le_bytes());
        e
    }

    fn extent_root(entries: &[[u8; 12]], depth: u16) -> [u8; 60] {
        let mut root = [0u8; 60];
        root[0..2].copy_from_slice(&EXTENT_MAGIC.to_le_bytes());
        root[2..4].copy_from_slice(&(entries.len() as u16).to_le_bytes());
        root[4..6].copy_from_slice(&4u16.to_le_bytes());
        root[6..8].copy_from_slice(&depth.to_le_bytes());
        for (i, e) in entries.iter().enumerate() {
            root[12 + i * 12..24 + i * 12].copy_from_slice(e);
        }
        root
    }

    #[test]
    fn inline_extent_tree_leaves() {
        let dev_file = tempfile::NamedTempFile::new().unwrap();
        let dev = BlockFile::open(dev_file.path()).unwrap();
        let sb = test_sb(100000);

        let root = extent_root(&[leaf(0, 10, 500), leaf(10, 32768 + 5, 700)], 0);
        let inode = inode_with_block(root, crate::inode::EXTENTS_FL);
        let map = collect(&dev, &sb, &inode).unwrap();
        assert_eq!(
            map.data,
            vec![
                MapRun { logical: 0, physical: 500, count: 10, unwritten: false },
                MapRun { logical: 10, physical: 700, count: 5, unwritten: true },
            ]
        );
        assert!(map.meta.is_empty());
    }

    #[test]
    fn extent_index_nodes_are_recorded() {
        // Build a one-level tree: root index -> leaf node in block 50
        let mut img = vec![0u8; 100 * 1024];
        let mut node = vec![0u8; 1024];
        node[0..2].copy_from_slice(&EXTENT_MAGIC.to_le_bytes());
        node[2..4].copy_from_slice(&1u16.to_le_bytes());
        node[4..6].copy_from_slice(&84u16.to_le_bytes());
        // depth 0 leaf node
        node[12..24].copy_from_slice(&leaf(0, 8, 60));
        img[50 * 1024..51 * 1024].copy_from_slice(&node);

        let mut dev_file = tempfile::NamedTempFile::new().unwrap();
        dev_file.write_all(&img).unwrap();
        let dev = BlockFile::open(dev_file.path()).unwrap();
        let sb = test_sb(100);

        let mut idx = [0u8; 12];
        idx[4..8].copy_from_slice(&50u32.to_le_bytes()); // leaf_lo
        let root = extent_root(&[idx], 1);
        let inode = inode_with_block(root, crate::inode::EXTENTS_FL);

        let map = collect(&dev, &sb, &inode).unwrap();
        assert_eq!(map.meta, vec![MetaBlock { physical: 50, logical: Some(0) }]);
        assert_eq!(map.data, vec![MapRun { logical: 0, physical: 60, count: 8, unwritten: false }]);
    }

    #[test]
    fn bad_extent_magic_is_corrupt() {
        let dev_file = tempfile::NamedTempFile::new().unwrap();
        let dev = BlockFile::open(dev_file.path()).unwrap();
        let sb = test_sb(1000);
        let inode = inode_with_block([0u8; 60], crate::inode::EXTENTS_FL);
        assert!(matches!(
            collect(&dev, &sb, &inode),
            Err(Error::CorruptStructure(_))
        ));
    }

    #[test]
    fn block_map_with_hole_and_indirection() {
        // Direct blocks 0 and 2 mapped, 1 is a hole; single indirect block
        // at 30 maps logical 12 to physical 40.
        let mut img = vec![0u8; 100 * 1024];
        img[30 * 1024..30 * 1024 + 4].copy_from_slice(&40u32.to_le_bytes());
        let mut dev_file = tempfile::NamedTempFile::new().unwrap();
        dev_file.write_all(&img).unwrap();
        let dev = BlockFile::open(dev_file.path()).unwrap();
        let sb = test_sb(100);

        let mut block = [0u8; 60];
        block[0..4].copy_from_slice(&20u32.to_le_bytes());
        block[8..12].copy_from_slice(&21u32.to_le_bytes());
        block[48..52].copy_from_slice(&30u32.to_le_bytes()); // single indirect
        let inode = inode_with_block(block, 0);

        let map = collect(&dev, &sb, &inode).unwrap();
        assert_eq!(map.meta, vec![MetaBlock { physical: 30, logical: None }]);
        assert_eq!(
            map.data,
            vec![
                MapRun { logical: 0, physical: 20, count: 1, unwritten: false },
                MapRun { logical: 2, physical: 21, count: 1, unwritten: false },
                MapRun { logical: 12, physical: 40, count: 1, unwritten: false },
            ]
        );
    }
}
