// SPDX-FileCopyrightText: Copyright © 2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Short-form per-allocation-group btrees
//!
//! The free-space, inode, reverse-mapping and refcount trees all share
//! one block layout: a header, a key array sized for the worst case, and
//! a pointer array behind it. Only the key width differs per tree, so one
//! walker covers them all; record decoding stays with the callers that
//! need it (free-space runs and inode chunks).

use fsmap::{BlockFile, Error, Result};

use crate::superblock::{XfsSuper, NULL_AGBLOCK};

/// Per-tree layout constants
#[derive(Debug, Clone, Copy)]
pub struct BtreeOps {
    pub name: &'static str,
    /// Accepted block magics (plain and CRC-enabled variants)
    pub magics: [u32; 2],
    /// Bytes of key material per node entry (doubled for overlapping trees)
    pub node_key_bytes: usize,
}

/// 'ABTB' / 'AB3B'
pub const BNOBT_OPS: BtreeOps = BtreeOps {
    name: "bnobt",
    magics: [0x4142_5442, 0x4142_3342],
    node_key_bytes: 8,
};
/// 'ABTC' / 'AB3C'
pub const CNTBT_OPS: BtreeOps = BtreeOps {
    name: "cntbt",
    magics: [0x4142_5443, 0x4142_3343],
    node_key_bytes: 8,
};
/// 'IABT' / 'IAB3'
pub const INOBT_OPS: BtreeOps = BtreeOps {
    name: "inobt",
    magics: [0x4941_4254, 0x4941_4233],
    node_key_bytes: 4,
};
/// 'FIBT' / 'FIB3'
pub const FINOBT_OPS: BtreeOps = BtreeOps {
    name: "finobt",
    magics: [0x4649_4254, 0x4649_4233],
    node_key_bytes: 4,
};
/// 'RMB3' only; the tree is overlapping, so nodes carry low and high keys
pub const RMAPBT_OPS: BtreeOps = BtreeOps {
    name: "rmapbt",
    magics: [0x524D_4233, 0x524D_4233],
    node_key_bytes: 40,
};
/// 'R3FC' only
pub const REFCOUNTBT_OPS: BtreeOps = BtreeOps {
    name: "refcountbt",
    magics: [0x5233_4643, 0x5233_4643],
    node_key_bytes: 4,
};

const PTR_SIZE: usize = 4;
const MAX_LEVELS: u16 = 8;

struct BlockHead {
    level: u16,
    numrecs: usize,
    rightsib: u32,
}

fn read_block(
    dev: &BlockFile,
    sb: &XfsSuper,
    agno: u32,
    agbno: u64,
    ops: &BtreeOps,
) -> Result<(BlockHead, Vec<u8>)> {
    sb.check_agbno(agno, agbno)?;
    let block = dev.read_vec(sb.agb_to_bytes(agno, agbno), sb.block_size() as usize)?;
    let magic = u32::from_be_bytes(block[..4].try_into().expect("magic"));
    if !ops.magics.contains(&magic) {
        return Err(Error::corrupt(format!(
            "bad {} magic {magic:#010x} in allocation group {agno}",
            ops.name
        )));
    }
    let level = u16::from_be_bytes([block[4], block[5]]);
    let numrecs = u16::from_be_bytes([block[6], block[7]]) as usize;
    let rightsib = u32::from_be_bytes(block[12..16].try_into().expect("sibling"));
    if level > MAX_LEVELS {
        return Err(Error::corrupt(format!("impossible {} height {level}", ops.name)));
    }
    Ok((BlockHead { level, numrecs, rightsib }, block))
}

/// Walk every block of one AG btree, calling `visit` with each block's
/// group-relative number. Returns the leftmost leaf for record walks.
pub fn walk_nodes(
    dev: &BlockFile,
    sb: &XfsSuper,
    agno: u32,
    root: u32,
    ops: &BtreeOps,
    visit: &mut dyn FnMut(u64) -> Result<()>,
) -> Result<u32> {
    if root == 0 || root == NULL_AGBLOCK {
        return Err(Error::corrupt(format!("bad {} root {root}", ops.name)));
    }
    let mut leftmost = NULL_AGBLOCK;
    walk_level(dev, sb, agno, u64::from(root), ops, None, visit, &mut leftmost)?;
    Ok(leftmost)
}

#[allow(clippy::too_many_arguments)]
fn walk_level(
    dev: &BlockFile,
    sb: &XfsSuper,
    agno: u32,
    agbno: u64,
    ops: &BtreeOps,
    expect_level: Option<u16>,
    visit: &mut dyn FnMut(u64) -> Result<()>,
    leftmost: &mut u32,
) -> Result<()> {
    let (head, block) = read_block(dev, sb, agno, agbno, ops)?;
    if let Some(expect) = expect_level {
        if head.level != expect {
            return Err(Error::corrupt(format!("{} level mismatch", ops.name)));
        }
    }
    visit(agbno)?;

    if head.level == 0 {
        if *leftmost == NULL_AGBLOCK {
            *leftmost = agbno as u32;
        }
        return Ok(());
    }

    let hdr = sb.sbt_block_header_size();
    let body = &block[hdr..];
    let maxrecs = body.len() / (ops.node_key_bytes + PTR_SIZE);
    if head.numrecs > maxrecs {
        return Err(Error::corrupt(format!("{} node overflows its block", ops.name)));
    }
    let ptrs = &body[maxrecs * ops.node_key_bytes..];
    for i in 0..head.numrecs {
        let child = u32::from_be_bytes(ptrs[i * PTR_SIZE..(i + 1) * PTR_SIZE].try_into().expect("ptr"));
        walk_level(
            dev,
            sb,
            agno,
            u64::from(child),
            ops,
            Some(head.level - 1),
            visit,
            leftmost,
        )?;
    }
    Ok(())
}

/// Stream the records of a free-space btree leaf chain: `(startblock,
/// blockcount)` pairs in group-relative block units.
pub fn walk_alloc_records(
    dev: &BlockFile,
    sb: &XfsSuper,
    agno: u32,
    left_leaf: u32,
    f: &mut dyn FnMut(u32, u32) -> Result<()>,
) -> Result<()> {
    let hdr = sb.sbt_block_header_size();
    let mut bno = left_leaf;
    while bno != NULL_AGBLOCK {
        let (head, block) = read_block(dev, sb, agno, u64::from(bno), &BNOBT_OPS)?;
        if head.level != 0 {
            return Err(Error::corrupt("free-space record walk hit a node block"));
        }
        let body = &block[hdr..];
        if body.len() / 8 < head.numrecs {
            return Err(Error::corrupt("free-space leaf overflows its block"));
        }
        for rec in body.chunks_exact(8).take(head.numrecs) {
            let start = u32::from_be_bytes(rec[..4].try_into().expect("rec"));
            let count = u32::from_be_bytes(rec[4..].try_into().expect("rec"));
            f(start, count)?;
        }
        bno = head.rightsib;
    }
    Ok(())
}

/// Stream the chunk-start inode numbers of an inode btree leaf chain.
pub fn walk_inobt_records(
    dev: &BlockFile,
    sb: &XfsSuper,
    agno: u32,
    left_leaf: u32,
    f: &mut dyn FnMut(u32) -> Result<()>,
) -> Result<()> {
    let hdr = sb.sbt_block_header_size();
    let mut bno = left_leaf;
    while bno != NULL_AGBLOCK {
        let (head, block) = read_block(dev, sb, agno, u64::from(bno), &INOBT_OPS)?;
        if head.level != 0 {
            return Err(Error::corrupt("inode record walk hit a node block"));
        }
        let body = &block[hdr..];
        if body.len() / 16 < head.numrecs {
            return Err(Error::corrupt("inode leaf overflows its block"));
        }
        for rec in body.chunks_exact(16).take(head.numrecs) {
            let startino = u32::from_be_bytes(rec[..4].try_into().expect("rec"));
            f(startino)?;
        }
        bno = head.rightsib;
    }
    Ok(())
}
