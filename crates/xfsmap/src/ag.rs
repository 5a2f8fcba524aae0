// SPDX-FileCopyrightText: Copyright © 2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Allocation group headers: AGF, AGI and the free list
//!
//! Each group's first four sectors hold, in order, the superblock copy,
//! the free-space header (AGF), the inode header (AGI) and the free-list
//! block (AGFL).

use zerocopy::big_endian::{U32, U64};
use zerocopy::{FromBytes, Immutable, KnownLayout, Unaligned};

use fsmap::{BlockFile, Error, Result};

use crate::superblock::XfsSuper;

/// 'XAGF'
const AGF_MAGIC: u32 = 0x5841_4746;
/// 'XAGI'
const AGI_MAGIC: u32 = 0x5841_4749;
/// 'XAFL'
const AGFL_MAGIC: u32 = 0x5841_464C;

/// Free-space header. Btree roots index: bno, cnt, rmap.
#[derive(Debug, FromBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
pub struct Agf {
    pub magicnum: U32,
    pub versionnum: U32,
    pub seqno: U32,
    pub length: U32,
    pub roots: [U32; 3],
    pub levels: [U32; 3],
    pub flfirst: U32,
    pub fllast: U32,
    pub flcount: U32,
    pub freeblks: U32,
    pub longest: U32,
    pub btreeblks: U32,
    pub uuid: [u8; 16],
    pub rmap_blocks: U32,
    pub refcount_blocks: U32,
    pub refcount_root: U32,
    pub refcount_level: U32,
    pub spare64: [U64; 14],
    pub lsn: U64,
    pub crc: U32,
    pub spare2: U32,
}

pub const AGF_ROOT_BNO: usize = 0;
pub const AGF_ROOT_CNT: usize = 1;

/// Inode allocation header
#[derive(Debug, FromBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
pub struct Agi {
    pub magicnum: U32,
    pub versionnum: U32,
    pub seqno: U32,
    pub length: U32,
    pub count: U32,
    pub root: U32,
    pub level: U32,
    pub freecount: U32,
    pub newino: U32,
    pub dirino: U32,
    pub unlinked: [U32; 64],
    pub uuid: [u8; 16],
    pub crc: U32,
    pub pad32: U32,
    pub lsn: U64,
    pub free_root: U32,
    pub free_level: U32,
}

/// One allocation group's headers plus its decoded free list
#[derive(Debug)]
pub struct AgHeaders {
    pub agf: Agf,
    pub agi: Agi,
    pub freelist: Vec<u32>,
}

/// Read and verify the headers of every allocation group.
pub fn read_ags(dev: &BlockFile, sb: &XfsSuper) -> Result<Vec<AgHeaders>> {
    let sectsize = u64::from(sb.sectsize.get());
    (0..sb.agcount.get())
        .map(|agno| {
            let base = sb.agb_to_bytes(agno, 0);

            let raw = dev.read_vec(base + sectsize, sectsize as usize)?;
            let (agf, _) =
                Agf::read_from_prefix(raw.as_slice()).map_err(|_| Error::corrupt("short AGF"))?;
            if agf.magicnum.get() != AGF_MAGIC || agf.seqno.get() != agno {
                return Err(Error::corrupt(format!("bad AGF in allocation group {agno}")));
            }

            let raw = dev.read_vec(base + 2 * sectsize, sectsize as usize)?;
            let (agi, _) =
                Agi::read_from_prefix(raw.as_slice()).map_err(|_| Error::corrupt("short AGI"))?;
            if agi.magicnum.get() != AGI_MAGIC || agi.seqno.get() != agno {
                return Err(Error::corrupt(format!("bad AGI in allocation group {agno}")));
            }

            let freelist = read_agfl(dev, sb, base + 3 * sectsize, &agf)?;
            Ok(AgHeaders { agf, agi, freelist })
        })
        .collect()
}

/// Decode the active slots of the AGFL. Version 5 prefixes the block
/// with a 36-byte header.
fn read_agfl(dev: &BlockFile, sb: &XfsSuper, pos: u64, agf: &Agf) -> Result<Vec<u32>> {
    let sectsize = u64::from(sb.sectsize.get());
    let raw = dev.read_vec(pos, sectsize as usize)?;
    let body = if sb.is_v5() {
        let magic = u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]);
        if magic != AGFL_MAGIC {
            return Err(Error::corrupt("bad AGFL magic"));
        }
        &raw[36..]
    } else {
        &raw[..]
    };
    let slots: Vec<u32> = body
        .chunks_exact(4)
        .map(|c| u32::from_be_bytes([c[0], c[1], c[2], c[3]]))
        .collect();

    let mut out = Vec::with_capacity(agf.flcount.get() as usize);
    if agf.flcount.get() == 0 {
        return Ok(out);
    }
    let size = slots.len() as u32;
    let mut i = agf.flfirst.get();
    loop {
        if i >= size {
            return Err(Error::corrupt("free list index outside the AGFL"));
        }
        out.push(slots[i as usize]);
        if i == agf.fllast.get() {
            break;
        }
        i = (i + 1) % size;
        if out.len() > size as usize {
            return Err(Error::corrupt("free list loops"));
        }
    }
    Ok(out)
}
