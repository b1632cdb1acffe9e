//! On-disk layout.
//!
//! Metadata lives in fixed 4 KiB blocks.  Every block starts with a header
//! carrying a CRC32C over the rest of the block, the volume fsid, the block
//! number it was written at, and the sequence number of the transaction that
//! wrote it.  All integers are little-endian; structs are plain-old-data with
//! explicit padding so they can be read and written byte-for-byte.

use std::fs::OpenOptions;
use std::os::fd::AsFd;
use std::os::unix::fs::FileExt;
use std::path::Path;

use bytemuck::{Pod, Zeroable};

use crate::btree;
use crate::error::{Error, Result};

#[cfg(target_endian = "big")]
compile_error!("the on-disk format is little-endian");

pub const BLOCK_SIZE: usize = 4096;
pub const BLOCK_SHIFT: u32 = 12;

/// Two super block copies, alternately written, at blknos 1 and 2.
pub const SUPER_BLKNO: u64 = 1;
pub const SUPER_COPIES: u64 = 2;
pub const FIRST_META_BLKNO: u64 = SUPER_BLKNO + SUPER_COPIES;

pub const SUPER_MAGIC: u64 = 0x424c_4b48_5355_5052;
pub const FORMAT_VERS: u64 = 1;

/// Server-owned fill policy: lists and client pools are refilled up to the
/// target once they fall under the low mark.
pub const SERVER_META_FILL_LO: u64 = 64;
pub const SERVER_META_FILL_TARGET: u64 = 128;
pub const SERVER_DATA_FILL_LO: u64 = 256;
pub const SERVER_DATA_FILL_TARGET: u64 = 512;
/// The shared meta extent roots swap roles when avail drops to the minimum
/// while freed has grown past it.
pub const SERVER_META_ALLOC_MIN: u64 = 32;

pub const DATA_ALLOC_MAX_ZONES: u64 = 1024;
pub const DATA_ZONE_WORDS: usize = (DATA_ALLOC_MAX_ZONES / 64) as usize;

pub const SRCH_LOG_ROTATE_BLOCKS: u64 = 1024;
pub const SRCH_COMPACT_NR: usize = 4;

/// A block that repeatedly fails verification is re-read this many times
/// before the condition is surfaced as corruption.
pub const STALE_RETRIES: u32 = 10;

/// Blknos to seed the server's private avail list with at mkfs time.
const MKFS_SEED_BLOCKS: u64 = 64;

pub type ZoneBits = [u64; DATA_ZONE_WORDS];

#[repr(C)]
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct BlockHeader {
    pub crc: u32,
    pub _pad: u32,
    pub fsid: u64,
    pub blkno: u64,
    pub seq: u64,
}

/// The number of leading bytes excluded from a block's CRC: the CRC field
/// itself.  The header padding is covered.
const CRC_SKIP: usize = 4;

pub fn crc_block(buf: &[u8]) -> u32 {
    debug_assert_eq!(buf.len(), BLOCK_SIZE);
    crc32c::crc32c(&buf[CRC_SKIP..])
}

/// A reference to a stable or dirty block.  Readers require the block at
/// `blkno` to still carry `seq`; a mismatch means a writer replaced it.
#[repr(C)]
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct BlockRef {
    pub blkno: u64,
    pub seq: u64,
}

impl BlockRef {
    pub fn is_null(&self) -> bool {
        self.blkno == 0
    }
}

#[repr(C)]
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct BtreeRoot {
    pub block: BlockRef,
    pub height: u8,
    pub _pad: [u8; 7],
}

/// An extent pool: a btree of free extents keyed by starting blkno, with the
/// total length maintained in the root so fill decisions don't walk the tree.
#[repr(C)]
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct AllocRoot {
    pub root: BtreeRoot,
    pub total_len: u64,
}

/// Head of a chain of `AllocListBlock`s holding single free blknos.
#[repr(C)]
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct AllocListHead {
    pub head: BlockRef,
    pub total_nr: u64,
    pub first_nr: u32,
    pub _pad: u32,
}

pub const ALLOC_LIST_SLOTS: usize = (BLOCK_SIZE - 56) / 8;

#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
pub struct AllocListBlock {
    pub hdr: BlockHeader,
    pub next: BlockRef,
    pub nr: u32,
    pub _pad: u32,
    pub blknos: [u64; ALLOC_LIST_SLOTS],
}

#[repr(C)]
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct SrchFile {
    pub root: BlockRef,
    pub blocks: u64,
    pub entries: u64,
}

pub const VOLOPT_DATA_ALLOC_ZONE_BLOCKS_BIT: u64 = 1 << 0;
/// Bits that no released format version assigns; must be zero on set/clear.
pub const VOLOPT_EXPANSION_BITS: u64 = !VOLOPT_DATA_ALLOC_ZONE_BLOCKS_BIT;

#[repr(C)]
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct VolumeOptions {
    pub set_bits: u64,
    pub data_alloc_zone_blocks: u64,
    pub _reserved: [u64; 14],
}

impl VolumeOptions {
    pub fn zone_blocks(&self) -> Option<u64> {
        if self.set_bits & VOLOPT_DATA_ALLOC_ZONE_BLOCKS_BIT != 0 {
            Some(self.data_alloc_zone_blocks)
        } else {
            None
        }
    }
}

pub const MOUNTED_CLIENT_QUORUM: u64 = 1 << 0;

#[repr(C)]
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct MountedClientVal {
    pub flags: u64,
}

/// Per-client log tree record: the roots a client stages one transaction's
/// worth of metadata into, plus its private allocators and data zone usage.
#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Pod, Zeroable)]
pub struct LogTrees {
    pub rid: u64,
    pub nr: u64,
    pub meta_avail: AllocListHead,
    pub meta_freed: AllocListHead,
    pub data_avail: AllocRoot,
    pub data_freed: AllocRoot,
    pub item_root: BtreeRoot,
    pub bloom_ref: BlockRef,
    pub srch_file: SrchFile,
    pub data_alloc_zone_blocks: u64,
    pub data_alloc_zones: ZoneBits,
}

#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
pub struct SuperBlock {
    pub hdr: BlockHeader,
    pub magic: u64,
    pub format_vers: u64,
    pub flags: u64,
    pub next_ino: u64,
    pub next_trans_seq: u64,
    pub total_meta_blocks: u64,
    pub first_meta_blkno: u64,
    pub total_data_blocks: u64,
    pub first_data_blkno: u64,
    pub fs_root: BtreeRoot,
    pub logs_root: BtreeRoot,
    pub srch_root: BtreeRoot,
    pub trans_seqs: BtreeRoot,
    pub mounted_clients: BtreeRoot,
    pub meta_alloc: [AllocRoot; 2],
    pub data_alloc: AllocRoot,
    pub server_meta_avail: [AllocListHead; 2],
    pub server_meta_freed: [AllocListHead; 2],
    pub volopt: VolumeOptions,
    pub _pad: [u8; 3520],
}

impl SuperBlock {
    /// The copy a super with this seq is written to.
    pub fn copy_blkno(seq: u64) -> u64 {
        SUPER_BLKNO + (seq & 1)
    }

    pub fn verify_copy(buf: &[u8], blkno: u64) -> Option<SuperBlock> {
        if buf.len() != BLOCK_SIZE {
            return None;
        }
        let sup: SuperBlock = bytemuck::pod_read_unaligned(buf);
        if sup.magic != SUPER_MAGIC
            || sup.hdr.blkno != blkno
            || sup.hdr.crc != crc_block(buf)
        {
            return None;
        }
        Some(sup)
    }
}

/// A 4 KiB block image, aligned so typed views of block contents line up.
#[repr(C, align(4096))]
#[derive(Copy, Clone, Pod, Zeroable)]
pub struct BlockBuf(pub [u8; BLOCK_SIZE]);

impl BlockBuf {
    pub fn new_zeroed() -> Box<BlockBuf> {
        Box::new(BlockBuf::zeroed())
    }
}

pub const LOG_TREES_ZONE: u8 = 1;
pub const TRANS_SEQ_ZONE: u8 = 2;
pub const MOUNTED_CLIENT_ZONE: u8 = 3;
pub const SRCH_LOG_ZONE: u8 = 4;
pub const SRCH_BUSY_ZONE: u8 = 5;
pub const FREE_EXTENT_ZONE: u8 = 6;

/// Item key, ordered by (zone, first, second).
#[repr(C)]
#[derive(Debug, Copy, Clone, Default, Pod, Zeroable)]
pub struct Key {
    pub zone: u8,
    pub _pad: [u8; 7],
    pub first: u64,
    pub second: u64,
}

impl Key {
    pub fn new(zone: u8, first: u64, second: u64) -> Key {
        Key { zone, _pad: [0; 7], first, second }
    }

    pub fn log_trees(rid: u64, nr: u64) -> Key {
        Key::new(LOG_TREES_ZONE, rid, nr)
    }

    pub fn trans_seq(seq: u64, rid: u64) -> Key {
        Key::new(TRANS_SEQ_ZONE, seq, rid)
    }

    pub fn mounted_client(rid: u64) -> Key {
        Key::new(MOUNTED_CLIENT_ZONE, rid, 0)
    }

    pub fn srch_log(nr: u64) -> Key {
        Key::new(SRCH_LOG_ZONE, nr, 0)
    }

    pub fn srch_busy(rid: u64) -> Key {
        Key::new(SRCH_BUSY_ZONE, rid, 0)
    }

    pub fn free_extent(start: u64) -> Key {
        Key::new(FREE_EXTENT_ZONE, start, 0)
    }

    /// The smallest key strictly greater than this one.
    pub fn inc(&self) -> Key {
        let (second, carry) = self.second.overflowing_add(1);
        let first = if carry { self.first.wrapping_add(1) } else { self.first };
        Key::new(self.zone, first, second)
    }
}

impl PartialEq for Key {
    fn eq(&self, other: &Key) -> bool {
        self.cmp(other) == std::cmp::Ordering::Equal
    }
}

impl Eq for Key {}

impl PartialOrd for Key {
    fn partial_cmp(&self, other: &Key) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Key {
    fn cmp(&self, other: &Key) -> std::cmp::Ordering {
        (self.zone, self.first, self.second).cmp(&(other.zone, other.first, other.second))
    }
}

// Network payloads share the on-disk encoding rules.

pub const GREETING_FLAG_FAREWELL: u64 = 1 << 0;
pub const GREETING_FLAG_QUORUM: u64 = 1 << 1;

#[repr(C)]
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct NetGreeting {
    pub fsid: u64,
    pub format_vers: u64,
    pub server_term: u64,
    pub rid: u64,
    pub flags: u64,
}

#[repr(C)]
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct NetInodeAlloc {
    pub ino: u64,
    pub nr: u64,
}

#[repr(C)]
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct NetRoots {
    pub fs_root: BtreeRoot,
    pub logs_root: BtreeRoot,
    pub srch_root: BtreeRoot,
}

pub const LOCK_MODE_NULL: u8 = 0;
pub const LOCK_MODE_READ: u8 = 1;
pub const LOCK_MODE_WRITE: u8 = 2;

#[repr(C)]
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct NetLock {
    pub key: Key,
    pub old_mode: u8,
    pub new_mode: u8,
    pub _pad: [u8; 6],
}

#[repr(C)]
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct NetLockRecover {
    pub nr: u64,
}

#[repr(C)]
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct OpenInoMapArgs {
    pub group_nr: u64,
}

#[repr(C)]
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct OpenInoMap {
    pub group_nr: u64,
    pub bits: [u64; 8],
}

/// Srch compaction hand-off: which rotated log files a client should merge
/// and the allocators it does the work out of.
#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Pod, Zeroable)]
pub struct SrchCompact {
    pub nr: u64,
    pub flags: u64,
    pub ids: [u64; SRCH_COMPACT_NR],
    pub files: [SrchFile; SRCH_COMPACT_NR],
    pub meta_avail: AllocListHead,
    pub meta_freed: AllocListHead,
}

pub const SRCH_COMPACT_FLAG_DONE: u64 = 1 << 0;

#[derive(Debug, Clone, Copy)]
pub struct MkfsParams {
    pub meta_blocks: u64,
    pub data_blocks: u64,
}

/// Initialize a fresh volume: seed the server's private avail list, the
/// shared meta extent pool and the data extent pool, and write both super
/// copies.
pub fn mkfs(path: &Path, params: MkfsParams) -> Result<SuperBlock> {
    let mut next = FIRST_META_BLKNO;
    let list_blkno = next;
    next += 1;
    let seed_start = next;
    next += MKFS_SEED_BLOCKS;
    let meta_leaf = next;
    next += 1;
    let data_leaf = next;
    next += 1;
    let first_free_meta = next;

    if params.meta_blocks < first_free_meta + SERVER_META_FILL_TARGET {
        return Err(Error::Invalid);
    }
    if params.data_blocks == 0 {
        return Err(Error::Invalid);
    }

    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)?;
    nix::unistd::ftruncate(
        file.as_fd(),
        (params.meta_blocks as i64) << BLOCK_SHIFT,
    )
    .map_err(|e| Error::Io(e.into()))?;

    let fsid: u64 = rand::random::<u64>() | 1;
    let seq = 1u64;

    // The server's first private avail list block.
    let mut list = BlockBuf::zeroed();
    {
        let lb: &mut AllocListBlock = bytemuck::from_bytes_mut(&mut list.0);
        lb.hdr = BlockHeader { crc: 0, _pad: 0, fsid, blkno: list_blkno, seq };
        lb.next = BlockRef::default();
        lb.nr = MKFS_SEED_BLOCKS as u32;
        for i in 0..MKFS_SEED_BLOCKS {
            lb.blknos[i as usize] = seed_start + i;
        }
    }
    let crc = crc_block(&list.0);
    list.0[..CRC_SKIP].copy_from_slice(&crc.to_le_bytes());
    write_block(&file, list_blkno, &list)?;

    // Single-extent leaves for the shared meta pool and the data pool.
    let meta_free_len = params.meta_blocks - first_free_meta;
    let meta_root = write_extent_leaf(&file, fsid, seq, meta_leaf, first_free_meta, meta_free_len)?;
    let data_root = write_extent_leaf(&file, fsid, seq, data_leaf, 0, params.data_blocks)?;

    let mut sup = SuperBlock::zeroed();
    sup.hdr = BlockHeader { crc: 0, _pad: 0, fsid, blkno: 0, seq };
    sup.magic = SUPER_MAGIC;
    sup.format_vers = FORMAT_VERS;
    sup.next_ino = 1;
    sup.next_trans_seq = 1;
    sup.total_meta_blocks = params.meta_blocks;
    sup.first_meta_blkno = FIRST_META_BLKNO;
    sup.total_data_blocks = params.data_blocks;
    sup.first_data_blkno = 0;
    sup.meta_alloc[0] = AllocRoot { root: meta_root, total_len: meta_free_len };
    sup.data_alloc = AllocRoot { root: data_root, total_len: params.data_blocks };
    sup.server_meta_avail[0] = AllocListHead {
        head: BlockRef { blkno: list_blkno, seq },
        total_nr: MKFS_SEED_BLOCKS,
        first_nr: MKFS_SEED_BLOCKS as u32,
        _pad: 0,
    };

    // Identical contents in both copies so either read is usable.
    for copy in 0..SUPER_COPIES {
        sup.hdr.blkno = SUPER_BLKNO + copy;
        sup.hdr.crc = 0;
        let mut buf = BlockBuf::zeroed();
        buf.0.copy_from_slice(bytemuck::bytes_of(&sup));
        let crc = crc_block(&buf.0);
        sup.hdr.crc = crc;
        buf.0[..4].copy_from_slice(&crc.to_le_bytes());
        write_block(&file, sup.hdr.blkno, &buf)?;
    }
    file.sync_all()?;

    Ok(sup)
}

fn write_extent_leaf(
    file: &std::fs::File,
    fsid: u64,
    seq: u64,
    blkno: u64,
    start: u64,
    len: u64,
) -> Result<BtreeRoot> {
    let buf = btree::build_leaf(fsid, blkno, seq, &[(Key::free_extent(start), &len.to_le_bytes())]);
    write_block(file, blkno, &buf)?;
    Ok(BtreeRoot {
        block: BlockRef { blkno, seq },
        height: 1,
        _pad: [0; 7],
    })
}

fn write_block(file: &std::fs::File, blkno: u64, buf: &BlockBuf) -> Result<()> {
    file.write_all_at(&buf.0, blkno << BLOCK_SHIFT)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::size_of;

    #[test]
    fn struct_sizes() {
        assert_eq!(size_of::<BlockHeader>(), 32);
        assert_eq!(size_of::<BlockRef>(), 16);
        assert_eq!(size_of::<BtreeRoot>(), 24);
        assert_eq!(size_of::<AllocRoot>(), 32);
        assert_eq!(size_of::<AllocListHead>(), 32);
        assert_eq!(size_of::<AllocListBlock>(), BLOCK_SIZE);
        assert_eq!(size_of::<SrchFile>(), 32);
        assert_eq!(size_of::<VolumeOptions>(), 128);
        assert_eq!(size_of::<LogTrees>(), 352);
        assert_eq!(size_of::<SuperBlock>(), BLOCK_SIZE);
        assert_eq!(size_of::<Key>(), 24);
        assert_eq!(size_of::<NetGreeting>(), 40);
        assert_eq!(size_of::<NetRoots>(), 72);
        assert_eq!(size_of::<NetLock>(), 32);
        assert_eq!(size_of::<SrchCompact>(), 240);
    }

    #[test]
    fn key_ordering() {
        let a = Key::log_trees(1, 1);
        let b = Key::log_trees(1, 2);
        let c = Key::log_trees(2, 0);
        let d = Key::trans_seq(0, 0);
        assert!(a < b);
        assert!(b < c);
        assert!(c < d);
        assert_eq!(a.inc(), b);
        assert_eq!(Key::new(TRANS_SEQ_ZONE, 3, u64::MAX).inc(), Key::new(TRANS_SEQ_ZONE, 4, 0));
    }

    #[test]
    fn crc_covers_all_but_crc_field() {
        let mut buf = BlockBuf::zeroed();
        let before = crc_block(&buf.0);
        buf.0[0] = 0xff;
        assert_eq!(crc_block(&buf.0), before);
        buf.0[BLOCK_SIZE - 1] = 0xff;
        assert_ne!(crc_block(&buf.0), before);
    }

    #[test]
    fn mkfs_writes_valid_supers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vol");
        let sup = mkfs(&path, MkfsParams { meta_blocks: 1024, data_blocks: 4096 }).unwrap();
        assert_eq!(sup.magic, SUPER_MAGIC);

        let file = std::fs::File::open(&path).unwrap();
        for copy in 0..SUPER_COPIES {
            let mut buf = vec![0u8; BLOCK_SIZE];
            file.read_exact_at(&mut buf, (SUPER_BLKNO + copy) << BLOCK_SHIFT).unwrap();
            let read = SuperBlock::verify_copy(&buf, SUPER_BLKNO + copy).unwrap();
            assert_eq!(read.hdr.fsid, sup.hdr.fsid);
            assert_eq!(read.server_meta_avail[0].total_nr, MKFS_SEED_BLOCKS);
        }
    }
}
