//! Metadata block cache and COW engine.
//!
//! Blocks are read through a cache that verifies the header checksum and
//! identity on first use.  Writers only ever modify dirty blocks: a stable
//! block reached through a reference is copied into a freshly allocated blkno
//! and the old block is released into the current transaction's freed pool.
//! The dirty set is ordered by blkno and written out in one pass by the
//! commit coordinator; blocks whose writes fail stay dirty and are retried by
//! the next commit.

use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::os::unix::fs::FileExt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::warn;

use crate::alloc::MetaAlloc;
use crate::error::{Error, Result};
use crate::format::{
    crc_block, BlockBuf, BlockHeader, BlockRef, SuperBlock, BLOCK_SHIFT, BLOCK_SIZE,
    FIRST_META_BLKNO, STALE_RETRIES, SUPER_BLKNO, SUPER_COPIES,
};

/// A cached metadata block.  The data lock doubles as the fine-grained
/// per-block lock structures use while reading or mutating their contents.
pub struct Block {
    blkno: u64,
    data: RwLock<Box<BlockBuf>>,
}

impl Block {
    fn new_zeroed(blkno: u64) -> Arc<Block> {
        Arc::new(Block { blkno, data: RwLock::new(BlockBuf::new_zeroed()) })
    }

    pub fn blkno(&self) -> u64 {
        self.blkno
    }

    pub fn data(&self) -> RwLockReadGuard<'_, Box<BlockBuf>> {
        self.data.read()
    }

    pub fn data_mut(&self) -> RwLockWriteGuard<'_, Box<BlockBuf>> {
        self.data.write()
    }

    pub fn header(&self) -> BlockHeader {
        *bytemuck::from_bytes(&self.data.read().0[..std::mem::size_of::<BlockHeader>()])
    }

    fn stamp_header(&self, fsid: u64, seq: u64) {
        let mut g = self.data.write();
        let hdr: &mut BlockHeader =
            bytemuck::from_bytes_mut(&mut g.0[..std::mem::size_of::<BlockHeader>()]);
        hdr.crc = 0;
        hdr._pad = 0;
        hdr.fsid = fsid;
        hdr.blkno = self.blkno;
        hdr.seq = seq;
    }
}

pub struct BlockLayer {
    dev: File,
    fsid: u64,
    total_meta_blocks: u64,
    cache: Mutex<HashMap<u64, Arc<Block>>>,
    /// Blocks the current transaction owns, in write order.
    dirty: Mutex<BTreeMap<u64, Arc<Block>>>,
    dirty_seq: AtomicU64,
    #[cfg(test)]
    fail_writes: Mutex<Vec<u64>>,
    #[cfg(test)]
    fail_any_writes: std::sync::atomic::AtomicU32,
}

impl BlockLayer {
    pub fn new(dev: File, fsid: u64, dirty_seq: u64, total_meta_blocks: u64) -> BlockLayer {
        BlockLayer {
            dev,
            fsid,
            total_meta_blocks,
            cache: Mutex::new(HashMap::new()),
            dirty: Mutex::new(BTreeMap::new()),
            dirty_seq: AtomicU64::new(dirty_seq),
            #[cfg(test)]
            fail_writes: Mutex::new(Vec::new()),
            #[cfg(test)]
            fail_any_writes: std::sync::atomic::AtomicU32::new(0),
        }
    }

    pub fn fsid(&self) -> u64 {
        self.fsid
    }

    /// Sequence number stamped into blocks dirtied by the current
    /// transaction.
    pub fn dirty_seq(&self) -> u64 {
        self.dirty_seq.load(Ordering::Acquire)
    }

    /// Called by the commit coordinator once the super block for the current
    /// seq is durable.
    pub fn advance_seq(&self) {
        self.dirty_seq.fetch_add(1, Ordering::AcqRel);
    }

    fn check_blkno(&self, blkno: u64) -> Result<()> {
        if blkno < FIRST_META_BLKNO || blkno >= self.total_meta_blocks {
            return Err(Error::Corrupt { blkno, tries: 0 });
        }
        Ok(())
    }

    /// Read and verify a block.  Verification failures invalidate any cached
    /// contents and retry the disk up to the cap before being reported as
    /// corruption.
    pub fn read(&self, blkno: u64) -> Result<Arc<Block>> {
        self.check_blkno(blkno)?;

        if let Some(bl) = self.cache.lock().get(&blkno) {
            return Ok(bl.clone());
        }

        let mut tries = 0;
        while tries < STALE_RETRIES {
            tries += 1;

            let bl = Block::new_zeroed(blkno);
            {
                let mut g = bl.data_mut();
                self.dev.read_exact_at(&mut g.0, blkno << BLOCK_SHIFT)?;
            }
            if self.verify(&bl) {
                let mut cache = self.cache.lock();
                // another reader may have won the race
                let entry = cache.entry(blkno).or_insert_with(|| bl.clone());
                return Ok(entry.clone());
            }
            warn!(blkno, tries, "block failed verification, re-reading");
        }

        Err(Error::Corrupt { blkno, tries })
    }

    fn verify(&self, bl: &Block) -> bool {
        let g = bl.data();
        let hdr: &BlockHeader =
            bytemuck::from_bytes(&g.0[..std::mem::size_of::<BlockHeader>()]);
        hdr.crc == crc_block(&g.0) && hdr.fsid == self.fsid && hdr.blkno == bl.blkno
    }

    /// Read the block a reference describes.  A sequence mismatch means a
    /// writer replaced the block; the cached copy is dropped and the disk
    /// consulted once more before the stale condition is surfaced.
    pub fn read_ref(&self, r: &BlockRef) -> Result<Arc<Block>> {
        let bl = self.read(r.blkno)?;
        if bl.header().seq == r.seq {
            return Ok(bl);
        }

        self.invalidate(r.blkno);
        let bl = self.read(r.blkno)?;
        if bl.header().seq == r.seq {
            return Ok(bl);
        }
        Err(Error::Stale)
    }

    /// Drop any cached copy so the next read goes to disk.
    pub fn invalidate(&self, blkno: u64) {
        self.cache.lock().remove(&blkno);
    }

    /// Return a dirty, writable block at `blkno` with its header stamped for
    /// the current transaction.  Callers overwrite or zero the contents.
    pub fn dirty(&self, blkno: u64) -> Arc<Block> {
        let bl = {
            let mut cache = self.cache.lock();
            cache.entry(blkno).or_insert_with(|| Block::new_zeroed(blkno)).clone()
        };
        bl.stamp_header(self.fsid, self.dirty_seq());
        self.dirty.lock().insert(blkno, bl.clone());
        bl
    }

    /// Allocate a fresh block and return it dirty and zeroed.
    pub fn dirty_alloc(&self, meta: &MetaAlloc) -> Result<Arc<Block>> {
        let blkno = meta.alloc(self)?;
        self.cache.lock().remove(&blkno);
        let bl = self.dirty(blkno);
        {
            let mut g = bl.data_mut();
            let hdr_end = std::mem::size_of::<BlockHeader>();
            g.0[hdr_end..].fill(0);
        }
        Ok(bl)
    }

    /// Give the caller a dirty block for the structure position `r` points
    /// at.  A block already dirty in this transaction is returned as-is;
    /// otherwise the stable block is copied into a freshly allocated blkno,
    /// the old block is freed into the current pool, and `r` is updated in
    /// place.  The caller must have exclusive access to the structure owning
    /// the reference.
    pub fn dirty_ref(&self, r: &mut BlockRef, meta: &MetaAlloc) -> Result<Arc<Block>> {
        let bl = self.read(r.blkno)?;
        if r.seq == self.dirty_seq() {
            return Ok(bl);
        }

        let old_hdr = bl.header();
        let new_blkno = meta.alloc_same(self, r.blkno)?;
        self.cache.lock().remove(&new_blkno);
        let copy = self.dirty(new_blkno);
        {
            let src = bl.data();
            let mut dst = copy.data_mut();
            dst.0.copy_from_slice(&src.0);
        }
        copy.stamp_header(self.fsid, self.dirty_seq());
        meta.free(self, old_hdr.seq, r.blkno);
        self.invalidate(r.blkno);

        r.blkno = new_blkno;
        r.seq = self.dirty_seq();
        Ok(copy)
    }

    /// Stop tracking a dirty block without writing it.
    pub fn forget(&self, blkno: u64) {
        self.dirty.lock().remove(&blkno);
        self.cache.lock().remove(&blkno);
    }

    pub fn has_dirty(&self) -> bool {
        !self.dirty.lock().is_empty()
    }

    #[cfg(test)]
    pub fn dirty_blknos(&self) -> Vec<u64> {
        self.dirty.lock().keys().copied().collect()
    }

    #[cfg(test)]
    pub fn fail_next_write(&self, blkno: u64) {
        self.fail_writes.lock().push(blkno);
    }

    #[cfg(test)]
    pub fn fail_next_writes(&self, nr: u32) {
        self.fail_any_writes.store(nr, Ordering::SeqCst);
    }

    /// Write every dirty block in blkno order, stamping checksums as they go
    /// out.  Blocks that fail stay in the dirty set for the next commit; any
    /// failure means the caller must not advance the super block.
    pub fn write_dirty(&self) -> Result<()> {
        let targets: Vec<Arc<Block>> = self.dirty.lock().values().cloned().collect();
        let mut failed = None;

        for bl in targets {
            {
                let mut g = bl.data_mut();
                let crc = crc_block(&g.0);
                g.0[..4].copy_from_slice(&crc.to_le_bytes());
            }

            #[cfg(test)]
            {
                let mut fails = self.fail_writes.lock();
                if let Some(pos) = fails.iter().position(|&b| b == bl.blkno) {
                    fails.remove(pos);
                    warn!(blkno = bl.blkno, "injected write failure");
                    failed = Some(std::io::Error::other("injected write failure"));
                    continue;
                }
                drop(fails);
                if self
                    .fail_any_writes
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok()
                {
                    warn!(blkno = bl.blkno, "injected write failure");
                    failed = Some(std::io::Error::other("injected write failure"));
                    continue;
                }
            }

            let g = bl.data();
            match self.dev.write_all_at(&g.0, bl.blkno << BLOCK_SHIFT) {
                Ok(()) => {
                    drop(g);
                    self.dirty.lock().remove(&bl.blkno);
                }
                Err(e) => {
                    warn!(blkno = bl.blkno, err = %e, "dirty block write failed");
                    failed = Some(e);
                }
            }
        }

        self.dev.sync_data()?;
        match failed {
            Some(e) => Err(Error::Io(e)),
            None => Ok(()),
        }
    }

    /// Write the super block copy for its seq and flush.  Only the commit
    /// coordinator calls this, after `write_dirty` succeeded.
    pub fn write_super(&self, sup: &mut SuperBlock) -> Result<()> {
        sup.hdr.blkno = SuperBlock::copy_blkno(sup.hdr.seq);
        sup.hdr.fsid = self.fsid;
        sup.hdr.crc = 0;

        let mut buf = BlockBuf::new_zeroed();
        buf.0.copy_from_slice(bytemuck::bytes_of(sup));
        let crc = crc_block(&buf.0);
        sup.hdr.crc = crc;
        buf.0[..4].copy_from_slice(&crc.to_le_bytes());

        self.dev.write_all_at(&buf.0, sup.hdr.blkno << BLOCK_SHIFT)?;
        self.dev.sync_data()?;
        Ok(())
    }
}

/// Read both super block copies and return the valid one with the highest
/// seq.
pub fn read_super_from(dev: &File) -> Result<SuperBlock> {
    let mut best: Option<SuperBlock> = None;

    for copy in 0..SUPER_COPIES {
        let blkno = SUPER_BLKNO + copy;
        let mut buf = vec![0u8; BLOCK_SIZE];
        if dev.read_exact_at(&mut buf, blkno << BLOCK_SHIFT).is_err() {
            continue;
        }
        if let Some(sup) = SuperBlock::verify_copy(&buf, blkno) {
            if best.map(|b| b.hdr.seq < sup.hdr.seq).unwrap_or(true) {
                best = Some(sup);
            }
        }
    }

    best.ok_or(Error::Corrupt { blkno: SUPER_BLKNO, tries: 1 })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::open_vol;

    #[test]
    fn read_verifies_and_caches() {
        let vol = open_vol();
        let blkno = vol.sup.server_meta_avail[0].head.blkno;
        let bl = vol.block.read(blkno).unwrap();
        assert_eq!(bl.header().blkno, blkno);
        assert_eq!(bl.header().fsid, vol.sup.hdr.fsid);
        let again = vol.block.read(blkno).unwrap();
        assert!(Arc::ptr_eq(&bl, &again));
    }

    #[test]
    fn corrupt_block_fails_after_retries() {
        let vol = open_vol();
        let blkno = vol.sup.server_meta_avail[0].head.blkno;
        // flip a byte past the header on disk
        let dev = &vol.block.dev;
        let mut buf = vec![0u8; BLOCK_SIZE];
        dev.read_exact_at(&mut buf, blkno << BLOCK_SHIFT).unwrap();
        buf[100] ^= 0xff;
        dev.write_all_at(&buf, blkno << BLOCK_SHIFT).unwrap();

        match vol.block.read(blkno) {
            Err(Error::Corrupt { blkno: b, tries }) => {
                assert_eq!(b, blkno);
                assert_eq!(tries, STALE_RETRIES);
            }
            other => panic!("expected corruption, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn read_ref_seq_mismatch_is_stale() {
        let vol = open_vol();
        let head = vol.sup.server_meta_avail[0].head;
        assert!(vol.block.read_ref(&head).is_ok());
        let bad = BlockRef { blkno: head.blkno, seq: head.seq + 7 };
        assert!(matches!(vol.block.read_ref(&bad), Err(Error::Stale)));
    }

    #[test]
    fn dirty_ref_cows_stable_block() {
        let vol = open_vol();
        // write a block in one transaction so it becomes stable
        let bl = vol.block.dirty_alloc(&vol.meta).unwrap();
        let old_blkno = bl.blkno();
        bl.data_mut().0[64] = 0xab;
        let mut r = BlockRef { blkno: old_blkno, seq: vol.block.dirty_seq() };
        vol.block.write_dirty().unwrap();
        vol.block.advance_seq();

        let copy = vol.block.dirty_ref(&mut r, &vol.meta).unwrap();
        assert_ne!(r.blkno, old_blkno);
        assert_eq!(r.seq, vol.block.dirty_seq());
        assert_eq!(copy.header().blkno, r.blkno);
        assert_eq!(copy.header().seq, vol.block.dirty_seq());
        assert_eq!(copy.data().0[64], 0xab);
        // old block landed in the freed pool
        assert!(vol.meta.freed_contains(old_blkno));

        // dirtying an already-dirty reference returns the same block
        let prev = r;
        let again = vol.block.dirty_ref(&mut r, &vol.meta).unwrap();
        assert!(Arc::ptr_eq(&copy, &again));
        assert_eq!(prev, r);
    }

    #[test]
    fn forget_drops_dirty_block() {
        let vol = open_vol();
        let bl = vol.block.dirty_alloc(&vol.meta).unwrap();
        assert!(vol.block.has_dirty());
        vol.block.forget(bl.blkno());
        assert!(!vol.block.has_dirty());
    }

    #[test]
    fn failed_write_stays_dirty_and_retries() {
        let vol = open_vol();
        let bl = vol.block.dirty_alloc(&vol.meta).unwrap();
        let blkno = bl.blkno();

        vol.block.fail_next_write(blkno);
        assert!(vol.block.write_dirty().is_err());
        assert_eq!(vol.block.dirty_blknos(), vec![blkno]);

        vol.block.write_dirty().unwrap();
        assert!(!vol.block.has_dirty());
    }

    #[test]
    fn super_round_trip_alternates_copies() {
        let vol = open_vol();
        let mut sup = vol.sup;
        sup.hdr.seq = 2;
        sup.next_ino = 1234;
        vol.block.write_super(&mut sup).unwrap();
        assert_eq!(sup.hdr.blkno, SuperBlock::copy_blkno(2));

        let read = read_super_from(&vol.block.dev).unwrap();
        assert_eq!(read.hdr.seq, 2);
        assert_eq!(read.next_ino, 1234);
    }
}
