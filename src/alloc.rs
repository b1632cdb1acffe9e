//! Dual-pool metadata and data allocators.
//!
//! Every agent owns an `avail` pool it allocates from and a `freed` pool
//! that collects blocks released during the current transaction.  Freed
//! blocks are still referenced by the last committed super block, so they
//! only become allocatable after the commit that recorded the free is
//! durable.  The server's private metadata allocator is a pair of persistent
//! block-list banks that alternate across commits; the shared pools are
//! extent trees.
//!
//! The list allocator works out of an in-memory cache during a transaction:
//! allocation consumes chain blocks of the persistent avail list, frees
//! accumulate in memory, and `prepare_commit` folds both back into chains
//! referenced from the super block.

use parking_lot::Mutex;
use tracing::trace;

use crate::block::BlockLayer;
use crate::btree;
use crate::error::{Error, Result};
use crate::format::{
    AllocListBlock, AllocListHead, AllocRoot, BlockRef, Key, ZoneBits,
    ALLOC_LIST_SLOTS, DATA_ALLOC_MAX_ZONES, FREE_EXTENT_ZONE,
};

/// Best-effort locality window scanned by `alloc_same`.
const SAME_WINDOW: usize = 64;

fn ext_len(val: &[u8]) -> Result<u64> {
    val.try_into()
        .map(u64::from_le_bytes)
        .map_err(|_| Error::Io(std::io::Error::other("bad extent item length")))
}

/// The transaction-scoped metadata list allocator.  Internally locked so
/// btree COW can allocate while callers hold subsystem mutexes.
pub struct MetaAlloc {
    inner: Mutex<MetaAllocInner>,
}

struct MetaAllocInner {
    /// Unconsumed remainder of the persistent avail chain.
    avail_head: AllocListHead,
    avail: Vec<u64>,
    /// Persistent freed chain, untouched until prepare_commit prepends to it.
    freed_head: AllocListHead,
    freed: Vec<u64>,
}

impl MetaAlloc {
    pub fn new() -> MetaAlloc {
        MetaAlloc {
            inner: Mutex::new(MetaAllocInner {
                avail_head: AllocListHead::default(),
                avail: Vec::new(),
                freed_head: AllocListHead::default(),
                freed: Vec::new(),
            }),
        }
    }

    /// Point the allocator at a bank's persistent heads.  Called at server
    /// startup and after every commit when the banks swap.
    pub fn load_bank(&self, avail: &AllocListHead, freed: &AllocListHead) {
        let mut inner = self.inner.lock();
        inner.avail_head = *avail;
        inner.avail.clear();
        inner.freed_head = *freed;
        inner.freed.clear();
    }

    /// Absorb the next chain block of the avail list into the cache.  The
    /// emptied chain block itself becomes a free block.
    fn refill(inner: &mut MetaAllocInner, block: &BlockLayer) -> Result<bool> {
        if inner.avail_head.head.is_null() {
            return Ok(false);
        }
        let chain_blkno = inner.avail_head.head.blkno;
        let bl = block.read_ref(&inner.avail_head.head)?;
        let (next, chain_seq, taken) = {
            let g = bl.data();
            let lb: &AllocListBlock = bytemuck::from_bytes(&g.0);
            (lb.next, lb.hdr.seq, lb.blknos[..lb.nr as usize].to_vec())
        };

        inner.avail_head.total_nr = inner.avail_head.total_nr.saturating_sub(taken.len() as u64);
        inner.avail_head.head = next;
        inner.avail_head.first_nr = 0;
        inner.avail.extend_from_slice(&taken);
        // the emptied chain block never needs to hit the disk again
        block.forget(chain_blkno);
        Self::free_into(inner, block.dirty_seq(), chain_seq, chain_blkno);
        trace!(chain_blkno, nr = taken.len(), "absorbed avail chain block");
        Ok(true)
    }

    fn free_into(inner: &mut MetaAllocInner, dirty_seq: u64, seq: u64, blkno: u64) {
        if seq == dirty_seq {
            // allocated and freed within the same transaction
            inner.avail.push(blkno);
        } else {
            inner.freed.push(blkno);
        }
    }

    pub fn alloc(&self, block: &BlockLayer) -> Result<u64> {
        let mut inner = self.inner.lock();
        loop {
            if let Some(blkno) = inner.avail.pop() {
                return Ok(blkno);
            }
            if !Self::refill(&mut inner, block)? {
                return Err(Error::NoSpace);
            }
        }
    }

    /// Allocate one block close to `near`, best effort: only a bounded tail
    /// of the cache is scanned.
    pub fn alloc_same(&self, block: &BlockLayer, near: u64) -> Result<u64> {
        let mut inner = self.inner.lock();
        loop {
            if !inner.avail.is_empty() {
                let window = inner.avail.len().saturating_sub(SAME_WINDOW);
                let best = inner.avail[window..]
                    .iter()
                    .enumerate()
                    .min_by_key(|(_, &b)| b.abs_diff(near))
                    .map(|(i, _)| window + i)
                    .unwrap();
                return Ok(inner.avail.swap_remove(best));
            }
            if !Self::refill(&mut inner, block)? {
                return Err(Error::NoSpace);
            }
        }
    }

    /// Release one block.  `seq` is the transaction that wrote the block;
    /// blocks freed in the transaction that allocated them go straight back
    /// to avail, anything older must wait out the commit in freed.
    pub fn free(&self, block: &BlockLayer, seq: u64, blkno: u64) {
        let mut inner = self.inner.lock();
        Self::free_into(&mut inner, block.dirty_seq(), seq, blkno);
    }

    /// Fold the caches back into persistent chains and return the bank heads
    /// to store in the super block.  No further allocation may happen in
    /// this transaction afterwards.
    pub fn prepare_commit(&self, block: &BlockLayer) -> Result<(AllocListHead, AllocListHead)> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        // freed chain blocks must come from avail: freed blknos are still
        // referenced by the stable super and cannot be overwritten
        let freed_head = if inner.freed.is_empty() {
            inner.freed_head
        } else {
            let chains = inner.freed.len().div_ceil(ALLOC_LIST_SLOTS);
            if inner.avail.len() < chains {
                return Err(Error::NoSpace);
            }
            let at = inner.avail.len() - chains;
            let chain: Vec<u64> = inner.avail.split_off(at);
            write_chain(block, &chain, &inner.freed, inner.freed_head)?
        };

        let avail_head = if inner.avail.is_empty() {
            inner.avail_head
        } else {
            // the chain blocks for the remaining entries come out of the
            // entries themselves
            let mut chains = 0;
            loop {
                let need = (inner.avail.len() - chains).div_ceil(ALLOC_LIST_SLOTS);
                if need <= chains {
                    break;
                }
                chains = need;
            }
            let at = inner.avail.len() - chains;
            let chain: Vec<u64> = inner.avail.split_off(at);
            let entries = std::mem::take(&mut inner.avail);
            write_chain(block, &chain, &entries, inner.avail_head)?
        };

        // adopt the serialized chains so a commit that fails after this
        // point retries from a consistent view instead of leaking them
        inner.avail_head = avail_head;
        inner.freed_head = freed_head;
        inner.freed.clear();
        Ok((avail_head, freed_head))
    }

    #[cfg(test)]
    pub fn freed_contains(&self, blkno: u64) -> bool {
        self.inner.lock().freed.contains(&blkno)
    }

    #[cfg(test)]
    pub fn counts(&self) -> (u64, u64) {
        let inner = self.inner.lock();
        (inner.avail.len() as u64 + inner.avail_head.total_nr, inner.freed.len() as u64)
    }
}

impl Default for MetaAlloc {
    fn default() -> Self {
        MetaAlloc::new()
    }
}

/// Write `entries` into the given chain blocks, linking the last one to
/// `tail` (the untouched remainder of an existing chain).
fn write_chain(
    block: &BlockLayer,
    chain: &[u64],
    entries: &[u64],
    tail: AllocListHead,
) -> Result<AllocListHead> {
    let mut next_ref = tail.head;
    let mut total_nr = tail.total_nr;
    let mut first_nr = tail.first_nr;

    for (i, &chain_blkno) in chain.iter().enumerate().rev() {
        let start = (i * ALLOC_LIST_SLOTS).min(entries.len());
        let end = ((i + 1) * ALLOC_LIST_SLOTS).min(entries.len());
        let chunk = &entries[start..end];

        let bl = block.dirty(chain_blkno);
        {
            let mut g = bl.data_mut();
            let lb: &mut AllocListBlock = bytemuck::from_bytes_mut(&mut g.0);
            lb.next = next_ref;
            lb.nr = chunk.len() as u32;
            lb._pad = 0;
            lb.blknos = [0; ALLOC_LIST_SLOTS];
            lb.blknos[..chunk.len()].copy_from_slice(chunk);
        }

        next_ref = BlockRef { blkno: chain_blkno, seq: block.dirty_seq() };
        total_nr += chunk.len() as u64;
        first_nr = chunk.len() as u32;
    }

    Ok(AllocListHead { head: next_ref, total_nr, first_nr, _pad: 0 })
}

/// Append one blkno to the front block of a persistent list, growing the
/// chain when the front block is full.
fn list_push(
    block: &BlockLayer,
    meta: &MetaAlloc,
    head: &mut AllocListHead,
    blkno: u64,
) -> Result<()> {
    let mut need_new = head.head.is_null();
    if !need_new {
        let bl = block.read_ref(&head.head)?;
        let g = bl.data();
        let lb: &AllocListBlock = bytemuck::from_bytes(&g.0);
        need_new = lb.nr as usize >= ALLOC_LIST_SLOTS;
    }
    if need_new {
        let bl = block.dirty_alloc(meta)?;
        {
            let mut g = bl.data_mut();
            let lb: &mut AllocListBlock = bytemuck::from_bytes_mut(&mut g.0);
            lb.next = head.head;
            lb.nr = 0;
        }
        head.head = BlockRef { blkno: bl.blkno(), seq: block.dirty_seq() };
        head.first_nr = 0;
    }

    let bl = block.dirty_ref(&mut head.head, meta)?;
    {
        let mut g = bl.data_mut();
        let lb: &mut AllocListBlock = bytemuck::from_bytes_mut(&mut g.0);
        lb.blknos[lb.nr as usize] = blkno;
        lb.nr += 1;
        head.first_nr = lb.nr;
    }
    head.total_nr += 1;
    Ok(())
}

/// Move single blocks from an extent pool into a list until it reaches the
/// target, if it has fallen under the low mark.
pub fn fill_list(
    block: &BlockLayer,
    meta: &MetaAlloc,
    head: &mut AllocListHead,
    src: &mut AllocRoot,
    lo: u64,
    target: u64,
) -> Result<()> {
    if head.total_nr >= lo {
        return Ok(());
    }
    let mut need = target.saturating_sub(head.total_nr);
    while need > 0 {
        let Some((start, len)) = extent_remove_first(block, meta, src, need)? else {
            break;
        };
        for b in start..start + len {
            list_push(block, meta, head, b)?;
        }
        need -= len;
    }
    Ok(())
}

/// Drain a list into an extent pool.  The emptied chain blocks are free
/// space themselves and join the pool.
pub fn empty_list(
    block: &BlockLayer,
    meta: &MetaAlloc,
    dst: &mut AllocRoot,
    src: &mut AllocListHead,
) -> Result<()> {
    while !src.head.is_null() {
        let chain_blkno = src.head.blkno;
        let bl = block.read_ref(&src.head)?;
        let (next, entries) = {
            let g = bl.data();
            let lb: &AllocListBlock = bytemuck::from_bytes(&g.0);
            (lb.next, lb.blknos[..lb.nr as usize].to_vec())
        };

        for &b in &entries {
            extent_insert(block, meta, dst, b, 1)?;
        }
        src.total_nr = src.total_nr.saturating_sub(entries.len() as u64);
        src.head = next;
        src.first_nr = 0;

        extent_insert(block, meta, dst, chain_blkno, 1)?;
        block.forget(chain_blkno);
    }
    *src = AllocListHead::default();
    Ok(())
}

/// Cheap move-all: hang the destination chain off the source's tail and take
/// over the source head.
pub fn splice_list(
    block: &BlockLayer,
    meta: &MetaAlloc,
    dst: &mut AllocListHead,
    src: &mut AllocListHead,
) -> Result<()> {
    if src.head.is_null() {
        *src = AllocListHead::default();
        return Ok(());
    }
    if dst.head.is_null() {
        *dst = *src;
        *src = AllocListHead::default();
        return Ok(());
    }

    let mut bl = block.dirty_ref(&mut src.head, meta)?;
    loop {
        let next = {
            let g = bl.data();
            let lb: &AllocListBlock = bytemuck::from_bytes(&g.0);
            lb.next
        };
        if next.is_null() {
            let mut g = bl.data_mut();
            let lb: &mut AllocListBlock = bytemuck::from_bytes_mut(&mut g.0);
            lb.next = dst.head;
            break;
        }
        let mut nref = next;
        let child = block.dirty_ref(&mut nref, meta)?;
        {
            let mut g = bl.data_mut();
            let lb: &mut AllocListBlock = bytemuck::from_bytes_mut(&mut g.0);
            lb.next = nref;
        }
        bl = child;
    }

    dst.head = src.head;
    dst.first_nr = src.first_nr;
    dst.total_nr += src.total_nr;
    *src = AllocListHead::default();
    Ok(())
}

/// Insert a free extent, merging with adjacent neighbors.
pub fn extent_insert(
    block: &BlockLayer,
    meta: &MetaAlloc,
    root: &mut AllocRoot,
    start: u64,
    len: u64,
) -> Result<()> {
    debug_assert!(len > 0);
    let added = len;
    let mut start = start;
    let mut len = len;

    if let Some((pk, pv)) = btree::prev(block, &root.root, &Key::free_extent(start))? {
        if pk.zone == FREE_EXTENT_ZONE {
            let plen = ext_len(&pv)?;
            if pk.first + plen == start {
                btree::delete(block, meta, &mut root.root, &pk)?;
                start = pk.first;
                len += plen;
            }
        }
    }
    if let Some((nk, nv)) = btree::next(block, &root.root, &Key::free_extent(start + 1))? {
        if nk.zone == FREE_EXTENT_ZONE && nk.first == start + len {
            let nlen = ext_len(&nv)?;
            btree::delete(block, meta, &mut root.root, &nk)?;
            len += nlen;
        }
    }

    btree::insert(block, meta, &mut root.root, &Key::free_extent(start), &len.to_le_bytes())?;
    root.total_len += added;
    Ok(())
}

/// Reserve `count` contiguous blocks, first fit.
pub fn extent_alloc(
    block: &BlockLayer,
    meta: &MetaAlloc,
    root: &mut AllocRoot,
    count: u64,
) -> Result<u64> {
    debug_assert!(count > 0);
    let mut key = Key::new(FREE_EXTENT_ZONE, 0, 0);
    loop {
        let Some((k, v)) = btree::next(block, &root.root, &key)? else {
            return Err(Error::NoSpace);
        };
        if k.zone != FREE_EXTENT_ZONE {
            return Err(Error::NoSpace);
        }
        let len = ext_len(&v)?;
        if len >= count {
            btree::delete(block, meta, &mut root.root, &k)?;
            if len > count {
                btree::insert(
                    block,
                    meta,
                    &mut root.root,
                    &Key::free_extent(k.first + count),
                    &(len - count).to_le_bytes(),
                )?;
            }
            root.total_len -= count;
            return Ok(k.first);
        }
        key = k.inc();
    }
}

/// Remove the first extent of the pool, capped at `max` blocks.
fn extent_remove_first(
    block: &BlockLayer,
    meta: &MetaAlloc,
    root: &mut AllocRoot,
    max: u64,
) -> Result<Option<(u64, u64)>> {
    let Some((k, v)) = btree::next(block, &root.root, &Key::new(FREE_EXTENT_ZONE, 0, 0))? else {
        return Ok(None);
    };
    if k.zone != FREE_EXTENT_ZONE {
        return Ok(None);
    }
    let len = ext_len(&v)?;
    let take = len.min(max);
    btree::delete(block, meta, &mut root.root, &k)?;
    if take < len {
        btree::insert(
            block,
            meta,
            &mut root.root,
            &Key::free_extent(k.first + take),
            &(len - take).to_le_bytes(),
        )?;
    }
    root.total_len -= take;
    Ok(Some((k.first, take)))
}

pub fn for_each_extent(
    block: &BlockLayer,
    root: &AllocRoot,
    mut f: impl FnMut(u64, u64),
) -> Result<()> {
    let mut key = Key::new(FREE_EXTENT_ZONE, 0, 0);
    loop {
        let Some((k, v)) = btree::next(block, &root.root, &key)? else {
            return Ok(());
        };
        if k.zone != FREE_EXTENT_ZONE {
            return Ok(());
        }
        f(k.first, ext_len(&v)?);
        key = k.inc();
    }
}

/// Zone preferences for data moves: take blocks in zones exclusively owned
/// by the destination mount first, then wholly vacant zones, then anything.
pub struct ZonePrefs<'a> {
    pub exclusive: &'a ZoneBits,
    pub vacant: &'a ZoneBits,
    pub zone_blocks: u64,
}

fn zone_bit(bits: &ZoneBits, zone: u64) -> bool {
    if zone >= DATA_ALLOC_MAX_ZONES {
        return false;
    }
    bits[(zone / 64) as usize] >> (zone % 64) & 1 != 0
}

/// First maximal subrange of [start, start+len) whose zones are all set.
fn first_allowed_run(bits: &ZoneBits, zone_blocks: u64, start: u64, len: u64) -> Option<(u64, u64)> {
    let end = start + len;
    let last = (end - 1) / zone_blocks;
    let mut z = start / zone_blocks;
    while z <= last && !zone_bit(bits, z) {
        z += 1;
    }
    if z > last {
        return None;
    }
    let run_start = start.max(z * zone_blocks);
    let mut ze = z;
    while ze <= last && zone_bit(bits, ze) {
        ze += 1;
    }
    let run_end = end.min(ze * zone_blocks);
    Some((run_start, run_end - run_start))
}

/// Transfer up to `count` blocks from one extent pool to another.  With zone
/// preferences, exclusive zones are drained first and occupied zones are
/// only touched as a last resort.
pub fn move_extents(
    block: &BlockLayer,
    meta: &MetaAlloc,
    dst: &mut AllocRoot,
    src: &mut AllocRoot,
    count: u64,
    prefs: Option<&ZonePrefs>,
) -> Result<u64> {
    let mut moved = 0;
    if let Some(p) = prefs {
        for bits in [p.exclusive, p.vacant] {
            moved += move_pass(block, meta, dst, src, count - moved, Some((bits, p.zone_blocks)))?;
            if moved >= count {
                return Ok(moved);
            }
        }
    }
    moved += move_pass(block, meta, dst, src, count - moved, None)?;
    Ok(moved)
}

fn move_pass(
    block: &BlockLayer,
    meta: &MetaAlloc,
    dst: &mut AllocRoot,
    src: &mut AllocRoot,
    limit: u64,
    filter: Option<(&ZoneBits, u64)>,
) -> Result<u64> {
    let mut moved = 0;
    let mut key = Key::new(FREE_EXTENT_ZONE, 0, 0);
    while moved < limit {
        let Some((k, v)) = btree::next(block, &src.root, &key)? else {
            break;
        };
        if k.zone != FREE_EXTENT_ZONE {
            break;
        }
        let start = k.first;
        let len = ext_len(&v)?;

        let sub = match filter {
            None => Some((start, len)),
            Some((bits, zone_blocks)) => first_allowed_run(bits, zone_blocks, start, len),
        };
        let Some((s, l)) = sub else {
            key = k.inc();
            continue;
        };

        let take = l.min(limit - moved);
        btree::delete(block, meta, &mut src.root, &k)?;
        if s > start {
            btree::insert(
                block,
                meta,
                &mut src.root,
                &Key::free_extent(start),
                &(s - start).to_le_bytes(),
            )?;
        }
        let tail = (start + len) - (s + take);
        if tail > 0 {
            btree::insert(
                block,
                meta,
                &mut src.root,
                &Key::free_extent(s + take),
                &tail.to_le_bytes(),
            )?;
        }
        src.total_len -= take;
        extent_insert(block, meta, dst, s, take)?;
        moved += take;
        key = Key::free_extent(s + take);
    }
    Ok(moved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::open_vol;

    fn collect_extents(block: &BlockLayer, root: &AllocRoot) -> Vec<(u64, u64)> {
        let mut out = Vec::new();
        for_each_extent(block, root, |s, l| out.push((s, l))).unwrap();
        out
    }

    #[test]
    fn fill_then_empty_conserves_blocks() {
        let vol = open_vol();
        let mut src = vol.sup.meta_alloc[0];
        let before = src.total_len;

        let mut head = AllocListHead::default();
        fill_list(&vol.block, &vol.meta, &mut head, &mut src, 1, 100).unwrap();
        assert_eq!(head.total_nr, 100);
        assert_eq!(src.total_len, before - 100);

        // already above the low mark: refill is a no-op
        fill_list(&vol.block, &vol.meta, &mut head, &mut src, 50, 200).unwrap();
        assert_eq!(head.total_nr, 100);

        let mut dst = AllocRoot::default();
        empty_list(&vol.block, &vol.meta, &mut dst, &mut head).unwrap();
        assert_eq!(head.total_nr, 0);
        assert!(head.head.is_null());
        // the list entries plus the emptied chain block itself
        assert_eq!(dst.total_len, 101);
    }

    #[test]
    fn splice_moves_whole_chains() {
        let vol = open_vol();
        let mut src_pool = vol.sup.meta_alloc[0];

        let mut a = AllocListHead::default();
        let mut b = AllocListHead::default();
        fill_list(&vol.block, &vol.meta, &mut a, &mut src_pool, 1, 30).unwrap();
        fill_list(&vol.block, &vol.meta, &mut b, &mut src_pool, 1, 20).unwrap();

        splice_list(&vol.block, &vol.meta, &mut a, &mut b).unwrap();
        assert_eq!(a.total_nr, 50);
        assert_eq!(b.total_nr, 0);
        assert!(b.head.is_null());

        let mut drained = AllocRoot::default();
        empty_list(&vol.block, &vol.meta, &mut drained, &mut a).unwrap();
        // 50 entries plus two chain blocks
        assert_eq!(drained.total_len, 52);
    }

    #[test]
    fn extent_insert_merges_neighbors() {
        let vol = open_vol();
        let mut root = AllocRoot::default();

        extent_insert(&vol.block, &vol.meta, &mut root, 10, 10).unwrap();
        extent_insert(&vol.block, &vol.meta, &mut root, 30, 10).unwrap();
        assert_eq!(collect_extents(&vol.block, &root), vec![(10, 10), (30, 10)]);

        extent_insert(&vol.block, &vol.meta, &mut root, 20, 10).unwrap();
        assert_eq!(collect_extents(&vol.block, &root), vec![(10, 30)]);
        assert_eq!(root.total_len, 30);
    }

    #[test]
    fn extent_alloc_first_fit() {
        let vol = open_vol();
        let mut root = AllocRoot::default();
        extent_insert(&vol.block, &vol.meta, &mut root, 100, 4).unwrap();
        extent_insert(&vol.block, &vol.meta, &mut root, 200, 16).unwrap();

        assert_eq!(extent_alloc(&vol.block, &vol.meta, &mut root, 8).unwrap(), 200);
        assert_eq!(collect_extents(&vol.block, &root), vec![(100, 4), (208, 8)]);
        assert_eq!(extent_alloc(&vol.block, &vol.meta, &mut root, 2).unwrap(), 100);
        assert!(matches!(
            extent_alloc(&vol.block, &vol.meta, &mut root, 64),
            Err(Error::NoSpace)
        ));
    }

    #[test]
    fn zoned_moves_prefer_exclusive_then_vacant() {
        let vol = open_vol();
        let zone_blocks = 256u64;
        let mut src = AllocRoot::default();
        extent_insert(&vol.block, &vol.meta, &mut src, 0, 4096).unwrap();

        let mut exclusive = [0u64; crate::format::DATA_ZONE_WORDS];
        let mut vacant = [0u64; crate::format::DATA_ZONE_WORDS];
        // zone 5 is ours; zones 8..16 are vacant
        exclusive[0] |= 1 << 5;
        for z in 8..16 {
            vacant[0] |= 1 << z;
        }
        let prefs = ZonePrefs { exclusive: &exclusive, vacant: &vacant, zone_blocks };

        let mut dst = AllocRoot::default();
        let moved =
            move_extents(&vol.block, &vol.meta, &mut dst, &mut src, 300, Some(&prefs)).unwrap();
        assert_eq!(moved, 300);

        let got = collect_extents(&vol.block, &dst);
        // all of zone 5 first, then the start of the vacant run at zone 8
        assert_eq!(got, vec![(5 * zone_blocks, 256), (8 * zone_blocks, 44)]);
    }

    #[test]
    fn unzoned_move_is_first_fit() {
        let vol = open_vol();
        let mut src = AllocRoot::default();
        extent_insert(&vol.block, &vol.meta, &mut src, 50, 10).unwrap();
        extent_insert(&vol.block, &vol.meta, &mut src, 100, 100).unwrap();

        let mut dst = AllocRoot::default();
        let moved = move_extents(&vol.block, &vol.meta, &mut dst, &mut src, 40, None).unwrap();
        assert_eq!(moved, 40);
        assert_eq!(collect_extents(&vol.block, &dst), vec![(50, 10), (100, 30)]);
        assert_eq!(collect_extents(&vol.block, &src), vec![(130, 70)]);
    }

    #[test]
    fn alloc_same_prefers_nearby_blocks() {
        let vol = open_vol();
        // the mkfs seed blknos are contiguous, so an exact hit exists
        let near = vol.sup.server_meta_avail[0].head.blkno + 5;
        let got = vol.meta.alloc_same(&vol.block, near).unwrap();
        assert_eq!(got, near);
    }

    #[test]
    fn prepare_commit_round_trips_the_bank() {
        let vol = open_vol();
        let a = vol.meta.alloc(&vol.block).unwrap();
        let b = vol.meta.alloc(&vol.block).unwrap();
        // freed in the same transaction: immediately reusable
        vol.meta.free(&vol.block, vol.block.dirty_seq(), b);

        let (avail_head, freed_head) = vol.meta.prepare_commit(&vol.block).unwrap();
        vol.block.write_dirty().unwrap();
        vol.block.advance_seq();

        // the consumed mkfs chain block went to freed, not back to avail
        let mkfs_chain = vol.sup.server_meta_avail[0].head.blkno;
        assert!(freed_head.total_nr >= 1);

        let next = MetaAlloc::new();
        next.load_bank(&avail_head, &freed_head);
        let mut granted = Vec::new();
        while let Ok(blkno) = next.alloc(&vol.block) {
            granted.push(blkno);
        }
        assert!(!granted.contains(&a));
        assert!(!granted.contains(&mkfs_chain));
        assert!(granted.contains(&b));
        assert!(granted.len() as u64 >= avail_head.total_nr);
    }
}
