//! Persistent copy-on-write B-tree.
//!
//! The engine's shared state lives in ordered key/value maps rooted in the
//! super block.  Nodes are 4 KiB metadata blocks: a sorted item table grows
//! up from the node header while values pack down from the end of the block.
//! Internal items map the largest key of a child to its block reference.
//!
//! Every mutation dirties the path from the root down, so a tree referenced
//! from the last committed super block is never modified in place.  Nodes
//! split on the way down when they couldn't take the pending change and are
//! freed once their last item is removed; beyond that, container balancing
//! is not this crate's concern.

use std::cmp::Ordering;
use std::sync::Arc;

use bytemuck::{Pod, Zeroable};

use crate::alloc::MetaAlloc;
use crate::block::{Block, BlockLayer};
use crate::error::{Error, Result};
use crate::format::{crc_block, BlockBuf, BlockHeader, BlockRef, BtreeRoot, Key, BLOCK_SIZE};

const NODE_HDR_SIZE: usize = 40;
const ITEM_SIZE: usize = 32;
const REF_SIZE: usize = std::mem::size_of::<BlockRef>();

/// Largest value a caller may store; leaves always have room to take one
/// more item of this size after a split.
pub const MAX_VAL_SIZE: usize = 896;

#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
struct NodeHdr {
    blk: BlockHeader,
    level: u8,
    _pad: u8,
    nr: u16,
    free_end: u16,
    _pad2: u16,
}

#[repr(C)]
#[derive(Debug, Copy, Clone, Pod, Zeroable)]
struct Item {
    key: Key,
    val_off: u16,
    val_len: u16,
    _pad: u32,
}

fn node(buf: &BlockBuf) -> &NodeHdr {
    bytemuck::from_bytes(&buf.0[..NODE_HDR_SIZE])
}

fn node_mut(buf: &mut BlockBuf) -> &mut NodeHdr {
    bytemuck::from_bytes_mut(&mut buf.0[..NODE_HDR_SIZE])
}

fn init_node(buf: &mut BlockBuf, level: u8) {
    let n = node_mut(buf);
    n.level = level;
    n._pad = 0;
    n.nr = 0;
    n.free_end = BLOCK_SIZE as u16;
    n._pad2 = 0;
}

fn item_off(idx: usize) -> usize {
    NODE_HDR_SIZE + idx * ITEM_SIZE
}

fn get_item(buf: &BlockBuf, idx: usize) -> Item {
    bytemuck::pod_read_unaligned(&buf.0[item_off(idx)..item_off(idx) + ITEM_SIZE])
}

fn set_item(buf: &mut BlockBuf, idx: usize, it: Item) {
    buf.0[item_off(idx)..item_off(idx) + ITEM_SIZE].copy_from_slice(bytemuck::bytes_of(&it));
}

fn val_bytes<'a>(buf: &'a BlockBuf, it: &Item) -> &'a [u8] {
    &buf.0[it.val_off as usize..it.val_off as usize + it.val_len as usize]
}

fn free_space(buf: &BlockBuf) -> usize {
    let n = node(buf);
    n.free_end as usize - (NODE_HDR_SIZE + n.nr as usize * ITEM_SIZE)
}

fn search(buf: &BlockBuf, key: &Key) -> std::result::Result<usize, usize> {
    let nr = node(buf).nr as usize;
    let mut lo = 0;
    let mut hi = nr;
    while lo < hi {
        let mid = (lo + hi) / 2;
        match get_item(buf, mid).key.cmp(key) {
            Ordering::Less => lo = mid + 1,
            Ordering::Greater => hi = mid,
            Ordering::Equal => return Ok(mid),
        }
    }
    Err(lo)
}

fn insert_at(buf: &mut BlockBuf, idx: usize, key: &Key, val: &[u8]) {
    let nr = node(buf).nr as usize;
    debug_assert!(idx <= nr);
    debug_assert!(free_space(buf) >= ITEM_SIZE + val.len());

    buf.0.copy_within(item_off(idx)..item_off(nr), item_off(idx) + ITEM_SIZE);

    let free_end = node(buf).free_end as usize;
    let val_off = free_end - val.len();
    buf.0[val_off..free_end].copy_from_slice(val);

    set_item(
        buf,
        idx,
        Item { key: *key, val_off: val_off as u16, val_len: val.len() as u16, _pad: 0 },
    );
    let n = node_mut(buf);
    n.nr += 1;
    n.free_end = val_off as u16;
}

fn remove_at(buf: &mut BlockBuf, idx: usize) {
    let it = get_item(buf, idx);
    let nr = node(buf).nr as usize;

    buf.0.copy_within(item_off(idx + 1)..item_off(nr), item_off(idx));
    let n = node_mut(buf);
    n.nr -= 1;

    if it.val_len > 0 {
        // slide the values below the removed one up over the hole
        let free_end = node(buf).free_end as usize;
        let vo = it.val_off as usize;
        let vl = it.val_len as usize;
        buf.0.copy_within(free_end..vo, free_end + vl);
        for i in 0..nr - 1 {
            let mut other = get_item(buf, i);
            if other.val_off < it.val_off {
                other.val_off += it.val_len;
                set_item(buf, i, other);
            }
        }
        let n = node_mut(buf);
        n.free_end += vl as u16;
    }
}

fn child_ref(buf: &BlockBuf, idx: usize) -> BlockRef {
    let it = get_item(buf, idx);
    bytemuck::pod_read_unaligned(val_bytes(buf, &it))
}

fn set_child_ref(buf: &mut BlockBuf, idx: usize, r: BlockRef) {
    let it = get_item(buf, idx);
    debug_assert_eq!(it.val_len as usize, REF_SIZE);
    let vo = it.val_off as usize;
    buf.0[vo..vo + REF_SIZE].copy_from_slice(bytemuck::bytes_of(&r));
}

fn collect_items(buf: &BlockBuf) -> Vec<(Key, Vec<u8>)> {
    let nr = node(buf).nr as usize;
    (0..nr)
        .map(|i| {
            let it = get_item(buf, i);
            (it.key, val_bytes(buf, &it).to_vec())
        })
        .collect()
}

fn rebuild(buf: &mut BlockBuf, level: u8, items: &[(Key, Vec<u8>)]) {
    init_node(buf, level);
    for (i, (k, v)) in items.iter().enumerate() {
        insert_at(buf, i, k, v);
    }
}

/// Index of the first item that moves into the right sibling, balancing by
/// bytes.  Splitting nodes always hold at least two items.
fn split_point(items: &[(Key, Vec<u8>)]) -> usize {
    let total: usize = items.iter().map(|(_, v)| ITEM_SIZE + v.len()).sum();
    let mut acc = 0;
    for (i, (_, v)) in items.iter().enumerate() {
        acc += ITEM_SIZE + v.len();
        if acc >= total / 2 {
            return (i + 1).clamp(1, items.len() - 1);
        }
    }
    items.len() - 1
}

/// Build a standalone leaf image; used when initializing a fresh volume.
pub fn build_leaf(fsid: u64, blkno: u64, seq: u64, items: &[(Key, &[u8])]) -> BlockBuf {
    let mut buf = BlockBuf::zeroed();
    {
        let hdr: &mut BlockHeader =
            bytemuck::from_bytes_mut(&mut buf.0[..std::mem::size_of::<BlockHeader>()]);
        hdr.fsid = fsid;
        hdr.blkno = blkno;
        hdr.seq = seq;
    }
    init_node(&mut buf, 0);
    for (i, (k, v)) in items.iter().enumerate() {
        insert_at(&mut buf, i, k, v);
    }
    let crc = crc_block(&buf.0);
    buf.0[..4].copy_from_slice(&crc.to_le_bytes());
    buf
}

pub fn lookup(block: &BlockLayer, root: &BtreeRoot, key: &Key) -> Result<Option<Vec<u8>>> {
    if root.height == 0 {
        return Ok(None);
    }
    let mut bref = root.block;
    let mut level = root.height - 1;
    loop {
        let bl = block.read_ref(&bref)?;
        let g = bl.data();
        let buf: &BlockBuf = &g;
        if level == 0 {
            return Ok(match search(buf, key) {
                Ok(i) => {
                    let it = get_item(buf, i);
                    Some(val_bytes(buf, &it).to_vec())
                }
                Err(_) => None,
            });
        }
        let idx = match search(buf, key) {
            Ok(i) => i,
            Err(i) => i,
        };
        if idx == node(buf).nr as usize {
            return Ok(None);
        }
        bref = child_ref(buf, idx);
        level -= 1;
    }
}

/// First item with key >= `key`.
pub fn next(block: &BlockLayer, root: &BtreeRoot, key: &Key) -> Result<Option<(Key, Vec<u8>)>> {
    if root.height == 0 {
        return Ok(None);
    }
    next_in(block, &root.block, root.height - 1, key)
}

fn next_in(
    block: &BlockLayer,
    bref: &BlockRef,
    level: u8,
    key: &Key,
) -> Result<Option<(Key, Vec<u8>)>> {
    let bl = block.read_ref(bref)?;
    let children: Vec<BlockRef>;
    {
        let g = bl.data();
        let buf: &BlockBuf = &g;
        if level == 0 {
            let idx = match search(buf, key) {
                Ok(i) => i,
                Err(i) => i,
            };
            if idx < node(buf).nr as usize {
                let it = get_item(buf, idx);
                return Ok(Some((it.key, val_bytes(buf, &it).to_vec())));
            }
            return Ok(None);
        }
        let start = match search(buf, key) {
            Ok(i) => i,
            Err(i) => i,
        };
        children = (start..node(buf).nr as usize).map(|i| child_ref(buf, i)).collect();
    }
    for c in &children {
        if let Some(found) = next_in(block, c, level - 1, key)? {
            return Ok(Some(found));
        }
    }
    Ok(None)
}

/// Last item with key <= `key`.
pub fn prev(block: &BlockLayer, root: &BtreeRoot, key: &Key) -> Result<Option<(Key, Vec<u8>)>> {
    if root.height == 0 {
        return Ok(None);
    }
    prev_in(block, &root.block, root.height - 1, key)
}

fn prev_in(
    block: &BlockLayer,
    bref: &BlockRef,
    level: u8,
    key: &Key,
) -> Result<Option<(Key, Vec<u8>)>> {
    let bl = block.read_ref(bref)?;
    let children: Vec<BlockRef>;
    {
        let g = bl.data();
        let buf: &BlockBuf = &g;
        if level == 0 {
            let idx = match search(buf, key) {
                Ok(i) => i + 1,
                Err(i) => i,
            };
            if idx > 0 {
                let it = get_item(buf, idx - 1);
                return Ok(Some((it.key, val_bytes(buf, &it).to_vec())));
            }
            return Ok(None);
        }
        let nr = node(buf).nr as usize;
        let start = match search(buf, key) {
            Ok(i) => i,
            Err(i) => i.min(nr - 1),
        };
        children = (0..=start).rev().map(|i| child_ref(buf, i)).collect();
    }
    for c in &children {
        if let Some(found) = prev_in(block, c, level - 1, key)? {
            return Ok(Some(found));
        }
    }
    Ok(None)
}

#[derive(Clone, Copy, PartialEq)]
enum PutMode {
    Insert,
    Update,
    Force,
}

pub fn insert(
    block: &BlockLayer,
    meta: &MetaAlloc,
    root: &mut BtreeRoot,
    key: &Key,
    val: &[u8],
) -> Result<()> {
    put(block, meta, root, key, val, PutMode::Insert)
}

pub fn update(
    block: &BlockLayer,
    meta: &MetaAlloc,
    root: &mut BtreeRoot,
    key: &Key,
    val: &[u8],
) -> Result<()> {
    put(block, meta, root, key, val, PutMode::Update)
}

/// Insert or overwrite.
pub fn force(
    block: &BlockLayer,
    meta: &MetaAlloc,
    root: &mut BtreeRoot,
    key: &Key,
    val: &[u8],
) -> Result<()> {
    put(block, meta, root, key, val, PutMode::Force)
}

fn leaf_need(val_len: usize) -> usize {
    ITEM_SIZE + val_len
}

fn put(
    block: &BlockLayer,
    meta: &MetaAlloc,
    root: &mut BtreeRoot,
    key: &Key,
    val: &[u8],
    mode: PutMode,
) -> Result<()> {
    if val.len() > MAX_VAL_SIZE {
        return Err(Error::Invalid);
    }

    if root.height == 0 {
        if mode == PutMode::Update {
            return Err(Error::NotFound);
        }
        let bl = block.dirty_alloc(meta)?;
        {
            let mut g = bl.data_mut();
            let buf: &mut BlockBuf = &mut g;
            init_node(buf, 0);
            insert_at(buf, 0, key, val);
        }
        root.block = BlockRef { blkno: bl.blkno(), seq: block.dirty_seq() };
        root.height = 1;
        return Ok(());
    }

    let mut cur = block.dirty_ref(&mut root.block, meta)?;

    let root_need = if root.height == 1 { leaf_need(val.len()) } else { ITEM_SIZE + REF_SIZE };
    let root_full = {
        let g = cur.data();
        free_space(&g) < root_need
    };
    if root_full {
        cur = grow_root(block, meta, root, &cur)?;
    }

    let mut level = root.height - 1;
    while level > 0 {
        let child_need =
            if level == 1 { leaf_need(val.len()) } else { ITEM_SIZE + REF_SIZE };
        cur = descend_dirty(block, meta, &cur, key, child_need)?;
        level -= 1;
    }

    let mut g = cur.data_mut();
    let buf: &mut BlockBuf = &mut g;
    match search(buf, key) {
        Ok(i) => {
            if mode == PutMode::Insert {
                return Err(Error::Exists);
            }
            remove_at(buf, i);
            insert_at(buf, i, key, val);
        }
        Err(i) => {
            if mode == PutMode::Update {
                return Err(Error::NotFound);
            }
            insert_at(buf, i, key, val);
        }
    }
    Ok(())
}

/// Make the child under `parent` on the path to `key` dirty, splitting it
/// first if it couldn't take `child_need` more bytes.  The parent is dirty
/// and has room for one more item.
fn descend_dirty(
    block: &BlockLayer,
    meta: &MetaAlloc,
    parent: &Arc<Block>,
    key: &Key,
    child_need: usize,
) -> Result<Arc<Block>> {
    let mut g = parent.data_mut();
    let buf: &mut BlockBuf = &mut g;
    let nr = node(buf).nr as usize;
    debug_assert!(nr > 0);

    let mut idx = match search(buf, key) {
        Ok(i) => i,
        Err(i) => i,
    };
    if idx == nr {
        // new maximum; raise the last separator to cover it
        idx = nr - 1;
        let mut it = get_item(buf, idx);
        it.key = *key;
        set_item(buf, idx, it);
    }

    let mut cref = child_ref(buf, idx);
    let child = block.dirty_ref(&mut cref, meta)?;
    set_child_ref(buf, idx, cref);

    let child_full = {
        let cg = child.data();
        free_space(&cg) < child_need
    };
    if !child_full {
        return Ok(child);
    }

    let sib = block.dirty_alloc(meta)?;
    let left_max;
    {
        let mut cg = child.data_mut();
        let cbuf: &mut BlockBuf = &mut cg;
        let mut sg = sib.data_mut();
        let sbuf: &mut BlockBuf = &mut sg;

        let items = collect_items(cbuf);
        let level = node(cbuf).level;
        let split = split_point(&items);
        left_max = items[split - 1].0;
        rebuild(cbuf, level, &items[..split]);
        rebuild(sbuf, level, &items[split..]);
    }

    // the existing parent item keeps the upper separator and now points at
    // the sibling; the left half gets a fresh item
    set_child_ref(buf, idx, BlockRef { blkno: sib.blkno(), seq: block.dirty_seq() });
    insert_at(
        buf,
        idx,
        &left_max,
        bytemuck::bytes_of(&BlockRef { blkno: child.blkno(), seq: block.dirty_seq() }),
    );

    if *key <= left_max {
        Ok(child)
    } else {
        Ok(sib)
    }
}

fn grow_root(
    block: &BlockLayer,
    meta: &MetaAlloc,
    root: &mut BtreeRoot,
    old: &Arc<Block>,
) -> Result<Arc<Block>> {
    let sib = block.dirty_alloc(meta)?;
    let new_root = block.dirty_alloc(meta)?;
    let left_max;
    let right_max;
    let level;
    {
        let mut og = old.data_mut();
        let obuf: &mut BlockBuf = &mut og;
        let mut sg = sib.data_mut();
        let sbuf: &mut BlockBuf = &mut sg;

        let items = collect_items(obuf);
        level = node(obuf).level;
        let split = split_point(&items);
        left_max = items[split - 1].0;
        right_max = items[items.len() - 1].0;
        rebuild(obuf, level, &items[..split]);
        rebuild(sbuf, level, &items[split..]);
    }
    {
        let mut rg = new_root.data_mut();
        let rbuf: &mut BlockBuf = &mut rg;
        init_node(rbuf, level + 1);
        let seq = block.dirty_seq();
        insert_at(
            rbuf,
            0,
            &left_max,
            bytemuck::bytes_of(&BlockRef { blkno: old.blkno(), seq }),
        );
        insert_at(
            rbuf,
            1,
            &right_max,
            bytemuck::bytes_of(&BlockRef { blkno: sib.blkno(), seq }),
        );
    }
    root.block = BlockRef { blkno: new_root.blkno(), seq: block.dirty_seq() };
    root.height += 1;
    Ok(new_root)
}

pub fn delete(
    block: &BlockLayer,
    meta: &MetaAlloc,
    root: &mut BtreeRoot,
    key: &Key,
) -> Result<()> {
    if root.height == 0 {
        return Err(Error::NotFound);
    }
    // probe first so a miss doesn't COW the whole path
    if lookup(block, root, key)?.is_none() {
        return Err(Error::NotFound);
    }

    let mut cur = block.dirty_ref(&mut root.block, meta)?;
    let mut path: Vec<(Arc<Block>, usize)> = Vec::new();
    let mut level = root.height - 1;
    while level > 0 {
        let idx;
        let child;
        {
            let mut g = cur.data_mut();
            let buf: &mut BlockBuf = &mut g;
            idx = match search(buf, key) {
                Ok(i) => i,
                Err(i) => i,
            };
            if idx == node(buf).nr as usize {
                return Err(Error::NotFound);
            }
            let mut cref = child_ref(buf, idx);
            child = block.dirty_ref(&mut cref, meta)?;
            set_child_ref(buf, idx, cref);
        }
        path.push((cur, idx));
        cur = child;
        level -= 1;
    }

    {
        let mut g = cur.data_mut();
        let buf: &mut BlockBuf = &mut g;
        match search(buf, key) {
            Ok(i) => remove_at(buf, i),
            Err(_) => return Err(Error::NotFound),
        }
    }

    // free nodes emptied by the removal, walking back up
    let mut emptied = {
        let g = cur.data();
        node(&g).nr == 0
    };
    let mut victim = cur;
    while emptied {
        meta.free(block, block.dirty_seq(), victim.blkno());
        block.forget(victim.blkno());
        match path.pop() {
            Some((parent, idx)) => {
                {
                    let mut g = parent.data_mut();
                    let buf: &mut BlockBuf = &mut g;
                    remove_at(buf, idx);
                    emptied = node(buf).nr == 0;
                }
                victim = parent;
            }
            None => {
                *root = BtreeRoot::default();
                return Ok(());
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::open_vol;
    use crate::format::TRANS_SEQ_ZONE;

    fn key(i: u64) -> Key {
        Key::new(TRANS_SEQ_ZONE, i / 7, i)
    }

    fn val(i: u64) -> Vec<u8> {
        let mut v = vec![0u8; 24];
        v[..8].copy_from_slice(&i.to_le_bytes());
        v[16..].copy_from_slice(&(!i).to_le_bytes());
        v
    }

    #[test]
    fn insert_lookup_many() {
        let vol = open_vol();
        let mut root = BtreeRoot::default();

        for i in 0..600u64 {
            insert(&vol.block, &vol.meta, &mut root, &key(i), &val(i)).unwrap();
        }
        assert!(root.height > 1);

        for i in 0..600u64 {
            let got = lookup(&vol.block, &root, &key(i)).unwrap().unwrap();
            assert_eq!(got, val(i));
        }
        assert!(lookup(&vol.block, &root, &key(600)).unwrap().is_none());

        // next() walks every item in key order
        let mut cursor = Key::new(TRANS_SEQ_ZONE, 0, 0);
        let mut seen = Vec::new();
        while let Some((k, _)) = next(&vol.block, &root, &cursor).unwrap() {
            seen.push(k);
            cursor = k.inc();
        }
        assert_eq!(seen.len(), 600);
        let mut sorted = seen.clone();
        sorted.sort();
        assert_eq!(seen, sorted);
    }

    #[test]
    fn insert_update_force_semantics() {
        let vol = open_vol();
        let mut root = BtreeRoot::default();

        insert(&vol.block, &vol.meta, &mut root, &key(1), b"one").unwrap();
        assert!(matches!(
            insert(&vol.block, &vol.meta, &mut root, &key(1), b"dup"),
            Err(Error::Exists)
        ));
        assert!(matches!(
            update(&vol.block, &vol.meta, &mut root, &key(2), b"none"),
            Err(Error::NotFound)
        ));

        update(&vol.block, &vol.meta, &mut root, &key(1), b"uno").unwrap();
        assert_eq!(lookup(&vol.block, &root, &key(1)).unwrap().unwrap(), b"uno");

        force(&vol.block, &vol.meta, &mut root, &key(2), b"two").unwrap();
        force(&vol.block, &vol.meta, &mut root, &key(2), b"dos").unwrap();
        assert_eq!(lookup(&vol.block, &root, &key(2)).unwrap().unwrap(), b"dos");
    }

    #[test]
    fn delete_frees_emptied_tree() {
        let vol = open_vol();
        let mut root = BtreeRoot::default();

        for i in 0..300u64 {
            insert(&vol.block, &vol.meta, &mut root, &key(i), &val(i)).unwrap();
        }
        assert!(matches!(
            delete(&vol.block, &vol.meta, &mut root, &key(300)),
            Err(Error::NotFound)
        ));
        for i in 0..300u64 {
            delete(&vol.block, &vol.meta, &mut root, &key(i)).unwrap();
        }
        assert_eq!(root.height, 0);
        assert_eq!(root.block.blkno, 0);
        assert!(next(&vol.block, &root, &Key::new(TRANS_SEQ_ZONE, 0, 0)).unwrap().is_none());
    }

    #[test]
    fn next_prev_cursors() {
        let vol = open_vol();
        let mut root = BtreeRoot::default();

        for i in [10u64, 20, 30, 40] {
            insert(&vol.block, &vol.meta, &mut root, &key(i), &val(i)).unwrap();
        }

        let (k, _) = next(&vol.block, &root, &key(11)).unwrap().unwrap();
        assert_eq!(k, key(20));
        let (k, _) = next(&vol.block, &root, &key(20)).unwrap().unwrap();
        assert_eq!(k, key(20));
        assert!(next(&vol.block, &root, &key(41)).unwrap().is_none());

        let (k, _) = prev(&vol.block, &root, &key(29)).unwrap().unwrap();
        assert_eq!(k, key(20));
        let (k, _) = prev(&vol.block, &root, &key(40)).unwrap().unwrap();
        assert_eq!(k, key(40));
        assert!(prev(&vol.block, &root, &key(9)).unwrap().is_none());
    }

    #[test]
    fn survives_commit_and_reload() {
        let vol = open_vol();
        let mut root = BtreeRoot::default();

        for i in 0..200u64 {
            insert(&vol.block, &vol.meta, &mut root, &key(i), &val(i)).unwrap();
        }
        vol.block.write_dirty().unwrap();
        vol.block.advance_seq();

        // modify after the commit; the old path is COWed, not rewritten
        force(&vol.block, &vol.meta, &mut root, &key(5), b"replaced").unwrap();
        assert_eq!(lookup(&vol.block, &root, &key(5)).unwrap().unwrap(), b"replaced");
        vol.block.write_dirty().unwrap();
        vol.block.advance_seq();

        // a cold cache sees the same tree
        let cold = vol.reopen();
        assert_eq!(lookup(&cold, &root, &key(5)).unwrap().unwrap(), b"replaced");
        for i in 150..200u64 {
            assert_eq!(lookup(&cold, &root, &key(i)).unwrap().unwrap(), val(i));
        }
    }
}
