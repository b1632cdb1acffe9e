//! Srch log rotation and compaction bookkeeping.
//!
//! Clients append search-index entries to a private srch log file referenced
//! from their log-tree record.  Once a log grows past the rotation threshold
//! the server moves it into the srch tree as a standalone file record.
//! Compaction of rotated files is done by clients: the server hands out up
//! to `SRCH_COMPACT_NR` unclaimed files together with allocators for the
//! work, records the claim in a busy item, and trades the inputs for the
//! merged output when the client commits.  The merge itself happens on the
//! client.

use bytemuck::Zeroable;
use tracing::{debug, info};

use crate::alloc::MetaAlloc;
use crate::block::BlockLayer;
use crate::btree;
use crate::error::{Error, Result};
use crate::format::{
    AllocListHead, BtreeRoot, Key, SrchCompact, SrchFile, SRCH_BUSY_ZONE, SRCH_COMPACT_FLAG_DONE,
    SRCH_COMPACT_NR, SRCH_LOG_ROTATE_BLOCKS, SRCH_LOG_ZONE,
};

fn parse_file(val: &[u8]) -> Result<SrchFile> {
    if val.len() != std::mem::size_of::<SrchFile>() {
        return Err(Error::Io(std::io::Error::other("bad srch file item length")));
    }
    Ok(bytemuck::pod_read_unaligned(val))
}

fn parse_compact(val: &[u8]) -> Result<SrchCompact> {
    if val.len() != std::mem::size_of::<SrchCompact>() {
        return Err(Error::Io(std::io::Error::other("bad srch busy item length")));
    }
    Ok(bytemuck::pod_read_unaligned(val))
}

fn next_log_nr(block: &BlockLayer, root: &BtreeRoot) -> Result<u64> {
    match btree::prev(block, root, &Key::new(SRCH_LOG_ZONE, u64::MAX, u64::MAX))? {
        Some((k, _)) if k.zone == SRCH_LOG_ZONE => Ok(k.first + 1),
        _ => Ok(1),
    }
}

/// Move a client's srch log into the srch tree once it's big enough and
/// hand the client a fresh one.
pub fn rotate_log(
    block: &BlockLayer,
    meta: &MetaAlloc,
    root: &mut BtreeRoot,
    file: &mut SrchFile,
) -> Result<()> {
    if file.root.is_null() || file.blocks < SRCH_LOG_ROTATE_BLOCKS {
        return Ok(());
    }
    let nr = next_log_nr(block, root)?;
    btree::insert(block, meta, root, &Key::srch_log(nr), bytemuck::bytes_of(file))?;
    info!(nr, blocks = file.blocks, entries = file.entries, "rotated srch log");
    *file = SrchFile::default();
    Ok(())
}

/// Pick unclaimed rotated files for a client to compact.  A client that
/// already holds a claim gets it back, so retransmitted requests resume
/// rather than stack up.
pub fn get_compact(
    block: &BlockLayer,
    root: &mut BtreeRoot,
    rid: u64,
) -> Result<Option<SrchCompact>> {
    if let Some(v) = btree::lookup(block, root, &Key::srch_busy(rid))? {
        return Ok(Some(parse_compact(&v)?));
    }

    // every file id claimed by any busy item is off the table
    let mut claimed = Vec::new();
    let mut key = Key::new(SRCH_BUSY_ZONE, 0, 0);
    loop {
        match btree::next(block, root, &key)? {
            Some((k, v)) if k.zone == SRCH_BUSY_ZONE => {
                let sc = parse_compact(&v)?;
                claimed.extend_from_slice(&sc.ids[..sc.nr as usize]);
                key = k.inc();
            }
            _ => break,
        }
    }

    let mut sc = SrchCompact::zeroed();
    let mut key = Key::new(SRCH_LOG_ZONE, 0, 0);
    while (sc.nr as usize) < SRCH_COMPACT_NR {
        match btree::next(block, root, &key)? {
            Some((k, v)) if k.zone == SRCH_LOG_ZONE => {
                if !claimed.contains(&k.first) {
                    sc.ids[sc.nr as usize] = k.first;
                    sc.files[sc.nr as usize] = parse_file(&v)?;
                    sc.nr += 1;
                }
                key = k.inc();
            }
            _ => break,
        }
    }

    if sc.nr == 0 {
        return Ok(None);
    }
    debug!(rid = %format_args!("{rid:016x}"), nr = sc.nr, "issued srch compaction");
    Ok(Some(sc))
}

/// Record the claim, including the allocators granted for the work.
pub fn update_compact(
    block: &BlockLayer,
    meta: &MetaAlloc,
    root: &mut BtreeRoot,
    rid: u64,
    sc: &SrchCompact,
) -> Result<()> {
    btree::force(block, meta, root, &Key::srch_busy(rid), bytemuck::bytes_of(sc))
}

/// A client finished its compaction: trade the input files for the merged
/// output and hand the allocators back for splicing.
pub fn commit_compact(
    block: &BlockLayer,
    meta: &MetaAlloc,
    root: &mut BtreeRoot,
    rid: u64,
    sc: &SrchCompact,
) -> Result<(AllocListHead, AllocListHead)> {
    let busy = btree::lookup(block, root, &Key::srch_busy(rid))?.ok_or(Error::NotFound)?;
    let busy = parse_compact(&busy)?;

    for &id in &busy.ids[..busy.nr as usize] {
        btree::delete(block, meta, root, &Key::srch_log(id))?;
    }
    if sc.flags & SRCH_COMPACT_FLAG_DONE != 0 && !sc.files[0].root.is_null() {
        let nr = next_log_nr(block, root)?;
        btree::insert(block, meta, root, &Key::srch_log(nr), bytemuck::bytes_of(&sc.files[0]))?;
    }
    btree::delete(block, meta, root, &Key::srch_busy(rid))?;

    Ok((sc.meta_avail, sc.meta_freed))
}

/// Drop a departing client's claim.  The input files stay in place for
/// someone else to compact; the allocators are returned for reclaiming.
pub fn cancel_compact(
    block: &BlockLayer,
    meta: &MetaAlloc,
    root: &mut BtreeRoot,
    rid: u64,
) -> Result<Option<(AllocListHead, AllocListHead)>> {
    let Some(v) = btree::lookup(block, root, &Key::srch_busy(rid))? else {
        return Ok(None);
    };
    let busy = parse_compact(&v)?;
    btree::delete(block, meta, root, &Key::srch_busy(rid))?;
    Ok(Some((busy.meta_avail, busy.meta_freed)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::BlockRef;
    use crate::testutil::open_vol;

    fn filled_file(blocks: u64) -> SrchFile {
        SrchFile { root: BlockRef { blkno: 77, seq: 1 }, blocks, entries: blocks * 10 }
    }

    #[test]
    fn rotation_threshold() {
        let vol = open_vol();
        let mut root = BtreeRoot::default();

        let mut small = filled_file(SRCH_LOG_ROTATE_BLOCKS - 1);
        rotate_log(&vol.block, &vol.meta, &mut root, &mut small).unwrap();
        assert!(!small.root.is_null());
        assert_eq!(root.height, 0);

        let mut big = filled_file(SRCH_LOG_ROTATE_BLOCKS);
        rotate_log(&vol.block, &vol.meta, &mut root, &mut big).unwrap();
        assert!(big.root.is_null());
        let stored = btree::lookup(&vol.block, &root, &Key::srch_log(1)).unwrap().unwrap();
        assert_eq!(parse_file(&stored).unwrap().blocks, SRCH_LOG_ROTATE_BLOCKS);
    }

    #[test]
    fn compaction_claim_cycle() {
        let vol = open_vol();
        let mut root = BtreeRoot::default();

        for _ in 0..6 {
            let mut f = filled_file(SRCH_LOG_ROTATE_BLOCKS);
            rotate_log(&vol.block, &vol.meta, &mut root, &mut f).unwrap();
        }

        let mut sc = get_compact(&vol.block, &mut root, 100).unwrap().unwrap();
        assert_eq!(sc.nr as usize, SRCH_COMPACT_NR);
        update_compact(&vol.block, &vol.meta, &mut root, 100, &sc).unwrap();

        // reissue to the same rid resumes the claim
        let again = get_compact(&vol.block, &mut root, 100).unwrap().unwrap();
        assert_eq!(again.ids, sc.ids);

        // another client only sees the remaining files
        let other = get_compact(&vol.block, &mut root, 200).unwrap().unwrap();
        assert_eq!(other.nr, 2);
        assert!(other.ids[..2].iter().all(|id| !sc.ids.contains(id)));

        // commit trades inputs for the merged output
        sc.flags = SRCH_COMPACT_FLAG_DONE;
        sc.files[0] = filled_file(123);
        let (_av, _fr) = commit_compact(&vol.block, &vol.meta, &mut root, 100, &sc).unwrap();
        for id in &sc.ids[..sc.nr as usize] {
            assert!(btree::lookup(&vol.block, &root, &Key::srch_log(*id)).unwrap().is_none());
        }
        assert!(get_compact(&vol.block, &mut root, 100).unwrap().is_some());
        assert!(matches!(
            commit_compact(&vol.block, &vol.meta, &mut root, 100, &sc),
            Err(Error::NotFound)
        ));
    }

    #[test]
    fn cancel_releases_claim() {
        let vol = open_vol();
        let mut root = BtreeRoot::default();
        let mut f = filled_file(SRCH_LOG_ROTATE_BLOCKS);
        rotate_log(&vol.block, &vol.meta, &mut root, &mut f).unwrap();

        let sc = get_compact(&vol.block, &mut root, 9).unwrap().unwrap();
        update_compact(&vol.block, &vol.meta, &mut root, 9, &sc).unwrap();

        assert!(cancel_compact(&vol.block, &vol.meta, &mut root, 9).unwrap().is_some());
        assert!(cancel_compact(&vol.block, &vol.meta, &mut root, 9).unwrap().is_none());

        // the input file is claimable again
        let back = get_compact(&vol.block, &mut root, 10).unwrap().unwrap();
        assert_eq!(back.ids[0], sc.ids[0]);
    }
}
