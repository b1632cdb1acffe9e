//! Request handlers.
//!
//! Every state-changing handler follows the same shape: take a shared hold
//! on the commit latch, mutate the in-memory persistent state under the
//! owning subsystem lock, then apply the commit and answer with its result.
//! Handlers never unwind partial changes themselves; a failed commit throws
//! the whole batch away before the super block is rewritten.

use std::sync::Arc;

use bytemuck::Zeroable;
use tracing::{info, warn};

use crate::alloc::{self, ZonePrefs};
use crate::btree;
use crate::error::{Error, Result};
use crate::format::{
    BtreeRoot, Key, LogTrees, MountedClientVal, NetGreeting, NetInodeAlloc, VolumeOptions,
    ZoneBits, DATA_ALLOC_MAX_ZONES, DATA_ZONE_WORDS, GREETING_FLAG_QUORUM, LOG_TREES_ZONE,
    MOUNTED_CLIENT_QUORUM, SERVER_DATA_FILL_LO, SERVER_DATA_FILL_TARGET, SERVER_META_FILL_LO,
    SERVER_META_FILL_TARGET, TRANS_SEQ_ZONE, VOLOPT_DATA_ALLOC_ZONE_BLOCKS_BIT,
    VOLOPT_EXPANSION_BITS,
};
use crate::net::{expected_payload_len, parse_payload, Cmd, ResponseSink};
use crate::srch;

use super::recovery::{RECOV_GREETING, RECOV_LOCKS};
use super::zones;
use super::{two_roots, Dispatch, FarewellReq, SeqState, ServerInner};

fn parse_log_trees(val: &[u8]) -> Result<LogTrees> {
    if val.len() != std::mem::size_of::<LogTrees>() {
        return Err(Error::Io(std::io::Error::other("bad log trees item length")));
    }
    Ok(bytemuck::pod_read_unaligned(val))
}

impl ServerInner {
    /// Validate and route one request from an enabled connection.
    pub(crate) fn handle_request(&self, rid: u64, cmd: u8, id: u64, payload: &[u8]) -> Dispatch {
        let Some(cmd) = Cmd::from_u8(cmd) else {
            return Dispatch::Respond(Error::Invalid.to_errno(), Vec::new());
        };
        if payload.len() != expected_payload_len(cmd) {
            return Dispatch::Respond(Error::Invalid.to_errno(), Vec::new());
        }

        let res: Result<Option<Vec<u8>>> = match cmd {
            // greetings are only valid while the connection is being set up
            Cmd::Greeting => Err(Error::Invalid),
            Cmd::AllocInodes => self.alloc_inodes(payload).map(Some),
            Cmd::GetLogTrees => self.get_log_trees(rid).map(Some),
            Cmd::CommitLogTrees => self.commit_log_trees(rid, payload).map(Some),
            Cmd::GetRoots => self.get_roots().map(Some),
            Cmd::AdvanceSeq => self.advance_seq(rid).map(Some),
            Cmd::GetLastSeq => self.get_last_seq().map(Some),
            Cmd::Lock => self.lock_request(rid, payload).map(Some),
            Cmd::LockRecover => self.lock_recover(rid, payload).map(Some),
            Cmd::SrchGetCompact => self.srch_get_compact(rid).map(Some),
            Cmd::SrchCommitCompact => self.srch_commit_compact(rid, payload).map(Some),
            Cmd::OpenInoMap => self.open_ino_map(rid, payload).map(Some),
            Cmd::GetVolopt => self.get_volopt().map(Some),
            Cmd::SetVolopt => self.set_volopt(payload).map(Some),
            Cmd::ClearVolopt => self.clear_volopt(payload).map(Some),
            Cmd::Farewell => {
                self.queue_farewell(rid, id);
                Ok(None)
            }
        };

        match res {
            Ok(Some(payload)) => Dispatch::Respond(0, payload),
            Ok(None) => Dispatch::Deferred,
            Err(e) => Dispatch::Respond(e.to_errno(), Vec::new()),
        }
    }

    /// Process a greeting on a connection that hasn't been enabled yet.
    /// The response is queued before normal traffic is allowed so the
    /// client always sees it first.  Returns the rid to enable.
    pub(crate) fn handle_greeting(
        &self,
        sink: &dyn ResponseSink,
        id: u64,
        payload: &[u8],
    ) -> Result<u64> {
        let gr: NetGreeting = match parse_payload(payload) {
            Ok(gr) => gr,
            Err(e) => {
                let _ = sink.send(Cmd::Greeting as u8, id, e.to_errno(), &[]);
                return Err(e);
            }
        };
        let rid = gr.rid;

        let mut res: Result<()> = Ok(());
        if gr.fsid != self.fsid {
            warn!(
                client = %format_args!("{:#x}", gr.fsid),
                server = %format_args!("{:#x}", self.fsid),
                "client sent mismatched fsid"
            );
            res = Err(Error::Invalid);
        } else if gr.format_vers != self.format_vers {
            warn!(
                client = gr.format_vers,
                server = self.format_vers,
                "client sent mismatched format version"
            );
            res = Err(Error::Invalid);
        } else if gr.server_term == 0 {
            // first greeting ever from this mount; reconnects don't insert
            res = self.with_commit(|| self.insert_mounted_client(rid, gr.flags));
            self.kick_farewell();
        }

        if res.is_ok() && self.recovery.finish(rid, RECOV_GREETING) {
            self.finished_recovery();
        }

        let errno = match &res {
            Ok(()) => 0,
            Err(e) => e.to_errno(),
        };
        let reply = NetGreeting {
            fsid: self.fsid,
            format_vers: self.format_vers,
            server_term: self.term,
            rid,
            flags: 0,
        };
        sink.send(Cmd::Greeting as u8, id, errno, bytemuck::bytes_of(&reply))?;
        res?;

        // let the other layers know about a client they haven't seen under
        // this server instance
        if gr.server_term != self.term {
            self.locks.greeting(rid)?;
            if self.recovery.finish(rid, RECOV_LOCKS) {
                self.finished_recovery();
            }
            self.omap.add_rid(rid)?;
        }
        Ok(rid)
    }

    fn alloc_inodes(&self, payload: &[u8]) -> Result<Vec<u8>> {
        let count: u64 = parse_payload(payload)?;
        let ial = self.with_commit(|| {
            let mut misc = self.misc.lock();
            let ino = misc.next_ino;
            let nr = count.min(u64::MAX - ino);
            misc.next_ino += nr;
            Ok(NetInodeAlloc { ino, nr })
        })?;
        Ok(bytemuck::bytes_of(&ial).to_vec())
    }

    /// Issue or refresh a client's log trees: reclaim what it freed last
    /// transaction, then refill its allocators for the next one.
    fn get_log_trees(&self, rid: u64) -> Result<Vec<u8>> {
        let lt = self.with_commit(|| self.get_log_trees_apply(rid))?;
        Ok(bytemuck::bytes_of(&lt).to_vec())
    }

    fn get_log_trees_apply(&self, rid: u64) -> Result<LogTrees> {
        let mut logs = self.logs.lock();

        let mut key = Key::log_trees(rid, u64::MAX);
        let mut lt = match btree::prev(&self.block, &logs.logs_root, &key)? {
            Some((k, v)) if k.zone == LOG_TREES_ZONE && k.first == rid => {
                key = k;
                parse_log_trees(&v)?
            }
            _ => {
                key = Key::log_trees(rid, 1);
                let mut lt = LogTrees::zeroed();
                lt.rid = rid;
                lt.nr = 1;
                lt
            }
        };

        let zone_blocks = self.volopt.published.load().zone_blocks();
        let (exclusive, vacant) = match zone_blocks {
            Some(zb) => self.data_zone_bits(&logs.logs_root, rid, zb)?,
            None => ([0; DATA_ZONE_WORDS], [0; DATA_ZONE_WORDS]),
        };

        {
            let mut allocs = self.allocs.lock();
            let a = &mut *allocs;
            let other = a.other_ind;

            // the freed pools were committed with the client's previous
            // transaction; they are stable and reusable now
            alloc::splice_list(&self.block, &self.meta, &mut a.server_freed[other], &mut lt.meta_freed)?;
            let freed_len = lt.data_freed.total_len;
            alloc::move_extents(&self.block, &self.meta, &mut a.data_alloc, &mut lt.data_freed, freed_len, None)?;

            let (avail_pool, _) = two_roots(&mut a.meta_alloc, a.avail_idx);
            alloc::fill_list(
                &self.block,
                &self.meta,
                &mut lt.meta_avail,
                avail_pool,
                SERVER_META_FILL_LO,
                SERVER_META_FILL_TARGET,
            )?;

            if lt.data_avail.total_len < SERVER_DATA_FILL_LO {
                let want = (SERVER_DATA_FILL_TARGET - lt.data_avail.total_len)
                    .min(a.data_alloc.total_len);
                let prefs = zone_blocks.map(|zb| ZonePrefs {
                    exclusive: &exclusive,
                    vacant: &vacant,
                    zone_blocks: zb,
                });
                alloc::move_extents(
                    &self.block,
                    &self.meta,
                    &mut lt.data_avail,
                    &mut a.data_alloc,
                    want,
                    prefs.as_ref(),
                )?;
            }
        }

        // re-stamp the zone bitmap from what the client actually holds now
        lt.data_alloc_zone_blocks = 0;
        lt.data_alloc_zones = [0; DATA_ZONE_WORDS];
        if let Some(zb) = zone_blocks {
            let avail = lt.data_avail;
            let mut bits: ZoneBits = [0; DATA_ZONE_WORDS];
            alloc::for_each_extent(&self.block, &avail, |start, len| {
                zones::set_extent_bits(&mut bits, zb, start, len, true);
            })?;
            lt.data_alloc_zones = bits;
            lt.data_alloc_zone_blocks = zb;
        }

        btree::force(&self.block, &self.meta, &mut logs.logs_root, &key, bytemuck::bytes_of(&lt))?;
        Ok(lt)
    }

    /// Exclusive zones only show up in the caller's records; vacant zones
    /// show up in nobody's.  Stored bitmaps are translated from whatever
    /// resolution they were recorded at.
    fn data_zone_bits(
        &self,
        logs_root: &BtreeRoot,
        rid: u64,
        zone_blocks: u64,
    ) -> Result<(ZoneBits, ZoneBits)> {
        let mut exclusive: ZoneBits = [0; DATA_ZONE_WORDS];
        let mut vacant: ZoneBits = [0; DATA_ZONE_WORDS];
        zones::set_extent_bits(&mut vacant, zone_blocks, 0, self.total_data_blocks, true);

        let mut key = Key::log_trees(0, 0);
        loop {
            match btree::next(&self.block, logs_root, &key)? {
                Some((k, v)) if k.zone == LOG_TREES_ZONE => {
                    let lt = parse_log_trees(&v)?;
                    zones::translate_bits(
                        &mut vacant,
                        zone_blocks,
                        &lt.data_alloc_zones,
                        lt.data_alloc_zone_blocks,
                        false,
                    );
                    zones::translate_bits(
                        &mut exclusive,
                        zone_blocks,
                        &lt.data_alloc_zones,
                        lt.data_alloc_zone_blocks,
                        k.first == rid,
                    );
                    key = k.inc();
                }
                _ => break,
            }
        }
        Ok((exclusive, vacant))
    }

    /// Persist the roots a client built its transaction into.
    fn commit_log_trees(&self, rid: u64, payload: &[u8]) -> Result<Vec<u8>> {
        let lt_in: LogTrees = parse_payload(payload)?;
        if lt_in.rid != rid {
            return Err(Error::Invalid);
        }
        self.with_commit(|| {
            let mut logs = self.logs.lock();
            let key = Key::log_trees(lt_in.rid, lt_in.nr);
            btree::lookup(&self.block, &logs.logs_root, &key)?.ok_or(Error::NotFound)?;

            let mut lt = lt_in;
            {
                let mut srch_st = self.srch.lock();
                srch::rotate_log(&self.block, &self.meta, &mut srch_st.srch_root, &mut lt.srch_file)?;
            }
            btree::update(&self.block, &self.meta, &mut logs.logs_root, &key, bytemuck::bytes_of(&lt))
        })?;
        Ok(Vec::new())
    }

    /// Stable roots from the last committed transaction, never the dirty
    /// in-memory versions.
    fn get_roots(&self) -> Result<Vec<u8>> {
        Ok(bytemuck::bytes_of(&**self.roots.load()).to_vec())
    }

    /// Retire the caller's open transaction seqs and hand out the next one.
    /// Retransmitted requests just retire the previous item again.
    fn advance_seq(&self, rid: u64) -> Result<Vec<u8>> {
        let seq = self.with_commit(|| {
            let mut seqs = self.seqs.write();
            self.remove_trans_seq_items(&mut seqs, rid)?;
            let seq = seqs.next_trans_seq;
            seqs.next_trans_seq += 1;
            btree::insert(&self.block, &self.meta, &mut seqs.trans_seqs, &Key::trans_seq(seq, rid), &[])?;
            Ok(seq)
        })?;
        Ok(seq.to_le_bytes().to_vec())
    }

    /// The highest seq with no transaction still open under it.
    fn get_last_seq(&self) -> Result<Vec<u8>> {
        let seqs = self.seqs.read();
        let last = match btree::next(&self.block, &seqs.trans_seqs, &Key::trans_seq(0, 0))? {
            Some((k, _)) if k.zone == TRANS_SEQ_ZONE => k.first.wrapping_sub(1),
            _ => seqs.next_trans_seq.wrapping_sub(1),
        };
        Ok(last.to_le_bytes().to_vec())
    }

    fn remove_trans_seq_items(&self, seqs: &mut SeqState, rid: u64) -> Result<()> {
        let mut key = Key::trans_seq(0, 0);
        loop {
            match btree::next(&self.block, &seqs.trans_seqs, &key)? {
                Some((k, _)) if k.zone == TRANS_SEQ_ZONE => {
                    if k.second == rid {
                        btree::delete(&self.block, &self.meta, &mut seqs.trans_seqs, &k)?;
                    }
                    key = k.inc();
                }
                _ => return Ok(()),
            }
        }
    }

    /// Called from reclaim with the commit already held.
    pub(super) fn remove_trans_seq(&self, rid: u64) -> Result<()> {
        let mut seqs = self.seqs.write();
        self.remove_trans_seq_items(&mut seqs, rid)
    }

    fn lock_request(&self, rid: u64, payload: &[u8]) -> Result<Vec<u8>> {
        let nl = parse_payload(payload)?;
        let granted = self.locks.request(rid, &nl)?;
        Ok(bytemuck::bytes_of(&granted).to_vec())
    }

    fn lock_recover(&self, rid: u64, payload: &[u8]) -> Result<Vec<u8>> {
        let key: Key = parse_payload(payload)?;
        Ok(bytemuck::bytes_of(&self.locks.recover(rid, &key)).to_vec())
    }

    fn srch_get_compact(&self, rid: u64) -> Result<Vec<u8>> {
        let sc = self.with_commit(|| {
            let mut sc = {
                let mut srch_st = self.srch.lock();
                srch::get_compact(&self.block, &mut srch_st.srch_root, rid)?
                    .ok_or(Error::NotFound)?
            };

            {
                let mut allocs = self.allocs.lock();
                let a = &mut *allocs;
                let (avail_pool, _) = two_roots(&mut a.meta_alloc, a.avail_idx);
                alloc::fill_list(
                    &self.block,
                    &self.meta,
                    &mut sc.meta_avail,
                    avail_pool,
                    SERVER_META_FILL_LO,
                    SERVER_META_FILL_TARGET,
                )?;
                let other = a.other_ind;
                alloc::splice_list(&self.block, &self.meta, &mut a.server_freed[other], &mut sc.meta_freed)?;
            }

            let mut srch_st = self.srch.lock();
            srch::update_compact(&self.block, &self.meta, &mut srch_st.srch_root, rid, &sc)?;
            Ok(sc)
        })?;
        Ok(bytemuck::bytes_of(&sc).to_vec())
    }

    /// The client's freed list still holds the source file blocks, which
    /// stay unavailable until the commit lands.
    fn srch_commit_compact(&self, rid: u64, payload: &[u8]) -> Result<Vec<u8>> {
        let sc = parse_payload(payload)?;
        self.with_commit(|| {
            let (mut av, mut fr) = {
                let mut srch_st = self.srch.lock();
                srch::commit_compact(&self.block, &self.meta, &mut srch_st.srch_root, rid, &sc)?
            };
            let mut allocs = self.allocs.lock();
            let a = &mut *allocs;
            let other = a.other_ind;
            alloc::splice_list(&self.block, &self.meta, &mut a.server_freed[other], &mut av)?;
            alloc::splice_list(&self.block, &self.meta, &mut a.server_freed[other], &mut fr)
        })?;
        Ok(Vec::new())
    }

    /// Called from reclaim with the commit already held; loops until the
    /// departing rid holds no claims.
    pub(super) fn cancel_srch_compact(&self, rid: u64) -> Result<()> {
        loop {
            let got = {
                let mut srch_st = self.srch.lock();
                srch::cancel_compact(&self.block, &self.meta, &mut srch_st.srch_root, rid)?
            };
            let Some((mut av, mut fr)) = got else {
                return Ok(());
            };
            let mut allocs = self.allocs.lock();
            let a = &mut *allocs;
            let other = a.other_ind;
            alloc::splice_list(&self.block, &self.meta, &mut a.server_freed[other], &mut av)?;
            alloc::splice_list(&self.block, &self.meta, &mut a.server_freed[other], &mut fr)?;
        }
    }

    fn open_ino_map(&self, rid: u64, payload: &[u8]) -> Result<Vec<u8>> {
        let args = parse_payload(payload)?;
        Ok(bytemuck::bytes_of(&self.omap.handle_request(rid, &args)).to_vec())
    }

    fn get_volopt(&self) -> Result<Vec<u8>> {
        Ok(bytemuck::bytes_of(&**self.volopt.published.load()).to_vec())
    }

    /// Readers only see the new options once they're durable in the super
    /// block; a failed commit restores the staged copy.
    fn set_volopt(&self, payload: &[u8]) -> Result<Vec<u8>> {
        let req: VolumeOptions = parse_payload(payload)?;
        if req.set_bits & VOLOPT_EXPANSION_BITS != 0 {
            return Err(Error::Invalid);
        }

        let _serial = self.volopt_change.lock();
        let hold = self.hold_commit()?;

        let mut res = Ok(());
        if req.set_bits & VOLOPT_DATA_ALLOC_ZONE_BLOCKS_BIT != 0 {
            let opt = req.data_alloc_zone_blocks;
            let min_zone = self.total_data_blocks / DATA_ALLOC_MAX_ZONES;
            if opt < SERVER_DATA_FILL_TARGET {
                warn!(opt, target = SERVER_DATA_FILL_TARGET, "zone blocks below the mount data allocation target");
                res = Err(Error::Invalid);
            } else if opt < min_zone {
                warn!(opt, min_zone, "zone blocks would produce too many zones");
                res = Err(Error::Invalid);
            } else if opt > self.total_data_blocks {
                warn!(opt, total = self.total_data_blocks, "zone blocks larger than the data device");
                res = Err(Error::Invalid);
            } else {
                let mut staged = self.volopt.staged.lock();
                staged.data_alloc_zone_blocks = opt;
                staged.set_bits |= VOLOPT_DATA_ALLOC_ZONE_BLOCKS_BIT;
            }
        }

        let res = self.apply_commit(hold, res);
        let mut staged = self.volopt.staged.lock();
        match res {
            Ok(()) => {
                self.volopt.published.store(Arc::new(*staged));
                info!(zone_blocks = staged.data_alloc_zone_blocks, "volume options updated");
                Ok(Vec::new())
            }
            Err(e) => {
                *staged = **self.volopt.published.load();
                Err(e)
            }
        }
    }

    fn clear_volopt(&self, payload: &[u8]) -> Result<Vec<u8>> {
        let req: VolumeOptions = parse_payload(payload)?;
        if req.set_bits & VOLOPT_EXPANSION_BITS != 0 {
            return Err(Error::Invalid);
        }

        let _serial = self.volopt_change.lock();
        let hold = self.hold_commit()?;

        if req.set_bits & VOLOPT_DATA_ALLOC_ZONE_BLOCKS_BIT != 0 {
            let mut staged = self.volopt.staged.lock();
            staged.set_bits &= !VOLOPT_DATA_ALLOC_ZONE_BLOCKS_BIT;
            staged.data_alloc_zone_blocks = 0;
        }

        let res = self.apply_commit(hold, Ok(()));
        let mut staged = self.volopt.staged.lock();
        match res {
            Ok(()) => {
                self.volopt.published.store(Arc::new(*staged));
                Ok(Vec::new())
            }
            Err(e) => {
                *staged = **self.volopt.published.load();
                Err(e)
            }
        }
    }

    fn queue_farewell(&self, rid: u64, net_id: u64) {
        info!(rid = %format_args!("{rid:016x}"), "farewell queued");
        self.farewell_pending.lock().push(FarewellReq { rid, net_id });
        self.kick_farewell();
    }

    /// Idempotent: a greeting retransmitted to a new server finds the item
    /// already present.
    pub(super) fn insert_mounted_client(&self, rid: u64, greeting_flags: u64) -> Result<()> {
        let mut mcv = MountedClientVal { flags: 0 };
        if greeting_flags & GREETING_FLAG_QUORUM != 0 {
            mcv.flags |= MOUNTED_CLIENT_QUORUM;
        }
        let mut mounted = self.mounted.lock();
        match btree::insert(
            &self.block,
            &self.meta,
            &mut mounted.root,
            &Key::mounted_client(rid),
            bytemuck::bytes_of(&mcv),
        ) {
            Err(Error::Exists) => Ok(()),
            other => other,
        }
    }

    /// Idempotent: a farewell retried against a new server finds the item
    /// already deleted.
    pub(super) fn delete_mounted_client(&self, rid: u64) -> Result<()> {
        let mut mounted = self.mounted.lock();
        match btree::delete(&self.block, &self.meta, &mut mounted.root, &Key::mounted_client(rid)) {
            Err(Error::NotFound) => Ok(()),
            other => other,
        }
    }

    /// Reclaim a departed client's allocators.  The record itself stays so
    /// the merge path can consume its item trees later.
    pub(super) fn reclaim_log_trees(&self, rid: u64) -> Result<()> {
        let mut logs = self.logs.lock();

        let key = Key::log_trees(rid, 0);
        let Some((k, v)) = btree::next(&self.block, &logs.logs_root, &key)? else {
            return Ok(());
        };
        if k.zone != LOG_TREES_ZONE || k.first != rid {
            return Ok(());
        }
        let mut lt = parse_log_trees(&v)?;

        {
            let mut allocs = self.allocs.lock();
            let a = &mut *allocs;
            let other = a.other_ind;
            alloc::splice_list(&self.block, &self.meta, &mut a.server_freed[other], &mut lt.meta_freed)?;
            alloc::splice_list(&self.block, &self.meta, &mut a.server_freed[other], &mut lt.meta_avail)?;
            let avail_len = lt.data_avail.total_len;
            alloc::move_extents(&self.block, &self.meta, &mut a.data_alloc, &mut lt.data_avail, avail_len, None)?;
            let freed_len = lt.data_freed.total_len;
            alloc::move_extents(&self.block, &self.meta, &mut a.data_alloc, &mut lt.data_freed, freed_len, None)?;
        }

        lt.data_alloc_zone_blocks = 0;
        lt.data_alloc_zones = [0; DATA_ZONE_WORDS];

        // the allocators have already been moved; failing to record that in
        // the log item would leave them owned twice, so the server stops
        if let Err(e) =
            btree::update(&self.block, &self.meta, &mut logs.logs_root, &k, bytemuck::bytes_of(&lt))
        {
            tracing::error!(
                rid = %format_args!("{rid:016x}"),
                err = %e,
                "log item out of sync with reclaimed allocators, stopping server"
            );
            self.stop_flag();
            return Err(e);
        }
        Ok(())
    }
}
