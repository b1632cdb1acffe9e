//! The cluster server: commit coordination, client lifecycle, and the
//! worker threads that drive them.
//!
//! Request handlers hold the commit latch shared while they mutate the
//! in-memory persistent state, then queue themselves on the waiter list and
//! block until the commit worker has made the batch durable.  The commit
//! worker takes the latch exclusively, flushes the dirty set, swaps the
//! server's allocator banks, writes the super block and wakes every waiter
//! with the same result, so concurrent requests coalesce into single disk
//! transactions.

pub mod fence;
pub mod lock;
pub mod omap;
pub mod recovery;

mod handlers;
mod zones;

use std::collections::HashSet;
use std::fs::OpenOptions;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use crossbeam_queue::SegQueue;
use parking_lot::{Mutex, RwLock, RwLockReadGuard};
use tracing::{debug, error, info, warn};

use crate::alloc::{self, MetaAlloc};
use crate::block::{read_super_from, BlockLayer};
use crate::btree;
use crate::error::{Error, Result};
use crate::format::{
    AllocListHead, AllocRoot, BtreeRoot, Key, MountedClientVal, NetRoots, SuperBlock,
    VolumeOptions, FORMAT_VERS, MOUNTED_CLIENT_QUORUM, MOUNTED_CLIENT_ZONE,
    SERVER_META_ALLOC_MIN, SERVER_META_FILL_LO, SERVER_META_FILL_TARGET, SUPER_MAGIC,
};
use crate::net::{self, Cmd, Conns, ResponseSink, TcpSink};

pub use fence::{FenceQueue, FenceReason, Fencer};
pub use recovery::{Recovery, RECOV_ALL, RECOV_GREETING, RECOV_LOCKS};

use lock::LockServer;
use omap::OpenMap;

/// Quorum election is a separate subsystem; the server only needs the
/// majority threshold for farewell ordering and a way to clear a fenced
/// leader's record.
pub trait Quorum: Send + Sync {
    fn votes_needed(&self) -> usize;
    fn clear_leader(&self, rid: u64) -> Result<()>;
    fn server_shutdown(&self) {}
}

/// Fixed majority threshold; fits single-volume deployments and tests.
pub struct StaticQuorum {
    votes: usize,
}

impl StaticQuorum {
    pub fn new(votes: usize) -> StaticQuorum {
        StaticQuorum { votes }
    }
}

impl Quorum for StaticQuorum {
    fn votes_needed(&self) -> usize {
        self.votes
    }

    fn clear_leader(&self, _rid: u64) -> Result<()> {
        Ok(())
    }
}

pub struct ServerConfig {
    pub device: PathBuf,
    pub bind: SocketAddr,
    /// Election term of this server instance; clients echo it back when
    /// reconnecting.
    pub term: u64,
    pub recovery_timeout: Duration,
    pub reclaim_interval: Duration,
    pub quorum: Arc<dyn Quorum>,
    pub fence: Arc<dyn Fencer>,
}

impl ServerConfig {
    pub fn new(device: impl Into<PathBuf>, bind: SocketAddr) -> ServerConfig {
        ServerConfig {
            device: device.into(),
            bind,
            term: 1,
            recovery_timeout: Duration::from_secs(30),
            reclaim_interval: Duration::from_secs(1),
            quorum: Arc::new(StaticQuorum::new(1)),
            fence: Arc::new(FenceQueue::new()),
        }
    }
}

struct MiscState {
    next_ino: u64,
}

struct AllocState {
    meta_alloc: [AllocRoot; 2],
    /// Which of the shared meta extent roots is currently avail.
    avail_idx: usize,
    data_alloc: AllocRoot,
    server_avail: [AllocListHead; 2],
    server_freed: [AllocListHead; 2],
    /// The bank left intact until its super block write completes.
    other_ind: usize,
}

struct LogsState {
    logs_root: BtreeRoot,
}

struct SrchState {
    srch_root: BtreeRoot,
}

struct MountedState {
    root: BtreeRoot,
}

struct SeqState {
    trans_seqs: BtreeRoot,
    next_trans_seq: u64,
}

struct VoloptState {
    /// The copy the next super block will carry.
    staged: Mutex<VolumeOptions>,
    /// What readers see; only updated once a commit made staged durable.
    published: ArcSwap<VolumeOptions>,
}

struct FarewellReq {
    rid: u64,
    net_id: u64,
}

pub(crate) enum Dispatch {
    Respond(i32, Vec<u8>),
    Deferred,
}

/// Split the meta extent pair into (avail, freed).
fn two_roots(arr: &mut [AllocRoot; 2], avail_idx: usize) -> (&mut AllocRoot, &mut AllocRoot) {
    let (lo, hi) = arr.split_at_mut(1);
    if avail_idx == 0 {
        (&mut lo[0], &mut hi[0])
    } else {
        (&mut hi[0], &mut lo[0])
    }
}

pub(crate) struct ServerInner {
    cfg: ServerConfig,
    fsid: u64,
    format_vers: u64,
    total_meta_blocks: u64,
    first_meta_blkno: u64,
    total_data_blocks: u64,
    first_data_blkno: u64,
    term: u64,

    block: BlockLayer,
    meta: MetaAlloc,

    shutting_down: AtomicBool,

    misc: Mutex<MiscState>,
    allocs: Mutex<AllocState>,
    logs: Mutex<LogsState>,
    srch: Mutex<SrchState>,
    mounted: Mutex<MountedState>,
    seqs: RwLock<SeqState>,
    fs_root: Mutex<BtreeRoot>,
    volopt_change: Mutex<()>,
    volopt: VoloptState,

    /// Stable roots from the last commit, snapshotted without blocking.
    roots: ArcSwap<NetRoots>,

    commit_latch: RwLock<()>,
    commit_waiters: SegQueue<Sender<i32>>,
    commit_kick: Sender<()>,

    recovery: Recovery,
    locks: LockServer,
    omap: OpenMap,

    farewell_pending: Mutex<Vec<FarewellReq>>,
    farewell_kick: Sender<()>,

    conns: Conns,
    clients: Mutex<HashSet<u64>>,
}

pub(crate) struct CommitHold<'a>(#[allow(dead_code)] RwLockReadGuard<'a, ()>);

impl ServerInner {
    fn stop_flag(&self) {
        if !self.shutting_down.swap(true, Ordering::SeqCst) {
            info!("server shutdown requested");
        }
        let _ = self.commit_kick.send(());
        let _ = self.farewell_kick.send(());
    }

    fn kick_farewell(&self) {
        if !self.shutting_down.load(Ordering::Acquire) {
            let _ = self.farewell_kick.send(());
        }
    }

    /// Shared hold: many handlers mutate blocks of the same commit at once,
    /// and the commit worker is locked out until they all release.
    fn hold_commit(&self) -> Result<CommitHold<'_>> {
        if self.shutting_down.load(Ordering::Acquire) {
            return Err(Error::ShuttingDown);
        }
        Ok(CommitHold(self.commit_latch.read()))
    }

    /// Queue for the next commit and wait for its shared result.  Changes
    /// made under the hold become durable iff this returns Ok.
    fn apply_commit(&self, hold: CommitHold<'_>, res: Result<()>) -> Result<()> {
        match res {
            Err(e) => {
                drop(hold);
                Err(e)
            }
            Ok(()) => {
                let (tx, rx) = crossbeam_channel::bounded(1);
                self.commit_waiters.push(tx);
                let _ = self.commit_kick.send(());
                drop(hold);
                match rx.recv() {
                    Ok(0) => Ok(()),
                    Ok(errno) => Err(Error::from_errno(errno)),
                    Err(_) => Err(Error::ShuttingDown),
                }
            }
        }
    }

    fn with_commit<T>(&self, f: impl FnOnce() -> Result<T>) -> Result<T> {
        let hold = self.hold_commit()?;
        match f() {
            Ok(v) => self.apply_commit(hold, Ok(())).map(|_| v),
            Err(e) => Err(self.apply_commit(hold, Err(e)).unwrap_err()),
        }
    }

    fn commit_once(&self) {
        let _excl = self.commit_latch.write();
        // redundant kicks coalesce: with nobody waiting and nothing dirty
        // there is no commit to make
        if self.commit_waiters.is_empty() && !self.block.has_dirty() {
            return;
        }
        let res = self.do_commit();
        let errno = match &res {
            Ok(()) => 0,
            Err(e) => {
                error!(err = %e, "commit failed; batch will be retried");
                e.to_errno()
            }
        };
        while let Some(tx) = self.commit_waiters.pop() {
            let _ = tx.send(errno);
        }
    }

    fn do_commit(&self) -> Result<()> {
        let mut allocs = self.allocs.lock();
        let a = &mut *allocs;
        let other = a.other_ind;

        // make sure the next transaction's bank has enough blocks, and
        // return the idle bank's freed blocks to the shared pool now that
        // their commit is durable
        {
            let (avail_pool, freed_pool) = two_roots(&mut a.meta_alloc, a.avail_idx);
            alloc::fill_list(
                &self.block,
                &self.meta,
                &mut a.server_avail[other],
                avail_pool,
                SERVER_META_FILL_LO,
                SERVER_META_FILL_TARGET,
            )?;
            alloc::empty_list(&self.block, &self.meta, freed_pool, &mut a.server_freed[other])?;
        }

        let (cur_avail, cur_freed) = self.meta.prepare_commit(&self.block)?;
        a.server_avail[other ^ 1] = cur_avail;
        a.server_freed[other ^ 1] = cur_freed;

        self.block.write_dirty()?;

        let mut sup = self.assemble_super(a);
        self.block.write_super(&mut sup)?;

        self.roots.store(Arc::new(NetRoots {
            fs_root: sup.fs_root,
            logs_root: sup.logs_root,
            srch_root: sup.srch_root,
        }));

        // swizzle the banks: the refilled idle bank carries the next
        // transaction while this one's heads rest until its super is
        // superseded
        a.other_ind ^= 1;
        let oi = a.other_ind;
        self.meta.load_bank(&a.server_avail[oi ^ 1], &a.server_freed[oi ^ 1]);

        if a.meta_alloc[a.avail_idx].total_len <= SERVER_META_ALLOC_MIN
            && a.meta_alloc[a.avail_idx ^ 1].total_len > SERVER_META_ALLOC_MIN
        {
            a.avail_idx ^= 1;
            debug!("swapped shared meta extent pools");
        }

        self.block.advance_seq();
        debug!(seq = self.block.dirty_seq(), "commit complete");
        Ok(())
    }

    fn assemble_super(&self, a: &AllocState) -> SuperBlock {
        use bytemuck::Zeroable;
        // the exclusive latch is held, so the subsystem locks are all idle
        let mut sup = SuperBlock::zeroed();
        sup.hdr.seq = self.block.dirty_seq();
        sup.magic = SUPER_MAGIC;
        sup.format_vers = self.format_vers;
        sup.next_ino = self.misc.lock().next_ino;
        {
            let seqs = self.seqs.read();
            sup.next_trans_seq = seqs.next_trans_seq;
            sup.trans_seqs = seqs.trans_seqs;
        }
        sup.total_meta_blocks = self.total_meta_blocks;
        sup.first_meta_blkno = self.first_meta_blkno;
        sup.total_data_blocks = self.total_data_blocks;
        sup.first_data_blkno = self.first_data_blkno;
        sup.fs_root = *self.fs_root.lock();
        sup.logs_root = self.logs.lock().logs_root;
        sup.srch_root = self.srch.lock().srch_root;
        sup.mounted_clients = self.mounted.lock().root;
        sup.meta_alloc = a.meta_alloc;
        sup.data_alloc = a.data_alloc;
        sup.server_meta_avail = a.server_avail;
        sup.server_meta_freed = a.server_freed;
        sup.volopt = *self.volopt.staged.lock();
        sup
    }

    /// Reclaim everything a departed client owned, in one commit.  Safe to
    /// repeat: every step recognizes already-reclaimed state.  The mounted
    /// client record goes last; recovery looks for it.
    fn reclaim_rid(&self, rid: u64, clear_leader: bool) -> Result<()> {
        let hold = self.hold_commit()?;
        let res = self
            .locks
            .farewell(rid)
            .and_then(|_| self.remove_trans_seq(rid))
            .and_then(|_| self.reclaim_log_trees(rid))
            .and_then(|_| self.cancel_srch_compact(rid))
            .and_then(|_| self.omap.remove_rid(rid))
            .and_then(|_| if clear_leader { self.cfg.quorum.clear_leader(rid) } else { Ok(()) })
            .and_then(|_| self.delete_mounted_client(rid));
        self.apply_commit(hold, res)
    }

    fn finished_recovery(&self) {
        info!("all clients recovered");
        if let Err(e) = self.omap.finished_recovery().and_then(|_| self.locks.finished_recovery())
        {
            error!(err = %e, "error resuming after recovery, shutting down");
            self.stop_flag();
        }
    }

    /// Recovery ran out of time for some clients; whatever they were doing,
    /// they get fenced now.
    fn fence_pending_recov(&self) {
        let mut rid = 0;
        while let Some(next) = self.recovery.next_pending(rid) {
            error!(
                rid = %format_args!("{next:016x}"),
                timeout_ms = self.cfg.recovery_timeout.as_millis() as u64,
                "recovery timeout expired, fencing client"
            );
            if let Err(e) = self.cfg.fence.start(next, FenceReason::ClientRecovery) {
                error!(err = %e, "fence request failed, shutting down server");
                self.stop_flag();
                break;
            }
            rid = next;
        }
    }

    fn requeue_farewells(&self, reqs: Vec<FarewellReq>) {
        let mut pending = self.farewell_pending.lock();
        let mut merged = reqs;
        merged.extend(pending.drain(..));
        *pending = merged;
    }

    /// Farewell ordering: non-quorum mounts and already-reclaimed mounts
    /// are answered immediately.  Quorum members are held back unless
    /// enough voters remain after they leave, or the requesters are exactly
    /// the mounts that remain and the cluster drains out together.
    fn process_farewells(&self) {
        let reqs: Vec<FarewellReq> = std::mem::take(&mut *self.farewell_pending.lock());
        if reqs.is_empty() {
            return;
        }

        let parse_mcv = |v: &[u8]| -> Result<MountedClientVal> {
            if v.len() != std::mem::size_of::<MountedClientVal>() {
                return Err(Error::Io(std::io::Error::other("bad mounted client item length")));
            }
            Ok(bytemuck::pod_read_unaligned(v))
        };

        let mut quo_mnts = 0usize;
        let mut non_mnts = 0usize;
        {
            let mounted = self.mounted.lock();
            let mut key = Key::mounted_client(0);
            loop {
                match btree::next(&self.block, &mounted.root, &key) {
                    Ok(Some((k, v))) if k.zone == MOUNTED_CLIENT_ZONE => {
                        match parse_mcv(&v) {
                            Ok(mcv) if mcv.flags & MOUNTED_CLIENT_QUORUM != 0 => quo_mnts += 1,
                            Ok(_) => non_mnts += 1,
                            Err(e) => {
                                error!(err = %e, "mounted client scan failed, stopping server");
                                drop(mounted);
                                self.requeue_farewells(reqs);
                                self.stop_flag();
                                return;
                            }
                        }
                        key = k.inc();
                    }
                    Ok(_) => break,
                    Err(e) => {
                        error!(err = %e, "mounted client scan failed, stopping server");
                        drop(mounted);
                        self.requeue_farewells(reqs);
                        self.stop_flag();
                        return;
                    }
                }
            }
        }

        let mut send: Vec<FarewellReq> = Vec::new();
        let mut held: Vec<FarewellReq> = Vec::new();
        let mut quo_reqs = 0usize;
        for fw in reqs {
            let looked = {
                let mounted = self.mounted.lock();
                btree::lookup(&self.block, &mounted.root, &Key::mounted_client(fw.rid))
            };
            match looked {
                Ok(None) => send.push(fw),
                Ok(Some(v)) => match parse_mcv(&v) {
                    Ok(mcv) if mcv.flags & MOUNTED_CLIENT_QUORUM != 0 => {
                        quo_reqs += 1;
                        held.push(fw);
                    }
                    Ok(_) => {
                        send.push(fw);
                        non_mnts = non_mnts.saturating_sub(1);
                    }
                    Err(e) => {
                        error!(err = %e, "farewell lookup failed, stopping server");
                        send.extend(held);
                        send.push(fw);
                        self.requeue_farewells(send);
                        self.stop_flag();
                        return;
                    }
                },
                Err(e) => {
                    error!(err = %e, "farewell lookup failed, stopping server");
                    send.extend(held);
                    send.push(fw);
                    self.requeue_farewells(send);
                    self.stop_flag();
                    return;
                }
            }
        }

        let votes = self.cfg.quorum.votes_needed();
        let mut still_held: Vec<FarewellReq> = Vec::new();
        for fw in held {
            if quo_mnts > votes + 1 || (quo_reqs == quo_mnts && non_mnts == 0) {
                send.push(fw);
                quo_mnts -= 1;
                quo_reqs -= 1;
            } else {
                still_held.push(fw);
            }
        }

        // reclaim before responding; a client that got its response is free
        // to disappear for good
        let mut idx = 0;
        while idx < send.len() {
            if let Err(e) = self.reclaim_rid(send[idx].rid, false) {
                error!(err = %e, "farewell reclaim failed, stopping server");
                let mut rest: Vec<FarewellReq> = send.split_off(idx);
                rest.extend(still_held);
                self.requeue_farewells(rest);
                self.stop_flag();
                return;
            }
            idx += 1;
        }

        for fw in send {
            match self.conns.send(fw.rid, Cmd::Farewell as u8, fw.net_id, 0, &[]) {
                Ok(()) => info!(rid = %format_args!("{:016x}", fw.rid), "farewell sent"),
                Err(e) => {
                    // connection went down; the client will see its mounted
                    // record is gone when it reconnects
                    debug!(rid = %format_args!("{:016x}", fw.rid), err = %e, "farewell response dropped");
                }
            }
        }

        if !still_held.is_empty() {
            self.requeue_farewells(still_held);
        }
    }

    fn sleep_while_running(&self, dur: Duration) {
        let deadline = Instant::now() + dur;
        while Instant::now() < deadline && !self.shutting_down.load(Ordering::Acquire) {
            std::thread::sleep(Duration::from_millis(20));
        }
    }
}

fn commit_worker(inner: Arc<ServerInner>, rx: Receiver<()>) {
    loop {
        match rx.recv_timeout(Duration::from_millis(100)) {
            Ok(()) => inner.commit_once(),
            Err(RecvTimeoutError::Timeout) => {
                if inner.shutting_down.load(Ordering::Acquire) {
                    break;
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    while let Some(tx) = inner.commit_waiters.pop() {
        let _ = tx.send(Error::ShuttingDown.to_errno());
    }
}

fn farewell_worker(inner: Arc<ServerInner>, rx: Receiver<()>) {
    loop {
        match rx.recv_timeout(Duration::from_millis(100)) {
            Ok(()) => inner.process_farewells(),
            Err(RecvTimeoutError::Timeout) => {
                if inner.shutting_down.load(Ordering::Acquire) {
                    break;
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
}

/// Fencing can complete at any time, even before the server noticed a
/// client was in trouble; this worker turns fenced rids back into free
/// resources.
fn reclaim_worker(inner: Arc<ServerInner>) {
    while !inner.shutting_down.load(Ordering::Acquire) {
        let progressed = match inner.cfg.fence.next_fenced() {
            Err(e) => {
                error!(err = %e, "fence subsystem error, shutting down server");
                inner.stop_flag();
                break;
            }
            Ok(Some((rid, reason))) => {
                match inner.reclaim_rid(rid, reason == FenceReason::QuorumBlockLeader) {
                    Ok(()) => {
                        info!(rid = %format_args!("{rid:016x}"), "reclaimed fenced client");
                        inner.cfg.fence.free(rid);
                        if inner.recovery.finish(rid, RECOV_ALL) {
                            inner.finished_recovery();
                        }
                        true
                    }
                    Err(e) => {
                        error!(
                            rid = %format_args!("{rid:016x}"),
                            err = %e,
                            "failed to reclaim fenced client, shutting down server"
                        );
                        inner.stop_flag();
                        break;
                    }
                }
            }
            Ok(None) => false,
        };
        if !progressed {
            inner.sleep_while_running(inner.cfg.reclaim_interval);
        }
    }
}

fn accept_loop(inner: Arc<ServerInner>, listener: TcpListener) {
    let mut conns: Vec<JoinHandle<()>> = Vec::new();
    while !inner.shutting_down.load(Ordering::Acquire) {
        match listener.accept() {
            Ok((stream, peer)) => {
                let conn_inner = inner.clone();
                match std::thread::Builder::new()
                    .name("blockhouse-conn".into())
                    .spawn(move || conn_loop(conn_inner, stream, peer))
                {
                    Ok(handle) => conns.push(handle),
                    Err(e) => warn!(err = %e, "spawning connection thread failed"),
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(25));
            }
            Err(e) => {
                warn!(err = %e, "accept failed");
                std::thread::sleep(Duration::from_millis(100));
            }
        }
    }
    for handle in conns {
        let _ = handle.join();
    }
}

fn conn_loop(inner: Arc<ServerInner>, mut stream: TcpStream, peer: SocketAddr) {
    if stream.set_read_timeout(Some(Duration::from_millis(100))).is_err()
        || stream.set_nodelay(true).is_err()
    {
        return;
    }
    let Ok(write_half) = stream.try_clone() else {
        return;
    };
    let sink: Arc<dyn ResponseSink> = Arc::new(TcpSink::new(write_half));
    let mut rid: Option<u64> = None;

    while !inner.shutting_down.load(Ordering::Acquire) {
        let req = match net::read_request(&mut stream) {
            Ok(req) => req,
            Err(e)
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) =>
            {
                continue;
            }
            Err(_) => break,
        };

        match rid {
            None => {
                // nothing but a greeting is valid until the greeting lands
                if req.cmd != Cmd::Greeting as u8 {
                    let _ = sink.send(req.cmd, req.id, Error::Invalid.to_errno(), &[]);
                    continue;
                }
                match inner.handle_greeting(sink.as_ref(), req.id, &req.payload) {
                    Ok(r) => {
                        inner.conns.register(r, sink.clone());
                        inner.clients.lock().insert(r);
                        info!(rid = %format_args!("{r:016x}"), %peer, "client connected");
                        rid = Some(r);
                    }
                    Err(_) => break,
                }
            }
            Some(r) => {
                if req.rid != r {
                    let _ = sink.send(req.cmd, req.id, Error::Invalid.to_errno(), &[]);
                    continue;
                }
                match inner.handle_request(r, req.cmd, req.id, &req.payload) {
                    Dispatch::Respond(errno, payload) => {
                        if sink.send(req.cmd, req.id, errno, &payload).is_err() {
                            break;
                        }
                    }
                    Dispatch::Deferred => {}
                }
            }
        }
    }

    if let Some(r) = rid {
        inner.conns.remove(r);
        inner.clients.lock().remove(&r);
        // unanswered farewells die with the connection; the client resends
        inner.farewell_pending.lock().retain(|fw| fw.rid != r);
        info!(rid = %format_args!("{r:016x}"), %peer, "client disconnected");
    }
}

/// At startup every client mounted under the previous server gets a
/// recovery deadline; the ones that miss it are fenced.
fn start_recovery(inner: &Arc<ServerInner>) -> Result<()> {
    let mut nr = 0;
    {
        let mounted = inner.mounted.lock();
        let mut key = Key::mounted_client(0);
        loop {
            match btree::next(&inner.block, &mounted.root, &key)? {
                Some((k, _)) if k.zone == MOUNTED_CLIENT_ZONE => {
                    inner.recovery.prepare(k.first, RECOV_ALL);
                    nr += 1;
                    key = k.inc();
                }
                _ => break,
            }
        }
    }
    if nr > 0 {
        info!(nr, "waiting for clients to recover");
        let timeout_inner = inner.clone();
        let all_done = inner.recovery.begin(inner.cfg.recovery_timeout, move || {
            timeout_inner.fence_pending_recov();
        });
        if all_done {
            inner.finished_recovery();
        }
    }
    Ok(())
}

fn spawn_worker(name: &str, f: impl FnOnce() + Send + 'static) -> JoinHandle<()> {
    std::thread::Builder::new()
        .name(format!("blockhouse-{name}"))
        .spawn(f)
        .expect("spawn worker thread")
}

pub struct Server {
    inner: Arc<ServerInner>,
    addr: SocketAddr,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl Server {
    pub fn start(cfg: ServerConfig) -> Result<Server> {
        let dev = OpenOptions::new().read(true).write(true).open(&cfg.device)?;
        let sup = read_super_from(&dev)?;
        if sup.magic != SUPER_MAGIC || sup.format_vers != FORMAT_VERS {
            return Err(Error::Invalid);
        }

        let block = BlockLayer::new(dev, sup.hdr.fsid, sup.hdr.seq + 1, sup.total_meta_blocks);
        let meta = MetaAlloc::new();

        // run on the larger bank first; the smaller one sits idle until the
        // first commit lands
        let other_ind =
            if sup.server_meta_avail[0].total_nr < sup.server_meta_avail[1].total_nr { 0 } else { 1 };
        meta.load_bank(&sup.server_meta_avail[other_ind ^ 1], &sup.server_meta_freed[other_ind ^ 1]);
        let avail_idx = if sup.meta_alloc[1].total_len > sup.meta_alloc[0].total_len { 1 } else { 0 };

        let (commit_tx, commit_rx) = unbounded();
        let (farewell_tx, farewell_rx) = unbounded();
        let term = cfg.term;

        let inner = Arc::new(ServerInner {
            fsid: sup.hdr.fsid,
            format_vers: sup.format_vers,
            total_meta_blocks: sup.total_meta_blocks,
            first_meta_blkno: sup.first_meta_blkno,
            total_data_blocks: sup.total_data_blocks,
            first_data_blkno: sup.first_data_blkno,
            term,
            block,
            meta,
            shutting_down: AtomicBool::new(false),
            misc: Mutex::new(MiscState { next_ino: sup.next_ino }),
            allocs: Mutex::new(AllocState {
                meta_alloc: sup.meta_alloc,
                avail_idx,
                data_alloc: sup.data_alloc,
                server_avail: sup.server_meta_avail,
                server_freed: sup.server_meta_freed,
                other_ind,
            }),
            logs: Mutex::new(LogsState { logs_root: sup.logs_root }),
            srch: Mutex::new(SrchState { srch_root: sup.srch_root }),
            mounted: Mutex::new(MountedState { root: sup.mounted_clients }),
            seqs: RwLock::new(SeqState {
                trans_seqs: sup.trans_seqs,
                next_trans_seq: sup.next_trans_seq,
            }),
            fs_root: Mutex::new(sup.fs_root),
            volopt_change: Mutex::new(()),
            volopt: VoloptState {
                staged: Mutex::new(sup.volopt),
                published: ArcSwap::from_pointee(sup.volopt),
            },
            roots: ArcSwap::from_pointee(NetRoots {
                fs_root: sup.fs_root,
                logs_root: sup.logs_root,
                srch_root: sup.srch_root,
            }),
            commit_latch: RwLock::new(()),
            commit_waiters: SegQueue::new(),
            commit_kick: commit_tx,
            recovery: Recovery::new(),
            locks: LockServer::new(),
            omap: OpenMap::new(),
            farewell_pending: Mutex::new(Vec::new()),
            farewell_kick: farewell_tx,
            conns: Conns::new(),
            clients: Mutex::new(HashSet::new()),
            cfg,
        });

        info!(
            fsid = %format_args!("{:#x}", inner.fsid),
            term,
            seq = inner.block.dirty_seq(),
            "server starting"
        );

        if let Err(e) = start_recovery(&inner) {
            error!(err = %e, "error starting recovery, shutting down");
            inner.recovery.shutdown();
            return Err(e);
        }

        let listener = match TcpListener::bind(inner.cfg.bind).and_then(|l| {
            l.set_nonblocking(true)?;
            Ok(l)
        }) {
            Ok(l) => l,
            Err(e) => {
                error!(err = %e, addr = %inner.cfg.bind, "server failed to bind");
                inner.recovery.shutdown();
                return Err(e.into());
            }
        };
        let addr = listener.local_addr()?;

        // join order at shutdown follows this order: farewell flushes
        // first, the commit worker drains last
        let threads = vec![
            spawn_worker("farewell", {
                let i = inner.clone();
                move || farewell_worker(i, farewell_rx)
            }),
            spawn_worker("reclaim", {
                let i = inner.clone();
                move || reclaim_worker(i)
            }),
            spawn_worker("accept", {
                let i = inner.clone();
                move || accept_loop(i, listener)
            }),
            spawn_worker("commit", {
                let i = inner.clone();
                move || commit_worker(i, commit_rx)
            }),
        ];

        info!(%addr, "server ready");
        Ok(Server { inner, addr, threads: Mutex::new(threads) })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn fsid(&self) -> u64 {
        self.inner.fsid
    }

    /// Begin shutdown without waiting; used when the server decides it
    /// can't continue and another mount should take over.
    pub fn abort(&self) {
        self.inner.stop_flag();
    }

    /// Orderly shutdown: farewell work flushes, the reclaimer stops, the
    /// socket closes, outstanding commits drain, then the subsystems are
    /// torn down.
    pub fn stop(self) -> Result<()> {
        self.inner.stop_flag();
        self.inner.conns.shutdown_all();
        self.inner.recovery.shutdown();

        let threads = std::mem::take(&mut *self.threads.lock());
        for handle in threads {
            let _ = handle.join();
        }

        self.inner.cfg.quorum.server_shutdown();
        if self.inner.block.has_dirty() {
            warn!("dropping dirty blocks whose writes never succeeded");
        }
        info!("server stopped");
        Ok(())
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.inner.stop_flag();
    }
}
