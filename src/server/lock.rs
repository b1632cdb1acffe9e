//! Lock-server seam.
//!
//! The distributed lock protocol (grant queues, invalidation, recovery
//! hand-off) is a separate subsystem; the server core only needs the hooks
//! it calls around client lifecycle and a place to route `LOCK` traffic.
//! This default implementation tracks which keys each rid holds and grants
//! every request, which is sufficient for a single active writer per key
//! range arbitrated elsewhere.

use std::collections::{HashMap, HashSet};

use parking_lot::Mutex;
use tracing::trace;

use crate::error::Result;
use crate::format::{Key, NetLock, NetLockRecover, LOCK_MODE_NULL};

pub struct LockServer {
    grants: Mutex<HashMap<u64, HashSet<(u8, u64, u64)>>>,
}

impl LockServer {
    pub fn new() -> LockServer {
        LockServer { grants: Mutex::new(HashMap::new()) }
    }

    pub fn greeting(&self, rid: u64) -> Result<()> {
        self.grants.lock().entry(rid).or_default();
        Ok(())
    }

    /// Release everything a departing client held.
    pub fn farewell(&self, rid: u64) -> Result<()> {
        self.grants.lock().remove(&rid);
        Ok(())
    }

    pub fn finished_recovery(&self) -> Result<()> {
        Ok(())
    }

    pub fn request(&self, rid: u64, nl: &NetLock) -> Result<NetLock> {
        let key = (nl.key.zone, nl.key.first, nl.key.second);
        let mut grants = self.grants.lock();
        let held = grants.entry(rid).or_default();
        if nl.new_mode == LOCK_MODE_NULL {
            held.remove(&key);
        } else {
            held.insert(key);
        }
        trace!(rid = %format_args!("{rid:016x}"), new_mode = nl.new_mode, "lock request");
        Ok(*nl)
    }

    pub fn recover(&self, _rid: u64, _key: &Key) -> NetLockRecover {
        NetLockRecover { nr: 0 }
    }

    #[cfg(test)]
    pub fn holds(&self, rid: u64) -> usize {
        self.grants.lock().get(&rid).map(|s| s.len()).unwrap_or(0)
    }
}

impl Default for LockServer {
    fn default() -> Self {
        LockServer::new()
    }
}
