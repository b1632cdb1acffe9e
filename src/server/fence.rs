//! Fencing seam.
//!
//! Fencing guarantees a departed or unresponsive client cannot touch the
//! shared device again; it is a precondition for reclaiming the client's
//! state.  The mechanism itself is deployment-specific, so the server only
//! depends on this trait.  A fenced rid stays visible through `next_fenced`
//! until `free` is called after a successful reclaim.

use std::collections::VecDeque;

use parking_lot::Mutex;
use tracing::info;

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FenceReason {
    /// The client missed the recovery window.
    ClientRecovery,
    /// A stale leader block was fenced; its quorum leader record must be
    /// cleared during reclaim.
    QuorumBlockLeader,
}

pub trait Fencer: Send + Sync {
    fn start(&self, rid: u64, reason: FenceReason) -> Result<()>;
    fn next_fenced(&self) -> Result<Option<(u64, FenceReason)>>;
    fn free(&self, rid: u64);
}

/// Default single-host fencer: a requested fence completes immediately
/// because there is no other path to the device to cut off.
pub struct FenceQueue {
    fenced: Mutex<VecDeque<(u64, FenceReason)>>,
}

impl FenceQueue {
    pub fn new() -> FenceQueue {
        FenceQueue { fenced: Mutex::new(VecDeque::new()) }
    }
}

impl Default for FenceQueue {
    fn default() -> Self {
        FenceQueue::new()
    }
}

impl Fencer for FenceQueue {
    fn start(&self, rid: u64, reason: FenceReason) -> Result<()> {
        let mut fenced = self.fenced.lock();
        if !fenced.iter().any(|&(r, _)| r == rid) {
            info!(rid = %format_args!("{rid:016x}"), ?reason, "fenced client");
            fenced.push_back((rid, reason));
        }
        Ok(())
    }

    fn next_fenced(&self) -> Result<Option<(u64, FenceReason)>> {
        Ok(self.fenced.lock().front().copied())
    }

    fn free(&self, rid: u64) {
        self.fenced.lock().retain(|&(r, _)| r != rid);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fenced_rids_stay_until_freed() {
        let q = FenceQueue::new();
        q.start(5, FenceReason::ClientRecovery).unwrap();
        q.start(5, FenceReason::ClientRecovery).unwrap();
        assert_eq!(q.next_fenced().unwrap(), Some((5, FenceReason::ClientRecovery)));
        assert_eq!(q.next_fenced().unwrap(), Some((5, FenceReason::ClientRecovery)));
        q.free(5);
        assert_eq!(q.next_fenced().unwrap(), None);
    }
}
