//! Recovery window tracking.
//!
//! A new server waits for every client that was mounted under the previous
//! server to make itself known again.  Each subsystem marks its recovery
//! step complete per rid; rids that don't finish every step inside the
//! global timeout are handed to the fence subsystem.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::info;

pub const RECOV_GREETING: u8 = 1 << 0;
pub const RECOV_LOCKS: u8 = 1 << 1;
pub const RECOV_ALL: u8 = RECOV_GREETING | RECOV_LOCKS;

pub struct Recovery {
    shared: Arc<Shared>,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

struct Shared {
    state: Mutex<State>,
    cond: Condvar,
}

struct State {
    pending: BTreeMap<u64, u8>,
    begun: bool,
    shutdown: bool,
}

impl Recovery {
    pub fn new() -> Recovery {
        Recovery {
            shared: Arc::new(Shared {
                state: Mutex::new(State { pending: BTreeMap::new(), begun: false, shutdown: false }),
                cond: Condvar::new(),
            }),
            watcher: Mutex::new(None),
        }
    }

    pub fn prepare(&self, rid: u64, which: u8) {
        let mut st = self.shared.state.lock();
        *st.pending.entry(rid).or_insert(0) |= which;
    }

    /// Arm the recovery window.  Returns true when nothing is pending, in
    /// which case no watcher is started and the caller proceeds directly.
    pub fn begin(&self, timeout: Duration, on_timeout: impl FnOnce() + Send + 'static) -> bool {
        {
            let mut st = self.shared.state.lock();
            if st.pending.is_empty() {
                return true;
            }
            st.begun = true;
        }

        let shared = self.shared.clone();
        let handle = std::thread::Builder::new()
            .name("recovery-timeout".into())
            .spawn(move || {
                let deadline = Instant::now() + timeout;
                let mut st = shared.state.lock();
                while !st.pending.is_empty() && !st.shutdown {
                    if shared.cond.wait_until(&mut st, deadline).timed_out() {
                        break;
                    }
                }
                let expired = !st.pending.is_empty() && !st.shutdown;
                drop(st);
                if expired {
                    on_timeout();
                }
            })
            .expect("spawn recovery watcher");
        *self.watcher.lock() = Some(handle);
        false
    }

    /// Mark steps finished for a rid.  Returns true when this completed the
    /// last pending rid of an armed window.
    pub fn finish(&self, rid: u64, which: u8) -> bool {
        let mut st = self.shared.state.lock();
        let Some(bits) = st.pending.get_mut(&rid) else {
            return false;
        };
        *bits &= !which;
        if *bits == 0 {
            st.pending.remove(&rid);
            info!(rid = %format_args!("{rid:016x}"), "client finished recovery");
        }
        let done = st.begun && st.pending.is_empty();
        if done {
            st.begun = false;
            self.shared.cond.notify_all();
        }
        done
    }

    /// Iterate rids still pending, starting after `prev` (pass 0 first).
    pub fn next_pending(&self, prev: u64) -> Option<u64> {
        self.shared
            .state
            .lock()
            .pending
            .range((Bound::Excluded(prev), Bound::Unbounded))
            .next()
            .map(|(&rid, _)| rid)
    }

    pub fn shutdown(&self) {
        {
            let mut st = self.shared.state.lock();
            st.shutdown = true;
        }
        self.shared.cond.notify_all();
        if let Some(handle) = self.watcher.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Default for Recovery {
    fn default() -> Self {
        Recovery::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn finishing_all_steps_completes() {
        let recov = Recovery::new();
        recov.prepare(1, RECOV_ALL);
        recov.prepare(2, RECOV_ALL);
        assert!(!recov.begin(Duration::from_secs(60), || panic!("no timeout expected")));

        assert!(!recov.finish(1, RECOV_GREETING));
        assert!(!recov.finish(1, RECOV_LOCKS));
        assert!(!recov.finish(2, RECOV_GREETING));
        assert!(recov.finish(2, RECOV_LOCKS));

        // unknown rids are ignored
        assert!(!recov.finish(3, RECOV_ALL));
        recov.shutdown();
    }

    #[test]
    fn timeout_fires_with_pending_rids() {
        let recov = Recovery::new();
        let fired = Arc::new(AtomicBool::new(false));
        recov.prepare(7, RECOV_ALL);

        let f = fired.clone();
        assert!(!recov.begin(Duration::from_millis(50), move || {
            f.store(true, Ordering::SeqCst);
        }));

        std::thread::sleep(Duration::from_millis(200));
        assert!(fired.load(Ordering::SeqCst));
        assert_eq!(recov.next_pending(0), Some(7));
        recov.shutdown();
    }

    #[test]
    fn empty_window_needs_no_watcher() {
        let recov = Recovery::new();
        assert!(recov.begin(Duration::from_millis(10), || panic!("never")));
        recov.shutdown();
    }
}
