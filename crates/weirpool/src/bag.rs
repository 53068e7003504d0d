//! Lock-light concurrent bag of pooled entries
//!
//! A specialized MPMC container that hands entries to borrowers with minimal
//! contention:
//!
//! - a **shared list** (`RwLock<Vec<Arc<PoolEntry>>>`) holding every
//!   reachable entry; append-mostly, unlinked explicitly on remove;
//! - a **per-thread cache** of weak references to recently handled entries,
//!   giving repeat borrowers a contention-free fast path;
//! - a **handoff rendezvous** — a zero-capacity channel on which returners
//!   offer entries directly to a blocked borrower;
//! - an atomic **waiter count** of threads currently blocked in borrow.
//!
//! Entry ownership is arbitrated exclusively by the CAS on each entry's
//! state word; the rendezvous channel carries no ownership, so a receiver
//! must still win the CAS. A CAS loss is not an error anywhere in this
//! module; the loser keeps scanning.

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use parking_lot::RwLock;
use tracing::warn;

use crate::entry::PoolEntry;
use crate::error::{Error, Result};

/// Spin-yield budget a returner spends offering to a blocked borrower
/// before falling back to its thread cache.
const HANDOFF_SPINS: usize = 256;

/// Upper bound on a single blocking wait. Waking periodically re-scans the
/// shared list and re-signals demand, so a borrower whose demand signal was
/// coalesced away cannot sleep through its whole budget.
const HANDOFF_POLL: Duration = Duration::from_millis(200);

static NEXT_BAG_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    /// Recently handled entries, keyed by bag identity. Weak references so
    /// the cache never pins a removed entry alive.
    static BORROW_CACHE: RefCell<HashMap<u64, Vec<Weak<PoolEntry>>>> =
        RefCell::new(HashMap::new());
}

/// Demand callback invoked when a borrower is about to block
pub trait BagStateListener: Send + Sync {
    /// Called exactly once per borrow attempt that would otherwise block
    fn add_bag_item(&self);
}

/// Lock-light MPMC container for pooled entries
pub struct ConcurrentBag {
    id: u64,
    shared: RwLock<Vec<Arc<PoolEntry>>>,
    handoff_tx: RwLock<Option<Sender<Arc<PoolEntry>>>>,
    handoff_rx: Receiver<Arc<PoolEntry>>,
    waiters: AtomicUsize,
    closed: AtomicBool,
    listener: OnceLock<Weak<dyn BagStateListener>>,
}

impl ConcurrentBag {
    /// Create an empty bag
    pub fn new() -> Self {
        let (tx, rx) = bounded(0);
        Self {
            id: NEXT_BAG_ID.fetch_add(1, Ordering::Relaxed),
            shared: RwLock::new(Vec::new()),
            handoff_tx: RwLock::new(Some(tx)),
            handoff_rx: rx,
            waiters: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            listener: OnceLock::new(),
        }
    }

    /// Attach the demand listener; only the first call takes effect
    pub fn set_listener(&self, listener: Weak<dyn BagStateListener>) {
        let _ = self.listener.set(listener);
    }

    /// Borrow an entry, waiting up to `timeout`
    ///
    /// A zero timeout performs exactly one non-blocking pass. On success the
    /// entry is IN_USE and cached for this thread.
    pub fn borrow(&self, timeout: Duration) -> Result<Arc<PoolEntry>> {
        if let Some(entry) = self.claim_from_thread_cache() {
            return Ok(entry);
        }

        self.waiters.fetch_add(1, Ordering::AcqRel);
        let result = self.borrow_slow(timeout);
        self.waiters.fetch_sub(1, Ordering::AcqRel);
        result
    }

    fn claim_from_thread_cache(&self) -> Option<Arc<PoolEntry>> {
        BORROW_CACHE.with(|cache| {
            let mut map = cache.borrow_mut();
            let list = map.get_mut(&self.id)?;
            let mut i = list.len();
            while i > 0 {
                i -= 1;
                match list[i].upgrade() {
                    None => {
                        list.swap_remove(i);
                    }
                    Some(entry) => {
                        if entry.try_claim() {
                            return Some(entry);
                        }
                    }
                }
            }
            None
        })
    }

    fn borrow_slow(&self, timeout: Duration) -> Result<Arc<PoolEntry>> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.closed.load(Ordering::Acquire) {
                return Err(Error::Closed);
            }

            let mut claimed = None;
            {
                // first eligible entry in iteration order wins; unfair on
                // purpose, recently added entries stay cache-warm
                let shared = self.shared.read();
                for entry in shared.iter() {
                    if entry.try_claim() {
                        claimed = Some(entry.clone());
                        break;
                    }
                }
            }
            if let Some(entry) = claimed {
                self.cache_locally(&entry);
                return Ok(entry);
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(Error::timeout(format!(
                    "borrow timed out after {}ms",
                    timeout.as_millis()
                )));
            }

            // about to block: signal demand, once per attempt
            self.notify_listener();

            match self.handoff_rx.recv_timeout(remaining.min(HANDOFF_POLL)) {
                Ok(entry) => {
                    // a competing borrower may have claimed the handed
                    // entry through a list scan
                    if entry.try_claim() {
                        self.cache_locally(&entry);
                        return Ok(entry);
                    }
                }
                Err(RecvTimeoutError::Timeout) => {
                    if Instant::now() >= deadline {
                        return Err(Error::timeout(format!(
                            "borrow timed out after {}ms",
                            timeout.as_millis()
                        )));
                    }
                }
                Err(RecvTimeoutError::Disconnected) => return Err(Error::Closed),
            }
        }
    }

    /// Return a borrowed entry to the bag
    ///
    /// Stamps the last-access clock, releases the claim, then offers the
    /// entry to a blocked borrower for a bounded number of spin-yields
    /// before parking it in this thread's cache.
    pub fn requite(&self, entry: Arc<PoolEntry>) {
        entry.touch();
        entry.set_not_in_use();

        if self.waiters.load(Ordering::Acquire) > 0 {
            // clone the sender out so the guard is not held across the spin
            let tx = self.handoff_tx.read().clone();
            if let Some(tx) = tx {
                let mut entry = entry;
                for _ in 0..HANDOFF_SPINS {
                    if self.waiters.load(Ordering::Acquire) == 0 {
                        break;
                    }
                    match tx.try_send(entry) {
                        Ok(()) => return,
                        Err(TrySendError::Full(back)) => {
                            entry = back;
                            std::thread::yield_now();
                        }
                        Err(TrySendError::Disconnected(back)) => {
                            entry = back;
                            break;
                        }
                    }
                }
                self.cache_locally(&entry);
                return;
            }
        }

        self.cache_locally(&entry);
    }

    /// Publish a new entry; it must be in state NOT_IN_USE
    pub fn add(&self, entry: Arc<PoolEntry>) {
        self.shared.write().push(entry.clone());

        // spur a blocked borrower; receivers still have to win the CAS
        if self.waiters.load(Ordering::Acquire) > 0 {
            let tx = self.handoff_tx.read().clone();
            if let Some(tx) = tx {
                let _ = tx.try_send(entry);
            }
        }
    }

    /// Remove an entry permanently; true when this caller won the removal
    ///
    /// The entry must be IN_USE or RESERVED. A NOT_IN_USE entry cannot be
    /// removed directly: reserve it first so no borrower can claim a dying
    /// entry.
    pub fn remove(&self, entry: &Arc<PoolEntry>) -> bool {
        if !entry.try_remove() {
            if !self.closed.load(Ordering::Acquire) {
                warn!(
                    entry_id = entry.id(),
                    "attempt to remove an entry that was not borrowed or reserved"
                );
            }
            return false;
        }

        let mut shared = self.shared.write();
        if let Some(pos) = shared.iter().position(|e| Arc::ptr_eq(e, entry)) {
            shared.remove(pos);
        }
        true
    }

    /// Claim an idle entry for exclusive inspection
    pub fn reserve(&self, entry: &Arc<PoolEntry>) -> bool {
        entry.try_reserve()
    }

    /// Release a reservation and re-offer the entry to any waiter
    pub fn unreserve(&self, entry: &Arc<PoolEntry>) {
        entry.set_unreserved();

        if self.waiters.load(Ordering::Acquire) > 0 {
            let tx = self.handoff_tx.read().clone();
            if let Some(tx) = tx {
                let _ = tx.try_send(entry.clone());
            }
        }
    }

    /// Weakly-consistent snapshot of entries currently in `state`
    pub fn values(&self, state: u32) -> Vec<Arc<PoolEntry>> {
        self.shared
            .read()
            .iter()
            .filter(|e| e.state() == state)
            .cloned()
            .collect()
    }

    /// Number of reachable entries
    pub fn len(&self) -> usize {
        self.shared.read().len()
    }

    /// Whether the bag holds no entries
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of reachable entries currently in `state`
    pub fn count(&self, state: u32) -> usize {
        self.shared
            .read()
            .iter()
            .filter(|e| e.state() == state)
            .count()
    }

    /// Number of threads currently blocked in [`ConcurrentBag::borrow`]
    pub fn waiter_count(&self) -> usize {
        self.waiters.load(Ordering::Acquire)
    }

    /// Close the bag: fail new borrows and wake blocked ones
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        // dropping the sender disconnects the rendezvous; blocked
        // borrowers observe it and surface pool shutdown
        self.handoff_tx.write().take();
    }

    fn cache_locally(&self, entry: &Arc<PoolEntry>) {
        BORROW_CACHE.with(|cache| {
            let mut map = cache.borrow_mut();
            let list = map.entry(self.id).or_default();
            list.retain(|w| w.strong_count() > 0);
            let already_cached = list
                .iter()
                .any(|w| w.upgrade().is_some_and(|e| Arc::ptr_eq(&e, entry)));
            if !already_cached {
                list.push(Arc::downgrade(entry));
            }
        });
    }

    fn notify_listener(&self) {
        if let Some(listener) = self.listener.get().and_then(Weak::upgrade) {
            listener.add_bag_item();
        }
    }
}

impl Default for ConcurrentBag {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::Connection;
    use crate::entry::{STATE_IN_USE, STATE_NOT_IN_USE, STATE_RESERVED};
    use std::thread;

    struct NoopConnection;

    impl Connection for NoopConnection {
        fn is_valid(&mut self, _timeout: Duration) -> Result<bool> {
            Ok(true)
        }

        fn execute(&mut self, _sql: &str, _timeout: Duration) -> Result<()> {
            Ok(())
        }

        fn close(&mut self) -> Result<()> {
            Ok(())
        }
    }

    fn entry(id: u64) -> Arc<PoolEntry> {
        Arc::new(PoolEntry::new(Box::new(NoopConnection), id))
    }

    #[test]
    fn test_add_then_borrow() {
        let bag = ConcurrentBag::new();
        bag.add(entry(1));

        let borrowed = bag.borrow(Duration::ZERO).unwrap();
        assert_eq!(borrowed.state(), STATE_IN_USE);
        assert_eq!(borrowed.id(), 1);
    }

    #[test]
    fn test_borrow_empty_times_out() {
        let bag = ConcurrentBag::new();

        let err = bag.borrow(Duration::from_millis(20)).unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }));
    }

    #[test]
    fn test_zero_timeout_is_non_blocking() {
        let bag = ConcurrentBag::new();

        let start = Instant::now();
        let err = bag.borrow(Duration::ZERO).unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }));
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[test]
    fn test_requite_then_borrow_hits_thread_cache() {
        let bag = ConcurrentBag::new();
        bag.add(entry(1));

        let first = bag.borrow(Duration::ZERO).unwrap();
        bag.requite(first.clone());

        let second = bag.borrow(Duration::ZERO).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_remove_requires_reserve_or_claim() {
        let bag = ConcurrentBag::new();
        let e = entry(1);
        bag.add(e.clone());

        // idle entries cannot be removed directly
        assert!(!bag.remove(&e));
        assert_eq!(bag.len(), 1);

        assert!(bag.reserve(&e));
        assert!(bag.remove(&e));
        assert_eq!(bag.len(), 0);
        assert!(e.is_removed());
    }

    #[test]
    fn test_competing_remove_loses() {
        let bag = ConcurrentBag::new();
        let e = entry(1);
        bag.add(e.clone());

        assert!(bag.reserve(&e));
        assert!(bag.remove(&e));
        assert!(!bag.remove(&e));
    }

    #[test]
    fn test_reserve_unreserve_cycle() {
        let bag = ConcurrentBag::new();
        let e = entry(1);
        bag.add(e.clone());

        assert!(bag.reserve(&e));
        assert_eq!(e.state(), STATE_RESERVED);
        // a reserved entry is invisible to borrowers
        assert!(bag.borrow(Duration::ZERO).is_err());

        bag.unreserve(&e);
        assert_eq!(e.state(), STATE_NOT_IN_USE);
        assert!(bag.borrow(Duration::ZERO).is_ok());
    }

    #[test]
    fn test_removed_entry_is_never_returned() {
        let bag = ConcurrentBag::new();
        let doomed = entry(1);
        bag.add(doomed.clone());
        bag.add(entry(2));

        assert!(bag.reserve(&doomed));
        assert!(bag.remove(&doomed));

        for _ in 0..10 {
            let borrowed = bag.borrow(Duration::ZERO).unwrap();
            assert_eq!(borrowed.id(), 2);
            bag.requite(borrowed);
        }
    }

    #[test]
    fn test_values_snapshot_filters_by_state() {
        let bag = ConcurrentBag::new();
        bag.add(entry(1));
        bag.add(entry(2));
        bag.add(entry(3));

        let borrowed = bag.borrow(Duration::ZERO).unwrap();
        assert_eq!(bag.values(STATE_IN_USE).len(), 1);
        assert_eq!(bag.values(STATE_NOT_IN_USE).len(), 2);
        assert_eq!(bag.count(STATE_IN_USE), 1);
        assert_eq!(bag.count(STATE_NOT_IN_USE), 2);
        bag.requite(borrowed);
    }

    #[test]
    fn test_concurrent_claims_are_mutually_exclusive() {
        let bag = Arc::new(ConcurrentBag::new());
        bag.add(entry(1));

        let mut handles = vec![];
        for _ in 0..8 {
            let bag = bag.clone();
            handles.push(thread::spawn(move || bag.borrow(Duration::ZERO).is_ok()));
        }

        let successes = handles
            .into_iter()
            .map(|h| h.join().unwrap_or(false))
            .filter(|v| *v)
            .count();
        assert_eq!(successes, 1, "exactly one borrower may win the entry");
    }

    #[test]
    fn test_handoff_wakes_blocked_borrower() {
        let bag = Arc::new(ConcurrentBag::new());
        let e = entry(1);
        bag.add(e.clone());
        let held = bag.borrow(Duration::ZERO).unwrap();

        let borrower_bag = bag.clone();
        let borrower = thread::spawn(move || {
            let start = Instant::now();
            let result = borrower_bag.borrow(Duration::from_secs(5));
            (result, start.elapsed())
        });

        // wait for the borrower to block, then requite
        while bag.waiter_count() == 0 {
            thread::yield_now();
        }
        thread::sleep(Duration::from_millis(20));
        bag.requite(held);

        let (result, waited) = borrower.join().unwrap();
        let received = result.unwrap();
        assert!(Arc::ptr_eq(&received, &e));
        assert!(
            waited < Duration::from_secs(1),
            "handoff should beat the timeout by a wide margin, waited {waited:?}"
        );
    }

    #[test]
    fn test_waiter_count_visible_while_blocked() {
        let bag = Arc::new(ConcurrentBag::new());

        let borrower_bag = bag.clone();
        let borrower = thread::spawn(move || {
            let _ = borrower_bag.borrow(Duration::from_millis(300));
        });

        while bag.waiter_count() == 0 {
            thread::yield_now();
        }
        assert_eq!(bag.waiter_count(), 1);
        borrower.join().unwrap();
        assert_eq!(bag.waiter_count(), 0);
    }

    #[test]
    fn test_listener_signalled_when_blocking() {
        struct CountingListener(AtomicUsize);

        impl BagStateListener for CountingListener {
            fn add_bag_item(&self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let bag = ConcurrentBag::new();
        let listener = Arc::new(CountingListener(AtomicUsize::new(0)));
        let listener_dyn: Arc<dyn BagStateListener> = listener.clone();
        let weak: Weak<dyn BagStateListener> = Arc::downgrade(&listener_dyn);
        bag.set_listener(weak);

        // zero-timeout pass never blocks, so it never signals demand
        let _ = bag.borrow(Duration::ZERO);
        assert_eq!(listener.0.load(Ordering::SeqCst), 0);

        let _ = bag.borrow(Duration::from_millis(20));
        assert!(listener.0.load(Ordering::SeqCst) >= 1);
    }

    #[test]
    fn test_close_wakes_blocked_borrower_with_closed() {
        let bag = Arc::new(ConcurrentBag::new());

        let borrower_bag = bag.clone();
        let borrower = thread::spawn(move || borrower_bag.borrow(Duration::from_secs(10)));

        while bag.waiter_count() == 0 {
            thread::yield_now();
        }
        bag.close();

        let err = borrower.join().unwrap().unwrap_err();
        assert!(matches!(err, Error::Closed));
    }

    #[test]
    fn test_borrow_after_close_fails() {
        let bag = ConcurrentBag::new();
        bag.add(entry(1));
        bag.close();

        // note: the thread-cache fast path is bypassed because this thread
        // never handled the entry
        let err = bag.borrow(Duration::from_millis(10)).unwrap_err();
        assert!(matches!(err, Error::Closed));
    }

    #[test]
    fn test_concurrent_churn_preserves_exclusivity() {
        const THREADS: usize = 8;
        const ITERATIONS: usize = 200;
        const ENTRIES: usize = 4;

        let bag = Arc::new(ConcurrentBag::new());
        let entries: Vec<_> = (0..ENTRIES as u64).map(entry).collect();
        for e in &entries {
            bag.add(e.clone());
        }
        let in_flight: Arc<Vec<AtomicUsize>> =
            Arc::new((0..ENTRIES).map(|_| AtomicUsize::new(0)).collect());

        let mut handles = vec![];
        for _ in 0..THREADS {
            let bag = bag.clone();
            let entries = entries.clone();
            let in_flight = in_flight.clone();
            handles.push(thread::spawn(move || {
                for _ in 0..ITERATIONS {
                    let borrowed = bag.borrow(Duration::from_secs(10)).unwrap();
                    let idx = entries
                        .iter()
                        .position(|e| Arc::ptr_eq(e, &borrowed))
                        .unwrap();
                    let prev = in_flight[idx].fetch_add(1, Ordering::SeqCst);
                    assert_eq!(prev, 0, "entry {idx} was borrowed by two threads at once");
                    in_flight[idx].fetch_sub(1, Ordering::SeqCst);
                    bag.requite(borrowed);
                }
            }));
        }

        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(bag.len(), ENTRIES);
        assert_eq!(bag.count(STATE_IN_USE), 0);
        assert_eq!(bag.waiter_count(), 0);
    }
}
