//! Pooled entries and their state machine
//!
//! Each entry carries one live connection plus an atomic state word. All
//! state transitions go through compare-and-set; the only plain stores are
//! the two made by an entry's sole owner (requite and unreserve):
//!
//! ```text
//! NOT_IN_USE --borrow(CAS)--> IN_USE --requite(store)--> NOT_IN_USE
//! NOT_IN_USE --reserve(CAS)--> RESERVED --unreserve(store)--> NOT_IN_USE
//! {IN_USE,RESERVED} --remove(CAS)--> REMOVED (terminal)
//! ```

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::driver::Connection;
use crate::timer::TimerHandle;

/// Entry is idle and claimable by borrowers
pub const STATE_NOT_IN_USE: u32 = 0;
/// Entry is checked out by exactly one borrower
pub const STATE_IN_USE: u32 = 1;
/// Entry has been removed from the bag; terminal
pub const STATE_REMOVED: u32 = 2;
/// Entry is exclusively claimed for inspection or removal
pub const STATE_RESERVED: u32 = 3;

/// Human-readable name of a state word value
pub fn state_name(state: u32) -> &'static str {
    match state {
        STATE_NOT_IN_USE => "not-in-use",
        STATE_IN_USE => "in-use",
        STATE_REMOVED => "removed",
        STATE_RESERVED => "reserved",
        _ => "unknown",
    }
}

static CLOCK_BASE: OnceLock<Instant> = OnceLock::new();

/// Milliseconds on the process-wide monotonic clock
///
/// Wall clocks can step backwards; last-access stamps must not.
pub(crate) fn now_millis() -> u64 {
    CLOCK_BASE.get_or_init(Instant::now).elapsed().as_millis() as u64
}

/// A pooled item wrapping one live database session
pub struct PoolEntry {
    connection: Mutex<Option<Box<dyn Connection>>>,
    state: AtomicU32,
    /// Monotonic millis of the last successful requite
    last_access: AtomicU64,
    evicted: AtomicBool,
    aborted: AtomicBool,
    max_life_timer: Mutex<Option<TimerHandle>>,
    created_at: Instant,
    id: u64,
}

impl PoolEntry {
    /// Wrap a freshly opened connection; published in state NOT_IN_USE
    pub fn new(connection: Box<dyn Connection>, id: u64) -> Self {
        Self {
            connection: Mutex::new(Some(connection)),
            state: AtomicU32::new(STATE_NOT_IN_USE),
            last_access: AtomicU64::new(now_millis()),
            evicted: AtomicBool::new(false),
            aborted: AtomicBool::new(false),
            max_life_timer: Mutex::new(None),
            created_at: Instant::now(),
            id,
        }
    }

    /// Entry identifier, unique within its pool
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Current state word
    pub fn state(&self) -> u32 {
        self.state.load(Ordering::Acquire)
    }

    /// CAS NOT_IN_USE -> IN_USE; the winning borrower owns the entry
    pub fn try_claim(&self) -> bool {
        self.state
            .compare_exchange(
                STATE_NOT_IN_USE,
                STATE_IN_USE,
                Ordering::AcqRel,
                Ordering::Relaxed,
            )
            .is_ok()
    }

    /// Owner-only store IN_USE -> NOT_IN_USE on requite
    pub fn set_not_in_use(&self) {
        self.state.store(STATE_NOT_IN_USE, Ordering::Release);
    }

    /// CAS NOT_IN_USE -> RESERVED for exclusive inspection
    pub fn try_reserve(&self) -> bool {
        self.state
            .compare_exchange(
                STATE_NOT_IN_USE,
                STATE_RESERVED,
                Ordering::AcqRel,
                Ordering::Relaxed,
            )
            .is_ok()
    }

    /// Owner-only store RESERVED -> NOT_IN_USE
    pub fn set_unreserved(&self) {
        self.state.store(STATE_NOT_IN_USE, Ordering::Release);
    }

    /// CAS IN_USE or RESERVED -> REMOVED; competing callers lose
    ///
    /// A plain NOT_IN_USE entry cannot be removed: callers must reserve it
    /// first so a concurrent borrower cannot claim a dying entry.
    pub fn try_remove(&self) -> bool {
        self.state
            .compare_exchange(
                STATE_IN_USE,
                STATE_REMOVED,
                Ordering::AcqRel,
                Ordering::Relaxed,
            )
            .is_ok()
            || self
                .state
                .compare_exchange(
                    STATE_RESERVED,
                    STATE_REMOVED,
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                )
                .is_ok()
    }

    /// Whether the entry has reached its terminal state
    pub fn is_removed(&self) -> bool {
        self.state() == STATE_REMOVED
    }

    /// Mark for destruction at the next release or sweep
    pub fn mark_evicted(&self) {
        self.evicted.store(true, Ordering::Release);
    }

    /// Whether the entry must be destroyed instead of recycled
    pub fn is_evicted(&self) -> bool {
        self.evicted.load(Ordering::Acquire)
    }

    /// Mark as forcibly terminated
    pub fn mark_aborted(&self) {
        self.aborted.store(true, Ordering::Release);
    }

    /// Whether the underlying session was severed
    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }

    /// Stamp the last-access clock; monotonically non-decreasing
    pub fn touch(&self) {
        self.last_access.fetch_max(now_millis(), Ordering::AcqRel);
    }

    /// Monotonic millis of the last successful requite
    pub fn last_access(&self) -> u64 {
        self.last_access.load(Ordering::Acquire)
    }

    /// Time since the last successful requite
    pub fn idle_duration(&self) -> Duration {
        Duration::from_millis(now_millis().saturating_sub(self.last_access()))
    }

    /// Time since the underlying connection was opened
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Attach the cancel handle of this entry's lifetime one-shot
    pub fn set_max_life_timer(&self, handle: TimerHandle) {
        *self.max_life_timer.lock() = Some(handle);
    }

    /// Cancel the lifetime one-shot, if any
    pub fn cancel_max_life_timer(&self) {
        if let Some(handle) = self.max_life_timer.lock().take() {
            handle.cancel();
        }
    }

    /// Run `f` against the live connection, if it is still present
    pub fn with_connection<R>(&self, f: impl FnOnce(&mut dyn Connection) -> R) -> Option<R> {
        let mut guard = self.connection.lock();
        guard.as_mut().map(|conn| f(conn.as_mut()))
    }

    /// Take ownership of the connection for the close path
    ///
    /// At most one caller ever receives `Some`; this is what makes close
    /// idempotent.
    pub fn take_connection(&self) -> Option<Box<dyn Connection>> {
        self.connection.lock().take()
    }
}

impl fmt::Debug for PoolEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolEntry")
            .field("id", &self.id)
            .field("state", &state_name(self.state()))
            .field("evicted", &self.is_evicted())
            .field("aborted", &self.is_aborted())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;

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

    fn entry() -> PoolEntry {
        PoolEntry::new(Box::new(NoopConnection), 1)
    }

    #[test]
    fn test_claim_and_requite_round_trip() {
        let e = entry();
        assert_eq!(e.state(), STATE_NOT_IN_USE);

        assert!(e.try_claim());
        assert_eq!(e.state(), STATE_IN_USE);

        // second claim must lose
        assert!(!e.try_claim());

        e.set_not_in_use();
        assert!(e.try_claim());
    }

    #[test]
    fn test_reserve_blocks_claim() {
        let e = entry();
        assert!(e.try_reserve());
        assert_eq!(e.state(), STATE_RESERVED);
        assert!(!e.try_claim());
        assert!(!e.try_reserve());

        e.set_unreserved();
        assert!(e.try_claim());
    }

    #[test]
    fn test_remove_requires_claim_or_reserve() {
        let e = entry();
        // plain NOT_IN_USE cannot be removed
        assert!(!e.try_remove());

        assert!(e.try_reserve());
        assert!(e.try_remove());
        assert!(e.is_removed());

        // terminal: nothing transitions out of REMOVED
        assert!(!e.try_claim());
        assert!(!e.try_reserve());
        assert!(!e.try_remove());
    }

    #[test]
    fn test_remove_from_in_use() {
        let e = entry();
        assert!(e.try_claim());
        assert!(e.try_remove());
        assert!(e.is_removed());
    }

    #[test]
    fn test_touch_is_monotonic() {
        let e = entry();
        let before = e.last_access();
        std::thread::sleep(Duration::from_millis(5));
        e.touch();
        assert!(e.last_access() >= before);
    }

    #[test]
    fn test_take_connection_is_exactly_once() {
        let e = entry();
        assert!(e.take_connection().is_some());
        assert!(e.take_connection().is_none());
        assert!(e.with_connection(|_| ()).is_none());
    }

    #[test]
    fn test_flags() {
        let e = entry();
        assert!(!e.is_evicted());
        assert!(!e.is_aborted());
        e.mark_evicted();
        e.mark_aborted();
        assert!(e.is_evicted());
        assert!(e.is_aborted());
    }
}
