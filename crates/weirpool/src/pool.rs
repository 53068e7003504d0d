//! Pool lifecycle manager
//!
//! Orchestrates borrow/release traffic against the [`ConcurrentBag`], opens
//! and closes real connections, and enforces the freshness policies:
//! min-idle refill, idle timeout, max lifetime with jitter, soft eviction,
//! and forced abort.
//!
//! The borrow/release fast path never blocks on I/O: connection opens run on
//! a dedicated adder thread, blocking closes run on the close executor, and
//! the only suspension point is the bounded wait inside
//! [`ConcurrentBag::borrow`].

use std::backtrace::Backtrace;
use std::fmt;
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::bag::{BagStateListener, ConcurrentBag};
use crate::config::PoolConfig;
use crate::driver::{Connection, Driver};
use crate::entry::{PoolEntry, STATE_IN_USE, STATE_NOT_IN_USE};
use crate::error::{Error, Result};
use crate::exec::{CloseExecutor, SerialExecutor};
use crate::metrics::{AtomicPoolMetrics, PoolMetrics};
use crate::timer::{TimerHandle, TimerWheel};

const POOL_RUNNING: u32 = 0;
const POOL_SHUTDOWN: u32 = 1;

/// Initial retry delay of the adder after a failed open
const ADD_BACKOFF_INITIAL: Duration = Duration::from_millis(200);

/// A high-performance database connection pool
///
/// Create with [`Pool::new`], borrow with [`Pool::get_connection`], and hand
/// the returned [`PooledConnection`] back by dropping it.
pub struct Pool {
    config: PoolConfig,
    driver: Arc<dyn Driver>,
    bag: ConcurrentBag,
    /// Reachable-entry count; signed so an accounting bug is observable
    /// instead of wrapping
    total_connections: AtomicI64,
    state: AtomicU32,
    timer: TimerWheel,
    add_worker: OnceLock<SerialExecutor>,
    close_exec: CloseExecutor,
    housekeeper: Mutex<Option<TimerHandle>>,
    metrics: AtomicPoolMetrics,
    entry_seq: AtomicU64,
    rand_state: AtomicU64,
    self_ref: OnceLock<Weak<Pool>>,
}

impl Pool {
    /// Validate the configuration and start the pool
    ///
    /// Spins up the timer, adder, and closer threads; when `min_idle > 0`
    /// the adder immediately begins filling toward the idle target.
    pub fn new(config: PoolConfig, driver: Arc<dyn Driver>) -> Result<Arc<Self>> {
        config.validate()?;

        let name = config.pool_name.clone();
        let timer = TimerWheel::new(format!("{name} timer"))?;
        let close_threads = config.max_pool_size.clamp(1, 4);
        let close_exec = CloseExecutor::new(&format!("{name} connection closer"), close_threads)?;

        let pool = Arc::new(Self {
            config,
            driver,
            bag: ConcurrentBag::new(),
            total_connections: AtomicI64::new(0),
            state: AtomicU32::new(POOL_RUNNING),
            timer,
            add_worker: OnceLock::new(),
            close_exec,
            housekeeper: Mutex::new(None),
            metrics: AtomicPoolMetrics::new(),
            entry_seq: AtomicU64::new(1),
            rand_state: AtomicU64::new(generate_seed()),
            self_ref: OnceLock::new(),
        });

        let _ = pool.self_ref.set(Arc::downgrade(&pool));

        let listener_arc: Arc<dyn BagStateListener> = pool.clone();
        let listener: Weak<dyn BagStateListener> = Arc::downgrade(&listener_arc);
        pool.bag.set_listener(listener);

        let adder_weak = Arc::downgrade(&pool);
        let adder = SerialExecutor::new(format!("{name} connection adder"), move || {
            if let Some(pool) = adder_weak.upgrade() {
                pool.fill_pool();
            }
        })?;
        let _ = pool.add_worker.set(adder);

        let housekeeper_weak = Arc::downgrade(&pool);
        let handle = pool
            .timer
            .schedule_repeating(pool.config.housekeeping_interval, move || {
                if let Some(pool) = housekeeper_weak.upgrade() {
                    pool.housekeeping();
                }
            });
        *pool.housekeeper.lock() = Some(handle);

        if pool.config.min_idle > 0 {
            pool.signal_add_worker();
        }

        info!(
            pool = %pool.config.pool_name,
            max_pool_size = pool.config.max_pool_size,
            min_idle = pool.config.min_idle,
            "pool started"
        );
        Ok(pool)
    }

    /// Borrow a connection, waiting up to the configured `connection_timeout`
    pub fn get_connection(&self) -> Result<PooledConnection> {
        self.get_connection_timeout(self.config.connection_timeout)
    }

    /// Borrow a connection with an explicit time budget
    ///
    /// The budget covers every retry: an evicted, expired, or dead entry is
    /// closed and the borrow continues with whatever time remains.
    pub fn get_connection_timeout(&self, timeout: Duration) -> Result<PooledConnection> {
        if self.state.load(Ordering::Acquire) != POOL_RUNNING {
            return Err(Error::Closed);
        }

        let start = Instant::now();
        let deadline = start + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let entry = match self.bag.borrow(remaining) {
                Ok(entry) => entry,
                Err(e) => {
                    if matches!(e, Error::Timeout { .. }) {
                        self.metrics.record_timeout();
                    }
                    return Err(e);
                }
            };

            if self.state.load(Ordering::Acquire) != POOL_RUNNING {
                // lost the race with shutdown
                self.close_entry(&entry, "(pool is shutting down)");
                return Err(Error::Closed);
            }

            let lifetime = self.config.max_lifetime;
            if entry.is_evicted() || (!lifetime.is_zero() && entry.age() > lifetime) {
                self.close_entry(&entry, "(connection is evicted or has expired)");
                continue;
            }

            if entry.idle_duration() > self.config.validation_interval
                && !self.validate_entry(&entry)
            {
                self.metrics.record_validation_failure();
                self.close_entry(&entry, "(connection failed liveness check)");
                continue;
            }

            self.metrics.record_borrow(start.elapsed().as_micros() as u64);
            let pool = self
                .self_ref
                .get()
                .and_then(Weak::upgrade)
                .ok_or(Error::Closed)?;
            return Ok(PooledConnection { pool, entry });
        }
    }

    /// Mark every current entry for retirement without interrupting work
    ///
    /// Idle entries close immediately; in-use entries close when released.
    pub fn soft_evict_connections(&self) {
        for entry in self.bag.values(STATE_IN_USE) {
            entry.mark_evicted();
        }
        for entry in self.bag.values(STATE_NOT_IN_USE) {
            if self.bag.reserve(&entry) {
                self.close_entry(&entry, "(connection evicted by user)");
            }
        }
    }

    /// Forcibly sever every in-use connection
    ///
    /// The driver's abort hook runs on the closer threads; errors are
    /// swallowed after logging. Facades over aborted entries fail all
    /// subsequent operations.
    pub fn abort_active_connections(&self) {
        for entry in self.bag.values(STATE_IN_USE) {
            entry.mark_aborted();
            entry.mark_evicted();
            entry.cancel_max_life_timer();

            if let Some(mut conn) = entry.take_connection() {
                let pool_name = self.config.pool_name.clone();
                let entry_id = entry.id();
                self.close_exec.execute(Box::new(move || {
                    if let Err(e) = conn.abort() {
                        warn!(
                            pool = %pool_name,
                            entry_id,
                            error = %e,
                            "error aborting connection, closing instead"
                        );
                        if let Err(e) = conn.close() {
                            debug!(
                                pool = %pool_name,
                                entry_id,
                                error = %e,
                                "error closing aborted connection"
                            );
                        }
                    }
                }));
                self.metrics.record_closed();
            }

            if self.bag.remove(&entry) {
                self.total_connections.fetch_sub(1, Ordering::AcqRel);
            }
        }
    }

    /// Shut the pool down; idempotent
    ///
    /// Wakes blocked borrowers with [`Error::Closed`], retires every entry,
    /// and joins all background threads. After return, every connection the
    /// pool ever opened has received exactly one close or abort.
    pub fn shutdown(&self) {
        if self.state.swap(POOL_SHUTDOWN, Ordering::AcqRel) != POOL_RUNNING {
            return;
        }
        info!(pool = %self.config.pool_name, "shutting down");

        if let Some(handle) = self.housekeeper.lock().take() {
            handle.cancel();
        }
        if let Some(worker) = self.add_worker.get() {
            worker.shutdown();
        }

        self.bag.close();
        self.soft_evict_connections();
        self.abort_active_connections();

        // releases racing shutdown can still requite entries; sweep until
        // the bag drains
        let sweep_deadline = Instant::now() + Duration::from_secs(5);
        while !self.bag.is_empty() && Instant::now() < sweep_deadline {
            for entry in self.bag.values(STATE_NOT_IN_USE) {
                if self.bag.reserve(&entry) {
                    self.close_entry(&entry, "(pool shutdown)");
                }
            }
            if self.bag.is_empty() {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        if !self.bag.is_empty() {
            warn!(
                pool = %self.config.pool_name,
                remaining = self.bag.len(),
                "entries still reachable after shutdown sweep"
            );
        }

        self.timer.shutdown();
        self.close_exec.shutdown();
        self.log_pool_state("after shutdown");
    }

    /// Number of reachable entries
    pub fn total_connections(&self) -> usize {
        self.total_connections.load(Ordering::Acquire).max(0) as usize
    }

    /// Number of idle entries
    pub fn idle_connections(&self) -> usize {
        self.bag.count(STATE_NOT_IN_USE)
    }

    /// Number of borrowed entries
    pub fn active_connections(&self) -> usize {
        self.bag.count(STATE_IN_USE)
    }

    /// Number of threads currently blocked waiting for a connection
    pub fn threads_awaiting_connection(&self) -> usize {
        self.bag.waiter_count()
    }

    /// Snapshot of lifetime counters
    pub fn metrics(&self) -> PoolMetrics {
        self.metrics.snapshot()
    }

    /// Pool name, as used in logs and thread names
    pub fn name(&self) -> &str {
        &self.config.pool_name
    }

    /// Whether the pool accepts borrows
    pub fn is_running(&self) -> bool {
        self.state.load(Ordering::Acquire) == POOL_RUNNING
    }

    // ------------------------------------------------------------------
    // release / close path
    // ------------------------------------------------------------------

    pub(crate) fn release(&self, entry: Arc<PoolEntry>) {
        if entry.is_removed() {
            // already retired by abort or shutdown
            return;
        }
        if entry.is_evicted() || entry.is_aborted() {
            self.close_entry(&entry, "(connection is evicted or aborted)");
        } else {
            self.bag.requite(entry);
        }
    }

    fn close_entry(&self, entry: &Arc<PoolEntry>, reason: &str) {
        entry.cancel_max_life_timer();
        if !self.bag.remove(entry) {
            return;
        }

        let total = self.total_connections.fetch_sub(1, Ordering::AcqRel) - 1;
        if total < 0 {
            warn!(
                pool = %self.config.pool_name,
                total_connections = total,
                backtrace = %Backtrace::force_capture(),
                "internal accounting inconsistency"
            );
        }

        if let Some(mut conn) = entry.take_connection() {
            let pool_name = self.config.pool_name.clone();
            let entry_id = entry.id();
            self.close_exec.execute(Box::new(move || {
                if let Err(e) = conn.close() {
                    debug!(
                        pool = %pool_name,
                        entry_id,
                        error = %e,
                        "error closing connection"
                    );
                }
            }));
            self.metrics.record_closed();
        }
        debug!(
            pool = %self.config.pool_name,
            entry_id = entry.id(),
            reason,
            "closed connection"
        );
    }

    // ------------------------------------------------------------------
    // adder
    // ------------------------------------------------------------------

    fn signal_add_worker(&self) {
        if let Some(worker) = self.add_worker.get() {
            worker.signal();
        }
    }

    /// Fill loop run by the adder thread, one run per coalesced signal
    fn fill_pool(&self) {
        let max = self.config.max_pool_size;
        let min_idle = self.config.min_idle;
        let mut backoff = ADD_BACKOFF_INITIAL;

        while self.state.load(Ordering::Acquire) == POOL_RUNNING
            && self.total_connections() < max
            && (min_idle == 0 || self.idle_connections() < min_idle)
        {
            if self.add_connection() {
                if min_idle == 0 {
                    // one connection suffices to unblock a waiter
                    break;
                }
            } else {
                if min_idle == 0 && self.bag.waiter_count() == 0 {
                    break;
                }
                self.backoff_sleep(backoff);
                backoff = backoff.mul_f64(1.5).min(self.config.connection_timeout / 2);
            }
        }
    }

    fn add_connection(&self) -> bool {
        let max = self.config.max_pool_size as i64;
        if self.total_connections.fetch_add(1, Ordering::AcqRel) >= max {
            self.total_connections.fetch_sub(1, Ordering::AcqRel);
            return false;
        }

        match self.driver.connect() {
            Ok(conn) => {
                let id = self.entry_seq.fetch_add(1, Ordering::Relaxed);
                let entry = Arc::new(PoolEntry::new(conn, id));
                self.schedule_max_life(&entry);
                self.bag.add(entry);
                self.metrics.record_opened();
                debug!(pool = %self.config.pool_name, entry_id = id, "opened connection");
                true
            }
            Err(e) => {
                self.total_connections.fetch_sub(1, Ordering::AcqRel);
                warn!(pool = %self.config.pool_name, error = %e, "failed to open connection");
                false
            }
        }
    }

    /// Sleep that aborts early when the pool stops running
    fn backoff_sleep(&self, total: Duration) {
        let deadline = Instant::now() + total;
        while self.state.load(Ordering::Acquire) == POOL_RUNNING {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            std::thread::sleep(remaining.min(Duration::from_millis(50)));
        }
    }

    // ------------------------------------------------------------------
    // freshness policies
    // ------------------------------------------------------------------

    /// Periodic sweep: retire evicted and idle-expired entries, then top
    /// the pool back up toward min-idle
    fn housekeeping(&self) {
        if self.state.load(Ordering::Acquire) != POOL_RUNNING {
            return;
        }
        self.log_pool_state("before cleanup");

        let idle_timeout = self.config.idle_timeout;
        for entry in self.bag.values(STATE_NOT_IN_USE) {
            if self.bag.reserve(&entry) {
                if entry.is_evicted()
                    || (!idle_timeout.is_zero() && entry.idle_duration() > idle_timeout)
                {
                    self.close_entry(&entry, "(connection is evicted or has idled out)");
                } else {
                    self.bag.unreserve(&entry);
                }
            }
        }

        self.log_pool_state("after cleanup");

        if self.config.min_idle > 0 {
            self.signal_add_worker();
        }
    }

    fn schedule_max_life(&self, entry: &Arc<PoolEntry>) {
        let lifetime = self.config.max_lifetime;
        if lifetime.is_zero() {
            return;
        }

        let weak = Arc::downgrade(entry);
        let handle = self.timer.schedule(self.jittered_lifetime(lifetime), move || {
            if let Some(entry) = weak.upgrade() {
                // the next borrow or housekeeping sweep performs the close
                entry.mark_evicted();
            }
        });
        entry.set_max_life_timer(handle);
    }

    /// Retire 2-3% early so same-aged connections do not all hit the
    /// lifetime cliff together
    fn jittered_lifetime(&self, lifetime: Duration) -> Duration {
        let per_mille = 20 + (self.next_rand() % 11); // 20..=30
        lifetime.mul_f64(1.0 - per_mille as f64 / 1000.0)
    }

    fn next_rand(&self) -> u64 {
        self.rand_state
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |mut x| {
                x ^= x << 13;
                x ^= x >> 7;
                x ^= x << 17;
                Some(x)
            })
            .unwrap_or(1)
    }

    // ------------------------------------------------------------------
    // liveness
    // ------------------------------------------------------------------

    fn validate_entry(&self, entry: &Arc<PoolEntry>) -> bool {
        entry
            .with_connection(|conn| self.is_connection_alive(conn))
            .unwrap_or(false)
    }

    /// Probe a connection within the validation budget; any driver error
    /// means dead
    fn is_connection_alive(&self, conn: &mut dyn Connection) -> bool {
        let timeout = self.config.validation_timeout;
        let result = match &self.config.connection_test_query {
            None => conn.is_valid(timeout),
            Some(query) => self.run_test_query(conn, query, timeout).map(|()| true),
        };
        match result {
            Ok(true) => true,
            Ok(false) => {
                warn!(pool = %self.config.pool_name, "connection failed liveness check");
                false
            }
            Err(e) => {
                warn!(
                    pool = %self.config.pool_name,
                    error = %e,
                    "liveness check errored, connection presumed dead"
                );
                false
            }
        }
    }

    fn run_test_query(
        &self,
        conn: &mut dyn Connection,
        query: &str,
        timeout: Duration,
    ) -> Result<()> {
        let original = conn.network_timeout()?;
        conn.set_network_timeout(timeout.max(Duration::from_secs(1)))?;

        let statement_timeout = Duration::from_secs((timeout.as_millis() as u64).div_ceil(1000));
        conn.execute(query, statement_timeout)?;

        if self.config.isolate_internal_queries && !self.config.auto_commit {
            conn.rollback()?;
        }
        conn.set_network_timeout(original)?;
        Ok(())
    }

    fn log_pool_state(&self, prefix: &str) {
        debug!(
            pool = %self.config.pool_name,
            total = self.total_connections(),
            idle = self.idle_connections(),
            active = self.active_connections(),
            waiting = self.threads_awaiting_connection(),
            "{prefix}"
        );
    }
}

impl BagStateListener for Pool {
    fn add_bag_item(&self) {
        if self.state.load(Ordering::Acquire) == POOL_RUNNING {
            self.signal_add_worker();
        }
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for Pool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("name", &self.config.pool_name)
            .field("running", &self.is_running())
            .field("total", &self.total_connections())
            .field("idle", &self.idle_connections())
            .field("active", &self.active_connections())
            .finish()
    }
}

/// Seed the jitter PRNG from OS entropy
fn generate_seed() -> u64 {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};

    let state = RandomState::new();
    let mut hasher = state.build_hasher();
    hasher.write_u64(std::process::id().into());
    if let Ok(time) = std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH) {
        hasher.write_u64(time.as_nanos() as u64);
    }
    // xorshift requires a non-zero state
    hasher.finish().max(1)
}

/// A borrowed connection
///
/// Dropping the facade returns the underlying entry to the pool. After the
/// pool aborts or retires the entry, every operation fails with
/// [`Error::Closed`].
pub struct PooledConnection {
    pool: Arc<Pool>,
    entry: Arc<PoolEntry>,
}

impl PooledConnection {
    /// Run `f` against the live connection
    pub fn with_connection<R>(
        &self,
        f: impl FnOnce(&mut dyn Connection) -> Result<R>,
    ) -> Result<R> {
        if self.entry.is_aborted() || self.entry.is_removed() {
            return Err(Error::Closed);
        }
        match self.entry.with_connection(f) {
            Some(result) => result,
            None => Err(Error::Closed),
        }
    }

    /// Execute a statement on the borrowed connection
    pub fn execute(&self, sql: &str, timeout: Duration) -> Result<()> {
        self.with_connection(|conn| conn.execute(sql, timeout))
    }

    /// Ask the driver whether the connection is still alive
    pub fn is_valid(&self, timeout: Duration) -> Result<bool> {
        self.with_connection(|conn| conn.is_valid(timeout))
    }

    /// Roll back the current transaction
    pub fn rollback(&self) -> Result<()> {
        self.with_connection(|conn| conn.rollback())
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        self.pool.release(self.entry.clone());
    }
}

impl fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("pool", &self.pool.name())
            .field("entry", &self.entry)
            .finish()
    }
}
