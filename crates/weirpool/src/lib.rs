//! # weirpool
//!
//! High-performance database connection pool built around a lock-light
//! concurrent bag.
//!
//! ## Features
//!
//! - **Concurrent Bag**: CAS-arbitrated entry ownership, a per-thread cache
//!   for contention-free repeat borrows, and a zero-capacity rendezvous that
//!   hands returned entries directly to blocked borrowers
//! - **Lifecycle Management**: min-idle refill, idle timeout, jittered max
//!   lifetime, soft eviction, and forced abort
//! - **Non-Blocking Fast Path**: connection opens and closes run on
//!   dedicated threads; the only suspension point is the bounded wait inside
//!   borrow
//! - **Driver Agnostic**: the pool is oblivious to SQL and talks to the
//!   database through two small traits
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use weirpool::prelude::*;
//! use std::time::Duration;
//!
//! let config = PoolConfig::new()
//!     .with_max_pool_size(10)
//!     .with_min_idle(2)
//!     .with_connection_timeout(Duration::from_secs(30))
//!     .with_pool_name("orders-db");
//!
//! let pool = Pool::new(config, Arc::new(MyDriver::new(url)))?;
//!
//! let conn = pool.get_connection()?;
//! conn.execute("INSERT INTO orders ...", Duration::from_secs(5))?;
//! // the connection returns to the pool when dropped
//! drop(conn);
//!
//! pool.shutdown();
//! ```
//!
//! ## Liveness
//!
//! Connections idle past `validation_interval` are probed before handout:
//! with no `connection_test_query` configured the driver's native validity
//! check is used; otherwise the query runs under the validation budget with
//! the network timeout temporarily raised. Any driver error means the
//! connection is dead and a replacement is served within the remaining
//! borrow budget.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod bag;
pub mod config;
pub mod driver;
pub mod entry;
pub mod error;
pub mod exec;
pub mod metrics;
pub mod pool;
pub mod timer;

pub use bag::{BagStateListener, ConcurrentBag};
pub use config::PoolConfig;
pub use driver::{Connection, Driver};
pub use entry::{
    state_name, PoolEntry, STATE_IN_USE, STATE_NOT_IN_USE, STATE_REMOVED, STATE_RESERVED,
};
pub use error::{Error, ErrorCategory, Result};
pub use metrics::{AtomicPoolMetrics, PoolMetrics};
pub use pool::{Pool, PooledConnection};

/// Commonly used types, importable in one line
pub mod prelude {
    pub use crate::config::PoolConfig;
    pub use crate::driver::{Connection, Driver};
    pub use crate::error::{Error, ErrorCategory, Result};
    pub use crate::metrics::PoolMetrics;
    pub use crate::pool::{Pool, PooledConnection};
}
