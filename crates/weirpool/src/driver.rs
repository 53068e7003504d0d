//! Driver trait seams consumed by the pool
//!
//! The pool is oblivious to SQL and wire protocols; it talks to the database
//! exclusively through these two traits. A driver implementation is expected
//! to apply its session defaults (auto-commit, isolation, read-only, catalog,
//! network timeout) inside [`Driver::connect`] so that every connection the
//! pool publishes is ready for use.

use std::time::Duration;

use crate::error::Result;

/// A live database session owned by the pool
///
/// Methods take `&mut self`: the pool guarantees exclusive access while a
/// connection is borrowed or being probed, so implementations do not need
/// their own synchronization.
pub trait Connection: Send {
    /// Native liveness check, when the driver supports one
    ///
    /// Used by the pool when no `connection_test_query` is configured.
    fn is_valid(&mut self, timeout: Duration) -> Result<bool>;

    /// Execute a statement under the given statement timeout
    ///
    /// Only ever called with the configured test query; result rows are
    /// discarded.
    fn execute(&mut self, sql: &str, timeout: Duration) -> Result<()>;

    /// Roll back the current transaction
    fn rollback(&mut self) -> Result<()> {
        Ok(())
    }

    /// Current network timeout of the underlying socket
    fn network_timeout(&self) -> Result<Duration> {
        Ok(Duration::ZERO)
    }

    /// Replace the network timeout of the underlying socket
    fn set_network_timeout(&mut self, _timeout: Duration) -> Result<()> {
        Ok(())
    }

    /// Close the session; may block on network I/O
    fn close(&mut self) -> Result<()>;

    /// Forcibly sever the session without waiting for in-flight work
    ///
    /// Defaults to a plain close for drivers without an abort hook.
    fn abort(&mut self) -> Result<()> {
        self.close()
    }
}

/// Factory for opening fresh database sessions
pub trait Driver: Send + Sync {
    /// Open a new session with session defaults applied
    fn connect(&self) -> Result<Box<dyn Connection>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    struct FakeConnection {
        closed: bool,
        aborted: bool,
    }

    impl Connection for FakeConnection {
        fn is_valid(&mut self, _timeout: Duration) -> Result<bool> {
            Ok(!self.closed)
        }

        fn execute(&mut self, sql: &str, _timeout: Duration) -> Result<()> {
            if sql.is_empty() {
                return Err(Error::connection("empty statement"));
            }
            Ok(())
        }

        fn close(&mut self) -> Result<()> {
            self.closed = true;
            Ok(())
        }

        fn abort(&mut self) -> Result<()> {
            self.aborted = true;
            self.close()
        }
    }

    #[test]
    fn test_default_network_timeout_is_noop() {
        let mut conn = FakeConnection {
            closed: false,
            aborted: false,
        };
        assert_eq!(conn.network_timeout().unwrap(), Duration::ZERO);
        assert!(conn.set_network_timeout(Duration::from_secs(5)).is_ok());
        assert!(conn.rollback().is_ok());
    }

    #[test]
    fn test_abort_overrides_default() {
        let mut conn = FakeConnection {
            closed: false,
            aborted: false,
        };
        conn.abort().unwrap();
        assert!(conn.aborted);
        assert!(conn.closed);
    }
}
