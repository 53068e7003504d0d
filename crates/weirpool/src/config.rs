//! Pool configuration
//!
//! All tunables recognized by the pool, with validation performed once at
//! pool construction. Durations are accepted as-is; sub-second values are
//! legal so short-lived pools can be built for tests and benchmarks.

use std::time::Duration;

use crate::error::{Error, Result};

/// Pool configuration
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Hard upper bound on pooled entries
    pub max_pool_size: usize,
    /// Target number of idle connections; 0 means fully lazy
    pub min_idle: usize,
    /// Maximum time a borrower waits for a connection
    pub connection_timeout: Duration,
    /// Retire connections idle longer than this; zero disables
    pub idle_timeout: Duration,
    /// Evict connections older than this; zero disables
    pub max_lifetime: Duration,
    /// Time budget for the liveness probe
    pub validation_timeout: Duration,
    /// Idle time after which a borrowed connection is probed before handout
    pub validation_interval: Duration,
    /// SQL executed to test liveness when the driver has no native check
    pub connection_test_query: Option<String>,
    /// Roll back after internal test queries when auto-commit is off
    pub isolate_internal_queries: bool,
    /// Session auto-commit default, consulted by the liveness probe
    pub auto_commit: bool,
    /// Period of the idle-retirement sweep
    pub housekeeping_interval: Duration,
    /// Name used in log messages and background thread names
    pub pool_name: String,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_pool_size: 10,
            min_idle: 10,
            connection_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(600), // 10 minutes
            max_lifetime: Duration::from_secs(1800), // 30 minutes
            validation_timeout: Duration::from_secs(5),
            validation_interval: Duration::from_millis(500),
            connection_test_query: None,
            isolate_internal_queries: false,
            auto_commit: true,
            housekeeping_interval: Duration::from_secs(30),
            pool_name: "weirpool".to_string(),
        }
    }
}

impl PoolConfig {
    /// Create a configuration with default settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Set maximum pool size
    pub fn with_max_pool_size(mut self, size: usize) -> Self {
        self.max_pool_size = size;
        self
    }

    /// Set the idle-connection target; 0 disables eager filling
    pub fn with_min_idle(mut self, count: usize) -> Self {
        self.min_idle = count;
        self
    }

    /// Set borrow timeout
    pub fn with_connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    /// Set idle timeout; zero disables idle retirement
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Set maximum connection lifetime; zero disables lifetime eviction
    pub fn with_max_lifetime(mut self, lifetime: Duration) -> Self {
        self.max_lifetime = lifetime;
        self
    }

    /// Set liveness probe budget
    pub fn with_validation_timeout(mut self, timeout: Duration) -> Self {
        self.validation_timeout = timeout;
        self
    }

    /// Set the idle threshold that triggers a probe on borrow
    pub fn with_validation_interval(mut self, interval: Duration) -> Self {
        self.validation_interval = interval;
        self
    }

    /// Set the SQL test query used when native validation is unavailable
    pub fn with_connection_test_query(mut self, query: impl Into<String>) -> Self {
        self.connection_test_query = Some(query.into());
        self
    }

    /// Enable/disable rollback after internal queries
    pub fn with_isolate_internal_queries(mut self, isolate: bool) -> Self {
        self.isolate_internal_queries = isolate;
        self
    }

    /// Set the session auto-commit default
    pub fn with_auto_commit(mut self, auto_commit: bool) -> Self {
        self.auto_commit = auto_commit;
        self
    }

    /// Set the housekeeping sweep period
    pub fn with_housekeeping_interval(mut self, interval: Duration) -> Self {
        self.housekeeping_interval = interval;
        self
    }

    /// Set the pool name
    pub fn with_pool_name(mut self, name: impl Into<String>) -> Self {
        self.pool_name = name.into();
        self
    }

    /// Validate the configuration, returning the first problem found
    pub fn validate(&self) -> Result<()> {
        if self.max_pool_size == 0 {
            return Err(Error::config("max_pool_size must be at least 1"));
        }
        if self.min_idle > self.max_pool_size {
            return Err(Error::config(format!(
                "min_idle ({}) cannot exceed max_pool_size ({})",
                self.min_idle, self.max_pool_size
            )));
        }
        if self.connection_timeout.is_zero() {
            return Err(Error::config("connection_timeout must be non-zero"));
        }
        if self.validation_timeout.is_zero() {
            return Err(Error::config("validation_timeout must be non-zero"));
        }
        if self.housekeeping_interval.is_zero() {
            return Err(Error::config("housekeeping_interval must be non-zero"));
        }
        if self.pool_name.is_empty() {
            return Err(Error::config("pool_name must not be empty"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = PoolConfig::default();

        assert_eq!(config.max_pool_size, 10);
        assert_eq!(config.min_idle, 10);
        assert_eq!(config.connection_timeout, Duration::from_secs(30));
        assert_eq!(config.idle_timeout, Duration::from_secs(600));
        assert_eq!(config.max_lifetime, Duration::from_secs(1800));
        assert_eq!(config.validation_timeout, Duration::from_secs(5));
        assert_eq!(config.validation_interval, Duration::from_millis(500));
        assert!(config.connection_test_query.is_none());
        assert!(!config.isolate_internal_queries);
        assert!(config.auto_commit);
        assert_eq!(config.housekeeping_interval, Duration::from_secs(30));
        assert_eq!(config.pool_name, "weirpool");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_builder_chain() {
        let config = PoolConfig::new()
            .with_max_pool_size(20)
            .with_min_idle(5)
            .with_connection_timeout(Duration::from_secs(10))
            .with_idle_timeout(Duration::from_secs(120))
            .with_max_lifetime(Duration::from_secs(3600))
            .with_validation_timeout(Duration::from_secs(2))
            .with_connection_test_query("SELECT 1")
            .with_isolate_internal_queries(true)
            .with_auto_commit(false)
            .with_pool_name("orders-db");

        assert_eq!(config.max_pool_size, 20);
        assert_eq!(config.min_idle, 5);
        assert_eq!(config.connection_timeout, Duration::from_secs(10));
        assert_eq!(config.idle_timeout, Duration::from_secs(120));
        assert_eq!(config.max_lifetime, Duration::from_secs(3600));
        assert_eq!(config.validation_timeout, Duration::from_secs(2));
        assert_eq!(config.connection_test_query.as_deref(), Some("SELECT 1"));
        assert!(config.isolate_internal_queries);
        assert!(!config.auto_commit);
        assert_eq!(config.pool_name, "orders-db");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_zero_min_idle() {
        let config = PoolConfig::new().with_max_pool_size(10).with_min_idle(0);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_min_idle_equals_max() {
        let config = PoolConfig::new().with_max_pool_size(5).with_min_idle(5);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_rejects_zero_max() {
        let config = PoolConfig::new().with_max_pool_size(0).with_min_idle(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_rejects_min_above_max() {
        let config = PoolConfig::new().with_max_pool_size(2).with_min_idle(3);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("min_idle"));
    }

    #[test]
    fn test_config_rejects_zero_timeouts() {
        let config = PoolConfig::new()
            .with_min_idle(0)
            .with_connection_timeout(Duration::ZERO);
        assert!(config.validate().is_err());

        let config = PoolConfig::new()
            .with_min_idle(0)
            .with_validation_timeout(Duration::ZERO);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_zero_lifetime_and_idle_are_legal() {
        // zero disables the corresponding policy rather than being invalid
        let config = PoolConfig::new()
            .with_max_lifetime(Duration::ZERO)
            .with_idle_timeout(Duration::ZERO);
        assert!(config.validate().is_ok());
    }
}
