//! Error types for weirpool
//!
//! Provides granular error classification for proper retry handling:
//! - Retriable errors (connection open/validation failures, borrow timeout)
//! - Non-retriable errors (pool closed, bad configuration)

use std::fmt;
use thiserror::Error;

/// Result type for weirpool operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error categories for classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Connection open or validation failure (retriable)
    Connection,
    /// Borrow exhausted its time budget (retriable with backoff)
    Timeout,
    /// Pool has been shut down
    Closed,
    /// Configuration error
    Configuration,
    /// Internal invariant violation
    Internal,
}

impl ErrorCategory {
    /// Whether errors in this category are generally retriable
    #[inline]
    pub const fn is_retriable(self) -> bool {
        matches!(self, Self::Connection | Self::Timeout)
    }
}

/// Main error type for weirpool
#[derive(Error, Debug)]
pub enum Error {
    /// Opening or validating a connection failed
    #[error("connection error: {message}")]
    Connection {
        /// Description of the failure
        message: String,
        /// Underlying driver error, when available
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A borrow request ran out of time
    #[error("timeout: {message}")]
    Timeout {
        /// Description of the budget that was exhausted
        message: String,
    },

    /// The pool has been shut down
    #[error("pool is closed")]
    Closed,

    /// Invalid pool configuration
    #[error("configuration error: {message}")]
    Configuration {
        /// What was wrong with the configuration
        message: String,
    },

    /// Internal error
    #[error("internal error: {message}")]
    Internal {
        /// Description of the impossible state
        message: String,
    },
}

impl Error {
    /// Get the error category
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Connection { .. } => ErrorCategory::Connection,
            Self::Timeout { .. } => ErrorCategory::Timeout,
            Self::Closed => ErrorCategory::Closed,
            Self::Configuration { .. } => ErrorCategory::Configuration,
            Self::Internal { .. } => ErrorCategory::Internal,
        }
    }

    /// Whether this error is retriable
    #[inline]
    pub fn is_retriable(&self) -> bool {
        self.category().is_retriable()
    }

    /// Create a connection error
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            source: None,
        }
    }

    /// Create a connection error with source
    pub fn connection_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Connection {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a timeout error
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::Timeout {
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connection => write!(f, "connection"),
            Self::Timeout => write!(f, "timeout"),
            Self::Closed => write!(f, "closed"),
            Self::Configuration => write!(f, "configuration"),
            Self::Internal => write!(f, "internal"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_category_retriable() {
        assert!(ErrorCategory::Connection.is_retriable());
        assert!(ErrorCategory::Timeout.is_retriable());

        assert!(!ErrorCategory::Closed.is_retriable());
        assert!(!ErrorCategory::Configuration.is_retriable());
        assert!(!ErrorCategory::Internal.is_retriable());
    }

    #[test]
    fn test_error_is_retriable() {
        assert!(Error::connection("refused").is_retriable());
        assert!(Error::timeout("borrow budget exhausted").is_retriable());

        assert!(!Error::Closed.is_retriable());
        assert!(!Error::config("max_pool_size must be at least 1").is_retriable());
    }

    #[test]
    fn test_error_display() {
        let err = Error::connection("connection refused");
        assert!(err.to_string().contains("connection refused"));

        let err = Error::timeout("waited 30000ms");
        assert!(err.to_string().contains("waited 30000ms"));

        assert_eq!(Error::Closed.to_string(), "pool is closed");
    }

    #[test]
    fn test_category_display() {
        assert_eq!(ErrorCategory::Connection.to_string(), "connection");
        assert_eq!(ErrorCategory::Timeout.to_string(), "timeout");
        assert_eq!(ErrorCategory::Closed.to_string(), "closed");
    }
}
