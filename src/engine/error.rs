//! Engine errors
//!
//! Every failure inside the engine is folded into one of two kinds before it
//! leaves the module: a connection could not be established or confirmed, or
//! an established connection rejected a statement. The wrapped cause is kept
//! for display only.

use std::error::Error as StdError;

use thiserror::Error;

pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

pub type DriverResult<T> = Result<T, DriverError>;

#[derive(Debug, Error)]
pub enum DriverError {
    /// Dial, authentication, ping or tunnel failure
    #[error("connection failed: {0}")]
    Connection(#[source] BoxError),

    /// Anything the engine rejects at execution time
    #[error("query failed: {0}")]
    Query(#[source] BoxError),

    /// The factory was asked for an engine it does not know
    #[error("unsupported database type: {0:?} (expected one of postgres, mysql, sqlite)")]
    UnsupportedEngine(String),
}

/// Cause attached when a caller's cancellation token fires first.
#[derive(Debug, Clone, Copy, Error)]
#[error("operation cancelled")]
pub struct Cancelled;

impl DriverError {
    pub fn connection(cause: impl Into<BoxError>) -> Self {
        Self::Connection(cause.into())
    }

    pub fn query(cause: impl Into<BoxError>) -> Self {
        Self::Query(cause.into())
    }

    pub fn not_connected() -> Self {
        Self::connection("not connected")
    }

    /// True when the wrapped cause is a cancellation rather than an engine error.
    pub fn is_cancelled(&self) -> bool {
        match self {
            Self::Connection(cause) | Self::Query(cause) => cause.is::<Cancelled>(),
            Self::UnsupportedEngine(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_carry_the_kind_prefix() {
        let err = DriverError::connection("dial tcp 127.0.0.1:1: refused");
        assert_eq!(err.to_string(), "connection failed: dial tcp 127.0.0.1:1: refused");

        let err = DriverError::query("syntax error at or near \"SELEC\"");
        assert_eq!(err.to_string(), "query failed: syntax error at or near \"SELEC\"");
    }

    #[test]
    fn cancellation_is_detectable_through_either_kind() {
        assert!(DriverError::query(Cancelled).is_cancelled());
        assert!(DriverError::connection(Cancelled).is_cancelled());
        assert!(!DriverError::query("boom").is_cancelled());
        assert!(!DriverError::UnsupportedEngine("oracle".into()).is_cancelled());
    }

    #[test]
    fn source_is_preserved() {
        let err = DriverError::connection(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            "refused",
        ));
        assert!(err.source().is_some());
    }
}
