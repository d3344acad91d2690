//! Error taxonomy for the cache layer
//!
//! Remote failures are classified once, at the store boundary, so the
//! manager can decide between flipping availability, evicting, or retrying.
//! None of these errors cross the public cache API.

use thiserror::Error;

/// Failure reported by a remote store operation
#[derive(Debug, Clone, Error)]
pub enum RemoteError {
    /// Connection refused, dropped, or any other transport failure
    #[error("connection error: {0}")]
    Connection(String),

    /// Connect or request deadline elapsed
    #[error("timed out: {0}")]
    Timeout(String),

    /// The store rejected a write because it reached its memory limit
    #[error("out of memory: {0}")]
    OutOfMemory(String),

    /// Any other command failure (wrong type, syntax, ...)
    #[error("command failed: {0}")]
    Command(String),

    /// No live connection is installed
    #[error("remote cache unavailable")]
    Unavailable,
}

impl RemoteError {
    /// Errors that mean the connection itself is unhealthy
    pub fn is_connection_class(&self) -> bool {
        matches!(
            self,
            Self::Connection(_) | Self::Timeout(_) | Self::Unavailable
        )
    }

    pub fn is_memory_class(&self) -> bool {
        matches!(self, Self::OutOfMemory(_))
    }

    /// Short label used for metrics and log fields
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Connection(_) => "connection",
            Self::Timeout(_) => "timeout",
            Self::OutOfMemory(_) => "memory",
            Self::Command(_) => "command",
            Self::Unavailable => "unavailable",
        }
    }
}

#[cfg(feature = "redis")]
impl From<redis::RedisError> for RemoteError {
    fn from(err: redis::RedisError) -> Self {
        let message = err.to_string();
        if err.is_timeout() {
            Self::Timeout(message)
        } else if err.is_connection_refusal() || err.is_connection_dropped() || err.is_io_error()
        {
            Self::Connection(message)
        } else if message.contains("OOM") {
            Self::OutOfMemory(message)
        } else {
            Self::Command(message)
        }
    }
}

/// Invalid configuration value
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {name}")]
    InvalidValue { name: &'static str, value: String },

    #[error("memory warning threshold ({warning}%) must be below critical threshold ({critical}%)")]
    Thresholds { warning: f64, critical: f64 },

    #[error("{0} must be greater than zero")]
    Zero(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert!(RemoteError::Connection("refused".into()).is_connection_class());
        assert!(RemoteError::Timeout("ping".into()).is_connection_class());
        assert!(RemoteError::Unavailable.is_connection_class());
        assert!(!RemoteError::OutOfMemory("OOM".into()).is_connection_class());
        assert!(RemoteError::OutOfMemory("OOM".into()).is_memory_class());
        assert!(!RemoteError::Command("WRONGTYPE".into()).is_memory_class());
        assert_eq!(RemoteError::Command("x".into()).kind(), "command");
    }
}
