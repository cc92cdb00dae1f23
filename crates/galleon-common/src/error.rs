//! Error handling for the GalleonFS resilience services

use std::io;
use thiserror::Error;

use crate::types::{FileId, PoolName};

/// Result type for GalleonFS operations
pub type Result<T> = std::result::Result<T, GalleonError>;

/// Result type for GalleonFS operations (convenience alias)
pub type GalleonResult<T> = std::result::Result<T, GalleonError>;

/// Main error type for GalleonFS
#[derive(Error, Debug, Clone)]
pub enum GalleonError {
    /// A metadata service (pool manager, namespace) could not answer.
    /// Retried a bounded number of times before surfacing.
    #[error("Upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    /// Malformed administrative input, e.g. `min > max`
    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    /// A destructive action met a transient pin held by another operation
    #[error("Replica of {file_id} on {pool} is currently protected by another operation")]
    PinConflict { file_id: FileId, pool: PoolName },

    /// Every known source location of a file has been tried
    #[error("No viable source left for {0}")]
    NoViableSource(FileId),

    /// No pool in the group can take another copy of the file
    #[error("No target pool available for {0}")]
    NoTargetPool(FileId),

    /// The operation was cancelled by a pool status change or an administrator
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// A remote request to a pool failed
    #[error("Pool {pool} error: {message}")]
    PoolError { pool: PoolName, message: String },

    /// Timeout errors
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Resource not found errors
    #[error("Not found: {0}")]
    NotFound(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Invalid input errors
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// I/O related errors
    #[error("I/O error: {0}")]
    IoError(String),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Internal errors that should not normally occur
    #[error("Internal error: {0}")]
    InternalError(String),
}

impl GalleonError {
    /// Whether the failure is transient and worth another attempt,
    /// possibly against a different resource.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            GalleonError::UpstreamUnavailable(_)
                | GalleonError::PoolError { .. }
                | GalleonError::Timeout(_)
        )
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, GalleonError::Cancelled(_))
    }

    pub fn pool_error(pool: &PoolName, message: impl Into<String>) -> Self {
        GalleonError::PoolError {
            pool: pool.clone(),
            message: message.into(),
        }
    }
}

impl From<io::Error> for GalleonError {
    fn from(err: io::Error) -> Self {
        GalleonError::IoError(err.to_string())
    }
}

impl From<serde_json::Error> for GalleonError {
    fn from(err: serde_json::Error) -> Self {
        GalleonError::SerializationError(format!("JSON error: {}", err))
    }
}

impl From<toml::de::Error> for GalleonError {
    fn from(err: toml::de::Error) -> Self {
        GalleonError::SerializationError(format!("TOML error: {}", err))
    }
}

impl From<uuid::Error> for GalleonError {
    fn from(err: uuid::Error) -> Self {
        GalleonError::InvalidInput(format!("UUID error: {}", err))
    }
}

impl From<std::num::ParseIntError> for GalleonError {
    fn from(err: std::num::ParseIntError) -> Self {
        GalleonError::InvalidInput(format!("Parse error: {}", err))
    }
}

/// Error context trait for adding additional information to errors
pub trait ErrorContext<T> {
    /// Add context to an error
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T, E> ErrorContext<T> for std::result::Result<T, E>
where
    E: Into<GalleonError>,
{
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| {
            let base_error = e.into();
            let context = f();
            match base_error {
                GalleonError::IoError(msg) => GalleonError::IoError(format!("{}: {}", context, msg)),
                GalleonError::ConfigError(msg) => {
                    GalleonError::ConfigError(format!("{}: {}", context, msg))
                }
                GalleonError::SerializationError(msg) => {
                    GalleonError::ConfigError(format!("{}: {}", context, msg))
                }
                other => other,
            }
        })
    }
}

/// Macro for creating context-aware errors
#[macro_export]
macro_rules! galleon_error {
    ($kind:ident, $($arg:tt)*) => {
        $crate::error::GalleonError::$kind(format!($($arg)*))
    };
}

/// Macro for returning early with an error and context
#[macro_export]
macro_rules! bail {
    ($kind:ident, $($arg:tt)*) => {
        return Err($crate::galleon_error!($kind, $($arg)*))
    };
}

/// Macro for ensuring a condition or returning an error
#[macro_export]
macro_rules! ensure {
    ($cond:expr, $kind:ident, $($arg:tt)*) => {
        if !($cond) {
            $crate::bail!($kind, $($arg)*);
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(GalleonError::UpstreamUnavailable("namespace".into()).is_retryable());
        assert!(GalleonError::Timeout("copy".into()).is_retryable());
        assert!(GalleonError::pool_error(&PoolName::from("pool-a"), "refused").is_retryable());
        assert!(!GalleonError::NoViableSource(FileId::from("0000A1")).is_retryable());
        assert!(!GalleonError::Cancelled("pool down".into()).is_retryable());
    }

    #[test]
    fn test_ensure_macro() {
        fn check(min: u32, max: u32) -> Result<()> {
            ensure!(min <= max, ConstraintViolation, "min {} exceeds max {}", min, max);
            Ok(())
        }

        assert!(check(2, 3).is_ok());
        match check(4, 3) {
            Err(GalleonError::ConstraintViolation(msg)) => assert!(msg.contains("min 4")),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_with_context_prefixes_io_errors() {
        let res: std::result::Result<(), io::Error> =
            Err(io::Error::new(io::ErrorKind::NotFound, "missing"));
        let err = res.with_context(|| "reading resilience.toml".to_string()).unwrap_err();
        assert!(err.to_string().contains("reading resilience.toml"));
    }
}
