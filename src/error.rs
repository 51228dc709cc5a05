//! Error types for the Ratewarden crate.

use thiserror::Error;

/// Main error type for Ratewarden operations.
#[derive(Error, Debug)]
pub enum WardenError {
    /// Invalid limiter, store or rules configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// The backing store could not be reached
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// An optimistic update kept losing the compare-and-swap race
    #[error("Contention on key {key} after {attempts} attempts")]
    Contention { key: String, attempts: u32 },

    /// A concurrency lease was released that is not held
    #[error("Release without acquire: identifier {identifier}, lease {lease}")]
    ReleaseWithoutAcquire { identifier: String, lease: u64 },

    /// No configured rule covers the identifier
    #[error("No rate limit rule matches identifier {0}")]
    NoMatchingRule(String),

    /// State encoding errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<config::ConfigError> for WardenError {
    fn from(err: config::ConfigError) -> Self {
        WardenError::Config(err.to_string())
    }
}

/// Result type alias for Ratewarden operations.
pub type Result<T> = std::result::Result<T, WardenError>;
