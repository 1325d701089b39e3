//! Storage error types and result alias.
//!
//! Every record store operation returns [`StorageResult`]. Backends map their
//! internal failures onto the variants of [`StorageError`], and configuration
//! validation failures are reported through [`ConfigError`].
//!
//! # Error Types
//!
//! - [`StorageError::NotFound`] - No document exists under the requested id
//! - [`StorageError::Conflict`] - A compare-and-swap precondition did not hold
//! - [`StorageError::CasRetriesExhausted`] - Every optimistic retry hit a conflict
//! - [`StorageError::Connection`] - The backend could not be reached
//! - [`StorageError::Serialization`] - A document could not be encoded or decoded
//! - [`StorageError::Internal`] - Backend-specific internal failure
//! - [`StorageError::Timeout`] - The operation exceeded its time limit
//!
//! # Example
//!
//! ```
//! use pharmatrace_store::{StorageError, StorageResult};
//!
//! fn lookup(id: &str) -> StorageResult<Vec<u8>> {
//!     Err(StorageError::not_found(id))
//! }
//! ```

use std::sync::Arc;

use thiserror::Error;

/// A boxed error type for source chain tracking.
pub type BoxError = Arc<dyn std::error::Error + Send + Sync>;

/// Result type alias for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur during storage operations.
///
/// # Non-exhaustive
///
/// New variants may be added in minor releases. Downstream match expressions
/// must include a wildcard arm.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StorageError {
    /// No document exists under the requested id.
    #[error("Document not found: {id}")]
    NotFound {
        /// The id that was not found.
        id: String,
    },

    /// A compare-and-swap or insert-if-absent precondition did not hold.
    ///
    /// Another writer changed (or created) the document between the read and
    /// the write. Callers should re-read and retry.
    #[error("Document conflict: {id}")]
    Conflict {
        /// The id of the contended document.
        id: String,
    },

    /// Optimistic concurrency retries were exhausted.
    #[error("Gave up after {attempts} conflicting attempts")]
    CasRetriesExhausted {
        /// Total number of attempts made.
        attempts: u32,
    },

    /// The backend could not be reached.
    #[error("Connection error: {message}")]
    Connection {
        /// Description of the connection error.
        message: String,
        /// The underlying error.
        #[source]
        source: Option<BoxError>,
    },

    /// A document could not be encoded or decoded.
    #[error("Serialization error: {message}")]
    Serialization {
        /// Description of the serialization error.
        message: String,
        /// The underlying error.
        #[source]
        source: Option<BoxError>,
    },

    /// Catch-all for backend-specific failures.
    #[error("Internal error: {message}")]
    Internal {
        /// Description of the internal error.
        message: String,
        /// The underlying error.
        #[source]
        source: Option<BoxError>,
    },

    /// The operation exceeded its time limit.
    #[error("Operation timeout")]
    Timeout,
}

impl StorageError {
    /// Creates a new `NotFound` error for the given id.
    #[must_use]
    pub fn not_found(id: impl Into<String>) -> Self {
        Self::NotFound { id: id.into() }
    }

    /// Creates a new `Conflict` error for the given id.
    #[must_use]
    pub fn conflict(id: impl Into<String>) -> Self {
        Self::Conflict { id: id.into() }
    }

    /// Creates a new `CasRetriesExhausted` error.
    #[must_use]
    pub fn cas_retries_exhausted(attempts: u32) -> Self {
        Self::CasRetriesExhausted { attempts }
    }

    /// Creates a new `Connection` error with the given message.
    #[must_use]
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection { message: message.into(), source: None }
    }

    /// Creates a new `Serialization` error with the given message.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization { message: message.into(), source: None }
    }

    /// Creates a new `Serialization` error wrapping a source error.
    #[must_use]
    pub fn serialization_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Serialization { message: message.into(), source: Some(Arc::new(source)) }
    }

    /// Creates a new `Internal` error with the given message.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal { message: message.into(), source: None }
    }

    /// Creates a new `Timeout` error.
    #[must_use]
    pub fn timeout() -> Self {
        Self::Timeout
    }

    /// Returns `true` when retrying the same operation may succeed.
    ///
    /// Connection failures and timeouts are transient. Conflicts are not: they
    /// require a fresh read, which the CAS retry loop performs itself.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Connection { .. } | Self::Timeout)
    }

    /// Returns `true` for [`StorageError::NotFound`].
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization_with_source("document encoding failed", err)
    }
}

/// Configuration validation failures.
///
/// Returned by the validating `bon` builders of every config type in the
/// workspace.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// A numeric field is below its allowed minimum.
    #[error("{field} must be at least {min}, got {value}")]
    BelowMinimum {
        /// Name of the offending field.
        field: &'static str,
        /// Smallest accepted value.
        min: String,
        /// Value that was supplied.
        value: String,
    },

    /// A duration or count must be strictly positive.
    #[error("{field} must be positive, got {value}")]
    MustBePositive {
        /// Name of the offending field.
        field: &'static str,
        /// Value that was supplied.
        value: String,
    },

    /// Two fields are inconsistent with each other.
    #[error("{field} is invalid: {reason}")]
    Invalid {
        /// Name of the offending field.
        field: &'static str,
        /// Why the value was rejected.
        reason: String,
    },
}
