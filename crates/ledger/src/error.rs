//! Error types for the ledger client.
//!
//! Every [`LedgerClient`](crate::LedgerClient) operation returns
//! [`LedgerResult`]. Transport failures, timeouts and an open circuit all
//! surface as [`LedgerError::Unavailable`]; a ledger that answered but refused
//! the request surfaces as [`LedgerError::TransactionRejected`].

use std::sync::Arc;

use thiserror::Error;

/// A boxed error type for source chain tracking.
pub type BoxError = Arc<dyn std::error::Error + Send + Sync>;

/// Result type alias for ledger operations.
pub type LedgerResult<T> = Result<T, LedgerError>;

/// Errors returned by the ledger client.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum LedgerError {
    /// The ledger node could not be reached, timed out or is shedding load.
    #[error("Ledger unavailable: {message}")]
    Unavailable {
        /// Description of the failure.
        message: String,
        /// The underlying error.
        #[source]
        source: Option<BoxError>,
    },

    /// The ledger declined the request (e.g. a revert on a duplicate id).
    #[error("Transaction rejected: {reason}")]
    TransactionRejected {
        /// Reason reported by the ledger.
        reason: String,
    },

    /// Neither the acting user nor the node provided a signing account.
    #[error("No sender identity available for ledger submission")]
    SenderIdentityMissing,

    /// A ledger response could not be decoded.
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    /// The drug id is not a valid `uint256` decimal string.
    #[error("Invalid drug id: {id:?}")]
    InvalidDrugId {
        /// The rejected id.
        id: String,
    },
}

impl LedgerError {
    /// Creates a new `Unavailable` error with the given message.
    #[must_use]
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable { message: message.into(), source: None }
    }

    /// Creates a new `Unavailable` error wrapping a source error.
    #[must_use]
    pub fn unavailable_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Unavailable { message: message.into(), source: Some(Arc::new(source)) }
    }

    /// Creates a new `TransactionRejected` error.
    #[must_use]
    pub fn rejected(reason: impl Into<String>) -> Self {
        Self::TransactionRejected { reason: reason.into() }
    }

    /// Creates a new `InvalidDrugId` error.
    #[must_use]
    pub fn invalid_drug_id(id: impl Into<String>) -> Self {
        Self::InvalidDrugId { id: id.into() }
    }

    /// Returns `true` when retrying the same call may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable { .. })
    }

    /// Returns `true` when the request provably never reached the node, so
    /// resending it cannot duplicate a transaction.
    ///
    /// Only a failed connection qualifies. A timeout, an error status or an
    /// unreadable response may follow an accepted transaction.
    #[must_use]
    pub fn is_unsent(&self) -> bool {
        match self {
            Self::Unavailable { source: Some(source), .. } => {
                source.downcast_ref::<reqwest::Error>().is_some_and(reqwest::Error::is_connect)
            },
            _ => false,
        }
    }

    /// Maps a JSON-RPC error object onto a ledger error.
    ///
    /// Execution errors (code `3`, or any message mentioning a revert) mean the
    /// contract refused the call. Rate limiting and internal node errors are
    /// transient; everything else is treated as a rejection.
    pub(crate) fn from_rpc(code: i64, message: &str) -> Self {
        let lower = message.to_ascii_lowercase();
        if code == 3 || lower.contains("revert") || lower.contains("execution") {
            return Self::rejected(message);
        }
        match code {
            -32005 | -32603 | -32000 if lower.contains("limit") || lower.contains("busy") => {
                Self::unavailable(format!("rpc error {code}: {message}"))
            },
            -32603 => Self::unavailable(format!("rpc error {code}: {message}")),
            _ => Self::rejected(format!("rpc error {code}: {message}")),
        }
    }
}

/// Failures decoding ABI data or event logs.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum DecodeError {
    /// Input ended before a complete value was read.
    #[error("truncated data: needed {needed} bytes at offset {offset}, have {len}")]
    Truncated {
        /// Offset of the read.
        offset: usize,
        /// Bytes needed from that offset.
        needed: usize,
        /// Total input length.
        len: usize,
    },

    /// A dynamic offset or length does not fit in the input.
    #[error("invalid offset or length {value}")]
    InvalidOffset {
        /// The offending word, rendered in decimal.
        value: String,
    },

    /// A string payload was not valid UTF-8.
    #[error("invalid utf-8 in string payload")]
    InvalidUtf8,

    /// Hex data was malformed.
    #[error("invalid hex: {0}")]
    InvalidHex(String),

    /// A log's first topic does not name a known event.
    #[error("unknown event topic {0}")]
    UnknownTopic(String),

    /// A log carried no topics.
    #[error("log has no topics")]
    MissingTopic,

    /// A JSON-RPC field was missing or had the wrong shape.
    #[error("malformed field `{field}`")]
    MalformedField {
        /// Name of the field.
        field: &'static str,
    },
}
