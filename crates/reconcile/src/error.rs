//! Errors returned by supply-chain operations.
//!
//! [`SupplyError`] is what the HTTP surface sees. Ledger and storage failures
//! are folded into it; consistency mismatches are not errors but
//! [`VerificationOutcome`](crate::VerificationOutcome)s.

use pharmatrace_ledger::LedgerError;
use pharmatrace_store::StorageError;
use thiserror::Error;

/// Result type alias for supply-chain operations.
pub type SupplyResult<T> = Result<T, SupplyError>;

/// Errors from drug operations, verification and reports.
///
/// # Non-exhaustive
///
/// New variants may be added in minor releases. Downstream match expressions
/// must include a wildcard arm.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SupplyError {
    /// The request is malformed (missing field, non-decimal id, ...).
    #[error("Validation failed: {0}")]
    Validation(String),

    /// The acting user's role does not allow the operation.
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// No drug exists under the id.
    #[error("Drug not found: {id}")]
    NotFound {
        /// The requested id.
        id: String,
    },

    /// A drug with the id already exists.
    #[error("Drug already exists: {id}")]
    Conflict {
        /// The contested id.
        id: String,
    },

    /// The ledger could not be reached or answered with garbage.
    #[error("Ledger unavailable: {0}")]
    LedgerUnavailable(#[source] LedgerError),

    /// The ledger refused the transaction.
    #[error("Ledger rejected transaction: {reason}")]
    TransactionRejected {
        /// Reason reported by the ledger.
        reason: String,
    },

    /// The user has no wallet and the node offers no default account.
    #[error("Sender wallet address not found")]
    SenderIdentityMissing,

    /// The record store failed.
    #[error("Storage error: {0}")]
    Storage(#[source] StorageError),
}

impl SupplyError {
    /// Creates a `Validation` error.
    #[must_use]
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Creates a `Forbidden` error.
    #[must_use]
    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::Forbidden(message.into())
    }

    /// Creates a `NotFound` error.
    #[must_use]
    pub fn not_found(id: impl Into<String>) -> Self {
        Self::NotFound { id: id.into() }
    }

    /// HTTP status the web tier should answer with.
    ///
    /// | Variant | Status |
    /// |---------|--------|
    /// | `Validation` | 400 |
    /// | `Forbidden` | 403 |
    /// | `NotFound` | 404 |
    /// | `Conflict` | 409 |
    /// | everything else | 500 |
    #[must_use]
    pub fn http_status(&self) -> u16 {
        match self {
            Self::Validation(_) => 400,
            Self::Forbidden(_) => 403,
            Self::NotFound { .. } => 404,
            Self::Conflict { .. } => 409,
            Self::LedgerUnavailable(_)
            | Self::TransactionRejected { .. }
            | Self::SenderIdentityMissing
            | Self::Storage(_) => 500,
        }
    }
}

impl From<LedgerError> for SupplyError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::TransactionRejected { reason } => Self::TransactionRejected { reason },
            LedgerError::SenderIdentityMissing => Self::SenderIdentityMissing,
            LedgerError::InvalidDrugId { id } => {
                Self::Validation(format!("Drug ID must be a decimal number, got {id:?}"))
            },
            other => Self::LedgerUnavailable(other),
        }
    }
}

impl From<StorageError> for SupplyError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound { id } => Self::NotFound { id },
            other => Self::Storage(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case::validation(SupplyError::validation("name is required"), 400)]
    #[case::forbidden(SupplyError::forbidden("patients cannot add drugs"), 403)]
    #[case::not_found(SupplyError::not_found("7"), 404)]
    #[case::conflict(SupplyError::Conflict { id: "7".into() }, 409)]
    #[case::ledger(SupplyError::LedgerUnavailable(LedgerError::unavailable("down")), 500)]
    #[case::rejected(SupplyError::TransactionRejected { reason: "revert".into() }, 500)]
    #[case::sender(SupplyError::SenderIdentityMissing, 500)]
    #[case::storage(SupplyError::Storage(StorageError::timeout()), 500)]
    fn test_http_status(#[case] err: SupplyError, #[case] status: u16) {
        assert_eq!(err.http_status(), status);
    }

    #[test]
    fn test_ledger_errors_map_by_kind() {
        assert!(matches!(
            SupplyError::from(LedgerError::rejected("Drug already exists")),
            SupplyError::TransactionRejected { .. }
        ));
        assert!(matches!(
            SupplyError::from(LedgerError::invalid_drug_id("D1")),
            SupplyError::Validation(_)
        ));
        assert!(matches!(
            SupplyError::from(LedgerError::unavailable("reset")),
            SupplyError::LedgerUnavailable(_)
        ));
    }

    #[test]
    fn test_storage_not_found_becomes_not_found() {
        assert!(matches!(
            SupplyError::from(StorageError::not_found("9")),
            SupplyError::NotFound { id } if id == "9"
        ));
        assert_eq!(SupplyError::from(StorageError::timeout()).http_status(), 500);
    }
}
