//! Authenticity verification against the ledger.
//!
//! | Local record | Ledger answer | Outcome | Audit tag |
//! |--------------|---------------|---------|-----------|
//! | absent | (not asked) | [`Unverifiable`](VerificationOutcome::Unverifiable) | `Verify (Not Found)` |
//! | present | absent or other id | [`FlaggedMismatch`](VerificationOutcome::FlaggedMismatch) | `Verify (Flagged)` |
//! | present, no admin flag | same id | [`Authentic`](VerificationOutcome::Authentic) | `Verify (Authentic)` |
//! | present, admin flag | same id | [`AdministratorFlagged`](VerificationOutcome::AdministratorFlagged) | `Verify (Admin Flag Retained)` |
//! | present | error | [`VerificationUnavailable`](VerificationOutcome::VerificationUnavailable) | `Verify (Error)` |
//!
//! Tags are prefixed `Admin ` or `Patient ` by the actor's role. An admin
//! whose verification the ledger confirms also clears an administrator flag.

use pharmatrace_ledger::LedgerClient;
use pharmatrace_store::{
    AuditAction, DocumentBackend, Drug, VerificationDecision, VerificationEffect, VerifyResult,
};
use tracing::instrument;

use crate::{
    access::{ActingUser, Capability, require_role},
    drugs::validate_drug_id,
    error::{SupplyError, SupplyResult},
    supply::SupplyChain,
};

/// What a verification concluded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerificationOutcome {
    /// No local record exists.
    Unverifiable,
    /// The ledger does not hold the drug; the record is now flagged.
    FlaggedMismatch(Drug),
    /// The ledger confirmed the drug; the record is verified and unflagged.
    Authentic(Drug),
    /// The ledger confirmed the drug but an administrator flag stays.
    AdministratorFlagged(Drug),
    /// The ledger could not be asked. Nothing was changed.
    VerificationUnavailable {
        /// Why the ledger call failed.
        reason: String,
    },
}

impl VerificationOutcome {
    /// The record after verification, when one exists.
    pub fn drug(&self) -> Option<&Drug> {
        match self {
            Self::FlaggedMismatch(drug) | Self::Authentic(drug) | Self::AdministratorFlagged(drug) => {
                Some(drug)
            },
            Self::Unverifiable | Self::VerificationUnavailable { .. } => None,
        }
    }

    fn audit_result(&self) -> VerifyResult {
        match self {
            Self::Unverifiable => VerifyResult::NotFound,
            Self::FlaggedMismatch(_) => VerifyResult::Flagged,
            Self::Authentic(_) => VerifyResult::Authentic,
            Self::AdministratorFlagged(_) => VerifyResult::AdminFlagRetained,
            Self::VerificationUnavailable { .. } => VerifyResult::Error,
        }
    }
}

impl<B: DocumentBackend, L: LedgerClient> SupplyChain<B, L> {
    /// Verifies the drug `id` against the ledger.
    ///
    /// Writes exactly one audit entry, whatever the outcome.
    ///
    /// # Errors
    ///
    /// - [`SupplyError::Validation`] for a malformed id (nothing is audited).
    /// - [`SupplyError::Storage`] if the record store fails; a `Verify (Error)`
    ///   entry is written first.
    #[instrument(skip(self, user), fields(user = %user.id, drug_id = %id))]
    pub async fn verify(&self, user: &ActingUser, id: &str) -> SupplyResult<VerificationOutcome> {
        require_role(user, Capability::Verify)?;
        let id = validate_drug_id(id)?;

        let outcome = match self.verify_unaudited(user, &id).await {
            Ok(outcome) => outcome,
            Err(err) => {
                self.audit_verification(user, &id, VerifyResult::Error, Some(&err.to_string())).await;
                return Err(err);
            },
        };

        let reason = match &outcome {
            VerificationOutcome::VerificationUnavailable { reason } => Some(reason.as_str()),
            _ => None,
        };
        self.audit_verification(user, &id, outcome.audit_result(), reason).await;
        tracing::info!(result = ?outcome.audit_result(), "verification complete");
        Ok(outcome)
    }

    async fn verify_unaudited(&self, user: &ActingUser, id: &str) -> SupplyResult<VerificationOutcome> {
        if self.records.find_by_id(id).await?.is_none() {
            return Ok(VerificationOutcome::Unverifiable);
        }

        let on_chain = match self.ledger.query_drug(id).await {
            Ok(on_chain) => on_chain,
            Err(err) => {
                tracing::warn!(error = %err, "ledger query failed during verification");
                return Ok(VerificationOutcome::VerificationUnavailable { reason: err.to_string() });
            },
        };

        let decision = match on_chain {
            Some(drug) if drug.id == id => {
                VerificationDecision::LedgerConfirmed { clear_administrator_flag: user.is_admin() }
            },
            other => {
                tracing::warn!(ledger_id = ?other.map(|d| d.id), "ledger does not confirm drug");
                VerificationDecision::LedgerMismatch
            },
        };

        let (effect, drug) = self.records.record_verification(id, decision).await?;
        Ok(match effect {
            VerificationEffect::Authentic => VerificationOutcome::Authentic(drug),
            VerificationEffect::AdministratorFlagRetained => VerificationOutcome::AdministratorFlagged(drug),
            VerificationEffect::Flagged => VerificationOutcome::FlaggedMismatch(drug),
        })
    }

    /// Writes the single verification entry. Errors are `Failed`, every other
    /// result `Success`.
    async fn audit_verification(
        &self,
        user: &ActingUser,
        id: &str,
        result: VerifyResult,
        error: Option<&str>,
    ) {
        let action = AuditAction::Verify { scope: user.verifier_scope(), result };
        match error {
            Some(error) => self.audit_failure(&user.id, action, format!("ID: {id} - {error}")).await,
            None => {
                if let Err(err) = self.audit_success(&user.id, action, format!("ID: {id}"), None).await {
                    tracing::error!(error = %err, "failed to record verification audit entry");
                }
            },
        }
    }
}
