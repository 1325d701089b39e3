//! Drug operations invoked by the web tier.
//!
//! Writes go to the ledger first and to the store second; the store only
//! changes once the ledger has accepted the transaction. Every state-changing
//! operation leaves exactly one audit entry, `Success` or `Failed`.
//!
//! The sync engine may mirror a transaction before the ledger call returns.
//! The local write then claims the mirrored record or entry, so the acting
//! user stays manufacturer or owner.

use pharmatrace_ledger::{LedgerClient, abi};
use pharmatrace_store::{
    AuditAction, DocumentBackend, Drug, DrugFilter, DrugPatch, FlagSource, HistoryEntry,
};
use tracing::instrument;

use crate::{
    access::{ActingUser, Capability, Role, require_role},
    error::{SupplyError, SupplyResult},
    supply::SupplyChain,
};

/// Status recorded when a manufacturer registers a drug.
pub const MANUFACTURED_STATUS: &str = "Manufactured";

/// A drug written to the ledger and the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Committed {
    /// The stored record after the write.
    pub drug: Drug,
    /// The ledger transaction.
    pub tx_hash: String,
}

/// Validates a drug id and returns its canonical decimal form.
///
/// # Errors
///
/// [`SupplyError::Validation`] if the id is blank or not a decimal `uint256`.
pub fn validate_drug_id(id: &str) -> SupplyResult<String> {
    let id = id.trim();
    if id.is_empty() {
        return Err(SupplyError::validation("Drug ID is required"));
    }
    abi::canonical_drug_id(id).map_err(SupplyError::from)
}

fn required(field: &str, value: &str) -> SupplyResult<String> {
    let value = value.trim();
    if value.is_empty() {
        return Err(SupplyError::validation(format!("{field} is required")));
    }
    Ok(value.to_owned())
}

impl<B: DocumentBackend, L: LedgerClient> SupplyChain<B, L> {
    /// Registers a drug on the ledger, then records it locally as
    /// `Manufactured` and verified, owned by the manufacturer.
    ///
    /// # Errors
    ///
    /// - [`SupplyError::Forbidden`] unless the user is a manufacturer.
    /// - [`SupplyError::Validation`] for a blank name or a malformed id.
    /// - [`SupplyError::Conflict`] if the id is already recorded.
    /// - Ledger and storage failures, each preceded by a `Failed` audit entry.
    #[instrument(skip(self, user, name), fields(user = %user.id, drug_id = %id))]
    pub async fn add_drug(&self, user: &ActingUser, id: &str, name: &str) -> SupplyResult<Committed> {
        require_role(user, Capability::AddDrug)?;
        let id = validate_drug_id(id)?;
        let name = required("Drug name", name)?;

        match self.add_drug_unaudited(user, &id, &name).await {
            Ok(committed) => {
                self.audit_success(
                    &user.name,
                    AuditAction::AddDrug,
                    format!("Drug ID: {id}, Name: {name}"),
                    Some(committed.tx_hash.clone()),
                )
                .await?;
                tracing::info!(tx_hash = %committed.tx_hash, "drug added");
                Ok(committed)
            },
            Err(err) => {
                tracing::warn!(error = %err, "add drug failed");
                self.audit_failure(
                    &user.name,
                    AuditAction::AddDrug,
                    format!("Failed to add Drug ID: {id}, Name: {name} - {err}"),
                )
                .await;
                Err(err)
            },
        }
    }

    async fn add_drug_unaudited(
        &self,
        user: &ActingUser,
        id: &str,
        name: &str,
    ) -> SupplyResult<Committed> {
        if self.records.find_by_id(id).await?.is_some() {
            return Err(SupplyError::Conflict { id: id.to_owned() });
        }
        let sender = self.resolve_sender(user).await?;
        let tx_hash = self.ledger.submit_add_drug(id, name, &sender).await?.0;

        let patch = DrugPatch::builder()
            .name(name)
            .manufacturer(user.name.as_str())
            .is_verified(true)
            .is_flagged(false)
            .build();
        let seed = HistoryEntry::builder()
            .status(MANUFACTURED_STATUS)
            .updated_by(Role::Manufacturer.as_str())
            .owner(user.name.as_str())
            .tx_hash(tx_hash.as_str())
            .build();
        let drug = self.records.claim_drug(id, &patch, &seed).await?.into_drug();
        Ok(Committed { drug, tx_hash })
    }

    /// Records a custody or status change on the ledger and appends it to the
    /// drug's history, with the acting user as the new owner.
    ///
    /// The ledger receives `"{status} by {owner} ({role})"`.
    ///
    /// # Errors
    ///
    /// - [`SupplyError::Forbidden`] unless the role may update status.
    /// - [`SupplyError::NotFound`] if the drug is not recorded (audited as `Failed`).
    /// - Ledger and storage failures, each preceded by a `Failed` audit entry.
    #[instrument(skip(self, user, status), fields(user = %user.id, drug_id = %id))]
    pub async fn update_status(
        &self,
        user: &ActingUser,
        id: &str,
        status: &str,
    ) -> SupplyResult<Committed> {
        require_role(user, Capability::UpdateStatus)?;
        let id = validate_drug_id(id)?;
        let status = required("Status", status)?;

        match self.records.find_by_id(&id).await {
            Ok(Some(_)) => {},
            Ok(None) => {
                self.audit_failure(
                    &user.name,
                    AuditAction::UpdateDrugStatus,
                    format!("Attempted to update status for non-existent Drug ID: {id}"),
                )
                .await;
                return Err(SupplyError::not_found(id));
            },
            Err(err) => {
                tracing::warn!(error = %err, "drug lookup failed");
                self.audit_failure(
                    &user.name,
                    AuditAction::UpdateDrugStatus,
                    format!("Failed to update status for Drug ID: {id}, Status: {status} - {err}"),
                )
                .await;
                return Err(err.into());
            },
        }

        match self.update_status_unaudited(user, &id, &status).await {
            Ok(committed) => {
                self.audit_success(
                    &user.name,
                    AuditAction::UpdateDrugStatus,
                    format!("Drug ID: {id}, New Status: {status}"),
                    Some(committed.tx_hash.clone()),
                )
                .await?;
                tracing::info!(tx_hash = %committed.tx_hash, %status, "drug status updated");
                Ok(committed)
            },
            Err(err) => {
                tracing::warn!(error = %err, "status update failed");
                self.audit_failure(
                    &user.name,
                    AuditAction::UpdateDrugStatus,
                    format!("Failed to update status for Drug ID: {id}, Status: {status} - {err}"),
                )
                .await;
                Err(err)
            },
        }
    }

    async fn update_status_unaudited(
        &self,
        user: &ActingUser,
        id: &str,
        status: &str,
    ) -> SupplyResult<Committed> {
        let sender = self.resolve_sender(user).await?;
        let event_detail = format!("{status} by {} ({})", user.name, user.role);
        let tx_hash = self.ledger.submit_history_update(id, &event_detail, &sender).await?.0;

        let entry = HistoryEntry::builder()
            .status(status)
            .updated_by(user.role.as_str())
            .owner(user.name.as_str())
            .tx_hash(tx_hash.as_str())
            .build();
        let drug = self.records.claim_history(id, entry).await?.into_drug();
        Ok(Committed { drug, tx_hash })
    }

    /// Reads a drug.
    ///
    /// # Errors
    ///
    /// [`SupplyError::NotFound`] if the drug is not recorded.
    #[instrument(skip(self, user), fields(user = %user.id, drug_id = %id))]
    pub async fn get_drug(&self, user: &ActingUser, id: &str) -> SupplyResult<Drug> {
        require_role(user, Capability::ViewDrug)?;
        let id = validate_drug_id(id)?;
        self.records.find_by_id(&id).await?.ok_or_else(|| SupplyError::not_found(id))
    }

    /// Flags a drug on an administrator's behalf. Automated verification
    /// never clears this flag.
    ///
    /// # Errors
    ///
    /// [`SupplyError::Forbidden`] for non-admins, [`SupplyError::NotFound`]
    /// for unknown drugs.
    #[instrument(skip(self, admin, reason), fields(user = %admin.id, drug_id = %id))]
    pub async fn flag_drug(&self, admin: &ActingUser, id: &str, reason: &str) -> SupplyResult<Drug> {
        require_role(admin, Capability::ManageFlags)?;
        let id = validate_drug_id(id)?;
        let reason = reason.trim();
        let details = if reason.is_empty() {
            format!("Drug ID: {id}")
        } else {
            format!("Drug ID: {id}, Reason: {reason}")
        };
        self.set_flag_audited(
            admin,
            &id,
            Some(FlagSource::Administrator),
            AuditAction::AdminManuallyFlaggedDrug,
            details,
        )
        .await
    }

    /// Clears any flag on a drug.
    ///
    /// # Errors
    ///
    /// [`SupplyError::Forbidden`] for non-admins, [`SupplyError::NotFound`]
    /// for unknown drugs.
    #[instrument(skip(self, admin), fields(user = %admin.id, drug_id = %id))]
    pub async fn unflag_drug(&self, admin: &ActingUser, id: &str) -> SupplyResult<Drug> {
        require_role(admin, Capability::ManageFlags)?;
        let id = validate_drug_id(id)?;
        let details = format!("Drug ID: {id}");
        self.set_flag_audited(admin, &id, None, AuditAction::AdminUnflaggedDrug, details).await
    }

    async fn set_flag_audited(
        &self,
        admin: &ActingUser,
        id: &str,
        flag: Option<FlagSource>,
        action: AuditAction,
        details: String,
    ) -> SupplyResult<Drug> {
        match self.records.set_flag(id, flag).await {
            Ok(drug) => {
                self.audit_success(&admin.name, action, details, None).await?;
                Ok(drug)
            },
            Err(err) => {
                let err = SupplyError::from(err);
                self.audit_failure(&admin.name, action, format!("{details} - {err}")).await;
                Err(err)
            },
        }
    }

    /// Lists drugs. Administrators see everything matching `filter`;
    /// manufacturers only their own products.
    ///
    /// # Errors
    ///
    /// [`SupplyError::Forbidden`] for other roles.
    #[instrument(skip(self, user), fields(user = %user.id))]
    pub async fn list_drugs(&self, user: &ActingUser, filter: DrugFilter) -> SupplyResult<Vec<Drug>> {
        require_role(user, Capability::ListDrugs)?;
        let filter = match user.role {
            Role::Manufacturer => DrugFilter { manufacturer: Some(user.name.clone()), ..filter },
            _ => filter,
        };
        Ok(self.records.find_all(&filter).await?)
    }
}
