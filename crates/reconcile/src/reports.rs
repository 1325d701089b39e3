//! Administrator reports.

use pharmatrace_ledger::LedgerClient;
use pharmatrace_store::{
    ActionFilter, AuditAction, AuditEntry, AuditStatus, DocumentBackend, DrugFilter,
};
use serde::Serialize;
use tracing::instrument;

use crate::{
    access::{ActingUser, Capability, require_role},
    error::SupplyResult,
    supply::SupplyChain,
};

/// Headline numbers for the admin dashboard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportStats {
    /// Drugs on record.
    pub total_drugs: usize,
    /// Successful status updates.
    pub total_transfers: usize,
    /// Drugs currently flagged.
    pub flagged_drugs: usize,
    /// Drugs marked verified.
    pub verified_drugs: usize,
    /// Audit entries with status `Failed`.
    pub failed_actions: usize,
}

impl<B: DocumentBackend, L: LedgerClient> SupplyChain<B, L> {
    /// Computes [`ReportStats`].
    ///
    /// # Errors
    ///
    /// [`SupplyError::Forbidden`](crate::SupplyError::Forbidden) for
    /// non-admins; storage failures otherwise.
    #[instrument(skip(self, admin), fields(user = %admin.id))]
    pub async fn report(&self, admin: &ActingUser) -> SupplyResult<ReportStats> {
        require_role(admin, Capability::ViewReports)?;
        let transfers = ActionFilter::exact(AuditAction::UpdateDrugStatus);
        Ok(ReportStats {
            total_drugs: self.records.count(&DrugFilter::all()).await?,
            total_transfers: self.audit.count_by_status(AuditStatus::Success, Some(&transfers)).await?,
            flagged_drugs: self.records.count(&DrugFilter::builder().flagged(true).build()).await?,
            verified_drugs: self.records.count(&DrugFilter::builder().verified(true).build()).await?,
            failed_actions: self.audit.count_by_status(AuditStatus::Failed, None).await?,
        })
    }

    /// The full audit trail, newest first.
    ///
    /// # Errors
    ///
    /// [`SupplyError::Forbidden`](crate::SupplyError::Forbidden) for
    /// non-admins; storage failures otherwise.
    #[instrument(skip(self, admin), fields(user = %admin.id))]
    pub async fn audit_log(&self, admin: &ActingUser) -> SupplyResult<Vec<AuditEntry>> {
        require_role(admin, Capability::ViewReports)?;
        Ok(self.audit.find_all().await?)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::testutil::{admin, distributor, fixture, manufacturer};

    #[tokio::test]
    async fn test_report_counts() {
        let (chain, ledger) = fixture();
        chain.add_drug(&manufacturer(), "1", "Aspirin").await.unwrap();
        chain.add_drug(&manufacturer(), "2", "Ibuprofen").await.unwrap();
        chain.update_status(&distributor(), "1", "Distributed").await.unwrap();
        chain.flag_drug(&admin(), "2", "damaged seal").await.unwrap();
        ledger.set_unavailable(true);
        chain.update_status(&distributor(), "1", "Delivered").await.unwrap_err();

        let stats = chain.report(&admin()).await.unwrap();
        assert_eq!(
            stats,
            ReportStats {
                total_drugs: 2,
                total_transfers: 1,
                flagged_drugs: 1,
                verified_drugs: 2,
                failed_actions: 1,
            }
        );
    }

    #[tokio::test]
    async fn test_audit_log_is_admin_only_and_newest_first() {
        let (chain, _ledger) = fixture();
        chain.add_drug(&manufacturer(), "1", "Aspirin").await.unwrap();
        chain.update_status(&distributor(), "1", "Distributed").await.unwrap();

        let log = chain.audit_log(&admin()).await.unwrap();
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].action, "Update Drug Status");
        assert_eq!(chain.audit_log(&distributor()).await.unwrap_err().http_status(), 403);
    }

    #[test]
    fn test_stats_serialize_camel_case() {
        let json = serde_json::to_value(ReportStats::default()).unwrap();
        assert!(json.get("totalTransfers").is_some());
    }
}
