//! The service object behind every on-demand operation.

use pharmatrace_ledger::LedgerClient;
use pharmatrace_store::{AuditEntry, AuditStatus, AuditTrail, DocumentBackend, DrugRecords};

use crate::{
    access::ActingUser,
    config::SyncConfig,
    error::{SupplyError, SupplyResult},
    sync::{EventSyncEngine, SyncHandle},
};

/// Drug records, the audit trail and the ledger, bundled.
///
/// The operations live in [`drugs`](crate::drugs), [`verify`](crate::verify)
/// and [`reports`](crate::reports). Cloning is as cheap as cloning the
/// backend and the ledger client.
#[derive(Debug, Clone)]
pub struct SupplyChain<B, L> {
    pub(crate) records: DrugRecords<B>,
    pub(crate) audit: AuditTrail<B>,
    pub(crate) ledger: L,
}

impl<B: DocumentBackend + Clone, L: LedgerClient> SupplyChain<B, L> {
    /// Creates a service whose records and audit trail share `backend`.
    pub fn new(backend: B, ledger: L) -> Self {
        Self::from_parts(DrugRecords::new(backend.clone()), AuditTrail::new(backend), ledger)
    }
}

impl<B: DocumentBackend, L: LedgerClient> SupplyChain<B, L> {
    /// Creates a service from already configured repositories.
    pub fn from_parts(records: DrugRecords<B>, audit: AuditTrail<B>, ledger: L) -> Self {
        Self { records, audit, ledger }
    }

    /// The drug repository.
    pub fn records(&self) -> &DrugRecords<B> {
        &self.records
    }

    /// The audit trail.
    pub fn audit_trail(&self) -> &AuditTrail<B> {
        &self.audit
    }

    /// The ledger client.
    pub fn ledger(&self) -> &L {
        &self.ledger
    }

    /// Starts the event sync engine over this service's store and ledger.
    pub fn start_sync(&self, config: SyncConfig) -> SyncHandle
    where
        B: Clone + 'static,
        L: Clone + 'static,
    {
        EventSyncEngine::spawn(self.records.clone(), self.audit.clone(), self.ledger.clone(), config)
    }

    /// Resolves the account that signs `user`'s transactions: the user's
    /// wallet, else the node's default account.
    pub(crate) async fn resolve_sender(&self, user: &ActingUser) -> SupplyResult<String> {
        if let Some(wallet) = user.wallet() {
            return Ok(wallet.to_owned());
        }
        self.ledger.default_sender().await?.ok_or(SupplyError::SenderIdentityMissing)
    }

    pub(crate) async fn audit_success(
        &self,
        user: &str,
        action: impl Into<String>,
        details: String,
        tx_hash: Option<String>,
    ) -> SupplyResult<()> {
        let entry = AuditEntry::builder()
            .user_name(user)
            .action(action)
            .details(details)
            .maybe_tx_hash(tx_hash)
            .build();
        self.audit.record(entry).await?;
        Ok(())
    }

    /// Records a `Failed` entry. A failing audit write is logged, so the
    /// caller can still return the error that caused the failure.
    pub(crate) async fn audit_failure(&self, user: &str, action: impl Into<String>, details: String) {
        let entry = AuditEntry::builder()
            .user_name(user)
            .action(action)
            .details(details)
            .status(AuditStatus::Failed)
            .build();
        if let Err(err) = self.audit.record(entry).await {
            tracing::error!(error = %err, "failed to record audit entry for failed action");
        }
    }
}
