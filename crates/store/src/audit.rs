//! Append-only audit trail.
//!
//! Every state-changing operation, including failed ones, records exactly one
//! [`AuditEntry`] through [`AuditTrail::record`]. Entries are immutable once
//! written; the trail exposes no update or delete API.
//!
//! Each recorded entry is also emitted as a structured `tracing` event at
//! `INFO` with `audit.*` fields, so the trail can be forwarded by any
//! `tracing-subscriber` layer:
//!
//! - `audit.id`: time-ordered entry id
//! - `audit.user`: who performed the action
//! - `audit.action`: the action tag (e.g. `Update Drug Status`)
//! - `audit.status`: `Success`, `Failed` or `Upserted`
//! - `audit.tx_hash`: ledger transaction, or `N/A`
//!
//! # Usage
//!
//! ```no_run
//! use pharmatrace_store::{AuditAction, AuditEntry, AuditStatus, AuditTrail, MemoryBackend};
//!
//! # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
//! let trail = AuditTrail::new(MemoryBackend::new());
//! let entry = AuditEntry::builder()
//!     .user_name("admin")
//!     .action(AuditAction::AdminUnflaggedDrug)
//!     .details("Drug 1001 unflagged")
//!     .status(AuditStatus::Success)
//!     .build();
//! trail.record(entry).await.unwrap();
//! # });
//! ```

use std::fmt;

use chrono::{DateTime, Utc};
use fail::fail_point;
use serde::{Deserialize, Serialize};
use tracing::instrument;
use uuid::Uuid;

use crate::{
    backend::DocumentBackend,
    error::{StorageError, StorageResult},
    types::Collection,
};

/// Rendering of an absent transaction hash.
pub const NO_TX_HASH: &str = "N/A";

/// Outcome recorded on an audit entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AuditStatus {
    /// The action completed.
    Success,
    /// The action failed; `details` carries the reason.
    Failed,
    /// A ledger event was folded into an existing or new record.
    Upserted,
}

impl fmt::Display for AuditStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "Success"),
            Self::Failed => write!(f, "Failed"),
            Self::Upserted => write!(f, "Upserted"),
        }
    }
}

/// Who triggered a verification, rendered as the action prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifierScope {
    /// An administrator.
    Admin,
    /// A patient.
    Patient,
    /// Any other role.
    Other,
}

/// Result tag of a verification audit entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyResult {
    /// No local record.
    NotFound,
    /// The record was flagged as a mismatch.
    Flagged,
    /// The record was confirmed.
    Authentic,
    /// The ledger confirmed but an administrator flag was kept.
    AdminFlagRetained,
    /// The ledger could not be consulted.
    Error,
}

/// The actions written to the audit trail.
///
/// Stored entries carry the rendered tag as a free-form string; this enum is
/// the set of tags the core produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditAction {
    /// A manufacturer added a drug.
    AddDrug,
    /// A supply-chain participant changed a drug's status.
    UpdateDrugStatus,
    /// A `DrugAdded` ledger event was applied.
    DrugSyncedFromBlockchain,
    /// A `HistoryUpdated` ledger event was applied.
    DrugHistoryUpdatedOnChain,
    /// A `HistoryUpdated` ledger event referenced an unknown drug.
    HistoryUpdateFailedDrugNotFound,
    /// A ledger event could not be decoded or applied.
    ErrorProcessingLedgerEvent,
    /// An administrator flagged a drug.
    AdminManuallyFlaggedDrug,
    /// An administrator cleared a drug's flag.
    AdminUnflaggedDrug,
    /// A verification ran.
    Verify {
        /// Who asked.
        scope: VerifierScope,
        /// What it concluded.
        result: VerifyResult,
    },
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AddDrug => write!(f, "Add Drug"),
            Self::UpdateDrugStatus => write!(f, "Update Drug Status"),
            Self::DrugSyncedFromBlockchain => write!(f, "Drug Synced From Blockchain"),
            Self::DrugHistoryUpdatedOnChain => write!(f, "Drug History Updated On-Chain"),
            Self::HistoryUpdateFailedDrugNotFound => {
                write!(f, "History Update Failed (Drug Not Found)")
            },
            Self::ErrorProcessingLedgerEvent => write!(f, "Error Processing Ledger Event"),
            Self::AdminManuallyFlaggedDrug => write!(f, "Admin Manually Flagged Drug"),
            Self::AdminUnflaggedDrug => write!(f, "Admin Unflagged Drug"),
            Self::Verify { scope, result } => {
                let prefix = match scope {
                    VerifierScope::Admin => "Admin ",
                    VerifierScope::Patient => "Patient ",
                    VerifierScope::Other => "",
                };
                let tag = match result {
                    VerifyResult::NotFound => "Not Found",
                    VerifyResult::Flagged => "Flagged",
                    VerifyResult::Authentic => "Authentic",
                    VerifyResult::AdminFlagRetained => "Admin Flag Retained",
                    VerifyResult::Error => "Error",
                };
                write!(f, "{prefix}Verify ({tag})")
            },
        }
    }
}

impl From<AuditAction> for String {
    fn from(action: AuditAction) -> Self {
        action.to_string()
    }
}

/// An immutable audit trail record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bon::Builder)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    /// Time-ordered unique id (generated).
    #[builder(default = Uuid::now_v7())]
    pub id: Uuid,
    /// When the action happened (defaults to now).
    #[builder(default = Utc::now())]
    pub timestamp: DateTime<Utc>,
    /// Acting user, or `Blockchain Listener` for ledger events.
    #[builder(into)]
    pub user_name: String,
    /// Action tag.
    #[builder(into)]
    pub action: String,
    /// Human-readable context.
    #[builder(into, default)]
    pub details: String,
    /// Ledger transaction hash, if the action produced or consumed one.
    #[builder(into)]
    pub tx_hash: Option<String>,
    /// Outcome.
    #[builder(default = AuditStatus::Success)]
    pub status: AuditStatus,
}

impl AuditEntry {
    /// The transaction hash, or [`NO_TX_HASH`].
    pub fn tx_hash_display(&self) -> &str {
        self.tx_hash.as_deref().unwrap_or(NO_TX_HASH)
    }
}

/// How [`AuditTrail::count_by_action`] compares action tags.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionFilter {
    /// Tag equals the given string.
    Exact(String),
    /// Tag starts with the given string.
    Prefix(String),
}

impl ActionFilter {
    /// Matches `action` exactly.
    pub fn exact(action: impl Into<String>) -> Self {
        Self::Exact(action.into())
    }

    /// Matches tags starting with `prefix`.
    pub fn prefix(prefix: impl Into<String>) -> Self {
        Self::Prefix(prefix.into())
    }

    /// Returns `true` if `action` satisfies the filter.
    pub fn matches(&self, action: &str) -> bool {
        match self {
            Self::Exact(expected) => action == expected,
            Self::Prefix(prefix) => action.starts_with(prefix.as_str()),
        }
    }
}

/// Append-only audit trail over a [`DocumentBackend`].
#[derive(Debug, Clone)]
pub struct AuditTrail<B> {
    backend: B,
}

impl<B: DocumentBackend> AuditTrail<B> {
    /// Creates a trail writing to `backend`.
    pub fn new(backend: B) -> Self {
        Self { backend }
    }

    /// Appends `entry` and mirrors it as a `tracing` event.
    #[instrument(skip(self, entry), fields(action = %entry.action, status = %entry.status))]
    pub async fn record(&self, entry: AuditEntry) -> StorageResult<()> {
        fail_point!("audit-record", |_| Err(StorageError::connection("injected audit failure")));
        self.backend.insert_json(Collection::AuditLog, &entry.id.to_string(), &entry).await?;
        emit(&entry);
        Ok(())
    }

    /// Every entry, newest first.
    #[instrument(skip(self))]
    pub async fn find_all(&self) -> StorageResult<Vec<AuditEntry>> {
        let mut entries = Vec::new();
        for doc in self.backend.scan(Collection::AuditLog).await? {
            let entry: AuditEntry = serde_json::from_slice(&doc.value).map_err(|e| {
                StorageError::serialization_with_source(format!("corrupt audit entry {}", doc.id), e)
            })?;
            entries.push(entry);
        }
        entries.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then_with(|| b.id.cmp(&a.id)));
        Ok(entries)
    }

    /// Counts entries whose action matches `filter`.
    pub async fn count_by_action(&self, filter: &ActionFilter) -> StorageResult<usize> {
        self.count_where(|entry| filter.matches(&entry.action)).await
    }

    /// Counts entries with the given status, optionally restricted by action.
    pub async fn count_by_status(
        &self,
        status: AuditStatus,
        filter: Option<&ActionFilter>,
    ) -> StorageResult<usize> {
        self.count_where(|entry| {
            entry.status == status && filter.is_none_or(|f| f.matches(&entry.action))
        })
        .await
    }

    async fn count_where(&self, predicate: impl Fn(&AuditEntry) -> bool) -> StorageResult<usize> {
        Ok(self.find_all().await?.iter().filter(|entry| predicate(entry)).count())
    }
}

fn emit(entry: &AuditEntry) {
    tracing::info!(
        audit.id = %entry.id,
        audit.timestamp = %entry.timestamp.to_rfc3339(),
        audit.user = %entry.user_name,
        audit.action = %entry.action,
        audit.details = %entry.details,
        audit.tx_hash = %entry.tx_hash_display(),
        audit.status = %entry.status,
        "audit_event"
    );
}
