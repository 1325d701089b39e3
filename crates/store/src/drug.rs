//! The drug record and the values used to create and change it.
//!
//! A [`Drug`] can only be changed through its mutating methods, which keep two
//! invariants:
//!
//! - `status` and `current_owner` always equal the last history entry, because
//!   they are only ever written together with an appended entry.
//! - `is_flagged` is `true` exactly when a [`FlagSource`] is recorded.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One state transition in a drug's custody history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bon::Builder)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    /// Lifecycle status after the transition.
    #[builder(into)]
    pub status: String,
    /// Who recorded the transition (a role name or `Blockchain Listener`).
    #[builder(into)]
    pub updated_by: String,
    /// Custodian after the transition.
    #[builder(into)]
    pub owner: String,
    /// When the transition was recorded (defaults to now).
    #[builder(default = Utc::now())]
    pub timestamp: DateTime<Utc>,
    /// Ledger transaction that carried the transition, when known.
    #[builder(into)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tx_hash: Option<String>,
}

/// Why a drug is flagged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlagSource {
    /// Off-chain and on-chain state disagreed during verification.
    Mismatch,
    /// An administrator flagged the drug manually.
    Administrator,
}

/// A drug tracked through the supply chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Drug {
    id: String,
    name: String,
    manufacturer: String,
    current_owner: String,
    status: String,
    is_verified: bool,
    is_flagged: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    flag_source: Option<FlagSource>,
    history: Vec<HistoryEntry>,
}

impl Drug {
    /// Builds a new record whose history starts with `seed`.
    pub(crate) fn create(id: &str, patch: &DrugPatch, seed: HistoryEntry) -> Self {
        let flag_source = match patch.is_flagged {
            Some(true) => Some(FlagSource::Mismatch),
            _ => None,
        };
        Self {
            id: id.to_owned(),
            name: patch.name.clone(),
            manufacturer: patch.manufacturer.clone(),
            current_owner: seed.owner.clone(),
            status: seed.status.clone(),
            is_verified: patch.is_verified.unwrap_or(false),
            is_flagged: flag_source.is_some(),
            flag_source,
            history: vec![seed],
        }
    }

    /// Stable external identifier.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Product name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Manufacturer that created the record.
    pub fn manufacturer(&self) -> &str {
        &self.manufacturer
    }

    /// Current custodian.
    pub fn current_owner(&self) -> &str {
        &self.current_owner
    }

    /// Current lifecycle status.
    pub fn status(&self) -> &str {
        &self.status
    }

    /// Whether the record has been confirmed.
    pub fn is_verified(&self) -> bool {
        self.is_verified
    }

    /// Whether the record is flagged.
    pub fn is_flagged(&self) -> bool {
        self.is_flagged
    }

    /// Why the record is flagged, if it is.
    pub fn flag_source(&self) -> Option<FlagSource> {
        self.flag_source
    }

    /// Whether an administrator flag is set.
    pub fn has_administrator_flag(&self) -> bool {
        self.flag_source == Some(FlagSource::Administrator)
    }

    /// Custody history, oldest first.
    pub fn history(&self) -> &[HistoryEntry] {
        &self.history
    }

    /// Returns `true` if a history entry was already recorded for `tx_hash`.
    pub fn has_transaction(&self, tx_hash: &str) -> bool {
        self.history.iter().any(|entry| entry.tx_hash.as_deref() == Some(tx_hash))
    }

    pub(crate) fn push_history(&mut self, entry: HistoryEntry) {
        self.status.clone_from(&entry.status);
        self.current_owner.clone_from(&entry.owner);
        self.history.push(entry);
    }

    /// Replaces the entry recorded for `tx_hash` with `entry`, keeping the
    /// original position and timestamp. Status and owner follow when the entry
    /// is the last one.
    ///
    /// Returns `None` if no entry carries `tx_hash`, otherwise whether the
    /// history changed.
    pub(crate) fn claim_transaction(
        &mut self,
        tx_hash: &str,
        entry: &HistoryEntry,
    ) -> Option<bool> {
        let last = self.history.len().checked_sub(1)?;
        let (index, slot) = self
            .history
            .iter_mut()
            .enumerate()
            .find(|(_, existing)| existing.tx_hash.as_deref() == Some(tx_hash))?;
        let claimed = HistoryEntry { timestamp: slot.timestamp, ..entry.clone() };
        if *slot == claimed {
            return Some(false);
        }
        *slot = claimed;
        if index == last {
            self.status.clone_from(&entry.status);
            self.current_owner.clone_from(&entry.owner);
        }
        Some(true)
    }

    /// Takes name and manufacturer from `patch`.
    pub(crate) fn set_identity(&mut self, patch: &DrugPatch) {
        self.name.clone_from(&patch.name);
        self.manufacturer.clone_from(&patch.manufacturer);
    }

    pub(crate) fn set_flag(&mut self, source: Option<FlagSource>) {
        self.flag_source = source;
        self.is_flagged = source.is_some();
    }

    pub(crate) fn set_verified(&mut self, verified: bool) {
        self.is_verified = verified;
    }

    /// Applies the verification fields of `patch`.
    ///
    /// Clearing never removes an administrator flag; raising keeps an
    /// existing source.
    pub(crate) fn merge(&mut self, patch: &DrugPatch) {
        if let Some(verified) = patch.is_verified {
            self.is_verified = verified;
        }
        match patch.is_flagged {
            Some(true) if self.flag_source.is_none() => self.set_flag(Some(FlagSource::Mismatch)),
            Some(false) if !self.has_administrator_flag() => self.set_flag(None),
            _ => {},
        }
    }
}

/// Field values for [`DrugRecords::upsert_drug`](crate::DrugRecords::upsert_drug).
///
/// `name` and `manufacturer` are only used when the record is created or
/// claimed by [`DrugRecords::claim_drug`](crate::DrugRecords::claim_drug). The
/// optional verification fields are applied on both paths; `None` leaves the
/// stored value alone.
#[derive(Debug, Clone, PartialEq, Eq, bon::Builder)]
pub struct DrugPatch {
    /// Product name for a newly created record.
    #[builder(into)]
    pub name: String,
    /// Manufacturer for a newly created record.
    #[builder(into)]
    pub manufacturer: String,
    /// New value of `isVerified`.
    pub is_verified: Option<bool>,
    /// New value of `isFlagged`.
    pub is_flagged: Option<bool>,
}

/// Criteria for listing and counting drugs. Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, bon::Builder)]
pub struct DrugFilter {
    /// Match on the flagged state.
    pub flagged: Option<bool>,
    /// Match on the verified state.
    pub verified: Option<bool>,
    /// Match on the manufacturer.
    #[builder(into)]
    pub manufacturer: Option<String>,
    /// Match on the current owner.
    #[builder(into)]
    pub owner: Option<String>,
}

impl DrugFilter {
    /// A filter that matches every drug.
    pub fn all() -> Self {
        Self::default()
    }

    /// Returns `true` if `drug` satisfies every set criterion.
    pub fn matches(&self, drug: &Drug) -> bool {
        self.flagged.is_none_or(|f| drug.is_flagged() == f)
            && self.verified.is_none_or(|v| drug.is_verified() == v)
            && self.manufacturer.as_deref().is_none_or(|m| drug.manufacturer() == m)
            && self.owner.as_deref().is_none_or(|o| drug.current_owner() == o)
    }
}

/// What a verification concluded, applied by
/// [`DrugRecords::record_verification`](crate::DrugRecords::record_verification).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerificationDecision {
    /// The ledger holds a matching record.
    LedgerConfirmed {
        /// Clear an administrator flag as well (the actor is an administrator).
        clear_administrator_flag: bool,
    },
    /// The ledger has no matching record.
    LedgerMismatch,
}

/// The change [`VerificationDecision`] made to the current record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerificationEffect {
    /// Flag cleared and record marked verified.
    Authentic,
    /// Ledger matched but an administrator flag was kept.
    AdministratorFlagRetained,
    /// Record flagged as a mismatch.
    Flagged,
}

impl VerificationDecision {
    /// Applies the decision to `drug`, evaluated against its current flag.
    pub(crate) fn apply(self, drug: &mut Drug) -> VerificationEffect {
        match self {
            Self::LedgerConfirmed { clear_administrator_flag } => {
                if drug.has_administrator_flag() && !clear_administrator_flag {
                    VerificationEffect::AdministratorFlagRetained
                } else {
                    drug.set_flag(None);
                    drug.set_verified(true);
                    VerificationEffect::Authentic
                }
            },
            Self::LedgerMismatch => {
                if !drug.is_flagged() {
                    drug.set_flag(Some(FlagSource::Mismatch));
                }
                VerificationEffect::Flagged
            },
        }
    }
}

/// Result of [`DrugRecords::upsert_drug`](crate::DrugRecords::upsert_drug).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// A new record was created.
    Inserted(Drug),
    /// An existing record was merged (possibly without changes).
    Updated(Drug),
}

impl UpsertOutcome {
    /// The resulting record.
    pub fn drug(&self) -> &Drug {
        match self {
            Self::Inserted(drug) | Self::Updated(drug) => drug,
        }
    }

    /// Consumes the outcome, returning the record.
    pub fn into_drug(self) -> Drug {
        match self {
            Self::Inserted(drug) | Self::Updated(drug) => drug,
        }
    }

    /// Whether a new record was created.
    pub fn is_inserted(&self) -> bool {
        matches!(self, Self::Inserted(_))
    }
}

/// Result of [`DrugRecords::append_history`](crate::DrugRecords::append_history)
/// and [`DrugRecords::claim_history`](crate::DrugRecords::claim_history).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppendOutcome {
    /// The entry was appended.
    Appended(Drug),
    /// The entry replaced one recorded earlier for the same transaction.
    Replaced(Drug),
    /// An entry for the same transaction already exists; nothing was written.
    Duplicate(Drug),
}

impl AppendOutcome {
    /// The resulting record.
    pub fn drug(&self) -> &Drug {
        match self {
            Self::Appended(drug) | Self::Replaced(drug) | Self::Duplicate(drug) => drug,
        }
    }

    /// Consumes the outcome, returning the record.
    pub fn into_drug(self) -> Drug {
        match self {
            Self::Appended(drug) | Self::Replaced(drug) | Self::Duplicate(drug) => drug,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use rstest::rstest;

    use super::*;

    fn seed() -> HistoryEntry {
        HistoryEntry::builder().status("Manufactured").updated_by("manufacturer").owner("Acme").build()
    }

    fn patch(is_verified: Option<bool>, is_flagged: Option<bool>) -> DrugPatch {
        DrugPatch::builder()
            .name("Aspirin")
            .manufacturer("Acme")
            .maybe_is_verified(is_verified)
            .maybe_is_flagged(is_flagged)
            .build()
    }

    #[test]
    fn test_create_seeds_history_and_fields() {
        let drug = Drug::create("1001", &patch(Some(true), None), seed());
        assert_eq!(drug.status(), "Manufactured");
        assert_eq!(drug.current_owner(), "Acme");
        assert_eq!(drug.history().len(), 1);
        assert!(drug.is_verified());
        assert!(!drug.is_flagged());
    }

    #[test]
    fn test_push_history_moves_status_and_owner() {
        let mut drug = Drug::create("1001", &patch(None, None), seed());
        drug.push_history(
            HistoryEntry::builder().status("Distributed").updated_by("supplier").owner("Dist Co").build(),
        );
        assert_eq!(drug.status(), "Distributed");
        assert_eq!(drug.current_owner(), "Dist Co");
        assert_eq!(drug.history().last().unwrap().status, drug.status());
    }

    #[test]
    fn test_claim_transaction_rewrites_mirrored_entry() {
        let mut drug = Drug::create("1001", &patch(None, None), seed());
        let mirrored = HistoryEntry::builder()
            .status("Distributed by Dist Co (supplier)")
            .updated_by("Blockchain Listener")
            .owner("0xabc")
            .tx_hash("0x01")
            .build();
        drug.push_history(mirrored.clone());
        let local = HistoryEntry::builder()
            .status("Distributed")
            .updated_by("supplier")
            .owner("Dist Co")
            .tx_hash("0x01")
            .build();

        assert_eq!(drug.claim_transaction("0x01", &local), Some(true));
        assert_eq!(drug.history().len(), 2);
        assert_eq!(drug.history()[1].timestamp, mirrored.timestamp);
        assert_eq!(drug.history()[1].updated_by, "supplier");
        assert_eq!(drug.current_owner(), "Dist Co");
        assert_eq!(drug.status(), "Distributed");

        assert_eq!(drug.claim_transaction("0x01", &local), Some(false));
        assert_eq!(drug.claim_transaction("0x02", &local), None);
    }

    #[test]
    fn test_claiming_an_older_entry_keeps_current_state() {
        let mut drug = Drug::create(
            "1001",
            &patch(None, None),
            HistoryEntry::builder()
                .status("Manufactured (On-Chain)")
                .updated_by("Blockchain Listener")
                .owner("0xabc")
                .tx_hash("0x01")
                .build(),
        );
        drug.push_history(
            HistoryEntry::builder().status("Received").updated_by("hospital").owner("City").build(),
        );

        let local = seed();
        let local = HistoryEntry { tx_hash: Some("0x01".into()), ..local };
        assert_eq!(drug.claim_transaction("0x01", &local), Some(true));
        assert_eq!(drug.history()[0].owner, "Acme");
        assert_eq!(drug.current_owner(), "City");
        assert_eq!(drug.status(), "Received");
    }

    #[test]
    fn test_merge_never_clears_administrator_flag() {
        let mut drug = Drug::create("1001", &patch(None, None), seed());
        drug.set_flag(Some(FlagSource::Administrator));
        drug.merge(&patch(Some(true), Some(false)));
        assert!(drug.is_flagged());
        assert_eq!(drug.flag_source(), Some(FlagSource::Administrator));
        assert!(drug.is_verified());
    }

    #[rstest]
    #[case::confirmed_clean(None, false, VerificationEffect::Authentic, None)]
    #[case::confirmed_clears_mismatch(
        Some(FlagSource::Mismatch),
        false,
        VerificationEffect::Authentic,
        None
    )]
    #[case::admin_flag_retained(
        Some(FlagSource::Administrator),
        false,
        VerificationEffect::AdministratorFlagRetained,
        Some(FlagSource::Administrator)
    )]
    #[case::admin_override(
        Some(FlagSource::Administrator),
        true,
        VerificationEffect::Authentic,
        None
    )]
    fn test_confirmed_decision(
        #[case] initial: Option<FlagSource>,
        #[case] clear_administrator_flag: bool,
        #[case] effect: VerificationEffect,
        #[case] flag_after: Option<FlagSource>,
    ) {
        let mut drug = Drug::create("1001", &patch(None, None), seed());
        drug.set_flag(initial);
        let got = VerificationDecision::LedgerConfirmed { clear_administrator_flag }.apply(&mut drug);
        assert_eq!(got, effect);
        assert_eq!(drug.flag_source(), flag_after);
        assert_eq!(drug.is_flagged(), flag_after.is_some());
    }

    #[test]
    fn test_mismatch_keeps_existing_source() {
        let mut drug = Drug::create("1001", &patch(None, None), seed());
        drug.set_flag(Some(FlagSource::Administrator));
        let effect = VerificationDecision::LedgerMismatch.apply(&mut drug);
        assert_eq!(effect, VerificationEffect::Flagged);
        assert_eq!(drug.flag_source(), Some(FlagSource::Administrator));
    }

    #[test]
    fn test_filter_matches() {
        let drug = Drug::create("1001", &patch(Some(true), None), seed());
        assert!(DrugFilter::all().matches(&drug));
        assert!(DrugFilter::builder().manufacturer("Acme").verified(true).build().matches(&drug));
        assert!(!DrugFilter::builder().flagged(true).build().matches(&drug));
        assert!(!DrugFilter::builder().owner("Someone Else").build().matches(&drug));
    }

    #[test]
    fn test_json_shape_is_camel_case() {
        let drug = Drug::create("1001", &patch(None, None), seed());
        let json = serde_json::to_value(&drug).unwrap();
        assert_eq!(json["currentOwner"], "Acme");
        assert_eq!(json["isFlagged"], false);
        assert!(json.get("flagSource").is_none());
        assert_eq!(json["history"][0]["updatedBy"], "manufacturer");
    }
}
