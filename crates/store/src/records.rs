//! Drug record repository.
//!
//! [`DrugRecords`] owns every write to the drug collection. Each mutation is a
//! read-modify-write cycle guarded by a compare-and-swap on the bytes that were
//! read, retried on conflict through [`with_cas_retry`]. Writes to different
//! ids never contend; concurrent writes to the same id are serialised and
//! never lose an update.

use tracing::instrument;

use crate::{
    backend::DocumentBackend,
    drug::{
        AppendOutcome, Drug, DrugFilter, DrugPatch, FlagSource, HistoryEntry, UpsertOutcome,
        VerificationDecision, VerificationEffect,
    },
    error::{StorageError, StorageResult},
    retry::{CasRetryConfig, with_cas_retry},
    types::Collection,
};

/// Outcome of a mutation closure: whether the record must be written back.
enum Step<T> {
    Write(T),
    Unchanged(T),
}

/// Repository of [`Drug`] records over a [`DocumentBackend`].
///
/// Cloning is as cheap as cloning the backend.
#[derive(Debug, Clone)]
pub struct DrugRecords<B> {
    backend: B,
    cas_retry: CasRetryConfig,
}

impl<B: DocumentBackend> DrugRecords<B> {
    /// Creates a repository with the default [`CasRetryConfig`].
    pub fn new(backend: B) -> Self {
        Self::with_cas_retry_config(backend, CasRetryConfig::default())
    }

    /// Creates a repository with a custom CAS retry policy.
    pub fn with_cas_retry_config(backend: B, cas_retry: CasRetryConfig) -> Self {
        Self { backend, cas_retry }
    }

    /// Returns the underlying backend.
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Atomically finds or creates the record for `id`.
    ///
    /// On insert the record is built from `patch` and its history is seeded
    /// with exactly `seed`. On an existing record only the verification fields
    /// of `patch` are merged; history, status, owner, name and manufacturer are
    /// left untouched, and an administrator flag is never cleared. Replaying
    /// the same call is therefore idempotent.
    #[instrument(skip(self, patch, seed), fields(drug_id = %id))]
    pub async fn upsert_drug(
        &self,
        id: &str,
        patch: &DrugPatch,
        seed: &HistoryEntry,
    ) -> StorageResult<UpsertOutcome> {
        self.upsert(id, patch, seed, false).await
    }

    /// Records a drug whose creation was just committed to the ledger.
    ///
    /// Behaves like [`upsert_drug`](Self::upsert_drug), except that a record
    /// already seeded from the ledger event for the seed's transaction is
    /// claimed: its name and manufacturer come from `patch` and its seed
    /// entry is replaced by `seed`, in the same write as the merge.
    #[instrument(skip(self, patch, seed), fields(drug_id = %id))]
    pub async fn claim_drug(
        &self,
        id: &str,
        patch: &DrugPatch,
        seed: &HistoryEntry,
    ) -> StorageResult<UpsertOutcome> {
        self.upsert(id, patch, seed, true).await
    }

    async fn upsert(
        &self,
        id: &str,
        patch: &DrugPatch,
        seed: &HistoryEntry,
        claim: bool,
    ) -> StorageResult<UpsertOutcome> {
        with_cas_retry(&self.cas_retry, || async move {
            match self.backend.get_json::<Drug>(Collection::Drugs, id).await? {
                None => {
                    let drug = Drug::create(id, patch, seed.clone());
                    // A concurrent insert surfaces as Conflict and re-runs the cycle
                    // down the merge path.
                    self.backend.insert_json(Collection::Drugs, id, &drug).await?;
                    tracing::debug!("drug record created");
                    Ok(UpsertOutcome::Inserted(drug))
                },
                Some((current, raw)) => {
                    let mut merged = current.clone();
                    if claim
                        && let Some(tx) = seed.tx_hash.as_deref()
                        && merged.claim_transaction(tx, seed).is_some()
                    {
                        merged.set_identity(patch);
                    }
                    merged.merge(patch);
                    if merged != current {
                        let bytes = serde_json::to_vec(&merged)?;
                        self.backend.compare_and_swap(Collection::Drugs, id, &raw, bytes).await?;
                    }
                    Ok(UpsertOutcome::Updated(merged))
                },
            }
        })
        .await
    }

    /// Appends `entry` to the history of `id` and moves `status` and
    /// `current_owner` to the entry's values in the same write.
    ///
    /// An entry carrying a transaction hash that is already present in the
    /// history is not appended again; the call returns
    /// [`AppendOutcome::Duplicate`].
    ///
    /// # Errors
    ///
    /// [`StorageError::NotFound`] if no record exists for `id`.
    #[instrument(skip(self, entry), fields(drug_id = %id, status = %entry.status))]
    pub async fn append_history(&self, id: &str, entry: HistoryEntry) -> StorageResult<AppendOutcome> {
        let entry = &entry;
        self.update(id, |drug| {
            if let Some(tx) = entry.tx_hash.as_deref()
                && drug.has_transaction(tx)
            {
                return Step::Unchanged(false);
            }
            drug.push_history(entry.clone());
            Step::Write(true)
        })
        .await
        .map(|(appended, drug)| {
            if appended { AppendOutcome::Appended(drug) } else { AppendOutcome::Duplicate(drug) }
        })
    }

    /// Records a history entry for a transaction this node just committed.
    ///
    /// Behaves like [`append_history`](Self::append_history), except that an
    /// entry mirrored from the ledger event for the same transaction is
    /// replaced by `entry` ([`AppendOutcome::Replaced`]). When it is the last
    /// entry, `status` and `current_owner` move to `entry` in the same write.
    ///
    /// # Errors
    ///
    /// [`StorageError::NotFound`] if no record exists for `id`.
    #[instrument(skip(self, entry), fields(drug_id = %id, status = %entry.status))]
    pub async fn claim_history(&self, id: &str, entry: HistoryEntry) -> StorageResult<AppendOutcome> {
        let entry = &entry;
        self.update(id, |drug| {
            let claimed = entry.tx_hash.as_deref().and_then(|tx| drug.claim_transaction(tx, entry));
            let outcome: fn(Drug) -> AppendOutcome = match claimed {
                Some(true) => AppendOutcome::Replaced,
                Some(false) => AppendOutcome::Duplicate,
                None => {
                    drug.push_history(entry.clone());
                    AppendOutcome::Appended
                },
            };
            if claimed == Some(false) { Step::Unchanged(outcome) } else { Step::Write(outcome) }
        })
        .await
        .map(|(outcome, drug)| outcome(drug))
    }

    /// Sets or clears the flag of `id`.
    ///
    /// # Errors
    ///
    /// [`StorageError::NotFound`] if no record exists for `id`.
    #[instrument(skip(self), fields(drug_id = %id))]
    pub async fn set_flag(&self, id: &str, flag: Option<FlagSource>) -> StorageResult<Drug> {
        self.update(id, |drug| {
            if drug.flag_source() == flag {
                return Step::Unchanged(());
            }
            drug.set_flag(flag);
            Step::Write(())
        })
        .await
        .map(|((), drug)| drug)
    }

    /// Applies a verification decision to the current state of `id`.
    ///
    /// The decision is evaluated inside the CAS cycle, so an administrator
    /// flag written concurrently is seen and honoured rather than overwritten.
    ///
    /// # Errors
    ///
    /// [`StorageError::NotFound`] if no record exists for `id`.
    #[instrument(skip(self), fields(drug_id = %id))]
    pub async fn record_verification(
        &self,
        id: &str,
        decision: VerificationDecision,
    ) -> StorageResult<(VerificationEffect, Drug)> {
        self.update(id, |drug| {
            let before = drug.clone();
            let effect = decision.apply(drug);
            if *drug == before { Step::Unchanged(effect) } else { Step::Write(effect) }
        })
        .await
    }

    /// Fetches the record for `id`.
    #[instrument(skip(self), fields(drug_id = %id))]
    pub async fn find_by_id(&self, id: &str) -> StorageResult<Option<Drug>> {
        Ok(self.backend.get_json::<Drug>(Collection::Drugs, id).await?.map(|(drug, _)| drug))
    }

    /// Lists the records matching `filter`, ordered by id.
    #[instrument(skip(self))]
    pub async fn find_all(&self, filter: &DrugFilter) -> StorageResult<Vec<Drug>> {
        let mut drugs = Vec::new();
        for doc in self.backend.scan(Collection::Drugs).await? {
            let drug: Drug = serde_json::from_slice(&doc.value).map_err(|e| {
                StorageError::serialization_with_source(format!("corrupt drug record {}", doc.id), e)
            })?;
            if filter.matches(&drug) {
                drugs.push(drug);
            }
        }
        Ok(drugs)
    }

    /// Counts the records matching `filter`.
    pub async fn count(&self, filter: &DrugFilter) -> StorageResult<usize> {
        Ok(self.find_all(filter).await?.len())
    }

    /// Runs `mutate` against the current record inside a CAS retry loop.
    async fn update<F, T>(&self, id: &str, mutate: F) -> StorageResult<(T, Drug)>
    where
        F: Fn(&mut Drug) -> Step<T> + Sync,
        T: Send,
    {
        let mutate = &mutate;
        with_cas_retry(&self.cas_retry, || async move {
            let (mut drug, raw) = self
                .backend
                .get_json::<Drug>(Collection::Drugs, id)
                .await?
                .ok_or_else(|| StorageError::not_found(id))?;
            match mutate(&mut drug) {
                Step::Unchanged(value) => Ok((value, drug)),
                Step::Write(value) => {
                    let bytes = serde_json::to_vec(&drug)?;
                    self.backend.compare_and_swap(Collection::Drugs, id, &raw, bytes).await?;
                    Ok((value, drug))
                },
            }
        })
        .await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::MemoryBackend;

    fn records() -> DrugRecords<MemoryBackend> {
        DrugRecords::new(MemoryBackend::new())
    }

    fn patch() -> DrugPatch {
        DrugPatch::builder().name("Aspirin").manufacturer("Acme").is_verified(true).build()
    }

    fn entry(status: &str, owner: &str) -> HistoryEntry {
        HistoryEntry::builder().status(status).updated_by("test").owner(owner).build()
    }

    #[tokio::test]
    async fn test_upsert_inserts_then_merges() {
        let records = records();
        let first = records.upsert_drug("1001", &patch(), &entry("Manufactured", "Acme")).await.unwrap();
        assert!(first.is_inserted());

        let second = records
            .upsert_drug("1001", &patch(), &entry("Manufactured (On-Chain)", "0xabc"))
            .await
            .unwrap();
        assert!(!second.is_inserted());
        assert_eq!(second.drug().status(), "Manufactured");
        assert_eq!(second.drug().history().len(), 1);
    }

    #[tokio::test]
    async fn test_append_history_unknown_id() {
        let err = records().append_history("404", entry("Distributed", "X")).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_append_history_dedups_by_transaction() {
        let records = records();
        records.upsert_drug("1001", &patch(), &entry("Manufactured", "Acme")).await.unwrap();
        let tx_entry = HistoryEntry::builder()
            .status("Distributed")
            .updated_by("supplier")
            .owner("Dist Co")
            .tx_hash("0xfeed")
            .build();

        let first = records.append_history("1001", tx_entry.clone()).await.unwrap();
        assert!(matches!(first, AppendOutcome::Appended(_)));
        let again = records.append_history("1001", tx_entry).await.unwrap();
        assert!(matches!(again, AppendOutcome::Duplicate(_)));
        assert_eq!(again.drug().history().len(), 2);
    }

    fn mirrored(status: &str, owner: &str, tx: &str) -> HistoryEntry {
        HistoryEntry::builder()
            .status(status)
            .updated_by("Blockchain Listener")
            .owner(owner)
            .tx_hash(tx)
            .build()
    }

    fn local(status: &str, owner: &str, tx: &str) -> HistoryEntry {
        HistoryEntry::builder()
            .status(status)
            .updated_by("supplier")
            .owner(owner)
            .tx_hash(tx)
            .build()
    }

    #[tokio::test]
    async fn test_claim_history_replaces_mirrored_entry() {
        let records = records();
        records.upsert_drug("1001", &patch(), &entry("Manufactured", "Acme")).await.unwrap();
        records
            .append_history("1001", mirrored("Distributed by Dist Co (supplier)", "Acme", "0x02"))
            .await
            .unwrap();

        let claimed =
            records.claim_history("1001", local("Distributed", "Dist Co", "0x02")).await.unwrap();
        assert!(matches!(claimed, AppendOutcome::Replaced(_)));
        let drug = records.find_by_id("1001").await.unwrap().unwrap();
        assert_eq!(drug.history().len(), 2);
        assert_eq!(drug.history()[1].updated_by, "supplier");
        assert_eq!(drug.current_owner(), "Dist Co");
        assert_eq!(drug.status(), "Distributed");

        let again =
            records.claim_history("1001", local("Distributed", "Dist Co", "0x02")).await.unwrap();
        assert!(matches!(again, AppendOutcome::Duplicate(_)));

        let echo = mirrored("Distributed by Dist Co (supplier)", "Dist Co", "0x02");
        let echo = records.append_history("1001", echo).await.unwrap();
        assert!(matches!(echo, AppendOutcome::Duplicate(_)));
        assert_eq!(echo.drug().current_owner(), "Dist Co");
    }

    #[tokio::test]
    async fn test_claim_history_appends_new_transactions() {
        let records = records();
        records.upsert_drug("1001", &patch(), &entry("Manufactured", "Acme")).await.unwrap();
        let appended =
            records.claim_history("1001", local("Distributed", "Dist Co", "0x02")).await.unwrap();
        assert!(matches!(appended, AppendOutcome::Appended(_)));
        assert_eq!(appended.drug().history().len(), 2);
    }

    #[tokio::test]
    async fn test_claim_drug_takes_over_ledger_seeded_record() {
        let records = records();
        let wallet_patch = DrugPatch::builder()
            .name("Aspirin")
            .manufacturer("0xabc")
            .is_verified(true)
            .is_flagged(false)
            .build();
        let on_chain = mirrored("Manufactured (On-Chain)", "0xabc", "0x01");
        records.upsert_drug("1001", &wallet_patch, &on_chain).await.unwrap();

        let seed = HistoryEntry::builder()
            .status("Manufactured")
            .updated_by("manufacturer")
            .owner("Acme")
            .tx_hash("0x01")
            .build();
        let claimed = records.claim_drug("1001", &patch(), &seed).await.unwrap();
        assert!(!claimed.is_inserted());
        let drug = claimed.drug();
        assert_eq!(drug.manufacturer(), "Acme");
        assert_eq!(drug.current_owner(), "Acme");
        assert_eq!(drug.status(), "Manufactured");
        assert_eq!(drug.history().len(), 1);
        assert!(drug.is_verified());

        let by_maker = DrugFilter::builder().manufacturer("Acme").build();
        assert_eq!(records.count(&by_maker).await.unwrap(), 1);

        let replayed = records.upsert_drug("1001", &wallet_patch, &on_chain).await.unwrap();
        assert_eq!(replayed.drug().manufacturer(), "Acme");
        assert_eq!(replayed.drug().status(), "Manufactured");
    }

    #[tokio::test]
    async fn test_claim_drug_leaves_unrelated_record_alone() {
        let records = records();
        records.upsert_drug("1001", &patch(), &entry("Manufactured", "Acme")).await.unwrap();
        let other = DrugPatch::builder().name("Other").manufacturer("Rival").build();
        let seed = local("Manufactured", "Rival", "0x09");

        let outcome = records.claim_drug("1001", &other, &seed).await.unwrap();
        assert_eq!(outcome.drug().manufacturer(), "Acme");
        assert_eq!(outcome.drug().name(), "Aspirin");
        assert_eq!(outcome.drug().history().len(), 1);
    }

    #[tokio::test]
    async fn test_set_flag_and_filters() {
        let records = records();
        records.upsert_drug("1", &patch(), &entry("Manufactured", "Acme")).await.unwrap();
        records.upsert_drug("2", &patch(), &entry("Manufactured", "Acme")).await.unwrap();

        let drug = records.set_flag("2", Some(FlagSource::Administrator)).await.unwrap();
        assert!(drug.has_administrator_flag());

        let flagged = records.find_all(&DrugFilter::builder().flagged(true).build()).await.unwrap();
        assert_eq!(flagged.len(), 1);
        assert_eq!(flagged[0].id(), "2");
        assert_eq!(records.count(&DrugFilter::all()).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_record_verification_respects_admin_flag() {
        let records = records();
        records.upsert_drug("1", &patch(), &entry("Manufactured", "Acme")).await.unwrap();
        records.set_flag("1", Some(FlagSource::Administrator)).await.unwrap();

        let (effect, drug) = records
            .record_verification("1", VerificationDecision::LedgerConfirmed {
                clear_administrator_flag: false,
            })
            .await
            .unwrap();
        assert_eq!(effect, VerificationEffect::AdministratorFlagRetained);
        assert!(drug.is_flagged());
    }
}
