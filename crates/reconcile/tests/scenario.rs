//! End-to-end supply-chain scenarios over the mock ledger.

#![allow(clippy::expect_used, clippy::panic)]

use std::time::Duration;

use pharmatrace_ledger::{LedgerClient, OnChainDrug};
use pharmatrace_reconcile::{
    SyncState, VerificationOutcome,
    testutil::{
        admin, distributor, fast_sync_config, fixture, hospital, manufacturer, patient,
        wait_for_stats,
    },
};
use pharmatrace_store::{ActionFilter, AuditStatus, DrugFilter, FlagSource};
use proptest::prelude::*;

const OTHER_NODE: &str = "0x00000000000000000000000000000000000000c3";

fn zero_drug() -> OnChainDrug {
    OnChainDrug {
        id: "0".into(),
        name: String::new(),
        manufacturer: String::new(),
        history_raw: vec![],
    }
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_aspirin_lifecycle_ends_flagged_when_ledger_forgets_it() {
    let (chain, ledger) = fixture();

    let added = chain.add_drug(&manufacturer(), "1", "Aspirin").await.expect("add");
    assert_eq!(added.drug.history().len(), 1);
    assert_eq!(added.drug.status(), "Manufactured");

    let updated = chain.update_status(&distributor(), "1", "Distributed").await.expect("update");
    assert_eq!(updated.drug.history().len(), 2);
    assert_eq!(updated.drug.current_owner(), "Dist Co");
    assert_eq!(updated.drug.status(), "Distributed");

    ledger.override_query("1", Some(zero_drug()));
    let outcome = chain.verify(&patient(), "1").await.expect("verify");
    let VerificationOutcome::FlaggedMismatch(drug) = outcome else {
        panic!("expected a mismatch, got {outcome:?}");
    };
    assert!(drug.is_flagged());
    assert_eq!(drug.flag_source(), Some(FlagSource::Mismatch));
    assert_eq!(drug.history().len(), 2);
}

#[tokio::test]
async fn test_full_custody_chain_and_report() {
    let (chain, _ledger) = fixture();
    chain.add_drug(&manufacturer(), "42", "Amoxicillin").await.expect("add");
    chain.update_status(&distributor(), "42", "Distributed").await.expect("distribute");
    chain.update_status(&hospital(), "42", "Received").await.expect("receive");

    let drug = chain.get_drug(&patient(), "42").await.expect("get");
    let owners: Vec<&str> = drug.history().iter().map(|h| h.owner.as_str()).collect();
    assert_eq!(owners, ["Acme Pharma", "Dist Co", "City Hospital"]);

    let outcome = chain.verify(&patient(), "42").await.expect("verify");
    assert!(matches!(outcome, VerificationOutcome::Authentic(_)));

    let stats = chain.report(&admin()).await.expect("report");
    assert_eq!(stats.total_drugs, 1);
    assert_eq!(stats.total_transfers, 2);
    assert_eq!(stats.verified_drugs, 1);
    assert_eq!(stats.failed_actions, 0);
}

#[tokio::test]
async fn test_every_failed_write_is_audited_before_the_error() {
    let (chain, ledger) = fixture();
    chain.add_drug(&manufacturer(), "1", "Aspirin").await.expect("add");

    ledger.reject_next_submission("execution reverted: paused");
    let err =
        chain.update_status(&distributor(), "1", "Distributed").await.expect_err("rejected");
    assert_eq!(err.http_status(), 500);

    let log = chain.audit_log(&admin()).await.expect("log");
    assert_eq!(log[0].status, AuditStatus::Failed);
    assert_eq!(log[0].action, "Update Drug Status");
    assert!(log[0].details.contains("paused"));
}

// ---------------------------------------------------------------------------
// Local writes and the event stream together
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_local_updates_are_not_doubled_by_their_own_events() {
    let (chain, _ledger) = fixture();
    let sync = chain.start_sync(fast_sync_config());
    sync.wait_for(|s| *s == SyncState::Listening).await;

    chain.add_drug(&manufacturer(), "7", "Insulin").await.expect("add");
    chain.update_status(&distributor(), "7", "Distributed").await.expect("update");
    let stats = wait_for_stats(&sync, |s| s.events_handled == 2).await;

    let drug = chain.records().find_by_id("7").await.expect("find").expect("present");
    assert_eq!(drug.history().len(), 2);
    assert_eq!(stats.history_appended + stats.echoes_suppressed, 1);
    assert!(drug.is_verified());

    let synced = chain
        .audit_trail()
        .count_by_action(&ActionFilter::exact("Drug Synced From Blockchain"))
        .await
        .expect("count");
    assert_eq!(synced, 1);
    sync.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_local_writes_win_over_events_mirrored_first() {
    let (chain, ledger) = fixture();
    ledger.set_commit_latency(Duration::from_millis(50));
    let sync = chain.start_sync(fast_sync_config());
    sync.wait_for(|s| *s == SyncState::Listening).await;

    chain.add_drug(&manufacturer(), "8", "Heparin").await.expect("add");
    let updated = chain.update_status(&distributor(), "8", "Distributed").await.expect("update");
    assert_eq!(updated.drug.current_owner(), "Dist Co");
    wait_for_stats(&sync, |s| s.events_handled == 2).await;

    let drug = chain.records().find_by_id("8").await.expect("find").expect("present");
    assert_eq!(drug.current_owner(), "Dist Co");
    assert_eq!(drug.status(), "Distributed");
    assert_eq!(drug.manufacturer(), "Acme Pharma");
    assert_eq!(drug.history().len(), 2);
    assert_eq!(drug.history()[0].owner, "Acme Pharma");
    assert_eq!(drug.history()[0].status, "Manufactured");
    assert_eq!(drug.history()[1].updated_by, "distributor_primary");

    let listed = chain.list_drugs(&manufacturer(), DrugFilter::all()).await.expect("list");
    assert!(listed.iter().any(|d| d.id() == "8"));
    sync.shutdown().await;
}

#[tokio::test]
async fn test_drugs_added_by_other_nodes_are_synced() {
    let (chain, ledger) = fixture();
    let sync = chain.start_sync(fast_sync_config());
    sync.wait_for(|s| *s == SyncState::Listening).await;

    ledger.submit_add_drug("900", "Imported", OTHER_NODE).await.expect("add");
    ledger.submit_history_update("900", "Customs cleared", OTHER_NODE).await.expect("update");
    wait_for_stats(&sync, |s| s.events_handled == 2).await;

    let drug = chain.get_drug(&patient(), "900").await.expect("synced");
    assert_eq!(drug.status(), "Customs cleared");
    assert_eq!(drug.history()[0].status, "Manufactured (On-Chain)");
    assert_eq!(drug.history()[1].updated_by, "Blockchain Listener");
    assert_eq!(drug.current_owner(), OTHER_NODE);
    sync.shutdown().await;
}

// ---------------------------------------------------------------------------
// Properties
// ---------------------------------------------------------------------------

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn prop_last_update_determines_status_and_owner(
        statuses in prop::collection::vec("[A-Z][a-z]{2,10}", 1..8),
    ) {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("runtime");
        rt.block_on(async {
            let (chain, _ledger) = fixture();
            chain.add_drug(&manufacturer(), "1", "Aspirin").await.expect("add");
            let handlers = [distributor(), hospital()];
            for (i, status) in statuses.iter().enumerate() {
                chain.update_status(&handlers[i % 2], "1", status).await.expect("update");
            }

            let drug = chain.records().find_by_id("1").await.expect("find").expect("present");
            let last = drug.history().last().expect("history");
            prop_assert_eq!(drug.history().len(), statuses.len() + 1);
            prop_assert_eq!(drug.status(), last.status.as_str());
            prop_assert_eq!(drug.current_owner(), last.owner.as_str());
            prop_assert_eq!(drug.status(), statuses[statuses.len() - 1].as_str());
            Ok(())
        })?;
    }
}
