//! Fixtures for exercising supply-chain operations.
//!
//! Feature-gated behind `testutil`. Builds a [`SupplyChain`] over a
//! [`MemoryBackend`] and a [`MockLedger`], plus one acting user per role used
//! in tests.

use std::time::Duration;

use pharmatrace_ledger::mock::MockLedger;
use pharmatrace_store::MemoryBackend;

use crate::{
    access::{ActingUser, Role},
    config::SyncConfig,
    sync::{SyncHandle, SyncStats},
    supply::SupplyChain,
};

/// The service type the fixtures build.
pub type TestSupplyChain = SupplyChain<MemoryBackend, MockLedger>;

/// A fresh service and a handle on its ledger.
pub fn fixture() -> (TestSupplyChain, MockLedger) {
    let ledger = MockLedger::new();
    (SupplyChain::new(MemoryBackend::new(), ledger.clone()), ledger)
}

fn user(id: &str, name: &str, role: Role, wallet: Option<&str>) -> ActingUser {
    ActingUser::builder().id(id).name(name).role(role).maybe_wallet_address(wallet).build()
}

/// `Acme Pharma`, a manufacturer with a wallet.
pub fn manufacturer() -> ActingUser {
    user("m1", "Acme Pharma", Role::Manufacturer, Some("0x00000000000000000000000000000000000000a1"))
}

/// `Dist Co`, a primary distributor without a wallet.
pub fn distributor() -> ActingUser {
    user("d1", "Dist Co", Role::DistributorPrimary, None)
}

/// `City Hospital`.
pub fn hospital() -> ActingUser {
    user("h1", "City Hospital", Role::Hospital, None)
}

/// An administrator.
pub fn admin() -> ActingUser {
    user("a1", "Admin", Role::Admin, None)
}

/// A patient.
pub fn patient() -> ActingUser {
    user("p1", "Pat Patient", Role::Patient, None)
}

/// A sync configuration with millisecond backoff.
pub fn fast_sync_config() -> SyncConfig {
    SyncConfig::builder()
        .initial_backoff(Duration::from_millis(10))
        .max_backoff(Duration::from_millis(80))
        .build()
        .expect("valid sync config")
}

/// Polls the engine's counters until `predicate` holds.
///
/// # Panics
///
/// After five seconds without the predicate holding.
pub async fn wait_for_stats(handle: &SyncHandle, predicate: impl Fn(&SyncStats) -> bool) -> SyncStats {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let stats = handle.stats();
            if predicate(&stats) {
                return stats;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("sync engine did not reach the expected stats in time")
}
