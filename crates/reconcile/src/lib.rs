//! Drug ledger reconciliation for Pharmatrace.
//!
//! Keeps the off-chain drug records in step with the on-chain registry:
//!
//! - [`EventSyncEngine`] mirrors ledger events into the store in the
//!   background, reconnecting with backoff.
//! - [`SupplyChain::verify`] compares a record with the ledger and flags
//!   mismatches.
//! - [`SupplyChain`]'s drug operations write to the ledger and then to the
//!   store, auditing every outcome.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │        web tier (routing, sessions) -> ActingUser            │
//! ├───────────────────────────────┬──────────────────────────────┤
//! │ SupplyChain                   │ EventSyncEngine (task)       │
//! │ add / update / verify / flag  │ DrugAdded, HistoryUpdated    │
//! ├───────────────────────────────┴──────────────────────────────┤
//! │ pharmatrace-store: DrugRecords, AuditTrail                   │
//! │ pharmatrace-ledger: LedgerClient                             │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Quick Start
//!
//! ```no_run
//! use pharmatrace_ledger::{RpcLedgerClient, RpcLedgerConfig};
//! use pharmatrace_reconcile::{ActingUser, Role, SupplyChain, SyncConfig};
//! use pharmatrace_store::MemoryBackend;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let ledger = RpcLedgerClient::new(
//!         RpcLedgerConfig::builder()
//!             .endpoint("http://127.0.0.1:8545")
//!             .contract_address("0x5FbDB2315678afecb367f032d93F642f64180aa3")
//!             .build()?,
//!     )?;
//!     let chain = SupplyChain::new(MemoryBackend::new(), ledger);
//!     let sync = chain.start_sync(SyncConfig::default());
//!
//!     let maker = ActingUser::builder().id("m1").name("Acme").role(Role::Manufacturer).build();
//!     chain.add_drug(&maker, "1001", "Aspirin").await?;
//!
//!     sync.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! # Feature Flags
//!
//! - **`testutil`**: Enables the `testutil` module (fixtures over `MockLedger`).
//! - **`failpoints`**: Forwards to the store's fail points.

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod access;
pub mod config;
pub mod drugs;
pub mod error;
pub mod reports;
mod supply;
pub mod sync;
#[cfg(any(test, feature = "testutil"))]
#[allow(clippy::expect_used)]
pub mod testutil;
pub mod verify;

pub use access::{ActingUser, Capability, Role, has_capability, require_role};
pub use config::{DEFAULT_RECONNECT_INITIAL_BACKOFF, DEFAULT_RECONNECT_MAX_BACKOFF, SyncConfig};
pub use drugs::{Committed, MANUFACTURED_STATUS, validate_drug_id};
pub use error::{SupplyError, SupplyResult};
pub use reports::ReportStats;
pub use supply::SupplyChain;
pub use sync::{
    EventSyncEngine, LISTENER_NAME, ON_CHAIN_MANUFACTURED_STATUS, SyncHandle, SyncState, SyncStats,
};
pub use verify::VerificationOutcome;
