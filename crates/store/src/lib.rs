//! Drug record store and audit trail for Pharmatrace.
//!
//! This crate owns every persistent record of the reconciliation engine: the
//! [`Drug`] documents and the append-only [`AuditEntry`] trail. Both
//! repositories are generic over the [`DocumentBackend`] trait.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │         Event sync engine / verification / drug ops         │
//! ├──────────────────────────────┬──────────────────────────────┤
//! │      DrugRecords<B>          │        AuditTrail<B>         │
//! │ (history, flags, CAS retry)  │   (append-only, tracing)     │
//! ├──────────────────────────────┴──────────────────────────────┤
//! │                 DocumentBackend trait                       │
//! │   (get, insert-if-absent, compare-and-swap, scan)           │
//! ├─────────────────────────────────────────────────────────────┤
//! │                     MemoryBackend                           │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Quick Start
//!
//! ```
//! use pharmatrace_store::{DrugPatch, DrugRecords, HistoryEntry, MemoryBackend};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let records = DrugRecords::new(MemoryBackend::new());
//!
//!     let patch = DrugPatch::builder().name("Aspirin").manufacturer("Acme").build();
//!     let seed = HistoryEntry::builder()
//!         .status("Manufactured")
//!         .updated_by("manufacturer")
//!         .owner("Acme")
//!         .build();
//!     records.upsert_drug("1001", &patch, &seed).await?;
//!
//!     let entry = HistoryEntry::builder()
//!         .status("Distributed")
//!         .updated_by("distributor_primary")
//!         .owner("Dist Co")
//!         .build();
//!     let drug = records.append_history("1001", entry).await?.into_drug();
//!     assert_eq!(drug.current_owner(), "Dist Co");
//!     assert_eq!(drug.history().len(), 2);
//!     Ok(())
//! }
//! ```
//!
//! # Feature Flags
//!
//! - **`testutil`**: Enables the `testutil` module (a fault-injecting backend and fixtures).
//! - **`failpoints`**: Compiles the `fail` fail points in the backend, retry loop and audit trail.

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod audit;
pub mod backend;
pub mod drug;
pub mod error;
pub mod memory;
pub mod records;
pub mod retry;
#[cfg(any(test, feature = "testutil"))]
#[allow(clippy::expect_used)]
pub mod testutil;
pub mod types;

pub use audit::{
    ActionFilter, AuditAction, AuditEntry, AuditStatus, AuditTrail, NO_TX_HASH, VerifierScope,
    VerifyResult,
};
pub use backend::DocumentBackend;
pub use drug::{
    AppendOutcome, Drug, DrugFilter, DrugPatch, FlagSource, HistoryEntry, UpsertOutcome,
    VerificationDecision, VerificationEffect,
};
pub use error::{BoxError, ConfigError, StorageError, StorageResult};
pub use memory::MemoryBackend;
pub use records::DrugRecords;
pub use retry::{
    CasRetryConfig, DEFAULT_CAS_MAX_RETRIES, DEFAULT_CAS_RETRY_BASE_DELAY, with_cas_retry,
};
pub use types::{Collection, Document};
