//! Shared test utilities for the record store.
//!
//! Feature-gated behind `testutil` so it never leaks into production builds.
//!
//! ```toml
//! [dev-dependencies]
//! pharmatrace-store = { path = "../store", features = ["testutil"] }
//! ```
//!
//! [`FaultyBackend`] wraps a [`MemoryBackend`] and injects connection failures
//! or compare-and-swap conflicts on demand, so callers can exercise their
//! failure paths without the `failpoints` feature.

use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicU32, Ordering},
};

use async_trait::async_trait;
use bytes::Bytes;

use crate::{
    backend::DocumentBackend,
    drug::{DrugPatch, HistoryEntry},
    error::{StorageError, StorageResult},
    memory::MemoryBackend,
    types::{Collection, Document},
};

/// A [`MemoryBackend`] with switchable faults.
///
/// Clones share both the data and the fault switches.
#[derive(Debug, Clone, Default)]
pub struct FaultyBackend {
    inner: MemoryBackend,
    unavailable: Arc<AtomicBool>,
    failing_collection: Arc<parking_lot::Mutex<Option<Collection>>>,
    pending_conflicts: Arc<AtomicU32>,
}

impl FaultyBackend {
    /// Creates a healthy backend.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the wrapped backend, bypassing every fault.
    pub fn inner(&self) -> &MemoryBackend {
        &self.inner
    }

    /// Makes every operation fail with a connection error while `true`.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Makes writes to `collection` fail with a connection error.
    pub fn fail_writes_to(&self, collection: Option<Collection>) {
        *self.failing_collection.lock() = collection;
    }

    /// Makes the next `n` compare-and-swap calls report a conflict.
    pub fn inject_conflicts(&self, n: u32) {
        self.pending_conflicts.store(n, Ordering::SeqCst);
    }

    fn check_available(&self) -> StorageResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StorageError::connection("backend unavailable (injected)"));
        }
        Ok(())
    }

    fn check_writable(&self, collection: Collection) -> StorageResult<()> {
        self.check_available()?;
        if *self.failing_collection.lock() == Some(collection) {
            return Err(StorageError::connection(format!("writes to {collection} failing (injected)")));
        }
        Ok(())
    }

    fn take_conflict(&self) -> bool {
        self.pending_conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl DocumentBackend for FaultyBackend {
    async fn get(&self, collection: Collection, id: &str) -> StorageResult<Option<Bytes>> {
        self.check_available()?;
        self.inner.get(collection, id).await
    }

    async fn insert(&self, collection: Collection, id: &str, value: Vec<u8>) -> StorageResult<()> {
        self.check_writable(collection)?;
        self.inner.insert(collection, id, value).await
    }

    async fn compare_and_swap(
        &self,
        collection: Collection,
        id: &str,
        expected: &[u8],
        new_value: Vec<u8>,
    ) -> StorageResult<()> {
        self.check_writable(collection)?;
        if self.take_conflict() {
            return Err(StorageError::conflict(id));
        }
        self.inner.compare_and_swap(collection, id, expected, new_value).await
    }

    async fn scan(&self, collection: Collection) -> StorageResult<Vec<Document>> {
        self.check_available()?;
        self.inner.scan(collection).await
    }

    async fn health_check(&self) -> StorageResult<()> {
        self.check_available()
    }
}

/// A patch for a manufacturer-created drug.
#[must_use]
pub fn manufacturer_patch(name: &str, manufacturer: &str) -> DrugPatch {
    DrugPatch::builder().name(name).manufacturer(manufacturer).is_verified(true).build()
}

/// A history entry with the given status and owner.
#[must_use]
pub fn history_entry(status: &str, updated_by: &str, owner: &str) -> HistoryEntry {
    HistoryEntry::builder().status(status).updated_by(updated_by).owner(owner).build()
}

/// Assert that a [`StorageResult`] is a [`StorageError::NotFound`].
#[macro_export]
macro_rules! assert_not_found {
    ($result:expr) => {
        assert!(
            matches!($result, Err($crate::error::StorageError::NotFound { .. })),
            "expected StorageError::NotFound, got: {:?}",
            $result,
        );
    };
}

/// Assert that a [`StorageResult`] is `Ok` and return the value.
#[macro_export]
macro_rules! assert_storage_ok {
    ($result:expr) => {
        match $result {
            Ok(val) => val,
            Err(e) => panic!("expected Ok, got StorageError: {e:?}"),
        }
    };
}
