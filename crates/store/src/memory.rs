//! In-memory document backend.
//!
//! This module provides [`MemoryBackend`], an implementation of
//! [`DocumentBackend`] suitable for tests, development and single-process
//! deployments.
//!
//! # Features
//!
//! - **Thread-safe**: Uses [`parking_lot::RwLock`] for concurrent access
//! - **Ordered storage**: Documents are kept in a [`BTreeMap`] per collection, so scans return ids in order
//! - **Atomic conditional writes**: `insert` and `compare_and_swap` check and write under one write lock
//!
//! # Example
//!
//! ```
//! use pharmatrace_store::{Collection, DocumentBackend, MemoryBackend};
//!
//! #[tokio::main]
//! async fn main() {
//!     let backend = MemoryBackend::new();
//!
//!     backend.insert(Collection::Drugs, "1001", b"{}".to_vec()).await.unwrap();
//!     let value = backend.get(Collection::Drugs, "1001").await.unwrap();
//!
//!     assert_eq!(value.unwrap().as_ref(), b"{}");
//! }
//! ```
//!
//! # Limitations
//!
//! - Data is not persisted; all data is lost when the process exits

use std::{collections::BTreeMap, sync::Arc};

use async_trait::async_trait;
use bytes::Bytes;
use fail::fail_point;
use parking_lot::RwLock;

use crate::{
    backend::DocumentBackend,
    error::{StorageError, StorageResult},
    types::{Collection, Document},
};

type Collections = BTreeMap<Collection, BTreeMap<String, Bytes>>;

/// In-memory document backend using [`BTreeMap`].
///
/// # Cloning
///
/// `MemoryBackend` is cheaply cloneable via [`Arc`]. All clones share the
/// same underlying data.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    data: Arc<RwLock<Collections>>,
}

impl MemoryBackend {
    /// Creates a new, empty in-memory backend.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of documents in `collection`.
    pub fn len(&self, collection: Collection) -> usize {
        self.data.read().get(&collection).map_or(0, BTreeMap::len)
    }

    /// Returns `true` if `collection` holds no documents.
    pub fn is_empty(&self, collection: Collection) -> bool {
        self.len(collection) == 0
    }
}

impl std::fmt::Debug for MemoryBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let data = self.data.read();
        let mut dbg = f.debug_struct("MemoryBackend");
        for (collection, docs) in data.iter() {
            dbg.field(collection.as_str(), &docs.len());
        }
        dbg.finish()
    }
}

#[async_trait]
impl DocumentBackend for MemoryBackend {
    async fn get(&self, collection: Collection, id: &str) -> StorageResult<Option<Bytes>> {
        fail_point!("memory-get", |_| Err(StorageError::connection("injected get failure")));
        Ok(self.data.read().get(&collection).and_then(|docs| docs.get(id)).cloned())
    }

    async fn insert(&self, collection: Collection, id: &str, value: Vec<u8>) -> StorageResult<()> {
        fail_point!("memory-insert", |_| Err(StorageError::connection("injected insert failure")));
        let mut data = self.data.write();
        let docs = data.entry(collection).or_default();
        if docs.contains_key(id) {
            return Err(StorageError::conflict(id));
        }
        docs.insert(id.to_owned(), Bytes::from(value));
        Ok(())
    }

    async fn compare_and_swap(
        &self,
        collection: Collection,
        id: &str,
        expected: &[u8],
        new_value: Vec<u8>,
    ) -> StorageResult<()> {
        fail_point!("memory-compare-and-swap", |_| Err(StorageError::conflict(id)));
        let mut data = self.data.write();
        let current = data
            .get_mut(&collection)
            .and_then(|docs| docs.get_mut(id))
            .ok_or_else(|| StorageError::not_found(id))?;
        if current.as_ref() != expected {
            return Err(StorageError::conflict(id));
        }
        *current = Bytes::from(new_value);
        Ok(())
    }

    async fn scan(&self, collection: Collection) -> StorageResult<Vec<Document>> {
        let data = self.data.read();
        Ok(data
            .get(&collection)
            .map(|docs| docs.iter().map(|(id, value)| Document::new(id.clone(), value.clone())).collect())
            .unwrap_or_default())
    }

    async fn health_check(&self) -> StorageResult<()> {
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_insert_then_get() {
        let backend = MemoryBackend::new();
        backend.insert(Collection::Drugs, "1", b"a".to_vec()).await.unwrap();

        let value = backend.get(Collection::Drugs, "1").await.unwrap();
        assert_eq!(value, Some(Bytes::from_static(b"a")));
        assert_eq!(backend.get(Collection::AuditLog, "1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_insert_existing_id_conflicts() {
        let backend = MemoryBackend::new();
        backend.insert(Collection::Drugs, "1", b"a".to_vec()).await.unwrap();

        let err = backend.insert(Collection::Drugs, "1", b"b".to_vec()).await.unwrap_err();
        assert!(matches!(err, StorageError::Conflict { .. }));
        assert_eq!(
            backend.get(Collection::Drugs, "1").await.unwrap(),
            Some(Bytes::from_static(b"a"))
        );
    }

    #[tokio::test]
    async fn test_compare_and_swap_requires_matching_bytes() {
        let backend = MemoryBackend::new();
        backend.insert(Collection::Drugs, "1", b"v1".to_vec()).await.unwrap();

        let err =
            backend.compare_and_swap(Collection::Drugs, "1", b"stale", b"v2".to_vec()).await;
        assert!(matches!(err, Err(StorageError::Conflict { .. })));

        backend.compare_and_swap(Collection::Drugs, "1", b"v1", b"v2".to_vec()).await.unwrap();
        assert_eq!(
            backend.get(Collection::Drugs, "1").await.unwrap(),
            Some(Bytes::from_static(b"v2"))
        );
    }

    #[tokio::test]
    async fn test_compare_and_swap_missing_document() {
        let backend = MemoryBackend::new();
        let err = backend.compare_and_swap(Collection::Drugs, "9", b"", b"x".to_vec()).await;
        assert!(matches!(err, Err(StorageError::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_scan_is_ordered_and_scoped() {
        let backend = MemoryBackend::new();
        for id in ["3", "1", "2"] {
            backend.insert(Collection::Drugs, id, id.as_bytes().to_vec()).await.unwrap();
        }
        backend.insert(Collection::AuditLog, "x", b"y".to_vec()).await.unwrap();

        let ids: Vec<_> =
            backend.scan(Collection::Drugs).await.unwrap().into_iter().map(|d| d.id).collect();
        assert_eq!(ids, vec!["1", "2", "3"]);
        assert_eq!(backend.len(Collection::AuditLog), 1);
        assert!(backend.scan(Collection::AuditLog).await.unwrap().len() == 1);
    }

    #[tokio::test]
    async fn test_clones_share_data() {
        let backend = MemoryBackend::new();
        let clone = backend.clone();
        clone.insert(Collection::Drugs, "1", b"a".to_vec()).await.unwrap();
        assert!(!backend.is_empty(Collection::Drugs));
    }
}
