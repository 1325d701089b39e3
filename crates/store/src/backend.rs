//! Document backend trait definition.
//!
//! [`DocumentBackend`] is the persistence seam under the record store and the
//! audit trail. It stores opaque JSON documents grouped into collections and
//! keyed by a string id, and offers exactly the primitives the repositories
//! need to keep per-document writes atomic:
//!
//! - **Insert-if-absent**: creates a document only when the id is unused
//! - **Compare-and-swap**: replaces a document only if it still holds the bytes the caller read
//! - **Collection scans**: ordered by id, for filtered listings and reports
//!
//! Domain logic (history, flags, audit semantics) lives in the repositories
//! built on top of this trait, never in a backend.

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Serialize, de::DeserializeOwned};

use crate::{
    error::{StorageError, StorageResult},
    types::{Collection, Document},
};

/// Abstract document storage.
///
/// Backends must be `Send + Sync` and support concurrent callers. Writes to the
/// same `(collection, id)` are linearised by the backend; the conditional
/// operations report [`StorageError::Conflict`] when a precondition fails.
///
/// | Method | Description |
/// |--------|-------------|
/// | [`get`](DocumentBackend::get) | Fetch one document |
/// | [`insert`](DocumentBackend::insert) | Create a document if the id is unused |
/// | [`compare_and_swap`](DocumentBackend::compare_and_swap) | Replace a document if unchanged |
/// | [`scan`](DocumentBackend::scan) | List a collection in id order |
/// | [`health_check`](DocumentBackend::health_check) | Verify backend availability |
#[async_trait]
pub trait DocumentBackend: Send + Sync {
    /// Fetches the raw bytes stored under `id`, or `None` if absent.
    #[must_use = "storage operations may fail and errors must be handled"]
    async fn get(&self, collection: Collection, id: &str) -> StorageResult<Option<Bytes>>;

    /// Stores `value` under `id` only if no document exists there yet.
    ///
    /// # Errors
    ///
    /// [`StorageError::Conflict`] if the id is already taken.
    #[must_use = "storage operations may fail and errors must be handled"]
    async fn insert(&self, collection: Collection, id: &str, value: Vec<u8>) -> StorageResult<()>;

    /// Replaces the document under `id` if its current bytes equal `expected`.
    ///
    /// The comparison is an exact byte equality check. Documents are written
    /// with `serde_json` from structs (fields in declaration order), so a value
    /// that was read and re-serialised unchanged compares equal.
    ///
    /// # Errors
    ///
    /// - [`StorageError::NotFound`] if no document exists under `id`.
    /// - [`StorageError::Conflict`] if the stored bytes differ from `expected`.
    #[must_use = "compare-and-swap may fail with a conflict and errors must be handled"]
    async fn compare_and_swap(
        &self,
        collection: Collection,
        id: &str,
        expected: &[u8],
        new_value: Vec<u8>,
    ) -> StorageResult<()>;

    /// Returns every document of `collection`, ordered by id.
    #[must_use = "storage operations may fail and errors must be handled"]
    async fn scan(&self, collection: Collection) -> StorageResult<Vec<Document>>;

    /// Verifies that the backend can serve requests.
    #[must_use = "health check results indicate backend availability and must be inspected"]
    async fn health_check(&self) -> StorageResult<()>;

    /// Fetches and decodes a JSON document.
    ///
    /// Returns the decoded value together with the raw bytes, which callers
    /// pass back as the `expected` argument of
    /// [`compare_and_swap`](DocumentBackend::compare_and_swap).
    async fn get_json<T>(&self, collection: Collection, id: &str) -> StorageResult<Option<(T, Bytes)>>
    where
        T: DeserializeOwned + Send,
    {
        match self.get(collection, id).await? {
            Some(raw) => {
                let value = serde_json::from_slice(&raw).map_err(|e| {
                    StorageError::serialization_with_source(
                        format!("corrupt document {collection}/{id}"),
                        e,
                    )
                })?;
                Ok(Some((value, raw)))
            },
            None => Ok(None),
        }
    }

    /// Encodes `value` as JSON and inserts it if the id is unused.
    async fn insert_json<T>(&self, collection: Collection, id: &str, value: &T) -> StorageResult<()>
    where
        T: Serialize + Sync,
    {
        let bytes = serde_json::to_vec(value)?;
        self.insert(collection, id, bytes).await
    }
}

#[async_trait]
impl<B: DocumentBackend + ?Sized> DocumentBackend for std::sync::Arc<B> {
    async fn get(&self, collection: Collection, id: &str) -> StorageResult<Option<Bytes>> {
        (**self).get(collection, id).await
    }

    async fn insert(&self, collection: Collection, id: &str, value: Vec<u8>) -> StorageResult<()> {
        (**self).insert(collection, id, value).await
    }

    async fn compare_and_swap(
        &self,
        collection: Collection,
        id: &str,
        expected: &[u8],
        new_value: Vec<u8>,
    ) -> StorageResult<()> {
        (**self).compare_and_swap(collection, id, expected, new_value).await
    }

    async fn scan(&self, collection: Collection) -> StorageResult<Vec<Document>> {
        (**self).scan(collection).await
    }

    async fn health_check(&self) -> StorageResult<()> {
        (**self).health_check().await
    }
}
