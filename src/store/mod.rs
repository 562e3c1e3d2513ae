//! Document mirror store.
//!
//! The ledger in `PostgreSQL` is authoritative; the document store holds a
//! best-effort full-content mirror of migrations and schema snapshots for
//! disaster recovery and export. Nothing on a correctness path ever reads
//! from it.
//!
//! Documents are JSON values keyed by a document id and partitioned by
//! database id. Two backends are provided: Redis ([`RedisStore`]) and an
//! in-memory map ([`MemoryStore`]) for tests and ephemeral setups.

pub mod memory;
pub mod redis;
pub mod replicator;

pub use memory::MemoryStore;
pub use redis::RedisStore;
pub use replicator::{ReplicationJob, Replicator, ReplicatorOptions};

use std::fmt;
use std::sync::{Arc, Mutex};

/// Document store error type
#[derive(Debug)]
pub enum DocStoreError {
    /// Backend (network, protocol, storage) failure
    Backend(String),
    /// Document could not be serialized or deserialized
    Serialization(serde_json::Error),
}

impl fmt::Display for DocStoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DocStoreError::Backend(s) => {
                write!(f, "Document store backend error: {s}")
            }
            DocStoreError::Serialization(e) => {
                write!(f, "Document serialization error: {e}")
            }
        }
    }
}

impl std::error::Error for DocStoreError {}

impl From<serde_json::Error> for DocStoreError {
    fn from(err: serde_json::Error) -> Self {
        DocStoreError::Serialization(err)
    }
}

/// Keyed JSON document storage, partitioned by database id
pub trait DocumentStore: Send {
    /// Write or overwrite a document
    ///
    /// # Errors
    ///
    /// Returns `DocStoreError` if the backend write fails.
    fn put(
        &mut self,
        database_id: &str,
        document_id: &str,
        document: &serde_json::Value,
    ) -> Result<(), DocStoreError>;

    /// Read a document, `None` if absent
    ///
    /// # Errors
    ///
    /// Returns `DocStoreError` if the backend read fails.
    fn get(
        &mut self,
        database_id: &str,
        document_id: &str,
    ) -> Result<Option<serde_json::Value>, DocStoreError>;

    /// Delete a document, reporting whether it existed
    ///
    /// # Errors
    ///
    /// Returns `DocStoreError` if the backend delete fails.
    fn delete(&mut self, database_id: &str, document_id: &str) -> Result<bool, DocStoreError>;

    /// List document ids stored for a database
    ///
    /// # Errors
    ///
    /// Returns `DocStoreError` if the backend scan fails.
    fn list_ids(&mut self, database_id: &str) -> Result<Vec<String>, DocStoreError>;
}

/// Shared-handle stores: lets a test keep a handle to the same store the
/// replication worker writes into.
impl<S: DocumentStore> DocumentStore for Arc<Mutex<S>> {
    fn put(
        &mut self,
        database_id: &str,
        document_id: &str,
        document: &serde_json::Value,
    ) -> Result<(), DocStoreError> {
        self.lock()
            .map_err(|_| DocStoreError::Backend("store mutex poisoned".to_string()))?
            .put(database_id, document_id, document)
    }

    fn get(
        &mut self,
        database_id: &str,
        document_id: &str,
    ) -> Result<Option<serde_json::Value>, DocStoreError> {
        self.lock()
            .map_err(|_| DocStoreError::Backend("store mutex poisoned".to_string()))?
            .get(database_id, document_id)
    }

    fn delete(&mut self, database_id: &str, document_id: &str) -> Result<bool, DocStoreError> {
        self.lock()
            .map_err(|_| DocStoreError::Backend("store mutex poisoned".to_string()))?
            .delete(database_id, document_id)
    }

    fn list_ids(&mut self, database_id: &str) -> Result<Vec<String>, DocStoreError> {
        self.lock()
            .map_err(|_| DocStoreError::Backend("store mutex poisoned".to_string()))?
            .list_ids(database_id)
    }
}

/// Key under which a document lives, shared by every backend
pub(crate) fn document_key(database_id: &str, document_id: &str) -> String {
    format!("tidemark:{database_id}:{document_id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_document_key_partitions_by_database() {
        let a = document_key("billing", "migration::20250101_000000_x");
        let b = document_key("clinical", "migration::20250101_000000_x");
        assert_ne!(a, b);
        assert!(a.starts_with("tidemark:billing:"));
    }

    #[test]
    fn test_doc_store_error_display() {
        let err = DocStoreError::Backend("connection refused".to_string());
        assert!(err.to_string().contains("backend error"));
    }

    #[test]
    fn test_shared_handle_store() {
        let store = Arc::new(Mutex::new(MemoryStore::new()));
        let mut handle = Arc::clone(&store);

        handle
            .put("db", "doc-1", &serde_json::json!({"k": 1}))
            .expect("put should succeed");

        let mut other = Arc::clone(&store);
        let fetched = other.get("db", "doc-1").expect("get should succeed");
        assert_eq!(fetched, Some(serde_json::json!({"k": 1})));
    }
}
