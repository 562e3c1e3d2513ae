//! In-memory document store for tests and ephemeral setups.

use super::{DocStoreError, DocumentStore, document_key};
use std::collections::BTreeMap;

/// `BTreeMap`-backed store; `list_ids` comes back sorted for free
#[derive(Debug, Default)]
pub struct MemoryStore {
    documents: BTreeMap<String, serde_json::Value>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of documents held across all databases
    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }
}

impl DocumentStore for MemoryStore {
    fn put(
        &mut self,
        database_id: &str,
        document_id: &str,
        document: &serde_json::Value,
    ) -> Result<(), DocStoreError> {
        self.documents
            .insert(document_key(database_id, document_id), document.clone());
        Ok(())
    }

    fn get(
        &mut self,
        database_id: &str,
        document_id: &str,
    ) -> Result<Option<serde_json::Value>, DocStoreError> {
        Ok(self
            .documents
            .get(&document_key(database_id, document_id))
            .cloned())
    }

    fn delete(&mut self, database_id: &str, document_id: &str) -> Result<bool, DocStoreError> {
        Ok(self
            .documents
            .remove(&document_key(database_id, document_id))
            .is_some())
    }

    fn list_ids(&mut self, database_id: &str) -> Result<Vec<String>, DocStoreError> {
        let prefix = document_key(database_id, "");
        Ok(self
            .documents
            .keys()
            .filter_map(|key| key.strip_prefix(&prefix))
            .map(ToString::to_string)
            .collect())
    }
}
