//! Redis-backed document store.
//!
//! Documents are stored as JSON strings under `tidemark:<database_id>:<id>`
//! keys. One connection per store; the replication worker owns the store
//! exclusively so no pooling is needed.

use super::{DocStoreError, DocumentStore, document_key};
use redis::Commands;

pub struct RedisStore {
    connection: redis::Connection,
}

impl From<redis::RedisError> for DocStoreError {
    fn from(err: redis::RedisError) -> Self {
        DocStoreError::Backend(err.to_string())
    }
}

impl RedisStore {
    /// Connect to Redis at `url`, e.g. `redis://localhost:6379`
    ///
    /// # Errors
    ///
    /// Returns `DocStoreError::Backend` if the client cannot be created or
    /// the connection cannot be established.
    pub fn connect(url: &str) -> Result<Self, DocStoreError> {
        let client = redis::Client::open(url)?;
        let connection = client.get_connection()?;
        Ok(Self { connection })
    }
}

impl DocumentStore for RedisStore {
    fn put(
        &mut self,
        database_id: &str,
        document_id: &str,
        document: &serde_json::Value,
    ) -> Result<(), DocStoreError> {
        let payload = serde_json::to_string(document)?;
        let () = self
            .connection
            .set(document_key(database_id, document_id), payload)?;
        Ok(())
    }

    fn get(
        &mut self,
        database_id: &str,
        document_id: &str,
    ) -> Result<Option<serde_json::Value>, DocStoreError> {
        let payload: Option<String> = self
            .connection
            .get(document_key(database_id, document_id))?;
        match payload {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    fn delete(&mut self, database_id: &str, document_id: &str) -> Result<bool, DocStoreError> {
        let removed: i64 = self
            .connection
            .del(document_key(database_id, document_id))?;
        Ok(removed > 0)
    }

    fn list_ids(&mut self, database_id: &str) -> Result<Vec<String>, DocStoreError> {
        let prefix = document_key(database_id, "");
        let pattern = format!("{prefix}*");
        let keys: Vec<String> = {
            let iter = self.connection.scan_match::<_, String>(pattern)?;
            iter.collect()
        };
        let mut ids: Vec<String> = keys
            .iter()
            .filter_map(|key| key.strip_prefix(&prefix))
            .map(ToString::to_string)
            .collect();
        ids.sort();
        Ok(ids)
    }
}
