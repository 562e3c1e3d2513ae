//! Asynchronous mirror replication.
//!
//! Ledger writes stay on the synchronous critical path; full-content mirror
//! documents are handed to a [`Replicator`], a dedicated coroutine draining
//! a bounded channel into a [`DocumentStore`] with bounded retries and
//! exponential backoff. A full queue or exhausted retries drop the document
//! with a log line, never an error to the caller.

use super::DocumentStore;
use crossbeam_channel::{Receiver, Sender, TrySendError};
use std::time::Duration;

#[cfg(feature = "metrics")]
use crate::metrics::METRICS;
#[cfg(feature = "tracing")]
use crate::metrics::tracing_helpers;

/// One document to mirror
#[derive(Debug, Clone)]
pub struct ReplicationJob {
    pub database_id: String,
    pub document_id: String,
    pub document: serde_json::Value,
}

impl ReplicationJob {
    /// Full-content mirror document for a registered migration
    pub fn migration(database_id: &str, migration_id: &str, document: serde_json::Value) -> Self {
        Self {
            database_id: database_id.to_string(),
            document_id: format!("migration::{migration_id}"),
            document,
        }
    }

    /// Full-content mirror document for a schema snapshot
    pub fn snapshot(database_id: &str, snapshot_id: &str, document: serde_json::Value) -> Self {
        Self {
            database_id: database_id.to_string(),
            document_id: format!("snapshot::{snapshot_id}"),
            document,
        }
    }
}

/// Tuning for the replication worker
#[derive(Debug, Clone, Copy)]
pub struct ReplicatorOptions {
    /// Bounded queue capacity; a full queue drops new documents
    pub queue_capacity: usize,
    /// Delivery attempts after the first failure before the job is dropped
    pub max_retries: u32,
    /// Base backoff, doubled per retry, capped at 30s
    pub retry_backoff_ms: u64,
}

impl Default for ReplicatorOptions {
    fn default() -> Self {
        Self {
            queue_capacity: 256,
            max_retries: 5,
            retry_backoff_ms: 200,
        }
    }
}

/// Handle to the replication worker coroutine
pub struct Replicator {
    tx: Option<Sender<ReplicationJob>>,
    handle: Option<may::coroutine::JoinHandle<()>>,
}

impl Replicator {
    /// Spawn a worker coroutine that owns `store` and drains the queue into it
    pub fn spawn(store: Box<dyn DocumentStore>, options: ReplicatorOptions) -> Self {
        let (tx, rx) = crossbeam_channel::bounded(options.queue_capacity);
        let handle = may::go!(move || {
            run_replication_loop(&rx, store, options);
        });
        Self {
            tx: Some(tx),
            handle: Some(handle),
        }
    }

    /// Queue a document for mirroring; returns `false` if it was dropped
    ///
    /// Never blocks: a full queue means the mirror is lagging, and the
    /// mirror is allowed to lag.
    pub fn enqueue(&self, job: ReplicationJob) -> bool {
        let Some(tx) = self.tx.as_ref() else {
            return false;
        };
        match tx.try_send(job) {
            Ok(()) => {
                #[cfg(feature = "metrics")]
                METRICS.set_replication_queue_depth(tx.len());
                true
            }
            Err(TrySendError::Full(job)) => {
                log::warn!(
                    "Replication queue full, dropping mirror document '{}' for database '{}'",
                    job.document_id,
                    job.database_id
                );
                false
            }
            Err(TrySendError::Disconnected(job)) => {
                log::warn!(
                    "Replication worker stopped, dropping mirror document '{}' for database '{}'",
                    job.document_id,
                    job.database_id
                );
                false
            }
        }
    }

    /// Drain the queue and stop the worker
    ///
    /// Queued documents are still delivered (with retries) before the worker
    /// exits.
    pub fn close(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        // Dropping the sender disconnects the channel; the worker drains
        // whatever is still buffered, then exits.
        drop(self.tx.take());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Replicator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_replication_loop(
    rx: &Receiver<ReplicationJob>,
    mut store: Box<dyn DocumentStore>,
    options: ReplicatorOptions,
) {
    while let Ok(job) = rx.recv() {
        #[cfg(feature = "metrics")]
        METRICS.set_replication_queue_depth(rx.len());

        deliver_with_retries(store.as_mut(), &job, options);
    }
    #[cfg(feature = "metrics")]
    METRICS.set_replication_queue_depth(0);
}

fn deliver_with_retries(
    store: &mut dyn DocumentStore,
    job: &ReplicationJob,
    options: ReplicatorOptions,
) {
    #[cfg(feature = "tracing")]
    let _span = tracing_helpers::replicate_span(&job.document_id).entered();

    let mut attempt: u32 = 0;
    loop {
        match store.put(&job.database_id, &job.document_id, &job.document) {
            Ok(()) => {
                log::debug!(
                    "Mirrored document '{}' for database '{}'",
                    job.document_id,
                    job.database_id
                );
                return;
            }
            Err(e) if attempt < options.max_retries => {
                attempt += 1;
                #[cfg(feature = "metrics")]
                METRICS.record_replication_retry();

                let delay = backoff_delay_ms(options.retry_backoff_ms, attempt);
                log::warn!(
                    "Mirror write for '{}' failed (attempt {attempt}/{}), retrying in {delay}ms: {e}",
                    job.document_id,
                    options.max_retries
                );
                may::coroutine::sleep(Duration::from_millis(delay));
            }
            Err(e) => {
                log::error!(
                    "Dropping mirror document '{}' for database '{}' after {attempt} retries: {e}",
                    job.document_id,
                    job.database_id
                );
                return;
            }
        }
    }
}

/// Exponential backoff: base * 2^(attempt-1), capped at 30s
fn backoff_delay_ms(base_ms: u64, attempt: u32) -> u64 {
    let exponent = attempt.saturating_sub(1).min(16);
    base_ms.saturating_mul(1 << exponent).min(30_000)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{DocStoreError, MemoryStore};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_backoff_delay_doubles_and_caps() {
        assert_eq!(backoff_delay_ms(200, 1), 200);
        assert_eq!(backoff_delay_ms(200, 2), 400);
        assert_eq!(backoff_delay_ms(200, 3), 800);
        assert_eq!(backoff_delay_ms(200, 20), 30_000);
    }

    #[test]
    fn test_replicator_delivers_queued_documents() {
        let store = Arc::new(Mutex::new(MemoryStore::new()));
        let replicator = Replicator::spawn(
            Box::new(Arc::clone(&store)),
            ReplicatorOptions {
                queue_capacity: 8,
                max_retries: 1,
                retry_backoff_ms: 1,
            },
        );

        let job = ReplicationJob::migration(
            "billing",
            "20250101_000000_init",
            serde_json::json!({"checksum": "abc"}),
        );
        assert!(replicator.enqueue(job));
        replicator.close();

        let mut handle = Arc::clone(&store);
        let doc = handle
            .get("billing", "migration::20250101_000000_init")
            .expect("get should succeed");
        assert_eq!(doc, Some(serde_json::json!({"checksum": "abc"})));
    }

    struct FailingStore {
        attempts: Arc<AtomicU32>,
    }

    impl DocumentStore for FailingStore {
        fn put(
            &mut self,
            _database_id: &str,
            _document_id: &str,
            _document: &serde_json::Value,
        ) -> Result<(), DocStoreError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(DocStoreError::Backend("unavailable".to_string()))
        }

        fn get(
            &mut self,
            _database_id: &str,
            _document_id: &str,
        ) -> Result<Option<serde_json::Value>, DocStoreError> {
            Ok(None)
        }

        fn delete(&mut self, _database_id: &str, _document_id: &str) -> Result<bool, DocStoreError> {
            Ok(false)
        }

        fn list_ids(&mut self, _database_id: &str) -> Result<Vec<String>, DocStoreError> {
            Ok(vec![])
        }
    }

    #[test]
    fn test_replicator_gives_up_after_bounded_retries() {
        let attempts = Arc::new(AtomicU32::new(0));
        let replicator = Replicator::spawn(
            Box::new(FailingStore {
                attempts: Arc::clone(&attempts),
            }),
            ReplicatorOptions {
                queue_capacity: 4,
                max_retries: 2,
                retry_backoff_ms: 1,
            },
        );

        let job = ReplicationJob::snapshot("billing", "snap-1", serde_json::json!({}));
        assert!(replicator.enqueue(job));
        replicator.close();

        // one initial attempt plus two retries
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_enqueue_after_close_reports_drop() {
        let store = Arc::new(Mutex::new(MemoryStore::new()));
        let mut replicator = Replicator::spawn(
            Box::new(Arc::clone(&store)),
            ReplicatorOptions::default(),
        );
        replicator.shutdown();

        let job = ReplicationJob::migration("billing", "m", serde_json::json!({}));
        assert!(!replicator.enqueue(job));
    }
}
