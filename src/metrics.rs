#[cfg(feature = "metrics")]
use once_cell::sync::Lazy;
#[cfg(feature = "metrics")]
use opentelemetry::{
    global,
    metrics::{Counter, Histogram},
};
#[cfg(feature = "metrics")]
use opentelemetry_sdk::metrics::SdkMeterProvider;
#[cfg(feature = "metrics")]
use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

#[cfg(feature = "metrics")]
pub static METRICS: Lazy<TidemarkMetrics> = Lazy::new(TidemarkMetrics::init);

#[cfg(feature = "metrics")]
pub struct TidemarkMetrics {
    pub registry: prometheus::Registry,
    pub queries_total: Counter<u64>,
    pub query_errors_total: Counter<u64>,
    pub query_duration: Histogram<f64>,
    pub connection_wait_duration: Histogram<f64>,
    pub connection_errors_total: Counter<u64>,
    pub transactions_started_total: Counter<u64>,
    pub transactions_committed_total: Counter<u64>,
    pub transactions_rolled_back_total: Counter<u64>,
    pub migrations_executed_total: Counter<u64>,
    pub migrations_failed_total: Counter<u64>,
    pub migration_duration: Histogram<f64>,
    pub locks_acquired_total: Counter<u64>,
    pub lock_contention_total: Counter<u64>,
    pub snapshots_captured_total: Counter<u64>,
    pub replication_retries_total: Counter<u64>,
    pub replication_queue_depth: Arc<AtomicUsize>,
}

#[cfg(feature = "metrics")]
impl TidemarkMetrics {
    pub fn init() -> Self {
        let registry = prometheus::Registry::new();
        let exporter = opentelemetry_prometheus::exporter()
            .with_registry(registry.clone())
            .build()
            .expect("failed to build prometheus exporter");
        let provider = SdkMeterProvider::builder().with_reader(exporter).build();
        global::set_meter_provider(provider);

        let meter = global::meter("tidemark");

        let queries_total = meter
            .u64_counter("tidemark_queries_total")
            .with_description("Total queries executed")
            .build();

        let query_errors_total = meter
            .u64_counter("tidemark_query_errors_total")
            .with_description("Total query failures")
            .build();

        let query_duration = meter
            .f64_histogram("tidemark_query_duration_seconds")
            .with_description("Duration of queries")
            .build();

        let connection_wait_duration = meter
            .f64_histogram("tidemark_connection_wait_seconds")
            .with_description("Time spent establishing database connections")
            .build();

        let connection_errors_total = meter
            .u64_counter("tidemark_connection_errors_total")
            .with_description("Total connection failures")
            .build();

        let transactions_started_total = meter
            .u64_counter("tidemark_transactions_started_total")
            .with_description("Transactions begun")
            .build();

        let transactions_committed_total = meter
            .u64_counter("tidemark_transactions_committed_total")
            .with_description("Transactions committed")
            .build();

        let transactions_rolled_back_total = meter
            .u64_counter("tidemark_transactions_rolled_back_total")
            .with_description("Transactions rolled back")
            .build();

        let migrations_executed_total = meter
            .u64_counter("tidemark_migrations_executed_total")
            .with_description("Migrations applied or rolled back successfully")
            .build();

        let migrations_failed_total = meter
            .u64_counter("tidemark_migrations_failed_total")
            .with_description("Migration script failures")
            .build();

        let migration_duration = meter
            .f64_histogram("tidemark_migration_duration_seconds")
            .with_description("Duration of individual migration scripts")
            .build();

        let locks_acquired_total = meter
            .u64_counter("tidemark_locks_acquired_total")
            .with_description("Migration locks acquired")
            .build();

        let lock_contention_total = meter
            .u64_counter("tidemark_lock_contention_total")
            .with_description("Lock acquisition attempts lost to another holder")
            .build();

        let snapshots_captured_total = meter
            .u64_counter("tidemark_snapshots_captured_total")
            .with_description("Schema snapshots captured")
            .build();

        let replication_retries_total = meter
            .u64_counter("tidemark_replication_retries_total")
            .with_description("Document replication attempts that were retried")
            .build();

        let replication_queue_depth = Arc::new(AtomicUsize::new(0));
        let depth_clone = Arc::clone(&replication_queue_depth);

        meter
            .u64_observable_gauge("tidemark_replication_queue_depth")
            .with_description("Number of documents waiting in the replication queue")
            .with_callback(move |observer| {
                observer.observe(depth_clone.load(Ordering::Relaxed) as u64, &[]);
            })
            .build();

        Self {
            registry,
            queries_total,
            query_errors_total,
            query_duration,
            connection_wait_duration,
            connection_errors_total,
            transactions_started_total,
            transactions_committed_total,
            transactions_rolled_back_total,
            migrations_executed_total,
            migrations_failed_total,
            migration_duration,
            locks_acquired_total,
            lock_contention_total,
            snapshots_captured_total,
            replication_retries_total,
            replication_queue_depth,
        }
    }

    pub fn record_query_duration(&self, elapsed: std::time::Duration) {
        self.queries_total.add(1, &[]);
        self.query_duration.record(elapsed.as_secs_f64(), &[]);
    }

    pub fn record_query_error(&self) {
        self.query_errors_total.add(1, &[]);
    }

    pub fn record_connection_wait(&self, duration: std::time::Duration) {
        self.connection_wait_duration
            .record(duration.as_secs_f64(), &[]);
    }

    pub fn record_connection_error(&self) {
        self.connection_errors_total.add(1, &[]);
    }

    pub fn record_transaction_started(&self) {
        self.transactions_started_total.add(1, &[]);
    }

    pub fn record_transaction_committed(&self) {
        self.transactions_committed_total.add(1, &[]);
    }

    pub fn record_transaction_rolled_back(&self) {
        self.transactions_rolled_back_total.add(1, &[]);
    }

    pub fn record_migration_executed(&self, elapsed: std::time::Duration) {
        self.migrations_executed_total.add(1, &[]);
        self.migration_duration.record(elapsed.as_secs_f64(), &[]);
    }

    pub fn record_migration_failed(&self) {
        self.migrations_failed_total.add(1, &[]);
    }

    pub fn record_lock_acquired(&self) {
        self.locks_acquired_total.add(1, &[]);
    }

    pub fn record_lock_contention(&self) {
        self.lock_contention_total.add(1, &[]);
    }

    pub fn record_snapshot_captured(&self) {
        self.snapshots_captured_total.add(1, &[]);
    }

    pub fn record_replication_retry(&self) {
        self.replication_retries_total.add(1, &[]);
    }

    pub fn set_replication_queue_depth(&self, depth: usize) {
        self.replication_queue_depth.store(depth, Ordering::Relaxed);
    }

    /// Render the Prometheus registry in text exposition format
    ///
    /// # Errors
    ///
    /// Returns `prometheus::Error` if encoding fails.
    pub fn export(&self) -> Result<String, prometheus::Error> {
        let encoder = prometheus::TextEncoder::new();
        encoder.encode_to_string(&self.registry.gather())
    }
}

#[cfg(feature = "tracing")]
pub mod tracing_helpers {
    //! Span constructors for the query and migration paths.
    //!
    //! Spans are inert until a subscriber is installed. Embedders usually
    //! bring their own; `init_subscriber` installs a bare registry for
    //! processes that have none.

    use tracing::Span;

    pub fn init_subscriber() {
        use tracing_subscriber::util::SubscriberInitExt;
        let _ = tracing_subscriber::registry().try_init();
    }

    pub fn acquire_connection_span() -> Span {
        tracing::debug_span!("acquire_connection")
    }

    pub fn begin_transaction_span() -> Span {
        tracing::debug_span!("begin_transaction")
    }

    pub fn commit_transaction_span() -> Span {
        tracing::debug_span!("commit_transaction")
    }

    pub fn rollback_transaction_span() -> Span {
        tracing::debug_span!("rollback_transaction")
    }

    pub fn execute_query_span(query: &str) -> Span {
        let preview: String = query.chars().take(80).collect();
        tracing::debug_span!("execute_query", query = %preview)
    }

    pub fn run_migrations_span(database_id: &str, environment: &str) -> Span {
        tracing::info_span!("run_migrations", database_id = %database_id, environment = %environment)
    }

    pub fn rollback_migration_span(migration_id: &str) -> Span {
        tracing::info_span!("rollback_migration", migration_id = %migration_id)
    }

    pub fn capture_snapshot_span(database_id: &str) -> Span {
        tracing::info_span!("capture_snapshot", database_id = %database_id)
    }

    pub fn verify_integrity_span(database_id: &str) -> Span {
        tracing::info_span!("verify_integrity", database_id = %database_id)
    }

    pub fn replicate_span(document_id: &str) -> Span {
        tracing::debug_span!("replicate_document", document_id = %document_id)
    }
}
