//! Observability infrastructure for the runtime store
//!
//! Provides:
//! - Prometheus metrics (cache size, watch traffic, cluster corrections, status latency)
//! - Structured JSON logging with tracing

use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge,
    Histogram, IntCounter, IntCounterVec, IntGauge,
};
use std::sync::OnceLock;
use tracing::{info, warn};

/// Default histogram buckets for latency measurements (in seconds)
const LATENCY_BUCKETS: &[f64] = &[
    0.0001, 0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0,
];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<StoreMetricsInner> = OnceLock::new();

struct StoreMetricsInner {
    cached_services: IntGauge,
    watch_events: IntCounterVec,
    watch_errors: IntCounterVec,
    orphans_deleted: IntCounterVec,
    stale_replicasets_deleted: IntCounter,
    evictions: IntCounter,
    abnormal_records: IntCounterVec,
    probe_notifications_dropped: IntCounter,
    pod_listener_drops: IntCounterVec,
    status_refreshes: IntCounter,
    status_latency_seconds: Histogram,
}

impl StoreMetricsInner {
    fn new() -> Self {
        Self {
            cached_services: register_int_gauge!(
                "app_runtime_store_cached_services",
                "Number of service aggregates currently cached"
            )
            .expect("Failed to register cached_services"),

            watch_events: register_int_counter_vec!(
                "app_runtime_store_watch_events_total",
                "Watch events handled, by object kind and event type",
                &["kind", "type"]
            )
            .expect("Failed to register watch_events"),

            watch_errors: register_int_counter_vec!(
                "app_runtime_store_watch_errors_total",
                "Watch stream errors, by object kind",
                &["kind"]
            )
            .expect("Failed to register watch_errors"),

            orphans_deleted: register_int_counter_vec!(
                "app_runtime_store_orphans_deleted_total",
                "Cluster objects deleted because their service is unknown",
                &["kind"]
            )
            .expect("Failed to register orphans_deleted"),

            stale_replicasets_deleted: register_int_counter!(
                "app_runtime_store_stale_replicasets_deleted_total",
                "Drained replica sets of superseded revisions deleted"
            )
            .expect("Failed to register stale_replicasets_deleted"),

            evictions: register_int_counter!(
                "app_runtime_store_evictions_total",
                "Closed service aggregates evicted from the cache"
            )
            .expect("Failed to register evictions"),

            abnormal_records: register_int_counter_vec!(
                "app_runtime_store_abnormal_records_total",
                "Container abnormality records written, by reason",
                &["reason"]
            )
            .expect("Failed to register abnormal_records"),

            probe_notifications_dropped: register_int_counter!(
                "app_runtime_store_probe_notifications_dropped_total",
                "Probe notifications dropped because the channel was full"
            )
            .expect("Failed to register probe_notifications_dropped"),

            pod_listener_drops: register_int_counter_vec!(
                "app_runtime_store_pod_listener_drops_total",
                "Pod updates dropped because a listener was full, by listener",
                &["listener"]
            )
            .expect("Failed to register pod_listener_drops"),

            status_refreshes: register_int_counter!(
                "app_runtime_store_status_refreshes_total",
                "Aggregates refreshed from the API server after an unknown status"
            )
            .expect("Failed to register status_refreshes"),

            status_latency_seconds: register_histogram!(
                "app_runtime_store_status_latency_seconds",
                "Time spent answering a single service status query",
                LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register status_latency_seconds"),
        }
    }
}

/// Store metrics for Prometheus exposition
///
/// This is a lightweight handle to the global metrics instance.
/// Multiple clones share the same underlying metrics.
#[derive(Clone)]
pub struct StoreMetrics {
    _private: (),
}

impl Default for StoreMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl StoreMetrics {
    /// Create a new metrics handle (initializes global metrics if needed)
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(StoreMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &StoreMetricsInner {
        GLOBAL_METRICS.get_or_init(StoreMetricsInner::new)
    }

    pub fn set_cached_services(&self, count: usize) {
        self.inner().cached_services.set(count as i64);
    }

    pub fn inc_watch_event(&self, kind: &str, event_type: &str) {
        self.inner()
            .watch_events
            .with_label_values(&[kind, event_type])
            .inc();
    }

    pub fn inc_watch_error(&self, kind: &str) {
        self.inner().watch_errors.with_label_values(&[kind]).inc();
    }

    pub fn inc_orphan_deleted(&self, kind: &str) {
        self.inner().orphans_deleted.with_label_values(&[kind]).inc();
    }

    pub fn inc_stale_replicaset_deleted(&self) {
        self.inner().stale_replicasets_deleted.inc();
    }

    pub fn inc_eviction(&self) {
        self.inner().evictions.inc();
    }

    pub fn inc_abnormal_record(&self, reason: &str) {
        self.inner()
            .abnormal_records
            .with_label_values(&[reason])
            .inc();
    }

    pub fn inc_probe_dropped(&self) {
        self.inner().probe_notifications_dropped.inc();
    }

    pub fn inc_pod_listener_drop(&self, listener: &str) {
        self.inner()
            .pod_listener_drops
            .with_label_values(&[listener])
            .inc();
    }

    pub fn inc_status_refresh(&self) {
        self.inner().status_refreshes.inc();
    }

    /// Record the latency of one status query
    pub fn observe_status_latency(&self, duration_secs: f64) {
        self.inner().status_latency_seconds.observe(duration_secs);
    }
}

/// Structured logger for store lifecycle events
///
/// Emits consistent JSON-formatted records for the events operators
/// care about: startup, orphan cleanup, eviction and abnormalities.
#[derive(Clone)]
pub struct StructuredLogger {
    instance: String,
}

impl StructuredLogger {
    pub fn new(instance: impl Into<String>) -> Self {
        Self {
            instance: instance.into(),
        }
    }

    /// Log store startup
    pub fn log_startup(&self, version: &str, watched_kinds: usize) {
        info!(
            event = "store_started",
            instance = %self.instance,
            store_version = %version,
            watched_kinds = watched_kinds,
            "Application runtime store started"
        );
    }

    /// Log that every watched kind finished its initial listing
    pub fn log_synced(&self, cached_services: usize) {
        info!(
            event = "store_synced",
            instance = %self.instance,
            cached_services = cached_services,
            "All watched kinds synced"
        );
    }

    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "store_shutdown",
            instance = %self.instance,
            reason = %reason,
            "Application runtime store shutting down"
        );
    }

    /// Log the corrective deletion of an object whose service is unknown
    pub fn log_orphan_deleted(&self, kind: &str, namespace: &str, name: &str, service_id: &str) {
        warn!(
            event = "orphan_deleted",
            instance = %self.instance,
            kind = %kind,
            namespace = %namespace,
            name = %name,
            service_id = %service_id,
            "Deleted cluster object of unknown service"
        );
    }

    pub fn log_stale_replicaset(&self, namespace: &str, name: &str, service_id: &str) {
        info!(
            event = "stale_replicaset_deleted",
            instance = %self.instance,
            namespace = %namespace,
            name = %name,
            service_id = %service_id,
            "Deleted drained replica set of an older revision"
        );
    }

    pub fn log_eviction(&self, service_id: &str, generation: u64) {
        info!(
            event = "service_evicted",
            instance = %self.instance,
            service_id = %service_id,
            generation = generation,
            "Evicted closed service aggregate"
        );
    }

    /// Log a container abnormality
    pub fn log_abnormal(
        &self,
        service_id: &str,
        pod_name: &str,
        container: &str,
        reason: &str,
        count: u32,
    ) {
        warn!(
            event = "container_abnormal",
            instance = %self.instance,
            service_id = %service_id,
            pod_name = %pod_name,
            container = %container,
            reason = %reason,
            count = count,
            "Container abnormality recorded"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_metrics_creation() {
        // Registration goes through the global registry exactly once,
        // so repeated handles must be safe.
        let metrics = StoreMetrics::new();
        let again = StoreMetrics::new();

        metrics.set_cached_services(3);
        metrics.inc_watch_event("Pod", "create");
        metrics.inc_orphan_deleted("Deployment");
        again.inc_abnormal_record("OOMKilled");
        again.observe_status_latency(0.001);
    }

    #[test]
    fn test_structured_logger_creation() {
        let logger = StructuredLogger::new("store-0");
        assert_eq!(logger.instance, "store-0");
    }
}
