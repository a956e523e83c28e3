//! Metrics and observability for the Tidal block storage service
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::must_use_candidate)]

use metrics::{counter, gauge, histogram};
use std::sync::Arc;
use std::time::Instant;

/// Global metrics registry
static METRICS: once_cell::sync::Lazy<Arc<MetricsRegistry>> =
    once_cell::sync::Lazy::new(|| Arc::new(MetricsRegistry::new()));

/// Metrics registry for the block storage service
pub struct MetricsRegistry {
    start_time: Instant,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
        }
    }

    /// Get the global metrics registry
    pub fn global() -> Arc<MetricsRegistry> {
        Arc::clone(&METRICS)
    }

    /// Get uptime in seconds
    pub fn uptime_secs(&self) -> f64 {
        self.start_time.elapsed().as_secs_f64()
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Block Store Metrics
// ============================================================================

/// Record a block admitted to a tier ("memory" or "disk")
pub fn record_block_stored(tier: &str, bytes: u64) {
    counter!("tidal_blocks_stored_total", "tier" => tier.to_string()).increment(1);
    counter!("tidal_block_bytes_stored_total", "tier" => tier.to_string()).increment(bytes);
}

/// Record a block evicted from memory
pub fn record_block_evicted(spilled_to_disk: bool) {
    let outcome = if spilled_to_disk { "spilled" } else { "dropped" };
    counter!("tidal_blocks_evicted_total", "outcome" => outcome.to_string()).increment(1);
}

/// Record bytes moved from memory to disk under pressure
pub fn record_bytes_spilled(bytes: u64) {
    counter!("tidal_bytes_spilled_total").increment(bytes);
}

/// Update the storage memory usage gauge for one pool
pub fn set_memory_used(mode: &str, bytes: u64) {
    gauge!("tidal_storage_memory_used_bytes", "mode" => mode.to_string()).set(bytes as f64);
}

/// Record a local read that could not be materialized
pub fn record_local_read_failure() {
    counter!("tidal_local_read_failures_total").increment(1);
}

// ============================================================================
// Replication Metrics
// ============================================================================

/// Record the outcome of replicating one block to one peer
pub fn record_replication(success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!("tidal_replication_uploads_total", "status" => status.to_string()).increment(1);
}

/// Record time spent replicating one block to its peer set
pub fn record_replication_latency(latency_ms: f64) {
    histogram!("tidal_replication_duration_ms").record(latency_ms);
}

// ============================================================================
// Remote Fetch Metrics
// ============================================================================

/// Record one remote fetch attempt against one location
pub fn record_remote_fetch(success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!("tidal_remote_fetches_total", "status" => status.to_string()).increment(1);
}

/// Record a forced refresh of a block's location list
pub fn record_location_refresh() {
    counter!("tidal_location_refreshes_total").increment(1);
}

// ============================================================================
// Event Queue Metrics
// ============================================================================

/// Record an event accepted by a queue
pub fn record_event_posted(queue: &str) {
    counter!("tidal_events_posted_total", "queue" => queue.to_string()).increment(1);
}

/// Record an event dropped by a full queue
pub fn record_event_dropped(queue: &str) {
    counter!("tidal_events_dropped_total", "queue" => queue.to_string()).increment(1);
}

// ============================================================================
// Export Functions
// ============================================================================

/// Export metrics in Prometheus format
#[must_use]
pub fn export_prometheus() -> String {
    use prometheus::Encoder;

    let encoder = prometheus::TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::warn!("Failed to encode Prometheus metrics: {}", e);
        return String::new();
    }

    let registry = MetricsRegistry::global();
    let uptime = format!(
        "# HELP tidal_uptime_seconds Node uptime in seconds\n\
         # TYPE tidal_uptime_seconds gauge\n\
         tidal_uptime_seconds {}\n",
        registry.uptime_secs()
    );

    let metrics_str = String::from_utf8(buffer).unwrap_or_default();
    format!("{uptime}{metrics_str}")
}
