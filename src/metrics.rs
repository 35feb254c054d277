//! Metrics instrumentation.
//!
//! Uses the `metrics` facade; the host process picks the exporter.
//!
//! # Naming
//! - `product_stats_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Labels
//! - `tier`: fast, durable
//! - `reason`: interval, high_water, on_demand, shutdown
//! - `status`: success, error, rejected

use metrics::{counter, gauge, histogram};
use std::time::{Duration, Instant};

/// Record operation latency
pub fn record_latency(tier: &str, operation: &str, duration: Duration) {
    histogram!(
        "product_stats_operation_seconds",
        "tier" => tier.to_string(),
        "operation" => operation.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Record a backend error by tier and operation
pub fn record_error(tier: &str, operation: &str) {
    counter!(
        "product_stats_errors_total",
        "tier" => tier.to_string(),
        "operation" => operation.to_string()
    )
    .increment(1);
}

// ═══════════════════════════════════════════════════════════════════════════
// INGEST - Gateway events and increments
// ═══════════════════════════════════════════════════════════════════════════

pub fn record_event(event_type: &str, status: &str) {
    counter!(
        "product_stats_events_total",
        "event" => event_type.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

pub fn record_high_water_signal() {
    counter!("product_stats_high_water_signals_total").increment(1);
}

/// Current dirty-set size as last observed
pub fn set_dirty_products(count: usize) {
    gauge!("product_stats_dirty_products").set(count as f64);
}

// ═══════════════════════════════════════════════════════════════════════════
// FLUSH - Sync engine cycles
// ═══════════════════════════════════════════════════════════════════════════

pub fn record_flush(reason: &str, status: &str) {
    counter!(
        "product_stats_flush_cycles_total",
        "reason" => reason.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

pub fn record_flush_duration(duration: Duration) {
    histogram!("product_stats_flush_seconds").record(duration.as_secs_f64());
}

pub fn record_flush_batch(claimed: usize, written: usize, skipped_evicted: usize) {
    histogram!("product_stats_flush_batch_size").record(claimed as f64);
    counter!("product_stats_flushed_products_total").increment(written as u64);
    if skipped_evicted > 0 {
        counter!("product_stats_flush_evicted_skips_total").increment(skipped_evicted as u64);
    }
}

/// Claimed products put back after a failed durable write
pub fn record_redirtied(count: usize) {
    counter!("product_stats_redirtied_products_total").increment(count as u64);
}

// ═══════════════════════════════════════════════════════════════════════════
// RANKING
// ═══════════════════════════════════════════════════════════════════════════

pub fn record_ranking_update(status: &str) {
    counter!(
        "product_stats_ranking_updates_total",
        "status" => status.to_string()
    )
    .increment(1);
}

pub fn record_ranking_rebuild(products: usize, duration: Duration) {
    counter!("product_stats_ranking_rebuilds_total").increment(1);
    histogram!("product_stats_ranking_rebuild_products").record(products as f64);
    histogram!("product_stats_ranking_rebuild_seconds").record(duration.as_secs_f64());
}

pub fn record_index_pruned(index: &str, removed: usize) {
    counter!(
        "product_stats_index_pruned_total",
        "index" => index.to_string()
    )
    .increment(removed as u64);
}

/// Lease lock contention (another instance holds it)
pub fn record_lock_busy(name: &str) {
    counter!(
        "product_stats_lock_busy_total",
        "lock" => name.to_string()
    )
    .increment(1);
}

// ═══════════════════════════════════════════════════════════════════════════
// READ PATH
// ═══════════════════════════════════════════════════════════════════════════

/// Which tier answered a stats read: cache, counters, durable, empty
pub fn record_stats_read(source: &str) {
    counter!(
        "product_stats_reads_total",
        "source" => source.to_string()
    )
    .increment(1);
}

// ═══════════════════════════════════════════════════════════════════════════
// JOBS AND RESILIENCE
// ═══════════════════════════════════════════════════════════════════════════

pub fn record_job(name: &str, outcome: &str) {
    counter!(
        "product_stats_jobs_total",
        "job" => name.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

pub fn record_retry_exhausted(operation: &str) {
    counter!(
        "product_stats_retries_exhausted_total",
        "operation" => operation.to_string()
    )
    .increment(1);
}

pub fn record_circuit_call(circuit: &str, outcome: &str) {
    counter!(
        "product_stats_circuit_breaker_calls_total",
        "circuit" => circuit.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Set engine state (for monitoring state machine transitions)
pub fn set_engine_state(state: &str) {
    counter!(
        "product_stats_state_transitions_total",
        "state" => state.to_string()
    )
    .increment(1);
}

/// A timing guard that records latency on drop
pub struct LatencyTimer {
    tier: &'static str,
    operation: &'static str,
    start: Instant,
}

impl LatencyTimer {
    pub fn new(tier: &'static str, operation: &'static str) -> Self {
        Self {
            tier,
            operation,
            start: Instant::now(),
        }
    }
}

impl Drop for LatencyTimer {
    fn drop(&mut self) {
        record_latency(self.tier, self.operation, self.start.elapsed());
    }
}

/// Time the rest of the enclosing scope
#[macro_export]
macro_rules! time_operation {
    ($tier:expr, $op:expr) => {
        $crate::metrics::LatencyTimer::new($tier, $op)
    };
}
