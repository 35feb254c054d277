//! Chaos testing for the stats engine.
//!
//! Uses a **FailingDurableStore** wrapper for precise error injection into
//! the durable tier, and checks that no increment is lost while it is down.
//!
//! # Running Chaos Tests
//! ```bash
//! cargo test --test chaos -- --nocapture
//! ```

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::watch;

use product_stats_engine::storage::memory::{InMemoryDurableStore, InMemoryFastTier};
use product_stats_engine::storage::traits::BatchWriteResult;
use product_stats_engine::{
    Backends, Boost, CounterDeltas, CounterStore, DurableStatRecord, DurableStore, EngineState, FlushError, Metric,
    ProductEvent, ProductRankingInfo, StatsEngine, StatsEngineConfig, StorageError,
};

// =============================================================================
// Failing Store Wrapper - Precise Error Injection
// =============================================================================

/// Durable store that fails every call while `down` is set.
pub struct FailingDurableStore {
    inner: InMemoryDurableStore,
    down: AtomicBool,
    /// Fail only the write path, reads keep working
    writes_only: AtomicBool,
    failed_calls: AtomicU64,
}

impl FailingDurableStore {
    pub fn new() -> Self {
        Self {
            inner: InMemoryDurableStore::new(),
            down: AtomicBool::new(false),
            writes_only: AtomicBool::new(false),
            failed_calls: AtomicU64::new(0),
        }
    }

    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    pub fn set_writes_only(&self, writes_only: bool) {
        self.writes_only.store(writes_only, Ordering::SeqCst);
    }

    pub fn failed_calls(&self) -> u64 {
        self.failed_calls.load(Ordering::SeqCst)
    }

    fn maybe_fail(&self, is_write: bool) -> Result<(), StorageError> {
        let down = self.down.load(Ordering::SeqCst);
        let applies = is_write || !self.writes_only.load(Ordering::SeqCst);
        if down && applies {
            self.failed_calls.fetch_add(1, Ordering::SeqCst);
            Err(StorageError::Backend("injected durable outage".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl DurableStore for FailingDurableStore {
    async fn upsert_stats_batch(&self, rows: &[DurableStatRecord]) -> Result<BatchWriteResult, StorageError> {
        self.maybe_fail(true)?;
        self.inner.upsert_stats_batch(rows).await
    }

    async fn find_stats_by_product_id(&self, product_id: &str) -> Result<Option<DurableStatRecord>, StorageError> {
        self.maybe_fail(false)?;
        self.inner.find_stats_by_product_id(product_id).await
    }

    async fn find_top_by_metric(&self, metric: Metric, limit: usize) -> Result<Vec<DurableStatRecord>, StorageError> {
        self.maybe_fail(false)?;
        self.inner.find_top_by_metric(metric, limit).await
    }

    async fn create_zeroed_stats_row(&self, product_id: &str) -> Result<bool, StorageError> {
        self.maybe_fail(true)?;
        self.inner.create_zeroed_stats_row(product_id).await
    }

    async fn clear_stats_row(&self, product_id: &str) -> Result<(), StorageError> {
        self.maybe_fail(true)?;
        self.inner.clear_stats_row(product_id).await
    }

    async fn find_active_boost(&self, product_id: &str, now: DateTime<Utc>) -> Result<Option<Boost>, StorageError> {
        self.maybe_fail(false)?;
        self.inner.find_active_boost(product_id, now).await
    }

    async fn count_active_boost(&self, product_id: &str, now: DateTime<Utc>) -> Result<u64, StorageError> {
        self.maybe_fail(false)?;
        self.inner.count_active_boost(product_id, now).await
    }

    async fn find_ranking_info(&self, product_id: &str) -> Result<Option<ProductRankingInfo>, StorageError> {
        self.maybe_fail(false)?;
        self.inner.find_ranking_info(product_id).await
    }

    async fn list_product_ids(&self, offset: u64, limit: usize) -> Result<Vec<String>, StorageError> {
        self.maybe_fail(false)?;
        self.inner.list_product_ids(offset, limit).await
    }
}

struct Harness {
    engine: Arc<StatsEngine>,
    fast: Arc<InMemoryFastTier>,
    durable: Arc<FailingDurableStore>,
    _config_tx: watch::Sender<StatsEngineConfig>,
}

fn harness() -> Harness {
    let config = StatsEngineConfig::default();
    let fast = Arc::new(InMemoryFastTier::new(config.counter_ttl()));
    let durable = Arc::new(FailingDurableStore::new());
    let (tx, rx) = watch::channel(config.clone());
    let backends = Backends::with_fast_tier(fast.clone(), durable.clone());
    Harness {
        engine: Arc::new(StatsEngine::new(config, rx, backends)),
        fast,
        durable,
        _config_tx: tx,
    }
}

async fn seed_products(h: &Harness, ids: &[&str]) {
    for id in ids {
        h.engine.on_product_created(id).await.unwrap();
        h.engine.record_event(id, &ProductEvent::OrderPlaced).await.unwrap();
    }
}

// =============================================================================
// Durable outage
// =============================================================================

#[tokio::test]
async fn chaos_failed_flush_redirties_whole_batch() {
    let h = harness();
    seed_products(&h, &["a", "b", "c"]).await;

    h.durable.set_down(true);
    let err = h.engine.flush_now().await.unwrap_err();
    assert!(matches!(err, FlushError::DurableWrite { redirtied: 3, .. }));
    assert_eq!(h.fast.dirty_len().await.unwrap(), 3);

    h.durable.set_down(false);
    let outcome = h.engine.flush_now().await.unwrap();
    assert_eq!(outcome.written, 3);
    assert_eq!(h.fast.dirty_len().await.unwrap(), 0);
    for id in ["a", "b", "c"] {
        let row = h.durable.find_stats_by_product_id(id).await.unwrap().unwrap();
        assert_eq!(row.total_orders, 1);
    }
}

#[tokio::test]
async fn chaos_increments_during_outage_are_not_lost() {
    let h = harness();
    seed_products(&h, &["p1"]).await;
    h.durable.set_down(true);

    // Two failures stay under the durable circuit's trip window
    for _ in 0..2 {
        h.engine.record_event("p1", &ProductEvent::OrderPlaced).await.unwrap();
        assert!(h.engine.flush_now().await.is_err());
    }
    assert!(h.fast.is_dirty("p1").await.unwrap());
    assert_eq!(h.durable.failed_calls(), 2);

    h.durable.set_down(false);
    let outcome = h.engine.flush_now().await.unwrap();
    assert_eq!(outcome.flushed, vec!["p1".to_string()]);

    let row = h.durable.find_stats_by_product_id("p1").await.unwrap().unwrap();
    assert_eq!(row.total_orders, 3);
    assert!(!h.fast.is_dirty("p1").await.unwrap());
}

#[tokio::test]
async fn chaos_durable_circuit_opens_and_rejects() {
    let h = harness();
    seed_products(&h, &["p1"]).await;
    h.durable.set_down(true);

    let mut rejected = false;
    for _ in 0..10 {
        if let Err(FlushError::CircuitOpen { redirtied }) = h.engine.flush_now().await {
            assert_eq!(redirtied, 1);
            rejected = true;
            break;
        }
    }
    assert!(rejected, "durable circuit never opened");

    let status = h.engine.status().await;
    assert!(status.circuits.durable_rejections >= 1);
    assert!(status.circuits.durable_failures >= 1);
    assert_eq!(status.dirty_products, Some(1));
}

// =============================================================================
// Degraded reads and rankings
// =============================================================================

#[tokio::test]
async fn chaos_live_counters_serve_reads_during_outage() {
    let h = harness();
    h.engine.on_product_created("p1").await.unwrap();
    h.engine.record_event("p1", &ProductEvent::Viewed { viewer_id: None }).await.unwrap();

    h.durable.set_down(true);
    let stats = h.engine.get_stats("p1").await.unwrap();
    assert_eq!(stats.total_views, 1);
}

#[tokio::test]
async fn chaos_evicted_read_during_outage_is_an_error() {
    let h = harness();
    h.engine.on_product_created("p1").await.unwrap();
    h.fast.evict("p1");

    h.durable.set_down(true);
    assert!(h.engine.get_stats("p1").await.is_err());
}

#[tokio::test]
async fn chaos_recreated_counters_are_not_written_without_durable_totals() {
    let h = harness();
    h.engine.on_product_created("p1").await.unwrap();
    h.fast.increment("p1", &CounterDeltas::views(5)).await.unwrap();
    h.engine.flush_now().await.unwrap();

    h.fast.evict("p1");
    h.engine.record_event("p1", &ProductEvent::Viewed { viewer_id: None }).await.unwrap();

    h.durable.set_down(true);
    let err = h.engine.flush_now().await.unwrap_err();
    assert!(matches!(err, FlushError::DurableRead { redirtied: 1, .. }));
    assert!(h.fast.is_dirty("p1").await.unwrap());

    h.durable.set_down(false);
    let row = h.durable.find_stats_by_product_id("p1").await.unwrap().unwrap();
    assert_eq!(row.total_views, 5);

    h.engine.flush_now().await.unwrap();
    let row = h.durable.find_stats_by_product_id("p1").await.unwrap().unwrap();
    assert_eq!(row.total_views, 6);
}

#[tokio::test]
async fn chaos_ranking_failures_are_counted_not_fatal() {
    let h = harness();
    for id in ["a", "b"] {
        h.engine.on_product_created(id).await.unwrap();
        h.fast.increment(id, &CounterDeltas::carts(1)).await.unwrap();
    }

    h.durable.set_down(true);
    let result = h
        .engine
        .batch_update_rankings(&["a".to_string(), "b".to_string()])
        .await;
    assert_eq!(result.total, 2);
    assert_eq!(result.failed, 2);
    assert!(!result.is_success());
}

#[tokio::test]
async fn chaos_shutdown_with_durable_down_keeps_dirty_set() {
    let h = harness();
    seed_products(&h, &["a", "b"]).await;
    h.durable.set_down(true);
    h.durable.set_writes_only(true);

    h.engine.shutdown().await;

    assert_eq!(h.engine.state(), EngineState::Stopped);
    assert_eq!(h.fast.dirty_len().await.unwrap(), 2);
}
