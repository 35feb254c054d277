//! Stats engine coordinator.
//!
//! The [`StatsEngine`] ties the components together:
//! - increment gateway in front of the fast-tier counters
//! - sync engine flushing dirty counters to the durable store
//! - ranking engine maintaining the rank indexes
//! - read path with computed-cache and eviction recovery
//! - local job queue running flushes, rebuilds and cleanups
//!
//! # Lifecycle
//!
//! ```text
//! Ready → Running → ShuttingDown → Stopped
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use product_stats_engine::{StatsEngine, StatsEngineConfig, EngineState, ProductEvent};
//! use tokio::sync::watch;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let config = StatsEngineConfig::default();
//! let (_tx, rx) = watch::channel(config.clone());
//! let engine = StatsEngine::connect(config, rx).await.expect("backends");
//! assert_eq!(engine.state(), EngineState::Ready);
//!
//! engine.on_product_created("p1").await.expect("create");
//! engine.record_event("p1", &ProductEvent::OrderPlaced).await.expect("record");
//! let stats = engine.get_stats("p1").await.expect("stats");
//! assert_eq!(stats.total_orders, 1);
//! # }
//! ```

mod jobs;
mod lifecycle;
mod types;

pub use jobs::{RankingJobPayload, SyncJobPayload};
pub use types::{BatchResult, EngineState, EngineStatus};

use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

use crate::catalog::DurableStatRecord;
use crate::config::StatsEngineConfig;
use crate::counters::{Metric, ProductCounterSet};
use crate::flush::{FlushError, FlushOutcome, FlushReason, SyncEngine};
use crate::gateway::{GatewayError, IncrementGateway, ProductEvent};
use crate::queue::{Job, JobQueue, LocalJobQueue, QueueError, CLEANUP_JOB, RANKING_UPDATE_JOB, REBUILD_JOB, SYNC_JOB};
use crate::ranking::{CleanupReport, RankingEngine, ScoreBreakdown};
use crate::read_path::{AggregatedStats, ProductStatsResponse, StatsReader, StatsSource};
use crate::resilience::circuit_breaker::TierCircuits;
use crate::resilience::retry::RetryConfig;
use crate::storage::memory::{InMemoryDurableStore, InMemoryFastTier};
use crate::storage::redis::RedisFastTier;
use crate::storage::sql::SqlStatsStore;
use crate::storage::traits::{CounterStore, DurableStore, LeaseLock, RankIndexStore, StatsCache, StorageError};

use jobs::EngineJobs;

/// The storage seams the engine runs on.
///
/// One fast-tier backend usually fills the first four; the in-memory and
/// Redis tiers both do.
#[derive(Clone)]
pub struct Backends {
    pub counters: Arc<dyn CounterStore>,
    pub cache: Arc<dyn StatsCache>,
    pub indexes: Arc<dyn RankIndexStore>,
    pub locks: Arc<dyn LeaseLock>,
    pub durable: Arc<dyn DurableStore>,
}

impl Backends {
    /// Use one fast-tier backend for counters, cache, indexes and locks.
    pub fn with_fast_tier<T>(fast: Arc<T>, durable: Arc<dyn DurableStore>) -> Self
    where
        T: CounterStore + StatsCache + RankIndexStore + LeaseLock + 'static,
    {
        Self {
            counters: fast.clone(),
            cache: fast.clone(),
            indexes: fast.clone(),
            locks: fast,
            durable,
        }
    }

    /// Both tiers in process memory.
    #[must_use]
    pub fn in_memory(config: &StatsEngineConfig) -> Self {
        Self::with_fast_tier(
            Arc::new(InMemoryFastTier::new(config.counter_ttl())),
            Arc::new(InMemoryDurableStore::new()),
        )
    }
}

/// Main stats engine coordinator.
///
/// `Send + Sync`; share it behind an `Arc` and call [`run()`](Self::run) on
/// one task while request handlers use the rest of the API.
pub struct StatsEngine {
    /// Configuration (updated at runtime via watch channel)
    pub(super) config: RwLock<StatsEngineConfig>,

    /// Runtime config updates (Mutex for interior mutability in run loop)
    pub(super) config_rx: Mutex<watch::Receiver<StatsEngineConfig>>,

    /// Engine state (broadcast to watchers)
    pub(super) state: watch::Sender<EngineState>,

    /// Engine state receiver (for internal use)
    pub(super) state_rx: watch::Receiver<EngineState>,

    pub(super) backends: Backends,
    pub(super) gateway: IncrementGateway,
    pub(super) sync: Arc<SyncEngine>,
    pub(super) ranking: Arc<RankingEngine>,
    pub(super) reader: StatsReader,
    pub(super) circuits: Arc<TierCircuits>,
    pub(super) jobs: Arc<EngineJobs>,
    pub(super) queue: LocalJobQueue,
}

impl StatsEngine {
    /// Create an engine over explicit backends. Starts in `Ready`.
    pub fn new(
        config: StatsEngineConfig,
        config_rx: watch::Receiver<StatsEngineConfig>,
        backends: Backends,
    ) -> Self {
        let (state_tx, state_rx) = watch::channel(EngineState::Ready);
        let circuits = Arc::new(TierCircuits::default());

        let gateway = IncrementGateway::new(
            Arc::clone(&backends.counters),
            config.dirty_high_water,
            Arc::new(tokio::sync::Notify::new()),
        );
        let sync = Arc::new(SyncEngine::new(
            Arc::clone(&backends.counters),
            Arc::clone(&backends.durable),
            Arc::clone(&circuits),
            config.sync_batch_max,
        ));
        let ranking = Arc::new(RankingEngine::new(
            Arc::clone(&backends.counters),
            Arc::clone(&backends.indexes),
            Arc::clone(&backends.locks),
            Arc::clone(&backends.durable),
            &config,
        ));
        let reader = StatsReader::new(
            Arc::clone(&backends.counters),
            Arc::clone(&backends.cache),
            Arc::clone(&backends.durable),
            config.stats_cache_ttl(),
        );
        let jobs = Arc::new(EngineJobs::new(Arc::clone(&sync), Arc::clone(&ranking)));
        let queue = LocalJobQueue::new(jobs.clone());

        crate::metrics::set_engine_state(EngineState::Ready.as_str());

        Self {
            config: RwLock::new(config),
            config_rx: Mutex::new(config_rx),
            state: state_tx,
            state_rx,
            backends,
            gateway,
            sync,
            ranking,
            reader,
            circuits,
            jobs,
            queue,
        }
    }

    /// Build backends from the configured URLs and create the engine.
    ///
    /// A tier without a URL runs in memory (with a warning). A configured
    /// tier that cannot be reached after the startup retries is an error.
    #[tracing::instrument(skip(config, config_rx), fields(has_redis, has_sql))]
    pub async fn connect(
        config: StatsEngineConfig,
        config_rx: watch::Receiver<StatsEngineConfig>,
    ) -> Result<Self, StorageError> {
        tracing::Span::current().record("has_redis", config.redis_url.is_some());
        tracing::Span::current().record("has_sql", config.sql_url.is_some());

        let durable: Arc<dyn DurableStore> = match &config.sql_url {
            Some(url) => {
                info!("Connecting durable tier (SQL)");
                Arc::new(SqlStatsStore::new(url).await?)
            }
            None => {
                warn!("No sql_url configured, durable tier is in memory and will not survive restarts");
                Arc::new(InMemoryDurableStore::new())
            }
        };

        let backends = match &config.redis_url {
            Some(url) => {
                info!(prefix = %config.redis_prefix, "Connecting fast tier (Redis)");
                let fast = RedisFastTier::new(url, &config.redis_prefix, config.counter_ttl()).await?;
                Backends::with_fast_tier(Arc::new(fast), durable)
            }
            None => {
                warn!("No redis_url configured, fast tier is in memory and local to this process");
                Backends::with_fast_tier(Arc::new(InMemoryFastTier::new(config.counter_ttl())), durable)
            }
        };

        Ok(Self::new(config, config_rx, backends))
    }

    /// Get current engine state.
    #[must_use]
    pub fn state(&self) -> EngineState {
        *self.state_rx.borrow()
    }

    /// Get a receiver to watch state changes.
    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<EngineState> {
        self.state_rx.clone()
    }

    /// Snapshot of the active configuration.
    #[must_use]
    pub fn config(&self) -> StatsEngineConfig {
        self.config.read().clone()
    }

    #[must_use]
    pub fn backends(&self) -> &Backends {
        &self.backends
    }

    pub(super) fn set_state(&self, state: EngineState) {
        let _ = self.state.send(state);
        crate::metrics::set_engine_state(state.as_str());
    }

    /// Push a new configuration into every component.
    pub(super) fn apply_config(&self, config: StatsEngineConfig) {
        self.gateway.set_high_water(config.dirty_high_water);
        self.sync.set_batch_max(config.sync_batch_max);
        self.ranking.apply_config(&config);
        self.reader.set_cache_ttl(config.stats_cache_ttl());
        *self.config.write() = config;
    }

    pub async fn status(&self) -> EngineStatus {
        let dirty_products = match self.backends.counters.dirty_len().await {
            Ok(len) => Some(len),
            Err(e) => {
                warn!(error = %e, "Status check could not read dirty set");
                None
            }
        };
        EngineStatus {
            state: self.state(),
            dirty_products,
            pending_jobs: self.queue.pending_len(),
            circuits: self.circuits.snapshot(),
        }
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Events
    // ═══════════════════════════════════════════════════════════════════════════

    pub async fn record_event(&self, product_id: &str, event: &ProductEvent) -> Result<(), GatewayError> {
        self.gateway.record_event(product_id, event).await
    }

    /// Record from the `(eventType, metadata)` shape used by API callers.
    pub async fn record_raw_event(
        &self,
        product_id: &str,
        event_type: &str,
        metadata: Option<&Value>,
    ) -> Result<(), GatewayError> {
        self.gateway.record_raw(product_id, event_type, metadata).await
    }

    pub async fn record_events(&self, events: &[(String, ProductEvent)]) -> Result<(), GatewayError> {
        self.gateway.record_events(events).await
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Reads
    // ═══════════════════════════════════════════════════════════════════════════

    pub async fn get_stats(&self, product_id: &str) -> Result<ProductStatsResponse, StorageError> {
        self.reader.get_stats(product_id).await
    }

    pub async fn get_stats_with_source(
        &self,
        product_id: &str,
    ) -> Result<(ProductStatsResponse, StatsSource), StorageError> {
        self.reader.get_stats_with_source(product_id).await
    }

    pub async fn get_aggregated_stats(&self, product_ids: &[String]) -> Result<AggregatedStats, StorageError> {
        self.reader.get_aggregated_stats(product_ids).await
    }

    pub async fn top_by_metric(&self, metric: Metric, limit: usize) -> Result<Vec<DurableStatRecord>, StorageError> {
        self.reader.top_by_metric(metric, limit).await
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Rankings
    // ═══════════════════════════════════════════════════════════════════════════

    pub async fn get_trending_products(&self, limit: usize, offset: usize) -> Result<Vec<String>, StorageError> {
        self.ranking.get_trending_products(limit, offset).await
    }

    pub async fn get_discounted_products(&self, limit: usize, offset: usize) -> Result<Vec<String>, StorageError> {
        self.ranking.get_discounted_products(limit, offset).await
    }

    pub async fn get_new_arrivals(&self, limit: usize, offset: usize) -> Result<Vec<String>, StorageError> {
        self.ranking.get_new_arrivals(limit, offset).await
    }

    pub async fn get_popular_products(&self, limit: usize, offset: usize) -> Result<Vec<String>, StorageError> {
        self.ranking.get_popular_products(limit, offset).await
    }

    /// 1-based position in the trending index.
    pub async fn get_product_trending_rank(&self, product_id: &str) -> Result<Option<usize>, StorageError> {
        self.ranking.get_product_trending_rank(product_id).await
    }

    pub async fn update_product_ranking(&self, product_id: &str) -> Result<ScoreBreakdown, StorageError> {
        self.ranking.update_product_ranking(product_id).await
    }

    pub async fn batch_update_rankings(&self, product_ids: &[String]) -> BatchResult {
        self.ranking.batch_update_rankings(product_ids).await
    }

    pub async fn remove_product_from_rankings(&self, product_id: &str) -> Result<(), StorageError> {
        self.ranking.remove_product_from_rankings(product_id).await
    }

    /// Full rebuild now, on the calling task. `None` if the lease is held elsewhere.
    pub async fn rebuild_rankings(&self) -> Result<Option<BatchResult>, StorageError> {
        self.ranking.rebuild_all().await
    }

    pub async fn cleanup_rankings(&self) -> Result<Option<CleanupReport>, StorageError> {
        self.ranking.cleanup().await
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Sync
    // ═══════════════════════════════════════════════════════════════════════════

    /// Run one flush cycle now and refresh rankings for what it wrote.
    pub async fn flush_now(&self) -> Result<FlushOutcome, FlushError> {
        let outcome = self.sync.flush_cycle(FlushReason::OnDemand).await?;
        self.jobs.rank_flushed(&outcome).await;
        Ok(outcome)
    }

    /// Flush the given products now, whether or not they were dirty.
    pub async fn sync_products(&self, product_ids: &[String]) -> Result<FlushOutcome, FlushError> {
        let outcome = self.sync.sync_products(product_ids).await?;
        self.jobs.rank_flushed(&outcome).await;
        Ok(outcome)
    }

    /// Queue a flush cycle. `Ok(false)` when one is already pending.
    pub async fn schedule_flush(&self, reason: FlushReason) -> Result<bool, QueueError> {
        let payload = serde_json::to_value(SyncJobPayload {
            reason,
            product_ids: Vec::new(),
        })?;
        self.queue
            .enqueue(Job::new(SYNC_JOB, "flush", payload), RetryConfig::query())
            .await
    }

    /// Queue a targeted sync for `product_ids`.
    pub async fn schedule_product_sync(&self, product_ids: &[String]) -> Result<bool, QueueError> {
        let payload = serde_json::to_value(SyncJobPayload {
            reason: FlushReason::OnDemand,
            product_ids: product_ids.to_vec(),
        })?;
        self.queue
            .enqueue(Job::new(SYNC_JOB, product_ids.join(","), payload), RetryConfig::query())
            .await
    }

    /// Queue ranking updates for `product_ids`.
    pub async fn schedule_ranking_update(&self, product_ids: &[String]) -> Result<bool, QueueError> {
        let payload = serde_json::to_value(RankingJobPayload {
            product_ids: product_ids.to_vec(),
        })?;
        self.queue
            .enqueue(Job::new(RANKING_UPDATE_JOB, product_ids.join(","), payload), RetryConfig::job())
            .await
    }

    pub(super) async fn schedule_maintenance(&self, name: &'static str) -> Result<bool, QueueError> {
        self.queue
            .enqueue(Job::new(name, "all", Value::Null), RetryConfig::job())
            .await
    }

    /// Wait for every queued job to finish.
    pub async fn wait_for_jobs(&self) {
        self.queue.wait_idle().await;
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Product and boost lifecycle
    // ═══════════════════════════════════════════════════════════════════════════

    /// Zeroed stats row, fast-tier counters baselined on that row, and
    /// initial index entries.
    #[tracing::instrument(skip(self))]
    pub async fn on_product_created(&self, product_id: &str) -> Result<(), StorageError> {
        self.backends.counters.init_counters(product_id).await?;
        let created = self.backends.durable.create_zeroed_stats_row(product_id).await?;
        let existing = if created {
            ProductCounterSet::default()
        } else {
            debug!("Stats row already existed");
            self.backends
                .durable
                .find_stats_by_product_id(product_id)
                .await?
                .map(|record| record.to_counters())
                .unwrap_or_default()
        };
        self.backends.counters.seed_counters(product_id, &existing).await?;

        if let Err(e) = self.ranking.update_product_ranking(product_id).await {
            warn!(error = %e, "Initial ranking failed, next rebuild will place the product");
        }
        Ok(())
    }

    /// Drop the product from every index and from the fast tier. The durable
    /// row stays with the product's other records.
    #[tracing::instrument(skip(self))]
    pub async fn on_product_deleted(&self, product_id: &str) -> Result<(), StorageError> {
        self.ranking.remove_product_from_rankings(product_id).await?;
        self.backends.counters.remove(product_id).await
    }

    /// Zero the live counters and soft-clear the durable row.
    #[tracing::instrument(skip(self))]
    pub async fn reset_product_stats(&self, product_id: &str) -> Result<(), StorageError> {
        self.backends.counters.reset(product_id).await?;
        self.backends.durable.clear_stats_row(product_id).await?;

        if let Err(e) = self.ranking.update_product_ranking(product_id).await {
            warn!(error = %e, "Ranking refresh after reset failed");
        }
        Ok(())
    }

    /// A boost was activated, expired or cancelled.
    #[tracing::instrument(skip(self))]
    pub async fn on_boost_changed(&self, product_id: &str) -> Result<ScoreBreakdown, StorageError> {
        self.ranking.update_product_ranking(product_id).await
    }
}
