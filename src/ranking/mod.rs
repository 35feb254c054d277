//! Ranking engine: keeps the trending, popular, discounted and new-arrival
//! indexes approximately fresh.
//!
//! Incremental updates ([`RankingEngine::update_product_ranking`]) run after
//! flushes and boost changes. They may observe counters from before or after
//! a concurrent increment; the periodic [`RankingEngine::rebuild_all`]
//! corrects that drift. Rebuild and cleanup each hold a lease lock so only
//! one instance runs them at a time.

mod score;

pub use score::{RankingWeights, ScoreBreakdown};

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::future::join_all;
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::config::StatsEngineConfig;
use crate::counters::ProductCounterSet;
use crate::engine::BatchResult;
use crate::storage::traits::{CounterStore, DurableStore, LeaseLock, RankIndex, RankIndexStore, StorageError};

pub const REBUILD_LOCK: &str = "rankings:rebuild";
pub const CLEANUP_LOCK: &str = "rankings:cleanup";

#[derive(Debug, Clone)]
struct RankingSettings {
    weights: RankingWeights,
    chunk_size: usize,
    page_size: usize,
    new_arrival_days: i64,
    lock_ttl: Duration,
}

impl RankingSettings {
    fn from_config(config: &StatsEngineConfig) -> Self {
        Self {
            weights: config.ranking_weights.clone(),
            chunk_size: config.ranking_chunk_size.max(1),
            page_size: config.rebuild_page_size.max(1),
            new_arrival_days: config.new_arrival_days,
            lock_ttl: config.lock_ttl(),
        }
    }
}

/// What a cleanup pass removed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub new_arrivals_pruned: usize,
    pub trending_pruned: usize,
    pub discounted_removed: usize,
}

pub struct RankingEngine {
    counters: Arc<dyn CounterStore>,
    indexes: Arc<dyn RankIndexStore>,
    locks: Arc<dyn LeaseLock>,
    durable: Arc<dyn DurableStore>,
    settings: RwLock<RankingSettings>,
}

impl RankingEngine {
    pub fn new(
        counters: Arc<dyn CounterStore>,
        indexes: Arc<dyn RankIndexStore>,
        locks: Arc<dyn LeaseLock>,
        durable: Arc<dyn DurableStore>,
        config: &StatsEngineConfig,
    ) -> Self {
        Self {
            counters,
            indexes,
            locks,
            durable,
            settings: RwLock::new(RankingSettings::from_config(config)),
        }
    }

    /// Pick up new weights and sizes from a config update.
    pub fn apply_config(&self, config: &StatsEngineConfig) {
        *self.settings.write() = RankingSettings::from_config(config);
    }

    #[must_use]
    pub fn weights(&self) -> RankingWeights {
        self.settings.read().weights.clone()
    }

    /// Counters for scoring: baselined fast-tier totals, otherwise the
    /// durable totals plus whatever was counted since an eviction.
    async fn scoring_counters(&self, product_id: &str) -> Result<ProductCounterSet, StorageError> {
        let since_eviction = match self.counters.read_state(product_id).await {
            Ok(Some(state)) if state.baseline => return Ok(state.counters),
            Ok(Some(state)) => state.counters,
            Ok(None) => ProductCounterSet::default(),
            Err(e) => {
                warn!(product_id, error = %e, "Fast tier read failed, scoring from durable totals");
                ProductCounterSet::default()
            }
        };
        let durable = self
            .durable
            .find_stats_by_product_id(product_id)
            .await?
            .map(|record| record.to_counters())
            .unwrap_or_default();
        Ok(since_eviction.plus(&durable).floored())
    }

    /// Recompute one product's score and index memberships.
    #[tracing::instrument(skip(self))]
    pub async fn update_product_ranking(&self, product_id: &str) -> Result<ScoreBreakdown, StorageError> {
        self.update_at(product_id, Utc::now()).await
    }

    async fn update_at(&self, product_id: &str, now: DateTime<Utc>) -> Result<ScoreBreakdown, StorageError> {
        let settings = self.settings.read().clone();

        let counters = self.scoring_counters(product_id).await?;
        let boosted = self.durable.count_active_boost(product_id, now).await? > 0;
        let info = self.durable.find_ranking_info(product_id).await?;

        let age_days = info.as_ref().map(|i| i.age_in_days(now));
        let breakdown = settings
            .weights
            .score(&counters, age_days, settings.new_arrival_days, boosted);

        self.indexes.upsert(RankIndex::Trending, product_id, breakdown.score).await?;
        self.indexes.upsert(RankIndex::Popular, product_id, breakdown.base).await?;

        match info.as_ref().and_then(|i| i.active_discount(now)) {
            Some(percentage) => self.indexes.upsert(RankIndex::Discounted, product_id, percentage).await?,
            None => self.indexes.remove(RankIndex::Discounted, product_id).await?,
        }

        match info.as_ref().filter(|i| i.is_new_arrival(now, settings.new_arrival_days)) {
            Some(info) => {
                self.indexes
                    .upsert(RankIndex::NewArrivals, product_id, info.created_at.timestamp_millis() as f64)
                    .await?
            }
            None => self.indexes.remove(RankIndex::NewArrivals, product_id).await?,
        }

        debug!(score = breakdown.score, boosted, "Ranking updated");
        Ok(breakdown)
    }

    /// Update many products, `chunk_size` at a time. Failures are logged and
    /// counted; the batch carries on.
    #[tracing::instrument(skip(self, product_ids), fields(count = product_ids.len()))]
    pub async fn batch_update_rankings(&self, product_ids: &[String]) -> BatchResult {
        let chunk_size = self.settings.read().chunk_size;
        let now = Utc::now();
        let mut result = BatchResult {
            total: product_ids.len(),
            succeeded: 0,
            failed: 0,
        };

        for chunk in product_ids.chunks(chunk_size) {
            let outcomes = join_all(chunk.iter().map(|id| self.update_at(id, now))).await;
            for (id, outcome) in chunk.iter().zip(outcomes) {
                match outcome {
                    Ok(_) => {
                        result.succeeded += 1;
                        crate::metrics::record_ranking_update("success");
                    }
                    Err(e) => {
                        result.failed += 1;
                        crate::metrics::record_ranking_update("error");
                        warn!(product_id = %id, error = %e, "Ranking update failed, skipping");
                    }
                }
            }
        }

        result
    }

    async fn ids(&self, index: RankIndex, limit: usize, offset: usize) -> Result<Vec<String>, StorageError> {
        Ok(self
            .indexes
            .range(index, offset, limit)
            .await?
            .into_iter()
            .map(|(id, _)| id)
            .collect())
    }

    pub async fn get_trending_products(&self, limit: usize, offset: usize) -> Result<Vec<String>, StorageError> {
        self.ids(RankIndex::Trending, limit, offset).await
    }

    pub async fn get_discounted_products(&self, limit: usize, offset: usize) -> Result<Vec<String>, StorageError> {
        self.ids(RankIndex::Discounted, limit, offset).await
    }

    /// Most recently created first.
    pub async fn get_new_arrivals(&self, limit: usize, offset: usize) -> Result<Vec<String>, StorageError> {
        self.ids(RankIndex::NewArrivals, limit, offset).await
    }

    pub async fn get_popular_products(&self, limit: usize, offset: usize) -> Result<Vec<String>, StorageError> {
        self.ids(RankIndex::Popular, limit, offset).await
    }

    /// 1-based trending position, `None` when not ranked.
    pub async fn get_product_trending_rank(&self, product_id: &str) -> Result<Option<usize>, StorageError> {
        Ok(self
            .indexes
            .rank(RankIndex::Trending, product_id)
            .await?
            .map(|rank| rank + 1))
    }

    #[tracing::instrument(skip(self))]
    pub async fn remove_product_from_rankings(&self, product_id: &str) -> Result<(), StorageError> {
        self.indexes.remove_everywhere(product_id).await
    }

    /// Recompute every product with a stats row. `None` when another
    /// instance holds the rebuild lease.
    #[tracing::instrument(skip(self))]
    pub async fn rebuild_all(&self) -> Result<Option<BatchResult>, StorageError> {
        let (page_size, lock_ttl) = {
            let settings = self.settings.read();
            (settings.page_size, settings.lock_ttl)
        };

        let Some(token) = self.locks.acquire(REBUILD_LOCK, lock_ttl).await? else {
            crate::metrics::record_lock_busy(REBUILD_LOCK);
            debug!("Rebuild lease held elsewhere, skipping");
            return Ok(None);
        };

        let start = Instant::now();
        let outcome = self.rebuild_pages(page_size).await;

        if !self.locks.release(&token).await.unwrap_or(false) {
            warn!("Rebuild lease expired before release; another rebuild may have overlapped");
        }

        let result = outcome?;
        crate::metrics::record_ranking_rebuild(result.total, start.elapsed());
        info!(
            total = result.total,
            succeeded = result.succeeded,
            failed = result.failed,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Ranking rebuild complete"
        );
        Ok(Some(result))
    }

    async fn rebuild_pages(&self, page_size: usize) -> Result<BatchResult, StorageError> {
        let mut total = BatchResult {
            total: 0,
            succeeded: 0,
            failed: 0,
        };
        let mut offset = 0u64;

        loop {
            let page = self.durable.list_product_ids(offset, page_size).await?;
            if page.is_empty() {
                break;
            }

            let result = self.batch_update_rankings(&page).await;
            total.total += result.total;
            total.succeeded += result.succeeded;
            total.failed += result.failed;

            if page.len() < page_size {
                break;
            }
            offset += page.len() as u64;
        }

        Ok(total)
    }

    /// Prune aged-out new arrivals, zero-score trending entries and ended
    /// discounts. `None` when another instance holds the cleanup lease.
    #[tracing::instrument(skip(self))]
    pub async fn cleanup(&self) -> Result<Option<CleanupReport>, StorageError> {
        self.cleanup_at(Utc::now()).await
    }

    async fn cleanup_at(&self, now: DateTime<Utc>) -> Result<Option<CleanupReport>, StorageError> {
        let (days, lock_ttl) = {
            let settings = self.settings.read();
            (settings.new_arrival_days, settings.lock_ttl)
        };

        let Some(token) = self.locks.acquire(CLEANUP_LOCK, lock_ttl).await? else {
            crate::metrics::record_lock_busy(CLEANUP_LOCK);
            return Ok(None);
        };

        let outcome = self.prune(now, days).await;

        if !self.locks.release(&token).await.unwrap_or(false) {
            warn!("Cleanup lease expired before release");
        }

        let report = outcome?;
        crate::metrics::record_index_pruned("new_arrivals", report.new_arrivals_pruned);
        crate::metrics::record_index_pruned("trending", report.trending_pruned);
        crate::metrics::record_index_pruned("discounted", report.discounted_removed);
        info!(
            new_arrivals = report.new_arrivals_pruned,
            trending = report.trending_pruned,
            discounted = report.discounted_removed,
            "Rank index cleanup complete"
        );
        Ok(Some(report))
    }

    async fn prune(&self, now: DateTime<Utc>, days: i64) -> Result<CleanupReport, StorageError> {
        // Strictly older than the window; the boundary product is still new
        let cutoff = (now - chrono::Duration::days(days)).timestamp_millis() as f64 - 1.0;

        let new_arrivals_pruned = self.indexes.prune_at_or_below(RankIndex::NewArrivals, cutoff).await?;
        let trending_pruned = self.indexes.prune_at_or_below(RankIndex::Trending, 0.0).await?;

        let mut discounted_removed = 0;
        let len = self.indexes.len(RankIndex::Discounted).await?;
        let members = self.indexes.range(RankIndex::Discounted, 0, len).await?;
        for (product_id, _) in members {
            let active = match self.durable.find_ranking_info(&product_id).await {
                Ok(info) => info.and_then(|i| i.active_discount(now)).is_some(),
                Err(e) => {
                    warn!(product_id = %product_id, error = %e, "Could not check discount, keeping entry");
                    true
                }
            };
            if !active {
                self.indexes.remove(RankIndex::Discounted, &product_id).await?;
                discounted_removed += 1;
            }
        }

        Ok(CleanupReport {
            new_arrivals_pruned,
            trending_pruned,
            discounted_removed,
        })
    }
}
