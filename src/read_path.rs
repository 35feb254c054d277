//! Stats read path.
//!
//! Lookup order for one product:
//!
//! 1. computed-cache entry, returned as is
//! 2. fast-tier counters that carry their durable baseline
//! 3. the durable record, added to whatever counters were recreated since an
//!    eviction and re-seeded into the fast tier in one atomic step
//!
//! The result is cached with a short TTL, and only if no increment landed
//! since the counters were read. Fast-tier failures fall through to the next
//! step; only a durable-store failure reaches the caller.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::try_join_all;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::catalog::DurableStatRecord;
use crate::counters::{CounterState, Metric, ProductCounterSet};
use crate::storage::traits::{CounterStore, DurableStore, StatsCache, StorageError};

/// `numerator / views * 100`, or 0 without views.
#[must_use]
pub fn percentage_of_views(numerator: u64, views: u64) -> f64 {
    if views == 0 {
        0.0
    } else {
        numerator as f64 / views as f64 * 100.0
    }
}

/// Derived stats for one product. Also the computed-cache payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductStatsResponse {
    pub product_id: String,
    pub total_views: u64,
    pub clicks: u64,
    pub organic_clicks: u64,
    pub total_carts: u64,
    pub total_orders: u64,
    pub boost_score: f64,
    /// Approximate
    pub unique_viewers: u64,
    pub conversion_rate: f64,
    pub click_through_rate: f64,
}

impl ProductStatsResponse {
    #[must_use]
    pub fn from_counters(product_id: impl Into<String>, counters: &ProductCounterSet, unique_viewers: u64) -> Self {
        Self {
            product_id: product_id.into(),
            total_views: counters.views,
            clicks: counters.clicks,
            organic_clicks: counters.organic_clicks,
            total_carts: counters.carts,
            total_orders: counters.orders,
            boost_score: counters.boost_score,
            unique_viewers,
            conversion_rate: percentage_of_views(counters.orders, counters.views),
            click_through_rate: percentage_of_views(counters.clicks, counters.views),
        }
    }
}

/// Rollup across several products.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregatedStats {
    pub product_count: usize,
    pub total_views: u64,
    pub total_clicks: u64,
    pub total_carts: u64,
    pub total_orders: u64,
    pub total_boost_score: f64,
    /// Mean of the per-product conversion rates
    pub average_conversion_rate: f64,
    /// Total orders over total views
    pub overall_conversion_rate: f64,
}

impl AggregatedStats {
    #[must_use]
    pub fn from_responses(responses: &[ProductStatsResponse]) -> Self {
        let mut agg = AggregatedStats {
            product_count: responses.len(),
            ..Default::default()
        };
        for r in responses {
            agg.total_views += r.total_views;
            agg.total_clicks += r.clicks;
            agg.total_carts += r.total_carts;
            agg.total_orders += r.total_orders;
            agg.total_boost_score += r.boost_score;
        }
        if !responses.is_empty() {
            agg.average_conversion_rate =
                responses.iter().map(|r| r.conversion_rate).sum::<f64>() / responses.len() as f64;
        }
        agg.overall_conversion_rate = percentage_of_views(agg.total_orders, agg.total_views);
        agg
    }
}

/// Which tier produced a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatsSource {
    Cache,
    Counters,
    Durable,
    Empty,
}

impl StatsSource {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cache => "cache",
            Self::Counters => "counters",
            Self::Durable => "durable",
            Self::Empty => "empty",
        }
    }
}

pub struct StatsReader {
    counters: Arc<dyn CounterStore>,
    cache: Arc<dyn StatsCache>,
    durable: Arc<dyn DurableStore>,
    cache_ttl: RwLock<Duration>,
}

impl StatsReader {
    pub fn new(
        counters: Arc<dyn CounterStore>,
        cache: Arc<dyn StatsCache>,
        durable: Arc<dyn DurableStore>,
        cache_ttl: Duration,
    ) -> Self {
        Self {
            counters,
            cache,
            durable,
            cache_ttl: RwLock::new(cache_ttl),
        }
    }

    pub fn set_cache_ttl(&self, ttl: Duration) {
        *self.cache_ttl.write() = ttl;
    }

    pub async fn get_stats(&self, product_id: &str) -> Result<ProductStatsResponse, StorageError> {
        self.get_stats_with_source(product_id).await.map(|(response, _)| response)
    }

    /// Same as [`get_stats`](Self::get_stats), also reporting which tier answered.
    #[tracing::instrument(skip(self))]
    pub async fn get_stats_with_source(
        &self,
        product_id: &str,
    ) -> Result<(ProductStatsResponse, StatsSource), StorageError> {
        let start = Instant::now();
        match self.cache.get_cached_stats(product_id).await {
            Ok(Some(payload)) => match serde_json::from_str::<ProductStatsResponse>(&payload) {
                Ok(response) => {
                    crate::metrics::record_stats_read(StatsSource::Cache.as_str());
                    crate::metrics::record_latency(StatsSource::Cache.as_str(), "get", start.elapsed());
                    return Ok((response, StatsSource::Cache));
                }
                Err(e) => warn!(error = %e, "Discarding unreadable cached stats"),
            },
            Ok(None) => {}
            Err(e) => warn!(error = %e, "Stats cache read failed"),
        }

        let live = match self.counters.read_state(product_id).await {
            Ok(state) => state,
            Err(e) => {
                warn!(error = %e, "Counter read failed, falling back to durable store");
                None
            }
        };

        let (counters, generation, source) = match live {
            Some(state) if state.baseline => (state.counters, Some(state.generation), StatsSource::Counters),
            _ => self.recover(product_id, live).await?,
        };

        let unique_viewers = self.counters.unique_viewers(product_id).await.unwrap_or_else(|e| {
            warn!(error = %e, "Unique viewer count unavailable");
            0
        });

        let response = ProductStatsResponse::from_counters(product_id, &counters, unique_viewers);
        if let Some(generation) = generation {
            self.write_cache(&response, generation).await;
        }

        crate::metrics::record_stats_read(source.as_str());
        crate::metrics::record_latency(source.as_str(), "get", start.elapsed());
        Ok((response, source))
    }

    /// Counters missing or without a baseline: add the durable record and
    /// re-seed. The generation is `None` when the result must not be cached.
    async fn recover(
        &self,
        product_id: &str,
        live: Option<CounterState>,
    ) -> Result<(ProductCounterSet, Option<u64>, StatsSource), StorageError> {
        let record = self.durable.find_stats_by_product_id(product_id).await?;
        let source = match (&record, &live) {
            (Some(_), _) => StatsSource::Durable,
            (None, Some(_)) => StatsSource::Counters,
            (None, None) => return Ok((ProductCounterSet::default(), Some(0), StatsSource::Empty)),
        };
        let durable = record.map(|r| r.to_counters()).unwrap_or_default();

        debug!(recreated = live.is_some(), "Re-seeding fast-tier counters from durable record");
        match self.counters.seed_counters(product_id, &durable).await {
            Ok(seeded) => Ok((seeded.counters, Some(seeded.generation), source)),
            Err(e) => {
                warn!(error = %e, "Failed to re-seed counters");
                let since_eviction = live.map(|state| state.counters).unwrap_or_default();
                Ok((since_eviction.plus(&durable).floored(), None, source))
            }
        }
    }

    async fn write_cache(&self, response: &ProductStatsResponse, generation: u64) {
        let ttl = *self.cache_ttl.read();
        match serde_json::to_string(response) {
            Ok(payload) => match self
                .cache
                .put_cached_stats(&response.product_id, &payload, ttl, generation)
                .await
            {
                Ok(true) => {}
                Ok(false) => debug!("Counters moved while computing stats, not caching"),
                Err(e) => warn!(error = %e, "Failed to cache computed stats"),
            },
            Err(e) => warn!(error = %e, "Failed to serialize computed stats"),
        }
    }

    /// Sum of [`get_stats`](Self::get_stats) over `product_ids`.
    #[tracing::instrument(skip(self, product_ids), fields(count = product_ids.len()))]
    pub async fn get_aggregated_stats(&self, product_ids: &[String]) -> Result<AggregatedStats, StorageError> {
        let responses = try_join_all(product_ids.iter().map(|id| self.get_stats(id))).await?;
        Ok(AggregatedStats::from_responses(&responses))
    }

    /// Top products by a durable total. Served from the durable store, so it
    /// lags the fast tier by up to one flush interval.
    pub async fn top_by_metric(&self, metric: Metric, limit: usize) -> Result<Vec<DurableStatRecord>, StorageError> {
        self.durable.find_top_by_metric(metric, limit).await
    }

    pub async fn invalidate(&self, product_id: &str) -> Result<(), StorageError> {
        self.cache.invalidate_cached_stats(product_id).await
    }
}
