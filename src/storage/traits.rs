use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::catalog::{Boost, DurableStatRecord, ProductRankingInfo};
use crate::counters::{CounterDeltas, CounterState, DirtyEntry, Metric, ProductCounterSet};

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Item not found")]
    NotFound,
    #[error("Storage backend error: {0}")]
    Backend(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

/// Result of a durable batch upsert
#[derive(Debug)]
pub struct BatchWriteResult {
    /// Unique id for this write (appears in logs)
    pub batch_id: String,
    /// Number of rows written
    pub written: usize,
    /// Whether every row was read back after the write
    pub verified: bool,
}

impl BatchWriteResult {
    pub(crate) fn empty() -> Self {
        Self {
            batch_id: String::new(),
            written: 0,
            verified: true,
        }
    }
}

/// One of the sorted rank indexes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RankIndex {
    /// Composite trending score
    Trending,
    /// Active discount percentage
    Discounted,
    /// Creation timestamp (ms), products younger than the new-arrival window
    NewArrivals,
    /// Base engagement score without recency or boost
    Popular,
}

impl RankIndex {
    pub const ALL: [RankIndex; 4] = [
        RankIndex::Trending,
        RankIndex::Discounted,
        RankIndex::NewArrivals,
        RankIndex::Popular,
    ];

    #[must_use]
    pub fn key_name(&self) -> &'static str {
        match self {
            Self::Trending => "rank:trending",
            Self::Discounted => "rank:discounted",
            Self::NewArrivals => "rank:new_arrivals",
            Self::Popular => "rank:popular",
        }
    }
}

impl std::fmt::Display for RankIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Trending => write!(f, "trending"),
            Self::Discounted => write!(f, "discounted"),
            Self::NewArrivals => write!(f, "new_arrivals"),
            Self::Popular => write!(f, "popular"),
        }
    }
}

/// Proof of lease ownership. Release succeeds only with the token that
/// acquired the lease.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockToken {
    pub name: String,
    pub token: String,
}

/// Per-product counters and the dirty set (fast tier).
///
/// A missing counter set means "evicted", never an error.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Seed every metric to zero with the rolling TTL. Leaves existing
    /// counters untouched. The new set carries no baseline until
    /// [`seed_counters`](Self::seed_counters) folds in the durable row.
    async fn init_counters(&self, product_id: &str) -> Result<(), StorageError>;

    /// Apply the deltas, bump the generation, mark the product dirty (keeping
    /// an existing first-dirtied timestamp) and drop its computed-cache
    /// entry, all as one atomic unit. A missing set is recreated without a
    /// baseline.
    async fn increment(&self, product_id: &str, deltas: &CounterDeltas) -> Result<(), StorageError>;

    /// Same as [`increment`](Self::increment) for many products. Atomic per
    /// product only.
    async fn batch_increment(&self, items: &[(String, CounterDeltas)]) -> Result<(), StorageError> {
        for (product_id, deltas) in items {
            self.increment(product_id, deltas).await?;
        }
        Ok(())
    }

    async fn read_state(&self, product_id: &str) -> Result<Option<CounterState>, StorageError>;

    /// Results match the input order.
    async fn read_state_batch(&self, product_ids: &[String]) -> Result<Vec<Option<CounterState>>, StorageError> {
        let mut out = Vec::with_capacity(product_ids.len());
        for id in product_ids {
            out.push(self.read_state(id).await?);
        }
        Ok(out)
    }

    /// Raw counters, baselined or not.
    async fn read_counters(&self, product_id: &str) -> Result<Option<ProductCounterSet>, StorageError> {
        Ok(self.read_state(product_id).await?.map(|state| state.counters))
    }

    /// Fold durable totals into a set that has no baseline yet (creating it
    /// when missing) and mark it baselined, atomically. A set that already
    /// has a baseline is returned unchanged, so concurrent re-seeds add the
    /// durable row once. Does not mark dirty.
    async fn seed_counters(&self, product_id: &str, durable: &ProductCounterSet) -> Result<CounterState, StorageError>;

    /// Zero every metric, mark the set baselined and drop the computed-cache
    /// entry. Dirty marking is left alone.
    async fn reset(&self, product_id: &str) -> Result<(), StorageError>;

    /// Drop counters, unique viewers, cache entry and dirty marking.
    async fn remove(&self, product_id: &str) -> Result<(), StorageError>;

    async fn refresh_ttl(&self, product_ids: &[String]) -> Result<(), StorageError>;

    /// Add to the dirty set. An already-dirty product keeps the earlier of
    /// the two timestamps.
    async fn mark_dirty(&self, entries: &[DirtyEntry]) -> Result<(), StorageError>;

    /// Atomically pop up to `max` entries, oldest first.
    async fn claim_dirty(&self, max: usize) -> Result<Vec<DirtyEntry>, StorageError>;

    async fn dirty_len(&self) -> Result<usize, StorageError>;

    async fn is_dirty(&self, product_id: &str) -> Result<bool, StorageError>;

    /// Approximate distinct viewers.
    async fn unique_viewers(&self, product_id: &str) -> Result<u64, StorageError>;
}

/// Short-TTL cache of serialized stats responses.
#[async_trait]
pub trait StatsCache: Send + Sync {
    async fn get_cached_stats(&self, product_id: &str) -> Result<Option<String>, StorageError>;

    /// Store `payload` only while the product's counter generation still
    /// equals `generation` (0 when the product has no counters). Returns
    /// false when a write landed after the payload was computed.
    async fn put_cached_stats(
        &self,
        product_id: &str,
        payload: &str,
        ttl: Duration,
        generation: u64,
    ) -> Result<bool, StorageError>;

    async fn invalidate_cached_stats(&self, product_id: &str) -> Result<(), StorageError>;
}

/// Sorted product indexes. Reads are highest score first; equal scores
/// order by product id descending.
#[async_trait]
pub trait RankIndexStore: Send + Sync {
    async fn upsert(&self, index: RankIndex, product_id: &str, score: f64) -> Result<(), StorageError>;

    async fn remove(&self, index: RankIndex, product_id: &str) -> Result<(), StorageError>;

    async fn remove_everywhere(&self, product_id: &str) -> Result<(), StorageError> {
        for index in RankIndex::ALL {
            self.remove(index, product_id).await?;
        }
        Ok(())
    }

    async fn range(&self, index: RankIndex, offset: usize, limit: usize) -> Result<Vec<(String, f64)>, StorageError>;

    /// 0-based position, `None` when absent.
    async fn rank(&self, index: RankIndex, product_id: &str) -> Result<Option<usize>, StorageError>;

    async fn score(&self, index: RankIndex, product_id: &str) -> Result<Option<f64>, StorageError>;

    /// Remove every member scoring `<= max_score`. Returns the count removed.
    async fn prune_at_or_below(&self, index: RankIndex, max_score: f64) -> Result<usize, StorageError>;

    async fn len(&self, index: RankIndex) -> Result<usize, StorageError>;
}

/// TTL lease used for cross-instance mutual exclusion.
#[async_trait]
pub trait LeaseLock: Send + Sync {
    /// `None` when another holder owns the lease.
    async fn acquire(&self, name: &str, ttl: Duration) -> Result<Option<LockToken>, StorageError>;

    /// Compare-and-delete. `false` if the lease expired or changed hands.
    async fn release(&self, token: &LockToken) -> Result<bool, StorageError>;
}

/// System-of-record store for product statistics plus the read-only
/// boost and product attributes ranking needs.
#[async_trait]
pub trait DurableStore: Send + Sync {
    /// Insert-or-overwrite keyed by product id. Existing rows keep their
    /// `created_at`.
    async fn upsert_stats_batch(&self, rows: &[DurableStatRecord]) -> Result<BatchWriteResult, StorageError>;

    async fn find_stats_by_product_id(&self, product_id: &str) -> Result<Option<DurableStatRecord>, StorageError>;

    async fn find_top_by_metric(&self, metric: Metric, limit: usize) -> Result<Vec<DurableStatRecord>, StorageError>;

    /// Insert a zeroed row unless one exists. Returns true when created.
    async fn create_zeroed_stats_row(&self, product_id: &str) -> Result<bool, StorageError>;

    /// Soft clear: zero the totals, keep the row.
    async fn clear_stats_row(&self, product_id: &str) -> Result<(), StorageError>;

    /// Highest-scoring boost that is active at `now`.
    async fn find_active_boost(&self, product_id: &str, now: DateTime<Utc>) -> Result<Option<Boost>, StorageError>;

    async fn count_active_boost(&self, product_id: &str, now: DateTime<Utc>) -> Result<u64, StorageError>;

    async fn find_ranking_info(&self, product_id: &str) -> Result<Option<ProductRankingInfo>, StorageError>;

    /// Product ids with a stats row, ordered by id.
    async fn list_product_ids(&self, offset: u64, limit: usize) -> Result<Vec<String>, StorageError>;
}
