//! In-memory backends.
//!
//! [`InMemoryFastTier`] implements every fast-tier trait on one struct so the
//! counter increment, dirty mark and cache invalidation can share a critical
//! section. [`InMemoryDurableStore`] stands in for the relational store.
//! Both back the test suites and run the engine when no URLs are configured.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use ordered_float::OrderedFloat;
use parking_lot::{Mutex, RwLock};

use super::traits::{
    BatchWriteResult, CounterStore, DurableStore, LeaseLock, LockToken, RankIndex, RankIndexStore,
    StatsCache, StorageError,
};
use crate::catalog::{Boost, DurableStatRecord, ProductRankingInfo};
use crate::counters::{CounterDeltas, CounterState, DirtyEntry, Metric, ProductCounterSet};
use crate::unique::HyperLogLog;

struct CounterEntry {
    counters: ProductCounterSet,
    viewers: HyperLogLog,
    expires_at: Instant,
    baseline: bool,
    generation: u64,
}

impl CounterEntry {
    fn fresh(ttl: Duration) -> Self {
        Self {
            counters: ProductCounterSet::default(),
            viewers: HyperLogLog::default(),
            expires_at: Instant::now() + ttl,
            baseline: false,
            generation: 0,
        }
    }

    fn state(&self) -> CounterState {
        CounterState::new(self.counters, self.baseline, self.generation)
    }

    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

struct CachedPayload {
    payload: String,
    expires_at: Instant,
}

/// Dirty set ordered by first-dirtied time.
#[derive(Default)]
struct DirtyQueue {
    by_id: HashMap<String, i64>,
    order: BTreeSet<(i64, String)>,
}

impl DirtyQueue {
    fn mark(&mut self, product_id: &str, ts: i64) {
        match self.by_id.get(product_id).copied() {
            Some(existing) if existing <= ts => {}
            Some(existing) => {
                self.order.remove(&(existing, product_id.to_string()));
                self.order.insert((ts, product_id.to_string()));
                self.by_id.insert(product_id.to_string(), ts);
            }
            None => {
                self.order.insert((ts, product_id.to_string()));
                self.by_id.insert(product_id.to_string(), ts);
            }
        }
    }

    fn pop(&mut self) -> Option<DirtyEntry> {
        let (ts, id) = self.order.pop_first()?;
        self.by_id.remove(&id);
        Some(DirtyEntry::new(id, ts))
    }

    fn remove(&mut self, product_id: &str) {
        if let Some(ts) = self.by_id.remove(product_id) {
            self.order.remove(&(ts, product_id.to_string()));
        }
    }
}

type IndexKey = (Reverse<OrderedFloat<f64>>, Reverse<String>);

fn index_key(product_id: &str, score: f64) -> IndexKey {
    (Reverse(OrderedFloat(score)), Reverse(product_id.to_string()))
}

/// Score-ordered set. Iteration is highest score first, ties by id
/// descending.
#[derive(Default)]
struct SortedIndex {
    scores: HashMap<String, f64>,
    order: BTreeSet<IndexKey>,
}

impl SortedIndex {
    fn upsert(&mut self, product_id: &str, score: f64) {
        if let Some(old) = self.scores.insert(product_id.to_string(), score) {
            self.order.remove(&index_key(product_id, old));
        }
        self.order.insert(index_key(product_id, score));
    }

    fn remove(&mut self, product_id: &str) -> bool {
        match self.scores.remove(product_id) {
            Some(old) => {
                self.order.remove(&index_key(product_id, old));
                true
            }
            None => false,
        }
    }

    fn range(&self, offset: usize, limit: usize) -> Vec<(String, f64)> {
        self.order
            .iter()
            .skip(offset)
            .take(limit)
            .map(|(Reverse(score), Reverse(id))| (id.clone(), score.into_inner()))
            .collect()
    }

    fn rank(&self, product_id: &str) -> Option<usize> {
        let score = *self.scores.get(product_id)?;
        Some(self.order.range(..index_key(product_id, score)).count())
    }

    fn prune_at_or_below(&mut self, max_score: f64) -> usize {
        let doomed: Vec<String> = self
            .scores
            .iter()
            .filter(|(_, score)| **score <= max_score)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &doomed {
            self.remove(id);
        }
        doomed.len()
    }
}

/// In-memory fast tier with TTL emulation.
pub struct InMemoryFastTier {
    counters: DashMap<String, CounterEntry>,
    dirty: Mutex<DirtyQueue>,
    cache: DashMap<String, CachedPayload>,
    indexes: RwLock<HashMap<RankIndex, SortedIndex>>,
    leases: Mutex<HashMap<String, (String, Instant)>>,
    /// Tier-wide so a set recreated after eviction never reuses a generation
    generations: AtomicU64,
    counter_ttl: Duration,
}

impl InMemoryFastTier {
    #[must_use]
    pub fn new(counter_ttl: Duration) -> Self {
        Self {
            counters: DashMap::new(),
            dirty: Mutex::new(DirtyQueue::default()),
            cache: DashMap::new(),
            indexes: RwLock::new(HashMap::new()),
            leases: Mutex::new(HashMap::new()),
            generations: AtomicU64::new(0),
            counter_ttl,
        }
    }

    fn next_generation(&self) -> u64 {
        self.generations.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Drop a product's counters as if their TTL had lapsed. Dirty marking
    /// and cache entries are untouched.
    pub fn evict(&self, product_id: &str) {
        self.counters.remove(product_id);
    }

    /// Number of products holding live counters
    #[must_use]
    pub fn counter_count(&self) -> usize {
        let now = Instant::now();
        self.counters.iter().filter(|e| !e.is_expired(now)).count()
    }
}

impl Default for InMemoryFastTier {
    fn default() -> Self {
        Self::new(Duration::from_secs(24 * 60 * 60))
    }
}

#[async_trait]
impl CounterStore for InMemoryFastTier {
    async fn init_counters(&self, product_id: &str) -> Result<(), StorageError> {
        let now = Instant::now();
        let mut entry = self
            .counters
            .entry(product_id.to_string())
            .or_insert_with(|| CounterEntry::fresh(self.counter_ttl));
        if entry.is_expired(now) {
            *entry = CounterEntry::fresh(self.counter_ttl);
        }
        Ok(())
    }

    async fn increment(&self, product_id: &str, deltas: &CounterDeltas) -> Result<(), StorageError> {
        let now = Instant::now();
        {
            // The shard guard is held until the dirty mark lands, so no
            // reader sees the counters without the mark or half the deltas.
            let mut entry = self
                .counters
                .entry(product_id.to_string())
                .or_insert_with(|| CounterEntry::fresh(self.counter_ttl));
            if entry.is_expired(now) {
                *entry = CounterEntry::fresh(self.counter_ttl);
            }
            entry.counters.apply(deltas);
            entry.generation = self.next_generation();
            if let Some(viewer) = &deltas.unique_viewer {
                entry.viewers.add(viewer.as_str());
            }
            entry.expires_at = now + self.counter_ttl;

            self.dirty.lock().mark(product_id, crate::counters::now_millis());
        }
        self.cache.remove(product_id);
        Ok(())
    }

    async fn read_state(&self, product_id: &str) -> Result<Option<CounterState>, StorageError> {
        let now = Instant::now();
        match self.counters.get(product_id) {
            Some(entry) if !entry.is_expired(now) => return Ok(Some(entry.state())),
            Some(_) => {}
            None => return Ok(None),
        }
        self.counters.remove_if(product_id, |_, e| e.is_expired(now));
        Ok(None)
    }

    async fn seed_counters(&self, product_id: &str, durable: &ProductCounterSet) -> Result<CounterState, StorageError> {
        let now = Instant::now();
        let mut entry = self
            .counters
            .entry(product_id.to_string())
            .or_insert_with(|| CounterEntry::fresh(self.counter_ttl));
        if entry.is_expired(now) {
            *entry = CounterEntry::fresh(self.counter_ttl);
        }
        if !entry.baseline {
            entry.counters = entry.counters.plus(durable);
            entry.baseline = true;
            entry.generation = self.next_generation();
        }
        entry.expires_at = now + self.counter_ttl;
        Ok(entry.state())
    }

    async fn reset(&self, product_id: &str) -> Result<(), StorageError> {
        if let Some(mut entry) = self.counters.get_mut(product_id) {
            entry.counters = ProductCounterSet::default();
            entry.viewers = HyperLogLog::default();
            entry.baseline = true;
            entry.generation = self.next_generation();
            entry.expires_at = Instant::now() + self.counter_ttl;
        }
        self.cache.remove(product_id);
        Ok(())
    }

    async fn remove(&self, product_id: &str) -> Result<(), StorageError> {
        self.counters.remove(product_id);
        self.cache.remove(product_id);
        self.dirty.lock().remove(product_id);
        Ok(())
    }

    async fn refresh_ttl(&self, product_ids: &[String]) -> Result<(), StorageError> {
        let expires_at = Instant::now() + self.counter_ttl;
        for id in product_ids {
            if let Some(mut entry) = self.counters.get_mut(id) {
                entry.expires_at = expires_at;
            }
        }
        Ok(())
    }

    async fn mark_dirty(&self, entries: &[DirtyEntry]) -> Result<(), StorageError> {
        let mut dirty = self.dirty.lock();
        for entry in entries {
            dirty.mark(&entry.product_id, entry.first_dirtied_ms);
        }
        Ok(())
    }

    async fn claim_dirty(&self, max: usize) -> Result<Vec<DirtyEntry>, StorageError> {
        let mut dirty = self.dirty.lock();
        let mut claimed = Vec::with_capacity(max.min(dirty.by_id.len()));
        while claimed.len() < max {
            match dirty.pop() {
                Some(entry) => claimed.push(entry),
                None => break,
            }
        }
        Ok(claimed)
    }

    async fn dirty_len(&self) -> Result<usize, StorageError> {
        Ok(self.dirty.lock().by_id.len())
    }

    async fn is_dirty(&self, product_id: &str) -> Result<bool, StorageError> {
        Ok(self.dirty.lock().by_id.contains_key(product_id))
    }

    async fn unique_viewers(&self, product_id: &str) -> Result<u64, StorageError> {
        let now = Instant::now();
        Ok(self
            .counters
            .get(product_id)
            .filter(|e| !e.is_expired(now))
            .map(|e| e.viewers.approximate_count())
            .unwrap_or(0))
    }
}

#[async_trait]
impl StatsCache for InMemoryFastTier {
    async fn get_cached_stats(&self, product_id: &str) -> Result<Option<String>, StorageError> {
        let now = Instant::now();
        if let Some(entry) = self.cache.get(product_id) {
            if now < entry.expires_at {
                return Ok(Some(entry.payload.clone()));
            }
        }
        self.cache.remove_if(product_id, |_, e| now >= e.expires_at);
        Ok(None)
    }

    async fn put_cached_stats(
        &self,
        product_id: &str,
        payload: &str,
        ttl: Duration,
        generation: u64,
    ) -> Result<bool, StorageError> {
        let now = Instant::now();
        // Holding the counter shard blocks increments until the insert lands;
        // an increment that slips in first has bumped the generation.
        let entry = self.counters.get(product_id);
        let current = entry
            .as_ref()
            .filter(|e| !e.is_expired(now))
            .map(|e| e.generation)
            .unwrap_or(0);
        if current != generation {
            return Ok(false);
        }
        self.cache.insert(
            product_id.to_string(),
            CachedPayload {
                payload: payload.to_string(),
                expires_at: now + ttl,
            },
        );
        drop(entry);
        Ok(true)
    }

    async fn invalidate_cached_stats(&self, product_id: &str) -> Result<(), StorageError> {
        self.cache.remove(product_id);
        Ok(())
    }
}

#[async_trait]
impl RankIndexStore for InMemoryFastTier {
    async fn upsert(&self, index: RankIndex, product_id: &str, score: f64) -> Result<(), StorageError> {
        self.indexes.write().entry(index).or_default().upsert(product_id, score);
        Ok(())
    }

    async fn remove(&self, index: RankIndex, product_id: &str) -> Result<(), StorageError> {
        if let Some(idx) = self.indexes.write().get_mut(&index) {
            idx.remove(product_id);
        }
        Ok(())
    }

    async fn range(&self, index: RankIndex, offset: usize, limit: usize) -> Result<Vec<(String, f64)>, StorageError> {
        Ok(self
            .indexes
            .read()
            .get(&index)
            .map(|idx| idx.range(offset, limit))
            .unwrap_or_default())
    }

    async fn rank(&self, index: RankIndex, product_id: &str) -> Result<Option<usize>, StorageError> {
        Ok(self.indexes.read().get(&index).and_then(|idx| idx.rank(product_id)))
    }

    async fn score(&self, index: RankIndex, product_id: &str) -> Result<Option<f64>, StorageError> {
        Ok(self
            .indexes
            .read()
            .get(&index)
            .and_then(|idx| idx.scores.get(product_id).copied()))
    }

    async fn prune_at_or_below(&self, index: RankIndex, max_score: f64) -> Result<usize, StorageError> {
        Ok(self
            .indexes
            .write()
            .get_mut(&index)
            .map(|idx| idx.prune_at_or_below(max_score))
            .unwrap_or(0))
    }

    async fn len(&self, index: RankIndex) -> Result<usize, StorageError> {
        Ok(self.indexes.read().get(&index).map(|idx| idx.scores.len()).unwrap_or(0))
    }
}

#[async_trait]
impl LeaseLock for InMemoryFastTier {
    async fn acquire(&self, name: &str, ttl: Duration) -> Result<Option<LockToken>, StorageError> {
        let now = Instant::now();
        let mut leases = self.leases.lock();
        if let Some((_, expires_at)) = leases.get(name) {
            if now < *expires_at {
                return Ok(None);
            }
        }
        let token = uuid::Uuid::new_v4().to_string();
        leases.insert(name.to_string(), (token.clone(), now + ttl));
        Ok(Some(LockToken {
            name: name.to_string(),
            token,
        }))
    }

    async fn release(&self, token: &LockToken) -> Result<bool, StorageError> {
        let now = Instant::now();
        let mut leases = self.leases.lock();
        match leases.get(&token.name) {
            Some((held, expires_at)) if *held == token.token && now < *expires_at => {
                leases.remove(&token.name);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

/// In-memory durable tier. Also the place tests register products and
/// boosts, standing in for the catalog collaborators.
#[derive(Default)]
pub struct InMemoryDurableStore {
    stats: RwLock<BTreeMap<String, DurableStatRecord>>,
    boosts: RwLock<Vec<Boost>>,
    products: DashMap<String, ProductRankingInfo>,
}

impl InMemoryDurableStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or replace a product's ranking attributes.
    pub fn put_product(&self, info: ProductRankingInfo) {
        self.products.insert(info.product_id.clone(), info);
    }

    pub fn put_boost(&self, boost: Boost) {
        self.boosts.write().push(boost);
    }

    /// Replace every boost for a product (status changes).
    pub fn replace_boosts(&self, product_id: &str, boosts: Vec<Boost>) {
        let mut all = self.boosts.write();
        all.retain(|b| b.product_id != product_id);
        all.extend(boosts);
    }

    #[must_use]
    pub fn stats_len(&self) -> usize {
        self.stats.read().len()
    }
}

#[async_trait]
impl DurableStore for InMemoryDurableStore {
    async fn upsert_stats_batch(&self, rows: &[DurableStatRecord]) -> Result<BatchWriteResult, StorageError> {
        if rows.is_empty() {
            return Ok(BatchWriteResult::empty());
        }
        let mut stats = self.stats.write();
        for row in rows {
            let created_at = stats
                .get(&row.product_id)
                .map(|existing| existing.created_at)
                .unwrap_or(row.created_at);
            stats.insert(
                row.product_id.clone(),
                DurableStatRecord {
                    created_at,
                    ..row.clone()
                },
            );
        }
        Ok(BatchWriteResult {
            batch_id: uuid::Uuid::new_v4().to_string(),
            written: rows.len(),
            verified: true,
        })
    }

    async fn find_stats_by_product_id(&self, product_id: &str) -> Result<Option<DurableStatRecord>, StorageError> {
        Ok(self.stats.read().get(product_id).cloned())
    }

    async fn find_top_by_metric(&self, metric: Metric, limit: usize) -> Result<Vec<DurableStatRecord>, StorageError> {
        let mut rows: Vec<DurableStatRecord> = self.stats.read().values().cloned().collect();
        rows.sort_by(|a, b| {
            OrderedFloat(b.to_counters().get(metric))
                .cmp(&OrderedFloat(a.to_counters().get(metric)))
                .then_with(|| a.product_id.cmp(&b.product_id))
        });
        rows.truncate(limit);
        Ok(rows)
    }

    async fn create_zeroed_stats_row(&self, product_id: &str) -> Result<bool, StorageError> {
        let mut stats = self.stats.write();
        if stats.contains_key(product_id) {
            return Ok(false);
        }
        stats.insert(product_id.to_string(), DurableStatRecord::zeroed(product_id, Utc::now()));
        Ok(true)
    }

    async fn clear_stats_row(&self, product_id: &str) -> Result<(), StorageError> {
        if let Some(row) = self.stats.write().get_mut(product_id) {
            let created_at = row.created_at;
            *row = DurableStatRecord {
                created_at,
                ..DurableStatRecord::zeroed(product_id, Utc::now())
            };
        }
        Ok(())
    }

    async fn find_active_boost(&self, product_id: &str, now: DateTime<Utc>) -> Result<Option<Boost>, StorageError> {
        Ok(self
            .boosts
            .read()
            .iter()
            .filter(|b| b.product_id == product_id && b.is_active_at(now))
            .max_by(|a, b| OrderedFloat(a.boost_score).cmp(&OrderedFloat(b.boost_score)))
            .cloned())
    }

    async fn count_active_boost(&self, product_id: &str, now: DateTime<Utc>) -> Result<u64, StorageError> {
        Ok(self
            .boosts
            .read()
            .iter()
            .filter(|b| b.product_id == product_id && b.is_active_at(now))
            .count() as u64)
    }

    async fn find_ranking_info(&self, product_id: &str) -> Result<Option<ProductRankingInfo>, StorageError> {
        Ok(self.products.get(product_id).map(|p| p.value().clone()))
    }

    async fn list_product_ids(&self, offset: u64, limit: usize) -> Result<Vec<String>, StorageError> {
        Ok(self
            .stats
            .read()
            .keys()
            .skip(offset as usize)
            .take(limit)
            .cloned()
            .collect())
    }
}
