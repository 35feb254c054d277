//! Sync engine: moves fast-tier counter totals into the durable store.
//!
//! A flush cycle claims up to `batch_max` dirty products (claim pops them, so
//! one product is never flushed by two cycles at once), reads their absolute
//! totals in one batched call and overwrites the durable rows in one batched
//! upsert. Because the upsert writes totals rather than deltas, repeating a
//! cycle leaves the durable store unchanged.
//!
//! A claimed set without a baseline was recreated by increments after an
//! eviction and holds only the deltas since then. Before it is written the
//! durable row is folded into it ([`CounterStore::seed_counters`]), so the
//! upsert never replaces larger durable totals with the post-eviction counts.
//!
//! A cycle is all-or-nothing: if a read or the durable write fails, every
//! claimed entry goes back into the dirty set with its original
//! first-dirtied timestamp.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::catalog::DurableStatRecord;
use crate::counters::{CounterState, DirtyEntry};
use crate::resilience::circuit_breaker::{CircuitError, TierCircuits};
use crate::storage::traits::{CounterStore, DurableStore, StorageError};

/// Why a flush cycle ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlushReason {
    Interval,
    HighWater,
    OnDemand,
    Shutdown,
}

impl FlushReason {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Interval => "interval",
            Self::HighWater => "high_water",
            Self::OnDemand => "on_demand",
            Self::Shutdown => "shutdown",
        }
    }
}

impl std::fmt::Display for FlushReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What one or more flush cycles did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlushOutcome {
    pub reason: FlushReason,
    /// Products popped from the dirty set
    pub claimed: usize,
    /// Rows written to the durable store
    pub written: usize,
    /// Claimed products whose counters were gone (not written)
    pub skipped_evicted: usize,
    /// Ids written in this cycle, for follow-up ranking updates
    pub flushed: Vec<String>,
}

impl FlushOutcome {
    fn empty(reason: FlushReason) -> Self {
        Self {
            reason,
            claimed: 0,
            written: 0,
            skipped_evicted: 0,
            flushed: Vec::new(),
        }
    }

    fn absorb(&mut self, other: FlushOutcome) {
        self.claimed += other.claimed;
        self.written += other.written;
        self.skipped_evicted += other.skipped_evicted;
        self.flushed.extend(other.flushed);
    }
}

#[derive(Error, Debug)]
pub enum FlushError {
    #[error("fast tier unavailable during flush: {0}")]
    FastTier(#[source] StorageError),
    #[error("durable write failed, {redirtied} products re-dirtied: {source}")]
    DurableWrite {
        redirtied: usize,
        #[source]
        source: StorageError,
    },
    #[error("durable read failed, {redirtied} products re-dirtied: {source}")]
    DurableRead {
        redirtied: usize,
        #[source]
        source: StorageError,
    },
    #[error("durable circuit open, {redirtied} products re-dirtied")]
    CircuitOpen { redirtied: usize },
}

enum BaselineError {
    CircuitOpen,
    Durable(StorageError),
    FastTier(StorageError),
}

impl BaselineError {
    fn redirtied(self, redirtied: usize) -> FlushError {
        match self {
            Self::CircuitOpen => FlushError::CircuitOpen { redirtied },
            Self::Durable(source) => FlushError::DurableRead { redirtied, source },
            Self::FastTier(source) => FlushError::FastTier(source),
        }
    }
}

pub struct SyncEngine {
    counters: Arc<dyn CounterStore>,
    durable: Arc<dyn DurableStore>,
    circuits: Arc<TierCircuits>,
    batch_max: AtomicUsize,
}

impl SyncEngine {
    pub fn new(
        counters: Arc<dyn CounterStore>,
        durable: Arc<dyn DurableStore>,
        circuits: Arc<TierCircuits>,
        batch_max: usize,
    ) -> Self {
        Self {
            counters,
            durable,
            circuits,
            batch_max: AtomicUsize::new(batch_max.max(1)),
        }
    }

    pub fn set_batch_max(&self, batch_max: usize) {
        self.batch_max.store(batch_max.max(1), Ordering::Relaxed);
    }

    #[must_use]
    pub fn batch_max(&self) -> usize {
        self.batch_max.load(Ordering::Relaxed)
    }

    /// Run one claim, read, upsert cycle.
    #[tracing::instrument(skip(self), fields(reason = %reason))]
    pub async fn flush_cycle(&self, reason: FlushReason) -> Result<FlushOutcome, FlushError> {
        let start = Instant::now();
        let result = self.run_cycle(reason).await;
        crate::metrics::record_flush_duration(start.elapsed());

        match &result {
            Ok(outcome) => {
                crate::metrics::record_flush(reason.as_str(), "success");
                crate::metrics::record_flush_batch(outcome.claimed, outcome.written, outcome.skipped_evicted);
                if outcome.claimed > 0 {
                    info!(
                        claimed = outcome.claimed,
                        written = outcome.written,
                        skipped_evicted = outcome.skipped_evicted,
                        "Flush cycle complete"
                    );
                }
            }
            Err(e) => {
                crate::metrics::record_flush(reason.as_str(), "error");
                warn!(error = %e, "Flush cycle failed, next cycle will retry");
            }
        }

        if let Ok(len) = self.counters.dirty_len().await {
            crate::metrics::set_dirty_products(len);
        }

        result
    }

    async fn run_cycle(&self, reason: FlushReason) -> Result<FlushOutcome, FlushError> {
        let claimed = self
            .counters
            .claim_dirty(self.batch_max())
            .await
            .map_err(FlushError::FastTier)?;

        let mut outcome = FlushOutcome::empty(reason);
        if claimed.is_empty() {
            return Ok(outcome);
        }
        outcome.claimed = claimed.len();

        let ids: Vec<String> = claimed.iter().map(|e| e.product_id.clone()).collect();
        let states = match self.counters.read_state_batch(&ids).await {
            Ok(states) => states,
            Err(e) => {
                self.redirty(&claimed).await;
                return Err(FlushError::FastTier(e));
            }
        };

        let now = chrono::Utc::now();
        let mut rows = Vec::with_capacity(claimed.len());
        for (id, state) in ids.iter().zip(states) {
            let counters = match state {
                Some(state) if state.baseline => state.counters,
                Some(_) => match self.rebaseline(id).await {
                    Ok(state) => state.counters,
                    Err(e) => {
                        self.redirty(&claimed).await;
                        return Err(e.redirtied(claimed.len()));
                    }
                },
                None => {
                    debug!(product_id = %id, "Dirty product has no counters, skipping");
                    outcome.skipped_evicted += 1;
                    continue;
                }
            };
            rows.push(DurableStatRecord::from_counters(id.as_str(), &counters, now));
        }

        if rows.is_empty() {
            return Ok(outcome);
        }

        let write = {
            let _timer = crate::time_operation!("durable", "upsert_stats_batch");
            self.circuits
                .durable
                .call(|| self.durable.upsert_stats_batch(&rows))
                .await
        };

        match write {
            Ok(result) => {
                if !result.verified {
                    warn!(batch_id = %result.batch_id, "Flush batch written but not fully verified");
                }
                outcome.written = result.written;
            }
            Err(CircuitError::Rejected) => {
                self.redirty(&claimed).await;
                return Err(FlushError::CircuitOpen { redirtied: claimed.len() });
            }
            Err(CircuitError::Inner(source)) => {
                crate::metrics::record_error("durable", "upsert_stats_batch");
                self.redirty(&claimed).await;
                return Err(FlushError::DurableWrite {
                    redirtied: claimed.len(),
                    source,
                });
            }
        }

        outcome.flushed = rows.into_iter().map(|r| r.product_id).collect();
        if let Err(e) = self.counters.refresh_ttl(&outcome.flushed).await {
            warn!(error = %e, count = outcome.flushed.len(), "Failed to refresh counter TTLs after flush");
        }

        Ok(outcome)
    }

    /// Fold the durable row into counters recreated after an eviction.
    async fn rebaseline(&self, product_id: &str) -> Result<CounterState, BaselineError> {
        let record = {
            let _timer = crate::time_operation!("durable", "find_stats_by_product_id");
            self.circuits
                .durable
                .call(|| self.durable.find_stats_by_product_id(product_id))
                .await
        };
        let durable = match record {
            Ok(record) => record.map(|r| r.to_counters()).unwrap_or_default(),
            Err(CircuitError::Rejected) => return Err(BaselineError::CircuitOpen),
            Err(CircuitError::Inner(e)) => {
                crate::metrics::record_error("durable", "find_stats_by_product_id");
                return Err(BaselineError::Durable(e));
            }
        };
        debug!(product_id, "Folding durable totals into recreated counters");
        self.counters
            .seed_counters(product_id, &durable)
            .await
            .map_err(BaselineError::FastTier)
    }

    async fn redirty(&self, claimed: &[DirtyEntry]) {
        match self.counters.mark_dirty(claimed).await {
            Ok(()) => crate::metrics::record_redirtied(claimed.len()),
            Err(e) => error!(
                error = %e,
                count = claimed.len(),
                "Failed to re-dirty claimed products, their increments wait for the next touch"
            ),
        }
    }

    /// Mark `product_ids` dirty and flush until none of them is dirty.
    #[tracing::instrument(skip(self, product_ids), fields(count = product_ids.len()))]
    pub async fn sync_products(&self, product_ids: &[String]) -> Result<FlushOutcome, FlushError> {
        let mut total = FlushOutcome::empty(FlushReason::OnDemand);
        if product_ids.is_empty() {
            return Ok(total);
        }

        let entries: Vec<DirtyEntry> = product_ids.iter().map(DirtyEntry::now).collect();
        self.counters.mark_dirty(&entries).await.map_err(FlushError::FastTier)?;

        loop {
            let outcome = self.flush_cycle(FlushReason::OnDemand).await?;
            let claimed = outcome.claimed;
            total.absorb(outcome);

            if claimed == 0 || !self.any_dirty(product_ids).await? {
                return Ok(total);
            }
        }
    }

    async fn any_dirty(&self, product_ids: &[String]) -> Result<bool, FlushError> {
        for id in product_ids {
            if self.counters.is_dirty(id).await.map_err(FlushError::FastTier)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Flush until the dirty set is empty. Stops at the first failed cycle.
    pub async fn drain(&self) -> Result<FlushOutcome, FlushError> {
        let mut total = FlushOutcome::empty(FlushReason::Shutdown);
        loop {
            let outcome = self.flush_cycle(FlushReason::Shutdown).await?;
            if outcome.claimed == 0 {
                return Ok(total);
            }
            total.absorb(outcome);
        }
    }
}
