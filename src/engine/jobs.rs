//! Background job routing.
//!
//! The run loop only enqueues; [`EngineJobs`] is what the queue calls back
//! into. A sync job follows its flush with ranking updates for exactly the
//! products it wrote, inline, so a sync never fans out into more jobs.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::flush::{FlushOutcome, FlushReason, SyncEngine};
use crate::queue::{Job, JobHandler, QueueError, CLEANUP_JOB, RANKING_UPDATE_JOB, REBUILD_JOB, SYNC_JOB};
use crate::ranking::RankingEngine;

/// Payload of a [`SYNC_JOB`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncJobPayload {
    pub reason: FlushReason,
    /// Empty means "next batch from the dirty set"
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub product_ids: Vec<String>,
}

/// Payload of a [`RANKING_UPDATE_JOB`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankingJobPayload {
    pub product_ids: Vec<String>,
}

pub(crate) struct EngineJobs {
    sync: Arc<SyncEngine>,
    ranking: Arc<RankingEngine>,
}

impl EngineJobs {
    pub(crate) fn new(sync: Arc<SyncEngine>, ranking: Arc<RankingEngine>) -> Self {
        Self { sync, ranking }
    }

    async fn run_sync(&self, payload: SyncJobPayload) -> Result<(), QueueError> {
        let outcome = if payload.product_ids.is_empty() {
            self.sync.flush_cycle(payload.reason).await
        } else {
            self.sync.sync_products(&payload.product_ids).await
        }
        .map_err(|e| QueueError::Failed(e.to_string()))?;

        self.rank_flushed(&outcome).await;
        Ok(())
    }

    pub(crate) async fn rank_flushed(&self, outcome: &FlushOutcome) {
        if outcome.flushed.is_empty() {
            return;
        }
        let result = self.ranking.batch_update_rankings(&outcome.flushed).await;
        debug!(
            reason = %outcome.reason,
            total = result.total,
            failed = result.failed,
            "Rankings refreshed after flush"
        );
    }
}

#[async_trait]
impl JobHandler for EngineJobs {
    #[tracing::instrument(skip(self, job), fields(job = %job.name, dedup_key = %job.dedup_key))]
    async fn handle(&self, job: &Job) -> Result<(), QueueError> {
        match job.name.as_str() {
            SYNC_JOB => {
                let payload: SyncJobPayload = serde_json::from_value(job.payload.clone())?;
                self.run_sync(payload).await
            }
            RANKING_UPDATE_JOB => {
                let payload: RankingJobPayload = serde_json::from_value(job.payload.clone())?;
                // Per-product failures are logged inside; the next rebuild repairs them
                self.ranking.batch_update_rankings(&payload.product_ids).await;
                Ok(())
            }
            REBUILD_JOB => {
                if let Some(result) = self
                    .ranking
                    .rebuild_all()
                    .await
                    .map_err(|e| QueueError::Failed(e.to_string()))?
                {
                    debug!(total = result.total, failed = result.failed, "Rebuild job finished");
                }
                Ok(())
            }
            CLEANUP_JOB => {
                if let Some(report) = self
                    .ranking
                    .cleanup()
                    .await
                    .map_err(|e| QueueError::Failed(e.to_string()))?
                {
                    info!(
                        new_arrivals = report.new_arrivals_pruned,
                        trending = report.trending_pruned,
                        discounted = report.discounted_removed,
                        "Cleanup job finished"
                    );
                }
                Ok(())
            }
            other => Err(QueueError::UnknownJob(other.to_string())),
        }
    }
}
