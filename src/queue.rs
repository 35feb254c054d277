//! Background job queue.
//!
//! The engine schedules flushes and ranking work as named jobs. What it
//! relies on is small: at-least-once execution, a dedup key (a job whose key
//! is already queued or running is dropped) and retry with exponential
//! backoff. [`LocalJobQueue`] provides that on tokio tasks; a distributed
//! queue can stand in by implementing [`JobQueue`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashSet;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::task::JoinSet;
use tracing::{debug, error};

use crate::resilience::retry::{retry, RetryConfig};

pub const SYNC_JOB: &str = "stats.sync";
pub const RANKING_UPDATE_JOB: &str = "rankings.update";
pub const REBUILD_JOB: &str = "rankings.rebuild";
pub const CLEANUP_JOB: &str = "rankings.cleanup";

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("job queue is closed")]
    Closed,
    #[error("no handler for job '{0}'")]
    UnknownJob(String),
    #[error("invalid job payload: {0}")]
    Payload(#[from] serde_json::Error),
    #[error("job failed: {0}")]
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub name: String,
    /// Jobs sharing name and key collapse while one is pending
    pub dedup_key: String,
    pub payload: Value,
}

impl Job {
    pub fn new(name: impl Into<String>, dedup_key: impl Into<String>, payload: Value) -> Self {
        Self {
            name: name.into(),
            dedup_key: dedup_key.into(),
            payload,
        }
    }

    fn queue_key(&self) -> String {
        format!("{}:{}", self.name, self.dedup_key)
    }
}

#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &Job) -> Result<(), QueueError>;
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    /// `Ok(false)` when an identical job is already pending.
    async fn enqueue(&self, job: Job, retry: RetryConfig) -> Result<bool, QueueError>;
}

/// In-process queue: one tokio task per job.
pub struct LocalJobQueue {
    handler: Arc<dyn JobHandler>,
    pending: Arc<DashSet<String>>,
    tasks: Mutex<JoinSet<()>>,
    closed: AtomicBool,
}

impl LocalJobQueue {
    pub fn new(handler: Arc<dyn JobHandler>) -> Self {
        Self {
            handler,
            pending: Arc::new(DashSet::new()),
            tasks: Mutex::new(JoinSet::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Jobs queued or running.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Wait for every job spawned so far.
    pub async fn wait_idle(&self) {
        loop {
            let mut tasks = std::mem::take(&mut *self.tasks.lock());
            if tasks.is_empty() {
                return;
            }
            while let Some(joined) = tasks.join_next().await {
                if let Err(e) = joined {
                    error!(error = %e, "Job task panicked");
                }
            }
        }
    }

    /// Refuse new jobs, then wait for the running ones.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.wait_idle().await;
    }
}

#[async_trait]
impl JobQueue for LocalJobQueue {
    async fn enqueue(&self, job: Job, retry_config: RetryConfig) -> Result<bool, QueueError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(QueueError::Closed);
        }

        let key = job.queue_key();
        if !self.pending.insert(key.clone()) {
            debug!(job = %job.name, dedup_key = %job.dedup_key, "Job already pending, deduplicated");
            crate::metrics::record_job(&job.name, "deduplicated");
            return Ok(false);
        }

        let handler = Arc::clone(&self.handler);
        let pending = Arc::clone(&self.pending);

        self.tasks.lock().spawn(async move {
            let result = retry(&job.name, &retry_config, || handler.handle(&job)).await;
            pending.remove(&key);

            match result {
                Ok(()) => crate::metrics::record_job(&job.name, "success"),
                Err(e) => {
                    crate::metrics::record_job(&job.name, "failed");
                    error!(job = %job.name, dedup_key = %job.dedup_key, error = %e, "Job failed after retries");
                }
            }
        });

        Ok(true)
    }
}
