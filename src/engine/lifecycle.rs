//! Engine lifecycle: run loop and shutdown.

use std::time::Duration;

use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::flush::FlushReason;
use crate::queue::{QueueError, CLEANUP_JOB, REBUILD_JOB};

use super::{EngineState, StatsEngine};

/// First tick one period from now; late ticks are pushed back, not bunched.
fn ticker(period: Duration) -> Interval {
    let period = period.max(Duration::from_millis(1));
    let mut interval = interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

struct Tickers {
    sync: Interval,
    rebuild: Interval,
    cleanup: Interval,
}

impl Tickers {
    fn from_engine(engine: &StatsEngine) -> Self {
        let config = engine.config.read();
        Self {
            sync: ticker(config.sync_interval()),
            rebuild: ticker(config.rebuild_interval()),
            cleanup: ticker(config.cleanup_interval()),
        }
    }
}

impl StatsEngine {
    /// Drive the background schedule until [`shutdown()`](Self::shutdown).
    ///
    /// Every tick only enqueues a job; the work runs on the job queue, which
    /// collapses a tick whose previous job is still pending.
    pub async fn run(&self) {
        let mut state_rx = self.state.subscribe();
        let started = self.state.send_if_modified(|state| {
            if *state == EngineState::Ready {
                *state = EngineState::Running;
                true
            } else {
                false
            }
        });
        if !started {
            warn!(state = %self.state(), "run() called on an engine that is not Ready");
            return;
        }
        crate::metrics::set_engine_state(EngineState::Running.as_str());
        info!("Stats engine running");

        let flush_signal = self.gateway.flush_signal();
        let mut config_rx = self.config_rx.lock().await;
        let mut tickers = Tickers::from_engine(self);

        loop {
            tokio::select! {
                Ok(()) = config_rx.changed() => {
                    let new_config = config_rx.borrow_and_update().clone();
                    info!(
                        sync_interval_ms = new_config.sync_interval_ms,
                        sync_batch_max = new_config.sync_batch_max,
                        dirty_high_water = new_config.dirty_high_water,
                        "Config updated"
                    );
                    self.apply_config(new_config);
                    tickers = Tickers::from_engine(self);
                }

                _ = tickers.sync.tick() => {
                    self.enqueue_flush(FlushReason::Interval).await;
                }

                _ = flush_signal.notified() => {
                    self.enqueue_flush(FlushReason::HighWater).await;
                }

                _ = tickers.rebuild.tick() => {
                    self.enqueue_maintenance(REBUILD_JOB).await;
                }

                _ = tickers.cleanup.tick() => {
                    self.enqueue_maintenance(CLEANUP_JOB).await;
                }

                Ok(()) = state_rx.changed() => {
                    let state = *state_rx.borrow_and_update();
                    if state != EngineState::Running {
                        debug!(%state, "Run loop exiting");
                        break;
                    }
                }
            }
        }
    }

    async fn enqueue_flush(&self, reason: FlushReason) {
        match self.schedule_flush(reason).await {
            Ok(true) => debug!(%reason, "Flush queued"),
            Ok(false) => debug!(%reason, "Flush already pending"),
            Err(QueueError::Closed) => debug!(%reason, "Queue closed, flush not queued"),
            Err(e) => warn!(%reason, error = %e, "Could not queue flush"),
        }
    }

    async fn enqueue_maintenance(&self, job: &'static str) {
        match self.schedule_maintenance(job).await {
            Ok(queued) => debug!(job, queued, "Maintenance tick"),
            Err(QueueError::Closed) => debug!(job, "Queue closed, maintenance not queued"),
            Err(e) => warn!(job, error = %e, "Could not queue maintenance job"),
        }
    }

    /// Initiate graceful shutdown.
    ///
    /// Stops the run loop, lets running jobs finish, then flushes the dirty
    /// set until it is empty or a flush fails. Whatever is still dirty after
    /// a failure stays in the fast tier for the next process.
    #[tracing::instrument(skip(self))]
    pub async fn shutdown(&self) {
        if matches!(self.state(), EngineState::ShuttingDown | EngineState::Stopped) {
            return;
        }

        let shutdown_start = std::time::Instant::now();
        info!("Initiating stats engine shutdown...");
        self.set_state(EngineState::ShuttingDown);

        self.queue.close().await;

        match self.sync.drain().await {
            Ok(outcome) => {
                self.jobs.rank_flushed(&outcome).await;
                info!(
                    written = outcome.written,
                    skipped_evicted = outcome.skipped_evicted,
                    "Dirty set drained"
                );
            }
            Err(e) => error!(error = %e, "Shutdown drain failed, remaining products stay dirty"),
        }

        self.set_state(EngineState::Stopped);
        info!(
            elapsed_ms = shutdown_start.elapsed().as_millis() as u64,
            "Stats engine shutdown complete"
        );
    }
}
