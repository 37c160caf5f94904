//! Periodic refresh cycle, run by at most one instance per time window

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::lock::{lock_key, LockBackend};
use crate::tokens::{CycleReport, RefreshExecutor};

pub const REFRESH_LOCK_NAMESPACE: &str = "refresh-cycle";

/// `refresh-cycle:{floor(now_ms / interval_ms)}`. Every instance computes
/// the same key within a window and a fresh one in the next.
pub fn refresh_window_key(now: DateTime<Utc>, interval: Duration) -> String {
    let interval_ms = (interval.as_millis() as i64).max(1);
    lock_key(
        REFRESH_LOCK_NAMESPACE,
        now.timestamp_millis().div_euclid(interval_ms),
    )
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    Completed(CycleReport),
    /// The cycle ran but did not finish cleanly
    Failed,
    /// Another instance holds this window, or the lock backend was unreachable
    Skipped,
}

pub struct RefreshScheduler {
    executor: Arc<RefreshExecutor>,
    instance_id: String,
    interval: Duration,
    lock: Arc<dyn LockBackend>,
    max_extensions: u32,
    ttl: Duration,
}

impl RefreshScheduler {
    pub fn new(
        config: &Config,
        lock: Arc<dyn LockBackend>,
        executor: Arc<RefreshExecutor>,
    ) -> Self {
        Self {
            executor,
            instance_id: config.instance.id.clone(),
            interval: config.refresh.check_interval.max(Duration::from_millis(1)),
            lock,
            max_extensions: config.lock.max_extensions,
            ttl: config.lock.ttl,
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Arm the timer. The first tick fires one interval after start.
    pub fn start(self: Arc<Self>) -> SchedulerHandle {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let lock = Arc::clone(&self.lock);

        info!(
            instance_id = %self.instance_id,
            interval_ms = self.interval.as_millis() as u64,
            ttl_ms = self.ttl.as_millis() as u64,
            "Starting refresh scheduler"
        );

        let handle = tokio::spawn(async move {
            let mut timer = tokio::time::interval_at(Instant::now() + self.interval, self.interval);
            timer.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = timer.tick() => {
                        // Not raced against cancellation: a started cycle runs to the end
                        self.run_tick().await;
                    }
                }
            }
            debug!(instance_id = %self.instance_id, "Refresh scheduler stopped");
        });

        SchedulerHandle {
            cancel,
            handle,
            lock,
        }
    }

    pub async fn run_tick(&self) -> TickOutcome {
        self.run_tick_at(Utc::now()).await
    }

    /// One tick for the window containing `now`: take the window lock, run
    /// the cycle, release the lock whatever happened.
    pub async fn run_tick_at(&self, now: DateTime<Utc>) -> TickOutcome {
        let key = refresh_window_key(now, self.interval);

        match self.lock.acquire(&key, self.ttl, &self.instance_id).await {
            Ok(true) => debug!(key = %key, "Acquired refresh lock"),
            Ok(false) => {
                debug!(key = %key, "Refresh cycle held by another instance, skipping");
                return TickOutcome::Skipped;
            }
            Err(e) => {
                warn!(key = %key, error = %e, "Lock backend unavailable, skipping refresh cycle");
                return TickOutcome::Skipped;
            }
        }

        let outcome = self.run_cycle_holding(&key).await;

        match self.lock.release(&key, &self.instance_id).await {
            Ok(true) => debug!(key = %key, "Released refresh lock"),
            Ok(false) => debug!(key = %key, "Refresh lock already expired"),
            Err(e) => warn!(key = %key, error = %e, "Failed to release refresh lock"),
        }

        outcome
    }

    /// Run the cycle as its own task so a panic still returns here, extending
    /// the lock every `ttl / 2` while it runs.
    async fn run_cycle_holding(&self, key: &str) -> TickOutcome {
        let executor = Arc::clone(&self.executor);
        let mut cycle = tokio::spawn(async move { executor.run_cycle().await });

        let period = (self.ttl / 2).max(Duration::from_millis(1));
        let mut keepalive = tokio::time::interval_at(Instant::now() + period, period);
        let mut extensions = 0u32;
        let mut extending = self.max_extensions > 0;

        let joined = loop {
            tokio::select! {
                joined = &mut cycle => break joined,
                _ = keepalive.tick(), if extending => {
                    match self.lock.extend(key, self.ttl, &self.instance_id).await {
                        Ok(true) => {
                            extensions += 1;
                            debug!(key = %key, extensions, "Extended refresh lock");
                        }
                        Ok(false) => {
                            warn!(key = %key, "Refresh lock lost while the cycle is running");
                            extending = false;
                        }
                        Err(e) => {
                            warn!(key = %key, error = %e, "Failed to extend refresh lock");
                            extending = false;
                        }
                    }
                    if extensions >= self.max_extensions {
                        extending = false;
                    }
                }
            }
        };

        match joined {
            Ok(Ok(report)) => TickOutcome::Completed(report),
            Ok(Err(e)) => {
                error!(error = %e, "Refresh cycle failed");
                TickOutcome::Failed
            }
            Err(e) => {
                error!(error = %e, "Refresh cycle task panicked");
                TickOutcome::Failed
            }
        }
    }
}

/// Owns the running scheduler task.
pub struct SchedulerHandle {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
    lock: Arc<dyn LockBackend>,
}

impl SchedulerHandle {
    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }

    /// Cancel the timer and wait for an in-flight cycle to finish. Held
    /// locks are left to expire.
    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.handle.await {
            error!(error = %e, "Refresh scheduler task ended abnormally");
        }
        if let Err(e) = self.lock.close().await {
            warn!(error = %e, "Failed to close lock backend");
        }
        info!("Refresh scheduler stopped");
    }
}
