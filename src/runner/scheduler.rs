//! The two periodic triggers: build polling and reconciliation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::Runner;
use crate::github::SourceControl;
use crate::sync::{Reconciler, SyncRun};

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub poll_interval: Duration,
    pub sync_interval: Duration,
    /// Run a reconciliation pass immediately on start.
    pub sync_on_start: bool,
}

/// Owns the poll and sync timers.
///
/// Builds are spawned onto their own tasks, so [`Scheduler::stop`] only
/// cancels the timers; in-flight builds run to completion.
pub struct Scheduler<S> {
    runner: Arc<Runner>,
    reconciler: Arc<Reconciler<S>>,
    config: SchedulerConfig,
    shutdown: CancellationToken,
    started: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<S: SourceControl> Scheduler<S> {
    pub fn new(runner: Arc<Runner>, reconciler: Arc<Reconciler<S>>, config: SchedulerConfig) -> Self {
        Scheduler {
            runner,
            reconciler,
            config,
            shutdown: CancellationToken::new(),
            started: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Recovers from a previous run, then starts both timers.
    ///
    /// Only the first call does anything, even when calls overlap; a stopped
    /// scheduler stays stopped.
    pub async fn start(&self) {
        if self.shutdown.is_cancelled() || self.started.swap(true, Ordering::AcqRel) {
            warn!("Scheduler already started");
            return;
        }

        let recovery = self.runner.recover().await;
        info!(
            failed_builds = recovery.failed_builds.len(),
            removed_worktrees = recovery.removed_worktrees,
            "Recovered from previous run"
        );
        if self.shutdown.is_cancelled() {
            return;
        }

        let poll = tokio::spawn(poll_loop(
            self.runner.clone(),
            self.config.poll_interval,
            self.shutdown.clone(),
        ));
        let sync = tokio::spawn(sync_loop(
            self.reconciler.clone(),
            self.config.clone(),
            self.shutdown.clone(),
        ));
        self.lock_tasks().extend([poll, sync]);

        info!(
            poll_ms = self.config.poll_interval.as_millis() as u64,
            sync_ms = self.config.sync_interval.as_millis() as u64,
            sync_on_start = self.config.sync_on_start,
            "Scheduler started"
        );
    }

    /// Cancels the timers and waits for their loops to exit.
    pub async fn stop(&self) {
        self.shutdown.cancel();
        let tasks = std::mem::take(&mut *self.lock_tasks());
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Scheduler task ended abnormally");
            }
        }
        info!("Scheduler stopped");
    }

    fn lock_tasks(&self) -> std::sync::MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Claims at most one build per tick and runs it on its own task.
async fn poll_loop(runner: Arc<Runner>, period: Duration, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                if let Some((build, repo)) = runner.claim_next().await {
                    let runner = runner.clone();
                    tokio::spawn(async move {
                        runner.run_build(build, repo).await;
                    });
                }
            }
        }
    }
    debug!("Poll loop exited");
}

async fn sync_loop<S: SourceControl>(
    reconciler: Arc<Reconciler<S>>,
    config: SchedulerConfig,
    shutdown: CancellationToken,
) {
    let first = if config.sync_on_start {
        Instant::now()
    } else {
        Instant::now() + config.sync_interval
    };
    let mut ticker = tokio::time::interval_at(first, config.sync_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    run = reconciler.sync_all(false) => {
                        if let SyncRun::Completed { repositories, enqueued } = run {
                            debug!(repositories, enqueued, "Scheduled sync finished");
                        }
                    }
                }
            }
        }
    }
    debug!("Sync loop exited");
}
