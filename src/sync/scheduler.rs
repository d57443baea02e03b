use anyhow::Result;
use log::{error, info};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Duration, Instant, MissedTickBehavior};

use super::groups::GroupSyncEngine;
use super::tasks::TaskSyncEngine;
use super::{DrainOutcome, SyncContext};
use crate::constants::{LOG_DRAIN_SKIPPED_BUSY, LOG_DRAIN_SKIPPED_OFFLINE};
use crate::events::SyncEvent;

/// Runs drain cycles, one at a time.
///
/// A cycle replays the group queue before the task queue so that tasks
/// created under a new group find it promoted. The background listener from
/// [`ReconciliationScheduler::spawn`] starts a cycle on every offline→online
/// transition and on the configured poll interval.
#[derive(Clone)]
pub struct ReconciliationScheduler {
    ctx: Arc<SyncContext>,
    groups: GroupSyncEngine,
    tasks: TaskSyncEngine,
    draining: Arc<AtomicBool>,
}

/// Clears the draining flag on drop, including on error paths.
struct DrainGuard(Arc<AtomicBool>);

impl Drop for DrainGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl ReconciliationScheduler {
    pub(crate) fn new(ctx: Arc<SyncContext>, groups: GroupSyncEngine, tasks: TaskSyncEngine) -> Self {
        Self {
            ctx,
            groups,
            tasks,
            draining: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }

    /// Replay both queues.
    ///
    /// Returns [`DrainOutcome::Offline`] without touching anything while the
    /// remote store is unreachable, and [`DrainOutcome::AlreadyRunning`] when
    /// another cycle holds the flag.
    pub async fn drain(&self) -> Result<DrainOutcome> {
        if !self.ctx.is_online() {
            info!("{LOG_DRAIN_SKIPPED_OFFLINE}");
            return Ok(DrainOutcome::Offline);
        }
        if self
            .draining
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            info!("{LOG_DRAIN_SKIPPED_BUSY}");
            return Ok(DrainOutcome::AlreadyRunning);
        }
        let _guard = DrainGuard(Arc::clone(&self.draining));

        info!("🔄 Starting drain cycle");
        let groups = self.groups.drain().await?;
        let tasks = self.tasks.drain().await?;
        Ok(DrainOutcome::Completed { groups, tasks })
    }

    /// Spawn the background listener.
    ///
    /// Runs until the returned handle is aborted. Reconnects that happen
    /// after this call returns are never missed.
    pub fn spawn(&self) -> JoinHandle<()> {
        let scheduler = self.clone();
        let mut state = self.ctx.connectivity.subscribe();
        let mut seen = state.borrow_and_update().reconnects;
        let poll_secs = self.ctx.settings.poll_interval_secs;

        tokio::spawn(async move {
            let mut ticker = (poll_secs > 0).then(|| {
                let period = Duration::from_secs(poll_secs);
                let mut ticker = interval_at(Instant::now() + period, period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                ticker
            });

            loop {
                tokio::select! {
                    changed = state.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let current = *state.borrow_and_update();
                        scheduler
                            .ctx
                            .events
                            .emit(SyncEvent::ConnectivityChanged { online: current.online });
                        if current.online && current.reconnects > seen {
                            seen = current.reconnects;
                            scheduler.run_cycle("reconnect").await;
                        }
                    }
                    _ = async {
                        match ticker.as_mut() {
                            Some(ticker) => {
                                ticker.tick().await;
                            }
                            None => std::future::pending::<()>().await,
                        }
                    } => {
                        if scheduler.ctx.is_online() {
                            scheduler.run_cycle("poll").await;
                        }
                    }
                }
            }
        })
    }

    async fn run_cycle(&self, trigger: &str) {
        match self.drain().await {
            Ok(DrainOutcome::Completed { groups, tasks }) => {
                info!(
                    "✅ Drain after {trigger}: {} group and {} task operations remaining",
                    groups.remaining, tasks.remaining
                );
            }
            Ok(_) => {}
            Err(e) => error!("❌ Drain after {trigger} failed: {e:#}"),
        }
    }
}
