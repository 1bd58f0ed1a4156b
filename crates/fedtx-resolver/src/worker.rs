//! Per-database resolver worker

use crate::launcher::LaunchSignal;
use crate::queue::{ResolutionQueue, Waiter};
use crate::slots::{SlotTable, WorkerId};
use fedtx_common::{DatabaseId, Latch, ResolverConfig, Shutdown};
use fedtx_xact::{XactRegistry, XactStatus};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Longest nap between cycles when nothing is scheduled.
const NAPTIME_PER_CYCLE: Duration = Duration::from_secs(180);

pub(crate) struct ResolverWorker {
    pub slot: usize,
    pub id: WorkerId,
    pub dbid: DatabaseId,
    pub registry: Arc<XactRegistry>,
    pub queue: Arc<ResolutionQueue>,
    pub slots: Arc<SlotTable>,
    pub config: ResolverConfig,
    pub launch_signal: Arc<LaunchSignal>,
    pub shutdown: Shutdown,
}

impl ResolverWorker {
    pub async fn run(self) {
        let latch = Arc::new(Latch::new());
        self.slots.attach(self.slot, latch.clone());
        tracing::info!("{} started for database {}", self.id, self.dbid);

        let mut last_resolution = Instant::now();

        loop {
            latch.reset();
            if self.shutdown.is_triggered() || self.slots.stop_requested(self.slot) {
                break;
            }

            let now = Instant::now();

            // Process waiters until the queue is empty or only holds
            // waiters with a future retry deadline.
            while let Some(waiter) = self.queue.take_due_waiter(self.dbid, now) {
                if self.shutdown.is_triggered() {
                    break;
                }
                if self.resolve_for_waiter(&waiter).await {
                    waiter.handle.complete();
                    last_resolution = Instant::now();
                    self.slots.touch(self.slot);
                } else {
                    self.queue
                        .requeue(self.dbid, waiter, self.config.retry_interval());
                }
            }

            // In-doubt sweep: entries whose owner is gone for good.
            let orphans = self.registry.claim_indoubt(self.dbid);
            for idx in orphans {
                match self.registry.resolve_entry(idx).await {
                    Ok(true) => {
                        last_resolution = Instant::now();
                        self.slots.touch(self.slot);
                    }
                    Ok(false) => self.registry.clear_processing(idx),
                    Err(err) => {
                        tracing::warn!("{} could not resolve in-doubt entry: {err}", self.id);
                        self.registry.clear_processing(idx);
                    }
                }
            }

            if self.idle_timeout_expired(last_resolution) {
                return;
            }

            let sleep_time = self.sleep_time(last_resolution);
            tokio::select! {
                _ = latch.wait() => {}
                _ = self.shutdown.wait() => {}
                _ = tokio::time::sleep(sleep_time) => {}
            }
        }

        self.detach();
    }

    /// Claim and resolve every entry of the waiter's transaction.
    /// Returns true when all of them resolved (or none matched), false
    /// when anything has to be retried.
    async fn resolve_for_waiter(&self, waiter: &Waiter) -> bool {
        let held = self.registry.claim_for_processing(self.dbid, waiter.xid);
        let mut all_resolved = true;

        for idx in held {
            // Record the decision for entries that do not carry one yet;
            // a recorded decision for this transaction always agrees.
            if matches!(
                self.registry.status(idx),
                XactStatus::Prepared | XactStatus::Preparing
            ) {
                self.registry.set_status(
                    idx,
                    if waiter.commit {
                        XactStatus::Committing
                    } else {
                        XactStatus::Aborting
                    },
                );
            }

            match self.registry.resolve_entry(idx).await {
                Ok(true) => {}
                Ok(false) => {
                    self.registry.clear_processing(idx);
                    all_resolved = false;
                }
                Err(err) => {
                    tracing::warn!(
                        "{} could not resolve entry for transaction {}: {err}",
                        self.id,
                        waiter.xid
                    );
                    self.registry.clear_processing(idx);
                    all_resolved = false;
                }
            }
        }
        all_resolved
    }

    /// Exit if nothing was resolved within the idle timeout and no
    /// waiter is queued. The emptiness check and the slot detach happen
    /// under the queue lock, so a waiter cannot slip in between them and
    /// strand itself behind a dead slot.
    fn idle_timeout_expired(&self, last_resolution: Instant) -> bool {
        let Some(timeout) = self.config.resolver_timeout() else {
            return false;
        };
        if last_resolution.elapsed() < timeout {
            return false;
        }

        self.queue.with_empty_check(self.dbid, |empty| {
            if empty {
                tracing::info!(
                    "{} for database {} stopping after idle timeout",
                    self.id,
                    self.dbid
                );
                self.slots.detach(self.slot);
                true
            } else {
                tracing::debug!(
                    "{} reached the idle timeout but the queue is not empty",
                    self.id
                );
                false
            }
        })
    }

    fn sleep_time(&self, last_resolution: Instant) -> Duration {
        let mut sleep = NAPTIME_PER_CYCLE;
        if let Some(timeout) = self.config.resolver_timeout() {
            sleep = sleep.min(timeout.saturating_sub(last_resolution.elapsed()));
        }
        if let Some(deadline) = self.queue.next_deadline(self.dbid) {
            sleep = sleep.min(deadline.saturating_duration_since(Instant::now()));
        }
        sleep
    }

    fn detach(&self) {
        self.slots.detach(self.slot);
        tracing::info!("{} for database {} stopped", self.id, self.dbid);
        // Whatever work is left needs a new worker; let the launcher
        // take another look.
        self.launch_signal.request_launch();
    }
}
