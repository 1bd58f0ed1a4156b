//! Resolver launcher
//!
//! A single long-lived task. On wake it scans for databases that need a
//! resolver and have none, and spawns workers into free slots. Launches
//! are throttled to one round per retry interval unless a backend
//! explicitly requested one.

use crate::error::{ResolverError, Result};
use crate::queue::ResolutionQueue;
use crate::slots::{ResolverStatRow, SlotTable};
use crate::worker::ResolverWorker;
use fedtx_common::{BackendId, DatabaseId, Latch, ResolverConfig, Shutdown, Xid};
use fedtx_xact::XactRegistry;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

/// Longest nap between launcher cycles.
const NAPTIME_PER_CYCLE: Duration = Duration::from_secs(180);

/// Wakeup flags for the launcher, set by backends and exiting workers.
#[derive(Debug, Default)]
pub(crate) struct LaunchSignal {
    immediate: AtomicBool,
    pub(crate) latch: Latch,
}

impl LaunchSignal {
    /// Ask for a launch round that bypasses throttling.
    pub fn request_launch(&self) {
        self.immediate.store(true, Ordering::Release);
        self.latch.set();
    }

    fn take_immediate(&self) -> bool {
        self.immediate.swap(false, Ordering::AcqRel)
    }
}

/// The resolver subsystem: slot table, waiter queue and launcher task.
pub struct ResolverSystem {
    registry: Arc<XactRegistry>,
    queue: Arc<ResolutionQueue>,
    slots: Arc<SlotTable>,
    config: RwLock<ResolverConfig>,
    signal: Arc<LaunchSignal>,
    shutdown: Shutdown,
    launcher: Mutex<Option<JoinHandle<()>>>,
}

impl ResolverSystem {
    pub fn new(registry: Arc<XactRegistry>, config: ResolverConfig, shutdown: Shutdown) -> Arc<Self> {
        let capacity = config.max_foreign_xact_resolvers;
        Arc::new(Self {
            registry,
            queue: Arc::new(ResolutionQueue::new()),
            slots: Arc::new(SlotTable::new(capacity)),
            config: RwLock::new(config),
            signal: Arc::new(LaunchSignal::default()),
            shutdown,
            launcher: Mutex::new(None),
        })
    }

    /// Spawn the launcher task. Idempotent per system.
    pub fn start(self: &Arc<Self>) {
        let mut launcher = self.launcher.lock();
        if launcher.is_some() {
            return;
        }
        let system = self.clone();
        *launcher = Some(tokio::spawn(async move {
            system.launcher_loop().await;
        }));
        tracing::info!("foreign transaction resolver launcher started");
    }

    /// Swap in a reloaded configuration. Takes effect on the next
    /// launcher cycle and the next worker spawned.
    pub fn reload_config(&self, config: ResolverConfig) {
        *self.config.write() = config;
        tracing::info!("resolver configuration reloaded");
        self.signal.latch.set();
    }

    /// If a running resolver covers `dbid`, wake it; otherwise ask the
    /// launcher to start one immediately.
    pub fn launch_or_wakeup(&self, dbid: DatabaseId) {
        if let Some(latch) = self.slots.latch_for(dbid) {
            latch.set();
            return;
        }
        self.signal.request_launch();
    }

    /// Enqueue a waiter for the given distributed transaction and block
    /// until a resolver has finalized its entries.
    pub async fn wait_for_resolution(
        &self,
        dbid: DatabaseId,
        backend: BackendId,
        xid: Xid,
        commit: bool,
    ) -> Result<()> {
        let handle = self.queue.enqueue(dbid, backend, xid, commit);
        self.launch_or_wakeup(dbid);

        loop {
            handle.latch.reset();
            if handle.is_complete() {
                return Ok(());
            }
            if self.shutdown.is_triggered() {
                self.queue.detach(dbid, &handle);
                return Err(ResolverError::ShuttingDown);
            }
            tokio::select! {
                _ = handle.latch.wait() => {}
                _ = self.shutdown.wait() => {}
            }
        }
    }

    /// Activity of all running resolvers.
    pub fn stats(&self) -> Vec<ResolverStatRow> {
        self.slots.stats()
    }

    /// Terminate the resolver running on a database and wait for its
    /// slot to clear.
    pub async fn stop_resolver(&self, dbid: DatabaseId) -> Result<()> {
        if !self.slots.request_stop(dbid) {
            return Err(ResolverError::NoResolver(dbid));
        }
        while self.slots.covers(dbid) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        Ok(())
    }

    async fn launcher_loop(self: Arc<Self>) {
        let mut last_start: Option<Instant> = None;

        loop {
            self.signal.latch.reset();
            if self.shutdown.is_triggered() {
                break;
            }

            let now = Instant::now();
            let immediate = self.signal.take_immediate();
            let retry_interval = self.config.read().retry_interval();

            let mut wait_time = NAPTIME_PER_CYCLE;
            let throttled =
                last_start.is_some_and(|t| now.saturating_duration_since(t) < retry_interval);
            if immediate || !throttled {
                if self.launch_pending_resolvers() {
                    last_start = Some(now);
                    wait_time = retry_interval;
                }
            } else {
                wait_time = retry_interval;
            }

            tokio::select! {
                _ = self.signal.latch.wait() => {}
                _ = self.shutdown.wait() => {}
                _ = tokio::time::sleep(wait_time) => {}
            }
        }
        tracing::info!("foreign transaction resolver launcher stopped");
    }

    /// Start workers for databases that need resolution and have no
    /// running resolver. Returns true if any worker was launched.
    fn launch_pending_resolvers(self: &Arc<Self>) -> bool {
        let mut databases = self.registry.databases_needing_resolution();
        for dbid in self.queue.databases_with_waiters() {
            if !databases.contains(&dbid) {
                databases.push(dbid);
            }
        }

        let mut launched = false;
        for dbid in databases {
            if self.slots.covers(dbid) {
                continue;
            }
            let Some((slot, id)) = self.slots.allocate(dbid) else {
                tracing::warn!(
                    "out of foreign transaction resolver slots while launching for database {dbid}"
                );
                break;
            };

            let worker = ResolverWorker {
                slot,
                id,
                dbid,
                registry: self.registry.clone(),
                queue: self.queue.clone(),
                slots: self.slots.clone(),
                config: self.config.read().clone(),
                launch_signal: self.signal.clone(),
                shutdown: self.shutdown.clone(),
            };
            tokio::spawn(worker.run());
            launched = true;
        }
        launched
    }
}
