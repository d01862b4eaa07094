//! Graph Pruner
//!
//! A background task that keeps the graph from growing without bound.
//! Every `check_period` it sweeps the registry and the arena in three
//! passes, each in batches of `batch_size` with a short sleep between
//! batches so a sweep never monopolizes a worker:
//!
//! 1. **Disposed instances**: consistent nodes whose input belongs to a
//!    disposed instance are scheduled for invalidation after
//!    `disposed_invalidation_delay`. The delay lets readers racing with the
//!    disposal finish with the value they already have.
//! 2. **Edge compaction**: dependant edges pointing at reclaimed or
//!    invalidated nodes are dropped from every consistent node.
//! 3. **Reclamation**: arena slots of invalidated nodes are freed. A
//!    consistent node nothing live depends on is invalidated and freed too
//!    when its keep-alive window lapsed, or when it has no keep-alive window
//!    and the arena holds the only reference to it.
//!
//! The pruner only holds a weak reference to the hub. Dropping the hub
//! ends the sweep loop at the next batch boundary.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::error::{Error, Result};
use crate::reactive::{AnyComputed, ConsistencyState, HubInner, InputKey, InvalidationSource};

/// Pruner configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GraphPrunerOptions {
    /// Start the background loop together with the hub.
    pub auto_start: bool,
    /// Time between two sweeps.
    pub check_period: Duration,
    /// Items handled per batch.
    pub batch_size: usize,
    /// Pause between two batches.
    pub inter_batch_delay: Duration,
    /// Delay before a node of a disposed instance is invalidated.
    pub disposed_invalidation_delay: Duration,
}

impl Default for GraphPrunerOptions {
    fn default() -> Self {
        Self {
            auto_start: true,
            check_period: Duration::from_secs(5 * 60),
            batch_size: 1024,
            inter_batch_delay: Duration::from_millis(10),
            disposed_invalidation_delay: Duration::from_secs(1),
        }
    }
}

/// What one sweep did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PruneReport {
    /// Registered inputs visited.
    pub scanned_keys: usize,
    /// Nodes scheduled for invalidation because their instance was disposed.
    pub disposed_invalidations: usize,
    /// Consistent nodes visited by edge compaction.
    pub consistent_nodes: usize,
    /// Dependant edges before compaction.
    pub edges_before: usize,
    /// Dependant edges after compaction.
    pub edges_after: usize,
    /// Arena slots freed.
    pub reclaimed_nodes: usize,
    /// Batches processed across all passes.
    pub batches: usize,
    /// Wall time of the sweep, including inter-batch pauses.
    pub elapsed: Duration,
}

/// Owner of the background sweep loop.
#[derive(Debug)]
pub struct GraphPruner {
    options: GraphPrunerOptions,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl GraphPruner {
    /// Create a stopped pruner.
    pub fn new(options: GraphPrunerOptions) -> Self {
        Self {
            options,
            task: Mutex::new(None),
        }
    }

    /// Pruner configuration.
    pub fn options(&self) -> &GraphPrunerOptions {
        &self.options
    }

    /// Whether the background loop is running.
    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    /// Start the loop for `hub`. A running loop is left alone.
    pub(crate) fn start(&self, hub: Weak<HubInner>) {
        let mut task = self.task.lock();
        if task.as_ref().is_some_and(|task| !task.is_finished()) {
            return;
        }
        *task = Some(tokio::spawn(run(hub, self.options.clone())));
    }

    /// Stop the background loop.
    pub fn stop(&self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }
}

impl Drop for GraphPruner {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run(hub: Weak<HubInner>, options: GraphPrunerOptions) {
    let period = options.check_period.max(Duration::from_millis(1));
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        match prune_once(&hub, &options).await {
            Ok(report) => tracing::debug!(
                scanned_keys = report.scanned_keys,
                disposed = report.disposed_invalidations,
                edges_before = report.edges_before,
                edges_after = report.edges_after,
                reclaimed = report.reclaimed_nodes,
                elapsed_ms = report.elapsed.as_millis() as u64,
                "graph pruned"
            ),
            Err(Error::HubDropped) => break,
            Err(error) => tracing::warn!(%error, "graph pruning failed"),
        }
    }
    tracing::trace!("graph pruner stopped");
}

fn upgrade(hub: &Weak<HubInner>) -> Result<Arc<HubInner>> {
    hub.upgrade().ok_or(Error::HubDropped)
}

fn is_disposed(key: &InputKey) -> bool {
    catch_unwind(AssertUnwindSafe(|| key.is_disposed())).unwrap_or_else(|_| {
        tracing::error!(input = %key, "disposal check panicked");
        false
    })
}

/// Why a consistent node may be evicted, if it may. `node` is the clone
/// taken from the arena by the current pass.
fn eviction_source(node: &Arc<dyn AnyComputed>) -> Option<InvalidationSource> {
    let core = node.core();
    if core.is_expired() {
        return Some(InvalidationSource::Expired);
    }
    // The arena slot and `node` itself.
    let unreferenced = Arc::strong_count(node) <= 2;
    (core.options().min_cache_duration.is_none() && unreferenced).then_some(InvalidationSource::Unreferenced)
}

/// Run one full sweep over the graph of `hub`.
pub(crate) async fn prune_once(hub: &Weak<HubInner>, options: &GraphPrunerOptions) -> Result<PruneReport> {
    let started = Instant::now();
    let batch_size = options.batch_size.max(1);
    let mut report = PruneReport::default();

    let keys = upgrade(hub)?.registry().keys();
    report.scanned_keys = keys.len();

    for (index, batch) in keys.chunks(batch_size).enumerate() {
        if index > 0 {
            tokio::time::sleep(options.inter_batch_delay).await;
        }
        let hub = upgrade(hub)?;
        for key in batch {
            if !is_disposed(key) {
                continue;
            }
            if let Some(node) = hub.registry().get_untyped(key) {
                if node.core().is_consistent() {
                    node.core()
                        .invalidate_after(options.disposed_invalidation_delay, InvalidationSource::Disposed);
                    report.disposed_invalidations += 1;
                }
            }
        }
        report.batches += 1;
    }

    for (index, batch) in keys.chunks(batch_size).enumerate() {
        if index > 0 {
            tokio::time::sleep(options.inter_batch_delay).await;
        }
        let hub = upgrade(hub)?;
        for key in batch {
            let Some(node) = hub.registry().get_untyped(key) else {
                continue;
            };
            if !node.core().is_consistent() {
                continue;
            }
            let (before, after) = node.core().prune_dependants(hub.arena());
            report.consistent_nodes += 1;
            report.edges_before += before;
            report.edges_after += after;
        }
        report.batches += 1;
    }

    let handles = upgrade(hub)?.arena().handles();
    for (index, batch) in handles.chunks(batch_size).enumerate() {
        if index > 0 {
            tokio::time::sleep(options.inter_batch_delay).await;
        }
        let hub = upgrade(hub)?;
        for handle in batch {
            let Some(node) = hub.arena().get(*handle) else {
                continue;
            };
            let core = node.core();
            let reclaim = match core.state() {
                ConsistencyState::Computing => false,
                ConsistencyState::Invalidated => true,
                ConsistencyState::Consistent => match eviction_source(&node) {
                    Some(source) if !core.has_live_dependants(hub.arena()) => {
                        core.invalidate_with(true, source);
                        true
                    }
                    _ => false,
                },
            };
            if reclaim {
                hub.registry().unregister(core);
                if hub.arena().remove(*handle).is_some() {
                    report.reclaimed_nodes += 1;
                }
            }
        }
        report.batches += 1;
    }

    report.elapsed = started.elapsed();
    if let Some(hub) = hub.upgrade() {
        hub.metrics().record_sweep(&report);
    }
    Ok(report)
}
