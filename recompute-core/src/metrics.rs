//! Hub Metrics
//!
//! Plain atomic counters updated on the hot paths and by the graph pruner.
//! [`HubMetrics::snapshot`] copies them into a serializable struct for
//! whatever export the embedding service uses.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Counters of one hub.
#[derive(Debug, Default)]
pub struct HubMetrics {
    computations: AtomicU64,
    retries: AtomicU64,
    invalidations: AtomicU64,
    nodes: AtomicU64,
    edges: AtomicU64,
    pruned_edges: AtomicU64,
    disposed_invalidations: AtomicU64,
    reclaimed_nodes: AtomicU64,
    prune_sweeps: AtomicU64,
    last_sweep_micros: AtomicU64,
}

/// Point-in-time copy of [`HubMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    /// Computation bodies started.
    pub computations: u64,
    /// Retries after internal cancellation.
    pub retries: u64,
    /// Nodes that transitioned to `Invalidated`.
    pub invalidations: u64,
    /// Consistent nodes seen by the last edge-compaction pass.
    pub nodes: u64,
    /// Dependant edges left after the last edge-compaction pass.
    pub edges: u64,
    /// Dependant edges dropped by edge compaction, total.
    pub pruned_edges: u64,
    /// Nodes invalidated because their instance was disposed, total.
    pub disposed_invalidations: u64,
    /// Arena slots reclaimed by the pruner, total.
    pub reclaimed_nodes: u64,
    /// Completed pruner sweeps.
    pub prune_sweeps: u64,
    /// Duration of the last sweep, in microseconds.
    pub last_sweep_micros: u64,
}

impl HubMetrics {
    pub(crate) fn record_computation(&self) {
        self.computations.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_invalidation(&self) {
        self.invalidations.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_sweep(&self, report: &crate::graph::PruneReport) {
        self.nodes.store(report.consistent_nodes as u64, Ordering::Relaxed);
        self.edges.store(report.edges_after as u64, Ordering::Relaxed);
        self.pruned_edges.fetch_add(
            report.edges_before.saturating_sub(report.edges_after) as u64,
            Ordering::Relaxed,
        );
        self.disposed_invalidations
            .fetch_add(report.disposed_invalidations as u64, Ordering::Relaxed);
        self.reclaimed_nodes
            .fetch_add(report.reclaimed_nodes as u64, Ordering::Relaxed);
        self.prune_sweeps.fetch_add(1, Ordering::Relaxed);
        self.last_sweep_micros
            .store(report.elapsed.as_micros() as u64, Ordering::Relaxed);
    }

    /// Copy the current values.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            computations: self.computations.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
            nodes: self.nodes.load(Ordering::Relaxed),
            edges: self.edges.load(Ordering::Relaxed),
            pruned_edges: self.pruned_edges.load(Ordering::Relaxed),
            disposed_invalidations: self.disposed_invalidations.load(Ordering::Relaxed),
            reclaimed_nodes: self.reclaimed_nodes.load(Ordering::Relaxed),
            prune_sweeps: self.prune_sweeps.load(Ordering::Relaxed),
            last_sweep_micros: self.last_sweep_micros.load(Ordering::Relaxed),
        }
    }
}
