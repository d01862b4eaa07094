//! Hub
//!
//! The hub is the coordinator every memoized computation belongs to. It
//! owns the node arena and the registry, the timers that drive delayed
//! invalidation and keep-alive expiry, the graph pruner and the metrics.
//!
//! # How It Works
//!
//! 1. Functions, sources and states are created through the hub and keep a
//!    strong reference to it. Nodes only keep a weak one, so dropping every
//!    function and hub handle tears the whole graph down.
//!
//! 2. Every immediate invalidation bumps the hub's invalidation epoch. A node
//!    verified under the current epoch is known to be up to date without
//!    looking at its dependencies; otherwise its dependencies are re-checked
//!    recursively on the next read.
//!
//! 3. Delayed invalidations go through a sharded timer set keyed by node
//!    handle. Keep-alive renewals go through one fixed-delay timer set per
//!    distinct `min_cache_duration`; a node whose window lapses is marked
//!    expired and left to the pruner.
//!
//! Several hubs can coexist; nothing here is global.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use indexmap::IndexSet;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::computed::{ComputedCore, InvalidationSource};
use super::context::ComputeContext;
use super::function::ComputeFunction;
use super::input::ComputedInput;
use super::options::ComputedOptions;
use super::source::ComputedSource;
use super::state::MutableState;
use crate::error::Result;
use crate::graph::{pruner, ComputedRegistry, GraphPruner, GraphPrunerOptions, NodeArena, NodeHandle, PruneReport};
use crate::metrics::HubMetrics;
use crate::time::{default_clock, ConcurrentTimerSet, FireHandler, FixedTimerSet, SharedClock, TickSource, TimerSetOptions};

/// Hub configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HubOptions {
    /// Quantum of the delayed-invalidation timers.
    pub timer_quanta: Duration,
    /// Shards of the delayed-invalidation timer set.
    pub timer_concurrency: usize,
    /// Tick shared by the keep-alive timer sets.
    pub keep_alive_tick: Duration,
    /// Default options of functions and sources created without explicit ones.
    pub computed: ComputedOptions,
    /// Graph pruner configuration.
    pub pruner: GraphPrunerOptions,
}

impl HubOptions {
    /// Parse options from JSON. Missing fields take their defaults.
    pub fn from_json(json: &str) -> std::result::Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

impl Default for HubOptions {
    fn default() -> Self {
        Self {
            timer_quanta: Duration::from_millis(250),
            timer_concurrency: std::thread::available_parallelism().map_or(4, |n| n.get()),
            keep_alive_tick: Duration::from_secs(1),
            computed: ComputedOptions::default(),
            pruner: GraphPrunerOptions::default(),
        }
    }
}

pub(crate) struct HubInner {
    options: HubOptions,
    clock: SharedClock,
    origin: Instant,
    arena: Arc<NodeArena>,
    registry: ComputedRegistry,
    invalidation_timers: ConcurrentTimerSet<NodeHandle>,
    keep_alive_timers: DashMap<Duration, FixedTimerSet<NodeHandle>>,
    keep_alive_tick: TickSource,
    epoch: AtomicU64,
    metrics: HubMetrics,
    pruner: GraphPruner,
    weak_self: Weak<HubInner>,
}

impl HubInner {
    pub(crate) fn arena(&self) -> &NodeArena {
        &self.arena
    }

    pub(crate) fn registry(&self) -> &ComputedRegistry {
        &self.registry
    }

    pub(crate) fn metrics(&self) -> &HubMetrics {
        &self.metrics
    }

    fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    fn ticks_since_origin(&self, moment: Instant) -> u64 {
        moment.saturating_duration_since(self.origin).as_nanos() as u64
    }

    /// Whether `core` is consistent, re-checking its dependencies if the
    /// graph changed since it was last verified.
    pub(crate) fn is_up_to_date(&self, core: &ComputedCore) -> bool {
        if !core.is_consistent() {
            return false;
        }
        if core.verified_at() == self.epoch() {
            return true;
        }
        if self.verify_dependencies(core) {
            return true;
        }
        core.invalidate_with(true, InvalidationSource::DependencyInvalidated);
        false
    }

    /// Check every dependency of `core` and stamp it with the current epoch
    /// if they are all up to date.
    pub(crate) fn verify_dependencies(&self, core: &ComputedCore) -> bool {
        let epoch = self.epoch();
        for dependency in core.dependencies() {
            match self.arena.get(dependency) {
                Some(node) if self.is_up_to_date(node.core()) => {}
                _ => return false,
            }
        }
        core.set_verified_at(epoch);
        true
    }

    /// Bookkeeping after `core` became invalidated.
    pub(crate) fn on_invalidated(&self, core: &ComputedCore, dependencies: &IndexSet<NodeHandle>) {
        self.epoch.fetch_add(1, Ordering::AcqRel);
        self.invalidation_timers.remove(&core.handle());
        self.registry.unregister(core);
        for dependency in dependencies {
            if let Some(node) = self.arena.get(*dependency) {
                node.core().remove_dependant(core.handle());
            }
        }
        self.metrics.record_invalidation();
    }

    pub(crate) fn now(&self) -> Instant {
        self.clock.now()
    }

    pub(crate) fn schedule_invalidation(&self, handle: NodeHandle, due: Instant) {
        self.invalidation_timers.add_or_update_to_earlier(handle, due);
    }

    fn on_invalidation_timer(&self, handle: NodeHandle) {
        if let Some(node) = self.arena.get(handle) {
            node.core().on_invalidation_timer();
        }
    }

    pub(crate) fn keep_alive(&self, core: &ComputedCore, duration: Duration) {
        let until = self.ticks_since_origin(self.clock.now() + duration);
        if core.extend_keep_alive(until) {
            self.keep_alive_timers
                .entry(duration)
                .or_insert_with(|| self.keep_alive_timer_set(duration))
                .add(core.handle());
        }
    }

    fn keep_alive_timer_set(&self, duration: Duration) -> FixedTimerSet<NodeHandle> {
        let hub = self.weak_self.clone();
        let handler: FireHandler<NodeHandle> = Arc::new(move |handle| {
            if let Some(hub) = hub.upgrade() {
                hub.on_keep_alive_timer(handle, duration);
            }
        });
        FixedTimerSet::new(duration, self.keep_alive_tick, self.clock.clone(), Some(handler))
    }

    fn on_keep_alive_timer(&self, handle: NodeHandle, duration: Duration) {
        let Some(node) = self.arena.get(handle) else {
            return;
        };
        let now = self.ticks_since_origin(self.clock.now());
        if node.core().on_keep_alive_timer(now) {
            if let Some(timers) = self.keep_alive_timers.get(&duration) {
                timers.add(handle);
            }
        }
    }
}

/// Handle to a hub. Clones share the same graph.
#[derive(Clone)]
pub struct Hub {
    inner: Arc<HubInner>,
}

impl Hub {
    /// Create a hub. Must be called inside a tokio runtime.
    pub fn new(options: HubOptions) -> Self {
        Self::with_clock(options, default_clock())
    }

    /// Create a hub that reads time from `clock`.
    pub fn with_clock(options: HubOptions, clock: SharedClock) -> Self {
        let inner = Arc::new_cyclic(|weak: &Weak<HubInner>| {
            let hub = weak.clone();
            let handler: FireHandler<NodeHandle> = Arc::new(move |handle| {
                if let Some(hub) = hub.upgrade() {
                    hub.on_invalidation_timer(handle);
                }
            });
            let timer_options = TimerSetOptions {
                quanta: options.timer_quanta,
                clock: clock.clone(),
            };
            let arena = Arc::new(NodeArena::new());
            HubInner {
                invalidation_timers: ConcurrentTimerSet::new(timer_options, Some(handler), options.timer_concurrency),
                keep_alive_timers: DashMap::new(),
                keep_alive_tick: TickSource::new(options.keep_alive_tick),
                origin: clock.now(),
                registry: ComputedRegistry::new(arena.clone()),
                arena,
                epoch: AtomicU64::new(1),
                metrics: HubMetrics::default(),
                pruner: GraphPruner::new(options.pruner.clone()),
                weak_self: weak.clone(),
                clock,
                options,
            }
        });
        if inner.options.pruner.auto_start {
            inner.pruner.start(Arc::downgrade(&inner));
        }
        tracing::debug!(
            timer_quanta_ms = inner.options.timer_quanta.as_millis() as u64,
            timer_concurrency = inner.invalidation_timers.concurrency(),
            pruner = inner.pruner.is_running(),
            "hub started"
        );
        Self { inner }
    }

    /// Hub configuration.
    pub fn options(&self) -> &HubOptions {
        &self.inner.options
    }

    /// The registry of current nodes.
    pub fn registry(&self) -> &ComputedRegistry {
        &self.inner.registry
    }

    /// Counters of this hub.
    pub fn metrics(&self) -> &HubMetrics {
        &self.inner.metrics
    }

    /// The background pruner.
    pub fn pruner(&self) -> &GraphPruner {
        &self.inner.pruner
    }

    /// Bumped on every invalidation.
    pub fn invalidation_epoch(&self) -> u64 {
        self.inner.epoch()
    }

    /// Run one pruner sweep now.
    pub async fn prune_once(&self) -> Result<PruneReport> {
        pruner::prune_once(&Arc::downgrade(&self.inner), &self.inner.options.pruner).await
    }

    /// Invalidate every registered node.
    pub fn invalidate_everything(&self) {
        self.inner.registry.invalidate_everything();
    }

    /// Memoize `body` with the hub's default options.
    pub fn function<I, T, F, Fut>(&self, body: F) -> ComputeFunction<I, T>
    where
        I: ComputedInput + Clone,
        T: Clone + Send + Sync + 'static,
        F: Fn(I, ComputeContext, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        self.function_with_options(self.inner.options.computed.clone(), body)
    }

    /// Memoize `body` with explicit options.
    pub fn function_with_options<I, T, F, Fut>(&self, options: ComputedOptions, body: F) -> ComputeFunction<I, T>
    where
        I: ComputedInput + Clone,
        T: Clone + Send + Sync + 'static,
        F: Fn(I, ComputeContext, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        ComputeFunction::new(self.inner.clone(), options, body)
    }

    /// Create a source computed by `body`, with the hub's default options.
    pub fn source<T, F, Fut>(&self, name: &'static str, body: F) -> ComputedSource<T>
    where
        T: Clone + Send + Sync + 'static,
        F: Fn(ComputeContext, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        self.source_with_options(name, self.inner.options.computed.clone(), body)
    }

    /// Create a source with explicit options.
    pub fn source_with_options<T, F, Fut>(&self, name: &'static str, options: ComputedOptions, body: F) -> ComputedSource<T>
    where
        T: Clone + Send + Sync + 'static,
        F: Fn(ComputeContext, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        ComputedSource::new(self.inner.clone(), name, options, body)
    }

    /// Create a mutable state holding `initial`.
    pub fn state<T>(&self, initial: T) -> MutableState<T>
    where
        T: Clone + Send + Sync + 'static,
    {
        MutableState::new(self.inner.clone(), Ok(initial))
    }
}

impl fmt::Debug for Hub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hub")
            .field("registry", &self.inner.registry)
            .field("epoch", &self.inner.epoch())
            .field("pruner_running", &self.inner.pruner.is_running())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn options_load_from_partial_json() {
        let options = HubOptions::from_json(
            r#"{
                "timer_concurrency": 2,
                "computed": { "auto_invalidation_delay": { "secs": 60, "nanos": 0 } },
                "pruner": { "auto_start": false }
            }"#,
        )
        .unwrap();
        assert_eq!(options.timer_concurrency, 2);
        assert_eq!(options.computed.auto_invalidation_delay, Some(Duration::from_secs(60)));
        assert!(!options.pruner.auto_start);
        assert_eq!(options.timer_quanta, Duration::from_millis(250));
    }

    #[tokio::test(start_paused = true)]
    async fn pruner_follows_auto_start() {
        let hub = Hub::new(HubOptions::default());
        assert!(hub.pruner().is_running());

        let mut options = HubOptions::default();
        options.pruner.auto_start = false;
        let quiet = Hub::new(options);
        assert!(!quiet.pruner().is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn invalidation_bumps_the_epoch() {
        let mut options = HubOptions::default();
        options.pruner.auto_start = false;
        let hub = Hub::new(options);
        let state = hub.state(1u32);
        let before = hub.invalidation_epoch();
        state.set(2);
        assert!(hub.invalidation_epoch() > before);
    }
}
