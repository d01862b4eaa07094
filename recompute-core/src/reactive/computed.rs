//! Computed Nodes
//!
//! A [`Computed<T>`] is one memoized result: the output of running a
//! computation for one input, plus its consistency state, its version and
//! the dependency edges recorded while it ran.
//!
//! # Lifecycle
//!
//! ```text
//! Computing ──try_set_output──▶ Consistent ──invalidate──▶ Invalidated
//!     │                                                         ▲
//!     └──────────── invalidate (deferred until output) ─────────┘
//! ```
//!
//! - The output is written exactly once, while the node is `Computing`.
//! - Invalidation is one-way and idempotent. Invalidated handlers fire once.
//! - Invalidating a `Computing` node is deferred: the output is still
//!   stored, then the node invalidates itself.
//!
//! # Lazy re-validation
//!
//! Invalidation never walks dependants. Instead the hub bumps an
//! invalidation epoch, and a node read under a newer epoch than the one it
//! was last verified at re-checks its dependencies recursively. A node with
//! an invalidated or reclaimed dependency invalidates itself on that check.
//!
//! The untyped half of the node lives in [`ComputedCore`] so that the graph,
//! the registry and the pruner can work with `Arc<dyn AnyComputed>`.

use std::any::Any;
use std::borrow::Cow;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use indexmap::IndexSet;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::time::Instant;

use super::handlers::{HandlerId, InvalidatedHandlerSet};
use super::hub::HubInner;
use super::input::InputKey;
use super::options::ComputedOptions;
use crate::error::{Error, Result};
use crate::graph::{NodeArena, NodeHandle};

/// Consistency state of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ConsistencyState {
    /// The computation is running; no output yet.
    Computing = 0,
    /// The output is set and still valid.
    Consistent = 1,
    /// The output is stale. Terminal.
    Invalidated = 2,
}

impl ConsistencyState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Computing,
            1 => Self::Consistent,
            _ => Self::Invalidated,
        }
    }
}

/// Why a node was invalidated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvalidationSource {
    /// Direct call to `invalidate`.
    Explicit,
    /// A call made with the `Invalidate` call options.
    CallOptions,
    /// A delayed or auto-invalidation timer fired.
    Timeout,
    /// A recorded dependency was invalidated or reclaimed.
    DependencyInvalidated,
    /// A newer node took over the registry slot.
    Replaced,
    /// A mutable state was set.
    StateChanged,
    /// The computation was cancelled.
    Cancelled,
    /// The owning instance was disposed.
    Disposed,
    /// The keep-alive window lapsed and the pruner evicted the node.
    Expired,
    /// Nothing held the node and the pruner reclaimed it.
    Unreferenced,
    /// Anything else.
    Custom(Cow<'static, str>),
}

impl fmt::Display for InvalidationSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Explicit => f.write_str("explicit"),
            Self::CallOptions => f.write_str("call options"),
            Self::Timeout => f.write_str("timeout"),
            Self::DependencyInvalidated => f.write_str("dependency invalidated"),
            Self::Replaced => f.write_str("replaced"),
            Self::StateChanged => f.write_str("state changed"),
            Self::Cancelled => f.write_str("cancelled"),
            Self::Disposed => f.write_str("disposed"),
            Self::Expired => f.write_str("expired"),
            Self::Unreferenced => f.write_str("unreferenced"),
            Self::Custom(reason) => f.write_str(reason),
        }
    }
}

const INVALIDATE_ON_SET_OUTPUT: u8 = 1;
const INVALIDATE_ON_SET_OUTPUT_IMMEDIATELY: u8 = 1 << 1;
const DELAYED_INVALIDATION_STARTED: u8 = 1 << 2;

// Keep-alive word: the deadline in the high bits, flags in the low two.
const KEEP_ALIVE_PENDING: u64 = 1;
const KEEP_ALIVE_EXPIRED: u64 = 1 << 1;
const KEEP_ALIVE_SHIFT: u32 = 2;

#[derive(Default)]
struct CoreInner {
    flags: u8,
    dependencies: IndexSet<NodeHandle>,
    dependants: IndexSet<NodeHandle>,
    handlers: InvalidatedHandlerSet,
    source: Option<InvalidationSource>,
    delayed: Option<(Instant, InvalidationSource)>,
}

/// The type-independent part of a node.
pub struct ComputedCore {
    input: InputKey,
    options: Arc<ComputedOptions>,
    handle: NodeHandle,
    version: u64,
    hub: Weak<HubInner>,
    state: AtomicU8,
    verified_at: AtomicU64,
    keep_alive: AtomicU64,
    inner: Mutex<CoreInner>,
}

fn next_version() -> u64 {
    static VERSION: AtomicU64 = AtomicU64::new(1);
    VERSION.fetch_add(1, Ordering::Relaxed)
}

impl ComputedCore {
    fn new(input: InputKey, options: Arc<ComputedOptions>, handle: NodeHandle, hub: Weak<HubInner>) -> Self {
        Self {
            input,
            options,
            handle,
            version: next_version(),
            hub,
            state: AtomicU8::new(ConsistencyState::Computing as u8),
            verified_at: AtomicU64::new(0),
            keep_alive: AtomicU64::new(0),
            inner: Mutex::new(CoreInner::default()),
        }
    }

    /// The input this node was computed for.
    pub fn input(&self) -> &InputKey {
        &self.input
    }

    /// Timing options of this node.
    pub fn options(&self) -> &ComputedOptions {
        &self.options
    }

    /// Arena handle of this node.
    pub fn handle(&self) -> NodeHandle {
        self.handle
    }

    /// Monotonic version; a newer node for the same input has a larger one.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Current consistency state.
    pub fn state(&self) -> ConsistencyState {
        ConsistencyState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Whether the state is `Consistent`, without re-validating dependencies.
    pub fn is_consistent(&self) -> bool {
        self.state() == ConsistencyState::Consistent
    }

    /// Whether the node has been invalidated.
    pub fn is_invalidated(&self) -> bool {
        self.state() == ConsistencyState::Invalidated
    }

    /// Whether the node is consistent and every recorded dependency still is.
    ///
    /// Invalidates the node if a dependency turns out to be stale.
    pub fn is_up_to_date(&self) -> bool {
        match self.hub.upgrade() {
            Some(hub) => hub.is_up_to_date(self),
            None => self.is_consistent(),
        }
    }

    /// What invalidated this node, once it is invalidated.
    pub fn invalidation_source(&self) -> Option<InvalidationSource> {
        self.inner.lock().source.clone()
    }

    /// Whether the keep-alive window has lapsed without renewal.
    pub fn is_expired(&self) -> bool {
        self.keep_alive.load(Ordering::Acquire) & KEEP_ALIVE_EXPIRED != 0
    }

    /// Handles of the nodes read while computing this one.
    pub fn dependencies(&self) -> Vec<NodeHandle> {
        self.inner.lock().dependencies.iter().copied().collect()
    }

    /// Handles of the nodes that read this one.
    pub fn dependants(&self) -> Vec<NodeHandle> {
        self.inner.lock().dependants.iter().copied().collect()
    }

    /// Number of recorded dependant edges.
    pub fn dependant_count(&self) -> usize {
        self.inner.lock().dependants.len()
    }

    /// Invalidate immediately.
    pub fn invalidate(&self) {
        self.invalidate_with(true, InvalidationSource::Explicit);
    }

    /// Invalidate the node.
    ///
    /// A non-immediate request honours the configured `invalidation_delay`.
    /// On a `Computing` node the request is recorded and applied once the
    /// output is set.
    pub fn invalidate_with(&self, immediate: bool, source: InvalidationSource) {
        if self.is_invalidated() {
            return;
        }
        let delay = self.options.invalidation_delay;
        let immediate = immediate || delay.is_zero();
        let transition = {
            let mut inner = self.inner.lock();
            match self.state() {
                ConsistencyState::Invalidated => return,
                ConsistencyState::Computing => {
                    inner.flags |= INVALIDATE_ON_SET_OUTPUT;
                    if immediate {
                        inner.flags |= INVALIDATE_ON_SET_OUTPUT_IMMEDIATELY;
                    }
                    inner.source.get_or_insert(source);
                    return;
                }
                ConsistencyState::Consistent if !immediate => {
                    if inner.flags & DELAYED_INVALIDATION_STARTED != 0 {
                        return;
                    }
                    inner.flags |= DELAYED_INVALIDATION_STARTED;
                    None
                }
                ConsistencyState::Consistent => {
                    self.state
                        .store(ConsistencyState::Invalidated as u8, Ordering::Release);
                    inner.source.get_or_insert(source.clone());
                    inner.dependants.clear();
                    Some((
                        std::mem::take(&mut inner.handlers),
                        std::mem::take(&mut inner.dependencies),
                    ))
                }
            }
        };

        match transition {
            None => self.invalidate_after(delay, source),
            Some((handlers, dependencies)) => {
                if let Some(hub) = self.hub.upgrade() {
                    hub.on_invalidated(self, &dependencies);
                }
                tracing::trace!(input = %self.input, %source, "node invalidated");
                handlers.invoke(self);
            }
        }
    }

    /// Invalidate once `delay` has passed. A zero delay invalidates now.
    ///
    /// When several delayed invalidations are pending, the earliest one wins
    /// and its `source` is the one recorded.
    pub fn invalidate_after(&self, delay: Duration, source: InvalidationSource) {
        if self.is_invalidated() {
            return;
        }
        if delay.is_zero() {
            self.invalidate_with(true, source);
            return;
        }
        let Some(hub) = self.hub.upgrade() else {
            self.invalidate_with(true, source);
            return;
        };
        let due = hub.now() + delay;
        {
            let mut inner = self.inner.lock();
            if inner.delayed.as_ref().map_or(true, |(at, _)| due < *at) {
                inner.delayed = Some((due, source));
            }
        }
        hub.schedule_invalidation(self.handle, due);
    }

    /// Complete the pending delayed invalidation.
    pub(crate) fn on_invalidation_timer(&self) {
        let source = self
            .inner
            .lock()
            .delayed
            .take()
            .map_or(InvalidationSource::Timeout, |(_, source)| source);
        self.invalidate_with(true, source);
    }

    /// Attach a handler that runs once when the node is invalidated.
    ///
    /// If the node is already invalidated the handler runs right away.
    pub fn on_invalidated<F>(&self, handler: F) -> HandlerId
    where
        F: Fn(&ComputedCore) + Send + Sync + 'static,
    {
        let handler: super::handlers::InvalidatedHandler = Arc::new(handler);
        {
            let mut inner = self.inner.lock();
            if !self.is_invalidated() {
                return inner.handlers.add(handler);
            }
        }
        handler(self);
        HandlerId::new()
    }

    /// Detach a handler attached with [`on_invalidated`](Self::on_invalidated).
    pub fn remove_invalidated_handler(&self, id: HandlerId) -> bool {
        self.inner.lock().handlers.remove(id)
    }

    /// Wait until the node is invalidated.
    pub async fn when_invalidated(&self) {
        let (tx, rx) = oneshot::channel();
        let tx = Mutex::new(Some(tx));
        self.on_invalidated(move |_| {
            if let Some(tx) = tx.lock().take() {
                let _ = tx.send(());
            }
        });
        let _ = rx.await;
    }

    /// Record that this computing node read `dependency`.
    pub(crate) fn add_dependency(&self, dependency: &ComputedCore) -> Result<()> {
        if self.state() != ConsistencyState::Computing || dependency.handle == self.handle {
            return Ok(());
        }
        let added = dependency.add_dependant(self.handle)?;

        let mut inner = self.inner.lock();
        if !added {
            // A consistent node never depends on a dead one.
            inner.flags |= INVALIDATE_ON_SET_OUTPUT | INVALIDATE_ON_SET_OUTPUT_IMMEDIATELY;
            inner
                .source
                .get_or_insert(InvalidationSource::DependencyInvalidated);
            return Ok(());
        }
        if self.state() != ConsistencyState::Computing {
            drop(inner);
            dependency.remove_dependant(self.handle);
            return Ok(());
        }
        inner.dependencies.insert(dependency.handle);
        Ok(())
    }

    fn add_dependant(&self, dependant: NodeHandle) -> Result<bool> {
        let mut inner = self.inner.lock();
        match self.state() {
            ConsistencyState::Computing => Err(Error::WrongState(ConsistencyState::Computing)),
            ConsistencyState::Invalidated => Ok(false),
            ConsistencyState::Consistent => {
                inner.dependants.insert(dependant);
                Ok(true)
            }
        }
    }

    pub(crate) fn remove_dependant(&self, dependant: NodeHandle) {
        self.inner.lock().dependants.swap_remove(&dependant);
    }

    /// Drop dependant edges whose node is gone or invalidated.
    ///
    /// Returns the edge counts before and after.
    pub(crate) fn prune_dependants(&self, arena: &NodeArena) -> (usize, usize) {
        let mut inner = self.inner.lock();
        let before = inner.dependants.len();
        if self.is_consistent() {
            inner.dependants.retain(|handle| {
                arena
                    .get(*handle)
                    .is_some_and(|node| !node.core().is_invalidated())
            });
        }
        (before, inner.dependants.len())
    }

    /// Whether any dependant edge points at a live, non-invalidated node.
    pub(crate) fn has_live_dependants(&self, arena: &NodeArena) -> bool {
        let dependants = self.dependants();
        dependants.into_iter().any(|handle| {
            arena
                .get(handle)
                .is_some_and(|node| !node.core().is_invalidated())
        })
    }

    /// Extend the keep-alive window.
    pub(crate) fn renew_timeouts(&self) {
        if self.is_invalidated() {
            return;
        }
        let Some(min_cache_duration) = self.options.min_cache_duration else {
            return;
        };
        if let Some(hub) = self.hub.upgrade() {
            hub.keep_alive(self, min_cache_duration);
        }
    }

    pub(crate) fn verified_at(&self) -> u64 {
        self.verified_at.load(Ordering::Acquire)
    }

    pub(crate) fn set_verified_at(&self, epoch: u64) {
        self.verified_at.fetch_max(epoch, Ordering::AcqRel);
    }

    /// Push the keep-alive deadline forward and clear the expired flag.
    /// Returns `true` if a keep-alive timer needs to be queued.
    pub(crate) fn extend_keep_alive(&self, until: u64) -> bool {
        let until = until.min(u64::MAX >> KEEP_ALIVE_SHIFT);
        let previous = self
            .keep_alive
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |word| {
                let deadline = (word >> KEEP_ALIVE_SHIFT).max(until);
                Some(deadline << KEEP_ALIVE_SHIFT | KEEP_ALIVE_PENDING)
            })
            .unwrap_or_else(|word| word);
        previous & KEEP_ALIVE_PENDING == 0
    }

    /// Called when a keep-alive timer fires. Returns `true` if the window
    /// was renewed since and a new timer needs to be queued.
    ///
    /// The deadline check and the expiry happen in one atomic step, so a
    /// concurrent renewal either lands first and keeps the node alive or
    /// lands after and clears the flag again.
    pub(crate) fn on_keep_alive_timer(&self, now: u64) -> bool {
        self.keep_alive
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |word| {
                let deadline = word >> KEEP_ALIVE_SHIFT;
                (now >= deadline).then_some(deadline << KEEP_ALIVE_SHIFT | KEEP_ALIVE_EXPIRED)
            })
            .is_err()
    }

    /// Store the output under the node lock. Returns the pending flags, or
    /// `None` if the node is no longer computing.
    fn begin_set_output(&self, set: impl FnOnce() -> bool) -> Option<u8> {
        let inner = self.inner.lock();
        if self.state() != ConsistencyState::Computing || !set() {
            return None;
        }
        self.state
            .store(ConsistencyState::Consistent as u8, Ordering::Release);
        Some(inner.flags)
    }

    fn complete_set_output(&self, flags: u8, error: Option<&Error>) {
        if flags & INVALIDATE_ON_SET_OUTPUT != 0 {
            let source = self
                .invalidation_source()
                .unwrap_or(InvalidationSource::Explicit);
            self.invalidate_with(flags & INVALIDATE_ON_SET_OUTPUT_IMMEDIATELY != 0, source);
            return;
        }
        if let Some(hub) = self.hub.upgrade() {
            if !hub.verify_dependencies(self) {
                self.invalidate_with(true, InvalidationSource::DependencyInvalidated);
                return;
            }
        }
        if error.is_some_and(Error::is_cancellation) {
            self.invalidate_with(true, InvalidationSource::Cancelled);
            return;
        }
        if let Some(delay) = self.options.auto_invalidation_delay_for(error) {
            self.invalidate_after(delay, InvalidationSource::Timeout);
        }
    }
}

impl fmt::Debug for ComputedCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComputedCore")
            .field("input", &self.input)
            .field("handle", &self.handle)
            .field("version", &self.version)
            .field("state", &self.state())
            .finish()
    }
}

/// Type-erased node, as stored in the arena and the registry.
pub trait AnyComputed: Send + Sync + 'static {
    /// The untyped node state.
    fn core(&self) -> &ComputedCore;

    /// Whether the output is an error.
    fn has_error(&self) -> bool;

    /// Upcast for downcasting to a concrete [`Computed<T>`].
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

/// Downcast a type-erased node.
pub fn downcast_computed<T>(node: Arc<dyn AnyComputed>) -> Option<Arc<Computed<T>>>
where
    T: Clone + Send + Sync + 'static,
{
    node.into_any().downcast::<Computed<T>>().ok()
}

/// A memoized result of type `T`.
pub struct Computed<T> {
    core: ComputedCore,
    output: OnceLock<Result<T>>,
}

impl<T> Computed<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Allocate a new `Computing` node in the hub's arena.
    pub(crate) fn new(hub: &Arc<HubInner>, input: InputKey, options: Arc<ComputedOptions>) -> Arc<Self> {
        let weak = Arc::downgrade(hub);
        hub.arena()
            .insert_with(|handle| Arc::new(Self::with_hub(input, options, handle, weak)))
    }

    /// A node that belongs to no hub.
    pub(crate) fn detached(input: InputKey, options: Arc<ComputedOptions>, handle: NodeHandle) -> Self {
        Self::with_hub(input, options, handle, Weak::new())
    }

    fn with_hub(input: InputKey, options: Arc<ComputedOptions>, handle: NodeHandle, hub: Weak<HubInner>) -> Self {
        Self {
            core: ComputedCore::new(input, options, handle, hub),
            output: OnceLock::new(),
        }
    }

    /// The untyped node state.
    pub fn core(&self) -> &ComputedCore {
        &self.core
    }

    /// The input this node was computed for.
    pub fn input(&self) -> &InputKey {
        &self.core.input
    }

    /// Arena handle.
    pub fn handle(&self) -> NodeHandle {
        self.core.handle
    }

    /// Monotonic version.
    pub fn version(&self) -> u64 {
        self.core.version
    }

    /// Current consistency state.
    pub fn state(&self) -> ConsistencyState {
        self.core.state()
    }

    /// See [`ComputedCore::is_up_to_date`].
    pub fn is_up_to_date(&self) -> bool {
        self.core.is_up_to_date()
    }

    /// The stored output, once set.
    pub fn output(&self) -> Option<&Result<T>> {
        self.output.get()
    }

    /// A clone of the stored value or error.
    pub fn value(&self) -> Result<T> {
        match self.output.get() {
            Some(Ok(value)) => Ok(value.clone()),
            Some(Err(error)) => Err(error.clone()),
            None => Err(Error::WrongState(self.state())),
        }
    }

    /// The stored error, if the computation failed.
    pub fn error(&self) -> Option<&Error> {
        self.output.get().and_then(|output| output.as_ref().err())
    }

    /// Set the output of a `Computing` node.
    ///
    /// Returns `false`, leaving the node untouched, if it is not computing.
    /// A pending invalidation requested while computing is applied right
    /// after the output is stored.
    pub fn try_set_output(&self, output: Result<T>) -> bool {
        let mut output = Some(output);
        let flags = self.core.begin_set_output(|| match output.take() {
            Some(output) => self.output.set(output).is_ok(),
            None => false,
        });
        let Some(flags) = flags else {
            return false;
        };
        self.core.complete_set_output(flags, self.error());
        true
    }

    /// Invalidate immediately.
    pub fn invalidate(&self) {
        self.core.invalidate();
    }

    /// See [`ComputedCore::on_invalidated`].
    pub fn on_invalidated<F>(&self, handler: F) -> HandlerId
    where
        F: Fn(&ComputedCore) + Send + Sync + 'static,
    {
        self.core.on_invalidated(handler)
    }

    /// Wait until the node is invalidated.
    pub async fn when_invalidated(&self) {
        self.core.when_invalidated().await;
    }
}

impl<T> AnyComputed for Computed<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn core(&self) -> &ComputedCore {
        &self.core
    }

    fn has_error(&self) -> bool {
        self.error().is_some()
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

impl<T> fmt::Debug for Computed<T>
where
    T: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Computed")
            .field("input", &self.core.input)
            .field("version", &self.core.version)
            .field("state", &self.core.state())
            .field("output", &self.output.get())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactive::ComputedInput;
    use std::sync::atomic::AtomicUsize;

    #[derive(Debug, PartialEq, Eq, Hash)]
    struct Key(u32);

    impl ComputedInput for Key {}

    fn node(arena: &NodeArena) -> Arc<Computed<u32>> {
        arena.insert_with(|handle| {
            Arc::new(Computed::detached(
                InputKey::new(Key(1)),
                Arc::new(ComputedOptions::default()),
                handle,
            ))
        })
    }

    #[test]
    fn output_is_write_once() {
        let arena = NodeArena::new();
        let node = node(&arena);
        assert_eq!(node.state(), ConsistencyState::Computing);
        assert!(node.value().is_err());

        assert!(node.try_set_output(Ok(1)));
        assert!(!node.try_set_output(Ok(2)));
        assert_eq!(node.value().unwrap(), 1);
        assert_eq!(node.state(), ConsistencyState::Consistent);
    }

    #[test]
    fn invalidation_is_idempotent_and_fires_handlers_once() {
        let arena = NodeArena::new();
        let node = node(&arena);
        node.try_set_output(Ok(1));

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        node.on_invalidated(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        node.invalidate();
        node.invalidate();
        node.core().invalidate_with(false, InvalidationSource::Timeout);

        assert_eq!(node.state(), ConsistencyState::Invalidated);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(node.core().invalidation_source(), Some(InvalidationSource::Explicit));
        assert!(!node.try_set_output(Ok(5)));
        assert_eq!(node.value().unwrap(), 1);
    }

    #[test]
    fn invalidating_while_computing_is_deferred() {
        let arena = NodeArena::new();
        let node = node(&arena);
        node.invalidate();
        assert_eq!(node.state(), ConsistencyState::Computing);

        assert!(node.try_set_output(Ok(3)));
        assert_eq!(node.state(), ConsistencyState::Invalidated);
        assert_eq!(node.value().unwrap(), 3);
    }

    #[test]
    fn handler_added_after_invalidation_runs_immediately() {
        let arena = NodeArena::new();
        let node = node(&arena);
        node.try_set_output(Ok(1));
        node.invalidate();

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        node.on_invalidated(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn dependency_on_invalidated_node_poisons_the_dependant() {
        let arena = NodeArena::new();
        let dependency = node(&arena);
        dependency.try_set_output(Ok(1));
        dependency.invalidate();

        let dependant = node(&arena);
        dependant.core().add_dependency(dependency.core()).unwrap();
        dependant.try_set_output(Ok(2));
        assert_eq!(dependant.state(), ConsistencyState::Invalidated);
        assert_eq!(
            dependant.core().invalidation_source(),
            Some(InvalidationSource::DependencyInvalidated)
        );
    }

    #[test]
    fn edges_are_recorded_both_ways_and_pruned() {
        let arena = NodeArena::new();
        let dependency = node(&arena);
        dependency.try_set_output(Ok(1));

        let dependant = node(&arena);
        dependant.core().add_dependency(dependency.core()).unwrap();
        dependant.try_set_output(Ok(2));

        assert_eq!(dependant.core().dependencies(), vec![dependency.handle()]);
        assert_eq!(dependency.core().dependants(), vec![dependant.handle()]);
        assert!(dependency.core().has_live_dependants(&arena));

        arena.remove(dependant.handle());
        assert_eq!(dependency.core().prune_dependants(&arena), (1, 0));
        assert!(!dependency.core().has_live_dependants(&arena));
    }

    #[test]
    fn reading_a_computing_node_as_dependency_is_an_error() {
        let arena = NodeArena::new();
        let dependency = node(&arena);
        let dependant = node(&arena);
        assert!(matches!(
            dependant.core().add_dependency(dependency.core()),
            Err(Error::WrongState(ConsistencyState::Computing))
        ));
    }

    #[test]
    fn cancellation_output_invalidates_immediately() {
        let arena = NodeArena::new();
        let node = node(&arena);
        node.try_set_output(Err(Error::Cancelled));
        assert_eq!(node.state(), ConsistencyState::Invalidated);
        assert!(node.error().is_some_and(Error::is_cancellation));
    }

    #[test]
    fn downcast_round_trips_through_any_computed() {
        let arena = NodeArena::new();
        let node = node(&arena);
        let erased = arena.get(node.handle()).unwrap();
        assert!(downcast_computed::<u32>(erased.clone()).is_some());
        assert!(downcast_computed::<String>(erased).is_none());
    }

    #[test]
    fn keep_alive_expires_only_past_the_latest_deadline() {
        let arena = NodeArena::new();
        let node = node(&arena);
        node.try_set_output(Ok(1));
        let core = node.core();

        assert!(core.extend_keep_alive(100));
        assert!(!core.extend_keep_alive(200));
        assert!(!core.extend_keep_alive(150));

        // Renewed past the first deadline: keep waiting.
        assert!(core.on_keep_alive_timer(120));
        assert!(!core.is_expired());

        assert!(!core.on_keep_alive_timer(200));
        assert!(core.is_expired());

        // A renewal after expiry clears the flag and needs a new timer.
        assert!(core.extend_keep_alive(300));
        assert!(!core.is_expired());
        assert!(core.on_keep_alive_timer(250));
        assert!(!core.is_expired());
    }
}
