//! Mutable State
//!
//! A [`MutableState`] is a value owned by application code and read by
//! computations. It is the leaf of every dependency chain: setting it
//! replaces its node with a new consistent one and invalidates the old one,
//! so every computation that read the old value recomputes on its next read.
//!
//! # Example
//!
//! ```ignore
//! let count = hub.state(0);
//! let doubled = hub.function({
//!     let count = count.clone();
//!     move |_: Unit, ctx, _| {
//!         let count = count.clone();
//!         async move { Ok(count.use_value(&ctx)? * 2) }
//!     }
//! });
//! count.set(5);
//! ```

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use super::computed::{Computed, InvalidationSource};
use super::context::ComputeContext;
use super::hub::HubInner;
use super::input::{ComputedInput, InputKey};
use super::options::ComputedOptions;
use crate::error::{Error, Result};

/// The input identifying one mutable state.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StateKey {
    id: u64,
}

impl StateKey {
    fn next() -> Self {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);
        Self {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
        }
    }
}

impl ComputedInput for StateKey {
    fn category(&self) -> &str {
        "MutableState"
    }
}

struct StateShared<T> {
    hub: Arc<HubInner>,
    key: InputKey,
    options: Arc<ComputedOptions>,
    current: Mutex<Arc<Computed<T>>>,
}

/// A settable value that computations can depend on.
pub struct MutableState<T> {
    shared: Arc<StateShared<T>>,
}

impl<T> MutableState<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub(crate) fn new(hub: Arc<HubInner>, initial: Result<T>) -> Self {
        let key = InputKey::new(StateKey::next());
        let options = Arc::new(ComputedOptions::mutable_state());
        let node = Computed::new(&hub, key.clone(), options.clone());
        node.try_set_output(initial);
        hub.registry().register(node.as_ref());
        Self {
            shared: Arc::new(StateShared {
                hub,
                key,
                options,
                current: Mutex::new(node),
            }),
        }
    }

    /// The key this state registers its nodes under.
    pub fn key(&self) -> &InputKey {
        &self.shared.key
    }

    /// The current node.
    ///
    /// If something invalidated it from outside, a fresh node with the same
    /// output takes its place.
    pub fn computed(&self) -> Arc<Computed<T>> {
        let current = self.shared.current.lock().clone();
        if !current.core().is_invalidated() {
            return current;
        }
        let output = current.value();
        self.replace(|previous| {
            if previous.version() == current.version() {
                Some(output)
            } else {
                None
            }
        })
    }

    /// The current value, without dependency tracking.
    pub fn value(&self) -> Result<T> {
        self.computed().value()
    }

    /// Read the value and record a dependency on the context's computing node.
    pub fn use_value(&self, context: &ComputeContext) -> Result<T> {
        context.ensure_may_compute()?;
        let node = self.computed();
        context.use_new(&node)?;
        node.value()
    }

    /// Replace the value.
    pub fn set(&self, value: T) {
        self.set_output(Ok(value));
    }

    /// Replace the value with an error.
    pub fn set_error(&self, error: Error) {
        self.set_output(Err(error));
    }

    /// Replace the output.
    pub fn set_output(&self, output: Result<T>) {
        self.replace(|_| Some(output));
    }

    /// Replace the output with a function of the current one.
    pub fn update<F>(&self, update: F)
    where
        F: FnOnce(Result<T>) -> Result<T>,
    {
        self.replace(|previous| Some(update(previous.value())));
    }

    /// Swap in a node holding the output chosen by `next`, which sees the
    /// current node under the lock. `None` keeps the current node.
    fn replace<F>(&self, next: F) -> Arc<Computed<T>>
    where
        F: FnOnce(&Computed<T>) -> Option<Result<T>>,
    {
        let shared = self.shared.as_ref();
        let (node, previous) = {
            let mut current = shared.current.lock();
            let Some(output) = next(&current) else {
                return current.clone();
            };
            let node = Computed::new(&shared.hub, shared.key.clone(), shared.options.clone());
            node.try_set_output(output);
            let previous = std::mem::replace(&mut *current, node.clone());
            (node, previous)
        };
        // Handlers may read this state again, so the lock is released first.
        previous
            .core()
            .invalidate_with(true, InvalidationSource::StateChanged);
        shared.hub.registry().register(node.as_ref());
        tracing::trace!(input = %shared.key, version = node.version(), "state changed");
        node
    }
}

impl<T> Clone for MutableState<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T> fmt::Debug for MutableState<T>
where
    T: fmt::Debug + Clone + Send + Sync + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MutableState")
            .field("key", &self.shared.key)
            .field("output", &self.shared.current.lock().output())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactive::ConsistencyState;
    use crate::{Hub, HubOptions};

    fn quiet_hub() -> Hub {
        let mut options = HubOptions::default();
        options.pruner.auto_start = false;
        Hub::new(options)
    }

    #[tokio::test]
    async fn set_replaces_and_invalidates() {
        let hub = quiet_hub();
        let state = hub.state(1u32);
        let first = state.computed();

        state.set(2);
        assert_eq!(first.state(), ConsistencyState::Invalidated);
        assert_eq!(
            first.core().invalidation_source(),
            Some(InvalidationSource::StateChanged)
        );
        assert_eq!(state.value().unwrap(), 2);
        assert!(state.computed().version() > first.version());

        state.update(|value| value.map(|value| value * 10));
        assert_eq!(state.value().unwrap(), 20);
    }

    #[tokio::test]
    async fn errors_are_stored_like_values() {
        let hub = quiet_hub();
        let state = hub.state(1u32);
        state.set_error(Error::msg("unavailable"));
        assert!(state.value().is_err());
        assert_eq!(state.computed().state(), ConsistencyState::Consistent);

        state.set(3);
        assert_eq!(state.value().unwrap(), 3);
    }

    #[tokio::test]
    async fn external_invalidation_is_healed_on_read() {
        let hub = quiet_hub();
        let state = hub.state(7u32);
        let first = state.computed();
        first.invalidate();

        let second = state.computed();
        assert_ne!(first.version(), second.version());
        assert_eq!(second.state(), ConsistencyState::Consistent);
        assert_eq!(second.value().unwrap(), 7);
    }

    #[tokio::test]
    async fn use_value_rejects_get_existing() {
        let hub = quiet_hub();
        let state = hub.state(1u32);
        let context = ComputeContext::capture_existing();
        assert!(matches!(
            state.use_value(&context),
            Err(Error::InvalidCallOptions(_))
        ));
    }
}
