//! Computed Registry
//!
//! Maps every input to the handle of its current node. The registry holds
//! handles, never the nodes themselves: a node is owned by the arena, and a
//! registry entry whose node was reclaimed is dropped on the next lookup.
//!
//! At most one live node per input is registered. Registering a newer node
//! displaces and invalidates the previous one; registering an older one is
//! a no-op, so the last version wins regardless of arrival order.

use std::fmt;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use super::arena::{NodeArena, NodeHandle};
use crate::reactive::{downcast_computed, AnyComputed, AsyncLockSet, Computed, InputKey, InvalidationSource};

/// Concurrent table from input to current node.
pub struct ComputedRegistry {
    storage: DashMap<InputKey, NodeHandle>,
    arena: Arc<NodeArena>,
    input_locks: AsyncLockSet,
}

impl ComputedRegistry {
    /// Create an empty registry over `arena`.
    pub fn new(arena: Arc<NodeArena>) -> Self {
        Self {
            storage: DashMap::new(),
            arena,
            input_locks: AsyncLockSet::new(),
        }
    }

    /// The arena holding every node.
    pub fn arena(&self) -> &NodeArena {
        &self.arena
    }

    /// The per-input computation locks.
    pub fn input_locks(&self) -> &AsyncLockSet {
        &self.input_locks
    }

    /// Number of registered inputs.
    pub fn len(&self) -> usize {
        self.storage.len()
    }

    /// Whether nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.storage.is_empty()
    }

    /// Snapshot of every registered input.
    pub fn keys(&self) -> Vec<InputKey> {
        self.storage.iter().map(|entry| entry.key().clone()).collect()
    }

    /// The current node for `key`, whatever its type.
    pub fn get_untyped(&self, key: &InputKey) -> Option<Arc<dyn AnyComputed>> {
        let handle = *self.storage.get(key)?;
        match self.arena.get(handle) {
            Some(node) => Some(node),
            None => {
                self.storage.remove_if(key, |_, current| *current == handle);
                None
            }
        }
    }

    /// The current node for `key`, if it is a `Computed<T>`.
    pub fn get<T>(&self, key: &InputKey) -> Option<Arc<Computed<T>>>
    where
        T: Clone + Send + Sync + 'static,
    {
        self.get_untyped(key).and_then(downcast_computed::<T>)
    }

    /// Make `node` the current node of its input.
    pub fn register(&self, node: &dyn AnyComputed) {
        let core = node.core();
        if core.is_invalidated() {
            return;
        }
        let handle = core.handle();
        let displaced = match self.storage.entry(core.input().clone()) {
            Entry::Vacant(entry) => {
                entry.insert(handle);
                None
            }
            Entry::Occupied(mut entry) => {
                let current = *entry.get();
                if current == handle {
                    return;
                }
                match self.arena.get(current) {
                    Some(existing)
                        if existing.core().version() > core.version()
                            && !existing.core().is_invalidated() =>
                    {
                        return;
                    }
                    existing => {
                        entry.insert(handle);
                        existing
                    }
                }
            }
        };
        // Invalidation unregisters, so it must run after the entry is released.
        if let Some(displaced) = displaced {
            displaced
                .core()
                .invalidate_with(true, InvalidationSource::Replaced);
        }
    }

    /// Remove `node` if it is still the current node of its input.
    pub fn unregister(&self, node: &crate::reactive::ComputedCore) -> bool {
        let handle = node.handle();
        self.storage
            .remove_if(node.input(), |_, current| *current == handle)
            .is_some()
    }

    /// Invalidate every registered node.
    pub fn invalidate_everything(&self) {
        for key in self.keys() {
            if let Some(node) = self.get_untyped(&key) {
                node.core().invalidate();
            }
        }
    }
}

impl fmt::Debug for ComputedRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComputedRegistry")
            .field("len", &self.storage.len())
            .field("arena", &self.arena)
            .finish()
    }
}
