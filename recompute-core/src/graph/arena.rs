//! Node Arena
//!
//! Every live node occupies one arena slot. Graph edges, registry entries
//! and timer payloads refer to nodes through [`NodeHandle`]s, which are
//! `(index, generation)` pairs: once a slot is reclaimed its generation is
//! bumped, so stale handles stop resolving instead of pointing at whatever
//! reuses the slot. This gives the engine weak references without keeping
//! `Weak` pointers in every edge.
//!
//! The arena is split into shards so that inserts and lookups from many
//! threads rarely hit the same lock.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::reactive::AnyComputed;

const SHARD_BITS: u32 = 4;
const SHARDS: usize = 1 << SHARD_BITS;
const SHARD_MASK: u32 = (SHARDS as u32) - 1;

/// Weak, copyable reference to a node in a [`NodeArena`].
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeHandle {
    index: u32,
    generation: u32,
}

impl NodeHandle {
    /// Raw slot index (shard in the low bits).
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Generation of the slot when the handle was issued.
    pub fn generation(&self) -> u32 {
        self.generation
    }

    fn shard(&self) -> usize {
        (self.index & SHARD_MASK) as usize
    }

    fn slot(&self) -> usize {
        (self.index >> SHARD_BITS) as usize
    }
}

impl fmt::Debug for NodeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}v{}", self.index, self.generation)
    }
}

struct Slot {
    generation: u32,
    node: Option<Arc<dyn AnyComputed>>,
}

#[derive(Default)]
struct Shard {
    slots: Vec<Slot>,
    free: Vec<u32>,
    live: usize,
}

/// Generation-checked storage for every live node.
pub struct NodeArena {
    shards: Box<[RwLock<Shard>]>,
    next_shard: AtomicUsize,
}

impl NodeArena {
    /// Create an empty arena.
    pub fn new() -> Self {
        Self {
            shards: (0..SHARDS).map(|_| RwLock::new(Shard::default())).collect(),
            next_shard: AtomicUsize::new(0),
        }
    }

    /// Insert the node built by `build`, which receives the handle the node
    /// will live under.
    ///
    /// `build` runs under the shard lock and must not touch the arena.
    pub fn insert_with<N, F>(&self, build: F) -> Arc<N>
    where
        N: AnyComputed,
        F: FnOnce(NodeHandle) -> Arc<N>,
    {
        let shard_index = self.next_shard.fetch_add(1, Ordering::Relaxed) % SHARDS;
        let mut shard = self.shards[shard_index].write();
        let slot = match shard.free.pop() {
            Some(slot) => slot,
            None => {
                shard.slots.push(Slot {
                    generation: 0,
                    node: None,
                });
                (shard.slots.len() - 1) as u32
            }
        };
        let handle = NodeHandle {
            index: (slot << SHARD_BITS) | shard_index as u32,
            generation: shard.slots[slot as usize].generation,
        };
        let node = build(handle);
        shard.slots[slot as usize].node = Some(node.clone() as Arc<dyn AnyComputed>);
        shard.live += 1;
        node
    }

    /// Resolve a handle. `None` once the slot has been reclaimed.
    pub fn get(&self, handle: NodeHandle) -> Option<Arc<dyn AnyComputed>> {
        let shard = self.shards.get(handle.shard())?.read();
        let slot = shard.slots.get(handle.slot())?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.node.clone()
    }

    /// Whether `handle` still resolves.
    pub fn contains(&self, handle: NodeHandle) -> bool {
        let Some(shard) = self.shards.get(handle.shard()) else {
            return false;
        };
        let shard = shard.read();
        shard
            .slots
            .get(handle.slot())
            .is_some_and(|slot| slot.generation == handle.generation && slot.node.is_some())
    }

    /// Reclaim a slot. Stale handles are ignored.
    pub fn remove(&self, handle: NodeHandle) -> Option<Arc<dyn AnyComputed>> {
        let mut shard = self.shards.get(handle.shard())?.write();
        let slot = shard.slots.get_mut(handle.slot())?;
        if slot.generation != handle.generation {
            return None;
        }
        let node = slot.node.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        shard.free.push(handle.slot() as u32);
        shard.live -= 1;
        Some(node)
    }

    /// Number of live nodes.
    pub fn len(&self) -> usize {
        self.shards.iter().map(|shard| shard.read().live).sum()
    }

    /// Whether the arena holds no node.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of every live handle.
    pub fn handles(&self) -> Vec<NodeHandle> {
        let mut handles = Vec::with_capacity(self.len());
        for (shard_index, shard) in self.shards.iter().enumerate() {
            let shard = shard.read();
            for (slot_index, slot) in shard.slots.iter().enumerate() {
                if slot.node.is_some() {
                    handles.push(NodeHandle {
                        index: ((slot_index as u32) << SHARD_BITS) | shard_index as u32,
                        generation: slot.generation,
                    });
                }
            }
        }
        handles
    }
}

impl Default for NodeArena {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for NodeArena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeArena").field("len", &self.len()).finish()
    }
}
