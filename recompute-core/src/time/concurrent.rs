//! Concurrent Timer Set
//!
//! Shards timers across `C` independent [`TimerSet`]s by
//! `hash(item) & (C - 1)`. Each shard has its own lock and sweep task, so
//! many concurrent `add_or_update` calls rarely contend. The price is that
//! ordering across shards is only as exact as one quantum.

use std::hash::BuildHasher;
use std::collections::hash_map::RandomState;
use std::time::Duration;

use tokio::time::Instant;

use super::tick::TickSource;
use super::timer_set::{FireHandler, TimerItem, TimerSet, TimerSetOptions};

/// Upper bound on the number of shards.
pub const MAX_CONCURRENCY: usize = 1024;

/// A timer set sharded by item hash.
pub struct ConcurrentTimerSet<T>
where
    T: TimerItem,
{
    shards: Vec<TimerSet<T>>,
    mask: usize,
    hasher: RandomState,
}

impl<T> ConcurrentTimerSet<T>
where
    T: TimerItem,
{
    /// Create `concurrency` shards, clamped to [`MAX_CONCURRENCY`] and
    /// rounded up to a power of two.
    ///
    /// All shards share the same start moment and tick source, so priorities
    /// agree across them and their sweeps wake together.
    pub fn new(options: TimerSetOptions, handler: Option<FireHandler<T>>, concurrency: usize) -> Self {
        let concurrency = concurrency.clamp(1, MAX_CONCURRENCY).next_power_of_two();
        let start = options.clock.now();
        let tick = TickSource::starting_at(TimerSet::<T>::effective_quanta(&options), start);
        let shards = (0..concurrency)
            .map(|_| TimerSet::with_tick(options.clone(), handler.clone(), start, tick))
            .collect();
        Self {
            shards,
            mask: concurrency - 1,
            hasher: RandomState::new(),
        }
    }

    /// Number of shards.
    pub fn concurrency(&self) -> usize {
        self.shards.len()
    }

    /// Width of one quantum.
    pub fn quanta(&self) -> Duration {
        self.shards[0].quanta()
    }

    /// Total pending timers across all shards.
    pub fn count(&self) -> usize {
        self.shards.iter().map(TimerSet::count).sum()
    }

    /// Priority of the quantum containing `moment`.
    pub fn priority_of(&self, moment: Instant) -> u64 {
        self.shards[0].priority_of(moment)
    }

    /// See [`TimerSet::add_or_update`].
    pub fn add_or_update(&self, timer: T, moment: Instant) {
        self.shard(&timer).add_or_update(timer, moment);
    }

    /// See [`TimerSet::add_or_update_to_earlier`].
    pub fn add_or_update_to_earlier(&self, timer: T, moment: Instant) -> bool {
        self.shard(&timer).add_or_update_to_earlier(timer, moment)
    }

    /// See [`TimerSet::add_or_update_to_later`].
    pub fn add_or_update_to_later(&self, timer: T, moment: Instant) -> bool {
        self.shard(&timer).add_or_update_to_later(timer, moment)
    }

    /// See [`TimerSet::remove`].
    pub fn remove(&self, timer: &T) -> bool {
        self.shard(timer).remove(timer)
    }

    /// Pending priority of `timer`, if scheduled.
    pub fn scheduled_priority(&self, timer: &T) -> Option<u64> {
        self.shard(timer).scheduled_priority(timer)
    }

    /// Stop every shard.
    pub fn dispose(&self) {
        self.shards.iter().for_each(TimerSet::dispose);
    }

    fn shard(&self, timer: &T) -> &TimerSet<T> {
        let index = self.hasher.hash_one(timer) as usize & self.mask;
        &self.shards[index]
    }
}

impl<T> std::fmt::Debug for ConcurrentTimerSet<T>
where
    T: TimerItem,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConcurrentTimerSet")
            .field("concurrency", &self.shards.len())
            .field("count", &self.count())
            .finish()
    }
}
