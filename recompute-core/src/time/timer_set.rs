//! Timer Set
//!
//! A [`RadixHeapSet`] of timers swept by one background task. Time is mapped
//! to an integer priority, `(moment - start) / quanta`, and all timers that
//! land in the same quantum fire together in a single sweep.
//!
//! # Guarantees
//!
//! - A timer never fires before its quantum has fully elapsed.
//! - The sweep floor only moves forward. A timer added with a priority that
//!   has already been swept is clamped to the current floor and fires on the
//!   next sweep instead of being lost.
//! - A panicking fire callback is logged and skipped; the rest of the sweep
//!   still runs.

use std::hash::Hash;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::clock::{default_clock, SharedClock};
use super::radix_heap::RadixHeapSet;
use super::tick::TickSource;

/// Callback invoked for every fired timer.
pub type FireHandler<T> = Arc<dyn Fn(T) + Send + Sync>;

/// Items stored in a timer set.
pub trait TimerItem: Hash + Eq + Clone + Send + Sync + 'static {}

impl<T> TimerItem for T where T: Hash + Eq + Clone + Send + Sync + 'static {}

/// Options for [`TimerSet`] and [`ConcurrentTimerSet`](super::ConcurrentTimerSet).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimerSetOptions {
    /// Width of one time quantum.
    pub quanta: Duration,

    /// Clock used to quantize moments.
    #[serde(skip, default = "default_clock")]
    pub clock: SharedClock,
}

impl TimerSetOptions {
    /// Smallest accepted quantum.
    pub const MIN_QUANTA: Duration = Duration::from_millis(10);

    /// Options with the given quantum and the default clock.
    pub fn with_quanta(quanta: Duration) -> Self {
        Self {
            quanta,
            ..Self::default()
        }
    }
}

impl Default for TimerSetOptions {
    fn default() -> Self {
        Self {
            quanta: Duration::from_secs(1),
            clock: default_clock(),
        }
    }
}

struct TimerState<T>
where
    T: TimerItem,
{
    timers: RadixHeapSet<T>,
    min_priority: u64,
}

struct Shared<T>
where
    T: TimerItem,
{
    state: Mutex<TimerState<T>>,
    handler: Option<FireHandler<T>>,
    clock: SharedClock,
    tick: TickSource,
    start: Instant,
    quanta: Duration,
}

impl<T> Shared<T>
where
    T: TimerItem,
{
    fn priority(&self, moment: Instant) -> u64 {
        let elapsed = moment.saturating_duration_since(self.start).as_nanos();
        let priority = elapsed / self.quanta.as_nanos();
        u64::try_from(priority).unwrap_or(u64::MAX)
    }

    async fn run(self: Arc<Self>) {
        let mut due_at = self.start + self.quanta;
        loop {
            while due_at > self.clock.now() {
                self.tick.when_next_tick().await;
            }

            let fired = {
                let mut state = self.state.lock();
                let floor = state.min_priority;
                let fired = state.timers.extract_due(floor);
                state.min_priority = floor + 1;
                fired
            };
            if let Some(handler) = &self.handler {
                for (timer, _) in fired {
                    fire(handler, timer);
                }
            }
            due_at += self.quanta;
        }
    }
}

/// Invoke `handler`, isolating a panic to this one item.
pub(crate) fn fire<T>(handler: &FireHandler<T>, item: T) {
    if catch_unwind(AssertUnwindSafe(|| handler(item))).is_err() {
        tracing::error!("timer fire handler panicked; continuing sweep");
    }
}

/// A set of timers swept once per quantum by a background task.
///
/// Must be created inside a tokio runtime. Dropping the set stops the sweep.
pub struct TimerSet<T>
where
    T: TimerItem,
{
    shared: Arc<Shared<T>>,
    task: JoinHandle<()>,
}

impl<T> TimerSet<T>
where
    T: TimerItem,
{
    /// Create a timer set whose clock starts now.
    pub fn new(options: TimerSetOptions, handler: Option<FireHandler<T>>) -> Self {
        let start = options.clock.now();
        Self::with_start(options, handler, start)
    }

    /// Create a timer set whose priority 0 begins at `start`.
    pub fn with_start(
        options: TimerSetOptions,
        handler: Option<FireHandler<T>>,
        start: Instant,
    ) -> Self {
        let tick = TickSource::starting_at(Self::effective_quanta(&options), start);
        Self::with_tick(options, handler, start, tick)
    }

    /// Create a timer set whose sweep waits on `tick`, which may be shared
    /// with other sets.
    pub fn with_tick(
        options: TimerSetOptions,
        handler: Option<FireHandler<T>>,
        start: Instant,
        tick: TickSource,
    ) -> Self {
        let quanta = Self::effective_quanta(&options);
        let shared = Arc::new(Shared {
            state: Mutex::new(TimerState {
                timers: RadixHeapSet::new(),
                min_priority: 0,
            }),
            handler,
            clock: options.clock,
            tick,
            start,
            quanta,
        });
        let task = tokio::spawn(Arc::clone(&shared).run());
        Self { shared, task }
    }

    pub(crate) fn effective_quanta(options: &TimerSetOptions) -> Duration {
        options.quanta.max(TimerSetOptions::MIN_QUANTA)
    }

    /// Width of one quantum.
    pub fn quanta(&self) -> Duration {
        self.shared.quanta
    }

    /// The tick source the sweep waits on.
    pub fn tick(&self) -> TickSource {
        self.shared.tick
    }

    /// Number of pending timers.
    pub fn count(&self) -> usize {
        self.shared.state.lock().timers.len()
    }

    /// The lowest priority that has not been swept yet.
    pub fn min_priority(&self) -> u64 {
        self.shared.state.lock().min_priority
    }

    /// Priority of the quantum containing `moment`.
    pub fn priority_of(&self, moment: Instant) -> u64 {
        self.shared.priority(moment)
    }

    /// Pending priority of `timer`, if scheduled.
    pub fn scheduled_priority(&self, timer: &T) -> Option<u64> {
        self.shared.state.lock().timers.priority_of(timer)
    }

    /// Schedule `timer` to fire at `moment`, replacing any earlier schedule.
    pub fn add_or_update(&self, timer: T, moment: Instant) {
        self.add_or_update_at(timer, self.shared.priority(moment));
    }

    /// Schedule `timer` at an explicit priority.
    pub fn add_or_update_at(&self, timer: T, priority: u64) {
        let mut state = self.state_for_write();
        let priority = priority.max(state.min_priority);
        state.timers.add_or_update(priority, timer);
    }

    /// Schedule `timer` at `moment` only if that is earlier than its current
    /// schedule. Returns whether it moved.
    pub fn add_or_update_to_earlier(&self, timer: T, moment: Instant) -> bool {
        self.add_or_update_to_earlier_at(timer, self.shared.priority(moment))
    }

    /// Priority-based variant of [`add_or_update_to_earlier`](Self::add_or_update_to_earlier).
    pub fn add_or_update_to_earlier_at(&self, timer: T, priority: u64) -> bool {
        let mut state = self.state_for_write();
        let priority = priority.max(state.min_priority);
        state.timers.add_or_update_to_lower(priority, timer)
    }

    /// Schedule `timer` at `moment` only if that is later than its current
    /// schedule. Returns whether it moved.
    pub fn add_or_update_to_later(&self, timer: T, moment: Instant) -> bool {
        self.add_or_update_to_later_at(timer, self.shared.priority(moment))
    }

    /// Priority-based variant of [`add_or_update_to_later`](Self::add_or_update_to_later).
    pub fn add_or_update_to_later_at(&self, timer: T, priority: u64) -> bool {
        let mut state = self.state_for_write();
        let priority = priority.max(state.min_priority);
        state.timers.add_or_update_to_higher(priority, timer)
    }

    /// Cancel `timer`. Returns whether it was scheduled.
    pub fn remove(&self, timer: &T) -> bool {
        self.shared.state.lock().timers.remove(timer).is_some()
    }

    /// Stop the background sweep. Pending timers never fire.
    pub fn dispose(&self) {
        self.task.abort();
    }

    fn state_for_write(&self) -> parking_lot::MutexGuard<'_, TimerState<T>> {
        self.shared.state.lock()
    }
}

impl<T> Drop for TimerSet<T>
where
    T: TimerItem,
{
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl<T> std::fmt::Debug for TimerSet<T>
where
    T: TimerItem,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerSet")
            .field("quanta", &self.shared.quanta)
            .field("count", &self.count())
            .finish()
    }
}
