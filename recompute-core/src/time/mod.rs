//! Timers
//!
//! Batched timer wheels used for keep-alive expiration and delayed
//! invalidation.
//!
//! - [`RadixHeapSet`]: the monotone bucketed priority queue.
//! - [`TimerSet`]: a radix heap swept once per time quantum.
//! - [`ConcurrentTimerSet`]: `C` timer sets sharded by item hash.
//! - [`FixedTimerSet`]: FIFO variant where every item has the same delay.
//!
//! All sweeps wait on a shared [`TickSource`] so their wake-ups coalesce.

mod clock;
mod concurrent;
mod fixed;
mod radix_heap;
mod tick;
mod timer_set;

pub use clock::{default_clock, Clock, MonotonicClock, SharedClock};
pub use concurrent::ConcurrentTimerSet;
pub use fixed::FixedTimerSet;
pub use radix_heap::RadixHeapSet;
pub use tick::TickSource;
pub use timer_set::{FireHandler, TimerItem, TimerSet, TimerSetOptions};
