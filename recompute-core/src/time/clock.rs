//! Clocks
//!
//! Timers quantize time through a [`Clock`]. The default clock reads
//! `tokio::time::Instant`, which makes every timer in the crate follow
//! tokio's paused time in tests.

use std::fmt::Debug;
use std::sync::Arc;

use tokio::time::Instant;

/// A source of the current moment.
///
/// Implementations may be coarse (cheap, cached) or precise; the timer wheel
/// only needs monotonicity within one quantum.
pub trait Clock: Debug + Send + Sync + 'static {
    /// The current moment.
    fn now(&self) -> Instant;
}

/// Monotonic clock backed by `tokio::time::Instant::now`.
#[derive(Debug, Clone, Copy, Default)]
pub struct MonotonicClock;

impl Clock for MonotonicClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Shared clock handle.
pub type SharedClock = Arc<dyn Clock>;

/// The default shared clock.
pub fn default_clock() -> SharedClock {
    Arc::new(MonotonicClock)
}
