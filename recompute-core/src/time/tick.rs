//! Tick Source
//!
//! A shared low-resolution tick. Every waiter sleeps until the next boundary
//! of the same aligned grid, so hundreds of sweeps waiting on one source wake
//! together instead of each arming its own timer at a slightly different
//! moment.

use std::time::Duration;

use tokio::time::Instant;

/// Coalescing tick source with a fixed period.
#[derive(Debug, Clone, Copy)]
pub struct TickSource {
    period: Duration,
    origin: Instant,
}

impl TickSource {
    /// Create a tick source aligned to the current moment.
    ///
    /// Periods shorter than one millisecond are rounded up.
    pub fn new(period: Duration) -> Self {
        Self::starting_at(period, Instant::now())
    }

    /// Create a tick source whose boundaries are `origin + k * period`.
    pub fn starting_at(period: Duration, origin: Instant) -> Self {
        Self {
            period: period.max(Duration::from_millis(1)),
            origin,
        }
    }

    /// The moment the grid is aligned to.
    pub fn origin(&self) -> Instant {
        self.origin
    }

    /// The tick period.
    pub fn period(&self) -> Duration {
        self.period
    }

    /// The first tick boundary strictly after `now`.
    pub fn next_tick_after(&self, now: Instant) -> Instant {
        let elapsed = now.saturating_duration_since(self.origin).as_nanos();
        let period = self.period.as_nanos();
        let ticks = elapsed / period + 1;
        self.origin + nanos(ticks * period)
    }

    /// Sleep until the next tick boundary.
    pub async fn when_next_tick(&self) {
        tokio::time::sleep_until(self.next_tick_after(Instant::now())).await;
    }
}

impl Default for TickSource {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}

fn nanos(value: u128) -> Duration {
    Duration::from_nanos(u64::try_from(value).unwrap_or(u64::MAX))
}
