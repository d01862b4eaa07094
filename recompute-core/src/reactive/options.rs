//! Computed Options
//!
//! Per-node timing configuration: keep-alive, auto-invalidation, delayed
//! invalidation and the retry budget for internally cancelled computations.
//! Every option struct derives `serde` so the whole configuration can be
//! loaded from JSON through [`HubOptions::from_json`](crate::HubOptions::from_json).

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Timing configuration of the nodes produced by one function, source or state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ComputedOptions {
    /// Keep-alive window renewed on every use. `None` keeps the node until
    /// it is invalidated.
    pub min_cache_duration: Option<Duration>,

    /// Invalidate a successful result this long after it was produced.
    /// `None` disables auto-invalidation.
    pub auto_invalidation_delay: Option<Duration>,

    /// Auto-invalidation delay for transient errors.
    pub transient_error_invalidation_delay: Option<Duration>,

    /// Auto-invalidation delay for terminal errors.
    pub error_invalidation_delay: Option<Duration>,

    /// Delay applied to non-immediate invalidation requests.
    pub invalidation_delay: Duration,

    /// Retry budget for internally cancelled computations.
    pub cancellation_reprocessing: CancellationReprocessingOptions,
}

impl ComputedOptions {
    /// Options used by [`MutableState`](crate::MutableState): errors set by
    /// the owner stay until the next set.
    pub fn mutable_state() -> Self {
        Self {
            transient_error_invalidation_delay: None,
            error_invalidation_delay: None,
            ..Self::default()
        }
    }

    /// Effective auto-invalidation delay for an output.
    ///
    /// Errors never outlive a successful result with the same options.
    pub fn auto_invalidation_delay_for(&self, error: Option<&crate::Error>) -> Option<Duration> {
        let error_delay = match error {
            None => return self.auto_invalidation_delay,
            Some(error) if error.is_transient() => self.transient_error_invalidation_delay,
            Some(_) => self.error_invalidation_delay,
        };
        match (error_delay, self.auto_invalidation_delay) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }
}

impl Default for ComputedOptions {
    fn default() -> Self {
        Self {
            min_cache_duration: None,
            auto_invalidation_delay: None,
            transient_error_invalidation_delay: Some(Duration::from_secs(1)),
            error_invalidation_delay: Some(Duration::from_secs(30)),
            invalidation_delay: Duration::ZERO,
            cancellation_reprocessing: CancellationReprocessingOptions::default(),
        }
    }
}

/// How many times, and for how long, an internally cancelled computation is
/// retried before its cancellation becomes the node's output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CancellationReprocessingOptions {
    /// Total attempts, including the first one.
    pub max_try_count: u32,
    /// Retries stop once this much time has passed since the first attempt.
    pub max_duration: Duration,
    /// Delay before each retry.
    pub retry_delays: RetryDelaySeq,
}

impl CancellationReprocessingOptions {
    /// Whether another attempt is allowed after `failed_tries` failures.
    pub fn allows_retry(&self, failed_tries: u32, elapsed: Duration) -> bool {
        failed_tries < self.max_try_count && elapsed <= self.max_duration
    }
}

impl Default for CancellationReprocessingOptions {
    fn default() -> Self {
        Self {
            max_try_count: 3,
            max_duration: Duration::from_secs(30),
            retry_delays: RetryDelaySeq::exp(Duration::from_millis(50), Duration::from_secs(1)),
        }
    }
}

/// Exponential delay sequence: `min * 2^(n - 1)`, capped at `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryDelaySeq {
    /// Delay before the first retry.
    pub min: Duration,
    /// Upper bound for any delay.
    pub max: Duration,
}

impl RetryDelaySeq {
    /// Exponential sequence between `min` and `max`.
    pub fn exp(min: Duration, max: Duration) -> Self {
        Self { min, max: max.max(min) }
    }

    /// No delay between retries.
    pub fn none() -> Self {
        Self::exp(Duration::ZERO, Duration::ZERO)
    }

    /// Delay before retry number `try_index` (1-based).
    pub fn delay(&self, try_index: u32) -> Duration {
        let shift = try_index.saturating_sub(1).min(31);
        self.min
            .checked_mul(1u32 << shift)
            .unwrap_or(self.max)
            .min(self.max)
    }
}

impl Default for RetryDelaySeq {
    fn default() -> Self {
        Self::exp(Duration::from_millis(50), Duration::from_secs(1))
    }
}
