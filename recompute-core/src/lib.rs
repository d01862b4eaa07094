//! Recompute Core
//!
//! This crate provides an in-process reactive memoization engine. It
//! implements:
//!
//! - Memoized async functions with single-flight computation per input
//! - Automatic dependency capture through an explicit compute context
//! - Lazy invalidation that propagates to dependants on their next read
//! - Batched timer wheels for delayed invalidation and keep-alive expiry
//! - A background pruner that keeps the dependency graph bounded
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - `reactive`: computed nodes, functions, sources, states and the hub
//! - `graph`: node arena, input registry and graph pruner
//! - `time`: radix heap and the timer sets built on it
//! - `metrics`: counters exposed by each hub
//! - `error`: the error type shared by every operation
//!
//! # Example
//!
//! ```rust,ignore
//! use recompute_core::{ComputeContext, Hub, HubOptions};
//! use tokio_util::sync::CancellationToken;
//!
//! let hub = Hub::new(HubOptions::default());
//! let count = hub.state(2u64);
//!
//! let square = hub.function({
//!     let count = count.clone();
//!     move |offset: u64, ctx: ComputeContext, _ct| {
//!         let count = count.clone();
//!         async move { Ok(count.use_value(&ctx)?.pow(2) + offset) }
//!     }
//! });
//!
//! let ct = CancellationToken::new();
//! assert_eq!(square.call(1, &ComputeContext::new(), &ct).await?, 5);
//!
//! // The cached node is invalidated by the change and recomputed on read.
//! count.set(3);
//! assert_eq!(square.call(1, &ComputeContext::new(), &ct).await?, 10);
//! ```

pub mod error;
pub mod graph;
pub mod metrics;
pub mod reactive;
pub mod time;

pub use error::{Error, Result, SharedError};
pub use graph::{GraphPrunerOptions, PruneReport};
pub use metrics::{HubMetrics, MetricsSnapshot};
pub use reactive::{
    capture, CallOptions, CancellationReprocessingOptions, ComputeContext, ComputeFunction, Computed,
    ComputedInput, ComputedOptions, ComputedSource, ConsistencyState, Hub, HubOptions, InvalidationSource,
    MethodInput, MutableState, ServiceInstance,
};
