//! Reactive Memoization
//!
//! This module implements the memoization engine: computed nodes, the
//! functions and sources that produce them, and the mutable states they read.
//!
//! # Concepts
//!
//! ## Computed Nodes
//!
//! A [`Computed`] holds the write-once output of one computation for one
//! input. It starts out `Computing`, becomes `Consistent` once its output is
//! set, and ends `Invalidated`. An invalidated node never comes back: the
//! next read produces a new node.
//!
//! ## Functions
//!
//! A [`ComputeFunction`] memoizes an async body by input. Concurrent callers
//! asking for the same input share one execution. Every node read while the
//! body runs becomes a dependency of the node being computed.
//!
//! ## Sources and States
//!
//! A [`ComputedSource`] is a memoized computation owned by a single value
//! rather than keyed by input. A [`MutableState`] is a value set by
//! application code; setting it invalidates everything computed from it.
//!
//! # Implementation Notes
//!
//! Dependency tracking uses an explicit [`ComputeContext`] passed to every
//! body, not ambient thread-local state, so tracking survives `.await`
//! points and task hops. Invalidation is lazy: a dependant is re-checked
//! against its dependencies when it is next read, never walked eagerly.

mod computed;
mod context;
mod function;
mod handlers;
mod hub;
mod input;
mod lock;
mod options;
mod source;
mod state;

pub use computed::{downcast_computed, AnyComputed, Computed, ComputedCore, ConsistencyState, InvalidationSource};
pub use context::{capture, CallOptions, ComputeContext};
pub use function::ComputeFunction;
pub use handlers::{HandlerId, InvalidatedHandler, InvalidatedHandlerSet};
pub use hub::{Hub, HubOptions};
pub use input::{ComputedInput, InputKey, MethodInput, ServiceInstance};
pub use lock::AsyncLockSet;
pub use options::{CancellationReprocessingOptions, ComputedOptions, RetryDelaySeq};
pub use source::{ComputedSource, SourceKey};
pub use state::{MutableState, StateKey};

pub(crate) use hub::HubInner;
