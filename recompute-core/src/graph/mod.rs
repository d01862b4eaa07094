//! Dependency Graph
//!
//! Storage and upkeep of computed nodes.
//!
//! # Overview
//!
//! - [`NodeArena`] owns every node and hands out generation-checked
//!   [`NodeHandle`]s. Edges between nodes are stored as handles, so a node
//!   never keeps its dependants alive and a stale handle simply resolves to
//!   nothing.
//! - [`ComputedRegistry`] maps each input to the handle of its current node,
//!   and owns the per-input locks that make computation single-flight.
//! - [`GraphPruner`] periodically drops dead edges, invalidates nodes of
//!   disposed instances, and frees the slots of invalidated nodes.
//!
//! # Design Decisions
//!
//! 1. Nodes are sharded across the arena by handle index, so lookups from
//!    different tasks rarely contend on the same lock.
//!
//! 2. The registry only ever points at the newest version of an input: a
//!    registration with an older version is ignored.

mod arena;
pub(crate) mod pruner;
mod registry;

pub use arena::{NodeArena, NodeHandle};
pub use pruner::{GraphPruner, GraphPrunerOptions, PruneReport};
pub use registry::ComputedRegistry;
