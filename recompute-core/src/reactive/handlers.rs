//! Invalidation Handlers
//!
//! Callbacks attached to a node that run once when it becomes invalidated.
//!
//! Most nodes never get a handler, and most of the rest get exactly one, so
//! the set is an enum that only allocates a vector from the third handler on.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use smallvec::SmallVec;

use super::computed::ComputedCore;

/// Identifier returned when a handler is attached, used to detach it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

impl HandlerId {
    /// Generate a new unique handler ID.
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for HandlerId {
    fn default() -> Self {
        Self::new()
    }
}

/// Callback invoked with the invalidated node.
pub type InvalidatedHandler = Arc<dyn Fn(&ComputedCore) + Send + Sync>;

/// A small set of invalidation handlers.
#[derive(Default)]
pub enum InvalidatedHandlerSet {
    /// No handlers.
    #[default]
    Empty,
    /// Exactly one handler.
    One(HandlerId, InvalidatedHandler),
    /// Two or more handlers.
    Many(SmallVec<[(HandlerId, InvalidatedHandler); 2]>),
}

impl InvalidatedHandlerSet {
    /// Number of attached handlers.
    pub fn len(&self) -> usize {
        match self {
            Self::Empty => 0,
            Self::One(..) => 1,
            Self::Many(handlers) => handlers.len(),
        }
    }

    /// Whether no handler is attached.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Attach a handler.
    pub fn add(&mut self, handler: InvalidatedHandler) -> HandlerId {
        let id = HandlerId::new();
        *self = match std::mem::take(self) {
            Self::Empty => Self::One(id, handler),
            Self::One(first_id, first) => {
                let mut handlers = SmallVec::new();
                handlers.push((first_id, first));
                handlers.push((id, handler));
                Self::Many(handlers)
            }
            Self::Many(mut handlers) => {
                handlers.push((id, handler));
                Self::Many(handlers)
            }
        };
        id
    }

    /// Detach a handler. Returns `false` if it was not attached.
    pub fn remove(&mut self, id: HandlerId) -> bool {
        match self {
            Self::Empty => false,
            Self::One(existing, _) => {
                if *existing != id {
                    return false;
                }
                *self = Self::Empty;
                true
            }
            Self::Many(handlers) => {
                let before = handlers.len();
                handlers.retain(|(existing, _)| *existing != id);
                let removed = handlers.len() != before;
                if handlers.is_empty() {
                    *self = Self::Empty;
                }
                removed
            }
        }
    }

    /// Invoke every handler in attachment order.
    ///
    /// A panicking handler is logged and does not stop the others.
    pub fn invoke(&self, node: &ComputedCore) {
        match self {
            Self::Empty => {}
            Self::One(_, handler) => invoke_one(handler, node),
            Self::Many(handlers) => {
                for (_, handler) in handlers {
                    invoke_one(handler, node);
                }
            }
        }
    }
}

fn invoke_one(handler: &InvalidatedHandler, node: &ComputedCore) {
    if catch_unwind(AssertUnwindSafe(|| handler(node))).is_err() {
        tracing::error!(input = %node.input(), "invalidation handler panicked");
    }
}

impl fmt::Debug for InvalidatedHandlerSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InvalidatedHandlerSet")
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> InvalidatedHandler {
        Arc::new(|_: &ComputedCore| {})
    }

    #[test]
    fn handler_ids_are_unique() {
        assert_ne!(HandlerId::new(), HandlerId::new());
    }

    #[test]
    fn grows_and_shrinks_between_shapes() {
        let mut set = InvalidatedHandlerSet::default();
        assert!(set.is_empty());

        let a = set.add(noop());
        assert!(matches!(set, InvalidatedHandlerSet::One(..)));

        let b = set.add(noop());
        let c = set.add(noop());
        assert_eq!(set.len(), 3);

        assert!(set.remove(b));
        assert!(!set.remove(b));
        assert_eq!(set.len(), 2);

        assert!(set.remove(a));
        assert!(set.remove(c));
        assert!(matches!(set, InvalidatedHandlerSet::Empty));
    }

    #[test]
    fn removing_unknown_handler_is_a_no_op() {
        let mut set = InvalidatedHandlerSet::default();
        set.add(noop());
        assert!(!set.remove(HandlerId::new()));
        assert_eq!(set.len(), 1);
    }
}
