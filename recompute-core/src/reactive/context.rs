//! Compute Context
//!
//! The compute context travels with every call into a memoized function.
//! It answers three questions for the callee:
//!
//! - Which node, if any, is computing right now? Whatever the callee returns
//!   is recorded as a dependency of that node.
//! - What do the call options ask for? Plain reuse-or-compute, peek at an
//!   existing node, invalidate it, or capture it.
//! - Which inputs are already locked further up this call chain? Locking one
//!   of them again would deadlock, so it is reported as an error instead.
//!
//! # Implementation
//!
//! The context is an explicit, cheaply clonable value. Computation bodies
//! receive their own context (bound to the node being computed) and pass it
//! on to the nested calls they make, so dependency tracking works across
//! `.await` points and thread hops without any thread-local state.
//!
//! Lock lineage is the one exception. While a body runs, its lineage is
//! also kept in a tokio task-local, so a nested call made with a fresh
//! top-level context still sees which inputs the enclosing computations
//! hold and fails with [`Error::LockReentry`] instead of deadlocking.

use std::fmt;
use std::future::Future;
use std::ops::BitOr;
use std::sync::Arc;

use parking_lot::Mutex;

use super::computed::{downcast_computed, AnyComputed, Computed, InvalidationSource};
use super::input::InputKey;
use crate::error::{Error, Result};

/// Flags that change what a call does.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct CallOptions(u8);

impl CallOptions {
    /// Reuse or compute.
    pub const NONE: Self = Self(0);
    /// Return the existing node, never compute.
    pub const GET_EXISTING: Self = Self(1);
    /// Record the node the call resolves to.
    pub const CAPTURE: Self = Self(1 << 1);
    /// Invalidate the existing node. Implies `GET_EXISTING`.
    pub const INVALIDATE: Self = Self(1 << 2 | 1);

    /// Whether every flag of `other` is set.
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Whether no flag is set.
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for CallOptions {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl fmt::Display for CallOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("None");
        }
        let mut names = Vec::with_capacity(3);
        if self.contains(Self::INVALIDATE) {
            names.push("Invalidate");
        } else if self.contains(Self::GET_EXISTING) {
            names.push("GetExisting");
        }
        if self.contains(Self::CAPTURE) {
            names.push("Capture");
        }
        f.write_str(&names.join(" | "))
    }
}

impl fmt::Debug for CallOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CallOptions({self})")
    }
}

/// Inputs locked by the current call chain, innermost first.
#[derive(Debug)]
pub(crate) struct Lineage {
    key: InputKey,
    parent: Option<Arc<Lineage>>,
}

impl Lineage {
    pub(crate) fn contains(&self, key: &InputKey) -> bool {
        let mut current = Some(self);
        while let Some(lineage) = current {
            if lineage.key == *key {
                return true;
            }
            current = lineage.parent.as_deref();
        }
        false
    }
}

tokio::task_local! {
    static ACTIVE_LINEAGE: Arc<Lineage>;
}

fn active_lineage() -> Option<Arc<Lineage>> {
    ACTIVE_LINEAGE.try_with(Arc::clone).ok()
}

type CaptureSlot = Arc<Mutex<Option<Arc<dyn AnyComputed>>>>;

/// What a read decided after looking at the existing node.
pub(crate) enum Decision<T> {
    /// Return this node.
    Use(Arc<Computed<T>>),
    /// `GET_EXISTING` found nothing.
    Missing,
    /// Run the computation.
    Compute,
}

/// The ambient state of one call.
#[derive(Clone, Default)]
pub struct ComputeContext {
    call_options: CallOptions,
    computing: Option<Arc<dyn AnyComputed>>,
    capture: Option<CaptureSlot>,
    lineage: Option<Arc<Lineage>>,
}

impl ComputeContext {
    /// A top-level context: reuse or compute, no dependency tracking.
    ///
    /// Called from inside a computation body, it records no dependency on
    /// the enclosing node, but reentry into an input that node holds is
    /// still reported as [`Error::LockReentry`].
    pub fn new() -> Self {
        Self::default()
    }

    /// A top-level context with the given call options.
    pub fn with_call_options(call_options: CallOptions) -> Self {
        let capture = call_options
            .contains(CallOptions::CAPTURE)
            .then(CaptureSlot::default);
        Self {
            call_options,
            capture,
            ..Self::default()
        }
    }

    /// Reuse or compute, and capture the resulting node.
    pub fn capture() -> Self {
        Self::with_call_options(CallOptions::CAPTURE)
    }

    /// Capture the existing node without computing.
    pub fn capture_existing() -> Self {
        Self::with_call_options(CallOptions::GET_EXISTING | CallOptions::CAPTURE)
    }

    /// Invalidate the existing node without computing.
    pub fn invalidating() -> Self {
        Self::with_call_options(CallOptions::INVALIDATE)
    }

    /// The context handed to the body computing `node`.
    pub(crate) fn for_computation(&self, node: Arc<dyn AnyComputed>) -> Self {
        let lineage = Arc::new(Lineage {
            key: node.core().input().clone(),
            parent: self.effective_lineage(),
        });
        Self {
            call_options: CallOptions::NONE,
            computing: Some(node),
            capture: None,
            lineage: Some(lineage),
        }
    }

    /// Call options of this context.
    pub fn call_options(&self) -> CallOptions {
        self.call_options
    }

    /// The node being computed, if any.
    pub fn computing(&self) -> Option<&Arc<dyn AnyComputed>> {
        self.computing.as_ref()
    }

    /// This context's lineage, or the one of the computation whose body is
    /// running on the current task.
    pub(crate) fn effective_lineage(&self) -> Option<Arc<Lineage>> {
        self.lineage.clone().or_else(active_lineage)
    }

    /// Run `future` with this context's lineage visible to nested calls
    /// that do not carry it themselves.
    pub(crate) async fn run_in_lineage<F>(&self, future: F) -> F::Output
    where
        F: Future,
    {
        match &self.lineage {
            Some(lineage) => ACTIVE_LINEAGE.scope(lineage.clone(), future).await,
            None => future.await,
        }
    }

    /// The captured node, type-erased.
    pub fn captured_untyped(&self) -> Option<Arc<dyn AnyComputed>> {
        self.capture.as_ref().and_then(|slot| slot.lock().clone())
    }

    /// The captured node, if it is a `Computed<T>`.
    pub fn captured<T>(&self) -> Option<Arc<Computed<T>>>
    where
        T: Clone + Send + Sync + 'static,
    {
        self.captured_untyped().and_then(downcast_computed::<T>)
    }

    fn try_capture(&self, node: Arc<dyn AnyComputed>) {
        if let Some(slot) = &self.capture {
            *slot.lock() = Some(node);
        }
    }

    /// Decide whether `existing` can serve this call before taking the
    /// input lock.
    pub(crate) fn try_use_existing<T>(&self, existing: Option<Arc<Computed<T>>>) -> Result<Decision<T>>
    where
        T: Clone + Send + Sync + 'static,
    {
        let call_options = self.call_options;
        if call_options.is_empty() {
            return Ok(match existing {
                Some(existing) if existing.is_up_to_date() => {
                    if let Some(computing) = &self.computing {
                        computing.core().add_dependency(existing.core())?;
                    }
                    existing.core().renew_timeouts();
                    Decision::Use(existing)
                }
                _ => Decision::Compute,
            });
        }

        let get_existing = call_options.contains(CallOptions::GET_EXISTING);
        let Some(existing) = existing else {
            return Ok(if get_existing {
                Decision::Missing
            } else {
                Decision::Compute
            });
        };

        if call_options.contains(CallOptions::INVALIDATE) {
            existing
                .core()
                .invalidate_with(true, InvalidationSource::CallOptions);
            self.try_capture(existing.clone());
            return Ok(Decision::Use(existing));
        }
        if get_existing {
            self.try_capture(existing.clone());
            existing.core().renew_timeouts();
            return Ok(Decision::Use(existing));
        }

        // Capture only.
        if !existing.is_up_to_date() {
            return Ok(Decision::Compute);
        }
        self.use_new(&existing)?;
        Ok(Decision::Use(existing))
    }

    /// Re-check `existing` once the input lock is held.
    pub(crate) fn try_use_existing_from_lock<T>(
        &self,
        existing: Option<Arc<Computed<T>>>,
    ) -> Result<Decision<T>>
    where
        T: Clone + Send + Sync + 'static,
    {
        match existing {
            Some(existing) if existing.is_up_to_date() => {
                self.use_new(&existing)?;
                Ok(Decision::Use(existing))
            }
            _ => Ok(Decision::Compute),
        }
    }

    /// Record a node the call resolved to: dependency edge, keep-alive
    /// renewal, capture.
    pub(crate) fn use_new<T>(&self, node: &Arc<Computed<T>>) -> Result<()>
    where
        T: Clone + Send + Sync + 'static,
    {
        if let Some(computing) = &self.computing {
            computing.core().add_dependency(node.core())?;
        }
        node.core().renew_timeouts();
        self.try_capture(node.clone());
        Ok(())
    }

    /// Fail unless this context may compute.
    pub(crate) fn ensure_may_compute(&self) -> Result<()> {
        if self.call_options.contains(CallOptions::GET_EXISTING) {
            return Err(Error::InvalidCallOptions(self.call_options));
        }
        Ok(())
    }
}

impl fmt::Debug for ComputeContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComputeContext")
            .field("call_options", &self.call_options)
            .field("computing", &self.computing.as_ref().map(|node| node.core().input()))
            .finish()
    }
}

/// Run `call` with a capturing context and return the node it resolved to.
///
/// If `call` fails but a failed node was captured, the node is returned so
/// that the caller can observe the memoized error.
pub async fn capture<T, R, F, Fut>(call: F) -> Result<Option<Arc<Computed<T>>>>
where
    T: Clone + Send + Sync + 'static,
    F: FnOnce(ComputeContext) -> Fut,
    Fut: Future<Output = Result<R>>,
{
    let context = ComputeContext::capture();
    match call(context.clone()).await {
        Ok(_) => Ok(context.captured::<T>()),
        Err(error) => match context.captured::<T>() {
            Some(captured) if captured.error().is_some() => Ok(Some(captured)),
            _ => Err(error),
        },
    }
}
