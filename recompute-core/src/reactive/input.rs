//! Computed Inputs
//!
//! An input is the identity of a computation: two inputs that compare equal
//! always map to the same registry slot. Collaborators define their own input
//! types by implementing [`ComputedInput`]; the engine stores them behind the
//! type-erased, cheaply clonable [`InputKey`].

use std::any::{Any, TypeId};
use std::collections::hash_map::DefaultHasher;
use std::fmt::{self, Debug, Display};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// The identity of a memoized computation.
pub trait ComputedInput: Hash + Eq + Debug + Send + Sync + 'static {
    /// Short label used in logs.
    fn category(&self) -> &str {
        std::any::type_name::<Self>()
    }

    /// Whether the instance owning this input has been disposed.
    ///
    /// The graph pruner invalidates consistent nodes of disposed inputs.
    fn is_disposed(&self) -> bool {
        false
    }
}

trait DynInput: Send + Sync {
    fn as_any(&self) -> &dyn Any;
    fn dyn_eq(&self, other: &dyn DynInput) -> bool;
    fn category(&self) -> &str;
    fn is_disposed(&self) -> bool;
    fn fmt_debug(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result;
}

impl<I> DynInput for I
where
    I: ComputedInput,
{
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn dyn_eq(&self, other: &dyn DynInput) -> bool {
        other.as_any().downcast_ref::<I>() == Some(self)
    }

    fn category(&self) -> &str {
        ComputedInput::category(self)
    }

    fn is_disposed(&self) -> bool {
        ComputedInput::is_disposed(self)
    }

    fn fmt_debug(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Debug::fmt(self, f)
    }
}

/// Type-erased input. Hash is computed once on construction.
#[derive(Clone)]
pub struct InputKey {
    input: Arc<dyn DynInput>,
    hash: u64,
}

impl InputKey {
    /// Erase `input`.
    pub fn new<I>(input: I) -> Self
    where
        I: ComputedInput,
    {
        let mut hasher = DefaultHasher::new();
        TypeId::of::<I>().hash(&mut hasher);
        input.hash(&mut hasher);
        Self {
            hash: hasher.finish(),
            input: Arc::new(input),
        }
    }

    /// Borrow the original input if it is an `I`.
    pub fn downcast_ref<I>(&self) -> Option<&I>
    where
        I: ComputedInput,
    {
        self.input.as_any().downcast_ref::<I>()
    }

    /// Short label used in logs.
    pub fn category(&self) -> &str {
        self.input.category()
    }

    /// Whether the owning instance has been disposed.
    pub fn is_disposed(&self) -> bool {
        self.input.is_disposed()
    }

    /// The precomputed hash.
    pub fn hash_code(&self) -> u64 {
        self.hash
    }
}

impl PartialEq for InputKey {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash
            && (Arc::ptr_eq(&self.input, &other.input) || self.input.dyn_eq(other.input.as_ref()))
    }
}

impl Eq for InputKey {}

impl Hash for InputKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.hash);
    }
}

impl Debug for InputKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.input.fmt_debug(f)
    }
}

impl Display for InputKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.input.fmt_debug(f)
    }
}

struct ServiceInner {
    id: u64,
    name: String,
    disposed: AtomicBool,
}

/// Handle to a long-lived collaborator instance whose computations should
/// be invalidated once it is disposed.
///
/// Clones share the disposal flag. Equality is by instance, not by name.
#[derive(Clone)]
pub struct ServiceInstance {
    inner: Arc<ServiceInner>,
}

impl ServiceInstance {
    /// Create a live instance.
    pub fn new(name: impl Into<String>) -> Self {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);
        Self {
            inner: Arc::new(ServiceInner {
                id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
                name: name.into(),
                disposed: AtomicBool::new(false),
            }),
        }
    }

    /// Instance name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Mark the instance disposed. The pruner picks this up on its next sweep.
    pub fn dispose(&self) {
        self.inner.disposed.store(true, Ordering::Release);
    }

    /// Whether [`dispose`](Self::dispose) was called.
    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::Acquire)
    }
}

impl PartialEq for ServiceInstance {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for ServiceInstance {}

impl Hash for ServiceInstance {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.inner.id.hash(state);
    }
}

impl Debug for ServiceInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.inner.name, self.inner.id)
    }
}

/// The common `(service, method, arguments)` input.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct MethodInput<A> {
    /// Owning instance.
    pub service: ServiceInstance,
    /// Method name.
    pub method: &'static str,
    /// Call arguments.
    pub args: A,
}

impl<A> MethodInput<A> {
    /// Build an input for `service.method(args)`.
    pub fn new(service: &ServiceInstance, method: &'static str, args: A) -> Self {
        Self {
            service: service.clone(),
            method,
            args,
        }
    }
}

impl<A> Debug for MethodInput<A>
where
    A: Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}.{}{:?}", self.service, self.method, self.args)
    }
}

impl<A> ComputedInput for MethodInput<A>
where
    A: Hash + Eq + Debug + Send + Sync + 'static,
{
    fn category(&self) -> &str {
        self.method
    }

    fn is_disposed(&self) -> bool {
        self.service.is_disposed()
    }
}
