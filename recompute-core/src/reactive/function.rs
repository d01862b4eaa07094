//! Compute Functions
//!
//! A [`ComputeFunction`] memoizes an async function of one input. Every call
//! goes through the same single-flight routine, which is shared with
//! [`ComputedSource`](crate::ComputedSource):
//!
//! 1. Ask the context whether the current node can be reused.
//! 2. Otherwise take the input's async lock and ask again: another caller
//!    may have finished the computation while we waited.
//! 3. Still nothing: create a `Computing` node and run the body with a
//!    context bound to that node, so every nested read becomes a dependency.
//! 4. Store the output (errors are memoized too), publish the node and
//!    release the lock.
//!
//! A body that reports [`Error::Cancelled`] while the caller's token is
//! still live was cancelled internally. That attempt is invalidated and the
//! body is retried under the same lock, within the configured budget.

use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::computed::{Computed, InvalidationSource};
use super::context::{ComputeContext, Decision};
use super::hub::HubInner;
use super::input::{ComputedInput, InputKey};
use super::options::ComputedOptions;
use crate::error::{Error, Result};
use crate::graph::ComputedRegistry;

type Body<I, T> = Arc<dyn Fn(I, ComputeContext, CancellationToken) -> BoxFuture<'static, Result<T>> + Send + Sync>;

/// Where the current node of an input lives.
pub(crate) trait NodeSlot<T>: Send + Sync {
    /// The current node, if any.
    fn current(&self) -> Option<Arc<Computed<T>>>;
    /// Make `node` the current node.
    fn publish(&self, node: &Arc<Computed<T>>);
}

struct RegistrySlot<'a, T> {
    registry: &'a ComputedRegistry,
    key: &'a InputKey,
    _value: PhantomData<fn() -> T>,
}

impl<T> NodeSlot<T> for RegistrySlot<'_, T>
where
    T: Clone + Send + Sync + 'static,
{
    fn current(&self) -> Option<Arc<Computed<T>>> {
        self.registry.get::<T>(self.key)
    }

    fn publish(&self, node: &Arc<Computed<T>>) {
        self.registry.register(node.as_ref());
    }
}

/// Invalidates and cancels a node that is dropped while still computing,
/// e.g. when the caller's future is dropped mid-computation.
struct ComputingGuard<T>(Arc<Computed<T>>)
where
    T: Clone + Send + Sync + 'static;

impl<T> Drop for ComputingGuard<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn drop(&mut self) {
        if self.0.state() == super::ConsistencyState::Computing {
            self.0
                .core()
                .invalidate_with(true, InvalidationSource::Cancelled);
            self.0.try_set_output(Err(Error::Cancelled));
        }
    }
}

/// Reuse the current node of `key` or compute a new one, at most one
/// computation per input at a time.
///
/// Returns `None` only for `GET_EXISTING` calls that found nothing.
pub(crate) async fn get_or_produce<T, S, F>(
    hub: &Arc<HubInner>,
    key: &InputKey,
    options: &Arc<ComputedOptions>,
    slot: &S,
    context: &ComputeContext,
    cancellation: &CancellationToken,
    body: F,
) -> Result<Option<Arc<Computed<T>>>>
where
    T: Clone + Send + Sync + 'static,
    S: NodeSlot<T>,
    F: Fn(ComputeContext) -> BoxFuture<'static, Result<T>>,
{
    match context.try_use_existing(slot.current())? {
        Decision::Use(node) => return Ok(Some(node)),
        Decision::Missing => return Ok(None),
        Decision::Compute => {}
    }

    let lock = hub
        .registry()
        .input_locks()
        .lock(key, context.effective_lineage().as_deref(), cancellation)
        .await?;
    if let Decision::Use(node) = context.try_use_existing_from_lock(slot.current())? {
        return Ok(Some(node));
    }
    if key.is_disposed() {
        return Err(Error::InputDisposed {
            input: key.to_string(),
        });
    }

    let node = compute(hub, key, options, context, cancellation, &body).await?;
    slot.publish(&node);
    drop(lock);

    context.use_new(&node)?;
    Ok(Some(node))
}

async fn compute<T, F>(
    hub: &Arc<HubInner>,
    key: &InputKey,
    options: &Arc<ComputedOptions>,
    context: &ComputeContext,
    cancellation: &CancellationToken,
    body: &F,
) -> Result<Arc<Computed<T>>>
where
    T: Clone + Send + Sync + 'static,
    F: Fn(ComputeContext) -> BoxFuture<'static, Result<T>>,
{
    let reprocessing = &options.cancellation_reprocessing;
    let started = Instant::now();
    let mut failed_tries = 0u32;
    loop {
        let node = Computed::<T>::new(hub, key.clone(), options.clone());
        let _guard = ComputingGuard(node.clone());
        hub.metrics().record_computation();
        tracing::trace!(input = %key, version = node.version(), "computing");

        let body_context = context.for_computation(node.clone());
        let result = tokio::select! {
            biased;
            _ = cancellation.cancelled() => Err(Error::Cancelled),
            result = body_context.run_in_lineage(body(body_context.clone())) => result,
        };
        let error = match result {
            Ok(value) => {
                node.try_set_output(Ok(value));
                return Ok(node);
            }
            Err(error) if !error.is_cancellation() => {
                node.try_set_output(Err(error));
                return Ok(node);
            }
            Err(error) => error,
        };

        if cancellation.is_cancelled() {
            node.core()
                .invalidate_with(true, InvalidationSource::Cancelled);
            node.try_set_output(Err(error.clone()));
            return Err(error);
        }

        failed_tries += 1;
        if !reprocessing.allows_retry(failed_tries, started.elapsed()) {
            tracing::warn!(input = %key, tries = failed_tries, "computation was cancelled internally, giving up");
            node.try_set_output(Err(error));
            return Ok(node);
        }

        node.core()
            .invalidate_with(true, InvalidationSource::Cancelled);
        node.try_set_output(Err(error));
        hub.metrics().record_retry();

        let delay = reprocessing.retry_delays.delay(failed_tries);
        tracing::warn!(
            input = %key,
            try_index = failed_tries,
            delay_ms = delay.as_millis() as u64,
            "computation was cancelled internally, retrying"
        );
        if !delay.is_zero() {
            tokio::select! {
                biased;
                _ = cancellation.cancelled() => return Err(Error::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

/// Turn the result of a lookup into a node, or the error a call that must
/// produce a value reports when there is none.
pub(crate) fn require_node<T>(node: Option<Arc<Computed<T>>>, context: &ComputeContext) -> Result<Arc<Computed<T>>> {
    node.ok_or(Error::InvalidCallOptions(context.call_options()))
}

/// A memoized async function of `I`.
pub struct ComputeFunction<I, T> {
    hub: Arc<HubInner>,
    options: Arc<ComputedOptions>,
    body: Body<I, T>,
}

impl<I, T> ComputeFunction<I, T>
where
    I: ComputedInput + Clone,
    T: Clone + Send + Sync + 'static,
{
    pub(crate) fn new<F, Fut>(hub: Arc<HubInner>, options: ComputedOptions, body: F) -> Self
    where
        F: Fn(I, ComputeContext, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        Self {
            hub,
            options: Arc::new(options),
            body: Arc::new(move |input, context, cancellation| body(input, context, cancellation).boxed()),
        }
    }

    /// Options applied to every node of this function.
    pub fn options(&self) -> &ComputedOptions {
        &self.options
    }

    /// Resolve the node for `input` according to the context's call options.
    ///
    /// Returns `None` for `GET_EXISTING` calls when no node exists.
    pub async fn invoke(
        &self,
        input: I,
        context: &ComputeContext,
        cancellation: &CancellationToken,
    ) -> Result<Option<Arc<Computed<T>>>> {
        let key = InputKey::new(input.clone());
        let slot = RegistrySlot {
            registry: self.hub.registry(),
            key: &key,
            _value: PhantomData,
        };
        let body = &self.body;
        get_or_produce(&self.hub, &key, &self.options, &slot, context, cancellation, |body_context| {
            body(input.clone(), body_context, cancellation.clone())
        })
        .await
    }

    /// Compute or reuse the value for `input`.
    ///
    /// Fails with [`Error::InvalidCallOptions`] when the context asks for an
    /// existing node only; use [`invoke`](Self::invoke) for those calls.
    pub async fn call(&self, input: I, context: &ComputeContext, cancellation: &CancellationToken) -> Result<T> {
        context.ensure_may_compute()?;
        let node = self.invoke(input, context, cancellation).await?;
        require_node(node, context)?.value()
    }

    /// The registered node for `input`, without computing or tracking.
    pub fn existing(&self, input: I) -> Option<Arc<Computed<T>>> {
        self.hub.registry().get::<T>(&InputKey::new(input))
    }

    /// Invalidate the registered node for `input`. Returns `false` if there
    /// is none.
    pub fn invalidate(&self, input: I) -> bool {
        match self.existing(input) {
            Some(node) => {
                node.invalidate();
                true
            }
            None => false,
        }
    }
}

impl<I, T> Clone for ComputeFunction<I, T> {
    fn clone(&self) -> Self {
        Self {
            hub: self.hub.clone(),
            options: self.options.clone(),
            body: self.body.clone(),
        }
    }
}

impl<I, T> fmt::Debug for ComputeFunction<I, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComputeFunction")
            .field("input", &std::any::type_name::<I>())
            .field("output", &std::any::type_name::<T>())
            .field("options", &self.options)
            .finish()
    }
}
