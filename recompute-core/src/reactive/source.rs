//! Computed Sources
//!
//! A [`ComputedSource`] is a memoized computation bound to one owner rather
//! than to an input of a shared function: the source itself is the key. It
//! goes through the same single-flight routine as a [`ComputeFunction`],
//! but its current node lives in the source, so the owner can read it,
//! refresh it, or invalidate it without a registry lookup.
//!
//! [`ComputeFunction`]: crate::ComputeFunction

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use super::computed::{Computed, InvalidationSource};
use super::context::ComputeContext;
use super::function::{get_or_produce, require_node, NodeSlot};
use super::hub::HubInner;
use super::input::{ComputedInput, InputKey};
use super::options::ComputedOptions;
use crate::error::Result;

type SourceBody<T> = Arc<dyn Fn(ComputeContext, CancellationToken) -> BoxFuture<'static, Result<T>> + Send + Sync>;

/// The input identifying one source.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SourceKey {
    id: u64,
    name: &'static str,
}

impl SourceKey {
    fn next(name: &'static str) -> Self {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);
        Self {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            name,
        }
    }
}

impl ComputedInput for SourceKey {
    fn category(&self) -> &str {
        self.name
    }
}

struct SourceShared<T> {
    hub: Arc<HubInner>,
    key: InputKey,
    options: Arc<ComputedOptions>,
    body: SourceBody<T>,
    current: Mutex<Option<Arc<Computed<T>>>>,
}

impl<T> NodeSlot<T> for SourceShared<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn current(&self) -> Option<Arc<Computed<T>>> {
        self.current.lock().clone()
    }

    fn publish(&self, node: &Arc<Computed<T>>) {
        let previous = self.current.lock().replace(node.clone());
        if let Some(previous) = previous {
            previous
                .core()
                .invalidate_with(true, InvalidationSource::Replaced);
        }
        self.hub.registry().register(node.as_ref());
    }
}

/// A memoized computation owned by its creator.
pub struct ComputedSource<T> {
    shared: Arc<SourceShared<T>>,
}

impl<T> ComputedSource<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub(crate) fn new<F, Fut>(hub: Arc<HubInner>, name: &'static str, options: ComputedOptions, body: F) -> Self
    where
        F: Fn(ComputeContext, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        Self {
            shared: Arc::new(SourceShared {
                hub,
                key: InputKey::new(SourceKey::next(name)),
                options: Arc::new(options),
                body: Arc::new(move |context, cancellation| body(context, cancellation).boxed()),
                current: Mutex::new(None),
            }),
        }
    }

    /// The key this source registers its nodes under.
    pub fn key(&self) -> &InputKey {
        &self.shared.key
    }

    /// The current node, if the source has been computed at least once.
    pub fn computed(&self) -> Option<Arc<Computed<T>>> {
        self.shared.current()
    }

    /// Make sure the current node is up to date, recomputing if needed.
    pub async fn update(&self, cancellation: &CancellationToken) -> Result<Arc<Computed<T>>> {
        let context = ComputeContext::new();
        let node = self.resolve(&context, cancellation).await?;
        require_node(node, &context)
    }

    /// Read the value, recording a dependency on the context's computing node.
    pub async fn use_value(&self, context: &ComputeContext, cancellation: &CancellationToken) -> Result<T> {
        context.ensure_may_compute()?;
        let node = self.resolve(context, cancellation).await?;
        require_node(node, context)?.value()
    }

    /// Invalidate the current node. The next read recomputes.
    pub fn invalidate(&self) {
        if let Some(node) = self.computed() {
            node.invalidate();
        }
    }

    async fn resolve(
        &self,
        context: &ComputeContext,
        cancellation: &CancellationToken,
    ) -> Result<Option<Arc<Computed<T>>>> {
        let shared = self.shared.as_ref();
        get_or_produce(
            &shared.hub,
            &shared.key,
            &shared.options,
            shared,
            context,
            cancellation,
            |body_context| (shared.body)(body_context, cancellation.clone()),
        )
        .await
    }
}

impl<T> Clone for ComputedSource<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T> fmt::Debug for ComputedSource<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComputedSource")
            .field("key", &self.shared.key)
            .finish()
    }
}
