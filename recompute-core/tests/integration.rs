//! Integration Tests for the Memoization Engine
//!
//! These tests drive functions, sources and states together through a hub,
//! with tokio's clock paused so timer-driven behavior is deterministic.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use recompute_core::{
    capture, ComputeContext, ComputeFunction, ComputedInput, ComputedOptions, ConsistencyState, Error, Hub,
    HubOptions, InvalidationSource, MethodInput, ServiceInstance,
};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct Key(u32);

impl ComputedInput for Key {}

fn quiet_hub() -> Hub {
    let mut options = HubOptions::default();
    options.pruner.auto_start = false;
    Hub::new(options)
}

fn counter() -> (Arc<AtomicUsize>, Arc<AtomicUsize>) {
    let calls = Arc::new(AtomicUsize::new(0));
    (calls.clone(), calls)
}

/// Concurrent callers of the same input share a single execution.
#[tokio::test(start_paused = true)]
async fn concurrent_callers_share_one_computation() {
    let hub = quiet_hub();
    let (calls, count) = counter();
    let slow = hub.function(move |key: Key, _, _| {
        let count = count.clone();
        async move {
            count.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_secs(1)).await;
            Ok(key.0 + 100)
        }
    });

    let tasks: Vec<_> = (0..16)
        .map(|_| {
            let slow = slow.clone();
            tokio::spawn(async move {
                slow.call(Key(7), &ComputeContext::new(), &CancellationToken::new())
                    .await
            })
        })
        .collect();

    for task in tasks {
        assert_eq!(task.await.unwrap().unwrap(), 107);
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(hub.metrics().snapshot().computations, 1);
}

/// Different inputs are computed independently.
#[tokio::test(start_paused = true)]
async fn distinct_inputs_do_not_share_nodes() {
    let hub = quiet_hub();
    let (calls, count) = counter();
    let square = hub.function(move |key: Key, _, _| {
        let count = count.clone();
        async move {
            count.fetch_add(1, Ordering::SeqCst);
            Ok(key.0 * key.0)
        }
    });
    let ct = CancellationToken::new();

    assert_eq!(square.call(Key(3), &ComputeContext::new(), &ct).await.unwrap(), 9);
    assert_eq!(square.call(Key(4), &ComputeContext::new(), &ct).await.unwrap(), 16);
    assert_eq!(square.call(Key(3), &ComputeContext::new(), &ct).await.unwrap(), 9);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(hub.registry().len(), 2);
}

/// A node's output is set once; later attempts are ignored.
#[tokio::test(start_paused = true)]
async fn output_is_write_once() {
    let hub = quiet_hub();
    let identity = hub.function(|key: Key, _, _| async move { Ok(key.0) });
    let ct = CancellationToken::new();

    identity.call(Key(5), &ComputeContext::new(), &ct).await.unwrap();
    let node = identity.existing(Key(5)).unwrap();
    assert!(!node.try_set_output(Ok(99)));
    assert_eq!(node.value().unwrap(), 5);
    assert_eq!(node.state(), ConsistencyState::Consistent);
}

/// Invalidating twice fires handlers once, and late handlers run at once.
#[tokio::test(start_paused = true)]
async fn invalidation_is_idempotent() {
    let hub = quiet_hub();
    let identity = hub.function(|key: Key, _, _| async move { Ok(key.0) });
    identity
        .call(Key(1), &ComputeContext::new(), &CancellationToken::new())
        .await
        .unwrap();
    let node = identity.existing(Key(1)).unwrap();

    let (fired, count) = counter();
    node.on_invalidated(move |_| {
        count.fetch_add(1, Ordering::SeqCst);
    });
    node.invalidate();
    node.invalidate();
    assert_eq!(fired.load(Ordering::SeqCst), 1);
    assert_eq!(node.core().invalidation_source(), Some(InvalidationSource::Explicit));

    let late = fired.clone();
    node.on_invalidated(move |_| {
        late.fetch_add(1, Ordering::SeqCst);
    });
    assert_eq!(fired.load(Ordering::SeqCst), 2);
    assert!(identity.existing(Key(1)).is_none());
}

/// Changing a state invalidates every computation that read it, however
/// deep, the next time each one is looked at.
#[tokio::test(start_paused = true)]
async fn state_changes_reach_transitive_dependants() {
    let hub = quiet_hub();
    let base = hub.state(2u32);
    let (doubled_calls, count) = counter();
    let doubled = hub.function({
        let base = base.clone();
        move |_: Key, ctx: ComputeContext, _| {
            let base = base.clone();
            let count = count.clone();
            async move {
                count.fetch_add(1, Ordering::SeqCst);
                Ok(base.use_value(&ctx)? * 2)
            }
        }
    });
    let plus_one = hub.function({
        let doubled = doubled.clone();
        move |key: Key, ctx: ComputeContext, ct: CancellationToken| {
            let doubled = doubled.clone();
            async move { Ok(doubled.call(key, &ctx, &ct).await? + 1) }
        }
    });
    let ct = CancellationToken::new();

    assert_eq!(plus_one.call(Key(0), &ComputeContext::new(), &ct).await.unwrap(), 5);
    let outer = plus_one.existing(Key(0)).unwrap();
    let inner = doubled.existing(Key(0)).unwrap();
    assert_eq!(outer.core().dependencies(), vec![inner.handle()]);
    assert_eq!(inner.core().dependants(), vec![outer.handle()]);

    base.set(10);
    assert!(!outer.is_up_to_date());
    assert_eq!(
        outer.core().invalidation_source(),
        Some(InvalidationSource::DependencyInvalidated)
    );
    assert_eq!(plus_one.call(Key(0), &ComputeContext::new(), &ct).await.unwrap(), 21);
    assert_eq!(doubled_calls.load(Ordering::SeqCst), 2);
}

/// Reading a value that did not change keeps the cached node.
#[tokio::test(start_paused = true)]
async fn unrelated_invalidations_keep_nodes_valid() {
    let hub = quiet_hub();
    let watched = hub.state(1u32);
    let other = hub.state(1u32);
    let (calls, count) = counter();
    let reader = hub.function({
        let watched = watched.clone();
        move |_: Key, ctx: ComputeContext, _| {
            let watched = watched.clone();
            let count = count.clone();
            async move {
                count.fetch_add(1, Ordering::SeqCst);
                watched.use_value(&ctx)
            }
        }
    });
    let ct = CancellationToken::new();

    reader.call(Key(0), &ComputeContext::new(), &ct).await.unwrap();
    other.set(5);
    assert!(reader.existing(Key(0)).unwrap().is_up_to_date());
    reader.call(Key(0), &ComputeContext::new(), &ct).await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

/// A body cancelled internally is retried under the same lock.
#[tokio::test(start_paused = true)]
async fn internal_cancellation_is_retried() {
    let hub = quiet_hub();
    let (calls, count) = counter();
    let flaky = hub.function(move |key: Key, _, _| {
        let count = count.clone();
        async move {
            if count.fetch_add(1, Ordering::SeqCst) < 2 {
                return Err(Error::Cancelled);
            }
            Ok(key.0)
        }
    });

    let value = flaky
        .call(Key(3), &ComputeContext::new(), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(value, 3);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(hub.metrics().snapshot().retries, 2);
}

/// Retries stop once the try budget is spent.
#[tokio::test(start_paused = true)]
async fn retries_respect_the_try_budget() {
    let hub = quiet_hub();
    let (calls, count) = counter();
    let mut options = ComputedOptions::default();
    options.cancellation_reprocessing.max_try_count = 2;
    let never = hub.function_with_options(options, move |_: Key, _, _| {
        let count = count.clone();
        async move {
            count.fetch_add(1, Ordering::SeqCst);
            Err::<u32, _>(Error::Cancelled)
        }
    });

    let result = never
        .call(Key(1), &ComputeContext::new(), &CancellationToken::new())
        .await;
    assert!(matches!(result, Err(Error::Cancelled)));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

/// A computation that calls itself with the same input fails instead of
/// deadlocking.
#[tokio::test(start_paused = true)]
async fn reentrant_calls_are_detected() {
    let hub = quiet_hub();
    let cell: Arc<OnceLock<ComputeFunction<Key, u32>>> = Arc::new(OnceLock::new());
    let recursive = hub.function({
        let cell = cell.clone();
        move |key: Key, ctx: ComputeContext, ct: CancellationToken| {
            let cell = cell.clone();
            async move {
                let Some(this) = cell.get() else {
                    return Ok(0);
                };
                this.call(key, &ctx, &ct).await
            }
        }
    });
    assert!(cell.set(recursive.clone()).is_ok());

    let result = recursive
        .call(Key(1), &ComputeContext::new(), &CancellationToken::new())
        .await;
    assert!(matches!(result, Err(Error::LockReentry { .. })));
}

/// Capture hands back the node a call resolved to.
#[tokio::test(start_paused = true)]
async fn capture_returns_the_resolved_node() {
    let hub = quiet_hub();
    let identity = hub.function(|key: Key, _, _| async move { Ok(key.0) });
    let ct = CancellationToken::new();

    let captured = capture::<u32, _, _, _>({
        let identity = identity.clone();
        let ct = ct.clone();
        |ctx: ComputeContext| async move { identity.call(Key(8), &ctx, &ct).await }
    })
    .await
    .unwrap()
    .unwrap();
    assert_eq!(captured.value().unwrap(), 8);
    assert_eq!(
        captured.version(),
        identity.existing(Key(8)).unwrap().version()
    );
}

/// Capture also works for failed computations.
#[tokio::test(start_paused = true)]
async fn capture_returns_failed_nodes() {
    let hub = quiet_hub();
    let failing = hub.function(|_: Key, _, _| async move { Err::<u32, _>(Error::msg("nope")) });

    let captured = capture::<u32, _, _, _>({
        let failing = failing.clone();
        |ctx: ComputeContext| async move { failing.call(Key(1), &ctx, &CancellationToken::new()).await }
    })
    .await
    .unwrap()
    .unwrap();
    assert!(captured.error().is_some());
}

/// The invalidating context invalidates the existing node and nothing else.
#[tokio::test(start_paused = true)]
async fn invalidating_context_targets_existing_nodes() {
    let hub = quiet_hub();
    let (calls, count) = counter();
    let identity = hub.function(move |key: Key, _, _| {
        let count = count.clone();
        async move {
            count.fetch_add(1, Ordering::SeqCst);
            Ok(key.0)
        }
    });
    let ct = CancellationToken::new();

    let missing = identity
        .invoke(Key(2), &ComputeContext::invalidating(), &ct)
        .await
        .unwrap();
    assert!(missing.is_none());
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    identity.call(Key(2), &ComputeContext::new(), &ct).await.unwrap();
    let node = identity
        .invoke(Key(2), &ComputeContext::invalidating(), &ct)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(node.core().invalidation_source(), Some(InvalidationSource::CallOptions));

    let existing = identity
        .invoke(Key(2), &ComputeContext::capture_existing(), &ct)
        .await
        .unwrap();
    assert!(existing.is_none());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

/// Nodes expire after `auto_invalidation_delay`.
#[tokio::test(start_paused = true)]
async fn auto_invalidation_fires_after_the_delay() {
    let hub = quiet_hub();
    let options = ComputedOptions {
        auto_invalidation_delay: Some(Duration::from_secs(5)),
        ..ComputedOptions::default()
    };
    let identity = hub.function_with_options(options, |key: Key, _, _| async move { Ok(key.0) });
    identity
        .call(Key(1), &ComputeContext::new(), &CancellationToken::new())
        .await
        .unwrap();
    let node = identity.existing(Key(1)).unwrap();

    tokio::time::sleep(Duration::from_secs(4)).await;
    assert_eq!(node.state(), ConsistencyState::Consistent);

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(node.state(), ConsistencyState::Invalidated);
    assert_eq!(node.core().invalidation_source(), Some(InvalidationSource::Timeout));
}

/// Transient errors are retried by the next caller shortly after.
#[tokio::test(start_paused = true)]
async fn transient_errors_expire_quickly() {
    let hub = quiet_hub();
    let (calls, count) = counter();
    let flaky = hub.function(move |key: Key, _, _| {
        let count = count.clone();
        async move {
            if count.fetch_add(1, Ordering::SeqCst) == 0 {
                return Err(Error::transient(std::io::Error::other("connection reset")));
            }
            Ok(key.0)
        }
    });
    let ct = CancellationToken::new();

    assert!(flaky.call(Key(1), &ComputeContext::new(), &ct).await.is_err());
    assert!(flaky.call(Key(1), &ComputeContext::new(), &ct).await.is_err());

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(flaky.call(Key(1), &ComputeContext::new(), &ct).await.unwrap(), 1);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

/// Sources are invalidated by the states they read, like functions.
#[tokio::test(start_paused = true)]
async fn sources_track_state_dependencies() {
    let hub = quiet_hub();
    let name = hub.state(String::from("ada"));
    let greeting = hub.source("greeting", {
        let name = name.clone();
        move |ctx: ComputeContext, _| {
            let name = name.clone();
            async move { Ok(format!("hello, {}", name.use_value(&ctx)?)) }
        }
    });
    let ct = CancellationToken::new();

    assert_eq!(greeting.use_value(&ComputeContext::new(), &ct).await.unwrap(), "hello, ada");
    let first = greeting.computed().unwrap();

    name.set(String::from("grace"));
    let second = greeting.update(&ct).await.unwrap();
    assert_ne!(first.version(), second.version());
    assert_eq!(second.value().unwrap(), "hello, grace");
    assert_eq!(first.state(), ConsistencyState::Invalidated);
}

/// Disposing a service invalidates its nodes after the grace delay, and
/// later calls for it are rejected.
#[tokio::test(start_paused = true)]
async fn pruner_invalidates_disposed_instances() {
    let hub = quiet_hub();
    let service = ServiceInstance::new("accounts");
    let balance = hub.function(|input: MethodInput<u32>, _, _| async move { Ok(input.args * 10) });
    let ct = CancellationToken::new();

    let input = MethodInput::new(&service, "balance", 4);
    assert_eq!(balance.call(input.clone(), &ComputeContext::new(), &ct).await.unwrap(), 40);
    let node = balance.existing(input.clone()).unwrap();

    service.dispose();
    let report = hub.prune_once().await.unwrap();
    assert_eq!(report.scanned_keys, 1);
    assert_eq!(report.disposed_invalidations, 1);
    assert_eq!(node.state(), ConsistencyState::Consistent);

    let grace = hub.options().pruner.disposed_invalidation_delay + hub.options().timer_quanta;
    tokio::time::sleep(grace * 2).await;
    assert_eq!(node.state(), ConsistencyState::Invalidated);
    assert_eq!(node.core().invalidation_source(), Some(InvalidationSource::Disposed));

    let report = hub.prune_once().await.unwrap();
    assert_eq!(report.reclaimed_nodes, 1);
    assert!(hub.registry().is_empty());
    assert!(matches!(
        balance.call(input, &ComputeContext::new(), &ct).await,
        Err(Error::InputDisposed { .. })
    ));
    assert_eq!(hub.metrics().snapshot().prune_sweeps, 2);
}

/// Edge compaction drops dependant edges to nodes that are gone.
#[tokio::test(start_paused = true)]
async fn pruner_compacts_dead_edges() {
    let hub = quiet_hub();
    let base = hub.function(|_: Key, _, _| async move { Ok(1u32) });
    let reader = hub.function({
        let base = base.clone();
        move |key: Key, ctx: ComputeContext, ct: CancellationToken| {
            let base = base.clone();
            async move { base.call(Key(0), &ctx, &ct).await.map(|value| value + key.0) }
        }
    });
    let ct = CancellationToken::new();

    for i in 1..=3 {
        reader.call(Key(i), &ComputeContext::new(), &ct).await.unwrap();
    }
    let shared = base.existing(Key(0)).unwrap();
    let readers: Vec<_> = (1..=3).map(|i| reader.existing(Key(i)).unwrap()).collect();
    assert_eq!(shared.core().dependant_count(), 3);

    // Dependants removed through the registry keep their edge until a sweep.
    hub.registry().arena().remove(readers[0].handle());

    let report = hub.prune_once().await.unwrap();
    assert_eq!(report.edges_before, 3);
    assert_eq!(report.edges_after, 2);
    assert_eq!(shared.core().dependant_count(), 2);
}

/// A node whose keep-alive window lapsed is evicted unless something live
/// still depends on it.
#[tokio::test(start_paused = true)]
async fn expired_nodes_are_evicted_when_unused() {
    let hub = quiet_hub();
    let cached = ComputedOptions {
        min_cache_duration: Some(Duration::from_secs(10)),
        ..ComputedOptions::default()
    };
    let leaf = hub.function_with_options(cached, |key: Key, _, _| async move { Ok(key.0) });
    let parent = hub.function({
        let leaf = leaf.clone();
        move |key: Key, ctx: ComputeContext, ct: CancellationToken| {
            let leaf = leaf.clone();
            async move { leaf.call(key, &ctx, &ct).await }
        }
    });
    let ct = CancellationToken::new();

    leaf.call(Key(1), &ComputeContext::new(), &ct).await.unwrap();
    parent.call(Key(2), &ComputeContext::new(), &ct).await.unwrap();
    let lonely = leaf.existing(Key(1)).unwrap();
    let needed = leaf.existing(Key(2)).unwrap();
    let _user = parent.existing(Key(2)).unwrap();

    let report = hub.prune_once().await.unwrap();
    assert_eq!(report.reclaimed_nodes, 0);

    tokio::time::sleep(Duration::from_secs(25)).await;
    assert!(lonely.core().is_expired());
    assert!(needed.core().is_expired());

    let report = hub.prune_once().await.unwrap();
    assert_eq!(report.reclaimed_nodes, 1);
    assert_eq!(lonely.core().invalidation_source(), Some(InvalidationSource::Expired));
    assert!(leaf.existing(Key(1)).is_none());
    assert_eq!(needed.state(), ConsistencyState::Consistent);
}

/// A node read more often than its keep-alive window never expires, and
/// expires once the reads stop.
#[tokio::test(start_paused = true)]
async fn hot_nodes_keep_renewing_their_window() {
    let hub = quiet_hub();
    let cached = ComputedOptions {
        min_cache_duration: Some(Duration::from_secs(10)),
        ..ComputedOptions::default()
    };
    let (calls, count) = counter();
    let leaf = hub.function_with_options(cached, move |key: Key, _, _| {
        let count = count.clone();
        async move {
            count.fetch_add(1, Ordering::SeqCst);
            Ok(key.0)
        }
    });
    let ct = CancellationToken::new();

    leaf.call(Key(1), &ComputeContext::new(), &ct).await.unwrap();
    let hot = leaf.existing(Key(1)).unwrap();
    for _ in 0..8 {
        tokio::time::sleep(Duration::from_secs(4)).await;
        leaf.call(Key(1), &ComputeContext::new(), &ct).await.unwrap();
        assert!(!hot.core().is_expired());
    }

    let report = hub.prune_once().await.unwrap();
    assert_eq!(report.reclaimed_nodes, 0);
    assert_eq!(hot.state(), ConsistencyState::Consistent);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    tokio::time::sleep(Duration::from_secs(25)).await;
    assert!(hot.core().is_expired());
    let report = hub.prune_once().await.unwrap();
    assert_eq!(report.reclaimed_nodes, 1);
    assert_eq!(hot.core().invalidation_source(), Some(InvalidationSource::Expired));
}

/// Nodes nobody holds or depends on are reclaimed, so memory stays bounded
/// by what is in use.
#[tokio::test(start_paused = true)]
async fn unreferenced_nodes_are_reclaimed() {
    let hub = quiet_hub();
    let identity = hub.function(|key: Key, _, _| async move { Ok(key.0) });
    let ct = CancellationToken::new();

    for i in 0..1000 {
        identity.call(Key(i), &ComputeContext::new(), &ct).await.unwrap();
    }
    let held = identity.existing(Key(0)).unwrap();
    assert_eq!(hub.registry().arena().len(), 1000);

    let report = hub.prune_once().await.unwrap();
    assert_eq!(report.reclaimed_nodes, 999);
    assert_eq!(hub.registry().len(), 1);
    assert_eq!(hub.registry().arena().len(), 1);
    assert_eq!(held.state(), ConsistencyState::Consistent);

    drop(held);
    hub.prune_once().await.unwrap();
    assert!(hub.registry().is_empty());
    assert_eq!(hub.registry().arena().len(), 0);
}

/// A non-immediate invalidation waits for `invalidation_delay` and keeps
/// the reason it was requested for.
#[tokio::test(start_paused = true)]
async fn delayed_invalidation_keeps_its_source() {
    let hub = quiet_hub();
    let delayed = ComputedOptions {
        invalidation_delay: Duration::from_secs(2),
        ..ComputedOptions::default()
    };
    let identity = hub.function_with_options(delayed, |key: Key, _, _| async move { Ok(key.0) });
    let ct = CancellationToken::new();

    identity.call(Key(1), &ComputeContext::new(), &ct).await.unwrap();
    let node = identity.existing(Key(1)).unwrap();
    node.core().invalidate_with(false, InvalidationSource::Explicit);

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(node.state(), ConsistencyState::Consistent);
    assert_eq!(node.core().invalidation_source(), None);

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(node.state(), ConsistencyState::Invalidated);
    assert_eq!(node.core().invalidation_source(), Some(InvalidationSource::Explicit));
}

/// When two delayed invalidations are pending, the earlier one decides the
/// recorded source.
#[tokio::test(start_paused = true)]
async fn earliest_delayed_invalidation_wins() {
    let hub = quiet_hub();
    let options = ComputedOptions {
        auto_invalidation_delay: Some(Duration::from_secs(30)),
        ..ComputedOptions::default()
    };
    let identity = hub.function_with_options(options, |key: Key, _, _| async move { Ok(key.0) });
    identity
        .call(Key(1), &ComputeContext::new(), &CancellationToken::new())
        .await
        .unwrap();
    let node = identity.existing(Key(1)).unwrap();

    node.core()
        .invalidate_after(Duration::from_secs(1), InvalidationSource::Disposed);
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(node.state(), ConsistencyState::Invalidated);
    assert_eq!(node.core().invalidation_source(), Some(InvalidationSource::Disposed));
}

/// A computation that calls its own input through a fresh top-level context
/// still fails instead of deadlocking.
#[tokio::test(start_paused = true)]
async fn reentry_through_a_fresh_context_is_detected() {
    let hub = quiet_hub();
    let cell: Arc<OnceLock<ComputeFunction<Key, u32>>> = Arc::new(OnceLock::new());
    let recursive = hub.function({
        let cell = cell.clone();
        move |key: Key, _, ct: CancellationToken| {
            let cell = cell.clone();
            async move {
                let Some(this) = cell.get() else {
                    return Ok(0);
                };
                this.call(key, &ComputeContext::new(), &ct).await
            }
        }
    });
    assert!(cell.set(recursive.clone()).is_ok());

    let result = tokio::time::timeout(
        Duration::from_secs(5),
        recursive.call(Key(1), &ComputeContext::new(), &CancellationToken::new()),
    )
    .await
    .expect("reentrant call deadlocked");
    assert!(matches!(result, Err(Error::LockReentry { .. })));
}

/// Waiting on invalidation completes once a state the node read changes.
#[tokio::test(start_paused = true)]
async fn when_invalidated_completes_on_state_change() {
    let hub = quiet_hub();
    let flag = hub.state(false);
    let watcher = hub.state(0u32);
    let node = watcher.computed();

    let waiter = tokio::spawn({
        let node = node.clone();
        async move { node.when_invalidated().await }
    });
    flag.set(true);
    assert!(!waiter.is_finished());

    watcher.set(1);
    waiter.await.unwrap();
    assert_eq!(node.core().invalidation_source(), Some(InvalidationSource::StateChanged));
}

/// Invalidating everything empties the registry.
#[tokio::test(start_paused = true)]
async fn invalidate_everything_clears_the_registry() {
    let hub = quiet_hub();
    let identity = hub.function(|key: Key, _, _| async move { Ok(key.0) });
    let ct = CancellationToken::new();
    for i in 0..5 {
        identity.call(Key(i), &ComputeContext::new(), &ct).await.unwrap();
    }
    assert_eq!(hub.registry().len(), 5);

    let epoch = hub.invalidation_epoch();
    hub.invalidate_everything();
    assert!(hub.registry().is_empty());
    assert!(hub.invalidation_epoch() >= epoch + 5);
}
