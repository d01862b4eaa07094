//! Per-Input Async Locks
//!
//! Computations of one input are serialized by an async mutex keyed by the
//! input; different inputs never contend. Mutexes are created on first use
//! and dropped once nobody holds or awaits them, so the set only ever
//! contains inputs that are being computed right now.

use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;

use super::context::Lineage;
use super::input::InputKey;
use crate::error::{Error, Result};

/// Async mutexes keyed by input.
#[derive(Default)]
pub struct AsyncLockSet {
    locks: DashMap<InputKey, Arc<Mutex<()>>>,
}

impl AsyncLockSet {
    /// Create an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of inputs currently locked or awaited.
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    /// Whether no input is locked.
    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }

    /// Lock `key`.
    ///
    /// Fails with [`Error::LockReentry`] if `lineage` already holds the lock,
    /// and with [`Error::Cancelled`] if `cancellation` fires while waiting.
    pub(crate) async fn lock(
        &self,
        key: &InputKey,
        lineage: Option<&Lineage>,
        cancellation: &CancellationToken,
    ) -> Result<InputLockGuard<'_>> {
        if lineage.is_some_and(|lineage| lineage.contains(key)) {
            return Err(Error::LockReentry {
                input: key.to_string(),
            });
        }

        // Declared before `mutex` so that it drops last on cancellation.
        let mut guard = InputLockGuard {
            set: self,
            key: key.clone(),
            guard: None,
        };
        let mutex = self.locks.entry(key.clone()).or_default().clone();
        let acquired = tokio::select! {
            biased;
            _ = cancellation.cancelled() => return Err(Error::Cancelled),
            acquired = mutex.lock_owned() => acquired,
        };
        guard.guard = Some(acquired);
        Ok(guard)
    }

    fn release(&self, key: &InputKey) {
        // The map holds one reference; any other one is a holder or a waiter.
        self.locks
            .remove_if(key, |_, mutex| Arc::strong_count(mutex) == 1);
    }
}

impl fmt::Debug for AsyncLockSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncLockSet")
            .field("len", &self.locks.len())
            .finish()
    }
}

/// Holds the lock of one input until dropped.
pub(crate) struct InputLockGuard<'a> {
    set: &'a AsyncLockSet,
    key: InputKey,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for InputLockGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();
        self.set.release(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactive::ComputedInput;
    use std::time::Duration;

    #[derive(Debug, PartialEq, Eq, Hash)]
    struct Key(u32);

    impl ComputedInput for Key {}

    #[tokio::test]
    async fn entries_are_dropped_when_unused() {
        let set = AsyncLockSet::new();
        let ct = CancellationToken::new();
        let key = InputKey::new(Key(1));
        {
            let _guard = set.lock(&key, None, &ct).await.unwrap();
            assert_eq!(set.len(), 1);
        }
        assert!(set.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn second_locker_waits_for_the_first() {
        let set = Arc::new(AsyncLockSet::new());
        let ct = CancellationToken::new();
        let key = InputKey::new(Key(1));

        let guard = set.lock(&key, None, &ct).await.unwrap();
        let waiter = {
            let set = Arc::clone(&set);
            let ct = ct.clone();
            let key = key.clone();
            tokio::spawn(async move {
                let _guard = set.lock(&key, None, &ct).await.unwrap();
            })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());
        drop(guard);
        waiter.await.unwrap();
        assert!(set.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn waiting_is_cancellable() {
        let set = AsyncLockSet::new();
        let key = InputKey::new(Key(1));
        let _guard = set.lock(&key, None, &CancellationToken::new()).await.unwrap();

        let ct = CancellationToken::new();
        ct.cancel();
        assert!(matches!(set.lock(&key, None, &ct).await, Err(Error::Cancelled)));
        assert_eq!(set.len(), 1);
    }
}
