// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use futures_util::future::BoxFuture;

use crate::ElementCounts;
use crate::policy::{BindOnce, EvictionPolicy, Retention};

type ExpireFn<K, E> = Arc<dyn Fn(&K, Option<&E>) -> BoxFuture<'static, ()> + Send + Sync>;

/// Retains idle elements up to a soft capacity bound.
///
/// Every released element is retained. When the cache already holds at least
/// `max_cache_size` *other* entries, releasing an element evicts the idle entry that became idle
/// earliest. The released element itself is never the victim, which biases the cache towards the
/// most recently used elements.
///
/// The bound is soft: it counts the entries other than the one being released, and only idle
/// entries can be evicted. While one element is checked out the cache can hold
/// `max_cache_size + 1` entries, and more while several are.
///
/// By default idle elements never expire on their own; only capacity pressure evicts them. Use
/// [`with_idle_timeout`](Self::with_idle_timeout) or [`with_expiration`](Self::with_expiration)
/// to retire them earlier.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
///
/// use leasecache::CapacityBounded;
///
/// let policy = CapacityBounded::<String, u64>::new(32).with_idle_timeout(Duration::from_secs(30));
/// assert_eq!(policy.max_cache_size(), 32);
/// ```
pub struct CapacityBounded<K, E> {
    max_cache_size: usize,
    expire: Option<ExpireFn<K, E>>,
    binding: BindOnce,
}

impl<K, E> CapacityBounded<K, E> {
    /// Creates a policy retaining up to `max_cache_size` entries, idle ones waiting forever.
    ///
    /// # Panics
    ///
    /// Panics if `max_cache_size` is 0.
    #[must_use]
    pub fn new(max_cache_size: usize) -> Self {
        assert!(max_cache_size > 0, "max_cache_size must be at least 1");
        Self {
            max_cache_size,
            expire: None,
            binding: BindOnce::new(),
        }
    }

    /// Expires idle elements once the future returned by `expire` completes.
    #[must_use]
    pub fn with_expiration<F, Fut>(mut self, expire: F) -> Self
    where
        F: Fn(&K, Option<&E>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.expire = Some(Arc::new(move |key: &K, element: Option<&E>| expire(key, element).boxed()));
        self
    }

    /// Expires idle elements after they stayed unused for `timeout`.
    #[must_use]
    pub fn with_idle_timeout(self, timeout: Duration) -> Self {
        self.with_expiration(move |_, _| tokio::time::sleep(timeout))
    }

    /// Returns the soft capacity bound.
    #[must_use]
    pub fn max_cache_size(&self) -> usize {
        self.max_cache_size
    }
}

impl<K, E> Debug for CapacityBounded<K, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapacityBounded")
            .field("max_cache_size", &self.max_cache_size)
            .field("expires", &self.expire.is_some())
            .finish_non_exhaustive()
    }
}

impl<K, E> EvictionPolicy<K, E> for CapacityBounded<K, E>
where
    K: 'static,
    E: 'static,
{
    fn on_unused(&self, _key: &K, _element: Option<&E>, counts: ElementCounts) -> Retention {
        // `counts.cached` includes the released entry.
        let others = counts.cached.saturating_sub(1);
        Retention::retain().with_evict_oldest(others >= self.max_cache_size)
    }

    fn wait_for_expiration(&self, key: &K, element: Option<&E>) -> BoxFuture<'static, ()> {
        match &self.expire {
            Some(expire) => expire(key, element),
            None => std::future::pending().boxed(),
        }
    }

    fn bind(&self) {
        self.binding.bind();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    fn counts(cached: usize, used: usize) -> ElementCounts {
        ElementCounts { cached, used }
    }

    #[test]
    fn always_retains() {
        let policy = CapacityBounded::<u32, u32>::new(2);
        for cached in 1..5 {
            assert!(policy.on_unused(&1, None, counts(cached, 0)).cache_until_expired);
        }
    }

    #[test]
    fn evicts_once_other_entries_reach_capacity() {
        let policy = CapacityBounded::<u32, u32>::new(2);
        assert!(!policy.on_unused(&1, Some(&1), counts(1, 0)).evict_oldest);
        assert!(!policy.on_unused(&1, Some(&1), counts(2, 1)).evict_oldest);
        assert!(policy.on_unused(&1, Some(&1), counts(3, 0)).evict_oldest);
        assert!(policy.on_unused(&1, Some(&1), counts(7, 3)).evict_oldest);
    }

    #[test]
    #[should_panic(expected = "max_cache_size must be at least 1")]
    fn zero_capacity_panics() {
        let _ = CapacityBounded::<u32, u32>::new(0);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_timeout_sleeps() {
        let policy = CapacityBounded::<u32, u32>::new(1).with_idle_timeout(Duration::from_secs(5));
        let start = tokio::time::Instant::now();
        policy.wait_for_expiration(&1, None).await;
        assert!(start.elapsed() >= Duration::from_secs(5));
    }

    #[tokio::test]
    async fn custom_expiration_sees_key_and_element() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        let policy = CapacityBounded::<u32, u32>::new(1).with_expiration(move |key, element| {
            assert_eq!(*key, 4);
            assert_eq!(element, Some(&16));
            seen.fetch_add(1, Ordering::AcqRel);
            async {}
        });

        policy.wait_for_expiration(&4, Some(&16)).await;
        assert_eq!(calls.load(Ordering::Acquire), 1);
    }

    #[test]
    fn default_wait_never_completes() {
        let policy = CapacityBounded::<u32, u32>::new(1);
        let mut wait = policy.wait_for_expiration(&1, None);
        assert!((&mut wait).now_or_never().is_none());
    }

    #[test]
    fn debug_shows_capacity() {
        let policy = CapacityBounded::<u32, u32>::new(3);
        let debug = format!("{policy:?}");
        assert!(debug.contains("max_cache_size: 3"), "got: {debug}");
    }
}
