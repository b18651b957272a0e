// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Integration tests for eviction policies, expiration and teardown.

use std::{
    convert::Infallible,
    sync::{
        Arc,
        atomic::{
            AtomicUsize,
            Ordering::{AcqRel, Acquire},
        },
    },
    time::Duration,
};

use futures_util::future::BoxFuture;
use leasecache::{CapacityBounded, ElementCounts, EntryState, EvictionPolicy, LeaseCache, Retention, SignalDriven};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

/// Records `(key, creation number)` for every factory invocation.
type Creations = Arc<Mutex<Vec<(u32, usize)>>>;

fn recording_cache(policy: impl EvictionPolicy<u32, u32>) -> (LeaseCache<u32, u32>, Creations) {
    let creations = Creations::default();
    let log = Arc::clone(&creations);
    let cache = LeaseCache::new(CancellationToken::new(), policy, move |key: u32| {
        let mut log = log.lock();
        let number = log.len() + 1;
        log.push((key, number));
        async move { Ok::<_, Infallible>(key) }
    });
    (cache, creations)
}

async fn touch(cache: &LeaseCache<u32, u32>, keys: &[u32]) {
    cache.use_elements(keys.iter().copied(), |_| async {}).await.unwrap();
}

async fn eventually(condition: impl Fn() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .unwrap();
}

/// Increments a counter when dropped; lets tests observe cancelled futures.
struct DropCounter(Arc<AtomicUsize>);

impl Drop for DropCounter {
    fn drop(&mut self) {
        self.0.fetch_add(1, AcqRel);
    }
}

#[tokio::test]
async fn capacity_bound_keeps_most_recent_entries() {
    let (cache, creations) = recording_cache(CapacityBounded::new(2));

    let sequence: [&[u32]; 9] = [&[1], &[2], &[1], &[2], &[3], &[2, 3], &[4], &[1], &[3]];
    for keys in sequence {
        touch(&cache, keys).await;
        assert!(cache.cached_elements_count() <= 2, "cache grew to {}", cache.cached_elements_count());
        assert_eq!(cache.used_elements_count(), 0);
    }

    assert_eq!(*creations.lock(), vec![(1, 1), (2, 2), (3, 3), (4, 4), (1, 5), (3, 6)]);
}

#[tokio::test]
async fn capacity_bound_allows_growth_while_in_use() {
    let (cache, _) = recording_cache(CapacityBounded::new(1));

    let leases = cache.checkout_all([1, 2, 3]).await.unwrap();
    assert_eq!(cache.counts(), ElementCounts { cached: 3, used: 3 });
    drop(leases);

    assert_eq!(cache.counts(), ElementCounts { cached: 1, used: 0 });
    assert_eq!(cache.state(&3), Some(EntryState::Idle));
}

#[tokio::test]
async fn evict_oldest_follows_batch_release_order() {
    let (cache, _) = recording_cache(CapacityBounded::new(2));

    touch(&cache, &[2, 1]).await;
    touch(&cache, &[3]).await;

    assert_eq!(cache.state(&2), None);
    assert_eq!(cache.state(&1), Some(EntryState::Idle));
    assert_eq!(cache.state(&3), Some(EntryState::Idle));
}

#[tokio::test]
async fn reuse_moves_entry_to_back_of_idle_order() {
    let (cache, _) = recording_cache(CapacityBounded::new(2));

    touch(&cache, &[1]).await;
    touch(&cache, &[2]).await;
    touch(&cache, &[1]).await;
    touch(&cache, &[3]).await;

    assert_eq!(cache.state(&2), None);
    assert_eq!(cache.state(&1), Some(EntryState::Idle));
}

#[tokio::test(start_paused = true)]
async fn idle_timeout_expires_entries() {
    let (cache, creations) = recording_cache(CapacityBounded::new(4).with_idle_timeout(Duration::from_secs(10)));

    touch(&cache, &[1]).await;
    tokio::time::sleep(Duration::from_secs(5)).await;
    touch(&cache, &[1]).await;

    tokio::time::sleep(Duration::from_secs(7)).await;
    assert_eq!(cache.state(&1), Some(EntryState::Idle));

    tokio::time::sleep(Duration::from_secs(4)).await;
    assert_eq!(cache.state(&1), None);
    assert_eq!(cache.counts(), ElementCounts::default());

    touch(&cache, &[1]).await;
    assert_eq!(creations.lock().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn leased_entries_do_not_expire() {
    let (cache, _) = recording_cache(CapacityBounded::new(4).with_idle_timeout(Duration::from_secs(1)));

    let lease = cache.checkout(1).await.unwrap();
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(cache.state(&1), Some(EntryState::Active));
    drop(lease);

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(cache.state(&1), None);
}

/// Destroys every released entry immediately.
#[derive(Debug)]
struct NoRetention;

impl EvictionPolicy<u32, u32> for NoRetention {
    fn on_unused(&self, _key: &u32, _element: Option<&u32>, _counts: ElementCounts) -> Retention {
        Retention::destroy()
    }

    fn wait_for_expiration(&self, _key: &u32, _element: Option<&u32>) -> BoxFuture<'static, ()> {
        unreachable!("never retains")
    }
}

#[tokio::test]
async fn custom_policy_can_destroy_immediately() {
    let (cache, creations) = recording_cache(NoRetention);

    touch(&cache, &[1]).await;
    assert_eq!(cache.counts(), ElementCounts::default());
    touch(&cache, &[1]).await;
    assert_eq!(creations.lock().len(), 2);
}

#[tokio::test]
async fn signal_driven_drops_oldest_idle_entries() {
    let (policy, handle) = SignalDriven::new();
    let (cache, creations) = recording_cache(policy);

    for key in 1..=4 {
        touch(&cache, &[key]).await;
    }
    assert_eq!(cache.cached_elements_count(), 4);
    assert_eq!(handle.pending(), 4);

    let mut counts = cache.watch_counts();
    assert_eq!(handle.drop_unused(2), 2);
    tokio::time::timeout(Duration::from_secs(5), counts.wait_for(|counts| counts.cached == 2))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(cache.state(&1), None);
    assert_eq!(cache.state(&2), None);
    assert_eq!(cache.state(&3), Some(EntryState::Idle));
    assert_eq!(cache.state(&4), Some(EntryState::Idle));

    // Reusing an entry withdraws its wait before the checkout returns.
    let lease = cache.checkout(3).await.unwrap();
    assert_eq!(handle.pending(), 1);
    assert_eq!(handle.drop_unused(5), 1);
    tokio::time::timeout(Duration::from_secs(5), counts.wait_for(|counts| counts.cached == 1))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(cache.state(&3), Some(EntryState::Active));
    drop(lease);

    assert_eq!(handle.pending(), 1);
    assert_eq!(creations.lock().len(), 4);
}

#[tokio::test]
async fn drop_unused_right_after_reuse_destroys_other_idle_entry() {
    let (policy, handle) = SignalDriven::new();
    let (cache, creations) = recording_cache(policy);

    touch(&cache, &[1]).await;
    touch(&cache, &[2]).await;
    assert_eq!(handle.pending(), 2);

    let mut counts = cache.watch_counts();
    let lease = cache.checkout(1).await.unwrap();
    assert_eq!(handle.drop_unused(1), 1);
    tokio::time::timeout(Duration::from_secs(5), counts.wait_for(|counts| counts.cached == 1))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(cache.state(&1), Some(EntryState::Active));
    assert_eq!(cache.state(&2), None);
    assert_eq!(handle.pending(), 0);

    drop(lease);
    assert_eq!(handle.pending(), 1);
    assert_eq!(creations.lock().len(), 2);
}

#[tokio::test]
#[should_panic(expected = "eviction policy is already bound to a cache")]
async fn policy_cannot_serve_two_caches() {
    let policy = Arc::new(CapacityBounded::<u32, u32>::new(4));
    let _first = recording_cache(Arc::clone(&policy));
    let _second = recording_cache(policy);
}

#[tokio::test]
async fn close_cancels_every_task_once() {
    let expirations_dropped = Arc::new(AtomicUsize::new(0));
    let factories_dropped = Arc::new(AtomicUsize::new(0));

    let policy = {
        let dropped = Arc::clone(&expirations_dropped);
        CapacityBounded::new(8).with_expiration(move |_: &u32, _: Option<&u32>| {
            let guard = DropCounter(Arc::clone(&dropped));
            async move {
                let _guard = guard;
                std::future::pending::<()>().await;
            }
        })
    };
    let cache = {
        let dropped = Arc::clone(&factories_dropped);
        LeaseCache::new(CancellationToken::new(), policy, move |key: u32| {
            let guard = DropCounter(Arc::clone(&dropped));
            async move {
                let _guard = guard;
                if key >= 100 {
                    std::future::pending::<()>().await;
                }
                Ok::<_, Infallible>(key)
            }
        })
    };

    touch(&cache, &[1, 2, 3]).await;
    assert_eq!(factories_dropped.load(Acquire), 3);

    let stuck = {
        let cache = cache.clone();
        tokio::spawn(async move { cache.use_element(100, |element| async move { element }).await })
    };
    eventually(|| cache.cached_elements_count() == 4).await;

    cache.close();
    cache.close();
    assert!(cache.is_closed());
    assert_eq!(cache.counts(), ElementCounts { cached: 1, used: 1 });

    assert!(stuck.await.unwrap().unwrap_err().is_closed());
    eventually(|| expirations_dropped.load(Acquire) == 3).await;
    assert_eq!(factories_dropped.load(Acquire), 4);
    assert_eq!(cache.counts(), ElementCounts::default());

    assert!(cache.checkout(1).await.unwrap_err().is_closed());
    cache.close();
    assert_eq!(expirations_dropped.load(Acquire), 3);
}

#[tokio::test]
async fn scope_cancellation_destroys_idle_entries() {
    let scope = CancellationToken::new();
    let cache = LeaseCache::builder(|key: u32| async move { Ok::<_, Infallible>(key) })
        .scope(&scope)
        .build();

    touch(&cache, &[1, 2]).await;
    let lease = cache.checkout(3).await.unwrap();

    scope.cancel();
    eventually(|| cache.cached_elements_count() == 1).await;
    assert_eq!(cache.state(&3), Some(EntryState::Active));

    drop(lease);
    assert_eq!(cache.counts(), ElementCounts::default());
}
