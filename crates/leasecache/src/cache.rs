// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The cache engine: one lock-guarded table of slots plus the tasks the cache owns.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt::Debug;
use std::hash::Hash;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use futures_util::future::{BoxFuture, try_join_all};
use futures_util::{FutureExt, TryFutureExt};
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{Level, event};

use crate::builder::LeaseCacheBuilder;
use crate::entry::{ElementFuture, EntryState, Expiry, Slot};
use crate::lease::{Claim, Lease, LeaseSet};
use crate::policy::EvictionPolicy;
use crate::runtime::Runtime;
use crate::{ElementCounts, Error, Result};

pub(crate) type Factory<K, E> = Arc<dyn Fn(K) -> BoxFuture<'static, Result<E>> + Send + Sync>;

pub(crate) fn boxed_factory<K, E, F, Fut, X>(create: F) -> Factory<K, E>
where
    F: Fn(K) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<E, X>> + Send + 'static,
    X: Into<Box<dyn std::error::Error + Send + Sync>> + 'static,
{
    Arc::new(move |key| create(key).map_err(Error::factory).boxed())
}

/// A reference-counted cache of lazily created, shared elements.
///
/// Callers *check out* an element for a bounded period of time. The first checkout of a key runs
/// the element factory on a task owned by the cache; concurrent checkouts of the same key share
/// that single computation. While at least one checkout is open, the element stays cached. When
/// the last checkout is released, the [`EvictionPolicy`] decides whether the element is destroyed
/// right away or retained, and for how long, so that a later checkout can reuse it without
/// running the factory again.
///
/// `LeaseCache` is a cheap handle: clones share the same entries. The cache and every task it
/// spawned are torn down when its scope is cancelled, when [`close`](Self::close) is called, or
/// when the last handle and the last lease are dropped.
///
/// # Examples
///
/// ```
/// use std::convert::Infallible;
///
/// use leasecache::{CapacityBounded, LeaseCache};
/// use tokio_util::sync::CancellationToken;
///
/// # #[tokio::main]
/// # async fn main() -> leasecache::Result<()> {
/// let cache = LeaseCache::new(CancellationToken::new(), CapacityBounded::new(8), |user: String| async move {
///     Ok::<_, Infallible>(format!("session for {user}"))
/// });
///
/// let greeting = cache
///     .use_element("alice".to_string(), |session| async move { format!("hello from {session}") })
///     .await?;
/// assert_eq!(greeting, "hello from session for alice");
///
/// // The element is no longer used but stays cached for reuse.
/// assert_eq!(cache.used_elements_count(), 0);
/// assert_eq!(cache.cached_elements_count(), 1);
/// # Ok(())
/// # }
/// ```
pub struct LeaseCache<K, E> {
    inner: Arc<CacheInner<K, E>>,
}

impl<K, E> Clone for LeaseCache<K, E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K, E> Debug for LeaseCache<K, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaseCache")
            .field("name", &self.inner.name)
            .field("counts", &self.inner.counts())
            .field("closed", &self.inner.scope.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl<K, E> LeaseCache<K, E>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    /// Creates a cache whose tasks live on a child of `scope`.
    ///
    /// Cancelling `scope` closes the cache. The factory is invoked at most once concurrently per
    /// key; its errors are delivered to every caller waiting on that key and are never cached.
    ///
    /// # Panics
    ///
    /// Panics if called outside of a Tokio runtime context, or if `policy` is already bound to
    /// another cache.
    pub fn new<P, F, Fut, X>(scope: CancellationToken, policy: P, create: F) -> Self
    where
        P: EvictionPolicy<K, E>,
        F: Fn(K) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<E, X>> + Send + 'static,
        X: Into<Box<dyn std::error::Error + Send + Sync>> + 'static,
    {
        Self::from_parts(crate::builder::DEFAULT_NAME, &scope, Box::new(policy), boxed_factory(create))
    }

    /// Creates a builder for a cache backed by the `create` factory.
    ///
    /// # Examples
    ///
    /// ```
    /// use leasecache::{LeaseCache, SignalDriven};
    ///
    /// # #[tokio::main]
    /// # async fn main() {
    /// let (policy, _handle) = SignalDriven::new();
    /// let cache = LeaseCache::builder(|id: u64| async move { Ok::<_, std::io::Error>(id.to_string()) })
    ///     .name("users")
    ///     .policy(policy)
    ///     .build();
    /// assert_eq!(cache.name(), "users");
    /// # }
    /// ```
    pub fn builder<F, Fut, X>(create: F) -> LeaseCacheBuilder<K, E>
    where
        F: Fn(K) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<E, X>> + Send + 'static,
        X: Into<Box<dyn std::error::Error + Send + Sync>> + 'static,
    {
        LeaseCacheBuilder::new(boxed_factory(create))
    }

    pub(crate) fn from_parts(
        name: &'static str,
        scope: &CancellationToken,
        policy: Box<dyn EvictionPolicy<K, E>>,
        factory: Factory<K, E>,
    ) -> Self {
        let runtime = Runtime::current();
        policy.bind();

        let scope = scope.child_token();
        let (counts_tx, _) = watch::channel(ElementCounts::default());
        event!(Level::DEBUG, message = "cache created", cache = name);

        Self {
            inner: Arc::new(CacheInner {
                name,
                state: Mutex::new(State::default()),
                cached: AtomicUsize::new(0),
                used: AtomicUsize::new(0),
                counts_tx,
                policy,
                factory,
                runtime,
                _close_on_drop: scope.clone().drop_guard(),
                scope,
            }),
        }
    }

    /// Checks out `key`, runs `body` with its element and releases the checkout afterwards.
    ///
    /// The checkout is released when `body` completes, and also when the returned future is
    /// dropped before that.
    ///
    /// # Errors
    ///
    /// Returns an error if the element factory fails or panics, or if the cache is closed.
    pub async fn use_element<R, B, Fut>(&self, key: K, body: B) -> Result<R>
    where
        B: FnOnce(E) -> Fut,
        Fut: Future<Output = R>,
    {
        let (claim, element) = self.inner.claim(key)?;
        let element = element.await?;
        let output = body(element).await;
        drop(claim);
        Ok(output)
    }

    /// Checks out every key in `keys`, runs `body` with all of their elements and releases them
    /// together afterwards.
    ///
    /// Duplicate keys are checked out once. `body` receives a map holding exactly the requested
    /// keys. If acquiring any element fails, every key already checked out is released.
    ///
    /// # Errors
    ///
    /// Returns the first error produced by an element factory, or [`Error::Closed`] if the cache
    /// is closed.
    pub async fn use_elements<I, R, B, Fut>(&self, keys: I, body: B) -> Result<R>
    where
        I: IntoIterator<Item = K>,
        B: FnOnce(HashMap<K, E>) -> Fut,
        Fut: Future<Output = R>,
    {
        let (claim, elements) = self.claim_all(keys).await?;
        let output = body(elements).await;
        drop(claim);
        Ok(output)
    }

    /// Checks out `key` and returns a [`Lease`] that releases the checkout when dropped.
    ///
    /// # Errors
    ///
    /// Returns an error if the element factory fails or panics, or if the cache is closed.
    pub async fn checkout(&self, key: K) -> Result<Lease<K, E>> {
        let (claim, element) = self.inner.claim(key)?;
        let element = element.await?;
        Ok(Lease::new(claim, element))
    }

    /// Checks out every key in `keys` and returns a [`LeaseSet`] releasing them together.
    ///
    /// # Errors
    ///
    /// Returns the first error produced by an element factory, or [`Error::Closed`] if the cache
    /// is closed.
    pub async fn checkout_all<I>(&self, keys: I) -> Result<LeaseSet<K, E>>
    where
        I: IntoIterator<Item = K>,
    {
        let (claim, elements) = self.claim_all(keys).await?;
        Ok(LeaseSet::new(claim, elements))
    }

    async fn claim_all<I>(&self, keys: I) -> Result<(Claim<K, E>, HashMap<K, E>)>
    where
        I: IntoIterator<Item = K>,
    {
        let mut seen = HashSet::new();
        let keys: Vec<K> = keys.into_iter().filter(|key| seen.insert(key.clone())).collect();

        let (claim, pending) = self.inner.claim_many(keys)?;
        let elements = try_join_all(pending).await?;
        let elements = claim.keys().cloned().zip(elements).collect();
        Ok((claim, elements))
    }

    /// Returns the number of live entries, whether in use, being created or idle.
    #[must_use]
    pub fn cached_elements_count(&self) -> usize {
        self.inner.cached.load(Ordering::Acquire)
    }

    /// Returns the number of entries with at least one open checkout.
    #[must_use]
    pub fn used_elements_count(&self) -> usize {
        self.inner.used.load(Ordering::Acquire)
    }

    /// Returns both counters from the same critical section.
    #[must_use]
    pub fn counts(&self) -> ElementCounts {
        self.inner.counts()
    }

    /// Subscribes to counter changes.
    ///
    /// The channel is updated inside the critical section of every checkout, release and
    /// destruction, so each observed value is a state the cache actually went through.
    #[must_use]
    pub fn watch_counts(&self) -> watch::Receiver<ElementCounts> {
        self.inner.counts_tx.subscribe()
    }

    /// Returns the lifecycle state of the entry for `key`, if one exists.
    #[must_use]
    pub fn state(&self, key: &K) -> Option<EntryState> {
        self.inner.state.lock().entries.get(key).map(Slot::state)
    }

    /// Returns the name used to identify this cache in logs.
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.inner.name
    }

    /// Closes the cache.
    ///
    /// Idle entries are destroyed immediately, running factories are cancelled and their waiters
    /// receive [`Error::Closed`], and entries still checked out are destroyed when released. New
    /// checkouts fail with [`Error::Closed`]. Closing an already closed cache does nothing.
    pub fn close(&self) {
        self.inner.close();
    }

    /// Returns `true` once the cache or its scope has been cancelled.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.scope.is_cancelled()
    }
}

struct State<K, E> {
    entries: HashMap<K, Slot<E>>,
    /// Idle keys ordered by the moment they became idle.
    idle: BTreeMap<u64, K>,
    used: usize,
    next_generation: u64,
    next_idle_seq: u64,
}

impl<K, E> Default for State<K, E> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
            idle: BTreeMap::new(),
            used: 0,
            next_generation: 0,
            next_idle_seq: 0,
        }
    }
}

impl<K, E> State<K, E> {
    fn counts(&self) -> ElementCounts {
        ElementCounts {
            cached: self.entries.len(),
            used: self.used,
        }
    }
}

impl<K: Eq + Hash, E> State<K, E> {
    fn destroy(&mut self, key: &K) -> bool {
        let Some(slot) = self.entries.remove(key) else {
            return false;
        };
        if slot.usage > 0 {
            self.used -= 1;
        }
        if let Some(seq) = slot.idle_seq() {
            self.idle.remove(&seq);
        }
        slot.teardown();
        true
    }
}

pub(crate) struct CacheInner<K, E> {
    name: &'static str,
    state: Mutex<State<K, E>>,
    cached: AtomicUsize,
    used: AtomicUsize,
    counts_tx: watch::Sender<ElementCounts>,
    policy: Box<dyn EvictionPolicy<K, E>>,
    factory: Factory<K, E>,
    runtime: Runtime,
    scope: CancellationToken,
    _close_on_drop: DropGuard,
}

impl<K, E> CacheInner<K, E> {
    fn counts(&self) -> ElementCounts {
        self.state.lock().counts()
    }

    /// Mirrors the table counters; must be called before the lock is released.
    fn publish(&self, state: &State<K, E>) {
        let counts = state.counts();
        self.cached.store(counts.cached, Ordering::Release);
        self.used.store(counts.used, Ordering::Release);
        self.counts_tx.send_replace(counts);
    }
}

impl<K, E> CacheInner<K, E>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    fn claim(self: &Arc<Self>, key: K) -> Result<(Claim<K, E>, ElementFuture<E>)> {
        let mut state = self.state.lock();
        if self.scope.is_cancelled() {
            return Err(Error::Closed);
        }
        let (generation, element) = self.acquire(&mut state, &key);
        self.publish(&state);
        Ok((Claim::new(Arc::clone(self), vec![(key, generation)]), element))
    }

    fn claim_many(self: &Arc<Self>, keys: Vec<K>) -> Result<(Claim<K, E>, Vec<ElementFuture<E>>)> {
        let mut state = self.state.lock();
        if self.scope.is_cancelled() {
            return Err(Error::Closed);
        }
        let mut claimed = Vec::with_capacity(keys.len());
        let mut pending = Vec::with_capacity(keys.len());
        for key in keys {
            let (generation, element) = self.acquire(&mut state, &key);
            claimed.push((key, generation));
            pending.push(element);
        }
        self.publish(&state);
        Ok((Claim::new(Arc::clone(self), claimed), pending))
    }

    fn acquire(self: &Arc<Self>, state: &mut State<K, E>, key: &K) -> (u64, ElementFuture<E>) {
        if let Some(slot) = state.entries.get_mut(key) {
            let acquired = slot.acquire();
            if let Some(seq) = acquired.idle_seq {
                state.idle.remove(&seq);
                event!(Level::TRACE, message = "reusing idle element", cache = self.name, generation = slot.generation);
            }
            if acquired.became_used {
                state.used += 1;
            }
            return (slot.generation, slot.element.clone());
        }

        let generation = state.next_generation;
        state.next_generation += 1;
        let (element, factory) = self.spawn_factory(key.clone(), generation);
        state.entries.insert(key.clone(), Slot::creating(generation, element.clone(), factory));
        state.used += 1;
        event!(Level::DEBUG, message = "creating element", cache = self.name, generation);
        (generation, element)
    }

    fn spawn_factory(self: &Arc<Self>, key: K, generation: u64) -> (ElementFuture<E>, tokio::task::AbortHandle) {
        let inner = Arc::downgrade(self);
        let factory = Arc::clone(&self.factory);
        let scope = self.scope.clone();

        let task = self.runtime.spawn(async move {
            let create = AssertUnwindSafe(async { factory(key.clone()).await }).catch_unwind();
            // Biased towards the factory: a value produced before cancellation is observed is
            // still delivered.
            let outcome = tokio::select! {
                biased;
                outcome = create => outcome.unwrap_or(Err(Error::FactoryPanicked)),
                () = scope.cancelled() => Err(Error::Closed),
            };
            if let Some(inner) = Weak::upgrade(&inner) {
                inner.on_created(&key, generation, &outcome);
            }
            outcome
        });

        let abort = task.abort_handle();
        let element = async move { task.await.unwrap_or(Err(Error::Closed)) }.boxed().shared();
        (element, abort)
    }

    fn on_created(&self, key: &K, generation: u64, outcome: &Result<E>) {
        let mut state = self.state.lock();
        let Some(slot) = state.entries.get_mut(key).filter(|slot| slot.generation == generation) else {
            return;
        };
        match outcome {
            Ok(value) => {
                slot.ready(value.clone());
                event!(Level::DEBUG, message = "element created", cache = self.name, generation);
            }
            Err(error) => {
                state.destroy(key);
                self.publish(&state);
                if error.is_closed() {
                    event!(Level::DEBUG, message = "element creation cancelled", cache = self.name, generation);
                } else {
                    event!(Level::WARN, message = "element creation failed", cache = self.name, generation, %error);
                }
            }
        }
    }

    pub(crate) fn release(self: &Arc<Self>, claimed: &[(K, u64)]) {
        let mut state = self.state.lock();
        for (key, generation) in claimed {
            self.release_one(&mut state, key, *generation);
        }
        self.publish(&state);
    }

    fn release_one(self: &Arc<Self>, state: &mut State<K, E>, key: &K, generation: u64) {
        let Some(slot) = state.entries.get_mut(key).filter(|slot| slot.generation == generation) else {
            // The entry failed or was torn down while checked out.
            return;
        };
        if !slot.release() {
            event!(Level::TRACE, message = "released element", cache = self.name, generation, usage = slot.usage);
            return;
        }
        state.used -= 1;

        if self.scope.is_cancelled() {
            state.destroy(key);
            return;
        }

        let counts = state.counts();
        let Some(slot) = state.entries.get_mut(key) else {
            return;
        };
        let retention = self.policy.on_unused(key, slot.value.as_ref(), counts);

        if retention.cache_until_expired {
            let seq = state.next_idle_seq;
            state.next_idle_seq += 1;
            let wait = self.policy.wait_for_expiration(key, slot.value.as_ref());
            let expiry = Expiry::new(self.scope.child_token(), wait);
            slot.retain(seq, expiry.clone());
            state.idle.insert(seq, key.clone());
            self.spawn_expiration(key.clone(), generation, seq, expiry);
            event!(Level::DEBUG, message = "retaining idle element", cache = self.name, generation, seq);
        } else {
            state.destroy(key);
            event!(Level::DEBUG, message = "destroyed unused element", cache = self.name, generation);
        }

        if retention.evict_oldest {
            self.evict_oldest(state, key);
        }
    }

    /// Destroys the idle entry that became idle earliest, skipping `except`.
    fn evict_oldest(&self, state: &mut State<K, E>, except: &K) {
        let victim = state.idle.values().find(|key| *key != except).cloned();
        if let Some(victim) = victim {
            let generation = state.entries.get(&victim).map(|slot| slot.generation);
            state.destroy(&victim);
            event!(Level::DEBUG, message = "evicted oldest idle element", cache = self.name, generation);
        }
    }

    fn spawn_expiration(self: &Arc<Self>, key: K, generation: u64, seq: u64, expiry: Expiry) {
        let inner = Arc::downgrade(self);
        // Detached: withdrawing the expiry or cancelling the scope stops the task.
        drop(self.runtime.spawn(async move {
            expiry.elapsed().await;
            if let Some(inner) = Weak::upgrade(&inner) {
                inner.expire(&key, generation, seq);
            }
        }));
    }

    /// Destroys the entry if it is still the same idle incarnation the expiration wait was for.
    fn expire(&self, key: &K, generation: u64, seq: u64) {
        let mut state = self.state.lock();
        let still_idle = state
            .entries
            .get(key)
            .is_some_and(|slot| slot.generation == generation && slot.idle_seq() == Some(seq));
        if still_idle {
            state.destroy(key);
            self.publish(&state);
            event!(Level::DEBUG, message = "idle element expired", cache = self.name, generation);
        }
    }

    fn close(&self) {
        self.scope.cancel();

        let mut state = self.state.lock();
        let unused: Vec<K> = state
            .entries
            .iter()
            .filter(|(_, slot)| slot.usage == 0)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &unused {
            state.destroy(key);
        }
        self.publish(&state);
        event!(Level::DEBUG, message = "cache closed", cache = self.name, destroyed = unused.len(), remaining = state.entries.len());
    }
}

#[cfg(test)]
mod tests {
    use std::convert::Infallible;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use super::*;
    use crate::CapacityBounded;

    fn counting_cache(max: usize) -> (LeaseCache<u32, u32>, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let cache = LeaseCache::new(CancellationToken::new(), CapacityBounded::new(max), move |key: u32| {
            counter.fetch_add(1, Ordering::AcqRel);
            async move { Ok::<_, Infallible>(key * 10) }
        });
        (cache, calls)
    }

    #[tokio::test]
    async fn idle_entry_is_reused() {
        let (cache, calls) = counting_cache(4);

        assert_eq!(cache.use_element(1, |e| async move { e }).await.unwrap(), 10);
        assert_eq!(cache.state(&1), Some(EntryState::Idle));
        assert_eq!(cache.use_element(1, |e| async move { e }).await.unwrap(), 10);
        assert_eq!(calls.load(Ordering::Acquire), 1);
    }

    #[tokio::test]
    async fn state_reports_active_while_checked_out() {
        let (cache, _) = counting_cache(4);
        let lease = cache.checkout(3).await.unwrap();
        assert_eq!(cache.state(&3), Some(EntryState::Active));
        drop(lease);
        assert_eq!(cache.state(&3), Some(EntryState::Idle));
        assert_eq!(cache.state(&4), None);
    }

    #[tokio::test]
    async fn idle_queue_tracks_retained_entries() {
        let (cache, _) = counting_cache(8);
        for key in [5, 2, 9] {
            cache.use_element(key, |_| async {}).await.unwrap();
        }
        let idle: Vec<u32> = cache.inner.state.lock().idle.values().copied().collect();
        assert_eq!(idle, vec![5, 2, 9]);

        cache.use_element(2, |_| async {}).await.unwrap();
        let idle: Vec<u32> = cache.inner.state.lock().idle.values().copied().collect();
        assert_eq!(idle, vec![5, 9, 2]);
    }

    #[tokio::test]
    async fn evict_oldest_never_picks_released_entry() {
        let (cache, _) = counting_cache(1);
        cache.use_element(1, |_| async {}).await.unwrap();
        cache.use_element(2, |_| async {}).await.unwrap();

        assert_eq!(cache.state(&1), None);
        assert_eq!(cache.state(&2), Some(EntryState::Idle));
        assert_eq!(cache.cached_elements_count(), 1);
    }

    #[tokio::test]
    async fn closed_cache_rejects_checkouts() {
        let (cache, _) = counting_cache(1);
        cache.close();
        assert!(cache.is_closed());
        let error = cache.checkout(1).await.unwrap_err();
        assert!(error.is_closed());
        assert_eq!(cache.counts(), ElementCounts::default());
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_last_handle_stops_expiration_tasks() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let policy = CapacityBounded::new(4).with_expiration(move |_: &u32, _: Option<&u32>| {
            let counter = Arc::clone(&counter);
            async move {
                tokio::time::sleep(Duration::from_secs(1)).await;
                counter.fetch_add(1, Ordering::AcqRel);
            }
        });
        let cache = LeaseCache::new(CancellationToken::new(), policy, |key: u32| async move { Ok::<_, Infallible>(key) });
        cache.use_element(1, |_| async {}).await.unwrap();
        drop(cache);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(calls.load(Ordering::Acquire), 0);
    }

    #[tokio::test]
    async fn debug_contains_name_and_counts() {
        let (cache, _) = counting_cache(1);
        let debug = format!("{cache:?}");
        assert!(debug.contains("LeaseCache"), "got: {debug}");
        assert!(debug.contains("leasecache"), "got: {debug}");
        assert!(debug.contains("cached: 0"), "got: {debug}");
    }
}
