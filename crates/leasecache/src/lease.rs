// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! RAII guards over open checkouts.

use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::ops::Deref;
use std::sync::Arc;

use crate::cache::CacheInner;

/// The checkouts registered by one operation, released together on drop.
///
/// Release lives in `Drop` so that it also happens when the future holding the claim is dropped
/// mid-await.
pub(crate) struct Claim<K, E>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    inner: Arc<CacheInner<K, E>>,
    keys: Vec<(K, u64)>,
}

impl<K, E> Claim<K, E>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    pub(crate) fn new(inner: Arc<CacheInner<K, E>>, keys: Vec<(K, u64)>) -> Self {
        Self { inner, keys }
    }

    /// The claimed keys, in the order they were supplied.
    pub(crate) fn keys(&self) -> impl Iterator<Item = &K> {
        self.keys.iter().map(|(key, _)| key)
    }
}

impl<K, E> Drop for Claim<K, E>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    fn drop(&mut self) {
        self.inner.release(&self.keys);
    }
}

/// An open checkout of a single element.
///
/// Dereferences to the element. Dropping the lease releases the checkout, after which the
/// cache's eviction policy decides whether the element stays cached.
///
/// # Examples
///
/// ```
/// use leasecache::LeaseCache;
///
/// # #[tokio::main]
/// # async fn main() -> leasecache::Result<()> {
/// let cache = LeaseCache::builder(|n: u32| async move { Ok::<_, std::io::Error>(n + 1) }).build();
///
/// let lease = cache.checkout(41).await?;
/// assert_eq!(*lease, 42);
/// assert_eq!(cache.used_elements_count(), 1);
///
/// drop(lease);
/// assert_eq!(cache.used_elements_count(), 0);
/// # Ok(())
/// # }
/// ```
pub struct Lease<K, E>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    element: E,
    claim: Claim<K, E>,
}

impl<K, E> Lease<K, E>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    pub(crate) fn new(claim: Claim<K, E>, element: E) -> Self {
        Self { element, claim }
    }

    /// Returns the key this lease was checked out for.
    #[must_use]
    pub fn key(&self) -> &K {
        &self.claim.keys[0].0
    }

    /// Returns the leased element.
    #[must_use]
    pub fn element(&self) -> &E {
        &self.element
    }
}

impl<K, E> Deref for Lease<K, E>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    type Target = E;

    fn deref(&self) -> &Self::Target {
        &self.element
    }
}

impl<K, E> Debug for Lease<K, E>
where
    K: Clone + Eq + Hash + Send + Sync + Debug + 'static,
    E: Clone + Send + Sync + Debug + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease")
            .field("key", self.key())
            .field("element", &self.element)
            .finish_non_exhaustive()
    }
}

/// Open checkouts of several elements, released together when dropped.
///
/// Every key is released under a single lock acquisition, in the order the keys were supplied.
pub struct LeaseSet<K, E>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    elements: HashMap<K, E>,
    claim: Claim<K, E>,
}

impl<K, E> LeaseSet<K, E>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    pub(crate) fn new(claim: Claim<K, E>, elements: HashMap<K, E>) -> Self {
        Self { elements, claim }
    }

    /// Returns the element leased for `key`.
    #[must_use]
    pub fn get(&self, key: &K) -> Option<&E> {
        self.elements.get(key)
    }

    /// Returns all leased elements by key.
    #[must_use]
    pub fn elements(&self) -> &HashMap<K, E> {
        &self.elements
    }

    /// Returns the number of distinct keys leased.
    #[must_use]
    pub fn len(&self) -> usize {
        self.elements.len()
    }

    /// Returns `true` if no keys were leased.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    /// Iterates over the leased keys and elements, in the order the keys were supplied.
    pub fn iter(&self) -> impl Iterator<Item = (&K, &E)> {
        self.claim.keys().filter_map(|key| self.elements.get_key_value(key))
    }
}

impl<K, E> Debug for LeaseSet<K, E>
where
    K: Clone + Eq + Hash + Send + Sync + Debug + 'static,
    E: Clone + Send + Sync + Debug + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaseSet")
            .field("elements", &self.elements)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::convert::Infallible;

    use tokio_util::sync::CancellationToken;

    use crate::{CapacityBounded, LeaseCache};

    fn cache() -> LeaseCache<u32, String> {
        LeaseCache::new(CancellationToken::new(), CapacityBounded::new(8), |key: u32| async move {
            Ok::<_, Infallible>(format!("element {key}"))
        })
    }

    #[tokio::test]
    async fn lease_exposes_key_and_element() {
        let cache = cache();
        let lease = cache.checkout(3).await.unwrap();
        assert_eq!(*lease.key(), 3);
        assert_eq!(lease.element(), "element 3");
        assert_eq!(lease.len(), "element 3".len());

        let debug = format!("{lease:?}");
        assert!(debug.contains("element 3"), "got: {debug}");
    }

    #[tokio::test]
    async fn lease_set_iterates_in_supplied_order() {
        let cache = cache();
        let set = cache.checkout_all([9, 2, 9, 5]).await.unwrap();
        assert_eq!(set.len(), 3);
        assert!(!set.is_empty());
        assert_eq!(set.get(&2).map(String::as_str), Some("element 2"));
        assert!(set.get(&4).is_none());

        let keys: Vec<u32> = set.iter().map(|(key, _)| *key).collect();
        assert_eq!(keys, vec![9, 2, 5]);
        assert_eq!(cache.used_elements_count(), 3);

        drop(set);
        assert_eq!(cache.used_elements_count(), 0);
        assert_eq!(cache.cached_elements_count(), 3);
    }

    #[tokio::test]
    async fn empty_lease_set() {
        let cache = cache();
        let set = cache.checkout_all(Vec::new()).await.unwrap();
        assert!(set.is_empty());
        assert!(set.elements().is_empty());
        assert_eq!(cache.counts(), crate::ElementCounts::default());
    }
}
