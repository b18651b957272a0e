// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Builder for configuring a [`LeaseCache`].

use std::fmt::Debug;
use std::hash::Hash;

use tokio_util::sync::CancellationToken;

use crate::cache::{Factory, LeaseCache};
use crate::policy::{CapacityBounded, EvictionPolicy};

pub(crate) const DEFAULT_NAME: &str = "leasecache";

/// Number of idle elements the default policy retains.
pub(crate) const DEFAULT_MAX_CACHE_SIZE: usize = 16;

/// Builder for configuring a [`LeaseCache`].
///
/// Created with [`LeaseCache::builder`]. Without further configuration the cache runs on a fresh
/// scope, is named `"leasecache"` and retains up to 16 idle elements with a
/// [`CapacityBounded`] policy that never expires them on its own.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
///
/// use leasecache::{CapacityBounded, LeaseCache};
/// use tokio_util::sync::CancellationToken;
///
/// # #[tokio::main]
/// # async fn main() {
/// let scope = CancellationToken::new();
/// let cache = LeaseCache::builder(|path: String| async move { Ok::<_, std::io::Error>(path.len()) })
///     .name("path-lengths")
///     .scope(&scope)
///     .policy(CapacityBounded::new(64).with_idle_timeout(Duration::from_secs(10)))
///     .build();
///
/// scope.cancel();
/// assert!(cache.is_closed());
/// # }
/// ```
pub struct LeaseCacheBuilder<K, E> {
    name: &'static str,
    scope: Option<CancellationToken>,
    policy: Option<Box<dyn EvictionPolicy<K, E>>>,
    factory: Factory<K, E>,
}

impl<K, E> LeaseCacheBuilder<K, E>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    pub(crate) fn new(factory: Factory<K, E>) -> Self {
        Self {
            name: DEFAULT_NAME,
            scope: None,
            policy: None,
            factory,
        }
    }

    /// Sets the name identifying the cache in logs.
    #[must_use]
    pub fn name(mut self, name: &'static str) -> Self {
        self.name = name;
        self
    }

    /// Ties the lifetime of the cache to `scope`.
    ///
    /// The cache works on a child token: cancelling `scope` closes the cache, while closing the
    /// cache leaves `scope` untouched.
    #[must_use]
    pub fn scope(mut self, scope: &CancellationToken) -> Self {
        self.scope = Some(scope.clone());
        self
    }

    /// Sets the eviction policy.
    #[must_use]
    pub fn policy(mut self, policy: impl EvictionPolicy<K, E>) -> Self {
        self.policy = Some(Box::new(policy));
        self
    }

    /// Builds the cache.
    ///
    /// # Panics
    ///
    /// Panics if called outside of a Tokio runtime context, or if the policy is already bound to
    /// another cache.
    #[must_use]
    pub fn build(self) -> LeaseCache<K, E> {
        let scope = self.scope.unwrap_or_default();
        let policy = self
            .policy
            .unwrap_or_else(|| Box::new(CapacityBounded::new(DEFAULT_MAX_CACHE_SIZE)));
        LeaseCache::from_parts(self.name, &scope, policy, self.factory)
    }
}

impl<K, E> Debug for LeaseCacheBuilder<K, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaseCacheBuilder")
            .field("name", &self.name)
            .field("scope", &self.scope)
            .field("custom_policy", &self.policy.is_some())
            .finish_non_exhaustive()
    }
}
