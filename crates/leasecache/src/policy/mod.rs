// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Eviction policies deciding how long idle elements stay cached.
//!
//! A cache consults its policy whenever the last checkout of an entry is released:
//!
//! 1. [`EvictionPolicy::on_unused`] runs synchronously and returns a [`Retention`] decision:
//!    destroy the entry now, or retain it until its expiration wait completes, and optionally
//!    evict the oldest *other* idle entry to relieve capacity pressure.
//! 2. For retained entries, [`EvictionPolicy::wait_for_expiration`] returns a future that the
//!    cache drives on its own scope. When it completes, the entry is destroyed. If the entry is
//!    checked out again, evicted, or the cache is closed first, the future is dropped.
//!
//! Two policies are built in: [`CapacityBounded`] and [`SignalDriven`].

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures_util::future::BoxFuture;

use crate::ElementCounts;

mod capacity;
mod signal;

pub use capacity::CapacityBounded;
pub use signal::{DropHandle, SignalDriven};

/// Decides the fate of entries whose usage count drops to zero.
///
/// Policies are invoked only by the cache they are bound to. Each cache calls
/// [`bind`](Self::bind) exactly once on construction; policies that keep per-cache state must
/// reject a second binding, which the [`BindOnce`] helper does.
pub trait EvictionPolicy<K, E>: Send + Sync + 'static {
    /// Called while the cache lock is held, right after the last checkout of `key` was released.
    ///
    /// `element` is `None` while the element is still being created. `counts.cached` includes the
    /// released entry; `counts.used` no longer does.
    fn on_unused(&self, key: &K, element: Option<&E>, counts: ElementCounts) -> Retention;

    /// Returns a future that completes once the idle entry for `key` should be destroyed.
    ///
    /// Called while the cache lock is held, immediately after [`on_unused`](Self::on_unused)
    /// decided to retain the entry. A future that never completes keeps the entry until capacity
    /// pressure evicts it or the cache closes.
    fn wait_for_expiration(&self, key: &K, element: Option<&E>) -> BoxFuture<'static, ()>;

    /// Called once when the policy is attached to a cache.
    ///
    /// # Panics
    ///
    /// Implementations panic if the policy is already attached to another cache.
    fn bind(&self) {}
}

impl<K, E, P> EvictionPolicy<K, E> for Arc<P>
where
    P: EvictionPolicy<K, E> + ?Sized,
{
    fn on_unused(&self, key: &K, element: Option<&E>, counts: ElementCounts) -> Retention {
        (**self).on_unused(key, element, counts)
    }

    fn wait_for_expiration(&self, key: &K, element: Option<&E>) -> BoxFuture<'static, ()> {
        (**self).wait_for_expiration(key, element)
    }

    fn bind(&self) {
        (**self).bind();
    }
}

impl<K, E> EvictionPolicy<K, E> for Box<dyn EvictionPolicy<K, E>>
where
    K: 'static,
    E: 'static,
{
    fn on_unused(&self, key: &K, element: Option<&E>, counts: ElementCounts) -> Retention {
        (**self).on_unused(key, element, counts)
    }

    fn wait_for_expiration(&self, key: &K, element: Option<&E>) -> BoxFuture<'static, ()> {
        (**self).wait_for_expiration(key, element)
    }

    fn bind(&self) {
        (**self).bind();
    }
}

/// The decision returned by [`EvictionPolicy::on_unused`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Retention {
    /// Keep the entry until the expiration wait completes; `false` destroys it immediately.
    pub cache_until_expired: bool,
    /// Additionally destroy the idle entry that became idle earliest, never the released one.
    pub evict_oldest: bool,
}

impl Retention {
    /// Retains the entry until it expires, without evicting anything else.
    #[must_use]
    pub const fn retain() -> Self {
        Self {
            cache_until_expired: true,
            evict_oldest: false,
        }
    }

    /// Destroys the entry immediately.
    #[must_use]
    pub const fn destroy() -> Self {
        Self {
            cache_until_expired: false,
            evict_oldest: false,
        }
    }

    /// Sets whether the oldest other idle entry is evicted as well.
    #[must_use]
    pub const fn with_evict_oldest(mut self, evict_oldest: bool) -> Self {
        self.evict_oldest = evict_oldest;
        self
    }
}

/// Guards a policy against being bound to more than one cache.
#[derive(Debug, Default)]
pub struct BindOnce(AtomicBool);

impl BindOnce {
    /// Creates an unbound guard.
    #[must_use]
    pub const fn new() -> Self {
        Self(AtomicBool::new(false))
    }

    /// Marks the policy as bound.
    ///
    /// # Panics
    ///
    /// Panics if called more than once.
    pub fn bind(&self) {
        let already_bound = self.0.swap(true, Ordering::AcqRel);
        assert!(!already_bound, "eviction policy is already bound to a cache");
    }

    /// Returns whether [`bind`](Self::bind) has been called.
    #[must_use]
    pub fn is_bound(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}
