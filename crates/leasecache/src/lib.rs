// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![cfg_attr(docsrs, feature(doc_cfg))]

//! A reference-counted, lazily populated async cache of shared elements.
//!
//! [`LeaseCache`] hands out elements for a bounded period of time, a *checkout*. The first
//! checkout of a key creates the element with a caller-supplied async factory; concurrent
//! checkouts of the same key wait for that single computation instead of starting their own.
//! Elements stay alive while they are checked out. Once the last checkout of an element is
//! released, an [`EvictionPolicy`] decides whether the element is destroyed or kept around so a
//! later checkout can reuse it.
//!
//! # When to Use
//!
//! Use `LeaseCache` for objects that are expensive to create, cheap to share and bounded in
//! number: per-user coordinators, connection-like handles, parsed configuration or verdicts of
//! slow remote checks. It counts *elements*, not bytes.
//!
//! # Example
//!
//! ```
//! use std::convert::Infallible;
//! use std::sync::Arc;
//!
//! use leasecache::{CapacityBounded, LeaseCache};
//! use tokio_util::sync::CancellationToken;
//!
//! # #[tokio::main]
//! # async fn main() -> leasecache::Result<()> {
//! let cache = LeaseCache::new(CancellationToken::new(), CapacityBounded::new(2), |name: &'static str| async move {
//!     // Expensive work runs once per key, however many callers ask concurrently.
//!     Ok::<_, Infallible>(Arc::new(name.to_uppercase()))
//! });
//!
//! let (a, b) = tokio::join!(
//!     cache.use_element("alpha", |value| async move { value }),
//!     cache.use_element("alpha", |value| async move { value }),
//! );
//! assert!(Arc::ptr_eq(&a?, &b?));
//!
//! let total = cache
//!     .use_elements(["alpha", "beta"], |values| async move { values.values().map(|v| v.len()).sum::<usize>() })
//!     .await?;
//! assert_eq!(total, 9);
//! # Ok(())
//! # }
//! ```
//!
//! # Cancellation Safety
//!
//! Checkouts are released in `Drop`. Dropping a `use_element` future, a [`Lease`] or a
//! [`LeaseSet`] at any point releases exactly the checkouts it registered. Element factories and
//! expiration waits run on tasks owned by the cache, so a cancelled caller never cancels work
//! that other callers are waiting for.
//!
//! # Eviction Policies
//!
//! - [`CapacityBounded`] retains idle elements and evicts the oldest idle one once the cache holds
//!   more than a configured number of entries. Idle elements can optionally expire after a delay.
//! - [`SignalDriven`] retains idle elements until an external controller calls
//!   [`DropHandle::drop_unused`].
//!
//! Custom policies implement [`EvictionPolicy`].
//!
//! # Teardown
//!
//! A cache works on a child of the [`CancellationToken`](tokio_util::sync::CancellationToken) it
//! was created with. Cancelling that token, calling [`LeaseCache::close`], or dropping the last
//! handle and lease tears down every entry and task the cache owns.

mod builder;
mod cache;
mod counts;
mod entry;
mod error;
mod lease;
mod policy;
mod runtime;

pub use builder::LeaseCacheBuilder;
pub use cache::LeaseCache;
pub use counts::ElementCounts;
pub use entry::EntryState;
pub use error::{Error, Result};
pub use lease::{Lease, LeaseSet};
pub use policy::{BindOnce, CapacityBounded, DropHandle, EvictionPolicy, Retention, SignalDriven};
