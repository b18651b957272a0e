// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::collections::VecDeque;
use std::sync::Arc;

use futures_channel::oneshot;
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use parking_lot::Mutex;

use crate::ElementCounts;
use crate::policy::{BindOnce, EvictionPolicy, Retention};

#[derive(Debug, Default)]
struct Waiters {
    next_id: u64,
    queue: VecDeque<(u64, oneshot::Sender<()>)>,
}

/// Retains idle elements until an external controller tells the cache to drop some.
///
/// Every idle element waits in a FIFO queue. [`DropHandle::drop_unused`] releases the waiters
/// that joined the queue earliest, and each released waiter destroys exactly one idle element.
/// Checking an idle element out again removes its waiter from the queue.
///
/// A controller usually watches [`LeaseCache::watch_counts`](crate::LeaseCache::watch_counts) and
/// decides how many idle elements to drop based on resource pressure outside the cache.
///
/// # Examples
///
/// ```
/// use leasecache::{LeaseCache, SignalDriven};
/// use tokio_util::sync::CancellationToken;
///
/// # #[tokio::main]
/// # async fn main() -> leasecache::Result<()> {
/// let (policy, handle) = SignalDriven::new();
/// let cache = LeaseCache::new(CancellationToken::new(), policy, |id: u32| async move {
///     Ok::<_, std::convert::Infallible>(id * 10)
/// });
///
/// cache.use_element(1, |value| async move { assert_eq!(value, 10) }).await?;
/// assert_eq!(cache.cached_elements_count(), 1);
///
/// assert_eq!(handle.drop_unused(1), 1);
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct SignalDriven {
    waiters: Arc<Mutex<Waiters>>,
    binding: BindOnce,
}

/// Control surface of a [`SignalDriven`] policy.
#[derive(Debug, Clone)]
pub struct DropHandle {
    waiters: Arc<Mutex<Waiters>>,
}

impl SignalDriven {
    /// Creates the policy together with the handle that controls it.
    #[must_use]
    #[expect(clippy::new_ret_no_self, reason = "the policy is useless without its handle")]
    pub fn new() -> (Self, DropHandle) {
        let waiters = Arc::new(Mutex::new(Waiters::default()));
        let policy = Self {
            waiters: Arc::clone(&waiters),
            binding: BindOnce::new(),
        };
        (policy, DropHandle { waiters })
    }
}

impl DropHandle {
    /// Destroys up to `count` idle elements, oldest first.
    ///
    /// Returns how many waiters were released. Fewer than `count` are released when fewer
    /// elements are idle.
    pub fn drop_unused(&self, count: usize) -> usize {
        let mut waiters = self.waiters.lock();
        let mut released = 0;
        while released < count {
            let Some((_, sender)) = waiters.queue.pop_front() else {
                break;
            };
            // A closed receiver belongs to a wait that is being cancelled right now.
            if sender.send(()).is_ok() {
                released += 1;
            }
        }
        released
    }

    /// Returns the number of idle elements waiting to be dropped.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.waiters.lock().queue.len()
    }
}

/// Removes a waiter from the queue when its wait is dropped before being released.
struct WaiterGuard {
    waiters: Arc<Mutex<Waiters>>,
    id: u64,
}

impl Drop for WaiterGuard {
    fn drop(&mut self) {
        let mut waiters = self.waiters.lock();
        if let Some(position) = waiters.queue.iter().position(|(id, _)| *id == self.id) {
            waiters.queue.remove(position);
        }
    }
}

impl<K, E> EvictionPolicy<K, E> for SignalDriven {
    fn on_unused(&self, _key: &K, _element: Option<&E>, _counts: ElementCounts) -> Retention {
        Retention::retain()
    }

    fn wait_for_expiration(&self, _key: &K, _element: Option<&E>) -> BoxFuture<'static, ()> {
        let (sender, receiver) = oneshot::channel();
        let id = {
            let mut waiters = self.waiters.lock();
            let id = waiters.next_id;
            waiters.next_id = waiters.next_id.wrapping_add(1);
            waiters.queue.push_back((id, sender));
            id
        };
        let guard = WaiterGuard {
            waiters: Arc::clone(&self.waiters),
            id,
        };

        async move {
            let _guard = guard;
            // A dropped sender means the policy is gone; expiring is the only sensible outcome.
            let _ = receiver.await;
        }
        .boxed()
    }

    fn bind(&self) {
        self.binding.bind();
    }
}
