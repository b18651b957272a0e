// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Runtime abstraction for the tasks owned by a cache.

use tokio::runtime::Handle;
use tokio::task::JoinHandle;

/// Spawns cache-owned tasks onto the runtime the cache was created in.
///
/// Releases happen in `Drop`, which may run on any thread, so the handle is captured eagerly
/// instead of relying on an ambient runtime context at spawn time.
#[derive(Debug, Clone)]
pub(crate) struct Runtime {
    handle: Handle,
}

impl Runtime {
    /// # Panics
    ///
    /// Panics if called outside of a Tokio runtime context.
    #[must_use]
    pub(crate) fn current() -> Self {
        Self { handle: Handle::current() }
    }

    pub(crate) fn spawn<T>(&self, work: impl Future<Output = T> + Send + 'static) -> JoinHandle<T>
    where
        T: Send + 'static,
    {
        self.handle.spawn(work)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn spawn_runs_work() {
        let runtime = Runtime::current();
        let value = runtime.spawn(async { 1 + 1 }).await.unwrap();
        assert_eq!(value, 2);
    }

    #[test]
    fn spawn_from_foreign_thread() {
        let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
        let runtime = rt.block_on(async { Runtime::current() });

        let handle = std::thread::spawn(move || runtime.spawn(async { 7 })).join().unwrap();
        assert_eq!(rt.block_on(handle).unwrap(), 7);
    }

    #[test]
    #[should_panic]
    fn current_outside_runtime_panics() {
        let _ = Runtime::current();
    }
}
