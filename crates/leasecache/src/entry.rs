// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Per-key slots and their lifecycle transitions.
//!
//! A slot moves through `Creating -> Active <-> Idle` and is destroyed by removing it from the
//! cache table. Every transition is a method on [`Slot`] and is only ever called with the cache
//! lock held.

use std::fmt::Debug;
use std::future::poll_fn;
use std::sync::Arc;
use std::task::Poll;

use futures_util::future::{BoxFuture, Shared};
use parking_lot::Mutex;
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;

use crate::Result;

/// The shared outcome of the factory task, awaited by every checkout of one entry.
pub(crate) type ElementFuture<E> = Shared<BoxFuture<'static, Result<E>>>;

/// Observable lifecycle state of a cached entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryState {
    /// The element factory is still running and the entry has open checkouts.
    Creating,
    /// The element is available and the entry has open checkouts.
    Active,
    /// The entry has no checkouts and is retained until its expiration wait completes.
    Idle,
}

/// The expiration wait of an idle slot.
///
/// The wait future is shared with the task that polls it, so withdrawing drops the future right
/// away under the cache lock. Anything the policy ties to the future, such as a queued waiter, is
/// gone before the checkout that withdrew it returns.
#[derive(Clone)]
pub(crate) struct Expiry {
    token: CancellationToken,
    wait: Arc<Mutex<Option<BoxFuture<'static, ()>>>>,
}

impl Expiry {
    pub(crate) fn new(token: CancellationToken, wait: BoxFuture<'static, ()>) -> Self {
        Self {
            token,
            wait: Arc::new(Mutex::new(Some(wait))),
        }
    }

    /// Drops the wait and wakes the task driving it.
    pub(crate) fn withdraw(&self) {
        let wait = self.wait.lock().take();
        drop(wait);
        self.token.cancel();
    }

    /// Completes once the wait elapsed, was withdrawn or its token was cancelled.
    pub(crate) async fn elapsed(&self) {
        let wait = poll_fn(|cx| {
            let mut slot = self.wait.lock();
            let Some(wait) = slot.as_mut() else {
                return Poll::Ready(());
            };
            let poll = wait.as_mut().poll(cx);
            if poll.is_ready() {
                *slot = None;
            }
            poll
        });
        tokio::select! {
            biased;
            () = self.token.cancelled() => {},
            () = wait => {},
        }
    }
}

impl Debug for Expiry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Expiry")
            .field("cancelled", &self.token.is_cancelled())
            .field("waiting", &self.wait.lock().is_some())
            .finish()
    }
}

#[derive(Debug)]
pub(crate) enum Phase {
    Creating,
    Active,
    Idle { seq: u64, expiry: Expiry },
}

/// What changed when a checkout was added to a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Acquired {
    pub(crate) became_used: bool,
    pub(crate) idle_seq: Option<u64>,
}

pub(crate) struct Slot<E> {
    pub(crate) generation: u64,
    pub(crate) usage: usize,
    pub(crate) phase: Phase,
    pub(crate) value: Option<E>,
    pub(crate) element: ElementFuture<E>,
    factory: AbortHandle,
}

impl<E> Slot<E> {
    /// A freshly inserted slot, already holding the checkout that created it.
    pub(crate) fn creating(generation: u64, element: ElementFuture<E>, factory: AbortHandle) -> Self {
        Self {
            generation,
            usage: 1,
            phase: Phase::Creating,
            value: None,
            element,
            factory,
        }
    }

    pub(crate) fn state(&self) -> EntryState {
        match self.phase {
            Phase::Creating => EntryState::Creating,
            Phase::Active => EntryState::Active,
            Phase::Idle { .. } => EntryState::Idle,
        }
    }

    pub(crate) fn acquire(&mut self) -> Acquired {
        let next = if self.value.is_some() { Phase::Active } else { Phase::Creating };
        let idle_seq = match std::mem::replace(&mut self.phase, next) {
            Phase::Idle { seq, expiry } => {
                expiry.withdraw();
                Some(seq)
            }
            Phase::Creating | Phase::Active => None,
        };
        self.usage += 1;
        Acquired {
            became_used: self.usage == 1,
            idle_seq,
        }
    }

    /// Returns `true` when the last checkout was released.
    pub(crate) fn release(&mut self) -> bool {
        debug_assert!(self.usage > 0, "released a slot without checkouts");
        self.usage = self.usage.saturating_sub(1);
        self.usage == 0
    }

    pub(crate) fn retain(&mut self, seq: u64, expiry: Expiry) {
        debug_assert_eq!(self.usage, 0, "retained a slot that is still in use");
        self.phase = Phase::Idle { seq, expiry };
    }

    pub(crate) fn ready(&mut self, value: E) {
        self.value = Some(value);
        if matches!(self.phase, Phase::Creating) {
            self.phase = Phase::Active;
        }
    }

    pub(crate) fn idle_seq(&self) -> Option<u64> {
        match self.phase {
            Phase::Idle { seq, .. } => Some(seq),
            Phase::Creating | Phase::Active => None,
        }
    }

    /// Stops every task still working on behalf of this slot.
    pub(crate) fn teardown(self) {
        if let Phase::Idle { expiry, .. } = self.phase {
            expiry.withdraw();
        }
        self.factory.abort();
    }
}
