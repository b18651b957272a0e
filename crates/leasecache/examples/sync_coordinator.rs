// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Demonstrates per-user sync coordinators shared through `LeaseCache`.
//!
//! Every user gets one coordinator while anything is checking whether that user needs a
//! background sync. Idle coordinators linger for a short delay so bursts of checks reuse them.
//! A controller drives a `SignalDriven` policy for registrations, dropping idle ones when more
//! than two are retained.

use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use leasecache::{CapacityBounded, LeaseCache, SignalDriven};
use tokio_util::sync::CancellationToken;

#[derive(Debug)]
struct SyncCoordinator {
    user: u64,
    checks: AtomicUsize,
}

impl SyncCoordinator {
    fn is_sync_needed(&self) -> bool {
        self.checks.fetch_add(1, Ordering::SeqCst) % 3 == 0
    }
}

#[tokio::main]
async fn main() {
    let scope = CancellationToken::new();

    let coordinators = LeaseCache::builder(|user: u64| async move {
        println!("  creating coordinator for user {user}");
        Ok::<_, std::io::Error>(Arc::new(SyncCoordinator {
            user,
            checks: AtomicUsize::new(0),
        }))
    })
    .name("sync")
    .scope(&scope)
    .policy(CapacityBounded::new(64).with_idle_timeout(Duration::from_millis(200)))
    .build();

    println!("Six overlapping sync checks for two users...");
    let handles: Vec<_> = (0..6_u64)
        .map(|i| {
            let coordinators = coordinators.clone();
            tokio::spawn(async move {
                coordinators
                    .use_element(i % 2, |coordinator| async move {
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        (coordinator.user, coordinator.is_sync_needed())
                    })
                    .await
            })
        })
        .collect();
    for handle in handles {
        let (user, needed) = handle.await.expect("Task panicked").expect("check failed");
        println!("  user {user}: sync needed = {needed}");
    }
    println!("Coordinators: {:?}", coordinators.counts());

    tokio::time::sleep(Duration::from_millis(300)).await;
    println!("After the idle delay: {:?}", coordinators.counts());

    let (policy, handle) = SignalDriven::new();
    let registrations = LeaseCache::builder(|user: u64| async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        Ok::<_, std::io::Error>(format!("registration-{user}"))
    })
    .name("registrations")
    .scope(&scope)
    .policy(policy)
    .build();

    let controller = {
        let mut counts = registrations.watch_counts();
        tokio::spawn(async move {
            while counts.changed().await.is_ok() {
                let idle = counts.borrow_and_update().idle();
                if idle > 2 {
                    let dropped = handle.drop_unused(idle - 2);
                    println!("  controller dropped {dropped} idle registration(s)");
                }
            }
        })
    };

    for user in 1..=5 {
        let id = registrations
            .use_element(user, |id| async move { id })
            .await
            .expect("registration failed");
        println!("Registered {id}");
        tokio::task::yield_now().await;
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    println!("Registrations: {:?}", registrations.counts());

    scope.cancel();
    drop(registrations);
    controller.await.expect("Task panicked");
    println!("Scope cancelled; coordinators closed = {}", coordinators.is_closed());
}
