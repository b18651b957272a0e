// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Demonstrates a certificate allowlist checker backed by `LeaseCache`.
//!
//! Looking up a package verdict is slow, so verdicts are cached per package. Concurrent checks of
//! the same package share one lookup. Resolved verdicts expire after a period of disuse, while
//! unknown verdicts stay pinned until capacity pressure evicts them.

use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use futures_util::{FutureExt, future::BoxFuture};
use leasecache::{CapacityBounded, ElementCounts, EvictionPolicy, LeaseCache, Retention};
use tracing::Level;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verdict {
    Allowed,
    Denied,
    Unknown,
}

#[derive(Debug)]
struct VerdictRetention {
    resolved: CapacityBounded<String, Verdict>,
}

impl EvictionPolicy<String, Verdict> for VerdictRetention {
    fn on_unused(&self, key: &String, element: Option<&Verdict>, counts: ElementCounts) -> Retention {
        self.resolved.on_unused(key, element, counts)
    }

    fn wait_for_expiration(&self, key: &String, element: Option<&Verdict>) -> BoxFuture<'static, ()> {
        match element {
            // No verdict yet means the lookup outlived its callers; keep it like an unknown one.
            Some(Verdict::Unknown) | None => std::future::pending().boxed(),
            _ => self.resolved.wait_for_expiration(key, element),
        }
    }

    fn bind(&self) {
        EvictionPolicy::<String, Verdict>::bind(&self.resolved);
    }
}

async fn lookup(package: String, lookups: Arc<AtomicUsize>) -> Result<Verdict, std::io::Error> {
    let count = lookups.fetch_add(1, Ordering::SeqCst) + 1;
    println!("  looking up {package} (lookup #{count})");
    tokio::time::sleep(Duration::from_millis(300)).await;

    Ok(if package.starts_with("contoso.") {
        Verdict::Allowed
    } else if package.starts_with("fabrikam.") {
        Verdict::Denied
    } else {
        Verdict::Unknown
    })
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt().with_max_level(Level::DEBUG).init();

    let lookups = Arc::new(AtomicUsize::new(0));
    let verdicts = {
        let lookups = Arc::clone(&lookups);
        LeaseCache::builder(move |package: String| lookup(package, Arc::clone(&lookups)))
            .name("allowlist")
            .policy(VerdictRetention {
                resolved: CapacityBounded::new(32).with_idle_timeout(Duration::from_millis(500)),
            })
            .build()
    };

    println!("Checking contoso.mail from 5 callers at once...");
    let handles: Vec<_> = (1..=5)
        .map(|caller| {
            let verdicts = verdicts.clone();
            tokio::spawn(async move {
                let verdict = verdicts
                    .use_element("contoso.mail".to_string(), |verdict| async move { verdict })
                    .await
                    .expect("lookup failed");
                println!("  [caller {caller}] contoso.mail is {verdict:?}");
            })
        })
        .collect();
    for handle in handles {
        handle.await.expect("Task panicked");
    }

    for package in ["fabrikam.games", "northwind.tools"] {
        let verdict = verdicts
            .use_element(package.to_string(), |verdict| async move { verdict })
            .await
            .expect("lookup failed");
        println!("{package} is {verdict:?}");
    }
    println!("Cached verdicts: {:?}", verdicts.counts());

    tokio::time::sleep(Duration::from_secs(1)).await;
    println!("After a second of disuse: {:?}", verdicts.counts());

    verdicts.close();
    println!("Closed. {} lookup(s) served 7 checks.", lookups.load(Ordering::SeqCst));
}
