// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Integration tests for the distributed lock.

use std::{
    sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    },
    time::Duration,
};

use pantry::{Error, LockClient, LockOptions, LockState, Scoped};
use pantry_store::{Store, memory::MemoryStore};

type TestResult = Result<(), Error>;

fn client() -> (MemoryStore, LockClient<MemoryStore>) {
    let store = MemoryStore::new();
    (store.clone(), LockClient::new(store))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_non_blocking_acquires_have_one_winner() -> TestResult {
    let (_, locks) = client();

    let attempts: Vec<_> = (0..16)
        .map(|_| {
            let mut lock = locks.lock("inventory", LockOptions::new());
            tokio::spawn(async move {
                let acquired = lock.acquire(false).await?;
                Ok::<_, Error>((acquired, lock))
            })
        })
        .collect();

    let mut winners = Vec::new();
    for attempt in attempts {
        let (acquired, lock) = attempt.await.expect("acquire task panicked")?;
        if acquired {
            winners.push(lock);
        }
    }

    assert_eq!(winners.len(), 1);
    assert!(winners[0].release().await?);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn expired_holder_cannot_touch_new_owner() -> TestResult {
    let (store, locks) = client();
    let options = LockOptions::new().with_ttl(Duration::from_secs(5));

    let mut first = locks.lock("inventory", options.clone());
    assert!(first.acquire(false).await?);

    tokio::time::advance(Duration::from_secs(6)).await;

    let mut second = locks.lock("inventory", options);
    assert!(second.acquire(false).await?);

    assert!(!first.is_owned().await?);
    assert!(!first.extend(None).await?);
    assert!(matches!(first.ensure_owned().await, Err(Error::OwnershipLost { .. })));
    assert!(!first.release().await?);

    // The second holder's record is untouched.
    assert!(second.is_owned().await?);
    assert!(store.exists("lock:inventory").await?);
    assert!(second.release().await?);
    assert!(!store.exists("lock:inventory").await?);
    Ok(())
}

#[tokio::test]
async fn skip_if_locked_returns_immediately() -> TestResult {
    let (_, locks) = client();

    let mut holder = locks.lock("report", LockOptions::new());
    assert!(holder.acquire(false).await?);

    let mut waiter = locks.lock("report", LockOptions::new().with_skip_if_locked(true));
    let ran = AtomicU32::new(0);
    let outcome = waiter
        .scoped(|| async {
            ran.fetch_add(1, Ordering::SeqCst);
        })
        .await?;

    assert!(outcome.is_skipped());
    assert_eq!(ran.load(Ordering::SeqCst), 0);
    assert_eq!(waiter.state(), LockState::Unacquired);
    assert!(!waiter.acquired());

    // The holder is unaffected.
    assert!(holder.is_owned().await?);
    Ok(())
}

#[tokio::test]
async fn scoped_releases_after_work() -> TestResult {
    let (store, locks) = client();
    let mut lock = locks.lock("report", LockOptions::new().with_skip_if_locked(true));

    let outcome = lock
        .scoped(|| async {
            assert!(store.exists("lock:report").await.unwrap());
            "done"
        })
        .await?;

    assert_eq!(outcome, Scoped::Ran("done"));
    assert_eq!(lock.state(), LockState::Released);
    assert!(!store.exists("lock:report").await?);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn blocking_acquire_waits_for_release() -> TestResult {
    let (_, locks) = client();

    let mut holder = locks.lock("migration", LockOptions::new());
    assert!(holder.acquire(false).await?);

    let mut waiter = locks.lock(
        "migration",
        LockOptions::new().with_retry_delay(Duration::from_millis(50)),
    );
    let releaser = async {
        tokio::time::sleep(Duration::from_millis(120)).await;
        holder.release().await
    };

    let (acquired, released) = tokio::join!(waiter.acquire(true), releaser);

    assert!(released?);
    assert!(acquired?);
    assert!(waiter.is_owned().await?);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn auto_extend_outlives_the_lease() -> TestResult {
    let (store, locks) = client();
    let mut lock = locks.lock(
        "long-job",
        LockOptions::new().with_ttl(Duration::from_secs(3)).with_auto_extend(true),
    );
    assert!(lock.acquire(false).await?);

    tokio::time::sleep(Duration::from_secs(20)).await;

    assert!(lock.is_owned().await?);
    assert!(lock.release().await?);
    assert!(!store.exists("lock:long-job").await?);
    Ok(())
}

#[tokio::test]
async fn released_handle_stays_released() -> TestResult {
    let (_, locks) = client();
    let mut lock = locks.lock("once", LockOptions::new());

    assert!(lock.acquire(false).await?);
    assert!(lock.release().await?);

    assert!(!lock.acquire(false).await?);
    assert_eq!(lock.state(), LockState::Released);
    assert!(!lock.is_locked().await?);
    Ok(())
}

#[tokio::test]
async fn store_failure_surfaces_from_acquire() {
    let (store, locks) = client();
    store.fail_when(|_| true);

    let mut lock = locks.lock("inventory", LockOptions::new());
    let error = lock.acquire(false).await.unwrap_err();

    assert!(matches!(error, Error::StoreUnavailable(_)));
    assert_eq!(lock.state(), LockState::Unacquired);
}

#[tokio::test]
async fn shared_clients_contend_for_the_same_key() -> TestResult {
    let store = Arc::new(MemoryStore::new());
    let a = LockClient::from_shared(Arc::clone(&store));
    let b = LockClient::from_shared(store);

    let mut first = a.lock("shared", LockOptions::new());
    let mut second = b.lock("shared", LockOptions::new());

    assert!(first.acquire(false).await?);
    assert!(!second.acquire(false).await?);
    assert!(second.is_locked().await?);
    Ok(())
}
