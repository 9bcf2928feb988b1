// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Integration tests for periodic jobs sharing a store.

use std::{
    sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    },
    time::Duration,
};

use pantry::{Error, JobOutcome, LockClient, LockOptions, PeriodicJob};
use pantry_store::{Store, memory::MemoryStore};
use tokio::sync::watch;

type TestResult = Result<(), Error>;

fn job(store: &Arc<MemoryStore>) -> PeriodicJob<MemoryStore> {
    PeriodicJob::new("refresh_catalog", LockClient::from_shared(Arc::clone(store)))
        .with_interval(Duration::from_secs(3600))
        .with_skip_interval(Duration::from_secs(1800))
}

#[tokio::test(start_paused = true)]
async fn second_instance_skips_while_first_runs() -> TestResult {
    let store = Arc::new(MemoryStore::new());
    let (first, second) = (job(&store), job(&store));
    let running = AtomicU32::new(0);

    let slow = first.run_once(|| async {
        running.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(90)).await;
        Ok::<_, String>(())
    });
    let contender = async {
        tokio::time::sleep(Duration::from_secs(1)).await;
        second
            .run_once(|| async {
                running.fetch_add(1, Ordering::SeqCst);
                Ok::<_, String>(())
            })
            .await
    };

    let (slow, contender) = tokio::join!(slow, contender);

    assert_eq!(slow?, JobOutcome::Completed);
    assert_eq!(contender?, JobOutcome::Skipped);
    assert_eq!(running.load(Ordering::SeqCst), 1);
    // The heartbeat kept the 30 second lease alive through the 90 second run, then released it.
    assert!(!store.exists("lock:task:refresh_catalog").await?);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn loops_never_overlap() {
    let store = Arc::new(MemoryStore::new());
    let active = Arc::new(AtomicU32::new(0));
    let runs = Arc::new(AtomicU32::new(0));
    let (stop, shutdown) = watch::channel(false);

    let workers: Vec<_> = (0..3)
        .map(|_| {
            let job = job(&store).with_skip_interval(Duration::from_secs(60));
            let (active, runs, shutdown) = (Arc::clone(&active), Arc::clone(&runs), shutdown.clone());
            tokio::spawn(async move {
                job.run(
                    move || {
                        let (active, runs) = (Arc::clone(&active), Arc::clone(&runs));
                        async move {
                            assert_eq!(active.fetch_add(1, Ordering::SeqCst), 0, "two rounds overlapped");
                            runs.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_secs(120)).await;
                            active.fetch_sub(1, Ordering::SeqCst);
                            Ok::<_, String>(())
                        }
                    },
                    shutdown,
                )
                .await;
            })
        })
        .collect();

    tokio::time::sleep(Duration::from_secs(4 * 3600)).await;
    stop.send(true).unwrap();
    for worker in workers {
        worker.await.unwrap();
    }

    assert!(runs.load(Ordering::SeqCst) >= 4);
    assert_eq!(active.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn failures_do_not_stop_the_loop() {
    let store = Arc::new(MemoryStore::new());
    let attempts = Arc::new(AtomicU32::new(0));
    let (stop, shutdown) = watch::channel(false);

    let job = job(&store).with_interval(Duration::from_secs(10));
    let handle = tokio::spawn({
        let attempts = Arc::clone(&attempts);
        async move {
            job.run(
                move || {
                    let attempts = Arc::clone(&attempts);
                    async move {
                        attempts.fetch_add(1, Ordering::SeqCst);
                        Err::<(), _>("catalog unavailable")
                    }
                },
                shutdown,
            )
            .await;
        }
    });

    tokio::time::sleep(Duration::from_secs(35)).await;
    stop.send(true).unwrap();
    handle.await.unwrap();

    // Rounds at 0s, 10s, 20s and 30s.
    assert_eq!(attempts.load(Ordering::SeqCst), 4);
}

#[tokio::test(start_paused = true)]
async fn unreachable_store_waits_skip_interval() {
    let store = Arc::new(MemoryStore::new());
    store.fail_when(|_| true);
    let attempts = Arc::new(AtomicU32::new(0));
    let (stop, shutdown) = watch::channel(false);

    let job = job(&store)
        .with_interval(Duration::from_secs(10))
        .with_skip_interval(Duration::from_secs(100))
        .with_lock_options(LockOptions::new().with_ttl(Duration::from_secs(5)));
    let handle = tokio::spawn({
        let attempts = Arc::clone(&attempts);
        async move {
            job.run(
                move || {
                    let attempts = Arc::clone(&attempts);
                    async move {
                        attempts.fetch_add(1, Ordering::SeqCst);
                        Ok::<_, String>(())
                    }
                },
                shutdown,
            )
            .await;
        }
    });

    tokio::time::sleep(Duration::from_secs(250)).await;
    stop.send(true).unwrap();
    handle.await.unwrap();

    assert_eq!(attempts.load(Ordering::SeqCst), 0);
    // Lock attempts at 0s, 100s and 200s.
    let lock_attempts = store
        .operations()
        .into_iter()
        .filter(|op| op.key() == Some("lock:task:refresh_catalog"))
        .count();
    assert_eq!(lock_attempts, 3);
}
