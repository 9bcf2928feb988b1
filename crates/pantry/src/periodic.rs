// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Mutually exclusive periodic jobs.
//!
//! A [`PeriodicJob`] runs a task at most once at a time across every process that shares a store.
//! Each round tries the job's lock once: the process that gets it runs the task and sleeps for
//! the full interval, the others skip the round and try again after the shorter skip interval.

use std::{fmt, time::Duration};

use pantry_store::Store;
use tokio::{sync::watch, time::Instant};

use crate::{LockClient, LockOptions, Result, Scoped};

const DEFAULT_INTERVAL: Duration = Duration::from_secs(3600);
const DEFAULT_SKIP_INTERVAL: Duration = Duration::from_secs(1800);
const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(30);

/// What happened in one round of a [`PeriodicJob`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobOutcome {
    /// The task ran and succeeded.
    Completed,
    /// The task ran and returned an error, which was logged.
    Failed,
    /// Another process held the job's lock, so the task did not run.
    Skipped,
}

/// A task that runs periodically under a distributed lock in skip mode.
///
/// The lock is named `task:<name>`, is renewed by a heartbeat while the task runs and is released
/// as soon as the task finishes.
///
/// # Examples
///
/// ```
/// use pantry::{JobOutcome, LockClient, PeriodicJob};
/// use pantry_store::memory::MemoryStore;
///
/// # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
/// let job = PeriodicJob::new("refresh_catalog", LockClient::new(MemoryStore::new()));
///
/// let outcome = job.run_once(|| async { Ok::<_, std::io::Error>(()) }).await?;
/// assert_eq!(outcome, JobOutcome::Completed);
/// # Ok::<(), pantry::Error>(())
/// # });
/// ```
pub struct PeriodicJob<S: Store> {
    name: String,
    locks: LockClient<S>,
    interval: Duration,
    skip_interval: Duration,
    lock_options: LockOptions,
}

impl<S: Store> fmt::Debug for PeriodicJob<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeriodicJob")
            .field("name", &self.name)
            .field("interval", &self.interval)
            .field("skip_interval", &self.skip_interval)
            .field("lock_options", &self.lock_options)
            .finish_non_exhaustive()
    }
}

impl<S: Store> PeriodicJob<S> {
    /// Creates a job with an hourly interval, a half-hour skip interval and a 30 second lease.
    #[must_use]
    pub fn new(name: impl Into<String>, locks: LockClient<S>) -> Self {
        Self {
            name: name.into(),
            locks,
            interval: DEFAULT_INTERVAL,
            skip_interval: DEFAULT_SKIP_INTERVAL,
            lock_options: LockOptions::new()
                .with_ttl(DEFAULT_LOCK_TTL)
                .with_auto_extend(true)
                .with_skip_if_locked(true),
        }
    }

    /// Sets the pause after a round in which the task ran.
    #[must_use]
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Sets the pause after a skipped round or a store failure.
    #[must_use]
    pub fn with_skip_interval(mut self, skip_interval: Duration) -> Self {
        self.skip_interval = skip_interval;
        self
    }

    /// Sets the options of the job's lock. Skip mode is always enabled.
    #[must_use]
    pub fn with_lock_options(mut self, options: LockOptions) -> Self {
        self.lock_options = options.with_skip_if_locked(true);
        self
    }

    /// Returns the job name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the pause after a round in which the task ran.
    #[must_use]
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Returns the pause after a skipped round.
    #[must_use]
    pub fn skip_interval(&self) -> Duration {
        self.skip_interval
    }

    /// Runs one round: takes the lock if it is free, runs `task` and releases the lock.
    ///
    /// A task error is logged and reported as [`JobOutcome::Failed`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::StoreUnavailable`](crate::Error::StoreUnavailable) if the lock cannot be
    /// attempted.
    pub async fn run_once<F, Fut, E>(&self, task: F) -> Result<JobOutcome>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<(), E>>,
        E: fmt::Display,
    {
        let mut lock = self.locks.lock(&format!("task:{}", self.name), self.lock_options.clone());
        let started = Instant::now();

        let outcome = match lock.scoped(task).await? {
            Scoped::Skipped => {
                tracing::info!(job.name = %self.name, "job.skipped");
                JobOutcome::Skipped
            }
            Scoped::Ran(Ok(())) => {
                tracing::info!(job.name = %self.name, job.duration_ms = started.elapsed().as_millis(), "job.completed");
                JobOutcome::Completed
            }
            Scoped::Ran(Err(e)) => {
                tracing::error!(job.name = %self.name, error = %e, "job.failed");
                JobOutcome::Failed
            }
        };
        Ok(outcome)
    }

    /// Runs rounds until `shutdown` becomes `true` or its sender is dropped.
    ///
    /// The signal is checked before every round and while sleeping between rounds, so a running
    /// task is always allowed to finish. A failed task does not stop the loop.
    pub async fn run<F, Fut, E>(&self, mut task: F, mut shutdown: watch::Receiver<bool>)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<(), E>>,
        E: fmt::Display,
    {
        tracing::info!(job.name = %self.name, "job.started");

        while !*shutdown.borrow_and_update() {
            let pause = match self.run_once(&mut task).await {
                Ok(JobOutcome::Completed | JobOutcome::Failed) => self.interval,
                Ok(JobOutcome::Skipped) => self.skip_interval,
                Err(e) => {
                    tracing::warn!(job.name = %self.name, error = %e, "job.lock_unavailable");
                    self.skip_interval
                }
            };

            if sleep_or_shutdown(pause, &mut shutdown).await {
                break;
            }
        }

        tracing::info!(job.name = %self.name, "job.stopped");
    }
}

/// Sleeps for `pause`, returning `true` early if shutdown is signalled.
async fn sleep_or_shutdown(pause: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    let deadline = Instant::now() + pause;

    loop {
        tokio::select! {
            () = tokio::time::sleep_until(deadline) => return false,
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow_and_update() {
                    return true;
                }
            }
        }
    }
}
