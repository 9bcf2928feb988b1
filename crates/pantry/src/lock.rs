// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Token-leased distributed locks.

use std::{fmt, sync::Arc, time::Duration};

use pantry_store::Store;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::{Error, Result};

/// Prefix of every lock record key.
pub const LOCK_PREFIX: &str = "lock:";

/// Acquisition and lease policy of a [`DistributedLock`].
///
/// # Examples
///
/// ```
/// use pantry::LockOptions;
/// use std::time::Duration;
///
/// let options = LockOptions::new()
///     .with_ttl(Duration::from_secs(60))
///     .with_retry_times(10)
///     .with_auto_extend(true);
///
/// assert_eq!(options.ttl(), Duration::from_secs(60));
/// assert_eq!(options.retry_delay(), Duration::from_millis(100));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockOptions {
    ttl: Duration,
    retry_delay: Duration,
    retry_times: Option<u32>,
    auto_extend: bool,
    skip_if_locked: bool,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(30),
            retry_delay: Duration::from_millis(100),
            retry_times: None,
            auto_extend: false,
            skip_if_locked: false,
        }
    }
}

impl LockOptions {
    /// Creates the default policy: a 30 second lease, retried every 100 ms without limit.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the lease length. The store tracks leases in whole seconds, rounding up to one.
    #[must_use]
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Sets the pause between blocking acquisition attempts.
    #[must_use]
    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    /// Bounds blocking acquisition to `times` attempts in total.
    ///
    /// The first attempt is always made, so zero behaves like one.
    #[must_use]
    pub fn with_retry_times(mut self, times: u32) -> Self {
        self.retry_times = Some(times);
        self
    }

    /// Renews the lease in the background every third of its length while the lock is held.
    #[must_use]
    pub fn with_auto_extend(mut self, auto_extend: bool) -> Self {
        self.auto_extend = auto_extend;
        self
    }

    /// Makes [`DistributedLock::scoped`] give up after a single attempt instead of waiting.
    #[must_use]
    pub fn with_skip_if_locked(mut self, skip_if_locked: bool) -> Self {
        self.skip_if_locked = skip_if_locked;
        self
    }

    /// Returns the lease length.
    #[must_use]
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Returns the pause between blocking attempts.
    #[must_use]
    pub fn retry_delay(&self) -> Duration {
        self.retry_delay
    }

    /// Returns the attempt budget, or `None` when blocking acquisition never gives up.
    #[must_use]
    pub fn retry_times(&self) -> Option<u32> {
        self.retry_times
    }

    /// Returns `true` if the lease is renewed in the background.
    #[must_use]
    pub fn auto_extend(&self) -> bool {
        self.auto_extend
    }

    /// Returns `true` if scoped acquisition skips instead of waiting.
    #[must_use]
    pub fn skip_if_locked(&self) -> bool {
        self.skip_if_locked
    }
}

/// Creates lock handles over a store.
///
/// A `LockClient` is constructed explicitly and passed to whatever needs locks, so the
/// connection's lifetime is owned by the application rather than by global state. Cloning is
/// cheap and clones share the store.
pub struct LockClient<S: Store> {
    store: Arc<S>,
}

impl<S: Store> Clone for LockClient<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
        }
    }
}

impl<S: Store> fmt::Debug for LockClient<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockClient").finish_non_exhaustive()
    }
}

impl<S: Store> LockClient<S> {
    /// Creates a client owning `store`.
    #[must_use]
    pub fn new(store: S) -> Self {
        Self::from_shared(Arc::new(store))
    }

    /// Creates a client over a store shared with other components.
    #[must_use]
    pub fn from_shared(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Returns the underlying store.
    #[must_use]
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Creates an unacquired handle for the lock `name`, stored at `lock:<name>`.
    #[must_use]
    pub fn lock(&self, name: &str, options: LockOptions) -> DistributedLock<S> {
        DistributedLock {
            store: Arc::clone(&self.store),
            key: format!("{LOCK_PREFIX}{name}"),
            options,
            token: None,
            state: LockState::Unacquired,
            heartbeat: None,
        }
    }
}

/// Lifecycle of a [`DistributedLock`] handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockState {
    /// No acquisition has succeeded yet.
    Unacquired,
    /// The handle acquired the lock and has not released it.
    ///
    /// The lease may still have expired in the store if it was not renewed in time.
    Acquired,
    /// The handle released the lock. A released handle cannot be reused.
    Released,
}

/// The outcome of [`DistributedLock::scoped`].
#[derive(Debug, Clone, PartialEq, Eq)]
#[must_use]
pub enum Scoped<T> {
    /// The lock was acquired and the work ran to completion.
    Ran(T),
    /// The lock was held elsewhere and the work was skipped.
    Skipped,
}

impl<T> Scoped<T> {
    /// Returns `true` if the work was skipped.
    #[must_use]
    pub fn is_skipped(&self) -> bool {
        matches!(self, Self::Skipped)
    }

    /// Returns the work's output, if it ran.
    #[must_use]
    pub fn into_option(self) -> Option<T> {
        match self {
            Self::Ran(output) => Some(output),
            Self::Skipped => None,
        }
    }
}

/// A handle to one acquisition of a lock shared across processes.
///
/// The lock is a store record at `lock:<name>` holding a random token. Acquiring writes the
/// record only if it is absent, with the lease as its TTL, so a crashed holder loses the lock
/// once the lease runs out. Releasing and extending are token-gated scripts that the store runs
/// atomically, so a handle whose lease already expired can never delete or prolong the record
/// of a newer holder.
///
/// With [`LockOptions::with_auto_extend`], a heartbeat task renews the lease every third of its
/// length. The heartbeat stops silently as soon as a renewal fails; the handle then still
/// reports [`LockState::Acquired`] although another process may hold the lock. Use
/// [`ensure_owned`](Self::ensure_owned) before committing work if that matters.
///
/// Dropping an acquired handle stops the heartbeat and, when called inside a tokio runtime,
/// releases the lock in a background task.
///
/// # Examples
///
/// ```
/// use pantry::{LockClient, LockOptions, Scoped};
/// use pantry_store::memory::MemoryStore;
///
/// # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
/// let locks = LockClient::new(MemoryStore::new());
///
/// let mut first = locks.lock("report", LockOptions::new());
/// assert!(first.acquire(false).await?);
///
/// let mut second = locks.lock("report", LockOptions::new().with_skip_if_locked(true));
/// assert_eq!(second.scoped(|| async { "generated" }).await?, Scoped::Skipped);
///
/// assert!(first.release().await?);
/// # Ok::<(), pantry::Error>(())
/// # });
/// ```
pub struct DistributedLock<S: Store> {
    store: Arc<S>,
    key: String,
    options: LockOptions,
    token: Option<String>,
    state: LockState,
    heartbeat: Option<JoinHandle<()>>,
}

impl<S: Store> fmt::Debug for DistributedLock<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DistributedLock")
            .field("key", &self.key)
            .field("state", &self.state)
            .field("options", &self.options)
            .field("heartbeat", &self.heartbeat.is_some())
            .finish_non_exhaustive()
    }
}

impl<S: Store> DistributedLock<S> {
    /// Returns the lock record key.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Returns the handle's lifecycle state.
    #[must_use]
    pub fn state(&self) -> LockState {
        self.state
    }

    /// Returns `true` if this handle acquired the lock and has not released it.
    #[must_use]
    pub fn acquired(&self) -> bool {
        self.state == LockState::Acquired
    }

    /// Returns the policy of this handle.
    #[must_use]
    pub fn options(&self) -> &LockOptions {
        &self.options
    }

    /// Tries to acquire the lock with a fresh token.
    ///
    /// Without `blocking`, a single attempt is made. With `blocking`, attempts repeat every
    /// [`retry_delay`](LockOptions::retry_delay) until one succeeds or the
    /// [`retry_times`](LockOptions::retry_times) budget is spent.
    ///
    /// Returns `true` if the lock is held by this handle afterwards. Acquiring an already
    /// acquired handle succeeds immediately; a released handle cannot acquire again.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StoreUnavailable`] if the store cannot be reached.
    pub async fn acquire(&mut self, blocking: bool) -> Result<bool> {
        match self.state {
            LockState::Acquired => return Ok(true),
            LockState::Released => {
                tracing::debug!(lock.key = %self.key, "lock.reuse_after_release");
                return Ok(false);
            }
            LockState::Unacquired => {}
        }

        let token = Uuid::new_v4().to_string();
        let mut attempts: u32 = 0;

        loop {
            attempts = attempts.saturating_add(1);

            if self.store.set_nx_ex(&self.key, token.as_bytes(), self.options.ttl).await? {
                tracing::debug!(lock.key = %self.key, lock.attempts = attempts, "lock.acquired");
                if self.options.auto_extend {
                    self.start_heartbeat(token.clone());
                }
                self.token = Some(token);
                self.state = LockState::Acquired;
                return Ok(true);
            }

            if !blocking {
                tracing::debug!(lock.key = %self.key, "lock.busy");
                return Ok(false);
            }
            if self.options.retry_times.is_some_and(|budget| attempts >= budget) {
                tracing::info!(lock.key = %self.key, lock.attempts = attempts, "lock.retries_exhausted");
                return Ok(false);
            }

            tokio::time::sleep(self.options.retry_delay).await;
        }
    }

    /// Releases the lock if this handle still owns it.
    ///
    /// The heartbeat, if any, is stopped and awaited first. Returns `false` if the handle never
    /// acquired the lock or the record now belongs to someone else; the other holder's record
    /// is left untouched either way.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StoreUnavailable`] if the store cannot be reached. The handle stays
    /// acquired so that the release can be retried, and its heartbeat, if enabled, is restarted.
    pub async fn release(&mut self) -> Result<bool> {
        self.stop_heartbeat().await;

        let Some(token) = self.token.as_deref() else {
            return Ok(false);
        };
        let released = match self.store.compare_and_delete(&self.key, token).await {
            Ok(released) => released,
            Err(e) => {
                if self.options.auto_extend {
                    let token = token.to_owned();
                    self.start_heartbeat(token);
                }
                return Err(e.into());
            }
        };

        self.token = None;
        self.state = LockState::Released;

        if released {
            tracing::debug!(lock.key = %self.key, "lock.released");
        } else {
            tracing::warn!(lock.key = %self.key, "lock.ownership_lost");
        }
        Ok(released)
    }

    /// Resets the lease to `additional_ttl`, or to the configured TTL when `None`.
    ///
    /// Returns `false` if this handle does not own the lock.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StoreUnavailable`] if the store cannot be reached.
    pub async fn extend(&self, additional_ttl: Option<Duration>) -> Result<bool> {
        let Some(token) = self.token.as_deref() else {
            return Ok(false);
        };
        let ttl = additional_ttl.unwrap_or(self.options.ttl);
        Ok(self.store.compare_and_expire(&self.key, token, ttl).await?)
    }

    /// Returns `true` if anyone holds the lock.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StoreUnavailable`] if the store cannot be reached.
    pub async fn is_locked(&self) -> Result<bool> {
        Ok(self.store.exists(&self.key).await?)
    }

    /// Returns `true` if the lock record holds this handle's token.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StoreUnavailable`] if the store cannot be reached.
    pub async fn is_owned(&self) -> Result<bool> {
        let Some(token) = self.token.as_deref() else {
            return Ok(false);
        };
        let current = self.store.get(&self.key).await?;
        Ok(current.is_some_and(|value| value == token.as_bytes()))
    }

    /// Fails unless the lock record holds this handle's token.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OwnershipLost`] if another holder took over or the lease expired, and
    /// [`Error::StoreUnavailable`] if the store cannot be reached.
    pub async fn ensure_owned(&self) -> Result<()> {
        if self.is_owned().await? {
            Ok(())
        } else {
            Err(Error::OwnershipLost { key: self.key.clone() })
        }
    }

    /// Runs `work` while holding the lock and releases it afterwards.
    ///
    /// With [`skip_if_locked`](LockOptions::skip_if_locked), a single attempt is made and a held
    /// lock yields [`Scoped::Skipped`] without running `work`. Otherwise acquisition blocks
    /// according to the retry policy.
    ///
    /// The lock is released only if this call acquired it. If `work` panics or the returned
    /// future is dropped, the handle's drop releases it instead.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LockContention`] if blocking acquisition exhausts its retry budget, and
    /// [`Error::StoreUnavailable`] if the store cannot be reached while acquiring.
    pub async fn scoped<T, F, Fut>(&mut self, work: F) -> Result<Scoped<T>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let skip = self.options.skip_if_locked;

        if !self.acquire(!skip).await? {
            if skip {
                tracing::info!(lock.key = %self.key, "lock.skipped");
                return Ok(Scoped::Skipped);
            }
            return Err(Error::LockContention { key: self.key.clone() });
        }

        let output = work().await;

        // The lease still runs out on its own if the release cannot reach the store.
        if let Err(e) = self.release().await {
            tracing::warn!(lock.key = %self.key, error = %e, "lock.release_failed");
        }
        Ok(Scoped::Ran(output))
    }

    fn start_heartbeat(&mut self, token: String) {
        let store = Arc::clone(&self.store);
        let key = self.key.clone();
        let ttl = self.options.ttl;
        let period = (ttl / 3).max(Duration::from_millis(1));

        self.heartbeat = Some(tokio::spawn(async move {
            loop {
                tokio::time::sleep(period).await;

                match store.compare_and_expire(&key, &token, ttl).await {
                    Ok(true) => tracing::trace!(lock.key = %key, "lock.extended"),
                    Ok(false) => {
                        tracing::warn!(lock.key = %key, "lock.heartbeat_lost");
                        break;
                    }
                    Err(e) => {
                        tracing::warn!(lock.key = %key, error = %e, "lock.heartbeat_failed");
                        break;
                    }
                }
            }
        }));
    }

    async fn stop_heartbeat(&mut self) {
        let Some(task) = self.heartbeat.take() else {
            return;
        };

        task.abort();
        if let Err(e) = task.await
            && e.is_panic()
        {
            tracing::error!(lock.key = %self.key, error = %e, "lock.heartbeat_panicked");
        }
    }
}

impl<S: Store> Drop for DistributedLock<S> {
    fn drop(&mut self) {
        if let Some(task) = self.heartbeat.take() {
            task.abort();
        }

        if self.state != LockState::Acquired {
            return;
        }
        let Some(token) = self.token.take() else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(lock.key = %self.key, "lock.dropped_without_runtime");
            return;
        };

        let store = Arc::clone(&self.store);
        let key = std::mem::take(&mut self.key);
        runtime.spawn(async move {
            match store.compare_and_delete(&key, &token).await {
                Ok(released) => tracing::debug!(lock.key = %key, lock.released = released, "lock.released_on_drop"),
                Err(e) => tracing::warn!(lock.key = %key, error = %e, "lock.release_failed"),
            }
        });
    }
}
