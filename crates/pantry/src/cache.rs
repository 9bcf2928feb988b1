// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The tagged object cache.

use std::{collections::BTreeSet, fmt, sync::Arc, time::Duration};

use pantry_store::{KeyTtl, Store};
use serde::{Serialize, de::DeserializeOwned};
use tokio::time::Instant;

use crate::{
    BoxError, Codec, Error, LockClient, LockOptions, Result,
    invalidation::{Callbacks, InvalidationCallback, Listener},
    telemetry::{self, CacheActivity, CacheOperation},
};

/// Prefix of the sets that record which keys carry a tag.
pub const TAG_PREFIX: &str = "tag:";

/// Prefix of the locks taken by [`ObjectCache::get_or_set_exclusive`].
pub const FILL_LOCK_PREFIX: &str = "fill:";

const DEFAULT_NAME: &str = "pantry";

/// Returns the key of the member set for `tag`.
///
/// # Examples
///
/// ```
/// assert_eq!(pantry::tag_key("user:123"), "tag:user:123");
/// ```
#[must_use]
pub fn tag_key(tag: &str) -> String {
    format!("{TAG_PREFIX}{tag}")
}

/// How a value is written: its lifetime, encoding and tags.
///
/// # Examples
///
/// ```
/// use pantry::{Codec, EntryOptions};
/// use std::time::Duration;
///
/// let options = EntryOptions::new(Duration::from_secs(3600))
///     .compressed()
///     .with_tag("catalog");
///
/// assert_eq!(options.codec(), Codec::Compressed);
/// assert_eq!(options.tags(), ["catalog"]);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryOptions {
    ttl: Duration,
    codec: Codec,
    tags: Vec<String>,
}

impl EntryOptions {
    /// Creates options for a JSON entry that expires after `ttl`, without tags.
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            codec: Codec::Json,
            tags: Vec::new(),
        }
    }

    /// Stores the entry with [`Codec::Compressed`].
    #[must_use]
    pub fn compressed(self) -> Self {
        self.with_codec(Codec::Compressed)
    }

    /// Sets the codec.
    #[must_use]
    pub fn with_codec(mut self, codec: Codec) -> Self {
        self.codec = codec;
        self
    }

    /// Sets the lifetime.
    #[must_use]
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Adds a tag.
    #[must_use]
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    /// Adds several tags.
    #[must_use]
    pub fn with_tags<I>(mut self, tags: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    /// Returns the lifetime.
    #[must_use]
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Returns the codec.
    #[must_use]
    pub fn codec(&self) -> Codec {
        self.codec
    }

    /// Returns the tags.
    #[must_use]
    pub fn tags(&self) -> &[String] {
        &self.tags
    }
}

#[derive(Debug, Default)]
struct ListenerSlot {
    listener: Option<Listener>,
    channels: BTreeSet<String>,
}

/// A cache of serializable values in a shared store.
///
/// Reads and writes fail asymmetrically. [`get`](Self::get) treats an unreachable store and an
/// undecodable value alike as a miss, so callers can always fall back to recomputing. Writes
/// report every failure, so a value is never silently dropped.
///
/// Entries may carry tags. Each tag keeps a set of its member keys (see [`tag_key`]), which
/// [`invalidate_by_tag`](Self::invalidate_by_tag) uses to drop the whole group at once.
/// Registering a key under a tag is a separate round trip from writing the entry, so a crash in
/// between can leave the tag set incomplete.
///
/// Invalidations can be broadcast to other processes with
/// [`publish_invalidation`](Self::publish_invalidation). A cache that called
/// [`subscribe_invalidation`](Self::subscribe_invalidation) runs one background listener that
/// applies every message it receives, whatever the number of subscribed channels.
///
/// # Examples
///
/// ```
/// use pantry::{Codec, EntryOptions, ObjectCache};
/// use pantry_store::memory::MemoryStore;
/// use std::time::Duration;
///
/// # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
/// let cache = ObjectCache::new(MemoryStore::new());
/// let options = EntryOptions::new(Duration::from_secs(60)).with_tag("user:1");
///
/// cache.set("profile:1", &"Ada", &options).await?;
/// assert_eq!(cache.get::<String>("profile:1", Codec::Json).await.as_deref(), Some("Ada"));
///
/// assert_eq!(cache.invalidate_by_tag("user:1").await?, 1);
/// assert_eq!(cache.get::<String>("profile:1", Codec::Json).await, None);
/// # Ok::<(), pantry::Error>(())
/// # });
/// ```
pub struct ObjectCache<S: Store> {
    store: Arc<S>,
    name: &'static str,
    fill_lock: LockOptions,
    callbacks: Callbacks,
    listener: tokio::sync::Mutex<ListenerSlot>,
}

impl<S: Store> fmt::Debug for ObjectCache<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectCache")
            .field("name", &self.name)
            .field("fill_lock", &self.fill_lock)
            .finish_non_exhaustive()
    }
}

impl<S: Store> ObjectCache<S> {
    /// Creates a cache over `store`.
    #[must_use]
    pub fn new(store: S) -> Self {
        Self::from_shared(Arc::new(store))
    }

    /// Creates a cache over a store shared with other components.
    #[must_use]
    pub fn from_shared(store: Arc<S>) -> Self {
        Self {
            store,
            name: DEFAULT_NAME,
            fill_lock: LockOptions::new()
                .with_retry_times(50)
                .with_auto_extend(true),
            callbacks: Callbacks::default(),
            listener: tokio::sync::Mutex::default(),
        }
    }

    /// Sets the name reported in log events.
    #[must_use]
    pub fn with_name(mut self, name: &'static str) -> Self {
        self.name = name;
        self
    }

    /// Sets the lock policy used by [`get_or_set_exclusive`](Self::get_or_set_exclusive).
    ///
    /// The lock is always taken in blocking mode; `skip_if_locked` is ignored.
    #[must_use]
    pub fn with_fill_lock(mut self, options: LockOptions) -> Self {
        self.fill_lock = options;
        self
    }

    /// Returns the name reported in log events.
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Returns the underlying store.
    #[must_use]
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Returns the value at `key`, or `None` on a miss.
    ///
    /// A value that cannot be decoded with `codec`, or a store that cannot be reached, is also
    /// reported as a miss after logging the cause.
    pub async fn get<T>(&self, key: &str, codec: Codec) -> Option<T>
    where
        T: DeserializeOwned,
    {
        match self.read(key, codec).await {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(cache.name = self.name, cache.key = key, error = %e, "cache.read_failed");
                None
            }
        }
    }

    async fn read<T>(&self, key: &str, codec: Codec) -> Result<Option<T>>
    where
        T: DeserializeOwned,
    {
        let started = Instant::now();
        let bytes = match self.store.get(key).await {
            Ok(bytes) => bytes,
            Err(e) => {
                self.record(CacheOperation::Get, CacheActivity::Error, key, started);
                return Err(e.into());
            }
        };

        let Some(bytes) = bytes else {
            self.record(CacheOperation::Get, CacheActivity::Miss, key, started);
            return Ok(None);
        };

        match codec.decode(&bytes) {
            Ok(value) => {
                self.record(CacheOperation::Get, CacheActivity::Hit, key, started);
                Ok(Some(value))
            }
            Err(e) => {
                self.record(CacheOperation::Get, CacheActivity::DecodeError, key, started);
                Err(Error::DecodeFailure(e))
            }
        }
    }

    /// Stores `value` at `key` and registers it under every tag in `options`.
    ///
    /// Each tag set is kept alive for at least as long as the entry.
    ///
    /// # Errors
    ///
    /// Returns [`Error::EncodeFailure`] if the value cannot be encoded and
    /// [`Error::StoreUnavailable`] if any write fails.
    pub async fn set<T>(&self, key: &str, value: &T, options: &EntryOptions) -> Result<()>
    where
        T: Serialize + ?Sized,
    {
        let started = Instant::now();
        let bytes = options.codec.encode(value).map_err(Error::EncodeFailure)?;

        let result = self.write(key, &bytes, options).await;
        let activity = if result.is_ok() { CacheActivity::Inserted } else { CacheActivity::Error };
        self.record(CacheOperation::Set, activity, key, started);
        result
    }

    async fn write(&self, key: &str, bytes: &[u8], options: &EntryOptions) -> Result<()> {
        self.store.set_ex(key, bytes, options.ttl).await?;

        for tag in &options.tags {
            register_tag(self.store.as_ref(), tag, key, options.ttl).await?;
        }
        Ok(())
    }

    /// Deletes `key`, returning how many keys were removed (0 or 1).
    ///
    /// # Errors
    ///
    /// Returns [`Error::StoreUnavailable`] if the store cannot be reached.
    pub async fn delete(&self, key: &str) -> Result<u64> {
        let started = Instant::now();
        let result = delete_key(self.store.as_ref(), key).await;
        self.record_outcome(CacheOperation::Delete, &result, key, started);
        result
    }

    /// Deletes every key matching the glob `pattern` and returns how many were removed.
    ///
    /// Keys are enumerated with an incremental cursor scan, so the store is never blocked.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StoreUnavailable`] if the store cannot be reached.
    pub async fn invalidate_by_pattern(&self, pattern: &str) -> Result<u64> {
        let started = Instant::now();
        let result = invalidate_pattern(self.store.as_ref(), pattern).await;
        self.record_outcome(CacheOperation::Invalidate, &result, pattern, started);
        result
    }

    /// Deletes every key registered under `tag`, then the tag set itself.
    ///
    /// Returns how many member keys were removed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StoreUnavailable`] if the store cannot be reached.
    pub async fn invalidate_by_tag(&self, tag: &str) -> Result<u64> {
        let started = Instant::now();
        let result = invalidate_tag(self.store.as_ref(), tag).await;
        self.record_outcome(CacheOperation::Invalidate, &result, tag, started);
        result
    }

    /// Invalidates each tag in turn and returns the total number of keys removed.
    ///
    /// Tags are processed independently; a failure leaves earlier tags invalidated.
    ///
    /// # Errors
    ///
    /// Returns the first [`Error::StoreUnavailable`] encountered.
    pub async fn invalidate_multiple_tags<I>(&self, tags: I) -> Result<u64>
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
    {
        let mut total = 0;
        for tag in tags {
            total += self.invalidate_by_tag(tag.as_ref()).await?;
        }
        Ok(total)
    }

    /// Returns `true` if `key` exists.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StoreUnavailable`] if the store cannot be reached.
    pub async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.store.exists(key).await?)
    }

    /// Returns the remaining lifetime of `key`.
    ///
    /// Use [`KeyTtl::as_raw`] for the `-2` (absent) / `-1` (no expiry) / seconds encoding.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StoreUnavailable`] if the store cannot be reached.
    pub async fn get_ttl(&self, key: &str) -> Result<KeyTtl> {
        Ok(self.store.ttl(key).await?)
    }

    /// Resets the lifetime of an existing key without touching its value.
    ///
    /// Returns `false` if the key does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StoreUnavailable`] if the store cannot be reached.
    pub async fn refresh_ttl(&self, key: &str, ttl: Duration) -> Result<bool> {
        let started = Instant::now();
        let result = self.store.expire(key, ttl).await.map_err(Error::from);
        let activity = match result {
            Ok(true) => CacheActivity::Refreshed,
            Ok(false) => CacheActivity::Miss,
            Err(_) => CacheActivity::Error,
        };
        self.record(CacheOperation::Refresh, activity, key, started);
        result
    }

    /// Returns the cached value at `key`, or produces, stores and returns a new one.
    ///
    /// Concurrent misses for the same key each run `factory`; use
    /// [`get_or_set_exclusive`](Self::get_or_set_exclusive) to let only one producer run.
    ///
    /// # Errors
    ///
    /// Returns an error if the produced value cannot be stored.
    pub async fn get_or_set<T, F, Fut>(&self, key: &str, factory: F, options: &EntryOptions) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        if let Some(cached) = self.get(key, options.codec).await {
            return Ok(cached);
        }

        let value = factory().await;
        self.set(key, &value, options).await?;
        Ok(value)
    }

    /// Like [`get_or_set`](Self::get_or_set), for a producer that can fail.
    ///
    /// Failures are not cached.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Upstream`] wrapping the producer's error, or an error if the produced
    /// value cannot be stored.
    pub async fn try_get_or_set<T, E, F, Fut>(&self, key: &str, factory: F, options: &EntryOptions) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        E: Into<BoxError>,
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
    {
        if let Some(cached) = self.get(key, options.codec).await {
            return Ok(cached);
        }

        let value = factory().await.map_err(Error::upstream)?;
        self.set(key, &value, options).await?;
        Ok(value)
    }

    /// Like [`try_get_or_set`](Self::try_get_or_set), but lets only one producer across all
    /// processes compute a missing value at a time.
    ///
    /// On a miss the caller takes the `fill:<key>` lock in blocking mode, then checks the cache
    /// again since the previous holder has usually stored the value by then. If the lock cannot
    /// be taken within its retry budget, the value is produced anyway.
    ///
    /// # Errors
    ///
    /// Same as [`try_get_or_set`](Self::try_get_or_set), plus [`Error::StoreUnavailable`] if
    /// the lock cannot be attempted.
    pub async fn get_or_set_exclusive<T, E, F, Fut>(&self, key: &str, factory: F, options: &EntryOptions) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        E: Into<BoxError>,
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
    {
        if let Some(cached) = self.get(key, options.codec).await {
            return Ok(cached);
        }

        let locks = LockClient::from_shared(Arc::clone(&self.store));
        let mut lock = locks.lock(
            &format!("{FILL_LOCK_PREFIX}{key}"),
            self.fill_lock.clone().with_skip_if_locked(false),
        );

        let acquired = lock.acquire(true).await?;
        if !acquired {
            tracing::info!(cache.name = self.name, cache.key = key, "cache.fill_lock_contended");
        }

        let result = self.try_get_or_set(key, factory, options).await;

        if acquired && let Err(e) = lock.release().await {
            tracing::warn!(cache.name = self.name, cache.key = key, error = %e, "cache.fill_lock_release_failed");
        }
        result
    }

    /// Publishes an invalidation message on `channel` and returns how many subscribers got it.
    ///
    /// `message` is usually an [`InvalidationMessage`](crate::InvalidationMessage), but any
    /// text is sent as is.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StoreUnavailable`] if the store cannot be reached.
    pub async fn publish_invalidation(&self, channel: &str, message: impl fmt::Display) -> Result<u64> {
        Ok(self.store.publish(channel, &message.to_string()).await?)
    }

    /// Starts applying invalidation messages published on `channel`.
    ///
    /// The first call opens a dedicated pub/sub connection and starts the listener task; later
    /// calls add channels to the same listener. If the listener has stopped because its
    /// connection closed, it is restarted and resubscribed to every earlier channel.
    ///
    /// Every received message is applied to the store and then passed to each registered
    /// `callback`, including malformed messages, which are otherwise ignored.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StoreUnavailable`] if the subscription cannot be established.
    pub async fn subscribe_invalidation(&self, channel: &str, callback: Option<InvalidationCallback>) -> Result<()> {
        let mut slot = self.listener.lock().await;

        if slot.listener.as_ref().is_none_or(|listener| !listener.is_running()) {
            let listener = Listener::start(Arc::clone(&self.store), Arc::clone(&self.callbacks)).await?;
            for previous in &slot.channels {
                listener.subscribe(previous).await?;
            }
            slot.listener = Some(listener);
        }

        if let Some(listener) = &slot.listener {
            listener.subscribe(channel).await?;
        }
        slot.channels.insert(channel.to_owned());

        if let Some(callback) = callback {
            self.callbacks.write().push(callback);
        }
        Ok(())
    }

    /// Stops the invalidation listener, waiting for it to finish.
    ///
    /// The cache remains usable; a later
    /// [`subscribe_invalidation`](Self::subscribe_invalidation) starts a fresh listener.
    pub async fn close(&self) {
        let mut slot = self.listener.lock().await;
        slot.channels.clear();

        if let Some(listener) = slot.listener.take() {
            listener.stop().await;
            tracing::debug!(cache.name = self.name, "cache.listener_stopped");
        }
    }

    fn record(&self, operation: CacheOperation, activity: CacheActivity, key: &str, started: Instant) {
        telemetry::record(self.name, operation, activity, key, Some(started.elapsed()));
    }

    fn record_outcome(&self, operation: CacheOperation, result: &Result<u64>, key: &str, started: Instant) {
        let activity = match result {
            Ok(0) => CacheActivity::Miss,
            Ok(_) => CacheActivity::Invalidated,
            Err(_) => CacheActivity::Error,
        };
        self.record(operation, activity, key, started);
    }
}

impl<S: Store> Drop for ObjectCache<S> {
    fn drop(&mut self) {
        if let Some(listener) = &self.listener.get_mut().listener {
            listener.abort();
        }
    }
}

async fn register_tag<S: Store>(store: &S, tag: &str, key: &str, ttl: Duration) -> Result<()> {
    let tag_key = tag_key(tag);
    store.sadd(&tag_key, &[key.to_owned()]).await?;

    // A freshly created set has no expiry yet.
    let outlives_entry = matches!(store.ttl(&tag_key).await?, KeyTtl::Expires(remaining) if remaining >= ttl);
    if !outlives_entry {
        store.expire(&tag_key, ttl).await?;
    }
    Ok(())
}

pub(crate) async fn delete_key<S: Store>(store: &S, key: &str) -> Result<u64> {
    Ok(store.del(&[key.to_owned()]).await?)
}

pub(crate) async fn invalidate_pattern<S: Store>(store: &S, pattern: &str) -> Result<u64> {
    let keys = store.scan_match(pattern).await?;
    if keys.is_empty() {
        return Ok(0);
    }
    Ok(store.del(&keys).await?)
}

pub(crate) async fn invalidate_tag<S: Store>(store: &S, tag: &str) -> Result<u64> {
    let tag_key = tag_key(tag);
    let members = store.smembers(&tag_key).await?;
    if members.is_empty() {
        return Ok(0);
    }

    let deleted = store.del(&members).await?;
    store.del(&[tag_key]).await?;
    Ok(deleted)
}
