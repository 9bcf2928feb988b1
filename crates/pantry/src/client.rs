// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The [`Pantry`] entry point that wires every component to one store.

use std::{fmt, sync::Arc};

use pantry_store::Store;

use crate::{
    AutocompleteIndex, Catalog, CatalogCache, DistributedLock, EntryOptions, InvalidationCallback, InvalidationMessage,
    LockClient, ObjectCache, PantryConfig, PeriodicJob, Result,
};

/// Entry point bundling every component over one shared store connection.
///
/// A `Pantry` owns the store, an [`ObjectCache`] and a [`LockClient`], and hands out locks,
/// autocomplete indexes, periodic jobs and catalog caches preconfigured from its
/// [`PantryConfig`].
///
/// # Examples
///
/// ```
/// use pantry::{InvalidationMessage, Pantry, PantryConfig};
/// use pantry_store::memory::MemoryStore;
///
/// # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
/// let pantry = Pantry::new(MemoryStore::new(), PantryConfig::default());
///
/// pantry.cache().set("greeting", &"hello", &pantry.entry_options()).await?;
/// pantry.invalidate(&InvalidationMessage::Key("greeting".to_owned())).await?;
///
/// let mut lock = pantry.lock("nightly-report");
/// assert!(lock.acquire(false).await?);
/// assert!(lock.release().await?);
/// # Ok::<(), pantry::Error>(())
/// # });
/// ```
pub struct Pantry<S: Store> {
    config: PantryConfig,
    store: Arc<S>,
    cache: Arc<ObjectCache<S>>,
    locks: LockClient<S>,
}

impl<S: Store> fmt::Debug for Pantry<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pantry")
            .field("config", &self.config)
            .field("cache", &self.cache)
            .finish_non_exhaustive()
    }
}

impl<S: Store> Pantry<S> {
    /// Creates a pantry over `store`.
    #[must_use]
    pub fn new(store: S, config: PantryConfig) -> Self {
        Self::from_shared(Arc::new(store), config)
    }

    /// Creates a pantry over a store shared with other components.
    #[must_use]
    pub fn from_shared(store: Arc<S>, config: PantryConfig) -> Self {
        let cache = ObjectCache::from_shared(Arc::clone(&store))
            .with_fill_lock(config.lock_options().with_auto_extend(true));

        Self {
            locks: LockClient::from_shared(Arc::clone(&store)),
            cache: Arc::new(cache),
            store,
            config,
        }
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &PantryConfig {
        &self.config
    }

    /// Returns the shared store.
    #[must_use]
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Returns the object cache.
    #[must_use]
    pub fn cache(&self) -> &Arc<ObjectCache<S>> {
        &self.cache
    }

    /// Returns the lock client.
    #[must_use]
    pub fn locks(&self) -> &LockClient<S> {
        &self.locks
    }

    /// Returns entry options with the configured default TTL.
    #[must_use]
    pub fn entry_options(&self) -> EntryOptions {
        self.config.entry_options()
    }

    /// Returns an unacquired lock named `name` with the configured lease and retry policy.
    #[must_use]
    pub fn lock(&self, name: &str) -> DistributedLock<S> {
        self.locks.lock(name, self.config.lock_options())
    }

    /// Returns the autocomplete index stored at `key`.
    #[must_use]
    pub fn autocomplete(&self, key: impl Into<String>) -> AutocompleteIndex<S> {
        AutocompleteIndex::new(Arc::clone(&self.store), key, self.config.autocomplete_options())
    }

    /// Returns a periodic job named `name` whose lock uses the configured lease.
    #[must_use]
    pub fn periodic(&self, name: impl Into<String>) -> PeriodicJob<S> {
        PeriodicJob::new(name, self.locks.clone()).with_lock_options(self.config.lock_options().with_auto_extend(true))
    }

    /// Returns a catalog cache over `catalog` whose listings live for the default TTL.
    #[must_use]
    pub fn catalog<C: Catalog>(&self, catalog: C) -> CatalogCache<C, S> {
        CatalogCache::new(catalog, Arc::clone(&self.cache)).with_ttl(self.entry_options().ttl())
    }

    /// Broadcasts `message` on the configured invalidation channel.
    ///
    /// The message is only applied by listening processes, this one included if it called
    /// [`listen`](Self::listen).
    ///
    /// # Errors
    ///
    /// Returns [`Error::StoreUnavailable`](crate::Error::StoreUnavailable) if the store cannot be
    /// reached.
    pub async fn invalidate(&self, message: &InvalidationMessage) -> Result<u64> {
        self.cache
            .publish_invalidation(&self.config.invalidation_channel, message)
            .await
    }

    /// Starts applying invalidations published on the configured channel.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StoreUnavailable`](crate::Error::StoreUnavailable) if the subscription
    /// cannot be established.
    pub async fn listen(&self, callback: Option<InvalidationCallback>) -> Result<()> {
        self.cache
            .subscribe_invalidation(&self.config.invalidation_channel, callback)
            .await
    }

    /// Stops the invalidation listener.
    pub async fn close(&self) {
        self.cache.close().await;
    }
}

#[cfg(feature = "redis")]
impl Pantry<pantry_store::RedisStore> {
    /// Validates `config`, connects to its Redis server and checks that it answers.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`](crate::Error::Configuration) if `config` is invalid, and
    /// [`Error::StoreUnavailable`](crate::Error::StoreUnavailable) if the server cannot be
    /// reached.
    pub async fn connect(config: PantryConfig) -> Result<Self> {
        config.validate()?;

        let store = pantry_store::RedisStore::connect(&config.redis_url).await?;
        store.ping().await?;
        tracing::info!(pantry.channel = %config.invalidation_channel, "pantry.connected");

        Ok(Self::new(store, config))
    }
}
