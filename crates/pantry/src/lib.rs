// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![cfg_attr(docsrs, feature(doc_cfg))]

//! Caching and coordination primitives over a shared key-value store.
//!
//! This crate provides:
//! - [`ObjectCache`], a cache of serializable values with JSON or compressed binary encoding,
//!   per-entry TTLs, tag groups and cross-process invalidation over pub/sub
//! - [`DistributedLock`], a token-leased mutual-exclusion lock with blocking and
//!   skip-if-locked acquisition and an optional heartbeat
//! - [`AutocompleteIndex`], prefix and next-word completion over a lexicographic sorted set
//!   that is rebuilt atomically
//! - [`PeriodicJob`], a fire-and-sleep loop that runs a task on at most one process at a time
//! - [`CatalogCache`], read-through caching of product catalog listings
//!
//! Every component is written against the [`Store`](pantry_store::Store) trait from
//! `pantry_store`. Production code uses its Redis backend; tests use the in-memory backend from
//! the `test-util` feature.
//!
//! # Examples
//!
//! ## Caching with tags
//!
//! ```
//! use pantry::{Codec, EntryOptions, ObjectCache};
//! use pantry_store::memory::MemoryStore;
//! use std::time::Duration;
//!
//! # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
//! let cache = ObjectCache::new(MemoryStore::new());
//! let options = EntryOptions::new(Duration::from_secs(3600)).compressed().with_tag("catalog");
//!
//! cache.set("products:all", &vec!["Pizza Margherita", "Pizza Diavola"], &options).await?;
//! let products: Option<Vec<String>> = cache.get("products:all", Codec::Compressed).await;
//! assert_eq!(products.map(|p| p.len()), Some(2));
//!
//! cache.invalidate_by_tag("catalog").await?;
//! assert!(!cache.exists("products:all").await?);
//! # Ok::<(), pantry::Error>(())
//! # });
//! ```
//!
//! ## Skipping work another process is already doing
//!
//! ```
//! use pantry::{LockClient, LockOptions, Scoped};
//! use pantry_store::memory::MemoryStore;
//!
//! # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
//! let locks = LockClient::new(MemoryStore::new());
//! let mut lock = locks.lock("task:refresh", LockOptions::new().with_skip_if_locked(true));
//!
//! match lock.scoped(|| async { "refreshed" }).await? {
//!     Scoped::Ran(outcome) => assert_eq!(outcome, "refreshed"),
//!     Scoped::Skipped => unreachable!("nobody else holds the lock"),
//! }
//! # Ok::<(), pantry::Error>(())
//! # });
//! ```
//!
//! # Connecting to Redis
//!
//! ```no_run
//! use pantry::{Pantry, PantryConfig};
//!
//! # async fn example() -> pantry::Result<()> {
//! let pantry = Pantry::connect(PantryConfig::from_env()?).await?;
//! pantry.listen(None).await?;
//!
//! let suggestions = pantry.autocomplete("autocomplete:products").search("pizza ").await?;
//! println!("{:?}", suggestions.next_words);
//! # Ok(())
//! # }
//! ```

pub mod autocomplete;
pub mod cache;
pub mod catalog;
mod client;
pub mod codec;
pub mod config;
pub mod error;
pub mod invalidation;
pub mod lock;
pub mod periodic;
mod telemetry;

#[doc(inline)]
pub use autocomplete::{AutocompleteIndex, AutocompleteOptions, Completion, CompletionMode};
#[doc(inline)]
pub use cache::{EntryOptions, ObjectCache, tag_key};
#[doc(inline)]
pub use catalog::{Catalog, CatalogCache, Category, CategoryProducts, Product, cart_key};
pub use client::Pantry;
#[doc(inline)]
pub use codec::{Codec, CodecError};
#[doc(inline)]
pub use config::PantryConfig;
#[doc(inline)]
pub use error::{BoxError, Error, Result};
#[doc(inline)]
pub use invalidation::{InvalidationCallback, InvalidationMessage};
#[doc(inline)]
pub use lock::{DistributedLock, LockClient, LockOptions, LockState, Scoped};
#[doc(inline)]
pub use periodic::{JobOutcome, PeriodicJob};
