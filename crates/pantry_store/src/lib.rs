// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![cfg_attr(docsrs, feature(doc_cfg))]

//! Key-value store abstractions for the `pantry` caching and coordination layer.
//!
//! This crate defines the [`Store`] trait, a narrow capability interface over a networked
//! key-value store with atomic scripting and pub/sub, together with [`Subscription`] for
//! receiving published messages.
//!
//! # Overview
//!
//! The store abstraction separates wire concerns from caching and locking semantics.
//! `pantry` builds its object cache, distributed lock and autocomplete index purely in terms
//! of the operations declared here, so any backend offering them can be plugged in.
//!
//! Two backends ship with the crate:
//!
//! - `RedisStore` (feature `redis`, enabled by default) talks to Redis over a shared
//!   multiplexed connection.
//! - `MemoryStore` (feature `test-util`) keeps everything in process, records every operation
//!   and supports failure injection for exercising error paths.
//!
//! # Atomic scripts
//!
//! Lock ownership is enforced by two token-gated operations, [`Store::compare_and_delete`] and
//! [`Store::compare_and_expire`]. Implementations must execute each of them as a single atomic
//! step on the server; a read followed by a separate write races with TTL expiry.
//!
//! # Example
//!
//! ```no_run
//! use pantry_store::{RedisStore, Store};
//! use std::time::Duration;
//!
//! # async fn example() -> pantry_store::Result<()> {
//! let store = RedisStore::connect("redis://127.0.0.1:6379/0").await?;
//! store.set_ex("greeting", b"hello", Duration::from_secs(60)).await?;
//! assert_eq!(store.get("greeting").await?.as_deref(), Some(&b"hello"[..]));
//! # Ok(())
//! # }
//! ```

pub mod error;
#[cfg(any(feature = "test-util", test))]
pub mod memory;
#[cfg(feature = "redis")]
pub mod redis;
mod store;

#[doc(inline)]
pub use error::{Error, ErrorKind, Result};
#[cfg(feature = "redis")]
#[doc(inline)]
pub use redis::RedisStore;
#[doc(inline)]
pub use store::{KeyTtl, Message, Store, Subscription};
