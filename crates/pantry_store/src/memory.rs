// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! In-process store for testing.
//!
//! This module provides [`MemoryStore`], a [`Store`] that keeps its keyspace in memory,
//! records every operation and supports failure injection for testing error paths.
//! Expiry follows the tokio clock, so tests running with paused time observe TTLs exactly.

use std::{
    collections::{BTreeSet, HashMap, HashSet},
    fmt::Debug,
    sync::Arc,
    time::Duration,
};

use parking_lot::Mutex;
use tokio::{sync::mpsc, time::Instant};

use crate::{Error, KeyTtl, Message, Result, Store, Subscription};

/// Recorded store operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreOp {
    /// `GET key`.
    Get(String),
    /// `SETEX key ttl value`.
    SetEx {
        /// The key that was written.
        key: String,
        /// The requested lifetime.
        ttl: Duration,
    },
    /// `SET key value NX EX ttl`.
    SetNxEx {
        /// The key that was written.
        key: String,
        /// The requested lifetime.
        ttl: Duration,
    },
    /// `DEL key...`.
    Del(Vec<String>),
    /// `EXISTS key`.
    Exists(String),
    /// `TTL key`.
    Ttl(String),
    /// `EXPIRE key ttl`.
    Expire {
        /// The key whose lifetime was changed.
        key: String,
        /// The requested lifetime.
        ttl: Duration,
    },
    /// A full cursor scan with `MATCH pattern`.
    Scan(String),
    /// `SADD key member...`.
    SAdd(String),
    /// `SMEMBERS key`.
    SMembers(String),
    /// The token-gated delete script.
    CompareAndDelete(String),
    /// The token-gated expire script.
    CompareAndExpire(String),
    /// `ZADD key 0 member...`.
    ZAdd(String),
    /// `ZRANGEBYLEX key [prefix [prefix\xff`.
    ZRangeByLex(String),
    /// `RENAME from to`.
    Rename {
        /// The source key.
        from: String,
        /// The destination key.
        to: String,
    },
    /// `PUBLISH channel message`.
    Publish {
        /// The channel.
        channel: String,
        /// The published payload.
        message: String,
    },
    /// `SUBSCRIBE channel`.
    Subscribe(String),
}

impl StoreOp {
    /// Returns the primary key this operation touches, if any.
    #[must_use]
    pub fn key(&self) -> Option<&str> {
        match self {
            Self::Get(key)
            | Self::Exists(key)
            | Self::Ttl(key)
            | Self::SAdd(key)
            | Self::SMembers(key)
            | Self::CompareAndDelete(key)
            | Self::CompareAndExpire(key)
            | Self::ZAdd(key)
            | Self::ZRangeByLex(key)
            | Self::SetEx { key, .. }
            | Self::SetNxEx { key, .. }
            | Self::Expire { key, .. } => Some(key),
            Self::Rename { from, .. } => Some(from),
            Self::Del(keys) => keys.first().map(String::as_str),
            Self::Scan(_) | Self::Publish { .. } | Self::Subscribe(_) => None,
        }
    }
}

type FailPredicate = Box<dyn Fn(&StoreOp) -> bool + Send + Sync>;

#[derive(Debug, Clone)]
enum Value {
    String(Vec<u8>),
    Set(HashSet<String>),
    SortedSet(BTreeSet<String>),
}

#[derive(Debug, Clone)]
struct Slot {
    value: Value,
    expires_at: Option<Instant>,
}

impl Slot {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }
}

#[derive(Debug, Default)]
struct Keyspace {
    slots: HashMap<String, Slot>,
}

impl Keyspace {
    fn live(&mut self, key: &str) -> Option<&mut Slot> {
        let now = Instant::now();
        if self.slots.get(key).is_some_and(|slot| !slot.is_live(now)) {
            self.slots.remove(key);
        }
        self.slots.get_mut(key)
    }

    fn purge_expired(&mut self) {
        let now = Instant::now();
        self.slots.retain(|_, slot| slot.is_live(now));
    }
}

#[derive(Debug)]
struct Subscriber {
    channels: Arc<Mutex<HashSet<String>>>,
    sender: mpsc::UnboundedSender<Message>,
}

/// An in-memory [`Store`] for tests.
///
/// Clones share the same keyspace, operation log and failure predicate, so a test can hand one
/// clone to the code under test and keep another for assertions.
///
/// # Examples
///
/// ```
/// use pantry_store::{Store, memory::{MemoryStore, StoreOp}};
/// use std::time::Duration;
///
/// # tokio::runtime::Builder::new_current_thread().enable_time().build().unwrap().block_on(async {
/// let store = MemoryStore::new();
/// store.set_ex("key", b"value", Duration::from_secs(60)).await?;
/// assert!(store.exists("key").await?);
///
/// store.fail_when(|op| matches!(op, StoreOp::Get(_)));
/// assert!(store.get("key").await.is_err());
/// # Ok::<(), pantry_store::Error>(())
/// # });
/// ```
#[derive(Clone, Default)]
pub struct MemoryStore {
    keyspace: Arc<Mutex<Keyspace>>,
    subscribers: Arc<Mutex<Vec<Subscriber>>>,
    operations: Arc<Mutex<Vec<StoreOp>>>,
    fail_when: Arc<Mutex<Option<FailPredicate>>>,
}

impl Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("keyspace", &self.keyspace)
            .field("operations", &self.operations)
            .field("fail_when", &self.fail_when.lock().is_some())
            .finish_non_exhaustive()
    }
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets a predicate that determines which operations fail.
    ///
    /// Failing operations are still recorded but leave the keyspace untouched.
    pub fn fail_when<F>(&self, predicate: F)
    where
        F: Fn(&StoreOp) -> bool + Send + Sync + 'static,
    {
        *self.fail_when.lock() = Some(Box::new(predicate));
    }

    /// Clears the failure predicate, allowing all operations to succeed.
    pub fn clear_failures(&self) {
        *self.fail_when.lock() = None;
    }

    /// Returns a copy of all recorded operations.
    #[must_use]
    pub fn operations(&self) -> Vec<StoreOp> {
        self.operations.lock().clone()
    }

    /// Clears the operation log.
    pub fn clear_operations(&self) {
        self.operations.lock().clear();
    }

    /// Returns all live keys in sorted order.
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        let mut keyspace = self.keyspace.lock();
        keyspace.purge_expired();
        let mut keys: Vec<_> = keyspace.slots.keys().cloned().collect();
        keys.sort_unstable();
        keys
    }

    /// Returns the members of the sorted set at `key` in order, or an empty list.
    #[must_use]
    pub fn sorted_set(&self, key: &str) -> Vec<String> {
        match self.keyspace.lock().live(key).map(|slot| &slot.value) {
            Some(Value::SortedSet(members)) => members.iter().cloned().collect(),
            _ => Vec::new(),
        }
    }

    /// Stores a string value without expiry, bypassing the operation log.
    pub fn insert_raw(&self, key: impl Into<String>, value: impl Into<Vec<u8>>) {
        self.keyspace.lock().slots.insert(
            key.into(),
            Slot {
                value: Value::String(value.into()),
                expires_at: None,
            },
        );
    }

    fn record(&self, op: StoreOp) -> Result<()> {
        let fail = self.fail_when.lock().as_ref().is_some_and(|predicate| predicate(&op));
        let description = format!("{op:?}");
        self.operations.lock().push(op);

        if fail {
            return Err(Error::from_message(format!("injected failure: {description}")));
        }
        Ok(())
    }
}

fn deadline(ttl: Duration) -> Instant {
    Instant::now() + ttl
}

fn wrong_type(key: &str) -> Error {
    Error::from_message(format!("WRONGTYPE operation against key `{key}` holding the wrong kind of value"))
}

impl Store for MemoryStore {
    type Subscription = MemorySubscription;

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.record(StoreOp::Get(key.to_owned()))?;
        match self.keyspace.lock().live(key).map(|slot| &slot.value) {
            None => Ok(None),
            Some(Value::String(bytes)) => Ok(Some(bytes.clone())),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn set_ex(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()> {
        self.record(StoreOp::SetEx { key: key.to_owned(), ttl })?;
        self.keyspace.lock().slots.insert(
            key.to_owned(),
            Slot {
                value: Value::String(value.to_vec()),
                expires_at: Some(deadline(ttl)),
            },
        );
        Ok(())
    }

    async fn set_nx_ex(&self, key: &str, value: &[u8], ttl: Duration) -> Result<bool> {
        self.record(StoreOp::SetNxEx { key: key.to_owned(), ttl })?;
        let mut keyspace = self.keyspace.lock();
        if keyspace.live(key).is_some() {
            return Ok(false);
        }
        keyspace.slots.insert(
            key.to_owned(),
            Slot {
                value: Value::String(value.to_vec()),
                expires_at: Some(deadline(ttl)),
            },
        );
        Ok(true)
    }

    async fn del(&self, keys: &[String]) -> Result<u64> {
        self.record(StoreOp::Del(keys.to_vec()))?;
        let mut keyspace = self.keyspace.lock();
        let mut deleted = 0;
        for key in keys {
            if keyspace.live(key).is_some() {
                keyspace.slots.remove(key);
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        self.record(StoreOp::Exists(key.to_owned()))?;
        Ok(self.keyspace.lock().live(key).is_some())
    }

    async fn ttl(&self, key: &str) -> Result<KeyTtl> {
        self.record(StoreOp::Ttl(key.to_owned()))?;
        let ttl = match self.keyspace.lock().live(key) {
            None => KeyTtl::Missing,
            Some(Slot { expires_at: None, .. }) => KeyTtl::Persistent,
            Some(Slot {
                expires_at: Some(at), ..
            }) => {
                let remaining = at.saturating_duration_since(Instant::now());
                // Round to the nearest second, as the server does.
                KeyTtl::Expires(Duration::from_secs((remaining.as_millis() + 500).div_euclid(1000).try_into().unwrap_or(u64::MAX)))
            }
        };
        Ok(ttl)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        self.record(StoreOp::Expire { key: key.to_owned(), ttl })?;
        match self.keyspace.lock().live(key) {
            Some(slot) => {
                slot.expires_at = Some(deadline(ttl));
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn scan_match(&self, pattern: &str) -> Result<Vec<String>> {
        self.record(StoreOp::Scan(pattern.to_owned()))?;
        let mut keyspace = self.keyspace.lock();
        keyspace.purge_expired();
        let mut keys: Vec<_> = keyspace.slots.keys().filter(|key| glob_match(pattern, key)).cloned().collect();
        keys.sort_unstable();
        Ok(keys)
    }

    async fn sadd(&self, key: &str, members: &[String]) -> Result<u64> {
        self.record(StoreOp::SAdd(key.to_owned()))?;
        let mut keyspace = self.keyspace.lock();
        if keyspace.live(key).is_none() {
            keyspace.slots.insert(
                key.to_owned(),
                Slot {
                    value: Value::Set(HashSet::new()),
                    expires_at: None,
                },
            );
        }
        match keyspace.slots.get_mut(key).map(|slot| &mut slot.value) {
            Some(Value::Set(set)) => Ok(members.iter().filter(|member| set.insert((*member).clone())).count() as u64),
            _ => Err(wrong_type(key)),
        }
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>> {
        self.record(StoreOp::SMembers(key.to_owned()))?;
        match self.keyspace.lock().live(key).map(|slot| &slot.value) {
            None => Ok(Vec::new()),
            Some(Value::Set(set)) => {
                let mut members: Vec<_> = set.iter().cloned().collect();
                members.sort_unstable();
                Ok(members)
            }
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn compare_and_delete(&self, key: &str, token: &str) -> Result<bool> {
        self.record(StoreOp::CompareAndDelete(key.to_owned()))?;
        let mut keyspace = self.keyspace.lock();
        let owned = matches!(keyspace.live(key).map(|slot| &slot.value), Some(Value::String(value)) if value == token.as_bytes());
        if owned {
            keyspace.slots.remove(key);
        }
        Ok(owned)
    }

    async fn compare_and_expire(&self, key: &str, token: &str, ttl: Duration) -> Result<bool> {
        self.record(StoreOp::CompareAndExpire(key.to_owned()))?;
        match self.keyspace.lock().live(key) {
            Some(slot) if matches!(&slot.value, Value::String(value) if value == token.as_bytes()) => {
                slot.expires_at = Some(deadline(ttl));
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn zadd_lex(&self, key: &str, members: &[String]) -> Result<u64> {
        self.record(StoreOp::ZAdd(key.to_owned()))?;
        let mut keyspace = self.keyspace.lock();
        if keyspace.live(key).is_none() {
            keyspace.slots.insert(
                key.to_owned(),
                Slot {
                    value: Value::SortedSet(BTreeSet::new()),
                    expires_at: None,
                },
            );
        }
        match keyspace.slots.get_mut(key).map(|slot| &mut slot.value) {
            Some(Value::SortedSet(set)) => Ok(members.iter().filter(|member| set.insert((*member).clone())).count() as u64),
            _ => Err(wrong_type(key)),
        }
    }

    async fn zrange_by_lex_prefix(&self, key: &str, prefix: &str, limit: usize) -> Result<Vec<String>> {
        self.record(StoreOp::ZRangeByLex(key.to_owned()))?;
        match self.keyspace.lock().live(key).map(|slot| &slot.value) {
            None => Ok(Vec::new()),
            Some(Value::SortedSet(set)) => Ok(set
                .range::<str, _>((std::ops::Bound::Included(prefix), std::ops::Bound::Unbounded))
                .take_while(|member| member.starts_with(prefix))
                .take(limit)
                .cloned()
                .collect()),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn rename(&self, from: &str, to: &str) -> Result<()> {
        self.record(StoreOp::Rename {
            from: from.to_owned(),
            to: to.to_owned(),
        })?;
        let mut keyspace = self.keyspace.lock();
        if keyspace.live(from).is_none() {
            return Err(Error::from_message("ERR no such key"));
        }
        if let Some(slot) = keyspace.slots.remove(from) {
            keyspace.slots.insert(to.to_owned(), slot);
        }
        Ok(())
    }

    async fn publish(&self, channel: &str, message: &str) -> Result<u64> {
        self.record(StoreOp::Publish {
            channel: channel.to_owned(),
            message: message.to_owned(),
        })?;
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|subscriber| !subscriber.sender.is_closed());

        let mut receivers = 0;
        for subscriber in subscribers.iter() {
            if subscriber.channels.lock().contains(channel) && subscriber.sender.send(Message::new(channel, message)).is_ok() {
                receivers += 1;
            }
        }
        Ok(receivers)
    }

    async fn subscription(&self) -> Result<MemorySubscription> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let channels = Arc::new(Mutex::new(HashSet::new()));
        self.subscribers.lock().push(Subscriber {
            channels: Arc::clone(&channels),
            sender,
        });

        Ok(MemorySubscription {
            store: self.clone(),
            channels,
            receiver,
        })
    }
}

/// A pub/sub connection to a [`MemoryStore`].
#[derive(Debug)]
pub struct MemorySubscription {
    store: MemoryStore,
    channels: Arc<Mutex<HashSet<String>>>,
    receiver: mpsc::UnboundedReceiver<Message>,
}

impl Subscription for MemorySubscription {
    async fn subscribe(&mut self, channel: &str) -> Result<()> {
        self.store.record(StoreOp::Subscribe(channel.to_owned()))?;
        self.channels.lock().insert(channel.to_owned());
        Ok(())
    }

    async fn next_message(&mut self) -> Option<Message> {
        self.receiver.recv().await
    }
}

/// Matches `text` against a glob `pattern` with the store's `SCAN MATCH` syntax.
///
/// Supports `*`, `?`, character classes such as `[abc]`, `[^a]` and `[a-z]`, and `\` escapes.
fn glob_match(pattern: &str, text: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let text: Vec<char> = text.chars().collect();
    glob_match_at(&pattern, &text)
}

fn glob_match_at(pattern: &[char], text: &[char]) -> bool {
    let Some((&first, rest)) = pattern.split_first() else {
        return text.is_empty();
    };

    match first {
        '*' => (0..=text.len()).any(|skip| glob_match_at(rest, &text[skip..])),
        '?' => !text.is_empty() && glob_match_at(rest, &text[1..]),
        '[' => {
            let Some((&c, remaining_text)) = text.split_first() else {
                return false;
            };
            match class_match(rest, c) {
                Some((matched, after_class)) => matched && glob_match_at(after_class, remaining_text),
                // An unterminated class matches a literal bracket.
                None => c == '[' && glob_match_at(rest, remaining_text),
            }
        }
        '\\' if !rest.is_empty() => text.first() == Some(&rest[0]) && glob_match_at(&rest[1..], &text[1..]),
        literal => text.first() == Some(&literal) && glob_match_at(rest, &text[1..]),
    }
}

/// Evaluates a character class body (after `[`) against `c`.
///
/// Returns whether `c` matched and the pattern remaining after the closing `]`, or `None` if
/// the class is not terminated.
fn class_match(body: &[char], c: char) -> Option<(bool, &[char])> {
    let (negated, mut body) = match body.split_first() {
        Some(('^', rest)) => (true, rest),
        _ => (false, body),
    };

    let mut matched = false;
    loop {
        match body {
            [] => return None,
            [']', rest @ ..] => return Some((matched != negated, rest)),
            ['\\', escaped, rest @ ..] => {
                matched |= *escaped == c;
                body = rest;
            }
            [low, '-', high, rest @ ..] if *high != ']' => {
                let (low, high) = if low <= high { (*low, *high) } else { (*high, *low) };
                matched |= (low..=high).contains(&c);
                body = rest;
            }
            [single, rest @ ..] => {
                matched |= *single == c;
                body = rest;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(names: &[&str]) -> Vec<String> {
        names.iter().map(|name| (*name).to_owned()).collect()
    }

    #[test]
    fn glob_wildcards() {
        assert!(glob_match("user:*", "user:123"));
        assert!(glob_match("user:*", "user:"));
        assert!(!glob_match("user:*", "users:1"));
        assert!(glob_match("h?llo", "hello"));
        assert!(!glob_match("h?llo", "hllo"));
        assert!(glob_match("*", ""));
    }

    #[test]
    fn glob_classes_and_escapes() {
        assert!(glob_match("h[ae]llo", "hallo"));
        assert!(!glob_match("h[ae]llo", "hillo"));
        assert!(glob_match("h[^e]llo", "hallo"));
        assert!(!glob_match("h[^e]llo", "hello"));
        assert!(glob_match("h[a-c]llo", "hbllo"));
        assert!(glob_match(r"star\*", "star*"));
        assert!(!glob_match(r"star\*", "starry"));
        assert!(glob_match("[", "["));
    }

    #[tokio::test(start_paused = true)]
    async fn set_ex_expires_after_ttl() -> Result<()> {
        let store = MemoryStore::new();
        store.set_ex("k", b"v", Duration::from_secs(10)).await?;
        assert_eq!(store.ttl("k").await?, KeyTtl::Expires(Duration::from_secs(10)));

        tokio::time::sleep(Duration::from_secs(10)).await;

        assert_eq!(store.get("k").await?, None);
        assert_eq!(store.ttl("k").await?, KeyTtl::Missing);
        Ok(())
    }

    #[tokio::test]
    async fn sets_have_no_expiry_until_expired() -> Result<()> {
        let store = MemoryStore::new();
        assert_eq!(store.sadd("tag:t", &keys(&["a", "b", "a"])).await?, 2);
        assert_eq!(store.ttl("tag:t").await?, KeyTtl::Persistent);
        assert!(store.expire("tag:t", Duration::from_secs(5)).await?);
        assert_eq!(store.smembers("tag:t").await?, keys(&["a", "b"]));
        Ok(())
    }

    #[tokio::test]
    async fn set_nx_ex_only_writes_absent_keys() -> Result<()> {
        let store = MemoryStore::new();
        assert!(store.set_nx_ex("lock:a", b"one", Duration::from_secs(5)).await?);
        assert!(!store.set_nx_ex("lock:a", b"two", Duration::from_secs(5)).await?);
        assert_eq!(store.get("lock:a").await?.as_deref(), Some(&b"one"[..]));
        Ok(())
    }

    #[tokio::test]
    async fn compare_and_delete_requires_matching_token() -> Result<()> {
        let store = MemoryStore::new();
        store.set_nx_ex("lock:a", b"token", Duration::from_secs(5)).await?;

        assert!(!store.compare_and_delete("lock:a", "other").await?);
        assert!(store.exists("lock:a").await?);
        assert!(store.compare_and_delete("lock:a", "token").await?);
        assert!(!store.exists("lock:a").await?);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn compare_and_expire_requires_matching_token() -> Result<()> {
        let store = MemoryStore::new();
        store.set_nx_ex("lock:a", b"token", Duration::from_secs(5)).await?;

        assert!(!store.compare_and_expire("lock:a", "other", Duration::from_secs(60)).await?);
        assert_eq!(store.ttl("lock:a").await?, KeyTtl::Expires(Duration::from_secs(5)));
        assert!(store.compare_and_expire("lock:a", "token", Duration::from_secs(60)).await?);
        assert_eq!(store.ttl("lock:a").await?, KeyTtl::Expires(Duration::from_secs(60)));
        Ok(())
    }

    #[tokio::test]
    async fn zrange_by_lex_prefix_is_bounded_by_prefix() -> Result<()> {
        let store = MemoryStore::new();
        store
            .zadd_lex("idx", &keys(&["pa*pasta", "pi*pizza", "piz*pizza", "po*polenta"]))
            .await?;

        assert_eq!(store.zrange_by_lex_prefix("idx", "pi", 10).await?, keys(&["pi*pizza", "piz*pizza"]));
        assert_eq!(store.zrange_by_lex_prefix("idx", "pi", 1).await?, keys(&["pi*pizza"]));
        assert!(store.zrange_by_lex_prefix("missing", "pi", 10).await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn rename_replaces_destination_and_fails_without_source() -> Result<()> {
        let store = MemoryStore::new();
        store.zadd_lex("idx", &keys(&["old"])).await?;
        store.zadd_lex("idx:temp", &keys(&["new"])).await?;

        store.rename("idx:temp", "idx").await?;
        assert_eq!(store.sorted_set("idx"), keys(&["new"]));
        assert!(!store.exists("idx:temp").await?);

        assert!(store.rename("idx:temp", "idx").await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn wrong_type_access_is_an_error() -> Result<()> {
        let store = MemoryStore::new();
        store.sadd("set", &keys(&["a"])).await?;
        assert!(store.get("set").await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn scan_match_filters_keys() -> Result<()> {
        let store = MemoryStore::new();
        for key in ["user:1", "user:2", "order:1"] {
            store.set_ex(key, b"x", Duration::from_secs(60)).await?;
        }

        assert_eq!(store.scan_match("user:*").await?, keys(&["user:1", "user:2"]));
        assert_eq!(store.del(&keys(&["user:1", "user:9"])).await?, 1);
        Ok(())
    }

    #[tokio::test]
    async fn publish_reaches_subscribed_channels_only() -> Result<()> {
        let store = MemoryStore::new();
        let mut subscription = store.subscription().await?;
        subscription.subscribe("invalidation").await?;

        assert_eq!(store.publish("other", "key:a").await?, 0);
        assert_eq!(store.publish("invalidation", "key:b").await?, 1);

        let message = subscription.next_message().await.expect("message should arrive");
        assert_eq!(message.channel(), "invalidation");
        assert_eq!(message.payload_str(), Some("key:b"));
        Ok(())
    }

    #[tokio::test]
    async fn injected_failures_leave_keyspace_untouched() {
        let store = MemoryStore::new();
        store.fail_when(|op| matches!(op, StoreOp::SetEx { key, .. } if key == "forbidden"));

        assert!(store.set_ex("forbidden", b"x", Duration::from_secs(1)).await.is_err());
        assert!(store.set_ex("allowed", b"x", Duration::from_secs(1)).await.is_ok());
        assert_eq!(store.keys(), keys(&["allowed"]));
        assert_eq!(store.operations().len(), 2);

        store.clear_failures();
        assert!(store.set_ex("forbidden", b"x", Duration::from_secs(1)).await.is_ok());
    }

    #[test]
    fn store_op_key() {
        assert_eq!(StoreOp::Get("a".to_owned()).key(), Some("a"));
        assert_eq!(StoreOp::Del(keys(&["b", "c"])).key(), Some("b"));
        assert_eq!(StoreOp::Scan("*".to_owned()).key(), None);
    }
}
