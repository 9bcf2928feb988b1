// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The capability interface every store backend implements.

use std::time::Duration;

use crate::Result;

/// Remaining lifetime of a key as reported by the store.
///
/// Stores traditionally encode this as an integer where `-2` means the key does not exist,
/// `-1` means it exists without expiry and any other value is the remaining number of seconds.
/// [`KeyTtl::from_raw`] and [`KeyTtl::as_raw`] convert to and from that encoding.
///
/// # Examples
///
/// ```
/// use pantry_store::KeyTtl;
/// use std::time::Duration;
///
/// assert_eq!(KeyTtl::from_raw(-2), KeyTtl::Missing);
/// assert_eq!(KeyTtl::from_raw(-1), KeyTtl::Persistent);
/// assert_eq!(KeyTtl::from_raw(30), KeyTtl::Expires(Duration::from_secs(30)));
/// assert_eq!(KeyTtl::Expires(Duration::from_secs(30)).as_raw(), 30);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyTtl {
    /// The key does not exist.
    Missing,
    /// The key exists and never expires.
    Persistent,
    /// The key exists and expires after the given duration.
    Expires(Duration),
}

impl KeyTtl {
    /// Decodes the integer representation used on the wire.
    #[must_use]
    pub fn from_raw(raw: i64) -> Self {
        match raw {
            -1 => Self::Persistent,
            raw if raw < 0 => Self::Missing,
            secs => Self::Expires(Duration::from_secs(secs.unsigned_abs())),
        }
    }

    /// Encodes this value using the integer representation used on the wire.
    #[must_use]
    pub fn as_raw(self) -> i64 {
        match self {
            Self::Missing => -2,
            Self::Persistent => -1,
            Self::Expires(remaining) => i64::try_from(remaining.as_secs()).unwrap_or(i64::MAX),
        }
    }

    /// Returns `true` if the key exists.
    #[must_use]
    pub fn exists(self) -> bool {
        !matches!(self, Self::Missing)
    }

    /// Returns `true` if the key outlives `ttl`, treating keys without expiry as immortal.
    #[must_use]
    pub fn covers(self, ttl: Duration) -> bool {
        match self {
            Self::Missing => false,
            Self::Persistent => true,
            Self::Expires(remaining) => remaining >= ttl,
        }
    }
}

/// A message received on a subscribed channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    channel: String,
    payload: Vec<u8>,
}

impl Message {
    /// Creates a message for `channel` carrying `payload`.
    pub fn new(channel: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            channel: channel.into(),
            payload: payload.into(),
        }
    }

    /// Returns the channel the message was published on.
    #[must_use]
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Returns the raw payload.
    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Returns the payload as text, or `None` if it is not valid UTF-8.
    #[must_use]
    pub fn payload_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }
}

/// A dedicated pub/sub connection.
///
/// A subscription is driven by a single owner: channels are added with
/// [`subscribe`](Self::subscribe) and messages for all of them arrive through
/// [`next_message`](Self::next_message). `next_message` must be cancel safe so that it can be
/// raced against other events without losing messages.
pub trait Subscription: Send + 'static {
    /// Starts receiving messages published on `channel`.
    fn subscribe(&mut self, channel: &str) -> impl Future<Output = Result<()>> + Send;

    /// Waits for the next message on any subscribed channel.
    ///
    /// Returns `None` once the connection is closed and no further messages will arrive.
    fn next_message(&mut self) -> impl Future<Output = Option<Message>> + Send;
}

/// Capability interface over a networked key-value store.
///
/// Implementations must be safe to share between tasks; all operations take `&self`. Each
/// operation is a single round trip and is atomic on its own, but no atomicity is implied
/// across separate calls.
///
/// Keys and set members are UTF-8 strings; string values are arbitrary bytes.
pub trait Store: Send + Sync + 'static {
    /// The pub/sub connection type produced by [`subscription`](Self::subscription).
    type Subscription: Subscription;

    /// Returns the value stored at `key`, or `None` if it does not exist.
    fn get(&self, key: &str) -> impl Future<Output = Result<Option<Vec<u8>>>> + Send;

    /// Stores `value` at `key`, replacing any previous value and expiring it after `ttl`.
    fn set_ex(&self, key: &str, value: &[u8], ttl: Duration) -> impl Future<Output = Result<()>> + Send;

    /// Stores `value` at `key` only if the key does not exist, expiring it after `ttl`.
    ///
    /// Returns `true` if the value was written.
    fn set_nx_ex(&self, key: &str, value: &[u8], ttl: Duration) -> impl Future<Output = Result<bool>> + Send;

    /// Deletes the given keys and returns how many of them existed.
    fn del(&self, keys: &[String]) -> impl Future<Output = Result<u64>> + Send;

    /// Returns `true` if `key` exists.
    fn exists(&self, key: &str) -> impl Future<Output = Result<bool>> + Send;

    /// Returns the remaining lifetime of `key`.
    fn ttl(&self, key: &str) -> impl Future<Output = Result<KeyTtl>> + Send;

    /// Sets the lifetime of an existing key. Returns `false` if the key does not exist.
    fn expire(&self, key: &str, ttl: Duration) -> impl Future<Output = Result<bool>> + Send;

    /// Returns every key matching the glob `pattern`.
    ///
    /// Implementations enumerate the keyspace incrementally with a cursor so the server is
    /// never blocked by a full keyspace walk. Keys created or deleted during the scan may or
    /// may not be reported.
    fn scan_match(&self, pattern: &str) -> impl Future<Output = Result<Vec<String>>> + Send;

    /// Adds `members` to the set at `key` and returns how many were newly added.
    fn sadd(&self, key: &str, members: &[String]) -> impl Future<Output = Result<u64>> + Send;

    /// Returns all members of the set at `key`.
    fn smembers(&self, key: &str) -> impl Future<Output = Result<Vec<String>>> + Send;

    /// Atomically deletes `key` if its value equals `token`.
    ///
    /// Returns `true` if the key was deleted.
    fn compare_and_delete(&self, key: &str, token: &str) -> impl Future<Output = Result<bool>> + Send;

    /// Atomically sets the lifetime of `key` to `ttl` if its value equals `token`.
    ///
    /// Returns `true` if the lifetime was updated.
    fn compare_and_expire(&self, key: &str, token: &str, ttl: Duration) -> impl Future<Output = Result<bool>> + Send;

    /// Adds `members` with a score of zero to the sorted set at `key`.
    ///
    /// With uniform scores, sorted set members are ordered purely lexicographically by their
    /// bytes. Returns how many members were newly added.
    fn zadd_lex(&self, key: &str, members: &[String]) -> impl Future<Output = Result<u64>> + Send;

    /// Returns up to `limit` members of the sorted set at `key` that start with `prefix`, in
    /// lexicographic order.
    ///
    /// This is a lexicographic range scan over `[prefix, prefix + 0xFF]`; since `0xFF` never
    /// occurs in UTF-8 text, the range contains exactly the members beginning with `prefix`.
    fn zrange_by_lex_prefix(&self, key: &str, prefix: &str, limit: usize) -> impl Future<Output = Result<Vec<String>>> + Send;

    /// Atomically renames `from` to `to`, replacing any existing value at `to`.
    ///
    /// Fails if `from` does not exist.
    fn rename(&self, from: &str, to: &str) -> impl Future<Output = Result<()>> + Send;

    /// Publishes `message` on `channel` and returns the number of receiving subscribers.
    fn publish(&self, channel: &str, message: &str) -> impl Future<Output = Result<u64>> + Send;

    /// Opens a new pub/sub connection with no channels subscribed.
    fn subscription(&self) -> impl Future<Output = Result<Self::Subscription>> + Send;
}
