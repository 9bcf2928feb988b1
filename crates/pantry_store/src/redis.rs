// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Redis backend.

use std::{fmt::Debug, time::Duration};

use ::redis::{
    Client, Script,
    aio::{ConnectionManager, PubSub},
    cmd,
};
use futures::StreamExt;

use crate::{KeyTtl, Message, Result, Store, Subscription};

/// Deletes `KEYS[1]` only if it still holds the caller's token.
const COMPARE_AND_DELETE: &str = r#"
if redis.call("get", KEYS[1]) == ARGV[1] then
    return redis.call("del", KEYS[1])
else
    return 0
end
"#;

/// Re-arms the expiry of `KEYS[1]` only if it still holds the caller's token.
const COMPARE_AND_EXPIRE: &str = r#"
if redis.call("get", KEYS[1]) == ARGV[1] then
    return redis.call("expire", KEYS[1], ARGV[2])
else
    return 0
end
"#;

/// Keys requested per `SCAN` round trip.
const SCAN_BATCH: usize = 500;

/// Members sent per `ZADD` round trip when loading a sorted set.
const ZADD_BATCH: usize = 1_000;

/// A [`Store`] backed by Redis.
///
/// All commands share one multiplexed [`ConnectionManager`], which reconnects transparently
/// after connection loss. Cloning a `RedisStore` is cheap and clones share the connection.
/// Pub/sub uses a dedicated connection per [`Subscription`], since a connection in subscriber
/// mode cannot issue regular commands.
///
/// The two ownership checks used by the distributed lock run as Lua scripts so that the
/// comparison and the write happen in a single atomic step on the server.
#[derive(Clone)]
pub struct RedisStore {
    client: Client,
    connection: ConnectionManager,
    compare_and_delete: Script,
    compare_and_expire: Script,
}

impl Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("connection", &self.client.get_connection_info().addr)
            .finish_non_exhaustive()
    }
}

impl RedisStore {
    /// Connects to the Redis server at `url`, for example `redis://localhost:6379/0`.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is malformed or the initial connection fails.
    pub async fn connect(url: &str) -> Result<Self> {
        let client = Client::open(url)?;
        Self::with_client(client).await
    }

    /// Creates a store from an already configured client.
    ///
    /// # Errors
    ///
    /// Returns an error if the initial connection fails.
    pub async fn with_client(client: Client) -> Result<Self> {
        let connection = ConnectionManager::new(client.clone()).await?;
        tracing::debug!(store.addr = %client.get_connection_info().addr, "store.connected");

        Ok(Self {
            client,
            connection,
            compare_and_delete: Script::new(COMPARE_AND_DELETE),
            compare_and_expire: Script::new(COMPARE_AND_EXPIRE),
        })
    }

    /// Verifies that the server is reachable.
    ///
    /// # Errors
    ///
    /// Returns an error if the server does not answer the ping.
    pub async fn ping(&self) -> Result<()> {
        let mut connection = self.connection.clone();
        let _: String = cmd("PING").query_async(&mut connection).await?;
        Ok(())
    }

    fn connection(&self) -> ConnectionManager {
        self.connection.clone()
    }
}

fn seconds(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

impl Store for RedisStore {
    type Subscription = RedisSubscription;

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let value: Option<Vec<u8>> = cmd("GET").arg(key).query_async(&mut self.connection()).await?;
        Ok(value)
    }

    async fn set_ex(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()> {
        let (): () = cmd("SETEX")
            .arg(key)
            .arg(seconds(ttl))
            .arg(value)
            .query_async(&mut self.connection())
            .await?;
        Ok(())
    }

    async fn set_nx_ex(&self, key: &str, value: &[u8], ttl: Duration) -> Result<bool> {
        let reply: Option<String> = cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("EX")
            .arg(seconds(ttl))
            .query_async(&mut self.connection())
            .await?;
        Ok(reply.is_some())
    }

    async fn del(&self, keys: &[String]) -> Result<u64> {
        if keys.is_empty() {
            return Ok(0);
        }
        let deleted: u64 = cmd("DEL").arg(keys).query_async(&mut self.connection()).await?;
        Ok(deleted)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let count: u64 = cmd("EXISTS").arg(key).query_async(&mut self.connection()).await?;
        Ok(count > 0)
    }

    async fn ttl(&self, key: &str) -> Result<KeyTtl> {
        let raw: i64 = cmd("TTL").arg(key).query_async(&mut self.connection()).await?;
        Ok(KeyTtl::from_raw(raw))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let updated: i64 = cmd("EXPIRE")
            .arg(key)
            .arg(seconds(ttl))
            .query_async(&mut self.connection())
            .await?;
        Ok(updated == 1)
    }

    async fn scan_match(&self, pattern: &str) -> Result<Vec<String>> {
        let mut connection = self.connection();
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();

        loop {
            let (next, batch): (u64, Vec<String>) = cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut connection)
                .await?;
            keys.extend(batch);

            if next == 0 {
                break;
            }
            cursor = next;
        }

        // SCAN may return a key more than once across iterations.
        keys.sort_unstable();
        keys.dedup();
        Ok(keys)
    }

    async fn sadd(&self, key: &str, members: &[String]) -> Result<u64> {
        if members.is_empty() {
            return Ok(0);
        }
        let added: u64 = cmd("SADD").arg(key).arg(members).query_async(&mut self.connection()).await?;
        Ok(added)
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>> {
        let members: Vec<String> = cmd("SMEMBERS").arg(key).query_async(&mut self.connection()).await?;
        Ok(members)
    }

    async fn compare_and_delete(&self, key: &str, token: &str) -> Result<bool> {
        let deleted: i64 = self
            .compare_and_delete
            .key(key)
            .arg(token)
            .invoke_async(&mut self.connection())
            .await?;
        Ok(deleted == 1)
    }

    async fn compare_and_expire(&self, key: &str, token: &str, ttl: Duration) -> Result<bool> {
        let updated: i64 = self
            .compare_and_expire
            .key(key)
            .arg(token)
            .arg(seconds(ttl))
            .invoke_async(&mut self.connection())
            .await?;
        Ok(updated == 1)
    }

    async fn zadd_lex(&self, key: &str, members: &[String]) -> Result<u64> {
        let mut connection = self.connection();
        let mut added = 0;

        for chunk in members.chunks(ZADD_BATCH) {
            let mut command = cmd("ZADD");
            command.arg(key);
            for member in chunk {
                command.arg(0).arg(member);
            }
            let count: u64 = command.query_async(&mut connection).await?;
            added += count;
        }

        Ok(added)
    }

    async fn zrange_by_lex_prefix(&self, key: &str, prefix: &str, limit: usize) -> Result<Vec<String>> {
        let mut min = Vec::with_capacity(prefix.len() + 1);
        min.push(b'[');
        min.extend_from_slice(prefix.as_bytes());

        let mut max = min.clone();
        max.push(0xff);

        let members: Vec<String> = cmd("ZRANGEBYLEX")
            .arg(key)
            .arg(min)
            .arg(max)
            .arg("LIMIT")
            .arg(0)
            .arg(limit)
            .query_async(&mut self.connection())
            .await?;
        Ok(members)
    }

    async fn rename(&self, from: &str, to: &str) -> Result<()> {
        let (): () = cmd("RENAME").arg(from).arg(to).query_async(&mut self.connection()).await?;
        Ok(())
    }

    async fn publish(&self, channel: &str, message: &str) -> Result<u64> {
        let receivers: u64 = cmd("PUBLISH").arg(channel).arg(message).query_async(&mut self.connection()).await?;
        Ok(receivers)
    }

    async fn subscription(&self) -> Result<RedisSubscription> {
        let pubsub = self.client.get_async_pubsub().await?;
        Ok(RedisSubscription { pubsub })
    }
}

/// A dedicated Redis pub/sub connection.
pub struct RedisSubscription {
    pubsub: PubSub,
}

impl Debug for RedisSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisSubscription").finish_non_exhaustive()
    }
}

impl Subscription for RedisSubscription {
    async fn subscribe(&mut self, channel: &str) -> Result<()> {
        self.pubsub.subscribe(channel).await?;
        Ok(())
    }

    async fn next_message(&mut self) -> Option<Message> {
        let mut messages = std::pin::pin!(self.pubsub.on_message());
        let message = messages.next().await?;
        Some(Message::new(message.get_channel_name(), message.get_payload_bytes()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seconds_never_rounds_down_to_zero() {
        assert_eq!(seconds(Duration::from_millis(200)), 1);
        assert_eq!(seconds(Duration::from_secs(90)), 90);
    }

    #[test]
    fn scripts_gate_on_token() {
        assert!(COMPARE_AND_DELETE.contains(r#"redis.call("get", KEYS[1]) == ARGV[1]"#));
        assert!(COMPARE_AND_EXPIRE.contains(r#"redis.call("expire", KEYS[1], ARGV[2])"#));
    }
}
