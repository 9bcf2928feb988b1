// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Integration tests for pub/sub invalidation between cache instances.

use std::{sync::Arc, time::Duration};

use pantry::{Codec, EntryOptions, Error, InvalidationCallback, InvalidationMessage, ObjectCache, Pantry, PantryConfig};
use pantry_store::memory::{MemoryStore, StoreOp};
use tokio::sync::mpsc;

type TestResult = Result<(), Error>;

const CHANNEL: &str = "cache_invalidation";

fn hour() -> EntryOptions {
    EntryOptions::new(Duration::from_secs(3600))
}

/// Returns a callback that forwards every received message, and the receiving end.
fn forwarder() -> (InvalidationCallback, mpsc::UnboundedReceiver<String>) {
    let (sender, receiver) = mpsc::unbounded_channel();
    let callback = InvalidationCallback::new(move |text| {
        let _ = sender.send(text.to_owned());
    });
    (callback, receiver)
}

/// Two caches over one store, as two processes sharing one Redis would be.
fn peers() -> (ObjectCache<MemoryStore>, ObjectCache<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    (
        ObjectCache::from_shared(Arc::clone(&store)).with_name("listener"),
        ObjectCache::from_shared(store).with_name("publisher"),
    )
}

#[tokio::test]
async fn key_message_deletes_the_key() -> TestResult {
    let (listener, publisher) = peers();
    let (callback, mut received) = forwarder();
    listener.subscribe_invalidation(CHANNEL, Some(callback)).await?;

    publisher.set("profile:7", &"Grace", &hour()).await?;
    let receivers = publisher
        .publish_invalidation(CHANNEL, InvalidationMessage::Key("profile:7".to_owned()))
        .await?;
    assert_eq!(receivers, 1);

    assert_eq!(received.recv().await.as_deref(), Some("key:profile:7"));
    assert_eq!(publisher.get::<String>("profile:7", Codec::Json).await, None);
    Ok(())
}

#[tokio::test]
async fn tag_message_deletes_members() -> TestResult {
    let (listener, publisher) = peers();
    let (callback, mut received) = forwarder();
    listener.subscribe_invalidation(CHANNEL, Some(callback)).await?;

    publisher.set("a", &1, &hour().with_tag("user:1")).await?;
    publisher.set("b", &2, &hour().with_tag("user:1")).await?;
    publisher.set("c", &3, &hour().with_tag("user:2")).await?;
    publisher.publish_invalidation(CHANNEL, "tag:user:1").await?;

    received.recv().await;
    assert!(!publisher.exists("a").await?);
    assert!(!publisher.exists("b").await?);
    assert!(publisher.exists("c").await?);
    Ok(())
}

#[tokio::test]
async fn pattern_message_deletes_matches() -> TestResult {
    let (listener, publisher) = peers();
    let (callback, mut received) = forwarder();
    listener.subscribe_invalidation(CHANNEL, Some(callback)).await?;

    publisher.set("search:products:pizza", &1, &hour()).await?;
    publisher.set("products:all", &2, &hour()).await?;
    publisher.publish_invalidation(CHANNEL, "pattern:search:*").await?;

    received.recv().await;
    assert!(!publisher.exists("search:products:pizza").await?);
    assert!(publisher.exists("products:all").await?);
    Ok(())
}

#[tokio::test]
async fn malformed_messages_are_ignored_but_forwarded() -> TestResult {
    let (listener, publisher) = peers();
    let (callback, mut received) = forwarder();
    listener.subscribe_invalidation(CHANNEL, Some(callback)).await?;

    publisher.set("flush", &1, &hour()).await?;
    publisher.publish_invalidation(CHANNEL, "flush").await?;
    publisher.publish_invalidation(CHANNEL, "drop:flush").await?;

    assert_eq!(received.recv().await.as_deref(), Some("flush"));
    assert_eq!(received.recv().await.as_deref(), Some("drop:flush"));
    assert!(publisher.exists("flush").await?);
    Ok(())
}

#[tokio::test]
async fn one_listener_serves_every_channel() -> TestResult {
    let (listener, publisher) = peers();
    let (callback, mut received) = forwarder();
    listener.subscribe_invalidation("catalog", Some(callback)).await?;
    listener.subscribe_invalidation("sessions", None).await?;

    publisher.set("session:1", &1, &hour()).await?;
    publisher.publish_invalidation("sessions", "key:session:1").await?;

    assert_eq!(received.recv().await.as_deref(), Some("key:session:1"));
    assert!(!publisher.exists("session:1").await?);

    let subscriptions = listener
        .store()
        .operations()
        .into_iter()
        .filter(|op| matches!(op, StoreOp::Subscribe(_)))
        .count();
    assert_eq!(subscriptions, 2);
    Ok(())
}

#[tokio::test]
async fn close_stops_listening() -> TestResult {
    let (listener, publisher) = peers();
    listener.subscribe_invalidation(CHANNEL, None).await?;
    assert_eq!(publisher.publish_invalidation(CHANNEL, "key:a").await?, 1);

    listener.close().await;

    assert_eq!(publisher.publish_invalidation(CHANNEL, "key:a").await?, 0);
    Ok(())
}

#[tokio::test]
async fn pantry_uses_the_configured_channel() -> TestResult {
    let store = Arc::new(MemoryStore::new());
    let config = PantryConfig {
        invalidation_channel: "storefront".to_owned(),
        ..PantryConfig::default()
    };
    let listening = Pantry::from_shared(Arc::clone(&store), config.clone());
    let publishing = Pantry::from_shared(store, config);

    let (callback, mut received) = forwarder();
    listening.listen(Some(callback)).await?;

    publishing.cache().set("cart:42", &vec![1, 2], &publishing.entry_options()).await?;
    let receivers = publishing
        .invalidate(&InvalidationMessage::Key(pantry::cart_key(42)))
        .await?;
    assert_eq!(receivers, 1);

    assert_eq!(received.recv().await.as_deref(), Some("key:cart:42"));
    assert!(!publishing.cache().exists("cart:42").await?);

    listening.close().await;
    Ok(())
}

#[tokio::test]
async fn async_callbacks_are_awaited_in_order() -> TestResult {
    let (listener, publisher) = peers();
    let (sender, mut received) = mpsc::unbounded_channel();
    let callback = InvalidationCallback::new_async(move |text| {
        let sender = sender.clone();
        async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            let _ = sender.send(text);
        }
    });
    listener.subscribe_invalidation(CHANNEL, Some(callback)).await?;

    publisher.set("a", &1, &hour()).await?;
    publisher.publish_invalidation(CHANNEL, "key:a").await?;
    publisher.publish_invalidation(CHANNEL, "key:b").await?;

    assert_eq!(received.recv().await.as_deref(), Some("key:a"));
    assert_eq!(received.recv().await.as_deref(), Some("key:b"));
    assert!(!publisher.exists("a").await?);
    Ok(())
}
