// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Cross-process invalidation over pub/sub.

use std::{fmt, sync::Arc};

use futures::future::BoxFuture;
use pantry_store::{Store, Subscription};
use parking_lot::RwLock;
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};

use crate::cache::{delete_key, invalidate_pattern, invalidate_tag};

/// A request to drop cached entries, as carried on an invalidation channel.
///
/// On the wire a message is UTF-8 text of the form `key:<key>`, `pattern:<glob>` or
/// `tag:<tag>`. Only the first colon separates the kind from its argument, so the argument may
/// itself contain colons.
///
/// # Examples
///
/// ```
/// use pantry::InvalidationMessage;
///
/// let message = InvalidationMessage::parse("tag:user:123").unwrap();
/// assert_eq!(message, InvalidationMessage::Tag("user:123".to_owned()));
/// assert_eq!(message.to_string(), "tag:user:123");
///
/// assert_eq!(InvalidationMessage::parse("flush"), None);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum InvalidationMessage {
    /// Delete a single key.
    Key(String),
    /// Delete every key matching a glob pattern.
    Pattern(String),
    /// Delete every key registered under a tag.
    Tag(String),
}

impl InvalidationMessage {
    /// Parses a wire message, returning `None` for anything malformed.
    #[must_use]
    pub fn parse(text: &str) -> Option<Self> {
        let (kind, argument) = text.split_once(':')?;
        let argument = argument.to_owned();

        match kind {
            "key" => Some(Self::Key(argument)),
            "pattern" => Some(Self::Pattern(argument)),
            "tag" => Some(Self::Tag(argument)),
            _ => None,
        }
    }
}

impl fmt::Display for InvalidationMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Key(key) => write!(f, "key:{key}"),
            Self::Pattern(pattern) => write!(f, "pattern:{pattern}"),
            Self::Tag(tag) => write!(f, "tag:{tag}"),
        }
    }
}

/// Callback invoked with the raw text of every message the listener receives.
///
/// Callbacks run on the listener task after the message has been applied, one at a time and in
/// registration order. An asynchronous callback is awaited before the next message is read.
///
/// # Examples
///
/// ```
/// use pantry::InvalidationCallback;
///
/// let logged = InvalidationCallback::new(|text| println!("invalidated {text}"));
/// let forwarded = InvalidationCallback::new_async(|text| async move {
///     println!("forwarding {text}");
/// });
/// ```
#[derive(Clone)]
pub struct InvalidationCallback(CallbackKind);

#[derive(Clone)]
enum CallbackKind {
    Sync(Arc<dyn Fn(&str) + Send + Sync>),
    Async(Arc<dyn Fn(String) -> BoxFuture<'static, ()> + Send + Sync>),
}

impl InvalidationCallback {
    /// Wraps a function that handles each message synchronously.
    #[must_use]
    pub fn new<F>(callback: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        Self(CallbackKind::Sync(Arc::new(callback)))
    }

    /// Wraps an async function; the listener awaits the returned future.
    #[must_use]
    pub fn new_async<F, Fut>(callback: F) -> Self
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let boxed = move |text: String| -> BoxFuture<'static, ()> { Box::pin(callback(text)) };
        Self(CallbackKind::Async(Arc::new(boxed)))
    }

    async fn call(&self, text: &str) {
        match &self.0 {
            CallbackKind::Sync(callback) => callback(text),
            CallbackKind::Async(callback) => callback(text.to_owned()).await,
        }
    }
}

impl fmt::Debug for InvalidationCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.0 {
            CallbackKind::Sync(_) => "sync",
            CallbackKind::Async(_) => "async",
        };
        f.debug_tuple("InvalidationCallback").field(&kind).finish()
    }
}

pub(crate) type Callbacks = Arc<RwLock<Vec<InvalidationCallback>>>;

struct SubscribeRequest {
    channel: String,
    done: oneshot::Sender<pantry_store::Result<()>>,
}

/// Handle to the background task that owns a cache's pub/sub connection.
#[derive(Debug)]
pub(crate) struct Listener {
    requests: mpsc::UnboundedSender<SubscribeRequest>,
    task: JoinHandle<()>,
}

impl fmt::Debug for SubscribeRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscribeRequest").field("channel", &self.channel).finish_non_exhaustive()
    }
}

impl Listener {
    /// Opens a subscription and starts the listener task.
    pub async fn start<S: Store>(store: Arc<S>, callbacks: Callbacks) -> pantry_store::Result<Self> {
        let subscription = store.subscription().await?;
        let (requests, receiver) = mpsc::unbounded_channel();
        let task = tokio::spawn(listen(store, subscription, receiver, callbacks));

        Ok(Self { requests, task })
    }

    /// Returns `false` once the task has stopped, for example after the connection closed.
    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    /// Asks the listener task to add `channel` to its subscription.
    pub async fn subscribe(&self, channel: &str) -> pantry_store::Result<()> {
        let (done, result) = oneshot::channel();
        let request = SubscribeRequest {
            channel: channel.to_owned(),
            done,
        };

        if self.requests.send(request).is_err() {
            return Err(pantry_store::Error::from_message("invalidation listener has stopped"));
        }
        result
            .await
            .unwrap_or_else(|_| Err(pantry_store::Error::from_message("invalidation listener has stopped")))
    }

    /// Cancels the task and waits for it to finish.
    pub async fn stop(self) {
        self.task.abort();
        // The only expected error is the cancellation itself.
        if let Err(e) = self.task.await
            && e.is_panic()
        {
            tracing::error!(error = %e, "invalidation.listener_panicked");
        }
    }

    pub fn abort(&self) {
        self.task.abort();
    }
}

async fn listen<S: Store>(
    store: Arc<S>,
    mut subscription: S::Subscription,
    mut requests: mpsc::UnboundedReceiver<SubscribeRequest>,
    callbacks: Callbacks,
) {
    loop {
        tokio::select! {
            request = requests.recv() => {
                let Some(SubscribeRequest { channel, done }) = request else {
                    break;
                };
                let result = subscription.subscribe(&channel).await;
                if result.is_ok() {
                    tracing::info!(invalidation.channel = %channel, "invalidation.subscribed");
                }
                // The subscriber may have given up waiting.
                let _ = done.send(result);
            }
            message = subscription.next_message() => {
                let Some(message) = message else {
                    tracing::warn!("invalidation.connection_closed");
                    break;
                };
                let Some(text) = message.payload_str() else {
                    tracing::debug!(invalidation.channel = message.channel(), "invalidation.ignored_binary");
                    continue;
                };

                apply(store.as_ref(), text).await;

                let snapshot: Vec<_> = callbacks.read().clone();
                for callback in &snapshot {
                    callback.call(text).await;
                }
            }
        }
    }
}

/// Applies one wire message to the store, logging rather than returning failures.
pub(crate) async fn apply<S: Store>(store: &S, text: &str) {
    let Some(message) = InvalidationMessage::parse(text) else {
        tracing::debug!(invalidation.message = text, "invalidation.malformed");
        return;
    };

    let result = match &message {
        InvalidationMessage::Key(key) => delete_key(store, key).await,
        InvalidationMessage::Pattern(pattern) => invalidate_pattern(store, pattern).await,
        InvalidationMessage::Tag(tag) => invalidate_tag(store, tag).await,
    };

    match result {
        Ok(count) => tracing::debug!(invalidation.message = %message, invalidation.count = count, "invalidation.applied"),
        Err(e) => tracing::warn!(invalidation.message = %message, error = %e, "invalidation.failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_each_kind() {
        assert_eq!(InvalidationMessage::parse("key:a"), Some(InvalidationMessage::Key("a".to_owned())));
        assert_eq!(
            InvalidationMessage::parse("pattern:user:*"),
            Some(InvalidationMessage::Pattern("user:*".to_owned()))
        );
        assert_eq!(InvalidationMessage::parse("tag:catalog"), Some(InvalidationMessage::Tag("catalog".to_owned())));
    }

    #[test]
    fn rejects_malformed_text() {
        assert_eq!(InvalidationMessage::parse("flush"), None);
        assert_eq!(InvalidationMessage::parse("drop:key"), None);
        assert_eq!(InvalidationMessage::parse(""), None);
    }

    #[test]
    fn empty_argument_is_kept() {
        assert_eq!(InvalidationMessage::parse("key:"), Some(InvalidationMessage::Key(String::new())));
    }

    #[test]
    fn display_matches_wire_format() {
        for text in ["key:a:b", "pattern:search:*", "tag:search:query:pizza"] {
            assert_eq!(InvalidationMessage::parse(text).unwrap().to_string(), text);
        }
    }
}
