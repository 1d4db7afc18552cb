//! # Notification Channel
//!
//! Purpose: Publish raw messages and dispatch messages from channel and
//! glob-pattern subscriptions to registered handlers.
//!
//! ## Design Principles
//! 1. **Raw Payloads**: Messages bypass the serializer; handlers receive the
//!    channel name and the payload bytes exactly as published.
//! 2. **Dedicated Subscriber**: Subscriptions live on their own connection,
//!    opened on first use, so subscribed mode never blocks cache traffic.
//! 3. **Dispatch Off-Caller**: A background task drains published messages
//!    and invokes handlers; the handler table is read at delivery time, so
//!    an unsubscribed handler never fires again.
//! 4. **Self-Healing**: When the subscriber connection has to be reopened,
//!    every registered channel and pattern is subscribed again.
//! 5. **Ordered Changes**: Subscribing and unsubscribing hold one async lock
//!    from the handler-table update until the store confirms, so the table
//!    and the store's subscriptions change in the same order.
//!
//! ## Structure Overview
//!
//! ```text
//! PubSubStream ──Published──▶ dispatch task ──▶ handlers[Channel(c)]
//!                                   │
//!                                   └─────────▶ handlers[Pattern(p)]
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use redis::aio::PubSubSink;
use redis::{Msg, RedisResult};
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tracing::{debug, warn};

use crate::connection::{is_unavailable, ConnectionManager};
use crate::error::CacheResult;

/// A message received on the subscriber connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Published {
    pub(crate) channel: String,
    /// Pattern that matched, for pattern subscriptions.
    pub(crate) pattern: Option<String>,
    pub(crate) payload: Vec<u8>,
}

impl From<&Msg> for Published {
    fn from(message: &Msg) -> Self {
        let pattern = if message.from_pattern() {
            message.get_pattern::<String>().ok()
        } else {
            None
        };
        Published {
            channel: message.get_channel_name().to_string(),
            pattern,
            payload: message.get_payload_bytes().to_vec(),
        }
    }
}

/// Callback receiving `(channel, payload)`.
pub type Handler = Arc<dyn Fn(&str, &[u8]) + Send + Sync>;

/// Key under which handlers are registered.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Subscription {
    /// Exact channel name.
    Channel(String),
    /// Glob pattern (`*`, `?`, `[...]`) matched by the store.
    Pattern(String),
}

impl Subscription {
    async fn send(&self, sink: &mut PubSubSink) -> RedisResult<()> {
        match self {
            Subscription::Channel(channel) => sink.subscribe(channel.as_str()).await,
            Subscription::Pattern(pattern) => sink.psubscribe(pattern.as_str()).await,
        }
    }

    async fn cancel(&self, sink: &mut PubSubSink) -> RedisResult<()> {
        match self {
            Subscription::Channel(channel) => sink.unsubscribe(channel.as_str()).await,
            Subscription::Pattern(pattern) => sink.punsubscribe(pattern.as_str()).await,
        }
    }
}

struct Inner {
    manager: Arc<ConnectionManager>,
    handlers: RwLock<HashMap<Subscription, Vec<Handler>>>,
    forward: Mutex<Option<mpsc::UnboundedSender<Published>>>,
    changes: AsyncMutex<()>,
}

impl Inner {
    fn deliver(&self, message: &Published) {
        let key = match &message.pattern {
            Some(pattern) => Subscription::Pattern(pattern.clone()),
            None => Subscription::Channel(message.channel.clone()),
        };
        // Handlers run outside the lock so they may (un)subscribe.
        let handlers = match self.handlers.read().get(&key) {
            Some(handlers) => handlers.clone(),
            None => return,
        };
        debug!(channel = %message.channel, handlers = handlers.len(), "dispatching message");
        for handler in handlers {
            handler(message.channel.as_str(), message.payload.as_slice());
        }
    }
}

/// Publish/subscribe front end sharing a provider's connection manager.
#[derive(Clone)]
pub struct NotificationChannel {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for NotificationChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationChannel")
            .field("subscriptions", &self.inner.handlers.read().len())
            .finish()
    }
}

impl NotificationChannel {
    pub(crate) fn new(manager: Arc<ConnectionManager>) -> Self {
        NotificationChannel {
            inner: Arc::new(Inner {
                manager,
                handlers: RwLock::new(HashMap::new()),
                forward: Mutex::new(None),
                changes: AsyncMutex::new(()),
            }),
        }
    }

    /// Invokes `handler` for every message published to `channel` from now on.
    ///
    /// Returns `false`, registering nothing, when the store is unavailable.
    pub async fn subscribe<F>(&self, channel: &str, handler: F) -> CacheResult<bool>
    where
        F: Fn(&str, &[u8]) + Send + Sync + 'static,
    {
        self.register(Subscription::Channel(channel.to_string()), Arc::new(handler))
            .await
    }

    /// Invokes `handler` for every message published to a channel matching
    /// the glob `pattern` from now on.
    pub async fn subscribe_pattern<F>(&self, pattern: &str, handler: F) -> CacheResult<bool>
    where
        F: Fn(&str, &[u8]) + Send + Sync + 'static,
    {
        self.register(Subscription::Pattern(pattern.to_string()), Arc::new(handler))
            .await
    }

    /// Removes every handler registered for `name`, as a channel and as a
    /// pattern.
    pub async fn unsubscribe(&self, name: &str) -> CacheResult<()> {
        let _changes = self.inner.changes.lock().await;
        let removed: Vec<Subscription> = {
            let mut handlers = self.inner.handlers.write();
            [
                Subscription::Channel(name.to_string()),
                Subscription::Pattern(name.to_string()),
            ]
            .into_iter()
            .filter(|key| handlers.remove(key).is_some())
            .collect()
        };

        if removed.is_empty() {
            return Ok(());
        }
        let Some(mut sink) = self.inner.manager.current_subscriber() else {
            return Ok(());
        };
        for key in removed {
            match key.cancel(&mut sink).await {
                Ok(()) => {}
                // The store drops a lost connection's subscriptions itself.
                Err(err) if is_unavailable(&err) => return Ok(()),
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }

    /// Publishes `message` to `channel`, returning how many subscriptions
    /// received it; `0` when the store is unavailable.
    pub async fn publish(&self, channel: &str, message: &[u8]) -> CacheResult<u64> {
        let mut command = redis::cmd("PUBLISH");
        command.arg(channel).arg(message);
        self.inner.manager.run(&command, 0).await
    }

    /// Number of channels and patterns with at least one handler.
    pub fn subscription_count(&self) -> usize {
        self.inner.handlers.read().len()
    }

    async fn register(&self, key: Subscription, handler: Handler) -> CacheResult<bool> {
        if self.inner.manager.is_closed() {
            return Ok(false);
        }
        let _changes = self.inner.changes.lock().await;
        let forward = self.forward();
        let Some((mut sink, fresh)) = self.inner.manager.ensure_subscriber(&forward).await else {
            return Ok(false);
        };

        let first = {
            let mut handlers = self.inner.handlers.write();
            let registered = handlers.entry(key.clone()).or_default();
            registered.push(Arc::clone(&handler));
            registered.len() == 1
        };

        let sent = if fresh {
            self.resubscribe_all(&mut sink).await
        } else if first {
            key.send(&mut sink).await
        } else {
            Ok(())
        };

        match sent {
            Ok(()) => Ok(true),
            Err(err) => {
                self.forget(&key, &handler);
                if is_unavailable(&err) {
                    Ok(false)
                } else {
                    Err(err.into())
                }
            }
        }
    }

    async fn resubscribe_all(&self, sink: &mut PubSubSink) -> RedisResult<()> {
        let keys: Vec<Subscription> = self.inner.handlers.read().keys().cloned().collect();
        if keys.len() > 1 {
            debug!(subscriptions = keys.len(), "restoring subscriptions");
        }
        for key in &keys {
            if let Err(err) = key.send(sink).await {
                warn!(subscription = ?key, error = %err, "failed to restore subscription");
                return Err(err);
            }
        }
        Ok(())
    }

    fn forget(&self, key: &Subscription, handler: &Handler) {
        let mut handlers = self.inner.handlers.write();
        if let Some(registered) = handlers.get_mut(key) {
            registered.retain(|existing| !Arc::ptr_eq(existing, handler));
            if registered.is_empty() {
                handlers.remove(key);
            }
        }
    }

    /// Sender handed to the subscriber connection; spawns the dispatcher on
    /// first use.
    fn forward(&self) -> mpsc::UnboundedSender<Published> {
        let mut forward = self.inner.forward.lock();
        if let Some(sender) = forward.as_ref() {
            return sender.clone();
        }
        let (sender, messages) = mpsc::unbounded_channel();
        tokio::spawn(dispatch(Arc::downgrade(&self.inner), messages));
        *forward = Some(sender.clone());
        sender
    }

    /// Drops every handler and the dispatcher's sender.
    pub(crate) fn shutdown(&self) {
        self.inner.forward.lock().take();
        self.inner.handlers.write().clear();
    }
}

async fn dispatch(inner: Weak<Inner>, mut messages: mpsc::UnboundedReceiver<Published>) {
    while let Some(message) = messages.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        inner.deliver(&message);
    }
    debug!("notification dispatcher stopped");
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use cachet_common::StoreConfig;

    use super::*;

    fn channel() -> NotificationChannel {
        NotificationChannel::new(Arc::new(ConnectionManager::new(StoreConfig::default())))
    }

    fn counting(counter: &Arc<AtomicUsize>) -> Handler {
        let counter = Arc::clone(counter);
        Arc::new(move |_: &str, _: &[u8]| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    fn message(channel: &str, pattern: Option<&str>) -> Published {
        Published {
            channel: channel.to_string(),
            pattern: pattern.map(str::to_string),
            payload: b"payload".to_vec(),
        }
    }

    #[test]
    fn routes_by_channel_or_pattern() {
        let notifications = channel();
        let exact = Arc::new(AtomicUsize::new(0));
        let glob = Arc::new(AtomicUsize::new(0));
        {
            let mut handlers = notifications.inner.handlers.write();
            handlers
                .entry(Subscription::Channel("news".into()))
                .or_default()
                .push(counting(&exact));
            handlers
                .entry(Subscription::Pattern("n*".into()))
                .or_default()
                .push(counting(&glob));
        }

        notifications.inner.deliver(&message("news", None));
        notifications.inner.deliver(&message("news", Some("n*")));
        notifications.inner.deliver(&message("other", None));

        assert_eq!(exact.load(Ordering::SeqCst), 1);
        assert_eq!(glob.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn handler_receives_channel_and_payload() {
        let notifications = channel();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        notifications
            .inner
            .handlers
            .write()
            .entry(Subscription::Pattern("a.?".into()))
            .or_default()
            .push(Arc::new(move |channel: &str, payload: &[u8]| {
                sink.lock().push((channel.to_string(), payload.to_vec()));
            }));

        notifications.inner.deliver(&message("a.b", Some("a.?")));
        assert_eq!(*seen.lock(), vec![("a.b".to_string(), b"payload".to_vec())]);
    }

    #[tokio::test]
    async fn unsubscribe_drops_channel_and_pattern_handlers() {
        let notifications = channel();
        let counter = Arc::new(AtomicUsize::new(0));
        {
            let mut handlers = notifications.inner.handlers.write();
            handlers
                .entry(Subscription::Channel("x".into()))
                .or_default()
                .push(counting(&counter));
            handlers
                .entry(Subscription::Pattern("x".into()))
                .or_default()
                .push(counting(&counter));
        }
        assert_eq!(notifications.subscription_count(), 2);

        notifications.unsubscribe("x").await.unwrap();
        assert_eq!(notifications.subscription_count(), 0);
        notifications.inner.deliver(&message("x", None));
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn forget_removes_only_the_given_handler() {
        let notifications = channel();
        let counter = Arc::new(AtomicUsize::new(0));
        let first = counting(&counter);
        let second = counting(&counter);
        let key = Subscription::Channel("c".into());
        {
            let mut handlers = notifications.inner.handlers.write();
            let registered = handlers.entry(key.clone()).or_default();
            registered.push(Arc::clone(&first));
            registered.push(Arc::clone(&second));
        }

        notifications.forget(&key, &first);
        notifications.inner.deliver(&message("c", None));
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        notifications.forget(&key, &second);
        assert_eq!(notifications.subscription_count(), 0);
    }
}
