//! In-process publish/subscribe fabric between the orchestrator and workers.
//!
//! Every subscription owns a FIFO inbox (an unbounded mpsc queue) drained by
//! a dedicated consumer task that invokes the handler, so ordering is FIFO
//! per (channel, subscription) and a misbehaving handler only ever takes its
//! own task down. Membership state sits behind a mutex held only around
//! membership mutations; publishing enqueues under that lock but never waits
//! on a handler.

pub mod channel;
pub mod message;

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use self::channel::ChannelManager;
use self::message::{Message, MessagePriority, MessageType};

/// Boxed future returned by message handlers.
pub type HandlerFuture = BoxFuture<'static, ()>;

/// A subscription handler. Invoked at most once per delivered message.
pub type MessageHandler = Arc<dyn Fn(Message) -> HandlerFuture + Send + Sync>;

/// Wrap an async closure as a [`MessageHandler`].
pub fn handler<F, Fut>(f: F) -> MessageHandler
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    Arc::new(move |msg| Box::pin(f(msg)))
}

/// Identifier handed back from `subscribe`; the only thing a subscriber
/// holds. The broker is the sole owner of subscription state.
pub type SubscriptionId = Uuid;

/// Configuration for the broker.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Bounded message history size; oldest entries are evicted.
    pub history_size: usize,
    /// Default timeout for `request_response` callers that use it.
    pub request_timeout: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            history_size: 1000,
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// Aggregate broker statistics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerStats {
    pub subscriptions: usize,
    pub channels: usize,
    pub history_len: usize,
    pub total_delivered: u64,
}

struct SubscriptionEntry {
    channel: String,
    tx: mpsc::UnboundedSender<Message>,
}

#[derive(Default)]
struct BrokerInner {
    subscriptions: HashMap<SubscriptionId, SubscriptionEntry>,
    by_channel: HashMap<String, Vec<SubscriptionId>>,
    history: VecDeque<Message>,
}

/// The message broker.
pub struct Broker {
    inner: Mutex<BrokerInner>,
    channels: Mutex<ChannelManager>,
    config: BrokerConfig,
    delivered: AtomicU64,
    cancel: CancellationToken,
}

impl Default for Broker {
    fn default() -> Self {
        Self::new(BrokerConfig::default())
    }
}

impl Broker {
    pub fn new(config: BrokerConfig) -> Self {
        Self {
            inner: Mutex::new(BrokerInner::default()),
            channels: Mutex::new(ChannelManager::new()),
            config,
            delivered: AtomicU64::new(0),
            cancel: CancellationToken::new(),
        }
    }

    /// Default timeout for request/response exchanges.
    pub fn default_request_timeout(&self) -> Duration {
        self.config.request_timeout
    }

    /// Publish a message to its channel. Expired messages are dropped.
    ///
    /// Returns the number of subscription inboxes the message reached. The
    /// fan-out is atomic from the sender's point of view: the subscriber set
    /// is resolved and enqueued under the membership lock.
    pub fn publish(&self, message: Message) -> usize {
        if message.is_expired() {
            tracing::debug!(message_id = %message.id, "dropping expired message");
            return 0;
        }

        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());

        inner.history.push_back(message.clone());
        while inner.history.len() > self.config.history_size {
            inner.history.pop_front();
        }

        {
            let mut channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
            channels.record_message(&message.channel);
        }

        let Some(sub_ids) = inner.by_channel.get(&message.channel) else {
            return 0;
        };

        let mut delivered = 0usize;
        for sub_id in sub_ids {
            if let Some(entry) = inner.subscriptions.get(sub_id) {
                if entry.tx.send(message.clone()).is_ok() {
                    delivered += 1;
                }
            }
        }
        self.delivered.fetch_add(delivered as u64, Ordering::Relaxed);

        tracing::trace!(
            message_id = %message.id,
            channel = %message.channel,
            delivered,
            "message published"
        );
        delivered
    }

    /// Subscribe a handler to a channel.
    ///
    /// The handler runs on a dedicated consumer task and is invoked at most
    /// once per delivered message, in publish order for this subscription.
    pub fn subscribe(&self, channel_name: &str, handler: MessageHandler) -> SubscriptionId {
        let sub_id = Uuid::new_v4();
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

        {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            inner.subscriptions.insert(
                sub_id,
                SubscriptionEntry {
                    channel: channel_name.to_string(),
                    tx,
                },
            );
            inner
                .by_channel
                .entry(channel_name.to_string())
                .or_default()
                .push(sub_id);
        }
        {
            let mut channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
            channels.add_subscriber(channel_name, &sub_id.to_string());
        }

        let cancel = self.cancel.clone();
        let channel = channel_name.to_string();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    next = rx.recv() => match next {
                        Some(msg) => handler(msg).await,
                        None => break,
                    },
                }
            }
            tracing::trace!(%sub_id, channel, "subscription consumer stopped");
        });

        tracing::debug!(%sub_id, channel = channel_name, "subscribed");
        sub_id
    }

    /// Remove a subscription. Dropping the inbox sender ends the consumer
    /// task once the queue drains. Returns false for an unknown id.
    pub fn unsubscribe(&self, sub_id: SubscriptionId) -> bool {
        let channel = {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            let Some(entry) = inner.subscriptions.remove(&sub_id) else {
                return false;
            };
            let channel = entry.channel;
            if let Some(ids) = inner.by_channel.get_mut(&channel) {
                ids.retain(|id| *id != sub_id);
                if ids.is_empty() {
                    inner.by_channel.remove(&channel);
                }
            }
            channel
        };
        {
            let mut channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
            channels.remove_subscriber(&channel, &sub_id.to_string());
        }
        tracing::debug!(%sub_id, channel, "unsubscribed");
        true
    }

    /// Number of live subscriptions on a channel.
    pub fn subscriber_count(&self, channel_name: &str) -> usize {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.by_channel.get(channel_name).map_or(0, |v| v.len())
    }

    /// Send a message directly to an agent's inbox channel.
    pub fn send_direct(&self, recipient_id: &str, mut message: Message) -> usize {
        message.recipient_id = Some(recipient_id.to_string());
        message.channel = channel::agent_channel(recipient_id);
        self.publish(message)
    }

    /// Broadcast a payload on a channel as a `broadcast`-typed message.
    pub fn broadcast(
        &self,
        channel_name: &str,
        payload: serde_json::Map<String, serde_json::Value>,
        sender_id: &str,
        priority: MessagePriority,
    ) -> usize {
        let mut message = Message::new(MessageType::Broadcast, sender_id, channel_name, payload);
        message.priority = priority;
        self.publish(message)
    }

    /// Send a request and await the correlated response.
    ///
    /// A one-shot responder is subscribed on `response:<correlation>` before
    /// the request is published; messages with a different correlation id
    /// are ignored. On timeout the subscription is removed and `None` is
    /// returned — no responder leaks on any path.
    pub async fn request_response(&self, mut message: Message, timeout: Duration) -> Option<Message> {
        let corr = message
            .correlation_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        message.correlation_id = Some(corr.clone());

        let (tx, rx) = oneshot::channel::<Message>();
        let slot = Arc::new(Mutex::new(Some(tx)));
        let expected = corr.clone();

        let sub_id = self.subscribe(
            &format!("response:{corr}"),
            handler(move |msg: Message| {
                let slot = Arc::clone(&slot);
                let expected = expected.clone();
                async move {
                    if msg.correlation_id.as_deref() != Some(expected.as_str()) {
                        tracing::debug!(message_id = %msg.id, "ignoring mis-correlated response");
                        return;
                    }
                    if let Some(tx) = slot.lock().unwrap_or_else(|e| e.into_inner()).take() {
                        let _ = tx.send(msg);
                    }
                }
            }),
        );

        self.publish(message);

        let result = tokio::time::timeout(timeout, rx).await;
        self.unsubscribe(sub_id);

        match result {
            Ok(Ok(response)) => Some(response),
            Ok(Err(_)) => None,
            Err(_) => {
                tracing::warn!(correlation_id = %corr, "request timed out");
                None
            }
        }
    }

    /// Snapshot of the bounded message history, oldest first.
    pub fn history(&self) -> Vec<Message> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.history.iter().cloned().collect()
    }

    pub fn stats(&self) -> BrokerStats {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        BrokerStats {
            subscriptions: inner.subscriptions.len(),
            channels: channels.len(),
            history_len: inner.history.len(),
            total_delivered: self.delivered.load(Ordering::Relaxed),
        }
    }

    /// Channel record snapshot (subscriber ids, message counter).
    pub fn channel_info(&self, name: &str) -> Option<channel::Channel> {
        let channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        channels.get(name).cloned()
    }

    /// Delete a channel record. System channels are refused.
    pub fn delete_channel(&self, name: &str) -> bool {
        let mut channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        channels.delete(name)
    }

    /// Stop delivery: consumer tasks exit at their next loop turn; handlers
    /// already running complete naturally, and pending `request_response`
    /// calls time out as usual.
    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

impl Drop for Broker {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
