use crate::error::MaestroResult;
use crate::message::{Message, MessageKind};
use async_trait::async_trait;
use futures_util::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Subscribing to this topic delivers every message published on the bus.
pub const WILDCARD_TOPIC: &str = "*";

/// A callback invoked once for every message on a subscribed topic.
///
/// Returning an error (or panicking) never affects the publisher or other
/// subscribers; the bus logs the failure and moves on to the next message.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Handle one delivered message.
    async fn handle(&self, message: Arc<Message>) -> MaestroResult<()>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F> MessageHandler for FnHandler<F>
where
    F: Fn(Arc<Message>) -> MaestroResult<()> + Send + Sync,
{
    async fn handle(&self, message: Arc<Message>) -> MaestroResult<()> {
        (self.0)(message)
    }
}

/// Wrap a synchronous closure as a [`MessageHandler`].
pub fn handler_fn<F>(f: F) -> Arc<dyn MessageHandler>
where
    F: Fn(Arc<Message>) -> MaestroResult<()> + Send + Sync + 'static,
{
    Arc::new(FnHandler(f))
}

/// Bus tuning knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    /// How many recently published messages to keep for diagnostics.
    /// `0` disables the history.
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,
}

fn default_history_capacity() -> usize {
    1000
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            history_capacity: default_history_capacity(),
        }
    }
}

/// Handle returned by [`MessageBus::subscribe`], used to unsubscribe.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Subscription {
    id: u64,
    topic: String,
}

impl Subscription {
    /// Bus-unique subscription id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Topic this subscription listens on.
    pub fn topic(&self) -> &str {
        &self.topic
    }
}

/// Optional filters for [`MessageBus::history`]. Unset fields match anything.
#[derive(Debug, Clone, Default)]
pub struct HistoryFilter {
    /// Exact topic match.
    pub topic: Option<String>,
    /// Exact sender match.
    pub sender_id: Option<String>,
    /// Message kind.
    pub kind: Option<MessageKind>,
    /// Correlation id of a workflow run.
    pub correlation_id: Option<String>,
}

impl HistoryFilter {
    fn matches(&self, message: &Message) -> bool {
        self.topic.as_deref().map_or(true, |t| t == message.topic)
            && self.sender_id.as_deref().map_or(true, |s| s == message.sender_id)
            && self.kind.map_or(true, |k| k == message.kind)
            && self
                .correlation_id
                .as_deref()
                .map_or(true, |c| c == message.correlation_id)
    }
}

struct Subscriber {
    id: u64,
    tx: mpsc::UnboundedSender<Arc<Message>>,
}

#[derive(Default)]
struct BusInner {
    topics: HashMap<String, Vec<Subscriber>>,
    history: VecDeque<Arc<Message>>,
}

/// Topic-based publish/subscribe transport for inter-agent events.
///
/// Every subscription owns an unbounded queue drained by its own task, so a
/// slow subscriber never delays the publisher or its siblings, and each
/// subscriber sees a topic's messages in publish order. Nothing is replayed:
/// a subscriber only receives messages published after it subscribed.
pub struct MessageBus {
    inner: Mutex<BusInner>,
    history_capacity: usize,
    next_id: AtomicU64,
}

impl MessageBus {
    /// Create a bus with the given configuration.
    pub fn new(config: BusConfig) -> Self {
        info!(history_capacity = config.history_capacity, "MessageBus initialized");
        Self {
            inner: Mutex::new(BusInner::default()),
            history_capacity: config.history_capacity,
            next_id: AtomicU64::new(1),
        }
    }

    /// Register `handler` for every subsequent message on `topic`.
    ///
    /// Must be called from within a Tokio runtime; delivery runs on a spawned
    /// task that lives until the subscription is removed.
    pub fn subscribe(&self, topic: impl Into<String>, handler: Arc<dyn MessageHandler>) -> Subscription {
        let (subscription, rx) = self.subscribe_channel(topic);
        tokio::spawn(deliver(subscription.clone(), handler, rx));
        subscription
    }

    /// Subscribe and receive messages through a channel instead of a callback.
    pub fn subscribe_channel(
        &self,
        topic: impl Into<String>,
    ) -> (Subscription, mpsc::UnboundedReceiver<Arc<Message>>) {
        let topic = topic.into();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner
            .lock()
            .topics
            .entry(topic.clone())
            .or_default()
            .push(Subscriber { id, tx });
        debug!(topic = %topic, subscription = id, "Subscribed");
        (Subscription { id, topic }, rx)
    }

    /// Remove a subscription. Messages already queued for it are still
    /// delivered. Returns `false` if it was already gone.
    pub fn unsubscribe(&self, subscription: &Subscription) -> bool {
        let mut inner = self.inner.lock();
        let Some(subscribers) = inner.topics.get_mut(&subscription.topic) else {
            return false;
        };
        let before = subscribers.len();
        subscribers.retain(|s| s.id != subscription.id);
        let removed = subscribers.len() < before;
        if subscribers.is_empty() {
            inner.topics.remove(&subscription.topic);
        }
        if removed {
            debug!(topic = %subscription.topic, subscription = subscription.id, "Unsubscribed");
        }
        removed
    }

    /// Build and publish a message. Returns the new message id.
    pub fn publish(
        &self,
        topic: impl Into<String>,
        sender_id: impl Into<String>,
        kind: MessageKind,
        payload: serde_json::Value,
        correlation_id: impl Into<String>,
    ) -> Uuid {
        self.publish_message(Message::new(topic, sender_id, kind, payload, correlation_id))
    }

    /// Publish a prebuilt message to every current subscriber of its topic
    /// (and every wildcard subscriber). Returns once the message is queued
    /// for delivery.
    pub fn publish_message(&self, message: Message) -> Uuid {
        let id = message.id;
        let message = Arc::new(message);
        let mut inner = self.inner.lock();

        if self.history_capacity > 0 {
            if inner.history.len() >= self.history_capacity {
                inner.history.pop_front();
            }
            inner.history.push_back(Arc::clone(&message));
        }

        let mut delivered = 0usize;
        let wildcard = (message.topic != WILDCARD_TOPIC).then_some(WILDCARD_TOPIC);
        for topic in std::iter::once(message.topic.as_str()).chain(wildcard) {
            if let Some(subscribers) = inner.topics.get(topic) {
                for subscriber in subscribers {
                    // A closed receiver means the consumer went away; skip it.
                    if subscriber.tx.send(Arc::clone(&message)).is_ok() {
                        delivered += 1;
                    }
                }
            }
        }
        drop(inner);

        debug!(
            message_id = %id,
            topic = %message.topic,
            sender = %message.sender_id,
            kind = %message.kind,
            subscribers = delivered,
            "Message published"
        );
        id
    }

    /// Number of live subscriptions on exactly `topic`.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.inner.lock().topics.get(topic).map_or(0, Vec::len)
    }

    /// Most recent messages matching `filter`, oldest first, at most `limit`.
    pub fn history(&self, filter: &HistoryFilter, limit: usize) -> Vec<Arc<Message>> {
        let inner = self.inner.lock();
        let matching: Vec<Arc<Message>> = inner
            .history
            .iter()
            .filter(|m| filter.matches(m))
            .cloned()
            .collect();
        let skip = matching.len().saturating_sub(limit);
        matching.into_iter().skip(skip).collect()
    }

    /// Drop the recorded history.
    pub fn clear_history(&self) {
        self.inner.lock().history.clear();
        info!("Message history cleared");
    }
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new(BusConfig::default())
    }
}

async fn deliver(
    subscription: Subscription,
    handler: Arc<dyn MessageHandler>,
    mut rx: mpsc::UnboundedReceiver<Arc<Message>>,
) {
    while let Some(message) = rx.recv().await {
        let message_id = message.id;
        match AssertUnwindSafe(handler.handle(message)).catch_unwind().await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(
                topic = %subscription.topic,
                subscription = subscription.id,
                message_id = %message_id,
                error = %e,
                "Subscriber failed to handle message"
            ),
            Err(_) => error!(
                topic = %subscription.topic,
                subscription = subscription.id,
                message_id = %message_id,
                "Subscriber panicked while handling message"
            ),
        }
    }
    debug!(topic = %subscription.topic, subscription = subscription.id, "Delivery loop finished");
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::error::MaestroError;
    use serde_json::json;
    use std::time::Duration;

    async fn recv(rx: &mut mpsc::UnboundedReceiver<Arc<Message>>) -> Arc<Message> {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("delivery timed out")
            .expect("channel closed")
    }

    #[tokio::test]
    async fn test_publish_reaches_channel_subscriber() {
        let bus = MessageBus::default();
        let (_sub, mut rx) = bus.subscribe_channel("scan");
        bus.publish("scan", "scanner", MessageKind::Event, json!({"n": 1}), "run-1");
        let msg = recv(&mut rx).await;
        assert_eq!(msg.payload["n"], 1);
        assert_eq!(msg.correlation_id, "run-1");
    }

    #[tokio::test]
    async fn test_topic_isolation() {
        let bus = MessageBus::default();
        let (_sub, mut rx) = bus.subscribe_channel("a");
        bus.publish("b", "s", MessageKind::Event, json!(null), "c");
        bus.publish("a", "s", MessageKind::Event, json!("for-a"), "c");
        assert_eq!(recv(&mut rx).await.payload, json!("for-a"));
    }

    #[tokio::test]
    async fn test_handler_receives_in_publish_order() {
        let bus = MessageBus::default();
        let (tx, mut rx) = mpsc::unbounded_channel();
        bus.subscribe(
            "ordered",
            handler_fn(move |m| {
                tx.send(m).map_err(|e| MaestroError::Handler(e.to_string()))
            }),
        );
        for i in 0..50 {
            bus.publish("ordered", "s", MessageKind::Event, json!(i), "c");
        }
        for i in 0..50 {
            assert_eq!(recv(&mut rx).await.payload, json!(i));
        }
    }

    #[tokio::test]
    async fn test_failing_handler_does_not_block_siblings() {
        let bus = MessageBus::default();
        bus.subscribe(
            "t",
            handler_fn(|_| Err(MaestroError::Handler("boom".into()))),
        );
        bus.subscribe("t", handler_fn(|_| panic!("subscriber bug")));
        let (_sub, mut rx) = bus.subscribe_channel("t");

        bus.publish("t", "s", MessageKind::Event, json!(1), "c");
        bus.publish("t", "s", MessageKind::Event, json!(2), "c");
        assert_eq!(recv(&mut rx).await.payload, json!(1));
        assert_eq!(recv(&mut rx).await.payload, json!(2));
    }

    #[tokio::test]
    async fn test_no_replay_for_late_subscribers() {
        let bus = MessageBus::default();
        bus.publish("t", "s", MessageKind::Event, json!("early"), "c");
        let (_sub, mut rx) = bus.subscribe_channel("t");
        bus.publish("t", "s", MessageKind::Event, json!("late"), "c");
        assert_eq!(recv(&mut rx).await.payload, json!("late"));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unsubscribe() {
        let bus = MessageBus::default();
        let (sub, mut rx) = bus.subscribe_channel("t");
        assert_eq!(bus.subscriber_count("t"), 1);
        assert!(bus.unsubscribe(&sub));
        assert!(!bus.unsubscribe(&sub));
        assert_eq!(bus.subscriber_count("t"), 0);
        bus.publish("t", "s", MessageKind::Event, json!(null), "c");
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_wildcard_subscriber_sees_all_topics() {
        let bus = MessageBus::default();
        let (_sub, mut rx) = bus.subscribe_channel(WILDCARD_TOPIC);
        bus.publish("x", "s", MessageKind::Command, json!(1), "c");
        bus.publish("y", "s", MessageKind::Result, json!(2), "c");
        assert_eq!(recv(&mut rx).await.topic, "x");
        assert_eq!(recv(&mut rx).await.topic, "y");
    }

    #[test]
    fn test_history_is_bounded_and_filtered() {
        let bus = MessageBus::new(BusConfig { history_capacity: 3 });
        for i in 0..5 {
            let kind = if i % 2 == 0 { MessageKind::Event } else { MessageKind::Error };
            bus.publish("t", "s", kind, json!(i), "c");
        }
        let all = bus.history(&HistoryFilter::default(), 10);
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].payload, json!(2));

        let errors = bus.history(
            &HistoryFilter {
                kind: Some(MessageKind::Error),
                ..Default::default()
            },
            10,
        );
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].payload, json!(3));

        let last = bus.history(&HistoryFilter::default(), 1);
        assert_eq!(last[0].payload, json!(4));

        bus.clear_history();
        assert!(bus.history(&HistoryFilter::default(), 10).is_empty());
    }

    #[test]
    fn test_history_disabled() {
        let bus = MessageBus::new(BusConfig { history_capacity: 0 });
        bus.publish("t", "s", MessageKind::Event, json!(null), "c");
        assert!(bus.history(&HistoryFilter::default(), 10).is_empty());
    }
}
