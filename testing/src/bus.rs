//! In-memory message broker for fast, deterministic tests.
//!
//! [`InMemoryBus`] behaves like a single consumer group on a broker with
//! one partition per topic:
//!
//! - Messages published before anyone consumes are retained and delivered to
//!   the first consumer that shows up.
//! - Consumers of the same topic compete: each message goes to one of them.
//! - A nacked (or dropped) delivery goes back to the front of the queue with
//!   its attempt counter incremented.
//!
//! Every published message is also appended to a per-topic log that tests can
//! inspect, and publish failures can be injected per topic.

use futures::StreamExt;
use order_pipeline_core::channel::{ChannelError, DeliveryStream, MessageBus};
use order_pipeline_core::event::Event;
use order_pipeline_core::message::{AckHandle, Acknowledger, Delivery, Message};
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;

/// A message waiting for a consumer.
#[derive(Debug)]
struct Pending {
    message: Message,
    attempt: u32,
}

#[derive(Debug, Default)]
struct TopicState {
    log: Vec<Message>,
    queue: VecDeque<Pending>,
    notify: Arc<Notify>,
    in_flight: usize,
    acknowledged: usize,
    nacked: usize,
    fail_publish: bool,
}

#[derive(Debug, Default)]
struct Shared {
    topics: Mutex<HashMap<String, TopicState>>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, TopicState>> {
        // A panicking test thread must not wedge every other consumer.
        self.topics.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn with_topic<R>(&self, topic: &str, f: impl FnOnce(&mut TopicState) -> R) -> R {
        let mut topics = self.lock();
        f(topics.entry(topic.to_string()).or_default())
    }

    fn read_topic<R>(&self, topic: &str, f: impl FnOnce(&TopicState) -> R) -> Option<R> {
        self.lock().get(topic).map(f)
    }
}

/// In-memory [`MessageBus`].
///
/// Cloning is cheap; clones share the same topics.
///
/// # Example
///
/// ```
/// use order_pipeline_core::channel::MessageBus;
/// use order_pipeline_core::message::Message;
/// use order_pipeline_testing::InMemoryBus;
/// use futures::StreamExt;
///
/// # tokio_test::block_on(async {
/// let bus = InMemoryBus::new();
/// bus.publish("orders", &Message::new(b"hello".to_vec())).await.unwrap();
///
/// let mut stream = bus.consume("orders").await.unwrap();
/// let delivery = stream.next().await.unwrap().unwrap();
/// assert_eq!(delivery.payload(), b"hello");
/// delivery.ack();
///
/// assert_eq!(bus.acknowledged("orders"), 1);
/// # });
/// ```
#[derive(Clone, Debug, Default)]
pub struct InMemoryBus {
    shared: Arc<Shared>,
}

impl InMemoryBus {
    /// Create an empty bus.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every publish to `topic` fail (or succeed again).
    pub fn set_publish_failure(&self, topic: &str, fail: bool) {
        self.shared.with_topic(topic, |state| state.fail_publish = fail);
    }

    /// Every message successfully published to `topic`, in publish order.
    #[must_use]
    pub fn published(&self, topic: &str) -> Vec<Message> {
        self.shared
            .read_topic(topic, |state| state.log.clone())
            .unwrap_or_default()
    }

    /// Decodable events published to `topic`, in publish order.
    #[must_use]
    pub fn published_events(&self, topic: &str) -> Vec<Event> {
        self.published(topic)
            .iter()
            .filter_map(|message| order_pipeline_core::codec::decode(&message.payload).ok())
            .collect()
    }

    /// Messages waiting for a consumer.
    #[must_use]
    pub fn pending(&self, topic: &str) -> usize {
        self.shared.read_topic(topic, |state| state.queue.len()).unwrap_or(0)
    }

    /// Deliveries handed out and not yet settled.
    #[must_use]
    pub fn in_flight(&self, topic: &str) -> usize {
        self.shared.read_topic(topic, |state| state.in_flight).unwrap_or(0)
    }

    /// Deliveries acknowledged so far.
    #[must_use]
    pub fn acknowledged(&self, topic: &str) -> usize {
        self.shared.read_topic(topic, |state| state.acknowledged).unwrap_or(0)
    }

    /// Deliveries negatively acknowledged (explicitly or by drop) so far.
    #[must_use]
    pub fn nacked(&self, topic: &str) -> usize {
        self.shared.read_topic(topic, |state| state.nacked).unwrap_or(0)
    }
}

struct InMemoryAcknowledger {
    shared: Arc<Shared>,
    topic: String,
    message: Message,
    attempt: u32,
}

impl Acknowledger for InMemoryAcknowledger {
    fn ack(self: Box<Self>) {
        self.shared.with_topic(&self.topic, |state| {
            state.in_flight = state.in_flight.saturating_sub(1);
            state.acknowledged += 1;
        });
    }

    fn nack(self: Box<Self>) {
        let Self {
            shared,
            topic,
            message,
            attempt,
        } = *self;
        tracing::debug!(topic = %topic, attempt, "Requeueing negatively acknowledged message");
        shared.with_topic(&topic, |state| {
            state.in_flight = state.in_flight.saturating_sub(1);
            state.nacked += 1;
            state.queue.push_front(Pending {
                message,
                attempt: attempt + 1,
            });
            state.notify.notify_one();
        });
    }
}

impl MessageBus for InMemoryBus {
    fn publish(
        &self,
        topic: &str,
        message: &Message,
    ) -> Pin<Box<dyn Future<Output = Result<(), ChannelError>> + Send + '_>> {
        let topic = topic.to_string();
        let message = message.clone();

        Box::pin(async move {
            self.shared.with_topic(&topic, |state| {
                if state.fail_publish {
                    return Err(ChannelError::PublishFailed {
                        topic: topic.clone(),
                        reason: "publish failure injected".to_string(),
                    });
                }
                state.log.push(message.clone());
                state.queue.push_back(Pending { message, attempt: 1 });
                state.notify.notify_one();
                Ok(())
            })?;

            tracing::trace!(topic = %topic, "Published message");
            Ok(())
        })
    }

    fn consume(
        &self,
        topic: &str,
    ) -> Pin<Box<dyn Future<Output = Result<DeliveryStream, ChannelError>> + Send + '_>> {
        let topic = topic.to_string();
        let shared = Arc::clone(&self.shared);

        Box::pin(async move {
            let stream = async_stream::stream! {
                loop {
                    let (next, notify) = shared.with_topic(&topic, |state| {
                        let next = state.queue.pop_front();
                        if next.is_some() {
                            state.in_flight += 1;
                        }
                        (next, Arc::clone(&state.notify))
                    });

                    match next {
                        Some(Pending { message, attempt }) => {
                            let acknowledger = InMemoryAcknowledger {
                                shared: Arc::clone(&shared),
                                topic: topic.clone(),
                                message: message.clone(),
                                attempt,
                            };
                            yield Ok::<_, ChannelError>(Delivery::new(
                                topic.clone(),
                                message.payload,
                                message.metadata,
                                attempt,
                                AckHandle::new(acknowledger),
                            ));
                        },
                        // notify_one stores a permit when nobody waits, so a
                        // publish between the pop and this await is not lost.
                        None => notify.notified().await,
                    }
                }
            };

            Ok(stream.boxed())
        })
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use order_pipeline_core::message::Metadata;
    use std::time::Duration;

    fn message(body: &str) -> Message {
        Message::new(body.as_bytes().to_vec()).with_metadata(Metadata::new().with("traceId", body))
    }

    async fn next(stream: &mut DeliveryStream) -> Delivery {
        tokio::time::timeout(Duration::from_secs(1), stream.next())
            .await
            .expect("timed out waiting for delivery")
            .expect("stream ended")
            .expect("transport error")
    }

    #[tokio::test]
    async fn retains_messages_for_late_consumers() {
        let bus = InMemoryBus::new();
        bus.publish("t", &message("a")).await.unwrap();
        bus.publish("t", &message("b")).await.unwrap();

        let mut stream = bus.consume("t").await.unwrap();
        let first = next(&mut stream).await;
        assert_eq!(first.payload(), b"a");
        first.ack();
        let second = next(&mut stream).await;
        assert_eq!(second.payload(), b"b");
        second.ack();
        assert_eq!(bus.acknowledged("t"), 2);
        assert_eq!(bus.nacked("t"), 0);
    }

    #[tokio::test]
    async fn wakes_waiting_consumer() {
        let bus = InMemoryBus::new();
        let mut stream = bus.consume("t").await.unwrap();

        let publisher = bus.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            publisher.publish("t", &message("late")).await.unwrap();
        });

        let delivery = next(&mut stream).await;
        assert_eq!(delivery.payload(), b"late");
        assert_eq!(delivery.metadata().get("traceId"), Some("late"));
    }

    #[tokio::test]
    async fn ack_is_counted() {
        let bus = InMemoryBus::new();
        bus.publish("t", &message("a")).await.unwrap();
        let mut stream = bus.consume("t").await.unwrap();

        let delivery = next(&mut stream).await;
        assert_eq!(bus.in_flight("t"), 1);
        delivery.ack();

        assert_eq!(bus.in_flight("t"), 0);
        assert_eq!(bus.acknowledged("t"), 1);
        assert_eq!(bus.pending("t"), 0);
    }

    #[tokio::test]
    async fn dropped_delivery_is_redelivered_first() {
        let bus = InMemoryBus::new();
        bus.publish("t", &message("a")).await.unwrap();
        bus.publish("t", &message("b")).await.unwrap();
        let mut stream = bus.consume("t").await.unwrap();

        let first = next(&mut stream).await;
        assert_eq!(first.attempt(), 1);
        drop(first);
        assert_eq!(bus.nacked("t"), 1);

        let again = next(&mut stream).await;
        assert_eq!(again.payload(), b"a");
        assert_eq!(again.attempt(), 2);
        assert!(again.is_redelivery());
    }

    #[tokio::test]
    async fn competing_consumers_share_messages() {
        let bus = InMemoryBus::new();
        let mut one = bus.consume("t").await.unwrap();
        let mut two = bus.consume("t").await.unwrap();

        bus.publish("t", &message("a")).await.unwrap();
        bus.publish("t", &message("b")).await.unwrap();

        let first = next(&mut one).await;
        let second = next(&mut two).await;
        assert_ne!(first.payload(), second.payload());
        first.ack();
        second.ack();
        assert_eq!(bus.acknowledged("t"), 2);
    }

    #[tokio::test]
    async fn injected_failure_rejects_publish() {
        let bus = InMemoryBus::new();
        bus.set_publish_failure("t", true);

        let err = bus.publish("t", &message("a")).await.unwrap_err();
        assert!(matches!(err, ChannelError::PublishFailed { ref topic, .. } if topic == "t"));
        assert!(bus.published("t").is_empty());

        bus.set_publish_failure("t", false);
        bus.publish("t", &message("a")).await.unwrap();
        assert_eq!(bus.published("t").len(), 1);
    }

    #[tokio::test]
    async fn topics_are_isolated() {
        let bus = InMemoryBus::new();
        bus.publish("a", &message("x")).await.unwrap();
        assert!(bus.published("b").is_empty());
        assert_eq!(bus.pending("a"), 1);
        assert_eq!(bus.pending("b"), 0);
    }

}
