//! Channel abstraction connecting pipeline stages through a message broker.
//!
//! Stages never talk to each other directly. A producer publishes to a named
//! [`OutgoingChannel`], a consumer reads from a named [`IncomingChannel`], and
//! [`ChannelBindings`] decide which broker topic sits behind each name.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐  orders-out   ┌────────┐  orders-in   ┌──────────────────┐
//! │ OrderService    │──────────────►│        │─────────────►│ InventoryService │
//! └─────────────────┘               │ Broker │              └────────┬─────────┘
//!                                   │        │  checked-out          │
//! ┌─────────────────┐  checked-in   │        │◄──────────────────────┘
//! │ Notification    │◄──────────────│        │
//! └─────────────────┘               └────────┘
//! ```
//!
//! # Key Principles
//!
//! - **At-least-once delivery**: a delivery that is not acknowledged is redelivered
//! - **Idempotency**: consumers must tolerate duplicates
//! - **Ordered within partition**: messages with the same key keep their order
//! - **Metadata is out-of-band**: it never requires decoding the payload
//!
//! # Implementations
//!
//! - `InMemoryBus` (order-pipeline-testing) - for tests and local runs
//! - `RedpandaBus` (order-pipeline-redpanda) - for production (Kafka-compatible)

use crate::message::{Delivery, Message};
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;

/// Logical channel names. These are part of the contract between stages.
pub mod names {
    /// Submission stage → broker.
    pub const ORDERS_OUT: &str = "orders-out";
    /// Broker → availability check stage.
    pub const ORDERS_IN: &str = "orders-in";
    /// Availability check stage → broker.
    pub const CHECKED_OUT: &str = "checked-out";
    /// Broker → outcome tracking stage.
    pub const CHECKED_IN: &str = "checked-in";
    /// Consumers → broker, for poison messages.
    pub const DEAD_LETTER_OUT: &str = "dead-letter-out";
}

/// Errors that can occur during channel operations.
///
/// These are transport failures. They are distinct from
/// [`CodecError`](crate::codec::CodecError), which marks a bad payload.
#[derive(Error, Debug, Clone)]
pub enum ChannelError {
    /// Failed to connect to the broker
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Failed to publish a message to a topic
    #[error("Publish failed for topic '{topic}': {reason}")]
    PublishFailed {
        /// The topic that failed
        topic: String,
        /// The reason for failure
        reason: String,
    },

    /// Failed to start consuming a topic
    #[error("Subscription failed for topic '{topic}': {reason}")]
    SubscriptionFailed {
        /// The topic that failed
        topic: String,
        /// The reason for failure
        reason: String,
    },

    /// Network or transport error while receiving
    #[error("Transport error: {0}")]
    TransportError(String),

    /// No topic is bound to the logical channel name
    #[error("Unknown channel: {0}")]
    UnknownChannel(String),
}

impl ChannelError {
    /// Whether retrying the operation may succeed.
    #[must_use]
    pub const fn is_retriable(&self) -> bool {
        !matches!(self, Self::UnknownChannel(_))
    }
}

/// Lazy, effectively infinite stream of deliveries from one topic.
pub type DeliveryStream = Pin<Box<dyn Stream<Item = Result<Delivery, ChannelError>> + Send>>;

/// Trait for message broker bindings.
///
/// # Dyn Compatibility
///
/// Methods return `Pin<Box<dyn Future>>` instead of using `async fn` so that
/// stages can share an `Arc<dyn MessageBus>`.
pub trait MessageBus: Send + Sync {
    /// Publish a message to a topic.
    ///
    /// The message becomes visible to current and future consumers of the
    /// topic.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::PublishFailed`] if the broker does not accept the
    /// message. The call is not retried.
    fn publish(
        &self,
        topic: &str,
        message: &Message,
    ) -> Pin<Box<dyn Future<Output = Result<(), ChannelError>> + Send + '_>>;

    /// Start consuming a topic.
    ///
    /// Every yielded [`Delivery`] must be acknowledged once processed; a
    /// delivery dropped without acknowledgment becomes redeliverable. Dropping
    /// the stream stops pulling new messages.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::SubscriptionFailed`] if the subscription cannot
    /// be created.
    fn consume(
        &self,
        topic: &str,
    ) -> Pin<Box<dyn Future<Output = Result<DeliveryStream, ChannelError>> + Send + '_>>;
}

/// Maps logical channel names to broker topics.
///
/// # Example
///
/// ```
/// use order_pipeline_core::channel::{ChannelBindings, names};
///
/// let bindings = ChannelBindings::default();
/// assert_eq!(bindings.topic(names::ORDERS_OUT).ok(), Some("orders"));
/// assert_eq!(bindings.topic(names::ORDERS_IN).ok(), Some("orders"));
/// assert_eq!(bindings.topic(names::CHECKED_IN).ok(), Some("checked-orders"));
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelBindings {
    topics: BTreeMap<String, String>,
}

impl ChannelBindings {
    /// Default topic for submitted orders.
    pub const ORDERS_TOPIC: &'static str = "orders";
    /// Default topic for checked orders.
    pub const CHECKED_TOPIC: &'static str = "checked-orders";
    /// Default topic for poison messages.
    pub const DEAD_LETTER_TOPIC: &'static str = "orders-dead-letter";

    /// Bindings with no channels.
    #[must_use]
    pub const fn empty() -> Self {
        Self {
            topics: BTreeMap::new(),
        }
    }

    /// Bind the pipeline's channels onto three topics.
    #[must_use]
    pub fn for_topics(orders: &str, checked: &str, dead_letter: &str) -> Self {
        Self::empty()
            .bind(names::ORDERS_OUT, orders)
            .bind(names::ORDERS_IN, orders)
            .bind(names::CHECKED_OUT, checked)
            .bind(names::CHECKED_IN, checked)
            .bind(names::DEAD_LETTER_OUT, dead_letter)
    }

    /// Bind (or rebind) a channel name to a topic.
    #[must_use]
    pub fn bind(mut self, channel: impl Into<String>, topic: impl Into<String>) -> Self {
        self.topics.insert(channel.into(), topic.into());
        self
    }

    /// The topic behind a channel name.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::UnknownChannel`] if the name is not bound.
    pub fn topic(&self, channel: &str) -> Result<&str, ChannelError> {
        self.topics
            .get(channel)
            .map(String::as_str)
            .ok_or_else(|| ChannelError::UnknownChannel(channel.to_string()))
    }

    /// Iterate over `(channel, topic)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.topics.iter().map(|(c, t)| (c.as_str(), t.as_str()))
    }

    /// Producer handle for a bound channel.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::UnknownChannel`] if the name is not bound.
    pub fn outgoing(&self, channel: &str, bus: &Arc<dyn MessageBus>) -> Result<OutgoingChannel, ChannelError> {
        Ok(OutgoingChannel::new(channel, self.topic(channel)?, Arc::clone(bus)))
    }

    /// Consumer handle for a bound channel.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::UnknownChannel`] if the name is not bound.
    pub fn incoming(&self, channel: &str, bus: &Arc<dyn MessageBus>) -> Result<IncomingChannel, ChannelError> {
        Ok(IncomingChannel::new(channel, self.topic(channel)?, Arc::clone(bus)))
    }
}

impl Default for ChannelBindings {
    fn default() -> Self {
        Self::for_topics(Self::ORDERS_TOPIC, Self::CHECKED_TOPIC, Self::DEAD_LETTER_TOPIC)
    }
}

/// Producer side of a named channel.
#[derive(Clone)]
pub struct OutgoingChannel {
    name: String,
    topic: String,
    bus: Arc<dyn MessageBus>,
}

impl OutgoingChannel {
    /// Bind a channel name to a topic on a bus.
    #[must_use]
    pub fn new(name: impl Into<String>, topic: impl Into<String>, bus: Arc<dyn MessageBus>) -> Self {
        Self {
            name: name.into(),
            topic: topic.into(),
            bus,
        }
    }

    /// Logical channel name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Broker topic.
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Publish a message on this channel.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::PublishFailed`] if the broker rejects the message.
    pub async fn send(&self, message: &Message) -> Result<(), ChannelError> {
        self.bus.publish(&self.topic, message).await
    }
}

impl fmt::Debug for OutgoingChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutgoingChannel")
            .field("name", &self.name)
            .field("topic", &self.topic)
            .finish_non_exhaustive()
    }
}

/// Consumer side of a named channel.
#[derive(Clone)]
pub struct IncomingChannel {
    name: String,
    topic: String,
    bus: Arc<dyn MessageBus>,
}

impl IncomingChannel {
    /// Bind a channel name to a topic on a bus.
    #[must_use]
    pub fn new(name: impl Into<String>, topic: impl Into<String>, bus: Arc<dyn MessageBus>) -> Self {
        Self {
            name: name.into(),
            topic: topic.into(),
            bus,
        }
    }

    /// Logical channel name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Broker topic.
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Start consuming this channel.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::SubscriptionFailed`] if the broker refuses the
    /// subscription.
    pub async fn open(&self) -> Result<DeliveryStream, ChannelError> {
        tracing::debug!(channel = %self.name, topic = %self.topic, "Opening channel");
        self.bus.consume(&self.topic).await
    }
}

impl fmt::Debug for IncomingChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IncomingChannel")
            .field("name", &self.name)
            .field("topic", &self.topic)
            .finish_non_exhaustive()
    }
}
