//! Redpanda message bus for the order validation pipeline.
//!
//! This crate provides a Redpanda-based [`MessageBus`] using rdkafka, so any
//! Kafka-compatible broker works (Redpanda, Apache Kafka, MSK, Event Hubs).
//!
//! # Wire Mapping
//!
//! | Pipeline          | Kafka record      |
//! |-------------------|-------------------|
//! | `Message.payload` | value             |
//! | `Message.key`     | key               |
//! | `Metadata` entry  | header (UTF-8)    |
//!
//! # Delivery Semantics
//!
//! **At-least-once delivery** with manual offset commits:
//! - `enable.auto.commit` is off
//! - Kafka commits are cumulative per partition, so a commit never moves past
//!   the lowest delivery that is still unsettled. Acknowledging a delivery
//!   commits up to the first gap
//! - A negatively acknowledged (or dropped) delivery blocks commits on its
//!   partition and rewinds the consumer to its offset. It is redelivered in
//!   the same session, or after a restart if the rewind fails. Later records
//!   of the partition may be redelivered with it
//! - Delivery attempts count in-session redeliveries of an offset
//! - Ordering is guaranteed within a partition; records are keyed by order id
//!
//! # Example
//!
//! ```no_run
//! use order_pipeline_redpanda::RedpandaBus;
//! use order_pipeline_core::channel::MessageBus;
//! use order_pipeline_core::message::{Message, Metadata};
//! use futures::StreamExt;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let bus = RedpandaBus::new("localhost:9092")?;
//!
//! let message = Message::new(b"{}".to_vec())
//!     .with_metadata(Metadata::new().with("traceId", "X-1"))
//!     .with_key("O1");
//! bus.publish("orders", &message).await?;
//!
//! let mut stream = bus.consume("orders").await?;
//! while let Some(delivery) = stream.next().await {
//!     let delivery = delivery?;
//!     println!("{:?}", delivery.metadata().get("traceId"));
//!     delivery.ack();
//! }
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use order_pipeline_core::channel::{ChannelError, DeliveryStream, MessageBus};
use order_pipeline_core::message::{AckHandle, Acknowledger, Delivery, Message, Metadata};
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{Header, Headers, Message as _, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use rdkafka::{Offset, TopicPartitionList};
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Default prefix for consumer group ids.
pub const DEFAULT_CONSUMER_GROUP: &str = "order-pipeline";

/// Upper bound on a rewind after a negative acknowledgment.
const SEEK_TIMEOUT: Duration = Duration::from_secs(1);

/// Redpanda message bus.
///
/// # Configuration
///
/// - **Broker addresses**: Bootstrap servers (required)
/// - **Producer settings**: Acks, compression, timeout
/// - **Consumer group**: prefix; each consumed topic gets the group
///   `<prefix>-<topic>`, so stages reading different topics never share a group
/// - **Buffer size**: deliveries buffered between Kafka and the stage (default: 1000)
/// - **Offset reset**: Where new groups start reading (default: "earliest")
///
/// # Example
///
/// ```no_run
/// use order_pipeline_redpanda::RedpandaBus;
///
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let bus = RedpandaBus::builder()
///     .brokers("localhost:9092,localhost:9093")
///     .producer_acks("all")
///     .compression("lz4")
///     .consumer_group("order-validation")
///     .build()?;
/// # Ok(())
/// # }
/// ```
pub struct RedpandaBus {
    /// Kafka producer for publishing messages
    producer: FutureProducer,
    /// Broker addresses (for creating consumers)
    brokers: String,
    /// Producer timeout
    timeout: Duration,
    /// Consumer group prefix
    consumer_group: String,
    /// Delivery buffer size for consumers
    buffer_size: usize,
    /// Auto offset reset policy
    auto_offset_reset: String,
}

impl RedpandaBus {
    /// Create a new Redpanda bus with default configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::ConnectionFailed`] if the producer cannot be
    /// created (invalid broker list or client configuration).
    pub fn new(brokers: &str) -> Result<Self, ChannelError> {
        Self::builder().brokers(brokers).build()
    }

    /// Create a new builder for configuring the bus.
    #[must_use]
    pub fn builder() -> RedpandaBusBuilder {
        RedpandaBusBuilder::default()
    }

    /// Get a reference to the brokers string.
    #[must_use]
    pub fn brokers(&self) -> &str {
        &self.brokers
    }

    /// Consumer group used for a topic.
    #[must_use]
    pub fn group_for(&self, topic: &str) -> String {
        format!("{}-{topic}", self.consumer_group)
    }
}

/// Builder for configuring a [`RedpandaBus`].
#[derive(Default)]
pub struct RedpandaBusBuilder {
    brokers: Option<String>,
    producer_acks: Option<String>,
    compression: Option<String>,
    timeout: Option<Duration>,
    consumer_group: Option<String>,
    buffer_size: Option<usize>,
    auto_offset_reset: Option<String>,
}

impl RedpandaBusBuilder {
    /// Set the broker addresses (comma-separated, e.g. "localhost:9092").
    #[must_use]
    pub fn brokers(mut self, brokers: impl Into<String>) -> Self {
        self.brokers = Some(brokers.into());
        self
    }

    /// Set the producer acknowledgment mode: "0", "1" or "all".
    ///
    /// Default: "all"
    #[must_use]
    pub fn producer_acks(mut self, acks: impl Into<String>) -> Self {
        self.producer_acks = Some(acks.into());
        self
    }

    /// Set the compression codec: "none", "gzip", "snappy", "lz4", "zstd".
    ///
    /// Default: "none"
    #[must_use]
    pub fn compression(mut self, compression: impl Into<String>) -> Self {
        self.compression = Some(compression.into());
        self
    }

    /// Set the producer send timeout.
    ///
    /// Default: 5 seconds
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set the consumer group prefix.
    ///
    /// Instances sharing a prefix share the work of each topic.
    #[must_use]
    pub fn consumer_group(mut self, consumer_group: impl Into<String>) -> Self {
        self.consumer_group = Some(consumer_group.into());
        self
    }

    /// Set the delivery buffer size for consumers.
    ///
    /// # Panics
    ///
    /// Panics if `buffer_size` is 0.
    #[must_use]
    pub fn buffer_size(mut self, buffer_size: usize) -> Self {
        assert!(buffer_size > 0, "buffer_size must be greater than 0");
        self.buffer_size = Some(buffer_size);
        self
    }

    /// Set where new consumer groups start reading: "earliest", "latest" or "error".
    ///
    /// Default: "earliest", so orders published before the first consumer
    /// joins are not skipped.
    #[must_use]
    pub fn auto_offset_reset(mut self, policy: impl Into<String>) -> Self {
        self.auto_offset_reset = Some(policy.into());
        self
    }

    /// Build the [`RedpandaBus`].
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::ConnectionFailed`] if brokers are not set or the
    /// producer cannot be created.
    pub fn build(self) -> Result<RedpandaBus, ChannelError> {
        let brokers = self
            .brokers
            .ok_or_else(|| ChannelError::ConnectionFailed("Brokers not configured".to_string()))?;
        let acks = self.producer_acks.as_deref().unwrap_or("all");
        let compression = self.compression.as_deref().unwrap_or("none");
        let timeout = self.timeout.unwrap_or(Duration::from_secs(5));

        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &brokers)
            .set("message.timeout.ms", timeout.as_millis().to_string())
            .set("acks", acks)
            .set("compression.type", compression)
            .create()
            .map_err(|e| ChannelError::ConnectionFailed(format!("Failed to create producer: {e}")))?;

        let consumer_group = self
            .consumer_group
            .unwrap_or_else(|| DEFAULT_CONSUMER_GROUP.to_string());
        let buffer_size = self.buffer_size.unwrap_or(1000);
        let auto_offset_reset = self
            .auto_offset_reset
            .unwrap_or_else(|| "earliest".to_string());

        tracing::info!(
            brokers = %brokers,
            acks,
            compression,
            consumer_group = %consumer_group,
            buffer_size,
            auto_offset_reset = %auto_offset_reset,
            "RedpandaBus created"
        );

        Ok(RedpandaBus {
            producer,
            brokers,
            timeout,
            consumer_group,
            buffer_size,
            auto_offset_reset,
        })
    }
}

/// Kafka headers for a metadata bag.
#[must_use]
pub fn headers_from_metadata(metadata: &Metadata) -> OwnedHeaders {
    metadata
        .iter()
        .fold(OwnedHeaders::new_with_capacity(metadata.len()), |headers, (key, value)| {
            headers.insert(Header {
                key,
                value: Some(value),
            })
        })
}

/// Metadata bag from Kafka headers.
///
/// Headers without a value are skipped; non-UTF-8 values are decoded lossily.
pub fn metadata_from_headers<H: Headers>(headers: &H) -> Metadata {
    headers
        .iter()
        .filter_map(|header| {
            header
                .value
                .map(|value| (header.key.to_string(), String::from_utf8_lossy(value).into_owned()))
        })
        .collect()
}

#[derive(Debug, Default, Clone, Copy)]
struct Outstanding {
    acked: bool,
    nacks: u32,
}

#[derive(Debug, Default)]
struct PartitionLedger {
    outstanding: BTreeMap<i64, Outstanding>,
    /// Offset the consumer was rewound to and has not redelivered yet.
    rewind: Option<i64>,
}

/// Settlement state of the deliveries handed out by one consumer, per
/// partition.
///
/// Commits only ever cover a settled prefix of the delivered offsets, so an
/// unsettled delivery is never skipped by acknowledging a later one.
#[derive(Debug, Default)]
struct OffsetLedger {
    partitions: Mutex<HashMap<i32, PartitionLedger>>,
}

impl OffsetLedger {
    fn lock(&self) -> MutexGuard<'_, HashMap<i32, PartitionLedger>> {
        self.partitions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record a delivery handed to the stage. Returns its attempt number.
    fn delivered(&self, partition: i32, offset: i64) -> u32 {
        let mut partitions = self.lock();
        let ledger = partitions.entry(partition).or_default();
        if ledger.rewind == Some(offset) {
            ledger.rewind = None;
        }
        let entry = ledger.outstanding.entry(offset).or_default();
        entry.acked = false;
        entry.nacks + 1
    }

    /// Settle a delivery. Returns the offset to commit when the settled prefix
    /// grew.
    fn acked(&self, partition: i32, offset: i64) -> Option<i64> {
        let mut partitions = self.lock();
        let ledger = partitions.get_mut(&partition)?;
        ledger.outstanding.get_mut(&offset)?.acked = true;

        let mut commit = None;
        while let Some(entry) = ledger.outstanding.first_entry() {
            if !entry.get().acked {
                break;
            }
            commit = Some(entry.key() + 1);
            entry.remove();
        }
        commit
    }

    /// Reject a delivery; it stays outstanding. Returns whether the consumer
    /// must be rewound to `offset`, which is the case unless a rewind to an
    /// earlier offset is already pending.
    fn nacked(&self, partition: i32, offset: i64) -> bool {
        let mut partitions = self.lock();
        let Some(ledger) = partitions.get_mut(&partition) else {
            return false;
        };
        let Some(entry) = ledger.outstanding.get_mut(&offset) else {
            return false;
        };
        entry.acked = false;
        entry.nacks += 1;

        if ledger.rewind.is_some_and(|pending| pending <= offset) {
            return false;
        }
        ledger.rewind = Some(offset);
        true
    }
}

/// Settles a delivered record through the consumer's [`OffsetLedger`].
struct KafkaAcknowledger {
    consumer: Arc<StreamConsumer>,
    ledger: Arc<OffsetLedger>,
    topic: String,
    partition: i32,
    offset: i64,
}

impl Acknowledger for KafkaAcknowledger {
    fn ack(self: Box<Self>) {
        let Some(next) = self.ledger.acked(self.partition, self.offset) else {
            tracing::trace!(
                topic = %self.topic,
                partition = self.partition,
                offset = self.offset,
                "Commit deferred behind an unsettled offset"
            );
            return;
        };

        let mut offsets = TopicPartitionList::new();
        if let Err(e) = offsets.add_partition_offset(&self.topic, self.partition, Offset::Offset(next)) {
            tracing::warn!(topic = %self.topic, partition = self.partition, error = %e, "Invalid commit offset");
            return;
        }

        if let Err(e) = self.consumer.commit(&offsets, CommitMode::Async) {
            tracing::warn!(
                topic = %self.topic,
                partition = self.partition,
                offset = next,
                error = %e,
                "Failed to commit offset (message may be redelivered)"
            );
        }
    }

    fn nack(self: Box<Self>) {
        if !self.ledger.nacked(self.partition, self.offset) {
            return;
        }

        match self
            .consumer
            .seek(&self.topic, self.partition, Offset::Offset(self.offset), Timeout::After(SEEK_TIMEOUT))
        {
            Ok(()) => tracing::debug!(
                topic = %self.topic,
                partition = self.partition,
                offset = self.offset,
                "Rewound consumer for redelivery"
            ),
            Err(e) => tracing::warn!(
                topic = %self.topic,
                partition = self.partition,
                offset = self.offset,
                error = %e,
                "Failed to rewind consumer, message will be redelivered after restart"
            ),
        }
    }
}

impl MessageBus for RedpandaBus {
    fn publish(
        &self,
        topic: &str,
        message: &Message,
    ) -> Pin<Box<dyn Future<Output = Result<(), ChannelError>> + Send + '_>> {
        // Clone data before moving into async block
        let topic = topic.to_string();
        let message = message.clone();
        let timeout = self.timeout;

        Box::pin(async move {
            let mut record: FutureRecord<'_, str, [u8]> = FutureRecord::to(&topic)
                .payload(message.payload.as_slice())
                .headers(headers_from_metadata(&message.metadata));
            if let Some(key) = &message.key {
                record = record.key(key.as_str());
            }

            match self.producer.send(record, Timeout::After(timeout)).await {
                Ok((partition, offset)) => {
                    tracing::debug!(
                        topic = %topic,
                        partition,
                        offset,
                        key = ?message.key,
                        "Message published"
                    );
                    Ok(())
                },
                Err((kafka_error, _)) => {
                    tracing::error!(topic = %topic, error = %kafka_error, "Failed to publish message");
                    Err(ChannelError::PublishFailed {
                        topic,
                        reason: kafka_error.to_string(),
                    })
                },
            }
        })
    }

    fn consume(
        &self,
        topic: &str,
    ) -> Pin<Box<dyn Future<Output = Result<DeliveryStream, ChannelError>> + Send + '_>> {
        // Clone configuration before moving into async block
        let topic = topic.to_string();
        let brokers = self.brokers.clone();
        let group_id = self.group_for(&topic);
        let buffer_size = self.buffer_size;
        let auto_offset_reset = self.auto_offset_reset.clone();

        Box::pin(async move {
            let consumer: StreamConsumer = ClientConfig::new()
                .set("bootstrap.servers", &brokers)
                .set("group.id", &group_id)
                .set("enable.auto.commit", "false")
                .set("auto.offset.reset", &auto_offset_reset)
                .set("session.timeout.ms", "6000")
                .set("enable.partition.eof", "false")
                .create()
                .map_err(|e| ChannelError::SubscriptionFailed {
                    topic: topic.clone(),
                    reason: format!("Failed to create consumer: {e}"),
                })?;

            consumer
                .subscribe(&[topic.as_str()])
                .map_err(|e| ChannelError::SubscriptionFailed {
                    topic: topic.clone(),
                    reason: format!("Failed to subscribe: {e}"),
                })?;

            tracing::info!(
                topic = %topic,
                consumer_group = %group_id,
                buffer_size,
                auto_offset_reset = %auto_offset_reset,
                manual_commit = true,
                "Subscribed to topic"
            );

            let consumer = Arc::new(consumer);
            let ledger = Arc::new(OffsetLedger::default());
            let (tx, rx) = tokio::sync::mpsc::channel(buffer_size);

            // The task owns the Kafka stream; acknowledgers hold the consumer
            // to commit from wherever the stage settles the delivery.
            tokio::spawn(async move {
                use futures::StreamExt;

                let mut stream = consumer.stream();
                loop {
                    let next = tokio::select! {
                        () = tx.closed() => break,
                        next = stream.next() => next,
                    };
                    let Some(result) = next else { break };

                    let item = match result {
                        Ok(record) => {
                            let metadata = record
                                .headers()
                                .map(metadata_from_headers)
                                .unwrap_or_default();
                            tracing::trace!(
                                topic = record.topic(),
                                partition = record.partition(),
                                offset = record.offset(),
                                "Received message"
                            );
                            let attempt = ledger.delivered(record.partition(), record.offset());
                            // A record without a value is handed on as an empty
                            // payload and fails decoding downstream.
                            Ok(Delivery::new(
                                record.topic(),
                                record.payload().map(<[u8]>::to_vec).unwrap_or_default(),
                                metadata,
                                attempt,
                                AckHandle::new(KafkaAcknowledger {
                                    consumer: Arc::clone(&consumer),
                                    ledger: Arc::clone(&ledger),
                                    topic: record.topic().to_string(),
                                    partition: record.partition(),
                                    offset: record.offset(),
                                }),
                            ))
                        },
                        Err(e) => Err(ChannelError::TransportError(format!("Failed to receive message: {e}"))),
                    };

                    // A delivery that cannot be handed over is dropped, which
                    // leaves its offset uncommitted.
                    if tx.send(item).await.is_err() {
                        break;
                    }
                }

                tracing::debug!("Consumer task exiting");
            });

            let stream = async_stream::stream! {
                let mut rx = rx;
                while let Some(result) = rx.recv().await {
                    yield result;
                }
            };

            Ok(Box::pin(stream) as DeliveryStream)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redpanda_bus_is_send_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}

        assert_send::<RedpandaBus>();
        assert_sync::<RedpandaBus>();
    }

    #[test]
    fn builder_requires_brokers() {
        let result = RedpandaBus::builder().build();
        assert!(matches!(result, Err(ChannelError::ConnectionFailed(_))));
    }

    #[test]
    fn consumer_group_is_scoped_per_topic() {
        let Ok(bus) = RedpandaBus::builder()
            .brokers("localhost:9092")
            .consumer_group("validation")
            .build()
        else {
            return;
        };
        assert_eq!(bus.group_for("orders"), "validation-orders");
        assert_eq!(bus.group_for("checked-orders"), "validation-checked-orders");
    }

    #[test]
    fn commits_follow_the_settled_prefix() {
        let ledger = OffsetLedger::default();
        for offset in 5..8 {
            assert_eq!(ledger.delivered(0, offset), 1);
        }

        // 6 settles first but 5 is still open.
        assert_eq!(ledger.acked(0, 6), None);
        assert_eq!(ledger.acked(0, 5), Some(7));
        assert_eq!(ledger.acked(0, 7), Some(8));
    }

    #[test]
    fn nacked_offset_blocks_later_commits() {
        let ledger = OffsetLedger::default();
        ledger.delivered(0, 5);
        ledger.delivered(0, 6);

        assert!(ledger.nacked(0, 5));
        assert_eq!(ledger.acked(0, 6), None);

        // Redelivered after the rewind, with its attempt counted.
        assert_eq!(ledger.delivered(0, 5), 2);
        assert_eq!(ledger.acked(0, 5), Some(7));
    }

    #[test]
    fn one_rewind_covers_later_nacks() {
        let ledger = OffsetLedger::default();
        for offset in 0..3 {
            ledger.delivered(0, offset);
        }

        assert!(ledger.nacked(0, 1));
        assert!(!ledger.nacked(0, 2));
        assert!(ledger.nacked(0, 0));

        ledger.delivered(0, 0);
        assert!(ledger.nacked(0, 0));
    }

    #[test]
    fn partitions_are_independent() {
        let ledger = OffsetLedger::default();
        ledger.delivered(0, 10);
        ledger.delivered(1, 3);

        assert!(ledger.nacked(0, 10));
        assert_eq!(ledger.acked(1, 3), Some(4));
        assert_eq!(ledger.acked(2, 0), None);
    }

    #[test]
    fn metadata_survives_headers() {
        let metadata = Metadata::new()
            .with("traceId", "X-abc")
            .with("deadLetterReason", "Malformed event payload");

        let headers = headers_from_metadata(&metadata);
        assert_eq!(headers.count(), 2);
        assert_eq!(metadata_from_headers(&headers), metadata);
    }

    #[test]
    fn valueless_headers_are_skipped() {
        let headers = OwnedHeaders::new()
            .insert(Header {
                key: "traceId",
                value: Some("X-1"),
            })
            .insert(Header::<&str> {
                key: "empty",
                value: None,
            });

        let metadata = metadata_from_headers(&headers);
        assert_eq!(metadata.len(), 1);
        assert_eq!(metadata.get("traceId"), Some("X-1"));
    }
}
