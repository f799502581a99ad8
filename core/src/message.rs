//! Messages, out-of-band metadata, trace context and acknowledgments.
//!
//! A [`Message`] is what a producer hands to a channel: encoded payload bytes
//! plus a [`Metadata`] bag. Metadata never lives inside the payload, so reading
//! the trace id does not require decoding the event and the payload's wire
//! shape is the same whether tracing is enabled or not.
//!
//! A [`Delivery`] is what a consumer receives. It owns an [`AckHandle`] that
//! must be used exactly once: [`AckHandle::ack`] consumes the handle, and
//! dropping a handle without acknowledging it tells the broker binding to make
//! the message redeliverable (at-least-once).

use crate::codec::{self, CodecError};
use crate::event::Event;
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// Metadata key carrying the trace id.
pub const TRACE_ID_KEY: &str = "traceId";

/// Trace id used when a message arrives without trace metadata.
pub const NO_TRACE_ID: &str = "no-trace-id";

/// Key/value metadata attached to a message independently of its payload.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Metadata {
    entries: BTreeMap<String, String>,
}

impl Metadata {
    /// Create an empty metadata bag.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    /// Builder-style insert.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(key, value);
        self
    }

    /// Insert an entry, returning the previous value for the key.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) -> Option<String> {
        self.entries.insert(key.into(), value.into())
    }

    /// Look up an entry.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the bag is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate over entries in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Metadata {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
        }
    }
}

/// A message carried no trace context.
///
/// Never fatal: callers fall back to [`TraceContext::untraced`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Message carries no `{key}` metadata")]
pub struct MetadataMissing {
    /// The metadata key that was looked up
    pub key: &'static str,
}

/// Correlation id that follows an order through the pipeline.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct TraceContext {
    trace_id: String,
}

impl TraceContext {
    /// Create a trace context.
    #[must_use]
    pub fn new(trace_id: impl Into<String>) -> Self {
        Self {
            trace_id: trace_id.into(),
        }
    }

    /// The sentinel context used when a message carries none.
    #[must_use]
    pub fn untraced() -> Self {
        Self::new(NO_TRACE_ID)
    }

    /// The trace id.
    #[must_use]
    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    /// Whether this is the [`NO_TRACE_ID`] sentinel.
    #[must_use]
    pub fn is_untraced(&self) -> bool {
        self.trace_id == NO_TRACE_ID
    }

    /// Read the trace context from message metadata.
    ///
    /// # Errors
    ///
    /// Returns [`MetadataMissing`] if there is no non-empty `traceId` entry.
    pub fn from_metadata(metadata: &Metadata) -> Result<Self, MetadataMissing> {
        metadata
            .get(TRACE_ID_KEY)
            .filter(|id| !id.is_empty())
            .map(Self::new)
            .ok_or(MetadataMissing { key: TRACE_ID_KEY })
    }

    /// Read the trace context, falling back to [`TraceContext::untraced`].
    #[must_use]
    pub fn from_metadata_or_untraced(metadata: &Metadata) -> Self {
        Self::from_metadata(metadata).unwrap_or_else(|missing| {
            tracing::debug!(%missing, "No trace context, using sentinel");
            Self::untraced()
        })
    }

    /// Write this trace context into `metadata`.
    pub fn attach(&self, metadata: &mut Metadata) {
        metadata.insert(TRACE_ID_KEY, self.trace_id.clone());
    }

    /// Metadata holding only this trace context.
    #[must_use]
    pub fn to_metadata(&self) -> Metadata {
        Metadata::new().with(TRACE_ID_KEY, self.trace_id.clone())
    }
}

impl fmt::Display for TraceContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.trace_id)
    }
}

/// An outbound message: payload bytes, metadata and an optional partition key.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Message {
    /// Encoded payload.
    pub payload: Vec<u8>,

    /// Out-of-band metadata.
    pub metadata: Metadata,

    /// Partition key. Brokers that partition topics keep messages with the
    /// same key in order.
    pub key: Option<String>,
}

impl Message {
    /// Create a message with empty metadata and no key.
    #[must_use]
    pub const fn new(payload: Vec<u8>) -> Self {
        Self {
            payload,
            metadata: Metadata::new(),
            key: None,
        }
    }

    /// Encode an event into a message keyed by its order id.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Encoding`] if the event cannot be encoded.
    pub fn from_event(event: &Event, metadata: Metadata) -> Result<Self, CodecError> {
        Ok(Self {
            payload: codec::encode(event)?,
            metadata,
            key: Some(event.order_id().to_string()),
        })
    }

    /// Replace the metadata.
    #[must_use]
    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Set the partition key.
    #[must_use]
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Message {{ size: {} bytes, metadata: {} entries }}",
            self.payload.len(),
            self.metadata.len()
        )
    }
}

/// Broker-side acknowledgment of one delivered message.
///
/// Implemented by broker bindings. Each method consumes the acknowledger, so a
/// delivery is settled at most once.
pub trait Acknowledger: Send {
    /// The message was processed (or deliberately discarded); do not redeliver.
    fn ack(self: Box<Self>);

    /// The message was not processed; make it redeliverable.
    fn nack(self: Box<Self>);
}

/// Handle used by a consumer to settle a delivery exactly once.
///
/// Dropping the handle without calling [`AckHandle::ack`] negatively
/// acknowledges the delivery.
pub struct AckHandle {
    acknowledger: Option<Box<dyn Acknowledger>>,
}

impl AckHandle {
    /// Wrap a broker acknowledger.
    #[must_use]
    pub fn new(acknowledger: impl Acknowledger + 'static) -> Self {
        Self {
            acknowledger: Some(Box::new(acknowledger)),
        }
    }

    /// Acknowledge the delivery.
    pub fn ack(mut self) {
        if let Some(acknowledger) = self.acknowledger.take() {
            acknowledger.ack();
        }
    }

    /// Explicitly reject the delivery so it is redelivered.
    pub fn nack(mut self) {
        if let Some(acknowledger) = self.acknowledger.take() {
            acknowledger.nack();
        }
    }
}

impl Drop for AckHandle {
    fn drop(&mut self) {
        if let Some(acknowledger) = self.acknowledger.take() {
            acknowledger.nack();
        }
    }
}

impl fmt::Debug for AckHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AckHandle")
            .field("pending", &self.acknowledger.is_some())
            .finish()
    }
}

/// A message received from a channel, with its acknowledgment handle.
#[derive(Debug)]
pub struct Delivery {
    topic: String,
    payload: Vec<u8>,
    metadata: Metadata,
    attempt: u32,
    acknowledgment: AckHandle,
}

impl Delivery {
    /// Create a delivery. `attempt` starts at 1 and grows with each redelivery.
    #[must_use]
    pub fn new(
        topic: impl Into<String>,
        payload: Vec<u8>,
        metadata: Metadata,
        attempt: u32,
        acknowledgment: AckHandle,
    ) -> Self {
        Self {
            topic: topic.into(),
            payload,
            metadata,
            attempt,
            acknowledgment,
        }
    }

    /// Topic the message was read from.
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Raw payload bytes.
    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Out-of-band metadata.
    #[must_use]
    pub const fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    /// Delivery attempt, starting at 1.
    #[must_use]
    pub const fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Whether the broker delivered this message before.
    #[must_use]
    pub const fn is_redelivery(&self) -> bool {
        self.attempt > 1
    }

    /// Decode the payload.
    ///
    /// # Errors
    ///
    /// Returns a decoding [`CodecError`] for poison payloads.
    pub fn decode(&self) -> Result<Event, CodecError> {
        codec::decode(&self.payload)
    }

    /// Read the trace context from the metadata.
    ///
    /// # Errors
    ///
    /// Returns [`MetadataMissing`] if the message carries no trace id.
    pub fn trace_context(&self) -> Result<TraceContext, MetadataMissing> {
        TraceContext::from_metadata(&self.metadata)
    }

    /// Acknowledge the delivery.
    pub fn ack(self) {
        self.acknowledgment.ack();
    }

    /// Reject the delivery so it is redelivered.
    pub fn nack(self) {
        self.acknowledgment.nack();
    }

    /// Split into payload, metadata and acknowledgment handle.
    #[must_use]
    pub fn into_parts(self) -> (Vec<u8>, Metadata, AckHandle) {
        (self.payload, self.metadata, self.acknowledgment)
    }
}
