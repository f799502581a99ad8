//! # Order Pipeline Core
//!
//! Event model, envelope codec and channel abstraction shared by every stage of
//! the order validation pipeline.
//!
//! An order flows through three stages that only meet through a broker:
//!
//! 1. **Submission** turns a [`PlaceOrder`](command::PlaceOrder) into an
//!    [`OrderSubmitted`](event::OrderSubmitted) event and publishes it.
//! 2. **Availability check** consumes submitted orders and republishes them as
//!    approved or denied.
//! 3. **Outcome tracking** records which orders were approved or denied.
//!
//! ## Core Concepts
//!
//! - **Event**: closed sum type of everything that travels on a channel
//! - **Envelope**: JSON object with an `@type` discriminator
//! - **Metadata**: out-of-band string bag; carries the trace context
//! - **Channel**: logical name bound to a broker topic
//! - **Delivery**: a consumed message that must be acknowledged
//!
//! ## Delivery Guarantees
//!
//! - At-least-once: unacknowledged deliveries are redelivered
//! - Consumers are idempotent
//! - Malformed payloads are poison messages, never transport errors

// Re-export commonly used types
pub use chrono::{DateTime, Utc};
pub use serde::{Deserialize, Serialize};

pub mod channel;
pub mod codec;
pub mod command;
pub mod event;
pub mod message;

pub use channel::{ChannelBindings, ChannelError, DeliveryStream, IncomingChannel, MessageBus, OutgoingChannel};
pub use codec::CodecError;
pub use command::{InvalidCommand, PlaceOrder};
pub use event::{Event, EventHeader, EventId, OrderChecked, OrderSubmitted};
pub use message::{AckHandle, Acknowledger, Delivery, Message, Metadata, MetadataMissing, TraceContext};

/// Environment module - Injected dependencies
///
/// Stages never read the system clock directly so that tests can pin time.
pub mod environment {
    use chrono::{DateTime, Utc};

    /// Clock trait - abstracts time operations for testability
    ///
    /// # Examples
    ///
    /// ```
    /// use order_pipeline_core::environment::{Clock, SystemClock};
    ///
    /// let now = SystemClock.now();
    /// assert!(now.timestamp_millis() > 0);
    /// ```
    pub trait Clock: Send + Sync {
        /// Get the current time
        fn now(&self) -> DateTime<Utc>;
    }

    /// Production clock backed by the system time.
    #[derive(Clone, Copy, Debug, Default)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }
}
