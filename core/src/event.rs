//! Event model for the order validation pipeline.
//!
//! Every payload that travels through the pipeline is an [`Event`]. The set of
//! variants is closed: an order is either submitted, approved, or denied. Each
//! variant carries an [`EventHeader`] with its identity and creation time.
//!
//! # Identity
//!
//! A freshly constructed event always receives a new [`EventId`] and the current
//! time from the injected [`Clock`]. Decoding an event from the wire keeps the id
//! and timestamp it was published with, so replaying a message never mints a new
//! identity.
//!
//! # Example
//!
//! ```
//! use order_pipeline_core::environment::SystemClock;
//! use order_pipeline_core::event::{Event, EventHeader, OrderChecked, OrderSubmitted};
//!
//! let clock = SystemClock;
//! let submitted = OrderSubmitted::new(EventHeader::new(&clock), "O1", "C1", "P1", 5);
//! let approved = OrderChecked::from_submitted(&submitted, true, &clock);
//!
//! let event = Event::from(approved);
//! assert_eq!(event.event_type(), "order-approved-event");
//! assert_eq!(event.order_id(), "O1");
//! ```

use crate::command::PlaceOrder;
use crate::environment::Clock;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Wire discriminators, one per [`Event`] variant.
pub mod event_types {
    /// Discriminator of [`Event::OrderSubmitted`](super::Event::OrderSubmitted).
    pub const ORDER_SUBMITTED: &str = "order-submitted-event";
    /// Discriminator of [`Event::OrderApproved`](super::Event::OrderApproved).
    pub const ORDER_APPROVED: &str = "order-approved-event";
    /// Discriminator of [`Event::OrderDenied`](super::Event::OrderDenied).
    pub const ORDER_DENIED: &str = "order-denied-event";

    /// All known discriminators.
    pub const ALL: [&str; 3] = [ORDER_SUBMITTED, ORDER_APPROVED, ORDER_DENIED];
}

/// Opaque unique identifier of an event.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(String);

impl EventId {
    /// Generate a fresh random (UUID v4) event id.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Wrap an existing identifier.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the inner string value
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity and creation time shared by every event variant.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventHeader {
    event_id: EventId,
    event_time: i64,
}

impl EventHeader {
    /// Create a header for a brand new event: fresh id, current time.
    #[must_use]
    pub fn new(clock: &dyn Clock) -> Self {
        Self {
            event_id: EventId::generate(),
            event_time: clock.now().timestamp_millis(),
        }
    }

    /// Rebuild a header from a known id and timestamp.
    #[must_use]
    pub const fn restore(event_id: EventId, event_time: i64) -> Self {
        Self {
            event_id,
            event_time,
        }
    }

    /// The event id.
    #[must_use]
    pub const fn event_id(&self) -> &EventId {
        &self.event_id
    }

    /// Creation time in milliseconds since the Unix epoch (UTC).
    #[must_use]
    pub const fn event_time(&self) -> i64 {
        self.event_time
    }
}

/// An order entered the pipeline.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderSubmitted {
    #[serde(flatten)]
    header: EventHeader,
    order_id: String,
    customer_id: String,
    product_id: String,
    quantity: u32,
}

impl OrderSubmitted {
    /// Create a submitted-order event.
    #[must_use]
    pub fn new(
        header: EventHeader,
        order_id: impl Into<String>,
        customer_id: impl Into<String>,
        product_id: impl Into<String>,
        quantity: u32,
    ) -> Self {
        Self {
            header,
            order_id: order_id.into(),
            customer_id: customer_id.into(),
            product_id: product_id.into(),
            quantity,
        }
    }

    /// Build the event for a [`PlaceOrder`] command.
    ///
    /// The command's trace id is deliberately not part of the event; it travels
    /// as message metadata.
    #[must_use]
    pub fn from_command(command: &PlaceOrder, clock: &dyn Clock) -> Self {
        Self::new(
            EventHeader::new(clock),
            command.order_id.clone(),
            command.customer_id.clone(),
            command.product_id.clone(),
            command.quantity,
        )
    }

    /// Event header.
    #[must_use]
    pub const fn header(&self) -> &EventHeader {
        &self.header
    }

    /// Order id.
    #[must_use]
    pub fn order_id(&self) -> &str {
        &self.order_id
    }

    /// Customer id.
    #[must_use]
    pub fn customer_id(&self) -> &str {
        &self.customer_id
    }

    /// Product id.
    #[must_use]
    pub fn product_id(&self) -> &str {
        &self.product_id
    }

    /// Ordered quantity.
    #[must_use]
    pub const fn quantity(&self) -> u32 {
        self.quantity
    }
}

/// Result of an availability check.
///
/// Shared payload of [`Event::OrderApproved`] and [`Event::OrderDenied`];
/// `items_available` is `true` exactly for approved orders.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderChecked {
    #[serde(flatten)]
    header: EventHeader,
    order_id: String,
    customer_id: String,
    product_id: String,
    quantity: u32,
    items_available: bool,
    checked_on: i64,
}

impl OrderChecked {
    /// Record the outcome of checking `submitted`.
    ///
    /// Order fields are copied from the submitted event; the new event gets its
    /// own identity and both `event_time` and `checked_on` are the current time.
    #[must_use]
    pub fn from_submitted(submitted: &OrderSubmitted, items_available: bool, clock: &dyn Clock) -> Self {
        let header = EventHeader::new(clock);
        let checked_on = header.event_time();
        Self {
            header,
            order_id: submitted.order_id.clone(),
            customer_id: submitted.customer_id.clone(),
            product_id: submitted.product_id.clone(),
            quantity: submitted.quantity,
            items_available,
            checked_on,
        }
    }

    /// Create a checked-order event from its parts.
    #[must_use]
    pub fn new(
        header: EventHeader,
        order_id: impl Into<String>,
        customer_id: impl Into<String>,
        product_id: impl Into<String>,
        quantity: u32,
        items_available: bool,
        checked_on: i64,
    ) -> Self {
        Self {
            header,
            order_id: order_id.into(),
            customer_id: customer_id.into(),
            product_id: product_id.into(),
            quantity,
            items_available,
            checked_on,
        }
    }

    /// Event header.
    #[must_use]
    pub const fn header(&self) -> &EventHeader {
        &self.header
    }

    /// Order id.
    #[must_use]
    pub fn order_id(&self) -> &str {
        &self.order_id
    }

    /// Customer id.
    #[must_use]
    pub fn customer_id(&self) -> &str {
        &self.customer_id
    }

    /// Product id.
    #[must_use]
    pub fn product_id(&self) -> &str {
        &self.product_id
    }

    /// Ordered quantity.
    #[must_use]
    pub const fn quantity(&self) -> u32 {
        self.quantity
    }

    /// Whether every line item was available.
    #[must_use]
    pub const fn items_available(&self) -> bool {
        self.items_available
    }

    /// When the check happened, in milliseconds since the Unix epoch (UTC).
    #[must_use]
    pub const fn checked_on(&self) -> i64 {
        self.checked_on
    }
}

/// Every payload that can traverse the pipeline.
///
/// Serialized as a JSON object whose `@type` property names the variant
/// (see [`event_types`]) followed by the variant's camelCase fields.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "@type")]
pub enum Event {
    /// An order was submitted.
    #[serde(rename = "order-submitted-event")]
    OrderSubmitted(OrderSubmitted),

    /// All line items of an order are available.
    #[serde(rename = "order-approved-event")]
    OrderApproved(OrderChecked),

    /// At least one line item of an order is unavailable.
    #[serde(rename = "order-denied-event")]
    OrderDenied(OrderChecked),
}

impl Event {
    /// The wire discriminator of this variant.
    #[must_use]
    pub const fn event_type(&self) -> &'static str {
        match self {
            Self::OrderSubmitted(_) => event_types::ORDER_SUBMITTED,
            Self::OrderApproved(_) => event_types::ORDER_APPROVED,
            Self::OrderDenied(_) => event_types::ORDER_DENIED,
        }
    }

    /// Event header.
    #[must_use]
    pub const fn header(&self) -> &EventHeader {
        match self {
            Self::OrderSubmitted(e) => e.header(),
            Self::OrderApproved(e) | Self::OrderDenied(e) => e.header(),
        }
    }

    /// The event id.
    #[must_use]
    pub const fn event_id(&self) -> &EventId {
        self.header().event_id()
    }

    /// Creation time in milliseconds since the Unix epoch (UTC).
    #[must_use]
    pub const fn event_time(&self) -> i64 {
        self.header().event_time()
    }

    /// The order this event is about.
    #[must_use]
    pub fn order_id(&self) -> &str {
        match self {
            Self::OrderSubmitted(e) => e.order_id(),
            Self::OrderApproved(e) | Self::OrderDenied(e) => e.order_id(),
        }
    }

    /// Whether this is the result of an availability check.
    #[must_use]
    pub const fn is_checked(&self) -> bool {
        matches!(self, Self::OrderApproved(_) | Self::OrderDenied(_))
    }
}

impl From<OrderSubmitted> for Event {
    fn from(event: OrderSubmitted) -> Self {
        Self::OrderSubmitted(event)
    }
}

impl From<OrderChecked> for Event {
    /// Approved when all items are available, denied otherwise.
    fn from(event: OrderChecked) -> Self {
        if event.items_available {
            Self::OrderApproved(event)
        } else {
            Self::OrderDenied(event)
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {{ event_id: {}, order_id: {} }}",
            self.event_type(),
            self.event_id(),
            self.order_id()
        )
    }
}
