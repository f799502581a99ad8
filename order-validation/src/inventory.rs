//! Availability check stage.
//!
//! Every submitted order is checked exactly once per delivery:
//!
//! ```text
//! received → checked → republished → acknowledged
//! ```
//!
//! The inbound delivery is acknowledged whether or not the republish
//! succeeded. A failed republish is returned to the consumer loop, which logs
//! it; the order then has no outcome until it is submitted again.

use crate::consumer::DeliveryHandler;
use crate::error::StageError;
use crate::poison::PoisonHandler;
use order_pipeline_core::channel::OutgoingChannel;
use order_pipeline_core::environment::Clock;
use order_pipeline_core::event::{Event, OrderChecked, OrderSubmitted};
use order_pipeline_core::message::{Delivery, Message, TraceContext};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Decides whether an order's line items are available.
///
/// The decision is a function of the order's trace id. Any
/// `Fn(&str) -> bool` closure is a checker.
///
/// # Example
///
/// ```
/// use order_validation::inventory::AvailabilityChecker;
///
/// let everything_in_stock = |_: &str| true;
/// assert!(everything_in_stock.all_line_items_available("anything"));
/// ```
pub trait AvailabilityChecker: Send + Sync {
    /// Whether every line item of the traced order is available.
    fn all_line_items_available(&self, trace_id: &str) -> bool;
}

impl<F> AvailabilityChecker for F
where
    F: Fn(&str) -> bool + Send + Sync,
{
    fn all_line_items_available(&self, trace_id: &str) -> bool {
        self(trace_id)
    }
}

/// Available iff the trace id starts with a marker (default `X-`).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TracePrefixChecker {
    prefix: String,
}

impl TracePrefixChecker {
    /// Default availability marker.
    pub const DEFAULT_PREFIX: &'static str = "X-";

    /// Checker with a custom marker.
    #[must_use]
    pub fn new(prefix: impl Into<String>) -> Self {
        Self { prefix: prefix.into() }
    }

    /// The marker.
    #[must_use]
    pub fn prefix(&self) -> &str {
        &self.prefix
    }
}

impl Default for TracePrefixChecker {
    fn default() -> Self {
        Self::new(Self::DEFAULT_PREFIX)
    }
}

impl AvailabilityChecker for TracePrefixChecker {
    fn all_line_items_available(&self, trace_id: &str) -> bool {
        trace_id.starts_with(&self.prefix)
    }
}

/// Consumes submitted orders and republishes them as approved or denied.
#[derive(Clone)]
pub struct InventoryService {
    checker: Arc<dyn AvailabilityChecker>,
    checked_out: OutgoingChannel,
    poison: PoisonHandler,
    clock: Arc<dyn Clock>,
}

impl InventoryService {
    /// Create the stage.
    #[must_use]
    pub fn new(
        checker: Arc<dyn AvailabilityChecker>,
        checked_out: OutgoingChannel,
        poison: PoisonHandler,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            checker,
            checked_out,
            poison,
            clock,
        }
    }

    /// Build the approved or denied event for a submitted order.
    #[must_use]
    pub fn check(&self, submitted: &OrderSubmitted, trace: &TraceContext) -> OrderChecked {
        let available = self.checker.all_line_items_available(trace.trace_id());
        OrderChecked::from_submitted(submitted, available, self.clock.as_ref())
    }

    /// Process one delivery from `orders-in`.
    ///
    /// Returns the published event, or `None` when the delivery was not a
    /// submitted order (ignored or poison). The delivery is always settled.
    ///
    /// # Errors
    ///
    /// - [`StageError::Publish`] if the checked event could not be published
    ///   (the inbound delivery is acknowledged anyway)
    /// - [`StageError::DeadLetter`] if a poison delivery could not be
    ///   dead-lettered (it is left unacknowledged)
    pub async fn check_availability(&self, delivery: Delivery) -> Result<Option<Event>, StageError> {
        let submitted = match delivery.decode() {
            Ok(Event::OrderSubmitted(submitted)) => submitted,
            Ok(other) => {
                tracing::debug!(
                    event_type = other.event_type(),
                    order_id = %other.order_id(),
                    "Ignoring event that is not a submitted order"
                );
                delivery.ack();
                return Ok(None);
            },
            Err(e) => {
                self.poison.handle(delivery, &e).await?;
                return Ok(None);
            },
        };

        let trace = TraceContext::from_metadata_or_untraced(delivery.metadata());
        let event = Event::from(self.check(&submitted, &trace));
        tracing::debug!(
            order_id = %submitted.order_id(),
            trace_id = %trace,
            event_type = event.event_type(),
            attempt = delivery.attempt(),
            "Order checked"
        );

        let published = self.publish(&event, &trace).await;
        delivery.ack();
        published?;

        let outcome = if matches!(event, Event::OrderApproved(_)) { "approved" } else { "denied" };
        metrics::counter!("pipeline.orders.checked", "outcome" => outcome).increment(1);
        Ok(Some(event))
    }

    async fn publish(&self, event: &Event, trace: &TraceContext) -> Result<(), StageError> {
        let message = Message::from_event(event, trace.to_metadata())?;
        self.checked_out
            .send(&message)
            .await
            .map_err(|source| StageError::Publish {
                order_id: event.order_id().to_string(),
                channel: self.checked_out.name().to_string(),
                source,
            })
    }
}

impl DeliveryHandler for InventoryService {
    fn handle(&self, delivery: Delivery) -> Pin<Box<dyn Future<Output = Result<(), StageError>> + Send + '_>> {
        Box::pin(async move { self.check_availability(delivery).await.map(|_| ()) })
    }
}

impl std::fmt::Debug for InventoryService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InventoryService")
            .field("checked_out", &self.checked_out)
            .field("poison", &self.poison)
            .finish_non_exhaustive()
    }
}
