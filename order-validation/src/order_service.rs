//! Order submission stage.

use crate::error::StageError;
use order_pipeline_core::channel::OutgoingChannel;
use order_pipeline_core::command::PlaceOrder;
use order_pipeline_core::environment::Clock;
use order_pipeline_core::event::{Event, OrderSubmitted};
use order_pipeline_core::message::Message;
use std::sync::Arc;

/// Turns [`PlaceOrder`] commands into submitted-order events on `orders-out`.
#[derive(Clone)]
pub struct OrderService {
    orders_out: OutgoingChannel,
    clock: Arc<dyn Clock>,
}

impl OrderService {
    /// Create the stage.
    #[must_use]
    pub fn new(orders_out: OutgoingChannel, clock: Arc<dyn Clock>) -> Self {
        Self { orders_out, clock }
    }

    /// Validate and publish an order.
    ///
    /// The published message carries the command's trace id as metadata and is
    /// keyed by order id.
    ///
    /// # Errors
    ///
    /// - [`StageError::InvalidCommand`] if the command is invalid
    /// - [`StageError::Codec`] if the event cannot be encoded
    /// - [`StageError::Publish`] if the broker rejects the message
    pub async fn submit_order(&self, command: &PlaceOrder) -> Result<OrderSubmitted, StageError> {
        command.validate()?;

        let submitted = OrderSubmitted::from_command(command, self.clock.as_ref());
        let trace = command.trace_context();
        let message = Message::from_event(&Event::from(submitted.clone()), trace.to_metadata())?;

        self.orders_out
            .send(&message)
            .await
            .map_err(|source| StageError::Publish {
                order_id: command.order_id.clone(),
                channel: self.orders_out.name().to_string(),
                source,
            })?;

        metrics::counter!("pipeline.orders.submitted").increment(1);
        tracing::info!(
            order_id = %submitted.order_id(),
            event_id = %submitted.header().event_id(),
            trace_id = %trace,
            "Order submitted"
        );
        Ok(submitted)
    }
}

impl std::fmt::Debug for OrderService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrderService")
            .field("orders_out", &self.orders_out)
            .finish_non_exhaustive()
    }
}
