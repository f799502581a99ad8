//! Commands accepted by the submission stage.

use crate::message::TraceContext;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A command rejected before anything was published.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InvalidCommand {
    /// A required identifier is empty or whitespace.
    #[error("`{0}` must not be empty")]
    EmptyField(&'static str),

    /// Quantity must be at least one.
    #[error("quantity must be positive")]
    ZeroQuantity,
}

/// Request to place an order.
///
/// The trace id is the caller's correlation id. It ends up in the metadata of
/// the published message, never in the event payload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaceOrder {
    /// Order identifier, also the partition key
    pub order_id: String,
    /// Customer placing the order
    pub customer_id: String,
    /// Ordered product
    pub product_id: String,
    /// Number of units
    pub quantity: u32,
    /// Correlation id carried as trace metadata
    pub trace_id: String,
}

impl PlaceOrder {
    /// Creates a new `PlaceOrder` command.
    #[must_use]
    pub fn new(
        order_id: impl Into<String>,
        customer_id: impl Into<String>,
        product_id: impl Into<String>,
        quantity: u32,
        trace_id: impl Into<String>,
    ) -> Self {
        Self {
            order_id: order_id.into(),
            customer_id: customer_id.into(),
            product_id: product_id.into(),
            quantity,
            trace_id: trace_id.into(),
        }
    }

    /// Check the command before it is turned into an event.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidCommand`] if an id is blank or the quantity is zero.
    pub fn validate(&self) -> Result<(), InvalidCommand> {
        for (field, value) in [
            ("orderId", &self.order_id),
            ("customerId", &self.customer_id),
            ("productId", &self.product_id),
        ] {
            if value.trim().is_empty() {
                return Err(InvalidCommand::EmptyField(field));
            }
        }
        if self.quantity == 0 {
            return Err(InvalidCommand::ZeroQuantity);
        }
        Ok(())
    }

    /// Trace context for the published message.
    ///
    /// The trace id is carried as given, blank included; consumers map a blank
    /// id to the untraced sentinel when they read it back.
    #[must_use]
    pub fn trace_context(&self) -> TraceContext {
        TraceContext::new(self.trace_id.clone())
    }
}
