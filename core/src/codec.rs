//! Envelope codec: [`Event`] to bytes and back.
//!
//! The envelope is a JSON object whose first concern is the `@type`
//! discriminator. A single consumer can therefore read a channel that carries
//! several event shapes without knowing up front which stage produced the
//! message.
//!
//! ```text
//! {"@type":"order-submitted-event","eventId":"…","eventTime":1735689600000,
//!  "orderId":"O1","customerId":"C1","productId":"P1","quantity":5}
//! ```
//!
//! # Failure classes
//!
//! Codec failures are never transport failures. A [`CodecError`] means the
//! payload itself is unusable (a poison message): retrying will not help, so
//! consumers quarantine or skip it. Use [`CodecError::is_decoding`] to tell the
//! decode side from the encode side.

use crate::event::{Event, event_types};
use serde::Deserialize;
use thiserror::Error;

/// Name of the property carrying the variant discriminator.
pub const DISCRIMINATOR: &str = "@type";

/// Error types for envelope encoding and decoding.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Failed to serialize the event.
    #[error("Unable to encode event: {0}")]
    Encoding(String),

    /// The bytes are not a well-formed envelope (not JSON, missing or mistyped fields).
    #[error("Malformed event payload: {0}")]
    Malformed(String),

    /// The envelope carries no discriminator.
    #[error("Event payload has no `@type` discriminator")]
    MissingDiscriminator,

    /// The discriminator names no known event.
    #[error("Unknown event type: {0}")]
    UnknownEventType(String),

    /// The envelope decoded but violates an event invariant.
    #[error("Invalid value for field `{field}`: {reason}")]
    InvalidField {
        /// Wire name of the offending field
        field: &'static str,
        /// What is wrong with it
        reason: String,
    },
}

impl CodecError {
    /// Whether this error was raised while decoding.
    #[must_use]
    pub const fn is_decoding(&self) -> bool {
        !matches!(self, Self::Encoding(_))
    }
}

/// Encode an event into its wire envelope.
///
/// # Errors
///
/// Returns [`CodecError::Encoding`] if serialization fails.
pub fn encode(event: &Event) -> Result<Vec<u8>, CodecError> {
    serde_json::to_vec(event).map_err(|e| CodecError::Encoding(e.to_string()))
}

/// Just enough of the envelope to route it.
#[derive(Deserialize)]
struct Discriminator {
    #[serde(rename = "@type")]
    event_type: Option<String>,
}

/// Decode an event from its wire envelope.
///
/// The discriminator is read first; only known event types are handed to the
/// variant decoder. The decoded event keeps the id and timestamp found on the
/// wire.
///
/// # Errors
///
/// - [`CodecError::Malformed`] if the bytes are not a JSON object with the
///   variant's fields
/// - [`CodecError::MissingDiscriminator`] if `@type` is absent
/// - [`CodecError::UnknownEventType`] if `@type` names no known event
/// - [`CodecError::InvalidField`] if the event violates an invariant
pub fn decode(bytes: &[u8]) -> Result<Event, CodecError> {
    let Discriminator { event_type } =
        serde_json::from_slice(bytes).map_err(|e| CodecError::Malformed(e.to_string()))?;
    let event_type = event_type.ok_or(CodecError::MissingDiscriminator)?;

    if !event_types::ALL.contains(&event_type.as_str()) {
        return Err(CodecError::UnknownEventType(event_type));
    }

    let event: Event =
        serde_json::from_slice(bytes).map_err(|e| CodecError::Malformed(e.to_string()))?;
    validate(&event)?;

    tracing::trace!(event_type = %event_type, event_id = %event.event_id(), "Decoded event");
    Ok(event)
}

fn validate(event: &Event) -> Result<(), CodecError> {
    let (order_id, quantity) = match event {
        Event::OrderSubmitted(e) => (e.order_id(), e.quantity()),
        Event::OrderApproved(e) | Event::OrderDenied(e) => {
            let expected = matches!(event, Event::OrderApproved(_));
            if e.items_available() != expected {
                return Err(CodecError::InvalidField {
                    field: "itemsAvailable",
                    reason: format!("must be {expected} for {}", event.event_type()),
                });
            }
            (e.order_id(), e.quantity())
        },
    };

    if order_id.is_empty() {
        return Err(CodecError::InvalidField {
            field: "orderId",
            reason: "must not be empty".to_string(),
        });
    }
    if quantity == 0 {
        return Err(CodecError::InvalidField {
            field: "quantity",
            reason: "must be positive".to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use crate::event::{EventHeader, EventId, OrderChecked, OrderSubmitted};
    use proptest::prelude::*;

    fn submitted(quantity: u32) -> Event {
        Event::from(OrderSubmitted::new(
            EventHeader::restore(EventId::new("e-1"), 1_735_689_600_000),
            "O1",
            "C1",
            "P1",
            quantity,
        ))
    }

    fn checked(available: bool) -> Event {
        Event::from(OrderChecked::new(
            EventHeader::restore(EventId::new("e-2"), 1_735_689_600_500),
            "O1",
            "C1",
            "P1",
            5,
            available,
            1_735_689_600_500,
        ))
    }

    #[test]
    fn encodes_discriminator_and_camel_case_fields() {
        let bytes = encode(&submitted(5)).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();

        assert_eq!(value[DISCRIMINATOR], "order-submitted-event");
        assert_eq!(value["eventId"], "e-1");
        assert_eq!(value["eventTime"], 1_735_689_600_000_i64);
        assert_eq!(value["orderId"], "O1");
        assert_eq!(value["customerId"], "C1");
        assert_eq!(value["productId"], "P1");
        assert_eq!(value["quantity"], 5);
    }

    #[test]
    fn encoded_discriminator_matches_event_type() {
        for event in [submitted(1), checked(true), checked(false)] {
            let value: serde_json::Value = serde_json::from_slice(&encode(&event).unwrap()).unwrap();
            assert_eq!(value[DISCRIMINATOR], event.event_type());
        }
    }

    #[test]
    fn checked_events_carry_availability_and_check_time() {
        let value: serde_json::Value = serde_json::from_slice(&encode(&checked(false)).unwrap()).unwrap();
        assert_eq!(value[DISCRIMINATOR], "order-denied-event");
        assert_eq!(value["itemsAvailable"], false);
        assert_eq!(value["checkedOn"], 1_735_689_600_500_i64);
    }

    #[test]
    fn decoding_keeps_wire_identity() {
        let event = checked(true);
        let decoded = decode(&encode(&event).unwrap()).unwrap();
        assert_eq!(decoded, event);
        assert_eq!(decoded.event_id().as_str(), "e-2");
    }

    #[test]
    fn decodes_hand_written_envelope() {
        let bytes = br#"{"@type":"order-approved-event","eventId":"abc","eventTime":10,
            "orderId":"O9","customerId":"C9","productId":"P9","quantity":2,
            "itemsAvailable":true,"checkedOn":11}"#;
        let Event::OrderApproved(approved) = decode(bytes).unwrap() else {
            unreachable!("expected approved event");
        };
        assert_eq!(approved.order_id(), "O9");
        assert_eq!(approved.checked_on(), 11);
        assert_eq!(approved.header().event_time(), 10);
    }

    #[test]
    fn garbage_is_malformed() {
        let err = decode(b"\x00\x01not json").unwrap_err();
        assert!(matches!(err, CodecError::Malformed(_)));
        assert!(err.is_decoding());
    }

    #[test]
    fn empty_payload_is_malformed() {
        assert!(matches!(decode(b"").unwrap_err(), CodecError::Malformed(_)));
    }

    #[test]
    fn missing_discriminator_is_reported() {
        let err = decode(br#"{"orderId":"O1"}"#).unwrap_err();
        assert_eq!(err, CodecError::MissingDiscriminator);
    }

    #[test]
    fn unknown_discriminator_is_reported() {
        let err = decode(br#"{"@type":"order-shipped-event","orderId":"O1"}"#).unwrap_err();
        assert_eq!(err, CodecError::UnknownEventType("order-shipped-event".to_string()));
    }

    #[test]
    fn missing_fields_are_malformed() {
        let err = decode(br#"{"@type":"order-submitted-event","orderId":"O1"}"#).unwrap_err();
        assert!(matches!(err, CodecError::Malformed(_)));
    }

    #[test]
    fn zero_quantity_is_rejected() {
        let bytes = encode(&submitted(0)).unwrap();
        let err = decode(&bytes).unwrap_err();
        assert!(matches!(err, CodecError::InvalidField { field: "quantity", .. }));
    }

    #[test]
    fn availability_must_match_variant() {
        let bytes = br#"{"@type":"order-approved-event","eventId":"abc","eventTime":10,
            "orderId":"O9","customerId":"C9","productId":"P9","quantity":2,
            "itemsAvailable":false,"checkedOn":11}"#;
        let err = decode(bytes).unwrap_err();
        assert!(matches!(err, CodecError::InvalidField { field: "itemsAvailable", .. }));
    }

    #[test]
    fn encoding_error_is_not_decoding() {
        assert!(!CodecError::Encoding("boom".to_string()).is_decoding());
    }

    proptest! {
        #[test]
        fn roundtrip_preserves_every_field(
            event_id in "[a-f0-9-]{1,36}",
            event_time in 0_i64..4_102_444_800_000,
            order_id in "[A-Za-z0-9-]{1,24}",
            customer_id in "[A-Za-z0-9-]{0,24}",
            product_id in "\\PC{0,24}",
            quantity in 1_u32..10_000,
            checked_on in 0_i64..4_102_444_800_000,
            variant in 0_u8..3,
        ) {
            let header = EventHeader::restore(EventId::new(event_id), event_time);
            let event = match variant {
                0 => Event::from(OrderSubmitted::new(header, order_id, customer_id, product_id, quantity)),
                n => Event::from(OrderChecked::new(
                    header, order_id, customer_id, product_id, quantity, n == 1, checked_on,
                )),
            };

            let decoded = decode(&encode(&event).unwrap()).unwrap();
            prop_assert_eq!(decoded, event);
        }
    }
}
