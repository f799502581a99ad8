//! Error types for the pipeline stages.

use order_pipeline_core::channel::ChannelError;
use order_pipeline_core::codec::CodecError;
use order_pipeline_core::command::InvalidCommand;
use thiserror::Error;

/// Errors raised by the submission, check and tracking stages.
#[derive(Error, Debug)]
pub enum StageError {
    /// The command failed validation; nothing was published.
    #[error("Invalid command: {0}")]
    InvalidCommand(#[from] InvalidCommand),

    /// Publishing an event for an order failed. Not retried.
    #[error("Failed to publish order {order_id} to '{channel}': {source}")]
    Publish {
        /// Order the event belongs to
        order_id: String,
        /// Logical channel name
        channel: String,
        /// Transport failure
        #[source]
        source: ChannelError,
    },

    /// An event could not be encoded or decoded.
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    /// A poison message could not be moved to the dead-letter channel.
    /// The message was left unacknowledged.
    #[error("Failed to dead-letter message from '{source_channel}': {source}")]
    DeadLetter {
        /// Channel the poison message was read from
        source_channel: String,
        /// Transport failure
        #[source]
        source: ChannelError,
    },

    /// A channel could not be bound or opened.
    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),
}

impl StageError {
    /// Whether the delivery was left for redelivery and a later attempt may
    /// succeed.
    ///
    /// Consumers pause before taking the next delivery when this holds, so a
    /// message bouncing off a failing broker does not spin the loop.
    #[must_use]
    pub const fn is_retriable(&self) -> bool {
        match self {
            Self::DeadLetter { source, .. } | Self::Channel(source) => source.is_retriable(),
            Self::InvalidCommand(_) | Self::Publish { .. } | Self::Codec(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_error_names_order() {
        let err = StageError::Publish {
            order_id: "O1".to_string(),
            channel: "checked-out".to_string(),
            source: ChannelError::PublishFailed {
                topic: "checked-orders".to_string(),
                reason: "broker down".to_string(),
            },
        };
        let text = err.to_string();
        assert!(text.contains("O1"));
        assert!(text.contains("checked-out"));
    }

    #[test]
    fn failed_dead_letter_is_retriable() {
        let err = StageError::DeadLetter {
            source_channel: "orders-in".to_string(),
            source: ChannelError::PublishFailed {
                topic: "orders-dead-letter".to_string(),
                reason: "broker down".to_string(),
            },
        };
        assert!(err.is_retriable());
        assert!(!StageError::Channel(ChannelError::UnknownChannel("x".to_string())).is_retriable());
        assert!(!StageError::from(InvalidCommand::ZeroQuantity).is_retriable());
    }

    #[test]
    fn invalid_command_converts() {
        let err = StageError::from(InvalidCommand::ZeroQuantity);
        assert!(matches!(err, StageError::InvalidCommand(InvalidCommand::ZeroQuantity)));
    }
}
