//! Poison message handling.
//!
//! A delivery whose payload cannot be decoded will never succeed, however often
//! it is redelivered. Consumers hand such deliveries to a [`PoisonHandler`],
//! which either moves them to the dead-letter channel or drops them, and in
//! both cases acknowledges them so the consumer keeps going.
//!
//! If the dead-letter channel itself is failing, the delivery is negatively
//! acknowledged and comes back. After [`PoisonHandler::max_attempts`]
//! deliveries it is logged at `error` and acknowledged anyway.

use crate::error::StageError;
use order_pipeline_core::channel::OutgoingChannel;
use order_pipeline_core::codec::CodecError;
use order_pipeline_core::message::{Delivery, Message};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Metadata key holding why a message was dead-lettered.
pub const DEAD_LETTER_REASON_KEY: &str = "deadLetterReason";

/// Metadata key holding the channel a dead-lettered message came from.
pub const DEAD_LETTER_SOURCE_KEY: &str = "deadLetterSource";

/// What to do with a message that cannot be decoded.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PoisonPolicy {
    /// Republish the raw message to the dead-letter channel, then acknowledge.
    #[default]
    DeadLetter,
    /// Log and acknowledge.
    Acknowledge,
}

impl FromStr for PoisonPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "dead-letter" => Ok(Self::DeadLetter),
            "acknowledge" => Ok(Self::Acknowledge),
            other => Err(format!("unknown poison policy '{other}'")),
        }
    }
}

impl fmt::Display for PoisonPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::DeadLetter => "dead-letter",
            Self::Acknowledge => "acknowledge",
        })
    }
}

/// Applies a [`PoisonPolicy`] to undecodable deliveries of one channel.
#[derive(Clone, Debug)]
pub struct PoisonHandler {
    policy: PoisonPolicy,
    source: String,
    dead_letter: OutgoingChannel,
    max_attempts: u32,
}

impl PoisonHandler {
    /// Deliveries of one poison message before a failing dead-letter publish
    /// is given up on.
    pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

    /// Handler for deliveries read from the `source` channel.
    #[must_use]
    pub fn new(policy: PoisonPolicy, source: impl Into<String>, dead_letter: OutgoingChannel) -> Self {
        Self {
            policy,
            source: source.into(),
            dead_letter,
            max_attempts: Self::DEFAULT_MAX_ATTEMPTS,
        }
    }

    /// Set how many deliveries a poison message gets while the dead-letter
    /// publish fails. Values below 1 count as 1.
    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Attempt cap for failing dead-letter publishes.
    #[must_use]
    pub const fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Policy in effect.
    #[must_use]
    pub const fn policy(&self) -> PoisonPolicy {
        self.policy
    }

    /// Settle a delivery that failed to decode.
    ///
    /// # Errors
    ///
    /// Returns [`StageError::DeadLetter`] if the dead-letter publish fails
    /// before the attempt cap. The delivery is then negatively acknowledged so
    /// it is not lost. At the cap it is acknowledged and `Ok` is returned.
    pub async fn handle(&self, delivery: Delivery, error: &CodecError) -> Result<(), StageError> {
        metrics::counter!("pipeline.poison_messages", "channel" => self.source.clone()).increment(1);

        match self.policy {
            PoisonPolicy::Acknowledge => {
                tracing::error!(
                    channel = %self.source,
                    attempt = delivery.attempt(),
                    error = %error,
                    "Dropping undecodable message"
                );
                delivery.ack();
                Ok(())
            },
            PoisonPolicy::DeadLetter => {
                let attempt = delivery.attempt();
                let (payload, mut metadata, acknowledgment) = delivery.into_parts();
                metadata.insert(DEAD_LETTER_REASON_KEY, error.to_string());
                metadata.insert(DEAD_LETTER_SOURCE_KEY, self.source.clone());
                let message = Message::new(payload).with_metadata(metadata);

                match self.dead_letter.send(&message).await {
                    Ok(()) => {
                        tracing::warn!(
                            channel = %self.source,
                            dead_letter_topic = %self.dead_letter.topic(),
                            error = %error,
                            "Undecodable message moved to dead-letter channel"
                        );
                        acknowledgment.ack();
                        Ok(())
                    },
                    Err(source) if attempt >= self.max_attempts => {
                        tracing::error!(
                            channel = %self.source,
                            dead_letter_topic = %self.dead_letter.topic(),
                            attempt,
                            error = %error,
                            dead_letter_error = %source,
                            "Dead-letter publish kept failing, dropping undecodable message"
                        );
                        metrics::counter!("pipeline.poison_messages.dropped", "channel" => self.source.clone())
                            .increment(1);
                        acknowledgment.ack();
                        Ok(())
                    },
                    Err(source) => {
                        acknowledgment.nack();
                        Err(StageError::DeadLetter {
                            source_channel: self.source.clone(),
                            source,
                        })
                    },
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn parses_policy_names() {
        assert_eq!("dead-letter".parse::<PoisonPolicy>(), Ok(PoisonPolicy::DeadLetter));
        assert_eq!(" Acknowledge ".parse::<PoisonPolicy>(), Ok(PoisonPolicy::Acknowledge));
        assert!("retry".parse::<PoisonPolicy>().is_err());
    }

    #[test]
    fn display_matches_parse() {
        for policy in [PoisonPolicy::DeadLetter, PoisonPolicy::Acknowledge] {
            assert_eq!(policy.to_string().parse::<PoisonPolicy>().unwrap(), policy);
        }
    }

    #[test]
    fn dead_letter_is_default() {
        assert_eq!(PoisonPolicy::default(), PoisonPolicy::DeadLetter);
    }
}
