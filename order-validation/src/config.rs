//! Configuration management for the order validation pipeline.
//!
//! Loads configuration from environment variables with sensible defaults.
//!
//! | Variable                      | Default              |
//! |-------------------------------|----------------------|
//! | `PIPELINE_BROKER`             | `memory`             |
//! | `REDPANDA_BROKERS`            | required for `redpanda` |
//! | `PIPELINE_CONSUMER_GROUP`     | `order-pipeline`     |
//! | `PIPELINE_TOPIC_ORDERS`       | `orders`             |
//! | `PIPELINE_TOPIC_CHECKED`      | `checked-orders`     |
//! | `PIPELINE_TOPIC_DEAD_LETTER`  | `orders-dead-letter` |
//! | `PIPELINE_POISON_POLICY`      | `dead-letter`        |
//! | `PIPELINE_DEAD_LETTER_MAX_ATTEMPTS` | `5`            |
//! | `PIPELINE_RETRY_DELAY_MS`     | `1000`               |
//! | `PIPELINE_AVAILABLE_MARKER`   | `X-`                 |

use crate::consumer::StageConsumer;
use crate::inventory::TracePrefixChecker;
use crate::poison::{PoisonHandler, PoisonPolicy};
use order_pipeline_core::channel::{ChannelBindings, names};
use serde::{Deserialize, Serialize};
use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Configuration errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A variable is set to a value that cannot be used.
    #[error("Invalid value '{value}' for {key}: expected {expected}")]
    InvalidValue {
        /// Variable name
        key: &'static str,
        /// Offending value
        value: String,
        /// What would have been accepted
        expected: &'static str,
    },

    /// A variable required by the chosen setup is not set.
    #[error("Missing required setting {0}")]
    Missing(&'static str),

    /// A logical channel has no usable topic.
    #[error("Channel '{0}' is not bound to a topic")]
    UnboundChannel(String),
}

/// Which broker carries the channels.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrokerKind {
    /// In-process broker; nothing leaves the process.
    #[default]
    Memory,
    /// Redpanda or any Kafka-compatible broker.
    Redpanda,
}

impl FromStr for BrokerKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "redpanda" | "kafka" => Ok(Self::Redpanda),
            _ => Err(ConfigError::InvalidValue {
                key: "PIPELINE_BROKER",
                value: s.to_string(),
                expected: "memory or redpanda",
            }),
        }
    }
}

impl fmt::Display for BrokerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Memory => "memory",
            Self::Redpanda => "redpanda",
        })
    }
}

/// Topic names behind the logical channels.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicConfig {
    /// Topic behind `orders-out` and `orders-in`
    pub orders: String,
    /// Topic behind `checked-out` and `checked-in`
    pub checked: String,
    /// Topic behind `dead-letter-out`
    pub dead_letter: String,
}

impl Default for TopicConfig {
    fn default() -> Self {
        Self {
            orders: ChannelBindings::ORDERS_TOPIC.to_string(),
            checked: ChannelBindings::CHECKED_TOPIC.to_string(),
            dead_letter: ChannelBindings::DEAD_LETTER_TOPIC.to_string(),
        }
    }
}

/// Pipeline configuration loaded from environment variables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Broker kind
    pub broker: BrokerKind,
    /// Broker addresses (comma-separated), for `redpanda`
    pub brokers: Option<String>,
    /// Consumer group prefix
    pub consumer_group: String,
    /// Topics
    pub topics: TopicConfig,
    /// What to do with undecodable messages
    pub poison_policy: PoisonPolicy,
    /// Deliveries of a poison message while the dead-letter publish fails
    pub dead_letter_max_attempts: u32,
    /// Pause before reopening an ended stream or retrying a failed delivery
    pub retry_delay: Duration,
    /// Trace id prefix that marks an order as available
    pub available_marker: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            broker: BrokerKind::default(),
            brokers: None,
            consumer_group: "order-pipeline".to_string(),
            topics: TopicConfig::default(),
            poison_policy: PoisonPolicy::default(),
            dead_letter_max_attempts: PoisonHandler::DEFAULT_MAX_ATTEMPTS,
            retry_delay: StageConsumer::DEFAULT_RETRY_DELAY,
            available_marker: TracePrefixChecker::DEFAULT_PREFIX.to_string(),
        }
    }
}

impl PipelineConfig {
    /// Load configuration from the process environment.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if a variable has an invalid value or the
    /// resulting configuration does not validate.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration from an arbitrary variable source.
    ///
    /// Empty values count as unset.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if a variable has an invalid value or the
    /// resulting configuration does not validate.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());
        let defaults = Self::default();

        let config = Self {
            broker: get("PIPELINE_BROKER")
                .map(|value| value.parse::<BrokerKind>())
                .transpose()?
                .unwrap_or(defaults.broker),
            brokers: get("REDPANDA_BROKERS"),
            consumer_group: get("PIPELINE_CONSUMER_GROUP").unwrap_or(defaults.consumer_group),
            topics: TopicConfig {
                orders: get("PIPELINE_TOPIC_ORDERS").unwrap_or(defaults.topics.orders),
                checked: get("PIPELINE_TOPIC_CHECKED").unwrap_or(defaults.topics.checked),
                dead_letter: get("PIPELINE_TOPIC_DEAD_LETTER").unwrap_or(defaults.topics.dead_letter),
            },
            poison_policy: get("PIPELINE_POISON_POLICY")
                .map(|value| {
                    value.parse::<PoisonPolicy>().map_err(|_| ConfigError::InvalidValue {
                        key: "PIPELINE_POISON_POLICY",
                        value,
                        expected: "dead-letter or acknowledge",
                    })
                })
                .transpose()?
                .unwrap_or(defaults.poison_policy),
            dead_letter_max_attempts: get("PIPELINE_DEAD_LETTER_MAX_ATTEMPTS")
                .map(|value| parse_positive::<u32>("PIPELINE_DEAD_LETTER_MAX_ATTEMPTS", value))
                .transpose()?
                .unwrap_or(defaults.dead_letter_max_attempts),
            retry_delay: get("PIPELINE_RETRY_DELAY_MS")
                .map(|value| parse_positive::<u64>("PIPELINE_RETRY_DELAY_MS", value).map(Duration::from_millis))
                .transpose()?
                .unwrap_or(defaults.retry_delay),
            available_marker: get("PIPELINE_AVAILABLE_MARKER").unwrap_or(defaults.available_marker),
        };

        config.validate()?;
        Ok(config)
    }

    /// Check the configuration for consistency.
    ///
    /// # Errors
    ///
    /// - [`ConfigError::Missing`] if `redpanda` is selected without brokers
    /// - [`ConfigError::UnboundChannel`] if a channel's topic is blank
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.broker == BrokerKind::Redpanda && self.brokers.as_deref().is_none_or(|b| b.trim().is_empty()) {
            return Err(ConfigError::Missing("REDPANDA_BROKERS"));
        }
        validate_bindings(&self.bindings())
    }

    /// Channel bindings for the configured topics.
    #[must_use]
    pub fn bindings(&self) -> ChannelBindings {
        ChannelBindings::for_topics(&self.topics.orders, &self.topics.checked, &self.topics.dead_letter)
    }

    /// Availability checker for the configured marker.
    #[must_use]
    pub fn checker(&self) -> TracePrefixChecker {
        TracePrefixChecker::new(self.available_marker.clone())
    }
}

fn parse_positive<T>(key: &'static str, value: String) -> Result<T, ConfigError>
where
    T: FromStr + PartialOrd + From<u8>,
{
    match value.trim().parse::<T>() {
        Ok(n) if n >= T::from(1) => Ok(n),
        _ => Err(ConfigError::InvalidValue {
            key,
            value,
            expected: "a positive integer",
        }),
    }
}

/// Every channel the pipeline uses.
pub const REQUIRED_CHANNELS: [&str; 5] = [
    names::ORDERS_OUT,
    names::ORDERS_IN,
    names::CHECKED_OUT,
    names::CHECKED_IN,
    names::DEAD_LETTER_OUT,
];

/// Check that every required channel is bound to a non-blank topic.
///
/// # Errors
///
/// Returns [`ConfigError::UnboundChannel`] naming the first offending channel.
pub fn validate_bindings(bindings: &ChannelBindings) -> Result<(), ConfigError> {
    for channel in REQUIRED_CHANNELS {
        match bindings.topic(channel) {
            Ok(topic) if !topic.trim().is_empty() => {},
            _ => return Err(ConfigError::UnboundChannel(channel.to_string())),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<PipelineConfig, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        PipelineConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_without_variables() {
        let config = load(&[]).unwrap();
        assert_eq!(config, PipelineConfig::default());
        assert_eq!(config.broker, BrokerKind::Memory);
        assert_eq!(config.poison_policy, PoisonPolicy::DeadLetter);
        assert_eq!(config.bindings(), ChannelBindings::default());
    }

    #[test]
    fn reads_every_variable() {
        let config = load(&[
            ("PIPELINE_BROKER", "redpanda"),
            ("REDPANDA_BROKERS", "localhost:9092"),
            ("PIPELINE_CONSUMER_GROUP", "validation"),
            ("PIPELINE_TOPIC_ORDERS", "o"),
            ("PIPELINE_TOPIC_CHECKED", "c"),
            ("PIPELINE_TOPIC_DEAD_LETTER", "d"),
            ("PIPELINE_POISON_POLICY", "acknowledge"),
            ("PIPELINE_DEAD_LETTER_MAX_ATTEMPTS", "3"),
            ("PIPELINE_RETRY_DELAY_MS", "250"),
            ("PIPELINE_AVAILABLE_MARKER", "OK-"),
        ])
        .unwrap();

        assert_eq!(config.broker, BrokerKind::Redpanda);
        assert_eq!(config.brokers.as_deref(), Some("localhost:9092"));
        assert_eq!(config.consumer_group, "validation");
        assert_eq!(config.bindings().topic(names::CHECKED_IN).unwrap(), "c");
        assert_eq!(config.bindings().topic(names::DEAD_LETTER_OUT).unwrap(), "d");
        assert_eq!(config.poison_policy, PoisonPolicy::Acknowledge);
        assert_eq!(config.dead_letter_max_attempts, 3);
        assert_eq!(config.retry_delay, Duration::from_millis(250));
        assert_eq!(config.checker().prefix(), "OK-");
    }

    #[test]
    fn redpanda_requires_brokers() {
        assert_eq!(
            load(&[("PIPELINE_BROKER", "redpanda")]).unwrap_err(),
            ConfigError::Missing("REDPANDA_BROKERS")
        );
    }

    #[test]
    fn rejects_unknown_values() {
        assert!(matches!(
            load(&[("PIPELINE_BROKER", "rabbit")]).unwrap_err(),
            ConfigError::InvalidValue { key: "PIPELINE_BROKER", .. }
        ));
        assert!(matches!(
            load(&[("PIPELINE_POISON_POLICY", "retry")]).unwrap_err(),
            ConfigError::InvalidValue { key: "PIPELINE_POISON_POLICY", .. }
        ));
    }

    #[test]
    fn rejects_non_positive_numbers() {
        for (key, value) in [
            ("PIPELINE_DEAD_LETTER_MAX_ATTEMPTS", "0"),
            ("PIPELINE_DEAD_LETTER_MAX_ATTEMPTS", "-2"),
            ("PIPELINE_RETRY_DELAY_MS", "soon"),
        ] {
            assert!(
                matches!(load(&[(key, value)]), Err(ConfigError::InvalidValue { key: k, .. }) if k == key),
                "{key}={value}"
            );
        }
    }

    #[test]
    fn blank_values_fall_back_to_defaults() {
        let config = load(&[("PIPELINE_TOPIC_ORDERS", "  ")]).unwrap();
        assert_eq!(config.topics.orders, ChannelBindings::ORDERS_TOPIC);
    }

    #[test]
    fn blank_topic_fails_validation() {
        let config = PipelineConfig {
            topics: TopicConfig {
                checked: String::new(),
                ..TopicConfig::default()
            },
            ..PipelineConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::UnboundChannel(_))));
    }

    #[test]
    fn missing_channel_fails_validation() {
        let bindings = ChannelBindings::empty().bind(names::ORDERS_OUT, "orders");
        assert_eq!(
            validate_bindings(&bindings),
            Err(ConfigError::UnboundChannel(names::ORDERS_IN.to_string()))
        );
    }
}
