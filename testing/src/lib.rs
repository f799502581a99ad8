//! # Order Pipeline Testing
//!
//! Testing utilities for the order validation pipeline.
//!
//! This crate provides:
//! - [`InMemoryBus`]: a broker that needs no infrastructure
//! - Mock implementations of Environment traits
//! - Order fixtures and property-based strategies
//! - Small async helpers for waiting on background stages
//!
//! ## Example
//!
//! ```
//! use order_pipeline_core::channel::MessageBus;
//! use order_pipeline_core::event::{Event, OrderSubmitted};
//! use order_pipeline_core::message::Message;
//! use order_pipeline_testing::{InMemoryBus, fixtures, test_clock};
//!
//! # tokio_test::block_on(async {
//! let bus = InMemoryBus::new();
//! let command = fixtures::available_order("O1");
//! let event = Event::from(OrderSubmitted::from_command(&command, &test_clock()));
//!
//! let message = Message::from_event(&event, command.trace_context().to_metadata()).unwrap();
//! bus.publish("orders", &message).await.unwrap();
//!
//! assert_eq!(bus.published_events("orders"), vec![event]);
//! # });
//! ```

use chrono::{DateTime, Utc};
use order_pipeline_core::environment::Clock;

mod bus;

pub use bus::InMemoryBus;

/// Mock implementations of Environment traits
pub mod mocks {
    use super::{Clock, DateTime, Utc};

    /// Fixed clock for deterministic tests
    ///
    /// Always returns the same time, making tests reproducible.
    ///
    /// # Example
    ///
    /// ```
    /// use order_pipeline_testing::mocks::FixedClock;
    /// use order_pipeline_core::environment::Clock;
    /// use chrono::Utc;
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// let time1 = clock.now();
    /// let time2 = clock.now();
    /// assert_eq!(time1, time2); // Always the same!
    /// ```
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: DateTime<Utc>,
    }

    impl FixedClock {
        /// Create a new fixed clock with the given time
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self { time }
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.time
        }
    }

    /// Epoch milliseconds of [`test_clock`]'s instant.
    pub const TEST_EPOCH_MILLIS: i64 = 1_735_689_600_000;

    /// Create a default fixed clock for tests (2025-01-01 00:00:00 UTC)
    #[must_use]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(DateTime::<Utc>::from_timestamp_millis(TEST_EPOCH_MILLIS).unwrap_or_default())
    }
}

/// Ready-made orders.
///
/// Trace ids follow the default availability rule: `X-` approves, anything
/// else denies.
pub mod fixtures {
    use order_pipeline_core::command::PlaceOrder;

    /// Trace id that the default checker treats as available.
    #[must_use]
    pub fn available_trace_id() -> String {
        format!("X-{}", short_id())
    }

    /// Trace id that the default checker treats as unavailable.
    #[must_use]
    pub fn unavailable_trace_id() -> String {
        format!("Y-{}", short_id())
    }

    /// An order that will be approved.
    #[must_use]
    pub fn available_order(order_id: &str) -> PlaceOrder {
        PlaceOrder::new(order_id, "C1", "P1", 5, available_trace_id())
    }

    /// An order that will be denied.
    #[must_use]
    pub fn unavailable_order(order_id: &str) -> PlaceOrder {
        PlaceOrder::new(order_id, "C1", "P1", 5, unavailable_trace_id())
    }

    fn short_id() -> String {
        uuid::Uuid::new_v4().simple().to_string()[..8].to_string()
    }
}

/// Test helpers and utilities
pub mod helpers {
    use std::time::Duration;

    /// Install a `tracing` subscriber honoring `RUST_LOG`, once per process.
    pub fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }

    /// Poll `condition` until it holds or `timeout` elapses.
    ///
    /// Returns whether the condition was met. Background stages settle
    /// asynchronously, so tests assert on the returned flag.
    pub async fn eventually(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if condition() {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

/// Property-based testing utilities using proptest.
pub mod properties {
    use order_pipeline_core::command::PlaceOrder;
    use proptest::prelude::*;

    /// Valid identifiers.
    pub fn id() -> impl Strategy<Value = String> {
        "[A-Za-z0-9][A-Za-z0-9-]{0,15}"
    }

    /// Trace ids, roughly half of them starting with `X-`.
    pub fn trace_id() -> impl Strategy<Value = String> {
        prop_oneof!["X-[a-z0-9]{1,8}", "[A-WYZ][a-z0-9-]{0,8}", Just(String::new())]
    }

    /// Commands that pass validation.
    pub fn place_order() -> impl Strategy<Value = PlaceOrder> {
        (id(), id(), id(), 1_u32..1_000, trace_id()).prop_map(
            |(order_id, customer_id, product_id, quantity, trace_id)| {
                PlaceOrder::new(order_id, customer_id, product_id, quantity, trace_id)
            },
        )
    }
}

// Re-export commonly used items
pub use mocks::{FixedClock, test_clock};
