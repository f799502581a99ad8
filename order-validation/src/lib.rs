//! # Order Validation
//!
//! The three stages of the order validation pipeline and the wiring that
//! connects them through a message broker.
//!
//! ```text
//! PlaceOrder → OrderService ─orders─► InventoryService ─checked-orders─► NotificationService
//!                                           │                                  │
//!                                           └──────── orders-dead-letter ◄─────┘
//! ```
//!
//! - [`order_service`]: validates commands and publishes submitted orders
//! - [`inventory`]: checks availability and publishes approved/denied orders
//! - [`notification`]: records outcomes in idempotent sets
//! - [`poison`]: dead-letters or drops undecodable messages
//! - [`pipeline`]: starts and stops everything
//!
//! ## Example
//!
//! ```
//! use order_pipeline_core::channel::MessageBus;
//! use order_pipeline_core::command::PlaceOrder;
//! use order_pipeline_core::environment::SystemClock;
//! use order_pipeline_testing::InMemoryBus;
//! use order_validation::config::PipelineConfig;
//! use order_validation::inventory::TracePrefixChecker;
//! use order_validation::pipeline::Pipeline;
//! use std::sync::Arc;
//!
//! # tokio_test::block_on(async {
//! let bus: Arc<dyn MessageBus> = Arc::new(InMemoryBus::new());
//! let pipeline = Pipeline::start(
//!     &PipelineConfig::default(),
//!     bus,
//!     Arc::new(TracePrefixChecker::default()),
//!     Arc::new(SystemClock),
//! )
//! .await
//! .unwrap();
//!
//! pipeline
//!     .orders()
//!     .submit_order(&PlaceOrder::new("O1", "C1", "P1", 5, "X-abc"))
//!     .await
//!     .unwrap();
//!
//! let notifications = pipeline.notifications();
//! while !notifications.is_approved("O1") {
//!     tokio::time::sleep(std::time::Duration::from_millis(5)).await;
//! }
//! pipeline.shutdown().await;
//! # });
//! ```

pub mod config;
pub mod consumer;
pub mod error;
pub mod inventory;
pub mod notification;
pub mod order_service;
pub mod pipeline;
pub mod poison;

pub use config::{BrokerKind, ConfigError, PipelineConfig};
pub use error::StageError;
pub use inventory::{AvailabilityChecker, InventoryService, TracePrefixChecker};
pub use notification::{NotificationService, Tracked};
pub use order_service::OrderService;
pub use pipeline::Pipeline;
pub use poison::{PoisonHandler, PoisonPolicy};
