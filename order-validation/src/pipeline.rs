//! Pipeline wiring and lifecycle.
//!
//! [`Pipeline::start`] is the one place where the stages meet their
//! collaborators:
//!
//! 1. Bind the logical channels to topics on the bus
//! 2. Open `orders-in` and `checked-in`
//! 3. Spawn the check and tracking consumers
//!
//! [`Pipeline::shutdown`] broadcasts the stop signal and waits for both
//! consumers to exit.

use crate::config::PipelineConfig;
use crate::consumer::StageConsumer;
use crate::error::StageError;
use crate::inventory::{AvailabilityChecker, InventoryService};
use crate::notification::{CheckedOrderHandler, NotificationService};
use crate::order_service::OrderService;
use crate::poison::PoisonHandler;
use order_pipeline_core::channel::{MessageBus, names};
use order_pipeline_core::environment::Clock;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// A running pipeline.
pub struct Pipeline {
    orders: OrderService,
    notifications: Arc<NotificationService>,
    shutdown_tx: broadcast::Sender<()>,
    consumers: Vec<(String, JoinHandle<()>)>,
}

impl Pipeline {
    /// How long [`Pipeline::shutdown`] waits for each consumer.
    pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

    /// Wire the stages onto `bus` and start consuming.
    ///
    /// # Errors
    ///
    /// Returns [`StageError::Channel`] if a channel is unbound or cannot be
    /// opened.
    pub async fn start(
        config: &PipelineConfig,
        bus: Arc<dyn MessageBus>,
        checker: Arc<dyn AvailabilityChecker>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, StageError> {
        let bindings = config.bindings();
        let (shutdown_tx, _) = broadcast::channel(1);

        let orders = OrderService::new(bindings.outgoing(names::ORDERS_OUT, &bus)?, Arc::clone(&clock));
        let dead_letter = bindings.outgoing(names::DEAD_LETTER_OUT, &bus)?;

        let inventory = InventoryService::new(
            checker,
            bindings.outgoing(names::CHECKED_OUT, &bus)?,
            PoisonHandler::new(config.poison_policy, names::ORDERS_IN, dead_letter.clone())
                .with_max_attempts(config.dead_letter_max_attempts),
            clock,
        );
        let notifications = Arc::new(NotificationService::new());
        let tracker = CheckedOrderHandler::new(
            Arc::clone(&notifications),
            PoisonHandler::new(config.poison_policy, names::CHECKED_IN, dead_letter)
                .with_max_attempts(config.dead_letter_max_attempts),
        );

        let orders_in = bindings.incoming(names::ORDERS_IN, &bus)?;
        let checked_in = bindings.incoming(names::CHECKED_IN, &bus)?;
        let orders_stream = orders_in.open().await?;
        let checked_stream = checked_in.open().await?;

        let consumers = vec![
            StageConsumer::new("inventory", orders_in, Arc::new(inventory), shutdown_tx.subscribe())
                .with_retry_delay(config.retry_delay),
            StageConsumer::new("notification", checked_in, Arc::new(tracker), shutdown_tx.subscribe())
                .with_retry_delay(config.retry_delay),
        ];
        let consumers = consumers
            .into_iter()
            .zip([orders_stream, checked_stream])
            .map(|(consumer, stream)| (consumer.name().to_string(), consumer.spawn(stream)))
            .collect();

        info!(
            broker_kind = %config.broker,
            orders_topic = %config.topics.orders,
            checked_topic = %config.topics.checked,
            poison_policy = %config.poison_policy,
            "Pipeline started"
        );

        Ok(Self {
            orders,
            notifications,
            shutdown_tx,
            consumers,
        })
    }

    /// The submission stage.
    #[must_use]
    pub const fn orders(&self) -> &OrderService {
        &self.orders
    }

    /// The outcome sets, shared with the tracking consumer.
    #[must_use]
    pub fn notifications(&self) -> Arc<NotificationService> {
        Arc::clone(&self.notifications)
    }

    /// Stop both consumers and wait for them to exit.
    pub async fn shutdown(self) {
        info!("Initiating pipeline shutdown");
        // No receivers means every consumer already exited.
        let _ = self.shutdown_tx.send(());

        for (name, handle) in self.consumers {
            match tokio::time::timeout(Self::SHUTDOWN_TIMEOUT, handle).await {
                Ok(Ok(())) => info!(consumer = %name, "Consumer shut down cleanly"),
                Ok(Err(e)) => warn!(consumer = %name, error = %e, "Consumer task failed"),
                Err(_) => warn!(consumer = %name, "Consumer shutdown timed out"),
            }
        }
        info!("Pipeline stopped");
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("orders", &self.orders)
            .field("consumers", &self.consumers.iter().map(|(name, _)| name).collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}
