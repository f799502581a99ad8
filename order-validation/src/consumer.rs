//! Generic stage consumer with reopen-on-end and graceful shutdown.
//!
//! Each consuming stage implements [`DeliveryHandler`]; a [`StageConsumer`]
//! owns the loop around it:
//!
//! ```text
//! loop {
//!     next delivery ─┬─ Ok       → handler (errors logged, loop continues;
//!                    │             retriable errors pause for the retry delay)
//!                    ├─ Err      → transport error logged at warn
//!                    └─ end      → reopen the channel after the retry delay
//!     shutdown signal → drop the stream and exit
//! }
//! ```
//!
//! A handler always runs to completion once it has a delivery: the shutdown
//! signal is only observed between deliveries. Deliveries buffered but not yet
//! handed out are dropped with the stream and become redeliverable.

use crate::error::StageError;
use futures::StreamExt;
use order_pipeline_core::channel::{DeliveryStream, IncomingChannel};
use order_pipeline_core::message::Delivery;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

/// Processes one delivery, settling its acknowledgment.
pub trait DeliveryHandler: Send + Sync + 'static {
    /// Handle a delivery.
    ///
    /// # Errors
    ///
    /// Returns [`StageError`] when processing failed; the consumer logs it and
    /// moves on.
    fn handle(&self, delivery: Delivery) -> Pin<Box<dyn Future<Output = Result<(), StageError>> + Send + '_>>;
}

enum StreamEnd {
    Shutdown,
    Exhausted,
}

/// Background consumer for one incoming channel.
pub struct StageConsumer {
    name: String,
    channel: IncomingChannel,
    handler: Arc<dyn DeliveryHandler>,
    shutdown: broadcast::Receiver<()>,
    retry_delay: Duration,
}

impl StageConsumer {
    /// Default delay before reopening an ended stream or taking the next
    /// delivery after a retriable failure.
    pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);

    /// Create a consumer.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        channel: IncomingChannel,
        handler: Arc<dyn DeliveryHandler>,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            name: name.into(),
            channel,
            handler,
            shutdown,
            retry_delay: Self::DEFAULT_RETRY_DELAY,
        }
    }

    /// Set the delay before reopening an ended stream or retrying after a
    /// retriable failure.
    #[must_use]
    pub const fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    /// Consumer name used in logs.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Spawn the consumer on an already opened stream.
    #[must_use]
    pub fn spawn(mut self, stream: DeliveryStream) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            self.run(stream).await;
        })
    }

    async fn run(&mut self, mut stream: DeliveryStream) {
        info!(consumer = %self.name, channel = %self.channel.name(), "Stage consumer started");

        loop {
            if matches!(self.process_stream(&mut stream).await, StreamEnd::Shutdown) {
                break;
            }

            warn!(
                consumer = %self.name,
                "Delivery stream ended, reopening in {:?}", self.retry_delay
            );
            if self.pause().await {
                break;
            }

            match self.channel.open().await {
                Ok(reopened) => stream = reopened,
                Err(e) => {
                    error!(consumer = %self.name, error = %e, "Failed to reopen channel");
                    stream = futures::stream::empty().boxed();
                },
            }
        }

        info!(consumer = %self.name, "Stage consumer stopped");
    }

    /// Sleep for the retry delay. Returns `true` if shutdown arrived first.
    async fn pause(&mut self) -> bool {
        tokio::select! {
            _ = self.shutdown.recv() => true,
            () = tokio::time::sleep(self.retry_delay) => false,
        }
    }

    async fn process_stream(&mut self, stream: &mut DeliveryStream) -> StreamEnd {
        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    info!(consumer = %self.name, "Stage consumer received shutdown signal");
                    return StreamEnd::Shutdown;
                }
                next = stream.next() => match next {
                    Some(Ok(delivery)) => {
                        if let Err(e) = self.handler.handle(delivery).await {
                            error!(consumer = %self.name, error = %e, "Failed to handle delivery");
                            if e.is_retriable() && self.pause().await {
                                return StreamEnd::Shutdown;
                            }
                        }
                    },
                    Some(Err(e)) => {
                        warn!(consumer = %self.name, error = %e, "Error receiving delivery");
                    },
                    None => return StreamEnd::Exhausted,
                },
            }
        }
    }
}

impl std::fmt::Debug for StageConsumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageConsumer")
            .field("name", &self.name)
            .field("channel", &self.channel)
            .field("retry_delay", &self.retry_delay)
            .finish_non_exhaustive()
    }
}
