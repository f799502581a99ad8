//! Order validation pipeline demo.
//!
//! Starts the pipeline, submits two orders (one available, one not), waits for
//! their outcomes and shuts down.
//!
//! # Usage
//!
//! In-process broker:
//! ```bash
//! cargo run --bin order-validation
//! ```
//!
//! Redpanda:
//! ```bash
//! PIPELINE_BROKER=redpanda REDPANDA_BROKERS=localhost:9092 \
//!   cargo run --bin order-validation --features redpanda
//! ```
//!
//! Logging honours `RUST_LOG` (default `info`).

use anyhow::Context;
use order_pipeline_core::channel::MessageBus;
use order_pipeline_core::command::PlaceOrder;
use order_pipeline_core::environment::SystemClock;
use order_pipeline_testing::InMemoryBus;
use order_validation::config::{BrokerKind, PipelineConfig};
use order_validation::pipeline::Pipeline;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const OUTCOME_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = PipelineConfig::from_env().context("invalid pipeline configuration")?;
    info!(broker_kind = %config.broker, "=== Order Validation Pipeline ===");

    let bus = build_bus(&config)?;
    let pipeline = Pipeline::start(&config, bus, Arc::new(config.checker()), Arc::new(SystemClock))
        .await
        .context("failed to start pipeline")?;

    let orders = [
        PlaceOrder::new("O1", "C1", "P1", 5, format!("{}abc", config.available_marker)),
        PlaceOrder::new("O2", "C2", "P2", 3, "Y-abc"),
    ];
    for command in &orders {
        pipeline
            .orders()
            .submit_order(command)
            .await
            .with_context(|| format!("failed to submit order {}", command.order_id))?;
    }

    let notifications = pipeline.notifications();
    let settled = || {
        orders
            .iter()
            .all(|o| notifications.is_approved(&o.order_id) || notifications.is_denied(&o.order_id))
    };

    let deadline = tokio::time::Instant::now() + OUTCOME_TIMEOUT;
    loop {
        if settled() {
            break;
        }
        tokio::select! {
            () = tokio::time::sleep(Duration::from_millis(50)) => {},
            _ = tokio::signal::ctrl_c() => {
                warn!("Interrupted before all outcomes arrived");
                break;
            }
        }
        if tokio::time::Instant::now() >= deadline {
            warn!(timeout = ?OUTCOME_TIMEOUT, "Timed out waiting for outcomes");
            break;
        }
    }

    for command in &orders {
        let outcome = if notifications.is_approved(&command.order_id) {
            "approved"
        } else if notifications.is_denied(&command.order_id) {
            "denied"
        } else {
            "pending"
        };
        info!(order_id = %command.order_id, trace_id = %command.trace_id, outcome, "Order outcome");
    }
    for order_id in notifications.conflicts() {
        warn!(order_id = %order_id, "Conflicting outcomes");
    }

    pipeline.shutdown().await;
    Ok(())
}

fn build_bus(config: &PipelineConfig) -> anyhow::Result<Arc<dyn MessageBus>> {
    match config.broker {
        BrokerKind::Memory => {
            info!("Using in-memory broker");
            Ok(Arc::new(InMemoryBus::new()))
        },
        BrokerKind::Redpanda => redpanda_bus(config),
    }
}

#[cfg(feature = "redpanda")]
fn redpanda_bus(config: &PipelineConfig) -> anyhow::Result<Arc<dyn MessageBus>> {
    let brokers = config.brokers.as_deref().context("REDPANDA_BROKERS is not set")?;
    info!(brokers, "Using Redpanda broker");
    let bus = order_pipeline_redpanda::RedpandaBus::builder()
        .brokers(brokers)
        .consumer_group(&config.consumer_group)
        .build()
        .context("failed to create Redpanda bus")?;
    Ok(Arc::new(bus))
}

#[cfg(not(feature = "redpanda"))]
fn redpanda_bus(_config: &PipelineConfig) -> anyhow::Result<Arc<dyn MessageBus>> {
    anyhow::bail!("this binary was built without Redpanda support; rebuild with --features redpanda")
}
