//! End-to-end pipeline runs over the in-memory bus.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use order_pipeline_core::channel::{ChannelBindings, MessageBus};
use order_pipeline_core::command::PlaceOrder;
use order_pipeline_core::event::{Event, OrderChecked, OrderSubmitted};
use order_pipeline_core::message::{Message, Metadata, TRACE_ID_KEY};
use order_pipeline_testing::helpers::{eventually, init_tracing};
use order_pipeline_testing::{InMemoryBus, fixtures, test_clock};
use order_validation::config::PipelineConfig;
use order_validation::inventory::TracePrefixChecker;
use order_validation::pipeline::Pipeline;
use order_validation::poison::{DEAD_LETTER_SOURCE_KEY, PoisonPolicy};
use std::sync::Arc;
use std::time::Duration;

const SETTLE: Duration = Duration::from_secs(5);

async fn start(bus: &InMemoryBus, config: &PipelineConfig) -> Pipeline {
    init_tracing();
    let dyn_bus: Arc<dyn MessageBus> = Arc::new(bus.clone());
    Pipeline::start(config, dyn_bus, Arc::new(config.checker()), Arc::new(test_clock()))
        .await
        .unwrap()
}

#[tokio::test]
async fn available_order_is_approved_end_to_end() {
    let bus = InMemoryBus::new();
    let pipeline = start(&bus, &PipelineConfig::default()).await;

    pipeline
        .orders()
        .submit_order(&PlaceOrder::new("O1", "C1", "P1", 5, "X-abc"))
        .await
        .unwrap();

    let notifications = pipeline.notifications();
    assert!(eventually(SETTLE, || notifications.is_approved("O1")).await);
    assert!(!notifications.is_denied("O1"));

    let checked = bus.published_events(ChannelBindings::CHECKED_TOPIC);
    assert_eq!(checked.len(), 1);
    let Event::OrderApproved(approved) = &checked[0] else {
        panic!("expected approval, got {}", checked[0]);
    };
    assert_eq!(approved.order_id(), "O1");
    assert_eq!(approved.customer_id(), "C1");
    assert_eq!(approved.product_id(), "P1");
    assert_eq!(approved.quantity(), 5);

    pipeline.shutdown().await;
}

#[tokio::test]
async fn unavailable_order_is_denied_end_to_end() {
    let bus = InMemoryBus::new();
    let pipeline = start(&bus, &PipelineConfig::default()).await;

    pipeline
        .orders()
        .submit_order(&PlaceOrder::new("O1", "C1", "P1", 5, "Y-abc"))
        .await
        .unwrap();

    let notifications = pipeline.notifications();
    assert!(eventually(SETTLE, || notifications.is_denied("O1")).await);
    assert!(!notifications.is_approved("O1"));

    let checked = bus.published_events(ChannelBindings::CHECKED_TOPIC);
    assert_eq!(checked.len(), 1);
    assert!(matches!(checked[0], Event::OrderDenied(_)));

    pipeline.shutdown().await;
}

#[tokio::test]
async fn trace_id_follows_the_order_through_every_topic() {
    let bus = InMemoryBus::new();
    let pipeline = start(&bus, &PipelineConfig::default()).await;
    let command = fixtures::available_order("O7");

    pipeline.orders().submit_order(&command).await.unwrap();

    let notifications = pipeline.notifications();
    assert!(eventually(SETTLE, || notifications.is_approved("O7")).await);

    for topic in [ChannelBindings::ORDERS_TOPIC, ChannelBindings::CHECKED_TOPIC] {
        let published = bus.published(topic);
        assert_eq!(published.len(), 1, "topic {topic}");
        assert_eq!(published[0].metadata.get(TRACE_ID_KEY), Some(command.trace_id.as_str()));
        assert_eq!(published[0].key.as_deref(), Some("O7"));
    }

    pipeline.shutdown().await;
}

#[tokio::test]
async fn many_orders_settle_by_trace_prefix() {
    let bus = InMemoryBus::new();
    let pipeline = start(&bus, &PipelineConfig::default()).await;

    let commands: Vec<PlaceOrder> = (0..20)
        .map(|i| {
            let id = format!("O{i}");
            if i % 2 == 0 {
                fixtures::available_order(&id)
            } else {
                fixtures::unavailable_order(&id)
            }
        })
        .collect();
    for command in &commands {
        pipeline.orders().submit_order(command).await.unwrap();
    }

    let notifications = pipeline.notifications();
    assert!(
        eventually(SETTLE, || notifications.approved_count() + notifications.denied_count() == commands.len())
            .await
    );
    assert_eq!(notifications.approved_count(), 10);
    assert_eq!(notifications.denied_count(), 10);
    assert!(notifications.is_approved("O0"));
    assert!(notifications.is_denied("O1"));
    assert!(notifications.conflicts().is_empty());
    assert!(eventually(SETTLE, || bus.acknowledged(ChannelBindings::ORDERS_TOPIC) == commands.len()).await);

    pipeline.shutdown().await;
}

#[tokio::test]
async fn poison_message_does_not_stall_the_pipeline() {
    let bus = InMemoryBus::new();
    let pipeline = start(&bus, &PipelineConfig::default()).await;

    bus.publish(ChannelBindings::ORDERS_TOPIC, &Message::new(b"\x00\x01 not json".to_vec()))
        .await
        .unwrap();
    pipeline
        .orders()
        .submit_order(&PlaceOrder::new("O2", "C1", "P1", 1, "X-1"))
        .await
        .unwrap();

    let notifications = pipeline.notifications();
    assert!(eventually(SETTLE, || notifications.is_approved("O2")).await);

    let dead = bus.published(ChannelBindings::DEAD_LETTER_TOPIC);
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].payload, b"\x00\x01 not json");
    assert_eq!(dead[0].metadata.get(DEAD_LETTER_SOURCE_KEY), Some("orders-in"));

    pipeline.shutdown().await;
}

#[tokio::test]
async fn acknowledge_policy_drops_poison_without_dead_letter() {
    let bus = InMemoryBus::new();
    let config = PipelineConfig {
        poison_policy: PoisonPolicy::Acknowledge,
        ..PipelineConfig::default()
    };
    let pipeline = start(&bus, &config).await;

    bus.publish(ChannelBindings::CHECKED_TOPIC, &Message::new(b"garbage".to_vec()))
        .await
        .unwrap();
    pipeline
        .orders()
        .submit_order(&PlaceOrder::new("O3", "C1", "P1", 1, "Y-1"))
        .await
        .unwrap();

    let notifications = pipeline.notifications();
    assert!(eventually(SETTLE, || notifications.is_denied("O3")).await);
    assert!(bus.published(ChannelBindings::DEAD_LETTER_TOPIC).is_empty());
    assert!(eventually(SETTLE, || bus.acknowledged(ChannelBindings::CHECKED_TOPIC) == 2).await);

    pipeline.shutdown().await;
}

#[tokio::test]
async fn duplicate_checked_events_are_recorded_once() {
    let bus = InMemoryBus::new();
    let pipeline = start(&bus, &PipelineConfig::default()).await;

    pipeline
        .orders()
        .submit_order(&PlaceOrder::new("O1", "C1", "P1", 5, "X-abc"))
        .await
        .unwrap();
    let notifications = pipeline.notifications();
    assert!(eventually(SETTLE, || notifications.is_approved("O1")).await);

    // Replay the checked event as an at-least-once broker would.
    let replay = bus.published(ChannelBindings::CHECKED_TOPIC).remove(0);
    bus.publish(ChannelBindings::CHECKED_TOPIC, &replay).await.unwrap();

    assert!(eventually(SETTLE, || bus.acknowledged(ChannelBindings::CHECKED_TOPIC) == 2).await);
    assert_eq!(notifications.approved_count(), 1);
    assert!(notifications.conflicts().is_empty());

    pipeline.shutdown().await;
}

#[tokio::test]
async fn custom_topics_and_marker_are_honoured() {
    let bus = InMemoryBus::new();
    let config = PipelineConfig::from_lookup(|key| match key {
        "PIPELINE_TOPIC_ORDERS" => Some("o".to_string()),
        "PIPELINE_TOPIC_CHECKED" => Some("c".to_string()),
        "PIPELINE_AVAILABLE_MARKER" => Some("OK-".to_string()),
        _ => None,
    })
    .unwrap();
    let pipeline = start(&bus, &config).await;

    pipeline
        .orders()
        .submit_order(&PlaceOrder::new("O1", "C1", "P1", 5, "OK-1"))
        .await
        .unwrap();

    let notifications = pipeline.notifications();
    assert!(eventually(SETTLE, || notifications.is_approved("O1")).await);
    assert_eq!(bus.published("o").len(), 1);
    assert_eq!(bus.published("c").len(), 1);
    assert!(bus.published(ChannelBindings::ORDERS_TOPIC).is_empty());

    pipeline.shutdown().await;
}

#[tokio::test]
async fn shutdown_stops_consumers() {
    let bus = InMemoryBus::new();
    let pipeline = start(&bus, &PipelineConfig::default()).await;
    let notifications = pipeline.notifications();

    tokio::time::timeout(Duration::from_secs(5), pipeline.shutdown())
        .await
        .expect("shutdown should finish promptly");

    let clock = test_clock();
    let submitted = OrderSubmitted::from_command(&fixtures::available_order("late"), &clock);
    let late = Event::from(OrderChecked::from_submitted(&submitted, true, &clock));
    bus.publish(ChannelBindings::CHECKED_TOPIC, &Message::from_event(&late, Metadata::new()).unwrap())
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!notifications.is_approved("late"));
    assert_eq!(bus.pending(ChannelBindings::CHECKED_TOPIC), 1);
}

#[tokio::test]
async fn checker_override_is_used() {
    let bus = InMemoryBus::new();
    let dyn_bus: Arc<dyn MessageBus> = Arc::new(bus.clone());
    let pipeline = Pipeline::start(
        &PipelineConfig::default(),
        dyn_bus,
        Arc::new(TracePrefixChecker::new("Y-")),
        Arc::new(test_clock()),
    )
    .await
    .unwrap();

    pipeline
        .orders()
        .submit_order(&fixtures::unavailable_order("O9"))
        .await
        .unwrap();

    let notifications = pipeline.notifications();
    assert!(eventually(SETTLE, || notifications.is_approved("O9")).await);

    pipeline.shutdown().await;
}

#[tokio::test]
async fn failing_dead_letter_channel_does_not_stall_later_orders() {
    let bus = InMemoryBus::new();
    bus.set_publish_failure(ChannelBindings::DEAD_LETTER_TOPIC, true);
    let config = PipelineConfig {
        dead_letter_max_attempts: 3,
        retry_delay: Duration::from_millis(10),
        ..PipelineConfig::default()
    };
    let pipeline = start(&bus, &config).await;

    bus.publish(ChannelBindings::ORDERS_TOPIC, &Message::new(b"garbage".to_vec()))
        .await
        .unwrap();
    pipeline
        .orders()
        .submit_order(&PlaceOrder::new("O2", "C1", "P1", 1, "X-2"))
        .await
        .unwrap();

    let notifications = pipeline.notifications();
    assert!(eventually(SETTLE, || notifications.is_approved("O2")).await);
    assert_eq!(bus.nacked(ChannelBindings::ORDERS_TOPIC), 2);
    assert!(eventually(SETTLE, || bus.acknowledged(ChannelBindings::ORDERS_TOPIC) == 2).await);
    assert!(bus.published(ChannelBindings::DEAD_LETTER_TOPIC).is_empty());

    pipeline.shutdown().await;
}
