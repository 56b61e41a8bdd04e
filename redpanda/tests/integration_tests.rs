//! Integration tests for [`RedpandaEventSource`] against a real broker.
//!
//! Ignored by default: they need Docker and take a while to start Kafka.
//!
//! ```bash
//! cargo test -p inventory-sync-redpanda --test integration_tests -- --ignored
//! ```

#![allow(clippy::expect_used, clippy::unwrap_used, clippy::panic)] // Test code can use unwrap/expect

use futures::StreamExt;
use inventory_sync_core::event_bus::{DeliveryStream, EventSource};
use inventory_sync_core::position::PositionKey;
use inventory_sync_redpanda::{RedpandaEventSource, RedpandaPublisher};
use inventory_sync_testing::builders;
use std::time::Duration;
use testcontainers::ImageExt;
use testcontainers::runners::AsyncRunner;
use testcontainers_modules::kafka::{KAFKA_PORT, Kafka};

async fn wait_for_kafka_ready(publisher: &RedpandaPublisher) {
    for attempt in 1..=60 {
        if publisher.publish("warmup", "warmup", b"{}").await.is_ok() {
            tokio::time::sleep(Duration::from_millis(500)).await;
            return;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(attempt != 60, "Kafka failed to become ready");
    }
}

async fn next_delivery(stream: &mut DeliveryStream) -> inventory_sync_core::event_bus::Delivery {
    tokio::time::timeout(Duration::from_secs(20), stream.next())
        .await
        .expect("Timeout waiting for delivery")
        .expect("Stream ended")
        .expect("Delivery error")
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn unacknowledged_delivery_is_redelivered_after_resubscribe() {
    let kafka = Kafka::default()
        .with_env_var("KAFKA_AUTO_CREATE_TOPICS_ENABLE", "true")
        .start()
        .await
        .expect("Failed to start Kafka container");
    let host = kafka.get_host().await.expect("Failed to get host");
    let port = kafka
        .get_host_port_ipv4(KAFKA_PORT)
        .await
        .expect("Failed to get port");
    let brokers = format!("{host}:{port}");

    let publisher = RedpandaPublisher::new(&brokers, Duration::from_secs(5)).unwrap();
    wait_for_kafka_ready(&publisher).await;

    let key = PositionKey::new("store-1", "sku-1");
    for (id, qty) in [("E1", 5), ("E2", 6), ("E3", 7)] {
        let payload = builders::payload(&builders::receipt(id, &key, qty));
        publisher
            .publish("inventory-events", &key.to_string(), &payload)
            .await
            .expect("Failed to publish");
    }

    let source = RedpandaEventSource::builder()
        .brokers(&brokers)
        .consumer_group("redelivery-test")
        .build()
        .unwrap();

    let mut stream = source.subscribe(&["inventory-events"]).await.unwrap();
    let first = next_delivery(&mut stream).await;
    assert_eq!(first.key.as_deref(), Some("store-1/sku-1"));
    first.ack();
    // Give the async commit a moment before failing the next delivery.
    tokio::time::sleep(Duration::from_secs(1)).await;
    drop(next_delivery(&mut stream).await);

    // The dropped delivery closes the subscription.
    tokio::time::timeout(Duration::from_secs(20), async {
        while stream.next().await.is_some() {}
    })
    .await
    .expect("Subscription should close after a dropped delivery");
    drop(stream);

    let mut again = source.subscribe(&["inventory-events"]).await.unwrap();
    let redelivered = next_delivery(&mut again).await;
    let raw = inventory_sync_core::event::RawInventoryEvent::from_json(&redelivered.payload).unwrap();
    assert_eq!(raw.event_id.as_deref(), Some("E2"));
    redelivered.ack();
}
