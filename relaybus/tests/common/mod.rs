#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use relaybus::{BusOptions, EventBus, InMemoryIdempotencyCache};
use relaybus_broker::in_memory::InMemoryBroker;
use relaybus_broker::{ConnectionLeaseProvider, Delivery, QueueOptions};

pub fn bus_on(broker: &InMemoryBroker, options: BusOptions) -> EventBus {
    EventBus::new(
        Arc::new(broker.clone()),
        Arc::new(broker.clone()),
        Arc::new(InMemoryIdempotencyCache::new()),
        options,
    )
}

pub fn fast_options() -> BusOptions {
    BusOptions {
        poll_interval: Duration::from_millis(10),
        ..BusOptions::default()
    }
}

/// Declare `queue` and bind it to the default topic exchange.
pub async fn bind_queue(broker: &InMemoryBroker, queue: &str, route_key: &str) {
    let connection = broker.lease().await.unwrap();
    let channel = connection.open_channel().await.unwrap();
    channel
        .declare_queue(queue, QueueOptions::default(), Default::default())
        .await
        .unwrap();
    channel.bind_queue(queue, "amq.topic", route_key).await.unwrap();
    channel.close().await.unwrap();
}

/// Pull everything waiting on `queue`, acking as we go.
pub async fn drain(broker: &InMemoryBroker, queue: &str) -> Vec<Delivery> {
    let connection = broker.lease().await.unwrap();
    let channel = connection.open_channel().await.unwrap();
    let mut deliveries = Vec::new();
    while let Some(delivery) = channel.get(queue).await.unwrap() {
        channel.ack(delivery.delivery_tag, false).await.unwrap();
        deliveries.push(delivery);
    }
    channel.close().await.unwrap();
    deliveries
}

/// Poll `condition` until it holds or five seconds pass.
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met within 5s"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Thread-safe list used by test handlers and observers.
pub struct Recorded<T>(pub Arc<Mutex<Vec<T>>>);

impl<T> Default for Recorded<T> {
    fn default() -> Self {
        Self(Arc::new(Mutex::new(Vec::new())))
    }
}

impl<T> Clone for Recorded<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<T: Clone> Recorded<T> {
    pub fn push(&self, value: T) {
        self.0.lock().push(value);
    }

    pub fn extend(&self, values: impl IntoIterator<Item = T>) {
        self.0.lock().extend(values);
    }

    pub fn snapshot(&self) -> Vec<T> {
        self.0.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.0.lock().len()
    }
}
