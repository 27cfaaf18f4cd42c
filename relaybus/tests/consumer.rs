mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::{bus_on, eventually, fast_options, Recorded};
use relaybus::resilience::CircuitBreakerConfig;
use relaybus::{
    BatchEventHandler, BusOptions, ConsumerState, DeliveryObserver, EventHandler, HandlerFault,
    HandlerRegistry,
};
use relaybus_broker::in_memory::InMemoryBroker;
use relaybus_broker::MessageProperties;
use relaybus_models::errors::{RuntimeError, SendableError};
use serde::Deserialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Deserialize, PartialEq)]
struct OrderPlaced {
    order: u32,
}

#[derive(Clone, Default)]
struct CountingHandler {
    seen: Recorded<u32>,
    result: bool,
}

impl CountingHandler {
    fn accepting() -> Self {
        Self {
            result: true,
            ..Self::default()
        }
    }
}

#[async_trait]
impl EventHandler<OrderPlaced> for CountingHandler {
    async fn handle(&self, event: OrderPlaced, _cancel: CancellationToken) -> Result<bool, SendableError> {
        self.seen.push(event.order);
        Ok(self.result)
    }
}

#[derive(Clone, Default)]
struct Settlements {
    acked: Recorded<String>,
    nacked: Recorded<(Vec<String>, bool, Vec<Value>)>,
    requeue: bool,
}

#[async_trait]
impl DeliveryObserver for Settlements {
    async fn on_ack(&self, message_ids: &[String], _queue: &str) {
        self.acked.extend(message_ids.iter().cloned());
    }

    async fn on_nack(
        &self,
        message_ids: &[String],
        _queue: &str,
        fault: Option<&HandlerFault>,
        payloads: &[Value],
    ) -> bool {
        self.nacked
            .push((message_ids.to_vec(), fault.is_some(), payloads.to_vec()));
        self.requeue
    }
}

fn order(queue: &str, broker: &InMemoryBroker, id: Option<&str>, number: u32) {
    let properties = match id {
        Some(id) => MessageProperties::persistent(id),
        None => MessageProperties::default(),
    };
    broker
        .enqueue(queue, properties, format!(r#"{{"order":{number}}}"#))
        .unwrap();
}

#[tokio::test]
async fn duplicate_delivery_is_acked_without_handling() {
    let broker = InMemoryBroker::new();
    let bus = bus_on(&broker, fast_options());
    let handler = CountingHandler::accepting();
    bus.register::<OrderPlaced, _>("orders", "order.placed", handler.clone())
        .await
        .unwrap();

    order("orders", &broker, Some("m1"), 1);
    order("orders", &broker, Some("m1"), 1);

    eventually(|| broker.queue_len("orders") == 0 && broker.unacked_count() == 0).await;
    assert_eq!(handler.seen.snapshot(), vec![1]);
    bus.shutdown().await;
}

#[tokio::test]
async fn zero_window_handles_every_delivery() {
    let broker = InMemoryBroker::new();
    let bus = bus_on(
        &broker,
        BusOptions {
            idempotency_window: Duration::ZERO,
            ..fast_options()
        },
    );
    let handler = CountingHandler::accepting();
    bus.register::<OrderPlaced, _>("orders", "order.placed", handler.clone())
        .await
        .unwrap();

    order("orders", &broker, Some("m1"), 1);
    order("orders", &broker, Some("m1"), 1);

    eventually(|| handler.seen.len() == 2).await;
    bus.shutdown().await;
}

#[tokio::test]
async fn delivery_without_id_is_discarded() {
    let broker = InMemoryBroker::new();
    let bus = bus_on(&broker, fast_options());
    let handler = CountingHandler::accepting();
    bus.register::<OrderPlaced, _>("orders", "order.placed", handler.clone())
        .await
        .unwrap();

    order("orders", &broker, None, 9);
    order("orders", &broker, Some("m2"), 2);

    eventually(|| handler.seen.len() == 1 && broker.unacked_count() == 0).await;
    assert_eq!(handler.seen.snapshot(), vec![2]);
    assert_eq!(broker.queue_len("orders"), 0);
    bus.shutdown().await;
}

#[tokio::test]
async fn observers_see_acks_and_decide_requeue() {
    let broker = InMemoryBroker::new();
    let bus = bus_on(&broker, fast_options());
    let settlements = Settlements::default();
    bus.subscribe(Arc::new(settlements.clone()));

    let handler = CountingHandler::default();
    bus.register::<OrderPlaced, _>("orders", "order.placed", handler.clone())
        .await
        .unwrap();
    order("orders", &broker, Some("declined"), 3);

    eventually(|| settlements.nacked.len() == 1 && broker.unacked_count() == 0).await;
    let (ids, faulted, payloads) = settlements.nacked.snapshot().remove(0);
    assert_eq!(ids, vec!["declined"]);
    assert!(!faulted);
    assert_eq!(payloads[0]["order"], 3);
    // observer said no requeue
    assert_eq!(broker.queue_len("orders"), 0);
    assert_eq!(handler.seen.len(), 1);
    assert!(settlements.acked.snapshot().is_empty());
    bus.shutdown().await;
}

#[tokio::test]
async fn undecodable_payload_is_reported_as_a_fault() {
    let broker = InMemoryBroker::new();
    let bus = bus_on(&broker, fast_options());
    let settlements = Settlements::default();
    bus.subscribe(Arc::new(settlements.clone()));
    let handler = CountingHandler::accepting();
    bus.register::<OrderPlaced, _>("orders", "order.placed", handler.clone())
        .await
        .unwrap();

    broker
        .enqueue("orders", MessageProperties::persistent("junk"), b"not json".to_vec())
        .unwrap();

    eventually(|| settlements.nacked.len() == 1).await;
    let (_, faulted, payloads) = settlements.nacked.snapshot().remove(0);
    assert!(faulted);
    assert_eq!(payloads, vec![Value::Null]);
    assert!(handler.seen.snapshot().is_empty());
    bus.shutdown().await;
}

#[tokio::test]
async fn published_events_reach_registered_handlers() {
    let broker = InMemoryBroker::new();
    let bus = bus_on(&broker, fast_options());
    let handler = CountingHandler::accepting();
    let settlements = Settlements::default();
    bus.subscribe(Arc::new(settlements.clone()));
    bus.start(HandlerRegistry::new().single::<OrderPlaced, _>("orders", "order.*", handler.clone()))
        .await
        .unwrap();

    let records = vec![
        relaybus_models::core::EventRecord::new(1, "e1", r#"{"order":1}"#, "order.placed"),
        relaybus_models::core::EventRecord::new(2, "e2", r#"{"order":2}"#, "order.placed"),
    ];
    assert!(bus.publish_confirmed(&records, &Default::default()).await);

    eventually(|| handler.seen.len() == 2).await;
    eventually(|| settlements.acked.len() == 2).await;
    assert_eq!(bus.subscriptions().state_of("orders"), Some(ConsumerState::Consuming));
    bus.shutdown().await;
    assert_eq!(bus.subscriptions().state_of("orders"), Some(ConsumerState::Stopped));
}

#[tokio::test]
async fn broker_cancellation_is_terminal() {
    let broker = InMemoryBroker::new();
    let bus = bus_on(&broker, fast_options());
    bus.register::<OrderPlaced, _>("orders", "order.placed", CountingHandler::accepting())
        .await
        .unwrap();

    broker.cancel_consumer("orders");

    eventually(|| bus.subscriptions().state_of("orders") == Some(ConsumerState::Cancelled)).await;
    bus.shutdown().await;
    assert_eq!(bus.subscriptions().state_of("orders"), Some(ConsumerState::Cancelled));
}

#[tokio::test]
async fn open_circuit_rejects_without_calling_the_handler() {
    let broker = InMemoryBroker::new();
    let mut options = fast_options();
    options.handler_policy.max_retries = 0;
    options.handler_policy.circuit = CircuitBreakerConfig {
        minimum_throughput: 2,
        ..CircuitBreakerConfig::default()
    };
    let bus = bus_on(&broker, options);
    let settlements = Settlements::default();
    bus.subscribe(Arc::new(settlements.clone()));
    // declines count as breaker failures
    let handler = CountingHandler::default();
    bus.register::<OrderPlaced, _>("orders", "order.placed", handler.clone())
        .await
        .unwrap();

    order("orders", &broker, Some("m1"), 1);
    order("orders", &broker, Some("m2"), 2);
    eventually(|| settlements.nacked.len() == 2).await;

    order("orders", &broker, Some("m3"), 3);
    eventually(|| settlements.nacked.len() == 3 && broker.unacked_count() == 0).await;

    assert_eq!(handler.seen.snapshot(), vec![1, 2]);
    let (ids, faulted, payloads) = settlements.nacked.snapshot().remove(2);
    assert_eq!(ids, vec!["m3"]);
    assert!(faulted);
    assert_eq!(payloads[0]["order"], 3);
    assert_eq!(broker.queue_len("orders"), 0);
    bus.shutdown().await;
}

#[derive(Clone, Default)]
struct BatchRecorder {
    batches: Recorded<Vec<u32>>,
    failures_left: Arc<AtomicUsize>,
}

#[async_trait]
impl BatchEventHandler<OrderPlaced> for BatchRecorder {
    async fn handle(&self, events: Vec<OrderPlaced>, _cancel: CancellationToken) -> Result<bool, SendableError> {
        self.batches
            .push(events.iter().map(|event| event.order).collect());
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failing {
            return Err(RuntimeError::new("batch", "downstream unavailable").boxed());
        }
        Ok(true)
    }
}

#[tokio::test]
async fn batch_consumer_acks_the_pool_and_discards_unusable_items() {
    let broker = InMemoryBroker::new();
    let bus = bus_on(&broker, fast_options());
    let settlements = Settlements::default();
    bus.subscribe(Arc::new(settlements.clone()));
    let handler = BatchRecorder::default();

    // registering declares the queue
    bus.register_batch::<OrderPlaced, _>("billing", "order.#", 10, handler.clone())
        .await
        .unwrap();
    order("billing", &broker, Some("a"), 1);
    order("billing", &broker, None, 2);
    order("billing", &broker, Some("a"), 3);
    order("billing", &broker, Some("b"), 4);

    eventually(|| {
        broker.queue_len("billing") == 0
            && broker.unacked_count() == 0
            && settlements.acked.len() == 2
    })
    .await;

    let batches = handler.batches.snapshot();
    let handled: Vec<u32> = batches.into_iter().flatten().collect();
    assert!(handled.contains(&1) && handled.contains(&4));
    assert!(!handled.contains(&2));
    let mut acked = settlements.acked.snapshot();
    acked.sort();
    assert_eq!(acked, vec!["a", "b"]);
    assert_eq!(broker.open_channel_prefetches(), vec![10]);
    bus.shutdown().await;
}

#[tokio::test]
async fn failed_batch_is_requeued_and_retried_next_iteration() {
    let broker = InMemoryBroker::new();
    let mut options = fast_options();
    options.handler_policy.max_retries = 0;
    let bus = bus_on(&broker, options);
    let settlements = Settlements {
        requeue: true,
        ..Settlements::default()
    };
    bus.subscribe(Arc::new(settlements.clone()));
    let handler = BatchRecorder {
        failures_left: Arc::new(AtomicUsize::new(1)),
        ..BatchRecorder::default()
    };
    bus.register_batch::<OrderPlaced, _>("billing", "order.#", 0, handler.clone())
        .await
        .unwrap();

    order("billing", &broker, Some("x"), 7);

    eventually(|| settlements.acked.len() == 1).await;
    let (ids, faulted, _) = settlements.nacked.snapshot().remove(0);
    assert_eq!(ids, vec!["x"]);
    assert!(faulted);
    assert_eq!(handler.batches.snapshot(), vec![vec![7], vec![7]]);
    assert_eq!(broker.unacked_count(), 0);
    bus.shutdown().await;
    assert_eq!(bus.subscriptions().state_of("billing"), Some(ConsumerState::Stopped));
}

#[tokio::test]
async fn batch_cumulative_ack_covers_the_fetched_tags() {
    let broker = InMemoryBroker::new();
    let bus = bus_on(&broker, fast_options());
    let handler = BatchRecorder::default();
    bus.register_batch::<OrderPlaced, _>("billing", "order.#", 3, handler.clone())
        .await
        .unwrap();

    for i in 0..5 {
        order("billing", &broker, Some(&format!("m{i}")), i);
    }

    eventually(|| broker.queue_len("billing") == 0 && broker.unacked_count() == 0).await;
    let batches = handler.batches.snapshot();
    assert!(batches.iter().all(|batch| batch.len() <= 3));
    let handled: Vec<u32> = batches.into_iter().flatten().collect();
    assert_eq!(handled.len(), 5);
    bus.shutdown().await;
}

#[tokio::test]
async fn fetch_fault_requeues_what_the_iteration_already_pulled() {
    let broker = InMemoryBroker::new();
    let bus = bus_on(&broker, fast_options());
    let settlements = Settlements::default();
    bus.subscribe(Arc::new(settlements.clone()));
    let handler = BatchRecorder::default();
    bus.register_batch::<OrderPlaced, _>("billing", "order.#", 10, handler.clone())
        .await
        .unwrap();

    // no await until the fault is armed, so one iteration sees all three
    order("billing", &broker, Some("a"), 1);
    order("billing", &broker, Some("b"), 2);
    order("billing", &broker, Some("c"), 3);
    broker.fail_get_after(1);

    eventually(|| settlements.acked.len() == 3 && broker.unacked_count() == 0).await;

    let mut handled: Vec<u32> = handler.batches.snapshot().into_iter().flatten().collect();
    handled.sort();
    assert_eq!(handled, vec![1, 2, 3]);
    let mut acked = settlements.acked.snapshot();
    acked.sort();
    assert_eq!(acked, vec!["a", "b", "c"]);
    assert_eq!(broker.queue_len("billing"), 0);
    bus.shutdown().await;
}
