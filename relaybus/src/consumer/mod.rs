//! Push and pull consumers driving registered handlers.

pub mod batch;
pub mod single;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{info, warn};
use parking_lot::{Mutex, RwLock};
use relaybus_broker::{BrokerChannel, BrokerConnection, ConnectionLeaseProvider};
use serde_json::Value;

use crate::errors::{BusResult, HandlerFault};
use crate::handler::EventPayload;
use crate::idempotency::{IdempotencyCache, IdempotencyGuard};
use crate::resilience::{ConnectivityRetry, HandlerPolicy, HandlerPolicyConfig};
use crate::topology::{declare_consumer_topology, Exchange};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Idle,
    /// Exchange, queue, binding and prefetch are in place.
    Declared,
    Consuming,
    /// The broker ended the consumer. Not restarted.
    Cancelled,
    /// Shut down by its owner.
    Stopped,
}

/// Hooks around delivery settlement. Both are optional; the defaults ack
/// silently and requeue failures.
#[async_trait]
pub trait DeliveryObserver: Send + Sync + 'static {
    async fn on_ack(&self, _message_ids: &[String], _queue: &str) {}

    /// Decide whether failed deliveries go back on the queue.
    async fn on_nack(
        &self,
        _message_ids: &[String],
        _queue: &str,
        _fault: Option<&HandlerFault>,
        _payloads: &[Value],
    ) -> bool {
        true
    }
}

/// Observer shared by every consumer of a bus; swapped by `subscribe`.
pub(crate) type ObserverSlot = Arc<RwLock<Option<Arc<dyn DeliveryObserver>>>>;

/// Everything a consumer needs to set itself up.
pub(crate) struct ConsumerSetup {
    pub lease: Arc<dyn ConnectionLeaseProvider>,
    pub exchange: Exchange,
    pub queue: String,
    pub route_key: String,
    pub prefetch: u16,
    pub retry: ConnectivityRetry,
    pub policy: HandlerPolicyConfig,
    pub cache: Arc<dyn IdempotencyCache>,
    pub idempotency_window: Duration,
    pub observer: ObserverSlot,
}

/// Per-registration state shared by the consumer loop.
pub(crate) struct ConsumerContext {
    pub queue: String,
    pub connection: Arc<dyn BrokerConnection>,
    pub channel: Arc<dyn BrokerChannel>,
    pub policy: HandlerPolicy,
    pub idempotency: IdempotencyGuard,
    pub observer: ObserverSlot,
    pub state: Arc<Mutex<ConsumerState>>,
}

impl ConsumerContext {
    /// Lease a connection, open a channel and declare the topology.
    pub async fn establish(setup: ConsumerSetup) -> BusResult<Self> {
        let state = Arc::new(Mutex::new(ConsumerState::Idle));
        let connection = setup.lease.lease().await?;
        if !connection.is_connected() {
            connection.reconnect().await?;
        }
        let channel = {
            let connection = connection.as_ref();
            setup
                .retry
                .run("channel open", || connection.open_channel())
                .await?
        };

        declare_consumer_topology(
            channel.as_ref(),
            &setup.exchange,
            &setup.queue,
            &setup.route_key,
            setup.prefetch,
        )
        .await?;
        *state.lock() = ConsumerState::Declared;

        Ok(Self {
            policy: HandlerPolicy::new(setup.queue.clone(), setup.policy),
            idempotency: IdempotencyGuard::new(setup.cache, setup.queue.clone(), setup.idempotency_window),
            queue: setup.queue,
            connection,
            channel,
            observer: setup.observer,
            state,
        })
    }

    pub fn set_state(&self, state: ConsumerState) {
        *self.state.lock() = state;
    }

    /// Reconnect before settling if the transport dropped.
    pub async fn ensure_connected(&self) {
        if self.connection.is_connected() {
            return;
        }
        info!("Connection for {} is down, reconnecting", self.queue);
        if let Err(err) = self.connection.reconnect().await {
            warn!("Reconnect for {} failed: {err}", self.queue);
        }
    }

    fn observer(&self) -> Option<Arc<dyn DeliveryObserver>> {
        self.observer.read().clone()
    }

    pub async fn notify_acked(&self, message_ids: &[String]) {
        if let Some(observer) = self.observer() {
            observer.on_ack(message_ids, &self.queue).await;
        }
    }

    /// Requeue decision for failed deliveries; `true` without an observer.
    pub async fn requeue_decision(
        &self,
        message_ids: &[String],
        fault: Option<&HandlerFault>,
        payloads: &[Value],
    ) -> bool {
        match self.observer() {
            Some(observer) => observer.on_nack(message_ids, &self.queue, fault, payloads).await,
            None => true,
        }
    }
}

/// Decode a body as JSON. The raw value is kept for observers even when it
/// does not fit `T`; bodies that are not JSON at all yield `Value::Null`.
pub(crate) fn decode<T: EventPayload>(body: &[u8]) -> (Value, Result<T, HandlerFault>) {
    match serde_json::from_slice::<Value>(body) {
        Ok(value) => {
            let decoded = serde_json::from_value::<T>(value.clone()).map_err(HandlerFault::from);
            (value, decoded)
        }
        Err(err) => (Value::Null, Err(HandlerFault::from(err))),
    }
}
