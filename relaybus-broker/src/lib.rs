pub mod in_memory;
mod errors;
mod types;

pub use errors::BrokerError;
pub use types::{
    ConfirmSignal, ConfirmStream, Delivery, DeliveryStream, DeliveryTag, ExchangeKind,
    FieldTable, FieldValue, MessageProperties, OutboundMessage, QueueOptions, ARG_DEAD_LETTER_EXCHANGE,
    ARG_DEAD_LETTER_ROUTING_KEY, ARG_EXPIRES, ARG_MESSAGE_TTL, DELIVERY_MODE_PERSISTENT,
};

use std::sync::Arc;

use async_trait::async_trait;

/// Hands out broker connections, typically from a balanced pool.
#[async_trait]
pub trait ConnectionLeaseProvider: Send + Sync + 'static {
    async fn lease(&self) -> Result<Arc<dyn BrokerConnection>, BrokerError>;
}

/// A reconnect-capable connection to the broker.
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    fn is_connected(&self) -> bool;

    /// Re-establish the underlying transport.
    async fn reconnect(&self) -> Result<(), BrokerError>;

    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>, BrokerError>;
}

/// Operations on a single broker channel.
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    async fn declare_exchange(
        &self,
        exchange: &str,
        kind: ExchangeKind,
        durable: bool,
    ) -> Result<(), BrokerError>;

    /// Declare a queue. Redeclaring with identical arguments is a no-op.
    async fn declare_queue(
        &self,
        queue: &str,
        options: QueueOptions,
        arguments: FieldTable,
    ) -> Result<(), BrokerError>;

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError>;

    /// Maximum unacknowledged deliveries pushed to consumers on this channel.
    async fn set_prefetch(&self, count: u16) -> Result<(), BrokerError>;

    /// Put the channel into confirm mode and return the raw signal stream.
    async fn confirm_select(&self) -> Result<ConfirmStream, BrokerError>;

    /// Sequence number the next published message will receive.
    fn next_publish_seq(&self) -> DeliveryTag;

    /// Publish every message in order as one batch.
    async fn publish_batch(&self, messages: &[OutboundMessage]) -> Result<(), BrokerError>;

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, BrokerError>;

    /// Non-blocking fetch of a single message.
    async fn get(&self, queue: &str) -> Result<Option<Delivery>, BrokerError>;

    async fn ack(&self, delivery_tag: DeliveryTag, multiple: bool) -> Result<(), BrokerError>;

    async fn nack(
        &self,
        delivery_tag: DeliveryTag,
        multiple: bool,
        requeue: bool,
    ) -> Result<(), BrokerError>;

    async fn reject(&self, delivery_tag: DeliveryTag, requeue: bool) -> Result<(), BrokerError>;

    async fn close(&self) -> Result<(), BrokerError>;
}
