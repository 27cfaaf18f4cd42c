use async_trait::async_trait;
use relaybus_models::errors::SendableError;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;

/// Payload types a consumer can decode and hand to a handler.
pub trait EventPayload: DeserializeOwned + Clone + Send + Sync + 'static {}

impl<T> EventPayload for T where T: DeserializeOwned + Clone + Send + Sync + 'static {}

/// Handles one event at a time. `Ok(false)` declines the event without a
/// fault; it is not retried.
#[async_trait]
pub trait EventHandler<T: EventPayload>: Send + Sync + 'static {
    async fn handle(&self, event: T, cancel: CancellationToken) -> Result<bool, SendableError>;
}

/// Handles every event pulled in one batch iteration, in fetch order.
#[async_trait]
pub trait BatchEventHandler<T: EventPayload>: Send + Sync + 'static {
    async fn handle(&self, events: Vec<T>, cancel: CancellationToken) -> Result<bool, SendableError>;
}
