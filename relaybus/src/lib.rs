pub mod bus;
pub mod confirm;
pub mod consumer;
pub mod errors;
pub mod handler;
pub mod idempotency;
pub mod publish;
pub mod registry;
pub mod resilience;
pub mod subscriptions;
pub mod topology;

pub use bus::{BusOptions, EventBus};
pub use consumer::{ConsumerState, DeliveryObserver};
pub use errors::{BusError, BusResult, HandlerFault};
pub use handler::{BatchEventHandler, EventHandler, EventPayload};
pub use idempotency::{IdempotencyCache, InMemoryIdempotencyCache};
pub use publish::{ConfirmReport, PublishObserver, PublishOptions, SilentObserver};
pub use registry::HandlerRegistry;
pub use subscriptions::Subscriptions;
pub use topology::Exchange;
