use std::any::type_name;

use async_trait::async_trait;

use crate::bus::EventBus;
use crate::errors::BusResult;
use crate::handler::{BatchEventHandler, EventHandler, EventPayload};

/// Queue name used when a registration leaves it empty.
pub fn default_queue_name<H>() -> String {
    type_name::<H>().to_string()
}

/// Route key used when a registration leaves it empty.
pub fn default_route_key<T>() -> String {
    type_name::<T>().to_string()
}

pub(crate) fn resolve_names<T, H>(queue: &str, route_key: &str) -> (String, String) {
    let queue = if queue.is_empty() {
        default_queue_name::<H>()
    } else {
        queue.to_string()
    };
    let route_key = if route_key.is_empty() {
        default_route_key::<T>()
    } else {
        route_key.to_string()
    };
    (queue, route_key)
}

#[async_trait]
trait Registration: Send + Sync {
    fn queue(&self) -> &str;

    async fn start(self: Box<Self>, bus: &EventBus) -> BusResult<()>;
}

struct SingleRegistration<T, H> {
    queue: String,
    route_key: String,
    handler: H,
    _event: std::marker::PhantomData<fn() -> T>,
}

#[async_trait]
impl<T, H> Registration for SingleRegistration<T, H>
where
    T: EventPayload,
    H: EventHandler<T>,
{
    fn queue(&self) -> &str {
        &self.queue
    }

    async fn start(self: Box<Self>, bus: &EventBus) -> BusResult<()> {
        let this = *self;
        bus.register::<T, H>(&this.queue, &this.route_key, this.handler)
            .await
    }
}

struct BatchRegistration<T, H> {
    queue: String,
    route_key: String,
    batch_size: u16,
    handler: H,
    _event: std::marker::PhantomData<fn() -> T>,
}

#[async_trait]
impl<T, H> Registration for BatchRegistration<T, H>
where
    T: EventPayload,
    H: BatchEventHandler<T>,
{
    fn queue(&self) -> &str {
        &self.queue
    }

    async fn start(self: Box<Self>, bus: &EventBus) -> BusResult<()> {
        let this = *self;
        bus.register_batch::<T, H>(&this.queue, &this.route_key, this.batch_size, this.handler)
            .await
    }
}

/// Handlers to start with a bus, keyed by queue and route key.
#[derive(Default)]
pub struct HandlerRegistry {
    registrations: Vec<Box<dyn Registration>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a single-message handler. Empty names fall back to the
    /// handler's and the event's type names.
    pub fn single<T, H>(mut self, queue: &str, route_key: &str, handler: H) -> Self
    where
        T: EventPayload,
        H: EventHandler<T>,
    {
        let (queue, route_key) = resolve_names::<T, H>(queue, route_key);
        self.registrations.push(Box::new(SingleRegistration {
            queue,
            route_key,
            handler,
            _event: std::marker::PhantomData,
        }));
        self
    }

    /// Register a batch handler. A `batch_size` of 0 uses the bus default.
    pub fn batch<T, H>(mut self, queue: &str, route_key: &str, batch_size: u16, handler: H) -> Self
    where
        T: EventPayload,
        H: BatchEventHandler<T>,
    {
        let (queue, route_key) = resolve_names::<T, H>(queue, route_key);
        self.registrations.push(Box::new(BatchRegistration {
            queue,
            route_key,
            batch_size,
            handler,
            _event: std::marker::PhantomData,
        }));
        self
    }

    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }

    pub fn queues(&self) -> Vec<&str> {
        self.registrations.iter().map(|entry| entry.queue()).collect()
    }

    /// Start every registration in order, stopping at the first failure.
    pub(crate) async fn start_all(self, bus: &EventBus) -> BusResult<usize> {
        let count = self.registrations.len();
        for registration in self.registrations {
            registration.start(bus).await?;
        }
        Ok(count)
    }
}
