use std::sync::Arc;
use std::time::Duration;

use log::info;
use parking_lot::RwLock;
use relaybus_broker::ConnectionLeaseProvider;
use relaybus_config::BusConfig;
use relaybus_models::core::EventRecord;

use crate::consumer::batch::BatchPullConsumer;
use crate::consumer::single::SingleMessageConsumer;
use crate::consumer::{ConsumerSetup, DeliveryObserver, ObserverSlot};
use crate::errors::{BusError, BusResult};
use crate::handler::{BatchEventHandler, EventHandler, EventPayload};
use crate::idempotency::IdempotencyCache;
use crate::publish::{ConfirmReport, PublishObserver, PublishOptions, PublishPipeline};
use crate::registry::{resolve_names, HandlerRegistry};
use crate::resilience::{ConnectivityRetry, ConnectivityRetryConfig, HandlerPolicyConfig};
use crate::subscriptions::Subscriptions;
use crate::topology::Exchange;

#[derive(Debug, Clone)]
pub struct BusOptions {
    pub exchange: Exchange,
    /// Prefetch of single-message consumers.
    pub prefetch: u16,
    /// Default batch size of batch consumers.
    pub batch_size: u16,
    pub poll_interval: Duration,
    /// Zero disables idempotency checks.
    pub idempotency_window: Duration,
    pub publish: PublishOptions,
    pub connectivity: ConnectivityRetryConfig,
    pub handler_policy: HandlerPolicyConfig,
}

impl Default for BusOptions {
    fn default() -> Self {
        Self {
            exchange: Exchange::default(),
            prefetch: 1,
            batch_size: 50,
            poll_interval: Duration::from_millis(100),
            idempotency_window: Duration::from_secs(15),
            publish: PublishOptions::default(),
            connectivity: ConnectivityRetryConfig::default(),
            handler_policy: HandlerPolicyConfig::default(),
        }
    }
}

impl From<&BusConfig> for BusOptions {
    fn from(config: &BusConfig) -> Self {
        Self {
            exchange: Exchange {
                name: config.exchange.clone(),
                kind: config.exchange_type,
            },
            prefetch: config.prefetch,
            batch_size: config.batch_size,
            poll_interval: config.poll_interval(),
            idempotency_window: config.idempotency_window(),
            publish: PublishOptions {
                timeout: config.confirm_timeout(),
                batch_size: config.confirm_batch_size,
                ..PublishOptions::default()
            },
            connectivity: ConnectivityRetryConfig {
                max_retries: config.retry_count,
            },
            handler_policy: HandlerPolicyConfig::default(),
        }
    }
}

/// Publishes event records and runs registered consumers against a broker.
pub struct EventBus {
    options: BusOptions,
    receiver: Arc<dyn ConnectionLeaseProvider>,
    cache: Arc<dyn IdempotencyCache>,
    publisher: PublishPipeline,
    observer: ObserverSlot,
    subscriptions: Subscriptions,
}

impl EventBus {
    /// `sender` leases connections for publishing, `receiver` for consumers.
    pub fn new(
        sender: Arc<dyn ConnectionLeaseProvider>,
        receiver: Arc<dyn ConnectionLeaseProvider>,
        cache: Arc<dyn IdempotencyCache>,
        options: BusOptions,
    ) -> Self {
        let publisher = PublishPipeline::new(
            sender,
            options.exchange.clone(),
            ConnectivityRetry::new(options.connectivity.clone()),
        );
        Self {
            options,
            receiver,
            cache,
            publisher,
            observer: Arc::new(RwLock::new(None)),
            subscriptions: Subscriptions::new(),
        }
    }

    pub fn options(&self) -> &BusOptions {
        &self.options
    }

    pub fn subscriptions(&self) -> &Subscriptions {
        &self.subscriptions
    }

    /// Publish without waiting for confirms. Errors are logged only.
    pub async fn publish_non_confirm(&self, events: &[EventRecord], delay_seconds: u32) {
        self.publisher.publish_non_confirm(events, delay_seconds).await
    }

    /// Publish with confirms; outcomes reach `observer` in chunks.
    pub async fn publish(
        &self,
        events: &[EventRecord],
        observer: Arc<dyn PublishObserver>,
        options: &PublishOptions,
    ) -> ConfirmReport {
        self.publisher.publish(events, observer, options).await
    }

    /// Publish with confirms; `true` only if everything was acked in time.
    pub async fn publish_confirmed(&self, events: &[EventRecord], options: &PublishOptions) -> bool {
        self.publisher.publish_confirmed(events, options).await
    }

    /// Install the observer consulted on every ack and nack, replacing any
    /// previous one. Applies to consumers already running.
    pub fn subscribe(&self, observer: Arc<dyn DeliveryObserver>) {
        *self.observer.write() = Some(observer);
    }

    /// Start a single-message consumer for `handler`.
    pub async fn register<T, H>(&self, queue: &str, route_key: &str, handler: H) -> BusResult<()>
    where
        T: EventPayload,
        H: EventHandler<T>,
    {
        let (queue, route_key) = resolve_names::<T, H>(queue, route_key);
        let setup = self.setup(queue, route_key, self.options.prefetch);
        let handler: Arc<dyn EventHandler<T>> = Arc::new(handler);
        let subscription =
            SingleMessageConsumer::start(setup, handler, self.subscriptions.shutdown_token()).await?;
        info!("Registered handler on {}", subscription.queue());
        self.subscriptions.push(subscription);
        Ok(())
    }

    /// Start a batch-pull consumer. A `batch_size` of 0 uses the bus default.
    pub async fn register_batch<T, H>(
        &self,
        queue: &str,
        route_key: &str,
        batch_size: u16,
        handler: H,
    ) -> BusResult<()>
    where
        T: EventPayload,
        H: BatchEventHandler<T>,
    {
        let (queue, route_key) = resolve_names::<T, H>(queue, route_key);
        let batch_size = if batch_size == 0 {
            self.options.batch_size
        } else {
            batch_size
        };
        if batch_size == 0 {
            return Err(BusError::Registration(format!(
                "batch size for {queue} must be positive"
            )));
        }
        let setup = self.setup(queue, route_key, batch_size);
        let handler: Arc<dyn BatchEventHandler<T>> = Arc::new(handler);
        let subscription = BatchPullConsumer::start(
            setup,
            handler,
            self.options.poll_interval,
            self.subscriptions.shutdown_token(),
        )
        .await?;
        info!("Registered batch handler on {}", subscription.queue());
        self.subscriptions.push(subscription);
        Ok(())
    }

    /// Start every handler in `registry`.
    pub async fn start(&self, registry: HandlerRegistry) -> BusResult<()> {
        let count = registry.start_all(self).await?;
        info!("Started {count} consumer(s)");
        Ok(())
    }

    /// Stop all consumers and close their channels.
    pub async fn shutdown(&self) {
        self.subscriptions.shutdown().await;
    }

    fn setup(&self, queue: String, route_key: String, prefetch: u16) -> ConsumerSetup {
        ConsumerSetup {
            lease: self.receiver.clone(),
            exchange: self.options.exchange.clone(),
            queue,
            route_key,
            prefetch,
            retry: ConnectivityRetry::new(self.options.connectivity.clone()),
            policy: self.options.handler_policy.clone(),
            cache: self.cache.clone(),
            idempotency_window: self.options.idempotency_window,
            observer: self.observer.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;

    #[derive(Parser)]
    struct Cli {
        #[command(flatten)]
        bus: BusConfig,
    }

    #[test]
    fn options_follow_the_config() {
        let cli = Cli::try_parse_from([
            "relaybus",
            "--bus-exchange",
            "events",
            "--bus-exchange-type",
            "direct",
            "--bus-retry-count",
            "5",
            "--bus-idempotency-seconds",
            "0",
            "--bus-confirm-batch-size",
            "20",
        ])
        .unwrap();
        let options = BusOptions::from(&cli.bus);

        assert_eq!(options.exchange.name, "events");
        assert_eq!(options.exchange.kind, relaybus_broker::ExchangeKind::Direct);
        assert_eq!(options.connectivity.max_retries, 5);
        assert!(options.idempotency_window.is_zero());
        assert_eq!(options.publish.batch_size, 20);
        assert_eq!(options.publish.timeout, Duration::from_millis(500));
        assert_eq!(options.batch_size, 50);
    }
}
