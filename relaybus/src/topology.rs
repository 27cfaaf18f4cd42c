//! Exchange, queue and binding declarations.

use std::collections::HashSet;

use log::debug;
use relaybus_broker::{
    BrokerChannel, BrokerError, ExchangeKind, FieldTable, FieldValue, QueueOptions,
    ARG_DEAD_LETTER_EXCHANGE, ARG_DEAD_LETTER_ROUTING_KEY, ARG_EXPIRES, ARG_MESSAGE_TTL,
};

use crate::resilience::ConnectivityRetry;

const DELAY_QUEUE_MARKER: &str = ".DELAY.";

/// The exchange every event is published to and consumed from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Exchange {
    pub name: String,
    pub kind: ExchangeKind,
}

impl Default for Exchange {
    fn default() -> Self {
        Self {
            name: "amq.topic".into(),
            kind: ExchangeKind::Topic,
        }
    }
}

pub fn delay_queue_name(route_key: &str, delay_seconds: u32) -> String {
    format!("{route_key}{DELAY_QUEUE_MARKER}{delay_seconds}")
}

/// Messages sit in the delay queue for `delay_seconds`, then dead-letter back
/// to `exchange` under `route_key`. The queue itself expires after ten times
/// the delay without use.
pub fn delay_queue_arguments(exchange: &str, route_key: &str, delay_seconds: u32) -> FieldTable {
    let delay = i64::from(delay_seconds);
    let mut arguments = FieldTable::new();
    arguments.insert(ARG_EXPIRES.into(), FieldValue::Int(delay * 10_000));
    arguments.insert(ARG_MESSAGE_TTL.into(), FieldValue::Int(delay * 1_000));
    arguments.insert(ARG_DEAD_LETTER_EXCHANGE.into(), exchange.into());
    arguments.insert(ARG_DEAD_LETTER_ROUTING_KEY.into(), route_key.into());
    arguments
}

/// Declares delay queues on first use within one publish.
pub struct DelayQueueProvisioner<'a> {
    channel: &'a dyn BrokerChannel,
    exchange: &'a str,
    retry: &'a ConnectivityRetry,
    declared: HashSet<(String, u32)>,
}

impl<'a> DelayQueueProvisioner<'a> {
    pub fn new(channel: &'a dyn BrokerChannel, exchange: &'a str, retry: &'a ConnectivityRetry) -> Self {
        Self {
            channel,
            exchange,
            retry,
            declared: HashSet::new(),
        }
    }

    /// Make sure the delay queue for the pair exists and return its name.
    pub async fn provision(&mut self, route_key: &str, delay_seconds: u32) -> Result<String, BrokerError> {
        let name = delay_queue_name(route_key, delay_seconds);
        if self.declared.contains(&(route_key.to_string(), delay_seconds)) {
            return Ok(name);
        }

        let channel = self.channel;
        let arguments = delay_queue_arguments(self.exchange, route_key, delay_seconds);
        let queue = name.as_str();
        self.retry
            .run("delay queue declare", || {
                channel.declare_queue(queue, QueueOptions::default(), arguments.clone())
            })
            .await?;
        debug!("Declared delay queue {name} ({delay_seconds}s -> {route_key})");
        self.declared.insert((route_key.to_string(), delay_seconds));
        Ok(name)
    }
}

/// Exchange, durable queue, binding and prefetch for a consumer.
pub async fn declare_consumer_topology(
    channel: &dyn BrokerChannel,
    exchange: &Exchange,
    queue: &str,
    route_key: &str,
    prefetch: u16,
) -> Result<(), BrokerError> {
    channel
        .declare_exchange(&exchange.name, exchange.kind, true)
        .await?;
    channel
        .declare_queue(queue, QueueOptions::default(), FieldTable::new())
        .await?;
    channel.bind_queue(queue, &exchange.name, route_key).await?;
    channel.set_prefetch(prefetch).await?;
    debug!(
        "Declared {queue} bound to {}/{route_key} with prefetch {prefetch}",
        exchange.name
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use relaybus_broker::in_memory::InMemoryBroker;
    use relaybus_broker::ConnectionLeaseProvider;

    use super::*;

    #[test]
    fn delay_queue_layout() {
        assert_eq!(delay_queue_name("order.created", 5), "order.created.DELAY.5");

        let arguments = delay_queue_arguments("amq.topic", "order.created", 5);
        assert_eq!(arguments[ARG_EXPIRES], FieldValue::Int(50_000));
        assert_eq!(arguments[ARG_MESSAGE_TTL], FieldValue::Int(5_000));
        assert_eq!(arguments[ARG_DEAD_LETTER_EXCHANGE].as_str(), Some("amq.topic"));
        assert_eq!(arguments[ARG_DEAD_LETTER_ROUTING_KEY].as_str(), Some("order.created"));
    }

    #[tokio::test]
    async fn provisioner_declares_each_pair_once() {
        let broker = InMemoryBroker::new();
        let connection = broker.lease().await.unwrap();
        let channel = connection.open_channel().await.unwrap();
        let retry = ConnectivityRetry::default();
        let mut provisioner = DelayQueueProvisioner::new(channel.as_ref(), "amq.topic", &retry);

        let first = provisioner.provision("order.created", 5).await.unwrap();
        let again = provisioner.provision("order.created", 5).await.unwrap();
        provisioner.provision("order.created", 10).await.unwrap();

        assert_eq!(first, again);
        assert!(broker.queue_exists("order.created.DELAY.5"));
        assert!(broker.queue_exists("order.created.DELAY.10"));
        assert_eq!(
            broker.queue_options("order.created.DELAY.5"),
            Some(QueueOptions::default())
        );
    }

    #[tokio::test]
    async fn consumer_topology_binds_queue_to_exchange() {
        let broker = InMemoryBroker::new();
        let connection = broker.lease().await.unwrap();
        let channel = connection.open_channel().await.unwrap();

        declare_consumer_topology(channel.as_ref(), &Exchange::default(), "billing", "order.*", 50)
            .await
            .unwrap();

        assert_eq!(broker.exchange_kind("amq.topic"), Some(ExchangeKind::Topic));
        assert_eq!(
            broker.bindings_for("billing"),
            vec![("amq.topic".to_string(), "order.*".to_string())]
        );
        assert_eq!(broker.open_channel_prefetches(), vec![50]);
    }
}
