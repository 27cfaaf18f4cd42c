use crate::{
    BrokerChannel, BrokerConnection, BrokerError, ConfirmSignal, ConfirmStream,
    ConnectionLeaseProvider, Delivery, DeliveryStream, DeliveryTag, ExchangeKind, FieldTable,
    FieldValue, MessageProperties, OutboundMessage, QueueOptions, ARG_DEAD_LETTER_EXCHANGE,
    ARG_DEAD_LETTER_ROUTING_KEY, ARG_EXPIRES, ARG_MESSAGE_TTL,
};
use async_trait::async_trait;
use log::debug;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

const NO_ROUTE: u16 = 312;

#[derive(Debug, Clone)]
struct StoredMessage {
    exchange: String,
    routing_key: String,
    properties: MessageProperties,
    body: Vec<u8>,
    enqueued_at: Instant,
    redelivered: bool,
}

impl StoredMessage {
    fn to_delivery(&self, delivery_tag: DeliveryTag) -> Delivery {
        Delivery {
            delivery_tag,
            exchange: self.exchange.clone(),
            routing_key: self.routing_key.clone(),
            redelivered: self.redelivered,
            properties: self.properties.clone(),
            body: self.body.clone(),
        }
    }
}

struct ConsumerSlot {
    channel_id: u64,
    consumer_tag: String,
    sender: mpsc::UnboundedSender<Delivery>,
}

struct QueueState {
    options: QueueOptions,
    arguments: FieldTable,
    messages: VecDeque<StoredMessage>,
    consumer: Option<ConsumerSlot>,
    last_used: Instant,
}

impl QueueState {
    fn millis_argument(&self, key: &str) -> Option<Duration> {
        self.arguments
            .get(key)
            .and_then(FieldValue::as_int)
            .map(|ms| Duration::from_millis(ms.max(0) as u64))
    }

    fn dead_letter_target(&self, original_key: &str) -> Option<(String, String)> {
        let exchange = self.arguments.get(ARG_DEAD_LETTER_EXCHANGE)?.as_str()?;
        let routing_key = self
            .arguments
            .get(ARG_DEAD_LETTER_ROUTING_KEY)
            .and_then(FieldValue::as_str)
            .unwrap_or(original_key);
        Some((exchange.to_string(), routing_key.to_string()))
    }
}

struct Unacked {
    queue: String,
    message: StoredMessage,
}

struct ChannelState {
    open: bool,
    prefetch: u16,
    confirms: Option<mpsc::UnboundedSender<ConfirmSignal>>,
    next_publish_seq: DeliveryTag,
    next_delivery_tag: DeliveryTag,
    unacked: BTreeMap<DeliveryTag, Unacked>,
}

impl ChannelState {
    fn new() -> Self {
        Self {
            open: true,
            prefetch: 0,
            confirms: None,
            next_publish_seq: 1,
            next_delivery_tag: 1,
            unacked: BTreeMap::new(),
        }
    }
}

struct Binding {
    queue: String,
    exchange: String,
    routing_key: String,
}

#[derive(Default)]
struct FaultPlan {
    channel_open_failures: usize,
    publish_failures: usize,
    /// Messages handed out by `get` before the next one fails once.
    get_failure_after: Option<usize>,
    nacked_ids: HashSet<String>,
    withheld_ids: HashSet<String>,
    cumulative_confirms: bool,
}

/// A message arriving at a named exchange, recorded for inspection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutedMessage {
    pub exchange: String,
    pub routing_key: String,
    pub message_id: Option<String>,
    pub at: Instant,
}

struct BrokerState {
    connected: bool,
    reconnects: usize,
    leases: usize,
    exchanges: HashMap<String, ExchangeKind>,
    bindings: Vec<Binding>,
    queues: HashMap<String, QueueState>,
    channels: HashMap<u64, ChannelState>,
    next_channel_id: u64,
    faults: FaultPlan,
    routed: Vec<RoutedMessage>,
}

/// Exchanges every broker declares up front.
const DEFAULT_EXCHANGES: [(&str, ExchangeKind); 4] = [
    ("amq.direct", ExchangeKind::Direct),
    ("amq.fanout", ExchangeKind::Fanout),
    ("amq.topic", ExchangeKind::Topic),
    ("amq.headers", ExchangeKind::Headers),
];

impl Default for BrokerState {
    fn default() -> Self {
        Self {
            connected: true,
            reconnects: 0,
            leases: 0,
            exchanges: DEFAULT_EXCHANGES
                .iter()
                .map(|(name, kind)| (name.to_string(), *kind))
                .collect(),
            bindings: Vec::new(),
            queues: HashMap::new(),
            channels: HashMap::new(),
            next_channel_id: 1,
            faults: FaultPlan::default(),
            routed: Vec::new(),
        }
    }
}

impl BrokerState {
    fn ensure_open(&self, channel_id: u64) -> Result<(), BrokerError> {
        if !self.connected {
            return Err(BrokerError::AlreadyClosed("connection is closed".into()));
        }
        match self.channels.get(&channel_id) {
            Some(channel) if channel.open => Ok(()),
            _ => Err(BrokerError::AlreadyClosed(format!("channel {channel_id}"))),
        }
    }

    fn channel_mut(&mut self, channel_id: u64) -> Result<&mut ChannelState, BrokerError> {
        self.channels
            .get_mut(&channel_id)
            .ok_or_else(|| BrokerError::AlreadyClosed(format!("channel {channel_id}")))
    }

    /// Route a message. Returns whether at least one queue received it.
    fn route(
        &mut self,
        exchange: &str,
        routing_key: &str,
        mut message: StoredMessage,
    ) -> Result<bool, BrokerError> {
        message.exchange = exchange.to_string();
        message.routing_key = routing_key.to_string();

        if exchange.is_empty() {
            return Ok(match self.queues.get_mut(routing_key) {
                Some(queue) => {
                    queue.messages.push_back(message);
                    true
                }
                None => false,
            });
        }

        let kind = *self
            .exchanges
            .get(exchange)
            .ok_or_else(|| BrokerError::NotFound(format!("exchange '{exchange}'")))?;

        self.routed.push(RoutedMessage {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            message_id: message.properties.message_id.clone(),
            at: message.enqueued_at,
        });

        let mut targets: Vec<String> = self
            .bindings
            .iter()
            .filter(|binding| {
                binding.exchange == exchange
                    && binding_matches(kind, &binding.routing_key, routing_key)
            })
            .map(|binding| binding.queue.clone())
            .collect();
        targets.sort();
        targets.dedup();

        let mut routed = false;
        for name in targets {
            if let Some(queue) = self.queues.get_mut(&name) {
                queue.messages.push_back(message.clone());
                routed = true;
            }
        }
        Ok(routed)
    }

    fn dead_letter(&mut self, queue: &str, mut message: StoredMessage, now: Instant) {
        let target = self
            .queues
            .get(queue)
            .and_then(|state| state.dead_letter_target(&message.routing_key));
        let Some((exchange, routing_key)) = target else {
            debug!("Dropping message from {queue}; no dead-letter exchange configured");
            return;
        };

        message.enqueued_at = now;
        message.redelivered = false;
        match self.route(&exchange, &routing_key, message) {
            Ok(true) => {}
            Ok(false) => debug!("Dead-lettered message from {queue} was unroutable via {exchange}"),
            Err(err) => debug!("Dead-lettering from {queue} failed: {err}"),
        }
    }

    /// Expire messages past their TTL and queues idle past their expiry.
    fn sweep(&mut self, now: Instant) {
        let mut expired = Vec::new();
        for (name, queue) in self.queues.iter_mut() {
            let Some(ttl) = queue.millis_argument(ARG_MESSAGE_TTL) else {
                continue;
            };
            while queue
                .messages
                .front()
                .is_some_and(|message| message.enqueued_at + ttl <= now)
            {
                if let Some(message) = queue.messages.pop_front() {
                    expired.push((name.clone(), message));
                }
            }
        }
        for (queue, message) in expired {
            self.dead_letter(&queue, message, now);
        }

        self.queues.retain(|name, queue| {
            let idle_expired = queue
                .millis_argument(ARG_EXPIRES)
                .is_some_and(|expiry| queue.consumer.is_none() && queue.last_used + expiry <= now);
            if idle_expired {
                debug!("Queue {name} expired after being unused");
            }
            !idle_expired
        });
    }

    fn pump(&mut self) {
        let ready: Vec<String> = self
            .queues
            .iter()
            .filter(|(_, queue)| queue.consumer.is_some() && !queue.messages.is_empty())
            .map(|(name, _)| name.clone())
            .collect();
        for name in ready {
            self.pump_queue(&name);
        }
    }

    fn pump_queue(&mut self, name: &str) {
        loop {
            let Some(queue) = self.queues.get_mut(name) else {
                return;
            };
            let Some(consumer) = queue.consumer.as_ref() else {
                return;
            };
            let Some(channel) = self.channels.get_mut(&consumer.channel_id) else {
                return;
            };
            if channel.prefetch > 0 && channel.unacked.len() >= channel.prefetch as usize {
                return;
            }
            let Some(message) = queue.messages.pop_front() else {
                return;
            };

            let tag = channel.next_delivery_tag;
            let sent = consumer.sender.send(message.to_delivery(tag)).is_ok();
            if !sent {
                debug!(
                    "Consumer {} on {name} went away; message stays queued",
                    consumer.consumer_tag
                );
                queue.messages.push_front(message);
                queue.consumer = None;
                return;
            }

            channel.next_delivery_tag += 1;
            channel.unacked.insert(
                tag,
                Unacked {
                    queue: name.to_string(),
                    message,
                },
            );
        }
    }

    fn take_unacked(
        &mut self,
        channel_id: u64,
        delivery_tag: DeliveryTag,
        multiple: bool,
    ) -> Result<Vec<Unacked>, BrokerError> {
        let channel = self.channel_mut(channel_id)?;
        if multiple {
            let tags: Vec<DeliveryTag> = channel
                .unacked
                .range(..=delivery_tag)
                .map(|(tag, _)| *tag)
                .collect();
            Ok(tags
                .into_iter()
                .filter_map(|tag| channel.unacked.remove(&tag))
                .collect())
        } else {
            channel
                .unacked
                .remove(&delivery_tag)
                .map(|entry| vec![entry])
                .ok_or(BrokerError::UnknownDelivery(delivery_tag))
        }
    }

    fn requeue(&mut self, entries: Vec<Unacked>) {
        for entry in entries.into_iter().rev() {
            if let Some(queue) = self.queues.get_mut(&entry.queue) {
                let mut message = entry.message;
                message.redelivered = true;
                queue.messages.push_front(message);
            }
        }
    }
}

fn binding_matches(kind: ExchangeKind, pattern: &str, routing_key: &str) -> bool {
    match kind {
        ExchangeKind::Fanout => true,
        ExchangeKind::Topic => {
            let pattern: Vec<&str> = pattern.split('.').collect();
            let words: Vec<&str> = routing_key.split('.').collect();
            topic_matches(&pattern, &words)
        }
        ExchangeKind::Direct | ExchangeKind::Headers => pattern == routing_key,
    }
}

fn topic_matches(pattern: &[&str], words: &[&str]) -> bool {
    match pattern.split_first() {
        None => words.is_empty(),
        Some((head, rest)) if *head == "#" => {
            (0..=words.len()).any(|skip| topic_matches(rest, &words[skip..]))
        }
        Some((head, rest)) if *head == "*" => !words.is_empty() && topic_matches(rest, &words[1..]),
        Some((head, rest)) => words.first() == Some(head) && topic_matches(rest, &words[1..]),
    }
}

/// Process-local broker with AMQP-like semantics, used by tests and the
/// loopback binary. One consumer per queue.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop the transport. Channel operations fail until `reconnect`.
    pub fn disconnect(&self) {
        self.state.lock().connected = false;
    }

    pub fn reconnect_count(&self) -> usize {
        self.state.lock().reconnects
    }

    pub fn lease_count(&self) -> usize {
        self.state.lock().leases
    }

    pub fn fail_next_channel_opens(&self, count: usize) {
        self.state.lock().faults.channel_open_failures = count;
    }

    pub fn fail_next_publishes(&self, count: usize) {
        self.state.lock().faults.publish_failures = count;
    }

    /// Let `get` hand out `count` more messages, then fail the next non-empty get once.
    pub fn fail_get_after(&self, count: usize) {
        self.state.lock().faults.get_failure_after = Some(count);
    }

    /// Answer publishes of this message id with a negative confirm.
    pub fn nack_message(&self, message_id: impl Into<String>) {
        self.state.lock().faults.nacked_ids.insert(message_id.into());
    }

    /// Never confirm publishes of this message id.
    pub fn withhold_confirm(&self, message_id: impl Into<String>) {
        self.state.lock().faults.withheld_ids.insert(message_id.into());
    }

    /// Confirm positive outcomes of a batch with one cumulative ack.
    pub fn set_cumulative_confirms(&self, enabled: bool) {
        self.state.lock().faults.cumulative_confirms = enabled;
    }

    /// Place a message directly on a queue, bypassing exchanges.
    pub fn enqueue(
        &self,
        queue: &str,
        properties: MessageProperties,
        body: impl Into<Vec<u8>>,
    ) -> Result<(), BrokerError> {
        let mut state = self.state.lock();
        let message = StoredMessage {
            exchange: String::new(),
            routing_key: queue.to_string(),
            properties,
            body: body.into(),
            enqueued_at: Instant::now(),
            redelivered: false,
        };
        if !state.route("", queue, message)? {
            return Err(BrokerError::NotFound(format!("queue '{queue}'")));
        }
        state.pump();
        Ok(())
    }

    /// Apply TTL expiry and push pending deliveries.
    pub fn tick(&self) {
        let mut state = self.state.lock();
        state.sweep(Instant::now());
        state.pump();
    }

    /// Cancel the consumer on a queue from the broker side.
    pub fn cancel_consumer(&self, queue: &str) {
        if let Some(queue) = self.state.lock().queues.get_mut(queue) {
            queue.consumer = None;
        }
    }

    pub fn queue_exists(&self, queue: &str) -> bool {
        self.state.lock().queues.contains_key(queue)
    }

    pub fn queue_len(&self, queue: &str) -> usize {
        self.state
            .lock()
            .queues
            .get(queue)
            .map(|state| state.messages.len())
            .unwrap_or(0)
    }

    pub fn queue_arguments(&self, queue: &str) -> Option<FieldTable> {
        self.state
            .lock()
            .queues
            .get(queue)
            .map(|state| state.arguments.clone())
    }

    pub fn queue_options(&self, queue: &str) -> Option<QueueOptions> {
        self.state.lock().queues.get(queue).map(|state| state.options)
    }

    /// Message ids currently waiting on a queue, front first.
    pub fn queued_message_ids(&self, queue: &str) -> Vec<String> {
        self.state
            .lock()
            .queues
            .get(queue)
            .map(|state| {
                state
                    .messages
                    .iter()
                    .filter_map(|message| message.properties.message_id.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn exchange_kind(&self, exchange: &str) -> Option<ExchangeKind> {
        self.state.lock().exchanges.get(exchange).copied()
    }

    pub fn bindings_for(&self, queue: &str) -> Vec<(String, String)> {
        self.state
            .lock()
            .bindings
            .iter()
            .filter(|binding| binding.queue == queue)
            .map(|binding| (binding.exchange.clone(), binding.routing_key.clone()))
            .collect()
    }

    pub fn unacked_count(&self) -> usize {
        self.state
            .lock()
            .channels
            .values()
            .map(|channel| channel.unacked.len())
            .sum()
    }

    pub fn open_channel_count(&self) -> usize {
        self.state
            .lock()
            .channels
            .values()
            .filter(|channel| channel.open)
            .count()
    }

    pub fn open_channel_prefetches(&self) -> Vec<u16> {
        self.state
            .lock()
            .channels
            .values()
            .filter(|channel| channel.open)
            .map(|channel| channel.prefetch)
            .collect()
    }

    /// Every arrival at a named exchange so far.
    pub fn routed(&self) -> Vec<RoutedMessage> {
        self.state.lock().routed.clone()
    }
}

#[async_trait]
impl ConnectionLeaseProvider for InMemoryBroker {
    async fn lease(&self) -> Result<Arc<dyn BrokerConnection>, BrokerError> {
        self.state.lock().leases += 1;
        Ok(Arc::new(InMemoryConnection {
            broker: self.clone(),
        }))
    }
}

pub struct InMemoryConnection {
    broker: InMemoryBroker,
}

#[async_trait]
impl BrokerConnection for InMemoryConnection {
    fn is_connected(&self) -> bool {
        self.broker.state.lock().connected
    }

    async fn reconnect(&self) -> Result<(), BrokerError> {
        let mut state = self.broker.state.lock();
        state.connected = true;
        state.reconnects += 1;
        Ok(())
    }

    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>, BrokerError> {
        let mut state = self.broker.state.lock();
        if !state.connected {
            return Err(BrokerError::Unreachable("in-memory broker is disconnected".into()));
        }
        if state.faults.channel_open_failures > 0 {
            state.faults.channel_open_failures -= 1;
            return Err(BrokerError::Socket("injected channel open fault".into()));
        }

        let id = state.next_channel_id;
        state.next_channel_id += 1;
        state.channels.insert(id, ChannelState::new());
        Ok(Arc::new(InMemoryChannel {
            broker: self.broker.clone(),
            id,
        }))
    }
}

pub struct InMemoryChannel {
    broker: InMemoryBroker,
    id: u64,
}

#[async_trait]
impl BrokerChannel for InMemoryChannel {
    async fn declare_exchange(
        &self,
        exchange: &str,
        kind: ExchangeKind,
        _durable: bool,
    ) -> Result<(), BrokerError> {
        let mut state = self.broker.state.lock();
        state.ensure_open(self.id)?;
        match state.exchanges.get(exchange) {
            Some(existing) if *existing != kind => Err(BrokerError::PreconditionFailed(format!(
                "exchange '{exchange}' already declared as {existing}"
            ))),
            Some(_) => Ok(()),
            None => {
                state.exchanges.insert(exchange.to_string(), kind);
                Ok(())
            }
        }
    }

    async fn declare_queue(
        &self,
        queue: &str,
        options: QueueOptions,
        arguments: FieldTable,
    ) -> Result<(), BrokerError> {
        let mut state = self.broker.state.lock();
        state.ensure_open(self.id)?;
        let now = Instant::now();
        state.sweep(now);
        if let Some(existing) = state.queues.get_mut(queue) {
            if existing.options != options || existing.arguments != arguments {
                return Err(BrokerError::PreconditionFailed(format!(
                    "queue '{queue}' already declared with different arguments"
                )));
            }
            existing.last_used = now;
            return Ok(());
        }

        state.queues.insert(
            queue.to_string(),
            QueueState {
                options,
                arguments,
                messages: VecDeque::new(),
                consumer: None,
                last_used: now,
            },
        );
        Ok(())
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError> {
        let mut state = self.broker.state.lock();
        state.ensure_open(self.id)?;
        if !state.queues.contains_key(queue) {
            return Err(BrokerError::NotFound(format!("queue '{queue}'")));
        }
        if !state.exchanges.contains_key(exchange) {
            return Err(BrokerError::NotFound(format!("exchange '{exchange}'")));
        }
        let exists = state.bindings.iter().any(|binding| {
            binding.queue == queue && binding.exchange == exchange && binding.routing_key == routing_key
        });
        if !exists {
            state.bindings.push(Binding {
                queue: queue.to_string(),
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
            });
        }
        Ok(())
    }

    async fn set_prefetch(&self, count: u16) -> Result<(), BrokerError> {
        let mut state = self.broker.state.lock();
        state.ensure_open(self.id)?;
        state.channel_mut(self.id)?.prefetch = count;
        state.pump();
        Ok(())
    }

    async fn confirm_select(&self) -> Result<ConfirmStream, BrokerError> {
        let mut state = self.broker.state.lock();
        state.ensure_open(self.id)?;
        let (tx, rx) = mpsc::unbounded_channel();
        state.channel_mut(self.id)?.confirms = Some(tx);
        Ok(rx)
    }

    fn next_publish_seq(&self) -> DeliveryTag {
        self.broker
            .state
            .lock()
            .channels
            .get(&self.id)
            .map(|channel| channel.next_publish_seq)
            .unwrap_or(1)
    }

    async fn publish_batch(&self, messages: &[OutboundMessage]) -> Result<(), BrokerError> {
        let mut state = self.broker.state.lock();
        state.ensure_open(self.id)?;
        if state.faults.publish_failures > 0 {
            state.faults.publish_failures -= 1;
            return Err(BrokerError::Socket("injected publish fault".into()));
        }

        let now = Instant::now();
        state.sweep(now);

        let mut cumulative_ack = None;
        for message in messages {
            let stored = StoredMessage {
                exchange: message.exchange.clone(),
                routing_key: message.routing_key.clone(),
                properties: message.properties.clone(),
                body: message.body.clone(),
                enqueued_at: now,
                redelivered: false,
            };
            let routed = state.route(&message.exchange, &message.routing_key, stored)?;
            let message_id = message.properties.message_id.clone().unwrap_or_default();
            let nacked = state.faults.nacked_ids.contains(&message_id);
            let withheld = state.faults.withheld_ids.contains(&message_id);
            let cumulative = state.faults.cumulative_confirms;

            let channel = state.channel_mut(self.id)?;
            let Some(confirms) = channel.confirms.clone() else {
                if !routed && message.mandatory {
                    debug!("Unroutable message {message_id} dropped (no confirm mode)");
                }
                continue;
            };
            let seq = channel.next_publish_seq;
            channel.next_publish_seq += 1;

            if !routed && message.mandatory {
                let _ = confirms.send(ConfirmSignal::Return {
                    message_id: message.properties.message_id.clone(),
                    reply_code: NO_ROUTE,
                    reply_text: "NO_ROUTE".into(),
                });
            }
            if nacked {
                let _ = confirms.send(ConfirmSignal::Nack {
                    delivery_tag: seq,
                    multiple: false,
                });
            } else if withheld {
                continue;
            } else if cumulative {
                cumulative_ack = Some(seq);
            } else {
                let _ = confirms.send(ConfirmSignal::Ack {
                    delivery_tag: seq,
                    multiple: false,
                });
            }
        }

        if let Some(delivery_tag) = cumulative_ack {
            if let Some(confirms) = state.channel_mut(self.id)?.confirms.clone() {
                let _ = confirms.send(ConfirmSignal::Ack {
                    delivery_tag,
                    multiple: true,
                });
            }
        }

        state.pump();
        Ok(())
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, BrokerError> {
        let mut state = self.broker.state.lock();
        state.ensure_open(self.id)?;
        let (tx, rx) = mpsc::unbounded_channel();
        let now = Instant::now();
        let slot = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| BrokerError::NotFound(format!("queue '{queue}'")))?;
        slot.last_used = now;
        slot.consumer = Some(ConsumerSlot {
            channel_id: self.id,
            consumer_tag: consumer_tag.to_string(),
            sender: tx,
        });
        state.pump();
        Ok(rx)
    }

    async fn get(&self, queue: &str) -> Result<Option<Delivery>, BrokerError> {
        let mut state = self.broker.state.lock();
        state.ensure_open(self.id)?;
        let now = Instant::now();
        state.sweep(now);

        let pending = state
            .queues
            .get(queue)
            .is_some_and(|slot| !slot.messages.is_empty());
        if pending {
            match state.faults.get_failure_after {
                Some(0) => {
                    state.faults.get_failure_after = None;
                    return Err(BrokerError::Socket("injected get fault".into()));
                }
                Some(left) => state.faults.get_failure_after = Some(left - 1),
                None => {}
            }
        }

        let slot = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| BrokerError::NotFound(format!("queue '{queue}'")))?;
        slot.last_used = now;
        let Some(message) = slot.messages.pop_front() else {
            return Ok(None);
        };

        let channel = state.channel_mut(self.id)?;
        let tag = channel.next_delivery_tag;
        channel.next_delivery_tag += 1;
        let delivery = message.to_delivery(tag);
        channel.unacked.insert(
            tag,
            Unacked {
                queue: queue.to_string(),
                message,
            },
        );
        Ok(Some(delivery))
    }

    async fn ack(&self, delivery_tag: DeliveryTag, multiple: bool) -> Result<(), BrokerError> {
        let mut state = self.broker.state.lock();
        state.ensure_open(self.id)?;
        state.take_unacked(self.id, delivery_tag, multiple)?;
        state.pump();
        Ok(())
    }

    async fn nack(
        &self,
        delivery_tag: DeliveryTag,
        multiple: bool,
        requeue: bool,
    ) -> Result<(), BrokerError> {
        let mut state = self.broker.state.lock();
        state.ensure_open(self.id)?;
        let entries = state.take_unacked(self.id, delivery_tag, multiple)?;
        if requeue {
            state.requeue(entries);
        } else {
            let now = Instant::now();
            for entry in entries {
                state.dead_letter(&entry.queue, entry.message, now);
            }
        }
        state.pump();
        Ok(())
    }

    async fn reject(&self, delivery_tag: DeliveryTag, requeue: bool) -> Result<(), BrokerError> {
        self.nack(delivery_tag, false, requeue).await
    }

    async fn close(&self) -> Result<(), BrokerError> {
        let mut state = self.broker.state.lock();
        let Some(channel) = state.channels.get_mut(&self.id) else {
            return Ok(());
        };
        channel.open = false;
        channel.confirms = None;
        let unacked: Vec<Unacked> = std::mem::take(&mut channel.unacked).into_values().collect();

        for queue in state.queues.values_mut() {
            if queue
                .consumer
                .as_ref()
                .is_some_and(|consumer| consumer.channel_id == self.id)
            {
                queue.consumer = None;
            }
        }
        state.requeue(unacked);
        state.channels.remove(&self.id);
        state.pump();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn words(value: &str) -> Vec<&str> {
        value.split('.').collect()
    }

    #[test]
    fn topic_wildcards_follow_amqp_rules() {
        assert!(topic_matches(&words("order.*"), &words("order.created")));
        assert!(!topic_matches(&words("order.*"), &words("order.created.v2")));
        assert!(topic_matches(&words("order.#"), &words("order.created.v2")));
        assert!(topic_matches(&words("order.#"), &words("order")));
        assert!(topic_matches(&words("#"), &words("anything.at.all")));
        assert!(!topic_matches(&words("order.created"), &words("order.deleted")));
    }

    #[tokio::test(start_paused = true)]
    async fn expired_messages_are_dead_lettered() {
        let broker = InMemoryBroker::new();
        let connection = broker.lease().await.unwrap();
        let channel = connection.open_channel().await.unwrap();
        channel
            .declare_exchange("amq.topic", ExchangeKind::Topic, true)
            .await
            .unwrap();
        channel
            .declare_queue("target", QueueOptions::default(), FieldTable::new())
            .await
            .unwrap();
        channel.bind_queue("target", "amq.topic", "order.created").await.unwrap();

        let mut arguments = FieldTable::new();
        arguments.insert(ARG_MESSAGE_TTL.into(), FieldValue::Int(1_000));
        arguments.insert(ARG_DEAD_LETTER_EXCHANGE.into(), "amq.topic".into());
        arguments.insert(ARG_DEAD_LETTER_ROUTING_KEY.into(), "order.created".into());
        channel
            .declare_queue("delay", QueueOptions::default(), arguments)
            .await
            .unwrap();

        broker
            .enqueue("delay", MessageProperties::persistent("m1"), b"{}".to_vec())
            .unwrap();

        tokio::time::advance(Duration::from_millis(999)).await;
        broker.tick();
        assert_eq!(broker.queue_len("target"), 0);

        tokio::time::advance(Duration::from_millis(1)).await;
        broker.tick();
        assert_eq!(broker.queue_len("delay"), 0);
        assert_eq!(broker.queued_message_ids("target"), vec!["m1".to_string()]);
    }

    #[tokio::test]
    async fn nack_with_requeue_puts_message_back_in_front() {
        let broker = InMemoryBroker::new();
        let connection = broker.lease().await.unwrap();
        let channel = connection.open_channel().await.unwrap();
        channel
            .declare_queue("jobs", QueueOptions::default(), FieldTable::new())
            .await
            .unwrap();
        broker.enqueue("jobs", MessageProperties::persistent("a"), b"1".to_vec()).unwrap();
        broker.enqueue("jobs", MessageProperties::persistent("b"), b"2".to_vec()).unwrap();

        let first = channel.get("jobs").await.unwrap().unwrap();
        channel.nack(first.delivery_tag, false, true).await.unwrap();

        let again = channel.get("jobs").await.unwrap().unwrap();
        assert_eq!(again.message_id(), Some("a"));
        assert!(again.redelivered);
    }
}
