use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{self, StreamExt};
use log::{debug, error, info, warn};
use relaybus_broker::{Delivery, DeliveryTag};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::consumer::{decode, ConsumerContext, ConsumerSetup, ConsumerState};
use crate::errors::BusResult;
use crate::handler::{BatchEventHandler, EventPayload};
use crate::resilience::PolicyOutcome;
use crate::subscriptions::Subscription;

/// Verdict on one fetched delivery.
enum Admission<T> {
    Accept {
        message_id: String,
        payload: Value,
        event: T,
    },
    Discard(&'static str),
}

/// Items admitted in one iteration, in fetch order.
struct BatchPool<T> {
    message_ids: Vec<String>,
    payloads: Vec<Value>,
    events: Vec<T>,
    seen: HashSet<String>,
    highest_tag: DeliveryTag,
}

impl<T> BatchPool<T> {
    fn new() -> Self {
        Self {
            message_ids: Vec::new(),
            payloads: Vec::new(),
            events: Vec::new(),
            seen: HashSet::new(),
            highest_tag: 0,
        }
    }

    /// `false` if the id is already pooled in this iteration.
    fn insert(&mut self, tag: DeliveryTag, message_id: String, payload: Value, event: T) -> bool {
        if !self.seen.insert(message_id.clone()) {
            return false;
        }
        self.message_ids.push(message_id);
        self.payloads.push(payload);
        self.events.push(event);
        self.highest_tag = self.highest_tag.max(tag);
        true
    }

    fn is_empty(&self) -> bool {
        self.message_ids.is_empty()
    }
}

/// Pull consumer fetching up to `batch_size` messages per iteration and
/// settling them with one cumulative ack or nack.
pub(crate) struct BatchPullConsumer<T: EventPayload> {
    context: ConsumerContext,
    handler: Arc<dyn BatchEventHandler<T>>,
    batch_size: u16,
    poll_interval: Duration,
    parallelism: usize,
}

impl<T: EventPayload> BatchPullConsumer<T> {
    pub async fn start(
        setup: ConsumerSetup,
        handler: Arc<dyn BatchEventHandler<T>>,
        poll_interval: Duration,
        shutdown: CancellationToken,
    ) -> BusResult<Subscription> {
        let batch_size = setup.prefetch.max(1);
        let context = ConsumerContext::establish(setup).await?;
        context.set_state(ConsumerState::Consuming);
        info!("Polling {} in batches of {batch_size}", context.queue);

        let queue = context.queue.clone();
        let channel = context.channel.clone();
        let state = context.state.clone();
        let consumer = Self {
            context,
            handler,
            batch_size,
            poll_interval,
            parallelism: std::thread::available_parallelism()
                .map(|count| count.get())
                .unwrap_or(1),
        };
        let task = tokio::spawn(consumer.run(shutdown));
        Ok(Subscription::new(queue, channel, state, task))
    }

    async fn run(self, shutdown: CancellationToken) {
        while !shutdown.is_cancelled() {
            let fetched = match self.iterate().await {
                Ok(fetched) => fetched,
                Err(err) => {
                    error!("Batch iteration on {} failed: {err}", self.context.queue);
                    0
                }
            };
            if fetched == 0 {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(self.poll_interval) => {}
                }
            }
        }
        self.context.set_state(ConsumerState::Stopped);
        debug!("Batch consumer on {} stopped", self.context.queue);
    }

    /// One pull-and-settle round. Returns how many deliveries were fetched.
    /// Every delivery fetched here is settled before returning, even on error,
    /// so a later cumulative ack never covers it.
    async fn iterate(&self) -> BusResult<usize> {
        let context = &self.context;
        context.ensure_connected().await;

        let mut fetched = Vec::with_capacity(self.batch_size as usize);
        while fetched.len() < self.batch_size as usize {
            match context.channel.get(&context.queue).await {
                Ok(Some(delivery)) => fetched.push(delivery),
                Ok(None) => break,
                Err(err) => {
                    self.release(&fetched).await;
                    return Err(err.into());
                }
            }
        }
        let count = fetched.len();
        if count == 0 {
            return Ok(0);
        }

        let highest_fetched = highest_tag(&fetched);
        if let Err(err) = self.process(fetched).await {
            self.release_through(highest_fetched).await;
            return Err(err);
        }
        Ok(count)
    }

    async fn process(&self, fetched: Vec<Delivery>) -> BusResult<()> {
        let context = &self.context;

        // buffered keeps fetch order while bounding concurrent cache lookups
        let admissions: Vec<(Delivery, Admission<T>)> = stream::iter(fetched)
            .map(move |delivery| async move {
                let admission = self.admit(&delivery).await;
                (delivery, admission)
            })
            .buffered(self.parallelism)
            .collect()
            .await;

        let mut pool = BatchPool::new();
        for (delivery, admission) in admissions {
            let reason = match admission {
                Admission::Accept {
                    message_id,
                    payload,
                    event,
                } => {
                    if pool.insert(delivery.delivery_tag, message_id, payload, event) {
                        continue;
                    }
                    "duplicate within batch"
                }
                Admission::Discard(reason) => reason,
            };
            debug!(
                "Discarding delivery {} on {}: {reason}",
                delivery.delivery_tag, context.queue
            );
            context.channel.nack(delivery.delivery_tag, false, false).await?;
        }

        if pool.is_empty() {
            return Ok(());
        }
        self.settle(pool).await
    }

    async fn release(&self, fetched: &[Delivery]) {
        if !fetched.is_empty() {
            self.release_through(highest_tag(fetched)).await;
        }
    }

    /// Requeue whatever this iteration fetched and has not settled yet.
    async fn release_through(&self, delivery_tag: DeliveryTag) {
        let queue = &self.context.queue;
        match self.context.channel.nack(delivery_tag, true, true).await {
            Ok(()) => warn!("Requeued unsettled deliveries on {queue} through tag {delivery_tag}"),
            Err(err) => error!("Could not requeue deliveries on {queue} through tag {delivery_tag}: {err}"),
        }
    }

    async fn admit(&self, delivery: &Delivery) -> Admission<T> {
        let Some(message_id) = delivery.message_id() else {
            return Admission::Discard("missing message id");
        };
        if self.context.idempotency.already_handled(message_id).await {
            return Admission::Discard("already handled");
        }
        match decode::<T>(&delivery.body) {
            (payload, Ok(event)) => Admission::Accept {
                message_id: message_id.to_string(),
                payload,
                event,
            },
            (_, Err(fault)) => {
                warn!(
                    "Message {message_id} on {} cannot be decoded: {fault}",
                    self.context.queue
                );
                Admission::Discard("undecodable payload")
            }
        }
    }

    async fn settle(&self, pool: BatchPool<T>) -> BusResult<()> {
        let context = &self.context;
        let BatchPool {
            message_ids,
            payloads,
            events,
            highest_tag,
            ..
        } = pool;

        let handler = self.handler.clone();
        let outcome = context
            .policy
            .execute(move |cancel| {
                let handler = handler.clone();
                let events = events.clone();
                async move { handler.handle(events, cancel).await }
            })
            .await;

        if outcome.succeeded() {
            context.notify_acked(&message_ids).await;
            context.channel.ack(highest_tag, true).await?;
            for message_id in &message_ids {
                context.idempotency.remember(message_id).await;
            }
            debug!(
                "Acked {} message(s) on {} through tag {highest_tag}",
                message_ids.len(),
                context.queue
            );
            return Ok(());
        }

        if let PolicyOutcome::Faulted(fault) = &outcome {
            warn!(
                "Batch of {} on {} failed: {fault}",
                message_ids.len(),
                context.queue
            );
        }
        let requeue = context
            .requeue_decision(&message_ids, outcome.fault(), &payloads)
            .await;
        context.channel.nack(highest_tag, true, requeue).await?;
        Ok(())
    }
}

fn highest_tag(deliveries: &[Delivery]) -> DeliveryTag {
    deliveries
        .iter()
        .map(|delivery| delivery.delivery_tag)
        .max()
        .unwrap_or_default()
}
