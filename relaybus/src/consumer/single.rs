use std::sync::Arc;

use log::{debug, error, info, warn};
use relaybus_broker::{Delivery, DeliveryStream};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::consumer::{decode, ConsumerContext, ConsumerSetup, ConsumerState};
use crate::errors::BusResult;
use crate::handler::{EventHandler, EventPayload};
use crate::resilience::PolicyOutcome;
use crate::subscriptions::Subscription;

/// Push consumer handing each delivery to the handler on the receiving task.
pub(crate) struct SingleMessageConsumer<T: EventPayload> {
    context: ConsumerContext,
    handler: Arc<dyn EventHandler<T>>,
}

impl<T: EventPayload> SingleMessageConsumer<T> {
    pub async fn start(
        setup: ConsumerSetup,
        handler: Arc<dyn EventHandler<T>>,
        shutdown: CancellationToken,
    ) -> BusResult<Subscription> {
        let context = ConsumerContext::establish(setup).await?;
        let consumer_tag = format!("relaybus-{}", Uuid::new_v4());
        let deliveries = context
            .channel
            .consume(&context.queue, &consumer_tag)
            .await?;
        context.set_state(ConsumerState::Consuming);
        info!("Consuming {} as {consumer_tag}", context.queue);

        let queue = context.queue.clone();
        let channel = context.channel.clone();
        let state = context.state.clone();
        let consumer = Self { context, handler };
        let task = tokio::spawn(consumer.run(deliveries, shutdown));
        Ok(Subscription::new(queue, channel, state, task))
    }

    async fn run(self, mut deliveries: DeliveryStream, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    self.context.set_state(ConsumerState::Stopped);
                    debug!("Consumer on {} stopped", self.context.queue);
                    return;
                }
                delivery = deliveries.recv() => match delivery {
                    Some(delivery) => self.process(delivery).await,
                    None => {
                        self.context.set_state(ConsumerState::Cancelled);
                        warn!("Consumer on {} was cancelled by the broker", self.context.queue);
                        return;
                    }
                },
            }
        }
    }

    async fn process(&self, delivery: Delivery) {
        let context = &self.context;
        context.ensure_connected().await;

        let Some(message_id) = delivery.message_id().map(str::to_string) else {
            warn!("Discarding delivery {} on {} without message id", delivery.delivery_tag, context.queue);
            self.ack(&delivery).await;
            return;
        };

        if context.idempotency.already_handled(&message_id).await {
            debug!("Message {message_id} on {} already handled, acking", context.queue);
            self.ack(&delivery).await;
            return;
        }

        let (payload, decoded) = decode::<T>(&delivery.body);
        let outcome = match decoded {
            Ok(event) => {
                let handler = self.handler.clone();
                context
                    .policy
                    .execute(move |cancel| {
                        let handler = handler.clone();
                        let event = event.clone();
                        async move { handler.handle(event, cancel).await }
                    })
                    .await
            }
            Err(fault) => PolicyOutcome::Faulted(fault),
        };

        let message_ids = [message_id];
        if outcome.succeeded() {
            context.notify_acked(&message_ids).await;
            self.ack(&delivery).await;
            context.idempotency.remember(&message_ids[0]).await;
            return;
        }

        if let Some(fault) = outcome.fault() {
            warn!("Message {} on {} failed: {fault}", message_ids[0], context.queue);
        } else {
            debug!("Message {} on {} declined by handler", message_ids[0], context.queue);
        }
        let requeue = context
            .requeue_decision(&message_ids, outcome.fault(), &[payload])
            .await;
        if let Err(err) = context.channel.reject(delivery.delivery_tag, requeue).await {
            error!(
                "Rejecting {} on {} failed: {err}",
                message_ids[0], context.queue
            );
        }
    }

    async fn ack(&self, delivery: &Delivery) {
        if let Err(err) = self.context.channel.ack(delivery.delivery_tag, false).await {
            error!(
                "Acking delivery {} on {} failed: {err}",
                delivery.delivery_tag, self.context.queue
            );
        }
    }
}
