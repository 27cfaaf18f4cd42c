//! Fire-and-forget and confirmed publishing of event records.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use relaybus_broker::{
    BrokerChannel, BrokerError, ConnectionLeaseProvider, MessageProperties, OutboundMessage,
};
use relaybus_models::core::EventRecord;

use crate::confirm::{ChunkHandler, ConfirmListener, ConfirmPipelines, ConfirmTracker};
use crate::resilience::ConnectivityRetry;
use crate::topology::{DelayQueueProvisioner, Exchange};

/// Header carrying the record's numeric id on fire-and-forget publishes.
pub const EVENT_ID_HEADER: &str = "EventId";

#[derive(Debug, Clone)]
pub struct PublishOptions {
    pub delay_seconds: u32,
    /// How long a confirmed publish waits for the broker to settle every message.
    pub timeout: Duration,
    /// Largest chunk handed to an observer callback.
    pub batch_size: usize,
}

impl Default for PublishOptions {
    fn default() -> Self {
        Self {
            delay_seconds: 0,
            timeout: Duration::from_millis(500),
            batch_size: 500,
        }
    }
}

/// Outcome of a confirmed publish.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfirmReport {
    pub acked: usize,
    pub nacked: usize,
    pub returned: usize,
    /// Messages the broker had not settled when the wait ended.
    pub unresolved: Vec<String>,
    /// Broker fault that stopped the publish.
    pub fault: Option<String>,
}

impl ConfirmReport {
    fn failed(events: &[EventRecord], fault: &BrokerError) -> Self {
        Self {
            unresolved: events.iter().map(|event| event.message_id.clone()).collect(),
            fault: Some(fault.to_string()),
            ..Self::default()
        }
    }

    /// Every message was acked: none nacked, returned, unresolved or faulted.
    pub fn all_acked(&self) -> bool {
        self.nacked == 0 && self.returned == 0 && self.unresolved.is_empty() && self.fault.is_none()
    }
}

/// Callbacks for a confirmed publish. Each receives the caller's records in
/// chunks of at most `PublishOptions::batch_size`.
#[async_trait]
pub trait PublishObserver: Send + Sync + 'static {
    async fn on_acked(&self, _events: Vec<EventRecord>) {}

    async fn on_nacked(&self, _events: Vec<EventRecord>) {}

    /// The broker could not route these messages to any queue.
    async fn on_returned(&self, _events: Vec<EventRecord>) {}
}

/// Observer that ignores every outcome.
pub struct SilentObserver;

impl PublishObserver for SilentObserver {}

#[derive(Clone, Copy)]
enum Outcome {
    Acked,
    Nacked,
    Returned,
}

/// Records still waiting for an outcome, by message id. A repeated id holds
/// one record per published copy and each resolved slot takes one of them.
type PendingRecords = Arc<Mutex<HashMap<String, VecDeque<EventRecord>>>>;

/// Maps message ids back to records before calling the observer.
struct RecordDispatch {
    outcome: Outcome,
    records: PendingRecords,
    observer: Arc<dyn PublishObserver>,
}

#[async_trait]
impl ChunkHandler for RecordDispatch {
    async fn handle_chunk(&self, message_ids: Vec<String>) {
        let events: Vec<EventRecord> = {
            let mut records = self.records.lock();
            message_ids
                .iter()
                .filter_map(|id| records.get_mut(id)?.pop_front())
                .collect()
        };
        if events.is_empty() {
            return;
        }
        match self.outcome {
            Outcome::Acked => self.observer.on_acked(events).await,
            Outcome::Nacked => self.observer.on_nacked(events).await,
            Outcome::Returned => self.observer.on_returned(events).await,
        }
    }
}

/// One record staged for a single publish call.
struct Envelope<'a> {
    event_id: i64,
    message_id: &'a str,
    body: &'a [u8],
    route_key: &'a str,
}

impl<'a> From<&'a EventRecord> for Envelope<'a> {
    fn from(event: &'a EventRecord) -> Self {
        Self {
            event_id: event.event_id,
            message_id: &event.message_id,
            body: event.content.as_bytes(),
            route_key: &event.event_type_name,
        }
    }
}

impl Envelope<'_> {
    fn into_message(self, exchange: String, routing_key: String, with_event_header: bool) -> OutboundMessage {
        let mut properties = MessageProperties::persistent(self.message_id);
        if with_event_header {
            properties = properties.with_header(EVENT_ID_HEADER, self.event_id);
        }
        OutboundMessage {
            exchange,
            routing_key,
            mandatory: true,
            properties,
            body: self.body.to_vec(),
        }
    }
}

pub struct PublishPipeline {
    lease: Arc<dyn ConnectionLeaseProvider>,
    exchange: Exchange,
    retry: ConnectivityRetry,
    parallelism: usize,
}

impl PublishPipeline {
    pub fn new(lease: Arc<dyn ConnectionLeaseProvider>, exchange: Exchange, retry: ConnectivityRetry) -> Self {
        let parallelism = std::thread::available_parallelism()
            .map(|count| count.get())
            .unwrap_or(1);
        Self {
            lease,
            exchange,
            retry,
            parallelism,
        }
    }

    /// Publish without confirms. Failures are logged, never returned.
    pub async fn publish_non_confirm(&self, events: &[EventRecord], delay_seconds: u32) {
        if events.is_empty() {
            return;
        }
        let channel = match self.open_channel().await {
            Ok(channel) => channel,
            Err(err) => {
                error!("Could not open a channel to publish {} event(s): {err}", events.len());
                return;
            }
        };

        let result = self.send(channel.as_ref(), events, delay_seconds, true).await;
        match result {
            Ok(()) => debug!("Published {} event(s) to {}", events.len(), self.exchange.name),
            Err(err) => error!(
                "Publishing {} event(s) to {} failed: {err}",
                events.len(),
                self.exchange.name
            ),
        }
        close(channel.as_ref()).await;
    }

    /// Publish with confirms, reporting outcomes to `observer` as they arrive.
    pub async fn publish(
        &self,
        events: &[EventRecord],
        observer: Arc<dyn PublishObserver>,
        options: &PublishOptions,
    ) -> ConfirmReport {
        if events.is_empty() {
            return ConfirmReport::default();
        }
        let channel = match self.open_channel().await {
            Ok(channel) => channel,
            Err(err) => {
                error!("Could not open a channel to publish {} event(s): {err}", events.len());
                return ConfirmReport::failed(events, &err);
            }
        };

        let report = match self
            .publish_with_confirms(channel.as_ref(), events, observer, options)
            .await
        {
            Ok(report) => report,
            Err(err) => {
                error!("Confirmed publish of {} event(s) failed: {err}", events.len());
                ConfirmReport::failed(events, &err)
            }
        };
        close(channel.as_ref()).await;
        report
    }

    /// `true` only if every record was acked within the timeout.
    pub async fn publish_confirmed(&self, events: &[EventRecord], options: &PublishOptions) -> bool {
        let report = self.publish(events, Arc::new(SilentObserver), options).await;
        if !report.unresolved.is_empty() {
            warn!(
                "{} event(s) unconfirmed after {:?}",
                report.unresolved.len(),
                options.timeout
            );
        }
        report.all_acked()
    }

    async fn publish_with_confirms(
        &self,
        channel: &dyn BrokerChannel,
        events: &[EventRecord],
        observer: Arc<dyn PublishObserver>,
        options: &PublishOptions,
    ) -> Result<ConfirmReport, BrokerError> {
        let signals = self
            .retry
            .run("confirm select", || channel.confirm_select())
            .await?;
        let messages = self.stage(channel, events, options.delay_seconds, false).await?;

        let mut tracker = ConfirmTracker::new(channel.next_publish_seq());
        for message in &messages {
            tracker.track(message.properties.message_id.clone().unwrap_or_default());
        }

        let mut pending: HashMap<String, VecDeque<EventRecord>> = HashMap::new();
        for event in events {
            pending
                .entry(event.message_id.clone())
                .or_default()
                .push_back(event.clone());
        }
        let records: PendingRecords = Arc::new(Mutex::new(pending));
        let dispatch = |outcome: Outcome| -> Arc<dyn ChunkHandler> {
            Arc::new(RecordDispatch {
                outcome,
                records: records.clone(),
                observer: observer.clone(),
            })
        };
        let pipelines = ConfirmPipelines::spawn(
            options.batch_size,
            self.parallelism,
            dispatch(Outcome::Acked),
            dispatch(Outcome::Nacked),
            dispatch(Outcome::Returned),
        );
        let listener = ConfirmListener::spawn(signals, tracker, &pipelines);

        let messages = messages.as_slice();
        let published = self
            .retry
            .run("batched publish", || channel.publish_batch(messages))
            .await;
        let settled = match &published {
            Ok(()) => listener.wait_settled(options.timeout).await,
            Err(_) => false,
        };

        let tracker = listener.seal().await;
        let counts = pipelines.seal().await;
        published?;

        let unresolved = match tracker {
            Some(tracker) => tracker.unresolved(),
            None => events.iter().map(|event| event.message_id.clone()).collect(),
        };
        if !settled {
            warn!(
                "Confirm wait on {} ended with {} of {} event(s) unresolved",
                self.exchange.name,
                unresolved.len(),
                events.len()
            );
        }
        info!(
            "Published {} event(s): {} acked, {} nacked, {} returned",
            events.len(),
            counts.acked,
            counts.nacked,
            counts.returned
        );
        Ok(ConfirmReport {
            acked: counts.acked,
            nacked: counts.nacked,
            returned: counts.returned,
            unresolved,
            fault: None,
        })
    }

    /// Build one outbound message per record, declaring delay queues as needed.
    async fn stage(
        &self,
        channel: &dyn BrokerChannel,
        events: &[EventRecord],
        delay_seconds: u32,
        with_event_header: bool,
    ) -> Result<Vec<OutboundMessage>, BrokerError> {
        let mut provisioner = DelayQueueProvisioner::new(channel, &self.exchange.name, &self.retry);
        let mut messages = Vec::with_capacity(events.len());
        for envelope in events.iter().map(Envelope::from) {
            let (exchange, routing_key) = if delay_seconds > 0 {
                let queue = provisioner.provision(envelope.route_key, delay_seconds).await?;
                (String::new(), queue)
            } else {
                (self.exchange.name.clone(), envelope.route_key.to_string())
            };
            messages.push(envelope.into_message(exchange, routing_key, with_event_header));
        }
        Ok(messages)
    }

    async fn send(
        &self,
        channel: &dyn BrokerChannel,
        events: &[EventRecord],
        delay_seconds: u32,
        with_event_header: bool,
    ) -> Result<(), BrokerError> {
        let messages = self
            .stage(channel, events, delay_seconds, with_event_header)
            .await?;
        let messages = messages.as_slice();
        self.retry
            .run("batched publish", || channel.publish_batch(messages))
            .await
    }

    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>, BrokerError> {
        let connection = self.lease.lease().await?;
        if !connection.is_connected() {
            info!("Publisher connection is down, reconnecting");
            if let Err(err) = connection.reconnect().await {
                warn!("Reconnect failed: {err}");
            }
        }
        let connection = connection.as_ref();
        self.retry
            .run("channel open", || connection.open_channel())
            .await
    }
}

async fn close(channel: &dyn BrokerChannel) {
    if let Err(err) = channel.close().await {
        debug!("Closing publish channel failed: {err}");
    }
}
