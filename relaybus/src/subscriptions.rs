use std::sync::Arc;

use log::{debug, error, info};
use parking_lot::Mutex;
use relaybus_broker::BrokerChannel;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::consumer::ConsumerState;

/// A running consumer: its channel and the task driving it.
pub struct Subscription {
    queue: String,
    channel: Arc<dyn BrokerChannel>,
    state: Arc<Mutex<ConsumerState>>,
    task: Option<JoinHandle<()>>,
}

impl Subscription {
    pub(crate) fn new(
        queue: String,
        channel: Arc<dyn BrokerChannel>,
        state: Arc<Mutex<ConsumerState>>,
        task: JoinHandle<()>,
    ) -> Self {
        Self {
            queue,
            channel,
            state,
            task: Some(task),
        }
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn state(&self) -> ConsumerState {
        *self.state.lock()
    }

    async fn stop(&mut self) {
        let Some(task) = self.task.take() else {
            return;
        };
        if let Err(err) = task.await {
            error!("Consumer task for {} failed: {err}", self.queue);
        }
        if let Err(err) = self.channel.close().await {
            debug!("Closing channel for {} failed: {err}", self.queue);
        }
    }
}

/// Owns every consumer channel and loop started by a bus.
#[derive(Default)]
pub struct Subscriptions {
    shutdown: CancellationToken,
    entries: Mutex<Vec<Subscription>>,
}

impl Subscriptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Token cancelled when the set shuts down.
    pub(crate) fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.child_token()
    }

    pub(crate) fn push(&self, subscription: Subscription) {
        self.entries.lock().push(subscription);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Queue name and state of every consumer, in registration order.
    pub fn states(&self) -> Vec<(String, ConsumerState)> {
        self.entries
            .lock()
            .iter()
            .map(|entry| (entry.queue.clone(), entry.state()))
            .collect()
    }

    pub fn state_of(&self, queue: &str) -> Option<ConsumerState> {
        self.entries
            .lock()
            .iter()
            .find(|entry| entry.queue == queue)
            .map(Subscription::state)
    }

    /// Stop every loop, wait for in-flight work, then close the channels.
    /// Unacked deliveries go back to their queues.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let mut entries = std::mem::take(&mut *self.entries.lock());
        if !entries.is_empty() {
            info!("Stopping {} consumer(s)", entries.len());
        }
        for entry in entries.iter_mut() {
            entry.stop().await;
        }
        let mut current = self.entries.lock();
        entries.append(&mut current);
        *current = entries;
    }
}
