//! Publisher confirm handling: sequence tracking, signal routing and the
//! three outcome pipelines.

pub mod batcher;
pub mod tracker;

use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, warn};
use relaybus_broker::{ConfirmSignal, ConfirmStream};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub use batcher::{BatchSender, ChunkHandler, ConfirmBatcher};
pub use tracker::ConfirmTracker;

/// Ids dispatched per outcome once the pipelines drained.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineCounts {
    pub acked: usize,
    pub nacked: usize,
    pub returned: usize,
}

pub struct ConfirmPipelines {
    acked: ConfirmBatcher,
    nacked: ConfirmBatcher,
    returned: ConfirmBatcher,
}

impl ConfirmPipelines {
    pub fn spawn(
        batch_size: usize,
        parallelism: usize,
        on_acked: Arc<dyn ChunkHandler>,
        on_nacked: Arc<dyn ChunkHandler>,
        on_returned: Arc<dyn ChunkHandler>,
    ) -> Self {
        Self {
            acked: ConfirmBatcher::spawn("ack", batch_size, parallelism, on_acked),
            nacked: ConfirmBatcher::spawn("nack", batch_size, parallelism, on_nacked),
            returned: ConfirmBatcher::spawn("return", batch_size, parallelism, on_returned),
        }
    }

    fn senders(&self) -> SignalSinks {
        SignalSinks {
            acked: self.acked.sender(),
            nacked: self.nacked.sender(),
            returned: self.returned.sender(),
        }
    }

    pub async fn seal(self) -> PipelineCounts {
        let (acked, nacked, returned) =
            tokio::join!(self.acked.seal(), self.nacked.seal(), self.returned.seal());
        PipelineCounts {
            acked,
            nacked,
            returned,
        }
    }
}

struct SignalSinks {
    acked: BatchSender,
    nacked: BatchSender,
    returned: BatchSender,
}

/// Task draining a channel's confirm stream into the tracker and pipelines.
pub struct ConfirmListener {
    settled: Arc<Notify>,
    seal: CancellationToken,
    task: JoinHandle<ConfirmTracker>,
}

impl ConfirmListener {
    pub fn spawn(signals: ConfirmStream, tracker: ConfirmTracker, pipelines: &ConfirmPipelines) -> Self {
        let settled = Arc::new(Notify::new());
        let seal = CancellationToken::new();
        let sinks = pipelines.senders();
        let task = tokio::spawn(listen(signals, tracker, sinks, settled.clone(), seal.clone()));
        Self {
            settled,
            seal,
            task,
        }
    }

    /// Wait until every tracked slot is resolved. `false` on timeout.
    pub async fn wait_settled(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.settled.notified())
            .await
            .is_ok()
    }

    /// Process signals already received, then stop. `None` if the task died.
    pub async fn seal(self) -> Option<ConfirmTracker> {
        self.seal.cancel();
        match self.task.await {
            Ok(tracker) => Some(tracker),
            Err(err) => {
                error!("Confirm listener failed: {err}");
                None
            }
        }
    }
}

async fn listen(
    mut signals: ConfirmStream,
    mut tracker: ConfirmTracker,
    sinks: SignalSinks,
    settled: Arc<Notify>,
    seal: CancellationToken,
) -> ConfirmTracker {
    if tracker.is_settled() {
        settled.notify_one();
    }
    loop {
        tokio::select! {
            biased;
            signal = signals.recv() => match signal {
                Some(signal) => apply(&mut tracker, &sinks, signal),
                None => {
                    debug!("Confirm stream closed with {} slot(s) outstanding", tracker.outstanding());
                    break;
                }
            },
            _ = seal.cancelled() => {
                while let Ok(signal) = signals.try_recv() {
                    apply(&mut tracker, &sinks, signal);
                }
                break;
            }
        }
        if tracker.is_settled() {
            settled.notify_one();
        }
    }
    tracker
}

fn apply(tracker: &mut ConfirmTracker, sinks: &SignalSinks, signal: ConfirmSignal) {
    match signal {
        ConfirmSignal::Return {
            message_id: Some(message_id),
            reply_code,
            reply_text,
        } => {
            debug!("Message {message_id} returned: {reply_code} {reply_text}");
            if tracker.mark_returned(&message_id) {
                sinks.returned.push(message_id);
            }
        }
        ConfirmSignal::Return {
            message_id: None,
            reply_code,
            ..
        } => warn!("Broker returned a message without id ({reply_code})"),
        ConfirmSignal::Ack {
            delivery_tag,
            multiple,
        } => {
            for message_id in tracker.resolve(delivery_tag, multiple) {
                sinks.acked.push(message_id);
            }
        }
        ConfirmSignal::Nack {
            delivery_tag,
            multiple,
        } => {
            for message_id in tracker.resolve(delivery_tag, multiple) {
                sinks.nacked.push(message_id);
            }
        }
    }
}
