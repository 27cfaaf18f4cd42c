use std::sync::Arc;

use async_trait::async_trait;
use log::{error, warn};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::{JoinHandle, JoinSet};

/// Receives grouped message ids from a batcher.
#[async_trait]
pub trait ChunkHandler: Send + Sync + 'static {
    async fn handle_chunk(&self, message_ids: Vec<String>);
}

/// Non-blocking producer side of a batcher.
#[derive(Clone)]
pub struct BatchSender {
    name: &'static str,
    sender: mpsc::UnboundedSender<String>,
}

impl BatchSender {
    pub fn push(&self, message_id: String) {
        if self.sender.send(message_id).is_err() {
            warn!("{} pipeline already sealed, dropping id", self.name);
        }
    }
}

/// Groups ids into chunks of at most `batch_size` and hands each chunk to a
/// bounded pool of dispatch tasks.
pub struct ConfirmBatcher {
    sender: BatchSender,
    worker: JoinHandle<usize>,
}

impl ConfirmBatcher {
    pub fn spawn(
        name: &'static str,
        batch_size: usize,
        parallelism: usize,
        handler: Arc<dyn ChunkHandler>,
    ) -> Self {
        let (sender, mut receiver) = mpsc::unbounded_channel::<String>();
        let batch_size = batch_size.max(1);
        let worker = tokio::spawn(async move {
            let permits = Arc::new(Semaphore::new(parallelism.max(1)));
            let mut dispatches = JoinSet::new();
            let mut chunk = Vec::with_capacity(batch_size);
            let mut dispatched = 0;

            while let Some(message_id) = receiver.recv().await {
                chunk.push(message_id);
                if chunk.len() >= batch_size {
                    dispatched += chunk.len();
                    let full = std::mem::replace(&mut chunk, Vec::with_capacity(batch_size));
                    dispatch(&mut dispatches, &permits, &handler, full).await;
                }
            }
            if !chunk.is_empty() {
                dispatched += chunk.len();
                dispatch(&mut dispatches, &permits, &handler, chunk).await;
            }

            while let Some(result) = dispatches.join_next().await {
                if let Err(err) = result {
                    error!("{name} callback failed: {err}");
                }
            }
            dispatched
        });

        Self {
            sender: BatchSender { name, sender },
            worker,
        }
    }

    pub fn sender(&self) -> BatchSender {
        self.sender.clone()
    }

    /// Stop accepting ids once every sender is gone, flush the partial chunk
    /// and wait for all dispatches. Returns how many ids were dispatched.
    pub async fn seal(self) -> usize {
        let name = self.sender.name;
        drop(self.sender);
        match self.worker.await {
            Ok(dispatched) => dispatched,
            Err(err) => {
                error!("{name} pipeline worker failed: {err}");
                0
            }
        }
    }
}

async fn dispatch(
    dispatches: &mut JoinSet<()>,
    permits: &Arc<Semaphore>,
    handler: &Arc<dyn ChunkHandler>,
    chunk: Vec<String>,
) {
    let Ok(permit) = permits.clone().acquire_owned().await else {
        return;
    };
    let handler = handler.clone();
    dispatches.spawn(async move {
        handler.handle_chunk(chunk).await;
        drop(permit);
    });
}
