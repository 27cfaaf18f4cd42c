use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::warn;
use parking_lot::Mutex;
use thiserror::Error;

/// Namespace under which handled message keys are stored.
pub const IDEMPOTENCY_NAMESPACE: &str = "Events";

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache backend failed: {0}")]
    Backend(String),
    #[error("ttl {0:?} is out of range")]
    InvalidTtl(Duration),
}

/// Key recording that `message_id` was handled by the consumer of `queue`.
pub fn idempotency_key(queue: &str, message_id: &str) -> String {
    format!("{queue}:{message_id}")
}

#[async_trait]
pub trait IdempotencyCache: Send + Sync + 'static {
    async fn exists(&self, key: &str, namespace: &str) -> Result<bool, CacheError>;

    async fn add(
        &self,
        key: &str,
        value: bool,
        ttl: Duration,
        namespace: &str,
    ) -> Result<(), CacheError>;
}

/// Size at which `add` first sweeps expired entries.
const SWEEP_THRESHOLD: usize = 1024;

type Entries = HashMap<(String, String), (bool, DateTime<Utc>)>;

struct CacheState {
    entries: Entries,
    sweep_at: usize,
}

impl Default for CacheState {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
            sweep_at: SWEEP_THRESHOLD,
        }
    }
}

impl CacheState {
    fn prune(&mut self, now: DateTime<Utc>) {
        self.entries.retain(|_, (_, expires_at)| *expires_at > now);
        self.sweep_at = (self.entries.len() * 2).max(SWEEP_THRESHOLD);
    }
}

/// Process-local cache with wall-clock expiry. Expired entries are dropped
/// on lookup and swept in bulk whenever the map doubles in size.
#[derive(Clone, Default)]
pub struct InMemoryIdempotencyCache {
    state: Arc<Mutex<CacheState>>,
}

impl InMemoryIdempotencyCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop expired entries and return how many remain.
    pub fn prune(&self) -> usize {
        let mut state = self.state.lock();
        state.prune(Utc::now());
        state.entries.len()
    }

    /// Entries held, expired or not.
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl IdempotencyCache for InMemoryIdempotencyCache {
    async fn exists(&self, key: &str, namespace: &str) -> Result<bool, CacheError> {
        let entry = (namespace.to_string(), key.to_string());
        let mut state = self.state.lock();
        let Some((_, expires_at)) = state.entries.get(&entry) else {
            return Ok(false);
        };
        if *expires_at > Utc::now() {
            return Ok(true);
        }
        state.entries.remove(&entry);
        Ok(false)
    }

    async fn add(
        &self,
        key: &str,
        value: bool,
        ttl: Duration,
        namespace: &str,
    ) -> Result<(), CacheError> {
        let ttl_delta = chrono::Duration::from_std(ttl).map_err(|_| CacheError::InvalidTtl(ttl))?;
        let now = Utc::now();
        let mut state = self.state.lock();
        if state.entries.len() >= state.sweep_at {
            state.prune(now);
        }
        state
            .entries
            .insert((namespace.to_string(), key.to_string()), (value, now + ttl_delta));
        Ok(())
    }
}

/// Per-queue view of the cache. A zero window disables every lookup and write.
#[derive(Clone)]
pub struct IdempotencyGuard {
    cache: Arc<dyn IdempotencyCache>,
    queue: String,
    window: Duration,
}

impl IdempotencyGuard {
    pub fn new(cache: Arc<dyn IdempotencyCache>, queue: impl Into<String>, window: Duration) -> Self {
        Self {
            cache,
            queue: queue.into(),
            window,
        }
    }

    pub fn is_active(&self) -> bool {
        !self.window.is_zero()
    }

    /// Whether `message_id` was already handled. Cache faults count as "not seen".
    pub async fn already_handled(&self, message_id: &str) -> bool {
        if !self.is_active() {
            return false;
        }
        let key = idempotency_key(&self.queue, message_id);
        match self.cache.exists(&key, IDEMPOTENCY_NAMESPACE).await {
            Ok(found) => found,
            Err(err) => {
                warn!("Idempotency lookup for {key} failed: {err}");
                false
            }
        }
    }

    pub async fn remember(&self, message_id: &str) {
        if !self.is_active() {
            return;
        }
        let key = idempotency_key(&self.queue, message_id);
        if let Err(err) = self
            .cache
            .add(&key, true, self.window, IDEMPOTENCY_NAMESPACE)
            .await
        {
            warn!("Could not record {key} as handled: {err}");
        }
    }
}
