use std::time::Duration;

use clap::Args;
use relaybus_broker::ExchangeKind;

/// Event bus settings. Binaries flatten this into their own CLI.
#[derive(Args, Debug, Clone)]
pub struct BusConfig {
    /// Exchange every event is published to.
    #[arg(long = "bus-exchange", default_value = "amq.topic")]
    pub exchange: String,

    #[arg(long = "bus-exchange-type", default_value = "topic")]
    pub exchange_type: ExchangeKind,

    /// Prefetch for single-message consumers.
    #[arg(long = "bus-prefetch", default_value_t = 1)]
    pub prefetch: u16,

    /// Retries for broker connectivity faults.
    #[arg(long = "bus-retry-count", default_value_t = 3)]
    pub retry_count: u32,

    /// Seconds a handled message id is remembered. 0 disables the check.
    #[arg(long = "bus-idempotency-seconds", default_value_t = 15)]
    pub idempotency_seconds: u64,

    /// Messages pulled per iteration by batch consumers.
    #[arg(long = "bus-batch-size", default_value_t = 50)]
    pub batch_size: u16,

    /// Idle wait of a batch consumer after an empty pull.
    #[arg(long = "bus-poll-interval-ms", default_value_t = 100)]
    pub poll_interval_ms: u64,

    /// How long a confirmed publish waits for broker confirms.
    #[arg(long = "bus-confirm-timeout-ms", default_value_t = 500)]
    pub confirm_timeout_ms: u64,

    /// Message ids per confirm callback invocation.
    #[arg(long = "bus-confirm-batch-size", default_value_t = 500)]
    pub confirm_batch_size: usize,
}

impl BusConfig {
    pub fn idempotency_window(&self) -> Duration {
        Duration::from_secs(self.idempotency_seconds)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn confirm_timeout(&self) -> Duration {
        Duration::from_millis(self.confirm_timeout_ms)
    }
}
