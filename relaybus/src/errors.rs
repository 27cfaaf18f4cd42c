use std::time::Duration;

use relaybus_broker::BrokerError;
use relaybus_models::errors::SendableError;
use thiserror::Error;

use crate::idempotency::CacheError;

/// Why a handler invocation did not succeed.
#[derive(Debug, Error)]
pub enum HandlerFault {
    #[error("handler failed: {0}")]
    Handler(SendableError),
    #[error("handler did not finish within {0:?}")]
    Timeout(Duration),
    #[error("circuit is open, handler not invoked")]
    CircuitOpen,
    #[error("handler task aborted: {0}")]
    Aborted(String),
    #[error("payload could not be deserialized: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum BusError {
    #[error(transparent)]
    Broker(#[from] BrokerError),
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error("invalid registration: {0}")]
    Registration(String),
}

pub type BusResult<T> = Result<T, BusError>;
