use thiserror::Error;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("broker unreachable: {0}")]
    Unreachable(String),
    #[error("socket fault: {0}")]
    Socket(String),
    #[error("broker i/o fault: {0}")]
    Io(#[from] std::io::Error),
    #[error("channel already closed: {0}")]
    AlreadyClosed(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("precondition failed: {0}")]
    PreconditionFailed(String),
    #[error("unknown delivery tag: {0}")]
    UnknownDelivery(u64),
    #[error("internal broker error: {0}")]
    Internal(String),
}

impl BrokerError {
    /// Faults caused by the transport rather than by the request itself.
    /// Only these are worth retrying.
    pub fn is_connectivity(&self) -> bool {
        matches!(
            self,
            BrokerError::Unreachable(_)
                | BrokerError::Socket(_)
                | BrokerError::Io(_)
                | BrokerError::AlreadyClosed(_)
        )
    }
}
