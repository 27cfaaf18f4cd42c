use std::future::Future;
use std::time::Duration;

use log::warn;
use relaybus_broker::BrokerError;

#[derive(Debug, Clone)]
pub struct ConnectivityRetryConfig {
    pub max_retries: u32,
}

impl Default for ConnectivityRetryConfig {
    fn default() -> Self {
        Self { max_retries: 3 }
    }
}

impl ConnectivityRetryConfig {
    /// Backoff before retry `attempt` (1-based): 2^attempt milliseconds.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        Duration::from_millis(2u64.saturating_pow(attempt))
    }
}

/// Retries broker calls that failed on connectivity. Every other error is
/// returned on first sight.
#[derive(Debug, Clone, Default)]
pub struct ConnectivityRetry {
    config: ConnectivityRetryConfig,
}

impl ConnectivityRetry {
    pub fn new(config: ConnectivityRetryConfig) -> Self {
        Self { config }
    }

    pub async fn run<T, F, Fut>(&self, operation: &str, mut call: F) -> Result<T, BrokerError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, BrokerError>>,
    {
        let mut attempt = 0;
        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_connectivity() && attempt < self.config.max_retries => {
                    attempt += 1;
                    let delay = self.config.delay_for_attempt(attempt);
                    warn!(
                        "{operation} failed ({err}), retry {attempt}/{} in {delay:?}",
                        self.config.max_retries
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    #[test]
    fn backoff_doubles_per_attempt() {
        let config = ConnectivityRetryConfig::default();
        assert_eq!(config.delay_for_attempt(1), Duration::from_millis(2));
        assert_eq!(config.delay_for_attempt(2), Duration::from_millis(4));
        assert_eq!(config.delay_for_attempt(3), Duration::from_millis(8));
    }

    #[tokio::test(start_paused = true)]
    async fn connectivity_faults_are_retried_until_success() {
        let calls = &AtomicU32::new(0);
        let result = ConnectivityRetry::default()
            .run("publish", move || async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(BrokerError::Socket("reset".into()))
                } else {
                    Ok(7)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_three_retries() {
        let calls = &AtomicU32::new(0);
        let result: Result<(), _> = ConnectivityRetry::default()
            .run("publish", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(BrokerError::AlreadyClosed("channel 1".into()))
            })
            .await;

        assert!(matches!(result, Err(BrokerError::AlreadyClosed(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn other_faults_are_not_retried() {
        let calls = &AtomicU32::new(0);
        let result: Result<(), _> = ConnectivityRetry::default()
            .run("declare", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(BrokerError::PreconditionFailed("queue".into()))
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
