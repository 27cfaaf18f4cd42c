//! Handler execution policy: fallback around a circuit breaker around a
//! retry around a timeout.

use std::future::Future;
use std::time::Duration;

use log::{debug, error, warn};
use relaybus_models::errors::SendableError;
use tokio_util::sync::CancellationToken;

use crate::errors::HandlerFault;
use crate::resilience::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};

#[derive(Debug, Clone)]
pub struct HandlerPolicyConfig {
    pub timeout: Duration,
    /// Retries after the first attempt, on faults only.
    pub max_retries: u32,
    pub circuit: CircuitBreakerConfig,
}

impl Default for HandlerPolicyConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(2),
            max_retries: 3,
            circuit: CircuitBreakerConfig::default(),
        }
    }
}

/// Result of running a handler through the policy. Never an error.
#[derive(Debug)]
pub enum PolicyOutcome {
    Handled,
    /// The handler returned `false`.
    Declined,
    Faulted(HandlerFault),
}

impl PolicyOutcome {
    pub fn succeeded(&self) -> bool {
        matches!(self, PolicyOutcome::Handled)
    }

    pub fn fault(&self) -> Option<&HandlerFault> {
        match self {
            PolicyOutcome::Faulted(fault) => Some(fault),
            _ => None,
        }
    }
}

/// One policy per registration; the breaker state is shared by every call.
pub struct HandlerPolicy {
    name: String,
    config: HandlerPolicyConfig,
    breaker: CircuitBreaker,
}

impl HandlerPolicy {
    pub fn new(name: impl Into<String>, config: HandlerPolicyConfig) -> Self {
        let name = name.into();
        let breaker = CircuitBreaker::new(name.clone(), config.circuit.clone());
        Self {
            name,
            config,
            breaker,
        }
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Run `action` under the policy. Each attempt gets a fresh cancellation
    /// token that fires when the attempt times out.
    pub async fn execute<F, Fut>(&self, action: F) -> PolicyOutcome
    where
        F: Fn(CancellationToken) -> Fut + Send + Sync,
        Fut: Future<Output = Result<bool, SendableError>> + Send + 'static,
    {
        if !self.breaker.try_acquire() {
            debug!("{}: circuit open, skipping handler", self.name);
            return PolicyOutcome::Faulted(HandlerFault::CircuitOpen);
        }

        match self.retry(&action).await {
            Ok(true) => {
                self.breaker.record_success();
                PolicyOutcome::Handled
            }
            Ok(false) => {
                self.breaker.record_failure();
                PolicyOutcome::Declined
            }
            Err(fault) => {
                self.breaker.record_failure();
                error!("{}: handler gave up: {fault}", self.name);
                PolicyOutcome::Faulted(fault)
            }
        }
    }

    async fn retry<F, Fut>(&self, action: &F) -> Result<bool, HandlerFault>
    where
        F: Fn(CancellationToken) -> Fut + Send + Sync,
        Fut: Future<Output = Result<bool, SendableError>> + Send + 'static,
    {
        let mut attempt = 0;
        loop {
            match self.attempt(action).await {
                Ok(handled) => return Ok(handled),
                Err(fault) if attempt < self.config.max_retries => {
                    attempt += 1;
                    warn!(
                        "{}: attempt {attempt} of {} failed: {fault}",
                        self.name,
                        self.config.max_retries + 1
                    );
                }
                Err(fault) => return Err(fault),
            }
        }
    }

    async fn attempt<F, Fut>(&self, action: &F) -> Result<bool, HandlerFault>
    where
        F: Fn(CancellationToken) -> Fut + Send + Sync,
        Fut: Future<Output = Result<bool, SendableError>> + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let task = tokio::spawn(action(cancel.clone()));
        match tokio::time::timeout(self.config.timeout, task).await {
            Ok(Ok(Ok(handled))) => Ok(handled),
            Ok(Ok(Err(err))) => Err(HandlerFault::Handler(err)),
            Ok(Err(join)) => Err(HandlerFault::Aborted(join.to_string())),
            Err(_) => {
                // The task is left running; it only sees the token.
                cancel.cancel();
                Err(HandlerFault::Timeout(self.config.timeout))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use relaybus_models::errors::RuntimeError;

    use super::*;
    use crate::resilience::CircuitState;

    fn policy() -> HandlerPolicy {
        HandlerPolicy::new("orders", HandlerPolicyConfig::default())
    }

    fn failing(calls: Arc<AtomicU32>) -> impl Fn(CancellationToken) -> futures_util::future::Ready<Result<bool, SendableError>> {
        move |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            futures_util::future::ready(Err(RuntimeError::new("boom", "handler exploded").boxed()))
        }
    }

    #[tokio::test]
    async fn faults_are_retried_three_times() {
        let calls = Arc::new(AtomicU32::new(0));
        let outcome = policy().execute(failing(calls.clone())).await;

        assert!(matches!(outcome, PolicyOutcome::Faulted(HandlerFault::Handler(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn false_result_is_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let outcome = policy()
            .execute(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Ok(false) }
            })
            .await;

        assert!(matches!(outcome, PolicyOutcome::Declined));
        assert!(!outcome.succeeded());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_cancels_the_attempt_token() {
        let config = HandlerPolicyConfig {
            max_retries: 0,
            ..HandlerPolicyConfig::default()
        };
        let policy = HandlerPolicy::new("slow", config);
        let (tx, rx) = tokio::sync::oneshot::channel();
        let tx = parking_lot::Mutex::new(Some(tx));

        let outcome = policy
            .execute(|cancel: CancellationToken| {
                let tx = tx.lock().take();
                async move {
                    cancel.cancelled().await;
                    if let Some(tx) = tx {
                        let _ = tx.send(());
                    }
                    Ok(true)
                }
            })
            .await;

        assert!(matches!(outcome, PolicyOutcome::Faulted(HandlerFault::Timeout(_))));
        rx.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn open_circuit_skips_the_handler() {
        let policy = policy();
        let calls = Arc::new(AtomicU32::new(0));
        for _ in 0..8 {
            policy.execute(failing(calls.clone())).await;
        }
        assert_eq!(policy.breaker().state(), CircuitState::Open);

        let before = calls.load(Ordering::SeqCst);
        let outcome = policy.execute(failing(calls.clone())).await;
        assert!(matches!(outcome, PolicyOutcome::Faulted(HandlerFault::CircuitOpen)));
        assert_eq!(calls.load(Ordering::SeqCst), before);

        tokio::time::advance(Duration::from_secs(30)).await;
        let outcome = policy.execute(|_| async { Ok(true) }).await;
        assert!(outcome.succeeded());
        assert_eq!(policy.breaker().state(), CircuitState::Closed);
    }
}
