//! Rolling-window circuit breaker guarding handler execution.

use std::collections::VecDeque;
use std::time::Duration;

use log::{info, warn};
use parking_lot::Mutex;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Calls flow through and outcomes are sampled.
    Closed,
    /// Calls are rejected without reaching the handler.
    Open,
    /// One probe call is admitted to test recovery.
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Share of failed calls in the window that opens the circuit.
    pub failure_ratio: f64,
    pub sampling_window: Duration,
    /// Calls that must be observed in the window before the ratio applies.
    pub minimum_throughput: usize,
    pub break_duration: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_ratio: 0.5,
            sampling_window: Duration::from_secs(10),
            minimum_throughput: 8,
            break_duration: Duration::from_secs(30),
        }
    }
}

struct BreakerState {
    state: CircuitState,
    outcomes: VecDeque<(Instant, bool)>,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            state: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                outcomes: VecDeque::new(),
                opened_at: None,
                probe_in_flight: false,
            }),
        }
    }

    /// Current state. An open circuit whose break has elapsed reports `HalfOpen`.
    pub fn state(&self) -> CircuitState {
        let state = self.state.lock();
        match (state.state, state.opened_at) {
            (CircuitState::Open, Some(opened_at))
                if opened_at.elapsed() >= self.config.break_duration =>
            {
                CircuitState::HalfOpen
            }
            (current, _) => current,
        }
    }

    /// Ask to run one call. `false` means the call must fail fast.
    pub fn try_acquire(&self) -> bool {
        let mut state = self.state.lock();
        match state.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let elapsed = state
                    .opened_at
                    .map(|opened_at| opened_at.elapsed() >= self.config.break_duration)
                    .unwrap_or(true);
                if elapsed {
                    info!("Circuit {} half-open, admitting a probe", self.name);
                    state.state = CircuitState::HalfOpen;
                    state.probe_in_flight = true;
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => {
                if state.probe_in_flight {
                    false
                } else {
                    state.probe_in_flight = true;
                    true
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut state = self.state.lock();
        match state.state {
            CircuitState::HalfOpen => {
                info!("Circuit {} closed after a successful probe", self.name);
                state.state = CircuitState::Closed;
                state.outcomes.clear();
                state.opened_at = None;
                state.probe_in_flight = false;
            }
            CircuitState::Closed => {
                let now = Instant::now();
                state.outcomes.push_back((now, true));
                self.prune(&mut state, now);
            }
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self) {
        let mut state = self.state.lock();
        let now = Instant::now();
        match state.state {
            CircuitState::HalfOpen => {
                warn!("Circuit {} probe failed, reopening", self.name);
                state.state = CircuitState::Open;
                state.opened_at = Some(now);
                state.probe_in_flight = false;
            }
            CircuitState::Closed => {
                state.outcomes.push_back((now, false));
                self.prune(&mut state, now);

                let total = state.outcomes.len();
                let failures = state.outcomes.iter().filter(|(_, ok)| !ok).count();
                if total >= self.config.minimum_throughput
                    && failures as f64 / total as f64 >= self.config.failure_ratio
                {
                    warn!(
                        "Circuit {} opened: {failures}/{total} calls failed within {:?}",
                        self.name, self.config.sampling_window
                    );
                    state.state = CircuitState::Open;
                    state.opened_at = Some(now);
                    state.outcomes.clear();
                }
            }
            CircuitState::Open => {}
        }
    }

    fn prune(&self, state: &mut BreakerState, now: Instant) {
        while state
            .outcomes
            .front()
            .is_some_and(|(at, _)| now.duration_since(*at) > self.config.sampling_window)
        {
            state.outcomes.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new("test", CircuitBreakerConfig::default())
    }

    #[tokio::test(start_paused = true)]
    async fn stays_closed_below_minimum_throughput() {
        let breaker = breaker();
        for _ in 0..7 {
            assert!(breaker.try_acquire());
            breaker.record_failure();
        }
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn opens_at_half_failures_and_half_opens_after_break() {
        let breaker = breaker();
        for i in 0..8 {
            assert!(breaker.try_acquire());
            if i % 2 == 0 {
                breaker.record_success();
            } else {
                breaker.record_failure();
            }
        }
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.try_acquire());

        tokio::time::advance(Duration::from_secs(29)).await;
        assert!(!breaker.try_acquire());

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(breaker.try_acquire());
        // only one probe at a time
        assert!(!breaker.try_acquire());

        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_probe_reopens() {
        let breaker = breaker();
        for _ in 0..8 {
            breaker.try_acquire();
            breaker.record_failure();
        }
        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(breaker.try_acquire());
        breaker.record_failure();

        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.try_acquire());
    }

    #[tokio::test(start_paused = true)]
    async fn outcomes_outside_the_window_are_forgotten() {
        let breaker = breaker();
        for _ in 0..7 {
            breaker.try_acquire();
            breaker.record_failure();
        }
        tokio::time::advance(Duration::from_secs(11)).await;
        breaker.try_acquire();
        breaker.record_failure();

        assert_eq!(breaker.state(), CircuitState::Closed);
    }
}
