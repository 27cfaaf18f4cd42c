//! Policies wrapping handler execution and broker calls.

pub mod circuit_breaker;
pub mod connectivity;
pub mod policy;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use connectivity::{ConnectivityRetry, ConnectivityRetryConfig};
pub use policy::{HandlerPolicy, HandlerPolicyConfig, PolicyOutcome};
