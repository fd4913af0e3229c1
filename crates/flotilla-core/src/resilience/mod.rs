//! Resilience: 外部サービス呼び出しのための circuit breaker + retry。

mod circuit;
mod retry;

pub use circuit::{CircuitBreaker, CircuitSnapshot, CircuitState};
pub use retry::{Resilience, RetryConfig, RetryProfiles};
