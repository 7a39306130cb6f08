//! # Cadence Resilience
//!
//! Fault-tolerance primitives wrapped around every external call:
//! - [`RetryPolicy`]: bounded retries with exponential backoff, jitter and a
//!   hard ceiling on elapsed time
//! - [`CircuitBreaker`]: closed / open / half-open isolation of one dependency
//! - [`BreakerRegistry`]: process-wide breakers keyed by dependency name
//!
//! The two compose: `policy.run(|| registry.call("llm-api", op()))`.

pub mod circuit_breaker;
pub mod registry;
pub mod retry;

pub use circuit_breaker::{
    BreakerConfig, BreakerError, CircuitBreaker, CircuitBreakerState, CircuitState, CircuitStats,
};
pub use registry::{BreakerRegistry, BreakerStateStore, MemoryBreakerStore};
pub use retry::{run_with_retry, GiveUpReason, RetryError, RetryPolicy};
