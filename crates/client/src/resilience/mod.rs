//! Failure handling around the transport: classification, retry with backoff,
//! per-origin circuit breaking and bounded scheduling.

pub mod breaker;
pub mod classify;
pub mod retry;
pub mod scheduler;

pub use breaker::{BreakerConfig, CircuitBreaker, CircuitState, origin_key};
pub use classify::{classify, kind_from_message};
pub use retry::{RetryPolicy, backoff_delay, backoff_delay_with, retry};
pub use scheduler::{RequestScheduler, SchedulerConfig};
