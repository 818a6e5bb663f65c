//! Orchestration layer for conductor.
//!
//! This module drives a [`TaskGraph`](crate::core::TaskGraph) to completion:
//! the round-based execution engine, failure classification and retry,
//! the adaptive timing model, and an executor wrapper that ties retry and
//! timing together around a caller-supplied executor.

mod engine;
mod retry;
mod supervised;
mod timing;

pub use engine::{
    EngineEvent, ExecutionEngine, ExecutionReport, RoundObserver, RoundSummary, TaskExecutor,
    TaskFailure, TaskOutcome, STRANDED_REASON,
};
pub use retry::{
    classify_assistant_error, classify_error, classify_failure, classify_result_error,
    get_retry_delay, should_trip_circuit_breaker, with_retry, CircuitBreaker, ClassifiedError,
    ErrorClass, Retried, RetryObserver, RetryPolicy, CIRCUIT_BREAKER_THRESHOLD, RETRY_DELAYS_MS,
};
pub use supervised::SupervisedExecutor;
pub use timing::{
    AdaptiveTiming, AgentEffectiveness, AgentSession, EffectivenessSample, TimingSnapshot,
    MAX_EMPTY_ROUNDS, MAX_SESSION_AGE_ROUNDS, MIN_ADAPTIVE_TIMEOUT_MS, RUNTIME_HISTORY_CAP,
    SPEED_SPREAD_THRESHOLD, TIMEOUT_FLOOR_FRACTION,
};
