//! Failure classification and retry policy for agent executions.
//!
//! Every failure an executor sees is sorted into one of three classes:
//! - `Transient`: worth another attempt after a backoff delay
//! - `Fatal`: retrying cannot help (credentials, billing, missing binary, user abort)
//! - `Limit`: a benign cap was hit (turns, budget); stop without reporting an error
//!
//! Graph-level failure handling never retries. Retries live here and are
//! driven from inside an executor via [`with_retry`].

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::LazyLock;
use std::time::Duration;
use thiserror::Error;

use crate::{clog_debug, clog_warn};

/// Backoff schedule in milliseconds, indexed by 1-based attempt.
pub const RETRY_DELAYS_MS: [u64; 5] = [2_000, 5_000, 15_000, 30_000, 60_000];

/// Consecutive failures at which the circuit breaker trips.
pub const CIRCUIT_BREAKER_THRESHOLD: i64 = 3;

/// Messages that make a retry pointless. Checked before the transient set.
static FATAL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b40[13]\b|unauthori[sz]ed|forbidden|authentication|invalid[ _]api[ _]key|permission denied|billing|payment required|credit balance|insufficient[ _]quota|quota exceeded|\bENOENT\b|spawn\b.*\bfailed|failed to spawn|command not found|no such file or directory|aborted by user|user abort|cancelled by user|\bAbortError\b",
    )
    .unwrap()
});

static TRANSIENT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)rate[ _-]?limit|too many requests|\b429\b|overloaded|\bECONNRESET\b|\bECONNREFUSED\b|\bETIMEDOUT\b|\bEPIPE\b|\bEAI_AGAIN\b|socket hang up|connection (reset|refused|closed)|timed? ?out|network|\b5\d\d\b|internal server error|bad gateway|service unavailable|exit(ed)? (with )?(code|status) [12]\b",
    )
    .unwrap()
});

/// How a failure should be treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorClass {
    Transient,
    Fatal,
    Limit,
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorClass::Transient => write!(f, "transient"),
            ErrorClass::Fatal => write!(f, "fatal"),
            ErrorClass::Limit => write!(f, "limit"),
        }
    }
}

/// Classify an error message. Unrecognized or empty input is transient.
pub fn classify_error(message: &str) -> ErrorClass {
    classify_failure(message, None)
}

/// Classify an error message together with the process exit code, if any.
///
/// Exit codes 1 and 2 are transient; 126 and 127 (cannot execute, command
/// not found) are fatal. A fatal message pattern wins over everything.
pub fn classify_failure(message: &str, exit_code: Option<i32>) -> ErrorClass {
    if FATAL_RE.is_match(message) || matches!(exit_code, Some(126 | 127)) {
        return ErrorClass::Fatal;
    }
    if TRANSIENT_RE.is_match(message) || matches!(exit_code, Some(1 | 2)) {
        return ErrorClass::Transient;
    }
    ErrorClass::Transient
}

/// Map an in-band assistant error code. Unknown codes return `None`.
pub fn classify_assistant_error(code: &str) -> Option<ErrorClass> {
    match code {
        "rate_limit" | "overloaded" | "server_error" | "api_error" | "network_error"
        | "timeout" => Some(ErrorClass::Transient),
        "authentication_failed" | "authentication_error" | "billing_error"
        | "permission_error" | "invalid_request" => Some(ErrorClass::Fatal),
        "max_tokens" | "max_output_tokens" => Some(ErrorClass::Limit),
        _ => None,
    }
}

/// Map a result subtype reported when a run ends. Unknown subtypes return `None`.
pub fn classify_result_error(subtype: &str) -> Option<ErrorClass> {
    match subtype {
        "error_max_turns" | "error_max_budget_usd" => Some(ErrorClass::Limit),
        "error_during_execution" => Some(ErrorClass::Transient),
        "error_authentication" | "error_permission_denied" => Some(ErrorClass::Fatal),
        _ => None,
    }
}

/// Backoff delay before the retry that follows `attempt` (1-based).
///
/// Attempts past the end of the table reuse its last entry.
pub fn get_retry_delay(attempt: u32) -> Duration {
    delay_from_table(&RETRY_DELAYS_MS, attempt)
}

fn delay_from_table(table: &[u64], attempt: u32) -> Duration {
    let Some(&last) = table.last() else {
        return Duration::ZERO;
    };
    let index = attempt.saturating_sub(1) as usize;
    Duration::from_millis(table.get(index).copied().unwrap_or(last))
}

/// True iff `consecutive_failures` reached the threshold. Negative counts never trip.
pub fn should_trip_circuit_breaker(consecutive_failures: i64) -> bool {
    consecutive_failures >= CIRCUIT_BREAKER_THRESHOLD
}

/// Counts consecutive failures and reports when the breaker should trip.
///
/// Tripping is advisory; callers decide whether to pause dispatch.
#[derive(Debug, Clone, Default)]
pub struct CircuitBreaker {
    consecutive_failures: i64,
}

impl CircuitBreaker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a failure. Returns whether the breaker is now tripped.
    pub fn record_failure(&mut self) -> bool {
        self.consecutive_failures += 1;
        self.is_tripped()
    }

    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
    }

    pub fn consecutive_failures(&self) -> i64 {
        self.consecutive_failures
    }

    pub fn is_tripped(&self) -> bool {
        should_trip_circuit_breaker(self.consecutive_failures)
    }
}

/// Retry budget and backoff schedule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt. 0 still runs the operation once.
    pub max_retries: u32,
    /// Backoff table in milliseconds, clamped to its last entry.
    pub delays_ms: Vec<u64>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::with_max_retries(crate::config::DEFAULT_MAX_RETRIES)
    }
}

impl RetryPolicy {
    pub fn with_max_retries(max_retries: u32) -> Self {
        Self {
            max_retries,
            delays_ms: RETRY_DELAYS_MS.to_vec(),
        }
    }

    pub fn delay_for(&self, attempt: u32) -> Duration {
        delay_from_table(&self.delays_ms, attempt)
    }
}

/// Receives a notification before each backoff wait.
pub trait RetryObserver {
    fn on_retry(&self, attempt: u32, delay: Duration, error: &str);
}

impl<F> RetryObserver for F
where
    F: Fn(u32, Duration, &str),
{
    fn on_retry(&self, attempt: u32, delay: Duration, error: &str) {
        self(attempt, delay, error)
    }
}

/// Successful outcome of [`with_retry`].
#[derive(Debug, Clone, PartialEq)]
pub struct Retried<T> {
    pub result: T,
    pub attempts: u32,
}

/// Final failure of [`with_retry`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{error} ({classification}, {attempts} attempt(s))")]
pub struct ClassifiedError {
    pub error: String,
    pub attempts: u32,
    pub classification: ErrorClass,
}

/// Run `op` until it succeeds, fails fatally, or the retry budget runs out.
///
/// `op` receives the 1-based attempt number. Fatal failures return after
/// the attempt that produced them regardless of the remaining budget.
pub async fn with_retry<T, E, F, Fut>(
    policy: &RetryPolicy,
    observer: Option<&dyn RetryObserver>,
    mut op: F,
) -> std::result::Result<Retried<T>, ClassifiedError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 1;
    loop {
        let err = match op(attempt).await {
            Ok(result) => {
                return Ok(Retried {
                    result,
                    attempts: attempt,
                })
            }
            Err(err) => err.to_string(),
        };

        let classification = classify_error(&err);
        if classification == ErrorClass::Fatal {
            clog_warn!("Fatal failure on attempt {}, not retrying: {}", attempt, err);
            return Err(ClassifiedError {
                error: err,
                attempts: attempt,
                classification,
            });
        }
        if attempt > policy.max_retries {
            clog_warn!("Retries exhausted after {} attempt(s): {}", attempt, err);
            return Err(ClassifiedError {
                error: err,
                attempts: attempt,
                classification,
            });
        }

        let delay = policy.delay_for(attempt);
        clog_debug!(
            "Attempt {} failed ({}), retrying in {:?}: {}",
            attempt,
            classification,
            delay,
            err
        );
        if let Some(observer) = observer {
            observer.on_retry(attempt, delay, &err);
        }
        tokio::time::sleep(delay).await;
        attempt += 1;
    }
}
