//! Executor wrapper that adds per-attempt timeouts, retries and runtime tracking.

use futures::future::{FutureExt, LocalBoxFuture};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::config::Config;
use crate::core::TaskNode;
use crate::error::Error;
use crate::orchestration::engine::{TaskExecutor, TaskFailure, TaskOutcome};
use crate::orchestration::retry::{with_retry, CircuitBreaker, RetryPolicy};
use crate::orchestration::timing::AdaptiveTiming;
use crate::{clog_debug, clog_warn};

/// Wraps an executor so each node runs under its agent's adaptive timeout,
/// is retried per the [`RetryPolicy`], and feeds successful runtimes back
/// into the shared [`AdaptiveTiming`] model.
///
/// The timing lock is only taken to read a timeout or record a sample,
/// never while the inner executor runs.
pub struct SupervisedExecutor<E> {
    inner: Arc<E>,
    config: Arc<Config>,
    timing: Arc<Mutex<AdaptiveTiming>>,
    policy: RetryPolicy,
    breaker: Arc<Mutex<CircuitBreaker>>,
}

impl<E> SupervisedExecutor<E> {
    pub fn new(inner: E, config: Config, timing: Arc<Mutex<AdaptiveTiming>>) -> Self {
        let policy = RetryPolicy::with_max_retries(config.max_retries);
        Self {
            inner: Arc::new(inner),
            config: Arc::new(config),
            timing,
            policy,
            breaker: Arc::new(Mutex::new(CircuitBreaker::new())),
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn timing(&self) -> Arc<Mutex<AdaptiveTiming>> {
        Arc::clone(&self.timing)
    }

    /// Whether enough nodes failed in a row to pause new dispatch.
    pub async fn circuit_tripped(&self) -> bool {
        self.breaker.lock().await.is_tripped()
    }

    pub async fn consecutive_failures(&self) -> i64 {
        self.breaker.lock().await.consecutive_failures()
    }
}

impl<E> TaskExecutor for SupervisedExecutor<E>
where
    E: TaskExecutor + 'static,
    E::Future: 'static,
{
    type Future = LocalBoxFuture<'static, TaskOutcome>;

    fn execute(&self, node: TaskNode) -> Self::Future {
        let inner = Arc::clone(&self.inner);
        let config = Arc::clone(&self.config);
        let timing = Arc::clone(&self.timing);
        let breaker = Arc::clone(&self.breaker);
        let policy = self.policy.clone();

        async move {
            let agent = config.agent(&node.agent_id);
            let timeout = timing.lock().await.adaptive_timeout(&agent);
            clog_debug!(
                "Supervising node={} agent={} timeout={:?}",
                node.id,
                agent.kind,
                timeout
            );

            let outcome = with_retry(&policy, None, |attempt| {
                let run = inner.execute(node.clone());
                let timing = Arc::clone(&timing);
                let kind = agent.kind.clone();
                let id = node.id.clone();
                async move {
                    let started = Instant::now();
                    match tokio::time::timeout(timeout, run).await {
                        Ok(Ok(result)) => {
                            timing
                                .lock()
                                .await
                                .record_agent_runtime(&kind, started.elapsed().as_secs_f64());
                            Ok(result)
                        }
                        Ok(Err(failure)) => Err(failure),
                        Err(_) => {
                            clog_warn!(
                                "node={} attempt {} timed out after {:?}",
                                id,
                                attempt,
                                timeout
                            );
                            Err(TaskFailure::from(Error::Timeout(timeout)))
                        }
                    }
                }
            })
            .await;

            match outcome {
                Ok(retried) => {
                    breaker.lock().await.record_success();
                    if retried.attempts > 1 {
                        clog_debug!(
                            "node={} succeeded after {} attempts",
                            node.id,
                            retried.attempts
                        );
                    }
                    Ok(retried.result)
                }
                Err(err) => {
                    if breaker.lock().await.record_failure() {
                        clog_warn!("Circuit breaker tripped after node={} failed", node.id);
                    }
                    Err(TaskFailure::from(err))
                }
            }
        }
        .boxed_local()
    }
}
