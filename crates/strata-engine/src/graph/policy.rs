use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use strata_core::config::{BackoffStrategy, RetryConfig};
use strata_core::error::{Result, StrataError};
use strata_core::state::State;
use strata_core::trace::{AttemptOutcome, TraceRecorder};

use super::node::{NodeContext, NodeDefinition};

/// Delay before the attempt following `attempt` (1-based). Deterministic.
pub fn calculate_backoff(attempt: u32, config: &RetryConfig) -> Duration {
    let attempt = u64::from(attempt.max(1));
    let ms = match config.strategy {
        BackoffStrategy::Linear => config.base_delay_ms.saturating_mul(attempt),
        BackoffStrategy::Exponential => {
            let factor = 1u64.checked_shl((attempt - 1) as u32).unwrap_or(u64::MAX);
            config.base_delay_ms.saturating_mul(factor)
        }
        BackoffStrategy::Fixed => config.base_delay_ms,
    };
    Duration::from_millis(ms.min(config.max_delay_ms))
}

/// Applies a node's timeout and retry policy around its operation.
///
/// Knows nothing about edges or frontiers, so it can be exercised on a single
/// node in isolation.
pub struct ReliabilityWrapper {
    retry: RetryConfig,
    trace: Arc<TraceRecorder>,
}

impl ReliabilityWrapper {
    pub fn new(retry: RetryConfig, trace: Arc<TraceRecorder>) -> Self {
        Self { retry, trace }
    }

    /// Run `node` against `state`, retrying up to `node.max_retries` extra
    /// times. Exhaustion yields `NodeExecution` wrapping the last failure.
    pub async fn invoke_with_policy(
        &self,
        node: &NodeDefinition,
        state: Arc<State>,
        step: usize,
    ) -> Result<State> {
        let max_attempts = node.max_attempts();
        let mut attempt = 1;

        loop {
            self.trace.record_start(step, &node.name, attempt);
            let started = Instant::now();
            let result = self.attempt(node, Arc::clone(&state), step, attempt).await;
            let elapsed_ms = started.elapsed().as_millis() as u64;

            let err = match result {
                Ok(update) => {
                    self.trace.record_end(
                        step,
                        &node.name,
                        attempt,
                        elapsed_ms,
                        AttemptOutcome::Succeeded,
                    );
                    return Ok(update);
                }
                Err(e) => e,
            };

            let outcome = match &err {
                StrataError::NodeTimeout { .. } => AttemptOutcome::TimedOut,
                other => AttemptOutcome::Failed {
                    error: other.to_string(),
                },
            };
            self.trace
                .record_end(step, &node.name, attempt, elapsed_ms, outcome);

            if attempt >= max_attempts {
                error!(
                    node = %node.name,
                    attempts = attempt,
                    error = %err,
                    "Node exhausted its retries"
                );
                return Err(StrataError::NodeExecution {
                    node: node.name.clone(),
                    attempts: attempt,
                    source: Box::new(err),
                });
            }

            let backoff = calculate_backoff(attempt, &self.retry);
            warn!(
                node = %node.name,
                attempt,
                max_attempts,
                backoff_ms = backoff.as_millis() as u64,
                error = %err,
                "Retrying node"
            );
            tokio::time::sleep(backoff).await;
            attempt += 1;
        }
    }

    /// One attempt. The operation runs as its own task; on timeout the task
    /// is signalled through its cancellation token and left to finish alone.
    async fn attempt(
        &self,
        node: &NodeDefinition,
        state: Arc<State>,
        step: usize,
        attempt: u32,
    ) -> Result<State> {
        let cancel = CancellationToken::new();
        let ctx = NodeContext {
            node: node.name.clone(),
            attempt,
            step,
            run_id: self.trace.run_id().clone(),
            cancel: cancel.clone(),
        };
        let handle = tokio::spawn(node.operation().call(state, ctx));

        let joined = match node.timeout {
            Some(timeout) => match tokio::time::timeout(timeout, handle).await {
                Ok(joined) => joined,
                Err(_) => {
                    cancel.cancel();
                    return Err(StrataError::NodeTimeout {
                        node: node.name.clone(),
                        timeout_ms: timeout.as_millis() as u64,
                    });
                }
            },
            None => handle.await,
        };

        match joined {
            Ok(Ok(update)) => Ok(update),
            Ok(Err(StrataError::Operation { node: owner, message })) if owner.is_empty() => {
                Err(StrataError::Operation {
                    node: node.name.clone(),
                    message,
                })
            }
            Ok(Err(e)) => Err(e),
            Err(join_err) => Err(StrataError::Operation {
                node: node.name.clone(),
                message: format!("operation panicked: {}", join_err),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    use strata_core::trace::{RunId, TracePhase};

    fn fast_retry() -> RetryConfig {
        RetryConfig {
            strategy: BackoffStrategy::Linear,
            base_delay_ms: 1,
            max_delay_ms: 10,
        }
    }

    fn wrapper() -> (ReliabilityWrapper, Arc<TraceRecorder>) {
        let trace = Arc::new(TraceRecorder::new(RunId::new()));
        (ReliabilityWrapper::new(fast_retry(), trace.clone()), trace)
    }

    /// Fails the first `failures` calls, then succeeds.
    fn flaky(name: &str, failures: u32, calls: Arc<AtomicU32>) -> NodeDefinition {
        NodeDefinition::from_fn(name, move |_| {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n <= failures {
                Err(StrataError::operation(format!("attempt {} failed", n)))
            } else {
                Ok(State::new().with("attempts", n))
            }
        })
    }

    #[test]
    fn test_linear_backoff() {
        let config = RetryConfig {
            strategy: BackoffStrategy::Linear,
            base_delay_ms: 100,
            max_delay_ms: 250,
        };
        assert_eq!(calculate_backoff(1, &config), Duration::from_millis(100));
        assert_eq!(calculate_backoff(2, &config), Duration::from_millis(200));
        assert_eq!(calculate_backoff(3, &config), Duration::from_millis(250));
    }

    #[test]
    fn test_exponential_and_fixed_backoff() {
        let mut config = RetryConfig {
            strategy: BackoffStrategy::Exponential,
            base_delay_ms: 10,
            max_delay_ms: 1000,
        };
        assert_eq!(calculate_backoff(1, &config), Duration::from_millis(10));
        assert_eq!(calculate_backoff(4, &config), Duration::from_millis(80));
        assert_eq!(calculate_backoff(200, &config), Duration::from_millis(1000));

        config.strategy = BackoffStrategy::Fixed;
        assert_eq!(calculate_backoff(7, &config), Duration::from_millis(10));
    }

    #[test]
    fn test_backoff_is_non_decreasing() {
        let config = RetryConfig::default();
        let delays: Vec<Duration> = (1..10).map(|a| calculate_backoff(a, &config)).collect();
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
    }

    #[tokio::test]
    async fn test_succeeds_after_retries() {
        let (wrapper, trace) = wrapper();
        let calls = Arc::new(AtomicU32::new(0));
        let node = flaky("flaky", 2, calls.clone()).with_retries(2);

        let out = wrapper
            .invoke_with_policy(&node, Arc::new(State::new()), 1)
            .await
            .unwrap();

        assert_eq!(out.get_i64("attempts"), Some(3));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(trace.attempts("flaky"), 3);
    }

    #[tokio::test]
    async fn test_exhaustion_reports_last_error() {
        let (wrapper, trace) = wrapper();
        let calls = Arc::new(AtomicU32::new(0));
        let node = flaky("doomed", 10, calls.clone()).with_retries(1);

        let err = wrapper
            .invoke_with_policy(&node, Arc::new(State::new()), 1)
            .await
            .unwrap_err();

        match err {
            StrataError::NodeExecution {
                node,
                attempts,
                source,
            } => {
                assert_eq!(node, "doomed");
                assert_eq!(attempts, 2);
                assert!(matches!(
                    *source,
                    StrataError::Operation { ref node, ref message }
                        if node == "doomed" && message == "attempt 2 failed"
                ));
            }
            other => panic!("expected NodeExecution, got {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(trace.attempts("doomed"), 2);
    }

    #[tokio::test]
    async fn test_timeout_counts_as_failed_attempt() {
        let (wrapper, trace) = wrapper();
        let node = NodeDefinition::new("slow", |_state: Arc<State>, _ctx: NodeContext| async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok::<_, StrataError>(State::new().with("late", true))
        })
        .with_timeout(Duration::from_millis(50));

        let started = Instant::now();
        let err = wrapper
            .invoke_with_policy(&node, Arc::new(State::new()), 1)
            .await
            .unwrap_err();

        assert!(started.elapsed() < Duration::from_millis(200));
        assert!(matches!(
            err,
            StrataError::NodeExecution { ref source, attempts: 1, .. }
                if matches!(**source, StrataError::NodeTimeout { timeout_ms: 50, .. })
        ));
        let ends: Vec<_> = trace
            .dump()
            .into_iter()
            .filter_map(|e| match e.phase {
                TracePhase::End { outcome, .. } => Some(outcome),
                _ => None,
            })
            .collect();
        assert_eq!(ends, vec![AttemptOutcome::TimedOut]);
    }

    #[tokio::test]
    async fn test_timeout_then_successful_retry() {
        let (wrapper, trace) = wrapper();
        let node = NodeDefinition::new("sluggish", |_state: Arc<State>, ctx: NodeContext| async move {
            if ctx.attempt == 1 {
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
            Ok::<_, StrataError>(State::new().with("attempt", ctx.attempt))
        })
        .with_timeout(Duration::from_millis(50))
        .with_retries(1);

        let out = wrapper
            .invoke_with_policy(&node, Arc::new(State::new()), 1)
            .await
            .unwrap();

        assert_eq!(out.get_i64("attempt"), Some(2));
        assert_eq!(trace.attempts("sluggish"), 2);
        let ends: Vec<_> = trace
            .dump()
            .into_iter()
            .filter_map(|e| match e.phase {
                TracePhase::End { outcome, .. } => Some(outcome),
                _ => None,
            })
            .collect();
        assert_eq!(ends, vec![AttemptOutcome::TimedOut, AttemptOutcome::Succeeded]);
    }

    #[tokio::test]
    async fn test_timeout_signals_cancellation() {
        let (wrapper, _trace) = wrapper();
        let (tx, rx) = tokio::sync::oneshot::channel::<bool>();
        let tx = Arc::new(std::sync::Mutex::new(Some(tx)));
        let node = NodeDefinition::new("cooperative", move |_state: Arc<State>, ctx: NodeContext| {
            let tx = tx.clone();
            async move {
                ctx.cancel.cancelled().await;
                if let Some(tx) = tx.lock().unwrap().take() {
                    let _ = tx.send(ctx.is_cancelled());
                }
                Ok::<_, StrataError>(State::new())
            }
        })
        .with_timeout(Duration::from_millis(20));

        assert!(wrapper
            .invoke_with_policy(&node, Arc::new(State::new()), 1)
            .await
            .is_err());

        let saw_cancel = tokio::time::timeout(Duration::from_secs(1), rx)
            .await
            .expect("operation never observed cancellation")
            .unwrap();
        assert!(saw_cancel);
    }

    #[tokio::test]
    async fn test_panicking_operation_is_a_failure() {
        let (wrapper, _trace) = wrapper();
        let node = NodeDefinition::from_fn("panics", |_| -> Result<State> { panic!("kaboom") });

        let err = wrapper
            .invoke_with_policy(&node, Arc::new(State::new()), 1)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("panicked"));
    }
}
