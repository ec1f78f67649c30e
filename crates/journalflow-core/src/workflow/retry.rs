//! Retry/timeout executor for a single step.
//!
//! Runs a step at most `max(1, max_retries)` times, stopping at the first
//! success. Each attempt is bounded by the step's `timeout_secs` and by the
//! instance's cancellation token; failed attempts back off exponentially
//! (`base * 2^attempt`) before the next try.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use futures_util::FutureExt;
use journalflow_types::workflow::{StepResult, WorkflowInstance, WorkflowStep};
use tokio_util::sync::CancellationToken;

use super::handler::{StepError, StepHandlerDyn};
use super::instance::InstanceLogger;

/// Delay before the attempt following `attempt` (1-based): `base * 2^attempt`.
pub fn backoff_delay(base_ms: u64, attempt: u32) -> Duration {
    let factor = 2u64.saturating_pow(attempt);
    Duration::from_millis(base_ms.saturating_mul(factor))
}

/// Final result of running a step through the executor.
#[derive(Debug, Clone)]
pub struct AttemptOutcome {
    pub result: StepResult,
    /// Attempts actually made (1-based count).
    pub attempts: u32,
}

/// Retry/timeout wrapper around a step handler.
#[derive(Debug, Clone)]
pub struct RetryExecutor {
    backoff_base_ms: u64,
}

impl RetryExecutor {
    pub fn new(backoff_base_ms: u64) -> Self {
        Self { backoff_base_ms }
    }

    /// Execute `step` through `handler` with retries.
    ///
    /// Handler errors, panics and timeouts are converted to failed results and
    /// retried. The only error returned is [`StepError::Cancelled`], when the
    /// token fires during an attempt or during backoff.
    pub async fn execute(
        &self,
        handler: &dyn StepHandlerDyn,
        step: &WorkflowStep,
        instance: &mut WorkflowInstance,
        cancel: &CancellationToken,
    ) -> Result<AttemptOutcome, StepError> {
        let total = step.max_attempts();
        let mut last = StepResult::failure("step was not attempted");

        for attempt in 1..=total {
            if cancel.is_cancelled() {
                return Err(StepError::Cancelled);
            }

            let result = match Self::attempt(handler, step, instance, cancel).await {
                Ok(result) => result,
                Err(StepError::Cancelled) if cancel.is_cancelled() => {
                    return Err(StepError::Cancelled);
                }
                // A handler reporting Cancelled on its own is an ordinary failure.
                Err(e) => StepResult::failure(e.to_string()),
            };

            if result.success {
                InstanceLogger::attempt(instance, step, attempt, total, None);
                return Ok(AttemptOutcome {
                    result,
                    attempts: attempt,
                });
            }

            let message = result.error_message();
            InstanceLogger::attempt(instance, step, attempt, total, Some(&message));
            last = result;

            if attempt < total {
                let delay = backoff_delay(self.backoff_base_ms, attempt);
                tracing::debug!(
                    instance_id = %instance.id,
                    step_id = %step.id,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "backing off before retry"
                );
                tokio::select! {
                    _ = cancel.cancelled() => return Err(StepError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }

        Ok(AttemptOutcome {
            result: last,
            attempts: total,
        })
    }

    /// One attempt: handler call guarded by panic capture, timeout and cancellation.
    async fn attempt(
        handler: &dyn StepHandlerDyn,
        step: &WorkflowStep,
        instance: &mut WorkflowInstance,
        cancel: &CancellationToken,
    ) -> Result<StepResult, StepError> {
        let guarded = async {
            match AssertUnwindSafe(async { handler.handle_boxed(step, instance).await })
                .catch_unwind()
                .await
            {
                Ok(result) => result,
                Err(panic) => Err(StepError::Handler(format!(
                    "handler panicked: {}",
                    panic_message(panic.as_ref())
                ))),
            }
        };

        let bounded = async {
            match step.timeout_secs.filter(|secs| *secs > 0) {
                Some(secs) => tokio::time::timeout(Duration::from_secs(secs), guarded)
                    .await
                    .unwrap_or(Err(StepError::Timeout(secs))),
                None => guarded.await,
            }
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(StepError::Cancelled),
            result = bounded => result,
        }
    }
}

impl Default for RetryExecutor {
    fn default() -> Self {
        Self::new(1000)
    }
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::handler::{handler_fn, StepHandler};
    use journalflow_types::workflow::{StepType, WorkflowDefinition};
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn instance() -> WorkflowInstance {
        let def = WorkflowDefinition::new("wf", "wf")
            .with_step(WorkflowStep::new("end", "End", StepType::End));
        WorkflowInstance::new(&def, HashMap::new())
    }

    fn fast() -> RetryExecutor {
        RetryExecutor::new(1)
    }

    struct Sleepy(Duration);

    impl StepHandler for Sleepy {
        async fn handle(
            &self,
            _step: &WorkflowStep,
            _instance: &mut WorkflowInstance,
        ) -> Result<StepResult, StepError> {
            tokio::time::sleep(self.0).await;
            Ok(StepResult::ok())
        }
    }

    // -----------------------------------------------------------------------
    // Backoff
    // -----------------------------------------------------------------------

    #[test]
    fn backoff_doubles_per_attempt() {
        assert_eq!(backoff_delay(1000, 1), Duration::from_secs(2));
        assert_eq!(backoff_delay(1000, 2), Duration::from_secs(4));
        assert_eq!(backoff_delay(1000, 3), Duration::from_secs(8));
        let delays: Vec<_> = (1..6).map(|a| backoff_delay(10, a)).collect();
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn backoff_saturates() {
        assert_eq!(backoff_delay(u64::MAX, 70), Duration::from_millis(u64::MAX));
    }

    // -----------------------------------------------------------------------
    // Attempts
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn succeeds_on_first_attempt() {
        let handler = handler_fn(|_, _| Ok(StepResult::ok().with_output("x", json!(1))));
        let step = WorkflowStep::action("a", "A", "x").with_max_retries(3);
        let mut inst = instance();

        let outcome = fast()
            .execute(&handler, &step, &mut inst, &CancellationToken::new())
            .await
            .unwrap();

        assert!(outcome.result.success);
        assert_eq!(outcome.attempts, 1);
        assert_eq!(inst.logs.len(), 1);
        assert_eq!(inst.logs[0].attempt, Some(1));
    }

    #[tokio::test]
    async fn always_failing_step_logs_every_attempt() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let handler = handler_fn(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(StepResult::failure("broker rejected"))
        });
        let step = WorkflowStep::action("a", "A", "x").with_max_retries(3);
        let mut inst = instance();

        let outcome = fast()
            .execute(&handler, &step, &mut inst, &CancellationToken::new())
            .await
            .unwrap();

        assert!(!outcome.result.success);
        assert_eq!(outcome.attempts, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        let attempts: Vec<_> = inst.logs_for_step("a").map(|e| e.attempt).collect();
        assert_eq!(attempts, vec![Some(1), Some(2), Some(3)]);
        assert!(inst.logs.iter().all(|e| e.is_error));
        assert_eq!(inst.logs[2].message, "attempt 3/3 failed: broker rejected");
    }

    #[tokio::test]
    async fn recovers_after_transient_failure() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let handler = handler_fn(move |_, _| {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(StepError::handler("flaky"))
            } else {
                Ok(StepResult::ok())
            }
        });
        let step = WorkflowStep::action("a", "A", "x").with_max_retries(2);
        let mut inst = instance();

        let outcome = fast()
            .execute(&handler, &step, &mut inst, &CancellationToken::new())
            .await
            .unwrap();

        assert!(outcome.result.success);
        assert_eq!(outcome.attempts, 2);
        assert!(inst.logs[0].is_error);
        assert!(inst.logs[0].message.contains("handler error: flaky"));
        assert!(!inst.logs[1].is_error);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_gaps_follow_backoff_and_never_shrink() {
        let calls = Arc::new(std::sync::Mutex::new(Vec::new()));
        let recorder = Arc::clone(&calls);
        let handler = handler_fn(move |_, _| {
            recorder.lock().unwrap().push(tokio::time::Instant::now());
            Ok(StepResult::failure("quote feed stale"))
        });
        let step = WorkflowStep::action("a", "A", "x").with_max_retries(4);
        let mut inst = instance();

        let outcome = RetryExecutor::new(50)
            .execute(&handler, &step, &mut inst, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.attempts, 4);

        let calls = calls.lock().unwrap();
        let gaps: Vec<Duration> = calls.windows(2).map(|w| w[1] - w[0]).collect();
        assert_eq!(gaps.len(), 3);
        for (i, gap) in gaps.iter().enumerate() {
            assert!(*gap >= backoff_delay(50, i as u32 + 1), "gap {i} was {gap:?}");
        }
        assert!(gaps.windows(2).all(|w| w[0] <= w[1]), "gaps: {gaps:?}");

        let stamps: Vec<_> = inst.logs_for_step("a").map(|e| e.timestamp).collect();
        assert_eq!(stamps.len(), 4);
        assert!(stamps.windows(2).all(|w| w[0] <= w[1]));
    }

    #[tokio::test]
    async fn handler_reported_cancel_is_a_failure() {
        let handler = handler_fn(|_, _| Err(StepError::Cancelled));
        let step = WorkflowStep::action("a", "A", "x").with_max_retries(2);
        let mut inst = instance();

        let outcome = fast()
            .execute(&handler, &step, &mut inst, &CancellationToken::new())
            .await
            .unwrap();

        assert!(!outcome.result.success);
        assert_eq!(outcome.attempts, 2);
        assert_eq!(outcome.result.error.as_deref(), Some("step cancelled"));
    }

    #[tokio::test]
    async fn zero_retries_still_attempts_once() {
        let handler = handler_fn(|_, _| Ok(StepResult::failure("nope")));
        let step = WorkflowStep::action("a", "A", "x").with_max_retries(0);
        let mut inst = instance();

        let outcome = fast()
            .execute(&handler, &step, &mut inst, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.attempts, 1);
    }

    #[tokio::test]
    async fn panics_become_handler_errors() {
        let handler = handler_fn(|_, _| panic!("division by zero in pnl"));
        let step = WorkflowStep::action("a", "A", "x");
        let mut inst = instance();

        let outcome = fast()
            .execute(&handler, &step, &mut inst, &CancellationToken::new())
            .await
            .unwrap();

        assert!(!outcome.result.success);
        let err = outcome.result.error.unwrap();
        assert!(err.contains("handler panicked: division by zero in pnl"), "got: {err}");
    }

    #[tokio::test]
    async fn timeout_fails_the_attempt() {
        let handler = Sleepy(Duration::from_secs(30));
        let step = WorkflowStep::action("a", "A", "x").with_timeout_secs(1);
        let mut inst = instance();

        let outcome = fast()
            .execute(&handler, &step, &mut inst, &CancellationToken::new())
            .await
            .unwrap();

        assert!(!outcome.result.success);
        assert_eq!(
            outcome.result.error.as_deref(),
            Some(StepError::Timeout(1).to_string().as_str())
        );
    }

    #[tokio::test]
    async fn cancellation_interrupts_attempt() {
        let handler = Sleepy(Duration::from_secs(30));
        let step = WorkflowStep::action("a", "A", "x");
        let mut inst = instance();
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let err = fast()
            .execute(&handler, &step, &mut inst, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, StepError::Cancelled));
    }

    #[tokio::test]
    async fn cancellation_interrupts_backoff() {
        let handler = handler_fn(|_, _| Ok(StepResult::failure("down")));
        let step = WorkflowStep::action("a", "A", "x").with_max_retries(5);
        let mut inst = instance();
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        // 60s base backoff: only cancellation can end this promptly.
        let err = RetryExecutor::new(60_000)
            .execute(&handler, &step, &mut inst, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, StepError::Cancelled));
        assert_eq!(inst.logs.len(), 1);
    }

    #[tokio::test]
    async fn already_cancelled_makes_no_attempt() {
        let handler = handler_fn(|_, _| Ok(StepResult::ok()));
        let step = WorkflowStep::action("a", "A", "x");
        let mut inst = instance();
        let cancel = CancellationToken::new();
        cancel.cancel();

        assert!(fast().execute(&handler, &step, &mut inst, &cancel).await.is_err());
        assert!(inst.logs.is_empty());
    }
}
