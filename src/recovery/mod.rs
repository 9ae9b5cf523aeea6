//! Error recovery for language-model calls: classify the failure, pick a
//! strategy, back off and retry until success or exhaustion.
//!
//! ```text
//! Pending -> Attempting -> Succeeded
//!                |
//!                +-> Retrying -> Attempting
//!                +-> Exhausted
//! ```

mod backoff;
mod metrics;
mod strategy;
mod taxonomy;

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::RetryConfig;

pub use backoff::{Backoff, Clock, ManualClock, SystemClock};
pub use metrics::{ErrorMetrics, FailureRecord, MetricsSnapshot, Outcome, OutcomeCounts};
pub use strategy::{AttemptContext, RecoveryOutcome, RecoveryStrategy, StrategyTable};
pub use taxonomy::{ErrorCategory, LlmError};

/// State of one call driven by [`ErrorRecoveryManager::run`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryState {
    Pending,
    Attempting { attempt: u32 },
    Retrying { attempt: u32, delay: Duration },
    Succeeded { attempts: u32 },
    Exhausted { attempts: u32 },
}

/// Terminal failure of a call. Carries only the category and a user-facing
/// sentence, never the provider error itself.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[error("{operation} failed after {attempts} attempt(s): {user_message}")]
pub struct Exhausted {
    pub operation: String,
    pub category: ErrorCategory,
    pub attempts: u32,
    pub user_message: String,
    /// Stopped by a cancel request rather than by the strategy
    pub cancelled: bool,
}

/// Cooperative cancellation, checked before each backoff sleep
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    cancelled: Arc<AtomicBool>,
}

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

const CANCELLED_MESSAGE: &str = "The request was cancelled before it could be retried.";

/// Owns the strategy table, backoff schedule, clock and metrics for LLM calls
pub struct ErrorRecoveryManager {
    config: RetryConfig,
    strategies: StrategyTable,
    backoff: Backoff,
    metrics: ErrorMetrics,
    clock: Arc<dyn Clock>,
}

impl ErrorRecoveryManager {
    /// Create a manager on the system clock
    pub fn new(config: RetryConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: RetryConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            strategies: StrategyTable::defaults(&config),
            backoff: Backoff::from_config(&config),
            metrics: ErrorMetrics::new(config.metrics_history),
            config,
            clock,
        }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    pub fn strategies(&self) -> &StrategyTable {
        &self.strategies
    }

    /// Replace the strategy for one category
    pub fn set_strategy(&mut self, category: ErrorCategory, strategy: RecoveryStrategy) {
        info!(%category, "recovery strategy replaced");
        self.strategies.set_strategy(category, strategy);
    }

    /// Remove the strategy for one category; its failures then fail at once
    pub fn remove_strategy(&mut self, category: ErrorCategory) -> Option<RecoveryStrategy> {
        self.strategies.remove_strategy(category)
    }

    pub fn metrics(&self) -> &ErrorMetrics {
        &self.metrics
    }

    pub fn get_error_metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Decide what to do about one failed attempt, and record the failure
    pub fn recover(&self, error: &LlmError, context: &AttemptContext) -> RecoveryOutcome {
        let category = error.category();
        let strategy = self.strategies.get(category);
        let attempt_limit = strategy.attempt_limit(&self.config);
        let retryable = strategy.retryable && context.attempt < attempt_limit;

        self.metrics.record_failure(FailureRecord {
            operation: context.operation.clone(),
            category,
            message: error.to_string(),
            attempt: context.attempt,
            at: self.clock.now(),
        });

        let delay = if retryable {
            self.backoff
                .delay(context.attempt.saturating_sub(1), error.retry_after())
        } else {
            Duration::ZERO
        };

        let user_message = strategy
            .user_message
            .unwrap_or_else(|| error.user_message().to_string());

        warn!(
            operation = %context.operation,
            attempt = context.attempt,
            %category,
            retryable,
            error = %error,
            "LLM call failed"
        );

        RecoveryOutcome {
            category,
            retryable,
            delay,
            user_message,
            attempt_limit,
        }
    }

    /// Drive `attempt_fn` until it succeeds or recovery gives up.
    ///
    /// `attempt_fn` receives the 1-based attempt number. Cancellation is
    /// checked before each backoff sleep; an attempt in flight is never
    /// interrupted.
    pub async fn run<T, F, Fut>(
        &self,
        operation: &str,
        cancel: &CancelHandle,
        mut attempt_fn: F,
    ) -> Result<T, Exhausted>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, LlmError>>,
    {
        let mut state = RetryState::Pending;
        let mut last_failure: Option<RecoveryOutcome> = None;
        let mut success: Option<T> = None;
        // Delays within one call never shrink, even after a Retry-After hint
        let mut previous_delay = Duration::ZERO;

        loop {
            debug!(operation, ?state, "retry state");
            state = match state {
                RetryState::Pending => RetryState::Attempting { attempt: 1 },

                RetryState::Attempting { attempt } => match attempt_fn(attempt).await {
                    Ok(value) => {
                        success = Some(value);
                        RetryState::Succeeded { attempts: attempt }
                    }
                    Err(error) => {
                        let outcome = self.recover(&error, &AttemptContext::new(operation, attempt));
                        let next = if outcome.retryable {
                            let delay = outcome
                                .delay
                                .max(previous_delay)
                                .min(self.backoff.max_delay());
                            previous_delay = delay;
                            RetryState::Retrying { attempt, delay }
                        } else {
                            RetryState::Exhausted { attempts: attempt }
                        };
                        last_failure = Some(outcome);
                        next
                    }
                },

                RetryState::Retrying { attempt, delay } => {
                    if cancel.is_cancelled() {
                        return Err(self.exhaust(operation, attempt, last_failure, true));
                    }
                    debug!(operation, attempt, ?delay, "backing off");
                    self.clock.sleep(delay).await;
                    RetryState::Attempting {
                        attempt: attempt + 1,
                    }
                }

                RetryState::Succeeded { attempts } => {
                    if let Some(value) = success.take() {
                        match &last_failure {
                            None => self.metrics.record_first_try_success(),
                            Some(outcome) => {
                                self.metrics
                                    .record_outcome(outcome.category, Outcome::SucceededAfterRetry);
                                info!(operation, attempts, "LLM call recovered");
                            }
                        }
                        return Ok(value);
                    }
                    RetryState::Exhausted { attempts }
                }

                RetryState::Exhausted { attempts } => {
                    return Err(self.exhaust(operation, attempts, last_failure, false));
                }
            };
        }
    }

    fn exhaust(
        &self,
        operation: &str,
        attempts: u32,
        last_failure: Option<RecoveryOutcome>,
        cancelled: bool,
    ) -> Exhausted {
        let (category, user_message) = match last_failure {
            Some(outcome) => (outcome.category, outcome.user_message),
            None => (
                ErrorCategory::Generic,
                ErrorCategory::Generic.user_message().to_string(),
            ),
        };
        let user_message = if cancelled {
            CANCELLED_MESSAGE.to_string()
        } else {
            user_message
        };

        self.metrics.record_outcome(category, Outcome::Exhausted);
        warn!(operation, attempts, %category, cancelled, "LLM call exhausted");

        Exhausted {
            operation: operation.to_string(),
            category,
            attempts,
            user_message,
            cancelled,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::sync::atomic::AtomicU32;

    fn manager() -> (ErrorRecoveryManager, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let manager = ErrorRecoveryManager::with_clock(RetryConfig::default(), clock.clone());
        (manager, clock)
    }

    #[tokio::test]
    async fn first_try_success_counts_without_category() {
        let (manager, clock) = manager();
        let value = manager
            .run("chat", &CancelHandle::new(), |_| async { Ok::<_, LlmError>(42) })
            .await
            .unwrap();

        assert_eq!(value, 42);
        assert!(clock.sleeps().is_empty());
        let metrics = manager.get_error_metrics();
        assert_eq!(metrics.succeeded_first_try, 1);
        assert!(metrics.outcomes.is_empty());
    }

    #[tokio::test]
    async fn recovers_after_transient_failure() {
        let (manager, clock) = manager();
        let value = manager
            .run("chat", &CancelHandle::new(), |attempt| async move {
                if attempt < 2 {
                    Err(LlmError::Timeout("slow".into()))
                } else {
                    Ok("done")
                }
            })
            .await
            .unwrap();

        assert_eq!(value, "done");
        assert_eq!(clock.sleeps().len(), 1);
        let metrics = manager.get_error_metrics();
        assert_eq!(metrics.outcome(ErrorCategory::Network, Outcome::SucceededAfterRetry), 1);
        assert_eq!(metrics.failures(ErrorCategory::Network), 1);
    }

    #[tokio::test]
    async fn non_retryable_fails_immediately() {
        let (manager, clock) = manager();
        let calls = AtomicU32::new(0);
        let err = manager
            .run("chat", &CancelHandle::new(), |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(LlmError::Authentication("bad key".into())) }
            })
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(err.category, ErrorCategory::Authentication);
        assert!(!err.user_message.contains("bad key"));
        assert!(clock.sleeps().is_empty());
    }

    #[tokio::test]
    async fn model_failures_stop_after_two_attempts() {
        let (manager, _clock) = manager();
        let calls = AtomicU32::new(0);
        let err = manager
            .run("chat", &CancelHandle::new(), |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(LlmError::Model("overloaded".into())) }
            })
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(err.attempts, 2);
    }

    #[tokio::test]
    async fn cancel_stops_before_sleeping() {
        let (manager, clock) = manager();
        let cancel = CancelHandle::new();
        let err = manager
            .run("chat", &cancel, |_| {
                cancel.cancel();
                async { Err::<(), _>(LlmError::Network("reset".into())) }
            })
            .await
            .unwrap_err();

        assert!(err.cancelled);
        assert_eq!(err.attempts, 1);
        assert!(clock.sleeps().is_empty());
    }

    #[tokio::test]
    async fn delay_after_retry_after_hint_does_not_drop() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let config = RetryConfig {
            max_attempts: 4,
            ..Default::default()
        };
        let manager = ErrorRecoveryManager::with_clock(config, clock.clone());

        let err = manager
            .run("chat", &CancelHandle::new(), |attempt| async move {
                let hint = (attempt == 1).then(|| Duration::from_secs(20));
                Err::<(), _>(LlmError::rate_limit("slow down", hint))
            })
            .await
            .unwrap_err();

        assert_eq!(err.attempts, 4);
        let sleeps = clock.sleeps();
        assert_eq!(sleeps.len(), 3);
        assert_eq!(sleeps[0], Duration::from_secs(20));
        assert!(sleeps.windows(2).all(|w| w[0] <= w[1]), "{:?}", sleeps);
        assert!(sleeps.iter().all(|d| *d <= Duration::from_secs(60)));
    }

    #[test]
    fn recover_uses_strategy_message_override() {
        let (mut manager, _clock) = manager();
        manager.set_strategy(
            ErrorCategory::Request,
            RecoveryStrategy::fail().with_user_message("Please shorten your message."),
        );
        let outcome = manager.recover(
            &LlmError::ContextLength("too long".into()),
            &AttemptContext::new("chat", 1),
        );
        assert!(!outcome.retryable);
        assert_eq!(outcome.delay, Duration::ZERO);
        assert_eq!(outcome.user_message, "Please shorten your message.");
    }

    #[test]
    fn recover_honours_retry_after() {
        let (manager, _clock) = manager();
        let outcome = manager.recover(
            &LlmError::rate_limit("slow down", Some(Duration::from_secs(20))),
            &AttemptContext::new("chat", 1),
        );
        assert!(outcome.retryable);
        assert_eq!(outcome.delay, Duration::from_secs(20));
    }
}
