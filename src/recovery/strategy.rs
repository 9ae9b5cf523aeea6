//! Per-category recovery strategies

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::RetryConfig;

use super::taxonomy::ErrorCategory;

/// How failures of one category are handled
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryStrategy {
    pub retryable: bool,

    /// Total attempts allowed; `None` uses the configured `max_attempts`
    pub max_attempts: Option<u32>,

    /// Overrides the error's own user message
    pub user_message: Option<String>,
}

impl RecoveryStrategy {
    /// Retry up to the configured attempt limit
    pub fn retry() -> Self {
        Self {
            retryable: true,
            max_attempts: None,
            user_message: None,
        }
    }

    /// Retry up to `max_attempts` total attempts
    pub fn bounded(max_attempts: u32) -> Self {
        Self {
            retryable: true,
            max_attempts: Some(max_attempts),
            user_message: None,
        }
    }

    /// Fail immediately
    pub fn fail() -> Self {
        Self {
            retryable: false,
            max_attempts: Some(1),
            user_message: None,
        }
    }

    pub fn with_user_message(mut self, message: impl Into<String>) -> Self {
        self.user_message = Some(message.into());
        self
    }

    /// Attempt limit under the given configuration
    pub fn attempt_limit(&self, config: &RetryConfig) -> u32 {
        if !self.retryable {
            return 1;
        }
        self.max_attempts.unwrap_or(config.max_attempts).max(1)
    }
}

/// Dispatch table from failure category to strategy
#[derive(Debug, Clone)]
pub struct StrategyTable {
    strategies: HashMap<ErrorCategory, RecoveryStrategy>,
}

impl StrategyTable {
    /// Rate limits and network failures retry up to `max_attempts`; model
    /// and generic failures up to `bounded_attempts`; the rest fail at once.
    pub fn defaults(config: &RetryConfig) -> Self {
        let bounded = config.bounded_attempts.min(config.max_attempts);
        let strategies = ErrorCategory::ALL
            .into_iter()
            .map(|category| {
                let strategy = match category {
                    ErrorCategory::RateLimit | ErrorCategory::Network => RecoveryStrategy::retry(),
                    ErrorCategory::Model | ErrorCategory::Generic => RecoveryStrategy::bounded(bounded),
                    ErrorCategory::Authentication
                    | ErrorCategory::Configuration
                    | ErrorCategory::Request => RecoveryStrategy::fail(),
                };
                (category, strategy)
            })
            .collect();
        Self { strategies }
    }

    /// Replace the strategy for a category
    pub fn set_strategy(&mut self, category: ErrorCategory, strategy: RecoveryStrategy) {
        self.strategies.insert(category, strategy);
    }

    /// Drop the strategy for a category; its failures then fail at once
    pub fn remove_strategy(&mut self, category: ErrorCategory) -> Option<RecoveryStrategy> {
        self.strategies.remove(&category)
    }

    pub fn get(&self, category: ErrorCategory) -> RecoveryStrategy {
        self.strategies
            .get(&category)
            .cloned()
            .unwrap_or_else(RecoveryStrategy::fail)
    }
}

/// The failed attempt being recovered from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptContext {
    /// Name of the operation, for logs and metrics
    pub operation: String,

    /// 1-based number of the attempt that just failed
    pub attempt: u32,
}

impl AttemptContext {
    pub fn new(operation: impl Into<String>, attempt: u32) -> Self {
        Self {
            operation: operation.into(),
            attempt,
        }
    }
}

/// Decision for one failed attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryOutcome {
    pub category: ErrorCategory,

    /// Whether another attempt should be made
    pub retryable: bool,

    /// Wait before the next attempt; zero when not retrying
    pub delay: Duration,

    pub user_message: String,

    /// Total attempts the strategy allows
    pub attempt_limit: u32,
}
