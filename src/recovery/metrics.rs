//! Failure and outcome counters for the recovery manager

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::taxonomy::ErrorCategory;

/// How a call that failed at least once ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    SucceededAfterRetry,
    Exhausted,
}

/// One failed attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub operation: String,
    pub category: ErrorCategory,
    pub message: String,
    pub attempt: u32,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutcomeCounts {
    pub succeeded_after_retry: u64,
    pub exhausted: u64,
}

/// Point-in-time copy of the metrics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    /// Calls that succeeded without any failure
    pub succeeded_first_try: u64,

    /// Outcomes of calls that failed at least once, keyed by the last failure's category
    pub outcomes: BTreeMap<ErrorCategory, OutcomeCounts>,

    /// Failed attempts per category
    pub failures: BTreeMap<ErrorCategory, u64>,

    pub total_failures: u64,

    /// Most recent failures, oldest first
    pub recent_failures: Vec<FailureRecord>,
}

impl MetricsSnapshot {
    pub fn outcome(&self, category: ErrorCategory, outcome: Outcome) -> u64 {
        let counts = self.outcomes.get(&category).copied().unwrap_or_default();
        match outcome {
            Outcome::SucceededAfterRetry => counts.succeeded_after_retry,
            Outcome::Exhausted => counts.exhausted,
        }
    }

    pub fn failures(&self, category: ErrorCategory) -> u64 {
        self.failures.get(&category).copied().unwrap_or(0)
    }
}

#[derive(Debug, Default)]
struct MetricsState {
    succeeded_first_try: u64,
    outcomes: HashMap<(ErrorCategory, Outcome), u64>,
    failures: HashMap<ErrorCategory, u64>,
    recent: VecDeque<FailureRecord>,
}

/// Counters owned by one recovery manager
#[derive(Debug)]
pub struct ErrorMetrics {
    state: Mutex<MetricsState>,
    history: usize,
}

impl ErrorMetrics {
    /// Keep at most `history` failure records
    pub fn new(history: usize) -> Self {
        Self {
            state: Mutex::new(MetricsState::default()),
            history,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MetricsState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn record_failure(&self, record: FailureRecord) {
        let mut state = self.lock();
        *state.failures.entry(record.category).or_insert(0) += 1;
        if self.history == 0 {
            return;
        }
        if state.recent.len() == self.history {
            state.recent.pop_front();
        }
        state.recent.push_back(record);
    }

    pub fn record_first_try_success(&self) {
        self.lock().succeeded_first_try += 1;
    }

    pub fn record_outcome(&self, category: ErrorCategory, outcome: Outcome) {
        *self.lock().outcomes.entry((category, outcome)).or_insert(0) += 1;
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let state = self.lock();

        let mut outcomes: BTreeMap<ErrorCategory, OutcomeCounts> = BTreeMap::new();
        for ((category, outcome), count) in &state.outcomes {
            let counts = outcomes.entry(*category).or_default();
            match outcome {
                Outcome::SucceededAfterRetry => counts.succeeded_after_retry = *count,
                Outcome::Exhausted => counts.exhausted = *count,
            }
        }

        MetricsSnapshot {
            succeeded_first_try: state.succeeded_first_try,
            outcomes,
            failures: state.failures.iter().map(|(k, v)| (*k, *v)).collect(),
            total_failures: state.failures.values().sum(),
            recent_failures: state.recent.iter().cloned().collect(),
        }
    }

    /// The last `limit` failures, newest first
    pub fn recent(&self, limit: usize) -> Vec<FailureRecord> {
        self.lock().recent.iter().rev().take(limit).cloned().collect()
    }

    /// Failures per minute over the `window` ending at `now`, optionally for one category
    pub fn failure_rate(
        &self,
        category: Option<ErrorCategory>,
        window: Duration,
        now: DateTime<Utc>,
    ) -> f64 {
        let minutes = window.as_secs_f64() / 60.0;
        if minutes <= 0.0 {
            return 0.0;
        }
        let Ok(span) = chrono::Duration::from_std(window) else {
            return 0.0;
        };
        let since = now - span;

        let count = self
            .lock()
            .recent
            .iter()
            .filter(|r| r.at > since && r.at <= now)
            .filter(|r| category.map_or(true, |c| r.category == c))
            .count();
        count as f64 / minutes
    }

    /// Reset every counter and the history
    pub fn clear(&self) {
        *self.lock() = MetricsState::default();
    }
}
