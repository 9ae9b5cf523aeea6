//! Exponential backoff with jitter, and the clock the retry loop sleeps on

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;

use crate::config::RetryConfig;

/// Source of time for the retry loop
#[async_trait]
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    async fn sleep(&self, duration: Duration);
}

/// Wall clock backed by tokio timers
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// A clock that only moves when told to. Sleeping advances it instantly and
/// records the requested duration.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
    sleeps: Mutex<Vec<Duration>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
            sleeps: Mutex::new(Vec::new()),
        }
    }

    pub fn advance(&self, duration: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        let next = chrono::Duration::from_std(duration)
            .ok()
            .and_then(|step| now.checked_add_signed(step));
        if let Some(next) = next {
            *now = next;
        }
    }

    /// Every duration passed to `sleep`, in order
    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(Utc::now())
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn sleep(&self, duration: Duration) {
        self.sleeps
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(duration);
        self.advance(duration);
    }
}

/// Backoff schedule: `min(max_delay, base * 2^n + jitter)`, jitter in `[0, base * 2^n / 4)`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    base_delay: Duration,
    max_delay: Duration,
}

impl Backoff {
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(config.base_delay, config.max_delay)
    }

    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

    /// `base * 2^retry` without jitter or cap, saturating
    pub fn exponential(&self, retry: u32) -> Duration {
        2u32.checked_pow(retry)
            .and_then(|factor| self.base_delay.checked_mul(factor))
            .unwrap_or(Duration::MAX)
    }

    /// Delay before retry number `retry` (0-based)
    pub fn delay(&self, retry: u32, retry_after: Option<Duration>) -> Duration {
        self.delay_with(retry, retry_after, &mut rand::thread_rng())
    }

    /// [`delay`](Self::delay) with a caller-supplied random source
    pub fn delay_with<R: Rng + ?Sized>(
        &self,
        retry: u32,
        retry_after: Option<Duration>,
        rng: &mut R,
    ) -> Duration {
        let exponential = self.exponential(retry);
        let jitter_max = u64::try_from((exponential / 4).as_nanos()).unwrap_or(u64::MAX);
        let jitter = if jitter_max == 0 {
            Duration::ZERO
        } else {
            Duration::from_nanos(rng.gen_range(0..jitter_max))
        };

        let delay = exponential.saturating_add(jitter).min(self.max_delay);
        match retry_after {
            Some(hint) => delay.max(hint.min(self.max_delay)),
            None => delay,
        }
    }
}
