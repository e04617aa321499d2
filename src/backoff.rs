// src/backoff.rs
use crate::{HandlerError, JobRecord};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Delay growth between attempts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackoffStrategy {
    Fixed { delay_ms: u64 },
    /// `base * 2^(attempt - 1)`
    Exponential { base_ms: u64 },
    Linear { increment_ms: u64 },
}

impl BackoffStrategy {
    /// Un-jittered delay before the attempt following `attempt` (1-based).
    pub fn raw_delay(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        let ms = match self {
            BackoffStrategy::Fixed { delay_ms } => *delay_ms,
            BackoffStrategy::Exponential { base_ms } => {
                let factor = 1u64.checked_shl(attempt - 1).unwrap_or(u64::MAX);
                base_ms.saturating_mul(factor)
            }
            BackoffStrategy::Linear { increment_ms } => {
                increment_ms.saturating_mul(attempt as u64)
            }
        };
        Duration::from_millis(ms)
    }
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        BackoffStrategy::Exponential { base_ms: 1_000 }
    }
}

/// Outcome of a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry(Duration),
    Exhausted,
}

/// Decides whether and when a failed job is delivered again.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub strategy: BackoffStrategy,
    pub max_delay: Duration,
    /// Uniform jitter drawn from `[0, delay * jitter_fraction)`.
    pub jitter_fraction: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            strategy: BackoffStrategy::default(),
            max_delay: Duration::from_secs(300),
            jitter_fraction: 0.1,
        }
    }
}

impl RetryPolicy {
    pub fn exponential(base: Duration, max_delay: Duration, jitter_fraction: f64) -> Self {
        Self {
            strategy: BackoffStrategy::Exponential {
                base_ms: base.as_millis() as u64,
            },
            max_delay,
            jitter_fraction,
        }
    }

    pub fn decide(&self, job: &JobRecord, error: &HandlerError) -> RetryDecision {
        if error.is_terminal() || job.attempt_count >= job.max_attempts {
            return RetryDecision::Exhausted;
        }
        RetryDecision::Retry(self.delay_for(job.attempt_count))
    }

    /// Capped delay without jitter.
    pub fn base_delay_for(&self, attempt: u32) -> Duration {
        self.strategy.raw_delay(attempt).min(self.max_delay)
    }

    pub fn delay_for(&self, attempt: u32) -> Duration {
        let delay = self.base_delay_for(attempt);
        let spread = delay.as_secs_f64() * self.jitter_fraction.clamp(0.0, 1.0);
        if spread <= 0.0 {
            return delay;
        }
        let jitter = rand::thread_rng().gen_range(0.0..spread);
        delay + Duration::from_secs_f64(jitter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Priority;
    use serde_json::json;

    fn policy(jitter: f64) -> RetryPolicy {
        RetryPolicy::exponential(Duration::from_millis(100), Duration::from_secs(2), jitter)
    }

    fn job(attempt_count: u32, max_attempts: u32) -> JobRecord {
        let mut job = JobRecord::new("send_email", json!({}), Priority::NORMAL, max_attempts);
        job.attempt_count = attempt_count;
        job
    }

    #[test]
    fn exponential_doubles_from_base() {
        let p = policy(0.0);
        assert_eq!(p.base_delay_for(1), Duration::from_millis(100));
        assert_eq!(p.base_delay_for(2), Duration::from_millis(200));
        assert_eq!(p.base_delay_for(3), Duration::from_millis(400));
    }

    #[test]
    fn delays_are_monotonic_up_to_the_cap() {
        let p = policy(0.0);
        let delays: Vec<_> = (1..=12).map(|a| p.base_delay_for(a)).collect();
        assert!(delays.windows(2).all(|w| w[1] >= w[0]));
        assert_eq!(*delays.last().unwrap(), Duration::from_secs(2));
    }

    #[test]
    fn huge_attempt_counts_saturate() {
        let p = policy(0.0);
        assert_eq!(p.base_delay_for(200), Duration::from_secs(2));
    }

    #[test]
    fn jitter_stays_within_fraction() {
        let p = policy(0.5);
        for _ in 0..200 {
            let d = p.delay_for(2);
            assert!(d >= Duration::from_millis(200));
            assert!(d < Duration::from_millis(300));
        }
    }

    #[test]
    fn retriable_failure_with_budget_retries() {
        let p = policy(0.0);
        let decision = p.decide(&job(1, 3), &HandlerError::retriable("smtp down"));
        assert_eq!(decision, RetryDecision::Retry(Duration::from_millis(100)));
    }

    #[test]
    fn exhausted_when_budget_is_spent() {
        let p = policy(0.0);
        let decision = p.decide(&job(3, 3), &HandlerError::retriable("smtp down"));
        assert_eq!(decision, RetryDecision::Exhausted);
    }

    #[test]
    fn terminal_failure_skips_remaining_budget() {
        let p = policy(0.0);
        let decision = p.decide(&job(1, 5), &HandlerError::terminal("malformed payload"));
        assert_eq!(decision, RetryDecision::Exhausted);
    }

    #[test]
    fn fixed_and_linear_strategies() {
        assert_eq!(
            BackoffStrategy::Fixed { delay_ms: 50 }.raw_delay(4),
            Duration::from_millis(50)
        );
        assert_eq!(
            BackoffStrategy::Linear { increment_ms: 50 }.raw_delay(3),
            Duration::from_millis(150)
        );
    }
}
