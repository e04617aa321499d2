// src/lifecycle.rs
//! Status transitions on a [`JobRecord`].
//!
//! ```text
//! PENDING -> RUNNING -> SUCCEEDED
//!                    -> FAILED_RETRYABLE -> PENDING (after delay)
//!                                        -> DEAD_LETTERED (budget spent)
//!                    -> FAILED_TERMINAL  -> DEAD_LETTERED
//! ```
//!
//! SUCCEEDED and DEAD_LETTERED are terminal. Repeating the transition into
//! the status a record already holds is a no-op, which is what makes
//! redelivered messages harmless once the record is settled. The only way
//! out of DEAD_LETTERED is the operator requeue.

use crate::{JobError, JobRecord, JobStatus, RelayError, Result};
use chrono::{DateTime, Duration, Utc};

/// Whether the lifecycle permits `from -> to` on the automatic path.
pub fn can_transition(from: JobStatus, to: JobStatus) -> bool {
    use JobStatus::*;
    matches!(
        (from, to),
        (Pending, Running)
            | (Running, Running)
            | (Running, Succeeded)
            | (Running, FailedRetryable)
            | (Running, FailedTerminal)
            | (Running, Pending)
            | (FailedRetryable, Pending)
            | (FailedRetryable, DeadLettered)
            | (FailedTerminal, DeadLettered)
            | (Running, DeadLettered)
            | (Pending, DeadLettered)
    )
}

/// Result of applying a transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Changed,
    Unchanged,
}

impl JobRecord {
    fn guard(&self, to: JobStatus) -> Result<Applied> {
        if self.status == to && to.is_terminal() {
            return Ok(Applied::Unchanged);
        }
        if can_transition(self.status, to) {
            Ok(Applied::Changed)
        } else {
            Err(RelayError::InvalidTransition {
                job_id: self.id.clone(),
                from: self.status,
                to,
            })
        }
    }

    fn touch(&mut self, status: JobStatus, now: DateTime<Utc>) {
        self.status = status;
        self.updated_at = now;
    }

    /// Whether another consumer may still be executing this job.
    pub fn lease_active(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Running && self.lease_until.is_some_and(|until| until > now)
    }

    /// Begin a delivery attempt. This is where attempts are counted.
    pub fn start_attempt(&mut self, lease: Duration, now: DateTime<Utc>) -> Result<Applied> {
        self.guard(JobStatus::Running)?;
        if self.lease_active(now) {
            return Err(RelayError::InvalidTransition {
                job_id: self.id.clone(),
                from: self.status,
                to: JobStatus::Running,
            });
        }
        if self.attempt_count >= self.max_attempts {
            return Err(RelayError::Validation(format!(
                "job {} has used all {} attempts",
                self.id, self.max_attempts
            )));
        }
        self.attempt_count += 1;
        self.started_at = Some(now);
        self.next_attempt_at = None;
        self.lease_until = Some(now + lease);
        self.touch(JobStatus::Running, now);
        Ok(Applied::Changed)
    }

    /// RUNNING -> SUCCEEDED, keeping what the handler returned.
    pub fn succeed(
        &mut self,
        result: Option<serde_json::Value>,
        now: DateTime<Utc>,
    ) -> Result<Applied> {
        if self.guard(JobStatus::Succeeded)? == Applied::Unchanged {
            return Ok(Applied::Unchanged);
        }
        self.result = result;
        self.completed_at = Some(now);
        self.lease_until = None;
        self.touch(JobStatus::Succeeded, now);
        Ok(Applied::Changed)
    }

    pub fn fail_retryable(&mut self, error: JobError, now: DateTime<Utc>) -> Result<Applied> {
        self.guard(JobStatus::FailedRetryable)?;
        self.last_error = Some(error);
        self.lease_until = None;
        self.touch(JobStatus::FailedRetryable, now);
        Ok(Applied::Changed)
    }

    pub fn fail_terminal(&mut self, error: JobError, now: DateTime<Utc>) -> Result<Applied> {
        self.guard(JobStatus::FailedTerminal)?;
        self.last_error = Some(error);
        self.lease_until = None;
        self.touch(JobStatus::FailedTerminal, now);
        Ok(Applied::Changed)
    }

    /// FAILED_RETRYABLE -> PENDING, due again at `next_attempt_at`.
    pub fn schedule_retry(
        &mut self,
        next_attempt_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Applied> {
        if self.status != JobStatus::FailedRetryable {
            return Err(RelayError::InvalidTransition {
                job_id: self.id.clone(),
                from: self.status,
                to: JobStatus::Pending,
            });
        }
        self.next_attempt_at = Some(next_attempt_at);
        self.touch(JobStatus::Pending, now);
        Ok(Applied::Changed)
    }

    /// RUNNING -> PENDING when a shutting-down dispatcher gives the job back.
    /// The interrupted attempt stays counted.
    pub fn hand_off(&mut self, error: JobError, now: DateTime<Utc>) -> Result<Applied> {
        if self.status != JobStatus::Running {
            return Err(RelayError::InvalidTransition {
                job_id: self.id.clone(),
                from: self.status,
                to: JobStatus::Pending,
            });
        }
        self.last_error = Some(error);
        self.lease_until = None;
        self.touch(JobStatus::Pending, now);
        Ok(Applied::Changed)
    }

    /// Quarantine. `error` becomes `last_error`, which is never empty here.
    pub fn dead_letter(&mut self, error: JobError, now: DateTime<Utc>) -> Result<Applied> {
        if self.guard(JobStatus::DeadLettered)? == Applied::Unchanged {
            return Ok(Applied::Unchanged);
        }
        self.last_error = Some(error);
        self.lease_until = None;
        self.next_attempt_at = None;
        self.completed_at = Some(now);
        self.dead_letter_published = false;
        self.touch(JobStatus::DeadLettered, now);
        Ok(Applied::Changed)
    }

    /// Note that the dead-letter copy reached the broker.
    pub fn mark_dead_letter_published(&mut self, now: DateTime<Utc>) -> Result<Applied> {
        if self.status != JobStatus::DeadLettered {
            return Err(RelayError::InvalidTransition {
                job_id: self.id.clone(),
                from: self.status,
                to: JobStatus::DeadLettered,
            });
        }
        if self.dead_letter_published {
            return Ok(Applied::Unchanged);
        }
        self.dead_letter_published = true;
        self.updated_at = now;
        Ok(Applied::Changed)
    }

    /// Operator action: DEAD_LETTERED -> PENDING with a fresh attempt budget.
    /// `last_error` is kept for audit.
    pub fn reset_for_requeue(&mut self, now: DateTime<Utc>) -> Result<Applied> {
        if self.status != JobStatus::DeadLettered {
            return Err(RelayError::InvalidTransition {
                job_id: self.id.clone(),
                from: self.status,
                to: JobStatus::Pending,
            });
        }
        self.attempt_count = 0;
        self.started_at = None;
        self.completed_at = None;
        self.next_attempt_at = None;
        self.lease_until = None;
        self.dead_letter_published = false;
        self.touch(JobStatus::Pending, now);
        Ok(Applied::Changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{FailureKind, Priority};
    use serde_json::json;

    fn record(max_attempts: u32) -> JobRecord {
        JobRecord::new("send_email", json!({}), Priority::NORMAL, max_attempts)
    }

    fn lease() -> Duration {
        Duration::seconds(30)
    }

    fn err(kind: FailureKind, attempt: u32) -> JobError {
        JobError::new(kind, "boom", attempt)
    }

    #[test]
    fn happy_path_counts_one_attempt() {
        let now = Utc::now();
        let mut job = record(1);
        job.start_attempt(lease(), now).unwrap();
        assert_eq!(job.status, JobStatus::Running);
        assert_eq!(job.attempt_count, 1);
        assert!(job.lease_active(now));

        job.succeed(None, now).unwrap();
        assert_eq!(job.status, JobStatus::Succeeded);
        assert_eq!(job.attempt_count, 1);
        assert!(job.completed_at.is_some());
        assert!(!job.lease_active(now));
    }

    #[test]
    fn success_keeps_the_handler_result() {
        let now = Utc::now();
        let mut job = record(1);
        job.start_attempt(lease(), now).unwrap();
        job.succeed(Some(json!({"processed": 80})), now).unwrap();
        assert_eq!(job.result, Some(json!({"processed": 80})));

        job.succeed(Some(json!({"processed": 0})), now).unwrap();
        assert_eq!(job.result, Some(json!({"processed": 80})));
    }

    #[test]
    fn dead_letter_copy_is_marked_once() {
        let now = Utc::now();
        let mut job = record(1);
        assert!(job.mark_dead_letter_published(now).is_err());

        job.start_attempt(lease(), now).unwrap();
        job.fail_terminal(err(FailureKind::Terminal, 1), now).unwrap();
        job.dead_letter(err(FailureKind::Terminal, 1), now).unwrap();
        assert!(!job.dead_letter_published);
        assert_eq!(job.mark_dead_letter_published(now).unwrap(), Applied::Changed);
        assert_eq!(job.mark_dead_letter_published(now).unwrap(), Applied::Unchanged);

        job.reset_for_requeue(now).unwrap();
        assert!(!job.dead_letter_published);
    }

    #[test]
    fn succeeding_twice_is_a_no_op() {
        let now = Utc::now();
        let mut job = record(3);
        job.start_attempt(lease(), now).unwrap();
        job.succeed(None, now).unwrap();
        let settled = job.clone();

        assert_eq!(job.succeed(None, now + Duration::seconds(5)).unwrap(), Applied::Unchanged);
        assert_eq!(job, settled);
    }

    #[test]
    fn terminal_states_cannot_be_left_automatically() {
        let now = Utc::now();
        let mut job = record(3);
        job.start_attempt(lease(), now).unwrap();
        job.succeed(None, now).unwrap();
        assert!(job.start_attempt(lease(), now).is_err());
        assert!(job.fail_retryable(err(FailureKind::Retriable, 1), now).is_err());
        assert!(job.dead_letter(err(FailureKind::Terminal, 1), now).is_err());

        let mut dead = record(1);
        dead.start_attempt(lease(), now).unwrap();
        dead.fail_terminal(err(FailureKind::Terminal, 1), now).unwrap();
        dead.dead_letter(err(FailureKind::Terminal, 1), now).unwrap();
        assert!(dead.start_attempt(lease(), now).is_err());
        assert!(dead.succeed(None, now).is_err());
        assert_eq!(
            dead.dead_letter(err(FailureKind::Retriable, 9), now).unwrap(),
            Applied::Unchanged
        );
        assert_eq!(dead.last_error.as_ref().unwrap().kind, FailureKind::Terminal);
    }

    #[test]
    fn retry_cycle_returns_to_pending() {
        let now = Utc::now();
        let mut job = record(3);
        job.start_attempt(lease(), now).unwrap();
        job.fail_retryable(err(FailureKind::Retriable, 1), now).unwrap();
        let due = now + Duration::seconds(2);
        job.schedule_retry(due, now).unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.next_attempt_at, Some(due));

        job.start_attempt(lease(), due).unwrap();
        assert_eq!(job.attempt_count, 2);
        assert_eq!(job.next_attempt_at, None);
    }

    #[test]
    fn attempts_never_exceed_budget() {
        let now = Utc::now();
        let mut job = record(2);
        for attempt in 1..=2 {
            job.start_attempt(lease(), now).unwrap();
            job.fail_retryable(err(FailureKind::Retriable, attempt), now).unwrap();
            job.schedule_retry(now, now).unwrap();
        }
        assert!(job.start_attempt(lease(), now).is_err());
        assert_eq!(job.attempt_count, 2);
    }

    #[test]
    fn active_lease_blocks_a_second_runner() {
        let now = Utc::now();
        let mut job = record(3);
        job.start_attempt(lease(), now).unwrap();
        assert!(job.start_attempt(lease(), now + Duration::seconds(1)).is_err());

        let expired = now + Duration::seconds(31);
        job.start_attempt(lease(), expired).unwrap();
        assert_eq!(job.attempt_count, 2);
    }

    #[test]
    fn hand_off_keeps_the_attempt() {
        let now = Utc::now();
        let mut job = record(3);
        job.start_attempt(lease(), now).unwrap();
        job.hand_off(err(FailureKind::Interrupted, 1), now).unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.attempt_count, 1);
    }

    #[test]
    fn requeue_only_from_dead_letter() {
        let now = Utc::now();
        let mut job = record(1);
        assert!(job.reset_for_requeue(now).is_err());

        job.start_attempt(lease(), now).unwrap();
        job.fail_retryable(err(FailureKind::Retriable, 1), now).unwrap();
        job.dead_letter(err(FailureKind::Retriable, 1), now).unwrap();
        job.reset_for_requeue(now).unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.attempt_count, 0);
        assert!(job.last_error.is_some());
    }
}
