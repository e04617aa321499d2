// src/job.rs
use crate::{HandlerResult, JobContext, RelayError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Unique identifier for a job
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for JobId {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self> {
        s.parse()
            .map(JobId)
            .map_err(|_| RelayError::Validation(format!("invalid job id '{s}'")))
    }
}

/// Job execution priority. Higher values are served sooner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct Priority(u8);

impl Priority {
    pub const MIN: Priority = Priority(0);
    pub const MAX: Priority = Priority(9);

    pub const LOW: Priority = Priority(1);
    pub const NORMAL: Priority = Priority(5);
    pub const HIGH: Priority = Priority(7);
    pub const CRITICAL: Priority = Priority(9);

    pub fn new(value: u8) -> Result<Self> {
        if value > Self::MAX.0 {
            return Err(RelayError::Validation(format!(
                "priority {value} out of range {}..={}",
                Self::MIN.0,
                Self::MAX.0
            )));
        }
        Ok(Priority(value))
    }

    pub fn value(self) -> u8 {
        self.0
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::NORMAL
    }
}

impl TryFrom<u8> for Priority {
    type Error = RelayError;

    fn try_from(value: u8) -> Result<Self> {
        Priority::new(value)
    }
}

impl From<Priority> for u8 {
    fn from(p: Priority) -> u8 {
        p.0
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle status of a job record
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    Running,
    Succeeded,
    FailedRetryable,
    FailedTerminal,
    DeadLettered,
}

impl JobStatus {
    pub const ALL: [JobStatus; 6] = [
        JobStatus::Pending,
        JobStatus::Running,
        JobStatus::Succeeded,
        JobStatus::FailedRetryable,
        JobStatus::FailedTerminal,
        JobStatus::DeadLettered,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "PENDING",
            JobStatus::Running => "RUNNING",
            JobStatus::Succeeded => "SUCCEEDED",
            JobStatus::FailedRetryable => "FAILED_RETRYABLE",
            JobStatus::FailedTerminal => "FAILED_TERMINAL",
            JobStatus::DeadLettered => "DEAD_LETTERED",
        }
    }

    /// No automatic transition leaves a terminal status.
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::DeadLettered)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self> {
        JobStatus::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| RelayError::Validation(format!("unknown job status '{s}'")))
    }
}

/// Why an attempt failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Retriable,
    Terminal,
    Timeout,
    Interrupted,
    Unregistered,
}

impl FailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::Retriable => "retriable",
            FailureKind::Terminal => "terminal",
            FailureKind::Timeout => "timeout",
            FailureKind::Interrupted => "interrupted",
            FailureKind::Unregistered => "unregistered",
        }
    }
}

/// Structured error detail kept on the job record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobError {
    pub kind: FailureKind,
    pub message: String,
    pub attempt: u32,
    pub occurred_at: DateTime<Utc>,
}

impl JobError {
    pub fn new(kind: FailureKind, message: impl Into<String>, attempt: u32) -> Self {
        Self {
            kind,
            message: message.into(),
            attempt,
            occurred_at: Utc::now(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.kind, FailureKind::Terminal | FailureKind::Unregistered)
    }
}

impl fmt::Display for JobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} failure on attempt {}: {}", self.kind.as_str(), self.attempt, self.message)
    }
}

/// Durable record of a job, the single source of truth for its status
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub job_type: String,
    pub payload: serde_json::Value,
    pub priority: Priority,
    pub status: JobStatus,
    pub attempt_count: u32,
    pub max_attempts: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub last_error: Option<JobError>,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub lease_until: Option<DateTime<Utc>>,
    /// Value returned by the handler of the successful attempt.
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    /// Set once the dead-letter copy has been confirmed by the broker.
    #[serde(default)]
    pub dead_letter_published: bool,
    pub version: u64,
}

impl JobRecord {
    pub fn new(
        job_type: impl Into<String>,
        payload: serde_json::Value,
        priority: Priority,
        max_attempts: u32,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            job_type: job_type.into(),
            payload,
            priority,
            status: JobStatus::Pending,
            attempt_count: 0,
            max_attempts,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            last_error: None,
            next_attempt_at: None,
            lease_until: None,
            result: None,
            dead_letter_published: false,
            version: 0,
        }
    }

    /// Rebuild a record from a wire message whose record is missing.
    pub fn from_message(message: &JobMessage, max_attempts: u32) -> Self {
        let mut record = Self::new(
            message.job_type.clone(),
            message.payload.clone(),
            message.priority,
            max_attempts,
        );
        record.id = message.job_id.clone();
        record.attempt_count = message.attempt_count.min(max_attempts);
        record.created_at = message.enqueued_at;
        record
    }

    pub fn attempts_remaining(&self) -> u32 {
        self.max_attempts.saturating_sub(self.attempt_count)
    }

    pub fn to_message(&self) -> JobMessage {
        JobMessage {
            job_id: self.id.clone(),
            job_type: self.job_type.clone(),
            payload: self.payload.clone(),
            priority: self.priority,
            attempt_count: self.attempt_count,
            enqueued_at: Utc::now(),
            headers: BTreeMap::new(),
        }
    }
}

/// Message carried through the broker. `job_id` joins it to its record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobMessage {
    pub job_id: JobId,
    pub job_type: String,
    pub payload: serde_json::Value,
    pub priority: Priority,
    pub attempt_count: u32,
    pub enqueued_at: DateTime<Utc>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

impl JobMessage {
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Typed job: payload type that knows how to perform itself
#[async_trait::async_trait]
pub trait Job: Send + Sync + 'static + serde::de::DeserializeOwned + serde::Serialize {
    /// Execute the job with the provided context
    async fn perform(&self, ctx: &JobContext) -> HandlerResult;

    /// Type tag used for registration and routing
    fn name() -> &'static str
    where
        Self: Sized;

    fn priority() -> Priority
    where
        Self: Sized,
    {
        Priority::NORMAL
    }
}
