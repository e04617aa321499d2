// src/error.rs
use crate::{JobId, JobStatus};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Publish failed{}: {reason}", for_job(.job_id))]
    Publish {
        job_id: Option<JobId>,
        reason: String,
    },

    #[error("Job not found: {0}")]
    NotFound(JobId),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Registry error: {0}")]
    Registry(String),

    #[error("Invalid transition for job {job_id}: {from} -> {to}")]
    InvalidTransition {
        job_id: JobId,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("Concurrent update conflict on job {0}")]
    VersionConflict(JobId),

    #[error("Broker error: {0}")]
    Broker(String),

    #[error("Subscription closed")]
    SubscriptionClosed,

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl RelayError {
    pub fn publish(job_id: Option<JobId>, reason: impl Into<String>) -> Self {
        RelayError::Publish {
            job_id,
            reason: reason.into(),
        }
    }

    /// Transport-level failures the dispatcher may recover from by reconnecting.
    pub fn is_connection_error(&self) -> bool {
        match self {
            RelayError::Redis(e) => {
                e.is_connection_dropped() || e.is_connection_refusal() || e.is_io_error() || e.is_timeout()
            }
            RelayError::Broker(_) | RelayError::Publish { .. } => true,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, RelayError>;

fn for_job(job_id: &Option<JobId>) -> String {
    job_id
        .as_ref()
        .map(|id| format!(" for job {id}"))
        .unwrap_or_default()
}

/// Failure reported by a job handler.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandlerError {
    /// Transient failure; consumes one attempt and may be retried.
    #[error("{0}")]
    Retriable(String),

    /// Permanent failure; skips the remaining retry budget.
    #[error("{0}")]
    Terminal(String),
}

impl HandlerError {
    pub fn retriable(message: impl Into<String>) -> Self {
        HandlerError::Retriable(message.into())
    }

    pub fn terminal(message: impl Into<String>) -> Self {
        HandlerError::Terminal(message.into())
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, HandlerError::Terminal(_))
    }

    pub fn message(&self) -> &str {
        match self {
            HandlerError::Retriable(m) | HandlerError::Terminal(m) => m,
        }
    }
}

impl From<anyhow::Error> for HandlerError {
    fn from(err: anyhow::Error) -> Self {
        HandlerError::Retriable(format!("{err:#}"))
    }
}

/// What a handler returns. The optional JSON value is kept on the record
/// as `result` once the job succeeds.
pub type HandlerResult<T = Option<serde_json::Value>> = std::result::Result<T, HandlerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_error_mentions_job_when_known() {
        let id = JobId::new();
        let err = RelayError::publish(Some(id.clone()), "broker unreachable");
        assert_eq!(
            err.to_string(),
            format!("Publish failed for job {id}: broker unreachable")
        );
        assert_eq!(
            RelayError::publish(None, "nope").to_string(),
            "Publish failed: nope"
        );
    }

    #[test]
    fn anyhow_errors_are_retriable() {
        let err: HandlerError = anyhow::anyhow!("smtp timeout").into();
        assert!(!err.is_terminal());
        assert_eq!(err.message(), "smtp timeout");
    }

    #[test]
    fn connection_errors_are_classified() {
        assert!(RelayError::Broker("reset".into()).is_connection_error());
        assert!(!RelayError::Validation("bad".into()).is_connection_error());
        assert!(!RelayError::NotFound(JobId::new()).is_connection_error());
    }
}
