// src/dead_letter.rs
use crate::{
    Applied, Broker, JobError, JobFilter, JobId, JobPage, JobRecord, JobStatus, JobStore,
    PriorityRouter, RelayError, Result, store::modify,
};
use chrono::Utc;
use std::sync::Arc;
use tracing::{info, warn};

/// Moves exhausted or permanently failed jobs out of the live queues, and
/// brings them back on operator request.
#[derive(Clone)]
pub struct DeadLetterHandler {
    store: Arc<dyn JobStore>,
    broker: Arc<dyn Broker>,
    router: Arc<PriorityRouter>,
}

impl DeadLetterHandler {
    pub fn new(
        store: Arc<dyn JobStore>,
        broker: Arc<dyn Broker>,
        router: Arc<PriorityRouter>,
    ) -> Self {
        Self {
            store,
            broker,
            router,
        }
    }

    /// Mark the job DEAD_LETTERED and copy it onto its dead-letter queue.
    ///
    /// The record is written first. If the copy cannot be published the
    /// error is returned and `dead_letter_published` stays false, so a
    /// redelivery publishes it again. Once the copy is confirmed, further
    /// calls change nothing and publish nothing.
    pub async fn quarantine(&self, job: &JobRecord, error: JobError) -> Result<JobRecord> {
        let now = Utc::now();
        let (record, applied) =
            modify(self.store.as_ref(), &job.id, |r| r.dead_letter(error.clone(), now)).await?;
        if applied == Applied::Unchanged && record.dead_letter_published {
            return Ok(record);
        }

        if applied == Applied::Changed {
            warn!(
                job_id = %record.id,
                job_type = %record.job_type,
                attempts = record.attempt_count,
                error = %error,
                "Job dead-lettered"
            );
        }

        let target = self.router.dead_letter_target(&record.job_type)?;
        let message = record
            .to_message()
            .with_header("failure_kind", error.kind.as_str())
            .with_header("failure_reason", error.message.clone());
        if let Err(e) = self.broker.publish(&target, &message).await {
            warn!(job_id = %record.id, error = %e, "Dead-letter copy not published");
            return Err(match e {
                RelayError::Publish { reason, .. } => {
                    RelayError::publish(Some(record.id.clone()), reason)
                }
                other => RelayError::publish(Some(record.id.clone()), other.to_string()),
            });
        }

        let now = Utc::now();
        let marked =
            modify(self.store.as_ref(), &record.id, |r| r.mark_dead_letter_published(now)).await;
        match marked {
            Ok((record, _)) => Ok(record),
            // Requeued by an operator in the meantime; the copy is already out.
            Err(RelayError::InvalidTransition { .. }) => Ok(record),
            Err(e) => Err(e),
        }
    }

    /// Operator action: reset a DEAD_LETTERED job to PENDING with a fresh
    /// attempt budget and publish it again.
    ///
    /// The record is reset before publishing; if the publish fails the
    /// record stays PENDING and the error is returned, so the caller can
    /// retry or leave it to the stale sweep.
    pub async fn requeue(&self, id: &JobId) -> Result<JobRecord> {
        let now = Utc::now();
        let (record, _) = modify(self.store.as_ref(), id, |r| r.reset_for_requeue(now)).await?;
        let target = self.router.route_job(&record)?;
        self.broker
            .publish(&target, &record.to_message())
            .await
            .map_err(|e| match e {
                RelayError::Publish { reason, .. } => RelayError::publish(Some(id.clone()), reason),
                other => RelayError::publish(Some(id.clone()), other.to_string()),
            })?;
        info!(job_id = %id, job_type = %record.job_type, "Dead-lettered job requeued");
        Ok(record)
    }

    /// Dead-lettered jobs, most recent first.
    pub async fn list(&self, offset: usize, limit: usize) -> Result<JobPage> {
        self.store
            .list(
                &JobFilter::default()
                    .with_status(JobStatus::DeadLettered)
                    .paged(offset, limit),
            )
            .await
    }
}
