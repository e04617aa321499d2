// src/service.rs
use crate::{
    Broker, DeadLetterHandler, Job, JobFilter, JobId, JobPage, JobRecord, JobStatistics,
    JobStatus, JobStore, Priority, PriorityRouter, RelayConfig, RelayError, Result,
    store::modify,
};
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Attempt budgets: a default, a hard upper bound, and per-type overrides
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptLimits {
    pub default: u32,
    pub limit: u32,
    pub per_type: BTreeMap<String, u32>,
}

impl Default for AttemptLimits {
    fn default() -> Self {
        let config = RelayConfig::default();
        Self::from_config(&config)
    }
}

impl AttemptLimits {
    pub fn from_config(config: &RelayConfig) -> Self {
        Self {
            default: config.default_max_attempts,
            limit: config.max_attempts_limit,
            per_type: config
                .types
                .iter()
                .filter_map(|(name, t)| t.max_attempts.map(|n| (name.clone(), n)))
                .collect(),
        }
    }

    pub fn for_type(&self, job_type: &str) -> u32 {
        self.per_type.get(job_type).copied().unwrap_or(self.default)
    }
}

/// Producer-facing API: submit jobs and query their records.
///
/// Status answers come from the record store only, so they stay available
/// while the broker is down.
#[derive(Clone)]
pub struct JobService {
    store: Arc<dyn JobStore>,
    broker: Arc<dyn Broker>,
    router: Arc<PriorityRouter>,
    attempts: AttemptLimits,
}

impl JobService {
    pub fn new(
        store: Arc<dyn JobStore>,
        broker: Arc<dyn Broker>,
        router: Arc<PriorityRouter>,
    ) -> Self {
        Self {
            store,
            broker,
            router,
            attempts: AttemptLimits::default(),
        }
    }

    pub fn from_config(
        config: &RelayConfig,
        store: Arc<dyn JobStore>,
        broker: Arc<dyn Broker>,
        router: Arc<PriorityRouter>,
    ) -> Self {
        Self::new(store, broker, router).with_attempt_limits(AttemptLimits::from_config(config))
    }

    pub fn with_attempt_limits(mut self, attempts: AttemptLimits) -> Self {
        self.attempts = attempts;
        self
    }

    pub fn router(&self) -> &PriorityRouter {
        &self.router
    }

    /// Declare every live and dead-letter queue the router knows.
    pub async fn declare_topology(&self) -> Result<()> {
        for target in self.router.all_targets() {
            self.broker.declare(&target).await?;
        }
        Ok(())
    }

    /// Create a PENDING record and publish it.
    ///
    /// Input is validated before anything is written. If publishing fails
    /// the record stays PENDING and a `Publish` error naming the job is
    /// returned; [`republish`](Self::republish) or the stale sweep picks it
    /// up later.
    #[instrument(skip(self, payload), fields(job_id = tracing::field::Empty))]
    pub async fn submit(
        &self,
        job_type: &str,
        payload: serde_json::Value,
        priority: u8,
        max_attempts: Option<u32>,
    ) -> Result<JobId> {
        if !self.router.knows(job_type) {
            return Err(RelayError::Validation(format!("unknown job type '{job_type}'")));
        }
        let priority = Priority::new(priority)?;
        let max_attempts = max_attempts.unwrap_or_else(|| self.attempts.for_type(job_type));
        if max_attempts == 0 || max_attempts > self.attempts.limit {
            return Err(RelayError::Validation(format!(
                "max_attempts {max_attempts} out of range 1..={}",
                self.attempts.limit
            )));
        }

        let record = JobRecord::new(job_type, payload, priority, max_attempts);
        tracing::Span::current().record("job_id", tracing::field::display(&record.id));
        let target = self.router.route_job(&record)?;
        self.store.insert(&record).await?;

        self.broker
            .publish(&target, &record.to_message())
            .await
            .map_err(|e| publish_error(&record.id, e))?;

        info!(
            job_id = %record.id,
            job_type,
            priority = priority.value(),
            queue = %target.queue,
            "Job submitted"
        );
        Ok(record.id)
    }

    /// Submit a typed job with its default priority and attempt budget.
    pub async fn enqueue<T: Job>(&self, job: &T) -> Result<JobId> {
        let payload = serde_json::to_value(job)?;
        self.submit(T::name(), payload, T::priority().value(), None).await
    }

    pub async fn get_status(&self, id: &JobId) -> Result<JobRecord> {
        self.store
            .get(id)
            .await?
            .ok_or_else(|| RelayError::NotFound(id.clone()))
    }

    pub async fn list_jobs(&self, filter: &JobFilter) -> Result<JobPage> {
        self.store.list(filter).await
    }

    pub async fn get_statistics(&self) -> Result<JobStatistics> {
        self.store.statistics().await
    }

    /// Publish a PENDING job again, e.g. after `submit` reported a
    /// `Publish` error.
    pub async fn republish(&self, id: &JobId) -> Result<JobRecord> {
        let record = self.get_status(id).await?;
        if record.status != JobStatus::Pending {
            return Err(RelayError::InvalidTransition {
                job_id: id.clone(),
                from: record.status,
                to: JobStatus::Pending,
            });
        }
        let target = self.router.route_job(&record)?;
        self.broker
            .publish(&target, &record.to_message())
            .await
            .map_err(|e| publish_error(id, e))?;

        // Mark the record fresh so the next sweep leaves it alone.
        let now = Utc::now();
        let (record, _) = modify(self.store.as_ref(), id, |r| {
            if r.status == JobStatus::Pending {
                r.updated_at = now;
            }
            Ok(())
        })
        .await?;
        debug!(job_id = %id, "Job republished");
        Ok(record)
    }

    /// Republish PENDING jobs untouched for `older_than` whose scheduled
    /// retry, if any, is overdue. Returns how many were republished.
    pub async fn reconcile_stale(&self, older_than: Duration) -> Result<usize> {
        let now = Utc::now();
        let threshold = now
            - chrono::Duration::from_std(older_than)
                .map_err(|e| RelayError::Validation(e.to_string()))?;
        let filter = JobFilter {
            status: Some(JobStatus::Pending),
            updated_before: Some(threshold),
            ..Default::default()
        }
        .oldest_first();

        let mut republished = 0;
        for record in self.store.list(&filter).await?.jobs {
            if record.next_attempt_at.is_some_and(|due| due > now) {
                continue;
            }
            match self.republish(&record.id).await {
                Ok(_) => republished += 1,
                // Picked up by a dispatcher in the meantime.
                Err(RelayError::InvalidTransition { .. }) => {}
                Err(e) => {
                    warn!(job_id = %record.id, error = %e, "Stale job not republished");
                    return Err(e);
                }
            }
        }
        if republished > 0 {
            info!(republished, "Stale pending jobs republished");
        }
        Ok(republished)
    }

    /// Dead-letter inspection and requeue over the same store and broker.
    pub fn dead_letters(&self) -> DeadLetterHandler {
        DeadLetterHandler::new(
            Arc::clone(&self.store),
            Arc::clone(&self.broker),
            Arc::clone(&self.router),
        )
    }

    pub async fn health_check(&self) -> bool {
        self.broker.health_check().await
    }
}

fn publish_error(id: &JobId, err: RelayError) -> RelayError {
    match err {
        RelayError::Publish { reason, .. } => RelayError::publish(Some(id.clone()), reason),
        other => RelayError::publish(Some(id.clone()), other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{MemoryBroker, MemoryJobStore};
    use serde_json::json;

    fn service() -> (JobService, MemoryJobStore, MemoryBroker) {
        let store = MemoryJobStore::new();
        let broker = MemoryBroker::new();
        let router = PriorityRouter::new(
            "jobs",
            (0..=9).collect(),
            ["send_email", "cleanup"],
        )
        .unwrap();
        let service = JobService::new(
            Arc::new(store.clone()),
            Arc::new(broker.clone()),
            Arc::new(router),
        );
        (service, store, broker)
    }

    #[tokio::test]
    async fn submit_creates_pending_record_and_message() {
        let (service, _, broker) = service();
        let id = service
            .submit("send_email", json!({"to": "a@b.c"}), 5, Some(3))
            .await
            .unwrap();

        let record = service.get_status(&id).await.unwrap();
        assert_eq!(record.status, JobStatus::Pending);
        assert_eq!(record.attempt_count, 0);
        assert_eq!(record.max_attempts, 3);

        let messages = broker.messages("jobs.send_email.p5");
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].job_id, id);
        assert_eq!(messages[0].headers["routing_key"], "jobs.send_email.p5");
    }

    #[tokio::test]
    async fn invalid_input_touches_nothing() {
        let (service, store, broker) = service();
        assert!(matches!(
            service.submit("fax", json!({}), 5, None).await,
            Err(RelayError::Validation(_))
        ));
        assert!(matches!(
            service.submit("send_email", json!({}), 10, None).await,
            Err(RelayError::Validation(_))
        ));
        assert!(matches!(
            service.submit("send_email", json!({}), 5, Some(0)).await,
            Err(RelayError::Validation(_))
        ));
        assert!(matches!(
            service.submit("send_email", json!({}), 5, Some(11)).await,
            Err(RelayError::Validation(_))
        ));
        assert!(store.is_empty().await);
        assert_eq!(broker.queue_depth("jobs.send_email.p5").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn unknown_job_is_not_found() {
        let (service, _, _) = service();
        assert!(matches!(
            service.get_status(&JobId::new()).await,
            Err(RelayError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn publish_failure_keeps_pending_record() {
        let (service, store, broker) = service();
        broker.set_available(false);

        let err = service
            .submit("cleanup", json!({}), 1, None)
            .await
            .unwrap_err();
        let RelayError::Publish { job_id: Some(id), .. } = err else {
            panic!("expected a publish error naming the job, got {err:?}");
        };
        assert_eq!(store.get(&id).await.unwrap().unwrap().status, JobStatus::Pending);

        broker.set_available(true);
        service.republish(&id).await.unwrap();
        assert_eq!(broker.messages("jobs.cleanup.p1").len(), 1);
    }

    #[tokio::test]
    async fn reconcile_republishes_only_stale_pending_jobs() {
        let (service, store, broker) = service();
        broker.set_available(false);
        let stuck = service.submit("cleanup", json!({}), 3, None).await.unwrap_err();
        let RelayError::Publish { job_id: Some(stuck), .. } = stuck else {
            panic!("expected a publish error");
        };
        broker.set_available(true);
        let fresh = service.submit("cleanup", json!({}), 3, None).await.unwrap();

        // Age the stuck record past the threshold.
        let (_, _) = modify(&store, &stuck, |r| {
            r.updated_at = Utc::now() - chrono::Duration::minutes(10);
            Ok(())
        })
        .await
        .unwrap();

        let count = service.reconcile_stale(Duration::from_secs(60)).await.unwrap();
        assert_eq!(count, 1);
        let ids: Vec<_> = broker
            .messages("jobs.cleanup.p3")
            .into_iter()
            .map(|m| m.job_id)
            .collect();
        assert_eq!(ids, vec![fresh, stuck.clone()]);

        // Freshly touched, so a second sweep has nothing to do.
        assert_eq!(service.reconcile_stale(Duration::from_secs(60)).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn listing_and_statistics() {
        let (service, _, _) = service();
        for (job_type, priority) in [("send_email", 7), ("send_email", 2), ("cleanup", 5)] {
            service.submit(job_type, json!({}), priority, None).await.unwrap();
        }
        let page = service
            .list_jobs(&JobFilter::default().with_type("send_email").paged(0, 1))
            .await
            .unwrap();
        assert_eq!(page.total, 2);
        assert_eq!(page.jobs.len(), 1);

        let stats = service.get_statistics().await.unwrap();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.count(JobStatus::Pending), 3);
        assert_eq!(stats.by_type["cleanup"], 1);
    }

    #[tokio::test]
    async fn per_type_attempt_budget_applies() {
        let (service, _, _) = service();
        let mut limits = AttemptLimits::default();
        limits.per_type.insert("cleanup".to_string(), 1);
        let service = service.with_attempt_limits(limits);

        let id = service.submit("cleanup", json!({}), 0, None).await.unwrap();
        assert_eq!(service.get_status(&id).await.unwrap().max_attempts, 1);
        let id = service.submit("send_email", json!({}), 0, None).await.unwrap();
        assert_eq!(service.get_status(&id).await.unwrap().max_attempts, 3);
    }
}
