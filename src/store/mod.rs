// src/store/mod.rs
//! Durable job records.
//!
//! Writers use optimistic versioning: `save` only succeeds when the caller
//! saw the latest version. [`modify`] wraps the read/apply/write cycle and
//! retries on conflict, so concurrent redeliveries of one job settle on a
//! single consistent record.

mod memory;
mod redis;

pub use self::memory::MemoryJobStore;
pub use self::redis::RedisJobStore;

use crate::{JobId, JobRecord, JobStatus, RelayError, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;

const MAX_CONFLICT_RETRIES: usize = 16;

#[async_trait::async_trait]
pub trait JobStore: Send + Sync + 'static {
    /// Persist a new record. Fails with `VersionConflict` if the id exists.
    async fn insert(&self, record: &JobRecord) -> Result<()>;

    async fn get(&self, id: &JobId) -> Result<Option<JobRecord>>;

    /// Replace the record if its stored version is `expected_version`.
    /// Returns the stored record, whose version is `expected_version + 1`.
    async fn save(&self, record: &JobRecord, expected_version: u64) -> Result<JobRecord>;

    async fn list(&self, filter: &JobFilter) -> Result<JobPage>;

    async fn statistics(&self) -> Result<JobStatistics>;
}

/// Read the record, apply `change`, and write it back under version check.
///
/// A change that leaves the record untouched is not written. `change` may
/// run several times when writers race, so it must not have side effects
/// beyond the record it is handed.
pub async fn modify<S, F, T>(store: &S, id: &JobId, mut change: F) -> Result<(JobRecord, T)>
where
    S: JobStore + ?Sized,
    F: FnMut(&mut JobRecord) -> Result<T> + Send,
    T: Send,
{
    for _ in 0..MAX_CONFLICT_RETRIES {
        let current = store
            .get(id)
            .await?
            .ok_or_else(|| RelayError::NotFound(id.clone()))?;
        let mut next = current.clone();
        let out = change(&mut next)?;
        if next == current {
            return Ok((current, out));
        }
        match store.save(&next, current.version).await {
            Ok(saved) => return Ok((saved, out)),
            Err(RelayError::VersionConflict(_)) => {
                tracing::debug!(job_id = %id, "Record changed underneath us, retrying");
                continue;
            }
            Err(e) => return Err(e),
        }
    }
    Err(RelayError::VersionConflict(id.clone()))
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SortOrder {
    #[default]
    NewestFirst,
    OldestFirst,
}

/// Listing criteria. Unset fields do not filter.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub job_type: Option<String>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
    pub updated_before: Option<DateTime<Utc>>,
    pub offset: usize,
    pub limit: Option<usize>,
    pub order: SortOrder,
}

impl JobFilter {
    pub fn with_status(mut self, status: JobStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_type(mut self, job_type: impl Into<String>) -> Self {
        self.job_type = Some(job_type.into());
        self
    }

    pub fn created_between(mut self, after: DateTime<Utc>, before: DateTime<Utc>) -> Self {
        self.created_after = Some(after);
        self.created_before = Some(before);
        self
    }

    pub fn paged(mut self, offset: usize, limit: usize) -> Self {
        self.offset = offset;
        self.limit = Some(limit);
        self
    }

    pub fn oldest_first(mut self) -> Self {
        self.order = SortOrder::OldestFirst;
        self
    }

    pub fn matches(&self, record: &JobRecord) -> bool {
        self.status.is_none_or(|s| record.status == s)
            && self.job_type.as_deref().is_none_or(|t| record.job_type == t)
            && self.created_after.is_none_or(|t| record.created_at >= t)
            && self.created_before.is_none_or(|t| record.created_at < t)
            && self.updated_before.is_none_or(|t| record.updated_at < t)
    }

    /// Filter, sort and page an unordered candidate set.
    pub(crate) fn apply<I>(&self, candidates: I) -> JobPage
    where
        I: IntoIterator<Item = JobRecord>,
    {
        let mut jobs: Vec<JobRecord> = candidates.into_iter().filter(|r| self.matches(r)).collect();
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        if self.order == SortOrder::NewestFirst {
            jobs.reverse();
        }
        let total = jobs.len();
        let jobs = jobs
            .into_iter()
            .skip(self.offset)
            .take(self.limit.unwrap_or(usize::MAX))
            .collect();
        JobPage { jobs, total }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobPage {
    pub jobs: Vec<JobRecord>,
    /// Matches before paging.
    pub total: usize,
}

/// Aggregate counts over all records
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JobStatistics {
    pub total: u64,
    pub by_status: BTreeMap<JobStatus, u64>,
    pub by_type: BTreeMap<String, u64>,
}

impl JobStatistics {
    pub fn count(&self, status: JobStatus) -> u64 {
        self.by_status.get(&status).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Priority;
    use chrono::Duration;
    use serde_json::json;

    fn record(job_type: &str, age_secs: i64) -> JobRecord {
        let mut r = JobRecord::new(job_type, json!({}), Priority::NORMAL, 3);
        r.created_at = Utc::now() - Duration::seconds(age_secs);
        r
    }

    #[test]
    fn filter_pages_newest_first() {
        let records = vec![record("a", 30), record("a", 10), record("b", 20)];
        let page = JobFilter::default().with_type("a").paged(0, 1).apply(records.clone());
        assert_eq!(page.total, 2);
        assert_eq!(page.jobs[0].id, records[1].id);

        let page = JobFilter::default().oldest_first().apply(records.clone());
        assert_eq!(page.jobs[0].id, records[0].id);
    }

    #[test]
    fn filter_by_date_range() {
        let records = vec![record("a", 300), record("a", 100), record("a", 5)];
        let now = Utc::now();
        let page = JobFilter::default()
            .created_between(now - Duration::seconds(200), now - Duration::seconds(50))
            .apply(records.clone());
        assert_eq!(page.total, 1);
        assert_eq!(page.jobs[0].id, records[1].id);
    }

    #[tokio::test]
    async fn modify_skips_writes_for_no_ops() {
        let store = MemoryJobStore::new();
        let r = record("a", 0);
        store.insert(&r).await.unwrap();

        let (unchanged, _) = modify(&store, &r.id, |_| Ok(())).await.unwrap();
        assert_eq!(unchanged.version, 0);

        let (changed, _) = modify(&store, &r.id, |rec| {
            rec.attempt_count = 1;
            Ok(())
        })
        .await
        .unwrap();
        assert_eq!(changed.version, 1);
    }

    #[tokio::test]
    async fn modify_reports_missing_records() {
        let store = MemoryJobStore::new();
        let id = JobId::new();
        let err = modify(&store, &id, |_| Ok(())).await.unwrap_err();
        assert!(matches!(err, RelayError::NotFound(missing) if missing == id));
    }
}
