// src/store/memory.rs
use super::{JobFilter, JobPage, JobStatistics, JobStore};
use crate::{JobId, JobRecord, JobStatus, RelayError, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// In-process record store, for tests and single-node setups
#[derive(Clone, Default)]
pub struct MemoryJobStore {
    records: Arc<RwLock<HashMap<JobId, JobRecord>>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

#[async_trait::async_trait]
impl JobStore for MemoryJobStore {
    async fn insert(&self, record: &JobRecord) -> Result<()> {
        let mut records = self.records.write().await;
        if records.contains_key(&record.id) {
            return Err(RelayError::VersionConflict(record.id.clone()));
        }
        records.insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn get(&self, id: &JobId) -> Result<Option<JobRecord>> {
        Ok(self.records.read().await.get(id).cloned())
    }

    async fn save(&self, record: &JobRecord, expected_version: u64) -> Result<JobRecord> {
        let mut records = self.records.write().await;
        let stored = records
            .get_mut(&record.id)
            .ok_or_else(|| RelayError::NotFound(record.id.clone()))?;
        if stored.version != expected_version {
            return Err(RelayError::VersionConflict(record.id.clone()));
        }
        let mut next = record.clone();
        next.version = expected_version + 1;
        *stored = next.clone();
        Ok(next)
    }

    async fn list(&self, filter: &JobFilter) -> Result<JobPage> {
        let records = self.records.read().await;
        Ok(filter.apply(records.values().cloned()))
    }

    async fn statistics(&self) -> Result<JobStatistics> {
        let records = self.records.read().await;
        let mut stats = JobStatistics {
            total: records.len() as u64,
            by_status: JobStatus::ALL.into_iter().map(|s| (s, 0)).collect(),
            ..Default::default()
        };
        for record in records.values() {
            *stats.by_status.entry(record.status).or_default() += 1;
            *stats.by_type.entry(record.job_type.clone()).or_default() += 1;
        }
        Ok(stats)
    }
}
