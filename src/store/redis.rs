// src/store/redis.rs
use super::{JobFilter, JobPage, JobStatistics, JobStore};
use crate::{JobId, JobRecord, JobStatus, RelayError, Result, lua::LuaScripts};
use ::redis::{AsyncCommands, Client as RedisClient, aio::ConnectionManager};
use std::sync::Arc;
use tracing::info;

/// Redis-backed record store.
///
/// Each record is a hash holding its JSON, version and status; status and
/// type sets plus a created-at sorted set serve listing and statistics.
#[derive(Clone)]
pub struct RedisJobStore {
    conn: ConnectionManager,
    scripts: Arc<LuaScripts>,
    key_prefix: String,
}

impl RedisJobStore {
    pub async fn connect(redis_url: &str, key_prefix: impl Into<String>) -> Result<Self> {
        let client = RedisClient::open(redis_url)?;
        let conn = ConnectionManager::new(client).await?;
        info!(%redis_url, "Job store connected");
        Ok(Self::with_connection(conn, key_prefix))
    }

    pub fn with_connection(conn: ConnectionManager, key_prefix: impl Into<String>) -> Self {
        Self {
            conn,
            scripts: Arc::new(LuaScripts::new()),
            key_prefix: key_prefix.into(),
        }
    }

    async fn write(&self, record: &JobRecord, expected: Option<u64>) -> Result<i64> {
        let json = serde_json::to_string(record)?;
        let mut conn = self.conn.clone();
        let result: i64 = self
            .scripts
            .save_record
            .key(self.job_key(&record.id))
            .key(self.created_key())
            .key(self.type_key(&record.job_type))
            .key(self.types_key())
            .arg(expected.map(|v| v.to_string()).unwrap_or_default())
            .arg(json)
            .arg(record.version)
            .arg(record.status.as_str())
            .arg(self.status_prefix())
            .arg(record.id.to_string())
            .arg(record.created_at.timestamp_millis())
            .arg(&record.job_type)
            .invoke_async(&mut conn)
            .await?;
        Ok(result)
    }

    async fn load_many(&self, ids: Vec<String>) -> Result<Vec<JobRecord>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut pipe = ::redis::pipe();
        for id in &ids {
            pipe.hget(format!("{}:job:{}", self.key_prefix, id), "record");
        }
        let mut conn = self.conn.clone();
        let raw: Vec<Option<String>> = pipe.query_async(&mut conn).await?;
        raw.into_iter()
            .flatten()
            .map(|json| serde_json::from_str(&json).map_err(RelayError::from))
            .collect()
    }

    // Redis key helpers
    fn job_key(&self, id: &JobId) -> String {
        format!("{}:job:{}", self.key_prefix, id)
    }

    fn created_key(&self) -> String {
        format!("{}:jobs:created", self.key_prefix)
    }

    fn status_prefix(&self) -> String {
        format!("{}:jobs:status:", self.key_prefix)
    }

    fn status_key(&self, status: JobStatus) -> String {
        format!("{}{}", self.status_prefix(), status.as_str())
    }

    fn type_key(&self, job_type: &str) -> String {
        format!("{}:jobs:type:{}", self.key_prefix, job_type)
    }

    fn types_key(&self) -> String {
        format!("{}:jobs:types", self.key_prefix)
    }
}

#[async_trait::async_trait]
impl JobStore for RedisJobStore {
    async fn insert(&self, record: &JobRecord) -> Result<()> {
        match self.write(record, None).await? {
            1 => Ok(()),
            _ => Err(RelayError::VersionConflict(record.id.clone())),
        }
    }

    async fn get(&self, id: &JobId) -> Result<Option<JobRecord>> {
        let mut conn = self.conn.clone();
        let json: Option<String> = conn.hget(self.job_key(id), "record").await?;
        json.map(|j| serde_json::from_str(&j).map_err(RelayError::from))
            .transpose()
    }

    async fn save(&self, record: &JobRecord, expected_version: u64) -> Result<JobRecord> {
        let mut next = record.clone();
        next.version = expected_version + 1;
        match self.write(&next, Some(expected_version)).await? {
            1 => Ok(next),
            -2 => Err(RelayError::NotFound(record.id.clone())),
            _ => Err(RelayError::VersionConflict(record.id.clone())),
        }
    }

    async fn list(&self, filter: &JobFilter) -> Result<JobPage> {
        let mut conn = self.conn.clone();
        // Narrowest index first; the remaining criteria are applied in memory.
        let ids: Vec<String> = if let Some(status) = filter.status {
            conn.smembers(self.status_key(status)).await?
        } else if let Some(job_type) = &filter.job_type {
            conn.smembers(self.type_key(job_type)).await?
        } else {
            let min = filter
                .created_after
                .map(|t| t.timestamp_millis().to_string())
                .unwrap_or_else(|| "-inf".to_string());
            let max = filter
                .created_before
                .map(|t| t.timestamp_millis().to_string())
                .unwrap_or_else(|| "+inf".to_string());
            conn.zrangebyscore(self.created_key(), min, max).await?
        };
        let records = self.load_many(ids).await?;
        Ok(filter.apply(records))
    }

    async fn statistics(&self) -> Result<JobStatistics> {
        let mut conn = self.conn.clone();
        let mut stats = JobStatistics {
            total: conn.zcard(self.created_key()).await?,
            ..Default::default()
        };
        for status in JobStatus::ALL {
            let count: u64 = conn.scard(self.status_key(status)).await?;
            stats.by_status.insert(status, count);
        }
        let types: Vec<String> = conn.smembers(self.types_key()).await?;
        for job_type in types {
            let count: u64 = conn.scard(self.type_key(&job_type)).await?;
            stats.by_type.insert(job_type, count);
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Priority, store::modify};
    use serde_json::json;

    async fn store() -> RedisJobStore {
        let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".into());
        let prefix = format!("taskrelay-test-{}", uuid::Uuid::new_v4());
        RedisJobStore::connect(&url, prefix).await.unwrap()
    }

    #[tokio::test]
    #[ignore = "needs a running Redis (REDIS_URL)"]
    async fn versioned_writes_and_indexes() {
        let store = store().await;
        let record = JobRecord::new("send_email", json!({"to": "a@b.c"}), Priority::HIGH, 3);
        store.insert(&record).await.unwrap();
        assert!(store.insert(&record).await.is_err());

        let (saved, _) = modify(&store, &record.id, |r| {
            r.status = JobStatus::Running;
            Ok(())
        })
        .await
        .unwrap();
        assert_eq!(saved.version, 1);
        assert!(matches!(
            store.save(&record, 0).await,
            Err(RelayError::VersionConflict(_))
        ));

        let running = store
            .list(&JobFilter::default().with_status(JobStatus::Running))
            .await
            .unwrap();
        assert_eq!(running.total, 1);

        let stats = store.statistics().await.unwrap();
        assert_eq!(stats.total, 1);
        assert_eq!(stats.count(JobStatus::Running), 1);
        assert_eq!(stats.count(JobStatus::Pending), 0);
        assert_eq!(stats.by_type["send_email"], 1);
    }
}
