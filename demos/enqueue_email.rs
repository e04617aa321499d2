use serde_json::json;
use std::sync::Arc;
use taskrelay::{
    JobService, PriorityRouter, RedisBroker, RedisBrokerOptions, RedisJobStore, RelayConfig,
    RelayError,
    telemetry::{self, LogFormat},
};
use tracing::{info, warn};

const JOB_TYPES: [&str; 4] = ["send_email", "notification", "data_processing", "cleanup"];

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    telemetry::init(LogFormat::from_env());

    let path = std::env::var("TASKRELAY_CONFIG").unwrap_or_else(|_| "taskrelay.toml".into());
    let config = RelayConfig::load(&path)?;

    let store = RedisJobStore::connect(&config.redis_url, config.key_prefix.clone()).await?;
    let broker =
        RedisBroker::connect(&config.redis_url, RedisBrokerOptions::from_config(&config)).await?;
    let router = PriorityRouter::from_config(&config, JOB_TYPES)?;
    let service = JobService::from_config(&config, Arc::new(store), Arc::new(broker), Arc::new(router));
    service.declare_topology().await?;

    let welcome = service
        .submit(
            "send_email",
            json!({
                "to_email": "user@example.com",
                "subject": "Welcome!",
                "body": "Thanks for signing up",
            }),
            5,
            None,
        )
        .await?;
    info!(job_id = %welcome, "Welcome email enqueued");

    let urgent = json!({
        "to_email": "user@example.com",
        "subject": "Password reset",
        "body": "Use the link below",
    });
    match service.submit("send_email", urgent, 9, Some(5)).await {
        Ok(id) => info!(job_id = %id, "Urgent email enqueued"),
        // The record exists; retrying the publish later is safe.
        Err(RelayError::Publish { job_id: Some(id), reason }) => {
            warn!(job_id = %id, %reason, "Publish failed, retrying once");
            service.republish(&id).await?;
        }
        Err(e) => return Err(e.into()),
    }

    // Rejected before anything is written.
    if let Err(e) = service.submit("fax", json!({}), 5, None).await {
        info!(error = %e, "Unknown job type rejected");
    }

    let record = service.get_status(&welcome).await?;
    info!(job_id = %record.id, status = %record.status, attempts = record.attempt_count, "Status");

    let stats = service.get_statistics().await?;
    info!(stats = %serde_json::to_string(&stats)?, "Statistics");
    Ok(())
}
