//! Retries, dead-lettering and operator requeue, all in process.

use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use taskrelay::{
    DispatcherBuilder, HandlerError, JobRegistry, JobService, JobStatus, MemoryBroker,
    MemoryJobStore, RetryPolicy,
    telemetry::{self, LogFormat},
};
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    telemetry::init(LogFormat::Pretty);

    let store = Arc::new(MemoryJobStore::new());
    let broker = Arc::new(MemoryBroker::new());

    // Fails four times in a row, then recovers.
    let calls = Arc::new(AtomicU32::new(0));
    let mut registry = JobRegistry::new();
    let counter = Arc::clone(&calls);
    registry.register_fn("data_processing", move |_payload| {
        let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
        async move {
            if n <= 4 {
                Err(HandlerError::retriable(format!("upstream unavailable (call {n})")))
            } else {
                Ok(Some(json!({ "rows": 128 })))
            }
        }
    });

    let dispatcher = Arc::new(
        DispatcherBuilder::new(registry)
            .with_concurrency(2)
            .with_retry_policy(RetryPolicy::exponential(
                Duration::from_millis(200),
                Duration::from_secs(2),
                0.1,
            ))
            .with_reconcile_interval(None)
            .with_signal_handling(false)
            .build(store.clone(), broker.clone())?,
    );
    let runner = {
        let dispatcher = Arc::clone(&dispatcher);
        tokio::spawn(async move { dispatcher.run().await })
    };

    let service = JobService::new(store, broker, Arc::new(dispatcher.router().clone()));

    let id = service
        .submit("data_processing", json!({"data_source": "s3://reports"}), 5, Some(3))
        .await?;
    let record = wait_for(&service, &id, JobStatus::DeadLettered).await?;
    info!(
        attempts = record.attempt_count,
        error = ?record.last_error.map(|e| e.message),
        "Budget spent, job quarantined"
    );

    let dead = service.dead_letters().list(0, 10).await?;
    info!(count = dead.total, "Dead-lettered jobs");

    service.dead_letters().requeue(&id).await?;
    let record = wait_for(&service, &id, JobStatus::Succeeded).await?;
    info!(attempts = record.attempt_count, result = ?record.result, "Requeued job succeeded");

    let stats = dispatcher.stats();
    info!(
        succeeded = stats.succeeded,
        retried = stats.retried,
        dead_lettered = stats.dead_lettered,
        "Dispatcher stats"
    );

    dispatcher.stop();
    runner.await??;
    Ok(())
}

async fn wait_for(
    service: &JobService,
    id: &taskrelay::JobId,
    status: JobStatus,
) -> anyhow::Result<taskrelay::JobRecord> {
    for _ in 0..200 {
        let record = service.get_status(id).await?;
        if record.status == status {
            return Ok(record);
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    anyhow::bail!("job {id} never reached {status}")
}
