use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use taskrelay::{
    AppContext, DispatcherBuilder, HandlerError, HandlerResult, Job, JobContext, JobRegistry,
    Priority, RedisBroker, RedisBrokerOptions, RedisJobStore, RelayConfig, async_trait,
    telemetry::{self, LogFormat},
};
use tracing::info;

#[derive(Serialize, Deserialize)]
struct SendEmail {
    to_email: String,
    subject: String,
    body: String,
    #[serde(default)]
    is_html: bool,
}

#[async_trait]
impl Job for SendEmail {
    async fn perform(&self, ctx: &JobContext) -> HandlerResult {
        if !self.to_email.contains('@') {
            return Err(HandlerError::terminal(format!(
                "invalid recipient '{}'",
                self.to_email
            )));
        }
        let mailer = ctx
            .app::<AppState>()
            .ok_or_else(|| HandlerError::terminal("mailer not configured"))?;
        mailer
            .send(&self.to_email, &self.subject, &self.body, self.is_html)
            .await?;
        Ok(None)
    }

    fn name() -> &'static str {
        "send_email"
    }

    fn priority() -> Priority {
        Priority::HIGH
    }
}

#[derive(Serialize, Deserialize)]
struct Notification {
    message: String,
    #[serde(default = "default_notification_type")]
    notification_type: String,
    user_id: Option<u64>,
}

fn default_notification_type() -> String {
    "info".to_string()
}

#[async_trait]
impl Job for Notification {
    async fn perform(&self, _ctx: &JobContext) -> HandlerResult {
        tokio::time::sleep(Duration::from_millis(200)).await;
        info!(user_id = ?self.user_id, kind = %self.notification_type, "Notification sent");
        Ok(None)
    }

    fn name() -> &'static str {
        "notification"
    }
}

#[derive(Serialize, Deserialize)]
struct DataProcessing {
    data_source: String,
    processing_type: String,
    #[serde(default)]
    parameters: serde_json::Value,
}

#[async_trait]
impl Job for DataProcessing {
    async fn perform(&self, _ctx: &JobContext) -> HandlerResult {
        let count = self
            .parameters
            .get("count")
            .and_then(|c| c.as_u64())
            .unwrap_or(100);
        tokio::time::sleep(Duration::from_millis(500)).await;
        let processed = count * 4 / 5;
        info!(
            source = %self.data_source,
            kind = %self.processing_type,
            processed,
            "Data processing completed"
        );
        Ok(Some(json!({ "processed": processed, "skipped": count - processed })))
    }

    fn name() -> &'static str {
        "data_processing"
    }

    fn priority() -> Priority {
        Priority::LOW
    }
}

#[derive(Serialize, Deserialize)]
struct Cleanup {
    cleanup_type: String,
    #[serde(default = "default_older_than")]
    older_than_days: u32,
    #[serde(default)]
    dry_run: bool,
}

fn default_older_than() -> u32 {
    30
}

#[async_trait]
impl Job for Cleanup {
    async fn perform(&self, _ctx: &JobContext) -> HandlerResult {
        if !(1..=365).contains(&self.older_than_days) {
            return Err(HandlerError::terminal("older_than_days must be within 1..=365"));
        }
        tokio::time::sleep(Duration::from_millis(300)).await;
        info!(
            kind = %self.cleanup_type,
            days = self.older_than_days,
            dry_run = self.dry_run,
            "Cleanup completed"
        );
        Ok(Some(json!({ "cleanup_type": self.cleanup_type, "dry_run": self.dry_run })))
    }

    fn name() -> &'static str {
        "cleanup"
    }

    fn priority() -> Priority {
        Priority::LOW
    }
}

#[derive(Clone)]
struct AppState {
    sender: String,
}

impl AppState {
    async fn send(&self, to: &str, subject: &str, body: &str, html: bool) -> anyhow::Result<()> {
        tokio::time::sleep(Duration::from_millis(100)).await;
        info!(from = %self.sender, %to, %subject, bytes = body.len(), html, "Email sent");
        Ok(())
    }
}

impl AppContext for AppState {
    fn clone_context(&self) -> Arc<dyn AppContext> {
        Arc::new(self.clone())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    telemetry::init(LogFormat::from_env());

    let path = std::env::var("TASKRELAY_CONFIG").unwrap_or_else(|_| "taskrelay.toml".into());
    let config = RelayConfig::load(&path)?;

    let mut registry = JobRegistry::new();
    registry
        .register::<SendEmail>()
        .register::<Notification>()
        .register::<DataProcessing>()
        .register::<Cleanup>();

    let store = RedisJobStore::connect(&config.redis_url, config.key_prefix.clone()).await?;
    let broker =
        RedisBroker::connect(&config.redis_url, RedisBrokerOptions::from_config(&config)).await?;

    let app = AppState {
        sender: "noreply@example.com".to_string(),
    };
    let dispatcher = DispatcherBuilder::from_config(&config, registry)
        .with_app_context(Arc::new(app))
        .build(Arc::new(store), Arc::new(broker))?;

    info!(queues = ?dispatcher.queues(), "Worker ready, press Ctrl+C to stop");
    dispatcher.run().await?;
    Ok(())
}
