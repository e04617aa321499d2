// src/broker/redis.rs
use super::{Acknowledger, Broker, Delivery, MaintenanceReport, Subscription, stamp};
use crate::{JobMessage, RelayConfig, RelayError, Result, RoutingTarget, lua::LuaScripts};
use ::redis::{AsyncCommands, Client as RedisClient, aio::ConnectionManager};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

const MAINTENANCE_BATCH: usize = 500;

/// Options for the Redis broker
#[derive(Debug, Clone)]
pub struct RedisBrokerOptions {
    pub key_prefix: String,
    /// Sleep between claim attempts on empty queues.
    pub poll_interval: Duration,
    /// How long a delivery may stay unsettled before it is handed out again.
    pub visibility_timeout: Duration,
}

impl Default for RedisBrokerOptions {
    fn default() -> Self {
        Self {
            key_prefix: "taskrelay".to_string(),
            poll_interval: Duration::from_millis(100),
            visibility_timeout: Duration::from_secs(600),
        }
    }
}

impl RedisBrokerOptions {
    pub fn from_config(config: &RelayConfig) -> Self {
        Self {
            key_prefix: config.key_prefix.clone(),
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            visibility_timeout: Duration::from_secs(config.visibility_timeout_secs),
        }
    }
}

/// Broker on Redis lists.
///
/// Each queue is a list fed with LPUSH and drained with RPOP. Claimed
/// messages move into an in-flight hash with a visibility deadline; the
/// periodic `maintain` call returns expired ones to their queue and promotes
/// due delayed messages. `ConnectionManager` reconnects on its own, so a
/// dropped connection surfaces as failed calls until Redis is back.
#[derive(Clone)]
pub struct RedisBroker {
    inner: Arc<Shared>,
}

struct Shared {
    conn: ConnectionManager,
    scripts: LuaScripts,
    options: RedisBrokerOptions,
}

impl RedisBroker {
    pub async fn connect(redis_url: &str, options: RedisBrokerOptions) -> Result<Self> {
        let client = RedisClient::open(redis_url)?;
        let conn = ConnectionManager::new(client).await?;
        info!(%redis_url, prefix = %options.key_prefix, "Broker connected");
        Ok(Self::with_connection(conn, options))
    }

    pub fn with_connection(conn: ConnectionManager, options: RedisBrokerOptions) -> Self {
        Self {
            inner: Arc::new(Shared {
                conn,
                scripts: LuaScripts::new(),
                options,
            }),
        }
    }
}

impl Shared {
    fn wait_prefix(&self) -> String {
        format!("{}:queue:", self.options.key_prefix)
    }

    fn wait_key(&self, queue: &str) -> String {
        format!("{}{}{}", self.wait_prefix(), queue, WAIT_SUFFIX)
    }

    fn meta_key(&self, queue: &str) -> String {
        format!("{}:queue:{}:meta", self.options.key_prefix, queue)
    }

    fn queues_key(&self) -> String {
        format!("{}:queues", self.options.key_prefix)
    }

    fn inflight_key(&self) -> String {
        format!("{}:inflight", self.options.key_prefix)
    }

    fn deadlines_key(&self) -> String {
        format!("{}:inflight:deadlines", self.options.key_prefix)
    }

    fn delayed_key(&self) -> String {
        format!("{}:delayed", self.options.key_prefix)
    }

    fn seq_key(&self) -> String {
        format!("{}:delivery_seq", self.options.key_prefix)
    }

    async fn settle(&self, tag: u64, requeue: bool) -> Result<()> {
        let mut conn = self.conn.clone();
        let settled: i64 = self
            .scripts
            .settle_delivery
            .key(self.inflight_key())
            .key(self.deadlines_key())
            .arg(tag)
            .arg(self.wait_prefix())
            .arg(WAIT_SUFFIX)
            .arg(if requeue { "1" } else { "0" })
            .invoke_async(&mut conn)
            .await?;
        if settled == 1 {
            Ok(())
        } else {
            Err(RelayError::Broker(format!("delivery {tag} is no longer in flight")))
        }
    }
}

const WAIT_SUFFIX: &str = ":wait";

#[async_trait::async_trait]
impl Broker for RedisBroker {
    async fn declare(&self, target: &RoutingTarget) -> Result<()> {
        let shared = &self.inner;
        let mut conn = shared.conn.clone();
        let props = &target.properties;
        let _: () = ::redis::pipe()
            .sadd(shared.queues_key(), &target.queue)
            .ignore()
            .hset_multiple(
                shared.meta_key(&target.queue),
                &[
                    ("exchange", target.exchange.clone()),
                    ("routing_key", target.routing_key.clone()),
                    ("durable", props.durable.to_string()),
                    ("max_length", props.max_length.unwrap_or(0).to_string()),
                ],
            )
            .ignore()
            .query_async(&mut conn)
            .await?;
        debug!(queue = %target.queue, "Queue declared");
        Ok(())
    }

    async fn publish(&self, target: &RoutingTarget, message: &JobMessage) -> Result<()> {
        let shared = &self.inner;
        let body = stamp(target, message).encode()?;
        let mut conn = shared.conn.clone();
        let pushed: i64 = shared
            .scripts
            .publish
            .key(shared.wait_key(&target.queue))
            .arg(body)
            .arg(target.properties.max_length.unwrap_or(0))
            .invoke_async(&mut conn)
            .await
            .map_err(|e| RelayError::publish(Some(message.job_id.clone()), e.to_string()))?;
        if pushed < 0 {
            return Err(RelayError::publish(
                Some(message.job_id.clone()),
                format!("queue '{}' is full", target.queue),
            ));
        }
        Ok(())
    }

    async fn schedule_delayed(
        &self,
        target: &RoutingTarget,
        message: &JobMessage,
        delay: Duration,
    ) -> Result<()> {
        let shared = &self.inner;
        let body = String::from_utf8(stamp(target, message).encode()?)
            .map_err(|e| RelayError::Broker(e.to_string()))?;
        let member = serde_json::to_string(&serde_json::json!({
            "queue": target.queue,
            "body": body,
        }))?;
        let due = Utc::now().timestamp_millis() + delay.as_millis() as i64;
        let mut conn = shared.conn.clone();
        let _: () = conn
            .zadd(shared.delayed_key(), member, due)
            .await
            .map_err(|e| RelayError::publish(Some(message.job_id.clone()), e.to_string()))?;
        Ok(())
    }

    async fn consume(&self, queues: Vec<String>) -> Result<Box<dyn Subscription>> {
        Ok(Box::new(RedisSubscription {
            shared: Arc::clone(&self.inner),
            queues,
            cancelled: false,
        }))
    }

    async fn maintain(&self) -> Result<MaintenanceReport> {
        let shared = &self.inner;
        let now = Utc::now().timestamp_millis();
        let mut conn = shared.conn.clone();

        let promoted: usize = shared
            .scripts
            .promote_delayed
            .key(shared.delayed_key())
            .arg(now)
            .arg(shared.wait_prefix())
            .arg(WAIT_SUFFIX)
            .arg(MAINTENANCE_BATCH)
            .invoke_async(&mut conn)
            .await?;

        let reclaimed: usize = shared
            .scripts
            .reclaim_expired
            .key(shared.inflight_key())
            .key(shared.deadlines_key())
            .arg(now)
            .arg(shared.wait_prefix())
            .arg(WAIT_SUFFIX)
            .arg(MAINTENANCE_BATCH)
            .invoke_async(&mut conn)
            .await?;

        Ok(MaintenanceReport { promoted, reclaimed })
    }

    async fn queue_depth(&self, queue: &str) -> Result<u64> {
        let mut conn = self.inner.conn.clone();
        Ok(conn.llen(self.inner.wait_key(queue)).await?)
    }

    async fn health_check(&self) -> bool {
        let mut conn = self.inner.conn.clone();
        let pong: ::redis::RedisResult<String> = ::redis::cmd("PING").query_async(&mut conn).await;
        pong.is_ok()
    }
}

#[async_trait::async_trait]
impl Acknowledger for Shared {
    async fn ack(&self, _queue: &str, tag: u64) -> Result<()> {
        self.settle(tag, false).await
    }

    async fn nack(&self, _queue: &str, tag: u64, requeue: bool) -> Result<()> {
        self.settle(tag, requeue).await
    }
}

struct RedisSubscription {
    shared: Arc<Shared>,
    queues: Vec<String>,
    cancelled: bool,
}

impl RedisSubscription {
    async fn try_claim(&self) -> Result<Option<Delivery>> {
        let shared = &self.shared;
        let deadline =
            Utc::now().timestamp_millis() + shared.options.visibility_timeout.as_millis() as i64;

        let mut invocation = shared.scripts.claim_delivery.prepare_invoke();
        invocation
            .key(shared.inflight_key())
            .key(shared.deadlines_key())
            .key(shared.seq_key())
            .arg(deadline);
        for queue in &self.queues {
            invocation.key(shared.wait_key(queue)).arg(queue);
        }

        let mut conn = shared.conn.clone();
        let claimed: Option<(String, u64, Vec<u8>)> = invocation.invoke_async(&mut conn).await?;
        Ok(claimed.map(|(queue, tag, body)| {
            let acker: Arc<dyn Acknowledger> = self.shared.clone();
            Delivery::new(queue, tag, body, acker)
        }))
    }
}

#[async_trait::async_trait]
impl Subscription for RedisSubscription {
    async fn next_delivery(&mut self) -> Result<Delivery> {
        loop {
            if self.cancelled {
                return Err(RelayError::SubscriptionClosed);
            }
            if let Some(delivery) = self.try_claim().await? {
                return Ok(delivery);
            }
            tokio::time::sleep(self.shared.options.poll_interval).await;
        }
    }

    fn cancel(&mut self) {
        self.cancelled = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{JobRecord, Priority, PriorityRouter};
    use serde_json::json;

    async fn broker() -> RedisBroker {
        let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".into());
        let options = RedisBrokerOptions {
            key_prefix: format!("taskrelay-test-{}", uuid::Uuid::new_v4()),
            poll_interval: Duration::from_millis(10),
            visibility_timeout: Duration::from_millis(50),
        };
        RedisBroker::connect(&url, options).await.unwrap()
    }

    #[tokio::test]
    #[ignore = "needs a running Redis (REDIS_URL)"]
    async fn claim_settle_and_reclaim() {
        let broker = broker().await;
        let router = PriorityRouter::new("jobs", vec![0, 5], ["send_email"]).unwrap();
        let low = JobRecord::new("send_email", json!({}), Priority::LOW, 3);
        let high = JobRecord::new("send_email", json!({}), Priority::HIGH, 3);
        for record in [&low, &high] {
            let target = router.route_job(record).unwrap();
            broker.declare(&target).await.unwrap();
            broker.publish(&target, &record.to_message()).await.unwrap();
        }

        let queues = router
            .consume_order(&["send_email".to_string()])
            .unwrap()
            .into_iter()
            .map(|t| t.queue)
            .collect();
        let mut sub = broker.consume(queues).await.unwrap();
        let first = sub.next_delivery().await.unwrap();
        assert_eq!(first.message().unwrap().job_id, high.id);
        first.ack().await.unwrap();

        // Left unsettled past the visibility timeout, then reclaimed.
        let second = sub.next_delivery().await.unwrap();
        assert_eq!(second.message().unwrap().job_id, low.id);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(broker.maintain().await.unwrap().reclaimed, 1);
        assert!(second.ack().await.is_err());
        let again = sub.next_delivery().await.unwrap();
        assert_eq!(again.message().unwrap().job_id, low.id);
    }

    #[tokio::test]
    #[ignore = "needs a running Redis (REDIS_URL)"]
    async fn delayed_messages_are_promoted() {
        let broker = broker().await;
        let router = PriorityRouter::new("jobs", vec![0], ["cleanup"]).unwrap();
        let record = JobRecord::new("cleanup", json!({}), Priority::NORMAL, 3);
        let target = router.route_job(&record).unwrap();
        broker
            .schedule_delayed(&target, &record.to_message(), Duration::from_millis(20))
            .await
            .unwrap();
        assert_eq!(broker.maintain().await.unwrap().promoted, 0);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(broker.maintain().await.unwrap().promoted, 1);
        assert_eq!(broker.queue_depth(&target.queue).await.unwrap(), 1);
    }
}
