// src/broker/mod.rs
//! Publish / consume / ack primitives over a message broker.
//!
//! Deliveries are handed to exactly one consumer at a time and stay in
//! flight until acked or nacked. A delivery that is never settled (consumer
//! crash, dropped connection) is redelivered, so handlers must tolerate
//! running more than once.

mod memory;
mod redis;

pub use self::memory::MemoryBroker;
pub use self::redis::{RedisBroker, RedisBrokerOptions};

use crate::{JobMessage, Result, RoutingTarget};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

#[async_trait::async_trait]
pub trait Broker: Send + Sync + 'static {
    /// Create the queue behind `target` if needed.
    async fn declare(&self, target: &RoutingTarget) -> Result<()>;

    /// Publish and wait for the broker to confirm. Fails with `Publish`.
    async fn publish(&self, target: &RoutingTarget, message: &JobMessage) -> Result<()>;

    /// Make `message` available on `target` after `delay` without blocking
    /// the caller until then.
    async fn schedule_delayed(
        &self,
        target: &RoutingTarget,
        message: &JobMessage,
        delay: Duration,
    ) -> Result<()>;

    /// Subscribe to `queues`, listed from most to least preferred.
    async fn consume(&self, queues: Vec<String>) -> Result<Box<dyn Subscription>>;

    /// Periodic housekeeping: promote due delayed messages and hand expired
    /// in-flight deliveries back to their queues.
    async fn maintain(&self) -> Result<MaintenanceReport> {
        Ok(MaintenanceReport::default())
    }

    async fn queue_depth(&self, queue: &str) -> Result<u64>;

    async fn health_check(&self) -> bool;

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Lazy, endless sequence of deliveries. Once cancelled it stays closed.
#[async_trait::async_trait]
pub trait Subscription: Send {
    /// Wait for the next delivery. Errors with `SubscriptionClosed` after
    /// `cancel`.
    async fn next_delivery(&mut self) -> Result<Delivery>;

    fn cancel(&mut self);
}

/// Settles deliveries on behalf of a [`Delivery`]
#[async_trait::async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self, queue: &str, tag: u64) -> Result<()>;

    async fn nack(&self, queue: &str, tag: u64, requeue: bool) -> Result<()>;
}

/// One handoff of a message to a consumer
pub struct Delivery {
    pub queue: String,
    pub tag: u64,
    pub payload: Vec<u8>,
    acker: Arc<dyn Acknowledger>,
}

impl Delivery {
    pub fn new(
        queue: impl Into<String>,
        tag: u64,
        payload: Vec<u8>,
        acker: Arc<dyn Acknowledger>,
    ) -> Self {
        Self {
            queue: queue.into(),
            tag,
            payload,
            acker,
        }
    }

    pub fn message(&self) -> Result<JobMessage> {
        JobMessage::decode(&self.payload)
    }

    pub async fn ack(self) -> Result<()> {
        self.acker.ack(&self.queue, self.tag).await
    }

    pub async fn nack(self, requeue: bool) -> Result<()> {
        self.acker.nack(&self.queue, self.tag, requeue).await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("queue", &self.queue)
            .field("tag", &self.tag)
            .field("bytes", &self.payload.len())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub promoted: usize,
    pub reclaimed: usize,
}

/// Attach routing metadata the broker adds to every message it sends.
pub(crate) fn stamp(target: &RoutingTarget, message: &JobMessage) -> JobMessage {
    message
        .clone()
        .with_header("exchange", target.exchange.clone())
        .with_header("routing_key", target.routing_key.clone())
        .with_header("tier", target.tier.clone())
}
