// src/broker/memory.rs
use super::{Acknowledger, Broker, Delivery, Subscription, stamp};
use crate::{JobMessage, RelayError, Result, RoutingTarget};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::debug;

/// In-process broker with the same delivery semantics as the Redis one.
///
/// Besides tests, it is handy for running producers and dispatchers inside
/// one process. `set_available` and `drop_connection` simulate outages.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    state: Mutex<State>,
    notify: Notify,
    delayed: AtomicUsize,
}

#[derive(Default)]
struct State {
    queues: HashMap<String, VecDeque<Vec<u8>>>,
    max_lengths: HashMap<String, u64>,
    in_flight: HashMap<u64, (String, Vec<u8>)>,
    next_tag: u64,
    unavailable: bool,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        // State stays consistent even if a holder panicked mid-test.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn push(&self, queue: &str, body: Vec<u8>) -> Result<()> {
        {
            let mut state = self.lock();
            if state.unavailable {
                return Err(RelayError::publish(None, "broker unavailable"));
            }
            let limit = state.max_lengths.get(queue).copied();
            let entries = state.queues.entry(queue.to_string()).or_default();
            if limit.is_some_and(|max| entries.len() as u64 >= max) {
                return Err(RelayError::publish(None, format!("queue '{queue}' is full")));
            }
            entries.push_back(body);
        }
        self.notify.notify_waiters();
        Ok(())
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every operation fail (or succeed again) as if the connection dropped.
    pub fn set_available(&self, available: bool) {
        self.inner.lock().unavailable = !available;
        self.inner.notify.notify_waiters();
    }

    /// Return every unsettled delivery to the head of its queue, as a broker
    /// does when a consumer connection goes away.
    pub fn drop_connection(&self) -> usize {
        let returned = {
            let mut state = self.inner.lock();
            let mut in_flight: Vec<_> = state.in_flight.drain().collect();
            in_flight.sort_by_key(|(tag, _)| std::cmp::Reverse(*tag));
            let returned = in_flight.len();
            for (_, (queue, body)) in in_flight {
                state.queues.entry(queue).or_default().push_front(body);
            }
            returned
        };
        self.inner.notify.notify_waiters();
        returned
    }

    pub fn in_flight(&self) -> usize {
        self.inner.lock().in_flight.len()
    }

    pub fn delayed(&self) -> usize {
        self.inner.delayed.load(Ordering::SeqCst)
    }

    /// Messages currently waiting on `queue`, oldest first.
    pub fn messages(&self, queue: &str) -> Vec<JobMessage> {
        self.inner
            .lock()
            .queues
            .get(queue)
            .map(|q| q.iter().filter_map(|b| JobMessage::decode(b).ok()).collect())
            .unwrap_or_default()
    }
}

#[async_trait::async_trait]
impl Broker for MemoryBroker {
    async fn declare(&self, target: &RoutingTarget) -> Result<()> {
        let mut state = self.inner.lock();
        state.queues.entry(target.queue.clone()).or_default();
        if let Some(max) = target.properties.max_length {
            state.max_lengths.insert(target.queue.clone(), max);
        }
        Ok(())
    }

    async fn publish(&self, target: &RoutingTarget, message: &JobMessage) -> Result<()> {
        let body = stamp(target, message).encode()?;
        self.inner.push(&target.queue, body).map_err(|e| match e {
            RelayError::Publish { reason, .. } => {
                RelayError::publish(Some(message.job_id.clone()), reason)
            }
            other => other,
        })
    }

    async fn schedule_delayed(
        &self,
        target: &RoutingTarget,
        message: &JobMessage,
        delay: Duration,
    ) -> Result<()> {
        if self.inner.lock().unavailable {
            return Err(RelayError::publish(
                Some(message.job_id.clone()),
                "broker unavailable",
            ));
        }
        let body = stamp(target, message).encode()?;
        let queue = target.queue.clone();
        let inner = Arc::clone(&self.inner);
        inner.delayed.fetch_add(1, Ordering::SeqCst);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(e) = inner.push(&queue, body) {
                debug!(%queue, error = %e, "Dropping delayed message");
            }
            inner.delayed.fetch_sub(1, Ordering::SeqCst);
        });
        Ok(())
    }

    async fn consume(&self, queues: Vec<String>) -> Result<Box<dyn Subscription>> {
        Ok(Box::new(MemorySubscription {
            inner: Arc::clone(&self.inner),
            queues,
            cancelled: false,
        }))
    }

    async fn queue_depth(&self, queue: &str) -> Result<u64> {
        Ok(self.inner.lock().queues.get(queue).map_or(0, |q| q.len() as u64))
    }

    async fn health_check(&self) -> bool {
        !self.inner.lock().unavailable
    }
}

#[async_trait::async_trait]
impl Acknowledger for Inner {
    async fn ack(&self, _queue: &str, tag: u64) -> Result<()> {
        let mut state = self.lock();
        if state.unavailable {
            return Err(RelayError::Broker("connection lost".to_string()));
        }
        state
            .in_flight
            .remove(&tag)
            .map(|_| ())
            .ok_or_else(|| RelayError::Broker(format!("delivery {tag} is no longer in flight")))
    }

    async fn nack(&self, _queue: &str, tag: u64, requeue: bool) -> Result<()> {
        {
            let mut state = self.lock();
            if state.unavailable {
                return Err(RelayError::Broker("connection lost".to_string()));
            }
            let (queue, body) = state.in_flight.remove(&tag).ok_or_else(|| {
                RelayError::Broker(format!("delivery {tag} is no longer in flight"))
            })?;
            if requeue {
                state.queues.entry(queue).or_default().push_front(body);
            }
        }
        self.notify.notify_waiters();
        Ok(())
    }
}

struct MemorySubscription {
    inner: Arc<Inner>,
    queues: Vec<String>,
    cancelled: bool,
}

impl MemorySubscription {
    fn try_claim(&self) -> Result<Option<Delivery>> {
        let mut state = self.inner.lock();
        if state.unavailable {
            return Err(RelayError::Broker("connection lost".to_string()));
        }
        for queue in &self.queues {
            let Some(body) = state.queues.get_mut(queue).and_then(VecDeque::pop_front) else {
                continue;
            };
            state.next_tag += 1;
            let tag = state.next_tag;
            state.in_flight.insert(tag, (queue.clone(), body.clone()));
            let acker: Arc<dyn Acknowledger> = self.inner.clone();
            return Ok(Some(Delivery::new(queue.clone(), tag, body, acker)));
        }
        Ok(None)
    }
}

#[async_trait::async_trait]
impl Subscription for MemorySubscription {
    async fn next_delivery(&mut self) -> Result<Delivery> {
        loop {
            if self.cancelled {
                return Err(RelayError::SubscriptionClosed);
            }
            // Register before checking so a publish in between is not missed.
            let notified = self.inner.notify.notified();
            if let Some(delivery) = self.try_claim()? {
                return Ok(delivery);
            }
            notified.await;
        }
    }

    fn cancel(&mut self) {
        self.cancelled = true;
    }
}
