// src/dispatcher.rs
use crate::{
    AppContext, AttemptLimits, Broker, DeadLetterHandler, Delivery, FailureKind, HandlerError,
    JobContext, JobError, JobMessage, JobRecord, JobRegistry, JobService, JobStatus, JobStore,
    PriorityRouter, RelayConfig, RelayError, Result, RetryDecision, RetryPolicy, Subscription,
    store::modify,
};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::{
    sync::{Semaphore, watch},
    task::{JoinHandle, JoinSet},
    time::{Duration, Instant, interval, timeout},
};
use tracing::{Instrument, debug, error, info, instrument, warn};

/// Longest pause between reconnect attempts after consecutive broker errors.
const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(30);
/// Pause before requeueing a delivery whose record could not be written.
const PERSIST_RETRY_DELAY: Duration = Duration::from_millis(500);
/// How long aborted jobs get to record their hand-off.
const HANDOFF_TIMEOUT: Duration = Duration::from_secs(5);

/// Dispatcher configuration
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub dispatcher_id: String,
    pub concurrency: usize,
    /// Types to consume. `None` consumes every registered type.
    pub job_types: Option<Vec<String>>,
    pub exchange: String,
    pub tier_bounds: Vec<u8>,
    pub queue_max_length: Option<u64>,
    pub handler_timeout: Duration,
    pub type_timeouts: BTreeMap<String, Duration>,
    /// Added to the handler timeout to form the lease on a RUNNING record.
    pub lease_grace: Duration,
    pub shutdown_timeout: Duration,
    pub maintenance_interval: Duration,
    pub reconcile_interval: Option<Duration>,
    pub stale_pending_after: Duration,
    pub max_reconnect_attempts: u32,
    pub reconnect_base_delay: Duration,
    pub attempts: AttemptLimits,
    pub retry_policy: RetryPolicy,
    pub handle_signals: bool,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self::from_relay_config(&RelayConfig::default())
    }
}

impl DispatcherConfig {
    pub fn from_relay_config(config: &RelayConfig) -> Self {
        Self {
            dispatcher_id: format!("dispatcher-{}", uuid::Uuid::new_v4()),
            concurrency: config.concurrency,
            job_types: None,
            exchange: config.exchange.clone(),
            tier_bounds: config.tier_bounds.clone(),
            queue_max_length: config.queue_max_length,
            handler_timeout: Duration::from_secs(config.handler_timeout_secs),
            type_timeouts: config
                .types
                .iter()
                .filter_map(|(name, t)| {
                    t.handler_timeout_secs
                        .map(|secs| (name.clone(), Duration::from_secs(secs)))
                })
                .collect(),
            lease_grace: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(config.shutdown_timeout_secs),
            maintenance_interval: Duration::from_millis(config.maintenance_interval_ms),
            reconcile_interval: config.reconcile_interval_secs.map(Duration::from_secs),
            stale_pending_after: Duration::from_secs(config.stale_pending_secs),
            max_reconnect_attempts: config.max_reconnect_attempts,
            reconnect_base_delay: Duration::from_millis(100),
            attempts: AttemptLimits::from_config(config),
            retry_policy: config.retry_policy(),
            handle_signals: true,
        }
    }

    fn timeout_for(&self, job_type: &str) -> Duration {
        self.type_timeouts
            .get(job_type)
            .copied()
            .unwrap_or(self.handler_timeout)
    }
}

/// Dispatcher builder for fluent configuration
pub struct DispatcherBuilder {
    config: DispatcherConfig,
    registry: JobRegistry,
    app_context: Arc<dyn AppContext>,
    router: Option<PriorityRouter>,
}

impl DispatcherBuilder {
    pub fn new(registry: JobRegistry) -> Self {
        Self {
            config: DispatcherConfig::default(),
            registry,
            app_context: Arc::new(()),
            router: None,
        }
    }

    pub fn from_config(config: &RelayConfig, registry: JobRegistry) -> Self {
        Self {
            config: DispatcherConfig::from_relay_config(config),
            ..Self::new(registry)
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.config.dispatcher_id = id.into();
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.config.concurrency = concurrency;
        self
    }

    pub fn with_job_types<I, S>(mut self, job_types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.job_types = Some(job_types.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_app_context(mut self, ctx: Arc<dyn AppContext>) -> Self {
        self.app_context = ctx;
        self
    }

    /// Route with `router` instead of one built from the registered types.
    pub fn with_router(mut self, router: PriorityRouter) -> Self {
        self.router = Some(router);
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.config.retry_policy = policy;
        self
    }

    pub fn with_attempt_limits(mut self, attempts: AttemptLimits) -> Self {
        self.config.attempts = attempts;
        self
    }

    pub fn with_handler_timeout(mut self, timeout: Duration) -> Self {
        self.config.handler_timeout = timeout;
        self
    }

    pub fn with_type_timeout(mut self, job_type: impl Into<String>, timeout: Duration) -> Self {
        self.config.type_timeouts.insert(job_type.into(), timeout);
        self
    }

    pub fn with_lease_grace(mut self, grace: Duration) -> Self {
        self.config.lease_grace = grace;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.config.shutdown_timeout = timeout;
        self
    }

    pub fn with_maintenance_interval(mut self, every: Duration) -> Self {
        self.config.maintenance_interval = every;
        self
    }

    pub fn with_reconcile_interval(mut self, every: Option<Duration>) -> Self {
        self.config.reconcile_interval = every;
        self
    }

    pub fn with_stale_pending_after(mut self, after: Duration) -> Self {
        self.config.stale_pending_after = after;
        self
    }

    pub fn with_reconnect(mut self, max_attempts: u32, base_delay: Duration) -> Self {
        self.config.max_reconnect_attempts = max_attempts;
        self.config.reconnect_base_delay = base_delay;
        self
    }

    /// Whether SIGINT/SIGTERM trigger a graceful shutdown. On by default.
    pub fn with_signal_handling(mut self, enabled: bool) -> Self {
        self.config.handle_signals = enabled;
        self
    }

    /// Check the handler table against the configuration and wire up the
    /// dispatcher. Types named in configuration but lacking a handler are
    /// rejected here rather than discovered at delivery time.
    pub fn build(self, store: Arc<dyn JobStore>, broker: Arc<dyn Broker>) -> Result<Dispatcher> {
        let Self {
            mut config,
            registry,
            app_context,
            router,
        } = self;

        if registry.is_empty() {
            return Err(RelayError::Registry("no job handlers registered".to_string()));
        }
        if config.concurrency == 0 {
            return Err(RelayError::Config("concurrency must be at least 1".to_string()));
        }
        let configured = config
            .attempts
            .per_type
            .keys()
            .chain(config.type_timeouts.keys());
        for name in configured {
            if !registry.contains_job(name) {
                return Err(RelayError::Config(format!(
                    "job type '{name}' is configured but has no handler"
                )));
            }
        }

        let registered = registry.job_names();
        let job_types = match config.job_types.take() {
            Some(types) => {
                if let Some(missing) = types.iter().find(|t| !registry.contains_job(t)) {
                    return Err(RelayError::Config(format!(
                        "job type '{missing}' has no handler"
                    )));
                }
                types
            }
            None => registered.clone(),
        };

        let router = match router {
            Some(router) => router,
            None => PriorityRouter::new(
                config.exchange.clone(),
                config.tier_bounds.clone(),
                registered,
            )?
            .with_max_length(config.queue_max_length),
        };
        let queues = router
            .consume_order(&job_types)?
            .into_iter()
            .map(|t| t.queue)
            .collect();
        config.job_types = Some(job_types);

        let router = Arc::new(router);
        let stats = Arc::new(Counters::default());
        let dead_letter =
            DeadLetterHandler::new(Arc::clone(&store), Arc::clone(&broker), Arc::clone(&router));
        let service = JobService::new(Arc::clone(&store), Arc::clone(&broker), Arc::clone(&router))
            .with_attempt_limits(config.attempts.clone());

        let worker = Arc::new(Worker {
            config: config.clone(),
            store,
            broker,
            router,
            registry: Arc::new(registry),
            app_context,
            dead_letter,
            stats: Arc::clone(&stats),
        });

        let (shutdown_tx, _) = watch::channel(false);
        let (abort_tx, _) = watch::channel(false);

        Ok(Dispatcher {
            semaphore: Arc::new(Semaphore::new(config.concurrency)),
            config,
            worker,
            service,
            queues,
            shutdown_tx: Arc::new(shutdown_tx),
            abort_tx: Arc::new(abort_tx),
            stats,
        })
    }
}

/// Stops a running dispatcher from another task
#[derive(Clone)]
pub struct ShutdownHandle(Arc<watch::Sender<bool>>);

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.0.send_replace(true);
    }
}

/// Consumes deliveries, runs handlers and drives each job's record through
/// its lifecycle.
///
/// Records are always written before the delivery is settled: a crash in
/// between leads to a redelivery and possibly a second execution, never to
/// a lost job. A dispatcher runs once; after `run` returns, build a new one.
pub struct Dispatcher {
    config: DispatcherConfig,
    worker: Arc<Worker>,
    service: JobService,
    queues: Vec<String>,
    semaphore: Arc<Semaphore>,
    shutdown_tx: Arc<watch::Sender<bool>>,
    abort_tx: Arc<watch::Sender<bool>>,
    stats: Arc<Counters>,
}

impl Dispatcher {
    /// Consume until shutdown, or until the broker stays unreachable for
    /// `max_reconnect_attempts` consecutive tries, which is returned as an
    /// error for the supervisor to act on.
    pub async fn run(&self) -> Result<()> {
        info!(
            dispatcher_id = %self.config.dispatcher_id,
            concurrency = self.config.concurrency,
            queues = ?self.queues,
            "Starting dispatcher"
        );

        let Some(mut subscription) = self.subscribe().await? else {
            info!(dispatcher_id = %self.config.dispatcher_id, "Stopped before subscribing");
            return Ok(());
        };

        let mut background = vec![self.spawn_maintenance()];
        if self.config.handle_signals {
            background.push(self.spawn_signal_listener());
        }
        if let Some(every) = self.config.reconcile_interval {
            background.push(self.spawn_reconciler(every));
        }

        let mut tasks = JoinSet::new();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut consecutive_failures = 0u32;
        let mut outcome = Ok(());

        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            // Only claim what we have capacity to run; reap finished tasks meanwhile.
            let permit = tokio::select! {
                permit = Arc::clone(&self.semaphore).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                Some(joined) = tasks.join_next() => {
                    log_join(joined);
                    continue;
                }
                _ = shutdown_rx.changed() => break,
            };

            let next = tokio::select! {
                next = subscription.next_delivery() => next,
                _ = shutdown_rx.changed() => break,
            };

            match next {
                Ok(delivery) => {
                    consecutive_failures = 0;
                    let worker = Arc::clone(&self.worker);
                    let abort = self.abort_tx.subscribe();
                    tasks.spawn(async move {
                        let _permit = permit;
                        worker.process(delivery, abort).await;
                    });
                }
                Err(RelayError::SubscriptionClosed) => break,
                Err(e) => {
                    drop(permit);
                    consecutive_failures += 1;
                    if consecutive_failures > self.config.max_reconnect_attempts {
                        error!(
                            dispatcher_id = %self.config.dispatcher_id,
                            attempts = self.config.max_reconnect_attempts,
                            error = %e,
                            "Broker unreachable, giving up"
                        );
                        outcome = Err(RelayError::Broker(format!(
                            "unreachable after {} reconnect attempts: {e}",
                            self.config.max_reconnect_attempts
                        )));
                        break;
                    }
                    let delay = reconnect_delay(self.config.reconnect_base_delay, consecutive_failures);
                    warn!(
                        error = %e,
                        attempt = consecutive_failures,
                        retry_in_ms = delay.as_millis() as u64,
                        "Broker error, backing off"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shutdown_rx.changed() => break,
                    }
                }
            }
        }

        subscription.cancel();
        self.shutdown_tx.send_replace(true);
        info!(dispatcher_id = %self.config.dispatcher_id, "Dispatcher stopped accepting deliveries");

        self.drain(tasks).await;
        for handle in background {
            handle.abort();
        }
        if let Err(e) = self.worker.broker.close().await {
            warn!(error = %e, "Broker close failed");
        }
        info!(dispatcher_id = %self.config.dispatcher_id, "Dispatcher shutdown complete");
        outcome
    }

    /// Declare the topology and open the subscription, backing off between
    /// failed attempts the same way the delivery loop does. `None` means a
    /// stop was requested first.
    async fn subscribe(&self) -> Result<Option<Box<dyn Subscription>>> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut failures = 0u32;
        loop {
            if *shutdown_rx.borrow() {
                return Ok(None);
            }
            let attempt = async {
                self.service.declare_topology().await?;
                self.worker.broker.consume(self.queues.clone()).await
            };
            let e = match attempt.await {
                Ok(subscription) => return Ok(Some(subscription)),
                Err(e) => e,
            };
            failures += 1;
            if failures > self.config.max_reconnect_attempts {
                error!(
                    dispatcher_id = %self.config.dispatcher_id,
                    attempts = self.config.max_reconnect_attempts,
                    error = %e,
                    "Broker unreachable at startup, giving up"
                );
                return Err(RelayError::Broker(format!(
                    "unreachable after {} reconnect attempts: {e}",
                    self.config.max_reconnect_attempts
                )));
            }
            let delay = reconnect_delay(self.config.reconnect_base_delay, failures);
            warn!(
                error = %e,
                attempt = failures,
                retry_in_ms = delay.as_millis() as u64,
                "Subscribing failed, backing off"
            );
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown_rx.changed() => {}
            }
        }
    }

    /// Wait for in-flight jobs, then hand off whatever is still running.
    async fn drain(&self, mut tasks: JoinSet<()>) {
        if tasks.is_empty() {
            return;
        }
        info!(active = tasks.len(), "Waiting for in-flight jobs to complete");

        if timeout(self.config.shutdown_timeout, join_all(&mut tasks)).await.is_ok() {
            info!("All in-flight jobs completed");
            return;
        }

        warn!(
            remaining = tasks.len(),
            "Shutdown timeout reached, handing remaining jobs back to the queue"
        );
        self.abort_tx.send_replace(true);
        if timeout(HANDOFF_TIMEOUT, join_all(&mut tasks)).await.is_err() {
            error!(remaining = tasks.len(), "Jobs did not hand off in time, aborting them");
            tasks.abort_all();
            join_all(&mut tasks).await;
        }
    }

    /// Request a graceful stop.
    pub fn stop(&self) {
        info!(dispatcher_id = %self.config.dispatcher_id, "Stop requested");
        self.shutdown_tx.send_replace(true);
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle(Arc::clone(&self.shutdown_tx))
    }

    pub fn router(&self) -> &PriorityRouter {
        &self.worker.router
    }

    /// Queues consumed, most preferred first.
    pub fn queues(&self) -> &[String] {
        &self.queues
    }

    pub fn stats(&self) -> DispatcherStats {
        let available = self.semaphore.available_permits();
        DispatcherStats {
            dispatcher_id: self.config.dispatcher_id.clone(),
            concurrency: self.config.concurrency,
            available_permits: available,
            active_jobs: self.config.concurrency.saturating_sub(available),
            queues: self.queues.clone(),
            is_shutting_down: *self.shutdown_tx.borrow(),
            succeeded: self.stats.succeeded.load(Ordering::Relaxed),
            retried: self.stats.retried.load(Ordering::Relaxed),
            dead_lettered: self.stats.dead_lettered.load(Ordering::Relaxed),
        }
    }

    fn spawn_signal_listener(&self) -> JoinHandle<()> {
        let shutdown_tx = Arc::clone(&self.shutdown_tx);
        let dispatcher_id = self.config.dispatcher_id.clone();
        tokio::spawn(async move {
            wait_for_shutdown_signal().await;
            info!(%dispatcher_id, "Shutdown signal received");
            shutdown_tx.send_replace(true);
        })
    }

    fn spawn_maintenance(&self) -> JoinHandle<()> {
        let broker = Arc::clone(&self.worker.broker);
        let every = self.config.maintenance_interval;
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut ticker = interval(every);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown_rx.changed() => break,
                }
                match broker.maintain().await {
                    Ok(report) if report.promoted > 0 || report.reclaimed > 0 => info!(
                        promoted = report.promoted,
                        reclaimed = report.reclaimed,
                        "Broker maintenance moved messages"
                    ),
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "Broker maintenance failed"),
                }
            }
        })
    }

    fn spawn_reconciler(&self, every: Duration) -> JoinHandle<()> {
        let service = self.service.clone();
        let stale_after = self.config.stale_pending_after;
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut ticker = interval(every);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown_rx.changed() => break,
                }
                if let Err(e) = service.reconcile_stale(stale_after).await {
                    warn!(error = %e, "Stale job sweep failed");
                }
            }
        })
    }
}

#[derive(Debug, Clone)]
pub struct DispatcherStats {
    pub dispatcher_id: String,
    pub concurrency: usize,
    pub available_permits: usize,
    pub active_jobs: usize,
    pub queues: Vec<String>,
    pub is_shutting_down: bool,
    pub succeeded: u64,
    pub retried: u64,
    pub dead_lettered: u64,
}

#[derive(Debug, Default)]
struct Counters {
    succeeded: AtomicU64,
    retried: AtomicU64,
    dead_lettered: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// What to do with a delivery, decided against the current record
#[derive(Debug, Clone, PartialEq)]
enum Plan {
    /// Settled or superseded; ack without running.
    Skip(&'static str),
    /// Another runner holds the lease; look again once it expires.
    Defer(Duration),
    /// Record was moved to RUNNING; execute the handler.
    Run,
    Quarantine(JobError),
    /// A retriable failure was recorded but no retry was scheduled.
    Decide(JobError),
}

/// How the delivery is settled once the record is written
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Settle {
    Ack,
    Requeue,
}

enum Outcome {
    Succeeded(Option<serde_json::Value>),
    Failed(HandlerError, FailureKind),
    Interrupted,
}

fn plan_delivery(
    record: &mut JobRecord,
    message: &JobMessage,
    registered: bool,
    lease: chrono::Duration,
    now: DateTime<Utc>,
) -> Result<Plan> {
    match record.status {
        JobStatus::DeadLettered if !record.dead_letter_published => {
            let error = record.last_error.clone().unwrap_or_else(|| {
                JobError::new(FailureKind::Terminal, "dead-lettered", record.attempt_count)
            });
            return Ok(Plan::Quarantine(error));
        }
        JobStatus::Succeeded | JobStatus::DeadLettered => {
            return Ok(Plan::Skip("job already settled"));
        }
        JobStatus::FailedTerminal => {
            let error = record.last_error.clone().unwrap_or_else(|| {
                JobError::new(FailureKind::Terminal, "terminal failure", record.attempt_count)
            });
            return Ok(Plan::Quarantine(error));
        }
        JobStatus::FailedRetryable => {
            let error = record.last_error.clone().unwrap_or_else(|| {
                JobError::new(FailureKind::Retriable, "retriable failure", record.attempt_count)
            });
            return Ok(Plan::Decide(error));
        }
        JobStatus::Running if record.lease_active(now) => {
            let remaining = record
                .lease_until
                .map(|until| (until - now).to_std().unwrap_or_default())
                .unwrap_or_default();
            return Ok(Plan::Defer(remaining));
        }
        JobStatus::Pending
            if message.attempt_count < record.attempt_count
                && record.next_attempt_at.is_some_and(|due| due > now) =>
        {
            return Ok(Plan::Skip("superseded by a scheduled retry"));
        }
        JobStatus::Pending | JobStatus::Running => {}
    }

    if !registered {
        return Ok(Plan::Quarantine(JobError::new(
            FailureKind::Unregistered,
            format!("no handler registered for job type '{}'", record.job_type),
            record.attempt_count,
        )));
    }
    if record.attempts_remaining() == 0 {
        let error = record.last_error.clone().unwrap_or_else(|| {
            JobError::new(
                FailureKind::Interrupted,
                "attempt budget spent",
                record.attempt_count,
            )
        });
        return Ok(Plan::Quarantine(error));
    }

    record.start_attempt(lease, now)?;
    Ok(Plan::Run)
}

/// Everything one delivery needs, shared by all in-flight tasks
struct Worker {
    config: DispatcherConfig,
    store: Arc<dyn JobStore>,
    broker: Arc<dyn Broker>,
    router: Arc<PriorityRouter>,
    registry: Arc<JobRegistry>,
    app_context: Arc<dyn AppContext>,
    dead_letter: DeadLetterHandler,
    stats: Arc<Counters>,
}

impl Worker {
    #[instrument(skip_all, fields(queue = %delivery.queue, tag = delivery.tag, job_id = tracing::field::Empty))]
    async fn process(&self, delivery: Delivery, mut abort: watch::Receiver<bool>) {
        let message = match delivery.message() {
            Ok(message) => message,
            Err(e) => {
                error!(error = %e, "Undecodable message dropped");
                settled(delivery.nack(false).await);
                return;
            }
        };
        tracing::Span::current().record("job_id", tracing::field::display(&message.job_id));

        match self.handle(&message, &mut abort).await {
            Ok(Settle::Ack) => settled(delivery.ack().await),
            Ok(Settle::Requeue) => settled(delivery.nack(true).await),
            Err(e) => {
                error!(error = %e, "Could not record delivery outcome, requeueing");
                tokio::time::sleep(PERSIST_RETRY_DELAY).await;
                settled(delivery.nack(true).await);
            }
        }
    }

    async fn handle(
        &self,
        message: &JobMessage,
        abort: &mut watch::Receiver<bool>,
    ) -> Result<Settle> {
        self.ensure_record(message).await?;

        let now = Utc::now();
        let lease = self.lease_for(&message.job_type);
        let registered = self.registry.contains_job(&message.job_type);
        let (record, plan) = modify(self.store.as_ref(), &message.job_id, |r| {
            plan_delivery(r, message, registered, lease, now)
        })
        .await?;

        match plan {
            Plan::Skip(reason) => {
                debug!(status = %record.status, reason, "Delivery acknowledged without running");
                Ok(Settle::Ack)
            }
            Plan::Defer(wait) => {
                debug!(wait_ms = wait.as_millis() as u64, "Job leased elsewhere, deferring");
                let target = self.router.route_job(&record)?;
                self.broker.schedule_delayed(&target, message, wait).await?;
                Ok(Settle::Ack)
            }
            Plan::Quarantine(error) => {
                self.dead_letter.quarantine(&record, error).await?;
                Counters::bump(&self.stats.dead_lettered);
                Ok(Settle::Ack)
            }
            Plan::Decide(error) => {
                let handler_error = HandlerError::retriable(error.message.clone());
                self.after_retriable_failure(record, &handler_error, error).await
            }
            Plan::Run => self.execute(record, abort).await,
        }
    }

    /// Recreate a record that is missing for a delivered message.
    async fn ensure_record(&self, message: &JobMessage) -> Result<()> {
        if self.store.get(&message.job_id).await?.is_some() {
            return Ok(());
        }
        let max_attempts = self.config.attempts.for_type(&message.job_type);
        let record = JobRecord::from_message(message, max_attempts);
        match self.store.insert(&record).await {
            Ok(()) => {
                warn!(job_type = %record.job_type, "Record missing for delivery, rebuilt from message");
                Ok(())
            }
            // Another consumer got there first.
            Err(RelayError::VersionConflict(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn execute(
        &self,
        record: JobRecord,
        abort: &mut watch::Receiver<bool>,
    ) -> Result<Settle> {
        let handler_timeout = self.config.timeout_for(&record.job_type);
        let ctx = JobContext::new(record.clone(), Arc::clone(&self.app_context));
        let span = ctx.span.clone();
        let started = Instant::now();

        let outcome = async {
            tokio::select! {
                result = timeout(
                    handler_timeout,
                    self.registry.execute_job(&record.job_type, record.payload.clone(), &ctx),
                ) => match result {
                    Ok(Ok(output)) => Outcome::Succeeded(output),
                    Ok(Err(e)) => {
                        let kind = if e.is_terminal() { FailureKind::Terminal } else { FailureKind::Retriable };
                        Outcome::Failed(e, kind)
                    }
                    Err(_) => Outcome::Failed(
                        HandlerError::retriable(format!("handler timed out after {handler_timeout:?}")),
                        FailureKind::Timeout,
                    ),
                },
                _ = aborted(abort) => Outcome::Interrupted,
            }
        }
        .instrument(span)
        .await;

        let elapsed = started.elapsed();
        let attempt = record.attempt_count;
        match outcome {
            Outcome::Succeeded(output) => {
                let now = Utc::now();
                match modify(self.store.as_ref(), &record.id, |r| r.succeed(output.clone(), now))
                    .await
                {
                    Ok(_) => {
                        Counters::bump(&self.stats.succeeded);
                        info!(attempt, elapsed_ms = elapsed.as_millis() as u64, "Job succeeded");
                    }
                    Err(RelayError::InvalidTransition { from, .. }) => {
                        warn!(%from, "Job settled elsewhere while running, keeping that outcome");
                    }
                    Err(e) => return Err(e),
                }
                Ok(Settle::Ack)
            }
            Outcome::Failed(handler_error, kind) => {
                let error = JobError::new(kind, handler_error.message(), attempt);
                warn!(attempt, %error, elapsed_ms = elapsed.as_millis() as u64, "Job failed");
                let now = Utc::now();
                if handler_error.is_terminal() {
                    let (record, _) = modify(self.store.as_ref(), &record.id, |r| {
                        r.fail_terminal(error.clone(), now)
                    })
                    .await?;
                    self.dead_letter.quarantine(&record, error).await?;
                    Counters::bump(&self.stats.dead_lettered);
                    return Ok(Settle::Ack);
                }
                let (record, _) = modify(self.store.as_ref(), &record.id, |r| {
                    r.fail_retryable(error.clone(), now)
                })
                .await?;
                self.after_retriable_failure(record, &handler_error, error).await
            }
            Outcome::Interrupted => {
                let error = JobError::new(
                    FailureKind::Interrupted,
                    "dispatcher shut down during execution",
                    attempt,
                );
                let now = Utc::now();
                modify(self.store.as_ref(), &record.id, |r| r.hand_off(error.clone(), now)).await?;
                info!(attempt, "Job handed back for another dispatcher");
                Ok(Settle::Requeue)
            }
        }
    }

    /// Record is FAILED_RETRYABLE: schedule the next attempt or quarantine.
    async fn after_retriable_failure(
        &self,
        record: JobRecord,
        handler_error: &HandlerError,
        error: JobError,
    ) -> Result<Settle> {
        match self.config.retry_policy.decide(&record, handler_error) {
            RetryDecision::Exhausted => {
                self.dead_letter.quarantine(&record, error).await?;
                Counters::bump(&self.stats.dead_lettered);
                Ok(Settle::Ack)
            }
            RetryDecision::Retry(delay) => {
                // The record stays FAILED_RETRYABLE until the broker holds the
                // delayed message.
                let target = self.router.route_job(&record)?;
                if let Err(e) = self
                    .broker
                    .schedule_delayed(&target, &record.to_message(), delay)
                    .await
                {
                    warn!(error = %e, "Retry not scheduled, requeueing delivery");
                    return Ok(Settle::Requeue);
                }
                let now = Utc::now();
                let due = now + to_chrono(delay);
                let record =
                    match modify(self.store.as_ref(), &record.id, |r| r.schedule_retry(due, now))
                        .await
                    {
                        Ok((record, _)) => record,
                        Err(RelayError::InvalidTransition { from, .. }) => {
                            debug!(%from, "Retry already recorded by another delivery");
                            return Ok(Settle::Ack);
                        }
                        Err(e) => return Err(e),
                    };
                Counters::bump(&self.stats.retried);
                info!(
                    attempt = record.attempt_count,
                    max_attempts = record.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    "Retry scheduled"
                );
                Ok(Settle::Ack)
            }
        }
    }

    fn lease_for(&self, job_type: &str) -> chrono::Duration {
        to_chrono(self.config.timeout_for(job_type) + self.config.lease_grace)
    }
}

fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::days(36_500))
}

fn settled(result: Result<()>) {
    if let Err(e) = result {
        // The broker redelivers unsettled messages; the record decides what happens then.
        warn!(error = %e, "Delivery not settled");
    }
}

fn log_join(joined: std::result::Result<(), tokio::task::JoinError>) {
    if let Err(e) = joined {
        if e.is_panic() {
            error!(error = %e, "Job task panicked");
        }
    }
}

async fn join_all(tasks: &mut JoinSet<()>) {
    while let Some(joined) = tasks.join_next().await {
        log_join(joined);
    }
}

async fn aborted(abort: &mut watch::Receiver<bool>) {
    if abort.wait_for(|aborting| *aborting).await.is_err() {
        std::future::pending::<()>().await;
    }
}

fn reconnect_delay(base: Duration, failures: u32) -> Duration {
    let factor = 1u32.checked_shl(failures.saturating_sub(1)).unwrap_or(u32::MAX);
    base.saturating_mul(factor).min(MAX_RECONNECT_DELAY)
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
            (Ok(mut sigterm), Ok(mut sigint)) => {
                tokio::select! {
                    _ = sigterm.recv() => info!("SIGTERM received"),
                    _ = sigint.recv() => info!("SIGINT received"),
                }
                return;
            }
            (Err(e), _) | (_, Err(e)) => {
                warn!(error = %e, "Unix signal handlers unavailable, listening for CTRL+C only");
            }
        }
    }

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("CTRL+C received"),
        Err(e) => {
            error!(error = %e, "Cannot listen for shutdown signals");
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{MemoryBroker, MemoryJobStore, Priority};
    use serde_json::json;

    fn lease() -> chrono::Duration {
        chrono::Duration::seconds(60)
    }

    fn pending(max_attempts: u32) -> JobRecord {
        JobRecord::new("send_email", json!({}), Priority::NORMAL, max_attempts)
    }

    #[test]
    fn fresh_delivery_starts_an_attempt() {
        let now = Utc::now();
        let mut record = pending(3);
        let message = record.to_message();
        assert_eq!(plan_delivery(&mut record, &message, true, lease(), now).unwrap(), Plan::Run);
        assert_eq!(record.status, JobStatus::Running);
        assert_eq!(record.attempt_count, 1);
    }

    #[test]
    fn settled_jobs_are_skipped() {
        let now = Utc::now();
        let mut record = pending(3);
        let message = record.to_message();
        record.start_attempt(lease(), now).unwrap();
        record.succeed(None, now).unwrap();
        let before = record.clone();
        assert!(matches!(
            plan_delivery(&mut record, &message, true, lease(), now).unwrap(),
            Plan::Skip(_)
        ));
        assert_eq!(record, before);
    }

    #[test]
    fn dead_letter_without_a_confirmed_copy_is_quarantined_again() {
        let now = Utc::now();
        let mut record = pending(1);
        let message = record.to_message();
        record.start_attempt(lease(), now).unwrap();
        let error = JobError::new(FailureKind::Terminal, "bad address", 1);
        record.fail_terminal(error.clone(), now).unwrap();
        record.dead_letter(error.clone(), now).unwrap();

        let plan = plan_delivery(&mut record, &message, true, lease(), now).unwrap();
        assert_eq!(plan, Plan::Quarantine(error));

        record.mark_dead_letter_published(now).unwrap();
        assert!(matches!(
            plan_delivery(&mut record, &message, true, lease(), now).unwrap(),
            Plan::Skip(_)
        ));
    }

    #[test]
    fn live_lease_defers_the_duplicate() {
        let now = Utc::now();
        let mut record = pending(3);
        let message = record.to_message();
        record.start_attempt(lease(), now).unwrap();
        let plan = plan_delivery(&mut record, &message, true, lease(), now).unwrap();
        assert!(matches!(plan, Plan::Defer(wait) if wait > Duration::from_secs(59)));
        assert_eq!(record.attempt_count, 1);
    }

    #[test]
    fn expired_lease_counts_a_new_attempt() {
        let now = Utc::now();
        let mut record = pending(3);
        let message = record.to_message();
        record.start_attempt(lease(), now).unwrap();
        let later = now + chrono::Duration::seconds(61);
        assert_eq!(plan_delivery(&mut record, &message, true, lease(), later).unwrap(), Plan::Run);
        assert_eq!(record.attempt_count, 2);
    }

    #[test]
    fn expired_lease_without_budget_is_quarantined() {
        let now = Utc::now();
        let mut record = pending(1);
        let message = record.to_message();
        record.start_attempt(lease(), now).unwrap();
        let later = now + chrono::Duration::seconds(61);
        let plan = plan_delivery(&mut record, &message, true, lease(), later).unwrap();
        assert!(matches!(plan, Plan::Quarantine(ref e) if e.kind == FailureKind::Interrupted));
        assert_eq!(record.attempt_count, 1);
    }

    #[test]
    fn stale_message_is_superseded_by_scheduled_retry() {
        let now = Utc::now();
        let mut record = pending(3);
        let original = record.to_message();
        record.start_attempt(lease(), now).unwrap();
        record
            .fail_retryable(JobError::new(FailureKind::Retriable, "smtp", 1), now)
            .unwrap();
        record
            .schedule_retry(now + chrono::Duration::seconds(10), now)
            .unwrap();

        assert!(matches!(
            plan_delivery(&mut record, &original, true, lease(), now).unwrap(),
            Plan::Skip(_)
        ));
        let scheduled = record.to_message();
        assert_eq!(plan_delivery(&mut record, &scheduled, true, lease(), now).unwrap(), Plan::Run);
    }

    #[test]
    fn intermediate_failure_states_are_resumed() {
        let now = Utc::now();
        let mut record = pending(3);
        let message = record.to_message();
        record.start_attempt(lease(), now).unwrap();
        record
            .fail_retryable(JobError::new(FailureKind::Retriable, "smtp", 1), now)
            .unwrap();
        assert!(matches!(
            plan_delivery(&mut record, &message, true, lease(), now).unwrap(),
            Plan::Decide(ref e) if e.message == "smtp"
        ));

        let mut record = pending(3);
        record.start_attempt(lease(), now).unwrap();
        record
            .fail_terminal(JobError::new(FailureKind::Terminal, "bad payload", 1), now)
            .unwrap();
        assert!(matches!(
            plan_delivery(&mut record, &message, true, lease(), now).unwrap(),
            Plan::Quarantine(ref e) if e.message == "bad payload"
        ));
    }

    #[test]
    fn unregistered_type_is_quarantined() {
        let now = Utc::now();
        let mut record = pending(3);
        let message = record.to_message();
        let plan = plan_delivery(&mut record, &message, false, lease(), now).unwrap();
        assert!(matches!(plan, Plan::Quarantine(ref e) if e.kind == FailureKind::Unregistered));
        assert_eq!(record.attempt_count, 0);
    }

    #[test]
    fn reconnect_delay_doubles_up_to_cap() {
        let base = Duration::from_millis(100);
        assert_eq!(reconnect_delay(base, 1), Duration::from_millis(100));
        assert_eq!(reconnect_delay(base, 3), Duration::from_millis(400));
        assert_eq!(reconnect_delay(base, 40), MAX_RECONNECT_DELAY);
    }

    fn registry() -> JobRegistry {
        let mut registry = JobRegistry::new();
        registry.register_fn("send_email", |_| async { Ok(None) });
        registry
    }

    fn backends() -> (Arc<dyn JobStore>, Arc<dyn Broker>) {
        (Arc::new(MemoryJobStore::new()), Arc::new(MemoryBroker::new()))
    }

    #[test]
    fn build_requires_handlers() {
        let (store, broker) = backends();
        let err = DispatcherBuilder::new(JobRegistry::new())
            .build(store, broker)
            .err()
            .unwrap();
        assert!(matches!(err, RelayError::Registry(_)));
    }

    #[test]
    fn build_rejects_types_without_handlers() {
        let (store, broker) = backends();
        let err = DispatcherBuilder::new(registry())
            .with_job_types(["send_email", "fax"])
            .build(store.clone(), broker.clone())
            .err()
            .unwrap();
        assert!(matches!(err, RelayError::Config(_)));

        let err = DispatcherBuilder::new(registry())
            .with_type_timeout("cleanup", Duration::from_secs(5))
            .build(store, broker)
            .err()
            .unwrap();
        assert!(matches!(err, RelayError::Config(_)));
    }

    #[test]
    fn consumes_highest_tier_first() {
        let (store, broker) = backends();
        let dispatcher = DispatcherBuilder::new(registry())
            .with_concurrency(2)
            .build(store, broker)
            .unwrap();
        assert_eq!(dispatcher.queues().first().unwrap(), "jobs.send_email.p9");
        assert_eq!(dispatcher.queues().last().unwrap(), "jobs.send_email.p0");

        let stats = dispatcher.stats();
        assert_eq!(stats.concurrency, 2);
        assert_eq!(stats.active_jobs, 0);
        assert!(!stats.is_shutting_down);
        dispatcher.stop();
        assert!(dispatcher.stats().is_shutting_down);
    }
}
