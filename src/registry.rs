// src/registry.rs
use crate::{HandlerError, HandlerResult, Job, JobContext};
use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;
use tracing::warn;

/// Common capability every registered job type exposes
#[async_trait::async_trait]
pub trait JobHandler: Send + Sync + 'static {
    async fn execute(&self, payload: serde_json::Value, ctx: &JobContext) -> HandlerResult;
}

/// Registration table mapping a type tag to its handler
#[derive(Clone, Default)]
pub struct JobRegistry {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a typed job
    pub fn register<T: Job>(&mut self) -> &mut Self {
        self.register_handler(T::name(), TypedJobExecutor::<T>::new())
    }

    pub fn register_handler(
        &mut self,
        name: impl Into<String>,
        handler: impl JobHandler,
    ) -> &mut Self {
        let name = name.into();
        if self.handlers.insert(name.clone(), Arc::new(handler)).is_some() {
            warn!(job_type = %name, "Replacing previously registered handler");
        }
        self
    }

    /// Register an async closure over the raw payload
    pub fn register_fn<F, Fut>(&mut self, name: impl Into<String>, f: F) -> &mut Self
    where
        F: Fn(serde_json::Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.register_handler(
            name,
            FnHandler {
                f: Arc::new(move |payload| Box::pin(f(payload)) as BoxedHandlerFuture),
            },
        )
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(name).cloned()
    }

    /// Execute a job by type with its payload
    pub async fn execute_job(
        &self,
        name: &str,
        payload: serde_json::Value,
        ctx: &JobContext,
    ) -> HandlerResult {
        let handler = self.get(name).ok_or_else(|| {
            HandlerError::terminal(format!("job type '{name}' not registered"))
        })?;
        handler.execute(payload, ctx).await
    }

    /// Registered type tags, sorted
    pub fn job_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn contains_job(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

struct TypedJobExecutor<T: Job> {
    _phantom: PhantomData<fn() -> T>,
}

impl<T: Job> TypedJobExecutor<T> {
    fn new() -> Self {
        Self {
            _phantom: PhantomData,
        }
    }
}

#[async_trait::async_trait]
impl<T: Job> JobHandler for TypedJobExecutor<T> {
    async fn execute(&self, payload: serde_json::Value, ctx: &JobContext) -> HandlerResult {
        // A payload that does not decode will never decode.
        let job: T = serde_json::from_value(payload)
            .map_err(|e| HandlerError::terminal(format!("malformed payload: {e}")))?;
        job.perform(ctx).await
    }
}

type BoxedHandlerFuture = Pin<Box<dyn Future<Output = HandlerResult> + Send>>;

struct FnHandler {
    f: Arc<dyn Fn(serde_json::Value) -> BoxedHandlerFuture + Send + Sync>,
}

#[async_trait::async_trait]
impl JobHandler for FnHandler {
    async fn execute(&self, payload: serde_json::Value, _ctx: &JobContext) -> HandlerResult {
        (self.f)(payload).await
    }
}
