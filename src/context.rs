// src/context.rs
use crate::{JobId, JobRecord};
use std::sync::Arc;
use tracing::Span;

/// Application context containing shared resources handlers need
pub trait AppContext: AsAny + Send + Sync + 'static {
    /// Clone the context for use in another task
    fn clone_context(&self) -> Arc<dyn AppContext>;
}

impl AppContext for () {
    fn clone_context(&self) -> Arc<dyn AppContext> {
        Arc::new(())
    }
}

/// Context provided to a handler for one attempt
pub struct JobContext {
    pub job_id: JobId,
    pub job_type: String,
    /// 1-based number of the attempt being executed.
    pub attempt: u32,
    pub max_attempts: u32,
    pub record: JobRecord,
    pub app_context: Arc<dyn AppContext>,
    pub span: Span,
}

impl JobContext {
    pub fn new(record: JobRecord, app_context: Arc<dyn AppContext>) -> Self {
        let span = tracing::info_span!(
            "job_execution",
            job_id = %record.id,
            job_type = %record.job_type,
            attempt = record.attempt_count,
            priority = record.priority.value(),
        );

        Self {
            job_id: record.id.clone(),
            job_type: record.job_type.clone(),
            attempt: record.attempt_count,
            max_attempts: record.max_attempts,
            record,
            app_context,
            span,
        }
    }

    /// Whether a failure now would exhaust the retry budget.
    pub fn is_last_attempt(&self) -> bool {
        self.attempt >= self.max_attempts
    }

    /// Get typed app context
    pub fn app<T: AppContext>(&self) -> Option<&T> {
        self.app_context.as_ref().as_any().downcast_ref::<T>()
    }
}

// Helper trait for downcasting
pub trait AsAny {
    fn as_any(&self) -> &dyn std::any::Any;
}

impl<T: AppContext> AsAny for T {
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}
