// src/lib.rs
//! taskrelay: priority-aware background job dispatch for Rust
//!
//! Producers submit jobs through [`JobService`], which writes a durable
//! [`JobRecord`] and publishes a message routed by priority tier.
//! [`Dispatcher`]s consume those messages, run the registered handler, and
//! record every outcome before settling the delivery. Failed jobs are
//! retried with exponential backoff and quarantined on a dead-letter queue
//! once their budget is spent.

pub mod backoff;
pub mod broker;
pub mod config;
pub mod context;
pub mod dead_letter;
pub mod dispatcher;
pub mod error;
pub mod job;
pub mod lifecycle;
pub mod lua;
pub mod registry;
pub mod router;
pub mod service;
pub mod store;
pub mod telemetry;

pub use backoff::{BackoffStrategy, RetryDecision, RetryPolicy};
pub use broker::{
    Acknowledger, Broker, Delivery, MaintenanceReport, MemoryBroker, RedisBroker,
    RedisBrokerOptions, Subscription,
};
pub use config::{RelayConfig, TypeConfig};
pub use context::{AppContext, JobContext};
pub use dead_letter::DeadLetterHandler;
pub use dispatcher::{Dispatcher, DispatcherBuilder, DispatcherConfig, DispatcherStats, ShutdownHandle};
pub use error::{HandlerError, HandlerResult, RelayError, Result};
pub use job::{FailureKind, Job, JobError, JobId, JobMessage, JobRecord, JobStatus, Priority};
pub use lifecycle::{Applied, can_transition};
pub use registry::{JobHandler, JobRegistry};
pub use router::{PriorityRouter, QueueProperties, RoutingTarget};
pub use service::{AttemptLimits, JobService};
pub use store::{JobFilter, JobPage, JobStatistics, JobStore, MemoryJobStore, RedisJobStore, SortOrder};

// Re-export commonly used types
pub use async_trait::async_trait;
pub use serde::{Deserialize, Serialize};
