// Action Scheduler
// Sequences workflow actions onto an external batch service

//! # Action Scheduler Library
//!
//! This is the library root. It wires together the pieces that turn workflow
//! actions into batch jobs and keeps them moving:
//!
//! ## Core Components
//!
//! ### Domain Models
//! - [`Action`]: one schedulable unit of work and its state machine
//! - [`Workflow`] / [`WorkflowInstance`]: a template of ordered actions / one run of it
//! - [`Datastore`]: the resource actions execute against, source of the concurrency limit
//!
//! ### Engine
//! - [`DagBuilder`]: groups actions into parallel stages and submits dependent jobs
//! - [`SchedulerLoop`]: promotes queued actions, reconciles stale ones, scales down hosts
//! - [`MutexService`]: cluster-wide named lock for exclusive sections
//! - [`TriggerProxy`]: fire-and-forget notifications to listener processes
//! - [`CompletionHandler`]: applies status callbacks pushed by running jobs
//!
//! ### Storage Layer
//! [`StateStore`] abstracts persistence. Every write is a compare-and-swap on
//! the record's `version`, so several scheduler processes can share one
//! database without stepping on each other.
//!
//! ## Rust Learning Notes:
//!
//! ### Trait Objects at the Seams
//! The state store, batch executor, trigger broker and capacity manager are
//! all `Arc<dyn Trait>` handles passed into constructors. Production code
//! plugs in PostgreSQL, HTTP and NATS; tests plug in the in-memory versions.

pub mod config;
pub mod engine;
pub mod models;
pub mod server;

pub use models::{
    should_update, Action, ActionState, Datastore, DatastoreState, MutexState, Mutexes,
    OnFailure, TriggerMessage, TriggerType, Workflow, WorkflowInstance, WorkflowInstanceState,
    WorkflowState,
};

pub use engine::{
    batch::{BatchExecutor, HttpBatchExecutor, InMemoryBatchExecutor},
    capacity::{CapacityManager, ExecutionHost, InMemoryCapacityManager},
    completion::{ActionStatusUpdate, CompletionHandler},
    dag::{DagBuilder, WorkflowAttributes},
    engines::{EngineHandler, EngineRegistry},
    launcher::{TriggerListener, WorkflowLauncher},
    mutex::MutexService,
    postgres_storage::PostgresStateStore,
    scheduler::{SchedulerLoop, TickCounter},
    storage::{InMemoryStateStore, StateStore},
    triggers::{ChannelTriggerBroker, NatsTriggerBroker, TriggerBroker, TriggerProxy},
};

pub use config::SchedulerConfig;
pub use server::CallbackServerBuilder;

use thiserror::Error;

/// Errors raised by scheduler operations
///
/// Only some of these are failures in the usual sense. A
/// [`SchedulerError::ConditionalUpdateFailed`] means another scheduler got to
/// the record first; callers match on it and move on without logging an
/// error.
#[derive(Error, Debug)]
pub enum SchedulerError {
    /// Malformed DAG input, rejected before anything is submitted
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Optimistic version check lost against a concurrent writer
    #[error("Conditional update failed for {entity} {id}")]
    ConditionalUpdateFailed { entity: &'static str, id: String },

    /// The batch executor refused or failed a job submission
    #[error("Failed to submit job {job_name}: {message}")]
    JobSubmission { job_name: String, message: String },

    /// No active job definition revision matches an engine
    #[error("No matching job definition: {0}")]
    NoJobDefinition(String),

    /// Engine name missing from the static registry
    #[error("Unknown engine: {0}")]
    UnknownEngine(String),

    /// Batch executor, capacity provider or message broker unavailable
    #[error("External service error: {0}")]
    ExternalService(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Storage-related errors that don't come from sqlx directly
    #[error("Storage error: {0}")]
    Storage(#[from] anyhow::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] ::config::ConfigError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl SchedulerError {
    pub fn conditional(entity: &'static str, id: impl Into<String>) -> Self {
        SchedulerError::ConditionalUpdateFailed {
            entity,
            id: id.into(),
        }
    }

    /// True when a concurrent writer won the race for this record
    pub fn is_conditional_update_failure(&self) -> bool {
        matches!(self, SchedulerError::ConditionalUpdateFailed { .. })
    }
}

impl From<std::io::Error> for SchedulerError {
    fn from(err: std::io::Error) -> Self {
        SchedulerError::Internal(err.to_string())
    }
}

/// Type alias for Results that use our custom error type
pub type Result<T> = std::result::Result<T, SchedulerError>;
