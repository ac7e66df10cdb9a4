// Action Scheduler Engine
// This contains the scheduling machinery and its adapters to the outside world

//! # Scheduler Engine Module
//!
//! The engine is the layer between the domain models and the external world:
//! the state store, the batch service, the message bus and the host fleet.
//!
//! ## Architecture Overview
//!
//! - **Domain Models**: plain records (in `models/`)
//! - **Engine Layer**: scheduling logic and collaborator contracts (this module)
//! - **Server Layer**: the completion callback endpoint (in `server/`)
//!
//! Collaborators are traits (`StateStore`, `BatchExecutor`, `TriggerBroker`,
//! `CapacityManager`) with an in-memory implementation each, so the whole
//! engine runs inside a unit test.
//!
//! ## Rust Learning Notes:
//!
//! ### Re-exports for API Design
//! The `pub use` statements flatten the module hierarchy so callers can write
//! `engine::SchedulerLoop` instead of `engine::scheduler::SchedulerLoop`.

/// State store abstraction
///
/// Contains:
/// - StateStore trait with compare-and-swap update semantics
/// - In-memory implementation for development/testing
/// - `transition_action` helper for conditional state changes
pub mod storage;

/// PostgreSQL state store
pub mod postgres_storage;

/// Batch executor contract
///
/// Contains:
/// - BatchExecutor trait (submit, describe, cancel)
/// - In-memory fake with failure injection
/// - HTTP client for a batch gateway
pub mod batch;

/// DAG grouping and dependent job submission
pub mod dag;

/// Static registry mapping engine names to job definitions
pub mod engines;

/// Cluster-wide named mutex
pub mod mutex;

/// Trigger/message proxy
///
/// Contains:
/// - TriggerBroker trait
/// - NATS and in-process broadcast brokers
/// - TriggerProxy convenience API
pub mod triggers;

/// Execution host inventory used by scale-down
pub mod capacity;

/// The scheduling control loop
pub mod scheduler;

/// Completion callbacks pushed by running jobs
pub mod completion;

/// Workflow launching and trigger handling
pub mod launcher;

pub use batch::{BatchExecutor, HttpBatchExecutor, InMemoryBatchExecutor};
pub use capacity::{CapacityManager, ExecutionHost, InMemoryCapacityManager};
pub use completion::{ActionStatusUpdate, CompletionHandler};
pub use dag::{DagBuilder, WorkflowAttributes};
pub use engines::{EngineHandler, EngineRegistry};
pub use launcher::{TriggerListener, WorkflowLauncher};
pub use mutex::MutexService;
pub use postgres_storage::PostgresStateStore;
pub use scheduler::{SchedulerLoop, TickCounter};
pub use storage::{ActionFilter, InMemoryStateStore, StateStore};
pub use triggers::{ChannelTriggerBroker, NatsTriggerBroker, TriggerBroker, TriggerProxy};
