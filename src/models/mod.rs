// Core domain models for the action scheduler

//! # Domain Models Module
//!
//! Plain data records shared by every component. Nothing in here talks to a
//! database, the batch service or the message bus; those live in
//! [`engine`](crate::engine).
//!
//! Records that are updated concurrently (`Action`, `Workflow`,
//! `WorkflowInstance`, `Datastore`) carry a `version` stamp used by the
//! state store's compare-and-swap updates.

// Action, its state machine and the forward-only status ordering
pub mod action;

// Workflow templates and workflow instances
pub mod workflow;

// Datastores and their concurrency limit
pub mod datastore;

// Named mutex rows
pub mod mutex;

// Trigger message envelopes
pub mod trigger;

// Batch executor wire types
pub mod batch;

pub use action::{should_update, Action, ActionState, OnFailure};
pub use batch::{
    BatchJobStatus, EnvVar, JobDefinition, JobDefinitionStatus, JobDescription, JobSubmission,
};
pub use datastore::{Datastore, DatastoreState};
pub use mutex::{MutexRecord, MutexState, Mutexes};
pub use trigger::{TriggerMessage, TriggerType};
pub use workflow::{Workflow, WorkflowInstance, WorkflowInstanceState, WorkflowState};
