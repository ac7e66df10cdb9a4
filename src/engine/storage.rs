// Storage abstraction for the scheduler
// This defines the interface for persisting actions, workflows and mutexes

//! # State Store Abstraction
//!
//! Every scheduler process, callback server and CLI shares one state store.
//! The store is the only shared mutable resource in the system, so every
//! write goes through a compare-and-swap on the record's `version`:
//!
//! ```text
//! UPDATE action SET ..., version = version + 1 WHERE id = $1 AND version = $2
//! ```
//!
//! Zero affected rows surfaces as
//! [`SchedulerError::ConditionalUpdateFailed`]; exactly one concurrent writer
//! wins and the rest back off.
//!
//! ## Implementations
//!
//! - [`InMemoryStateStore`]: single-process store for development and tests
//! - [`PostgresStateStore`](super::postgres_storage::PostgresStateStore):
//!   the production store
//!
//! ## Rust Learning Notes:
//!
//! ### Async Traits
//! The `async-trait` crate turns `async fn` in traits into boxed futures so
//! the store can be used as `Arc<dyn StateStore>`.
//!
//! ### Interior Mutability
//! The in-memory store mutates its maps through `RwLock`s even though every
//! method takes `&self`. The check-then-write of a conditional update happens
//! under a single write guard, which is what makes it atomic.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::debug;

use crate::models::{
    Action, ActionState, Datastore, MutexRecord, MutexState, Workflow, WorkflowInstance,
};
use crate::{Result, SchedulerError};

/// Filter for [`StateStore::find_actions`]. Empty fields match everything.
#[derive(Debug, Clone, Default)]
pub struct ActionFilter {
    pub states: Vec<ActionState>,
    pub datastore_id: Option<String>,
    pub workflow_id: Option<String>,
    pub workflow_instance_id: Option<String>,
}

impl ActionFilter {
    pub fn with_states(states: &[ActionState]) -> Self {
        Self {
            states: states.to_vec(),
            ..Default::default()
        }
    }

    pub fn for_instance(workflow_instance_id: &str) -> Self {
        Self {
            workflow_instance_id: Some(workflow_instance_id.to_string()),
            ..Default::default()
        }
    }

    /// Template actions of a workflow
    pub fn templates_of(workflow_id: &str) -> Self {
        Self {
            states: vec![ActionState::HasNeverRun],
            workflow_id: Some(workflow_id.to_string()),
            workflow_instance_id: None,
            datastore_id: None,
        }
    }

    pub fn matches(&self, action: &Action) -> bool {
        (self.states.is_empty() || self.states.contains(&action.state))
            && self
                .datastore_id
                .as_ref()
                .map_or(true, |id| &action.datastore_id == id)
            && self
                .workflow_id
                .as_ref()
                .map_or(true, |id| action.workflow_id.as_ref() == Some(id))
            && self
                .workflow_instance_id
                .as_ref()
                .map_or(true, |id| action.workflow_instance_id.as_ref() == Some(id))
    }
}

/// Persistence interface for all scheduler state
///
/// `update_*` methods treat the `version` of the record they are given as the
/// expected persisted version, write the record with `version + 1`, and
/// return the stored copy.
#[async_trait::async_trait]
pub trait StateStore: Send + Sync {
    async fn create_action(&self, action: Action) -> Result<Action>;

    async fn get_action(&self, id: &str) -> Result<Option<Action>>;

    /// Actions matching the filter, ordered by `order_idx`
    async fn find_actions(&self, filter: &ActionFilter) -> Result<Vec<Action>>;

    /// Number of actions on a datastore currently in one of `states`
    async fn count_actions(&self, datastore_id: &str, states: &[ActionState]) -> Result<u64>;

    /// Pending actions not touched since `older_than`
    async fn find_stale_pending_actions(&self, older_than: DateTime<Utc>) -> Result<Vec<Action>>;

    async fn update_action(&self, action: &Action) -> Result<Action>;

    async fn create_workflow(&self, workflow: Workflow) -> Result<Workflow>;

    async fn get_workflow(&self, id: &str) -> Result<Option<Workflow>>;

    async fn update_workflow(&self, workflow: &Workflow) -> Result<Workflow>;

    async fn create_workflow_instance(&self, instance: WorkflowInstance) -> Result<WorkflowInstance>;

    async fn get_workflow_instance(&self, id: &str) -> Result<Option<WorkflowInstance>>;

    async fn update_workflow_instance(&self, instance: &WorkflowInstance) -> Result<WorkflowInstance>;

    async fn create_datastore(&self, datastore: Datastore) -> Result<Datastore>;

    async fn get_datastore(&self, id: &str) -> Result<Option<Datastore>>;

    async fn update_datastore(&self, datastore: &Datastore) -> Result<Datastore>;

    /// Conditional READY -> LOCKED. A missing row is created READY first.
    /// Returns `false` when the mutex is already held.
    async fn try_lock_mutex(&self, name: &str) -> Result<bool>;

    /// Unconditionally reset a mutex to READY
    async fn unlock_mutex(&self, name: &str) -> Result<()>;

    async fn get_mutex(&self, name: &str) -> Result<Option<MutexRecord>>;
}

/// Move an action from `expected` to `new_state` if nobody else moved it first.
///
/// Fails with [`SchedulerError::ConditionalUpdateFailed`] both when our copy
/// is already in a different state and when the persisted version changed
/// underneath us.
pub async fn transition_action(
    store: &dyn StateStore,
    action: &Action,
    expected: ActionState,
    new_state: ActionState,
    error_message: Option<String>,
) -> Result<Action> {
    if action.state != expected {
        return Err(SchedulerError::conditional("action", &action.id));
    }
    let mut updated = action.clone();
    updated.apply_state(new_state, error_message);
    store.update_action(&updated).await
}

const MAX_CAS_ATTEMPTS: usize = 3;

/// Re-run `attempt` while it loses version races
pub(crate) async fn retry_conditional<T, F, Fut>(mut attempt: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut tries = 1;
    loop {
        match attempt().await {
            Err(e) if e.is_conditional_update_failure() && tries < MAX_CAS_ATTEMPTS => {
                debug!(tries, "Lost a version race, re-reading: {}", e);
                tries += 1;
            }
            other => return other,
        }
    }
}

/// In-memory state store for development and testing
///
/// Not persistent and not shared across processes, but it honours the same
/// conditional-update contract as the database store so the scheduler's
/// race handling can be exercised in unit tests.
#[derive(Default)]
pub struct InMemoryStateStore {
    actions: RwLock<HashMap<String, Action>>,
    workflows: RwLock<HashMap<String, Workflow>>,
    instances: RwLock<HashMap<String, WorkflowInstance>>,
    datastores: RwLock<HashMap<String, Datastore>>,
    mutexes: RwLock<HashMap<String, MutexRecord>>,
}

fn read<T>(lock: &RwLock<T>) -> Result<RwLockReadGuard<'_, T>> {
    lock.read()
        .map_err(|_| SchedulerError::Internal("state store lock poisoned".to_string()))
}

fn write<T>(lock: &RwLock<T>) -> Result<RwLockWriteGuard<'_, T>> {
    lock.write()
        .map_err(|_| SchedulerError::Internal("state store lock poisoned".to_string()))
}

/// Compare-and-swap a versioned record inside a locked map
fn swap_versioned<T: Clone>(
    map: &mut HashMap<String, T>,
    entity: &'static str,
    id: &str,
    record: &T,
    version_of: impl Fn(&T) -> i64,
    bump: impl FnOnce(&mut T),
) -> Result<T> {
    let current = map
        .get(id)
        .ok_or_else(|| SchedulerError::NotFound(format!("{} {}", entity, id)))?;
    if version_of(current) != version_of(record) {
        return Err(SchedulerError::conditional(entity, id));
    }
    let mut stored = record.clone();
    bump(&mut stored);
    map.insert(id.to_string(), stored.clone());
    Ok(stored)
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl StateStore for InMemoryStateStore {
    async fn create_action(&self, action: Action) -> Result<Action> {
        let mut actions = write(&self.actions)?;
        actions.insert(action.id.clone(), action.clone());
        Ok(action)
    }

    async fn get_action(&self, id: &str) -> Result<Option<Action>> {
        Ok(read(&self.actions)?.get(id).cloned())
    }

    async fn find_actions(&self, filter: &ActionFilter) -> Result<Vec<Action>> {
        let actions = read(&self.actions)?;
        let mut found: Vec<Action> = actions
            .values()
            .filter(|action| filter.matches(action))
            .cloned()
            .collect();
        found.sort_by(|a, b| a.order_idx.cmp(&b.order_idx).then(a.id.cmp(&b.id)));
        Ok(found)
    }

    async fn count_actions(&self, datastore_id: &str, states: &[ActionState]) -> Result<u64> {
        let actions = read(&self.actions)?;
        let count = actions
            .values()
            .filter(|a| a.datastore_id == datastore_id && states.contains(&a.state))
            .count();
        Ok(count as u64)
    }

    async fn find_stale_pending_actions(&self, older_than: DateTime<Utc>) -> Result<Vec<Action>> {
        let actions = read(&self.actions)?;
        Ok(actions
            .values()
            .filter(|a| a.state == ActionState::Pending && a.updated_at < older_than)
            .cloned()
            .collect())
    }

    async fn update_action(&self, action: &Action) -> Result<Action> {
        let mut actions = write(&self.actions)?;
        swap_versioned(&mut actions, "action", &action.id, action, |a| a.version, |a| {
            a.version += 1
        })
    }

    async fn create_workflow(&self, workflow: Workflow) -> Result<Workflow> {
        write(&self.workflows)?.insert(workflow.id.clone(), workflow.clone());
        Ok(workflow)
    }

    async fn get_workflow(&self, id: &str) -> Result<Option<Workflow>> {
        Ok(read(&self.workflows)?.get(id).cloned())
    }

    async fn update_workflow(&self, workflow: &Workflow) -> Result<Workflow> {
        let mut workflows = write(&self.workflows)?;
        swap_versioned(&mut workflows, "workflow", &workflow.id, workflow, |w| w.version, |w| {
            w.version += 1;
            w.updated_at = Utc::now();
        })
    }

    async fn create_workflow_instance(&self, instance: WorkflowInstance) -> Result<WorkflowInstance> {
        write(&self.instances)?.insert(instance.id.clone(), instance.clone());
        Ok(instance)
    }

    async fn get_workflow_instance(&self, id: &str) -> Result<Option<WorkflowInstance>> {
        Ok(read(&self.instances)?.get(id).cloned())
    }

    async fn update_workflow_instance(&self, instance: &WorkflowInstance) -> Result<WorkflowInstance> {
        let mut instances = write(&self.instances)?;
        swap_versioned(
            &mut instances,
            "workflow_instance",
            &instance.id,
            instance,
            |i| i.version,
            |i| {
                i.version += 1;
                i.updated_at = Utc::now();
            },
        )
    }

    async fn create_datastore(&self, datastore: Datastore) -> Result<Datastore> {
        write(&self.datastores)?.insert(datastore.id.clone(), datastore.clone());
        Ok(datastore)
    }

    async fn get_datastore(&self, id: &str) -> Result<Option<Datastore>> {
        Ok(read(&self.datastores)?.get(id).cloned())
    }

    async fn update_datastore(&self, datastore: &Datastore) -> Result<Datastore> {
        let mut datastores = write(&self.datastores)?;
        swap_versioned(&mut datastores, "datastore", &datastore.id, datastore, |d| d.version, |d| {
            d.version += 1;
            d.updated_at = Utc::now();
        })
    }

    async fn try_lock_mutex(&self, name: &str) -> Result<bool> {
        let mut mutexes = write(&self.mutexes)?;
        let record = mutexes
            .entry(name.to_string())
            .or_insert_with(|| MutexRecord::ready(name));
        if record.state == MutexState::Locked {
            return Ok(false);
        }
        record.state = MutexState::Locked;
        record.updated_at = Utc::now();
        Ok(true)
    }

    async fn unlock_mutex(&self, name: &str) -> Result<()> {
        let mut mutexes = write(&self.mutexes)?;
        mutexes.insert(name.to_string(), MutexRecord::ready(name));
        Ok(())
    }

    async fn get_mutex(&self, name: &str) -> Result<Option<MutexRecord>> {
        Ok(read(&self.mutexes)?.get(name).cloned())
    }
}

/// Store that hands control back to the runtime before every call, so
/// concurrent callers interleave the way they do against a real database
#[cfg(test)]
pub(crate) struct YieldingStateStore {
    inner: std::sync::Arc<InMemoryStateStore>,
}

#[cfg(test)]
impl YieldingStateStore {
    pub(crate) fn new(inner: std::sync::Arc<InMemoryStateStore>) -> Self {
        Self { inner }
    }
}

#[cfg(test)]
#[async_trait::async_trait]
impl StateStore for YieldingStateStore {
    async fn create_action(&self, action: Action) -> Result<Action> {
        tokio::task::yield_now().await;
        self.inner.create_action(action).await
    }

    async fn get_action(&self, id: &str) -> Result<Option<Action>> {
        tokio::task::yield_now().await;
        self.inner.get_action(id).await
    }

    async fn find_actions(&self, filter: &ActionFilter) -> Result<Vec<Action>> {
        tokio::task::yield_now().await;
        self.inner.find_actions(filter).await
    }

    async fn count_actions(&self, datastore_id: &str, states: &[ActionState]) -> Result<u64> {
        tokio::task::yield_now().await;
        self.inner.count_actions(datastore_id, states).await
    }

    async fn find_stale_pending_actions(&self, older_than: DateTime<Utc>) -> Result<Vec<Action>> {
        tokio::task::yield_now().await;
        self.inner.find_stale_pending_actions(older_than).await
    }

    async fn update_action(&self, action: &Action) -> Result<Action> {
        tokio::task::yield_now().await;
        self.inner.update_action(action).await
    }

    async fn create_workflow(&self, workflow: Workflow) -> Result<Workflow> {
        tokio::task::yield_now().await;
        self.inner.create_workflow(workflow).await
    }

    async fn get_workflow(&self, id: &str) -> Result<Option<Workflow>> {
        tokio::task::yield_now().await;
        self.inner.get_workflow(id).await
    }

    async fn update_workflow(&self, workflow: &Workflow) -> Result<Workflow> {
        tokio::task::yield_now().await;
        self.inner.update_workflow(workflow).await
    }

    async fn create_workflow_instance(&self, instance: WorkflowInstance) -> Result<WorkflowInstance> {
        tokio::task::yield_now().await;
        self.inner.create_workflow_instance(instance).await
    }

    async fn get_workflow_instance(&self, id: &str) -> Result<Option<WorkflowInstance>> {
        tokio::task::yield_now().await;
        self.inner.get_workflow_instance(id).await
    }

    async fn update_workflow_instance(&self, instance: &WorkflowInstance) -> Result<WorkflowInstance> {
        tokio::task::yield_now().await;
        self.inner.update_workflow_instance(instance).await
    }

    async fn create_datastore(&self, datastore: Datastore) -> Result<Datastore> {
        tokio::task::yield_now().await;
        self.inner.create_datastore(datastore).await
    }

    async fn get_datastore(&self, id: &str) -> Result<Option<Datastore>> {
        tokio::task::yield_now().await;
        self.inner.get_datastore(id).await
    }

    async fn update_datastore(&self, datastore: &Datastore) -> Result<Datastore> {
        tokio::task::yield_now().await;
        self.inner.update_datastore(datastore).await
    }

    async fn try_lock_mutex(&self, name: &str) -> Result<bool> {
        tokio::task::yield_now().await;
        self.inner.try_lock_mutex(name).await
    }

    async fn unlock_mutex(&self, name: &str) -> Result<()> {
        tokio::task::yield_now().await;
        self.inner.unlock_mutex(name).await
    }

    async fn get_mutex(&self, name: &str) -> Result<Option<MutexRecord>> {
        tokio::task::yield_now().await;
        self.inner.get_mutex(name).await
    }
}
