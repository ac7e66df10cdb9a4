// Workflow launcher and trigger listener

//! # Workflow Launcher
//!
//! Turns a workflow template into a running instance: the template actions
//! are copied into instance actions, submitted as one DAG of dependent jobs
//! and moved to PENDING. The launch holds the `START_ENGINE_TASK` mutex so it
//! never interleaves with the control loop's single-action submissions.
//!
//! [`TriggerListener`] is the consuming side of the trigger proxy. Retry
//! triggers re-launch the workflow, `COMPLETE_ACTION` settles an action that
//! finished outside the callback path, everything else is only logged.

use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use super::dag::{DagBuilder, WorkflowAttributes};
use super::mutex::MutexService;
use super::storage::{transition_action, ActionFilter, StateStore};
use crate::models::{
    Action, ActionState, Mutexes, TriggerMessage, TriggerType, WorkflowInstance,
    WorkflowInstanceState,
};
use crate::{Result, SchedulerError};

#[derive(Clone)]
pub struct WorkflowLauncher {
    store: Arc<dyn StateStore>,
    dag: Arc<DagBuilder>,
    mutex: MutexService,
    notification_target: Option<String>,
}

impl WorkflowLauncher {
    pub fn new(store: Arc<dyn StateStore>, dag: Arc<DagBuilder>, notification_target: Option<String>) -> Self {
        Self {
            mutex: MutexService::new(store.clone()),
            store,
            dag,
            notification_target,
        }
    }

    /// Start a new instance of `workflow_id`
    pub async fn launch(&self, workflow_id: &str, retry_num: u32) -> Result<WorkflowInstance> {
        let workflow = self
            .store
            .get_workflow(workflow_id)
            .await?
            .ok_or_else(|| SchedulerError::NotFound(format!("workflow {}", workflow_id)))?;
        if !workflow.is_active() {
            return Err(SchedulerError::Validation(format!("workflow {} is inactive", workflow_id)));
        }
        let datastore = self
            .store
            .get_datastore(&workflow.datastore_id)
            .await?
            .ok_or_else(|| SchedulerError::NotFound(format!("datastore {}", workflow.datastore_id)))?;
        if !datastore.is_active() {
            return Err(SchedulerError::Validation(format!(
                "datastore {} is inactive",
                datastore.id
            )));
        }

        let mut templates: Vec<Action> = self
            .store
            .find_actions(&ActionFilter::templates_of(workflow_id))
            .await?
            .into_iter()
            .filter(|a| a.workflow_instance_id.is_none())
            .collect();
        if templates.is_empty() {
            return Err(SchedulerError::Validation(format!(
                "workflow {} has no actions",
                workflow_id
            )));
        }
        templates.sort_by_key(|a| a.order_idx);

        let mut instance = WorkflowInstance::new(&workflow, retry_num);
        instance.apply_state(WorkflowInstanceState::Running, None);
        let instance = self.store.create_workflow_instance(instance).await?;
        info!(
            workflow_id = %workflow_id,
            workflow_instance_id = %instance.id,
            retry_num,
            "🚀 Launching workflow"
        );

        let first_idx = templates.first().map(|a| a.order_idx);
        let last_idx = templates.last().map(|a| a.order_idx);
        let mut actions = Vec::with_capacity(templates.len());
        for template in &templates {
            let mut action = template.instantiate(&instance.id);
            action.first_in_workflow = Some(action.order_idx) == first_idx;
            action.last_in_workflow = Some(action.order_idx) == last_idx;
            actions.push(self.store.create_action(action).await?);
        }

        let attrs = WorkflowAttributes {
            workflow_id: workflow.id.clone(),
            workflow_instance_id: instance.id.clone(),
            datastore_id: workflow.datastore_id.clone(),
            notification_target: self.notification_target.clone(),
        };

        let built = self
            .mutex
            .with_mutex(Mutexes::START_ENGINE_TASK, || {
                self.dag.build(&actions, workflow.retries_on_failures, &attrs)
            })
            .await;

        let submitted = match built {
            Ok(Some(submitted)) => submitted,
            Ok(None) => {
                let message = "engine task mutex is held elsewhere".to_string();
                return self.fail_launch(instance, &actions, message).await;
            }
            Err(e) => return self.fail_launch(instance, &actions, e.to_string()).await,
        };

        for action in &submitted {
            match transition_action(self.store.as_ref(), action, ActionState::HasNeverRun, ActionState::Pending, None).await {
                Ok(_) => {}
                Err(e) if e.is_conditional_update_failure() => {
                    debug!(action_id = %action.id, "Action moved before it could be marked pending");
                }
                Err(e) => return Err(e),
            }
        }
        info!(workflow_instance_id = %instance.id, actions = submitted.len(), "Workflow launched");
        Ok(instance)
    }

    /// Mark the instance and its unsubmitted actions FAILED, then return the
    /// launch error
    async fn fail_launch(
        &self,
        instance: WorkflowInstance,
        actions: &[Action],
        message: String,
    ) -> Result<WorkflowInstance> {
        error!(workflow_instance_id = %instance.id, "Workflow launch failed: {}", message);

        for action in actions {
            let Some(current) = self.store.get_action(&action.id).await? else {
                continue;
            };
            if let Err(e) = transition_action(
                self.store.as_ref(),
                &current,
                ActionState::HasNeverRun,
                ActionState::Failed,
                Some(message.clone()),
            )
            .await
            {
                warn!(action_id = %action.id, "Could not fail action after launch error: {}", e);
            }
        }

        let mut failed = instance;
        failed.apply_state(WorkflowInstanceState::Failed, Some(message.clone()));
        self.store.update_workflow_instance(&failed).await?;
        Err(SchedulerError::Internal(format!("launch of workflow {} failed: {}", failed.workflow_id, message)))
    }
}

/// Acts on messages sent through the trigger proxy
#[derive(Clone)]
pub struct TriggerListener {
    store: Arc<dyn StateStore>,
    launcher: WorkflowLauncher,
}

impl TriggerListener {
    pub fn new(store: Arc<dyn StateStore>, launcher: WorkflowLauncher) -> Self {
        Self { store, launcher }
    }

    pub async fn handle(&self, message: &TriggerMessage) -> Result<()> {
        match message {
            TriggerMessage::ProcessTrigger {
                trigger_type_name,
                message,
            } => self.process_trigger(trigger_type_name, message).await,
            TriggerMessage::CompleteAction {
                action_id,
                action_state,
                error_message,
            } => self.complete_action(action_id, *action_state, error_message.clone()).await,
            TriggerMessage::TryNextAction { datastore_id, .. } => {
                debug!(datastore_id = %datastore_id, "TRY_NEXT_ACTION is picked up by the control loop");
                Ok(())
            }
        }
    }

    async fn process_trigger(&self, trigger_type_name: &str, message: &Value) -> Result<()> {
        let workflow_id = message
            .get("workflow_id")
            .and_then(Value::as_str)
            .ok_or_else(|| SchedulerError::InvalidInput("trigger message without workflow_id".to_string()))?;

        match TriggerType::from_name(trigger_type_name) {
            Some(TriggerType::Retry) => {
                let retry_num = message
                    .get("retry_num")
                    .and_then(Value::as_u64)
                    .and_then(|n| u32::try_from(n).ok())
                    .unwrap_or(1);
                self.launcher.launch(workflow_id, retry_num).await?;
                Ok(())
            }
            Some(TriggerType::WorkflowCompletion) => {
                info!(workflow_id = %workflow_id, "Workflow completed");
                Ok(())
            }
            None => {
                warn!(trigger_type = %trigger_type_name, "Ignoring unknown trigger type");
                Ok(())
            }
        }
    }

    async fn complete_action(
        &self,
        action_id: &str,
        state: ActionState,
        error_message: Option<String>,
    ) -> Result<()> {
        let action = self
            .store
            .get_action(action_id)
            .await?
            .ok_or_else(|| SchedulerError::NotFound(format!("action {}", action_id)))?;
        if action.state.is_terminal() {
            debug!(action_id = %action_id, state = %action.state, "Action already settled");
            return Ok(());
        }

        let mut updated = action.clone();
        updated.apply_state(state, error_message);
        match self.store.update_action(&updated).await {
            Ok(stored) => {
                info!(action_id = %action_id, state = %stored.state, "Completed action");
                Ok(())
            }
            Err(e) if e.is_conditional_update_failure() => {
                debug!(action_id = %action_id, "Action changed concurrently, leaving it");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}
