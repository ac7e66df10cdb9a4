// Completion callbacks pushed by running jobs

//! # Completion Handler
//!
//! Running jobs report progress by pushing a list of status updates. Each
//! entry moves its action forward (never backwards, and never out of
//! COMPLETED or FAILED, see [`ActionState::can_advance_to`]) and, when it
//! names a workflow instance, settles that instance:
//!
//! - COMPLETED: a workflow-completion trigger is sent
//! - FAILED with retries left: a retry trigger is sent
//! - FAILED otherwise: the workflow is deactivated if the action says so, and
//!   the datastore too if the workflow says so
//!
//! Callbacks arrive at least once and out of order. Writes that lose a
//! version race are re-read and retried a few times before giving up.

use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use super::storage::{retry_conditional, StateStore};
use super::triggers::TriggerProxy;
use crate::models::{
    should_update, Action, ActionState, DatastoreState, OnFailure, WorkflowInstance,
    WorkflowInstanceState, WorkflowState,
};
use crate::{Result, SchedulerError};

/// One entry of a completion callback
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionStatusUpdate {
    pub action_id: String,
    pub action_status: String,
    #[serde(default)]
    pub workflow_instance_id: Option<String>,
    #[serde(default)]
    pub workflow_instance_status: Option<String>,
    #[serde(default)]
    pub error_message: Option<String>,
}

#[derive(Clone)]
pub struct CompletionHandler {
    store: Arc<dyn StateStore>,
    triggers: TriggerProxy,
}

impl CompletionHandler {
    pub fn new(store: Arc<dyn StateStore>, triggers: TriggerProxy) -> Self {
        Self { store, triggers }
    }

    /// Apply every update in order, stopping at the first failure
    pub async fn apply(&self, updates: &[ActionStatusUpdate]) -> Result<()> {
        for update in updates {
            self.apply_one(update).await?;
        }
        Ok(())
    }

    pub async fn apply_one(&self, update: &ActionStatusUpdate) -> Result<()> {
        let new_state = ActionState::from_external_status(&update.action_status).ok_or_else(|| {
            SchedulerError::InvalidInput(format!("unknown action status {}", update.action_status))
        })?;

        let action = retry_conditional(|| self.update_action_state(update, new_state)).await?;

        if let Some(instance_id) = &update.workflow_instance_id {
            let instance_state =
                WorkflowInstanceState::from_callback_status(update.workflow_instance_status.as_deref());
            let settled = retry_conditional(|| {
                self.settle_instance(instance_id, instance_state, update.error_message.clone())
            })
            .await?;
            if let Some(instance) = settled {
                self.after_instance_settled(&action, &instance).await?;
            }
        }

        if let Err(e) = self
            .triggers
            .try_next_action(
                &action.datastore_id,
                Some(json!({ "action_id": action.id, "action_status": update.action_status })),
            )
            .await
        {
            error!(datastore_id = %action.datastore_id, "Failed to send TRY_NEXT_ACTION: {}", e);
        }
        Ok(())
    }

    /// Write the reported state if it moves the action forward.
    /// Returns the action as persisted afterwards.
    async fn update_action_state(&self, update: &ActionStatusUpdate, new_state: ActionState) -> Result<Action> {
        let action = self
            .store
            .get_action(&update.action_id)
            .await?
            .ok_or_else(|| SchedulerError::NotFound(format!("action {}", update.action_id)))?;

        if !action.state.can_advance_to(new_state)
            || !should_update(&update.action_status, action.state.as_str())
        {
            debug!(
                action_id = %action.id,
                current = %action.state,
                reported = %update.action_status,
                "Ignoring stale or duplicate status"
            );
            return Ok(action);
        }

        let error_message = match new_state {
            ActionState::Failed => update
                .error_message
                .clone()
                .or_else(|| action.error_message.clone()),
            _ => action.error_message.clone(),
        };
        let mut updated = action.clone();
        updated.apply_state(new_state, error_message);
        let stored = self.store.update_action(&updated).await?;
        info!(action_id = %stored.id, state = %stored.state, "Updated action state");
        Ok(stored)
    }

    /// Move the instance to its final state. `None` if it was already there.
    async fn settle_instance(
        &self,
        instance_id: &str,
        state: WorkflowInstanceState,
        error_message: Option<String>,
    ) -> Result<Option<WorkflowInstance>> {
        let instance = self
            .store
            .get_workflow_instance(instance_id)
            .await?
            .ok_or_else(|| SchedulerError::NotFound(format!("workflow instance {}", instance_id)))?;

        if instance.state == state {
            return Ok(None);
        }
        let mut updated = instance.clone();
        updated.apply_state(state, error_message);
        let stored = self.store.update_workflow_instance(&updated).await?;
        info!(workflow_instance_id = %stored.id, state = %stored.state, "Updated workflow instance state");
        Ok(Some(stored))
    }

    async fn after_instance_settled(&self, action: &Action, instance: &WorkflowInstance) -> Result<()> {
        match instance.state {
            WorkflowInstanceState::Completed => {
                if let Err(e) = self.triggers.trigger_workflow_completion(&instance.workflow_id).await {
                    error!(workflow_id = %instance.workflow_id, "Failed to send completion trigger: {}", e);
                }
                Ok(())
            }
            WorkflowInstanceState::Failed => self.handle_instance_failure(action, instance).await,
            _ => Ok(()),
        }
    }

    async fn handle_instance_failure(&self, action: &Action, instance: &WorkflowInstance) -> Result<()> {
        let workflow = self
            .store
            .get_workflow(&instance.workflow_id)
            .await?
            .ok_or_else(|| SchedulerError::NotFound(format!("workflow {}", instance.workflow_id)))?;

        if instance.retry_num < workflow.retries_on_failures {
            let retry_num = instance.retry_num + 1;
            info!(workflow_id = %workflow.id, retry_num, "Requesting workflow retry");
            if let Err(e) = self.triggers.trigger_workflow_retry(&workflow.id, retry_num).await {
                error!(workflow_id = %workflow.id, "Failed to send retry trigger: {}", e);
            }
            return Ok(());
        }

        if action.on_failure != OnFailure::Deactivate {
            return Ok(());
        }
        retry_conditional(|| self.deactivate_workflow(&workflow.id)).await?;

        if workflow.on_failure == OnFailure::Deactivate {
            retry_conditional(|| self.deactivate_datastore(&workflow.datastore_id)).await?;
        }
        Ok(())
    }

    async fn deactivate_workflow(&self, workflow_id: &str) -> Result<()> {
        let Some(mut workflow) = self.store.get_workflow(workflow_id).await? else {
            return Err(SchedulerError::NotFound(format!("workflow {}", workflow_id)));
        };
        if workflow.state == WorkflowState::Inactive {
            return Ok(());
        }
        workflow.state = WorkflowState::Inactive;
        self.store.update_workflow(&workflow).await?;
        warn!(workflow_id = %workflow_id, "Deactivated workflow after failure");
        Ok(())
    }

    async fn deactivate_datastore(&self, datastore_id: &str) -> Result<()> {
        let Some(mut datastore) = self.store.get_datastore(datastore_id).await? else {
            return Err(SchedulerError::NotFound(format!("datastore {}", datastore_id)));
        };
        if datastore.state == DatastoreState::Inactive {
            return Ok(());
        }
        datastore.state = DatastoreState::Inactive;
        self.store.update_datastore(&datastore).await?;
        warn!(datastore_id = %datastore_id, "Deactivated datastore after workflow failure");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::storage::InMemoryStateStore;
    use crate::engine::triggers::ChannelTriggerBroker;
    use crate::models::{Datastore, TriggerMessage, Workflow};
    use tokio::sync::broadcast;

    struct Fixture {
        store: Arc<InMemoryStateStore>,
        handler: CompletionHandler,
        messages: broadcast::Receiver<TriggerMessage>,
        datastore: Datastore,
        workflow: Workflow,
        instance: WorkflowInstance,
        action: Action,
    }

    async fn fixture(action_policy: OnFailure, workflow_policy: OnFailure, retries: u32) -> Fixture {
        let store = Arc::new(InMemoryStateStore::new());
        let broker = ChannelTriggerBroker::default();
        let messages = broker.subscribe();
        let handler = CompletionHandler::new(store.clone(), TriggerProxy::new(Arc::new(broker)));

        let datastore = store
            .create_datastore(Datastore::new("warehouse", "redshift_engine", 2))
            .await
            .unwrap();
        let mut workflow = Workflow::new("nightly", &datastore.id);
        workflow.on_failure = workflow_policy;
        workflow.retries_on_failures = retries;
        let workflow = store.create_workflow(workflow).await.unwrap();

        let mut instance = WorkflowInstance::new(&workflow, 0);
        instance.apply_state(WorkflowInstanceState::Running, None);
        let instance = store.create_workflow_instance(instance).await.unwrap();

        let mut action = Action::new("load", "redshift_engine", &datastore.id, 0)
            .with_workflow(&workflow.id)
            .with_on_failure(action_policy)
            .with_state(ActionState::Running);
        action.workflow_instance_id = Some(instance.id.clone());
        let action = store.create_action(action).await.unwrap();

        Fixture {
            store,
            handler,
            messages,
            datastore,
            workflow,
            instance,
            action,
        }
    }

    fn update(action_id: &str, status: &str) -> ActionStatusUpdate {
        ActionStatusUpdate {
            action_id: action_id.to_string(),
            action_status: status.to_string(),
            workflow_instance_id: None,
            workflow_instance_status: None,
            error_message: None,
        }
    }

    fn drain(rx: &mut broadcast::Receiver<TriggerMessage>) -> Vec<TriggerMessage> {
        let mut out = Vec::new();
        while let Ok(message) = rx.try_recv() {
            out.push(message);
        }
        out
    }

    #[tokio::test]
    async fn test_status_moves_forward_only() {
        let f = fixture(OnFailure::Deactivate, OnFailure::Deactivate, 0).await;

        f.handler.apply(&[update(&f.action.id, "SUCCEEDED")]).await.unwrap();
        f.handler.apply(&[update(&f.action.id, "RUNNING")]).await.unwrap();

        let stored = f.store.get_action(&f.action.id).await.unwrap().unwrap();
        assert_eq!(stored.state, ActionState::Completed);
        assert!(stored.end_time.is_some());
    }

    #[tokio::test]
    async fn test_late_failure_does_not_overwrite_completion() {
        let f = fixture(OnFailure::Deactivate, OnFailure::Deactivate, 0).await;

        f.handler.apply(&[update(&f.action.id, "SUCCEEDED")]).await.unwrap();
        f.handler.apply(&[update(&f.action.id, "FAILED")]).await.unwrap();

        let stored = f.store.get_action(&f.action.id).await.unwrap().unwrap();
        assert_eq!(stored.state, ActionState::Completed);
    }

    #[tokio::test]
    async fn test_failed_action_stays_failed() {
        let f = fixture(OnFailure::Continue, OnFailure::Continue, 0).await;

        f.handler.apply(&[update(&f.action.id, "FAILED")]).await.unwrap();
        f.handler.apply(&[update(&f.action.id, "SUCCEEDED")]).await.unwrap();

        let stored = f.store.get_action(&f.action.id).await.unwrap().unwrap();
        assert_eq!(stored.state, ActionState::Failed);
    }

    #[tokio::test]
    async fn test_finishing_action_ignores_earlier_statuses() {
        let f = fixture(OnFailure::Deactivate, OnFailure::Deactivate, 0).await;
        f.handler.apply(&[update(&f.action.id, "FINISHING")]).await.unwrap();

        for status in ["RUNNABLE", "PENDING", "RUNNING"] {
            f.handler.apply(&[update(&f.action.id, status)]).await.unwrap();
        }
        let stored = f.store.get_action(&f.action.id).await.unwrap().unwrap();
        assert_eq!(stored.state, ActionState::Finishing);

        f.handler.apply(&[update(&f.action.id, "SUCCEEDED")]).await.unwrap();
        let stored = f.store.get_action(&f.action.id).await.unwrap().unwrap();
        assert_eq!(stored.state, ActionState::Completed);
    }

    #[tokio::test]
    async fn test_completed_instance_triggers_completion() {
        let mut f = fixture(OnFailure::Deactivate, OnFailure::Deactivate, 0).await;
        let mut entry = update(&f.action.id, "SUCCEEDED");
        entry.workflow_instance_id = Some(f.instance.id.clone());
        entry.workflow_instance_status = Some("COMPLETED".into());

        f.handler.apply(&[entry.clone()]).await.unwrap();

        let instance = f.store.get_workflow_instance(&f.instance.id).await.unwrap().unwrap();
        assert_eq!(instance.state, WorkflowInstanceState::Completed);

        let messages = drain(&mut f.messages);
        assert!(messages.contains(&TriggerMessage::workflow_completion(&f.workflow.id)));
        assert!(messages
            .iter()
            .any(|m| matches!(m, TriggerMessage::TryNextAction { datastore_id, .. } if *datastore_id == f.datastore.id)));

        // duplicate delivery does not trigger completion twice
        f.handler.apply(&[entry]).await.unwrap();
        let again = drain(&mut f.messages);
        assert!(!again.contains(&TriggerMessage::workflow_completion(&f.workflow.id)));
    }

    #[tokio::test]
    async fn test_failure_cascades_deactivation() {
        let f = fixture(OnFailure::Deactivate, OnFailure::Deactivate, 0).await;
        let mut entry = update(&f.action.id, "FAILED");
        entry.workflow_instance_id = Some(f.instance.id.clone());
        entry.workflow_instance_status = Some("FAILED".into());
        entry.error_message = Some("COPY failed".into());

        f.handler.apply(&[entry]).await.unwrap();

        let action = f.store.get_action(&f.action.id).await.unwrap().unwrap();
        assert_eq!(action.state, ActionState::Failed);
        assert_eq!(action.error_message.as_deref(), Some("COPY failed"));
        let workflow = f.store.get_workflow(&f.workflow.id).await.unwrap().unwrap();
        assert_eq!(workflow.state, WorkflowState::Inactive);
        let datastore = f.store.get_datastore(&f.datastore.id).await.unwrap().unwrap();
        assert_eq!(datastore.state, DatastoreState::Inactive);
    }

    #[tokio::test]
    async fn test_workflow_continue_policy_keeps_datastore() {
        let f = fixture(OnFailure::Deactivate, OnFailure::Continue, 0).await;
        let mut entry = update(&f.action.id, "FAILED");
        entry.workflow_instance_id = Some(f.instance.id.clone());
        entry.workflow_instance_status = Some("FAILED".into());

        f.handler.apply(&[entry]).await.unwrap();

        let workflow = f.store.get_workflow(&f.workflow.id).await.unwrap().unwrap();
        assert_eq!(workflow.state, WorkflowState::Inactive);
        let datastore = f.store.get_datastore(&f.datastore.id).await.unwrap().unwrap();
        assert_eq!(datastore.state, DatastoreState::Active);
    }

    #[tokio::test]
    async fn test_action_continue_policy_keeps_workflow() {
        let f = fixture(OnFailure::Continue, OnFailure::Deactivate, 0).await;
        let mut entry = update(&f.action.id, "FAILED");
        entry.workflow_instance_id = Some(f.instance.id.clone());
        entry.workflow_instance_status = Some("FAILED".into());

        f.handler.apply(&[entry]).await.unwrap();

        let workflow = f.store.get_workflow(&f.workflow.id).await.unwrap().unwrap();
        assert_eq!(workflow.state, WorkflowState::Active);
    }

    #[tokio::test]
    async fn test_failure_with_retries_left_requests_retry() {
        let mut f = fixture(OnFailure::Deactivate, OnFailure::Deactivate, 2).await;
        let mut entry = update(&f.action.id, "FAILED");
        entry.workflow_instance_id = Some(f.instance.id.clone());
        entry.workflow_instance_status = Some("FAILED".into());

        f.handler.apply(&[entry]).await.unwrap();

        let messages = drain(&mut f.messages);
        assert!(messages.contains(&TriggerMessage::workflow_retry(&f.workflow.id, 1)));
        let workflow = f.store.get_workflow(&f.workflow.id).await.unwrap().unwrap();
        assert_eq!(workflow.state, WorkflowState::Active);
    }

    #[tokio::test]
    async fn test_unknown_action_is_an_error() {
        let f = fixture(OnFailure::Deactivate, OnFailure::Deactivate, 0).await;
        let err = f.handler.apply(&[update("nope", "RUNNING")]).await.unwrap_err();
        assert!(matches!(err, SchedulerError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_unknown_status_is_rejected() {
        let f = fixture(OnFailure::Deactivate, OnFailure::Deactivate, 0).await;
        let err = f.handler.apply(&[update(&f.action.id, "EXPLODED")]).await.unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidInput(_)));
    }
}
