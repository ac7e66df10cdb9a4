// Workflow templates and their executions

//! # Workflow Models
//!
//! - [`Workflow`]: reusable template owning an ordered list of template actions
//! - [`WorkflowInstance`]: one execution of a workflow; its state is derived
//!   from the outcome of the instance's actions

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::action::OnFailure;
use crate::SchedulerError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowState {
    #[default]
    Active,
    Inactive,
}

impl WorkflowState {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowState::Active => "ACTIVE",
            WorkflowState::Inactive => "INACTIVE",
        }
    }
}

impl FromStr for WorkflowState {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ACTIVE" => Ok(WorkflowState::Active),
            "INACTIVE" => Ok(WorkflowState::Inactive),
            other => Err(SchedulerError::InvalidInput(format!(
                "unknown workflow state: {}",
                other
            ))),
        }
    }
}

/// Workflow template
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
    pub id: String,
    pub version: i64,
    pub name: String,
    pub datastore_id: String,
    pub state: WorkflowState,

    /// Whether a failed instance also deactivates the datastore
    pub on_failure: OnFailure,

    /// How many times a failed instance is re-launched
    pub retries_on_failures: u32,

    pub updated_at: DateTime<Utc>,
}

impl Workflow {
    pub fn new(name: impl Into<String>, datastore_id: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().simple().to_string(),
            version: 0,
            name: name.into(),
            datastore_id: datastore_id.into(),
            state: WorkflowState::Active,
            on_failure: OnFailure::Deactivate,
            retries_on_failures: 0,
            updated_at: Utc::now(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.state == WorkflowState::Active
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowInstanceState {
    Queued,
    Running,
    Completed,
    Failed,
}

impl WorkflowInstanceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowInstanceState::Queued => "QUEUED",
            WorkflowInstanceState::Running => "RUNNING",
            WorkflowInstanceState::Completed => "COMPLETED",
            WorkflowInstanceState::Failed => "FAILED",
        }
    }

    /// Callback senders report `FAILED` or anything else for success
    pub fn from_callback_status(status: Option<&str>) -> Self {
        match status {
            Some("FAILED") => WorkflowInstanceState::Failed,
            _ => WorkflowInstanceState::Completed,
        }
    }
}

impl fmt::Display for WorkflowInstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkflowInstanceState {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "QUEUED" => Ok(WorkflowInstanceState::Queued),
            "RUNNING" => Ok(WorkflowInstanceState::Running),
            "COMPLETED" => Ok(WorkflowInstanceState::Completed),
            "FAILED" => Ok(WorkflowInstanceState::Failed),
            other => Err(SchedulerError::InvalidInput(format!(
                "unknown workflow instance state: {}",
                other
            ))),
        }
    }
}

/// One execution of a workflow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowInstance {
    pub id: String,
    pub version: i64,
    pub workflow_id: String,
    pub datastore_id: String,
    pub state: WorkflowInstanceState,

    /// 0 for the first run, incremented by every retry trigger
    pub retry_num: u32,

    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowInstance {
    pub fn new(workflow: &Workflow, retry_num: u32) -> Self {
        Self {
            id: Uuid::new_v4().simple().to_string(),
            version: 0,
            workflow_id: workflow.id.clone(),
            datastore_id: workflow.datastore_id.clone(),
            state: WorkflowInstanceState::Queued,
            retry_num,
            start_time: None,
            end_time: None,
            error_message: None,
            updated_at: Utc::now(),
        }
    }

    pub fn apply_state(&mut self, state: WorkflowInstanceState, error_message: Option<String>) {
        let now = Utc::now();
        match state {
            WorkflowInstanceState::Running => self.start_time = Some(now),
            WorkflowInstanceState::Completed | WorkflowInstanceState::Failed => {
                self.end_time = Some(now)
            }
            WorkflowInstanceState::Queued => {}
        }
        self.state = state;
        self.error_message = error_message;
        self.updated_at = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_callback_status_only_failed_fails() {
        assert_eq!(
            WorkflowInstanceState::from_callback_status(Some("FAILED")),
            WorkflowInstanceState::Failed
        );
        assert_eq!(
            WorkflowInstanceState::from_callback_status(Some("SUCCEEDED")),
            WorkflowInstanceState::Completed
        );
        assert_eq!(
            WorkflowInstanceState::from_callback_status(None),
            WorkflowInstanceState::Completed
        );
    }

    #[test]
    fn test_instance_timestamps() {
        let workflow = Workflow::new("nightly", "ds1");
        let mut instance = WorkflowInstance::new(&workflow, 1);
        assert_eq!(instance.datastore_id, "ds1");
        assert_eq!(instance.retry_num, 1);

        instance.apply_state(WorkflowInstanceState::Running, None);
        assert!(instance.start_time.is_some());
        assert!(instance.end_time.is_none());

        instance.apply_state(WorkflowInstanceState::Failed, Some("boom".into()));
        assert!(instance.end_time.is_some());
        assert_eq!(instance.error_message.as_deref(), Some("boom"));
    }
}
