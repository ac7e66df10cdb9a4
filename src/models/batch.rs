// Batch executor wire types

use serde::{Deserialize, Serialize};
use std::fmt;

use super::action::ActionState;

/// Environment variable passed to a job. The batch service only accepts
/// string values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvVar {
    pub name: String,
    pub value: String,
}

impl EnvVar {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// A single job submission
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSubmission {
    pub job_name: String,

    /// Fully qualified job definition reference (name:revision or ARN)
    pub job_definition: String,

    pub job_queue: String,

    /// Job ids this job waits on
    pub depends_on: Vec<String>,

    pub environment: Vec<EnvVar>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobDefinitionStatus {
    Active,
    Inactive,
}

/// One revision of a registered job definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDefinition {
    pub job_definition_name: String,
    pub revision: u32,
    pub job_definition_arn: String,
    pub status: JobDefinitionStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BatchJobStatus {
    Submitted,
    Pending,
    Runnable,
    Starting,
    Running,
    Succeeded,
    Failed,
}

impl BatchJobStatus {
    /// Collapse the batch vocabulary into action states, the same way
    /// [`ActionState::from_external_status`] does
    pub fn to_action_state(self) -> ActionState {
        match self {
            BatchJobStatus::Submitted
            | BatchJobStatus::Pending
            | BatchJobStatus::Runnable
            | BatchJobStatus::Starting => ActionState::Pending,
            BatchJobStatus::Running => ActionState::Running,
            BatchJobStatus::Succeeded => ActionState::Completed,
            BatchJobStatus::Failed => ActionState::Failed,
        }
    }
}

impl fmt::Display for BatchJobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BatchJobStatus::Submitted => "SUBMITTED",
            BatchJobStatus::Pending => "PENDING",
            BatchJobStatus::Runnable => "RUNNABLE",
            BatchJobStatus::Starting => "STARTING",
            BatchJobStatus::Running => "RUNNING",
            BatchJobStatus::Succeeded => "SUCCEEDED",
            BatchJobStatus::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDescription {
    pub job_id: String,
    pub job_name: String,
    pub status: BatchJobStatus,
    #[serde(default)]
    pub status_reason: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_status_collapses_to_action_state() {
        assert_eq!(BatchJobStatus::Submitted.to_action_state(), ActionState::Pending);
        assert_eq!(BatchJobStatus::Runnable.to_action_state(), ActionState::Pending);
        assert_eq!(BatchJobStatus::Starting.to_action_state(), ActionState::Pending);
        assert_eq!(BatchJobStatus::Running.to_action_state(), ActionState::Running);
        assert_eq!(BatchJobStatus::Succeeded.to_action_state(), ActionState::Completed);
        assert_eq!(BatchJobStatus::Failed.to_action_state(), ActionState::Failed);
    }

    #[test]
    fn test_batch_status_agrees_with_callback_mapping() {
        for status in [
            BatchJobStatus::Submitted,
            BatchJobStatus::Pending,
            BatchJobStatus::Runnable,
            BatchJobStatus::Starting,
            BatchJobStatus::Running,
            BatchJobStatus::Succeeded,
            BatchJobStatus::Failed,
        ] {
            assert_eq!(
                ActionState::from_external_status(&status.to_string()),
                Some(status.to_action_state())
            );
        }
    }
}
