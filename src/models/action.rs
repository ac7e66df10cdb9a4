// Action domain model - the schedulable unit of work

//! # Action Model
//!
//! An [`Action`] is one step of a workflow. Template actions live on the
//! workflow (state `HasNeverRun`); each workflow instance gets its own copies
//! which the scheduler moves through:
//!
//! ```text
//! HasNeverRun -> Queued -> Pending -> Running -> Finishing -> Completed | Failed
//! ```
//!
//! State changes are only ever persisted through the conditional updates of the
//! [`StateStore`](crate::engine::storage::StateStore); the helpers here only
//! mutate the in-memory copy.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::SchedulerError;

/// Lifecycle of an action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionState {
    /// Template action attached to a workflow, never scheduled directly
    HasNeverRun,
    Queued,
    Pending,
    Running,
    Finishing,
    Completed,
    Failed,
}

impl ActionState {
    /// States that count against a datastore's concurrency limit
    pub const IN_FLIGHT: [ActionState; 3] = [
        ActionState::Pending,
        ActionState::Running,
        ActionState::Finishing,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ActionState::HasNeverRun => "HAS_NEVER_RUN",
            ActionState::Queued => "QUEUED",
            ActionState::Pending => "PENDING",
            ActionState::Running => "RUNNING",
            ActionState::Finishing => "FINISHING",
            ActionState::Completed => "COMPLETED",
            ActionState::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ActionState::Completed | ActionState::Failed)
    }

    /// Position in the lifecycle; both terminal states share the last slot
    fn progress_rank(&self) -> u8 {
        match self {
            ActionState::HasNeverRun => 0,
            ActionState::Queued => 1,
            ActionState::Pending => 2,
            ActionState::Running => 3,
            ActionState::Finishing => 4,
            ActionState::Completed | ActionState::Failed => 5,
        }
    }

    /// Whether a reported state may replace this one.
    ///
    /// Only strictly later states are accepted and a terminal state is final.
    pub fn can_advance_to(&self, next: ActionState) -> bool {
        !self.is_terminal() && next.progress_rank() > self.progress_rank()
    }

    /// Translate a status string reported by a running job into an action state.
    ///
    /// Accepts both the batch service vocabulary (`SUCCEEDED`, `RUNNABLE`, ...)
    /// and our own state names.
    pub fn from_external_status(status: &str) -> Option<ActionState> {
        match status.to_ascii_uppercase().as_str() {
            "SUCCEEDED" | "COMPLETED" => Some(ActionState::Completed),
            "FAILED" => Some(ActionState::Failed),
            "RUNNING" => Some(ActionState::Running),
            "SUBMITTED" | "PENDING" | "RUNNABLE" | "STARTING" => Some(ActionState::Pending),
            "FINISHING" | "ENDED" => Some(ActionState::Finishing),
            "QUEUED" => Some(ActionState::Queued),
            _ => None,
        }
    }
}

impl fmt::Display for ActionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActionState {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "HAS_NEVER_RUN" => Ok(ActionState::HasNeverRun),
            "QUEUED" => Ok(ActionState::Queued),
            "PENDING" => Ok(ActionState::Pending),
            "RUNNING" => Ok(ActionState::Running),
            "FINISHING" => Ok(ActionState::Finishing),
            "COMPLETED" => Ok(ActionState::Completed),
            "FAILED" => Ok(ActionState::Failed),
            other => Err(SchedulerError::InvalidInput(format!(
                "unknown action state: {}",
                other
            ))),
        }
    }
}

/// What happens to the owning workflow when this action fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OnFailure {
    Continue,
    #[default]
    Deactivate,
}

impl OnFailure {
    pub fn as_str(&self) -> &'static str {
        match self {
            OnFailure::Continue => "CONTINUE",
            OnFailure::Deactivate => "DEACTIVATE",
        }
    }
}

impl FromStr for OnFailure {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CONTINUE" => Ok(OnFailure::Continue),
            "DEACTIVATE" => Ok(OnFailure::Deactivate),
            other => Err(SchedulerError::InvalidInput(format!(
                "unknown on_failure policy: {}",
                other
            ))),
        }
    }
}

/// A single unit of work dispatched to the batch executor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    pub id: String,

    /// Optimistic-lock stamp, bumped by every persisted write
    pub version: i64,

    pub name: String,
    pub state: ActionState,

    /// Position in the workflow
    pub order_idx: i32,

    /// Actions sharing a value run concurrently
    pub parallelization_idx: Option<i32>,

    pub on_failure: OnFailure,
    pub engine_name: String,

    /// Job identifier in the batch executor, set once submitted
    pub batch_job_id: Option<String>,

    pub workflow_id: Option<String>,
    pub workflow_instance_id: Option<String>,

    /// Id of the template action this instance action was copied from
    pub workflow_action_id: Option<String>,

    pub datastore_id: String,
    pub first_in_workflow: bool,
    pub last_in_workflow: bool,
    pub retries_on_failures: u32,

    pub queued_time: Option<DateTime<Utc>>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    pub error_message: Option<String>,
}

impl Action {
    /// Create a new action in `HasNeverRun` against the given datastore
    pub fn new(
        name: impl Into<String>,
        engine_name: impl Into<String>,
        datastore_id: impl Into<String>,
        order_idx: i32,
    ) -> Self {
        Self {
            id: Uuid::new_v4().simple().to_string(),
            version: 0,
            name: name.into(),
            state: ActionState::HasNeverRun,
            order_idx,
            parallelization_idx: None,
            on_failure: OnFailure::default(),
            engine_name: engine_name.into(),
            batch_job_id: None,
            workflow_id: None,
            workflow_instance_id: None,
            workflow_action_id: None,
            datastore_id: datastore_id.into(),
            first_in_workflow: false,
            last_in_workflow: false,
            retries_on_failures: 0,
            queued_time: None,
            start_time: None,
            end_time: None,
            updated_at: Utc::now(),
            error_message: None,
        }
    }

    pub fn with_parallelization_idx(mut self, idx: i32) -> Self {
        self.parallelization_idx = Some(idx);
        self
    }

    pub fn with_on_failure(mut self, on_failure: OnFailure) -> Self {
        self.on_failure = on_failure;
        self
    }

    pub fn with_workflow(mut self, workflow_id: impl Into<String>) -> Self {
        self.workflow_id = Some(workflow_id.into());
        self
    }

    pub fn with_state(mut self, state: ActionState) -> Self {
        self.state = state;
        self
    }

    /// Copy a template action into a runnable action for one workflow instance
    pub fn instantiate(&self, workflow_instance_id: &str) -> Self {
        let mut action = self.clone();
        action.id = Uuid::new_v4().simple().to_string();
        action.version = 0;
        action.state = ActionState::HasNeverRun;
        action.workflow_instance_id = Some(workflow_instance_id.to_string());
        action.workflow_action_id = Some(self.id.clone());
        action.batch_job_id = None;
        action.queued_time = None;
        action.start_time = None;
        action.end_time = None;
        action.error_message = None;
        action.updated_at = Utc::now();
        action
    }

    /// Apply a state change locally, stamping the matching timestamps.
    ///
    /// Persisting the result is the caller's job.
    pub fn apply_state(&mut self, state: ActionState, error_message: Option<String>) {
        let now = Utc::now();
        match state {
            ActionState::Queued => self.queued_time = Some(now),
            ActionState::Running if self.start_time.is_none() => self.start_time = Some(now),
            ActionState::Completed | ActionState::Failed => self.end_time = Some(now),
            _ => {}
        }
        self.state = state;
        self.error_message = error_message;
        self.updated_at = now;
    }

    /// Whether this action's failure should stop the rest of the chain
    pub fn is_continue_on_failure(&self) -> bool {
        self.on_failure == OnFailure::Continue
    }
}

/// Rank of an externally reported status in the forward-only ordering.
///
/// `ENDED` carries a rank of 40 in the systems that report it, placing it
/// after every other status; it is kept that way so existing senders behave
/// the same.
fn status_rank(status: &str) -> Option<u32> {
    match status {
        "PENDING" => Some(0),
        "RUNNABLE" => Some(1),
        "STARTING" => Some(2),
        "RUNNING" => Some(3),
        "ENDED" => Some(40),
        "COMPLETED" => Some(5),
        "FAILED" | "SUCCEEDED" => Some(6),
        _ => None,
    }
}

/// Decide whether a reported status may overwrite the recorded one.
///
/// Out-of-order or duplicate callbacks never move an action backwards. A status
/// outside the known ordering, on either side, always updates.
pub fn should_update(new_state: &str, current_state: &str) -> bool {
    match (status_rank(new_state), status_rank(current_state)) {
        (Some(new_rank), Some(current_rank)) => current_rank < new_rank,
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_should_update_moves_forward_only() {
        assert!(should_update("RUNNING", "PENDING"));
        assert!(should_update("SUCCEEDED", "RUNNING"));
        assert!(!should_update("RUNNING", "SUCCEEDED"));
        assert!(!should_update("PENDING", "RUNNING"));
    }

    #[test]
    fn test_should_update_ignores_duplicates() {
        assert!(!should_update("RUNNING", "RUNNING"));
        assert!(!should_update("FAILED", "SUCCEEDED"));
    }

    #[test]
    fn test_should_update_unknown_states_always_update() {
        assert!(should_update("SOMETHING_NEW", "RUNNING"));
        assert!(should_update("RUNNING", "HAS_NEVER_RUN"));
    }

    #[test]
    fn test_terminal_states_are_final() {
        for terminal in [ActionState::Completed, ActionState::Failed] {
            for next in [ActionState::Completed, ActionState::Failed, ActionState::Running, ActionState::Queued] {
                assert!(!terminal.can_advance_to(next));
            }
        }
    }

    #[test]
    fn test_can_advance_only_forward() {
        assert!(ActionState::Pending.can_advance_to(ActionState::Running));
        assert!(ActionState::Running.can_advance_to(ActionState::Finishing));
        assert!(ActionState::Finishing.can_advance_to(ActionState::Failed));
        assert!(!ActionState::Finishing.can_advance_to(ActionState::Pending));
        assert!(!ActionState::Running.can_advance_to(ActionState::Running));
    }

    #[test]
    fn test_external_status_mapping() {
        assert_eq!(ActionState::from_external_status("SUCCEEDED"), Some(ActionState::Completed));
        assert_eq!(ActionState::from_external_status("runnable"), Some(ActionState::Pending));
        assert_eq!(ActionState::from_external_status("FAILED"), Some(ActionState::Failed));
        assert_eq!(ActionState::from_external_status("bogus"), None);
    }

    #[test]
    fn test_instantiate_resets_runtime_fields() {
        let mut template = Action::new("load", "redshift_engine", "ds1", 2).with_workflow("wf1");
        template.batch_job_id = Some("job-1".to_string());
        template.error_message = Some("boom".to_string());

        let action = template.instantiate("wfi1");
        assert_ne!(action.id, template.id);
        assert_eq!(action.workflow_action_id.as_deref(), Some(template.id.as_str()));
        assert_eq!(action.workflow_instance_id.as_deref(), Some("wfi1"));
        assert!(action.batch_job_id.is_none());
        assert!(action.error_message.is_none());
        assert_eq!(action.order_idx, 2);
    }

    #[test]
    fn test_state_round_trips_through_strings() {
        for state in [ActionState::Queued, ActionState::Finishing, ActionState::HasNeverRun] {
            assert_eq!(state.as_str().parse::<ActionState>().unwrap(), state);
        }
        assert!("NOPE".parse::<ActionState>().is_err());
    }
}
