// Trigger message envelopes exchanged with listener processes

//! # Trigger Messages
//!
//! Every message is a JSON object tagged by its `call`:
//!
//! ```json
//! {"call": "COMPLETE_ACTION", "action_id": "...", "action_state": "FAILED", "error_message": "..."}
//! ```
//!
//! Delivery is at-least-once and unordered across calls, so listeners must
//! treat every message as idempotent.

use serde::{Deserialize, Serialize};
use serde_json::json;

use super::action::ActionState;

/// Named trigger kinds carried by [`TriggerMessage::ProcessTrigger`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerType {
    /// A workflow instance finished; payload `{workflow_id}`
    WorkflowCompletion,
    /// Re-run a failed workflow; payload `{workflow_id, retry_num}`
    Retry,
}

impl TriggerType {
    pub fn name(&self) -> &'static str {
        match self {
            TriggerType::WorkflowCompletion => "workflow_completion",
            TriggerType::Retry => "retry",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "workflow_completion" => Some(TriggerType::WorkflowCompletion),
            "retry" => Some(TriggerType::Retry),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "call", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TriggerMessage {
    /// Ask the scheduler to look at a datastore's queue again
    TryNextAction {
        datastore_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        log_info: Option<serde_json::Value>,
    },

    /// An action reached a terminal state outside the callback path
    CompleteAction {
        action_id: String,
        action_state: ActionState,
        error_message: Option<String>,
    },

    /// Generic trigger evaluation (workflow completion, retry)
    ProcessTrigger {
        trigger_type_name: String,
        message: serde_json::Value,
    },
}

impl TriggerMessage {
    pub fn workflow_completion(workflow_id: &str) -> Self {
        TriggerMessage::ProcessTrigger {
            trigger_type_name: TriggerType::WorkflowCompletion.name().to_string(),
            message: json!({ "workflow_id": workflow_id }),
        }
    }

    pub fn workflow_retry(workflow_id: &str, retry_num: u32) -> Self {
        TriggerMessage::ProcessTrigger {
            trigger_type_name: TriggerType::Retry.name().to_string(),
            message: json!({ "workflow_id": workflow_id, "retry_num": retry_num }),
        }
    }

    /// Name of the call, used as the NATS subject suffix
    pub fn call_name(&self) -> &'static str {
        match self {
            TriggerMessage::TryNextAction { .. } => "TRY_NEXT_ACTION",
            TriggerMessage::CompleteAction { .. } => "COMPLETE_ACTION",
            TriggerMessage::ProcessTrigger { .. } => "PROCESS_TRIGGER",
        }
    }
}
