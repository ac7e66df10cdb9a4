// Trigger/message proxy

//! # Trigger Proxy
//!
//! Fire-and-forget notifications for listener processes. The scheduler never
//! waits for anyone to act on them; delivery is at-least-once and unordered
//! across calls, so consumers must be idempotent.
//!
//! ## Brokers
//!
//! - [`NatsTriggerBroker`]: publishes each message to `{subject}.{CALL}` on NATS
//! - [`ChannelTriggerBroker`]: tokio broadcast channel for single-process runs
//!   and tests

use serde_json::Value;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::models::{ActionState, TriggerMessage, TriggerType};
use crate::{Result, SchedulerError};

#[async_trait::async_trait]
pub trait TriggerBroker: Send + Sync {
    async fn send_message(&self, message: &TriggerMessage) -> Result<()>;
}

/// NATS-backed broker
pub struct NatsTriggerBroker {
    client: async_nats::Client,
    subject: String,
}

impl NatsTriggerBroker {
    pub fn new(client: async_nats::Client, subject: impl Into<String>) -> Self {
        Self {
            client,
            subject: subject.into(),
        }
    }

    pub async fn connect(url: &str, subject: impl Into<String>) -> Result<Self> {
        let client = async_nats::connect(url)
            .await
            .map_err(|e| SchedulerError::ExternalService(format!("Failed to connect to NATS: {}", e)))?;
        info!(url = %url, "Connected to NATS");
        Ok(Self::new(client, subject))
    }

    pub fn subject_for(&self, message: &TriggerMessage) -> String {
        format!("{}.{}", self.subject, message.call_name())
    }

    /// Subscribe to every call published under this broker's subject
    pub async fn subscribe(&self) -> Result<async_nats::Subscriber> {
        self.client
            .subscribe(format!("{}.>", self.subject))
            .await
            .map_err(|e| SchedulerError::ExternalService(format!("Failed to subscribe: {}", e)))
    }
}

#[async_trait::async_trait]
impl TriggerBroker for NatsTriggerBroker {
    async fn send_message(&self, message: &TriggerMessage) -> Result<()> {
        let subject = self.subject_for(message);
        let payload = serde_json::to_vec(message)?;
        self.client
            .publish(subject.clone(), payload.into())
            .await
            .map_err(|e| SchedulerError::ExternalService(format!("Failed to publish to {}: {}", subject, e)))?;
        debug!(subject = %subject, "Published trigger message");
        Ok(())
    }
}

/// In-process broker
#[derive(Clone)]
pub struct ChannelTriggerBroker {
    sender: broadcast::Sender<TriggerMessage>,
}

impl ChannelTriggerBroker {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TriggerMessage> {
        self.sender.subscribe()
    }
}

impl Default for ChannelTriggerBroker {
    fn default() -> Self {
        Self::new(1000)
    }
}

#[async_trait::async_trait]
impl TriggerBroker for ChannelTriggerBroker {
    async fn send_message(&self, message: &TriggerMessage) -> Result<()> {
        // No subscribers is fine: nobody is listening yet
        let _ = self.sender.send(message.clone());
        Ok(())
    }
}

/// Typed entry points for every trigger call
#[derive(Clone)]
pub struct TriggerProxy {
    broker: Arc<dyn TriggerBroker>,
}

impl TriggerProxy {
    pub fn new(broker: Arc<dyn TriggerBroker>) -> Self {
        Self { broker }
    }

    pub async fn try_next_action(&self, datastore_id: &str, log_info: Option<Value>) -> Result<()> {
        self.broker
            .send_message(&TriggerMessage::TryNextAction {
                datastore_id: datastore_id.to_string(),
                log_info,
            })
            .await
    }

    pub async fn complete_action(
        &self,
        action_id: &str,
        action_state: ActionState,
        error_message: Option<String>,
    ) -> Result<()> {
        self.broker
            .send_message(&TriggerMessage::CompleteAction {
                action_id: action_id.to_string(),
                action_state,
                error_message,
            })
            .await
    }

    pub async fn process_trigger(&self, trigger_type: TriggerType, message: Value) -> Result<()> {
        self.broker
            .send_message(&TriggerMessage::ProcessTrigger {
                trigger_type_name: trigger_type.name().to_string(),
                message,
            })
            .await
    }

    pub async fn trigger_workflow_completion(&self, workflow_id: &str) -> Result<()> {
        self.broker
            .send_message(&TriggerMessage::workflow_completion(workflow_id))
            .await
    }

    pub async fn trigger_workflow_retry(&self, workflow_id: &str, retry_num: u32) -> Result<()> {
        self.broker
            .send_message(&TriggerMessage::workflow_retry(workflow_id, retry_num))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_proxy_sends_typed_envelopes() {
        let broker = ChannelTriggerBroker::default();
        let mut rx = broker.subscribe();
        let proxy = TriggerProxy::new(Arc::new(broker));

        proxy.try_next_action("ds1", None).await.unwrap();
        proxy
            .complete_action("a1", ActionState::Failed, Some("job failed".into()))
            .await
            .unwrap();
        proxy.trigger_workflow_retry("wf1", 1).await.unwrap();

        assert_eq!(
            rx.recv().await.unwrap(),
            TriggerMessage::TryNextAction {
                datastore_id: "ds1".into(),
                log_info: None
            }
        );
        match rx.recv().await.unwrap() {
            TriggerMessage::CompleteAction { action_id, action_state, .. } => {
                assert_eq!(action_id, "a1");
                assert_eq!(action_state, ActionState::Failed);
            }
            other => panic!("unexpected message {:?}", other),
        }
        assert_eq!(rx.recv().await.unwrap(), TriggerMessage::workflow_retry("wf1", 1));
    }

    #[tokio::test]
    async fn test_send_without_subscribers_is_ok() {
        let proxy = TriggerProxy::new(Arc::new(ChannelTriggerBroker::default()));
        proxy
            .process_trigger(TriggerType::WorkflowCompletion, json!({"workflow_id": "wf1"}))
            .await
            .unwrap();
    }
}
