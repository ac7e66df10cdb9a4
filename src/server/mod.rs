// Completion callback HTTP server

//! # Callback Server
//!
//! Running jobs report their status with
//!
//! ```text
//! PUT /action/state
//! [{"action_id": "...", "action_status": "SUCCEEDED",
//!   "workflow_instance_id": "...", "workflow_instance_status": "COMPLETED"}]
//! ```
//!
//! and get `200 {"result": "OK"}` back. Any failure answers
//! `501 {"result": "<error>"}`; senders retry until they see a 200.
//!
//! `GET /health` is a plain liveness check.

use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, put},
    Json, Router, Server,
};
use serde_json::{json, Value};
use std::future::Future;
use std::net::SocketAddr;
use tower_http::cors::CorsLayer;
use tracing::{error, info};

use crate::engine::completion::{ActionStatusUpdate, CompletionHandler};
use crate::{Result, SchedulerError};

#[derive(Debug, Clone)]
pub struct CallbackServerConfig {
    pub port: u16,
    pub cors_enabled: bool,
}

impl Default for CallbackServerConfig {
    fn default() -> Self {
        Self {
            port: 5000,
            cors_enabled: true,
        }
    }
}

/// Routes of the callback server, without binding a socket
pub fn router(handler: CompletionHandler, cors_enabled: bool) -> Router {
    let app = Router::new()
        .route("/action/state", put(update_action_state))
        .route("/health", get(health_check))
        .with_state(handler);

    if cors_enabled {
        app.layer(CorsLayer::permissive())
    } else {
        app
    }
}

pub struct CallbackServer {
    config: CallbackServerConfig,
    handler: CompletionHandler,
}

impl CallbackServer {
    /// Serve until `shutdown` resolves
    pub async fn run<S>(self, shutdown: S) -> Result<()>
    where
        S: Future<Output = ()> + Send + 'static,
    {
        let app = router(self.handler, self.config.cors_enabled);
        let addr = SocketAddr::from(([0, 0, 0, 0], self.config.port));

        info!("📬 Callback server listening on http://{}", addr);
        info!("🔗 Status endpoint: PUT http://localhost:{}/action/state", self.config.port);

        Server::try_bind(&addr)
            .map_err(|e| SchedulerError::ExternalService(format!("Failed to bind {}: {}", addr, e)))?
            .serve(app.into_make_service())
            .with_graceful_shutdown(shutdown)
            .await
            .map_err(|e| SchedulerError::ExternalService(format!("Callback server failed: {}", e)))?;

        info!("Callback server stopped");
        Ok(())
    }
}

pub struct CallbackServerBuilder {
    config: CallbackServerConfig,
    handler: CompletionHandler,
}

impl CallbackServerBuilder {
    pub fn new(handler: CompletionHandler) -> Self {
        Self {
            config: CallbackServerConfig::default(),
            handler,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    pub fn with_cors(mut self, enabled: bool) -> Self {
        self.config.cors_enabled = enabled;
        self
    }

    pub fn build(self) -> CallbackServer {
        CallbackServer {
            config: self.config,
            handler: self.handler,
        }
    }
}

async fn update_action_state(
    State(handler): State<CompletionHandler>,
    Json(updates): Json<Vec<ActionStatusUpdate>>,
) -> (StatusCode, Json<Value>) {
    match handler.apply(&updates).await {
        Ok(()) => (StatusCode::OK, Json(json!({ "result": "OK" }))),
        Err(e) => {
            error!(updates = updates.len(), "Failed to apply status callback: {}", e);
            (StatusCode::NOT_IMPLEMENTED, Json(json!({ "result": e.to_string() })))
        }
    }
}

async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "Action scheduler callback server is running")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::storage::{InMemoryStateStore, StateStore};
    use crate::engine::triggers::{ChannelTriggerBroker, TriggerProxy};
    use crate::models::{Action, ActionState};
    use axum::body::{Body, HttpBody};
    use axum::http::Request;
    use std::sync::Arc;
    use tower::ServiceExt;

    fn app(store: Arc<InMemoryStateStore>) -> Router {
        let triggers = TriggerProxy::new(Arc::new(ChannelTriggerBroker::default()));
        router(CompletionHandler::new(store, triggers), false)
    }

    fn put_state(body: Value) -> Request<Body> {
        Request::builder()
            .method("PUT")
            .uri("/action/state")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn json_body(response: axum::response::Response) -> Value {
        let mut body = response.into_body();
        let mut bytes = Vec::new();
        while let Some(chunk) = body.data().await {
            bytes.extend_from_slice(&chunk.unwrap());
        }
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_put_action_state_applies_update() {
        let store = Arc::new(InMemoryStateStore::new());
        let action = store
            .create_action(Action::new("load", "redshift_engine", "ds", 0).with_state(ActionState::Pending))
            .await
            .unwrap();

        let response = app(store.clone())
            .oneshot(put_state(json!([{ "action_id": action.id, "action_status": "RUNNING" }])))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await, json!({ "result": "OK" }));
        let stored = store.get_action(&action.id).await.unwrap().unwrap();
        assert_eq!(stored.state, ActionState::Running);
    }

    #[tokio::test]
    async fn test_failed_update_answers_501() {
        let store = Arc::new(InMemoryStateStore::new());

        let response = app(store)
            .oneshot(put_state(json!([{ "action_id": "missing", "action_status": "RUNNING" }])))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_IMPLEMENTED);
        let body = json_body(response).await;
        assert!(body["result"].as_str().unwrap().contains("missing"));
    }

    #[tokio::test]
    async fn test_health() {
        let response = app(Arc::new(InMemoryStateStore::new()))
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
