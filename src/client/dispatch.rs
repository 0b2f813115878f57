//! Routing of agent-initiated traffic
//!
//! Requests (`tool.call`, `permission.request`, `userInput.request`) are
//! answered on their own task by the RPC layer. Notifications
//! (`session.event`, `session.lifecycle`) are delivered inline, in arrival
//! order, to the registered listeners.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::listeners::Listeners;
use crate::rpc::jsonrpc_utils::{self, error_codes};
use crate::rpc::{InboundHandler, JsonRpcErrorObject};
use crate::session::{Session, SessionRegistry};
use crate::tools::ToolInvocation;
use crate::types::{PermissionRequest, SessionEvent, SessionLifecycleEvent, UserInputRequest};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ToolCallParams {
    session_id: String,
    tool_call_id: String,
    tool_name: String,
    #[serde(default)]
    arguments: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PermissionParams {
    session_id: String,
    permission_request: PermissionRequest,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UserInputParams {
    session_id: String,
    #[serde(flatten)]
    request: UserInputRequest,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionEventParams {
    session_id: String,
    event: SessionEvent,
}

pub(crate) struct Dispatcher {
    sessions: Arc<SessionRegistry>,
    lifecycle: Arc<Listeners<SessionLifecycleEvent>>,
}

impl Dispatcher {
    pub fn new(
        sessions: Arc<SessionRegistry>,
        lifecycle: Arc<Listeners<SessionLifecycleEvent>>,
    ) -> Self {
        Self {
            sessions,
            lifecycle,
        }
    }

    fn session(&self, session_id: &str) -> Result<Session, JsonRpcErrorObject> {
        self.sessions.get(session_id).ok_or_else(|| {
            jsonrpc_utils::error_object(
                error_codes::INVALID_PARAMS,
                format!("Unknown session {session_id}"),
            )
        })
    }

    async fn tool_call(&self, params: Value) -> Result<Value, JsonRpcErrorObject> {
        let params: ToolCallParams =
            serde_json::from_value(params).map_err(jsonrpc_utils::invalid_params)?;
        let session = self.session(&params.session_id)?;

        let result = session
            .handle_tool_call(ToolInvocation {
                session_id: params.session_id,
                tool_call_id: params.tool_call_id,
                tool_name: params.tool_name,
                arguments: params.arguments,
            })
            .await;
        Ok(json!({ "result": result }))
    }

    async fn permission_request(&self, params: Value) -> Result<Value, JsonRpcErrorObject> {
        let params: PermissionParams =
            serde_json::from_value(params).map_err(jsonrpc_utils::invalid_params)?;
        let session = self.session(&params.session_id)?;

        let decision = session
            .handle_permission_request(params.permission_request)
            .await;
        Ok(json!({ "result": decision }))
    }

    async fn user_input_request(&self, params: Value) -> Result<Value, JsonRpcErrorObject> {
        let params: UserInputParams =
            serde_json::from_value(params).map_err(jsonrpc_utils::invalid_params)?;
        let session = self.session(&params.session_id)?;

        let response = session
            .handle_user_input(params.request)
            .await
            .map_err(|e| jsonrpc_utils::error_object(error_codes::INTERNAL_ERROR, e.message()))?;
        serde_json::to_value(response).map_err(|e| {
            jsonrpc_utils::error_object(error_codes::INTERNAL_ERROR, e.to_string())
        })
    }

    fn session_event(&self, params: Value) {
        let params: SessionEventParams = match serde_json::from_value(params) {
            Ok(params) => params,
            Err(e) => {
                warn!("Dropping malformed session.event: {}", e);
                return;
            }
        };
        match self.sessions.get(&params.session_id) {
            Some(session) => session.dispatch_event(&params.event),
            None => debug!(
                "Event {} for unknown session {}",
                params.event.event_type, params.session_id
            ),
        }
    }

    fn lifecycle_event(&self, params: Value) {
        match serde_json::from_value::<SessionLifecycleEvent>(params) {
            Ok(event) => self.lifecycle.emit(&event),
            Err(e) => warn!("Dropping malformed session.lifecycle: {}", e),
        }
    }
}

#[async_trait]
impl InboundHandler for Dispatcher {
    async fn handle_request(&self, method: &str, params: Value) -> Result<Value, JsonRpcErrorObject> {
        match method {
            "tool.call" => self.tool_call(params).await,
            "permission.request" => self.permission_request(params).await,
            "userInput.request" => self.user_input_request(params).await,
            _ => {
                debug!("No handler for agent request {}", method);
                Err(jsonrpc_utils::method_not_found(method))
            }
        }
    }

    fn handle_notification(&self, method: &str, params: Value) {
        match method {
            "session.event" => self.session_event(params),
            "session.lifecycle" => self.lifecycle_event(params),
            _ => debug!("Ignoring notification {}", method),
        }
    }
}
