//! Sessions hosted by the agent
//!
//! A [`Session`] is a cheap, cloneable handle bound to one connection. Its
//! RPCs are plain requests carrying `sessionId`; inbound events, tool calls,
//! permission and user-input requests for the session are routed here by the
//! client's dispatcher.

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::client::ConnectionState;
use crate::error::{ClientError, Result};
use crate::listeners::{ListenerId, Listeners};
use crate::rpc::JsonRpcClient;
use crate::tools::{BoxFuture, Tool, ToolDefinition, ToolError, ToolInvocation};
use crate::types::{
    CustomAgentConfig, FileContentResponse, FileListResponse, McpServerConfig, MessageOptions,
    MessagesResponse, Mode, ModeResponse, ModelSelection, PermissionDecision, PermissionRequest,
    PlanReadResult, ProviderConfig, ReasoningEffort, SendResponse, SessionEvent,
    SystemMessageConfig, ToolResultObject, UserInputRequest, UserInputResponse,
};

// ============================================================================
// Callbacks
// ============================================================================

type PermissionFn = dyn Fn(PermissionRequest, String) -> BoxFuture<Result<PermissionDecision, ToolError>>
    + Send
    + Sync;

/// Decides `permission.request` calls. Receives the request and session id.
#[derive(Clone)]
pub struct PermissionHandler(Arc<PermissionFn>);

impl PermissionHandler {
    pub fn new<F, Fut>(handler: F) -> Self
    where
        F: Fn(PermissionRequest, String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<PermissionDecision, ToolError>> + Send + 'static,
    {
        Self(Arc::new(move |request, session_id| {
            Box::pin(handler(request, session_id))
        }))
    }

    pub fn approve_all() -> Self {
        Self::new(|_, _| async { Ok(PermissionDecision::approved()) })
    }
}

impl fmt::Debug for PermissionHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PermissionHandler")
    }
}

type UserInputFn =
    dyn Fn(UserInputRequest, String) -> BoxFuture<Result<UserInputResponse, ToolError>> + Send + Sync;

/// Answers `userInput.request` calls
#[derive(Clone)]
pub struct UserInputHandler(Arc<UserInputFn>);

impl UserInputHandler {
    pub fn new<F, Fut>(handler: F) -> Self
    where
        F: Fn(UserInputRequest, String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<UserInputResponse, ToolError>> + Send + 'static,
    {
        Self(Arc::new(move |request, session_id| {
            Box::pin(handler(request, session_id))
        }))
    }
}

impl fmt::Debug for UserInputHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("UserInputHandler")
    }
}

// ============================================================================
// Configuration
// ============================================================================

/// Options for `create_session` and `resume_session`
#[derive(Debug, Clone, Default)]
pub struct SessionConfig {
    /// Requested id; the agent picks one when unset. Ignored on resume.
    pub session_id: Option<String>,
    pub model: Option<String>,
    pub reasoning_effort: Option<ReasoningEffort>,
    /// Tools this client serves for the session
    pub tools: Vec<Tool>,
    pub system_message: Option<SystemMessageConfig>,
    pub available_tools: Option<Vec<String>>,
    pub excluded_tools: Option<Vec<String>>,
    pub provider: Option<ProviderConfig>,
    pub working_directory: Option<PathBuf>,
    pub streaming: Option<bool>,
    pub mcp_servers: Option<HashMap<String, McpServerConfig>>,
    pub custom_agents: Option<Vec<CustomAgentConfig>>,
    pub client_name: Option<String>,
    /// Resume only: attach without replaying the session's history
    pub disable_resume: bool,
    pub on_permission_request: Option<PermissionHandler>,
    pub on_user_input_request: Option<UserInputHandler>,
}

impl SessionConfig {
    pub(crate) fn to_request<'a>(
        &'a self,
        session_id: Option<&'a str>,
        resume: bool,
    ) -> SessionRequest<'a> {
        SessionRequest {
            session_id,
            model: self.model.as_deref(),
            reasoning_effort: self.reasoning_effort,
            tools: (!self.tools.is_empty())
                .then(|| self.tools.iter().map(Tool::definition).collect()),
            system_message: self.system_message.as_ref(),
            available_tools: self.available_tools.as_deref(),
            excluded_tools: crate::tools::merge_excluded_tools(
                self.excluded_tools.as_deref(),
                &self.tools,
            ),
            provider: self.provider.as_ref(),
            working_directory: self.working_directory.as_ref(),
            streaming: self.streaming,
            mcp_servers: self.mcp_servers.as_ref(),
            custom_agents: self.custom_agents.as_deref(),
            client_name: self.client_name.as_deref(),
            request_permission: self.on_permission_request.is_some(),
            request_user_input: self.on_user_input_request.is_some(),
            disable_resume: (resume && self.disable_resume).then_some(true),
        }
    }
}

/// Params of `session.create` / `session.resume`
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct SessionRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning_effort: Option<ReasoningEffort>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<ToolDefinition<'a>>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_message: Option<&'a SystemMessageConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub available_tools: Option<&'a [String]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub excluded_tools: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<&'a ProviderConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub working_directory: Option<&'a PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub streaming: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mcp_servers: Option<&'a HashMap<String, McpServerConfig>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub custom_agents: Option<&'a [CustomAgentConfig]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_name: Option<&'a str>,
    pub request_permission: bool,
    pub request_user_input: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disable_resume: Option<bool>,
}

// ============================================================================
// Registry
// ============================================================================

/// Open sessions of one client, keyed by id
#[derive(Default)]
pub(crate) struct SessionRegistry {
    sessions: Mutex<HashMap<String, Session>>,
}

impl SessionRegistry {
    pub fn insert(&self, session: Session) {
        if let Ok(mut sessions) = self.sessions.lock() {
            sessions.insert(session.id().to_string(), session);
        }
    }

    pub fn get(&self, session_id: &str) -> Option<Session> {
        self.sessions.lock().ok()?.get(session_id).cloned()
    }

    pub fn remove(&self, session_id: &str) -> Option<Session> {
        self.sessions.lock().ok()?.remove(session_id)
    }

    /// Take every session out of the registry
    pub fn drain(&self) -> Vec<Session> {
        self.sessions
            .lock()
            .map(|mut sessions| sessions.drain().map(|(_, session)| session).collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().map(|sessions| sessions.len()).unwrap_or(0)
    }
}

// ============================================================================
// Session
// ============================================================================

struct SessionInner {
    id: String,
    workspace_path: Option<String>,
    rpc: Arc<JsonRpcClient>,
    state: watch::Receiver<ConnectionState>,
    registry: Weak<SessionRegistry>,
    tools: HashMap<String, Tool>,
    listeners: Listeners<SessionEvent>,
    permission_handler: Option<PermissionHandler>,
    user_input_handler: Option<UserInputHandler>,
}

/// Handle to one agent session
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.inner.id)
            .field("workspace_path", &self.inner.workspace_path)
            .field("tools", &self.inner.tools.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl Session {
    pub(crate) fn new(
        id: String,
        workspace_path: Option<String>,
        config: &SessionConfig,
        rpc: Arc<JsonRpcClient>,
        state: watch::Receiver<ConnectionState>,
        registry: &Arc<SessionRegistry>,
    ) -> Self {
        let tools = config
            .tools
            .iter()
            .map(|tool| (tool.name().to_string(), tool.clone()))
            .collect();

        Self {
            inner: Arc::new(SessionInner {
                id,
                workspace_path,
                rpc,
                state,
                registry: Arc::downgrade(registry),
                tools,
                listeners: Listeners::new(),
                permission_handler: config.on_permission_request.clone(),
                user_input_handler: config.on_user_input_request.clone(),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Directory the agent keeps the session's files in, when it has one
    pub fn workspace_path(&self) -> Option<&str> {
        self.inner.workspace_path.as_deref()
    }

    fn connected_rpc(&self) -> Result<&JsonRpcClient> {
        let state = *self.inner.state.borrow();
        if state != ConnectionState::Connected {
            return Err(ClientError::NotConnected { state });
        }
        Ok(&self.inner.rpc)
    }

    /// `{"sessionId": id}` merged with the fields of `extra`
    fn params(&self, extra: Value) -> Value {
        let mut params = json!({ "sessionId": self.inner.id });
        if let (Value::Object(target), Value::Object(extra)) = (&mut params, extra) {
            target.extend(extra);
        }
        params
    }

    async fn call<R: DeserializeOwned>(&self, method: &str, extra: Value) -> Result<R> {
        let rpc = self.connected_rpc()?;
        Ok(rpc.request(method, &self.params(extra)).await?)
    }

    // ------------------------------------------------------------------------
    // Conversation
    // ------------------------------------------------------------------------

    /// Queue a message; returns the agent's message id
    pub async fn send(&self, message: MessageOptions) -> Result<String> {
        let extra = serde_json::to_value(&message)
            .map_err(crate::rpc::JsonRpcError::Serialization)?;
        let response: SendResponse = self.call("session.send", extra).await?;
        Ok(response.message_id)
    }

    /// Send a message and wait until the session goes idle. Returns the last
    /// `assistant.message` seen, if any. A `session.error` event fails the
    /// wait.
    pub async fn send_and_wait(
        &self,
        message: MessageOptions,
        timeout: Duration,
    ) -> Result<Option<SessionEvent>> {
        let (sender, mut receiver) = mpsc::unbounded_channel();
        let listener = self.on(move |event: &SessionEvent| {
            if matches!(
                event.event_type.as_str(),
                SessionEvent::ASSISTANT_MESSAGE
                    | SessionEvent::SESSION_IDLE
                    | SessionEvent::SESSION_ERROR
            ) {
                let _ = sender.send(event.clone());
            }
        });

        let exchange = async {
            self.send(message).await?;
            let mut last_message = None;
            while let Some(event) = receiver.recv().await {
                match event.event_type.as_str() {
                    SessionEvent::SESSION_IDLE => return Ok(last_message),
                    SessionEvent::SESSION_ERROR => {
                        let reason = event
                            .data
                            .get("message")
                            .and_then(Value::as_str)
                            .unwrap_or("unknown error");
                        return Err(ClientError::Session(reason.to_string()));
                    }
                    _ => last_message = Some(event),
                }
            }
            Err(ClientError::Session(
                "session closed while waiting for idle".to_string(),
            ))
        };

        let outcome = tokio::time::timeout(timeout, exchange).await;
        self.off(listener);
        outcome.unwrap_or(Err(ClientError::Timeout(timeout)))
    }

    /// Abort the turn in progress
    pub async fn abort(&self) -> Result<()> {
        let _: Value = self.call("session.abort", Value::Null).await?;
        Ok(())
    }

    /// Full event history of the session
    pub async fn get_messages(&self) -> Result<Vec<SessionEvent>> {
        let response: MessagesResponse = self.call("session.getMessages", Value::Null).await?;
        Ok(response.events)
    }

    /// Destroy the session on the agent and release local handlers
    pub async fn destroy(&self) -> Result<()> {
        self.connected_rpc()?;
        self.destroy_remote().await
    }

    /// `session.destroy` without the state check, for use during `stop()`
    pub(crate) async fn destroy_remote(&self) -> Result<()> {
        let params = json!({ "sessionId": self.inner.id });
        match self
            .inner
            .rpc
            .request::<_, Value>("session.destroy", &params)
            .await
        {
            Ok(_) => {
                info!("Destroyed session {}", self.inner.id);
                self.release();
                Ok(())
            }
            Err(source) => Err(ClientError::SessionDestroy {
                session_id: self.inner.id.clone(),
                source,
            }),
        }
    }

    /// Forget the session locally
    pub(crate) fn release(&self) {
        self.inner.listeners.clear();
        if let Some(registry) = self.inner.registry.upgrade() {
            registry.remove(&self.inner.id);
        }
    }

    // ------------------------------------------------------------------------
    // Events
    // ------------------------------------------------------------------------

    /// Register an event listener
    pub fn on<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&SessionEvent) + Send + Sync + 'static,
    {
        self.inner.listeners.add(listener)
    }

    pub fn off(&self, id: ListenerId) -> bool {
        self.inner.listeners.remove(id)
    }

    pub(crate) fn dispatch_event(&self, event: &SessionEvent) {
        debug!("Session {} event {}", self.inner.id, event.event_type);
        self.inner.listeners.emit(event);
    }

    // ------------------------------------------------------------------------
    // Inbound calls
    // ------------------------------------------------------------------------

    pub(crate) async fn handle_tool_call(&self, invocation: ToolInvocation) -> ToolResultObject {
        match self.inner.tools.get(&invocation.tool_name) {
            Some(tool) => tool.invoke(invocation).await,
            None => {
                warn!(
                    "Session {} has no tool named {}",
                    self.inner.id, invocation.tool_name
                );
                crate::tools::unsupported_tool_result(&invocation.tool_name)
            }
        }
    }

    /// A missing, failing or panicking handler denies the request
    pub(crate) async fn handle_permission_request(
        &self,
        request: PermissionRequest,
    ) -> PermissionDecision {
        let Some(handler) = &self.inner.permission_handler else {
            return PermissionDecision::denied();
        };
        match tokio::spawn((handler.0)(request, self.inner.id.clone())).await {
            Ok(Ok(decision)) => decision,
            Ok(Err(error)) => {
                warn!("Permission handler failed: {}", error);
                PermissionDecision::denied()
            }
            Err(join_error) => {
                warn!("Permission handler crashed: {}", join_error);
                PermissionDecision::denied()
            }
        }
    }

    pub(crate) async fn handle_user_input(
        &self,
        request: UserInputRequest,
    ) -> Result<UserInputResponse, ToolError> {
        let Some(handler) = &self.inner.user_input_handler else {
            return Err(ToolError::new(
                "User input requested but no handler registered",
            ));
        };
        match tokio::spawn((handler.0)(request, self.inner.id.clone())).await {
            Ok(outcome) => outcome,
            Err(join_error) => Err(ToolError::new(format!(
                "user input handler failed: {join_error}"
            ))),
        }
    }

    // ------------------------------------------------------------------------
    // Scoped APIs
    // ------------------------------------------------------------------------

    pub fn mode(&self) -> ModeApi<'_> {
        ModeApi { session: self }
    }

    pub fn plan(&self) -> PlanApi<'_> {
        PlanApi { session: self }
    }

    pub fn workspace(&self) -> WorkspaceApi<'_> {
        WorkspaceApi { session: self }
    }

    pub fn model(&self) -> ModelApi<'_> {
        ModelApi { session: self }
    }
}

/// `session.mode.*`
pub struct ModeApi<'a> {
    session: &'a Session,
}

impl ModeApi<'_> {
    pub async fn get(&self) -> Result<Mode> {
        let response: ModeResponse = self.session.call("session.mode.get", Value::Null).await?;
        Ok(response.mode)
    }

    pub async fn set(&self, mode: Mode) -> Result<Mode> {
        let response: ModeResponse = self
            .session
            .call("session.mode.set", json!({ "mode": mode }))
            .await?;
        Ok(response.mode)
    }
}

/// `session.plan.*`
pub struct PlanApi<'a> {
    session: &'a Session,
}

impl PlanApi<'_> {
    pub async fn read(&self) -> Result<PlanReadResult> {
        self.session.call("session.plan.read", Value::Null).await
    }

    pub async fn update(&self, content: &str) -> Result<()> {
        let _: Value = self
            .session
            .call("session.plan.update", json!({ "content": content }))
            .await?;
        Ok(())
    }

    pub async fn delete(&self) -> Result<()> {
        let _: Value = self.session.call("session.plan.delete", Value::Null).await?;
        Ok(())
    }
}

/// `session.workspace.*`; paths are relative to the session workspace
pub struct WorkspaceApi<'a> {
    session: &'a Session,
}

impl WorkspaceApi<'_> {
    pub async fn list_files(&self) -> Result<Vec<String>> {
        let response: FileListResponse = self
            .session
            .call("session.workspace.listFiles", Value::Null)
            .await?;
        Ok(response.files)
    }

    pub async fn read_file(&self, path: &str) -> Result<String> {
        let response: FileContentResponse = self
            .session
            .call("session.workspace.readFile", json!({ "path": path }))
            .await?;
        Ok(response.content)
    }

    pub async fn create_file(&self, path: &str, content: &str) -> Result<()> {
        let _: Value = self
            .session
            .call(
                "session.workspace.createFile",
                json!({ "path": path, "content": content }),
            )
            .await?;
        Ok(())
    }
}

/// `session.model.*`
pub struct ModelApi<'a> {
    session: &'a Session,
}

impl ModelApi<'_> {
    pub async fn get_current(&self) -> Result<Option<String>> {
        let response: ModelSelection = self
            .session
            .call("session.model.getCurrent", Value::Null)
            .await?;
        Ok(response.model_id)
    }

    pub async fn switch_to(&self, model_id: &str) -> Result<Option<String>> {
        let response: ModelSelection = self
            .session
            .call("session.model.switchTo", json!({ "modelId": model_id }))
            .await?;
        Ok(response.model_id)
    }
}
