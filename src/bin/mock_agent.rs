//! Scripted agent speaking the client protocol over stdio or TCP.
//!
//! Accepts the same flags the client passes to a real agent, keeps sessions
//! in memory, echoes prompts back as assistant messages, and exposes a few
//! `test.*` methods that make it call back into the client.

use agent_rpc::io::StreamTransport;
use agent_rpc::logging::{LogConfig, init_logging};
use agent_rpc::rpc::jsonrpc_utils::{self, error_codes};
use agent_rpc::rpc::{InboundHandler, JsonRpcClient, JsonRpcErrorObject};
use agent_rpc::types::SDK_PROTOCOL_VERSION;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use clap::Parser;
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::io::AsyncReadExt;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

#[derive(Parser, Debug)]
#[command(name = "mock-agent", version, about = "Scripted agent for protocol tests")]
struct Args {
    /// Serve JSON-RPC over stdin/stdout
    #[arg(long)]
    stdio: bool,

    /// TCP port when not in stdio mode; 0 picks a free one
    #[arg(long, default_value_t = 0)]
    port: u16,

    #[arg(long)]
    headless: bool,

    #[arg(long)]
    no_auto_update: bool,

    #[arg(long)]
    no_auto_login: bool,

    /// Environment variable holding the auth token
    #[arg(long, value_name = "VAR")]
    auth_token_env: Option<String>,

    #[arg(long, default_value = "info")]
    log_level: String,

    /// Protocol version reported by `ping`
    #[arg(long, default_value_t = SDK_PROTOCOL_VERSION)]
    protocol_version: u32,
}

#[derive(Debug)]
struct MockSession {
    config: Value,
    active: bool,
    mode: String,
    model: Option<String>,
    plan: Option<String>,
    files: BTreeMap<String, String>,
    events: Vec<Value>,
    started: DateTime<Utc>,
    modified: DateTime<Utc>,
}

impl MockSession {
    fn new(config: Value) -> Self {
        let now = Utc::now();
        let model = config
            .get("model")
            .and_then(Value::as_str)
            .map(str::to_string);
        Self {
            config,
            active: true,
            mode: "interactive".to_string(),
            model,
            plan: None,
            files: BTreeMap::new(),
            events: Vec::new(),
            started: now,
            modified: now,
        }
    }

    fn record(&mut self, event_type: &str, data: Value) -> Value {
        let event = json!({
            "id": uuid::Uuid::new_v4().to_string(),
            "type": event_type,
            "timestamp": Utc::now().to_rfc3339(),
            "data": data,
        });
        self.events.push(event.clone());
        self.modified = Utc::now();
        event
    }
}

type RpcResult = Result<Value, JsonRpcErrorObject>;

struct MockAgent {
    protocol_version: u32,
    authenticated: bool,
    /// Connection currently being served
    peer: Mutex<Weak<JsonRpcClient>>,
    sessions: Mutex<BTreeMap<String, MockSession>>,
    last_session: Mutex<Option<String>>,
    foreground: Mutex<Option<String>>,
    models_list_calls: AtomicUsize,
}

fn string_param(params: &Value, name: &str) -> Result<String, JsonRpcErrorObject> {
    params
        .get(name)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| jsonrpc_utils::invalid_params(format!("missing string parameter '{name}'")))
}

fn not_found(what: impl std::fmt::Display) -> JsonRpcErrorObject {
    jsonrpc_utils::error_object(error_codes::INVALID_PARAMS, what.to_string())
}

impl MockAgent {
    fn new(protocol_version: u32, authenticated: bool) -> Self {
        Self {
            protocol_version,
            authenticated,
            peer: Mutex::new(Weak::new()),
            sessions: Mutex::new(BTreeMap::new()),
            last_session: Mutex::new(None),
            foreground: Mutex::new(None),
            models_list_calls: AtomicUsize::new(0),
        }
    }

    fn attach(&self, peer: &Arc<JsonRpcClient>) {
        if let Ok(mut slot) = self.peer.lock() {
            *slot = Arc::downgrade(peer);
        }
    }

    fn peer(&self) -> Result<Arc<JsonRpcClient>, JsonRpcErrorObject> {
        self.peer
            .lock()
            .ok()
            .and_then(|peer| peer.upgrade())
            .ok_or_else(|| {
                jsonrpc_utils::error_object(error_codes::INTERNAL_ERROR, "no client connected")
            })
    }

    fn notify(&self, method: &str, params: Value) {
        match self.peer() {
            Ok(peer) => {
                if let Err(e) = peer.notify(method, &params) {
                    warn!("Failed to send {}: {}", method, e);
                }
            }
            Err(_) => debug!("Dropping {} without a client", method),
        }
    }

    /// Run `f` on an active session
    fn with_session<T>(
        &self,
        params: &Value,
        f: impl FnOnce(&mut MockSession) -> Result<T, JsonRpcErrorObject>,
    ) -> Result<T, JsonRpcErrorObject> {
        let session_id = string_param(params, "sessionId")?;
        let mut sessions = self
            .sessions
            .lock()
            .map_err(|_| jsonrpc_utils::error_object(error_codes::INTERNAL_ERROR, "state poisoned"))?;
        match sessions.get_mut(&session_id) {
            Some(session) if session.active => f(session),
            _ => Err(not_found(format!("Session not found: {session_id}"))),
        }
    }

    fn ping(&self, params: &Value) -> RpcResult {
        let message = params.get("message").and_then(Value::as_str).unwrap_or("");
        Ok(json!({
            "message": format!("pong: {message}"),
            "timestamp": Utc::now().timestamp_millis(),
            "protocolVersion": self.protocol_version,
        }))
    }

    fn list_models(&self) -> RpcResult {
        self.models_list_calls.fetch_add(1, Ordering::SeqCst);
        Ok(json!({
            "models": [
                {
                    "id": "mock-small",
                    "name": "Mock Small",
                    "capabilities": {
                        "supports": {"vision": false, "reasoningEffort": false},
                        "limits": {"max_context_window_tokens": 32000}
                    }
                },
                {
                    "id": "mock-large",
                    "name": "Mock Large",
                    "capabilities": {
                        "supports": {"vision": true, "reasoningEffort": true},
                        "limits": {"max_context_window_tokens": 200000, "max_output_tokens": 16000}
                    },
                    "policy": {"state": "enabled", "terms": ""},
                    "billing": {"multiplier": 1.0},
                    "supportedReasoningEfforts": ["low", "medium", "high"],
                    "defaultReasoningEffort": "medium"
                }
            ]
        }))
    }

    fn create_session(&self, params: Value) -> RpcResult {
        let session_id = params
            .get("sessionId")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        if let Ok(mut sessions) = self.sessions.lock() {
            sessions.insert(session_id.clone(), MockSession::new(params));
        }
        self.remember(&session_id);
        self.notify(
            "session.lifecycle",
            json!({"type": "session.created", "sessionId": session_id}),
        );
        info!("Created session {}", session_id);

        Ok(json!({
            "sessionId": session_id,
            "workspacePath": format!("/tmp/mock-agent/{session_id}"),
        }))
    }

    fn resume_session(&self, params: Value) -> RpcResult {
        let session_id = string_param(&params, "sessionId")?;
        if let Ok(mut sessions) = self.sessions.lock() {
            sessions
                .entry(session_id.clone())
                .and_modify(|session| {
                    session.active = true;
                    session.config = params.clone();
                })
                .or_insert_with(|| MockSession::new(params.clone()));
        }
        self.remember(&session_id);
        self.notify(
            "session.lifecycle",
            json!({"type": "session.updated", "sessionId": session_id}),
        );
        Ok(json!({ "sessionId": session_id }))
    }

    fn remember(&self, session_id: &str) {
        if let Ok(mut last) = self.last_session.lock() {
            *last = Some(session_id.to_string());
        }
    }

    fn destroy_session(&self, params: &Value) -> RpcResult {
        self.with_session(params, |session| {
            session.active = false;
            Ok(json!({}))
        })
    }

    fn delete_session(&self, params: &Value) -> RpcResult {
        let session_id = string_param(params, "sessionId")?;
        let removed = self
            .sessions
            .lock()
            .map(|mut sessions| sessions.remove(&session_id).is_some())
            .unwrap_or(false);
        if !removed {
            return Ok(json!({"success": false, "error": format!("Session not found: {session_id}")}));
        }
        self.notify(
            "session.lifecycle",
            json!({"type": "session.deleted", "sessionId": session_id}),
        );
        Ok(json!({"success": true}))
    }

    fn list_sessions(&self) -> RpcResult {
        let sessions = self
            .sessions
            .lock()
            .map(|sessions| {
                sessions
                    .iter()
                    .map(|(id, session)| {
                        json!({
                            "sessionId": id,
                            "startTime": session.started.to_rfc3339(),
                            "modifiedTime": session.modified.to_rfc3339(),
                            "summary": session.events.iter().find_map(|event| {
                                event["data"]["content"].as_str().map(str::to_string)
                            }),
                            "isRemote": false,
                        })
                    })
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();
        Ok(json!({ "sessions": sessions }))
    }

    fn set_foreground(&self, params: &Value) -> RpcResult {
        let session_id = string_param(params, "sessionId")?;
        let known = self
            .sessions
            .lock()
            .map(|sessions| sessions.contains_key(&session_id))
            .unwrap_or(false);
        if !known {
            return Ok(json!({"success": false, "error": format!("Unknown session {session_id}")}));
        }
        if let Ok(mut foreground) = self.foreground.lock() {
            *foreground = Some(session_id);
        }
        Ok(json!({"success": true}))
    }

    fn send(&self, params: &Value) -> RpcResult {
        let prompt = string_param(params, "prompt")?;
        let session_id = string_param(params, "sessionId")?;
        let (reply, idle) = self.with_session(params, |session| {
            session.record("user.message", json!({"content": prompt}));
            let reply = session.record(
                "assistant.message",
                json!({"content": format!("echo: {prompt}")}),
            );
            let idle = session.record("session.idle", json!({}));
            Ok((reply, idle))
        })?;

        for event in [reply, idle] {
            self.notify(
                "session.event",
                json!({"sessionId": session_id, "event": event}),
            );
        }
        Ok(json!({ "messageId": uuid::Uuid::new_v4().to_string() }))
    }

    fn set_mode(&self, params: &Value) -> RpcResult {
        let mode = string_param(params, "mode")?;
        if !matches!(mode.as_str(), "interactive" | "plan" | "autopilot") {
            return Err(jsonrpc_utils::invalid_params(format!("unknown mode '{mode}'")));
        }
        self.with_session(params, |session| {
            session.mode = mode.clone();
            Ok(json!({ "mode": mode }))
        })
    }

    /// Ask the client to run one of its tools and return its answer verbatim
    async fn invoke_client_tool(&self, params: &Value) -> RpcResult {
        let peer = self.peer()?;
        let call = json!({
            "sessionId": string_param(params, "sessionId")?,
            "toolCallId": uuid::Uuid::new_v4().to_string(),
            "toolName": string_param(params, "toolName")?,
            "arguments": params.get("arguments").cloned().unwrap_or(json!({})),
        });
        peer.request_value("tool.call", call)
            .await
            .map_err(|e| jsonrpc_utils::error_object(error_codes::INTERNAL_ERROR, e.to_string()))
    }

    async fn request_client_permission(&self, params: &Value) -> RpcResult {
        let peer = self.peer()?;
        let request = json!({
            "sessionId": string_param(params, "sessionId")?,
            "permissionRequest": params.get("permissionRequest").cloned().unwrap_or(json!({"kind": "shell"})),
        });
        peer.request_value("permission.request", request)
            .await
            .map_err(|e| jsonrpc_utils::error_object(error_codes::INTERNAL_ERROR, e.to_string()))
    }
}

#[async_trait]
impl InboundHandler for MockAgent {
    async fn handle_request(&self, method: &str, params: Value) -> RpcResult {
        debug!("mock-agent <- {}", method);
        match method {
            "ping" => self.ping(&params),
            "status.get" => Ok(json!({
                "version": env!("CARGO_PKG_VERSION"),
                "protocolVersion": self.protocol_version,
            })),
            "auth.getStatus" => Ok(if self.authenticated {
                json!({"isAuthenticated": true, "authType": "token", "login": "mock-user"})
            } else {
                json!({"isAuthenticated": false, "statusMessage": "no credentials configured"})
            }),
            "models.list" => self.list_models(),

            "session.create" => self.create_session(params),
            "session.resume" => self.resume_session(params),
            "session.destroy" => self.destroy_session(&params),
            "session.delete" => self.delete_session(&params),
            "session.list" => self.list_sessions(),
            "session.getLastId" => Ok(json!({
                "sessionId": self.last_session.lock().ok().and_then(|last| last.clone())
            })),
            "session.getForeground" => Ok(json!({
                "sessionId": self.foreground.lock().ok().and_then(|fg| fg.clone())
            })),
            "session.setForeground" => self.set_foreground(&params),

            "session.send" => self.send(&params),
            "session.abort" => self.with_session(&params, |session| {
                session.record("abort", json!({}));
                Ok(json!({}))
            }),
            "session.getMessages" => {
                self.with_session(&params, |session| Ok(json!({ "events": session.events })))
            }

            "session.mode.get" => {
                self.with_session(&params, |session| Ok(json!({ "mode": session.mode })))
            }
            "session.mode.set" => self.set_mode(&params),

            "session.plan.read" => self.with_session(&params, |session| {
                Ok(json!({"exists": session.plan.is_some(), "content": session.plan}))
            }),
            "session.plan.update" => {
                let content = string_param(&params, "content")?;
                self.with_session(&params, |session| {
                    session.plan = Some(content);
                    Ok(json!({}))
                })
            }
            "session.plan.delete" => self.with_session(&params, |session| {
                session.plan = None;
                Ok(json!({}))
            }),

            "session.workspace.listFiles" => self.with_session(&params, |session| {
                Ok(json!({ "files": session.files.keys().collect::<Vec<_>>() }))
            }),
            "session.workspace.readFile" => {
                let path = string_param(&params, "path")?;
                self.with_session(&params, |session| match session.files.get(&path) {
                    Some(content) => Ok(json!({ "content": content })),
                    None => Err(not_found(format!("File not found: {path}"))),
                })
            }
            "session.workspace.createFile" => {
                let path = string_param(&params, "path")?;
                let content = string_param(&params, "content")?;
                self.with_session(&params, |session| {
                    session.files.insert(path, content);
                    Ok(json!({}))
                })
            }

            "session.model.getCurrent" => {
                self.with_session(&params, |session| Ok(json!({ "modelId": session.model })))
            }
            "session.model.switchTo" => {
                let model_id = string_param(&params, "modelId")?;
                self.with_session(&params, |session| {
                    session.model = Some(model_id);
                    Ok(json!({ "modelId": session.model }))
                })
            }

            "test.invokeTool" => self.invoke_client_tool(&params).await,
            "test.requestPermission" => self.request_client_permission(&params).await,
            "test.getSessionConfig" => {
                self.with_session(&params, |session| Ok(session.config.clone()))
            }
            "test.stats" => Ok(json!({
                "modelsListCalls": self.models_list_calls.load(Ordering::SeqCst),
                "cwd": std::env::current_dir().ok(),
            })),

            _ => Err(jsonrpc_utils::method_not_found(method)),
        }
    }
}

/// Serve one connection until the client goes away
async fn serve(agent: &Arc<MockAgent>, transport: StreamTransport) {
    let handler: Arc<dyn InboundHandler> = Arc::clone(agent) as Arc<dyn InboundHandler>;
    let peer = Arc::new(JsonRpcClient::new(transport, handler));
    agent.attach(&peer);
    peer.closed().await;
    info!("Client disconnected");
}

/// Resolves once stdin reaches EOF, which is how a parent asks us to exit
async fn stdin_closed() {
    let mut stdin = tokio::io::stdin();
    let mut buffer = [0u8; 1024];
    while let Ok(n) = stdin.read(&mut buffer).await {
        if n == 0 {
            break;
        }
    }
}

async fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    debug!(
        "headless={} auto_update={} protocol_version={}",
        args.headless, !args.no_auto_update, args.protocol_version
    );
    let authenticated = args
        .auth_token_env
        .as_deref()
        .map(|var| std::env::var(var).is_ok())
        .unwrap_or(!args.no_auto_login);
    let agent = Arc::new(MockAgent::new(args.protocol_version, authenticated));

    if args.stdio {
        info!("Serving over stdio");
        let transport = StreamTransport::new(tokio::io::stdin(), tokio::io::stdout(), "client stdio");
        serve(&agent, transport).await;
        return Ok(());
    }

    let listener = TcpListener::bind(("127.0.0.1", args.port)).await?;
    let port = listener.local_addr()?.port();
    {
        let mut stdout = std::io::stdout().lock();
        writeln!(stdout, "listening on port {port}")?;
        stdout.flush()?;
    }

    let accept_loop = async {
        loop {
            match listener.accept().await {
                Ok((stream, address)) => {
                    info!("Client connected from {}", address);
                    serve(&agent, StreamTransport::from_tcp(stream)).await;
                }
                Err(e) => {
                    warn!("accept failed: {}", e);
                    break;
                }
            }
        }
    };

    tokio::select! {
        _ = accept_loop => {}
        _ = stdin_closed() => info!("stdin closed, exiting"),
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let level = format!("warn,mock_agent={}", args.log_level);
    if let Err(e) = init_logging(LogConfig::from_env().with_overrides(Some(level), None)) {
        eprintln!("Failed to initialize logging: {e}");
        std::process::exit(1);
    }

    let code = match run(args).await {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("mock-agent: {e}");
            1
        }
    };
    // Pending stdin reads would otherwise keep the runtime alive
    std::process::exit(code);
}
