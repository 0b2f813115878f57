//! Agent client
//!
//! Owns the connection to one agent: spawning or dialing it, the protocol
//! handshake, server-level RPCs, the session registry and the models cache.
//! Start and stop are serialized; `force_stop` bypasses that lock so it can
//! always tear things down.

mod cache;
mod dispatch;
mod state;

pub use state::ConnectionState;

use regex::Regex;
use serde_json::{Value, json};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{Mutex, watch};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{Level, debug, error, info, trace, warn};

use crate::client::cache::ModelsCache;
use crate::client::dispatch::Dispatcher;
use crate::config::{ClientOptions, SpawnConfig, TransportSpec};
use crate::error::{ClientError, Result};
use crate::io::{ChildProcessManager, ProcessManager, StopMode, StreamTransport};
use crate::listeners::{ListenerId, Listeners};
use crate::rpc::{JsonRpcClient, JsonRpcError};
use crate::session::{Session, SessionConfig, SessionRegistry};
use crate::types::{
    Acknowledgement, AuthStatus, ModelInfo, ModelsListResponse, PingResponse, SDK_PROTOCOL_VERSION,
    SessionCreated, SessionIdResponse, SessionLifecycleEvent, SessionListResponse,
    SessionMetadata, StatusResponse,
};

/// Line a TCP-mode agent prints once it accepts connections
const PORT_ANNOUNCEMENT: &str = r"(?i)listening on port (\d+)";

/// How long a failed start waits for the agent's exit and last stderr lines
const EXIT_DIAGNOSTICS_WAIT: Duration = Duration::from_millis(500);

/// Bound on the exit wait after a forced kill
const FORCE_STOP_WAIT: Duration = Duration::from_secs(1);

/// Live connection resources
struct Connection {
    rpc: Arc<JsonRpcClient>,
    /// `None` when connected to an external agent
    process: Option<Arc<ChildProcessManager>>,
}

/// Why `start` did not publish a connection
enum StartOutcome {
    Failed(ClientError),
    /// `force_stop` fired after the connection was made
    Aborted(Connection),
}

/// Client for one agent process or endpoint
pub struct AgentClient {
    options: ClientOptions,
    transport: TransportSpec,
    state: watch::Sender<ConnectionState>,
    /// Serializes `start` and `stop`
    lifecycle: Mutex<()>,
    connection: StdMutex<Option<Connection>>,
    /// Fired by `force_stop`; a `start` in flight gives up when it fires
    start_abort: StdMutex<CancellationToken>,
    sessions: Arc<SessionRegistry>,
    lifecycle_listeners: Arc<Listeners<SessionLifecycleEvent>>,
    models: ModelsCache,
}

impl AgentClient {
    /// Validate `options`. Nothing is spawned or dialed until [`start`].
    ///
    /// [`start`]: AgentClient::start
    pub fn new(options: ClientOptions) -> Result<Self> {
        let transport = options.resolve()?;
        debug!("AgentClient transport: {:?}", transport);
        let (state, _) = watch::channel(ConnectionState::Disconnected);

        Ok(Self {
            options,
            transport,
            state,
            lifecycle: Mutex::new(()),
            connection: StdMutex::new(None),
            start_abort: StdMutex::new(CancellationToken::new()),
            sessions: Arc::new(SessionRegistry::default()),
            lifecycle_listeners: Arc::new(Listeners::new()),
            models: ModelsCache::new(),
        })
    }

    pub fn get_state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Watch state transitions
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn transport(&self) -> &TransportSpec {
        &self.transport
    }

    /// PID of the spawned agent while it runs
    pub fn agent_pid(&self) -> Option<u32> {
        self.connection_slot()
            .as_ref()?
            .process
            .as_ref()?
            .get_state()
            .pid()
    }

    fn set_state(&self, next: ConnectionState) {
        let previous = self.state.send_replace(next);
        if previous == next {
            return;
        }
        if !previous.can_transition_to(next) {
            debug!("Unusual connection transition {} -> {}", previous, next);
        }
        info!("Connection state: {} -> {}", previous, next);
    }

    fn connection_slot(&self) -> MutexGuard<'_, Option<Connection>> {
        self.connection
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// RPC handle, or a state error when not connected
    fn rpc(&self) -> Result<Arc<JsonRpcClient>> {
        let state = self.get_state();
        if state != ConnectionState::Connected {
            return Err(ClientError::NotConnected { state });
        }
        self.connection_slot()
            .as_ref()
            .map(|connection| Arc::clone(&connection.rpc))
            .ok_or(ClientError::NotConnected {
                state: ConnectionState::Disconnected,
            })
    }

    async fn ensure_started(&self) -> Result<()> {
        if self.get_state() == ConnectionState::Connected {
            return Ok(());
        }
        if !self.options.auto_start {
            return Err(ClientError::NotConnected {
                state: self.get_state(),
            });
        }
        self.start().await
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Connect to the agent and verify its protocol version. A no-op when
    /// already connected. On failure the state returns to `disconnected`.
    pub async fn start(&self) -> Result<()> {
        let _guard = self.lifecycle.lock().await;
        if self.get_state() == ConnectionState::Connected {
            return Ok(());
        }

        let abort = self.abort_token();
        self.set_state(ConnectionState::Connecting);
        let started = Instant::now();

        // Dropping `connect()` drops whatever it spawned or dialed so far
        let outcome = tokio::select! {
            outcome = self.connect() => outcome,
            _ = abort.cancelled() => Err(Self::aborted_start()),
        };

        let installed = outcome
            .map_err(StartOutcome::Failed)
            .and_then(|connection| self.install(connection, &abort));
        match installed {
            Ok(()) => {
                crate::log_timing!(Level::INFO, "agent_start", started.elapsed());
                Ok(())
            }
            Err(StartOutcome::Failed(e)) => {
                error!("Failed to start agent: {}", e);
                self.set_state(ConnectionState::Disconnected);
                Err(e)
            }
            Err(StartOutcome::Aborted(connection)) => {
                info!("Start aborted by force_stop");
                Self::discard(connection).await;
                self.set_state(ConnectionState::Disconnected);
                Err(Self::aborted_start())
            }
        }
    }

    fn abort_token(&self) -> CancellationToken {
        self.start_abort
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn aborted_start() -> ClientError {
        ClientError::start_failed("start aborted by force_stop", "")
    }

    /// Publish a fresh connection unless `force_stop` fired meanwhile. The
    /// check, the store and the state change happen under the connection
    /// lock, which `force_stop` also takes.
    fn install(
        &self,
        connection: Connection,
        abort: &CancellationToken,
    ) -> std::result::Result<(), StartOutcome> {
        let mut slot = self.connection_slot();
        if abort.is_cancelled() {
            return Err(StartOutcome::Aborted(connection));
        }
        *slot = Some(connection);
        self.set_state(ConnectionState::Connected);
        Ok(())
    }

    async fn discard(Connection { rpc, process }: Connection) {
        rpc.close().await;
        if let Some(process) = process
            && let Err(e) = process.stop(StopMode::Force, FORCE_STOP_WAIT).await
        {
            debug!("Ignoring error while discarding aborted start: {}", e);
        }
    }

    async fn connect(&self) -> Result<Connection> {
        let handler = Arc::new(Dispatcher::new(
            Arc::clone(&self.sessions),
            Arc::clone(&self.lifecycle_listeners),
        ));

        match &self.transport {
            TransportSpec::Stdio(spawn) => {
                let process = Self::spawn_agent(spawn).await?;
                let transport = match process.create_stdio_transport() {
                    Ok(transport) => transport,
                    Err(e) => return Err(Self::abort_start(&process, e.to_string()).await),
                };
                let rpc = Arc::new(JsonRpcClient::new(transport, handler));
                self.handshake(rpc, Some(process)).await
            }
            TransportSpec::SpawnTcp(spawn) => {
                let process = Self::spawn_agent(spawn).await?;
                let port = match self.await_port_announcement(&process).await {
                    Ok(port) => port,
                    Err(reason) => return Err(Self::abort_start(&process, reason).await),
                };
                info!("Agent announced port {}", port);
                let transport = match StreamTransport::connect_tcp("127.0.0.1", port).await {
                    Ok(transport) => transport,
                    Err(e) => {
                        let reason = format!("could not connect to port {port}: {e}");
                        return Err(Self::abort_start(&process, reason).await);
                    }
                };
                let rpc = Arc::new(JsonRpcClient::new(transport, handler));
                self.handshake(rpc, Some(process)).await
            }
            TransportSpec::External { host, port } => {
                let transport = StreamTransport::connect_tcp(host, *port)
                    .await
                    .map_err(|e| {
                        ClientError::start_failed(
                            format!("could not connect to {host}:{port}: {e}"),
                            "",
                        )
                    })?;
                let rpc = Arc::new(JsonRpcClient::new(transport, handler));
                self.handshake(rpc, None).await
            }
        }
    }

    async fn spawn_agent(spawn: &SpawnConfig) -> Result<Arc<ChildProcessManager>> {
        let process = ChildProcessManager::new(
            spawn.program.clone(),
            spawn.args.clone(),
            spawn.cwd.clone(),
        )
        .with_env(spawn.env.clone());

        process
            .start()
            .await
            .map_err(|e| ClientError::start_failed(format!("{}: {e}", spawn.program), ""))?;
        Ok(Arc::new(process))
    }

    /// Read the agent's stdout until it announces its port. The remainder of
    /// stdout keeps being drained so the agent never blocks on the pipe.
    async fn await_port_announcement(
        &self,
        process: &ChildProcessManager,
    ) -> std::result::Result<u16, String> {
        let stdout = process.take_stdout().map_err(|e| e.to_string())?;
        let pattern = Regex::new(PORT_ANNOUNCEMENT).map_err(|e| e.to_string())?;
        let mut lines = BufReader::new(stdout).lines();

        let scan = async {
            while let Some(line) = lines.next_line().await.map_err(|e| e.to_string())? {
                trace!("agent stdout: {}", line);
                let port = pattern
                    .captures(&line)
                    .and_then(|captures| captures.get(1))
                    .and_then(|digits| digits.as_str().parse::<u16>().ok());
                if let Some(port) = port {
                    return Ok(port);
                }
            }
            Err("agent exited before announcing its port".to_string())
        };

        let timeout = self.options.startup_timeout;
        let port = tokio::time::timeout(timeout, scan).await.map_err(|_| {
            format!("timed out after {timeout:?} waiting for the agent to announce its port")
        })??;

        tokio::spawn(async move {
            while let Ok(Some(line)) = lines.next_line().await {
                trace!("agent stdout: {}", line);
            }
        });
        Ok(port)
    }

    /// Ping the fresh connection; tear everything down if it fails
    async fn handshake(
        &self,
        rpc: Arc<JsonRpcClient>,
        process: Option<Arc<ChildProcessManager>>,
    ) -> Result<Connection> {
        match self.verify_protocol_version(&rpc).await {
            Ok(()) => Ok(Connection { rpc, process }),
            Err(error) => {
                rpc.close().await;
                let stderr = match &process {
                    Some(process) => Self::collect_diagnostics(process).await,
                    None => String::new(),
                };
                Err(match error {
                    mismatch @ ClientError::ProtocolMismatch { .. } => mismatch,
                    other => ClientError::start_failed(other.to_string(), stderr),
                })
            }
        }
    }

    async fn verify_protocol_version(&self, rpc: &JsonRpcClient) -> Result<()> {
        let ping: PingResponse = rpc
            .request_with_timeout("ping", &json!({}), self.options.startup_timeout)
            .await?;
        match ping.protocol_version {
            Some(version) if version == SDK_PROTOCOL_VERSION => Ok(()),
            actual => Err(ClientError::ProtocolMismatch {
                expected: SDK_PROTOCOL_VERSION,
                actual,
            }),
        }
    }

    async fn abort_start(process: &ChildProcessManager, reason: String) -> ClientError {
        let stderr = Self::collect_diagnostics(process).await;
        ClientError::start_failed(reason, stderr)
    }

    /// Give a dying agent a moment to exit and flush stderr, then make sure
    /// it is gone. Returns what it wrote to stderr.
    async fn collect_diagnostics(process: &ChildProcessManager) -> String {
        process.wait_for_exit(EXIT_DIAGNOSTICS_WAIT).await;
        process.wait_for_stderr(EXIT_DIAGNOSTICS_WAIT).await;
        let stderr = process.stderr_output();
        if let Err(e) = process.stop(StopMode::Force, EXIT_DIAGNOSTICS_WAIT).await {
            debug!("Cleanup after failed start: {}", e);
        }
        stderr
    }

    fn take_connection(&self) -> Option<Connection> {
        self.connection_slot().take()
    }

    /// Destroy every open session, then close the connection and stop the
    /// agent. Cleanup failures are collected and returned rather than
    /// raised; their order is unspecified. Each `session.destroy` gets
    /// `shutdown_timeout` to answer.
    pub async fn stop(&self) -> Vec<ClientError> {
        let _guard = self.lifecycle.lock().await;
        let mut errors = Vec::new();
        if self.get_state() == ConnectionState::Disconnected {
            return errors;
        }

        self.set_state(ConnectionState::Disconnecting);
        self.models.invalidate();

        let grace = self.options.shutdown_timeout;
        let mut destroys = JoinSet::new();
        for session in self.sessions.drain() {
            destroys.spawn(async move {
                let outcome = match tokio::time::timeout(grace, session.destroy_remote()).await {
                    Ok(outcome) => outcome,
                    Err(_) => Err(ClientError::SessionDestroy {
                        session_id: session.id().to_string(),
                        source: JsonRpcError::Timeout,
                    }),
                };
                session.release();
                outcome
            });
        }
        while let Some(joined) = destroys.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!("{}", e);
                    errors.push(e);
                }
                Err(join_error) => error!("Session cleanup task failed: {}", join_error),
            }
        }

        if let Some(Connection { rpc, process }) = self.take_connection() {
            rpc.close().await;
            if let Some(process) = process
                && let Err(e) = process
                    .stop(StopMode::Graceful, self.options.shutdown_timeout)
                    .await
            {
                warn!("Agent did not stop cleanly: {}", e);
                errors.push(ClientError::Process(e));
            }
        }

        self.set_state(ConnectionState::Disconnected);
        info!("Agent client stopped with {} cleanup error(s)", errors.len());
        errors
    }

    /// Tear down immediately: fail pending requests, abandon in-flight
    /// handlers, kill the agent. A `start` in progress is aborted and
    /// returns an error. Never fails; safe in any state.
    pub async fn force_stop(&self) {
        {
            let mut abort = self
                .start_abort
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            std::mem::replace(&mut *abort, CancellationToken::new()).cancel();
        }
        if self.get_state() != ConnectionState::Disconnected {
            self.set_state(ConnectionState::Disconnecting);
        }
        self.models.invalidate();
        for session in self.sessions.drain() {
            session.release();
        }

        if let Some(Connection { rpc, process }) = self.take_connection() {
            if let Some(process) = &process {
                process.kill();
            }
            rpc.close().await;
            if let Some(process) = process
                && let Err(e) = process.stop(StopMode::Force, FORCE_STOP_WAIT).await
            {
                debug!("Ignoring error during force stop: {}", e);
            }
        }

        self.set_state(ConnectionState::Disconnected);
    }

    // ========================================================================
    // Server-level RPCs
    // ========================================================================

    pub async fn ping(&self, message: &str) -> Result<PingResponse> {
        let rpc = self.rpc()?;
        Ok(rpc.request("ping", &json!({ "message": message })).await?)
    }

    pub async fn get_status(&self) -> Result<StatusResponse> {
        let rpc = self.rpc()?;
        Ok(rpc.request("status.get", &json!({})).await?)
    }

    pub async fn get_auth_status(&self) -> Result<AuthStatus> {
        let rpc = self.rpc()?;
        Ok(rpc.request("auth.getStatus", &json!({})).await?)
    }

    /// Available models. Fetched once per connection; every call returns a
    /// fresh copy.
    pub async fn list_models(&self) -> Result<Vec<ModelInfo>> {
        let rpc = self.rpc()?;
        self.models
            .get_or_fetch(|| async move {
                let response: ModelsListResponse = rpc.request("models.list", &json!({})).await?;
                Ok::<_, ClientError>(response.models)
            })
            .await
    }

    /// Send any catalog method not wrapped by this client
    pub async fn request(&self, method: &str, params: Value) -> Result<Value> {
        let rpc = self.rpc()?;
        Ok(rpc.request_value(method, params).await?)
    }

    // ========================================================================
    // Sessions
    // ========================================================================

    /// Create a session, starting the client first when `auto_start` is set
    pub async fn create_session(&self, config: SessionConfig) -> Result<Session> {
        self.ensure_started().await?;
        let rpc = self.rpc()?;

        let request = config.to_request(config.session_id.as_deref(), false);
        let created: SessionCreated = rpc.request("session.create", &request).await?;
        info!("Created session {}", created.session_id);

        Ok(self.register_session(created.session_id, created.workspace_path, &config, rpc))
    }

    /// Reattach to an existing session. The handle's id is always
    /// `session_id`.
    pub async fn resume_session(&self, session_id: &str, config: SessionConfig) -> Result<Session> {
        self.ensure_started().await?;
        let rpc = self.rpc()?;

        let request = config.to_request(Some(session_id), true);
        let resumed: SessionCreated = rpc.request("session.resume", &request).await?;
        if resumed.session_id != session_id {
            warn!(
                "Agent resumed {} as {}; keeping the requested id",
                session_id, resumed.session_id
            );
        }
        info!("Resumed session {}", session_id);

        Ok(self.register_session(
            session_id.to_string(),
            resumed.workspace_path,
            &config,
            rpc,
        ))
    }

    fn register_session(
        &self,
        session_id: String,
        workspace_path: Option<String>,
        config: &SessionConfig,
        rpc: Arc<JsonRpcClient>,
    ) -> Session {
        let session = Session::new(
            session_id,
            workspace_path,
            config,
            rpc,
            self.state.subscribe(),
            &self.sessions,
        );
        self.sessions.insert(session.clone());
        session
    }

    /// Open session created or resumed by this client
    pub fn session(&self, session_id: &str) -> Option<Session> {
        self.sessions.get(session_id)
    }

    pub async fn list_sessions(&self) -> Result<Vec<SessionMetadata>> {
        let rpc = self.rpc()?;
        let response: SessionListResponse = rpc.request("session.list", &json!({})).await?;
        Ok(response.sessions)
    }

    /// Permanently delete a session's stored state on the agent
    pub async fn delete_session(&self, session_id: &str) -> Result<()> {
        let rpc = self.rpc()?;
        let response: Acknowledgement = rpc
            .request("session.delete", &json!({ "sessionId": session_id }))
            .await?;
        if !response.success {
            return Err(ClientError::SessionDelete {
                session_id: session_id.to_string(),
                reason: response.error.unwrap_or_else(|| "Unknown error".to_string()),
            });
        }
        if let Some(session) = self.sessions.remove(session_id) {
            session.release();
        }
        Ok(())
    }

    pub async fn get_last_session_id(&self) -> Result<Option<String>> {
        let rpc = self.rpc()?;
        let response: SessionIdResponse = rpc.request("session.getLastId", &json!({})).await?;
        Ok(response.session_id)
    }

    /// Session shown in the agent's TUI, when it runs one
    pub async fn get_foreground_session_id(&self) -> Result<Option<String>> {
        let rpc = self.rpc()?;
        let response: SessionIdResponse =
            rpc.request("session.getForeground", &json!({})).await?;
        Ok(response.session_id)
    }

    pub async fn set_foreground_session_id(&self, session_id: &str) -> Result<()> {
        let rpc = self.rpc()?;
        let response: Acknowledgement = rpc
            .request("session.setForeground", &json!({ "sessionId": session_id }))
            .await?;
        if response.success {
            Ok(())
        } else {
            Err(ClientError::Foreground(
                response.error.unwrap_or_else(|| "Unknown error".to_string()),
            ))
        }
    }

    // ========================================================================
    // Lifecycle events
    // ========================================================================

    /// Listen to every `session.lifecycle` notification
    pub fn on_lifecycle<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&SessionLifecycleEvent) + Send + Sync + 'static,
    {
        self.lifecycle_listeners.add(listener)
    }

    /// Listen to lifecycle notifications of one type, e.g. `session.created`
    pub fn on_lifecycle_type<F>(&self, event_type: impl Into<String>, listener: F) -> ListenerId
    where
        F: Fn(&SessionLifecycleEvent) + Send + Sync + 'static,
    {
        let event_type = event_type.into();
        self.lifecycle_listeners.add(move |event: &SessionLifecycleEvent| {
            if event.event_type == event_type {
                listener(event);
            }
        })
    }

    pub fn off_lifecycle(&self, id: ListenerId) -> bool {
        self.lifecycle_listeners.remove(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigError;
    use crate::rpc::{InboundHandler, JsonRpcErrorObject};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::net::TcpListener;

    #[cfg(feature = "test-logging")]
    crate::setup_test_logging!();

    /// Minimal agent served in-process over TCP
    struct FakeAgent {
        protocol_version: u32,
        models_calls: AtomicUsize,
        ping_delay: Duration,
        /// Leave `session.destroy` unanswered
        ignore_destroy: bool,
    }

    impl FakeAgent {
        fn new(protocol_version: u32) -> Self {
            Self {
                protocol_version,
                models_calls: AtomicUsize::new(0),
                ping_delay: Duration::ZERO,
                ignore_destroy: false,
            }
        }
    }

    #[async_trait]
    impl InboundHandler for FakeAgent {
        async fn handle_request(
            &self,
            method: &str,
            params: Value,
        ) -> std::result::Result<Value, JsonRpcErrorObject> {
            if method == "ping" {
                tokio::time::sleep(self.ping_delay).await;
            }
            if method == "session.destroy" && self.ignore_destroy {
                std::future::pending::<()>().await;
            }
            Ok(match method {
                "ping" => json!({
                    "message": format!("pong: {}", params["message"].as_str().unwrap_or("")),
                    "timestamp": 1,
                    "protocolVersion": self.protocol_version
                }),
                "models.list" => {
                    self.models_calls.fetch_add(1, Ordering::SeqCst);
                    json!({"models": [{"id": "m1", "name": "Model One"}]})
                }
                "session.create" => json!({"sessionId": "fake-session"}),
                "session.delete" => json!({"success": false, "error": "locked"}),
                _ => json!({}),
            })
        }
    }

    /// Accept connections forever, one JSON-RPC peer per connection
    async fn serve(agent: Arc<FakeAgent>) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let mut peers = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                let handler: Arc<dyn InboundHandler> = agent.clone();
                peers.push(JsonRpcClient::new(StreamTransport::from_tcp(stream), handler));
            }
        });
        port
    }

    fn external(port: u16) -> AgentClient {
        AgentClient::new(ClientOptions {
            cli_url: Some(port.to_string()),
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn test_invalid_options_rejected_at_construction() {
        let result = AgentClient::new(ClientOptions {
            cli_url: Some("localhost:99999".to_string()),
            ..Default::default()
        });
        assert!(matches!(
            result,
            Err(ClientError::Config(ConfigError::InvalidPort(_)))
        ));

        let result = AgentClient::new(ClientOptions {
            cli_url: Some("localhost:8080".to_string()),
            use_stdio: Some(true),
            ..Default::default()
        });
        assert!(matches!(
            result,
            Err(ClientError::Config(ConfigError::ExternalWithSpawn))
        ));
    }

    #[tokio::test]
    async fn test_operations_fail_fast_before_start() {
        let client = AgentClient::new(ClientOptions {
            auto_start: false,
            ..Default::default()
        })
        .unwrap();

        assert!(matches!(
            client.ping("x").await,
            Err(ClientError::NotConnected {
                state: ConnectionState::Disconnected
            })
        ));
        assert!(client.list_models().await.is_err());
        assert!(client.create_session(SessionConfig::default()).await.is_err());
        assert!(client.stop().await.is_empty());
    }

    #[tokio::test]
    async fn test_force_stop_from_any_state() {
        let client = external(1);
        client.force_stop().await;
        assert_eq!(client.get_state(), ConnectionState::Disconnected);

        let agent = Arc::new(FakeAgent::new(SDK_PROTOCOL_VERSION));
        let client = external(serve(agent).await);
        client.start().await.unwrap();
        client.create_session(SessionConfig::default()).await.unwrap();

        client.force_stop().await;
        assert_eq!(client.get_state(), ConnectionState::Disconnected);
        assert!(client.session("fake-session").is_none());
        client.force_stop().await;
        assert_eq!(client.get_state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_force_stop_during_start_leaves_client_disconnected() {
        let agent = Arc::new(FakeAgent {
            ping_delay: Duration::from_millis(500),
            ..FakeAgent::new(SDK_PROTOCOL_VERSION)
        });
        let client = Arc::new(external(serve(agent).await));

        let starting = {
            let client = Arc::clone(&client);
            tokio::spawn(async move { client.start().await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(client.get_state(), ConnectionState::Connecting);

        client.force_stop().await;
        let outcome = starting.await.unwrap();
        assert!(matches!(outcome, Err(ClientError::StartFailed { .. })), "{outcome:?}");
        assert_eq!(client.get_state(), ConnectionState::Disconnected);

        // The delayed handshake reply must not revive the connection
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(client.get_state(), ConnectionState::Disconnected);
        assert!(client.ping("x").await.is_err());

        client.start().await.unwrap();
        assert_eq!(client.get_state(), ConnectionState::Connected);
        assert!(client.stop().await.is_empty());
    }

    #[tokio::test]
    async fn test_stop_bounds_unanswered_session_destroy() {
        let agent = Arc::new(FakeAgent {
            ignore_destroy: true,
            ..FakeAgent::new(SDK_PROTOCOL_VERSION)
        });
        let client = AgentClient::new(ClientOptions {
            cli_url: Some(serve(agent).await.to_string()),
            shutdown_timeout: Duration::from_millis(200),
            ..Default::default()
        })
        .unwrap();
        client.start().await.unwrap();
        client.create_session(SessionConfig::default()).await.unwrap();

        let errors = tokio::time::timeout(Duration::from_secs(5), client.stop())
            .await
            .expect("stop() outlived the shutdown timeout");
        assert_eq!(errors.len(), 1, "{errors:?}");
        assert!(matches!(
            &errors[0],
            ClientError::SessionDestroy { session_id, source: JsonRpcError::Timeout }
                if session_id == "fake-session"
        ));
        assert!(errors[0].to_string().starts_with("Failed to destroy session fake-session"));
        assert_eq!(client.get_state(), ConnectionState::Disconnected);
        assert!(client.session("fake-session").is_none());
    }

    #[tokio::test]
    async fn test_models_cached_per_connection() {
        let agent = Arc::new(FakeAgent::new(SDK_PROTOCOL_VERSION));
        let client = external(serve(Arc::clone(&agent)).await);
        client.start().await.unwrap();

        let first = client.list_models().await.unwrap();
        let second = client.list_models().await.unwrap();
        assert_eq!(first, second);
        assert_ne!(first.as_ptr(), second.as_ptr());
        assert_eq!(agent.models_calls.load(Ordering::SeqCst), 1);

        assert!(client.stop().await.is_empty());
        assert!(client.list_models().await.is_err());

        client.start().await.unwrap();
        client.list_models().await.unwrap();
        assert_eq!(agent.models_calls.load(Ordering::SeqCst), 2);
        assert!(client.stop().await.is_empty());
    }

    #[tokio::test]
    async fn test_protocol_mismatch_fails_start() {
        let agent = Arc::new(FakeAgent::new(SDK_PROTOCOL_VERSION + 1));
        let client = external(serve(agent).await);

        let error = client.start().await.unwrap_err();
        assert!(matches!(
            error,
            ClientError::ProtocolMismatch { actual: Some(v), .. } if v == SDK_PROTOCOL_VERSION + 1
        ));
        assert_eq!(client.get_state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_external_refused_is_start_failure() {
        // Bind then drop to find a port nobody listens on
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let client = external(port);
        let error = client.start().await.unwrap_err();
        assert!(matches!(error, ClientError::StartFailed { .. }));
        assert!(error.to_string().contains("stderr"));
        assert_eq!(client.get_state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_failed_spawn_reports_stderr() {
        let client = AgentClient::new(ClientOptions {
            cli_path: Some("sh".to_string()),
            cli_args: vec![
                "-c".to_string(),
                "echo \"error: unexpected argument '$1'\" >&2; exit 2".to_string(),
                "agent".to_string(),
            ],
            ..Default::default()
        })
        .unwrap();

        let error = client.start().await.unwrap_err();
        let text = error.to_string();
        assert!(text.contains("stderr"), "{text}");
        assert!(text.contains("--headless"), "{text}");
        assert_eq!(client.get_state(), ConnectionState::Disconnected);
        assert!(matches!(
            client.ping("x").await,
            Err(ClientError::NotConnected { .. })
        ));
    }

    #[tokio::test]
    async fn test_tcp_spawn_without_announcement() {
        let client = AgentClient::new(ClientOptions {
            cli_path: Some("sh".to_string()),
            cli_args: vec![
                "-c".to_string(),
                "echo starting; echo boom >&2".to_string(),
                "agent".to_string(),
            ],
            use_stdio: Some(false),
            ..Default::default()
        })
        .unwrap();

        let error = client.start().await.unwrap_err();
        let text = error.to_string();
        assert!(text.contains("before announcing its port"), "{text}");
        assert!(text.contains("boom"), "{text}");
    }

    #[tokio::test]
    async fn test_missing_binary_is_start_failure() {
        let client = AgentClient::new(ClientOptions {
            cli_path: Some("/nonexistent/agent-binary".to_string()),
            ..Default::default()
        })
        .unwrap();
        let error = client.start().await.unwrap_err();
        assert!(error.to_string().contains("/nonexistent/agent-binary"));
        assert_eq!(client.get_state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_delete_failure_and_lifecycle_filtering() {
        let agent = Arc::new(FakeAgent::new(SDK_PROTOCOL_VERSION));
        let client = external(serve(agent).await);
        client.start().await.unwrap();

        let error = client.delete_session("abc").await.unwrap_err();
        assert_eq!(error.to_string(), "Failed to delete session abc: locked");

        let seen = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let id = client.on_lifecycle_type("session.created", move |event| {
            sink.lock().unwrap().push(event.session_id.clone())
        });
        let event = |kind: &str| SessionLifecycleEvent {
            event_type: kind.to_string(),
            session_id: "s".to_string(),
            metadata: None,
        };
        client.lifecycle_listeners.emit(&event("session.created"));
        client.lifecycle_listeners.emit(&event("session.deleted"));
        assert_eq!(seen.lock().unwrap().len(), 1);
        assert!(client.off_lifecycle(id));

        assert!(client.stop().await.is_empty());
    }
}
