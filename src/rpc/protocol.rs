//! JSON-RPC 2.0 protocol layer
//!
//! Implements a symmetric JSON-RPC 2.0 peer: outbound requests correlated by
//! id, outbound notifications, and inbound requests/notifications routed to
//! an [`InboundHandler`]. One task owns the framed transport; everything else
//! talks to it through channels.

use crate::io::transport::Transport;
use crate::rpc::framing::ContentLengthFraming;
use crate::rpc::jsonrpc_utils::{self, JSONRPC_VERSION, error_codes};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Level, debug, error, trace, warn};

// ============================================================================
// JSON-RPC Types
// ============================================================================

/// JSON-RPC 2.0 request message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    /// JSON-RPC version (always "2.0")
    pub jsonrpc: String,

    /// Request identifier
    pub id: Value,

    /// Method name
    pub method: String,

    /// Optional parameters
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

/// JSON-RPC 2.0 response message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    /// JSON-RPC version (always "2.0")
    pub jsonrpc: String,

    /// Request identifier (matches the request)
    pub id: Value,

    /// Result (present if successful)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,

    /// Error (present if failed)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcErrorObject>,
}

/// JSON-RPC 2.0 notification message (no response expected)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcNotification {
    /// JSON-RPC version (always "2.0")
    pub jsonrpc: String,

    /// Method name
    pub method: String,

    /// Optional parameters
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

/// JSON-RPC error object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcErrorObject {
    /// Error code
    pub code: i32,

    /// Error message
    pub message: String,

    /// Optional additional data
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// A decoded inbound envelope
#[derive(Debug, Clone)]
pub enum IncomingMessage {
    Request(JsonRpcRequest),
    Notification(JsonRpcNotification),
    Response {
        id: Value,
        outcome: Result<Value, JsonRpcErrorObject>,
    },
}

impl IncomingMessage {
    /// Classify one payload. Anything with `method` is a call (request when
    /// it carries an id); anything else with an id is a response. A
    /// `"result": null` is a valid result, not a missing one.
    pub fn parse(payload: &[u8]) -> Result<Self, JsonRpcError> {
        let value: Value = serde_json::from_slice(payload).map_err(JsonRpcError::Deserialization)?;
        let Value::Object(mut object) = value else {
            return Err(JsonRpcError::InvalidMessage(
                "envelope is not a JSON object".to_string(),
            ));
        };

        let id = object.remove("id").filter(|id| !id.is_null());

        if let Some(method) = object.remove("method") {
            let Value::String(method) = method else {
                return Err(JsonRpcError::InvalidMessage(
                    "method is not a string".to_string(),
                ));
            };
            let params = object.remove("params");
            return Ok(match id {
                Some(id) => Self::Request(JsonRpcRequest {
                    jsonrpc: JSONRPC_VERSION.to_string(),
                    id,
                    method,
                    params,
                }),
                None => Self::Notification(JsonRpcNotification {
                    jsonrpc: JSONRPC_VERSION.to_string(),
                    method,
                    params,
                }),
            });
        }

        let Some(id) = id else {
            return Err(JsonRpcError::InvalidMessage(
                "envelope has neither method nor id".to_string(),
            ));
        };

        // An undecodable error still answers its request
        let outcome = match object.remove("error").filter(|error| !error.is_null()) {
            Some(raw) => Err(match serde_json::from_value::<JsonRpcErrorObject>(raw.clone()) {
                Ok(error) => error,
                Err(_) => JsonRpcErrorObject {
                    code: error_codes::INVALID_REQUEST,
                    message: "malformed error object".to_string(),
                    data: Some(raw),
                },
            }),
            None => Ok(object.remove("result").unwrap_or(Value::Null)),
        };

        Ok(Self::Response { id, outcome })
    }
}

// ============================================================================
// JSON-RPC Errors
// ============================================================================

/// JSON-RPC error type
#[derive(Debug, thiserror::Error)]
pub enum JsonRpcError {
    #[error("JSON-RPC server error ({code}): {message}")]
    Server {
        code: i32,
        message: String,
        data: Option<Value>,
    },

    /// The connection went away before a response arrived
    #[error("Connection closed: {0}")]
    ConnectionClosed(String),

    #[error("Serialization error: {0}")]
    Serialization(serde_json::Error),

    #[error("Deserialization error: {0}")]
    Deserialization(serde_json::Error),

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Request timeout")]
    Timeout,
}

impl JsonRpcError {
    pub fn is_connection_closed(&self) -> bool {
        matches!(self, Self::ConnectionClosed(_))
    }
}

impl From<JsonRpcErrorObject> for JsonRpcError {
    fn from(error: JsonRpcErrorObject) -> Self {
        Self::Server {
            code: error.code,
            message: error.message,
            data: error.data,
        }
    }
}

// ============================================================================
// Inbound dispatch
// ============================================================================

/// Receiver of server-initiated traffic.
///
/// `handle_request` runs on its own task; its result becomes the reply.
/// `handle_notification` runs inline on the reader task and must not block.
#[async_trait]
pub trait InboundHandler: Send + Sync + 'static {
    async fn handle_request(&self, method: &str, _params: Value) -> Result<Value, JsonRpcErrorObject> {
        Err(jsonrpc_utils::method_not_found(method))
    }

    fn handle_notification(&self, _method: &str, _params: Value) {}
}

/// Handler that answers every request with "method not found"
pub struct NoopHandler;

impl InboundHandler for NoopHandler {}

// ============================================================================
// JSON-RPC Client
// ============================================================================

type PendingSender = oneshot::Sender<Result<Value, JsonRpcError>>;

/// Requests waiting for a response, plus the reason the table was closed
#[derive(Default)]
struct PendingTable {
    entries: HashMap<u64, PendingSender>,
    closed: Option<String>,
}

impl PendingTable {
    /// Fail every waiter and refuse new registrations
    fn close(&mut self, reason: &str) {
        self.closed.get_or_insert_with(|| reason.to_string());
        for (id, sender) in self.entries.drain() {
            debug!("JsonRpcClient: failing pending request {} ({})", id, reason);
            let _ = sender.send(Err(JsonRpcError::ConnectionClosed(reason.to_string())));
        }
    }
}

/// JSON-RPC client with request/response correlation
pub struct JsonRpcClient {
    /// Channel for sending outbound messages (requests, notifications, replies)
    outbound_sender: mpsc::UnboundedSender<String>,

    /// Request ID counter
    request_id: AtomicU64,

    /// Pending requests waiting for responses
    pending_requests: Arc<Mutex<PendingTable>>,

    /// Asks the I/O task to stop; also cancels in-flight inbound handlers
    shutdown: CancellationToken,

    /// Fires once the I/O task has exited and the pending table is closed
    closed: CancellationToken,

    io_task: StdMutex<Option<JoinHandle<()>>>,
}

impl JsonRpcClient {
    /// Create a new JSON-RPC client over a raw byte transport.
    /// Content-Length framing is applied here.
    pub fn new<T>(transport: T, handler: Arc<dyn InboundHandler>) -> Self
    where
        T: Transport + 'static,
    {
        let framed = ContentLengthFraming::new(transport);
        let (outbound_sender, outbound_receiver) = mpsc::unbounded_channel::<String>();
        let pending_requests = Arc::new(Mutex::new(PendingTable::default()));
        let shutdown = CancellationToken::new();
        let closed = CancellationToken::new();

        let io_loop = IoLoop {
            outbound_sender: outbound_sender.clone(),
            pending_requests: Arc::clone(&pending_requests),
            handler,
            shutdown: shutdown.clone(),
            closed: closed.clone(),
        };
        let io_task = tokio::spawn(io_loop.run(framed, outbound_receiver));

        Self {
            outbound_sender,
            request_id: AtomicU64::new(1),
            pending_requests,
            shutdown,
            closed,
            io_task: StdMutex::new(Some(io_task)),
        }
    }

    /// Send a request and wait for its result, however long it takes
    pub async fn request<P, R>(&self, method: &str, params: &P) -> Result<R, JsonRpcError>
    where
        P: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let params = serde_json::to_value(params).map_err(JsonRpcError::Serialization)?;
        let result = self.request_value(method, params).await?;
        serde_json::from_value(result).map_err(JsonRpcError::Deserialization)
    }

    /// Send a request with a bounded wait. On timeout the pending entry is
    /// dropped and a late response is ignored.
    pub async fn request_with_timeout<P, R>(
        &self,
        method: &str,
        params: &P,
        timeout: Duration,
    ) -> Result<R, JsonRpcError>
    where
        P: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let params = serde_json::to_value(params).map_err(JsonRpcError::Serialization)?;
        let (id, receiver) = self.send_request(method, params).await?;

        match tokio::time::timeout(timeout, receiver).await {
            Ok(outcome) => {
                let result = Self::flatten(outcome)?;
                serde_json::from_value(result).map_err(JsonRpcError::Deserialization)
            }
            Err(_) => {
                self.pending_requests.lock().await.entries.remove(&id);
                Err(JsonRpcError::Timeout)
            }
        }
    }

    /// Untyped request
    pub async fn request_value(&self, method: &str, params: Value) -> Result<Value, JsonRpcError> {
        let (_, receiver) = self.send_request(method, params).await?;
        Self::flatten(receiver.await)
    }

    fn flatten(
        outcome: Result<Result<Value, JsonRpcError>, oneshot::error::RecvError>,
    ) -> Result<Value, JsonRpcError> {
        outcome.unwrap_or_else(|_| {
            Err(JsonRpcError::ConnectionClosed(
                "response channel dropped".to_string(),
            ))
        })
    }

    async fn send_request(
        &self,
        method: &str,
        params: Value,
    ) -> Result<(u64, oneshot::Receiver<Result<Value, JsonRpcError>>), JsonRpcError> {
        let id = self.request_id.fetch_add(1, Ordering::SeqCst);
        let (response_sender, response_receiver) = oneshot::channel();

        let request = JsonRpcRequest {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: Value::from(id),
            method: method.to_string(),
            params: (!params.is_null()).then_some(params),
        };
        let request_json = serde_json::to_string(&request).map_err(JsonRpcError::Serialization)?;

        // Register before writing so a fast response always finds its slot
        {
            let mut pending = self.pending_requests.lock().await;
            if let Some(reason) = &pending.closed {
                return Err(JsonRpcError::ConnectionClosed(reason.clone()));
            }
            pending.entries.insert(id, response_sender);
        }

        crate::log_rpc_message!(Level::TRACE, "outbound", method, &request_json);

        if self.outbound_sender.send(request_json).is_err() {
            self.pending_requests.lock().await.entries.remove(&id);
            return Err(JsonRpcError::ConnectionClosed(
                "broken pipe: outbound channel closed".to_string(),
            ));
        }

        Ok((id, response_receiver))
    }

    /// Send a JSON-RPC notification
    pub fn notify<P>(&self, method: &str, params: &P) -> Result<(), JsonRpcError>
    where
        P: Serialize + ?Sized,
    {
        if self.is_closed() {
            return Err(JsonRpcError::ConnectionClosed(
                "broken pipe: connection is closed".to_string(),
            ));
        }

        let params = serde_json::to_value(params).map_err(JsonRpcError::Serialization)?;
        let notification = JsonRpcNotification {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.to_string(),
            params: (!params.is_null()).then_some(params),
        };

        let notification_json =
            serde_json::to_string(&notification).map_err(JsonRpcError::Serialization)?;
        crate::log_rpc_message!(Level::TRACE, "outbound", method, &notification_json);

        self.outbound_sender.send(notification_json).map_err(|_| {
            JsonRpcError::ConnectionClosed("broken pipe: outbound channel closed".to_string())
        })
    }

    /// Whether the I/O task has finished
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once the connection is gone, for whatever reason
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }

    /// Number of requests still waiting for a response
    pub async fn pending_count(&self) -> usize {
        self.pending_requests.lock().await.entries.len()
    }

    /// Close the connection: stop the I/O task, close the transport, fail
    /// every pending request, abandon running inbound handlers.
    pub async fn close(&self) {
        self.shutdown.cancel();
        let task = self.io_task.lock().ok().and_then(|mut slot| slot.take());
        if let Some(task) = task {
            if let Err(e) = task.await {
                error!("JsonRpcClient: I/O task ended abnormally: {}", e);
            }
        }
        // The I/O task closes the table on exit; this covers a panicked task
        self.pending_requests
            .lock()
            .await
            .close("connection closed by client");
    }
}

impl Drop for JsonRpcClient {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

// ============================================================================
// I/O task
// ============================================================================

struct IoLoop {
    outbound_sender: mpsc::UnboundedSender<String>,
    pending_requests: Arc<Mutex<PendingTable>>,
    handler: Arc<dyn InboundHandler>,
    shutdown: CancellationToken,
    closed: CancellationToken,
}

impl IoLoop {
    async fn run<T: Transport + 'static>(
        self,
        mut framed: ContentLengthFraming<T>,
        mut outbound_receiver: mpsc::UnboundedReceiver<String>,
    ) {
        let reason = loop {
            tokio::select! {
                biased;

                _ = self.shutdown.cancelled() => {
                    break "connection closed by client".to_string();
                }
                // Outbound messages (prioritized)
                message = outbound_receiver.recv() => {
                    let Some(message) = message else {
                        break "connection closed by client".to_string();
                    };
                    if let Err(e) = framed.send(message.as_bytes()).await {
                        error!("Failed to send message: {}", e);
                        break format!("broken pipe: {e}");
                    }
                }
                // Inbound messages
                result = framed.receive() => {
                    match result {
                        Ok(payload) => self.process_inbound_message(&payload).await,
                        Err(e) => {
                            debug!("JsonRpcClient: inbound stream ended: {}", e);
                            break format!("broken pipe: {e}");
                        }
                    }
                }
            }
        };

        let _ = framed.close().await;
        // Abandon in-flight inbound handlers
        self.shutdown.cancel();
        self.pending_requests.lock().await.close(&reason);
        self.closed.cancel();
        trace!("Transport handler task finished ({})", reason);
    }

    /// Process an inbound payload. Malformed JSON is logged and skipped.
    async fn process_inbound_message(&self, payload: &[u8]) {
        let message = match IncomingMessage::parse(payload) {
            Ok(message) => message,
            Err(e) => {
                warn!(
                    "JsonRpcClient: dropping malformed message ({}): {}",
                    e,
                    String::from_utf8_lossy(payload)
                );
                return;
            }
        };

        match message {
            IncomingMessage::Response { id, outcome } => {
                crate::log_rpc_message!(Level::TRACE, "inbound", "response", &id);
                let Some(id) = id.as_u64() else {
                    debug!("Received response with non-numeric id {}", id);
                    return;
                };
                let sender = self.pending_requests.lock().await.entries.remove(&id);
                match sender {
                    Some(sender) => {
                        if sender.send(outcome.map_err(JsonRpcError::from)).is_err() {
                            debug!("Response receiver dropped for request {}", id);
                        }
                    }
                    None => debug!("Received response for unknown request {}", id),
                }
            }
            IncomingMessage::Notification(notification) => {
                crate::log_rpc_message!(
                    Level::TRACE,
                    "inbound",
                    notification.method.as_str(),
                    &notification.params
                );
                let handler = Arc::clone(&self.handler);
                let params = notification.params.unwrap_or(Value::Null);
                let delivered = std::panic::catch_unwind(AssertUnwindSafe(|| {
                    handler.handle_notification(&notification.method, params)
                }));
                if delivered.is_err() {
                    error!(
                        "Notification handler panicked for {}",
                        notification.method
                    );
                }
            }
            IncomingMessage::Request(request) => {
                crate::log_rpc_message!(
                    Level::TRACE,
                    "inbound",
                    request.method.as_str(),
                    &request.params
                );
                self.spawn_request_handler(request);
            }
        }
    }

    /// Run a request handler on its own task so the reader keeps decoding
    fn spawn_request_handler(&self, request: JsonRpcRequest) {
        let handler = Arc::clone(&self.handler);
        let outbound = self.outbound_sender.clone();
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            let JsonRpcRequest {
                id, method, params, ..
            } = request;
            let params = params.unwrap_or(Value::Null);

            let handler_method = method.clone();
            let mut work = tokio::spawn(async move {
                handler.handle_request(&handler_method, params).await
            });

            let outcome = tokio::select! {
                _ = shutdown.cancelled() => {
                    work.abort();
                    debug!("Abandoned inbound {} on shutdown", method);
                    return;
                }
                joined = &mut work => joined,
            };

            let response = match outcome {
                Ok(Ok(result)) => jsonrpc_utils::success_response(id, result),
                Ok(Err(error)) => jsonrpc_utils::error_response(id, error),
                Err(join_error) => {
                    error!("Handler for {} failed: {}", method, join_error);
                    jsonrpc_utils::error_response(
                        id,
                        jsonrpc_utils::error_object(
                            error_codes::INTERNAL_ERROR,
                            format!("Handler for {method} failed"),
                        ),
                    )
                }
            };

            match serde_json::to_string(&response) {
                Ok(json) => {
                    if outbound.send(json).is_err() {
                        debug!("Reply to {} dropped: connection closed", method);
                    }
                }
                Err(e) => error!("Failed to serialize reply to {}: {}", method, e),
            }
        });
    }
}
