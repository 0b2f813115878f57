//! Client-side tools the agent can call back into
//!
//! A [`Tool`] is a plain value: name, description, optional JSON schema for
//! its arguments, and an async handler. Sessions reference tools by name;
//! the agent invokes them through `tool.call` requests.

use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::types::{ToolResultObject, ToolResultType};

/// Boxed future returned by user callbacks
pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;

type ToolHandler = dyn Fn(ToolInvocation) -> BoxFuture<Result<Value, ToolError>> + Send + Sync;

/// Arguments of one `tool.call`
#[derive(Debug, Clone, PartialEq)]
pub struct ToolInvocation {
    pub session_id: String,
    pub tool_call_id: String,
    pub tool_name: String,
    pub arguments: Value,
}

/// Failure raised by a tool handler. The message is reported to the agent
/// in the result's `error` field.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{message}")]
pub struct ToolError {
    message: String,
}

impl ToolError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<String> for ToolError {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

impl From<&str> for ToolError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

impl From<serde_json::Error> for ToolError {
    fn from(error: serde_json::Error) -> Self {
        Self::new(error.to_string())
    }
}

impl From<std::io::Error> for ToolError {
    fn from(error: std::io::Error) -> Self {
        Self::new(error.to_string())
    }
}

/// A named capability exposed to the agent
#[derive(Clone)]
pub struct Tool {
    name: String,
    description: String,
    parameters: Option<Value>,
    handler: Arc<ToolHandler>,
}

impl Tool {
    pub fn new<F, Fut>(name: impl Into<String>, description: impl Into<String>, handler: F) -> Self
    where
        F: Fn(ToolInvocation) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, ToolError>> + Send + 'static,
    {
        Self {
            name: name.into(),
            description: description.into(),
            parameters: None,
            handler: Arc::new(move |invocation| Box::pin(handler(invocation))),
        }
    }

    /// JSON schema describing the arguments
    pub fn with_parameters(mut self, schema: Value) -> Self {
        self.parameters = Some(schema);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn parameters(&self) -> Option<&Value> {
        self.parameters.as_ref()
    }

    /// Run the handler and turn whatever happens into a wire result.
    /// The handler runs on its own task so a panic becomes a failure result.
    pub async fn invoke(&self, invocation: ToolInvocation) -> ToolResultObject {
        debug!(
            "Invoking tool {} (call {})",
            self.name, invocation.tool_call_id
        );
        match tokio::spawn((self.handler)(invocation)).await {
            Ok(Ok(value)) => normalize_tool_result(value),
            Ok(Err(error)) => {
                debug!("Tool {} failed: {}", self.name, error);
                tool_error_result(&error)
            }
            Err(join_error) => {
                warn!("Tool {} handler crashed: {}", self.name, join_error);
                tool_error_result(&format!("tool '{}' handler panicked", self.name))
            }
        }
    }

    pub(crate) fn definition(&self) -> ToolDefinition<'_> {
        ToolDefinition {
            name: &self.name,
            description: &self.description,
            parameters: self.parameters.as_ref(),
        }
    }
}

impl fmt::Debug for Tool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tool")
            .field("name", &self.name)
            .field("description", &self.description)
            .field("parameters", &self.parameters)
            .finish_non_exhaustive()
    }
}

/// Tool as announced in `session.create` / `session.resume`
#[derive(Debug, Serialize)]
pub(crate) struct ToolDefinition<'a> {
    pub name: &'a str,
    pub description: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parameters: Option<&'a Value>,
}

// ============================================================================
// Result shaping
// ============================================================================

/// Turn a handler's return value into a tool result:
/// - `null` is a failure
/// - an object already shaped like a result passes through
/// - a string is the text result
/// - anything else is JSON-encoded
pub fn normalize_tool_result(value: Value) -> ToolResultObject {
    match value {
        Value::Null => ToolResultObject::failure("Tool returned no result", "tool returned no result"),
        Value::String(text) => ToolResultObject::success(text),
        Value::Object(ref object)
            if object.get("textResultForLlm").is_some_and(Value::is_string)
                && object.contains_key("resultType") =>
        {
            match serde_json::from_value::<ToolResultObject>(value.clone()) {
                Ok(result) => result,
                Err(_) => ToolResultObject::success(value.to_string()),
            }
        }
        other => ToolResultObject::success(other.to_string()),
    }
}

/// Result sent back for a tool this client never registered
pub fn unsupported_tool_result(tool_name: &str) -> ToolResultObject {
    ToolResultObject::failure(
        format!("Tool '{tool_name}' is not supported by this client instance."),
        format!("tool '{tool_name}' not supported"),
    )
}

/// Result sent back when a handler fails. The text shown to the model stays
/// generic; the detail goes in `error`.
pub fn tool_error_result(error: &dyn fmt::Display) -> ToolResultObject {
    ToolResultObject {
        text_result_for_llm:
            "Invoking this tool produced an error. Detailed information is not available."
                .to_string(),
        result_type: ToolResultType::Failure,
        error: Some(error.to_string()),
        tool_telemetry: Default::default(),
    }
}

/// Ordered, deduplicated union of explicit exclusions and registered tool
/// names. `None` when the union is empty so the field is left off the wire.
pub fn merge_excluded_tools(excluded: Option<&[String]>, tools: &[Tool]) -> Option<Vec<String>> {
    let mut merged: Vec<String> = Vec::new();
    let names = excluded
        .unwrap_or_default()
        .iter()
        .map(String::as_str)
        .chain(tools.iter().map(Tool::name));
    for name in names {
        if !merged.iter().any(|existing| existing == name) {
            merged.push(name.to_string());
        }
    }
    (!merged.is_empty()).then_some(merged)
}
