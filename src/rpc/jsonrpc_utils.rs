//! JSON-RPC 2.0 protocol utilities
//!
//! Provides constants and response builders for working with the
//! JSON-RPC 2.0 protocol as per https://www.jsonrpc.org/specification

use crate::rpc::protocol::{JsonRpcErrorObject, JsonRpcResponse};
use serde_json::Value;

// ============================================================================
// JSON-RPC 2.0 Constants
// ============================================================================

/// JSON-RPC 2.0 version identifier
pub const JSONRPC_VERSION: &str = "2.0";

/// JSON-RPC 2.0 Error Codes (as per JSON-RPC specification)
/// https://www.jsonrpc.org/specification#error_object
pub mod error_codes {
    /// Parse error - Invalid JSON was received by the server.
    pub const PARSE_ERROR: i32 = -32700;

    /// Invalid Request - The JSON sent is not a valid Request object.
    pub const INVALID_REQUEST: i32 = -32600;

    /// Method not found - The method does not exist / is not available.
    pub const METHOD_NOT_FOUND: i32 = -32601;

    /// Invalid params - Invalid method parameter(s).
    pub const INVALID_PARAMS: i32 = -32602;

    /// Internal error - Internal JSON-RPC error.
    pub const INTERNAL_ERROR: i32 = -32603;
}

// ============================================================================
// JSON-RPC Response Builders
// ============================================================================

/// Create a successful JSON-RPC response
pub fn success_response(id: Value, result: Value) -> JsonRpcResponse {
    JsonRpcResponse {
        jsonrpc: JSONRPC_VERSION.to_string(),
        id,
        result: Some(result),
        error: None,
    }
}

/// Create a JSON-RPC error response
pub fn error_response(id: Value, error: JsonRpcErrorObject) -> JsonRpcResponse {
    JsonRpcResponse {
        jsonrpc: JSONRPC_VERSION.to_string(),
        id,
        result: None,
        error: Some(error),
    }
}

/// Build an error object
pub fn error_object(code: i32, message: impl Into<String>) -> JsonRpcErrorObject {
    JsonRpcErrorObject {
        code,
        message: message.into(),
        data: None,
    }
}

/// Error object for an unknown method
pub fn method_not_found(method: &str) -> JsonRpcErrorObject {
    error_object(
        error_codes::METHOD_NOT_FOUND,
        format!("Method not found: {}", method),
    )
}

/// Error object for params that do not match the method's shape
pub fn invalid_params(message: impl std::fmt::Display) -> JsonRpcErrorObject {
    error_object(
        error_codes::INVALID_PARAMS,
        format!("Invalid params: {message}"),
    )
}
