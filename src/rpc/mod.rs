//! JSON-RPC layer
//!
//! - **Framing**: Content-Length message framing over any `Transport`
//! - **Protocol**: JSON-RPC 2.0 peer with id correlation and inbound dispatch
//! - **Utilities**: error codes and response builders

pub mod framing;
pub mod jsonrpc_utils;
pub mod protocol;

pub use framing::{ContentLengthCodec, ContentLengthFraming, FrameError, FramingError};
pub use protocol::{
    InboundHandler, IncomingMessage, JsonRpcClient, JsonRpcError, JsonRpcErrorObject, NoopHandler,
};
