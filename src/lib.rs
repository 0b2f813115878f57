//! Client for an out-of-process coding agent speaking JSON-RPC 2.0
//!
//! Layers, leaves first:
//!
//! - [`io`]: child process supervision and byte transports (stdio, TCP)
//! - [`rpc`]: Content-Length framing and the JSON-RPC peer
//! - [`client`]: connection state machine, server-level RPCs, inbound dispatch
//! - [`session`]: per-session RPCs, events and callbacks
//!
//! ```no_run
//! use agent_rpc::{AgentClient, ClientOptions, SessionConfig};
//!
//! # async fn run() -> agent_rpc::Result<()> {
//! let client = AgentClient::new(ClientOptions::default())?;
//! client.start().await?;
//! let session = client.create_session(SessionConfig::default()).await?;
//! println!("session {}", session.id());
//! for error in client.stop().await {
//!     eprintln!("cleanup: {error}");
//! }
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod io;
pub mod listeners;
pub mod logging;
pub mod rpc;
pub mod session;
pub mod tools;
pub mod types;

#[cfg(test)]
mod test_utils;

pub use client::{AgentClient, ConnectionState};
pub use config::{ClientOptions, ConfigError, TransportSpec, parse_cli_url};
pub use error::{ClientError, Result};
pub use listeners::ListenerId;
pub use session::{PermissionHandler, Session, SessionConfig, UserInputHandler};
pub use tools::{Tool, ToolError, ToolInvocation};
pub use types::*;
