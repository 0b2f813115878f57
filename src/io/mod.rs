//! I/O layer - Generic abstractions for process management and transport
//!
//! This module provides the byte-level plumbing underneath the RPC layer:
//!
//! - **Transport**: Pure I/O layer for bidirectional byte exchange over a
//!   child's stdio or a TCP socket
//! - **Process**: Agent process lifecycle management with stderr capture
//!
//! Nothing here knows about JSON-RPC or message framing.

pub mod process;
pub mod transport;

// Re-export main types for convenience
pub use process::{
    ChildProcessManager, ProcessError, ProcessManager, ProcessState, StderrBuffer, StopMode,
};
pub use transport::{MockTransport, StreamTransport, StreamTransportError, Transport};
