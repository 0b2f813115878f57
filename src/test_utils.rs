//! Shared test setup

/// Test logging utilities
#[cfg(all(test, feature = "test-logging"))]
pub mod logging {
    use std::sync::Once;
    use tracing_subscriber::{EnvFilter, fmt};

    static INIT: Once = Once::new();

    /// Initialize test logging once per test binary
    ///
    /// Honors `RUST_LOG`; defaults to debug for this crate and info for tokio.
    ///
    /// ```bash
    /// RUST_LOG=agent_rpc::rpc=trace cargo test --features test-logging
    /// ```
    pub fn init() {
        INIT.call_once(|| {
            let env_filter = EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("debug,tokio=info"));

            fmt()
                .with_env_filter(env_filter)
                .with_test_writer()
                .with_target(true)
                .with_thread_ids(true)
                .compact()
                .try_init()
                .ok();
        });
    }
}

/// Install test logging for every test in the enclosing module
#[cfg(all(test, feature = "test-logging"))]
#[macro_export]
macro_rules! setup_test_logging {
    () => {
        #[ctor::ctor]
        fn init_test_logging() {
            $crate::test_utils::logging::init();
        }
    };
}

/// In-process helpers shared by the client and session unit tests
#[cfg(test)]
pub mod fixtures {
    use std::sync::Arc;

    use crate::io::MockTransport;
    use crate::rpc::{InboundHandler, JsonRpcClient, NoopHandler};

    /// Build an `rpc` endpoint on one side of an in-memory pipe, with a second
    /// endpoint on the other side playing the agent.
    pub fn rpc_pair(
        client_handler: Arc<dyn InboundHandler>,
        agent_handler: Arc<dyn InboundHandler>,
    ) -> (Arc<JsonRpcClient>, Arc<JsonRpcClient>) {
        let (client_io, agent_io) = tokio::io::duplex(64 * 1024);
        let (client_read, client_write) = tokio::io::split(client_io);
        let (agent_read, agent_write) = tokio::io::split(agent_io);

        let client = JsonRpcClient::new(
            crate::io::StreamTransport::new(client_read, client_write, "test-agent"),
            client_handler,
        );
        let agent = JsonRpcClient::new(
            crate::io::StreamTransport::new(agent_read, agent_write, "test-client"),
            agent_handler,
        );
        (Arc::new(client), Arc::new(agent))
    }

    /// An endpoint whose transport has nothing to read, so its connection
    /// ends as soon as the I/O task polls it
    pub fn dead_rpc() -> Arc<JsonRpcClient> {
        Arc::new(JsonRpcClient::new(
            MockTransport::new(),
            Arc::new(NoopHandler),
        ))
    }
}
