//! Transport layer - Pure I/O abstraction for byte exchange
//!
//! This module provides the core transport abstraction that moves raw
//! bytes in both directions without knowledge of message framing or of
//! who owns the other end (a spawned child or a TCP peer).

use async_trait::async_trait;
use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::process::{ChildStdin, ChildStdout};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, trace};

// ============================================================================
// Constants
// ============================================================================

/// Size of the read buffer for stream reading operations
const READ_BUFFER_SIZE: usize = 8192;

/// Core transport trait for bidirectional byte exchange
#[async_trait]
pub trait Transport: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Send a chunk of bytes
    async fn send(&mut self, bytes: &[u8]) -> Result<(), Self::Error>;

    /// Receive the next chunk of bytes. Chunk boundaries carry no meaning.
    async fn receive(&mut self) -> Result<Vec<u8>, Self::Error>;

    /// Close the transport
    async fn close(&mut self) -> Result<(), Self::Error>;

    /// Check if transport is still active
    fn is_connected(&self) -> bool;
}

// ============================================================================
// Stream Transport Implementation
// ============================================================================

/// Error types for stream transports
#[derive(Debug, thiserror::Error)]
pub enum StreamTransportError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Transport is disconnected")]
    Disconnected,

    #[error("Channel error: {0}")]
    Channel(String),
}

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Transport over any pair of async byte streams.
///
/// Two background tasks own the halves: a writer draining an outbound queue
/// and a reader pushing chunks onto an inbound queue. `receive` only waits on
/// a channel, so it is safe to use inside `tokio::select!`.
#[derive(Debug)]
pub struct StreamTransport {
    /// Channel for sending bytes to the writer task
    outbound: Option<mpsc::UnboundedSender<Vec<u8>>>,

    /// Channel for receiving bytes from the reader task
    inbound: Option<mpsc::UnboundedReceiver<Vec<u8>>>,

    reader_task: Option<JoinHandle<()>>,
    writer_task: Option<JoinHandle<()>>,

    /// Human readable peer description for logs
    peer: String,

    /// Connection status
    connected: bool,
}

impl StreamTransport {
    /// Wrap arbitrary reader/writer halves
    pub fn new<R, W>(reader: R, writer: W, peer: impl Into<String>) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let peer = peer.into();
        let (outbound_sender, outbound_receiver) = mpsc::unbounded_channel();
        let (inbound_sender, inbound_receiver) = mpsc::unbounded_channel();

        let writer_task = tokio::spawn(Self::writer_task(
            Box::new(writer),
            outbound_receiver,
            peer.clone(),
        ));
        let reader_task = tokio::spawn(Self::reader_task(
            Box::new(reader),
            inbound_sender,
            peer.clone(),
        ));

        Self {
            outbound: Some(outbound_sender),
            inbound: Some(inbound_receiver),
            reader_task: Some(reader_task),
            writer_task: Some(writer_task),
            peer,
            connected: true,
        }
    }

    /// Transport over a spawned child's stdin/stdout
    pub fn from_child(stdin: ChildStdin, stdout: ChildStdout) -> Self {
        Self::new(stdout, stdin, "child stdio")
    }

    /// Transport over an established TCP connection
    pub fn from_tcp(stream: TcpStream) -> Self {
        let peer = stream
            .peer_addr()
            .map(|addr| format!("tcp {addr}"))
            .unwrap_or_else(|_| "tcp".to_string());
        // Nagle only delays small JSON-RPC frames
        let _ = stream.set_nodelay(true);
        let (read_half, write_half) = stream.into_split();
        Self::new(read_half, write_half, peer)
    }

    /// Open a TCP connection to `host:port` and wrap it
    pub async fn connect_tcp(host: &str, port: u16) -> Result<Self, StreamTransportError> {
        debug!("StreamTransport: connecting to {}:{}", host, port);
        let stream = TcpStream::connect((host, port)).await?;
        Ok(Self::from_tcp(stream))
    }

    /// Background task that writes queued bytes to the stream
    async fn writer_task(
        mut writer: BoxedWriter,
        mut receiver: mpsc::UnboundedReceiver<Vec<u8>>,
        peer: String,
    ) {
        while let Some(bytes) = receiver.recv().await {
            trace!("StreamTransport[{}]: writing {} bytes", peer, bytes.len());

            if let Err(e) = writer.write_all(&bytes).await {
                error!("StreamTransport[{}]: write failed: {}", peer, e);
                break;
            }

            if let Err(e) = writer.flush().await {
                error!("StreamTransport[{}]: flush failed: {}", peer, e);
                break;
            }
        }

        // Closing the write side is how a stdio peer learns we are done
        let _ = writer.shutdown().await;
        trace!("StreamTransport[{}]: writer task finished", peer);
    }

    /// Background task that forwards every chunk read from the stream
    async fn reader_task(
        mut reader: BoxedReader,
        sender: mpsc::UnboundedSender<Vec<u8>>,
        peer: String,
    ) {
        let mut read_buffer = vec![0u8; READ_BUFFER_SIZE];

        loop {
            match reader.read(&mut read_buffer).await {
                Ok(0) => {
                    trace!("StreamTransport[{}]: reached EOF", peer);
                    break;
                }
                Ok(n) => {
                    if sender.send(read_buffer[..n].to_vec()).is_err() {
                        trace!("StreamTransport[{}]: receiver dropped, stopping reader", peer);
                        break;
                    }
                }
                Err(e) => {
                    error!("StreamTransport[{}]: read failed: {}", peer, e);
                    break;
                }
            }
        }

        trace!("StreamTransport[{}]: reader task finished", peer);
    }
}

#[async_trait]
impl Transport for StreamTransport {
    type Error = StreamTransportError;

    async fn send(&mut self, bytes: &[u8]) -> Result<(), Self::Error> {
        if !self.connected {
            return Err(StreamTransportError::Disconnected);
        }

        let sender = self
            .outbound
            .as_ref()
            .ok_or(StreamTransportError::Disconnected)?;

        sender
            .send(bytes.to_vec())
            .map_err(|e| StreamTransportError::Channel(e.to_string()))
    }

    async fn receive(&mut self) -> Result<Vec<u8>, Self::Error> {
        if !self.connected {
            return Err(StreamTransportError::Disconnected);
        }

        let receiver = self
            .inbound
            .as_mut()
            .ok_or(StreamTransportError::Disconnected)?;

        match receiver.recv().await {
            Some(bytes) => Ok(bytes),
            None => {
                self.connected = false;
                Err(StreamTransportError::Disconnected)
            }
        }
    }

    async fn close(&mut self) -> Result<(), Self::Error> {
        debug!("StreamTransport[{}]: closing", self.peer);
        self.connected = false;
        // Dropping the sender lets the writer flush what is queued and shut down
        self.outbound.take();
        self.inbound.take();
        if let Some(task) = self.reader_task.take() {
            task.abort();
        }
        self.writer_task.take();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }
}

impl Drop for StreamTransport {
    fn drop(&mut self) {
        if let Some(task) = self.reader_task.take() {
            task.abort();
        }
    }
}

// ============================================================================
// Mock Transport Implementation
// ============================================================================

/// Error type for mock transport
#[derive(Debug, thiserror::Error)]
pub enum MockTransportError {
    #[error("Transport is disconnected")]
    Disconnected,
    #[error("No more responses available")]
    NoMoreResponses,
}

/// Mock transport for testing - allows controlling sent/received chunks
#[derive(Clone)]
pub struct MockTransport {
    /// Chunks that were sent via this transport
    sent_messages: Arc<Mutex<Vec<Vec<u8>>>>,

    /// Predefined chunks to return when receive() is called
    responses: Arc<Mutex<VecDeque<Vec<u8>>>>,

    /// Connection status
    connected: bool,
}

impl MockTransport {
    /// Create a new mock transport
    pub fn new() -> Self {
        Self {
            sent_messages: Arc::new(Mutex::new(Vec::new())),
            responses: Arc::new(Mutex::new(VecDeque::new())),
            connected: true,
        }
    }

    /// Create a mock transport with predefined chunks
    pub fn with_responses<I, B>(responses: I) -> Self
    where
        I: IntoIterator<Item = B>,
        B: Into<Vec<u8>>,
    {
        let transport = Self::new();
        for response in responses {
            transport.add_response(response);
        }
        transport
    }

    /// Add a chunk that will be returned by a later receive() call
    pub fn add_response(&self, response: impl Into<Vec<u8>>) {
        if let Ok(mut responses) = self.responses.lock() {
            responses.push_back(response.into());
        }
    }

    /// Get all chunks that were sent via this transport, decoded lossily
    pub fn sent_messages(&self) -> Vec<String> {
        self.sent_messages
            .lock()
            .map(|sent| {
                sent.iter()
                    .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
                    .collect()
            })
            .unwrap_or_default()
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for MockTransport {
    type Error = MockTransportError;

    async fn send(&mut self, bytes: &[u8]) -> Result<(), Self::Error> {
        if !self.connected {
            return Err(MockTransportError::Disconnected);
        }

        if let Ok(mut sent) = self.sent_messages.lock() {
            sent.push(bytes.to_vec());
        }
        Ok(())
    }

    async fn receive(&mut self) -> Result<Vec<u8>, Self::Error> {
        if !self.connected {
            return Err(MockTransportError::Disconnected);
        }

        let next = self
            .responses
            .lock()
            .ok()
            .and_then(|mut responses| responses.pop_front());
        next.ok_or(MockTransportError::NoMoreResponses)
    }

    async fn close(&mut self) -> Result<(), Self::Error> {
        self.connected = false;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Stdio;
    use tokio::net::TcpListener;
    use tokio::process::Command;

    #[tokio::test]
    async fn test_stream_transport_child_echo() {
        let mut child = Command::new("cat")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .spawn()
            .expect("Failed to spawn cat");

        let stdin = child.stdin.take().unwrap();
        let stdout = child.stdout.take().unwrap();
        let mut transport = StreamTransport::from_child(stdin, stdout);

        transport.send(b"hello world").await.unwrap();

        let mut received = Vec::new();
        while received.len() < "hello world".len() {
            received.extend(transport.receive().await.unwrap());
        }
        assert_eq!(received, b"hello world");
        assert!(transport.is_connected());

        // Closing stdin makes cat exit
        transport.close().await.unwrap();
        let status = child.wait().await.unwrap();
        assert!(status.success());
    }

    #[tokio::test]
    async fn test_stream_transport_reports_eof_as_disconnect() {
        let mut child = Command::new("echo")
            .arg("bye")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .spawn()
            .expect("Failed to spawn echo");

        let stdin = child.stdin.take().unwrap();
        let stdout = child.stdout.take().unwrap();
        let mut transport = StreamTransport::from_child(stdin, stdout);

        let first = transport.receive().await.unwrap();
        assert_eq!(String::from_utf8_lossy(&first).trim(), "bye");

        let result = transport.receive().await;
        assert!(matches!(result, Err(StreamTransportError::Disconnected)));
        assert!(!transport.is_connected());
        let _ = child.wait().await;
    }

    #[tokio::test]
    async fn test_stream_transport_tcp_roundtrip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buffer = [0u8; 4];
            socket.read_exact(&mut buffer).await.unwrap();
            socket.write_all(&buffer).await.unwrap();
        });

        let mut transport = StreamTransport::connect_tcp("127.0.0.1", port)
            .await
            .unwrap();
        transport.send(b"ping").await.unwrap();

        let mut received = Vec::new();
        while received.len() < 4 {
            received.extend(transport.receive().await.unwrap());
        }
        assert_eq!(received, b"ping");

        server.await.unwrap();
        assert!(transport.receive().await.is_err());
    }

    #[tokio::test]
    async fn test_connect_tcp_refused() {
        // Bind then drop to get a port nobody listens on
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let result = StreamTransport::connect_tcp("127.0.0.1", port).await;
        assert!(matches!(result, Err(StreamTransportError::Io(_))));
    }

    #[tokio::test]
    async fn test_mock_transport_send_receive() {
        let mut transport = MockTransport::with_responses(["response1", "response2"]);

        transport.send(b"message1").await.unwrap();
        transport.send(b"message2").await.unwrap();

        assert_eq!(transport.receive().await.unwrap(), b"response1");
        assert_eq!(transport.receive().await.unwrap(), b"response2");

        assert_eq!(transport.sent_messages(), vec!["message1", "message2"]);
        assert!(transport.receive().await.is_err());
    }

    #[tokio::test]
    async fn test_mock_transport_disconnect() {
        let mut transport = MockTransport::new();
        assert!(transport.is_connected());

        transport.close().await.unwrap();

        assert!(!transport.is_connected());
        assert!(transport.send(b"test").await.is_err());
        assert!(transport.receive().await.is_err());
    }
}
