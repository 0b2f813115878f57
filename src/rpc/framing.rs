//! Message framing layer
//!
//! Splits the byte stream into discrete JSON-RPC payloads using
//! Content-Length headers, the same framing LSP servers speak:
//!
//! Content-Length: <length>\r\n\r\n<content>
//!
//! The codec is a plain `tokio_util` Decoder/Encoder; `ContentLengthFraming`
//! wraps any `Transport` with it so the layer above sees whole messages.

use crate::io::transport::Transport;
use async_trait::async_trait;
use bytes::{Buf, BufMut, BytesMut};
use std::collections::VecDeque;
use std::io;
use tokio_util::codec::{Decoder, Encoder};
use tracing::trace;

/// Maximum message size to prevent memory exhaustion
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024; // 16MB

/// Headers longer than this without a terminator are garbage
const MAX_HEADER_SIZE: usize = 8 * 1024;

const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";

/// Errors produced while splitting or joining frames.
///
/// All of them leave the stream in an unknown position, so they are fatal
/// for the connection.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Invalid message format: {0}")]
    InvalidFormat(String),

    #[error("Invalid content length: {0}")]
    InvalidContentLength(String),

    #[error("Message too large: {size} bytes (max: {max})")]
    MessageTooLarge { size: usize, max: usize },
}

/// Error type for a framed transport
#[derive(Debug, thiserror::Error)]
pub enum FramingError<T: std::error::Error + Send + Sync + 'static> {
    #[error("Transport error: {0}")]
    Transport(T),

    #[error(transparent)]
    Frame(#[from] FrameError),
}

// ============================================================================
// Codec
// ============================================================================

/// Content-Length codec. Decodes to the raw payload bytes of one message.
#[derive(Debug, Default, Clone, Copy)]
pub struct ContentLengthCodec {
    /// Length parsed from a header whose body has not fully arrived yet
    pending_length: Option<usize>,
}

impl ContentLengthCodec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse Content-Length from a header block. Other headers
    /// (Content-Type) are accepted and ignored.
    fn parse_content_length(header: &[u8]) -> Result<usize, FrameError> {
        let header = std::str::from_utf8(header)
            .map_err(|_| FrameError::InvalidFormat("Header is not valid UTF-8".to_string()))?;

        for line in header.split("\r\n") {
            let Some((name, value)) = line.split_once(':') else {
                continue;
            };
            if !name.trim().eq_ignore_ascii_case("content-length") {
                continue;
            }

            let value = value.trim();
            let length = value
                .parse::<usize>()
                .map_err(|_| FrameError::InvalidContentLength(value.to_string()))?;

            if length > MAX_MESSAGE_SIZE {
                return Err(FrameError::MessageTooLarge {
                    size: length,
                    max: MAX_MESSAGE_SIZE,
                });
            }
            return Ok(length);
        }

        Err(FrameError::InvalidFormat(
            "Missing Content-Length header".to_string(),
        ))
    }
}

impl Decoder for ContentLengthCodec {
    type Item = BytesMut;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let length = match self.pending_length {
            Some(length) => length,
            None => {
                let Some(header_end) = src
                    .windows(HEADER_TERMINATOR.len())
                    .position(|window| window == HEADER_TERMINATOR)
                else {
                    if src.len() > MAX_HEADER_SIZE {
                        return Err(FrameError::InvalidFormat(format!(
                            "No header terminator within {MAX_HEADER_SIZE} bytes"
                        )));
                    }
                    return Ok(None);
                };

                let length = Self::parse_content_length(&src[..header_end])?;
                src.advance(header_end + HEADER_TERMINATOR.len());
                self.pending_length = Some(length);
                length
            }
        };

        if src.len() < length {
            trace!(
                "ContentLengthCodec: incomplete message - need {} more bytes",
                length - src.len()
            );
            src.reserve(length - src.len());
            return Ok(None);
        }

        self.pending_length = None;
        trace!("ContentLengthCodec: parsed complete message ({} bytes)", length);
        Ok(Some(src.split_to(length)))
    }
}

impl Encoder<&[u8]> for ContentLengthCodec {
    type Error = FrameError;

    fn encode(&mut self, item: &[u8], dst: &mut BytesMut) -> Result<(), Self::Error> {
        if item.len() > MAX_MESSAGE_SIZE {
            return Err(FrameError::MessageTooLarge {
                size: item.len(),
                max: MAX_MESSAGE_SIZE,
            });
        }
        let header = format!("Content-Length: {}\r\n\r\n", item.len());
        dst.reserve(header.len() + item.len());
        dst.put_slice(header.as_bytes());
        dst.put_slice(item);
        Ok(())
    }
}

// ============================================================================
// Framed transport
// ============================================================================

/// Framing wrapper
///
/// Wraps any transport so that `send` takes one message payload and
/// `receive` yields exactly one message payload, regardless of how the
/// underlying transport chunks the bytes.
pub struct ContentLengthFraming<T: Transport> {
    /// Underlying transport
    transport: T,

    codec: ContentLengthCodec,

    /// Buffer for accumulating partial messages
    receive_buffer: BytesMut,

    /// Queue of complete messages ready to be returned
    message_queue: VecDeque<Vec<u8>>,
}

impl<T: Transport> ContentLengthFraming<T> {
    /// Create a new framing wrapper around a transport
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            codec: ContentLengthCodec::new(),
            receive_buffer: BytesMut::new(),
            message_queue: VecDeque::new(),
        }
    }

    /// Get a reference to the underlying transport
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Read one chunk from the transport and queue every complete frame.
    ///
    /// The only await point is the transport read, so dropping this future
    /// never loses buffered bytes.
    async fn process_transport_data(&mut self) -> Result<(), FramingError<T::Error>> {
        let new_data = self
            .transport
            .receive()
            .await
            .map_err(FramingError::Transport)?;

        self.receive_buffer.extend_from_slice(&new_data);

        while let Some(frame) = self.codec.decode(&mut self.receive_buffer)? {
            self.message_queue.push_back(frame.to_vec());
        }

        Ok(())
    }
}

#[async_trait]
impl<T: Transport> Transport for ContentLengthFraming<T> {
    type Error = FramingError<T::Error>;

    async fn send(&mut self, message: &[u8]) -> Result<(), Self::Error> {
        let mut framed = BytesMut::new();
        self.codec.encode(message, &mut framed)?;

        trace!(
            "ContentLengthFraming: sending framed message ({} bytes content)",
            message.len()
        );

        self.transport
            .send(&framed)
            .await
            .map_err(FramingError::Transport)
    }

    async fn receive(&mut self) -> Result<Vec<u8>, Self::Error> {
        loop {
            if let Some(message) = self.message_queue.pop_front() {
                return Ok(message);
            }
            self.process_transport_data().await?;
        }
    }

    async fn close(&mut self) -> Result<(), Self::Error> {
        self.transport
            .close()
            .await
            .map_err(FramingError::Transport)
    }

    fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::transport::MockTransport;

    fn frame(message: &str) -> String {
        format!("Content-Length: {}\r\n\r\n{}", message.len(), message)
    }

    #[tokio::test]
    async fn test_framing_send() {
        let mut framing = ContentLengthFraming::new(MockTransport::new());

        let message = r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#;
        framing.send(message.as_bytes()).await.unwrap();

        let sent = framing.transport().sent_messages();
        assert_eq!(sent, vec![frame(message)]);
    }

    #[tokio::test]
    async fn test_framing_receive() {
        let message = r#"{"jsonrpc":"2.0","id":1,"result":{}}"#;
        let mut framing = ContentLengthFraming::new(MockTransport::with_responses([frame(message)]));

        let received = framing.receive().await.unwrap();
        assert_eq!(received, message.as_bytes());
    }

    #[tokio::test]
    async fn test_framing_partial_message() {
        let message = r#"{"jsonrpc":"2.0","id":1,"result":{}}"#;
        let framed = frame(message);
        // Split inside the header and again inside the body
        let (first, rest) = framed.split_at(7);
        let (second, third) = rest.split_at(rest.len() - 5);

        let mut framing =
            ContentLengthFraming::new(MockTransport::with_responses([first, second, third]));

        let received = framing.receive().await.unwrap();
        assert_eq!(received, message.as_bytes());
    }

    #[tokio::test]
    async fn test_framing_multiple_messages_in_one_chunk() {
        let message1 = r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#;
        let message2 = r#"{"jsonrpc":"2.0","method":"session.event"}"#;
        let combined = format!("{}{}", frame(message1), frame(message2));

        let mut framing = ContentLengthFraming::new(MockTransport::with_responses([combined]));

        assert_eq!(framing.receive().await.unwrap(), message1.as_bytes());
        assert_eq!(framing.receive().await.unwrap(), message2.as_bytes());
    }

    #[tokio::test]
    async fn test_framing_counts_bytes_not_chars() {
        let message = r#"{"text":"héllo 世界"}"#;
        assert_ne!(message.len(), message.chars().count());

        let mut framing = ContentLengthFraming::new(MockTransport::with_responses([
            frame(message),
            frame("{}"),
        ]));

        assert_eq!(framing.receive().await.unwrap(), message.as_bytes());
        assert_eq!(framing.receive().await.unwrap(), b"{}");
    }

    #[tokio::test]
    async fn test_framing_accepts_extra_headers() {
        let message = "{}";
        let framed = format!(
            "Content-Type: application/vscode-jsonrpc; charset=utf-8\r\ncontent-length: {}\r\n\r\n{}",
            message.len(),
            message
        );
        let mut framing = ContentLengthFraming::new(MockTransport::with_responses([framed]));

        assert_eq!(framing.receive().await.unwrap(), b"{}");
    }

    #[tokio::test]
    async fn test_framing_invalid_content_length() {
        let mut framing = ContentLengthFraming::new(MockTransport::with_responses([
            "Content-Length: invalid\r\n\r\n{}",
        ]));

        match framing.receive().await {
            Err(FramingError::Frame(FrameError::InvalidContentLength(value))) => {
                assert_eq!(value, "invalid");
            }
            other => panic!("Expected InvalidContentLength error, got: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_framing_missing_content_length() {
        let mut framing = ContentLengthFraming::new(MockTransport::with_responses([
            "Content-Type: text/plain\r\n\r\n{}",
        ]));

        assert!(matches!(
            framing.receive().await,
            Err(FramingError::Frame(FrameError::InvalidFormat(_)))
        ));
    }

    #[tokio::test]
    async fn test_framing_message_too_large() {
        let large_size = MAX_MESSAGE_SIZE + 1;
        let mut framing = ContentLengthFraming::new(MockTransport::with_responses([format!(
            "Content-Length: {large_size}\r\n\r\n"
        )]));

        match framing.receive().await {
            Err(FramingError::Frame(FrameError::MessageTooLarge { size, max })) => {
                assert_eq!(size, large_size);
                assert_eq!(max, MAX_MESSAGE_SIZE);
            }
            other => panic!("Expected MessageTooLarge error, got: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_framing_surfaces_transport_end() {
        let mut framing = ContentLengthFraming::new(MockTransport::new());
        assert!(matches!(
            framing.receive().await,
            Err(FramingError::Transport(_))
        ));
    }

    #[test]
    fn test_codec_header_garbage_is_rejected() {
        let mut codec = ContentLengthCodec::new();
        let mut buffer = BytesMut::from(vec![b'x'; MAX_HEADER_SIZE + 1].as_slice());
        assert!(matches!(
            codec.decode(&mut buffer),
            Err(FrameError::InvalidFormat(_))
        ));
    }
}
