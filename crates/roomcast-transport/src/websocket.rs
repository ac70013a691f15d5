//! WebSocket connection for push clients.
//!
//! This module dials a Roomcast server using tokio-tungstenite and speaks
//! length-prefixed frames over binary messages.

use async_trait::async_trait;
use bytes::BytesMut;
use futures_util::{SinkExt, StreamExt};
use roomcast_protocol::{Frame, FrameCodec, ProtocolError};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::net::TcpStream;
use tokio_util::codec::{Decoder, Encoder};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{Error as WsError, Message},
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, error, warn};

use crate::traits::{Connection, TransportError};

/// Default maximum inbound message size (1 MiB).
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// A client-side WebSocket connection.
pub struct WebSocketConnection {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    url: String,
    is_open: AtomicBool,
    read_buffer: BytesMut,
    codec: FrameCodec,
    max_message_size: usize,
}

impl WebSocketConnection {
    /// Dial a push endpoint, e.g. `ws://127.0.0.1:8080/ws`.
    ///
    /// # Errors
    ///
    /// Returns an error if the TCP connect or the WebSocket handshake fails.
    pub async fn connect(url: &str) -> Result<Self, TransportError> {
        let (stream, response) = connect_async(url)
            .await
            .map_err(|e| TransportError::Other(format!("WebSocket handshake failed: {e}")))?;

        debug!(url = %url, status = %response.status(), "WebSocket connected");

        Ok(Self {
            stream,
            url: url.to_string(),
            is_open: AtomicBool::new(true),
            read_buffer: BytesMut::with_capacity(4096),
            codec: FrameCodec::new(),
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        })
    }

    /// Override the inbound message size limit.
    #[must_use]
    pub fn with_max_message_size(mut self, max_message_size: usize) -> Self {
        self.max_message_size = max_message_size;
        self
    }

    fn buffer(&mut self, data: &[u8]) -> Result<Option<Frame>, TransportError> {
        if data.len() > self.max_message_size {
            warn!(
                "Message too large: {} bytes (max: {})",
                data.len(),
                self.max_message_size
            );
            return Err(TransportError::Protocol(ProtocolError::FrameTooLarge(data.len())));
        }
        self.read_buffer.extend_from_slice(data);
        Ok(self.codec.decode(&mut self.read_buffer)?)
    }
}

#[async_trait]
impl Connection for WebSocketConnection {
    async fn recv(&mut self) -> Result<Option<Frame>, TransportError> {
        if let Some(frame) = self.codec.decode(&mut self.read_buffer)? {
            return Ok(Some(frame));
        }

        loop {
            match self.stream.next().await {
                Some(Ok(Message::Binary(data))) => {
                    if let Some(frame) = self.buffer(&data)? {
                        return Ok(Some(frame));
                    }
                }
                Some(Ok(Message::Text(text))) => {
                    // Text frames carry JSON, as on the bridge stream.
                    let frame = Frame::from_json(&text)
                        .map_err(|e| ProtocolError::Invalid(e.to_string()))?;
                    return Ok(Some(frame));
                }
                Some(Ok(Message::Ping(data))) => {
                    if let Err(e) = self.stream.send(Message::Pong(data)).await {
                        warn!("Failed to send pong: {}", e);
                    }
                }
                Some(Ok(Message::Pong(_) | Message::Frame(_))) => {}
                Some(Ok(Message::Close(_))) => {
                    debug!("Received close frame");
                    self.is_open.store(false, Ordering::SeqCst);
                    return Ok(None);
                }
                Some(Err(WsError::ConnectionClosed | WsError::AlreadyClosed)) | None => {
                    debug!("WebSocket stream ended");
                    self.is_open.store(false, Ordering::SeqCst);
                    return Ok(None);
                }
                Some(Err(e)) => {
                    error!("WebSocket error: {}", e);
                    self.is_open.store(false, Ordering::SeqCst);
                    return Err(TransportError::ReceiveFailed(e.to_string()));
                }
            }
        }
    }

    async fn send(&mut self, frame: Frame) -> Result<(), TransportError> {
        if !self.is_open.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionClosed);
        }

        let mut data = BytesMut::new();
        self.codec.encode(frame, &mut data)?;
        self.stream
            .send(Message::Binary(data.to_vec()))
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if !self.is_open.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        self.stream
            .close(None)
            .await
            .map_err(|e| TransportError::Other(format!("Failed to close: {e}")))
    }

    fn remote_addr(&self) -> Option<String> {
        Some(self.url.clone())
    }

    fn is_open(&self) -> bool {
        self.is_open.load(Ordering::SeqCst)
    }
}

