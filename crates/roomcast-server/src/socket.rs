//! Server side of a push connection.
//!
//! Wraps an upgraded axum WebSocket as a [`Connection`] so the push session
//! can be driven the same way over a socket or an in-process pair.

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use bytes::BytesMut;
use roomcast_protocol::{Frame, FrameCodec, ProtocolError};
use roomcast_transport::{Connection, TransportError};
use std::net::SocketAddr;
use tokio_util::codec::{Decoder, Encoder};
use tracing::{debug, warn};

use crate::metrics;

/// An accepted WebSocket speaking Roomcast frames.
pub struct WebSocketPeer {
    socket: WebSocket,
    remote: Option<SocketAddr>,
    read_buffer: BytesMut,
    codec: FrameCodec,
    open: bool,
}

impl WebSocketPeer {
    #[must_use]
    pub fn new(socket: WebSocket, remote: Option<SocketAddr>) -> Self {
        Self {
            socket,
            remote,
            read_buffer: BytesMut::with_capacity(4096),
            codec: FrameCodec::new(),
            open: true,
        }
    }

    fn decode_buffered(&mut self) -> Result<Option<Frame>, TransportError> {
        match self.codec.decode(&mut self.read_buffer) {
            Ok(frame) => Ok(frame),
            Err(e) => {
                // The prefix may be unusable; resynchronise on the next message.
                self.read_buffer.clear();
                Err(e.into())
            }
        }
    }
}

#[async_trait]
impl Connection for WebSocketPeer {
    async fn recv(&mut self) -> Result<Option<Frame>, TransportError> {
        if let Some(frame) = self.decode_buffered()? {
            return Ok(Some(frame));
        }

        loop {
            match self.socket.recv().await {
                Some(Ok(Message::Binary(data))) => {
                    metrics::record_frame(data.len(), "inbound");
                    self.read_buffer.extend_from_slice(&data);
                    if let Some(frame) = self.decode_buffered()? {
                        return Ok(Some(frame));
                    }
                }
                Some(Ok(Message::Text(text))) => {
                    metrics::record_frame(text.len(), "inbound");
                    let frame = Frame::from_json(&text)
                        .map_err(|e| ProtocolError::Invalid(e.to_string()))?;
                    return Ok(Some(frame));
                }
                Some(Ok(Message::Ping(data))) => {
                    if let Err(e) = self.socket.send(Message::Pong(data)).await {
                        warn!("Failed to send pong: {}", e);
                    }
                }
                Some(Ok(Message::Pong(_))) => {}
                Some(Ok(Message::Close(_))) | None => {
                    debug!("WebSocket closed by peer");
                    self.open = false;
                    return Ok(None);
                }
                Some(Err(e)) => {
                    self.open = false;
                    metrics::record_error("websocket");
                    return Err(TransportError::ReceiveFailed(e.to_string()));
                }
            }
        }
    }

    async fn send(&mut self, frame: Frame) -> Result<(), TransportError> {
        if !self.open {
            return Err(TransportError::ConnectionClosed);
        }

        let mut data = BytesMut::new();
        self.codec.encode(frame, &mut data)?;
        metrics::record_frame(data.len(), "outbound");
        self.socket
            .send(Message::Binary(data.to_vec()))
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if !std::mem::replace(&mut self.open, false) {
            return Ok(());
        }
        self.socket
            .send(Message::Close(None))
            .await
            .map_err(|e| TransportError::Other(format!("Failed to close: {e}")))
    }

    fn remote_addr(&self) -> Option<String> {
        self.remote.map(|addr| addr.to_string())
    }

    fn is_open(&self) -> bool {
        self.open
    }
}
