//! In-process connection pair.
//!
//! Two [`LocalConnection`]s wired back to back. Used to run a client session
//! against an in-process server, and in tests.

use async_trait::async_trait;
use roomcast_protocol::Frame;
use tokio::sync::mpsc;

use crate::traits::{Connection, TransportError};

/// One end of an in-process connection.
pub struct LocalConnection {
    tx: Option<mpsc::Sender<Frame>>,
    rx: mpsc::Receiver<Frame>,
}

impl LocalConnection {
    /// Create a connected pair with `buffer` frames of queue in each direction.
    #[must_use]
    pub fn pair(buffer: usize) -> (Self, Self) {
        let (a_tx, b_rx) = mpsc::channel(buffer.max(1));
        let (b_tx, a_rx) = mpsc::channel(buffer.max(1));
        (
            Self {
                tx: Some(a_tx),
                rx: a_rx,
            },
            Self {
                tx: Some(b_tx),
                rx: b_rx,
            },
        )
    }
}

#[async_trait]
impl Connection for LocalConnection {
    async fn recv(&mut self) -> Result<Option<Frame>, TransportError> {
        Ok(self.rx.recv().await)
    }

    async fn send(&mut self, frame: Frame) -> Result<(), TransportError> {
        let tx = self.tx.as_ref().ok_or(TransportError::ConnectionClosed)?;
        tx.send(frame)
            .await
            .map_err(|_| TransportError::ConnectionClosed)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.tx = None;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.tx.as_ref().is_some_and(|tx| !tx.is_closed())
    }
}
