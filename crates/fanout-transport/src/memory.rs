//! In-process transport.
//!
//! [`pair`] returns the server half (a [`Connection`]) and the client half
//! of a duplex channel. The server-to-client direction may be bounded to
//! model a client that stops reading.

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::traits::{Connection, ConnectionId, TransportError};

/// Server half of an in-memory connection.
pub struct MemoryConnection {
    id: ConnectionId,
    inbound: mpsc::UnboundedReceiver<Bytes>,
    outbound: mpsc::Sender<String>,
    is_open: bool,
}

/// Client half of an in-memory connection.
pub struct MemoryClient {
    to_server: Option<mpsc::UnboundedSender<Bytes>>,
    from_server: mpsc::Receiver<String>,
}

/// Create a connected pair with a generous server-to-client buffer.
#[must_use]
pub fn pair() -> (MemoryConnection, MemoryClient) {
    pair_with_capacity(1024)
}

/// Create a connected pair whose server-to-client direction holds at most
/// `capacity` unread frames before `send` waits.
#[must_use]
pub fn pair_with_capacity(capacity: usize) -> (MemoryConnection, MemoryClient) {
    let (to_server, inbound) = mpsc::unbounded_channel();
    let (outbound, from_server) = mpsc::channel(capacity.max(1));

    let conn = MemoryConnection {
        id: ConnectionId::generate(),
        inbound,
        outbound,
        is_open: true,
    };
    let client = MemoryClient {
        to_server: Some(to_server),
        from_server,
    };
    (conn, client)
}

#[async_trait]
impl Connection for MemoryConnection {
    fn id(&self) -> &ConnectionId {
        &self.id
    }

    async fn recv(&mut self) -> Result<Option<Bytes>, TransportError> {
        let frame = self.inbound.recv().await;
        if frame.is_none() {
            self.is_open = false;
        }
        Ok(frame)
    }

    async fn send(&mut self, text: String) -> Result<(), TransportError> {
        if !self.is_open {
            return Err(TransportError::ConnectionClosed);
        }
        self.outbound
            .send(text)
            .await
            .map_err(|_| TransportError::ConnectionClosed)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.is_open = false;
        self.inbound.close();
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.is_open
    }
}

impl MemoryClient {
    /// Send a raw text frame to the server.
    ///
    /// # Errors
    ///
    /// Returns an error once either side has closed.
    pub fn send_text(&self, text: &str) -> Result<(), TransportError> {
        self.to_server
            .as_ref()
            .ok_or(TransportError::ConnectionClosed)?
            .send(Bytes::copy_from_slice(text.as_bytes()))
            .map_err(|_| TransportError::ConnectionClosed)
    }

    /// Wait for the next frame from the server.
    ///
    /// Returns `None` once the server dropped its half.
    pub async fn recv(&mut self) -> Option<String> {
        self.from_server.recv().await
    }

    /// Take a frame if one is already queued.
    pub fn try_recv(&mut self) -> Option<String> {
        self.from_server.try_recv().ok()
    }

    /// Close the client-to-server direction, as a client-initiated close.
    pub fn close(&mut self) {
        self.to_server = None;
    }
}
