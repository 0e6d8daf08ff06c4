//! WebSocket transport implementation.
//!
//! Wraps a socket already upgraded by axum. Ping/pong is answered by the
//! WebSocket layer itself and never reaches the session.

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use bytes::Bytes;
use std::net::SocketAddr;
use tracing::{debug, warn};

use crate::traits::{Connection, ConnectionId, TransportError};

/// A WebSocket connection.
pub struct WebSocketConnection {
    id: ConnectionId,
    socket: WebSocket,
    remote_addr: Option<SocketAddr>,
    is_open: bool,
}

impl WebSocketConnection {
    /// Wrap an upgraded socket, assigning it a fresh connection ID.
    #[must_use]
    pub fn new(socket: WebSocket, remote_addr: Option<SocketAddr>) -> Self {
        Self {
            id: ConnectionId::generate(),
            socket,
            remote_addr,
            is_open: true,
        }
    }
}

#[async_trait]
impl Connection for WebSocketConnection {
    fn id(&self) -> &ConnectionId {
        &self.id
    }

    async fn recv(&mut self) -> Result<Option<Bytes>, TransportError> {
        loop {
            match self.socket.recv().await {
                Some(Ok(Message::Text(text))) => return Ok(Some(Bytes::from(text))),
                Some(Ok(Message::Binary(data))) => return Ok(Some(Bytes::from(data))),
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {}
                Some(Ok(Message::Close(_))) => {
                    debug!(connection = %self.id, "Received close frame");
                    self.is_open = false;
                    return Ok(None);
                }
                Some(Err(e)) => {
                    warn!(connection = %self.id, error = %e, "WebSocket error");
                    self.is_open = false;
                    return Err(TransportError::ReceiveFailed(e.to_string()));
                }
                None => {
                    debug!(connection = %self.id, "WebSocket stream ended");
                    self.is_open = false;
                    return Ok(None);
                }
            }
        }
    }

    async fn send(&mut self, text: String) -> Result<(), TransportError> {
        if !self.is_open {
            return Err(TransportError::ConnectionClosed);
        }

        self.socket
            .send(Message::Text(text))
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if !self.is_open {
            return Ok(());
        }
        self.is_open = false;

        self.socket
            .send(Message::Close(None))
            .await
            .map_err(|e| TransportError::SendFailed(format!("Failed to close: {}", e)))
    }

    fn remote_addr(&self) -> Option<String> {
        self.remote_addr.map(|addr| addr.to_string())
    }

    fn is_open(&self) -> bool {
        self.is_open
    }
}
