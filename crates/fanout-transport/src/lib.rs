//! # fanout-transport
//!
//! Client connection abstraction for the Fanout gateway.
//!
//! A [`Connection`] is an already-established bidirectional message channel
//! to one client. The handshake that produced it is the transport's business;
//! the gateway only reads inbound frames, writes outbound text and closes.
//!
//! - **WebSocket** - axum's upgraded socket (feature `websocket`)
//! - **Memory** - an in-process pair, handy for tests and embedding
//!
//! ```rust,ignore
//! use fanout_transport::Connection;
//!
//! async fn echo(mut conn: impl Connection) {
//!     while let Ok(Some(frame)) = conn.recv().await {
//!         let text = String::from_utf8_lossy(&frame).into_owned();
//!         if conn.send(text).await.is_err() {
//!             break;
//!         }
//!     }
//! }
//! ```

pub mod memory;
pub mod traits;

#[cfg(feature = "websocket")]
pub mod websocket;

pub use memory::{MemoryClient, MemoryConnection};
pub use traits::{Connection, ConnectionId, TransportError};

#[cfg(feature = "websocket")]
pub use websocket::WebSocketConnection;
