//! # fanout-protocol
//!
//! Wire formats spoken by the Fanout gateway.
//!
//! Two protocols live here:
//!
//! - **Client frames** - JSON text frames exchanged with browser clients
//!   (`subscribe` / `unsubscribe` control frames in, delivery frames out)
//! - **RESP** - the Redis serialization protocol used to talk to the
//!   upstream pub/sub bus
//!
//! ## Example
//!
//! ```rust
//! use fanout_protocol::{codec, ControlFrame, ServerFrame};
//!
//! let frame = codec::decode(br#"{"action":"subscribe","channel":"metrics:dashboard"}"#).unwrap();
//! assert_eq!(frame, ControlFrame::subscribe("metrics:dashboard"));
//!
//! let out = codec::encode(&ServerFrame::delivery("metrics:dashboard", b"{\"cpu\":\"0.42\"}")).unwrap();
//! assert_eq!(out, r#"{"channel":"metrics:dashboard","message":"{\"cpu\":\"0.42\"}"}"#);
//! ```

pub mod codec;
pub mod frames;
pub mod resp;

pub use codec::{decode, encode, FrameCodec, ProtocolError};
pub use frames::{ControlFrame, ServerFrame};
pub use resp::RespValue;
