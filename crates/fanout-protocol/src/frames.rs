//! Frame types for the client-facing protocol.
//!
//! Every frame is a single JSON object carried in one WebSocket text message.

use serde::{Deserialize, Serialize};

/// A control frame sent by a client.
///
/// The `action` field selects the variant. Unknown fields are ignored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum ControlFrame {
    /// Start receiving messages published on `channel`.
    Subscribe {
        /// Channel name to subscribe to.
        channel: String,
    },

    /// Stop receiving messages published on `channel`.
    Unsubscribe {
        /// Channel name to unsubscribe from.
        channel: String,
    },
}

impl ControlFrame {
    /// Create a new Subscribe frame.
    #[must_use]
    pub fn subscribe(channel: impl Into<String>) -> Self {
        ControlFrame::Subscribe {
            channel: channel.into(),
        }
    }

    /// Create a new Unsubscribe frame.
    #[must_use]
    pub fn unsubscribe(channel: impl Into<String>) -> Self {
        ControlFrame::Unsubscribe {
            channel: channel.into(),
        }
    }

    /// The channel this frame refers to.
    #[must_use]
    pub fn channel(&self) -> &str {
        match self {
            ControlFrame::Subscribe { channel } | ControlFrame::Unsubscribe { channel } => channel,
        }
    }
}

/// A frame sent by the gateway to a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ServerFrame {
    /// A message relayed from the upstream bus.
    Delivery {
        /// Channel the message was published on.
        channel: String,
        /// The published payload, unmodified.
        message: String,
    },

    /// A rejected control frame.
    Error {
        /// Human-readable reason.
        error: String,
    },
}

impl ServerFrame {
    /// Create a delivery frame from a raw upstream payload.
    ///
    /// Payloads are relayed as strings; invalid UTF-8 sequences are replaced.
    #[must_use]
    pub fn delivery(channel: impl Into<String>, payload: &[u8]) -> Self {
        ServerFrame::Delivery {
            channel: channel.into(),
            message: String::from_utf8_lossy(payload).into_owned(),
        }
    }

    /// Create an error frame.
    #[must_use]
    pub fn error(reason: impl Into<String>) -> Self {
        ServerFrame::Error {
            error: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_frame_channel() {
        assert_eq!(ControlFrame::subscribe("a").channel(), "a");
        assert_eq!(ControlFrame::unsubscribe("b").channel(), "b");
    }

    #[test]
    fn test_control_frame_wire_shape() {
        let json = serde_json::to_string(&ControlFrame::unsubscribe("events:42")).unwrap();
        assert_eq!(json, r#"{"action":"unsubscribe","channel":"events:42"}"#);
    }

    #[test]
    fn test_delivery_keeps_payload_verbatim() {
        let frame = ServerFrame::delivery("events:7", br#"{"status":"ok","event":"deploy"}"#);
        match frame {
            ServerFrame::Delivery { channel, message } => {
                assert_eq!(channel, "events:7");
                assert_eq!(message, r#"{"status":"ok","event":"deploy"}"#);
            }
            other => panic!("unexpected frame {:?}", other),
        }
    }

    #[test]
    fn test_delivery_replaces_invalid_utf8() {
        let frame = ServerFrame::delivery("bin", &[0x66, 0xff, 0x6f]);
        assert_eq!(
            frame,
            ServerFrame::Delivery {
                channel: "bin".into(),
                message: "f\u{fffd}o".into(),
            }
        );
    }
}
