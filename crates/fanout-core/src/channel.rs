//! Channel naming and diagnostics types.
//!
//! A channel has no state of its own outside the registry: it exists while at
//! least one connection wants it.

use serde::Serialize;

/// Maximum channel name length.
pub const MAX_CHANNEL_NAME_LENGTH: usize = 256;

/// A channel identifier.
pub type ChannelId = String;

/// Validate a channel name.
///
/// # Errors
///
/// Returns an error message if the channel name is invalid.
pub fn validate_channel_name(name: &str) -> Result<(), &'static str> {
    if name.is_empty() {
        return Err("Channel name cannot be empty");
    }
    if name.len() > MAX_CHANNEL_NAME_LENGTH {
        return Err("Channel name too long");
    }
    if name.starts_with('$') {
        return Err("Channel names starting with '$' are reserved");
    }
    if name.chars().any(char::is_control) {
        return Err("Channel name contains invalid characters");
    }
    Ok(())
}

/// Point-in-time view of one channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChannelInfo {
    /// Channel name.
    pub name: ChannelId,
    /// Number of connections subscribed.
    pub subscribers: usize,
    /// Whether the upstream bus subscription is active.
    pub upstream: bool,
}

/// Point-in-time view of one connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionInfo {
    /// Connection identifier.
    pub id: String,
    /// Channels the connection is subscribed to, sorted.
    pub channels: Vec<ChannelId>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_name_validation() {
        assert!(validate_channel_name("metrics:dashboard").is_ok());
        assert!(validate_channel_name("events:{appId}").is_ok());
        assert!(validate_channel_name("").is_err());
        assert!(validate_channel_name("$system").is_err());
        assert!(validate_channel_name("tab\there").is_err());
        assert!(validate_channel_name("line\nbreak").is_err());
        assert!(validate_channel_name("m\u{e9}tricas").is_ok());
        assert!(validate_channel_name("\u{6307}\u{6807}:dashboard").is_ok());

        let long_name = "a".repeat(MAX_CHANNEL_NAME_LENGTH + 1);
        assert!(validate_channel_name(&long_name).is_err());

        let max_name = "a".repeat(MAX_CHANNEL_NAME_LENGTH);
        assert!(validate_channel_name(&max_name).is_ok());
    }
}
