//! Protocol constants and validators.
//!
//! Event names, channel prefixes, close codes, and limits follow the
//! Pusher Channels protocol, version 7 subset.

/// Client → server events.
pub const EVENT_PING: &str = "pusher:ping";
pub const EVENT_SUBSCRIBE: &str = "pusher:subscribe";
pub const EVENT_UNSUBSCRIBE: &str = "pusher:unsubscribe";
pub const EVENT_SIGNIN: &str = "pusher:signin";

/// Server → client events.
pub const EVENT_PONG: &str = "pusher:pong";
pub const EVENT_CONNECTION_ESTABLISHED: &str = "pusher:connection_established";
pub const EVENT_ERROR: &str = "pusher:error";
pub const EVENT_SIGNIN_SUCCESS: &str = "pusher:signin_success";
pub const EVENT_SUBSCRIPTION_SUCCEEDED: &str = "pusher_internal:subscription_succeeded";
pub const EVENT_MEMBER_ADDED: &str = "pusher_internal:member_added";
pub const EVENT_MEMBER_REMOVED: &str = "pusher_internal:member_removed";

/// Channel prefixes.
pub const PREFIX_PRIVATE: &str = "private-";
pub const PREFIX_PRESENCE: &str = "presence-";
/// Prefix of client-originated user events.
pub const PREFIX_CLIENT_EVENT: &str = "client-";

/// Close codes.
///
/// 4000-4099 instruct the client not to reconnect, 4100-4199 to back off,
/// 4200-4299 to reconnect immediately.
pub const CLOSE_BINARY_NOT_SUPPORTED: u16 = 4003;
/// Documented for protocol completeness; version rejection happens before
/// the upgrade as HTTP 400, so this is never sent as a close frame.
pub const CLOSE_UNSUPPORTED_PROTOCOL: u16 = 4007;
pub const CLOSE_SUBSCRIPTION_DENIED: u16 = 4009;
pub const CLOSE_OVER_CAPACITY: u16 = 4100;
pub const CLOSE_GENERIC_RECONNECT: u16 = 4200;

/// Limits.
pub const MAX_CHANNEL_LENGTH: usize = 256;
pub const MAX_EVENT_LENGTH: usize = 64;
pub const MAX_DATA_SIZE: usize = 256 * 1024;

/// Validate a channel name: `^[A-Za-z0-9_\-=@,.;]+$`, at most
/// [`MAX_CHANNEL_LENGTH`] characters.
#[must_use]
pub fn is_valid_channel_name(name: &str) -> bool {
    if name.is_empty() || name.len() > MAX_CHANNEL_LENGTH {
        return false;
    }
    name.bytes()
        .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'-' | b'=' | b'@' | b',' | b'.' | b';'))
}

/// Channel kind, derived from the name prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    Public,
    Private,
    Presence,
}

impl ChannelKind {
    /// Classify a channel name by its prefix.
    #[must_use]
    pub fn of(name: &str) -> Self {
        if name.starts_with(PREFIX_PRESENCE) {
            ChannelKind::Presence
        } else if name.starts_with(PREFIX_PRIVATE) {
            ChannelKind::Private
        } else {
            ChannelKind::Public
        }
    }

    /// Whether subscribing to this kind requires authorization.
    #[must_use]
    pub fn requires_auth(self) -> bool {
        !matches!(self, ChannelKind::Public)
    }
}
