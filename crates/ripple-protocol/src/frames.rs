//! Frame parsing and construction.
//!
//! Every frame is a JSON object `{"event", "channel"?, "data"?}` carried in
//! a WebSocket text frame. On outbound frames the `data` member is a
//! *stringified* JSON document, except for `pusher:error` and
//! `pusher:signin_success`, which carry an object for historical
//! compatibility.

use serde::{Deserialize, Serialize};
use serde_json::json;
use serde_json::value::RawValue;
use thiserror::Error;

use crate::constants;

/// Frame parse errors.
#[derive(Debug, Error)]
pub enum FrameError {
    /// The frame is not a JSON object of the expected shape.
    #[error("invalid frame: {0}")]
    Invalid(#[from] serde_json::Error),
}

/// An inbound client frame.
#[derive(Debug, Deserialize)]
pub struct ClientFrame {
    /// Event name.
    pub event: String,
    /// Channel name, where the event carries one.
    #[serde(default)]
    pub channel: Option<String>,
    /// Opaque event payload.
    #[serde(default)]
    pub data: Option<Box<RawValue>>,
}

impl ClientFrame {
    /// Parse a text frame.
    ///
    /// # Errors
    ///
    /// Returns an error if the text is not a JSON object with an `event`
    /// member.
    pub fn parse(text: &str) -> Result<Self, FrameError> {
        Ok(serde_json::from_str(text)?)
    }
}

/// Payload of `pusher:subscribe` / `pusher:unsubscribe`.
#[derive(Debug, Deserialize)]
pub struct SubscribeData {
    pub channel: String,
}

/// Payload of `pusher:signin`.
#[derive(Debug, Deserialize)]
pub struct SignInData {
    pub auth: String,
    pub user_data: String,
}

/// Authorization-callback response for presence channels:
/// `{auth, channel_data}` where `channel_data` is a string containing JSON.
#[derive(Debug, Default, Deserialize)]
pub struct PresenceAuthPayload {
    #[serde(default)]
    pub auth: String,
    #[serde(default)]
    pub channel_data: String,
}

/// Parsed `channel_data` of a presence authorization.
#[derive(Debug, Deserialize)]
pub struct PresenceChannelData {
    /// May be a JSON string or number; stringified by the caller.
    #[serde(default)]
    pub user_id: Option<serde_json::Value>,
    #[serde(default)]
    pub user_info: Option<Box<RawValue>>,
}

/// Outbound frame shape. Struct serialization keeps the conventional
/// `event`, `channel`, `data` member order on the wire.
#[derive(Serialize)]
struct Wire<'a, D: Serialize> {
    event: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    channel: Option<&'a str>,
    data: D,
}

fn encode<D: Serialize>(frame: &Wire<'_, D>) -> String {
    serde_json::to_string(frame).unwrap_or_default()
}

/// `pusher:connection_established` with a stringified payload.
#[must_use]
pub fn connection_established(socket_id: &str, activity_timeout: u64) -> String {
    let data = json!({
        "socket_id": socket_id,
        "activity_timeout": activity_timeout,
    })
    .to_string();
    encode(&Wire {
        event: constants::EVENT_CONNECTION_ESTABLISHED,
        channel: None,
        data,
    })
}

/// `pusher:pong`.
#[must_use]
pub fn pong() -> String {
    format!(r#"{{"event":"{}"}}"#, constants::EVENT_PONG)
}

/// `pusher:error` with an object payload `{code, message}`.
#[must_use]
pub fn error_event(code: u16, message: &str) -> String {
    #[derive(Serialize)]
    struct ErrorData<'a> {
        code: u16,
        message: &'a str,
    }
    encode(&Wire {
        event: constants::EVENT_ERROR,
        channel: None,
        data: ErrorData { code, message },
    })
}

/// `pusher:signin_success` carrying the verified `user_data` verbatim.
#[must_use]
pub fn signin_success(user_data: &str) -> String {
    #[derive(Serialize)]
    struct SigninData<'a> {
        user_data: &'a str,
    }
    encode(&Wire {
        event: constants::EVENT_SIGNIN_SUCCESS,
        channel: None,
        data: SigninData { user_data },
    })
}

/// `pusher_internal:subscription_succeeded`; `data` is already stringified
/// by the caller (`"{}"` outside presence channels).
#[must_use]
pub fn subscription_succeeded(channel: &str, data: &str) -> String {
    encode(&Wire {
        event: constants::EVENT_SUBSCRIPTION_SUCCEEDED,
        channel: Some(channel),
        data,
    })
}

/// `pusher_internal:member_added` with a stringified `{user_id, user_info}`.
#[must_use]
pub fn member_added(channel: &str, user_id: &str, user_info: &RawValue) -> String {
    let data = json!({
        "user_id": user_id,
        "user_info": user_info,
    })
    .to_string();
    encode(&Wire {
        event: constants::EVENT_MEMBER_ADDED,
        channel: Some(channel),
        data,
    })
}

/// `pusher_internal:member_removed` with a stringified `{user_id}`.
#[must_use]
pub fn member_removed(channel: &str, user_id: &str) -> String {
    let data = json!({ "user_id": user_id }).to_string();
    encode(&Wire {
        event: constants::EVENT_MEMBER_REMOVED,
        channel: Some(channel),
        data,
    })
}

/// A user event fanned out to subscribers. The opaque payload is embedded
/// as a string.
#[must_use]
pub fn broadcast(channel: &str, event: &str, data: &str) -> String {
    encode(&Wire {
        event,
        channel: Some(channel),
        data,
    })
}
