//! Cross-node message type.
//!
//! A `BroadcastMessage` is what brokers carry between nodes: a target
//! channel, an event name, and an opaque JSON payload that is fanned out
//! verbatim.

use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

/// A message in flight between publishers and subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BroadcastMessage {
    /// Target channel.
    pub channel: String,
    /// Event name delivered to subscribers.
    pub event: String,
    /// Opaque JSON payload, preserved byte for byte.
    pub data: Box<RawValue>,
}

impl BroadcastMessage {
    /// Build a message from an opaque JSON payload.
    ///
    /// # Errors
    ///
    /// Returns an error if `data` is not valid JSON.
    pub fn new(
        channel: impl Into<String>,
        event: impl Into<String>,
        data: &str,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self {
            channel: channel.into(),
            event: event.into(),
            data: RawValue::from_string(data.to_owned())?,
        })
    }

    /// Encode for broker transport.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Decode from broker transport.
    ///
    /// # Errors
    ///
    /// Returns an error if the bytes are not a valid message.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_is_identity() {
        let msg = BroadcastMessage::new("orders", "created", r#"{"id":7,"total":"12.50"}"#).unwrap();
        let bytes = msg.to_bytes().unwrap();
        let back = BroadcastMessage::from_bytes(&bytes).unwrap();

        assert_eq!(back.channel, msg.channel);
        assert_eq!(back.event, msg.event);
        assert_eq!(back.data.get(), msg.data.get());
    }

    #[test]
    fn test_data_preserved_verbatim() {
        // Payload text must survive untouched, including member order.
        let payload = r#"{"z":1,"a":2}"#;
        let msg = BroadcastMessage::new("ch", "ev", payload).unwrap();
        assert_eq!(msg.data.get(), payload);

        let bytes = msg.to_bytes().unwrap();
        assert!(String::from_utf8(bytes).unwrap().contains(payload));
    }

    #[test]
    fn test_rejects_invalid_payload() {
        assert!(BroadcastMessage::new("ch", "ev", "{not json").is_err());
    }
}
