//! Message envelope carried on every Tierline event channel.

use mti::prelude::*;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

/// Encoding used for envelopes inside a frame.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum WireFormat {
    /// JSON format (human-readable, useful for debugging)
    Json,
    /// MessagePack format (binary, more efficient)
    #[default]
    Messagepack,
}

impl FromStr for WireFormat {
    type Err = String;

    /// Parse the same lowercase names the config file uses.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "messagepack" => Ok(Self::Messagepack),
            other => Err(format!("unknown wire format: {other} (expected json or messagepack)")),
        }
    }
}

/// Envelope for a single event on a channel.
///
/// The `event` name selects the payload schema; the payload itself stays an
/// untyped JSON value until the receiving node decodes it with
/// [`RelayMessage::payload_as`].
///
/// # Example
///
/// ```rust
/// use tierline_client::RelayMessage;
/// use serde_json::json;
///
/// let message = RelayMessage::new("db:stats")
///     .with_source("storage")
///     .with_payload(json!({"userCount": 2}));
/// assert_eq!(message.event(), "db:stats");
/// ```
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RelayMessage {
    /// Unique message ID (MTI format: msg_<uuid_v7>).
    pub id: String,

    /// Event name (e.g., "db:query", "users-data").
    pub event: String,

    /// Node or subscriber that emitted this message.
    pub source: String,

    /// Timestamp when message was created (Unix ms).
    pub timestamp_ms: u64,

    /// Event payload.
    pub payload: serde_json::Value,
}

impl RelayMessage {
    /// Create a new message with explicit ID and timestamp.
    #[must_use]
    pub fn new_with_id_and_timestamp(event: &str, id: String, timestamp_ms: u64) -> Self {
        Self {
            id,
            event: event.to_string(),
            source: String::new(),
            timestamp_ms,
            payload: serde_json::Value::Null,
        }
    }

    /// Create a new message for the given event.
    ///
    /// Generates a unique ID and sets the current timestamp.
    #[must_use]
    pub fn new(event: &str) -> Self {
        Self::new_with_id_and_timestamp(
            event,
            "msg".create_type_id::<V7>().to_string(),
            current_timestamp_ms(),
        )
    }

    /// Set the source of this message.
    #[must_use]
    pub fn with_source(mut self, source: &str) -> Self {
        self.source = source.to_string();
        self
    }

    /// Set the payload of this message.
    #[must_use]
    pub fn with_payload(mut self, payload: impl Serialize) -> Self {
        self.payload = serde_json::to_value(payload).unwrap_or(serde_json::Value::Null);
        self
    }

    /// Get the message ID.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Get the event name.
    #[must_use]
    pub fn event(&self) -> &str {
        &self.event
    }

    /// Get the source.
    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Get the raw payload value.
    #[must_use]
    pub fn payload(&self) -> &serde_json::Value {
        &self.payload
    }

    /// Deserialize the payload into a specific type.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload cannot be deserialized into type `T`.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.payload)
    }

    /// Encode the envelope with the given wire format.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn encode(&self, format: WireFormat) -> crate::Result<Vec<u8>> {
        match format {
            WireFormat::Json => Ok(serde_json::to_vec(self)?),
            WireFormat::Messagepack => Ok(rmp_serde::to_vec_named(self)?),
        }
    }

    /// Decode an envelope with the given wire format.
    ///
    /// # Errors
    ///
    /// Returns an error if the bytes are not a valid envelope.
    pub fn decode(bytes: &[u8], format: WireFormat) -> crate::Result<Self> {
        match format {
            WireFormat::Json => Ok(serde_json::from_slice(bytes)?),
            WireFormat::Messagepack => Ok(rmp_serde::from_slice(bytes)?),
        }
    }
}

/// Get the current timestamp in milliseconds.
fn current_timestamp_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_wire_format_from_str() {
        assert_eq!("json".parse::<WireFormat>(), Ok(WireFormat::Json));
        assert_eq!("MessagePack".parse::<WireFormat>(), Ok(WireFormat::Messagepack));
        assert!("xml".parse::<WireFormat>().is_err());
    }

    #[test]
    fn test_message_creation() {
        let msg = RelayMessage::new("db:query")
            .with_source("coordinator")
            .with_payload(json!({"queryId": 1}));

        assert!(msg.id.starts_with("msg_"));
        assert_eq!(msg.event, "db:query");
        assert_eq!(msg.source, "coordinator");
        assert!(msg.timestamp_ms > 0);
    }

    #[test]
    fn test_new_with_id_and_timestamp_is_pure() {
        let msg = RelayMessage::new_with_id_and_timestamp(
            "app:status",
            "msg_fixed".to_string(),
            1_704_067_200_000,
        );

        assert_eq!(msg.id, "msg_fixed");
        assert_eq!(msg.timestamp_ms, 1_704_067_200_000);
        assert!(msg.payload.is_null());
    }

    #[test]
    fn test_messagepack_keeps_nested_payload() -> Result<(), Box<dyn std::error::Error>> {
        let msg = RelayMessage::new("db:result").with_payload(json!({
            "queryId": 7,
            "success": true,
            "data": [{"id": 1, "name": "John Doe"}],
        }));

        let bytes = msg.encode(WireFormat::Messagepack)?;
        let decoded = RelayMessage::decode(&bytes, WireFormat::Messagepack)?;

        assert_eq!(decoded.event, "db:result");
        assert_eq!(decoded.payload["data"][0]["name"], "John Doe");
        assert_eq!(decoded.payload["queryId"], 7);
        Ok(())
    }

    #[test]
    fn test_decode_with_wrong_format_fails() -> Result<(), Box<dyn std::error::Error>> {
        let bytes = RelayMessage::new("get-users").encode(WireFormat::Messagepack)?;
        assert!(RelayMessage::decode(&bytes, WireFormat::Json).is_err());
        Ok(())
    }

    #[test]
    fn test_payload_extraction() {
        #[derive(Debug, Deserialize, PartialEq)]
        #[serde(rename_all = "camelCase")]
        struct Stats {
            user_count: u64,
        }

        let msg = RelayMessage::new("db:stats").with_payload(json!({"userCount": 3}));
        let stats: Stats = msg.payload_as().unwrap();
        assert_eq!(stats.user_count, 3);
    }
}
