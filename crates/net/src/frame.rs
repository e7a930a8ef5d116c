//! JSON text frame encoding/decoding
//!
//! Wire format: one JSON object per WebSocket text message
//! `{"event": .., "ref": .., "payload": .., "status": .., "error": ..}`.
//! Maximum frame size: 1MB (sanity limit)

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};

/// Maximum allowed frame size (1MB)
const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Reply status attached by the hub to correlated responses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Success,
    Failure,
}

/// A single message on the wire
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub event: String,
    #[serde(rename = "ref", default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<Status>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Frame {
    /// A request awaiting a correlated reply
    pub fn request(event: impl Into<String>, reference: impl Into<String>, payload: Value) -> Self {
        Self {
            event: event.into(),
            reference: Some(reference.into()),
            payload,
            status: None,
            error: None,
        }
    }

    /// A frame with no reference (push or fire-and-forget)
    pub fn push(event: impl Into<String>, payload: Value) -> Self {
        Self {
            event: event.into(),
            reference: None,
            payload,
            status: None,
            error: None,
        }
    }

    /// Payload of a reply, or the hub's failure message
    ///
    /// A missing payload on success is normalized to an empty object.
    pub fn outcome(&self) -> std::result::Result<Value, String> {
        match self.status {
            Some(Status::Failure) => Err(self
                .error
                .clone()
                .unwrap_or_else(|| "unknown error".to_string())),
            _ if self.payload.is_null() => Ok(Value::Object(Map::new())),
            _ => Ok(self.payload.clone()),
        }
    }
}

/// Decode a text frame received from the transport
pub fn decode_frame(text: &str) -> Result<Frame> {
    if text.is_empty() {
        return Err(Error::Protocol("Empty frame".into()));
    }
    if text.len() > MAX_FRAME_SIZE {
        return Err(Error::Protocol(format!(
            "Frame too large: {} bytes (max {})",
            text.len(),
            MAX_FRAME_SIZE
        )));
    }

    Ok(serde_json::from_str(text)?)
}

/// Encode a frame for the transport
pub fn encode_frame(frame: &Frame) -> Result<String> {
    let text = serde_json::to_string(frame)
        .map_err(|e| Error::Protocol(format!("Serialization failed: {}", e)))?;

    if text.len() > MAX_FRAME_SIZE {
        return Err(Error::Protocol(format!(
            "Message too large: {} bytes (max {})",
            text.len(),
            MAX_FRAME_SIZE
        )));
    }

    Ok(text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_wire_shape() {
        let frame = Frame::request("channels/subscribe", "abc", json!({"channel": "secrets"}));
        let text = encode_frame(&frame).unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();

        assert_eq!(value["event"], "channels/subscribe");
        assert_eq!(value["ref"], "abc");
        assert_eq!(value["payload"]["channel"], "secrets");
        assert!(value.get("status").is_none());
    }

    #[test]
    fn test_push_without_payload() {
        let frame = decode_frame(r#"{"event":"heartbeat"}"#).unwrap();
        assert_eq!(frame.event, "heartbeat");
        assert!(frame.reference.is_none());
        assert!(frame.payload.is_null());
        assert_eq!(frame.outcome().unwrap(), json!({}));
    }

    #[test]
    fn test_failure_outcome() {
        let frame = decode_frame(
            r#"{"event":"channels/subscribe","ref":"r1","status":"failure","error":"invalid channel"}"#,
        )
        .unwrap();

        assert_eq!(frame.status, Some(Status::Failure));
        assert_eq!(frame.outcome().unwrap_err(), "invalid channel");
    }

    #[test]
    fn test_empty_frame_rejected() {
        assert!(matches!(decode_frame(""), Err(Error::Protocol(_))));
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let text = format!(r#"{{"event":"x","payload":"{}"}}"#, "a".repeat(MAX_FRAME_SIZE));
        assert!(matches!(decode_frame(&text), Err(Error::Protocol(_))));
    }

    #[test]
    fn test_missing_event_rejected() {
        assert!(matches!(
            decode_frame(r#"{"payload":{}}"#),
            Err(Error::Protocol(_))
        ));
    }
}
