//! # Device Wire Protocol
//!
//! The duplex protocol spoken with every device: JSON envelopes over a single
//! WebSocket, discriminated by a `type` field. Control events and audio share
//! the connection; audio rides inside JSON as base64-encoded compressed
//! frames.
//!
//! ## Message types handled here:
//! - **session.update**: `{type, session: {voice, instructions, allow_recording}}`
//!   - sent once, immediately after connect, before anything else
//! - **input_audio_buffer.append**: `{type, audio: <base64 frame>}` - one
//!   encoded audio chunk
//! - **response.audio.delta**: `{type, delta: <base64 frame>}` - audio going
//!   back to the device
//!
//! Everything else (text deltas, transcription deltas, lifecycle markers) is
//! opaque to this layer: outbound events from the session handler are sent
//! verbatim, unrecognized inbound types are logged and dropped.

use crate::error::{AppError, AppResult};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Path and subprotocol every device negotiates.
pub const REALTIME_PATH: &str = "/realtime";
pub const SUBPROTOCOL: &str = "realtime";

/// Transport tuning shared by the whole fleet.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const PING_INTERVAL: Duration = Duration::from_secs(20);
pub const PING_TIMEOUT: Duration = Duration::from_secs(10);
pub const CLOSE_TIMEOUT: Duration = Duration::from_secs(10);

/// Session configuration pushed to a device right after connect.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionConfig {
    pub voice: String,
    pub instructions: serde_json::Value,
    pub allow_recording: bool,
}

/// The protocol messages this layer understands.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum DeviceMessage {
    /// Session configuration (either direction; we send it once at connect)
    #[serde(rename = "session.update")]
    SessionUpdate { session: SessionConfig },

    /// One audio chunk from the device
    #[serde(rename = "input_audio_buffer.append")]
    InputAudioAppend { audio: String },

    /// One audio chunk to the device
    #[serde(rename = "response.audio.delta")]
    ResponseAudioDelta { delta: String },
}

impl DeviceMessage {
    /// Build the audio-delta message around an encoded frame.
    pub fn audio_delta(frame: &[u8]) -> Self {
        DeviceMessage::ResponseAudioDelta {
            delta: BASE64.encode(frame),
        }
    }

    /// Serialize for the wire.
    pub fn to_json(&self) -> AppResult<String> {
        serde_json::to_string(self).map_err(|e| AppError::Internal(e.to_string()))
    }

    /// Classify an already-parsed inbound JSON value.
    ///
    /// Returns `Ok(None)` for unrecognized (or missing) `type` values - those
    /// are ignored upstream, not errors. A *known* type whose fields don't
    /// match is a protocol error.
    pub fn from_value(value: &serde_json::Value) -> AppResult<Option<DeviceMessage>> {
        let known = matches!(
            value.get("type").and_then(|t| t.as_str()),
            Some("session.update" | "input_audio_buffer.append" | "response.audio.delta")
        );

        if !known {
            return Ok(None);
        }

        serde_json::from_value(value.clone())
            .map(Some)
            .map_err(|e| AppError::Protocol(format!("Malformed message: {}", e)))
    }
}

/// Decode a base64 audio payload from the wire.
pub fn decode_audio_payload(payload: &str) -> AppResult<Vec<u8>> {
    BASE64
        .decode(payload)
        .map_err(|e| AppError::Protocol(format!("Invalid base64 audio: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_update_wire_shape() {
        let msg = DeviceMessage::SessionUpdate {
            session: SessionConfig {
                voice: "Watercooler".to_string(),
                instructions: serde_json::json!({"type": "smalltalk"}),
                allow_recording: false,
            },
        };

        let json: serde_json::Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(json["type"], "session.update");
        assert_eq!(json["session"]["voice"], "Watercooler");
        assert_eq!(json["session"]["allow_recording"], false);
    }

    #[test]
    fn test_audio_delta_roundtrip() {
        let frame = vec![1u8, 2, 3, 255];
        let msg = DeviceMessage::audio_delta(&frame);

        let json: serde_json::Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(json["type"], "response.audio.delta");

        let decoded = decode_audio_payload(json["delta"].as_str().unwrap()).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn test_unknown_type_is_ignored_not_error() {
        let value = serde_json::json!({"type": "response.text.delta", "delta": "hi"});
        assert!(DeviceMessage::from_value(&value).unwrap().is_none());

        let value = serde_json::json!({"no_type": true});
        assert!(DeviceMessage::from_value(&value).unwrap().is_none());
    }

    #[test]
    fn test_known_type_with_bad_fields_is_protocol_error() {
        let value = serde_json::json!({"type": "input_audio_buffer.append"});
        assert!(matches!(
            DeviceMessage::from_value(&value),
            Err(AppError::Protocol(_))
        ));
    }

    #[test]
    fn test_inbound_audio_append_parses() {
        let value = serde_json::json!({
            "type": "input_audio_buffer.append",
            "audio": BASE64.encode([9u8, 8, 7])
        });

        match DeviceMessage::from_value(&value).unwrap() {
            Some(DeviceMessage::InputAudioAppend { audio }) => {
                assert_eq!(decode_audio_payload(&audio).unwrap(), vec![9, 8, 7]);
            }
            other => panic!("unexpected parse result: {:?}", other),
        }
    }

    #[test]
    fn test_invalid_base64_rejected() {
        assert!(matches!(
            decode_audio_payload("not-base64!!!"),
            Err(AppError::Protocol(_))
        ));
    }
}
