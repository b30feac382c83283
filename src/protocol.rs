//! Wire protocol.
//!
//! One websocket carries both directions. Messages are told apart by frame
//! kind: binary frames are audio, text frames are JSON control messages with
//! a `"type"` discriminator. There are no sequence numbers; ordering is
//! whatever the transport delivers.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, Message};

use crate::error::ProtocolError;
use crate::state::VoiceState;

/// Inbound control message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    Status { state: VoiceState },
    /// Barge-in: stop playback now
    ClearBuffer,
    Transcript {
        role: String,
        text: String,
        partial: bool,
    },
}

#[derive(Deserialize)]
struct StatusFields {
    state: String,
}

#[derive(Deserialize)]
struct TranscriptFields {
    role: String,
    text: String,
    #[serde(default)]
    partial: bool,
}

impl ControlMessage {
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_str(text)?;
        let msg_type = value
            .get("type")
            .and_then(|t| t.as_str())
            .ok_or(ProtocolError::MissingType)?
            .to_string();

        match msg_type.as_str() {
            "status" => {
                let fields: StatusFields = serde_json::from_value(value)?;
                Ok(ControlMessage::Status {
                    state: fields.state.parse()?,
                })
            }
            "clear_buffer" => Ok(ControlMessage::ClearBuffer),
            "transcript" => {
                let fields: TranscriptFields = serde_json::from_value(value)?;
                Ok(ControlMessage::Transcript {
                    role: fields.role,
                    text: fields.text,
                    partial: fields.partial,
                })
            }
            _ => Err(ProtocolError::UnknownType(msg_type)),
        }
    }
}

/// Outbound text message.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Typed input sent out of band
    Text { text: String },
}

impl ClientMessage {
    pub fn text(text: impl Into<String>) -> Self {
        ClientMessage::Text { text: text.into() }
    }

    pub fn to_json(&self) -> String {
        // Serializing a string-only enum cannot fail
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// An inbound websocket message after classification.
#[derive(Debug)]
pub enum Inbound {
    Audio(Bytes),
    Control(ControlMessage),
    /// Text that is not a valid control message; logged and dropped
    Malformed(ProtocolError),
    Closed(Option<CloseFrame>),
    /// Ping/Pong and raw frames, handled by the websocket layer
    Other,
}

pub fn classify(msg: Message) -> Inbound {
    match msg {
        Message::Binary(data) => Inbound::Audio(data),
        Message::Text(text) => match ControlMessage::parse(text.as_str()) {
            Ok(control) => Inbound::Control(control),
            Err(e) => Inbound::Malformed(e),
        },
        Message::Close(frame) => Inbound::Closed(frame),
        _ => Inbound::Other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_status() {
        let msg = ControlMessage::parse(r#"{"type":"status","state":"thinking"}"#).unwrap();
        assert_eq!(
            msg,
            ControlMessage::Status {
                state: VoiceState::Thinking
            }
        );
    }

    #[test]
    fn test_parse_clear_buffer() {
        assert_eq!(
            ControlMessage::parse(r#"{"type":"clear_buffer"}"#).unwrap(),
            ControlMessage::ClearBuffer
        );
    }

    #[test]
    fn test_parse_transcript() {
        let msg = ControlMessage::parse(
            r#"{"type":"transcript","role":"assistant","text":"hello","partial":true}"#,
        )
        .unwrap();
        assert_eq!(
            msg,
            ControlMessage::Transcript {
                role: "assistant".into(),
                text: "hello".into(),
                partial: true
            }
        );

        // partial defaults to false
        let msg = ControlMessage::parse(r#"{"type":"transcript","role":"user","text":"hi"}"#).unwrap();
        assert!(matches!(msg, ControlMessage::Transcript { partial: false, .. }));
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(
            ControlMessage::parse("not json"),
            Err(ProtocolError::Malformed(_))
        ));
        assert!(matches!(
            ControlMessage::parse(r#"{"state":"idle"}"#),
            Err(ProtocolError::MissingType)
        ));
        assert!(matches!(
            ControlMessage::parse(r#"{"type":"hello"}"#),
            Err(ProtocolError::UnknownType(t)) if t == "hello"
        ));
        assert!(matches!(
            ControlMessage::parse(r#"{"type":"status","state":"sleeping"}"#),
            Err(ProtocolError::UnknownState(s)) if s == "sleeping"
        ));
        assert!(matches!(
            ControlMessage::parse(r#"{"type":"status"}"#),
            Err(ProtocolError::Malformed(_))
        ));
        assert!(matches!(
            ControlMessage::parse(r#"{"type":"transcript","role":"user"}"#),
            Err(ProtocolError::Malformed(_))
        ));
    }

    #[test]
    fn test_outbound_text() {
        let json = ClientMessage::text("turn on the lights").to_json();
        let value: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["type"], "text");
        assert_eq!(value["text"], "turn on the lights");
    }

    #[test]
    fn test_classify_by_frame_kind() {
        let audio = classify(Message::Binary(Bytes::from_static(&[1, 2, 3, 4])));
        assert!(matches!(audio, Inbound::Audio(b) if b.len() == 4));

        let control = classify(Message::Text(r#"{"type":"clear_buffer"}"#.into()));
        assert!(matches!(control, Inbound::Control(ControlMessage::ClearBuffer)));

        let bad = classify(Message::Text("{".into()));
        assert!(matches!(bad, Inbound::Malformed(_)));

        assert!(matches!(classify(Message::Close(None)), Inbound::Closed(None)));
        assert!(matches!(classify(Message::Ping(Bytes::new())), Inbound::Other));
    }
}
